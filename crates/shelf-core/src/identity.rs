//! Deterministic record identity and dedup key derivation.

use sha2::{Digest, Sha256};

use crate::{Identity, NormalizedRecord, RecordId};

const FIELD_SEPARATOR: u8 = 0x1f;

/// First 128 bits of SHA-256 over the canonical `(title, author, isbn)` tuple.
pub fn record_id_for(title: &str, author: &str, isbn: Option<&str>) -> RecordId {
    let mut hasher = Sha256::new();
    hasher.update(title.as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(author.as_bytes());
    hasher.update([FIELD_SEPARATOR]);
    hasher.update(isbn.unwrap_or_default().as_bytes());
    let digest = hasher.finalize();
    RecordId::from_hex(hex::encode(&digest[..16]))
}

/// ISBN when present, else `title|author` on canonical fields.
pub fn dedup_key_for(record: &NormalizedRecord) -> String {
    match &record.isbn {
        Some(isbn) => isbn.clone(),
        None => format!("{}|{}", record.title, record.author),
    }
}

pub fn identify(record: &NormalizedRecord) -> Identity {
    Identity {
        record_id: record_id_for(&record.title, &record.author, record.isbn.as_deref()),
        dedup_key: dedup_key_for(record),
    }
}
