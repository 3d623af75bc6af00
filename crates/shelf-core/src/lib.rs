//! Core domain model for the catalog enrichment pipeline.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub mod identity;
pub mod normalize;

pub use identity::{dedup_key_for, identify, record_id_for};
pub use normalize::{normalize_isbn, normalize_row, normalize_year};

pub const CRATE_NAME: &str = "shelf-core";

/// Canonical input columns handed off by ingestion.
pub const OPTIONAL_COLUMNS: [&str; 5] = [
    "publisher",
    "subjects",
    "pages",
    "accession_no",
    "class_no_book_no",
];

/// One cleaned-but-not-enriched catalog row, keyed by canonical column name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RawRow {
    fields: BTreeMap<String, String>,
}

impl RawRow {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, column: &str, value: impl Into<String>) -> Self {
        self.insert(column, value);
        self
    }

    pub fn insert(&mut self, column: &str, value: impl Into<String>) {
        self.fields.insert(column.to_string(), value.into());
    }

    /// Returns the trimmed cell, treating empty cells as null.
    pub fn get(&self, column: &str) -> Option<&str> {
        self.fields
            .get(column)
            .map(|v| v.trim())
            .filter(|v| !v.is_empty())
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for RawRow {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }
}

/// Normalized catalog record. `title`/`author` are the canonical lower-cased
/// forms used for hashing and keys; the display fields keep original casing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub title: String,
    pub author: String,
    pub display_title: String,
    pub display_author: String,
    pub isbn: Option<String>,
    pub year: Option<i32>,
    pub raw_fields: BTreeMap<String, String>,
}

impl NormalizedRecord {
    /// Number of populated optional fields, used to rank duplicate group members.
    pub fn populated_optional_fields(&self) -> usize {
        usize::from(self.year.is_some()) + self.raw_fields.len()
    }

    pub fn raw(&self, column: &str) -> Option<&str> {
        self.raw_fields.get(column).map(String::as_str)
    }
}

/// 128-bit content hash, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordId(String);

impl RecordId {
    pub fn from_hex(hex: impl Into<String>) -> Self {
        Self(hex.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub record_id: RecordId,
    pub dedup_key: String,
}

/// Survivor of a deduplication group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeduplicatedRecord {
    pub record: NormalizedRecord,
    pub identity: Identity,
    /// Members of the group that were dropped in favour of this one.
    pub duplicates_removed: usize,
}

impl DeduplicatedRecord {
    pub fn record_id(&self) -> &RecordId {
        &self.identity.record_id
    }

    pub fn book_key(&self) -> &str {
        &self.identity.dedup_key
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EnrichmentStatus {
    Found,
    Missing,
}

impl EnrichmentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Found => "FOUND",
            Self::Missing => "MISSING",
        }
    }
}

/// Result of one lookup for one deduplicated record. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichmentOutcome {
    pub record_id: RecordId,
    pub status: EnrichmentStatus,
    pub authors: Vec<String>,
    pub publisher: Option<String>,
    pub year: Option<i32>,
    pub subjects: Vec<String>,
    pub summary: Option<String>,
}

impl EnrichmentOutcome {
    pub fn missing(record_id: RecordId) -> Self {
        Self {
            record_id,
            status: EnrichmentStatus::Missing,
            authors: Vec::new(),
            publisher: None,
            year: None,
            subjects: Vec::new(),
            summary: None,
        }
    }
}

/// Output record handed to the storage layer; `book_key` is unique.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnrichedBook {
    pub record_id: RecordId,
    pub book_key: String,
    pub status: EnrichmentStatus,
    pub title: String,
    pub isbn: Option<String>,
    pub year: Option<String>,
    pub authors: Vec<String>,
    pub subjects: Vec<String>,
    pub summary: Option<String>,
    pub publisher: Option<String>,
    #[serde(default)]
    pub accession_no: Option<String>,
    #[serde(default)]
    pub class_no_book_no: Option<String>,
    #[serde(default)]
    pub pages: Option<String>,
}

impl EnrichedBook {
    /// Merge an outcome over the local record, falling back to catalog values
    /// wherever the external source had nothing.
    pub fn merge(record: &DeduplicatedRecord, outcome: &EnrichmentOutcome) -> Self {
        let local = &record.record;
        let authors = if outcome.authors.is_empty() && !local.display_author.is_empty() {
            vec![local.display_author.clone()]
        } else {
            outcome.authors.clone()
        };
        let raw = |column: &str| local.raw(column).map(str::to_string);

        Self {
            record_id: outcome.record_id.clone(),
            book_key: record.book_key().to_string(),
            status: outcome.status,
            title: local.display_title.clone(),
            isbn: local.isbn.clone(),
            year: outcome.year.or(local.year).map(|y| y.to_string()),
            authors,
            subjects: outcome.subjects.clone(),
            summary: outcome.summary.clone(),
            publisher: outcome.publisher.clone().or_else(|| raw("publisher")),
            accession_no: raw("accession_no"),
            class_no_book_no: raw("class_no_book_no"),
            pages: raw("pages"),
        }
    }
}

/// One line of the append-only checkpoint log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub record_id: RecordId,
    pub status: EnrichmentStatus,
    pub timestamp: DateTime<Utc>,
    pub book: EnrichedBook,
    /// Written by a forced refresh: replaces whatever `book_key` already held.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub replaces: bool,
}

impl CheckpointEntry {
    pub fn new(book: EnrichedBook, timestamp: DateTime<Utc>) -> Self {
        Self {
            record_id: book.record_id.clone(),
            status: book.status,
            timestamp,
            book,
            replaces: false,
        }
    }
}
