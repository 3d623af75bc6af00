//! Append-only JSON-lines checkpoint log of per-record enrichment outcomes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};

use chrono::Utc;
use shelf_core::{CheckpointEntry, EnrichedBook, EnrichmentStatus, RecordId};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("checkpoint io at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("serializing checkpoint entry for {record_id}: {source}")]
    Encode {
        record_id: RecordId,
        #[source]
        source: serde_json::Error,
    },
}

/// Entries recovered from the log. `entries` keeps the latest entry per
/// record; `log` keeps every parsed entry in append order.
#[derive(Debug, Clone, Default)]
pub struct CheckpointSnapshot {
    pub entries: BTreeMap<RecordId, CheckpointEntry>,
    pub log: Vec<CheckpointEntry>,
    pub discarded_lines: usize,
}

impl CheckpointSnapshot {
    /// Record ids that are terminal (FOUND or MISSING) and must not be re-attempted.
    pub fn done_ids(&self) -> HashSet<RecordId> {
        self.entries.keys().cloned().collect()
    }

    pub fn count(&self, status: EnrichmentStatus) -> usize {
        self.entries.values().filter(|e| e.status == status).count()
    }

    /// Replay the log into one book per `book_key`: the first entry for a key
    /// holds it, except that a refresh entry replaces the current holder.
    pub fn replay(&self) -> Vec<EnrichedBook> {
        let mut slots: HashMap<&str, usize> = HashMap::new();
        let mut books: Vec<EnrichedBook> = Vec::new();
        for entry in &self.log {
            match slots.get(entry.book.book_key.as_str()) {
                Some(&slot) if entry.replaces => books[slot] = entry.book.clone(),
                Some(_) => {}
                None => {
                    slots.insert(entry.book.book_key.as_str(), books.len());
                    books.push(entry.book.clone());
                }
            }
        }
        books
    }
}

/// Parse checkpoint text, skipping malformed lines (typically a torn tail).
pub fn parse_checkpoint(text: &str) -> CheckpointSnapshot {
    let mut snapshot = CheckpointSnapshot::default();
    for (line_no, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<CheckpointEntry>(line) {
            Ok(entry) => {
                snapshot.entries.insert(entry.record_id.clone(), entry.clone());
                snapshot.log.push(entry);
            }
            Err(err) => {
                warn!(line = line_no + 1, error = %err, "discarding malformed checkpoint entry");
                snapshot.discarded_lines += 1;
            }
        }
    }
    snapshot
}

/// The single source of truth for "already processed". All appends are
/// serialized through one lock and fsynced before returning.
#[derive(Debug)]
pub struct CheckpointStore {
    path: PathBuf,
    file: Mutex<fs::File>,
    replacing: bool,
}

impl CheckpointStore {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let path = path.into();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).await.map_err(|source| CheckpointError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }

        repair_torn_tail(&path).await?;

        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| CheckpointError::Io {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file: Mutex::new(file),
            replacing: false,
        })
    }

    /// Mark every entry this store appends as a refresh of its `book_key`.
    pub fn replacing(mut self, replacing: bool) -> Self {
        self.replacing = replacing;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn load(&self) -> Result<CheckpointSnapshot, CheckpointError> {
        let bytes = fs::read(&self.path).await.map_err(|source| CheckpointError::Io {
            path: self.path.clone(),
            source,
        })?;
        let snapshot = parse_checkpoint(&String::from_utf8_lossy(&bytes));
        info!(
            path = %self.path.display(),
            entries = snapshot.entries.len(),
            discarded = snapshot.discarded_lines,
            "checkpoint loaded"
        );
        Ok(snapshot)
    }

    /// Append one outcome durably.
    pub async fn record(&self, book: &EnrichedBook) -> Result<CheckpointEntry, CheckpointError> {
        let mut entry = CheckpointEntry::new(book.clone(), Utc::now());
        entry.replaces = self.replacing;
        let mut line = serde_json::to_vec(&entry).map_err(|source| CheckpointError::Encode {
            record_id: entry.record_id.clone(),
            source,
        })?;
        line.push(b'\n');

        let io_err = |source: std::io::Error| CheckpointError::Io {
            path: self.path.clone(),
            source,
        };
        let mut file = self.file.lock().await;
        file.write_all(&line).await.map_err(io_err)?;
        file.flush().await.map_err(io_err)?;
        file.sync_data().await.map_err(io_err)?;
        Ok(entry)
    }
}

/// Cut a trailing partial line so the next append starts on a clean line.
async fn repair_torn_tail(path: &Path) -> Result<(), CheckpointError> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(source) => {
            return Err(CheckpointError::Io {
                path: path.to_path_buf(),
                source,
            })
        }
    };
    if bytes.is_empty() || bytes.ends_with(b"\n") {
        return Ok(());
    }

    let keep = bytes
        .iter()
        .rposition(|b| *b == b'\n')
        .map(|idx| idx + 1)
        .unwrap_or(0);
    warn!(
        path = %path.display(),
        dropped_bytes = bytes.len() - keep,
        "truncating torn checkpoint tail"
    );
    let file = fs::OpenOptions::new()
        .write(true)
        .open(path)
        .await
        .map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    file.set_len(keep as u64)
        .await
        .map_err(|source| CheckpointError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    Ok(())
}
