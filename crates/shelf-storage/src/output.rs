//! Atomic materialization of the enriched record set.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use sha2::{Digest, Sha256};
use shelf_core::EnrichedBook;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct StoredOutput {
    pub path: PathBuf,
    pub byte_size: usize,
    pub sha256: String,
    pub records: usize,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a temp file in the same directory and a rename,
/// so readers only ever observe the old or the new content.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    let parent = match path.parent().filter(|p| !p.as_os_str().is_empty()) {
        Some(parent) => parent.to_path_buf(),
        None => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)
        .await
        .with_context(|| format!("creating output directory {}", parent.display()))?;

    let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp output file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp output file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp output file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp output file {}", temp_path.display()))?;
    drop(file);

    if let Err(err) = fs::rename(&temp_path, path).await {
        let _ = fs::remove_file(&temp_path).await;
        return Err(err).with_context(|| {
            format!(
                "atomically renaming temp output {} -> {}",
                temp_path.display(),
                path.display()
            )
        });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct WriterState {
    books: BTreeMap<String, EnrichedBook>,
    unflushed: usize,
}

/// Holds the enriched set keyed by `book_key` and periodically rewrites the
/// output JSON array atomically.
#[derive(Debug)]
pub struct DurableWriter {
    path: PathBuf,
    save_every: usize,
    replace_existing: bool,
    state: Mutex<WriterState>,
}

impl DurableWriter {
    pub fn new(path: impl Into<PathBuf>, save_every: usize) -> Self {
        Self {
            path: path.into(),
            save_every: save_every.max(1),
            replace_existing: false,
            state: Mutex::new(WriterState::default()),
        }
    }

    /// Let fresh records replace earlier ones with the same `book_key` (forced refresh).
    pub fn replacing(mut self, replace_existing: bool) -> Self {
        self.replace_existing = replace_existing;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Preload previously durable records without triggering a flush.
    pub async fn seed<'a>(&self, books: impl IntoIterator<Item = &'a EnrichedBook>) {
        let mut state = self.state.lock().await;
        for book in books {
            state
                .books
                .entry(book.book_key.clone())
                .or_insert_with(|| book.clone());
        }
    }

    /// Insert-if-absent on `book_key` (or replace in refresh mode). Returns
    /// whether the record was taken.
    pub async fn push(&self, book: EnrichedBook) -> anyhow::Result<bool> {
        let mut state = self.state.lock().await;
        let taken = if self.replace_existing || !state.books.contains_key(&book.book_key) {
            state.books.insert(book.book_key.clone(), book);
            state.unflushed += 1;
            true
        } else {
            debug!(book_key = %book.book_key, "book_key already materialized; ignoring");
            false
        };

        if state.unflushed >= self.save_every {
            self.flush_locked(&mut state).await?;
        }
        Ok(taken)
    }

    pub async fn flush(&self) -> anyhow::Result<StoredOutput> {
        let mut state = self.state.lock().await;
        self.flush_locked(&mut state).await
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.books.len()
    }

    pub async fn snapshot(&self) -> Vec<EnrichedBook> {
        self.state.lock().await.books.values().cloned().collect()
    }

    async fn flush_locked(&self, state: &mut WriterState) -> anyhow::Result<StoredOutput> {
        let books = state.books.values().collect::<Vec<_>>();
        let bytes = serde_json::to_vec_pretty(&books).context("serializing enriched records")?;
        write_atomic(&self.path, &bytes).await?;
        state.unflushed = 0;
        info!(path = %self.path.display(), records = books.len(), "saved enriched records");
        Ok(StoredOutput {
            path: self.path.clone(),
            byte_size: bytes.len(),
            sha256: sha256_hex(&bytes),
            records: books.len(),
        })
    }
}

/// Read a previously written output file; a missing file is an empty set.
pub async fn read_output(path: &Path) -> anyhow::Result<Vec<EnrichedBook>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
}
