//! Relational sink for enriched books.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use async_trait::async_trait;
use shelf_core::EnrichedBook;
use shelf_storage::read_output;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Mutex;
use tracing::info;

/// Destination that accepts each `book_key` at most once.
#[async_trait]
pub trait BookSink: Send + Sync {
    /// Returns the number of rows actually inserted.
    async fn insert_if_absent(&self, books: &[EnrichedBook]) -> Result<u64>;
}

pub struct PgBookStore {
    pool: PgPool,
}

impl PgBookStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .context("connecting to postgres")?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("running migrations")?;
        info!("database migrations applied");
        Ok(())
    }
}

#[async_trait]
impl BookSink for PgBookStore {
    async fn insert_if_absent(&self, books: &[EnrichedBook]) -> Result<u64> {
        let mut tx = self.pool.begin().await.context("opening transaction")?;
        let mut inserted = 0u64;
        for book in books {
            let result = sqlx::query(
                r#"
                INSERT INTO books (
                    record_id, book_key, status, title, isbn, year, authors, subjects,
                    summary, publisher, accession_no, class_no_book_no, pages
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
                ON CONFLICT (book_key) DO NOTHING
                "#,
            )
            .bind(book.record_id.as_str())
            .bind(&book.book_key)
            .bind(book.status.as_str())
            .bind(&book.title)
            .bind(&book.isbn)
            .bind(&book.year)
            .bind(&book.authors)
            .bind(&book.subjects)
            .bind(&book.summary)
            .bind(&book.publisher)
            .bind(&book.accession_no)
            .bind(&book.class_no_book_no)
            .bind(&book.pages)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("inserting book {}", book.book_key))?;
            inserted += result.rows_affected();
        }
        tx.commit().await.context("committing book inserts")?;
        info!(inserted, offered = books.len(), "loaded enriched books");
        Ok(inserted)
    }
}

/// Read the materialized output file and hand every record to `sink`.
pub async fn load_into_sink(output_path: &Path, sink: &dyn BookSink) -> Result<u64> {
    let books = read_output(output_path).await?;
    if books.is_empty() {
        info!(path = %output_path.display(), "no enriched books to load");
        return Ok(0);
    }
    sink.insert_if_absent(&books).await
}

/// Keyed in-memory sink, used by tests and dry runs.
#[derive(Default)]
pub struct MemoryBookSink {
    rows: Mutex<BTreeMap<String, EnrichedBook>>,
}

impl MemoryBookSink {
    pub async fn len(&self) -> usize {
        self.rows.lock().await.len()
    }

    pub async fn get(&self, book_key: &str) -> Option<EnrichedBook> {
        self.rows.lock().await.get(book_key).cloned()
    }
}

#[async_trait]
impl BookSink for MemoryBookSink {
    async fn insert_if_absent(&self, books: &[EnrichedBook]) -> Result<u64> {
        let mut rows = self.rows.lock().await;
        let mut inserted = 0;
        for book in books {
            if !rows.contains_key(&book.book_key) {
                rows.insert(book.book_key.clone(), book.clone());
                inserted += 1;
            }
        }
        Ok(inserted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use shelf_core::{EnrichmentStatus, RecordId};

    fn book(key: &str, title: &str) -> EnrichedBook {
        EnrichedBook {
            record_id: RecordId::from_hex(key),
            book_key: key.into(),
            status: EnrichmentStatus::Missing,
            title: title.into(),
            isbn: None,
            year: None,
            authors: vec![],
            subjects: vec![],
            summary: None,
            publisher: None,
            accession_no: None,
            class_no_book_no: None,
            pages: None,
        }
    }

    #[tokio::test]
    async fn memory_sink_keeps_first_copy_of_each_key() {
        let sink = MemoryBookSink::default();
        let first = sink
            .insert_if_absent(&[book("k1", "First"), book("k2", "Other")])
            .await
            .expect("insert");
        let second = sink
            .insert_if_absent(&[book("k1", "Replacement"), book("k3", "New")])
            .await
            .expect("insert");

        assert_eq!(first, 2);
        assert_eq!(second, 1);
        assert_eq!(sink.len().await, 3);
        assert_eq!(sink.get("k1").await.map(|b| b.title), Some("First".to_string()));
    }

    #[tokio::test]
    async fn load_reads_output_file_into_sink() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("enriched.json");
        let json = serde_json::to_vec(&vec![book("k1", "One"), book("k2", "Two")]).expect("json");
        std::fs::write(&path, json).expect("write");

        let sink = MemoryBookSink::default();
        assert_eq!(load_into_sink(&path, &sink).await.expect("load"), 2);
        assert_eq!(load_into_sink(&path, &sink).await.expect("reload"), 0);
        assert_eq!(
            load_into_sink(&dir.path().join("absent.json"), &sink)
                .await
                .expect("absent"),
            0
        );
    }
}
