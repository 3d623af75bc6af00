//! Flattened feature snapshot of the enriched set (parquet + manifest).

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use shelf_core::EnrichedBook;
use shelf_storage::sha256_hex;

pub const FEATURE_COLUMNS: [&str; 9] = [
    "record_id",
    "book_key",
    "status",
    "title",
    "authors",
    "subjects",
    "publisher",
    "class_no_book_no",
    "pages",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
    pub rows: usize,
}

fn string_column<'a>(books: &'a [EnrichedBook], f: impl Fn(&'a EnrichedBook) -> Option<String>) -> StringArray {
    StringArray::from(books.iter().map(f).collect::<Vec<_>>())
}

fn joined(values: &[String]) -> Option<String> {
    (!values.is_empty()).then(|| values.join(", "))
}

pub fn write_features_parquet(path: &Path, books: &[EnrichedBook]) -> Result<()> {
    let schema = Arc::new(Schema::new(
        FEATURE_COLUMNS
            .iter()
            .map(|name| {
                let nullable = !matches!(*name, "record_id" | "book_key" | "status" | "title");
                ArrowField::new(*name, DataType::Utf8, nullable)
            })
            .collect::<Vec<_>>(),
    ));

    let columns = vec![
        string_column(books, |b| Some(b.record_id.to_string())),
        string_column(books, |b| Some(b.book_key.clone())),
        string_column(books, |b| Some(b.status.as_str().to_string())),
        string_column(books, |b| Some(b.title.clone())),
        string_column(books, |b| joined(&b.authors)),
        string_column(books, |b| joined(&b.subjects)),
        string_column(books, |b| b.publisher.clone()),
        string_column(books, |b| b.class_no_book_no.clone()),
        string_column(books, |b| b.pages.clone()),
    ];
    let batch = RecordBatch::try_new(
        schema,
        columns
            .into_iter()
            .map(|c| Arc::new(c) as arrow_array::ArrayRef)
            .collect(),
    )
    .context("building features record batch")?;

    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

/// Write `books_features.parquet` and `manifest.json` under `snapshot_dir`.
pub fn export_feature_snapshot(snapshot_dir: &Path, books: &[EnrichedBook]) -> Result<SnapshotManifest> {
    std::fs::create_dir_all(snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let features_path = snapshot_dir.join("books_features.parquet");
    write_features_parquet(&features_path, books)?;

    let bytes = std::fs::read(&features_path)
        .with_context(|| format!("reading {}", features_path.display()))?;
    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![SnapshotManifestFile {
            name: "books_features".to_string(),
            path: "books_features.parquet".to_string(),
            sha256: sha256_hex(&bytes),
            bytes: bytes.len() as u64,
            rows: books.len(),
        }],
    };

    let manifest_path = snapshot_dir.join("manifest.json");
    let json = serde_json::to_vec_pretty(&manifest).context("serializing snapshot manifest")?;
    std::fs::write(&manifest_path, json)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use parquet::file::reader::{FileReader, SerializedFileReader};
    use shelf_core::{EnrichmentStatus, RecordId};
    use tempfile::tempdir;

    fn book(key: &str) -> EnrichedBook {
        EnrichedBook {
            record_id: RecordId::from_hex(format!("id-{key}")),
            book_key: key.into(),
            status: EnrichmentStatus::Found,
            title: "Title".into(),
            isbn: None,
            year: Some("1999".into()),
            authors: vec!["A".into(), "B".into()],
            subjects: vec![],
            summary: None,
            publisher: Some("P".into()),
            accession_no: None,
            class_no_book_no: Some("005.1 KNU".into()),
            pages: None,
        }
    }

    #[test]
    fn snapshot_writes_parquet_and_manifest() {
        let dir = tempdir().expect("tempdir");
        let manifest =
            export_feature_snapshot(dir.path(), &[book("a"), book("b")]).expect("export");

        assert_eq!(manifest.files.len(), 1);
        assert_eq!(manifest.files[0].rows, 2);
        assert_eq!(manifest.files[0].sha256.len(), 64);
        assert!(dir.path().join("manifest.json").exists());

        let file = File::open(dir.path().join("books_features.parquet")).expect("open");
        let reader = SerializedFileReader::new(file).expect("reader");
        let meta = reader.metadata();
        assert_eq!(meta.file_metadata().num_rows(), 2);
        assert_eq!(
            meta.file_metadata().schema_descr().num_columns(),
            FEATURE_COLUMNS.len()
        );
    }

    #[test]
    fn list_fields_are_comma_joined() {
        assert_eq!(joined(&["A".into(), "B".into()]).as_deref(), Some("A, B"));
        assert_eq!(joined(&[]), None);
    }
}
