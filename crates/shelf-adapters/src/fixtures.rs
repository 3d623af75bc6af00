//! Offline source backed by captured Google Books responses on disk.

use std::path::PathBuf;

use async_trait::async_trait;

use crate::google_books::parse_volumes_response;
use crate::{LookupQuery, MetadataSource, SourceError, VolumeMetadata};

#[derive(Debug, Clone)]
pub struct FixtureSource {
    root: PathBuf,
}

impl FixtureSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// `isbn-<isbn>.json` or `title-<slug of title and author>.json`.
    pub fn fixture_name(query: &LookupQuery) -> String {
        match query {
            LookupQuery::Isbn(isbn) => format!("isbn-{}.json", isbn.to_ascii_lowercase()),
            LookupQuery::TitleAuthor { title, author } => {
                format!("title-{}.json", slug(&format!("{title} {author}")))
            }
        }
    }
}

fn slug(input: &str) -> String {
    input
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("-")
}

#[async_trait]
impl MetadataSource for FixtureSource {
    fn name(&self) -> &'static str {
        "fixtures"
    }

    async fn search(&self, query: &LookupQuery) -> Result<Option<VolumeMetadata>, SourceError> {
        let path = self.root.join(Self::fixture_name(query));
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(parse_volumes_response(&bytes)),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}
