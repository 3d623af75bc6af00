//! Google Books volumes API source.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use shelf_core::normalize::non_empty_text;
use shelf_storage::HttpFetcher;
use tracing::debug;

use crate::{LookupQuery, MetadataSource, SourceError, VolumeMetadata};

pub const GOOGLE_BOOKS_API: &str = "https://www.googleapis.com/books/v1/volumes";

#[derive(Debug, Clone)]
pub struct GoogleBooksSource {
    http: Arc<HttpFetcher>,
    endpoint: String,
}

impl GoogleBooksSource {
    pub fn new(http: Arc<HttpFetcher>, endpoint: impl Into<String>) -> Self {
        Self {
            http,
            endpoint: endpoint.into(),
        }
    }

    pub fn search_term(query: &LookupQuery) -> String {
        match query {
            LookupQuery::Isbn(isbn) => format!("isbn:{isbn}"),
            LookupQuery::TitleAuthor { title, author } if author.is_empty() => title.clone(),
            LookupQuery::TitleAuthor { title, author } => format!("{title} inauthor:{author}"),
        }
    }
}

#[async_trait]
impl MetadataSource for GoogleBooksSource {
    fn name(&self) -> &'static str {
        "google-books"
    }

    fn call_deadline(&self) -> Option<Duration> {
        Some(self.http.call_timeout())
    }

    async fn search(&self, query: &LookupQuery) -> Result<Option<VolumeMetadata>, SourceError> {
        let term = Self::search_term(query);
        let response = self.http.get(&self.endpoint, &[("q", term.as_str())]).await?;
        Ok(parse_volumes_response(&response.body))
    }
}

/// Parse a volumes response. Non-JSON bodies and responses without a
/// non-empty `items` array are non-matches.
pub fn parse_volumes_response(body: &[u8]) -> Option<VolumeMetadata> {
    let value: JsonValue = match serde_json::from_slice(body) {
        Ok(value) => value,
        Err(err) => {
            debug!(error = %err, "volumes response is not json");
            return None;
        }
    };
    let info = value
        .get("items")?
        .as_array()?
        .first()?
        .get("volumeInfo")?;
    Some(extract_volume_info(info))
}

pub fn extract_volume_info(info: &JsonValue) -> VolumeMetadata {
    VolumeMetadata {
        title: json_text(info, "title"),
        isbn: industry_isbn(info),
        authors: json_text_vec(info, "authors"),
        publisher: json_text(info, "publisher"),
        year: json_str(info, "publishedDate").and_then(first_four_digit_year),
        subjects: json_text_vec(info, "categories"),
        summary: json_text(info, "description"),
    }
}

/// First run of exactly four ASCII digits.
pub fn first_four_digit_year(text: &str) -> Option<i32> {
    let bytes = text.as_bytes();
    let mut start = 0;
    while start < bytes.len() {
        if !bytes[start].is_ascii_digit() {
            start += 1;
            continue;
        }
        let end = bytes[start..]
            .iter()
            .position(|b| !b.is_ascii_digit())
            .map(|len| start + len)
            .unwrap_or(bytes.len());
        if end - start == 4 {
            return text[start..end].parse().ok();
        }
        start = end;
    }
    None
}

fn json_str<'a>(value: &'a JsonValue, key: &str) -> Option<&'a str> {
    value.get(key)?.as_str()
}

fn json_text(value: &JsonValue, key: &str) -> Option<String> {
    json_str(value, key).and_then(non_empty_text)
}

fn json_text_vec(value: &JsonValue, key: &str) -> Vec<String> {
    value
        .get(key)
        .and_then(JsonValue::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(JsonValue::as_str)
                .filter_map(non_empty_text)
                .collect()
        })
        .unwrap_or_default()
}

fn industry_isbn(info: &JsonValue) -> Option<String> {
    let identifiers = info.get("industryIdentifiers")?.as_array()?;
    ["ISBN_13", "ISBN_10"].iter().find_map(|kind| {
        identifiers
            .iter()
            .find(|id| json_str(id, "type") == Some(*kind))
            .and_then(|id| json_text(id, "identifier"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn fixture(name: &str) -> Vec<u8> {
        let path = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("../../fixtures/google-books")
            .join(name);
        std::fs::read(&path).unwrap_or_else(|e| panic!("reading {}: {e}", path.display()))
    }

    #[test]
    fn parses_full_volume_fixture() {
        let volume = parse_volumes_response(&fixture("isbn-0306406152.json")).expect("volume");

        assert_eq!(volume.title.as_deref(), Some("Foo"));
        assert_eq!(volume.isbn.as_deref(), Some("9780306406157"));
        assert_eq!(volume.authors, vec!["Ada Bar".to_string(), "Grace Baz".to_string()]);
        assert_eq!(volume.publisher.as_deref(), Some("Plenum Press"));
        assert_eq!(volume.year, Some(1985));
        assert_eq!(volume.subjects, vec!["Science".to_string()]);
        assert_eq!(
            volume.summary.as_deref(),
            Some("A reference volume used by catalog tests.")
        );
    }

    #[test]
    fn missing_items_is_no_match() {
        assert!(parse_volumes_response(br#"{"kind":"books#volumes","totalItems":0}"#).is_none());
        assert!(parse_volumes_response(br#"{"items":[]}"#).is_none());
        assert!(parse_volumes_response(br#"{"items":"nope"}"#).is_none());
        assert!(parse_volumes_response(b"<html>rate limited</html>").is_none());
    }

    #[test]
    fn malformed_fields_are_treated_as_absent() {
        let body = br#"{"items":[{"volumeInfo":{
            "authors":"Not A List",
            "publisher":42,
            "publishedDate":"unknown",
            "categories":["Fiction", 7, "  "],
            "description":"  spaced   out  "
        }}]}"#;
        let volume = parse_volumes_response(body).expect("volume");

        assert!(volume.authors.is_empty());
        assert_eq!(volume.publisher, None);
        assert_eq!(volume.year, None);
        assert_eq!(volume.subjects, vec!["Fiction".to_string()]);
        assert_eq!(volume.summary.as_deref(), Some("spaced out"));
    }

    #[test]
    fn year_is_first_four_digit_run() {
        assert_eq!(first_four_digit_year("2004-05-01"), Some(2004));
        assert_eq!(first_four_digit_year("c. 1999"), Some(1999));
        assert_eq!(first_four_digit_year("12345 then 1987"), Some(1987));
        assert_eq!(first_four_digit_year("May 98"), None);
    }

    #[test]
    fn search_terms_follow_query_kind() {
        assert_eq!(
            GoogleBooksSource::search_term(&LookupQuery::Isbn("0306406152".into())),
            "isbn:0306406152"
        );
        assert_eq!(
            GoogleBooksSource::search_term(&LookupQuery::TitleAuthor {
                title: "Foo".into(),
                author: "Bar".into()
            }),
            "Foo inauthor:Bar"
        );
        assert_eq!(
            GoogleBooksSource::search_term(&LookupQuery::TitleAuthor {
                title: "Foo".into(),
                author: String::new()
            }),
            "Foo"
        );
    }
}
