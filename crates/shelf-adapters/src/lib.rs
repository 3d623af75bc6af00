//! External metadata source contracts and the retrying Metadata Client.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shelf_core::{DeduplicatedRecord, EnrichmentOutcome, EnrichmentStatus, RecordId};
use shelf_storage::{BackoffPolicy, FetchError, RetryDisposition};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub mod fixtures;
pub mod google_books;
pub mod koha_opac;

pub use fixtures::FixtureSource;
pub use google_books::{parse_volumes_response, GoogleBooksSource, GOOGLE_BOOKS_API};
pub use koha_opac::KohaOpacSource;

pub const CRATE_NAME: &str = "shelf-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LookupQuery {
    Isbn(String),
    TitleAuthor { title: String, author: String },
}

impl LookupQuery {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Isbn(_) => "isbn",
            Self::TitleAuthor { .. } => "title_author",
        }
    }
}

/// Search strategy for one record: ISBN first when present, then title+author.
pub fn queries_for(record: &DeduplicatedRecord) -> Vec<LookupQuery> {
    let local = &record.record;
    let mut queries = Vec::with_capacity(2);
    if let Some(isbn) = &local.isbn {
        queries.push(LookupQuery::Isbn(isbn.clone()));
    }
    queries.push(LookupQuery::TitleAuthor {
        title: local.display_title.clone(),
        author: local.display_author.clone(),
    });
    queries
}

/// Metadata located by a source. Absent or malformed fields are `None`/empty.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMetadata {
    pub title: Option<String>,
    pub isbn: Option<String>,
    pub authors: Vec<String>,
    pub publisher: Option<String>,
    pub year: Option<i32>,
    pub subjects: Vec<String>,
    pub summary: Option<String>,
}

impl VolumeMetadata {
    pub fn into_outcome(self, record_id: RecordId) -> EnrichmentOutcome {
        EnrichmentOutcome {
            record_id,
            status: EnrichmentStatus::Found,
            authors: self.authors,
            publisher: self.publisher,
            year: self.year,
            subjects: self.subjects,
            summary: self.summary,
        }
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("attempt timed out after {0:?}")]
    Timeout(Duration),
    #[error("fixture io: {0}")]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Message(String),
}

impl SourceError {
    /// Timeouts and transient network/server failures.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Fetch(err) => err.disposition() == RetryDisposition::Retryable,
            Self::Timeout(_) => true,
            Self::Io(_) | Self::Message(_) => false,
        }
    }
}

#[async_trait]
pub trait MetadataSource: Send + Sync {
    fn name(&self) -> &'static str;

    /// Deadline the source applies to each network call itself, after any
    /// local rate-limit wait. `None` makes the client time the whole attempt.
    fn call_deadline(&self) -> Option<Duration> {
        None
    }

    /// One attempt. `Ok(None)` is a definitive non-match.
    async fn search(&self, query: &LookupQuery) -> Result<Option<VolumeMetadata>, SourceError>;
}

/// Declared retry policy for metadata lookups.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: usize,
    pub attempt_timeout: Duration,
    pub backoff: BackoffPolicy,
    pub retryable: fn(&SourceError) -> bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            attempt_timeout: Duration::from_secs(4),
            backoff: BackoffPolicy::default(),
            retryable: SourceError::is_transient,
        }
    }
}

#[derive(Clone)]
pub struct MetadataClient {
    source: Arc<dyn MetadataSource>,
    policy: RetryPolicy,
}

impl MetadataClient {
    pub fn new(source: Arc<dyn MetadataSource>, policy: RetryPolicy) -> Self {
        Self { source, policy }
    }

    pub fn source_name(&self) -> &'static str {
        self.source.name()
    }

    /// Never fails: exhausted retries and non-matches both end as MISSING.
    pub async fn lookup(&self, record: &DeduplicatedRecord) -> EnrichmentOutcome {
        let record_id = record.record_id().clone();
        let span = info_span!(
            "lookup",
            record_id = %record_id,
            book_key = record.book_key(),
            source = self.source.name()
        );

        async move {
            for query in queries_for(record) {
                if let Some(volume) = self.query_with_retry(&query).await {
                    debug!(query = query.kind(), "metadata found");
                    return volume.into_outcome(record_id);
                }
            }
            debug!("no metadata found");
            EnrichmentOutcome::missing(record_id)
        }
        .instrument(span)
        .await
    }

    async fn query_with_retry(&self, query: &LookupQuery) -> Option<VolumeMetadata> {
        let attempts = self.policy.max_attempts.max(1);
        for attempt in 0..attempts {
            let result = match self.source.call_deadline() {
                Some(_) => self.source.search(query).await,
                None => tokio::time::timeout(self.policy.attempt_timeout, self.source.search(query))
                    .await
                    .unwrap_or(Err(SourceError::Timeout(self.policy.attempt_timeout))),
            };

            match result {
                Ok(found) => return found,
                Err(err) if (self.policy.retryable)(&err) && attempt + 1 < attempts => {
                    let delay = self.policy.backoff.delay_for_attempt(attempt);
                    warn!(query = query.kind(), attempt = attempt + 1, error = %err, ?delay, "retrying lookup");
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    warn!(query = query.kind(), attempt = attempt + 1, error = %err, "lookup abandoned");
                    return None;
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use shelf_core::{identify, normalize_row, RawRow};

    type Scripted = Result<Option<VolumeMetadata>, SourceError>;

    struct ScriptedSource {
        script: Mutex<VecDeque<Scripted>>,
        seen: Mutex<Vec<LookupQuery>>,
        delay: Duration,
        own_deadline: Option<Duration>,
    }

    impl ScriptedSource {
        fn new(script: Vec<Scripted>) -> Self {
            Self {
                script: Mutex::new(script.into()),
                seen: Mutex::new(Vec::new()),
                delay: Duration::ZERO,
                own_deadline: None,
            }
        }

        fn seen(&self) -> Vec<LookupQuery> {
            self.seen.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl MetadataSource for ScriptedSource {
        fn name(&self) -> &'static str {
            "scripted"
        }

        fn call_deadline(&self) -> Option<Duration> {
            self.own_deadline
        }

        async fn search(&self, query: &LookupQuery) -> Result<Option<VolumeMetadata>, SourceError> {
            self.seen.lock().unwrap().push(query.clone());
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().unwrap().pop_front();
            next.unwrap_or(Ok(None))
        }
    }

    fn record(isbn: &str) -> DeduplicatedRecord {
        let record = normalize_row(
            &RawRow::new()
                .with("title", "Compilers")
                .with("author", "Aho")
                .with("isbn", isbn),
        )
        .unwrap();
        let identity = identify(&record);
        DeduplicatedRecord {
            record,
            identity,
            duplicates_removed: 0,
        }
    }

    fn fast_policy() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            attempt_timeout: Duration::from_millis(200),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
            },
            ..RetryPolicy::default()
        }
    }

    fn volume(publisher: &str) -> VolumeMetadata {
        VolumeMetadata {
            publisher: Some(publisher.into()),
            authors: vec!["Alfred Aho".into()],
            ..VolumeMetadata::default()
        }
    }

    #[tokio::test]
    async fn isbn_hit_skips_title_search() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(Some(volume("AW")))]));
        let client = MetadataClient::new(source.clone(), fast_policy());

        let outcome = client.lookup(&record("0306406152")).await;

        assert_eq!(outcome.status, EnrichmentStatus::Found);
        assert_eq!(outcome.publisher.as_deref(), Some("AW"));
        assert_eq!(source.seen(), vec![LookupQuery::Isbn("0306406152".into())]);
    }

    #[tokio::test]
    async fn isbn_miss_falls_back_to_title_author() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(None), Ok(Some(volume("AW")))]));
        let client = MetadataClient::new(source.clone(), fast_policy());

        let outcome = client.lookup(&record("0306406152")).await;

        assert_eq!(outcome.status, EnrichmentStatus::Found);
        let seen = source.seen();
        assert_eq!(seen.len(), 2);
        assert_eq!(
            seen[1],
            LookupQuery::TitleAuthor {
                title: "Compilers".into(),
                author: "Aho".into()
            }
        );
    }

    #[tokio::test]
    async fn no_isbn_goes_straight_to_title_author() {
        let source = Arc::new(ScriptedSource::new(vec![Ok(None)]));
        let client = MetadataClient::new(source.clone(), fast_policy());

        let outcome = client.lookup(&record("")).await;

        assert_eq!(outcome.status, EnrichmentStatus::Missing);
        assert_eq!(source.seen().len(), 1);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_then_succeed() {
        let source = Arc::new(ScriptedSource::new(vec![
            Err(SourceError::Timeout(Duration::from_millis(1))),
            Err(SourceError::Timeout(Duration::from_millis(1))),
            Ok(Some(volume("AW"))),
        ]));
        let client = MetadataClient::new(source.clone(), fast_policy());

        let outcome = client.lookup(&record("0306406152")).await;

        assert_eq!(outcome.status, EnrichmentStatus::Found);
        assert_eq!(source.seen().len(), 3);
    }

    #[tokio::test]
    async fn exhausted_retries_downgrade_to_next_strategy_then_missing() {
        let source = Arc::new(ScriptedSource::new(
            (0..6)
                .map(|_| Err(SourceError::Timeout(Duration::from_millis(1))))
                .collect(),
        ));
        let client = MetadataClient::new(source.clone(), fast_policy());

        let outcome = client.lookup(&record("0306406152")).await;

        assert_eq!(outcome.status, EnrichmentStatus::Missing);
        let seen = source.seen();
        assert_eq!(seen.len(), 6);
        assert!(seen[..3].iter().all(|q| q.kind() == "isbn"));
        assert!(seen[3..].iter().all(|q| q.kind() == "title_author"));
    }

    #[tokio::test]
    async fn permanent_errors_are_not_retried() {
        let source = Arc::new(ScriptedSource::new(vec![Err(SourceError::Message(
            "bad request".into(),
        ))]));
        let client = MetadataClient::new(source.clone(), fast_policy());

        let outcome = client.lookup(&record("")).await;

        assert_eq!(outcome.status, EnrichmentStatus::Missing);
        assert_eq!(source.seen().len(), 1);
    }

    #[tokio::test]
    async fn slow_attempts_hit_the_hard_timeout() {
        let mut scripted = ScriptedSource::new(vec![Ok(Some(volume("late")))]);
        scripted.delay = Duration::from_millis(500);
        let source = Arc::new(scripted);
        let policy = RetryPolicy {
            max_attempts: 2,
            attempt_timeout: Duration::from_millis(20),
            ..fast_policy()
        };
        let client = MetadataClient::new(source.clone(), policy);

        let outcome = client.lookup(&record("")).await;

        assert_eq!(outcome.status, EnrichmentStatus::Missing);
        assert_eq!(source.seen().len(), 2);
    }

    #[tokio::test]
    async fn local_waits_do_not_count_against_self_timed_sources() {
        // The delay stands in for a rate-limit wait that precedes the timed call.
        let mut scripted = ScriptedSource::new(vec![Ok(Some(volume("patient")))]);
        scripted.delay = Duration::from_millis(100);
        scripted.own_deadline = Some(Duration::from_millis(20));
        let source = Arc::new(scripted);
        let policy = RetryPolicy {
            max_attempts: 1,
            attempt_timeout: Duration::from_millis(20),
            ..fast_policy()
        };
        let client = MetadataClient::new(source.clone(), policy);

        let outcome = client.lookup(&record("")).await;

        assert_eq!(outcome.status, EnrichmentStatus::Found);
        assert_eq!(outcome.publisher.as_deref(), Some("patient"));
        assert_eq!(source.seen().len(), 1);
    }
}
