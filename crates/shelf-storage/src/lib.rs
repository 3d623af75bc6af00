//! Durable checkpoint/output storage + HTTP fetch utilities.

pub mod checkpoint;
pub mod http;
pub mod output;

pub use checkpoint::{parse_checkpoint, CheckpointError, CheckpointSnapshot, CheckpointStore};
pub use http::{
    BackoffPolicy, FetchError, FetchedResponse, HttpClientConfig, HttpFetcher, RateLimiter,
    RetryDisposition, TokenBucketConfig,
};
pub use output::{read_output, sha256_hex, write_atomic, DurableWriter, StoredOutput};

pub const CRATE_NAME: &str = "shelf-storage";
