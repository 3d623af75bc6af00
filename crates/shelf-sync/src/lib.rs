//! Enrichment pipeline orchestration: read, normalize, deduplicate, enrich, persist, report.

use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use shelf_adapters::{
    FixtureSource, GoogleBooksSource, KohaOpacSource, MetadataClient, MetadataSource, RetryPolicy,
    GOOGLE_BOOKS_API,
};
use shelf_core::{normalize_row, DeduplicatedRecord, EnrichmentStatus, RawRow};
use shelf_storage::{
    BackoffPolicy, CheckpointStore, DurableWriter, HttpClientConfig, HttpFetcher, TokenBucketConfig,
};
use tokio::fs;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

pub mod dedup;
pub mod scheduler;
pub mod snapshot;
pub mod store;

pub use dedup::{identify_all, DedupConfig, DedupReport, Deduplicator, ReviewCandidate};
pub use scheduler::{EnrichmentScheduler, RecordState, SchedulerConfig, SchedulerReport, MAX_WORKERS};
pub use snapshot::{export_feature_snapshot, SnapshotManifest};
pub use store::{load_into_sink, BookSink, MemoryBookSink, PgBookStore};

pub const CRATE_NAME: &str = "shelf-sync";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SourceKind {
    GoogleBooks,
    KohaOpac,
    Fixtures,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::GoogleBooks => "google-books",
            Self::KohaOpac => "koha-opac",
            Self::Fixtures => "fixtures",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "google-books" | "google_books" | "google" => Ok(Self::GoogleBooks),
            "koha-opac" | "koha_opac" | "koha" | "opac" => Ok(Self::KohaOpac),
            "fixtures" | "fixture" => Ok(Self::Fixtures),
            other => bail!("unknown metadata source `{other}`"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub input_csv: PathBuf,
    pub output_json: PathBuf,
    pub checkpoint_path: PathBuf,
    pub reports_dir: PathBuf,
    pub workers: usize,
    pub http_timeout_secs: u64,
    pub max_attempts: usize,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub save_every: usize,
    pub log_every: usize,
    pub force_refresh: bool,
    pub source: SourceKind,
    pub google_books_url: String,
    pub opac_base_url: Option<String>,
    pub fixtures_dir: PathBuf,
    pub user_agent: String,
    pub rate_limit_per_sec: Option<u32>,
    pub database_url: Option<String>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            input_csv: PathBuf::from("data/clean_data/clean_books.csv"),
            output_json: PathBuf::from("data/enriched_data/enriched_books.json"),
            checkpoint_path: PathBuf::from("data/enriched_data/checkpoint.jsonl"),
            reports_dir: PathBuf::from("reports"),
            workers: 5,
            http_timeout_secs: 4,
            max_attempts: 3,
            backoff_base_ms: 250,
            backoff_max_ms: 5_000,
            save_every: 10,
            log_every: 100,
            force_refresh: false,
            source: SourceKind::GoogleBooks,
            google_books_url: GOOGLE_BOOKS_API.to_string(),
            opac_base_url: None,
            fixtures_dir: PathBuf::from("fixtures/google-books"),
            user_agent: "BookRecommendationSystem/1.0".to_string(),
            rate_limit_per_sec: None,
            database_url: None,
        }
    }
}

impl PipelineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unset or blank variables keep their defaults; unparseable numbers do too.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let num = |key: &str| var(key).and_then(|v| v.trim().parse::<u64>().ok());
        let mut config = Self::default();

        if let Some(v) = var("SHELF_INPUT_CSV") {
            config.input_csv = v.into();
        }
        if let Some(v) = var("SHELF_OUTPUT_JSON") {
            config.output_json = v.into();
        }
        if let Some(v) = var("SHELF_CHECKPOINT_PATH") {
            config.checkpoint_path = v.into();
        }
        if let Some(v) = var("SHELF_REPORTS_DIR") {
            config.reports_dir = v.into();
        }
        if let Some(v) = num("SHELF_WORKERS") {
            config.workers = v as usize;
        }
        if let Some(v) = num("SHELF_HTTP_TIMEOUT_SECS") {
            config.http_timeout_secs = v;
        }
        if let Some(v) = num("SHELF_MAX_ATTEMPTS") {
            config.max_attempts = v as usize;
        }
        if let Some(v) = num("SHELF_BACKOFF_BASE_MS") {
            config.backoff_base_ms = v;
        }
        if let Some(v) = num("SHELF_BACKOFF_MAX_MS") {
            config.backoff_max_ms = v;
        }
        if let Some(v) = num("SHELF_SAVE_EVERY") {
            config.save_every = v as usize;
        }
        if let Some(v) = num("SHELF_LOG_EVERY") {
            config.log_every = v as usize;
        }
        if let Some(v) = var("SHELF_FORCE_REFRESH") {
            config.force_refresh = matches!(v.trim(), "1" | "true" | "TRUE" | "True");
        }
        if let Some(v) = var("SHELF_METADATA_SOURCE") {
            config.source = v.parse().context("parsing SHELF_METADATA_SOURCE")?;
        }
        if let Some(v) = var("SHELF_GOOGLE_BOOKS_URL") {
            config.google_books_url = v;
        }
        config.opac_base_url = var("SHELF_OPAC_BASE_URL").or(config.opac_base_url);
        if let Some(v) = var("SHELF_FIXTURES_DIR") {
            config.fixtures_dir = v.into();
        }
        if let Some(v) = var("SHELF_USER_AGENT") {
            config.user_agent = v;
        }
        config.rate_limit_per_sec = num("SHELF_RATE_LIMIT_PER_SEC").map(|v| v as u32);
        config.database_url = var("DATABASE_URL");

        Ok(config.clamped())
    }

    /// Apply a YAML config file on top of the current values.
    pub fn overlay(mut self, file: ConfigFile) -> Self {
        macro_rules! take {
            ($($field:ident),* $(,)?) => {
                $(if let Some(v) = file.$field {
                    self.$field = v;
                })*
            };
        }
        take!(
            input_csv,
            output_json,
            checkpoint_path,
            reports_dir,
            workers,
            http_timeout_secs,
            max_attempts,
            backoff_base_ms,
            backoff_max_ms,
            save_every,
            log_every,
            force_refresh,
            source,
            google_books_url,
            fixtures_dir,
            user_agent,
        );
        if file.opac_base_url.is_some() {
            self.opac_base_url = file.opac_base_url;
        }
        if file.rate_limit_per_sec.is_some() {
            self.rate_limit_per_sec = file.rate_limit_per_sec;
        }
        if file.database_url.is_some() {
            self.database_url = file.database_url;
        }
        self.clamped()
    }

    pub fn clamped(mut self) -> Self {
        self.workers = self.workers.clamp(1, MAX_WORKERS);
        self.max_attempts = self.max_attempts.max(1);
        self.save_every = self.save_every.max(1);
        self.log_every = self.log_every.max(1);
        self
    }

    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs.max(1))
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            attempt_timeout: self.attempt_timeout(),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(self.backoff_base_ms),
                max_delay: Duration::from_millis(self.backoff_max_ms.max(self.backoff_base_ms)),
            },
            ..RetryPolicy::default()
        }
    }

    pub fn http_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: self.attempt_timeout(),
            user_agent: Some(self.user_agent.clone()),
            global_concurrency: self.workers,
            token_bucket: self.rate_limit_per_sec.map(TokenBucketConfig::per_second),
        }
    }

    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            workers: self.workers,
            log_every: self.log_every,
        }
    }
}

/// Optional `shelf.yaml`; every key mirrors a `PipelineConfig` field.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigFile {
    pub input_csv: Option<PathBuf>,
    pub output_json: Option<PathBuf>,
    pub checkpoint_path: Option<PathBuf>,
    pub reports_dir: Option<PathBuf>,
    pub workers: Option<usize>,
    pub http_timeout_secs: Option<u64>,
    pub max_attempts: Option<usize>,
    pub backoff_base_ms: Option<u64>,
    pub backoff_max_ms: Option<u64>,
    pub save_every: Option<usize>,
    pub log_every: Option<usize>,
    pub force_refresh: Option<bool>,
    pub source: Option<SourceKind>,
    pub google_books_url: Option<String>,
    pub opac_base_url: Option<String>,
    pub fixtures_dir: Option<PathBuf>,
    pub user_agent: Option<String>,
    pub rate_limit_per_sec: Option<u32>,
    pub database_url: Option<String>,
}

impl ConfigFile {
    pub fn parse(text: &str) -> Result<Self> {
        serde_yaml::from_str(text).context("parsing pipeline config yaml")
    }

    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        Self::parse(&text).with_context(|| format!("loading {}", path.display()))
    }
}

pub fn build_source(config: &PipelineConfig) -> Result<Arc<dyn MetadataSource>> {
    let source: Arc<dyn MetadataSource> = match config.source {
        SourceKind::Fixtures => Arc::new(FixtureSource::new(config.fixtures_dir.clone())),
        SourceKind::GoogleBooks => {
            let http = Arc::new(HttpFetcher::new(config.http_config())?);
            Arc::new(GoogleBooksSource::new(http, config.google_books_url.clone()))
        }
        SourceKind::KohaOpac => {
            let Some(base_url) = config.opac_base_url.clone() else {
                bail!("koha-opac source requires SHELF_OPAC_BASE_URL");
            };
            let http = Arc::new(HttpFetcher::new(config.http_config())?);
            Arc::new(KohaOpacSource::new(http, base_url))
        }
    };
    Ok(source)
}

/// Read the cleaned CSV handed off by ingestion. Headers are trimmed and lower-cased.
pub fn read_clean_rows(path: &Path) -> Result<Vec<RawRow>> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .from_path(path)
        .with_context(|| format!("opening {}", path.display()))?;
    let headers = reader
        .byte_headers()
        .with_context(|| format!("reading header row of {}", path.display()))?
        .iter()
        .map(|h| String::from_utf8_lossy(h).trim().to_ascii_lowercase())
        .collect::<Vec<_>>();

    let mut rows = Vec::new();
    for (index, record) in reader.byte_records().enumerate() {
        let record =
            record.with_context(|| format!("reading row {} of {}", index + 1, path.display()))?;
        rows.push(
            headers
                .iter()
                .zip(record.iter())
                .map(|(h, v)| (h.clone(), String::from_utf8_lossy(v).into_owned()))
                .collect::<RawRow>(),
        );
    }
    Ok(rows)
}

#[derive(Debug, Clone)]
pub struct PreparedRecords {
    pub survivors: Vec<DeduplicatedRecord>,
    pub report: DedupReport,
    pub input_rows: usize,
    pub dropped_rows: usize,
}

/// Normalize, identify and deduplicate. Rows without a usable title are dropped.
pub fn prepare(rows: &[RawRow], config: DedupConfig) -> PreparedRecords {
    let normalized = rows.iter().filter_map(normalize_row).collect::<Vec<_>>();
    let dropped_rows = rows.len() - normalized.len();
    if dropped_rows > 0 {
        warn!(dropped_rows, "rows without a title were dropped");
    }
    let (survivors, report) = Deduplicator::new(config).apply(identify_all(normalized));
    PreparedRecords {
        survivors,
        report,
        input_rows: rows.len(),
        dropped_rows,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub source: String,
    pub force_refresh: bool,
    pub input_rows: usize,
    pub dropped_rows: usize,
    pub survivors: usize,
    pub duplicates_removed: usize,
    pub skipped_done: usize,
    pub processed: usize,
    pub found: usize,
    pub missing: usize,
    pub output_records: usize,
    pub output_path: String,
    pub output_sha256: String,
    pub reports_dir: String,
    pub parquet_manifest: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DedupRunSummary {
    pub run_id: Uuid,
    pub input_rows: usize,
    pub dropped_rows: usize,
    pub survivors: usize,
    pub duplicates_removed: usize,
    pub review_candidates: usize,
    pub report_path: String,
}

pub struct EnrichmentPipeline {
    config: PipelineConfig,
    source: Arc<dyn MetadataSource>,
}

impl EnrichmentPipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let source = build_source(&config)?;
        Ok(Self { config, source })
    }

    pub fn with_source(config: PipelineConfig, source: Arc<dyn MetadataSource>) -> Self {
        Self { config, source }
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let run_id = Uuid::new_v4();
        let span = info_span!("enrichment_run", %run_id, source = self.source.name());
        self.run_inner(run_id).instrument(span).await
    }

    async fn run_inner(&self, run_id: Uuid) -> Result<RunSummary> {
        let started_at = Utc::now();
        let config = &self.config;

        let rows = read_clean_rows(&config.input_csv)?;
        let prepared = prepare(&rows, DedupConfig::default());
        info!(
            input_rows = prepared.input_rows,
            survivors = prepared.report.survivors,
            duplicates_removed = prepared.report.duplicates_removed,
            "deduplication finished"
        );

        let checkpoint = Arc::new(
            CheckpointStore::open(&config.checkpoint_path)
                .await
                .with_context(|| format!("opening checkpoint {}", config.checkpoint_path.display()))?
                .replacing(config.force_refresh),
        );
        let loaded = checkpoint.load().await.context("loading checkpoint")?;
        if loaded.discarded_lines > 0 {
            warn!(discarded = loaded.discarded_lines, "checkpoint contained malformed lines");
        }
        let already_done: HashSet<_> = if config.force_refresh {
            info!(ignored = loaded.entries.len(), "forced refresh; ignoring checkpoint");
            HashSet::new()
        } else {
            loaded.done_ids()
        };

        let writer = Arc::new(
            DurableWriter::new(&config.output_json, config.save_every)
                .replacing(config.force_refresh),
        );
        writer.seed(&loaded.replay()).await;

        let client = MetadataClient::new(self.source.clone(), config.retry_policy());
        let scheduler = EnrichmentScheduler::new(client, checkpoint, config.scheduler_config())
            .with_writer(writer.clone());
        let outcome_report = scheduler.run(prepared.survivors.clone(), &already_done).await?;

        let stored = writer.flush().await?;
        let books = writer.snapshot().await;
        let finished_at = Utc::now();

        let reports_dir = config.reports_dir.join(run_id.to_string());
        let snapshot_dir = reports_dir.join("snapshots");
        export_feature_snapshot(&snapshot_dir, &books)?;

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at,
            source: self.source.name().to_string(),
            force_refresh: config.force_refresh,
            input_rows: prepared.input_rows,
            dropped_rows: prepared.dropped_rows,
            survivors: prepared.report.survivors,
            duplicates_removed: prepared.report.duplicates_removed,
            skipped_done: outcome_report.skipped_done,
            processed: outcome_report.outcomes.len(),
            found: outcome_report.count(EnrichmentStatus::Found),
            missing: outcome_report.count(EnrichmentStatus::Missing),
            output_records: stored.records,
            output_path: stored.path.display().to_string(),
            output_sha256: stored.sha256.clone(),
            reports_dir: reports_dir.display().to_string(),
            parquet_manifest: snapshot_dir.join("manifest.json").display().to_string(),
        };
        write_reports(&reports_dir, &summary, &prepared.report).await?;
        info!(
            processed = summary.processed,
            found = summary.found,
            missing = summary.missing,
            output_records = summary.output_records,
            "run finished"
        );
        Ok(summary)
    }
}

/// Normalize and deduplicate only; writes `dedup_report.json`, touches no network.
pub async fn dedup_only(config: &PipelineConfig) -> Result<DedupRunSummary> {
    let run_id = Uuid::new_v4();
    let rows = read_clean_rows(&config.input_csv)?;
    let prepared = prepare(&rows, DedupConfig::default());

    let reports_dir = config.reports_dir.join(run_id.to_string());
    fs::create_dir_all(&reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;
    let report_path = reports_dir.join("dedup_report.json");
    let json = serde_json::to_vec_pretty(&prepared.report).context("serializing dedup report")?;
    fs::write(&report_path, json)
        .await
        .with_context(|| format!("writing {}", report_path.display()))?;

    Ok(DedupRunSummary {
        run_id,
        input_rows: prepared.input_rows,
        dropped_rows: prepared.dropped_rows,
        survivors: prepared.report.survivors,
        duplicates_removed: prepared.report.duplicates_removed,
        review_candidates: prepared.report.review_candidates.len(),
        report_path: report_path.display().to_string(),
    })
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    let config = PipelineConfig::from_env()?;
    EnrichmentPipeline::new(config)?.run_once().await
}

async fn write_reports(reports_dir: &Path, summary: &RunSummary, dedup: &DedupReport) -> Result<()> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join("run_summary.json"), summary_json)
        .await
        .context("writing run_summary.json")?;

    let dedup_json = serde_json::to_vec_pretty(dedup).context("serializing dedup report")?;
    fs::write(reports_dir.join("dedup_report.json"), dedup_json)
        .await
        .context("writing dedup_report.json")?;

    fs::write(reports_dir.join("run_brief.md"), render_brief(summary, dedup))
        .await
        .context("writing run_brief.md")?;
    Ok(())
}

fn render_brief(summary: &RunSummary, dedup: &DedupReport) -> String {
    let mut largest_groups = dedup.groups.iter().collect::<Vec<_>>();
    largest_groups.sort_by(|a, b| b.removed.cmp(&a.removed).then(a.dedup_key.cmp(&b.dedup_key)));
    let mut status_counts = BTreeMap::new();
    status_counts.insert("FOUND", summary.found);
    status_counts.insert("MISSING", summary.missing);

    format!(
        "# Enrichment Run Brief\n\n- Run ID: `{}`\n- Source: {}\n- Started: {}\n- Finished: {}\n- Forced refresh: {}\n\n## Input\n- Rows read: {}\n- Rows dropped (no title): {}\n- Unique records: {}\n- Duplicates removed: {}\n- Review candidates: {}\n\n## Enrichment\n- Already processed: {}\n- Processed this run: {}\n{}\n\n## Output\n- Records: {}\n- Path: `{}`\n- sha256: `{}`\n\n## Largest Duplicate Groups\n{}\n",
        summary.run_id,
        summary.source,
        summary.started_at,
        summary.finished_at,
        summary.force_refresh,
        summary.input_rows,
        summary.dropped_rows,
        summary.survivors,
        summary.duplicates_removed,
        dedup.review_candidates.len(),
        summary.skipped_done,
        summary.processed,
        status_counts
            .iter()
            .map(|(k, v)| format!("- {k}: {v}"))
            .collect::<Vec<_>>()
            .join("\n"),
        summary.output_records,
        summary.output_path,
        summary.output_sha256,
        largest_groups
            .iter()
            .take(10)
            .map(|g| format!("- `{}`: {} removed", g.dedup_key, g.removed))
            .collect::<Vec<_>>()
            .join("\n"),
    )
}
