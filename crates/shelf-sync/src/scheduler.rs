//! Bounded worker pool driving metadata lookups and checkpoint appends.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use shelf_adapters::MetadataClient;
use shelf_core::{DeduplicatedRecord, EnrichedBook, EnrichmentOutcome, EnrichmentStatus, RecordId};
use shelf_storage::{CheckpointStore, DurableWriter};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info};

pub const MAX_WORKERS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    Pending,
    InFlight,
    Found,
    Missing,
}

impl RecordState {
    pub fn can_advance_to(self, next: RecordState) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InFlight)
                | (Self::InFlight, Self::Found)
                | (Self::InFlight, Self::Missing)
        )
    }

    fn terminal(status: EnrichmentStatus) -> Self {
        match status {
            EnrichmentStatus::Found => Self::Found,
            EnrichmentStatus::Missing => Self::Missing,
        }
    }
}

/// In-flight/done bookkeeping shared by the workers.
#[derive(Debug, Default)]
struct Ledger {
    states: HashMap<RecordId, RecordState>,
}

impl Ledger {
    fn advance(&mut self, record_id: &RecordId, next: RecordState) -> Result<()> {
        let Some(state) = self.states.get_mut(record_id) else {
            bail!("record {record_id} was never scheduled");
        };
        if !state.can_advance_to(next) {
            bail!("record {record_id} cannot move from {state:?} to {next:?}");
        }
        *state = next;
        Ok(())
    }

    fn in_flight(&self) -> usize {
        self.states
            .values()
            .filter(|s| **s == RecordState::InFlight)
            .count()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SchedulerConfig {
    pub workers: usize,
    pub log_every: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 5,
            log_every: 100,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SchedulerReport {
    pub outcomes: Vec<EnrichmentOutcome>,
    pub skipped_done: usize,
}

impl SchedulerReport {
    pub fn count(&self, status: EnrichmentStatus) -> usize {
        self.outcomes.iter().filter(|o| o.status == status).count()
    }
}

pub struct EnrichmentScheduler {
    client: MetadataClient,
    checkpoint: Arc<CheckpointStore>,
    writer: Option<Arc<DurableWriter>>,
    config: SchedulerConfig,
}

struct WorkerShared {
    client: MetadataClient,
    checkpoint: Arc<CheckpointStore>,
    writer: Option<Arc<DurableWriter>>,
    queue: Mutex<mpsc::Receiver<DeduplicatedRecord>>,
    ledger: Mutex<Ledger>,
    completed: AtomicUsize,
    total: usize,
    log_every: usize,
}

impl EnrichmentScheduler {
    pub fn new(client: MetadataClient, checkpoint: Arc<CheckpointStore>, config: SchedulerConfig) -> Self {
        Self {
            client,
            checkpoint,
            writer: None,
            config,
        }
    }

    pub fn with_writer(mut self, writer: Arc<DurableWriter>) -> Self {
        self.writer = Some(writer);
        self
    }

    pub fn workers(&self) -> usize {
        self.config.workers.clamp(1, MAX_WORKERS)
    }

    /// Enrich every record not in `already_done`. Each record_id is looked up
    /// and checkpointed exactly once; outcomes come back in completion order.
    pub async fn run(
        &self,
        records: Vec<DeduplicatedRecord>,
        already_done: &HashSet<RecordId>,
    ) -> Result<SchedulerReport> {
        let mut ledger = Ledger::default();
        let mut pending = Vec::with_capacity(records.len());
        let mut skipped_done = 0usize;
        for record in records {
            if already_done.contains(record.record_id()) {
                skipped_done += 1;
                continue;
            }
            if ledger.states.contains_key(record.record_id()) {
                debug!(record_id = %record.record_id(), "record scheduled twice; ignoring repeat");
                continue;
            }
            ledger
                .states
                .insert(record.record_id().clone(), RecordState::Pending);
            pending.push(record);
        }

        let total = pending.len();
        let workers = self.workers().min(total.max(1));
        info!(
            remaining = total,
            already_processed = skipped_done,
            workers,
            source = self.client.source_name(),
            "enrichment started"
        );

        let (tx, rx) = mpsc::channel(workers * 4);
        let shared = Arc::new(WorkerShared {
            client: self.client.clone(),
            checkpoint: self.checkpoint.clone(),
            writer: self.writer.clone(),
            queue: Mutex::new(rx),
            ledger: Mutex::new(ledger),
            completed: AtomicUsize::new(0),
            total,
            log_every: self.config.log_every.max(1),
        });

        let producer = tokio::spawn(async move {
            for record in pending {
                if tx.send(record).await.is_err() {
                    break;
                }
            }
        });

        let mut join_set = JoinSet::new();
        for worker_id in 0..workers {
            let shared = shared.clone();
            join_set.spawn(async move { run_worker(worker_id, &shared).await });
        }

        let mut outcomes = Vec::with_capacity(total);
        while let Some(joined) = join_set.join_next().await {
            match joined.context("enrichment worker panicked or was cancelled") {
                Ok(Ok(mut batch)) => outcomes.append(&mut batch),
                Ok(Err(err)) | Err(err) => {
                    join_set.abort_all();
                    producer.abort();
                    return Err(err);
                }
            }
        }
        producer.await.context("enrichment producer task failed")?;

        let in_flight = shared.ledger.lock().await.in_flight();
        if in_flight > 0 {
            bail!("{in_flight} records left in flight after workers finished");
        }

        let report = SchedulerReport {
            outcomes,
            skipped_done,
        };
        info!(
            processed = report.outcomes.len(),
            found = report.count(EnrichmentStatus::Found),
            missing = report.count(EnrichmentStatus::Missing),
            "enrichment finished"
        );
        Ok(report)
    }
}

async fn run_worker(worker_id: usize, shared: &WorkerShared) -> Result<Vec<EnrichmentOutcome>> {
    let mut outcomes = Vec::new();
    loop {
        let next = shared.queue.lock().await.recv().await;
        let Some(record) = next else {
            break;
        };
        let record_id = record.record_id().clone();

        shared
            .ledger
            .lock()
            .await
            .advance(&record_id, RecordState::InFlight)?;

        let outcome = shared.client.lookup(&record).await;
        let book = EnrichedBook::merge(&record, &outcome);

        // Durable before the worker takes its next item.
        shared
            .checkpoint
            .record(&book)
            .await
            .with_context(|| format!("checkpointing {record_id}"))?;
        shared
            .ledger
            .lock()
            .await
            .advance(&record_id, RecordState::terminal(outcome.status))?;

        if let Some(writer) = &shared.writer {
            writer.push(book).await?;
        }

        let done = shared.completed.fetch_add(1, Ordering::SeqCst) + 1;
        if done % shared.log_every == 0 || done == shared.total {
            let title: String = record.record.display_title.chars().take(50).collect();
            info!(
                worker_id,
                done,
                total = shared.total,
                status = outcome.status.as_str(),
                %title,
                "enrichment progress"
            );
        }
        outcomes.push(outcome);
    }
    Ok(outcomes)
}
