//! Blocking group-by-key deduplication with deterministic survivor selection.

use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use shelf_core::{identify, DeduplicatedRecord, Identity, NormalizedRecord, RecordId};
use strsim::jaro_winkler;

#[derive(Debug, Clone, Copy)]
pub struct DedupConfig {
    /// Title similarity at or above which distinct keys by the same author are
    /// flagged for manual review. Review never merges records.
    pub review_threshold: f64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            review_threshold: 0.93,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DedupGroupReport {
    pub dedup_key: String,
    pub survivor_record_id: RecordId,
    pub removed: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReviewCandidate {
    pub book_key_a: String,
    pub book_key_b: String,
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DedupReport {
    pub input_records: usize,
    pub survivors: usize,
    pub duplicates_removed: usize,
    pub groups: Vec<DedupGroupReport>,
    pub review_candidates: Vec<ReviewCandidate>,
}

pub fn identify_all(records: Vec<NormalizedRecord>) -> Vec<(NormalizedRecord, Identity)> {
    records
        .into_iter()
        .map(|record| {
            let identity = identify(&record);
            (record, identity)
        })
        .collect()
}

/// Ordering where `Less` means "better survivor".
fn survivor_order(a: &(NormalizedRecord, Identity), b: &(NormalizedRecord, Identity)) -> Ordering {
    b.0.isbn
        .is_some()
        .cmp(&a.0.isbn.is_some())
        .then_with(|| {
            b.0.populated_optional_fields()
                .cmp(&a.0.populated_optional_fields())
        })
        .then_with(|| a.1.record_id.cmp(&b.1.record_id))
}

pub struct Deduplicator {
    config: DedupConfig,
}

impl Deduplicator {
    pub fn new(config: DedupConfig) -> Self {
        Self { config }
    }

    /// Consume the whole input, emit one survivor per dedup key, ordered by key.
    pub fn apply(
        &self,
        records: Vec<(NormalizedRecord, Identity)>,
    ) -> (Vec<DeduplicatedRecord>, DedupReport) {
        let input_records = records.len();
        let mut groups: BTreeMap<String, Vec<(NormalizedRecord, Identity)>> = BTreeMap::new();
        for (record, identity) in records {
            groups
                .entry(identity.dedup_key.clone())
                .or_default()
                .push((record, identity));
        }

        let mut survivors = Vec::with_capacity(groups.len());
        let mut report = DedupReport {
            input_records,
            ..DedupReport::default()
        };

        for (dedup_key, mut members) in groups {
            members.sort_by(survivor_order);
            let removed = members.len() - 1;
            let Some((record, identity)) = members.into_iter().next() else {
                continue;
            };
            if removed > 0 {
                report.groups.push(DedupGroupReport {
                    dedup_key,
                    survivor_record_id: identity.record_id.clone(),
                    removed,
                });
            }
            report.duplicates_removed += removed;
            survivors.push(DeduplicatedRecord {
                record,
                identity,
                duplicates_removed: removed,
            });
        }

        report.survivors = survivors.len();
        report.review_candidates = self.review_candidates(&survivors);
        (survivors, report)
    }

    /// Same-author survivors whose titles are near-identical but keyed apart
    /// (typically one copy with an ISBN and one without).
    pub fn review_candidates(&self, survivors: &[DeduplicatedRecord]) -> Vec<ReviewCandidate> {
        let mut by_author: BTreeMap<&str, Vec<&DeduplicatedRecord>> = BTreeMap::new();
        for survivor in survivors {
            if !survivor.record.author.is_empty() {
                by_author
                    .entry(survivor.record.author.as_str())
                    .or_default()
                    .push(survivor);
            }
        }

        let mut seen = BTreeSet::new();
        let mut candidates = Vec::new();
        for block in by_author.values() {
            for (i, a) in block.iter().enumerate() {
                for b in &block[i + 1..] {
                    if a.book_key() == b.book_key() {
                        continue;
                    }
                    let score = jaro_winkler(&a.record.title, &b.record.title);
                    if score < self.config.review_threshold {
                        continue;
                    }
                    let (key_a, key_b) = if a.book_key() <= b.book_key() {
                        (a.book_key(), b.book_key())
                    } else {
                        (b.book_key(), a.book_key())
                    };
                    if seen.insert((key_a.to_string(), key_b.to_string())) {
                        candidates.push(ReviewCandidate {
                            book_key_a: key_a.to_string(),
                            book_key_b: key_b.to_string(),
                            score,
                        });
                    }
                }
            }
        }
        candidates.sort_by(|x, y| {
            (&x.book_key_a, &x.book_key_b).cmp(&(&y.book_key_a, &y.book_key_b))
        });
        candidates
    }
}
