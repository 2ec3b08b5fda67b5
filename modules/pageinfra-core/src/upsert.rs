//! Hash-based change detection and the idempotent primary-store upsert.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, Instrument};

use pageinfra_common::{LogContext, Sku};
use pageinfra_store::SkuStore;

use crate::batch::{run_writes, BatchReport};
use crate::error::Result;

/// Collapse repeated codes, keeping the last occurrence at the position of
/// the first.
pub fn dedupe_last_wins(records: Vec<Sku>) -> Vec<Sku> {
    let mut position: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Sku> = Vec::with_capacity(records.len());
    for sku in records {
        match position.get(&sku.code) {
            Some(&idx) => out[idx] = sku,
            None => {
                position.insert(sku.code.clone(), out.len());
                out.push(sku);
            }
        }
    }
    out
}

/// Records split by whether they differ from what is stored.
#[derive(Debug, Default)]
pub struct Detection {
    /// New codes and codes whose stored hash differs.
    pub candidates: Vec<Sku>,
    /// Records whose hash matches the stored one.
    pub unchanged: Vec<Sku>,
    /// Earlier occurrences of a code repeated in the input.
    pub duplicates: usize,
}

pub struct ChangeDetector {
    skus: Arc<dyn SkuStore>,
}

impl ChangeDetector {
    pub fn new(skus: Arc<dyn SkuStore>) -> Self {
        Self { skus }
    }

    /// One batched read of stored hashes for the batch's codes.
    pub async fn detect(&self, ctx: &LogContext, records: Vec<Sku>) -> Result<Detection> {
        async {
            let total = records.len();
            let records = dedupe_last_wins(records);
            let duplicates = total - records.len();
            if records.is_empty() {
                return Ok(Detection::default());
            }

            let codes: Vec<String> = records.iter().map(|s| s.code.clone()).collect();
            let stored = self.skus.stored_hashes(&codes).await?;

            let (candidates, unchanged): (Vec<Sku>, Vec<Sku>) =
                records.into_iter().partition(|sku| {
                    stored.get(&sku.code).map(String::as_str) != Some(sku.hash())
                });

            debug!(
                candidates = candidates.len(),
                unchanged = unchanged.len(),
                duplicates,
                "Changes detected"
            );
            Ok(Detection {
                candidates,
                unchanged,
                duplicates,
            })
        }
        .instrument(ctx.span("detect"))
        .await
    }
}

/// Outcome counts of a primary-store upsert.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UpsertReport {
    pub attempted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub failed: usize,
}

impl UpsertReport {
    pub fn accepted(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn skipped(&self) -> usize {
        self.unchanged + self.failed
    }
}

impl From<BatchReport> for UpsertReport {
    fn from(batch: BatchReport) -> Self {
        Self {
            attempted: batch.attempted,
            inserted: batch.inserted,
            updated: batch.updated,
            // A conditional write that found nothing to do.
            unchanged: batch.unchanged + batch.skipped,
            failed: batch.failed,
        }
    }
}

impl fmt::Display for UpsertReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} inserted={} updated={} unchanged={} failed={}",
            self.attempted, self.inserted, self.updated, self.unchanged, self.failed
        )
    }
}

pub struct UpsertEngine {
    skus: Arc<dyn SkuStore>,
    concurrency: usize,
}

impl UpsertEngine {
    pub fn new(skus: Arc<dyn SkuStore>, concurrency: usize) -> Self {
        Self {
            skus,
            concurrency: concurrency.max(1),
        }
    }

    /// One conditional write per record, unordered and concurrent. A record
    /// whose stored hash already matches (including a lost race) is
    /// `unchanged`; a failed record never aborts its siblings.
    pub async fn upsert(&self, ctx: &LogContext, records: &[Sku]) -> Result<UpsertReport> {
        async {
            let start = Instant::now();
            let skus = self.skus.as_ref();

            let batch = run_writes(records, self.concurrency, |s| s.code.as_str(), |sku| {
                skus.upsert_if_changed(sku)
            })
            .await
            .ensure_reachable()?;
            let report = UpsertReport::from(batch);

            info!(
                quantity = records.len(),
                accepted = report.accepted(),
                skipped = report.skipped(),
                duration_ms = start.elapsed().as_millis() as u64,
                "SKUs upserted"
            );
            Ok(report)
        }
        .instrument(ctx.span("upsert"))
        .await
    }
}
