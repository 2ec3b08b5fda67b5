//! Bounded, unordered per-record writes with outcome accounting.

use std::fmt;
use std::future::Future;

use futures::stream::{self, StreamExt};
use serde::Serialize;
use tracing::{debug, warn};

use pageinfra_common::WriteOutcome;
use pageinfra_store::StoreResult;

use crate::error::{InfraError, Result};

/// Outcome counts of one batch of per-record writes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub attempted: usize,
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub failed: usize,
    /// Subset of `failed` where the backend could not be reached.
    #[serde(skip)]
    pub unavailable: usize,
}

impl BatchReport {
    pub fn written(&self) -> usize {
        self.inserted + self.updated
    }

    pub(crate) fn record(&mut self, key: &str, result: StoreResult<WriteOutcome>) {
        self.attempted += 1;
        match result {
            Ok(outcome) => {
                debug!(key, ?outcome, "Write outcome");
                match outcome {
                    WriteOutcome::Inserted => self.inserted += 1,
                    WriteOutcome::Updated => self.updated += 1,
                    WriteOutcome::Unchanged => self.unchanged += 1,
                    WriteOutcome::Skipped => self.skipped += 1,
                }
            }
            Err(e) => {
                warn!(key, error = %e, "Write failed");
                self.failed += 1;
                if e.is_unavailable() {
                    self.unavailable += 1;
                }
            }
        }
    }

    pub(crate) fn absorb(&mut self, other: &BatchReport) {
        self.attempted += other.attempted;
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.unavailable += other.unavailable;
    }

    /// A batch where every attempt failed because the backend was
    /// unreachable is an error; any other mix is reported as counts.
    pub(crate) fn ensure_reachable(self) -> Result<Self> {
        if self.attempted > 0 && self.unavailable == self.attempted {
            return Err(InfraError::BackendUnavailable(format!(
                "all {} writes failed",
                self.attempted
            )));
        }
        Ok(self)
    }
}

impl fmt::Display for BatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "attempted={} inserted={} updated={} unchanged={} skipped={} failed={}",
            self.attempted, self.inserted, self.updated, self.unchanged, self.skipped, self.failed
        )
    }
}

/// Run `write` for every item with at most `concurrency` in flight.
/// One item's failure never stops its siblings.
pub(crate) async fn run_writes<'a, T, F, Fut>(
    items: &'a [T],
    concurrency: usize,
    key: fn(&T) -> &str,
    write: F,
) -> BatchReport
where
    F: Fn(&'a T) -> Fut,
    Fut: Future<Output = StoreResult<WriteOutcome>>,
{
    let results: Vec<(&str, StoreResult<WriteOutcome>)> = stream::iter(items.iter().map(|item| {
        let fut = write(item);
        async move { (key(item), fut.await) }
    }))
    .buffer_unordered(concurrency.max(1))
    .collect()
    .await;

    let mut report = BatchReport::default();
    for (key, result) in results {
        report.record(key, result);
    }
    report
}
