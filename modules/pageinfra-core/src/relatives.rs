//! Relative merging: keep codes that reference each other as one
//! equivalence class across the marketplace dataset.
//!
//! Each record is merged single-hop: its own stored relatives and those of
//! one existing declared relative are folded into the union. Classes that
//! span several batches converge as later batches touch their members.
//! Writes are additive set unions per document, so overlapping merges
//! running concurrently do not lose each other's codes.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::time::Instant;

use serde::Serialize;
use tracing::{debug, info, warn, Instrument};

use pageinfra_common::{LogContext, Sku};
use pageinfra_store::SkuStore;

use crate::batch::{run_writes, BatchReport};
use crate::error::{InfraError, Result};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MergeReport {
    /// Records carrying relatives that were merged.
    pub merged: usize,
    /// Member documents whose relatives grew.
    pub updated: usize,
    /// Member documents that already listed the whole class.
    pub unchanged: usize,
    /// Codes in a class with no stored document.
    pub missing: usize,
    /// Lookups and member writes that failed.
    pub failed: usize,
}

impl MergeReport {
    fn new(merged: usize, lookup_failed: usize, writes: &BatchReport) -> Self {
        Self {
            merged,
            updated: writes.written(),
            unchanged: writes.unchanged,
            missing: writes.skipped,
            failed: lookup_failed + writes.failed,
        }
    }
}

impl fmt::Display for MergeReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "merged={} updated={} unchanged={} missing={} failed={}",
            self.merged, self.updated, self.unchanged, self.missing, self.failed
        )
    }
}

/// The equivalence class of `sku` given the stored documents of its own
/// code and its declared relatives.
pub fn class_of(sku: &Sku, stored: &HashMap<String, Sku>) -> BTreeSet<String> {
    let mut union: BTreeSet<String> = sku.metadata.relatives.clone();
    union.insert(sku.code.clone());

    if let Some(own) = stored.get(&sku.code) {
        union.extend(own.metadata.relatives.iter().cloned());
    }

    // BTreeSet iterates sorted: the first stored relative is the pick.
    let picked = sku
        .metadata
        .relatives
        .iter()
        .filter(|code| **code != sku.code)
        .find_map(|code| stored.get(code));
    if let Some(picked) = picked {
        union.insert(picked.code.clone());
        union.extend(picked.metadata.relatives.iter().cloned());
    }
    union
}

/// Merge every record that carries relatives, sequentially in batch order
/// so later records see earlier merges. Member writes of one record run
/// concurrently.
pub async fn merge_relatives(
    ctx: &LogContext,
    skus: &dyn SkuStore,
    records: &[Sku],
    concurrency: usize,
) -> Result<MergeReport> {
    async {
        let start = Instant::now();
        let mut merged = 0;
        let mut lookups = 0;
        let mut lookup_failed = 0;
        let mut lookup_unavailable = 0;
        let mut writes = BatchReport::default();

        for sku in records.iter().filter(|s| s.has_relatives()) {
            let mut lookup: Vec<String> = vec![sku.code.clone()];
            lookup.extend(sku.metadata.relatives.iter().cloned());

            lookups += 1;
            let stored: HashMap<String, Sku> = match skus.find_by_codes(&lookup).await {
                Ok(found) => found.into_iter().map(|s| (s.code.clone(), s)).collect(),
                Err(e) => {
                    warn!(code = sku.code.as_str(), error = %e, "Relative lookup failed");
                    lookup_failed += 1;
                    if e.is_unavailable() {
                        lookup_unavailable += 1;
                    }
                    continue;
                }
            };

            let class = class_of(sku, &stored);
            let members: Vec<(String, BTreeSet<String>)> = class
                .iter()
                .map(|code| {
                    let mut others = class.clone();
                    others.remove(code);
                    (code.clone(), others)
                })
                .collect();

            let member_writes =
                run_writes(&members, concurrency, |(code, _)| code.as_str(), |(code, others)| {
                    skus.add_relatives(code, others)
                })
                .await;
            writes.absorb(&member_writes);
            merged += 1;
            debug!(code = sku.code.as_str(), class = class.len(), "Relatives merged");
        }

        let attempted = lookups + writes.attempted;
        if attempted > 0 && lookup_unavailable + writes.unavailable == attempted {
            return Err(InfraError::BackendUnavailable(format!(
                "all {attempted} relative operations failed"
            )));
        }

        let report = MergeReport::new(merged, lookup_failed, &writes);
        info!(
            quantity = records.len(),
            merged = report.merged,
            updated = report.updated,
            missing = report.missing,
            duration_ms = start.elapsed().as_millis() as u64,
            "Relatives merged"
        );
        Ok(report)
    }
    .instrument(ctx.span("merge_relatives"))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageinfra_store::MemoryStore;
    use serde_json::json;

    fn set(codes: &[&str]) -> BTreeSet<String> {
        codes.iter().map(|c| c.to_string()).collect()
    }

    fn sku(code: &str, relatives: &[&str]) -> Sku {
        Sku::new(code, json!({"code": code})).with_relatives(relatives.iter().copied())
    }

    #[test]
    fn class_picks_first_stored_relative() {
        let incoming = sku("A", &["B", "C"]);
        let stored: HashMap<String, Sku> = [sku("A", &[]), sku("C", &["D"])]
            .into_iter()
            .map(|s| (s.code.clone(), s))
            .collect();

        // B is not stored, so C is picked and contributes D.
        assert_eq!(class_of(&incoming, &stored), set(&["A", "B", "C", "D"]));
    }

    #[test]
    fn class_is_single_hop() {
        let incoming = sku("A", &["B"]);
        let stored: HashMap<String, Sku> = [sku("A", &[]), sku("B", &["C"]), sku("C", &["D"])]
            .into_iter()
            .map(|s| (s.code.clone(), s))
            .collect();

        // D is two hops away through C and stays out.
        assert_eq!(class_of(&incoming, &stored), set(&["A", "B", "C"]));
    }

    #[tokio::test]
    async fn links_both_directions() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");
        store.put_sku(sku("A", &["B"]));
        store.put_sku(sku("B", &[]));

        let report = merge_relatives(&ctx, &store, &[sku("A", &["B"])], 4)
            .await
            .unwrap();

        assert_eq!(report.merged, 1);
        assert_eq!(store.sku("A").unwrap().metadata.relatives, set(&["B"]));
        assert_eq!(store.sku("B").unwrap().metadata.relatives, set(&["A"]));
    }

    #[tokio::test]
    async fn missing_codes_are_counted_not_fatal() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");
        store.put_sku(sku("A", &["GHOST"]));

        let report = merge_relatives(&ctx, &store, &[sku("A", &["GHOST"])], 4)
            .await
            .unwrap();

        assert_eq!(report.missing, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn records_without_relatives_are_ignored() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");

        let report = merge_relatives(&ctx, &store, &[sku("A", &[])], 4)
            .await
            .unwrap();
        assert_eq!(report, MergeReport::default());
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn counts_add_up_across_records() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");
        store.put_sku(sku("A", &[]));
        store.put_sku(sku("B", &[]));
        store.put_sku(sku("D", &[]));
        store.reject("D");

        let report = merge_relatives(
            &ctx,
            &store,
            &[sku("A", &["B"]), sku("C", &["D"]), sku("E", &["GHOST"])],
            4,
        )
        .await
        .unwrap();

        // A: A and B grow. C: C missing, D rejected. E: both codes missing.
        assert_eq!(
            report,
            MergeReport {
                merged: 3,
                updated: 2,
                unchanged: 0,
                missing: 3,
                failed: 1,
            }
        );
    }

    #[tokio::test]
    async fn unreachable_store_fails_the_merge() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let ctx = LogContext::new("rihappy");

        let err = merge_relatives(&ctx, &store, &[sku("A", &["B"])], 4)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn relatives_never_shrink() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");
        store.put_sku(sku("A", &["B", "C"]));
        store.put_sku(sku("B", &[]));

        merge_relatives(&ctx, &store, &[sku("A", &["B"])], 4)
            .await
            .unwrap();
        assert_eq!(store.sku("A").unwrap().metadata.relatives, set(&["B", "C"]));
    }
}
