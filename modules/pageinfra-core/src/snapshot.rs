use std::time::Instant;

use tracing::{info, Instrument};

use pageinfra_common::{LogContext, Sku};
use pageinfra_store::SnapshotStore;

use crate::batch::{run_writes, BatchReport};
use crate::error::Result;

/// Insert each record's content-addressed snapshot unless one with the same
/// hash exists. Duplicates count as `skipped`.
pub async fn insert_snapshots(
    ctx: &LogContext,
    snapshots: &dyn SnapshotStore,
    records: &[Sku],
    concurrency: usize,
) -> Result<BatchReport> {
    async {
        let start = Instant::now();
        let report = run_writes(records, concurrency, |s| s.code.as_str(), |sku| {
            let snapshot = sku.snapshot();
            async move { snapshots.insert_if_absent(&snapshot).await }
        })
        .await
        .ensure_reachable()?;

        info!(
            quantity = records.len(),
            inserted = report.inserted,
            skipped = report.skipped,
            duration_ms = start.elapsed().as_millis() as u64,
            "Snapshots inserted"
        );
        Ok(report)
    }
    .instrument(ctx.span("insert_snapshots"))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageinfra_store::MemoryStore;
    use serde_json::json;

    #[tokio::test]
    async fn same_snapshot_is_kept_once() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");
        let sku = Sku::new("X1", json!({"v": 1}));

        for _ in 0..5 {
            insert_snapshots(&ctx, &store, std::slice::from_ref(&sku), 4)
                .await
                .unwrap();
        }
        assert_eq!(store.snapshot_count(), 1);
    }

    #[tokio::test]
    async fn duplicates_in_one_batch_are_skipped() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");
        // Same content under two codes shares one snapshot.
        let records = vec![
            Sku::new("A", json!({"name": "lego"})),
            Sku::new("B", json!({"name": "lego"})),
        ];

        let report = insert_snapshots(&ctx, &store, &records, 4).await.unwrap();
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped, 1);
        assert_eq!(report.failed, 0);
    }

    #[tokio::test]
    async fn snapshot_holds_core_fields() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");
        let sku = Sku::new("A", json!({"name": "lego", "price": 99}));

        insert_snapshots(&ctx, &store, std::slice::from_ref(&sku), 4)
            .await
            .unwrap();
        let stored = store.snapshot(sku.hash()).await.unwrap().unwrap();
        assert_eq!(stored.sku, sku.core);
    }
}
