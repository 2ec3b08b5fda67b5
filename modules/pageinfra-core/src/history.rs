use std::time::Instant;

use tracing::{info, Instrument};

use pageinfra_common::{LogContext, Sku};
use pageinfra_store::HistoricStore;

use crate::batch::{run_writes, BatchReport};
use crate::error::Result;

/// Push `{created, hash}` to the front of each record's history unless the
/// front entry already carries that hash. Replays never duplicate; there is
/// no length cap.
pub async fn append_history(
    ctx: &LogContext,
    historic: &dyn HistoricStore,
    records: &[Sku],
    concurrency: usize,
) -> Result<BatchReport> {
    async {
        let start = Instant::now();
        let report = run_writes(records, concurrency, |s| s.code.as_str(), |sku| {
            let entry = sku.historic_entry();
            async move { historic.push_if_new(&sku.code, &entry).await }
        })
        .await
        .ensure_reachable()?;

        info!(
            quantity = records.len(),
            appended = report.written(),
            duration_ms = start.elapsed().as_millis() as u64,
            "History appended"
        );
        Ok(report)
    }
    .instrument(ctx.span("append_history"))
    .await
}
