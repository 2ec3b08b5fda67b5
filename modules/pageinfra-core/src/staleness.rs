use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, info, Instrument};

use pageinfra_common::LogContext;
use pageinfra_store::UrlAccessStore;

use crate::error::Result;

/// URLs with no access record, or last accessed before `now - retention`,
/// in input order. Read-only.
pub async fn filter_stale(
    ctx: &LogContext,
    urls: &dyn UrlAccessStore,
    input: &[String],
    retention: Duration,
) -> Result<Vec<String>> {
    if input.is_empty() {
        return Ok(Vec::new());
    }

    async {
        let start = Instant::now();
        let cutoff = chrono::Duration::from_std(retention)
            .ok()
            .and_then(|retention| Utc::now().checked_sub_signed(retention))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let accessed = urls.last_accessed(input).await?;
        let stale: Vec<String> = input
            .iter()
            .filter(|url| match accessed.get(*url) {
                Some(at) if *at >= cutoff => {
                    debug!(url = url.as_str(), accessed = %at, "Visited recently, dropping");
                    false
                }
                _ => true,
            })
            .cloned()
            .collect();

        info!(
            quantity = input.len(),
            stale = stale.len(),
            duration_ms = start.elapsed().as_millis() as u64,
            "URLs filtered for staleness"
        );
        Ok(stale)
    }
    .instrument(ctx.span("filter_stale"))
    .await
}

/// Record a successful visit to each URL at the current time.
pub async fn mark_accessed(
    ctx: &LogContext,
    urls: &dyn UrlAccessStore,
    input: &[String],
) -> Result<u64> {
    if input.is_empty() {
        return Ok(0);
    }

    async {
        let start = Instant::now();
        let written = urls.mark_accessed(input, Utc::now()).await?;
        info!(
            quantity = input.len(),
            written,
            duration_ms = start.elapsed().as_millis() as u64,
            "URLs marked accessed"
        );
        Ok(written)
    }
    .instrument(ctx.span("mark_accessed"))
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use pageinfra_store::MemoryStore;

    const DAY: Duration = Duration::from_secs(24 * 3600);

    fn urls(items: &[&str]) -> Vec<String> {
        items.iter().map(|u| u.to_string()).collect()
    }

    #[tokio::test]
    async fn keeps_unknown_and_old_urls_in_order() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");
        store.set_accessed("https://recent", Utc::now() - chrono::Duration::hours(1));
        store.set_accessed("https://old", Utc::now() - chrono::Duration::hours(30));

        let input = urls(&["https://old", "https://recent", "https://new"]);
        let out = filter_stale(&ctx, &store, &input, DAY).await.unwrap();
        assert_eq!(out, urls(&["https://old", "https://new"]));
    }

    #[tokio::test]
    async fn repeated_calls_agree() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");
        store.set_accessed("https://recent", Utc::now());

        let input = urls(&["https://recent", "https://new"]);
        let first = filter_stale(&ctx, &store, &input, DAY).await.unwrap();
        let second = filter_stale(&ctx, &store, &input, DAY).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn empty_input_makes_no_call() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");

        let out = filter_stale(&ctx, &store, &[], DAY).await.unwrap();
        assert!(out.is_empty());
        assert_eq!(store.calls(), 0);
    }

    #[tokio::test]
    async fn backend_failure_propagates() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        let ctx = LogContext::new("rihappy");

        let err = filter_stale(&ctx, &store, &urls(&["https://a"]), DAY)
            .await
            .unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn marked_urls_become_fresh() {
        let store = MemoryStore::new();
        let ctx = LogContext::new("rihappy");
        let input = urls(&["https://a"]);

        assert_eq!(mark_accessed(&ctx, &store, &input).await.unwrap(), 1);
        assert!(filter_stale(&ctx, &store, &input, DAY).await.unwrap().is_empty());
    }
}
