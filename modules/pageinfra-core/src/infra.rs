//! Per-marketplace entry point wiring the gates, the change pipeline and the
//! relative merger onto one namespace's stores.

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{info, warn, Instrument};
use uuid::Uuid;

use pageinfra_common::{
    load_config, Config, LogContext, MarketplaceNamespace, MarketplaceRegistry, Sku,
};
use pageinfra_store::{Backend, Stores};

use crate::batch::BatchReport;
use crate::error::Result;
use crate::gate::{GatePolicy, RecencyGate};
use crate::history::append_history;
use crate::relatives::{merge_relatives, MergeReport};
use crate::snapshot::insert_snapshots;
use crate::staleness::{filter_stale, mark_accessed};
use crate::upsert::{dedupe_last_wins, ChangeDetector, UpsertEngine, UpsertReport};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    pub claim_ttl: Duration,
    pub retention: Duration,
    pub concurrency: usize,
    pub gate_policy: GatePolicy,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            claim_ttl: Duration::from_secs(60),
            retention: Duration::from_secs(24 * 3600),
            concurrency: 16,
            gate_policy: GatePolicy::FailOpen,
        }
    }
}

impl IngestSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            claim_ttl: config.claim_ttl,
            retention: config.retention,
            concurrency: config.batch_concurrency.max(1),
            gate_policy: if config.gate_fail_closed {
                GatePolicy::FailClosed
            } else {
                GatePolicy::FailOpen
            },
        }
    }
}

/// The built-in marketplace table, with the TOML file at `path` layered on
/// top when one is given.
pub fn load_registry(path: Option<&Path>) -> Result<MarketplaceRegistry> {
    let Some(path) = path else {
        return Ok(MarketplaceRegistry::builtin());
    };
    let file_config = load_config(path)?;
    let registry = MarketplaceRegistry::from_file_config(&file_config)?;
    info!(path = %path.display(), marketplaces = registry.len(), "Marketplace table loaded");
    Ok(registry)
}

/// Outcome of one ingested batch.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub received: usize,
    pub duplicates: usize,
    pub unchanged: usize,
    pub upsert: UpsertReport,
    pub history: BatchReport,
    pub snapshots: BatchReport,
    pub relatives: MergeReport,
    pub indexed: usize,
    pub index_failed: bool,
    pub duration_ms: u64,
}

impl fmt::Display for IngestReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "received:   {} ({} duplicates, {} unchanged)", self.received, self.duplicates, self.unchanged)?;
        writeln!(f, "upsert:     {}", self.upsert)?;
        writeln!(f, "history:    {}", self.history)?;
        writeln!(f, "snapshots:  {}", self.snapshots)?;
        writeln!(f, "relatives:  {}", self.relatives)?;
        write!(
            f,
            "indexed:    {}{}",
            self.indexed,
            if self.index_failed { " (index write failed)" } else { "" }
        )
    }
}

/// Resolves marketplaces and opens their stores on one backend.
#[derive(Clone)]
pub struct Infra {
    registry: Arc<MarketplaceRegistry>,
    backend: Arc<dyn Backend>,
    settings: IngestSettings,
}

impl Infra {
    pub fn new(
        registry: MarketplaceRegistry,
        backend: Arc<dyn Backend>,
        settings: IngestSettings,
    ) -> Self {
        Self {
            registry: Arc::new(registry),
            backend,
            settings,
        }
    }

    pub fn registry(&self) -> &MarketplaceRegistry {
        &self.registry
    }

    pub fn settings(&self) -> &IngestSettings {
        &self.settings
    }

    /// Handle bound to `marketplace`, with a fresh run id.
    pub fn marketplace(&self, marketplace: &str) -> Result<MarketplaceHandle> {
        let namespace = self.registry.resolve(marketplace)?.clone();
        let stores = self.backend.open(&namespace)?;
        Ok(MarketplaceHandle {
            ctx: LogContext::new(marketplace),
            namespace,
            stores,
            backend: self.backend.clone(),
            settings: self.settings.clone(),
        })
    }

    /// Provision every registered marketplace.
    pub async fn setup(&self) -> Result<()> {
        for namespace in self.registry.iter() {
            let start = Instant::now();
            self.backend.provision(namespace).await?;
            info!(
                marketplace = namespace.marketplace.as_str(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Marketplace set up"
            );
        }
        Ok(())
    }
}

/// One marketplace's stores plus the correlation context of this run.
pub struct MarketplaceHandle {
    ctx: LogContext,
    namespace: MarketplaceNamespace,
    stores: Stores,
    backend: Arc<dyn Backend>,
    settings: IngestSettings,
}

impl MarketplaceHandle {
    pub fn with_run_id(mut self, run_id: Uuid) -> Self {
        self.ctx = self.ctx.with_run_id(run_id);
        self
    }

    pub fn namespace(&self) -> &MarketplaceNamespace {
        &self.namespace
    }

    pub fn context(&self) -> &LogContext {
        &self.ctx
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn gate(&self) -> RecencyGate {
        RecencyGate::new(
            self.stores.claims.clone(),
            self.namespace.claim_prefix(),
            self.settings.claim_ttl,
        )
        .with_policy(self.settings.gate_policy)
        .with_concurrency(self.settings.concurrency)
    }

    /// Create this marketplace's collections. Idempotent.
    pub async fn setup(&self) -> Result<()> {
        self.backend
            .provision(&self.namespace)
            .instrument(self.ctx.span("setup"))
            .await?;
        Ok(())
    }

    /// URLs worth scraping now: claimed by this caller and not visited
    /// within the retention window. Input order is kept.
    pub async fn filter_urls(&self, urls: &[String]) -> Result<Vec<String>> {
        let claimed = self.gate().filter_unclaimed(&self.ctx, urls).await;
        filter_stale(
            &self.ctx,
            self.stores.urls.as_ref(),
            &claimed,
            self.settings.retention,
        )
        .await
    }

    /// Record successful scrapes.
    pub async fn mark_scraped(&self, urls: &[String]) -> Result<u64> {
        mark_accessed(&self.ctx, self.stores.urls.as_ref(), urls).await
    }

    /// Detect changes, write the primary store, history and snapshots
    /// concurrently, merge relatives, then forward to the search index.
    ///
    /// History and snapshots are written for the whole batch, not only for
    /// changed records: both writes are conditional, and a replay must be
    /// able to fill in an entry an earlier run failed to write.
    pub async fn ingest(&self, records: Vec<Sku>) -> Result<IngestReport> {
        let ctx = &self.ctx;
        let concurrency = self.settings.concurrency;

        async {
            let start = Instant::now();
            let received = records.len();
            let batch = dedupe_last_wins(records);
            let duplicates = received - batch.len();

            let detection = ChangeDetector::new(self.stores.skus.clone())
                .detect(ctx, batch.clone())
                .await?;
            let candidates = detection.candidates;

            let engine = UpsertEngine::new(self.stores.skus.clone(), concurrency);
            let (upsert, history, snapshots) = tokio::join!(
                engine.upsert(ctx, &candidates),
                append_history(ctx, self.stores.historic.as_ref(), &batch, concurrency),
                insert_snapshots(ctx, self.stores.snapshots.as_ref(), &batch, concurrency),
            );
            let (upsert, history, snapshots) = (upsert?, history?, snapshots?);

            // Reads the primary store, so it runs after the upsert settles.
            let relatives =
                merge_relatives(ctx, self.stores.skus.as_ref(), &batch, concurrency).await?;

            let (indexed, index_failed) = self.index(&candidates).await;

            let report = IngestReport {
                received,
                duplicates,
                unchanged: detection.unchanged.len(),
                upsert,
                history,
                snapshots,
                relatives,
                indexed,
                index_failed,
                duration_ms: start.elapsed().as_millis() as u64,
            };
            info!(
                quantity = received,
                accepted = report.upsert.accepted(),
                duration_ms = report.duration_ms,
                "Batch ingested"
            );
            Ok(report)
        }
        .instrument(ctx.span("ingest"))
        .await
    }

    /// Forward the stored state of `candidates` (relatives merged) to the
    /// search index. Failures are logged, never fatal.
    async fn index(&self, candidates: &[Sku]) -> (usize, bool) {
        if candidates.is_empty() {
            return (0, false);
        }
        let codes: Vec<String> = candidates.iter().map(|s| s.code.clone()).collect();
        let documents = match self.stores.skus.find_by_codes(&codes).await {
            Ok(documents) => documents,
            Err(e) => {
                warn!(error = %e, "Could not read documents for the search index");
                return (0, true);
            }
        };

        match self
            .stores
            .index
            .add_documents(&self.namespace.catalog_index, &documents)
            .await
        {
            Ok(()) => (documents.len(), false),
            Err(e) => {
                warn!(
                    index = self.namespace.catalog_index.as_str(),
                    documents = documents.len(),
                    error = %e,
                    "Search index write failed"
                );
                (0, true)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::InfraError;
    use pageinfra_store::MemoryBackend;

    fn infra() -> Infra {
        Infra::new(
            MarketplaceRegistry::builtin(),
            Arc::new(MemoryBackend::new()),
            IngestSettings::default(),
        )
    }

    #[test]
    fn unknown_marketplace_is_rejected() {
        let err = infra().marketplace("amazon").err().unwrap();
        assert!(err.to_string().contains("google_shopping"));
    }

    #[test]
    fn gate_uses_namespace_claim_prefix() {
        let handle = infra().marketplace("rihappy").unwrap();
        assert_eq!(handle.namespace().claim_prefix(), "rihappy:claim");
        assert_eq!(handle.context().marketplace, "rihappy");
    }

    #[test]
    fn settings_follow_config() {
        let config = Config {
            database_url: "postgres://localhost/test".into(),
            meilisearch_url: None,
            meilisearch_api_key: None,
            config_path: None,
            claim_ttl: Duration::from_secs(5),
            retention: Duration::from_secs(3600),
            gate_fail_closed: true,
            batch_concurrency: 0,
        };
        let settings = IngestSettings::from_config(&config);
        assert_eq!(settings.gate_policy, GatePolicy::FailClosed);
        assert_eq!(settings.concurrency, 1);
        assert_eq!(settings.claim_ttl, Duration::from_secs(5));
    }

    #[tokio::test]
    async fn setup_provisions_every_marketplace() {
        infra().setup().await.unwrap();
    }

    #[test]
    fn registry_defaults_to_builtin() {
        assert_eq!(load_registry(None).unwrap().len(), 3);
    }

    #[test]
    fn registry_layers_file_on_builtin() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marketplaces.toml");
        std::fs::write(&path, "[[marketplace]]\nid = \"amazon\"\n").unwrap();

        let registry = load_registry(Some(&path)).unwrap();
        assert!(registry.resolve("amazon").is_ok());
        assert_eq!(registry.len(), 4);
    }

    #[test]
    fn unsafe_name_in_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("marketplaces.toml");
        std::fs::write(
            &path,
            "[[marketplace]]\nid = \"amazon\"\nsku_collection = \"sku; drop\"\n",
        )
        .unwrap();

        let err = load_registry(Some(&path)).unwrap_err();
        assert!(matches!(err, InfraError::Config(_)));
        assert!(!err.is_retryable());
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_registry(Some(&dir.path().join("absent.toml"))).unwrap_err();
        assert!(matches!(err, InfraError::Config(_)));
    }

    #[tokio::test]
    async fn report_serializes_for_machine_output() {
        let handle = infra().marketplace("rihappy").unwrap();
        let report = handle
            .ingest(vec![
                Sku::new("A", serde_json::json!({"v": 1})),
                Sku::new("A", serde_json::json!({"v": 2})),
            ])
            .await
            .unwrap();

        let value = serde_json::to_value(&report).unwrap();
        assert_eq!(value["received"], 2);
        assert_eq!(value["duplicates"], 1);
        assert_eq!(value["upsert"]["inserted"], 1);
        assert_eq!(value["snapshots"]["inserted"], 1);
        assert_eq!(value["relatives"]["merged"], 0);
        assert!(value["history"].get("unavailable").is_none());
    }
}
