//! Store boundaries used by the consistency engine.
//!
//! One trait per logical collection. Every write is a single conditional
//! operation on one document and reports a typed `WriteOutcome`, so batch
//! callers never rely on the backend swallowing duplicate-key errors.
//!
//! Implemented by `PgStore` (postgres) and `MemoryStore` (tests).

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pageinfra_common::{HistoricEntry, MarketplaceNamespace, Sku, Snapshot, WriteOutcome};

use crate::error::StoreResult;

// ---------------------------------------------------------------------------
// Primary store
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SkuStore: Send + Sync {
    /// Stored hash per code, for the codes that exist.
    async fn stored_hashes(&self, codes: &[String]) -> StoreResult<HashMap<String, String>>;

    /// Insert when absent (`Inserted`), replace content when the stored hash
    /// differs (`Updated`), otherwise `Unchanged`. `created` is only written
    /// on insert; relatives are unioned with the stored set.
    async fn upsert_if_changed(&self, sku: &Sku) -> StoreResult<WriteOutcome>;

    /// Stored records for the codes that exist, in no particular order.
    async fn find_by_codes(&self, codes: &[String]) -> StoreResult<Vec<Sku>>;

    /// Union `relatives` (minus `code` itself) into the stored set.
    /// `Skipped` when `code` is not stored, `Unchanged` when nothing was new.
    async fn add_relatives(
        &self,
        code: &str,
        relatives: &BTreeSet<String>,
    ) -> StoreResult<WriteOutcome>;
}

// ---------------------------------------------------------------------------
// Append-only collections
// ---------------------------------------------------------------------------

#[async_trait]
pub trait HistoricStore: Send + Sync {
    /// Push `entry` to the front of the code's history unless the current
    /// front entry already has the same hash.
    async fn push_if_new(&self, code: &str, entry: &HistoricEntry) -> StoreResult<WriteOutcome>;

    /// Newest-first history; empty when the code has none.
    async fn historic(&self, code: &str) -> StoreResult<Vec<HistoricEntry>>;
}

#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// `Inserted`, or `Skipped` when a snapshot with this hash exists.
    async fn insert_if_absent(&self, snapshot: &Snapshot) -> StoreResult<WriteOutcome>;

    async fn snapshot(&self, hash: &str) -> StoreResult<Option<Snapshot>>;
}

// ---------------------------------------------------------------------------
// URL bookkeeping
// ---------------------------------------------------------------------------

#[async_trait]
pub trait UrlAccessStore: Send + Sync {
    /// Last `accessed` per URL, for the URLs that have a record.
    async fn last_accessed(&self, urls: &[String]) -> StoreResult<HashMap<String, DateTime<Utc>>>;

    /// Record `at` as the last access for each URL. Returns rows written.
    async fn mark_accessed(&self, urls: &[String], at: DateTime<Utc>) -> StoreResult<u64>;
}

#[async_trait]
pub trait ClaimStore: Send + Sync {
    /// Atomically take `key` for `ttl` unless an unexpired claim exists.
    /// Returns true iff this call took it.
    async fn try_claim(&self, key: &str, ttl: Duration) -> StoreResult<bool>;
}

// ---------------------------------------------------------------------------
// Read side
// ---------------------------------------------------------------------------

#[async_trait]
pub trait SearchIndex: Send + Sync {
    /// Add or replace documents (primary key `code`) in `index`.
    async fn add_documents(&self, index: &str, skus: &[Sku]) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// Backend: opens stores bound to one marketplace namespace
// ---------------------------------------------------------------------------

/// The collections of one marketplace namespace.
#[derive(Clone)]
pub struct Stores {
    pub skus: Arc<dyn SkuStore>,
    pub historic: Arc<dyn HistoricStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub urls: Arc<dyn UrlAccessStore>,
    pub claims: Arc<dyn ClaimStore>,
    pub index: Arc<dyn SearchIndex>,
}

#[async_trait]
pub trait Backend: Send + Sync {
    /// Create the namespace's collections and unique keys. Idempotent.
    async fn provision(&self, namespace: &MarketplaceNamespace) -> StoreResult<()>;

    /// Stores bound to the namespace's physical names.
    fn open(&self, namespace: &MarketplaceNamespace) -> StoreResult<Stores>;
}
