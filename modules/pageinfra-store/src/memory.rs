//! In-memory stores for tests. No database required.
//!
//! `MemoryStore` implements every collection trait with the same conditional
//! semantics as postgres, behind one mutex. It also carries test controls:
//! a clock offset for TTL expiry, a switch that makes every call fail as
//! unavailable, per-key rejections and a call counter.

use std::collections::hash_map::Entry;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use pageinfra_common::{HistoricEntry, MarketplaceNamespace, Sku, Snapshot, WriteOutcome};

use crate::error::{StoreError, StoreResult};
use crate::traits::{
    Backend, ClaimStore, HistoricStore, SearchIndex, SkuStore, SnapshotStore, Stores,
    UrlAccessStore,
};

#[derive(Default)]
struct State {
    skus: HashMap<String, Sku>,
    historic: HashMap<String, Vec<HistoricEntry>>,
    snapshots: HashMap<String, Snapshot>,
    urls: HashMap<String, DateTime<Utc>>,
    claims: HashMap<String, DateTime<Utc>>,
    rejected: HashSet<String>,
}

/// All collections of one namespace, held in memory. Thread-safe.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    unavailable: AtomicBool,
    clock_offset_ms: AtomicI64,
    calls: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent call fail with `StoreError::Unavailable`.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Make writes keyed by `key` (code, hash, URL or claim key) fail with
    /// `StoreError::Rejected`.
    pub fn reject(&self, key: impl Into<String>) {
        self.state().rejected.insert(key.into());
    }

    /// Undo `reject`.
    pub fn allow(&self, key: &str) {
        self.state().rejected.remove(key);
    }

    /// Move this store's clock forward.
    pub fn advance(&self, by: Duration) {
        self.clock_offset_ms
            .fetch_add(by.as_millis() as i64, Ordering::SeqCst);
    }

    /// Number of trait calls made so far (for test assertions).
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Seed a URL access record directly.
    pub fn set_accessed(&self, url: impl Into<String>, at: DateTime<Utc>) {
        self.state().urls.insert(url.into(), at);
    }

    /// Seed a stored record directly, bypassing conditional writes.
    pub fn put_sku(&self, sku: Sku) {
        self.state().skus.insert(sku.code.clone(), sku);
    }

    pub fn sku(&self, code: &str) -> Option<Sku> {
        self.state().skus.get(code).cloned()
    }

    pub fn sku_count(&self) -> usize {
        self.state().skus.len()
    }

    pub fn snapshot_count(&self) -> usize {
        self.state().snapshots.len()
    }

    fn now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.clock_offset_ms.load(Ordering::SeqCst))
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Count the call and fail when the store is switched off.
    fn enter(&self) -> StoreResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory store switched off".into()));
        }
        Ok(())
    }
}

fn check_rejected(state: &State, key: &str) -> StoreResult<()> {
    if state.rejected.contains(key) {
        return Err(StoreError::Rejected(format!("write rejected for {key}")));
    }
    Ok(())
}

#[async_trait]
impl SkuStore for MemoryStore {
    async fn stored_hashes(&self, codes: &[String]) -> StoreResult<HashMap<String, String>> {
        self.enter()?;
        let state = self.state();
        Ok(codes
            .iter()
            .filter_map(|code| {
                state
                    .skus
                    .get(code)
                    .map(|sku| (code.clone(), sku.metadata.hash.clone()))
            })
            .collect())
    }

    async fn upsert_if_changed(&self, sku: &Sku) -> StoreResult<WriteOutcome> {
        self.enter()?;
        let mut state = self.state();
        check_rejected(&state, &sku.code)?;

        match state.skus.entry(sku.code.clone()) {
            Entry::Vacant(slot) => {
                let mut inserted = sku.clone();
                inserted.metadata.relatives.remove(&sku.code);
                slot.insert(inserted);
                Ok(WriteOutcome::Inserted)
            }
            Entry::Occupied(mut slot) => {
                let stored = slot.get_mut();
                if stored.metadata.hash == sku.metadata.hash {
                    return Ok(WriteOutcome::Unchanged);
                }
                stored.metadata.hash = sku.metadata.hash.clone();
                stored.core = sku.core.clone();
                stored
                    .metadata
                    .relatives
                    .extend(sku.metadata.relatives.iter().filter(|r| **r != sku.code).cloned());
                Ok(WriteOutcome::Updated)
            }
        }
    }

    async fn find_by_codes(&self, codes: &[String]) -> StoreResult<Vec<Sku>> {
        self.enter()?;
        let state = self.state();
        let unique: BTreeSet<&String> = codes.iter().collect();
        Ok(unique
            .into_iter()
            .filter_map(|code| state.skus.get(code).cloned())
            .collect())
    }

    async fn add_relatives(
        &self,
        code: &str,
        relatives: &BTreeSet<String>,
    ) -> StoreResult<WriteOutcome> {
        self.enter()?;
        let mut state = self.state();
        check_rejected(&state, code)?;

        let Some(stored) = state.skus.get_mut(code) else {
            return Ok(WriteOutcome::Skipped);
        };
        let before = stored.metadata.relatives.len();
        stored
            .metadata
            .relatives
            .extend(relatives.iter().filter(|r| r.as_str() != code).cloned());

        if stored.metadata.relatives.len() > before {
            Ok(WriteOutcome::Updated)
        } else {
            Ok(WriteOutcome::Unchanged)
        }
    }
}

#[async_trait]
impl HistoricStore for MemoryStore {
    async fn push_if_new(&self, code: &str, entry: &HistoricEntry) -> StoreResult<WriteOutcome> {
        self.enter()?;
        let mut state = self.state();
        check_rejected(&state, code)?;

        match state.historic.entry(code.to_string()) {
            Entry::Vacant(slot) => {
                slot.insert(vec![entry.clone()]);
                Ok(WriteOutcome::Inserted)
            }
            Entry::Occupied(mut slot) => {
                let entries = slot.get_mut();
                if entries.first().map(|e| e.hash.as_str()) == Some(entry.hash.as_str()) {
                    return Ok(WriteOutcome::Unchanged);
                }
                entries.insert(0, entry.clone());
                Ok(WriteOutcome::Updated)
            }
        }
    }

    async fn historic(&self, code: &str) -> StoreResult<Vec<HistoricEntry>> {
        self.enter()?;
        Ok(self.state().historic.get(code).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl SnapshotStore for MemoryStore {
    async fn insert_if_absent(&self, snapshot: &Snapshot) -> StoreResult<WriteOutcome> {
        self.enter()?;
        let mut state = self.state();
        check_rejected(&state, &snapshot.hash)?;

        if state.snapshots.contains_key(&snapshot.hash) {
            return Ok(WriteOutcome::Skipped);
        }
        state
            .snapshots
            .insert(snapshot.hash.clone(), snapshot.clone());
        Ok(WriteOutcome::Inserted)
    }

    async fn snapshot(&self, hash: &str) -> StoreResult<Option<Snapshot>> {
        self.enter()?;
        Ok(self.state().snapshots.get(hash).cloned())
    }
}

#[async_trait]
impl UrlAccessStore for MemoryStore {
    async fn last_accessed(&self, urls: &[String]) -> StoreResult<HashMap<String, DateTime<Utc>>> {
        self.enter()?;
        let state = self.state();
        Ok(urls
            .iter()
            .filter_map(|url| state.urls.get(url).map(|at| (url.clone(), *at)))
            .collect())
    }

    async fn mark_accessed(&self, urls: &[String], at: DateTime<Utc>) -> StoreResult<u64> {
        self.enter()?;
        let mut state = self.state();
        let unique: BTreeSet<&String> = urls.iter().collect();
        for url in &unique {
            check_rejected(&state, url)?;
        }
        for url in &unique {
            let slot = state.urls.entry((*url).clone()).or_insert(at);
            if *slot < at {
                *slot = at;
            }
        }
        Ok(unique.len() as u64)
    }
}

#[async_trait]
impl ClaimStore for MemoryStore {
    async fn try_claim(&self, key: &str, ttl: Duration) -> StoreResult<bool> {
        self.enter()?;
        let now = self.now();
        let mut state = self.state();
        check_rejected(&state, key)?;

        if let Some(expires_at) = state.claims.get(key) {
            if *expires_at > now {
                return Ok(false);
            }
        }
        let ttl = chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::MAX);
        state
            .claims
            .insert(key.to_string(), now.checked_add_signed(ttl).unwrap_or(DateTime::<Utc>::MAX_UTC));
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// MemoryIndex
// ---------------------------------------------------------------------------

/// Search index that records every document it receives.
#[derive(Default)]
pub struct MemoryIndex {
    documents: Mutex<HashMap<String, HashMap<String, Sku>>>,
    unavailable: AtomicBool,
}

impl MemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Documents currently held by `index`, keyed by code.
    pub fn documents(&self, index: &str) -> HashMap<String, Sku> {
        self.documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(index)
            .cloned()
            .unwrap_or_default()
    }
}

#[async_trait]
impl SearchIndex for MemoryIndex {
    async fn add_documents(&self, index: &str, skus: &[Sku]) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("memory index switched off".into()));
        }
        let mut documents = self
            .documents
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let docs = documents.entry(index.to_string()).or_default();
        for sku in skus {
            docs.insert(sku.code.clone(), sku.clone());
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// MemoryBackend
// ---------------------------------------------------------------------------

/// One `MemoryStore` per namespace database, created on first use.
pub struct MemoryBackend {
    stores: Mutex<HashMap<String, Arc<MemoryStore>>>,
    index: Arc<MemoryIndex>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self {
            stores: Mutex::new(HashMap::new()),
            index: Arc::new(MemoryIndex::new()),
        }
    }

    /// The store behind a namespace (for test assertions and fault injection).
    pub fn store(&self, namespace: &MarketplaceNamespace) -> Arc<MemoryStore> {
        self.stores
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .entry(namespace.database.clone())
            .or_default()
            .clone()
    }

    pub fn index(&self) -> Arc<MemoryIndex> {
        self.index.clone()
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    async fn provision(&self, namespace: &MarketplaceNamespace) -> StoreResult<()> {
        namespace
            .validate()
            .map_err(|e| StoreError::Rejected(e.to_string()))?;
        self.store(namespace);
        Ok(())
    }

    fn open(&self, namespace: &MarketplaceNamespace) -> StoreResult<Stores> {
        let store = self.store(namespace);
        Ok(Stores {
            skus: store.clone(),
            historic: store.clone(),
            snapshots: store.clone(),
            urls: store.clone(),
            claims: store,
            index: self.index.clone(),
        })
    }
}
