//! Consistency engine for scraped marketplace SKUs.
//!
//! URLs pass the recency gate and the staleness filter before scraping.
//! Scraped records go through change detection, then the primary-store
//! upsert, history and snapshot writes run concurrently, relatives are
//! merged last and accepted documents are forwarded to the search index.
//! `Infra` resolves a marketplace id to its namespace and wires all of it.

pub mod batch;
pub mod error;
pub mod gate;
pub mod history;
pub mod infra;
pub mod relatives;
pub mod snapshot;
pub mod staleness;
pub mod upsert;

pub use batch::BatchReport;
pub use error::{InfraError, Result};
pub use gate::{GatePolicy, RecencyGate};
pub use history::append_history;
pub use infra::{load_registry, Infra, IngestReport, IngestSettings, MarketplaceHandle};
pub use relatives::{class_of, merge_relatives, MergeReport};
pub use snapshot::insert_snapshots;
pub use staleness::{filter_stale, mark_accessed};
pub use upsert::{dedupe_last_wins, ChangeDetector, Detection, UpsertEngine, UpsertReport};
