//! Persistence for the pageinfra consistency engine.
//!
//! Trait boundaries per collection (`traits`), a Postgres implementation
//! (`postgres`), a Meilisearch search index (`meili`) and in-memory doubles
//! for tests (`memory`).

pub mod error;
pub mod meili;
pub mod memory;
pub mod postgres;
pub mod traits;

pub use error::{StoreError, StoreResult};
pub use meili::{MeilisearchIndex, NoopIndex};
pub use memory::{MemoryBackend, MemoryIndex, MemoryStore};
pub use postgres::{PgBackend, PgStore};
pub use traits::{
    Backend, ClaimStore, HistoricStore, SearchIndex, SkuStore, SnapshotStore, Stores,
    UrlAccessStore,
};
