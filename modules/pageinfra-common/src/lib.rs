//! Shared types for the pageinfra consistency engine.
//!
//! Records (`Sku`, `HistoricEntry`, `Snapshot`, `UrlAccess`), typed write
//! outcomes, the marketplace namespace registry, configuration and the
//! per-operation logging context. No I/O lives here.

pub mod config;
pub mod context;
pub mod error;
pub mod file_config;
pub mod marketplace;
pub mod types;

pub use config::Config;
pub use context::LogContext;
pub use error::{ConfigError, UnknownMarketplace};
pub use file_config::{load_config, FileConfig, MarketplaceOverride};
pub use marketplace::{MarketplaceNamespace, MarketplaceRegistry};
pub use types::{content_hash, HistoricEntry, Sku, SkuMetadata, Snapshot, UrlAccess, WriteOutcome};
