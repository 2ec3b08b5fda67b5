use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A product record scraped from one marketplace, keyed by `code`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sku {
    pub code: String,
    pub metadata: SkuMetadata,
    /// Marketplace-visible fields. Opaque to the engine apart from hashing
    /// and snapshotting.
    #[serde(default)]
    pub core: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkuMetadata {
    /// Set once on first insert and never overwritten by later updates.
    pub created: DateTime<Utc>,
    /// Fingerprint of the comparable fields.
    pub hash: String,
    /// Other codes asserted to be the same product. Never contains `code`.
    #[serde(default)]
    pub relatives: BTreeSet<String>,
}

impl Sku {
    /// Build a record stamped now, hashing `core` for its fingerprint.
    pub fn new(code: impl Into<String>, core: serde_json::Value) -> Self {
        let hash = content_hash(&core);
        Self {
            code: code.into(),
            metadata: SkuMetadata {
                created: Utc::now(),
                hash,
                relatives: BTreeSet::new(),
            },
            core,
        }
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.metadata.hash = hash.into();
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.metadata.created = created;
        self
    }

    pub fn with_relatives<I, S>(mut self, relatives: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.metadata.relatives = relatives.into_iter().map(Into::into).collect();
        self.metadata.relatives.remove(&self.code);
        self
    }

    pub fn hash(&self) -> &str {
        &self.metadata.hash
    }

    pub fn has_relatives(&self) -> bool {
        self.metadata.relatives.iter().any(|r| r != &self.code)
    }

    /// The history entry this record would push.
    pub fn historic_entry(&self) -> HistoricEntry {
        HistoricEntry {
            created: self.metadata.created,
            hash: self.metadata.hash.clone(),
        }
    }

    /// The content-addressed snapshot of this record.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            hash: self.metadata.hash.clone(),
            created: self.metadata.created,
            sku: self.core.clone(),
        }
    }
}

/// Lowercase hex SHA-256 of the canonical JSON form of `core`.
///
/// `serde_json` maps keep keys sorted, so logically equal payloads hash equal.
pub fn content_hash(core: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(core.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// One `{created, hash}` pair in a record's newest-first change log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoricEntry {
    pub created: DateTime<Utc>,
    pub hash: String,
}

/// Immutable copy of a record's core fields, keyed by content hash.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub hash: String,
    pub created: DateTime<Utc>,
    pub sku: serde_json::Value,
}

/// Last time a URL was successfully processed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlAccess {
    pub url: String,
    pub accessed: DateTime<Utc>,
}

/// Result of a single conditional write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteOutcome {
    /// No document existed; one was created.
    Inserted,
    /// A document existed and its content changed.
    Updated,
    /// A document existed and already held this content.
    Unchanged,
    /// The write did not apply: duplicate key or missing target.
    Skipped,
}

impl WriteOutcome {
    /// Whether the write changed stored state.
    pub fn changed(self) -> bool {
        matches!(self, WriteOutcome::Inserted | WriteOutcome::Updated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn content_hash_ignores_key_order() {
        let a = json!({"name": "Lego", "price": 10});
        let b = json!({"price": 10, "name": "Lego"});
        assert_eq!(content_hash(&a), content_hash(&b));
        assert_ne!(content_hash(&a), content_hash(&json!({"name": "Lego", "price": 11})));
    }

    #[test]
    fn relatives_never_include_own_code() {
        let sku = Sku::new("A", json!({})).with_relatives(["A", "B"]);
        assert_eq!(sku.metadata.relatives.len(), 1);
        assert!(sku.metadata.relatives.contains("B"));
        assert!(sku.has_relatives());
    }

    #[test]
    fn sku_deserializes_without_relatives_or_core() {
        let sku: Sku = serde_json::from_value(json!({
            "code": "X1",
            "metadata": {"created": "2024-01-01T00:00:00Z", "hash": "h1"}
        }))
        .unwrap();

        assert_eq!(sku.hash(), "h1");
        assert!(sku.metadata.relatives.is_empty());
        assert!(sku.core.is_null());
    }

    #[test]
    fn snapshot_and_history_carry_hash_and_created() {
        let sku = Sku::new("X1", json!({"title": "Ball"})).with_hash("h1");
        let snap = sku.snapshot();
        let entry = sku.historic_entry();
        assert_eq!(snap.hash, "h1");
        assert_eq!(snap.sku, json!({"title": "Ball"}));
        assert_eq!(entry.hash, "h1");
        assert_eq!(entry.created, snap.created);
    }
}
