//! Marketplace namespace resolution.
//!
//! Every marketplace maps to one `MarketplaceNamespace`: the physical names
//! of its database, collections, queues and search index. Names are plain
//! data looked up by identifier; there is no per-marketplace behaviour.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, UnknownMarketplace};
use crate::file_config::{FileConfig, MarketplaceOverride};

/// Physical names used by one marketplace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketplaceNamespace {
    pub marketplace: String,

    // Queues
    pub search_queue: String,
    pub sku_queue: String,
    pub image_queue: String,

    // Document store
    pub database: String,
    pub sku_collection: String,
    pub historic_collection: String,
    pub snapshot_collection: String,
    pub url_collection: String,
    pub claim_collection: String,

    // Search index
    pub catalog_index: String,
}

impl MarketplaceNamespace {
    /// Names derived from the identifier alone.
    pub fn derived(marketplace: &str) -> Self {
        Self {
            marketplace: marketplace.to_string(),
            search_queue: format!("{marketplace}_search"),
            sku_queue: format!("{marketplace}_sku"),
            image_queue: format!("{marketplace}_image"),
            database: marketplace.to_string(),
            sku_collection: "sku".to_string(),
            historic_collection: "historic".to_string(),
            snapshot_collection: "snapshot".to_string(),
            url_collection: "url".to_string(),
            claim_collection: "claim".to_string(),
            catalog_index: marketplace.to_string(),
        }
    }

    /// Key prefix for recency claims, unique per marketplace.
    pub fn claim_prefix(&self) -> String {
        format!("{}:{}", self.database, self.claim_collection)
    }

    fn apply(&mut self, o: &MarketplaceOverride) {
        let fields: [(&mut String, &Option<String>); 10] = [
            (&mut self.search_queue, &o.search_queue),
            (&mut self.sku_queue, &o.sku_queue),
            (&mut self.image_queue, &o.image_queue),
            (&mut self.database, &o.database),
            (&mut self.sku_collection, &o.sku_collection),
            (&mut self.historic_collection, &o.historic_collection),
            (&mut self.snapshot_collection, &o.snapshot_collection),
            (&mut self.url_collection, &o.url_collection),
            (&mut self.claim_collection, &o.claim_collection),
            (&mut self.catalog_index, &o.catalog_index),
        ];
        for (slot, value) in fields {
            if let Some(v) = value {
                *slot = v.clone();
            }
        }
    }

    /// Reject names that cannot be used verbatim as identifiers.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fields = [
            ("marketplace", &self.marketplace),
            ("search_queue", &self.search_queue),
            ("sku_queue", &self.sku_queue),
            ("image_queue", &self.image_queue),
            ("database", &self.database),
            ("sku_collection", &self.sku_collection),
            ("historic_collection", &self.historic_collection),
            ("snapshot_collection", &self.snapshot_collection),
            ("url_collection", &self.url_collection),
            ("claim_collection", &self.claim_collection),
            ("catalog_index", &self.catalog_index),
        ];
        for (field, name) in fields {
            if !is_identifier(name) {
                return Err(ConfigError::InvalidName {
                    marketplace: self.marketplace.clone(),
                    field,
                    name: name.clone(),
                });
            }
        }
        Ok(())
    }
}

fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    name.len() <= 63
        && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

/// Lookup table from marketplace identifier to namespace.
#[derive(Debug, Clone)]
pub struct MarketplaceRegistry {
    namespaces: BTreeMap<String, MarketplaceNamespace>,
}

impl MarketplaceRegistry {
    /// An empty registry. Use `register` or `builtin`.
    pub fn empty() -> Self {
        Self {
            namespaces: BTreeMap::new(),
        }
    }

    /// The marketplaces the scrapers currently ship with.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();

        let mut google_shopping = MarketplaceNamespace::derived("google_shopping");
        google_shopping.url_collection = "urls".to_string();
        google_shopping.sku_collection = "skus".to_string();

        registry.insert(google_shopping);
        registry.insert(MarketplaceNamespace::derived("rihappy"));
        registry.insert(MarketplaceNamespace::derived("mercado_livre"));
        registry
    }

    /// Built-in table with the file's entries layered on top.
    pub fn from_file_config(config: &FileConfig) -> Result<Self, ConfigError> {
        let mut registry = Self::builtin();
        for o in &config.marketplace {
            let mut ns = registry
                .namespaces
                .get(&o.id)
                .cloned()
                .unwrap_or_else(|| MarketplaceNamespace::derived(&o.id));
            ns.apply(o);
            registry.register(ns)?;
        }
        Ok(registry)
    }

    /// Add or replace a namespace after validating its names.
    pub fn register(&mut self, namespace: MarketplaceNamespace) -> Result<(), ConfigError> {
        namespace.validate()?;
        self.insert(namespace);
        Ok(())
    }

    fn insert(&mut self, namespace: MarketplaceNamespace) {
        self.namespaces
            .insert(namespace.marketplace.clone(), namespace);
    }

    /// Get the namespace responsible for the marketplace.
    pub fn resolve(&self, marketplace: &str) -> Result<&MarketplaceNamespace, UnknownMarketplace> {
        self.namespaces
            .get(marketplace)
            .ok_or_else(|| UnknownMarketplace {
                marketplace: marketplace.to_string(),
                valid: self.namespaces.keys().cloned().collect(),
            })
    }

    pub fn iter(&self) -> impl Iterator<Item = &MarketplaceNamespace> {
        self.namespaces.values()
    }

    pub fn len(&self) -> usize {
        self.namespaces.len()
    }

    pub fn is_empty(&self) -> bool {
        self.namespaces.is_empty()
    }
}

impl Default for MarketplaceRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtin_names_follow_marketplace_id() {
        let registry = MarketplaceRegistry::builtin();
        let ns = registry.resolve("rihappy").unwrap();

        assert_eq!(ns.database, "rihappy");
        assert_eq!(ns.sku_queue, "rihappy_sku");
        assert_eq!(ns.search_queue, "rihappy_search");
        assert_eq!(ns.image_queue, "rihappy_image");
        assert_eq!(ns.catalog_index, "rihappy");
        assert_eq!(ns.sku_collection, "sku");
        assert_eq!(ns.claim_prefix(), "rihappy:claim");
    }

    #[test]
    fn google_shopping_keeps_plural_collections() {
        let registry = MarketplaceRegistry::builtin();
        let ns = registry.resolve("google_shopping").unwrap();
        assert_eq!(ns.url_collection, "urls");
        assert_eq!(ns.sku_collection, "skus");
        assert_eq!(ns.historic_collection, "historic");
    }

    #[test]
    fn unknown_marketplace_lists_valid_options() {
        let registry = MarketplaceRegistry::builtin();
        let err = registry.resolve("amazon").unwrap_err();

        assert_eq!(err.marketplace, "amazon");
        assert_eq!(err.valid, vec!["google_shopping", "mercado_livre", "rihappy"]);
        assert!(err.to_string().contains("google_shopping, mercado_livre, rihappy"));
    }

    #[test]
    fn register_rejects_unsafe_names() {
        let mut registry = MarketplaceRegistry::empty();
        let mut ns = MarketplaceNamespace::derived("americanas");
        ns.sku_collection = "sku; DROP TABLE sku".to_string();

        let err = registry.register(ns).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidName { field: "sku_collection", .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn file_overrides_layer_on_builtin() {
        let config: FileConfig = toml::from_str(
            r#"
            [[marketplace]]
            id = "rihappy"
            database = "rihappy_v2"

            [[marketplace]]
            id = "americanas"
            "#,
        )
        .unwrap();

        let registry = MarketplaceRegistry::from_file_config(&config).unwrap();
        assert_eq!(registry.len(), 4);
        assert_eq!(registry.resolve("rihappy").unwrap().database, "rihappy_v2");
        assert_eq!(registry.resolve("rihappy").unwrap().sku_queue, "rihappy_sku");
        assert_eq!(registry.resolve("americanas").unwrap().sku_queue, "americanas_sku");
    }

    #[test]
    fn identifiers() {
        assert!(is_identifier("mercado_livre"));
        assert!(is_identifier("_x1"));
        assert!(!is_identifier("1abc"));
        assert!(!is_identifier("Rihappy"));
        assert!(!is_identifier(""));
        assert!(!is_identifier("a-b"));
    }
}
