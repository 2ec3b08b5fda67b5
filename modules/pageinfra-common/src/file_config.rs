use std::path::Path;

use serde::Deserialize;

use crate::error::ConfigError;

/// TOML-backed marketplace table. Secrets and URLs stay as env vars.
///
/// ```toml
/// [[marketplace]]
/// id = "americanas"
/// url_collection = "urls"
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub marketplace: Vec<MarketplaceOverride>,
}

/// Names for one marketplace; unset fields fall back to the built-in or
/// derived value.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MarketplaceOverride {
    pub id: String,
    pub search_queue: Option<String>,
    pub sku_queue: Option<String>,
    pub image_queue: Option<String>,
    pub database: Option<String>,
    pub sku_collection: Option<String>,
    pub historic_collection: Option<String>,
    pub snapshot_collection: Option<String>,
    pub url_collection: Option<String>,
    pub claim_collection: Option<String>,
    pub catalog_index: Option<String>,
}

/// Load and parse a TOML config file.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&content).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn loads_marketplace_entries() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[[marketplace]]\nid = \"americanas\"\ncatalog_index = \"americanas_catalog\""
        )
        .unwrap();

        let config = load_config(file.path()).unwrap();
        assert_eq!(config.marketplace.len(), 1);
        assert_eq!(config.marketplace[0].id, "americanas");
        assert_eq!(
            config.marketplace[0].catalog_index.as_deref(),
            Some("americanas_catalog")
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[[marketplace]]\nid = \"x\"\nprice_queue = \"q\"").unwrap();

        assert!(matches!(load_config(file.path()), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_config(Path::new("/nonexistent/pageinfra.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}
