use std::path::PathBuf;

use thiserror::Error;

/// A marketplace identifier with no registered namespace.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Marketplace '{marketplace}' is not registered. Valid options: {}", valid.join(", "))]
pub struct UnknownMarketplace {
    pub marketplace: String,
    pub valid: Vec<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{var} environment variable is required")]
    MissingEnv { var: &'static str },

    #[error("{var} must be {expected}, got '{value}'")]
    InvalidEnv {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("Invalid name '{name}' for {field} of marketplace '{marketplace}': use [a-z0-9_], not starting with a digit")]
    InvalidName {
        marketplace: String,
        field: &'static str,
        name: String,
    },

    #[error("Failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}
