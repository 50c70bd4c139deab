//! Errors returned when loading configuration.

use std::path::PathBuf;

use thiserror::Error;

/// Reasons a configuration could not be loaded at all.
#[derive(Debug, Error)]
pub enum ConfigLoadError {
    /// Config file could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or type error.
    #[error("failed to parse TOML config {path}: {source}")]
    Toml {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// JSON syntax or type error.
    #[error("failed to parse JSON config {path}: {source}")]
    Json {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// Extension other than `.toml` or `.json`.
    #[error("unsupported config format for {path} (expected .toml or .json)")]
    UnsupportedFormat { path: PathBuf },

    /// Explicit env file could not be loaded.
    #[error("failed to load env file {path}: {message}")]
    EnvFile { path: PathBuf, message: String },
}
