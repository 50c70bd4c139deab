//! Layered configuration loading: `.env`, then a TOML or JSON file, then
//! environment overrides, then guard-rail validation.

pub mod env;
pub mod error;

use std::path::{Path, PathBuf};

use macwatch_core::config::PipelineConfig;
use tracing::debug;

use crate::validation::{ConfigWarnings, validate};
use error::ConfigLoadError;

/// Searched in order when no explicit path is given.
pub const DEFAULT_CONFIG_PATHS: [&str; 3] =
    ["macwatch.toml", "config/macwatch.toml", "macwatch.json"];

/// Where the loader looks for its inputs.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoaderOptions {
    /// Explicit config file. Falls back to `$MACWATCH_CONFIG_PATH`, then the
    /// default search paths.
    pub config_path: Option<PathBuf>,
    /// Explicit env file. When absent `.env` in the working directory is
    /// loaded if present.
    pub env_file: Option<PathBuf>,
}

/// Result of a load: the validated config and what was repaired on the way.
#[derive(Debug, Clone)]
pub struct ConfigLoad {
    /// Effective configuration after all layers and guard rails.
    pub config: PipelineConfig,
    /// Values that were out of range and repaired.
    pub warnings: ConfigWarnings,
    /// File the base configuration came from, if any.
    pub source: Option<PathBuf>,
}

/// Builds a [`PipelineConfig`] from `.env`, a config file and the
/// environment.
#[derive(Debug, Clone, Default)]
pub struct ConfigLoader {
    options: ConfigLoaderOptions,
}

impl ConfigLoader {
    /// Loader with the default search paths.
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader with an explicit config or env file.
    pub fn with_options(options: ConfigLoaderOptions) -> Self {
        Self { options }
    }

    /// Load from the real process environment.
    pub fn load(&self) -> Result<ConfigLoad, ConfigLoadError> {
        self.load_with(|_| {})
    }

    /// Load from the real process environment, then apply `overrides`
    /// (command-line flags) before validation runs.
    pub fn load_with<O>(&self, overrides: O) -> Result<ConfigLoad, ConfigLoadError>
    where
        O: FnOnce(&mut PipelineConfig),
    {
        self.load_env_file()?;
        self.load_layers(|name| std::env::var(name).ok(), overrides)
    }

    /// Load with an explicit variable lookup, leaving the process
    /// environment untouched.
    pub fn load_with_env<F>(&self, lookup: F) -> Result<ConfigLoad, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.load_layers(lookup, |_| {})
    }

    /// File, then environment, then `overrides`, then guard rails.
    pub fn load_layers<F, O>(
        &self,
        lookup: F,
        overrides: O,
    ) -> Result<ConfigLoad, ConfigLoadError>
    where
        F: Fn(&str) -> Option<String>,
        O: FnOnce(&mut PipelineConfig),
    {
        let source = self.resolve_config_path(&lookup);
        let mut config = match &source {
            Some(path) => read_config_file(path)?,
            None => PipelineConfig::default(),
        };

        let mut warnings = ConfigWarnings::default();
        env::apply_overrides(&mut config, &lookup, &mut warnings);
        overrides(&mut config);
        validate(&mut config, &mut warnings);

        Ok(ConfigLoad {
            config,
            warnings,
            source,
        })
    }

    fn load_env_file(&self) -> Result<(), ConfigLoadError> {
        match &self.options.env_file {
            Some(path) => dotenvy::from_path(path).map_err(|err| {
                ConfigLoadError::EnvFile {
                    path: path.clone(),
                    message: err.to_string(),
                }
            }),
            None => {
                if let Ok(path) = dotenvy::dotenv() {
                    debug!(path = %path.display(), "loaded .env");
                }
                Ok(())
            }
        }
    }

    fn resolve_config_path<F>(&self, lookup: &F) -> Option<PathBuf>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = &self.options.config_path {
            return Some(path.clone());
        }
        if let Some(raw) = lookup(env::MACWATCH_CONFIG_PATH)
            && !raw.trim().is_empty()
        {
            return Some(PathBuf::from(raw.trim()));
        }
        DEFAULT_CONFIG_PATHS
            .iter()
            .map(PathBuf::from)
            .find(|candidate| candidate.is_file())
    }
}

/// Parse a config file, choosing the format by extension.
pub fn read_config_file(path: &Path) -> Result<PipelineConfig, ConfigLoadError> {
    let raw = std::fs::read_to_string(path).map_err(|source| {
        ConfigLoadError::Io {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    match extension.as_deref() {
        Some("toml") => {
            toml::from_str(&raw).map_err(|source| ConfigLoadError::Toml {
                path: path.to_path_buf(),
                source,
            })
        }
        Some("json") => {
            serde_json::from_str(&raw).map_err(|source| ConfigLoadError::Json {
                path: path.to_path_buf(),
                source,
            })
        }
        _ => Err(ConfigLoadError::UnsupportedFormat {
            path: path.to_path_buf(),
        }),
    }
}
