//! Configuration loading for macwatch.
//!
//! The pipeline's settings types live in `macwatch_core::config`; this crate
//! assembles them from a `.env` file, an optional TOML/JSON config file and
//! the operational environment variables, then applies guard rails that
//! repair out-of-range values and report them as warnings.

pub mod loader;
pub mod util;
pub mod validation;

pub use loader::{
    ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError,
};
pub use macwatch_core::config::PipelineConfig;
pub use validation::{ConfigWarning, ConfigWarnings};
