//! Quicken Configuration
//!
//! Runtime tuning for the quicken interpreter, read from `quicken.toml`:
//! - `[specialization]`: adaptive rewriting switch and counters
//! - `[vm]`: call depth limit and per-opcode profiling
//! - `[monitoring]`: events subscribed by the CLI's tracing tool
//! - `[logging]`: default log filter
//!
//! # Configuration Hierarchy
//!
//! Later sources override earlier ones:
//! 1. Built-in defaults
//! 2. `quicken.toml` (found by walking up from the working directory)
//! 3. Environment variables (`QUICKEN_*`)
//! 4. CLI flags (applied by the caller)
//!
//! # Example
//!
//! ```no_run
//! use quicken_config::ConfigLoader;
//! use std::path::Path;
//!
//! let config = ConfigLoader::new().load_from_directory(Path::new(".")).unwrap();
//! println!("warmup = {}", config.settings.specialization.warmup);
//! ```

pub mod loader;
pub mod settings;

use std::path::PathBuf;
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {0}")]
    NotFound(PathBuf),

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Invalid TOML in {file}: {error}")]
    TomlParseError {
        file: PathBuf,
        error: toml::de::Error,
    },

    #[error("Invalid value for '{field}': {reason}")]
    InvalidValue { field: String, reason: String },
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

pub use loader::{Config, ConfigLoader, CONFIG_FILE};
pub use settings::{
    LoggingSettings, MonitoringSettings, QuickenConfig, SpecializationSettings, VmSettings,
};
