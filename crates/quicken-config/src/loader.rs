//! Configuration Loader
//!
//! Finds `quicken.toml` and layers environment overrides on top of it.

use crate::settings::{invalid, QuickenConfig};
use crate::ConfigResult;
use std::env;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// File name searched for in the working directory and its ancestors
pub const CONFIG_FILE: &str = "quicken.toml";

/// Environment variables read by [`ConfigLoader`]
pub const ENV_SPECIALIZE: &str = "QUICKEN_SPECIALIZE";
pub const ENV_WARMUP: &str = "QUICKEN_WARMUP";
pub const ENV_MAX_FRAMES: &str = "QUICKEN_MAX_FRAMES";
pub const ENV_LOG: &str = "QUICKEN_LOG";

/// Configuration loader
///
/// Precedence, lowest first:
/// 1. Defaults
/// 2. `quicken.toml`
/// 3. Environment variables (`QUICKEN_*`)
/// 4. CLI flags (handled by caller)
#[derive(Debug, Default)]
pub struct ConfigLoader {
    /// Skip environment overrides
    ignore_env: bool,
    /// Last directory searched when walking up
    boundary: Option<PathBuf>,
}

/// Loaded configuration
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Config {
    pub settings: QuickenConfig,

    /// File the settings came from, if any
    pub source: Option<PathBuf>,
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Loader that does not consult `QUICKEN_*` variables
    pub fn without_env() -> Self {
        Self {
            ignore_env: true,
            boundary: None,
        }
    }

    /// Do not search above `dir` when walking up
    pub fn stop_at(mut self, dir: impl Into<PathBuf>) -> Self {
        self.boundary = Some(dir.into());
        self
    }

    /// Load configuration starting from the given directory
    ///
    /// Walks up the directory tree to the first `quicken.toml`. No file
    /// anywhere means defaults.
    pub fn load_from_directory(&self, start_dir: &Path) -> ConfigResult<Config> {
        let found = match &self.boundary {
            Some(boundary) => find_config_file_within(start_dir, boundary),
            None => find_config_file(start_dir),
        };
        let (source, settings) = match found {
            Some(path) => {
                let settings = QuickenConfig::load_from_file(&path)?;
                (Some(path), settings)
            }
            None => (None, QuickenConfig::default()),
        };
        self.finish(settings, source)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(&self, config_path: &Path) -> ConfigResult<Config> {
        let settings = QuickenConfig::load_from_file(config_path)?;
        self.finish(settings, Some(config_path.to_path_buf()))
    }

    fn finish(&self, settings: QuickenConfig, source: Option<PathBuf>) -> ConfigResult<Config> {
        if let Some(path) = &source {
            tracing::debug!(target: "quicken::config", path = %path.display(), "loaded configuration file");
        }
        let settings = if self.ignore_env {
            settings
        } else {
            apply_env_overrides(settings)?
        };
        settings.validate()?;
        Ok(Config { settings, source })
    }
}

/// Nearest `quicken.toml` at or above `start_dir`
pub fn find_config_file(start_dir: &Path) -> Option<PathBuf> {
    start_dir
        .ancestors()
        .map(|dir| dir.join(CONFIG_FILE))
        .find(|candidate| candidate.is_file())
}

/// Like [`find_config_file`], but never looks above `boundary`
pub fn find_config_file_within(start_dir: &Path, boundary: &Path) -> Option<PathBuf> {
    for dir in start_dir.ancestors() {
        let candidate = dir.join(CONFIG_FILE);
        if candidate.is_file() {
            return Some(candidate);
        }
        if dir == boundary {
            break;
        }
    }
    None
}

/// Apply `QUICKEN_*` environment variables
pub fn apply_env_overrides(mut config: QuickenConfig) -> ConfigResult<QuickenConfig> {
    if let Ok(value) = env::var(ENV_SPECIALIZE) {
        config.specialization.enabled = parse_bool(ENV_SPECIALIZE, &value)?;
        tracing::debug!(target: "quicken::config", enabled = config.specialization.enabled, "{} override", ENV_SPECIALIZE);
    }

    if let Ok(value) = env::var(ENV_WARMUP) {
        config.specialization.warmup = parse_number(ENV_WARMUP, &value)?;
        tracing::debug!(target: "quicken::config", warmup = config.specialization.warmup, "{} override", ENV_WARMUP);
    }

    if let Ok(value) = env::var(ENV_MAX_FRAMES) {
        config.vm.max_frames = parse_number(ENV_MAX_FRAMES, &value)?;
        tracing::debug!(target: "quicken::config", max_frames = config.vm.max_frames, "{} override", ENV_MAX_FRAMES);
    }

    if let Ok(value) = env::var(ENV_LOG) {
        if !value.trim().is_empty() {
            tracing::debug!(target: "quicken::config", filter = %value, "{} override", ENV_LOG);
            config.logging.filter = Some(value);
        }
    }

    Ok(config)
}

fn parse_bool(name: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(invalid(name, format!("expected a boolean, found '{}'", value))),
    }
}

fn parse_number<T: FromStr>(name: &str, value: &str) -> ConfigResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| invalid(name, format!("expected a number, found '{}'", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConfigError;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    fn create_config_file(dir: &Path, content: &str) -> PathBuf {
        let config_path = dir.join(CONFIG_FILE);
        fs::write(&config_path, content).unwrap();
        config_path
    }

    fn clear_env() {
        for name in [ENV_SPECIALIZE, ENV_WARMUP, ENV_MAX_FRAMES, ENV_LOG] {
            env::remove_var(name);
        }
    }

    #[test]
    fn test_find_config_in_parent() {
        let temp_dir = TempDir::new().unwrap();
        let path = create_config_file(temp_dir.path(), "[vm]\nmax_frames = 64\n");
        let nested = temp_dir.path().join("a").join("b");
        fs::create_dir_all(&nested).unwrap();

        let config = ConfigLoader::without_env()
            .stop_at(temp_dir.path())
            .load_from_directory(&nested)
            .unwrap();
        assert_eq!(config.settings.vm.max_frames, 64);
        assert_eq!(config.source, Some(path));
    }

    #[test]
    fn test_no_config_means_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config = ConfigLoader::without_env()
            .stop_at(temp_dir.path())
            .load_from_directory(temp_dir.path())
            .unwrap();
        assert_eq!(config.settings, QuickenConfig::default());
        assert_eq!(config.source, None);
    }

    #[test]
    fn test_search_stops_at_boundary() {
        let temp_dir = TempDir::new().unwrap();
        create_config_file(temp_dir.path(), "[vm]\nmax_frames = 64\n");
        let project = temp_dir.path().join("project");
        let nested = project.join("src");
        fs::create_dir_all(&nested).unwrap();

        assert_eq!(find_config_file_within(&nested, &project), None);
        let config = ConfigLoader::without_env()
            .stop_at(&project)
            .load_from_directory(&nested)
            .unwrap();
        assert_eq!(config.settings, QuickenConfig::default());

        // The boundary directory itself is still searched.
        let inner = create_config_file(&project, "[vm]\nmax_frames = 8\n");
        assert_eq!(find_config_file_within(&nested, &project), Some(inner));
    }

    #[test]
    #[serial]
    fn test_env_overrides_file() {
        clear_env();
        let temp_dir = TempDir::new().unwrap();
        create_config_file(
            temp_dir.path(),
            "[specialization]\nenabled = true\nwarmup = 8\n",
        );

        env::set_var(ENV_SPECIALIZE, "off");
        env::set_var(ENV_WARMUP, "3");
        env::set_var(ENV_LOG, "quicken::vm=trace");

        let config = ConfigLoader::new()
            .load_from_directory(temp_dir.path())
            .unwrap();
        clear_env();

        assert!(!config.settings.specialization.enabled);
        assert_eq!(config.settings.specialization.warmup, 3);
        assert_eq!(
            config.settings.logging.filter.as_deref(),
            Some("quicken::vm=trace")
        );
    }

    #[test]
    #[serial]
    fn test_bad_env_value_names_the_variable() {
        clear_env();
        env::set_var(ENV_MAX_FRAMES, "many");
        let result = apply_env_overrides(QuickenConfig::default());
        clear_env();

        match result {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, ENV_MAX_FRAMES),
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    #[serial]
    fn test_env_values_are_validated() {
        clear_env();
        env::set_var(ENV_WARMUP, "0");
        let temp_dir = TempDir::new().unwrap();
        let result = ConfigLoader::new()
            .stop_at(temp_dir.path())
            .load_from_directory(temp_dir.path());
        clear_env();

        assert!(matches!(
            result,
            Err(ConfigError::InvalidValue { field, .. }) if field == "specialization.warmup"
        ));
    }
}
