//! Settings stored in `quicken.toml`

use crate::{ConfigError, ConfigResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Largest backoff exponent the adaptive counters can hold.
pub const MAX_BACKOFF_LIMIT: u8 = 12;

/// Contents of `quicken.toml`. Every section and key is optional.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields)]
pub struct QuickenConfig {
    #[serde(default)]
    pub specialization: SpecializationSettings,

    #[serde(default)]
    pub vm: VmSettings,

    #[serde(default)]
    pub monitoring: MonitoringSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// `[specialization]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct SpecializationSettings {
    /// Rewrite hot instructions to specialized variants
    pub enabled: bool,

    /// Consecutive matching observations before a site is rewritten
    pub warmup: u16,

    /// Observations skipped after the first guard miss
    pub cooldown: u16,

    /// Cap on the exponential backoff exponent
    pub max_backoff: u8,
}

impl Default for SpecializationSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            warmup: 16,
            cooldown: 52,
            max_backoff: MAX_BACKOFF_LIMIT,
        }
    }
}

/// `[vm]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields, default)]
pub struct VmSettings {
    /// Call depth at which execution aborts with a recursion error
    pub max_frames: usize,

    /// Count executions per opcode
    pub profile: bool,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            max_frames: 1000,
            profile: false,
        }
    }
}

/// `[monitoring]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct MonitoringSettings {
    /// Event names, e.g. `["call", "line"]`
    pub events: Vec<String>,
}

/// `[logging]`
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(deny_unknown_fields, default)]
pub struct LoggingSettings {
    /// `tracing` filter directive, e.g. `"quicken::specialize=debug"`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl QuickenConfig {
    /// Load and validate a configuration file
    pub fn load_from_file(path: &Path) -> ConfigResult<Self> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.to_path_buf()));
        }
        let content = std::fs::read_to_string(path)?;
        let config: QuickenConfig =
            toml::from_str(&content).map_err(|error| ConfigError::TomlParseError {
                file: path.to_path_buf(),
                error,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Parse and validate configuration text (no file involved)
    pub fn parse(content: &str) -> ConfigResult<Self> {
        let config: QuickenConfig =
            toml::from_str(content).map_err(|error| ConfigError::TomlParseError {
                file: "<string>".into(),
                error,
            })?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges
    pub fn validate(&self) -> ConfigResult<()> {
        let settings = &self.specialization;
        if settings.warmup == 0 {
            return Err(invalid("specialization.warmup", "must be at least 1"));
        }
        if settings.max_backoff > MAX_BACKOFF_LIMIT {
            return Err(invalid(
                "specialization.max_backoff",
                format!("must be at most {}", MAX_BACKOFF_LIMIT),
            ));
        }
        if self.vm.max_frames == 0 {
            return Err(invalid("vm.max_frames", "must be at least 1"));
        }
        if let Some(event) = self.monitoring.events.iter().find(|e| e.trim().is_empty()) {
            return Err(invalid(
                "monitoring.events",
                format!("empty event name '{}'", event),
            ));
        }
        if matches!(&self.logging.filter, Some(filter) if filter.trim().is_empty()) {
            return Err(invalid("logging.filter", "must not be empty"));
        }
        Ok(())
    }

    /// Serialize back to TOML text
    pub fn to_toml(&self) -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(self)
    }
}

pub(crate) fn invalid(field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::InvalidValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rstest::rstest;

    #[test]
    fn test_empty_file_is_all_defaults() {
        assert_eq!(QuickenConfig::parse("").unwrap(), QuickenConfig::default());
    }

    #[test]
    fn test_parse_full_config() {
        let config = QuickenConfig::parse(
            r#"
[specialization]
enabled = false
warmup = 8
cooldown = 20
max_backoff = 4

[vm]
max_frames = 250
profile = true

[monitoring]
events = ["call", "line"]

[logging]
filter = "quicken::specialize=debug"
"#,
        )
        .unwrap();

        assert!(!config.specialization.enabled);
        assert_eq!(config.specialization.warmup, 8);
        assert_eq!(config.specialization.cooldown, 20);
        assert_eq!(config.specialization.max_backoff, 4);
        assert_eq!(config.vm.max_frames, 250);
        assert!(config.vm.profile);
        assert_eq!(config.monitoring.events, vec!["call", "line"]);
        assert_eq!(
            config.logging.filter.as_deref(),
            Some("quicken::specialize=debug")
        );
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config = QuickenConfig::parse("[specialization]\nwarmup = 4\n").unwrap();
        assert_eq!(config.specialization.warmup, 4);
        assert_eq!(config.specialization.cooldown, 52);
        assert!(config.specialization.enabled);
    }

    #[rstest]
    #[case("[specialization]\nwarmpu = 3\n")]
    #[case("[jit]\nenabled = true\n")]
    #[case("[vm]\nmax_frames = \"lots\"\n")]
    fn test_rejects_malformed(#[case] content: &str) {
        assert!(matches!(
            QuickenConfig::parse(content),
            Err(ConfigError::TomlParseError { .. })
        ));
    }

    #[rstest]
    #[case("[specialization]\nwarmup = 0\n", "specialization.warmup")]
    #[case("[specialization]\nmax_backoff = 13\n", "specialization.max_backoff")]
    #[case("[vm]\nmax_frames = 0\n", "vm.max_frames")]
    #[case("[monitoring]\nevents = [\"call\", \" \"]\n", "monitoring.events")]
    #[case("[logging]\nfilter = \"\"\n", "logging.filter")]
    fn test_validation_names_the_field(#[case] content: &str, #[case] expected: &str) {
        match QuickenConfig::parse(content) {
            Err(ConfigError::InvalidValue { field, .. }) => assert_eq!(field, expected),
            other => panic!("expected InvalidValue, got {:?}", other),
        }
    }

    #[test]
    fn test_toml_roundtrip() {
        let mut config = QuickenConfig::default();
        config.vm.profile = true;
        config.monitoring.events = vec!["branch".into()];
        let text = config.to_toml().unwrap();
        assert_eq!(QuickenConfig::parse(&text).unwrap(), config);
    }
}
