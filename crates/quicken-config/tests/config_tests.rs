//! Configuration loading tests

use pretty_assertions::assert_eq;
use quicken_config::{Config, ConfigError, ConfigLoader, QuickenConfig, CONFIG_FILE};
use rstest::rstest;
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

#[test]
fn test_load_from_specific_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("tuning.toml");
    fs::write(&path, "[specialization]\ncooldown = 7\n").unwrap();

    let config = ConfigLoader::without_env().load_from_file(&path).unwrap();
    assert_eq!(config.settings.specialization.cooldown, 7);
    assert_eq!(config.source.as_deref(), Some(path.as_path()));
}

#[test]
fn test_missing_file_is_not_found() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join(CONFIG_FILE);
    let err = ConfigLoader::without_env().load_from_file(&path).unwrap_err();
    assert!(matches!(err, ConfigError::NotFound(p) if p == path));
}

#[test]
fn test_parse_error_names_the_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join(CONFIG_FILE);
    fs::write(&path, "[vm\nmax_frames = 3\n").unwrap();

    let err = ConfigLoader::without_env()
        .load_from_directory(temp_dir.path())
        .unwrap_err();
    assert!(err.to_string().contains(CONFIG_FILE), "{err}");
}

#[test]
fn test_nearest_file_wins() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(temp_dir.path().join(CONFIG_FILE), "[vm]\nmax_frames = 10\n").unwrap();
    let inner = temp_dir.path().join("inner");
    fs::create_dir(&inner).unwrap();
    fs::write(inner.join(CONFIG_FILE), "[vm]\nmax_frames = 20\n").unwrap();

    let config = ConfigLoader::without_env()
        .stop_at(temp_dir.path())
        .load_from_directory(&inner)
        .unwrap();
    assert_eq!(config.settings.vm.max_frames, 20);
}

#[rstest]
#[case("1", true)]
#[case("yes", true)]
#[case("FALSE", false)]
#[case("0", false)]
#[serial]
fn test_specialize_switch(#[case] value: &str, #[case] expected: bool) {
    let temp_dir = TempDir::new().unwrap();
    std::env::set_var("QUICKEN_SPECIALIZE", value);
    let config = ConfigLoader::new()
        .stop_at(temp_dir.path())
        .load_from_directory(temp_dir.path());
    std::env::remove_var("QUICKEN_SPECIALIZE");

    assert_eq!(config.unwrap().settings.specialization.enabled, expected);
}

#[test]
fn test_default_config_has_no_source() {
    let config = Config::default();
    assert_eq!(config.source, None);
    assert_eq!(config.settings, QuickenConfig::default());
    assert_eq!(config.settings.specialization.warmup, 16);
    assert_eq!(config.settings.vm.max_frames, 1000);
}
