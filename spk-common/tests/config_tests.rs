//! Unit tests for configuration and graceful degradation
//!
//! Tests that manipulate SPK_ROOT_FOLDER or SPK_ROOT are marked with #[serial]
//! so they never race on the process environment.

use serial_test::serial;
use spk_common::config::{
    load_toml_config, write_toml_config, CompiledDefaults, LoggingConfig, RootFolderInitializer,
    RootFolderResolver, TomlConfig,
};
use std::env;
use std::path::PathBuf;
use tempfile::TempDir;

#[test]
fn test_compiled_defaults_for_current_platform() {
    let defaults = CompiledDefaults::for_current_platform();

    assert!(!defaults.root_folder.as_os_str().is_empty());
    assert!(defaults.root_folder.to_string_lossy().contains("spk"));
    assert_eq!(defaults.log_level, "info");
    assert!(defaults.log_file.is_none());
}

#[test]
#[serial]
fn test_resolver_env_var_root_folder() {
    env::remove_var("SPK_ROOT");
    env::set_var("SPK_ROOT_FOLDER", "/tmp/spk-test-env-folder");

    let root_folder = RootFolderResolver::new("test-module").resolve();
    assert_eq!(root_folder, PathBuf::from("/tmp/spk-test-env-folder"));

    env::remove_var("SPK_ROOT_FOLDER");
}

#[test]
#[serial]
fn test_resolver_env_var_root() {
    env::remove_var("SPK_ROOT_FOLDER");
    env::set_var("SPK_ROOT", "/tmp/spk-test-env-root");

    let root_folder = RootFolderResolver::new("test-module").resolve();
    assert_eq!(root_folder, PathBuf::from("/tmp/spk-test-env-root"));

    env::remove_var("SPK_ROOT");
}

#[test]
#[serial]
fn test_resolver_root_folder_takes_precedence() {
    env::set_var("SPK_ROOT_FOLDER", "/tmp/spk-priority-1");
    env::set_var("SPK_ROOT", "/tmp/spk-priority-2");

    let root_folder = RootFolderResolver::new("test-module").resolve();
    assert_eq!(root_folder, PathBuf::from("/tmp/spk-priority-1"));

    env::remove_var("SPK_ROOT_FOLDER");
    env::remove_var("SPK_ROOT");
}

#[test]
#[serial]
fn test_resolver_missing_config_file_uses_default() {
    env::remove_var("SPK_ROOT_FOLDER");
    env::remove_var("SPK_ROOT");

    let resolver = RootFolderResolver::new("nonexistent-test-module-12345");
    assert!(resolver.config_file_path().is_none());

    let root_folder = resolver.resolve();
    assert_eq!(root_folder, CompiledDefaults::for_current_platform().root_folder);
}

#[test]
fn test_initializer_layout() {
    let root = PathBuf::from("/tmp/spk-test-root");
    let initializer = RootFolderInitializer::new(root.clone());

    assert_eq!(initializer.database_path(), root.join("spk.db"));
    assert_eq!(initializer.uploads_dir(), root.join("uploads"));
}

#[test]
fn test_initializer_creates_nested_directories_idempotently() {
    let temp_dir = TempDir::new().unwrap();
    let root = temp_dir.path().join("level1").join("level2");
    let initializer = RootFolderInitializer::new(root.clone());

    assert!(initializer.ensure_directory_exists().is_ok());
    assert!(initializer.ensure_directory_exists().is_ok());
    assert!(root.is_dir());
    assert!(!initializer.database_exists());
}

#[test]
fn test_toml_roundtrip_through_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("spk-sa.toml");

    let mut config = TomlConfig {
        root_folder: Some(PathBuf::from("/data/spk")),
        logging: LoggingConfig::default(),
        ml_service_url: Some("http://ml.internal:9000".to_string()),
        max_subscribers_per_session: Some(4),
        ..Default::default()
    };
    config.stage_timeouts_ms.insert("questions".to_string(), 30_000);

    write_toml_config(&config, &path).unwrap();
    let parsed = load_toml_config(&path).unwrap();

    assert_eq!(parsed, config);
}

#[test]
fn test_partial_toml_fills_defaults() {
    let toml_str = r#"
        root_folder = "/data/spk"
        [logging]
        level = "debug"
        [stage_timeouts_ms]
        transcription = 120000
    "#;

    let config: TomlConfig = toml::from_str(toml_str).unwrap();
    assert_eq!(config.root_folder, Some(PathBuf::from("/data/spk")));
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.stage_timeouts_ms.get("transcription"), Some(&120_000));
    assert_eq!(config.ml_service_url, None);
    assert_eq!(config.auto_start_on_upload, None);
}

#[test]
fn test_invalid_toml_is_config_error() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("broken.toml");
    std::fs::write(&path, "root_folder = [unclosed").unwrap();

    let err = load_toml_config(&path).unwrap_err();
    assert!(matches!(err, spk_common::Error::Config(_)));
}
