//! Integration tests for hivemap-config
//!
//! These tests verify the full config loading pipeline with real file system operations.

use hivemap_config::{Config, ConfigError};
use tempfile::tempdir;

/// Test config loading from a real global config file
#[test]
fn test_load_global_config_from_file() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("global.toml");
    std::fs::write(
        &global,
        r#"
[views]
view_size = 8192
max_views_per_file = 32

[host]
max_mappings = 100
flush_on_unpin = false

[logging]
level = "debug"
"#,
    )
    .unwrap();

    let config = Config::load_from(Some(&global), None).unwrap();
    assert_eq!(config.views.view_size, 8192);
    assert_eq!(config.views.max_views_per_file, 32);
    assert_eq!(config.views.page_size, 4096, "untouched field keeps default");
    assert_eq!(config.host.max_mappings, Some(100));
    assert!(!config.host.flush_on_unpin);
    assert_eq!(config.logging.level, "debug");
}

/// Test config hierarchy: project config overrides global field by field
#[test]
fn test_config_hierarchy_project_overrides_global() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("global.toml");
    let project = temp.path().join("project.toml");
    std::fs::write(
        &global,
        "[views]\nview_size = 8192\nmax_views_per_file = 32\n\n[notify]\nsync_wait_ms = 10\n",
    )
    .unwrap();
    std::fs::write(&project, "[views]\nmax_views_per_file = 4\n").unwrap();

    let config = Config::load_from(Some(&global), Some(&project)).unwrap();
    assert_eq!(config.views.view_size, 8192);
    assert_eq!(config.views.max_views_per_file, 4);
    assert_eq!(config.notify.sync_wait_ms, 10);
}

#[test]
fn test_missing_files_yield_defaults() {
    let temp = tempdir().unwrap();
    let config = Config::load_from(
        Some(&temp.path().join("nope.toml")),
        Some(&temp.path().join("also-nope.toml")),
    )
    .unwrap();
    assert_eq!(config.views, hivemap_config::ViewConfig::default());
}

#[test]
fn test_malformed_toml_is_reported() {
    let temp = tempdir().unwrap();
    let global = temp.path().join("bad.toml");
    std::fs::write(&global, "[views\nview_size = ").unwrap();

    let err = Config::load_from(Some(&global), None).unwrap_err();
    assert!(matches!(err, ConfigError::Toml(_)));
}

#[test]
fn test_default_toml_parses_back() {
    let toml_str = Config::default_toml();
    let parsed: Config = toml::from_str(&toml_str).unwrap();
    assert_eq!(parsed.views, Config::default().views);
    assert_eq!(parsed.notify, Config::default().notify);
}
