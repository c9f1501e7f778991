//! Configuration loading and graceful degradation
//!
//! Uses serial_test: tests that touch TMON_CONFIG run one at a time.

use serial_test::serial;
use std::env;
use std::path::PathBuf;
use std::io::Write;
use tempfile::NamedTempFile;
use tmon_common::config::{load_toml_config, resolve_config_path, TomlConfig, CONFIG_ENV_VAR};
use tmon_common::Error;

#[test]
#[serial]
fn test_env_var_used_when_no_cli_argument() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");

    let resolved = resolve_config_path(None, CONFIG_ENV_VAR);
    assert_eq!(resolved, Some(PathBuf::from("/tmp/from-env.toml")));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_cli_argument_beats_env_var() {
    env::set_var(CONFIG_ENV_VAR, "/tmp/from-env.toml");

    let cli = std::path::PathBuf::from("/tmp/from-cli.toml");
    let resolved = resolve_config_path(Some(&cli), CONFIG_ENV_VAR);
    assert_eq!(resolved, Some(cli));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
#[serial]
fn test_blank_env_var_ignored() {
    env::set_var(CONFIG_ENV_VAR, "   ");

    let resolved = resolve_config_path(None, CONFIG_ENV_VAR);
    assert_ne!(resolved, Some(PathBuf::from("   ")));

    env::remove_var(CONFIG_ENV_VAR);
}

#[test]
fn test_partial_toml_fills_defaults() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "database_path = \"/srv/tmon/tmon.db\"").unwrap();

    let config: TomlConfig = load_toml_config(Some(file.path())).unwrap();
    assert_eq!(config.database_path, Some(PathBuf::from("/srv/tmon/tmon.db")));
    assert_eq!(config.logging.level, "info");
    assert!(config.schema_path.is_none());
}

#[test]
fn test_logging_section_parsed() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "[logging]\nlevel = \"debug\"\nfile = \"/var/log/tmon.log\"").unwrap();

    let config: TomlConfig = load_toml_config(Some(file.path())).unwrap();
    assert_eq!(config.logging.level, "debug");
    assert_eq!(config.logging.file, Some(PathBuf::from("/var/log/tmon.log")));
}

#[test]
fn test_invalid_toml_is_config_error() {
    let mut file = NamedTempFile::new().unwrap();
    writeln!(file, "database_path = [not valid").unwrap();

    let result: Result<TomlConfig, _> = load_toml_config(Some(file.path()));
    assert!(matches!(result, Err(Error::Config(_))));
}

#[test]
fn test_missing_explicit_file_is_config_error() {
    let result: Result<TomlConfig, _> =
        load_toml_config(Some(std::path::Path::new("/nonexistent/tmon/watcher.toml")));
    assert!(matches!(result, Err(Error::Config(_))));
}
