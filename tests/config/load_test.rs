//! Coverage for config file discovery and precedence.

use std::fs;
use std::path::Path;

use secret_injector::config::{InjectorConfig, CONFIG_PATH_VAR};

fn no_env(_: &str) -> Option<String> {
    None
}

fn write_config(dir: &Path, contents: &str) -> std::path::PathBuf {
    let path = dir.join("config.toml");
    fs::write(&path, contents).expect("config should be written");
    path
}

#[test]
fn explicit_path_is_loaded() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = write_config(
        dir.path(),
        r#"
[injector]
default_vault_variable = "DefaultVault"
resolve_concurrency = 3
"#,
    );

    let config = InjectorConfig::load(Some(&path), no_env).expect("config should load");
    assert_eq!(config.injector.default_vault_variable, "DefaultVault");
    assert_eq!(config.injector.resolve_concurrency, 3);
    assert_eq!(config.injector.file_mode, 0o444);
}

#[test]
fn path_from_environment_is_loaded() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = write_config(dir.path(), "[azure]\ndns_suffix = \"vault.azure.cn\"\n");
    let path_str = path.to_string_lossy().into_owned();

    let env = move |key: &str| (key == CONFIG_PATH_VAR).then(|| path_str.clone());
    let config = InjectorConfig::load(None, env).expect("config should load");
    assert_eq!(config.azure.dns_suffix, "vault.azure.cn");
}

#[test]
fn env_overrides_beat_file_values() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = write_config(dir.path(), "[injector]\nfile_mode = 0o440\n");

    let env = |key: &str| (key == "SECRET_INJECTOR_FILE_MODE").then(|| "0400".to_owned());
    let config = InjectorConfig::load(Some(&path), env).expect("config should load");
    assert_eq!(config.injector.file_mode, 0o400);
}

#[test]
fn missing_explicit_file_is_an_error() {
    let result = InjectorConfig::load(Some(Path::new("/nonexistent/secret-injector.toml")), no_env);
    assert!(result.is_err());
}

#[test]
fn malformed_file_is_an_error() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = write_config(dir.path(), "[injector\nfile_mode = ");

    let result = InjectorConfig::load(Some(&path), no_env);
    let message = match result {
        Ok(_) => panic!("malformed config should fail"),
        Err(err) => format!("{err:#}"),
    };
    assert!(message.contains("failed to parse config"));
}

#[test]
fn writable_file_mode_in_file_is_rejected() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let path = write_config(dir.path(), "[injector]\nfile_mode = 0o644\n");

    let config = InjectorConfig::load(Some(&path), no_env).expect("config should load");
    assert_eq!(config.injector.file_mode, 0o444);
}
