//! Configuration loading.
//!
//! The injector is configured almost entirely through its own environment.
//! An optional TOML file tunes the grammar and the Azure endpoints.
//!
//! Precedence: `SECRET_INJECTOR_*` env vars > config file > defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::parser::{DEFAULT_VAULT_VARIABLE, MOUNT_PATH_PREFIX, SECRET_NAME_PREFIX};

/// Config file read when neither `--config` nor `SECRET_INJECTOR_CONFIG` is given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/secret-injector/config.toml";

/// Env var naming an explicit config file.
pub const CONFIG_PATH_VAR: &str = "SECRET_INJECTOR_CONFIG";

/// Final mode of secret files when the configured one is unusable.
pub const DEFAULT_FILE_MODE: u32 = 0o444;

/// Upper bound on `resolve_concurrency`.
pub const MAX_RESOLVE_CONCURRENCY: usize = 64;

const DEFAULT_VAULT_VARIABLE_VAR: &str = "SECRET_INJECTOR_DEFAULT_VAULT_VARIABLE";
const SECRET_NAME_PREFIX_VAR: &str = "SECRET_INJECTOR_SECRET_NAME_PREFIX";
const MOUNT_PATH_PREFIX_VAR: &str = "SECRET_INJECTOR_MOUNT_PATH_PREFIX";
const FILE_MODE_VAR: &str = "SECRET_INJECTOR_FILE_MODE";
const RESOLVE_CONCURRENCY_VAR: &str = "SECRET_INJECTOR_RESOLVE_CONCURRENCY";
const AZURE_DNS_SUFFIX_VAR: &str = "SECRET_INJECTOR_AZURE_DNS_SUFFIX";
const AZURE_API_VERSION_VAR: &str = "SECRET_INJECTOR_AZURE_API_VERSION";
const AZURE_AUTHORITY_HOST_VAR: &str = "SECRET_INJECTOR_AZURE_AUTHORITY_HOST";
const AZURE_IMDS_ENDPOINT_VAR: &str = "SECRET_INJECTOR_AZURE_IMDS_ENDPOINT";
const AZURE_TIMEOUT_SECS_VAR: &str = "SECRET_INJECTOR_AZURE_TIMEOUT_SECS";

/// Env vars that configure the injector itself. They are never placeholders.
pub const SETTING_VARS: &[&str] = &[
    CONFIG_PATH_VAR,
    crate::logging::LOG_FORMAT_VAR,
    DEFAULT_VAULT_VARIABLE_VAR,
    SECRET_NAME_PREFIX_VAR,
    MOUNT_PATH_PREFIX_VAR,
    FILE_MODE_VAR,
    RESOLVE_CONCURRENCY_VAR,
    AZURE_DNS_SUFFIX_VAR,
    AZURE_API_VERSION_VAR,
    AZURE_AUTHORITY_HOST_VAR,
    AZURE_IMDS_ENDPOINT_VAR,
    AZURE_TIMEOUT_SECS_VAR,
];

/// Returns `true` when `name` is one of [`SETTING_VARS`], ignoring case.
pub fn is_setting_var(name: &str) -> bool {
    let name = name.trim();
    SETTING_VARS.iter().any(|var| var.eq_ignore_ascii_case(name))
}

/// Top-level configuration, built once at startup and passed by reference.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct InjectorConfig {
    /// Grammar and materialization settings (`[injector]`).
    pub injector: InjectorSection,
    /// Azure Key Vault client settings (`[azure]`).
    pub azure: AzureSection,
}

/// `[injector]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InjectorSection {
    /// Reserved variable holding the default vault name.
    pub default_vault_variable: String,
    /// Prefix of file-secret name declarations.
    pub secret_name_prefix: String,
    /// Prefix of file-secret mount-path declarations.
    pub mount_path_prefix: String,
    /// Final permission bits of secret files. Write bits are rejected.
    pub file_mode: u32,
    /// Maximum secret lookups in flight, at most [`MAX_RESOLVE_CONCURRENCY`].
    /// `1` keeps the pipeline sequential.
    pub resolve_concurrency: usize,
}

impl Default for InjectorSection {
    fn default() -> Self {
        Self {
            default_vault_variable: DEFAULT_VAULT_VARIABLE.to_owned(),
            secret_name_prefix: SECRET_NAME_PREFIX.to_owned(),
            mount_path_prefix: MOUNT_PATH_PREFIX.to_owned(),
            file_mode: DEFAULT_FILE_MODE,
            resolve_concurrency: 1,
        }
    }
}

/// `[azure]` section.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AzureSection {
    /// DNS suffix appended to bare vault names.
    pub dns_suffix: String,
    /// Key Vault REST API version.
    pub api_version: String,
    /// Microsoft Entra authority used for client-credential tokens.
    pub authority_host: String,
    /// Token audience for Key Vault.
    pub resource: String,
    /// Managed identity token endpoint.
    pub imds_endpoint: String,
    /// Per-request HTTP timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for AzureSection {
    fn default() -> Self {
        Self {
            dns_suffix: "vault.azure.net".to_owned(),
            api_version: "7.4".to_owned(),
            authority_host: "https://login.microsoftonline.com".to_owned(),
            resource: "https://vault.azure.net".to_owned(),
            imds_endpoint: "http://169.254.169.254/metadata/identity/oauth2/token".to_owned(),
            request_timeout_secs: 30,
        }
    }
}

impl InjectorConfig {
    /// Load configuration from an optional file plus environment overrides.
    ///
    /// An explicit `path` must exist. Without one, `$SECRET_INJECTOR_CONFIG`
    /// is tried, then [`DEFAULT_CONFIG_PATH`]; a missing default file yields
    /// defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly named file cannot be read, or any
    /// file that exists cannot be parsed.
    pub fn load(path: Option<&Path>, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let explicit = path
            .map(Path::to_path_buf)
            .or_else(|| env(CONFIG_PATH_VAR).map(PathBuf::from));

        let mut config = match explicit {
            Some(path) => Self::load_from_file(&path)?,
            None => Self::load_default_file(Path::new(DEFAULT_CONFIG_PATH))?,
        };
        config.apply_overrides(env);
        Ok(config)
    }

    /// Parse the default config file; a missing file yields defaults.
    fn load_default_file(path: &Path) -> Result<Self> {
        match std::fs::read_to_string(path) {
            Ok(contents) => Self::parse_file(path, &contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!("no config file found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "failed to read config at {}: {e}",
                path.display()
            )),
        }
    }

    /// Parse a TOML config file, no env overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config at {}", path.display()))?;
        Self::parse_file(path, &contents)
    }

    fn parse_file(path: &Path, contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .with_context(|| format!("failed to parse config at {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function so tests never touch the process environment.
    pub fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        // Injector.
        if let Some(v) = env(DEFAULT_VAULT_VARIABLE_VAR) {
            self.injector.default_vault_variable = v;
        }
        if let Some(v) = env(SECRET_NAME_PREFIX_VAR) {
            self.injector.secret_name_prefix = v;
        }
        if let Some(v) = env(MOUNT_PATH_PREFIX_VAR) {
            self.injector.mount_path_prefix = v;
        }
        if let Some(v) = env(FILE_MODE_VAR) {
            match parse_mode(&v) {
                Some(mode) => self.injector.file_mode = mode,
                None => tracing::warn!(
                    var = FILE_MODE_VAR,
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }
        if let Some(v) = env(RESOLVE_CONCURRENCY_VAR) {
            match v.trim().parse::<usize>() {
                Ok(n) if n > 0 => self.injector.resolve_concurrency = n,
                _ => tracing::warn!(
                    var = RESOLVE_CONCURRENCY_VAR,
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        // Azure.
        if let Some(v) = env(AZURE_DNS_SUFFIX_VAR) {
            self.azure.dns_suffix = v;
        }
        if let Some(v) = env(AZURE_API_VERSION_VAR) {
            self.azure.api_version = v;
        }
        if let Some(v) = env(AZURE_AUTHORITY_HOST_VAR) {
            self.azure.authority_host = v;
        }
        if let Some(v) = env(AZURE_IMDS_ENDPOINT_VAR) {
            self.azure.imds_endpoint = v;
        }
        if let Some(v) = env(AZURE_TIMEOUT_SECS_VAR) {
            match v.trim().parse() {
                Ok(n) => self.azure.request_timeout_secs = n,
                Err(_) => tracing::warn!(
                    var = AZURE_TIMEOUT_SECS_VAR,
                    value = %v,
                    "ignoring invalid env override"
                ),
            }
        }

        if self.injector.resolve_concurrency == 0 {
            tracing::warn!("resolve_concurrency must be at least 1, using 1");
            self.injector.resolve_concurrency = 1;
        }
        if self.injector.resolve_concurrency > MAX_RESOLVE_CONCURRENCY {
            tracing::warn!(
                requested = self.injector.resolve_concurrency,
                max = MAX_RESOLVE_CONCURRENCY,
                "resolve_concurrency too large, capping"
            );
            self.injector.resolve_concurrency = MAX_RESOLVE_CONCURRENCY;
        }
        if !is_read_only_mode(self.injector.file_mode) {
            tracing::warn!(
                mode = %format!("{:o}", self.injector.file_mode),
                "file_mode must be read-only, using 0444"
            );
            self.injector.file_mode = DEFAULT_FILE_MODE;
        }
    }
}

/// A valid permission value with no write bit for anyone.
pub fn is_read_only_mode(mode: u32) -> bool {
    mode <= 0o7777 && mode & 0o222 == 0
}

/// Parse an octal permission string such as `0444`, `0o440` or `400`.
/// Modes granting write access are rejected.
fn parse_mode(raw: &str) -> Option<u32> {
    let trimmed = raw.trim();
    let digits = trimmed.strip_prefix("0o").unwrap_or(trimmed);
    let mode = u32::from_str_radix(digits, 8).ok()?;
    is_read_only_mode(mode).then_some(mode)
}
