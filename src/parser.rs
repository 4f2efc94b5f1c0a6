//! Reference parsing.
//!
//! One tokenizer for the placeholder grammar:
//!
//! - `NAME=secret@vault` is an inline reference. The value is split on its
//!   first `@`; anything after that belongs to the vault alias.
//! - `secret_injector_secret_name_<key>=secret[@vault]` and
//!   `secret_injector_mount_path_<key>=/dir` are the two halves of a file
//!   secret, paired by `<key>` (case-insensitive, trimmed).
//! - `AzureKeyVault=<vault>` names the default vault.
//!
//! The injector's own `SECRET_INJECTOR_*` settings and everything else are
//! passthrough.

use std::collections::HashMap;
use std::path::PathBuf;

use tracing::debug;

use crate::config::{is_setting_var, InjectorConfig};
use crate::env::{EnvSnapshot, EnvironmentEntry};

/// Reserved variable naming the default vault.
pub const DEFAULT_VAULT_VARIABLE: &str = "AzureKeyVault";

/// Prefix of a file-secret name declaration.
pub const SECRET_NAME_PREFIX: &str = "secret_injector_secret_name_";

/// Prefix of a file-secret mount-path declaration.
pub const MOUNT_PATH_PREFIX: &str = "secret_injector_mount_path_";

/// An inline `NAME=secret@vault` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultReference {
    /// Variable that receives the resolved value.
    pub target_name: String,
    /// Secret to look up.
    pub secret_name: String,
    /// Vault alias as written after the first `@`.
    pub vault_alias: String,
}

/// A correlated file-secret declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileSecretDeclaration {
    /// Correlation key shared by both halves, lower-cased.
    pub key: String,
    /// Secret to look up; also the file name.
    pub secret_name: String,
    /// Explicit vault alias, `None` for the default vault.
    pub vault_alias: Option<String>,
    /// Directory the secret file is written into.
    pub mount_path: PathBuf,
}

impl FileSecretDeclaration {
    /// Full path of the materialized file.
    pub fn file_path(&self) -> PathBuf {
        self.mount_path.join(&self.secret_name)
    }
}

/// Classification of a single environment entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// `NAME=secret@vault`.
    InlineVaultReference(VaultReference),
    /// Secret-name half of a file secret.
    FileSecretNameDeclaration {
        /// Correlation key, lower-cased and trimmed.
        key: String,
        /// Secret name.
        secret_name: String,
        /// Optional explicit vault alias.
        vault_alias: Option<String>,
    },
    /// Mount-path half of a file secret.
    FileMountPathDeclaration {
        /// Correlation key, lower-cased and trimmed.
        key: String,
        /// Target directory.
        mount_path: PathBuf,
    },
    /// The reserved default-vault variable.
    DefaultVaultDeclaration(String),
    /// Not a placeholder.
    Passthrough,
}

/// Result of parsing a whole snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedEnvironment {
    /// Inline references in scan order.
    pub references: Vec<VaultReference>,
    /// Correlated file secrets, ordered by their name declaration.
    pub file_secrets: Vec<FileSecretDeclaration>,
    /// Default vault alias, if declared.
    pub default_vault: Option<String>,
    /// File-secret halves that never found a partner.
    pub unmatched_declarations: usize,
}

impl ParsedEnvironment {
    /// Returns `true` when there is nothing to resolve.
    pub fn is_empty(&self) -> bool {
        self.references.is_empty() && self.file_secrets.is_empty()
    }
}

/// Canonical tokenizer for the placeholder grammar.
#[derive(Debug, Clone)]
pub struct ReferenceParser {
    default_vault_variable: String,
    secret_name_prefix: String,
    mount_path_prefix: String,
}

impl Default for ReferenceParser {
    fn default() -> Self {
        Self::new(DEFAULT_VAULT_VARIABLE, SECRET_NAME_PREFIX, MOUNT_PATH_PREFIX)
    }
}

impl ReferenceParser {
    /// Create a parser with explicit reserved names. Prefixes match case-insensitively.
    pub fn new(default_vault_variable: &str, secret_name_prefix: &str, mount_path_prefix: &str) -> Self {
        Self {
            default_vault_variable: default_vault_variable.trim().to_owned(),
            secret_name_prefix: secret_name_prefix.trim().to_lowercase(),
            mount_path_prefix: mount_path_prefix.trim().to_lowercase(),
        }
    }

    /// Create a parser from the `[injector]` configuration.
    pub fn from_config(config: &InjectorConfig) -> Self {
        Self::new(
            &config.injector.default_vault_variable,
            &config.injector.secret_name_prefix,
            &config.injector.mount_path_prefix,
        )
    }

    /// Name of the reserved default-vault variable.
    pub fn default_vault_variable(&self) -> &str {
        &self.default_vault_variable
    }

    /// Classify a raw `name=value` line. No `=` means passthrough.
    pub fn classify_line(&self, raw: &str) -> Classification {
        match EnvironmentEntry::parse(raw) {
            Some(entry) => self.classify(&entry),
            None => Classification::Passthrough,
        }
    }

    /// Classify one environment entry.
    pub fn classify(&self, entry: &EnvironmentEntry) -> Classification {
        if is_setting_var(entry.name()) {
            return Classification::Passthrough;
        }

        if entry.name_matches(&self.default_vault_variable) {
            let alias = entry.value().trim();
            if alias.is_empty() {
                return Classification::Passthrough;
            }
            return Classification::DefaultVaultDeclaration(alias.to_owned());
        }

        if let Some(key) = correlation_key(entry.name(), &self.secret_name_prefix) {
            let value = entry.value().trim();
            if value.is_empty() {
                return Classification::Passthrough;
            }
            let (secret_name, vault_alias) = match split_reference(value) {
                Some((secret, alias)) => (secret.to_owned(), Some(alias.to_owned())),
                None => (value.to_owned(), None),
            };
            return Classification::FileSecretNameDeclaration {
                key,
                secret_name,
                vault_alias,
            };
        }

        if let Some(key) = correlation_key(entry.name(), &self.mount_path_prefix) {
            let value = entry.value().trim();
            if value.is_empty() {
                return Classification::Passthrough;
            }
            return Classification::FileMountPathDeclaration {
                key,
                mount_path: PathBuf::from(value),
            };
        }

        match split_reference(entry.value()) {
            Some((secret_name, vault_alias)) => {
                Classification::InlineVaultReference(VaultReference {
                    target_name: entry.name().to_owned(),
                    secret_name: secret_name.to_owned(),
                    vault_alias: vault_alias.to_owned(),
                })
            }
            None => Classification::Passthrough,
        }
    }

    /// Classify every entry and correlate file-secret halves.
    pub fn parse(&self, snapshot: &EnvSnapshot) -> ParsedEnvironment {
        let mut parsed = ParsedEnvironment::default();
        let mut names: Vec<(String, String, Option<String>)> = Vec::new();
        let mut mounts: HashMap<String, PathBuf> = HashMap::new();

        for entry in snapshot.iter() {
            match self.classify(entry) {
                Classification::InlineVaultReference(reference) => {
                    debug!(
                        variable = %reference.target_name,
                        secret = %reference.secret_name,
                        vault = %reference.vault_alias,
                        "found inline vault reference"
                    );
                    parsed.references.push(reference);
                }
                Classification::FileSecretNameDeclaration {
                    key,
                    secret_name,
                    vault_alias,
                } => {
                    debug!(key = %key, secret = %secret_name, "found file secret name declaration");
                    names.retain(|(existing, _, _)| existing != &key);
                    names.push((key, secret_name, vault_alias));
                }
                Classification::FileMountPathDeclaration { key, mount_path } => {
                    debug!(key = %key, path = %mount_path.display(), "found file secret mount path");
                    mounts.insert(key, mount_path);
                }
                Classification::DefaultVaultDeclaration(alias) => {
                    debug!(vault = %alias, "found default vault declaration");
                    parsed.default_vault = Some(alias);
                }
                Classification::Passthrough => {
                    debug!(variable = %entry.name(), "skipping variable");
                }
            }
        }

        for (key, secret_name, vault_alias) in names {
            match mounts.remove(&key) {
                Some(mount_path) => parsed.file_secrets.push(FileSecretDeclaration {
                    key,
                    secret_name,
                    vault_alias,
                    mount_path,
                }),
                None => {
                    debug!(key = %key, secret = %secret_name, "no matching mount path, dropping file secret");
                    parsed.unmatched_declarations = parsed.unmatched_declarations.saturating_add(1);
                }
            }
        }
        for key in mounts.keys() {
            debug!(key = %key, "no matching secret name, dropping mount path");
            parsed.unmatched_declarations = parsed.unmatched_declarations.saturating_add(1);
        }

        parsed
    }
}

/// Substring between the first `a` and the first `b` in `value`.
///
/// Empty when either delimiter is missing or `b` does not come after the
/// end of `a`.
pub fn between<'a>(value: &'a str, a: &str, b: &str) -> &'a str {
    let Some(first) = value.find(a) else {
        return "";
    };
    let Some(last) = value.find(b) else {
        return "";
    };
    let Some(start) = first.checked_add(a.len()) else {
        return "";
    };
    if start >= last {
        return "";
    }
    value.get(start..last).unwrap_or("")
}

/// Split `secret@vault` on the first `@`. Both halves must be non-blank.
fn split_reference(value: &str) -> Option<(&str, &str)> {
    let (secret, alias) = value.split_once('@')?;
    let (secret, alias) = (secret.trim(), alias.trim());
    if secret.is_empty() || alias.is_empty() {
        return None;
    }
    Some((secret, alias))
}

/// Correlation suffix of `name` when it starts with `prefix` (already lower-case).
fn correlation_key(name: &str, prefix: &str) -> Option<String> {
    let probe = format!("{}=", name.trim().to_lowercase());
    if !probe.starts_with(prefix) {
        return None;
    }
    let key = between(&probe, prefix, "=").trim();
    if key.is_empty() {
        return None;
    }
    Some(key.to_owned())
}
