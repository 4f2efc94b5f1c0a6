//! Injection materialization.
//!
//! Resolved secrets land in one of two places: the outgoing environment
//! (an overlay on top of the inherited environment) or a read-only file
//! under a mount path. File failures are isolated per declaration.

use std::collections::{BTreeMap, BTreeSet};
use std::ffi::OsStr;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Component, Path, PathBuf};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::config::{is_read_only_mode, DEFAULT_FILE_MODE};
use crate::env::EnvSnapshot;
use crate::resolver::SecretValue;

// ---------------------------------------------------------------------------
// Resolved secrets
// ---------------------------------------------------------------------------

/// Where a secret is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Environment variable.
    EnvVar,
    /// File under a mount path.
    File,
}

/// Concrete destination of a secret.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    /// Overwrite this environment variable.
    EnvVar(String),
    /// Write `<mount_path>/<identifier>`.
    File(PathBuf),
}

/// A secret on its way from the resolver to its destination.
///
/// Starts invalid; only [`ResolvedSecret::resolve_with`] makes it valid.
#[derive(Debug, Clone)]
pub struct ResolvedSecret {
    /// Secret name in the vault.
    pub identifier: String,
    /// Canonical vault the secret is looked up in.
    pub vault: String,
    /// Where the value goes.
    pub destination: Destination,
    value: Option<SecretValue>,
}

impl ResolvedSecret {
    /// A secret that has not been resolved yet.
    pub fn pending(identifier: impl Into<String>, vault: impl Into<String>, destination: Destination) -> Self {
        Self {
            identifier: identifier.into(),
            vault: vault.into(),
            destination,
            value: None,
        }
    }

    /// Record a successful lookup.
    pub fn resolve_with(&mut self, value: SecretValue) {
        self.value = Some(value);
    }

    /// `true` once the resolver has succeeded.
    pub fn is_valid(&self) -> bool {
        self.value.is_some()
    }

    /// Resolved value, if any.
    pub fn value(&self) -> Option<&SecretValue> {
        self.value.as_ref()
    }

    /// Kind of destination.
    pub fn source_kind(&self) -> SourceKind {
        match self.destination {
            Destination::EnvVar(_) => SourceKind::EnvVar,
            Destination::File(_) => SourceKind::File,
        }
    }
}

// ---------------------------------------------------------------------------
// Outgoing environment
// ---------------------------------------------------------------------------

/// Environment handed to the child: the snapshot plus an overlay.
///
/// The overlay (`sets`, `removals`) is what the launcher applies to the
/// inherited environment; the snapshot itself is never touched.
#[derive(Clone, Default)]
pub struct OutgoingEnvironment {
    vars: BTreeMap<String, String>,
    sets: BTreeMap<String, String>,
    removals: BTreeSet<String>,
}

impl std::fmt::Debug for OutgoingEnvironment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutgoingEnvironment")
            .field("vars", &self.vars.len())
            .field("sets", &self.sets.keys().collect::<Vec<_>>())
            .field("removals", &self.removals)
            .finish()
    }
}

impl OutgoingEnvironment {
    /// Start from the snapshot; later duplicates overwrite earlier ones.
    pub fn from_snapshot(snapshot: &EnvSnapshot) -> Self {
        let vars = snapshot
            .iter()
            .map(|entry| (entry.name().to_owned(), entry.value().to_owned()))
            .collect();
        Self {
            vars,
            ..Self::default()
        }
    }

    /// Set `name`, overwriting any previous value.
    pub fn set(&mut self, name: &str, value: &str) {
        self.removals.remove(name);
        self.sets.insert(name.to_owned(), value.to_owned());
        self.vars.insert(name.to_owned(), value.to_owned());
    }

    /// Drop `name` from the outgoing environment.
    pub fn remove(&mut self, name: &str) {
        self.sets.remove(name);
        self.removals.insert(name.to_owned());
        self.vars.remove(name);
    }

    /// Current value of `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// All outgoing variables, sorted by name.
    pub fn vars(&self) -> impl Iterator<Item = (&str, &str)> {
        self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Variables the launcher must set on top of the inherited environment.
    pub fn sets(&self) -> impl Iterator<Item = (&str, &str)> {
        self.sets.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Variables the launcher must remove from the inherited environment.
    pub fn removals(&self) -> impl Iterator<Item = &str> {
        self.removals.iter().map(String::as_str)
    }
}

// ---------------------------------------------------------------------------
// Secret files
// ---------------------------------------------------------------------------

/// Failure to materialize one file secret.
#[derive(Debug, Error)]
pub enum FileWriteError {
    /// The secret name is not a single plain file name.
    #[error("secret name '{0}' is not a valid file name")]
    InvalidName(String),
    /// An existing read-only file could not be made writable again.
    #[error("failed to prepare existing file {}: {source}", path.display())]
    Prepare {
        /// Target file.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The file could not be created or truncated.
    #[error("failed to create {}: {source}", path.display())]
    Create {
        /// Target file.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// Writing the secret bytes failed.
    #[error("failed to write {}: {source}", path.display())]
    Write {
        /// Target file.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
    /// The final read-only mode could not be applied.
    #[error("failed to set permissions on {}: {source}", path.display())]
    Permissions {
        /// Target file.
        path: PathBuf,
        /// Underlying I/O error.
        source: io::Error,
    },
}

/// Write `value` to `mount_path/secret_name` and make it read-only.
///
/// The permission downgrade is always the last step.
///
/// # Errors
///
/// Returns a [`FileWriteError`] naming the step that failed.
pub fn write_secret_file(
    mount_path: &Path,
    secret_name: &str,
    value: &[u8],
    mode: u32,
) -> Result<PathBuf, FileWriteError> {
    if !is_plain_file_name(secret_name) {
        return Err(FileWriteError::InvalidName(secret_name.to_owned()));
    }
    let path = mount_path.join(secret_name);

    // A previous run on a persistent volume leaves a read-only file behind.
    if let Ok(metadata) = fs::metadata(&path) {
        if metadata.permissions().readonly() {
            debug!(path = %path.display(), "making existing secret file writable");
            fs::set_permissions(&path, writable_permissions(metadata.permissions()))
                .map_err(|source| FileWriteError::Prepare {
                    path: path.clone(),
                    source,
                })?;
        }
    }

    debug!(path = %path.display(), "creating secret file");
    let mut file = create_options()
        .open(&path)
        .map_err(|source| FileWriteError::Create {
            path: path.clone(),
            source,
        })?;

    debug!(path = %path.display(), "populating secret file");
    file.write_all(value)
        .and_then(|()| file.sync_all())
        .map_err(|source| FileWriteError::Write {
            path: path.clone(),
            source,
        })?;
    drop(file);

    debug!(path = %path.display(), "making secret file read-only");
    apply_final_permissions(&path, mode).map_err(|source| FileWriteError::Permissions {
        path: path.clone(),
        source,
    })?;

    Ok(path)
}

/// Exactly one normal path component, nothing that climbs or nests.
fn is_plain_file_name(name: &str) -> bool {
    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(component)), None) => component == OsStr::new(name),
        _ => false,
    }
}

#[cfg(unix)]
fn create_options() -> OpenOptions {
    use std::os::unix::fs::OpenOptionsExt;

    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true).mode(0o600);
    options
}

#[cfg(not(unix))]
fn create_options() -> OpenOptions {
    let mut options = OpenOptions::new();
    options.write(true).create(true).truncate(true);
    options
}

#[cfg(unix)]
fn writable_permissions(_current: fs::Permissions) -> fs::Permissions {
    use std::os::unix::fs::PermissionsExt;

    fs::Permissions::from_mode(0o600)
}

#[cfg(not(unix))]
fn writable_permissions(mut current: fs::Permissions) -> fs::Permissions {
    current.set_readonly(false);
    current
}

#[cfg(unix)]
fn apply_final_permissions(path: &Path, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;

    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn apply_final_permissions(path: &Path, _mode: u32) -> io::Result<()> {
    let mut permissions = fs::metadata(path)?.permissions();
    permissions.set_readonly(true);
    fs::set_permissions(path, permissions)
}

// ---------------------------------------------------------------------------
// Materializer
// ---------------------------------------------------------------------------

/// What materialization did.
#[derive(Debug, Default)]
pub struct MaterializeOutcome {
    /// Environment variables set from secrets.
    pub env_vars_set: Vec<String>,
    /// Raw references dropped because resolution failed.
    pub env_vars_dropped: Vec<String>,
    /// Secret files written.
    pub files_written: Vec<PathBuf>,
    /// Per-declaration file failures.
    pub file_failures: Vec<FileWriteError>,
}

/// Applies resolved secrets to the outgoing environment and the filesystem.
#[derive(Debug, Clone, Copy)]
pub struct Materializer {
    file_mode: u32,
}

impl Materializer {
    /// Create a materializer writing files with the given final mode.
    ///
    /// A mode granting write access falls back to [`DEFAULT_FILE_MODE`].
    pub fn new(file_mode: u32) -> Self {
        if is_read_only_mode(file_mode) {
            return Self { file_mode };
        }
        warn!(mode = %format!("{file_mode:o}"), "secret files must be read-only, using 0444");
        Self {
            file_mode: DEFAULT_FILE_MODE,
        }
    }

    /// Apply `secrets` in order. Later entries for the same variable win.
    pub fn materialize(&self, secrets: &[ResolvedSecret], env: &mut OutgoingEnvironment) -> MaterializeOutcome {
        let mut outcome = MaterializeOutcome::default();

        for secret in secrets {
            match (&secret.destination, secret.value()) {
                (Destination::EnvVar(name), Some(value)) => {
                    info!(variable = %name, secret = %secret.identifier, "injecting secret into environment");
                    env.set(name, value.expose());
                    outcome.env_vars_set.push(name.clone());
                }
                (Destination::EnvVar(name), None) => {
                    info!(variable = %name, secret = %secret.identifier, "dropping unresolved reference");
                    env.remove(name);
                    outcome.env_vars_dropped.push(name.clone());
                }
                (Destination::File(mount_path), Some(value)) => {
                    match write_secret_file(mount_path, &secret.identifier, value.expose().as_bytes(), self.file_mode) {
                        Ok(path) => {
                            info!(path = %path.display(), secret = %secret.identifier, "wrote secret file");
                            outcome.files_written.push(path);
                        }
                        Err(e) => {
                            error!(secret = %secret.identifier, error = %e, "unable to generate secrets file");
                            outcome.file_failures.push(e);
                        }
                    }
                }
                (Destination::File(mount_path), None) => {
                    debug!(
                        path = %mount_path.display(),
                        secret = %secret.identifier,
                        "skipping file for unresolved secret"
                    );
                }
            }
        }

        // Only the final state of each variable is reported.
        let mut seen = BTreeSet::new();
        outcome
            .env_vars_set
            .retain(|name| env.get(name).is_some() && seen.insert(name.clone()));
        seen.clear();
        outcome
            .env_vars_dropped
            .retain(|name| env.get(name).is_none() && seen.insert(name.clone()));
        outcome
    }
}
