//! Process launch.
//!
//! The last stage: find the target executable and replace the current
//! process image with it. On Unix this is a real `execvp`; nothing of the
//! injector survives a successful call.

use std::ffi::{OsStr, OsString};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;
use tracing::info;

use crate::materialize::OutgoingEnvironment;

/// Fatal launch failures. The target never runs when one of these occurs.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// No target command was given.
    #[error(
        "no command is given, the entrypoint cannot be determined; \
         pass it explicitly: secret-injector <command> [args...]"
    )]
    NoCommand,
    /// The command was not found on the executable search path.
    #[error("binary not found: {program}: {source}")]
    NotFound {
        /// Command as given on the command line.
        program: String,
        /// Lookup failure.
        source: which::Error,
    },
    /// Replacing the process image failed.
    #[error("failed to exec process '{}': {source}", binary.display())]
    Exec {
        /// Resolved executable path.
        binary: PathBuf,
        /// Underlying OS error.
        source: io::Error,
    },
}

/// Target command and its arguments, exactly as typed after the launcher's options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    program: OsString,
    args: Vec<OsString>,
}

impl LaunchPlan {
    /// Build a plan from the trailing command line.
    ///
    /// # Errors
    ///
    /// Returns [`LaunchError::NoCommand`] when `command` is empty.
    pub fn from_args<I>(command: I) -> Result<Self, LaunchError>
    where
        I: IntoIterator,
        I::Item: Into<OsString>,
    {
        let mut iter = command.into_iter().map(Into::into);
        let program = iter.next().ok_or(LaunchError::NoCommand)?;
        if program.is_empty() {
            return Err(LaunchError::NoCommand);
        }
        Ok(Self {
            program,
            args: iter.collect(),
        })
    }

    /// Command name as typed; becomes `argv[0]` of the child.
    pub fn program(&self) -> &OsStr {
        &self.program
    }

    /// Remaining arguments.
    pub fn args(&self) -> &[OsString] {
        &self.args
    }
}

/// Find `program` on the executable search path.
///
/// Names containing a path separator are checked directly.
///
/// # Errors
///
/// Returns [`LaunchError::NotFound`] when no executable matches.
pub fn locate(program: &OsStr) -> Result<PathBuf, LaunchError> {
    which::which(program).map_err(|source| LaunchError::NotFound {
        program: program.to_string_lossy().into_owned(),
        source,
    })
}

/// Build the child command: inherited environment plus the overlay.
#[doc(hidden)]
pub fn build_command(binary: &Path, plan: &LaunchPlan, env: &OutgoingEnvironment) -> Command {
    let mut command = Command::new(binary);
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;

        command.arg0(plan.program());
    }
    command.args(plan.args());
    for name in env.removals() {
        command.env_remove(name);
    }
    for (name, value) in env.sets() {
        command.env(name, value);
    }
    command
}

/// Replace the current process with the target command.
///
/// Only returns on failure.
#[cfg(unix)]
pub fn exec(binary: &Path, plan: &LaunchPlan, env: &OutgoingEnvironment) -> LaunchError {
    use std::os::unix::process::CommandExt;

    info!(binary = %binary.display(), args = ?plan.args(), "starting process");
    let source = build_command(binary, plan, env).exec();
    LaunchError::Exec {
        binary: binary.to_path_buf(),
        source,
    }
}

/// Run the target command and exit with its status.
///
/// Without `execve` the injector stays alive as the parent; the child sees
/// the same arguments and environment it would have received on Unix.
#[cfg(not(unix))]
pub fn exec(binary: &Path, plan: &LaunchPlan, env: &OutgoingEnvironment) -> LaunchError {
    info!(binary = %binary.display(), args = ?plan.args(), "starting process");
    match build_command(binary, plan, env).status() {
        Ok(status) => std::process::exit(status.code().unwrap_or(1)),
        Err(source) => LaunchError::Exec {
            binary: binary.to_path_buf(),
            source,
        },
    }
}
