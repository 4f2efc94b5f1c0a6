//! secret-injector: a container entrypoint that resolves vault secret
//! references into environment variables and files, then execs the workload.
//!
//! Two declaration forms are read from the environment:
//!
//! - `NAME=secret@vault` replaces `NAME` with the secret's value.
//! - `secret_injector_secret_name_<key>` paired with
//!   `secret_injector_mount_path_<key>` writes the secret to a read-only file.
//!
//! `AzureKeyVault` names the vault used when a reference omits one.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod config;
pub mod env;
pub mod injector;
pub mod launch;
pub mod logging;
pub mod materialize;
pub mod parser;
pub mod resolver;
