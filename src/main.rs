//! secret-injector entry point.
//!
//! Usage: `secret-injector [--config <path>] <command> [args...]`

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::ffi::OsString;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::{debug, error, info, warn};

use secret_injector::config::InjectorConfig;
use secret_injector::env::EnvSnapshot;
use secret_injector::injector::{InjectionReport, Phase, SecretInjector};
use secret_injector::launch::{self, LaunchPlan};
use secret_injector::logging::{self, LogFormat, LOG_FORMAT_VAR};
use secret_injector::resolver::azure::{AzureCredential, AzureKeyVaultResolver};

/// Resolve vault secret references, then exec the given command.
#[derive(Parser)]
#[command(name = "secret-injector", version, about)]
struct Cli {
    /// Path to a TOML config file.
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Command to run, followed by its arguments.
    #[arg(
        value_name = "COMMAND",
        trailing_var_arg = true,
        allow_hyphen_values = true
    )]
    command: Vec<OsString>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let snapshot = EnvSnapshot::capture();
    let env = snapshot.resolver();

    logging::init(
        logging::debug_requested(&env),
        LogFormat::from_name(env(LOG_FORMAT_VAR).as_deref()),
    );
    Phase::Init.enter();

    let plan = LaunchPlan::from_args(cli.command).map_err(fatal)?;
    let config = InjectorConfig::load(cli.config.as_deref(), &env)
        .context("failed to load configuration")
        .map_err(fatal)?;
    let binary = launch::locate(plan.program()).map_err(fatal)?;

    Phase::Scan.enter();
    debug!(entries = snapshot.len(), "captured environment");

    let credential = AzureCredential::from_env(&env);
    debug!(credential = ?credential, "selected Azure credential");
    let resolver = AzureKeyVaultResolver::new(config.azure.clone(), credential).map_err(fatal)?;
    let injector = SecretInjector::new(&config, Arc::new(resolver));

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to start async runtime")
        .map_err(fatal)?;
    let report = runtime.block_on(injector.run(&snapshot));
    drop(injector);
    drop(runtime);

    summarize(&report);

    Phase::Exec.enter();
    let err = launch::exec(&binary, &plan, &report.env);
    Err(fatal(err))
}

/// Log a terminal failure and hand it back for `main` to return.
fn fatal(err: impl Into<anyhow::Error>) -> anyhow::Error {
    let err = err.into();
    Phase::Failed.enter();
    error!(error = %format!("{err:#}"), "secret injection aborted");
    err
}

fn summarize(report: &InjectionReport) {
    for failure in &report.resolution_failures {
        warn!(
            secret = %failure.identifier,
            vault = %failure.vault,
            kind = failure.error.kind(),
            "secret left out"
        );
    }
    if report.unmatched_declarations > 0 {
        warn!(
            count = report.unmatched_declarations,
            "file secret declarations without a partner were ignored"
        );
    }
    info!(
        resolved = report.resolved,
        failed = report.resolution_failures.len(),
        env_vars = report.materialized.env_vars_set.len(),
        files = report.materialized.files_written.len(),
        complete = report.is_complete(),
        "secret injection finished"
    );
    debug!(
        variables = ?report.env.vars().map(|(name, _)| name).collect::<Vec<_>>(),
        "environment after injection"
    );
}
