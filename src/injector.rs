//! Injection pipeline.
//!
//! `SCAN → PARSE → RESOLVE → MATERIALIZE`, then the caller launches. Every
//! failure before launch is per-secret: it is logged, the secret is left
//! out, and the run carries on.

use std::fmt;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::config::{InjectorConfig, MAX_RESOLVE_CONCURRENCY};
use crate::env::EnvSnapshot;
use crate::materialize::{Destination, MaterializeOutcome, Materializer, OutgoingEnvironment, ResolvedSecret};
use crate::parser::{ParsedEnvironment, ReferenceParser};
use crate::resolver::{ResolutionError, SecretResolver, SecretValue};

/// Stage of one launcher invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Arguments and configuration.
    Init,
    /// Capturing the environment.
    Scan,
    /// Classifying entries.
    Parse,
    /// Looking secrets up.
    Resolve,
    /// Writing env vars and files.
    Materialize,
    /// Handing over to the target command.
    Exec,
    /// Terminal failure, the target never runs.
    Failed,
}

impl Phase {
    /// Log the transition into this phase.
    pub fn enter(self) -> Self {
        debug!(phase = %self, "entering phase");
        self
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Init => "INIT",
            Self::Scan => "SCAN",
            Self::Parse => "PARSE",
            Self::Resolve => "RESOLVE",
            Self::Materialize => "MATERIALIZE",
            Self::Exec => "EXEC",
            Self::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

/// A secret that could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionFailure {
    /// Secret name.
    pub identifier: String,
    /// Vault it was looked up in, empty when no vault could be determined.
    pub vault: String,
    /// Where it would have gone.
    pub destination: Destination,
    /// Why it failed.
    pub error: ResolutionError,
}

/// Secrets to resolve, plus those that failed before reaching the resolver.
#[derive(Debug, Default)]
pub struct InjectionPlan {
    /// Pending secrets in scan order.
    pub secrets: Vec<ResolvedSecret>,
    /// Secrets with no usable vault.
    pub failures: Vec<ResolutionFailure>,
}

/// Outcome of a full injection run.
#[derive(Debug)]
pub struct InjectionReport {
    /// Environment to hand to the target command.
    pub env: OutgoingEnvironment,
    /// Default vault in effect, if any.
    pub default_vault: Option<String>,
    /// Number of successful lookups.
    pub resolved: usize,
    /// Failed lookups, in scan order.
    pub resolution_failures: Vec<ResolutionFailure>,
    /// What was written where.
    pub materialized: MaterializeOutcome,
    /// File-secret halves without a partner.
    pub unmatched_declarations: usize,
}

impl InjectionReport {
    /// `true` when every declared secret was materialized.
    pub fn is_complete(&self) -> bool {
        self.resolution_failures.is_empty() && self.materialized.file_failures.is_empty()
    }
}

/// The injection engine. Built once per invocation.
pub struct SecretInjector {
    parser: ReferenceParser,
    materializer: Materializer,
    resolver: Arc<dyn SecretResolver>,
    concurrency: usize,
}

impl fmt::Debug for SecretInjector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecretInjector")
            .field("parser", &self.parser)
            .field("materializer", &self.materializer)
            .field("concurrency", &self.concurrency)
            .finish_non_exhaustive()
    }
}

impl SecretInjector {
    /// Create an injector around a resolver.
    pub fn new(config: &InjectorConfig, resolver: Arc<dyn SecretResolver>) -> Self {
        Self {
            parser: ReferenceParser::from_config(config),
            materializer: Materializer::new(config.injector.file_mode),
            resolver,
            concurrency: config
                .injector
                .resolve_concurrency
                .clamp(1, MAX_RESOLVE_CONCURRENCY),
        }
    }

    /// Run parse, resolve and materialize over a snapshot.
    pub async fn run(&self, snapshot: &EnvSnapshot) -> InjectionReport {
        Phase::Parse.enter();
        let parsed = self.parser.parse(snapshot);
        info!(
            references = parsed.references.len(),
            file_secrets = parsed.file_secrets.len(),
            default_vault = parsed.default_vault.as_deref().unwrap_or(""),
            "parsed environment"
        );
        let plan = self.plan(&parsed);

        Phase::Resolve.enter();
        let (secrets, mut failures) = self.resolve(plan.secrets).await;
        let resolved = secrets.iter().filter(|s| s.is_valid()).count();
        let mut resolution_failures = plan.failures;
        resolution_failures.append(&mut failures);

        Phase::Materialize.enter();
        let mut env = OutgoingEnvironment::from_snapshot(snapshot);
        let materialized = self.materializer.materialize(&secrets, &mut env);

        InjectionReport {
            env,
            default_vault: parsed.default_vault,
            resolved,
            resolution_failures,
            materialized,
            unmatched_declarations: parsed.unmatched_declarations,
        }
    }

    /// Turn parsed declarations into pending secrets with canonical vaults.
    pub fn plan(&self, parsed: &ParsedEnvironment) -> InjectionPlan {
        let mut plan = InjectionPlan::default();
        let default_vault = parsed.default_vault.as_deref();

        for reference in &parsed.references {
            let vault = self.canonical_vault(&reference.vault_alias, default_vault);
            plan.secrets.push(ResolvedSecret::pending(
                reference.secret_name.clone(),
                vault,
                Destination::EnvVar(reference.target_name.clone()),
            ));
        }

        for declaration in &parsed.file_secrets {
            let destination = Destination::File(declaration.mount_path.clone());
            let vault = match (&declaration.vault_alias, default_vault) {
                (Some(alias), _) => self.canonical_vault(alias, default_vault),
                (None, Some(default)) => default.to_owned(),
                (None, None) => {
                    error!(
                        secret = %declaration.secret_name,
                        variable = %self.parser.default_vault_variable(),
                        "no default vault configured for file secret"
                    );
                    plan.failures.push(ResolutionFailure {
                        identifier: declaration.secret_name.clone(),
                        vault: String::new(),
                        destination,
                        error: ResolutionError::Other(format!(
                            "no vault for file secret; set {}",
                            self.parser.default_vault_variable()
                        )),
                    });
                    continue;
                }
            };
            plan.secrets
                .push(ResolvedSecret::pending(declaration.secret_name.clone(), vault, destination));
        }

        plan
    }

    /// Map an alias naming the default-vault variable onto the default vault.
    pub fn canonical_vault(&self, alias: &str, default_vault: Option<&str>) -> String {
        match default_vault {
            Some(default) if alias.trim().eq_ignore_ascii_case(self.parser.default_vault_variable()) => {
                default.to_owned()
            }
            _ => alias.to_owned(),
        }
    }

    /// Resolve pending secrets. Output keeps the input order.
    async fn resolve(&self, secrets: Vec<ResolvedSecret>) -> (Vec<ResolvedSecret>, Vec<ResolutionFailure>) {
        let outcomes = if self.concurrency <= 1 || secrets.len() <= 1 {
            let mut outcomes = Vec::with_capacity(secrets.len());
            for secret in secrets {
                let result = self.resolver.resolve(&secret.vault, &secret.identifier).await;
                outcomes.push((secret, result));
            }
            outcomes
        } else {
            self.resolve_concurrently(secrets).await
        };

        let mut resolved = Vec::with_capacity(outcomes.len());
        let mut failures = Vec::new();
        for (mut secret, result) in outcomes {
            match result {
                Ok(value) => {
                    info!(secret = %secret.identifier, vault = %secret.vault, "resolved secret");
                    secret.resolve_with(value);
                }
                Err(e) => {
                    error!(
                        secret = %secret.identifier,
                        vault = %secret.vault,
                        kind = e.kind(),
                        error = %e,
                        "unable to get value for secret"
                    );
                    failures.push(ResolutionFailure {
                        identifier: secret.identifier.clone(),
                        vault: secret.vault.clone(),
                        destination: secret.destination.clone(),
                        error: e,
                    });
                }
            }
            resolved.push(secret);
        }
        (resolved, failures)
    }

    /// Bounded parallel lookups, re-sorted into scan order.
    async fn resolve_concurrently(
        &self,
        secrets: Vec<ResolvedSecret>,
    ) -> Vec<(ResolvedSecret, Result<SecretValue, ResolutionError>)> {
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut slots: Vec<Option<Result<SecretValue, ResolutionError>>> = vec![None; secrets.len()];
        let mut tasks = JoinSet::new();

        for (index, secret) in secrets.iter().enumerate() {
            let resolver = Arc::clone(&self.resolver);
            let semaphore = Arc::clone(&semaphore);
            let vault = secret.vault.clone();
            let identifier = secret.identifier.clone();
            tasks.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                (index, resolver.resolve(&vault, &identifier).await)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, result)) => {
                    if let Some(slot) = slots.get_mut(index) {
                        *slot = Some(result);
                    }
                }
                Err(e) => error!(error = %e, "secret lookup task failed"),
            }
        }

        secrets
            .into_iter()
            .zip(slots)
            .map(|(secret, slot)| {
                let result = slot.unwrap_or_else(|| {
                    Err(ResolutionError::Other("secret lookup task did not complete".to_owned()))
                });
                (secret, result)
            })
            .collect()
    }
}
