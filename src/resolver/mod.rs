//! Secret resolution boundary.
//!
//! The core only knows [`SecretResolver`]: give it a vault alias and a
//! secret name, get a value or a typed failure. Backends live in the
//! submodules and are injected at construction time.

use async_trait::async_trait;
use thiserror::Error;

pub mod azure;
pub mod memory;

/// Why a secret could not be resolved.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ResolutionError {
    /// The vault has no secret with that name.
    #[error("secret '{secret}' not found in vault '{vault}'")]
    NotFound {
        /// Vault that was queried.
        vault: String,
        /// Secret that was requested.
        secret: String,
    },
    /// Credentials were missing, rejected, or lacked access.
    #[error("authentication failed: {0}")]
    AuthFailure(String),
    /// The store could not be reached or asked us to come back later.
    #[error("transient network error: {0}")]
    TransientNetwork(String),
    /// Anything else the backend reported.
    #[error("secret store error: {0}")]
    Other(String),
}

impl ResolutionError {
    /// Short machine-friendly label for structured logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::AuthFailure(_) => "auth_failure",
            Self::TransientNetwork(_) => "transient_network",
            Self::Other(_) => "other",
        }
    }
}

/// Resolved secret material that never appears in logs.
///
/// Debug output always shows `__REDACTED__`.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretValue(String);

impl SecretValue {
    /// Wrap a secret value.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret. Use only when materializing.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Debug for SecretValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("__REDACTED__")
    }
}

/// Secret-store capability.
///
/// One call per lookup, no retries. Resilience belongs to the backend.
#[async_trait]
pub trait SecretResolver: Send + Sync {
    /// Look up `secret_name` in the vault addressed by `vault`.
    ///
    /// # Errors
    ///
    /// Returns a [`ResolutionError`] describing why the lookup failed.
    async fn resolve(&self, vault: &str, secret_name: &str) -> Result<SecretValue, ResolutionError>;
}
