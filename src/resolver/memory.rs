//! In-memory resolver for tests and local dry runs.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ResolutionError, SecretResolver, SecretValue};

/// Resolver backed by a fixed `(vault, secret) → value` table.
///
/// Lookups are recorded so callers can assert what was asked for.
#[derive(Debug, Default)]
pub struct InMemoryResolver {
    secrets: HashMap<(String, String), SecretValue>,
    failures: HashMap<(String, String), ResolutionError>,
    lookups: Mutex<Vec<(String, String)>>,
}

impl InMemoryResolver {
    /// Create an empty resolver; every lookup is `NotFound`.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a secret value.
    pub fn with_secret(mut self, vault: &str, secret: &str, value: &str) -> Self {
        self.secrets
            .insert((vault.to_owned(), secret.to_owned()), SecretValue::new(value));
        self
    }

    /// Make a lookup fail with a specific error.
    pub fn with_failure(mut self, vault: &str, secret: &str, error: ResolutionError) -> Self {
        self.failures
            .insert((vault.to_owned(), secret.to_owned()), error);
        self
    }

    /// Lookups performed so far, in call order.
    pub fn lookups(&self) -> Vec<(String, String)> {
        self.lookups
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl SecretResolver for InMemoryResolver {
    async fn resolve(&self, vault: &str, secret_name: &str) -> Result<SecretValue, ResolutionError> {
        let key = (vault.to_owned(), secret_name.to_owned());
        if let Ok(mut lookups) = self.lookups.lock() {
            lookups.push(key.clone());
        }
        if let Some(error) = self.failures.get(&key) {
            return Err(error.clone());
        }
        self.secrets
            .get(&key)
            .cloned()
            .ok_or_else(|| ResolutionError::NotFound {
                vault: vault.to_owned(),
                secret: secret_name.to_owned(),
            })
    }
}
