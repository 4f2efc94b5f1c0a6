//! Azure Key Vault resolver using the secrets REST API.
//!
//! Vault aliases are either bare vault names (`prod-kv` becomes
//! `https://prod-kv.vault.azure.net`) or full base URLs. The bearer token is
//! acquired once per process, from a service principal when
//! `AZURE_TENANT_ID` / `AZURE_CLIENT_ID` / `AZURE_CLIENT_SECRET` are all set,
//! otherwise from the managed identity endpoint.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::OnceCell;
use tracing::{debug, info};
use url::Url;

use crate::config::AzureSection;

use super::{ResolutionError, SecretResolver, SecretValue};

const IMDS_API_VERSION: &str = "2018-02-01";
const MAX_ERROR_BODY_CHARS: usize = 256;

// ---------------------------------------------------------------------------
// Credentials
// ---------------------------------------------------------------------------

/// How the resolver authenticates against Microsoft Entra ID.
#[derive(Clone, PartialEq, Eq)]
pub enum AzureCredential {
    /// Service principal with a client secret.
    ClientSecret {
        /// Directory (tenant) ID.
        tenant_id: String,
        /// Application (client) ID.
        client_id: String,
        /// Client secret.
        client_secret: String,
    },
    /// Managed identity via the instance metadata endpoint.
    ManagedIdentity {
        /// Client ID of a user-assigned identity; `None` for system-assigned.
        client_id: Option<String>,
    },
}

impl std::fmt::Debug for AzureCredential {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ClientSecret {
                tenant_id,
                client_id,
                ..
            } => f
                .debug_struct("ClientSecret")
                .field("tenant_id", tenant_id)
                .field("client_id", client_id)
                .field("client_secret", &"[REDACTED]")
                .finish(),
            Self::ManagedIdentity { client_id } => f
                .debug_struct("ManagedIdentity")
                .field("client_id", client_id)
                .finish(),
        }
    }
}

impl AzureCredential {
    /// Pick a credential from `AZURE_*` environment variables.
    ///
    /// A complete service principal triple wins; otherwise managed identity,
    /// scoped to `AZURE_CLIENT_ID` when present.
    pub fn from_env(env: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |key: &str| env(key).filter(|v| !v.trim().is_empty());
        let tenant_id = non_empty("AZURE_TENANT_ID");
        let client_id = non_empty("AZURE_CLIENT_ID");
        let client_secret = non_empty("AZURE_CLIENT_SECRET");

        match (tenant_id, client_id, client_secret) {
            (Some(tenant_id), Some(client_id), Some(client_secret)) => {
                debug!("using service principal credentials from environment");
                Self::ClientSecret {
                    tenant_id,
                    client_id,
                    client_secret,
                }
            }
            (_, client_id, _) => {
                debug!(user_assigned = client_id.is_some(), "using managed identity credentials");
                Self::ManagedIdentity { client_id }
            }
        }
    }
}

/// OAuth token endpoint response.
#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
}

/// Key Vault secret bundle; only the value is used.
#[derive(Deserialize)]
struct SecretBundle {
    value: String,
}

// ---------------------------------------------------------------------------
// Resolver
// ---------------------------------------------------------------------------

/// Resolver backed by Azure Key Vault.
#[derive(Debug)]
pub struct AzureKeyVaultResolver {
    settings: AzureSection,
    credential: AzureCredential,
    client: reqwest::Client,
    token: OnceCell<Result<String, ResolutionError>>,
}

impl AzureKeyVaultResolver {
    /// Create a resolver with its own HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(settings: AzureSection, credential: AzureCredential) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(settings.request_timeout_secs))
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            settings,
            credential,
            client,
            token: OnceCell::new(),
        })
    }

    /// Base URL of the vault addressed by `vault`.
    ///
    /// # Errors
    ///
    /// Returns `ResolutionError::Other` when the alias does not form a valid URL.
    pub fn vault_endpoint(&self, vault: &str) -> Result<Url, ResolutionError> {
        let raw = if vault.contains("://") {
            vault.to_owned()
        } else {
            format!("https://{vault}.{}", self.settings.dns_suffix)
        };
        Url::parse(&raw).map_err(|e| ResolutionError::Other(format!("invalid vault address '{raw}': {e}")))
    }

    /// Full `GET` URL for a secret.
    ///
    /// # Errors
    ///
    /// Returns `ResolutionError::Other` when the endpoint cannot carry a path.
    pub fn secret_url(&self, vault: &str, secret_name: &str) -> Result<Url, ResolutionError> {
        let mut url = self.vault_endpoint(vault)?;
        url.path_segments_mut()
            .map_err(|()| ResolutionError::Other(format!("vault address '{vault}' cannot be a base URL")))?
            .pop_if_empty()
            .push("secrets")
            .push(secret_name);
        url.query_pairs_mut()
            .append_pair("api-version", &self.settings.api_version);
        Ok(url)
    }

    async fn access_token(&self) -> Result<String, ResolutionError> {
        self.token
            .get_or_init(|| self.fetch_token())
            .await
            .clone()
    }

    async fn fetch_token(&self) -> Result<String, ResolutionError> {
        let scope_resource = self.settings.resource.trim_end_matches('/');
        let request = match &self.credential {
            AzureCredential::ClientSecret {
                tenant_id,
                client_id,
                client_secret,
            } => {
                let url = format!(
                    "{}/{tenant_id}/oauth2/v2.0/token",
                    self.settings.authority_host.trim_end_matches('/')
                );
                let scope = format!("{scope_resource}/.default");
                self.client.post(url).form(&[
                    ("grant_type", "client_credentials"),
                    ("client_id", client_id.as_str()),
                    ("client_secret", client_secret.as_str()),
                    ("scope", scope.as_str()),
                ])
            }
            AzureCredential::ManagedIdentity { client_id } => {
                let mut query = vec![
                    ("api-version", IMDS_API_VERSION),
                    ("resource", self.settings.resource.as_str()),
                ];
                if let Some(id) = client_id {
                    query.push(("client_id", id.as_str()));
                }
                self.client
                    .get(&self.settings.imds_endpoint)
                    .header("Metadata", "true")
                    .query(&query)
            }
        };

        let response = request.send().await.map_err(transport_error)?;
        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            let detail = format!("token request returned {}: {}", status.as_u16(), sanitize_body(&body));
            return Err(if is_transient_status(status.as_u16()) {
                ResolutionError::TransientNetwork(detail)
            } else {
                ResolutionError::AuthFailure(detail)
            });
        }

        let token: TokenResponse = serde_json::from_str(&body)
            .map_err(|e| ResolutionError::AuthFailure(format!("malformed token response: {e}")))?;
        info!("acquired key vault access token");
        Ok(token.access_token)
    }
}

#[async_trait]
impl SecretResolver for AzureKeyVaultResolver {
    async fn resolve(&self, vault: &str, secret_name: &str) -> Result<SecretValue, ResolutionError> {
        let url = self.secret_url(vault, secret_name)?;
        let token = self.access_token().await?;

        debug!(url = %url, secret = %secret_name, "requesting secret from key vault");
        let response = self
            .client
            .get(url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(transport_error)?;
        if !status.is_success() {
            return Err(classify_status(status.as_u16(), &body, vault, secret_name));
        }

        let bundle: SecretBundle = serde_json::from_str(&body)
            .map_err(|e| ResolutionError::Other(format!("malformed secret response: {e}")))?;
        Ok(SecretValue::new(bundle.value))
    }
}

// ---------------------------------------------------------------------------
// Error mapping (pub for integration testing)
// ---------------------------------------------------------------------------

/// Map a non-success Key Vault status onto the resolution taxonomy.
#[doc(hidden)]
pub fn classify_status(status: u16, body: &str, vault: &str, secret: &str) -> ResolutionError {
    let detail = format!("key vault returned {status}: {}", sanitize_body(body));
    match status {
        404 => ResolutionError::NotFound {
            vault: vault.to_owned(),
            secret: secret.to_owned(),
        },
        401 | 403 => ResolutionError::AuthFailure(detail),
        s if is_transient_status(s) => ResolutionError::TransientNetwork(detail),
        _ => ResolutionError::Other(detail),
    }
}

fn is_transient_status(status: u16) -> bool {
    matches!(status, 408 | 429) || (500..600).contains(&status)
}

fn transport_error(error: reqwest::Error) -> ResolutionError {
    if error.is_timeout() || error.is_connect() || error.is_request() {
        ResolutionError::TransientNetwork(error.to_string())
    } else {
        ResolutionError::Other(error.to_string())
    }
}

/// Collapse whitespace and truncate an error body before it reaches the logs.
fn sanitize_body(raw: &str) -> String {
    let collapsed = raw.split_whitespace().collect::<Vec<_>>().join(" ");
    if collapsed.chars().count() > MAX_ERROR_BODY_CHARS {
        let shortened = collapsed.chars().take(MAX_ERROR_BODY_CHARS).collect::<String>();
        return format!("{shortened}...[truncated]");
    }
    collapsed
}
