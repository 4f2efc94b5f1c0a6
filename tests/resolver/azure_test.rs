//! Azure Key Vault resolver against a mock HTTP server.

use secret_injector::config::AzureSection;
use secret_injector::resolver::azure::{AzureCredential, AzureKeyVaultResolver};
use secret_injector::resolver::{ResolutionError, SecretResolver};
use serde_json::json;
use wiremock::matchers::{body_string_contains, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn settings(server: &MockServer) -> AzureSection {
    AzureSection {
        authority_host: server.uri(),
        imds_endpoint: format!("{}/metadata/identity/oauth2/token", server.uri()),
        request_timeout_secs: 5,
        ..AzureSection::default()
    }
}

fn service_principal() -> AzureCredential {
    AzureCredential::ClientSecret {
        tenant_id: "tenant-1".to_owned(),
        client_id: "client-1".to_owned(),
        client_secret: "sp-secret".to_owned(),
    }
}

async fn mount_client_token(server: &MockServer, expected_calls: u64) {
    Mock::given(method("POST"))
        .and(path("/tenant-1/oauth2/v2.0/token"))
        .and(body_string_contains("grant_type=client_credentials"))
        .and(body_string_contains("client_id=client-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "token_type": "Bearer",
            "expires_in": 3599,
            "access_token": "sp-token"
        })))
        .expect(expected_calls)
        .mount(server)
        .await;
}

#[tokio::test]
async fn client_secret_flow_fetches_token_once() {
    let server = MockServer::start().await;
    mount_client_token(&server, 1).await;
    for (name, value) in [("db-password", "hunter2"), ("api-key", "k-123")] {
        Mock::given(method("GET"))
            .and(path(format!("/secrets/{name}")))
            .and(query_param("api-version", "7.4"))
            .and(header("authorization", "Bearer sp-token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": value,
                "id": format!("{}/secrets/{name}/abc", server.uri()),
                "attributes": { "enabled": true }
            })))
            .expect(1)
            .mount(&server)
            .await;
    }

    let resolver = AzureKeyVaultResolver::new(settings(&server), service_principal())
        .expect("resolver should build");

    let first = resolver
        .resolve(&server.uri(), "db-password")
        .await
        .expect("db-password should resolve");
    let second = resolver
        .resolve(&server.uri(), "api-key")
        .await
        .expect("api-key should resolve");
    assert_eq!(first.expose(), "hunter2");
    assert_eq!(second.expose(), "k-123");
}

#[tokio::test]
async fn managed_identity_flow_uses_metadata_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/metadata/identity/oauth2/token"))
        .and(header("Metadata", "true"))
        .and(query_param("resource", "https://vault.azure.net"))
        .and(query_param("client_id", "user-assigned-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "access_token": "mi-token",
            "token_type": "Bearer"
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/secrets/tls-cert"))
        .and(header("authorization", "Bearer mi-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "value": "cert-body" })))
        .mount(&server)
        .await;

    let credential = AzureCredential::ManagedIdentity {
        client_id: Some("user-assigned-1".to_owned()),
    };
    let resolver = AzureKeyVaultResolver::new(settings(&server), credential).expect("resolver should build");

    let value = resolver
        .resolve(&server.uri(), "tls-cert")
        .await
        .expect("tls-cert should resolve");
    assert_eq!(value.expose(), "cert-body");
}

#[tokio::test]
async fn status_codes_map_to_error_kinds() {
    let server = MockServer::start().await;
    mount_client_token(&server, 1).await;
    for (name, status) in [("gone", 404_u16), ("forbidden", 403), ("busy", 503), ("odd", 418)] {
        Mock::given(method("GET"))
            .and(path(format!("/secrets/{name}")))
            .respond_with(ResponseTemplate::new(status).set_body_string("{\"error\":{\"code\":\"x\"}}"))
            .mount(&server)
            .await;
    }

    let resolver = AzureKeyVaultResolver::new(settings(&server), service_principal())
        .expect("resolver should build");
    let vault = server.uri();

    match resolver.resolve(&vault, "gone").await {
        Err(ResolutionError::NotFound { vault: v, secret }) => {
            assert_eq!(v, vault);
            assert_eq!(secret, "gone");
        }
        other => panic!("expected NotFound, got {other:?}"),
    }
    match resolver.resolve(&vault, "forbidden").await {
        Err(ResolutionError::AuthFailure(detail)) => assert!(detail.contains("403")),
        other => panic!("expected AuthFailure, got {other:?}"),
    }
    match resolver.resolve(&vault, "busy").await {
        Err(ResolutionError::TransientNetwork(detail)) => assert!(detail.contains("503")),
        other => panic!("expected TransientNetwork, got {other:?}"),
    }
    match resolver.resolve(&vault, "odd").await {
        Err(ResolutionError::Other(detail)) => assert!(detail.contains("418")),
        other => panic!("expected Other, got {other:?}"),
    }
}

#[tokio::test]
async fn rejected_token_request_is_auth_failure_for_every_lookup() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/tenant-1/oauth2/v2.0/token"))
        .respond_with(ResponseTemplate::new(401).set_body_string("invalid_client"))
        .expect(1)
        .mount(&server)
        .await;

    let resolver = AzureKeyVaultResolver::new(settings(&server), service_principal())
        .expect("resolver should build");

    for name in ["a", "b"] {
        match resolver.resolve(&server.uri(), name).await {
            Err(ResolutionError::AuthFailure(detail)) => assert!(detail.contains("invalid_client")),
            other => panic!("expected AuthFailure, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn unreachable_vault_is_transient() {
    let server = MockServer::start().await;
    mount_client_token(&server, 1).await;
    let resolver = AzureKeyVaultResolver::new(settings(&server), service_principal())
        .expect("resolver should build");

    // Port 9 (discard) on loopback refuses connections.
    match resolver.resolve("http://127.0.0.1:9", "anything").await {
        Err(ResolutionError::TransientNetwork(_)) => {}
        other => panic!("expected TransientNetwork, got {other:?}"),
    }
}

#[test]
fn credential_selection_from_environment() {
    let full = |key: &str| match key {
        "AZURE_TENANT_ID" => Some("t".to_owned()),
        "AZURE_CLIENT_ID" => Some("c".to_owned()),
        "AZURE_CLIENT_SECRET" => Some("s".to_owned()),
        _ => None,
    };
    assert!(matches!(
        AzureCredential::from_env(full),
        AzureCredential::ClientSecret { .. }
    ));

    let partial = |key: &str| (key == "AZURE_CLIENT_ID").then(|| "c".to_owned());
    assert_eq!(
        AzureCredential::from_env(partial),
        AzureCredential::ManagedIdentity {
            client_id: Some("c".to_owned())
        }
    );

    let debug = format!("{:?}", AzureCredential::from_env(full));
    assert!(!debug.contains("\"s\""));
    assert!(debug.contains("REDACTED"));
}
