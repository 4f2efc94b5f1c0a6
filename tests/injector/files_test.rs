//! File-secret materialization through the full pipeline.

use std::fs;
use std::sync::Arc;

use secret_injector::config::InjectorConfig;
use secret_injector::env::EnvSnapshot;
use secret_injector::injector::SecretInjector;
use secret_injector::resolver::memory::InMemoryResolver;
use secret_injector::resolver::SecretResolver;

fn mount_of(dir: &tempfile::TempDir) -> String {
    dir.path().to_string_lossy().into_owned()
}

#[tokio::test]
async fn paired_declarations_write_read_only_file() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let mount = mount_of(&dir);
    let snapshot = EnvSnapshot::from_pairs([
        ("AzureKeyVault", "prod-kv"),
        ("secret_injector_secret_name_tls", "tls-cert"),
        ("secret_injector_mount_path_tls", mount.as_str()),
    ]);
    let resolver = Arc::new(InMemoryResolver::new().with_secret("prod-kv", "tls-cert", "-----BEGIN-----"));
    let report = SecretInjector::new(&InjectorConfig::default(), resolver)
        .run(&snapshot)
        .await;

    let path = dir.path().join("tls-cert");
    assert_eq!(report.materialized.files_written, vec![path.clone()]);
    let contents = fs::read_to_string(&path).expect("secret file should be readable");
    assert_eq!(contents, "-----BEGIN-----");

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;

        let mode = fs::metadata(&path)
            .expect("metadata should load")
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o444);
    }

    // Declarations stay in the environment untouched.
    assert_eq!(report.env.sets().count(), 0);
    assert_eq!(report.env.get("secret_injector_secret_name_tls"), Some("tls-cert"));
}

#[tokio::test]
async fn correlation_key_is_case_insensitive_and_alias_is_honoured() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let mount = mount_of(&dir);
    let snapshot = EnvSnapshot::from_pairs([
        ("SECRET_INJECTOR_MOUNT_PATH_Db", mount.as_str()),
        ("secret_injector_secret_name_dB", "db-password@other-kv"),
    ]);
    let resolver = Arc::new(InMemoryResolver::new().with_secret("other-kv", "db-password", "s3cret"));
    let report = SecretInjector::new(&InjectorConfig::default(), resolver)
        .run(&snapshot)
        .await;

    let contents = fs::read_to_string(dir.path().join("db-password")).expect("secret file should exist");
    assert_eq!(contents, "s3cret");
    assert!(report.is_complete());
}

#[tokio::test]
async fn existing_read_only_file_is_replaced() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let mount = mount_of(&dir);
    let snapshot = EnvSnapshot::from_pairs([
        ("AzureKeyVault", "kv"),
        ("secret_injector_secret_name_a", "api-key"),
        ("secret_injector_mount_path_a", mount.as_str()),
    ]);

    let first = Arc::new(InMemoryResolver::new().with_secret("kv", "api-key", "old"));
    SecretInjector::new(&InjectorConfig::default(), first)
        .run(&snapshot)
        .await;

    let second = Arc::new(InMemoryResolver::new().with_secret("kv", "api-key", "new"));
    let report = SecretInjector::new(&InjectorConfig::default(), second)
        .run(&snapshot)
        .await;

    assert!(report.materialized.file_failures.is_empty());
    let contents = fs::read_to_string(dir.path().join("api-key")).expect("secret file should exist");
    assert_eq!(contents, "new");
}

#[tokio::test]
async fn unmatched_halves_are_ignored() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let mount = mount_of(&dir);
    let snapshot = EnvSnapshot::from_pairs([
        ("AzureKeyVault", "kv"),
        ("secret_injector_secret_name_orphan", "orphan"),
        ("secret_injector_mount_path_lonely", mount.as_str()),
    ]);
    let resolver = Arc::new(InMemoryResolver::new().with_secret("kv", "orphan", "x"));
    let report = SecretInjector::new(&InjectorConfig::default(), Arc::clone(&resolver) as Arc<dyn SecretResolver>)
        .run(&snapshot)
        .await;

    assert_eq!(report.unmatched_declarations, 2);
    assert!(resolver.lookups().is_empty());
    assert!(report.materialized.files_written.is_empty());
}

#[tokio::test]
async fn missing_mount_directory_fails_only_that_file() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let missing = dir.path().join("not-there");
    let missing = missing.to_string_lossy().into_owned();
    let mount = mount_of(&dir);
    let snapshot = EnvSnapshot::from_pairs([
        ("AzureKeyVault", "kv"),
        ("secret_injector_secret_name_a", "alpha"),
        ("secret_injector_mount_path_a", missing.as_str()),
        ("secret_injector_secret_name_b", "beta"),
        ("secret_injector_mount_path_b", mount.as_str()),
        ("PLAIN", "plain@kv"),
    ]);
    let resolver = Arc::new(
        InMemoryResolver::new()
            .with_secret("kv", "alpha", "a")
            .with_secret("kv", "beta", "b")
            .with_secret("kv", "plain", "p"),
    );
    let report = SecretInjector::new(&InjectorConfig::default(), resolver)
        .run(&snapshot)
        .await;

    assert_eq!(report.materialized.file_failures.len(), 1);
    assert_eq!(report.materialized.files_written, vec![dir.path().join("beta")]);
    assert_eq!(report.env.get("PLAIN"), Some("p"));
    assert!(!report.is_complete());
}

#[tokio::test]
async fn unresolved_file_secret_does_not_block_sibling_file() {
    let dir = tempfile::tempdir().expect("tempdir should be created");
    let mount = mount_of(&dir);
    let snapshot = EnvSnapshot::from_pairs([
        ("AzureKeyVault", "kv"),
        ("secret_injector_secret_name_a", "missing-cert"),
        ("secret_injector_mount_path_a", mount.as_str()),
        ("secret_injector_secret_name_b", "present-cert"),
        ("secret_injector_mount_path_b", mount.as_str()),
    ]);
    let resolver = Arc::new(InMemoryResolver::new().with_secret("kv", "present-cert", "pem"));
    let report = SecretInjector::new(&InjectorConfig::default(), resolver)
        .run(&snapshot)
        .await;

    assert_eq!(report.resolution_failures.len(), 1);
    assert_eq!(report.resolution_failures[0].identifier, "missing-cert");
    assert!(report.materialized.file_failures.is_empty());
    assert_eq!(report.materialized.files_written, vec![dir.path().join("present-cert")]);
    assert!(!dir.path().join("missing-cert").exists());
    let contents = fs::read_to_string(dir.path().join("present-cert")).expect("secret file should exist");
    assert_eq!(contents, "pem");
}
