//! P0 Smoke Tests: Cluster Health
//!
//! These tests validate that the cluster is reachable and the tools the suite
//! drives are installed. All other tests depend on these passing.

#![cfg(feature = "smoke")]
#![allow(clippy::expect_used, clippy::unwrap_used, clippy::panic)]

use delegate_env_tests::cluster::ClusterConnection;
use delegate_env_tests::config::SuiteConfig;
use delegate_env_tests::telemetry::init_test_tracing;

/// Helper to create a cluster connection for tests.
async fn cluster() -> ClusterConnection {
    init_test_tracing();
    ClusterConnection::new()
        .await
        .expect("Failed to connect to cluster - check the current kubeconfig context")
}

#[tokio::test]
async fn test_api_server_reachable() {
    let cluster = cluster().await;

    assert!(
        cluster.server_version().starts_with('v'),
        "API server should report a version, got '{}'",
        cluster.server_version()
    );
}

#[tokio::test]
async fn test_default_namespace_visible() {
    let cluster = cluster().await;

    let namespace = cluster
        .inspector("default")
        .namespace_object("default")
        .await
        .expect("default namespace should be readable");
    assert_eq!(namespace.metadata.name.as_deref(), Some("default"));
}

#[tokio::test]
async fn test_terraform_installed() {
    let version = ClusterConnection::check_tool("terraform", &["version"])
        .await
        .expect("terraform should be installed and on PATH");

    assert!(version.contains("Terraform"), "unexpected output: {version}");
}

#[tokio::test]
async fn test_helm_installed() {
    let version = ClusterConnection::check_tool("helm", &["version", "--short"])
        .await
        .expect("helm should be installed and on PATH");

    assert!(version.starts_with('v'), "unexpected output: {version}");
}

#[tokio::test]
async fn test_kubectl_installed() {
    ClusterConnection::check_tool("kubectl", &["version", "--client"])
        .await
        .expect("kubectl should be installed and on PATH");
}

#[test]
fn test_module_dir_contains_terraform() {
    let config = SuiteConfig::from_env().expect("suite configuration should load");

    let has_tf_files = std::fs::read_dir(&config.module_dir)
        .unwrap_or_else(|e| panic!("module dir {:?} unreadable: {e}", config.module_dir))
        .filter_map(Result::ok)
        .any(|entry| entry.path().extension().is_some_and(|ext| ext == "tf"));

    assert!(
        has_tf_files,
        "{:?} should contain the delegate Terraform module",
        config.module_dir
    );
}
