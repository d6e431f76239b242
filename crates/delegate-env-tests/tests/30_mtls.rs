//! P1 mTLS Configuration Tests
//!
//! The mTLS secret must exist before apply, so these tests create the
//! namespace and secret themselves and ask the module not to create the
//! namespace.

#![cfg(feature = "mtls")]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use delegate_env_tests::assertions::{
    validate_mtls_configuration, validate_no_mtls_configuration, validate_output_contains,
    validate_output_excludes, validate_replicas,
};
use delegate_env_tests::eventual::{
    wait_until_deployment_available, wait_until_namespace_available, PollPolicy,
};
use delegate_env_tests::fixtures::mtls::{
    dummy_tls_secret_data, tls_secret, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY, TLS_SECRET_TYPE,
};
use delegate_env_tests::fixtures::{DelegateVars, ScenarioNames};
use delegate_env_tests::scenario::ScenarioError;
use delegate_env_tests::telemetry::init_test_tracing;
use delegate_env_tests::{ClusterConnection, SuiteConfig, Teardown, Terraform, TerraformOptions};
use std::time::Duration;

const DEPLOYMENT_POLICY: PollPolicy = PollPolicy::deployment(10, Duration::from_secs(30));

async fn cluster() -> ClusterConnection {
    init_test_tracing();
    ClusterConnection::new()
        .await
        .expect("Failed to connect to cluster - check the current kubeconfig context")
}

#[tokio::test]
async fn test_delegate_with_mtls() {
    let cluster = cluster().await;
    let config = SuiteConfig::from_env().expect("suite configuration should load");

    let names = ScenarioNames::generate("test-mtls");
    let inspector = cluster.inspector(&names.namespace);
    let vars = DelegateVars::new(&names.namespace, &names.delegate_name)
        .with_create_namespace(false)
        .with_mtls_secret(&names.mtls_secret_name);

    // Nothing exists in the cluster yet, so a failure here leaks nothing.
    let terraform = Terraform::new(TerraformOptions::from_config(&config, &vars))
        .expect("module working copy should be prepared");

    // Deleting a secret or namespace that was never created is a no-op, so
    // both are registered before anything is created.
    let mut teardown = Teardown::new(inspector.clone())
        .with_terraform(terraform.clone())
        .with_namespace();
    teardown.add_secrets([names.mtls_secret_name.clone()]);

    teardown
        .guard(async {
            inspector.create_namespace().await?;
            wait_until_namespace_available(&inspector, &names.namespace, PollPolicy::NAMESPACE)
                .await?;
            let secret = tls_secret(
                &names.mtls_secret_name,
                &names.namespace,
                dummy_tls_secret_data(),
            );
            inspector.create_secret(&secret).await?;

            terraform.init_and_apply().await?;

            let deployment =
                wait_until_deployment_available(&inspector, &names.delegate_name, DEPLOYMENT_POLICY)
                    .await?;
            validate_replicas(&deployment, 1)?;
            validate_mtls_configuration(&deployment, &names.mtls_secret_name)?;

            let output = terraform.output("values").await?;
            validate_output_contains(&output, &[names.mtls_secret_name.as_str()])?;

            let secret = inspector.secret(&names.mtls_secret_name).await?;
            assert_eq!(secret.type_.as_deref(), Some(TLS_SECRET_TYPE));
            let data = secret.data.expect("mTLS secret should carry data");
            assert!(data.contains_key(TLS_CERT_KEY));
            assert!(data.contains_key(TLS_PRIVATE_KEY_KEY));

            Ok::<_, ScenarioError>(())
        })
        .await
        .expect("mTLS deployment should pass");
}

#[tokio::test]
async fn test_delegate_without_mtls() {
    let cluster = cluster().await;
    let config = SuiteConfig::from_env().expect("suite configuration should load");

    let names = ScenarioNames::generate("test-no-mtls");
    let inspector = cluster.inspector(&names.namespace);
    let vars = DelegateVars::new(&names.namespace, &names.delegate_name).with_mtls_secret("");
    let terraform = Terraform::new(TerraformOptions::from_config(&config, &vars))
        .expect("module working copy should be prepared");

    Teardown::new(inspector.clone())
        .with_terraform(terraform.clone())
        .with_namespace()
        .guard(async {
            terraform.init_and_apply().await?;
            wait_until_namespace_available(&inspector, &names.namespace, PollPolicy::NAMESPACE)
                .await?;

            let deployment =
                wait_until_deployment_available(&inspector, &names.delegate_name, DEPLOYMENT_POLICY)
                    .await?;
            validate_replicas(&deployment, 1)?;
            validate_no_mtls_configuration(&deployment)?;

            // The generated secret name was never created or passed to the module.
            let output = terraform.output("values").await?;
            validate_output_excludes(&output, &names.mtls_secret_name)?;

            Ok::<_, ScenarioError>(())
        })
        .await
        .expect("deployment without mTLS should pass");
}
