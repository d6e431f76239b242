//! P1 Proxy Configuration Tests
//!
//! Verifies that proxy settings passed to the module reach the delegate
//! container environment, and that an explicitly empty proxy leaves every
//! proxy variable empty.

#![cfg(feature = "proxy")]
#![allow(clippy::expect_used, clippy::unwrap_used)]

use delegate_env_tests::assertions::{
    validate_no_proxy_configuration, validate_output_contains, validate_proxy_configuration,
    validate_replicas,
};
use delegate_env_tests::eventual::{
    wait_until_deployment_available, wait_until_namespace_available, PollPolicy,
};
use delegate_env_tests::fixtures::{DelegateVars, ProxyConfig, ScenarioNames};
use delegate_env_tests::scenario::ScenarioError;
use delegate_env_tests::telemetry::init_test_tracing;
use delegate_env_tests::{
    resolve_deployment_env, ClusterConnection, ResourceInspector, SuiteConfig, Teardown,
    Terraform, TerraformOptions,
};
use std::time::Duration;

const DEPLOYMENT_POLICY: PollPolicy = PollPolicy::deployment(10, Duration::from_secs(30));

fn test_proxy() -> ProxyConfig {
    ProxyConfig::new(
        "proxy.company.com",
        "8080",
        "http",
        "proxy_user",
        "proxy_password",
        ".company.com,localhost",
    )
}

struct Deployed {
    names: ScenarioNames,
    inspector: ResourceInspector,
    terraform: Terraform,
}

/// Build names, inspector and Terraform handle for a self-contained run.
async fn prepare(prefix: &str, proxy: ProxyConfig) -> Deployed {
    init_test_tracing();
    let cluster = ClusterConnection::new()
        .await
        .expect("Failed to connect to cluster - check the current kubeconfig context");
    let config = SuiteConfig::from_env().expect("suite configuration should load");

    let names = ScenarioNames::generate(prefix);
    let vars = DelegateVars::new(&names.namespace, &names.delegate_name).with_proxy(proxy);
    let terraform = Terraform::new(TerraformOptions::from_config(&config, &vars))
        .expect("module working copy should be prepared");

    Deployed {
        inspector: cluster.inspector(&names.namespace),
        names,
        terraform,
    }
}

#[tokio::test]
async fn test_delegate_with_proxy() {
    let proxy = test_proxy();
    let Deployed {
        names,
        inspector,
        terraform,
    } = prepare("test-proxy", proxy.clone()).await;

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

            let env = resolve_deployment_env(&inspector, &deployment).await?;
            validate_proxy_configuration(&env, &proxy)?;

            let output = terraform.output("values").await?;
            validate_output_contains(&output, &[proxy.host.as_str(), proxy.port.as_str()])?;

            Ok::<_, ScenarioError>(())
        })
        .await
        .expect("proxy deployment should pass");
}

#[tokio::test]
async fn test_delegate_without_proxy() {
    let Deployed {
        names,
        inspector,
        terraform,
    } = prepare("test-no-proxy", ProxyConfig::none()).await;

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

            let env = resolve_deployment_env(&inspector, &deployment).await?;
            validate_no_proxy_configuration(&env)?;

            Ok::<_, ScenarioError>(())
        })
        .await
        .expect("deployment without proxy should pass");
}
