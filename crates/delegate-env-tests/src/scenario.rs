//! Table-driven delegate scenarios.
//!
//! A [`Scenario`] is a named variable set plus optional setup and a validation
//! callback. [`ScenarioRunner::run`] provisions it into a fresh namespace,
//! waits for the delegate, validates, and always tears down, including when
//! validation fails or panics.

use crate::assertions::{validate_output_contains, validate_replicas, ValidationError};
use crate::cluster::ClusterConnection;
use crate::config::SuiteConfig;
use crate::env::{resolve_deployment_env, ResolveError, ResolvedEnv};
use crate::eventual::{
    wait_until_deployment_available, wait_until_namespace_available, PollError, PollPolicy,
};
use crate::fixtures::mtls::{realistic_tls_secret_data, tls_secret};
use crate::fixtures::{DelegateVars, ScenarioNames};
use crate::helm::{HelmClient, HelmError};
use crate::inspector::{InspectError, ResourceInspector};
use crate::terraform::{Terraform, TerraformError, TerraformOptions};
use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::apps::v1::Deployment;
use serde_json::{json, Value};
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::panic::{resume_unwind, AssertUnwindSafe};
use std::time::Duration;
use thiserror::Error;
use tracing::{error, info, warn};

/// Deployment readiness budget used by the scenario runner.
pub const DEFAULT_DEPLOYMENT_POLICY: PollPolicy = PollPolicy::new(20, Duration::from_secs(15));

#[derive(Debug, Error)]
pub enum ScenarioError {
    #[error("Scenario '{scenario}' failed: {}", .failures.join("; "))]
    Failed {
        scenario: String,
        failures: Vec<String>,
    },

    #[error("Setup failed: {0}")]
    Setup(String),

    #[error("Provisioning failed: {0}")]
    Provision(#[from] TerraformError),

    #[error(transparent)]
    Inspect(#[from] InspectError),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Poll(#[from] PollError),

    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Helm(#[from] HelmError),

    #[error("Teardown incomplete: {}", .0.join("; "))]
    Teardown(Vec<String>),
}

/// Named validator outcomes for one scenario.
///
/// Independent checks keep running after a failure; the report fails as a
/// whole when any check failed.
#[derive(Debug, Default)]
pub struct ScenarioReport {
    scenario: String,
    passed: Vec<String>,
    failures: Vec<String>,
}

impl ScenarioReport {
    pub fn new(scenario: impl Into<String>) -> Self {
        Self {
            scenario: scenario.into(),
            ..Self::default()
        }
    }

    /// Record the outcome of a named check. Returns whether it passed.
    pub fn check<E: fmt::Display>(&mut self, name: &str, result: Result<(), E>) -> bool {
        match result {
            Ok(()) => {
                self.passed.push(name.to_string());
                true
            }
            Err(e) => {
                self.fail(name, e);
                false
            }
        }
    }

    pub fn fail(&mut self, name: &str, reason: impl fmt::Display) {
        warn!(scenario = %self.scenario, check = name, reason = %reason, "Check failed");
        self.failures.push(format!("{name}: {reason}"));
    }

    pub fn merge(&mut self, other: ScenarioReport) {
        self.passed.extend(other.passed);
        self.failures.extend(other.failures);
    }

    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn failures(&self) -> &[String] {
        &self.failures
    }

    pub fn passed(&self) -> &[String] {
        &self.passed
    }

    pub fn into_result(self) -> Result<(), ScenarioError> {
        if self.failures.is_empty() {
            Ok(())
        } else {
            Err(ScenarioError::Failed {
                scenario: self.scenario,
                failures: self.failures,
            })
        }
    }
}

/// Everything a validation callback can look at.
pub struct ScenarioContext {
    pub inspector: ResourceInspector,
    pub names: ScenarioNames,
    pub vars: BTreeMap<String, Value>,
    pub terraform: Terraform,
}

impl ScenarioContext {
    pub fn delegate_name(&self) -> &str {
        &self.names.delegate_name
    }

    pub fn namespace(&self) -> &str {
        self.inspector.namespace()
    }

    /// String variable as passed to Terraform.
    pub fn var_str(&self, name: &str) -> Option<&str> {
        self.vars.get(name).and_then(Value::as_str)
    }

    /// Desired replica count, falling back to the module default of 1.
    pub fn replicas(&self) -> i32 {
        self.vars
            .get("replicas")
            .and_then(Value::as_i64)
            .and_then(|n| i32::try_from(n).ok())
            .unwrap_or(1)
    }

    pub fn mtls_secret_name(&self) -> Option<&str> {
        self.var_str("mtls_secret_name")
    }

    pub async fn deployment(&self) -> Result<Deployment, InspectError> {
        self.inspector.deployment(self.delegate_name()).await
    }

    /// Resolved environment of the delegate's primary container.
    pub async fn resolved_env(&self) -> Result<ResolvedEnv, ScenarioError> {
        let deployment = self.deployment().await?;
        Ok(resolve_deployment_env(&self.inspector, &deployment).await?)
    }
}

/// Creates objects a scenario needs before apply; returns the secrets it created.
pub type SetupFn = for<'a> fn(
    &'a ResourceInspector,
    &'a ScenarioNames,
) -> BoxFuture<'a, Result<Vec<String>, ScenarioError>>;

/// Scenario-specific checks run once the delegate is available.
pub type ValidateFn = for<'a> fn(&'a ScenarioContext) -> BoxFuture<'a, ScenarioReport>;

/// Setup for scenarios that need nothing beyond their namespace.
pub fn no_setup<'a>(
    _inspector: &'a ResourceInspector,
    _names: &'a ScenarioNames,
) -> BoxFuture<'a, Result<Vec<String>, ScenarioError>> {
    async { Ok::<_, ScenarioError>(Vec::new()) }.boxed()
}

/// Setup creating a PEM-shaped `kubernetes.io/tls` secret for mTLS.
pub fn mtls_secret_setup<'a>(
    inspector: &'a ResourceInspector,
    names: &'a ScenarioNames,
) -> BoxFuture<'a, Result<Vec<String>, ScenarioError>> {
    async move {
        let secret = tls_secret(
            &names.mtls_secret_name,
            inspector.namespace(),
            realistic_tls_secret_data(),
        );
        inspector.create_secret(&secret).await?;
        Ok::<_, ScenarioError>(vec![names.mtls_secret_name.clone()])
    }
    .boxed()
}

/// One row of the scenario table.
#[derive(Clone)]
pub struct Scenario {
    pub name: &'static str,
    pub description: &'static str,
    pub vars: BTreeMap<String, Value>,
    pub setup: SetupFn,
    pub validate: ValidateFn,
}

impl Scenario {
    pub fn new(name: &'static str, description: &'static str, validate: ValidateFn) -> Self {
        Self {
            name,
            description,
            vars: BTreeMap::new(),
            setup: no_setup,
            validate,
        }
    }

    pub fn with_var(mut self, name: &str, value: Value) -> Self {
        self.vars.insert(name.to_string(), value);
        self
    }

    pub fn with_setup(mut self, setup: SetupFn) -> Self {
        self.setup = setup;
        self
    }
}

impl fmt::Debug for Scenario {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scenario")
            .field("name", &self.name)
            .field("description", &self.description)
            .field("vars", &self.vars.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Resources to remove when a scenario ends.
///
/// Order: Terraform destroy, then manually created secrets, then the
/// namespace. Every step runs even if an earlier one failed. The Terraform
/// working copy is deleted once destroy succeeds; after a failed destroy it
/// stays until the last clone is dropped.
pub struct Teardown {
    inspector: ResourceInspector,
    terraform: Option<Terraform>,
    secrets: Vec<String>,
    delete_namespace: bool,
    finished: bool,
}

impl Teardown {
    pub fn new(inspector: ResourceInspector) -> Self {
        Self {
            inspector,
            terraform: None,
            secrets: Vec::new(),
            delete_namespace: false,
            finished: false,
        }
    }

    /// Also delete the inspector's namespace.
    pub fn with_namespace(mut self) -> Self {
        self.delete_namespace = true;
        self
    }

    pub fn with_terraform(mut self, terraform: Terraform) -> Self {
        self.terraform = Some(terraform);
        self
    }

    pub fn set_terraform(&mut self, terraform: Terraform) {
        self.terraform = Some(terraform);
    }

    pub fn add_secrets(&mut self, secrets: impl IntoIterator<Item = String>) {
        self.secrets
            .extend(secrets.into_iter().filter(|name| !name.is_empty()));
    }

    /// Run every cleanup step, returning the failures.
    pub async fn run(mut self) -> Vec<String> {
        self.finished = true;
        let mut failures = Vec::new();

        if let Some(terraform) = self.terraform.take() {
            match terraform.destroy().await {
                Ok(_) => {
                    if let Err(e) = terraform.remove_working_copy().await {
                        warn!(error = %e, "Failed to remove terraform working copy");
                        failures.push(format!("remove working copy: {e}"));
                    }
                }
                Err(e) => {
                    error!(
                        error = %e,
                        dir = %terraform.working_dir().display(),
                        "terraform destroy failed"
                    );
                    failures.push(format!("terraform destroy: {e}"));
                }
            }
        }

        for secret in std::mem::take(&mut self.secrets) {
            if let Err(e) = self.inspector.delete_secret(&secret).await {
                warn!(secret = %secret, error = %e, "Failed to delete secret");
                failures.push(format!("delete secret {secret}: {e}"));
            }
        }

        if self.delete_namespace {
            if let Err(e) = self.inspector.delete_namespace().await {
                warn!(namespace = %self.inspector.namespace(), error = %e, "Failed to delete namespace");
                failures.push(format!("delete namespace: {e}"));
            }
        }

        info!(namespace = %self.inspector.namespace(), failures = failures.len(), "Teardown complete");
        failures
    }

    /// Tear down after `outcome`, then resume a captured panic.
    ///
    /// A body error wins over teardown failures; a successful body with a
    /// failed teardown reports [`ScenarioError::Teardown`].
    pub async fn finish<T>(
        self,
        outcome: Result<Result<T, ScenarioError>, Box<dyn Any + Send>>,
    ) -> Result<T, ScenarioError> {
        let failures = self.run().await;

        match outcome {
            Err(panic) => resume_unwind(panic),
            Ok(Err(e)) => {
                for failure in &failures {
                    warn!(failure = %failure, "Teardown failure after scenario error");
                }
                Err(e)
            }
            Ok(Ok(_)) if !failures.is_empty() => Err(ScenarioError::Teardown(failures)),
            Ok(Ok(value)) => Ok(value),
        }
    }

    /// Run `body`, then tear down on every exit path.
    pub async fn guard<T, Fut>(self, body: Fut) -> Result<T, ScenarioError>
    where
        Fut: Future<Output = Result<T, ScenarioError>>,
    {
        let outcome = AssertUnwindSafe(body).catch_unwind().await;
        self.finish(outcome).await
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        let pending = self.terraform.is_some() || !self.secrets.is_empty() || self.delete_namespace;
        if !self.finished && pending {
            warn!(
                namespace = %self.inspector.namespace(),
                "Teardown dropped without running; resources may be left behind"
            );
        }
    }
}

/// Runs scenarios against one cluster with one suite configuration.
pub struct ScenarioRunner {
    cluster: ClusterConnection,
    config: SuiteConfig,
    deployment_policy: PollPolicy,
    helm: HelmClient,
}

impl ScenarioRunner {
    pub fn new(cluster: ClusterConnection, config: SuiteConfig) -> Self {
        Self {
            cluster,
            config,
            deployment_policy: DEFAULT_DEPLOYMENT_POLICY,
            helm: HelmClient::default(),
        }
    }

    pub fn with_deployment_policy(mut self, policy: PollPolicy) -> Self {
        self.deployment_policy = policy;
        self
    }

    pub fn config(&self) -> &SuiteConfig {
        &self.config
    }

    /// Provision, validate and tear down one scenario.
    pub async fn run(&self, scenario: &Scenario) -> Result<(), ScenarioError> {
        let names = ScenarioNames::generate(&format!("test-{}", scenario.name));
        let inspector = self.cluster.inspector(&names.namespace);

        info!(
            scenario = scenario.name,
            namespace = %names.namespace,
            delegate = %names.delegate_name,
            "Running scenario"
        );

        inspector.create_namespace().await?;
        let mut teardown = Teardown::new(inspector.clone()).with_namespace();

        let outcome = AssertUnwindSafe(self.provision_and_validate(
            scenario,
            &names,
            &inspector,
            &mut teardown,
        ))
        .catch_unwind()
        .await;

        teardown.finish(outcome).await
    }

    /// Effective Terraform variables: module defaults, scenario overrides, the
    /// first created secret as the mTLS secret, and no namespace creation.
    pub fn scenario_vars(
        scenario: &Scenario,
        names: &ScenarioNames,
        created_secrets: &[String],
    ) -> BTreeMap<String, Value> {
        let mut vars = DelegateVars::new(&names.namespace, &names.delegate_name).to_map();
        vars.extend(scenario.vars.clone());

        if let Some(secret) = created_secrets.first() {
            vars.insert("mtls_secret_name".to_string(), json!(secret));
        }

        vars.insert("create_namespace".to_string(), json!(false));
        vars
    }

    async fn provision_and_validate(
        &self,
        scenario: &Scenario,
        names: &ScenarioNames,
        inspector: &ResourceInspector,
        teardown: &mut Teardown,
    ) -> Result<(), ScenarioError> {
        let secrets = (scenario.setup)(inspector, names).await?;
        teardown.add_secrets(secrets.iter().cloned());

        let vars = Self::scenario_vars(scenario, names, &secrets);
        let mut options = TerraformOptions::from_config(
            &self.config,
            &DelegateVars::new(&names.namespace, &names.delegate_name),
        );
        options.vars = vars.clone();
        let terraform = Terraform::new(options)?;
        teardown.set_terraform(terraform.clone());

        terraform.init_and_apply().await?;

        wait_until_namespace_available(inspector, &names.namespace, PollPolicy::NAMESPACE).await?;
        wait_until_deployment_available(inspector, &names.delegate_name, self.deployment_policy)
            .await?;

        let context = ScenarioContext {
            inspector: inspector.clone(),
            names: names.clone(),
            vars,
            terraform,
        };

        let mut report = (scenario.validate)(&context).await;
        report.merge(self.common_checks(scenario, &context).await);
        report.into_result()
    }

    async fn common_checks(&self, scenario: &Scenario, context: &ScenarioContext) -> ScenarioReport {
        let mut report = ScenarioReport::new(scenario.name);

        match context.deployment().await {
            Ok(deployment) => {
                report.check("deployment ready", validate_replicas(&deployment, context.replicas()));
            }
            Err(e) => report.fail("deployment ready", e),
        }

        let release = self
            .helm
            .deployed_release(context.namespace(), context.delegate_name())
            .await
            .map(|_| ());
        report.check("helm release deployed", release);

        match context.terraform.output("values").await {
            Ok(output) => {
                report.check("values output", validate_output_contains(&output, &[]));
            }
            Err(e) => report.fail("values output", e),
        }

        report
    }
}
