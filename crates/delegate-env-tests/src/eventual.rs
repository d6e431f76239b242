//! Readiness polling for resources created by Terraform.
//!
//! Polls use a fixed number of attempts with a fixed pause between them, so a
//! scenario that never becomes ready fails after a bounded time instead of
//! hanging.

use crate::inspector::ResourceInspector;
use k8s_openapi::api::apps::v1::Deployment;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::time::sleep;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum PollError {
    #[error("{description} not satisfied after {attempts} attempts ({sleep_between:?} apart): {last}")]
    Exhausted {
        description: String,
        attempts: u32,
        sleep_between: Duration,
        last: String,
    },
}

/// Fixed-backoff retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollPolicy {
    pub retries: u32,
    pub sleep_between: Duration,
}

impl PollPolicy {
    /// Namespace availability: 10 attempts, 3s apart.
    pub const NAMESPACE: PollPolicy = PollPolicy::new(10, Duration::from_secs(3));

    pub const fn new(retries: u32, sleep_between: Duration) -> Self {
        Self {
            retries,
            sleep_between,
        }
    }

    /// Deployment availability with `retries` attempts, `sleep_between` apart.
    pub const fn deployment(retries: u32, sleep_between: Duration) -> Self {
        Self::new(retries, sleep_between)
    }

    /// Upper bound on the time spent sleeping.
    pub fn budget(&self) -> Duration {
        self.sleep_between * self.retries.saturating_sub(1)
    }
}

/// Run `check` until it returns `Ok` or the policy is exhausted.
///
/// `check` reports why it is not yet satisfied through `Err(String)`; the
/// last reason is carried in [`PollError::Exhausted`].
pub async fn wait_until<T, F, Fut>(
    policy: PollPolicy,
    description: &str,
    mut check: F,
) -> Result<T, PollError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, String>>,
{
    let attempts = policy.retries.max(1);
    let mut last = String::new();

    for attempt in 1..=attempts {
        match check().await {
            Ok(value) => {
                debug!(description, attempt, "Condition satisfied");
                return Ok(value);
            }
            Err(reason) => {
                debug!(description, attempt, reason = %reason, "Condition not yet satisfied");
                last = reason;
            }
        }

        if attempt < attempts {
            sleep(policy.sleep_between).await;
        }
    }

    Err(PollError::Exhausted {
        description: description.to_string(),
        attempts,
        sleep_between: policy.sleep_between,
        last,
    })
}

/// Whether a deployment has fully rolled out.
///
/// Available means the controller observed the latest generation and the
/// updated, ready and available replica counts all equal the desired count
/// with none unavailable. `Err` explains what is still pending.
pub fn deployment_availability(deployment: &Deployment) -> Result<(), String> {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    let generation = deployment.metadata.generation.unwrap_or(0);

    let Some(status) = deployment.status.as_ref() else {
        return Err("deployment has no status yet".to_string());
    };

    let observed = status.observed_generation.unwrap_or(0);
    if observed < generation {
        return Err(format!(
            "observed generation {observed} behind generation {generation}"
        ));
    }

    let updated = status.updated_replicas.unwrap_or(0);
    let ready = status.ready_replicas.unwrap_or(0);
    let available = status.available_replicas.unwrap_or(0);
    let unavailable = status.unavailable_replicas.unwrap_or(0);

    if updated != desired || ready != desired || available != desired || unavailable != 0 {
        return Err(format!(
            "desired={desired} updated={updated} ready={ready} available={available} unavailable={unavailable}"
        ));
    }

    Ok(())
}

/// Wait until the namespace exists with phase `Active`.
pub async fn wait_until_namespace_available(
    inspector: &ResourceInspector,
    name: &str,
    policy: PollPolicy,
) -> Result<(), PollError> {
    wait_until(policy, &format!("namespace '{name}' available"), move || async move {
        let namespace = inspector
            .find_namespace(name)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "namespace not found".to_string())?;

        let phase = namespace
            .status
            .and_then(|status| status.phase)
            .unwrap_or_default();
        if phase == "Active" {
            Ok::<(), String>(())
        } else {
            Err(format!("namespace phase is '{phase}'"))
        }
    })
    .await?;

    info!(namespace = name, "Namespace available");
    Ok(())
}

/// Wait until the named deployment is fully available and return it.
pub async fn wait_until_deployment_available(
    inspector: &ResourceInspector,
    name: &str,
    policy: PollPolicy,
) -> Result<Deployment, PollError> {
    let deployment = wait_until(policy, &format!("deployment '{name}' available"), move || async move {
        let deployment = inspector
            .find_deployment(name)
            .await
            .map_err(|e| e.to_string())?
            .ok_or_else(|| "deployment not found".to_string())?;
        deployment_availability(&deployment)?;
        Ok::<Deployment, String>(deployment)
    })
    .await?;

    info!(deployment = name, namespace = inspector.namespace(), "Deployment available");
    Ok(deployment)
}
