//! Validators for deployed delegate configuration.
//!
//! Each validator returns the first mismatch it finds as a [`ValidationError`]
//! naming the field, the expected value and the actual value. Credential
//! mismatches never echo the values.

use crate::env::{primary_container, ResolvedEnv};
use crate::fixtures::mtls::{CA_CERT_KEY, TLS_CERT_KEY, TLS_PRIVATE_KEY_KEY};
use crate::fixtures::{ProxyConfig, PROXY_ENV_VARS};
use crate::inspector::{InspectError, ResourceInspector};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, PodSpec, Secret};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("{field}: expected '{expected}', found '{actual}'")]
    Mismatch {
        field: String,
        expected: String,
        actual: String,
    },

    #[error("{field}: value does not match the expected credential")]
    CredentialMismatch { field: String },

    #[error("{field} should be unset or empty, found '{actual}'")]
    Unexpected { field: String, actual: String },

    #[error("{kind} '{name}' should exist")]
    MissingResource { kind: &'static str, name: String },

    #[error("{kind} '{name}' should not exist")]
    UnexpectedResource { kind: &'static str, name: String },

    #[error("{0}")]
    Structure(String),

    #[error("Lookup failed during validation: {0}")]
    Lookup(#[from] InspectError),
}

fn mismatch(field: impl Into<String>, expected: impl Into<String>, actual: impl Into<String>) -> ValidationError {
    ValidationError::Mismatch {
        field: field.into(),
        expected: expected.into(),
        actual: actual.into(),
    }
}

fn expect_eq(field: &str, expected: &str, actual: &str) -> Result<(), ValidationError> {
    if expected == actual {
        Ok(())
    } else {
        Err(mismatch(field, expected, actual))
    }
}

fn pod_spec(deployment: &Deployment) -> Result<&PodSpec, ValidationError> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .ok_or_else(|| ValidationError::Structure("deployment has no pod template spec".to_string()))
}

fn container_of(deployment: &Deployment) -> Result<&Container, ValidationError> {
    primary_container(deployment)
        .ok_or_else(|| ValidationError::Structure("deployment has no containers".to_string()))
}

/// Values a freshly deployed delegate must expose.
#[derive(Debug, Clone, Copy)]
pub struct ExpectedDelegate<'a> {
    pub account_id: &'a str,
    pub manager_endpoint: &'a str,
    pub delegate_name: &'a str,
    /// Checked against the container image when set.
    pub image: Option<&'a str>,
}

/// Account, manager endpoint, delegate name and optionally the image.
pub fn validate_basic_configuration(
    env: &ResolvedEnv,
    expected: &ExpectedDelegate<'_>,
    container: &Container,
) -> Result<(), ValidationError> {
    expect_eq("ACCOUNT_ID", expected.account_id, env.value("ACCOUNT_ID"))?;
    expect_eq(
        "MANAGER_HOST_AND_PORT",
        expected.manager_endpoint,
        env.value("MANAGER_HOST_AND_PORT"),
    )?;
    expect_eq("DELEGATE_NAME", expected.delegate_name, env.value("DELEGATE_NAME"))?;

    if let Some(image) = expected.image.filter(|image| !image.is_empty()) {
        expect_eq("image", image, container.image.as_deref().unwrap_or_default())?;
    }

    Ok(())
}

/// Check a single resolved variable.
pub fn validate_env_value(env: &ResolvedEnv, name: &str, expected: &str) -> Result<(), ValidationError> {
    expect_eq(name, expected, env.value(name))
}

/// Proxy variables match `expected`.
///
/// Host, port, scheme and no-proxy compare as text. `PROXY_USER` and
/// `PROXY_PASSWORD` are stored base64-encoded by the module and compare
/// against the encoded literal. An unconfigured `expected` requires every
/// proxy variable to be unset or empty.
pub fn validate_proxy_configuration(
    env: &ResolvedEnv,
    expected: &ProxyConfig,
) -> Result<(), ValidationError> {
    if !expected.is_configured() {
        return validate_no_proxy_configuration(env);
    }

    expect_eq("PROXY_HOST", &expected.host, env.value("PROXY_HOST"))?;
    expect_eq("PROXY_PORT", &expected.port, env.value("PROXY_PORT"))?;
    expect_eq("PROXY_SCHEME", &expected.scheme, env.value("PROXY_SCHEME"))?;

    if !expected.user.is_empty() && env.value("PROXY_USER") != expected.encoded_user() {
        return Err(ValidationError::CredentialMismatch {
            field: "PROXY_USER".to_string(),
        });
    }

    if expected.has_credentials() && env.value("PROXY_PASSWORD") != expected.encoded_password() {
        return Err(ValidationError::CredentialMismatch {
            field: "PROXY_PASSWORD".to_string(),
        });
    }

    if !expected.no_proxy.is_empty() {
        expect_eq("NO_PROXY", &expected.no_proxy, env.value("NO_PROXY"))?;
    }

    Ok(())
}

/// Every proxy variable is unset or empty.
pub fn validate_no_proxy_configuration(env: &ResolvedEnv) -> Result<(), ValidationError> {
    for name in PROXY_ENV_VARS {
        let actual = env.value(name);
        if !actual.is_empty() {
            return Err(ValidationError::Unexpected {
                field: name.to_string(),
                actual: actual.to_string(),
            });
        }
    }
    Ok(())
}

/// Exactly one volume is sourced from `secret_name`, mounted exactly once,
/// read-only, at a non-empty path on the primary container.
pub fn validate_mtls_configuration(
    deployment: &Deployment,
    secret_name: &str,
) -> Result<(), ValidationError> {
    let pod = pod_spec(deployment)?;

    let volumes: Vec<_> = pod
        .volumes
        .iter()
        .flatten()
        .filter(|volume| {
            volume
                .secret
                .as_ref()
                .and_then(|secret| secret.secret_name.as_deref())
                == Some(secret_name)
        })
        .collect();

    let volume = match volumes.as_slice() {
        [volume] => *volume,
        [] => {
            return Err(ValidationError::MissingResource {
                kind: "Volume",
                name: format!("secret volume for '{secret_name}'"),
            })
        }
        many => {
            return Err(mismatch(
                "mTLS secret volumes",
                "1",
                many.len().to_string(),
            ))
        }
    };

    let container = container_of(deployment)?;
    let mounts: Vec<_> = container
        .volume_mounts
        .iter()
        .flatten()
        .filter(|mount| mount.name == volume.name)
        .collect();

    let mount = match mounts.as_slice() {
        [mount] => *mount,
        [] => {
            return Err(ValidationError::MissingResource {
                kind: "VolumeMount",
                name: volume.name.clone(),
            })
        }
        many => return Err(mismatch("mTLS volume mounts", "1", many.len().to_string())),
    };

    if mount.mount_path.is_empty() {
        return Err(ValidationError::Structure(format!(
            "mount '{}' has an empty mount path",
            mount.name
        )));
    }

    if !mount.read_only.unwrap_or(false) {
        return Err(mismatch(
            format!("{}.readOnly", mount.name),
            "true",
            "false",
        ));
    }

    debug!(volume = %volume.name, path = %mount.mount_path, "mTLS volume wired");
    Ok(())
}

// Also matches "mtls".
fn has_tls_marker(name: &str) -> bool {
    name.to_lowercase().contains("tls")
}

/// No TLS-looking mount on the primary container, and no pod volume whose
/// own name or backing secret name looks TLS-related.
pub fn validate_no_mtls_configuration(deployment: &Deployment) -> Result<(), ValidationError> {
    let container = container_of(deployment)?;

    if let Some(mount) = container
        .volume_mounts
        .iter()
        .flatten()
        .find(|mount| has_tls_marker(&mount.name))
    {
        return Err(ValidationError::UnexpectedResource {
            kind: "VolumeMount",
            name: mount.name.clone(),
        });
    }

    let pod = pod_spec(deployment)?;
    if let Some(volume) = pod
        .volumes
        .iter()
        .flatten()
        .find(|volume| has_tls_marker(&volume.name))
    {
        return Err(ValidationError::UnexpectedResource {
            kind: "Volume",
            name: volume.name.clone(),
        });
    }

    let tls_volume = pod.volumes.iter().flatten().find_map(|volume| {
        volume
            .secret
            .as_ref()
            .and_then(|secret| secret.secret_name.as_deref())
            .filter(|name| has_tls_marker(name))
    });

    if let Some(secret_name) = tls_volume {
        return Err(ValidationError::UnexpectedResource {
            kind: "Secret volume",
            name: secret_name.to_string(),
        });
    }

    Ok(())
}

/// Names of the companion resources created when the upgrader is enabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgraderResourceNames {
    pub config_map: String,
    pub token_secret: String,
    pub service_account: String,
    pub cron_job: String,
}

impl UpgraderResourceNames {
    pub fn for_delegate(base: &str) -> Self {
        Self {
            config_map: format!("{base}-upgrader-config"),
            token_secret: format!("{base}-upgrader-token"),
            service_account: format!("{base}-upgrader-cronjob-sa"),
            cron_job: format!("{base}-upgrader-job"),
        }
    }
}

/// All four upgrader companion resources exist.
pub async fn validate_upgrader_resources(
    inspector: &ResourceInspector,
    base: &str,
) -> Result<(), ValidationError> {
    let names = UpgraderResourceNames::for_delegate(base);

    if inspector.find_config_map(&names.config_map).await?.is_none() {
        return Err(ValidationError::MissingResource {
            kind: "ConfigMap",
            name: names.config_map,
        });
    }
    if inspector.find_secret(&names.token_secret).await?.is_none() {
        return Err(ValidationError::MissingResource {
            kind: "Secret",
            name: names.token_secret,
        });
    }
    if inspector
        .find_service_account(&names.service_account)
        .await?
        .is_none()
    {
        return Err(ValidationError::MissingResource {
            kind: "ServiceAccount",
            name: names.service_account,
        });
    }
    if inspector.find_cron_job(&names.cron_job).await?.is_none() {
        return Err(ValidationError::MissingResource {
            kind: "CronJob",
            name: names.cron_job,
        });
    }

    Ok(())
}

/// None of the upgrader companion resources exist.
pub async fn validate_no_upgrader_resources(
    inspector: &ResourceInspector,
    base: &str,
) -> Result<(), ValidationError> {
    let names = UpgraderResourceNames::for_delegate(base);

    if inspector.find_config_map(&names.config_map).await?.is_some() {
        return Err(ValidationError::UnexpectedResource {
            kind: "ConfigMap",
            name: names.config_map,
        });
    }
    if inspector.find_secret(&names.token_secret).await?.is_some() {
        return Err(ValidationError::UnexpectedResource {
            kind: "Secret",
            name: names.token_secret,
        });
    }
    if inspector
        .find_service_account(&names.service_account)
        .await?
        .is_some()
    {
        return Err(ValidationError::UnexpectedResource {
            kind: "ServiceAccount",
            name: names.service_account,
        });
    }
    if inspector.find_cron_job(&names.cron_job).await?.is_some() {
        return Err(ValidationError::UnexpectedResource {
            kind: "CronJob",
            name: names.cron_job,
        });
    }

    Ok(())
}

/// Desired and ready replica counts both equal `expected`.
pub fn validate_replicas(deployment: &Deployment, expected: i32) -> Result<(), ValidationError> {
    let desired = deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.replicas)
        .unwrap_or(1);
    expect_eq("spec.replicas", &expected.to_string(), &desired.to_string())?;

    let ready = deployment
        .status
        .as_ref()
        .and_then(|status| status.ready_replicas)
        .unwrap_or(0);
    expect_eq("status.readyReplicas", &expected.to_string(), &ready.to_string())
}

/// Terraform output is non-empty and mentions every key.
pub fn validate_output_contains(output: &str, keys: &[&str]) -> Result<(), ValidationError> {
    if output.trim().is_empty() {
        return Err(ValidationError::Structure("Terraform output is empty".to_string()));
    }

    match keys.iter().find(|key| !output.contains(**key)) {
        Some(key) => Err(ValidationError::Structure(format!(
            "Terraform output should mention '{key}'"
        ))),
        None => Ok(()),
    }
}

/// Terraform output does not mention `needle`.
pub fn validate_output_excludes(output: &str, needle: &str) -> Result<(), ValidationError> {
    if output.contains(needle) {
        return Err(ValidationError::Structure(format!(
            "Terraform output should not mention '{needle}'"
        )));
    }
    Ok(())
}

/// Certificate, key and CA entries of an mTLS secret look like PEM.
pub fn validate_mtls_secret_data(secret: &Secret) -> Result<(), ValidationError> {
    let checks = [
        (TLS_CERT_KEY, "BEGIN CERTIFICATE"),
        (TLS_PRIVATE_KEY_KEY, "BEGIN PRIVATE KEY"),
        (CA_CERT_KEY, "BEGIN CERTIFICATE"),
    ];

    for (key, marker) in checks {
        let value = secret
            .data
            .as_ref()
            .and_then(|data| data.get(key))
            .map(|bytes| String::from_utf8_lossy(&bytes.0).into_owned())
            .unwrap_or_default();

        if !value.contains(marker) {
            return Err(ValidationError::Structure(format!(
                "secret key '{key}' should contain '{marker}'"
            )));
        }
    }

    Ok(())
}

/// A primary container resource limit, when set, equals `expected`.
///
/// The API server normalises quantities, so `1000m` reads back as `1`.
pub fn validate_resource_limit(
    deployment: &Deployment,
    resource: &str,
    expected: &str,
) -> Result<(), ValidationError> {
    let container = container_of(deployment)?;
    let limit = container
        .resources
        .as_ref()
        .and_then(|resources| resources.limits.as_ref())
        .and_then(|limits| limits.get(resource));

    match limit {
        Some(quantity) => expect_eq(&format!("limits.{resource}"), expected, &quantity.0),
        None => Ok(()),
    }
}

/// A node selector entry, when the pod has a node selector, equals `expected`.
pub fn validate_node_selector(
    deployment: &Deployment,
    key: &str,
    expected: &str,
) -> Result<(), ValidationError> {
    let pod = pod_spec(deployment)?;
    match &pod.node_selector {
        Some(selector) => expect_eq(
            &format!("nodeSelector.{key}"),
            expected,
            selector.get(key).map(String::as_str).unwrap_or_default(),
        ),
        None => Ok(()),
    }
}

/// When the pod has tolerations, one of them is `key=value`.
pub fn validate_toleration(
    deployment: &Deployment,
    key: &str,
    value: &str,
) -> Result<(), ValidationError> {
    let pod = pod_spec(deployment)?;
    let tolerations = pod.tolerations.as_deref().unwrap_or_default();

    if tolerations.is_empty()
        || tolerations
            .iter()
            .any(|t| t.key.as_deref() == Some(key) && t.value.as_deref() == Some(value))
    {
        return Ok(());
    }

    Err(ValidationError::MissingResource {
        kind: "Toleration",
        name: format!("{key}={value}"),
    })
}

/// Resource limits, node selector and toleration from the custom values
/// scenario's raw values block.
pub fn validate_custom_values(deployment: &Deployment) -> Result<(), ValidationError> {
    validate_resource_limit(deployment, "cpu", "1")?;
    validate_resource_limit(deployment, "memory", "2Gi")?;
    validate_node_selector(deployment, "disktype", "ssd")?;
    validate_toleration(deployment, "dedicated", "harness")
}
