//! Helm release inspection.

use serde::Deserialize;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

/// Status Helm reports for a successfully installed release.
pub const STATUS_DEPLOYED: &str = "deployed";

#[derive(Debug, Error)]
pub enum HelmError {
    #[error("Failed to start '{binary}': {message}")]
    Spawn { binary: String, message: String },

    #[error("helm list exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("Failed to parse helm output: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Release '{name}' not found in namespace '{namespace}'")]
    NotFound { name: String, namespace: String },

    #[error("Release '{name}' has status '{status}', expected 'deployed'")]
    NotDeployed { name: String, status: String },
}

/// One entry of `helm list --output json`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct HelmRelease {
    pub name: String,
    pub namespace: String,
    pub revision: String,
    pub status: String,
    pub chart: String,
    pub app_version: String,
}

impl HelmRelease {
    pub fn is_deployed(&self) -> bool {
        self.status == STATUS_DEPLOYED
    }
}

/// Parse the JSON array printed by `helm list --output json`.
pub fn parse_releases(json: &str) -> Result<Vec<HelmRelease>, HelmError> {
    let trimmed = json.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    Ok(serde_json::from_str(trimmed)?)
}

pub fn find_release<'a>(releases: &'a [HelmRelease], name: &str) -> Option<&'a HelmRelease> {
    releases.iter().find(|release| release.name == name)
}

/// Thin wrapper over the `helm` CLI.
#[derive(Debug, Clone)]
pub struct HelmClient {
    binary: String,
}

impl Default for HelmClient {
    fn default() -> Self {
        Self {
            binary: "helm".to_string(),
        }
    }
}

impl HelmClient {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// All releases in a namespace, including failed and pending ones.
    pub async fn releases(&self, namespace: &str) -> Result<Vec<HelmRelease>, HelmError> {
        debug!(namespace, "Listing helm releases");

        let output = Command::new(&self.binary)
            .args(["list", "--namespace", namespace, "--all", "--output", "json"])
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| HelmError::Spawn {
                binary: self.binary.clone(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(HelmError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        parse_releases(&String::from_utf8_lossy(&output.stdout))
    }

    /// The named release, which must exist and be deployed.
    pub async fn deployed_release(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<HelmRelease, HelmError> {
        let releases = self.releases(namespace).await?;
        let release = find_release(&releases, name)
            .cloned()
            .ok_or_else(|| HelmError::NotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            })?;

        if !release.is_deployed() {
            return Err(HelmError::NotDeployed {
                name: release.name,
                status: release.status,
            });
        }

        Ok(release)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const LIST_OUTPUT: &str = r#"[
        {"name":"d-1","namespace":"ns","revision":"2","updated":"2024-01-01 00:00:00 +0000 UTC","status":"deployed","chart":"harness-delegate-ng-1.0.15","app_version":"1.0.0"},
        {"name":"d-2","namespace":"ns","revision":"1","status":"failed","chart":"harness-delegate-ng-1.0.15"}
    ]"#;

    #[test]
    fn test_parse_releases() {
        let releases = parse_releases(LIST_OUTPUT).unwrap();

        assert_eq!(releases.len(), 2);
        let first = find_release(&releases, "d-1").unwrap();
        assert_eq!(first.revision, "2");
        assert_eq!(first.app_version, "1.0.0");
        assert!(first.is_deployed());

        let second = find_release(&releases, "d-2").unwrap();
        assert!(!second.is_deployed());
        assert_eq!(second.app_version, "");

        assert!(find_release(&releases, "d-3").is_none());
    }

    #[test]
    fn test_parse_empty_output() {
        assert!(parse_releases("").unwrap().is_empty());
        assert!(parse_releases("[]").unwrap().is_empty());
        assert!(matches!(parse_releases("{").unwrap_err(), HelmError::Parse(_)));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let err = HelmClient::new("definitely-not-helm-xyz")
            .releases("ns")
            .await
            .unwrap_err();
        assert!(matches!(err, HelmError::Spawn { .. }));
    }
}
