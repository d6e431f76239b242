//! Cluster connection and tooling checks.
//!
//! This module provides the `ClusterConnection` type for validating that the
//! Kubernetes API server and the command-line tools the suite drives are
//! available before running tests.

use crate::inspector::ResourceInspector;
use kube::Client;
use std::process::Stdio;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info};

/// Cluster connection errors.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("No usable Kubernetes configuration found: {0}. Check KUBECONFIG or the current kubectl context")]
    Config(#[source] kube::Error),

    #[error("Kubernetes API server did not answer a version request: {0}. Is the cluster running?")]
    Unreachable(#[source] kube::Error),

    #[error("Required tool '{binary}' could not be started: {message}. Install it and make sure it is on PATH")]
    ToolMissing { binary: String, message: String },

    #[error("Tool '{binary}' exited with status {status}: {stderr}")]
    ToolFailed {
        binary: String,
        status: String,
        stderr: String,
    },
}

/// Connection to the cluster the delegate module deploys into.
#[derive(Clone)]
pub struct ClusterConnection {
    client: Client,
    server_version: String,
}

impl ClusterConnection {
    /// Connect using the default kubeconfig or in-cluster configuration.
    ///
    /// Verifies the API server answers a version request so that tests fail
    /// fast with an actionable message when no cluster is available.
    pub async fn new() -> Result<Self, ClusterError> {
        let client = Client::try_default().await.map_err(ClusterError::Config)?;
        Self::from_client(client).await
    }

    /// Wrap an existing client, verifying the API server is reachable.
    pub async fn from_client(client: Client) -> Result<Self, ClusterError> {
        let info = client
            .apiserver_version()
            .await
            .map_err(ClusterError::Unreachable)?;

        let server_version = info.git_version;
        info!(server_version = %server_version, "Connected to Kubernetes API server");

        Ok(Self {
            client,
            server_version,
        })
    }

    /// Git version string reported by the API server (e.g. `v1.31.0`).
    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    /// Namespace-scoped inspector sharing this connection's client.
    pub fn inspector(&self, namespace: impl Into<String>) -> ResourceInspector {
        ResourceInspector::new(self.client.clone(), namespace)
    }

    /// Run `binary args...` and return its stdout.
    ///
    /// Used to verify `terraform`, `helm` and `kubectl` are installed.
    pub async fn check_tool(binary: &str, args: &[&str]) -> Result<String, ClusterError> {
        debug!(binary, ?args, "Checking tool");

        let output = Command::new(binary)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| ClusterError::ToolMissing {
                binary: binary.to_string(),
                message: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(ClusterError::ToolFailed {
                binary: binary.to_string(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}
