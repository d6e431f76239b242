//! Delegate Deployment Test Suite
//!
//! This crate provides integration tests for the delegate Terraform module.
//! Tests drive `terraform` to deploy the delegate into a live cluster, then
//! inspect the resulting namespaces, deployments, config maps, secrets,
//! service accounts and cron jobs through the Kubernetes API.
//!
//! # Features
//!
//! - `smoke`: Cluster and tooling reachability (30s)
//! - `basic`: Basic delegate deployment (2-3min)
//! - `proxy`: Proxy environment injection
//! - `mtls`: mTLS secret volume wiring
//! - `upgrader`: Upgrader companion resources (needs live credentials)
//! - `scenarios`: Table-driven scenarios and the upgrade flow (10min+)
//! - `all`: Enable all test categories
//!
//! # Prerequisites
//!
//! 1. A reachable cluster in the current kubeconfig context
//! 2. `terraform`, `helm` and `kubectl` in PATH
//! 3. For `upgrader`: `ACCOUNT_ID`, `DELEGATE_TOKEN`, `DELEGATE_IMAGE`,
//!    `MANAGER_ENDPOINT` (and `PROXY_*` for the proxy variant), either exported
//!    or in a `.env` file next to this crate
//!
//! # Usage
//!
//! ```bash
//! # From repo root - runs unit tests only (no default features)
//! cargo test
//!
//! # Smoke tests only (30s)
//! cargo test -p delegate-env-tests --features smoke
//!
//! # Basic, proxy and mTLS deployments
//! cargo test -p delegate-env-tests --features basic,proxy,mtls
//!
//! # Full suite
//! cargo test -p delegate-env-tests --features all
//! ```

pub mod assertions;
pub mod cluster;
pub mod config;
pub mod env;
pub mod eventual;
pub mod fixtures;
pub mod helm;
pub mod inspector;
pub mod scenario;
pub mod telemetry;
pub mod terraform;

pub use cluster::ClusterConnection;
pub use config::SuiteConfig;
pub use env::{resolve_container_env, resolve_deployment_env, EnvSource, ResolvedEnv};
pub use inspector::ResourceInspector;
pub use scenario::{Scenario, ScenarioContext, ScenarioReport, ScenarioRunner, Teardown};
pub use terraform::{Terraform, TerraformOptions};
