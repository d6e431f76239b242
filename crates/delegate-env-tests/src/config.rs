//! Suite configuration.
//!
//! Configuration is loaded from environment variables, optionally seeded from a
//! local `.env` override file. Process environment variables always win over
//! the file. The delegate token and proxy password are redacted in Debug output.
//!
//! The loaded [`SuiteConfig`] is passed explicitly into scenarios; nothing in
//! this crate reads the process environment after loading.

use crate::fixtures::ProxyConfig;
use secrecy::{ExposeSecret, SecretString};
use std::collections::HashMap;
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Account identifier used when `ACCOUNT_ID` is not set.
pub const DEFAULT_ACCOUNT_ID: &str = "test_account_id";

/// Delegate token used when `DELEGATE_TOKEN` is not set.
pub const DEFAULT_DELEGATE_TOKEN: &str = "test_token";

/// Manager endpoint used when `MANAGER_ENDPOINT` is not set.
pub const DEFAULT_MANAGER_ENDPOINT: &str = "https://app.harness.io";

/// Terraform module directory, relative to this crate's directory.
pub const DEFAULT_MODULE_DIR: &str = "../..";

/// Namespace shared by the upgrader scenarios.
pub const DEFAULT_SHARED_NAMESPACE: &str = "harness-delegate-ng";

/// Default number of Terraform retries after the first attempt.
pub const DEFAULT_TF_MAX_RETRIES: u32 = 3;

/// Default pause between Terraform attempts.
pub const DEFAULT_TF_RETRY_SLEEP_SECONDS: u64 = 5;

/// Variable naming an alternative override file.
pub const ENV_FILE_VAR: &str = "DELEGATE_ENV_FILE";

/// Override file read when `DELEGATE_ENV_FILE` is not set.
pub const DEFAULT_ENV_FILE: &str = ".env";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read override file {path}: {message}")]
    EnvFile { path: PathBuf, message: String },

    #[error("Invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },

    #[error("Live credentials required, set {}", .names.join(" and "))]
    MissingCredentials { names: Vec<&'static str> },
}

/// Inputs shared by every scenario in the suite.
#[derive(Clone)]
pub struct SuiteConfig {
    /// Account the delegate registers with.
    pub account_id: String,

    /// Delegate registration token.
    pub delegate_token: SecretString,

    /// Delegate image reference; the module default is used when unset.
    pub delegate_image: Option<String>,

    /// Manager endpoint the delegate connects to.
    pub manager_endpoint: String,

    /// Proxy settings for proxy-enabled upgrader scenarios.
    pub proxy: ProxyConfig,

    /// Directory holding the Terraform module under test.
    pub module_dir: PathBuf,

    /// Fixed namespace used by the upgrader scenarios.
    pub shared_namespace: String,

    /// Terraform retries after the first attempt when a known-transient
    /// error is hit. Zero disables retrying.
    pub tf_max_retries: u32,

    /// Pause between Terraform attempts.
    pub tf_retry_sleep: Duration,
}

impl fmt::Debug for SuiteConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SuiteConfig")
            .field("account_id", &self.account_id)
            .field("delegate_token", &"[REDACTED]")
            .field("delegate_image", &self.delegate_image)
            .field("manager_endpoint", &self.manager_endpoint)
            .field("proxy", &self.proxy)
            .field("module_dir", &self.module_dir)
            .field("shared_namespace", &self.shared_namespace)
            .field("tf_max_retries", &self.tf_max_retries)
            .field("tf_retry_sleep", &self.tf_retry_sleep)
            .finish()
    }
}

impl SuiteConfig {
    /// Load configuration from the override file and the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let path = env::var(ENV_FILE_VAR).unwrap_or_else(|_| DEFAULT_ENV_FILE.to_string());
        let mut vars = read_env_file(Path::new(&path))?;
        vars.extend(env::vars());
        Self::from_vars(&vars)
    }

    /// Load configuration from a HashMap (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let get = |name: &str| vars.get(name).filter(|v| !v.is_empty()).cloned();
        let text = |name: &str| get(name).unwrap_or_default();

        let tf_max_retries = match get("TF_MAX_RETRIES") {
            Some(value) => {
                value.parse().map_err(|e| ConfigError::InvalidValue {
                    name: "TF_MAX_RETRIES".to_string(),
                    message: format!("must be a non-negative integer, got '{}': {}", value, e),
                })?
            }
            None => DEFAULT_TF_MAX_RETRIES,
        };

        let tf_retry_sleep_seconds = match get("TF_RETRY_SLEEP_SECONDS") {
            Some(value) => value.parse().map_err(|e| ConfigError::InvalidValue {
                name: "TF_RETRY_SLEEP_SECONDS".to_string(),
                message: format!("must be a non-negative integer, got '{}': {}", value, e),
            })?,
            None => DEFAULT_TF_RETRY_SLEEP_SECONDS,
        };

        let proxy = ProxyConfig::new(
            text("PROXY_HOST"),
            text("PROXY_PORT"),
            text("PROXY_SCHEME"),
            text("PROXY_USER"),
            text("PROXY_PASSWORD"),
            text("NO_PROXY"),
        );

        Ok(SuiteConfig {
            account_id: get("ACCOUNT_ID").unwrap_or_else(|| DEFAULT_ACCOUNT_ID.to_string()),
            delegate_token: SecretString::from(
                get("DELEGATE_TOKEN").unwrap_or_else(|| DEFAULT_DELEGATE_TOKEN.to_string()),
            ),
            delegate_image: get("DELEGATE_IMAGE"),
            manager_endpoint: get("MANAGER_ENDPOINT")
                .unwrap_or_else(|| DEFAULT_MANAGER_ENDPOINT.to_string()),
            proxy,
            module_dir: PathBuf::from(
                get("DELEGATE_MODULE_DIR").unwrap_or_else(|| DEFAULT_MODULE_DIR.to_string()),
            ),
            shared_namespace: get("DELEGATE_SHARED_NAMESPACE")
                .unwrap_or_else(|| DEFAULT_SHARED_NAMESPACE.to_string()),
            tf_max_retries,
            tf_retry_sleep: Duration::from_secs(tf_retry_sleep_seconds),
        })
    }

    /// Fail unless `ACCOUNT_ID` and `DELEGATE_TOKEN` were supplied.
    ///
    /// The placeholder defaults never authenticate against a manager, so they
    /// count as missing.
    pub fn require_live_credentials(&self) -> Result<(), ConfigError> {
        let mut names = Vec::new();
        if self.account_id == DEFAULT_ACCOUNT_ID {
            names.push("ACCOUNT_ID");
        }
        if self.delegate_token.expose_secret() == DEFAULT_DELEGATE_TOKEN {
            names.push("DELEGATE_TOKEN");
        }

        if names.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::MissingCredentials { names })
        }
    }
}

/// Read `KEY=value` pairs from an override file without touching the process
/// environment. A missing file yields no variables.
fn read_env_file(path: &Path) -> Result<HashMap<String, String>, ConfigError> {
    let iter = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter,
        Err(e) if e.not_found() => {
            debug!(path = %path.display(), "No override file found");
            return Ok(HashMap::new());
        }
        Err(e) => {
            return Err(ConfigError::EnvFile {
                path: path.to_path_buf(),
                message: e.to_string(),
            })
        }
    };

    let vars = iter
        .collect::<Result<HashMap<_, _>, _>>()
        .map_err(|e| ConfigError::EnvFile {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;

    debug!(path = %path.display(), count = vars.len(), "Loaded override file");
    Ok(vars)
}
