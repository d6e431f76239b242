//! Terraform driver for the delegate module.
//!
//! Wraps the `terraform` binary with the retry behaviour integration suites
//! rely on: commands whose output matches a known-transient error pattern are
//! re-run after a fixed pause, everything else fails immediately.
//!
//! Scenarios run concurrently, so each [`Terraform`] built from
//! [`TerraformOptions::from_config`] works in its own temporary copy of the
//! module. Local state and the `.terraform` directory live in that copy and
//! are never shared between scenarios.

use crate::config::SuiteConfig;
use crate::fixtures::DelegateVars;
use regex::Regex;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Binary invoked when none is configured.
pub const DEFAULT_BINARY: &str = "terraform";

/// Prefix of per-scenario working copies under the system temp dir.
pub const WORKING_COPY_PREFIX: &str = "delegate-tf-";

#[derive(Debug, Error)]
pub enum TerraformError {
    #[error("Failed to start '{binary}': {message}")]
    Spawn { binary: String, message: String },

    #[error("terraform {command} exited with {status}:\n{output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },

    #[error("terraform {command} still failing after {attempts} attempts: {last}")]
    RetriesExhausted {
        command: String,
        attempts: u32,
        #[source]
        last: Box<TerraformError>,
    },

    #[error("Invalid retryable error pattern '{pattern}': {source}")]
    InvalidRetryPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("Failed to parse output '{name}': {message}")]
    Output { name: String, message: String },

    #[error("Failed to prepare working copy of {dir:?}: {source}")]
    WorkingCopy {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Error patterns that indicate a transient provider, registry or network
/// failure rather than a problem with the module.
pub fn default_retryable_errors() -> Vec<String> {
    [
        r".*read: connection reset by peer.*",
        r".*TLS handshake timeout.*",
        r".*unexpected EOF.*",
        r".*connection refused.*",
        r".*Failed to load state.*",
        r".*Error installing provider.*",
        r".*Failed to query available provider packages.*",
        r".*timeout while waiting for plugin to start.*",
        r".*timed out waiting for server handshake.*",
        r"could not query provider registry for registry.terraform.io/.*",
        r".*Client.Timeout exceeded while awaiting headers.*",
        r".*Could not download module.*",
        r".*429 Too Many Requests.*",
        r".*the object has been modified; please apply your changes to the latest version.*",
    ]
    .iter()
    .map(|pattern| pattern.to_string())
    .collect()
}

/// Inputs for every Terraform invocation against one module directory.
#[derive(Clone)]
pub struct TerraformOptions {
    pub dir: PathBuf,
    pub vars: BTreeMap<String, Value>,
    pub retryable_errors: Vec<String>,
    /// Extra attempts after the first when a retryable error is hit.
    pub max_retries: u32,
    pub time_between_retries: Duration,
    pub binary: String,
    /// Run in a private temporary copy of `dir` instead of `dir` itself.
    pub working_copy: bool,
}

impl TerraformOptions {
    pub fn new(dir: impl Into<PathBuf>, vars: BTreeMap<String, Value>) -> Self {
        Self {
            dir: dir.into(),
            vars,
            retryable_errors: default_retryable_errors(),
            max_retries: crate::config::DEFAULT_TF_MAX_RETRIES,
            time_between_retries: Duration::from_secs(crate::config::DEFAULT_TF_RETRY_SLEEP_SECONDS),
            binary: DEFAULT_BINARY.to_string(),
            working_copy: false,
        }
    }

    /// Options for the configured module directory and retry policy.
    ///
    /// Always uses a working copy so concurrent scenarios never share state.
    pub fn from_config(config: &SuiteConfig, vars: &DelegateVars) -> Self {
        Self {
            max_retries: config.tf_max_retries,
            time_between_retries: config.tf_retry_sleep,
            working_copy: true,
            ..Self::new(config.module_dir.clone(), vars.to_map())
        }
    }
}

impl fmt::Debug for TerraformOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Values may carry the delegate token; only names are printed.
        f.debug_struct("TerraformOptions")
            .field("dir", &self.dir)
            .field("vars", &self.vars.keys().collect::<Vec<_>>())
            .field("retryable_errors", &self.retryable_errors.len())
            .field("max_retries", &self.max_retries)
            .field("time_between_retries", &self.time_between_retries)
            .field("binary", &self.binary)
            .field("working_copy", &self.working_copy)
            .finish()
    }
}

/// Render variables as `-var name=value` pairs.
///
/// Strings are passed verbatim, `null` is omitted so the module default
/// applies, and everything else is passed as JSON (valid HCL).
pub fn var_args(vars: &BTreeMap<String, Value>) -> Vec<String> {
    vars.iter()
        .filter(|(_, value)| !value.is_null())
        .flat_map(|(name, value)| {
            let rendered = match value {
                Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            ["-var".to_string(), format!("{name}={rendered}")]
        })
        .collect()
}

/// Extract an output value printed by `terraform output -json <name>`.
pub fn parse_output(name: &str, stdout: &str) -> Result<String, TerraformError> {
    let value: Value = serde_json::from_str(stdout.trim()).map_err(|e| TerraformError::Output {
        name: name.to_string(),
        message: e.to_string(),
    })?;

    Ok(match value {
        Value::String(text) => text,
        other => other.to_string(),
    })
}

/// Local state, provider caches and build output; never copied.
fn excluded_from_copy(name: &str) -> bool {
    matches!(name, ".terraform" | ".git" | "target") || name.starts_with("terraform.tfstate")
}

/// Recursively copy a module directory, skipping excluded entries.
///
/// Symlinks and other special files are not copied.
fn copy_module(src: &Path, dst: &Path) -> std::io::Result<()> {
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let name = entry.file_name();
        if name.to_str().is_some_and(excluded_from_copy) {
            continue;
        }

        let target = dst.join(&name);
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            std::fs::create_dir_all(&target)?;
            copy_module(&entry.path(), &target)?;
        } else if file_type.is_file() {
            std::fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

/// Driver for one module directory and variable set.
///
/// Clones share the working copy, so a clone made with [`Terraform::with_vars`]
/// applies against the same state.
#[derive(Debug, Clone)]
pub struct Terraform {
    options: TerraformOptions,
    retryable: Vec<Regex>,
    workdir: Option<Arc<TempDir>>,
}

impl Terraform {
    pub fn new(options: TerraformOptions) -> Result<Self, TerraformError> {
        let retryable = options
            .retryable_errors
            .iter()
            .map(|pattern| {
                Regex::new(pattern).map_err(|source| TerraformError::InvalidRetryPattern {
                    pattern: pattern.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        let workdir = if options.working_copy {
            let working_copy_err = |source: std::io::Error| TerraformError::WorkingCopy {
                dir: options.dir.clone(),
                source,
            };
            let workdir = tempfile::Builder::new()
                .prefix(WORKING_COPY_PREFIX)
                .tempdir()
                .map_err(working_copy_err)?;
            copy_module(&options.dir, workdir.path()).map_err(working_copy_err)?;
            debug!(module = %options.dir.display(), copy = %workdir.path().display(), "Copied module");
            Some(Arc::new(workdir))
        } else {
            None
        };

        Ok(Self {
            options,
            retryable,
            workdir,
        })
    }

    pub fn options(&self) -> &TerraformOptions {
        &self.options
    }

    /// Directory every command runs in, and where local state is kept.
    pub fn working_dir(&self) -> &Path {
        match &self.workdir {
            Some(workdir) => workdir.path(),
            None => &self.options.dir,
        }
    }

    /// Delete the working copy, if any. Commands fail afterwards.
    ///
    /// The copy is also removed when the last clone is dropped.
    pub async fn remove_working_copy(&self) -> Result<(), TerraformError> {
        let Some(workdir) = &self.workdir else {
            return Ok(());
        };

        match tokio::fs::remove_dir_all(workdir.path()).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(TerraformError::WorkingCopy {
                dir: workdir.path().to_path_buf(),
                source,
            }),
        }
    }

    /// Same working copy and retry policy with a different variable set.
    pub fn with_vars(&self, vars: BTreeMap<String, Value>) -> Self {
        let mut next = self.clone();
        next.options.vars = vars;
        next
    }

    /// Whether combined command output matches a retryable pattern.
    pub fn is_retryable(&self, output: &str) -> bool {
        self.retryable.iter().any(|pattern| pattern.is_match(output))
    }

    pub async fn init(&self) -> Result<String, TerraformError> {
        info!(dir = %self.working_dir().display(), "terraform init");
        self.run_with_retry("init", self.command_args("init")).await
    }

    pub async fn apply(&self) -> Result<String, TerraformError> {
        info!(dir = %self.working_dir().display(), "terraform apply");
        self.run_with_retry("apply", self.command_args("apply")).await
    }

    pub async fn init_and_apply(&self) -> Result<String, TerraformError> {
        self.init().await?;
        self.apply().await
    }

    pub async fn destroy(&self) -> Result<String, TerraformError> {
        info!(dir = %self.working_dir().display(), "terraform destroy");
        self.run_with_retry("destroy", self.command_args("destroy")).await
    }

    /// Value of a module output. Non-string outputs come back as compact JSON.
    pub async fn output(&self, name: &str) -> Result<String, TerraformError> {
        let args = vec![
            "output".to_string(),
            "-no-color".to_string(),
            "-json".to_string(),
            name.to_string(),
        ];
        let stdout = self.run_with_retry("output", args).await?;
        parse_output(name, &stdout)
    }

    /// Full argument list for a subcommand.
    pub fn command_args(&self, command: &str) -> Vec<String> {
        let mut args = vec![command.to_string(), "-input=false".to_string()];

        match command {
            "apply" | "destroy" => {
                args.push("-auto-approve".to_string());
                args.push("-no-color".to_string());
                args.extend(var_args(&self.options.vars));
            }
            _ => args.push("-no-color".to_string()),
        }

        args
    }

    async fn run_with_retry(&self, command: &str, args: Vec<String>) -> Result<String, TerraformError> {
        let mut attempt: u32 = 1;

        loop {
            let err = match self.run_once(command, &args).await {
                Ok(stdout) => return Ok(stdout),
                Err(err) => err,
            };

            let retryable =
                matches!(&err, TerraformError::Failed { output, .. } if self.is_retryable(output));
            if !retryable {
                return Err(err);
            }

            if attempt > self.options.max_retries {
                return Err(TerraformError::RetriesExhausted {
                    command: command.to_string(),
                    attempts: attempt,
                    last: Box::new(err),
                });
            }

            warn!(
                command,
                attempt,
                max_retries = self.options.max_retries,
                "Retryable terraform error, retrying in {:?}",
                self.options.time_between_retries
            );
            tokio::time::sleep(self.options.time_between_retries).await;
            attempt += 1;
        }
    }

    async fn run_once(&self, command: &str, args: &[String]) -> Result<String, TerraformError> {
        debug!(command, dir = %self.working_dir().display(), "Running terraform");

        let output = Command::new(&self.options.binary)
            .args(args)
            .current_dir(self.working_dir())
            .env("TF_IN_AUTOMATION", "1")
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TerraformError::Spawn {
                binary: self.options.binary.clone(),
                message: e.to_string(),
            })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TerraformError::Failed {
                command: command.to_string(),
                status: output.status.to_string(),
                output: format!("{stdout}{stderr}"),
            });
        }

        Ok(stdout)
    }
}
