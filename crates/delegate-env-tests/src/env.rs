//! Effective container environment resolution.
//!
//! Kubernetes assembles a container's environment from three places: literal
//! `env` values, single-key `valueFrom` references into a config map or
//! secret, and bulk `envFrom` imports. [`resolve_container_env`] reproduces
//! that merge against live objects so assertions can compare what the
//! delegate process actually sees.
//!
//! Precedence is fixed: literals, then references, then bulk imports. Once a
//! key is set, later sources never overwrite it.

use crate::inspector::{InspectError, ResourceInspector};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Container, EnvVar, Secret};
use k8s_openapi::ByteString;
use std::collections::btree_map::{self, BTreeMap};
use std::future::Future;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("{kind} '{name}' referenced by the container environment does not exist")]
    SourceMissing { kind: &'static str, name: String },

    #[error("Failed to fetch environment source: {0}")]
    Fetch(#[from] InspectError),

    #[error("Deployment '{deployment}' has no containers")]
    NoContainer { deployment: String },
}

/// Fetches the objects a container environment can reference.
///
/// Absence is reported as `Ok(None)` so the resolver can honour `optional`.
pub trait EnvSource {
    fn fetch_config_map(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<ConfigMap>, InspectError>> + Send;

    fn fetch_secret(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<Option<Secret>, InspectError>> + Send;
}

impl EnvSource for ResourceInspector {
    async fn fetch_config_map(&self, name: &str) -> Result<Option<ConfigMap>, InspectError> {
        self.find_config_map(name).await
    }

    async fn fetch_secret(&self, name: &str) -> Result<Option<Secret>, InspectError> {
        self.find_secret(name).await
    }
}

/// Resolved environment of one container, keyed by variable name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedEnv {
    vars: BTreeMap<String, String>,
}

impl ResolvedEnv {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.vars.get(name).map(String::as_str)
    }

    /// Value of `name`, or the empty string when unset.
    pub fn value(&self, name: &str) -> &str {
        self.get(name).unwrap_or_default()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.vars.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.vars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vars.is_empty()
    }

    pub fn iter(&self) -> btree_map::Iter<'_, String, String> {
        self.vars.iter()
    }

    /// Insert unless the key is already set. Returns whether it was inserted.
    fn insert_if_absent(&mut self, name: String, value: String) -> bool {
        match self.vars.entry(name) {
            btree_map::Entry::Vacant(entry) => {
                entry.insert(value);
                true
            }
            btree_map::Entry::Occupied(_) => false,
        }
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for ResolvedEnv {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut env = ResolvedEnv::new();
        for (name, value) in iter {
            env.insert_if_absent(name.into(), value.into());
        }
        env
    }
}

impl<'a> IntoIterator for &'a ResolvedEnv {
    type Item = (&'a String, &'a String);
    type IntoIter = btree_map::Iter<'a, String, String>;

    fn into_iter(self) -> Self::IntoIter {
        self.vars.iter()
    }
}

fn decode(bytes: &ByteString) -> String {
    String::from_utf8_lossy(&bytes.0).into_owned()
}

fn config_map_value(config_map: &ConfigMap, key: &str) -> Option<String> {
    config_map
        .data
        .as_ref()
        .and_then(|data| data.get(key).cloned())
        .or_else(|| {
            config_map
                .binary_data
                .as_ref()
                .and_then(|data| data.get(key))
                .map(decode)
        })
}

fn config_map_entries(config_map: &ConfigMap) -> Vec<(String, String)> {
    let text = config_map.data.iter().flatten().map(|(k, v)| (k.clone(), v.clone()));
    let binary = config_map
        .binary_data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), decode(v)));
    text.chain(binary).collect()
}

fn secret_value(secret: &Secret, key: &str) -> Option<String> {
    secret.data.as_ref().and_then(|data| data.get(key)).map(decode)
}

fn secret_entries(secret: &Secret) -> Vec<(String, String)> {
    secret
        .data
        .iter()
        .flatten()
        .map(|(k, v)| (k.clone(), decode(v)))
        .collect()
}

async fn resolve_reference<S: EnvSource + Sync>(
    source: &S,
    var: &EnvVar,
) -> Result<Option<String>, ResolveError> {
    let Some(value_from) = &var.value_from else {
        return Ok(None);
    };

    if let Some(selector) = &value_from.config_map_key_ref {
        return match source.fetch_config_map(&selector.name).await? {
            Some(config_map) => Ok(config_map_value(&config_map, &selector.key)),
            None if selector.optional.unwrap_or(false) => {
                debug!(var = %var.name, config_map = %selector.name, "Optional config map absent");
                Ok(None)
            }
            None => Err(ResolveError::SourceMissing {
                kind: "ConfigMap",
                name: selector.name.clone(),
            }),
        };
    }

    if let Some(selector) = &value_from.secret_key_ref {
        return match source.fetch_secret(&selector.name).await? {
            Some(secret) => Ok(secret_value(&secret, &selector.key)),
            None if selector.optional.unwrap_or(false) => {
                debug!(var = %var.name, secret = %selector.name, "Optional secret absent");
                Ok(None)
            }
            None => Err(ResolveError::SourceMissing {
                kind: "Secret",
                name: selector.name.clone(),
            }),
        };
    }

    debug!(var = %var.name, "Skipping downward API reference");
    Ok(None)
}

/// Resolve the effective environment of a container.
///
/// Sources are fetched on every call. A reference to a key missing from an
/// existing source leaves the variable unset.
pub async fn resolve_container_env<S: EnvSource + Sync>(
    source: &S,
    container: &Container,
) -> Result<ResolvedEnv, ResolveError> {
    let mut env = ResolvedEnv::new();
    let vars = container.env.as_deref().unwrap_or_default();

    for var in vars.iter().filter(|var| var.value_from.is_none()) {
        env.insert_if_absent(var.name.clone(), var.value.clone().unwrap_or_default());
    }

    for var in vars.iter().filter(|var| var.value_from.is_some()) {
        if env.contains(&var.name) {
            continue;
        }
        if let Some(value) = resolve_reference(source, var).await? {
            env.insert_if_absent(var.name.clone(), value);
        }
    }

    for env_from in container.env_from.iter().flatten() {
        let prefix = env_from.prefix.as_deref().unwrap_or_default();

        let entries = if let Some(cm_ref) = &env_from.config_map_ref {
            match source.fetch_config_map(&cm_ref.name).await? {
                Some(config_map) => config_map_entries(&config_map),
                None if cm_ref.optional.unwrap_or(false) => {
                    warn!(config_map = %cm_ref.name, "Optional envFrom config map not found");
                    continue;
                }
                None => {
                    return Err(ResolveError::SourceMissing {
                        kind: "ConfigMap",
                        name: cm_ref.name.clone(),
                    })
                }
            }
        } else if let Some(secret_ref) = &env_from.secret_ref {
            match source.fetch_secret(&secret_ref.name).await? {
                Some(secret) => secret_entries(&secret),
                None if secret_ref.optional.unwrap_or(false) => {
                    warn!(secret = %secret_ref.name, "Optional envFrom secret not found");
                    continue;
                }
                None => {
                    return Err(ResolveError::SourceMissing {
                        kind: "Secret",
                        name: secret_ref.name.clone(),
                    })
                }
            }
        } else {
            continue;
        };

        for (key, value) in entries {
            env.insert_if_absent(format!("{prefix}{key}"), value);
        }
    }

    debug!(container = %container.name, count = env.len(), "Resolved container environment");
    Ok(env)
}

/// First container of a deployment's pod template.
pub fn primary_container(deployment: &Deployment) -> Option<&Container> {
    deployment
        .spec
        .as_ref()
        .and_then(|spec| spec.template.spec.as_ref())
        .and_then(|pod| pod.containers.first())
}

/// Resolve the environment of a deployment's primary container.
pub async fn resolve_deployment_env<S: EnvSource + Sync>(
    source: &S,
    deployment: &Deployment,
) -> Result<ResolvedEnv, ResolveError> {
    let container = primary_container(deployment).ok_or_else(|| ResolveError::NoContainer {
        deployment: deployment.metadata.name.clone().unwrap_or_default(),
    })?;
    resolve_container_env(source, container).await
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct MemorySource {
        config_maps: HashMap<String, ConfigMap>,
        secrets: HashMap<String, Secret>,
        fetches: AtomicUsize,
    }

    impl MemorySource {
        fn with_config_map(mut self, name: &str, data: &[(&str, &str)]) -> Self {
            let config_map: ConfigMap = serde_json::from_value(json!({
                "metadata": { "name": name },
                "data": data.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect::<HashMap<_, _>>(),
            }))
            .unwrap();
            self.config_maps.insert(name.to_string(), config_map);
            self
        }

        fn with_secret(mut self, name: &str, data: &[(&str, &[u8])]) -> Self {
            let secret = Secret {
                metadata: Default::default(),
                data: Some(
                    data.iter()
                        .map(|(k, v)| (k.to_string(), ByteString(v.to_vec())))
                        .collect(),
                ),
                ..Default::default()
            };
            self.secrets.insert(name.to_string(), secret);
            self
        }
    }

    impl EnvSource for MemorySource {
        async fn fetch_config_map(&self, name: &str) -> Result<Option<ConfigMap>, InspectError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.config_maps.get(name).cloned())
        }

        async fn fetch_secret(&self, name: &str) -> Result<Option<Secret>, InspectError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(self.secrets.get(name).cloned())
        }
    }

    fn container(spec: serde_json::Value) -> Container {
        let mut value = spec;
        value["name"] = json!("delegate");
        serde_json::from_value(value).unwrap()
    }

    #[tokio::test]
    async fn test_literals_take_precedence_over_every_other_source() {
        let source = MemorySource::default()
            .with_config_map("cm", &[("ACCOUNT_ID", "from-cm"), ("OTHER", "x")])
            .with_secret("sec", &[("ACCOUNT_ID", b"from-secret")]);

        let container = container(json!({
            "env": [
                { "name": "ACCOUNT_ID", "valueFrom": { "secretKeyRef": { "name": "sec", "key": "ACCOUNT_ID" } } },
                { "name": "ACCOUNT_ID", "value": "literal" },
            ],
            "envFrom": [ { "configMapRef": { "name": "cm" } } ],
        }));

        let env = resolve_container_env(&source, &container).await.unwrap();

        assert_eq!(env.get("ACCOUNT_ID"), Some("literal"));
        assert_eq!(env.get("OTHER"), Some("x"));
    }

    #[tokio::test]
    async fn test_first_literal_wins_for_duplicate_keys() {
        let source = MemorySource::default();
        let container = container(json!({
            "env": [
                { "name": "A", "value": "first" },
                { "name": "A", "value": "second" },
                { "name": "EMPTY" },
            ],
        }));

        let env = resolve_container_env(&source, &container).await.unwrap();

        assert_eq!(env.get("A"), Some("first"));
        assert_eq!(env.get("EMPTY"), Some(""));
        assert_eq!(env.len(), 2);
    }

    #[tokio::test]
    async fn test_references_beat_bulk_imports() {
        let source = MemorySource::default()
            .with_config_map("bulk", &[("PROXY_HOST", "bulk-host")])
            .with_config_map("single", &[("host", "ref-host")]);

        let container = container(json!({
            "env": [
                { "name": "PROXY_HOST", "valueFrom": { "configMapKeyRef": { "name": "single", "key": "host" } } },
            ],
            "envFrom": [ { "configMapRef": { "name": "bulk" } } ],
        }));

        let env = resolve_container_env(&source, &container).await.unwrap();
        assert_eq!(env.get("PROXY_HOST"), Some("ref-host"));
    }

    #[tokio::test]
    async fn test_earlier_bulk_import_wins() {
        let source = MemorySource::default()
            .with_config_map("first", &[("KEY", "one")])
            .with_secret("second", &[("KEY", b"two"), ("ONLY_SECRET", b"s")]);

        let container = container(json!({
            "envFrom": [
                { "configMapRef": { "name": "first" } },
                { "secretRef": { "name": "second" } },
            ],
        }));

        let env = resolve_container_env(&source, &container).await.unwrap();

        assert_eq!(env.get("KEY"), Some("one"));
        assert_eq!(env.get("ONLY_SECRET"), Some("s"));
    }

    #[tokio::test]
    async fn test_optional_sources_may_be_absent() {
        let source = MemorySource::default();
        let container = container(json!({
            "env": [
                { "name": "TOKEN", "valueFrom": { "secretKeyRef": { "name": "nope", "key": "t", "optional": true } } },
            ],
            "envFrom": [
                { "configMapRef": { "name": "missing-cm", "optional": true } },
                { "secretRef": { "name": "missing-secret", "optional": true } },
            ],
        }));

        let env = resolve_container_env(&source, &container).await.unwrap();
        assert!(env.is_empty());
    }

    #[tokio::test]
    async fn test_required_bulk_source_missing_is_error() {
        let source = MemorySource::default();
        let container = container(json!({
            "envFrom": [ { "secretRef": { "name": "delegate-proxy" } } ],
        }));

        let err = resolve_container_env(&source, &container).await.unwrap_err();
        assert!(matches!(
            err,
            ResolveError::SourceMissing { kind: "Secret", ref name } if name == "delegate-proxy"
        ));
    }

    #[tokio::test]
    async fn test_required_reference_source_missing_is_error() {
        let source = MemorySource::default();
        let container = container(json!({
            "env": [
                { "name": "X", "valueFrom": { "configMapKeyRef": { "name": "gone", "key": "x" } } },
            ],
        }));

        let err = resolve_container_env(&source, &container).await.unwrap_err();
        assert!(matches!(err, ResolveError::SourceMissing { kind: "ConfigMap", .. }));
    }

    #[tokio::test]
    async fn test_missing_key_leaves_variable_unset() {
        let source = MemorySource::default().with_config_map("cm", &[("present", "1")]);
        let container = container(json!({
            "env": [
                { "name": "ABSENT", "valueFrom": { "configMapKeyRef": { "name": "cm", "key": "absent" } } },
            ],
        }));

        let env = resolve_container_env(&source, &container).await.unwrap();
        assert!(!env.contains("ABSENT"));
    }

    #[tokio::test]
    async fn test_prefix_and_binary_values() {
        let source = MemorySource::default()
            .with_secret("proxy", &[("USER", b"dXNlcg=="), ("RAW", b"f\xff")]);
        let container = container(json!({
            "envFrom": [ { "secretRef": { "name": "proxy" }, "prefix": "PROXY_" } ],
        }));

        let env = resolve_container_env(&source, &container).await.unwrap();

        assert_eq!(env.get("PROXY_USER"), Some("dXNlcg=="));
        assert_eq!(env.get("PROXY_RAW"), Some("f\u{FFFD}"));
        assert!(!env.contains("USER"));
    }

    #[tokio::test]
    async fn test_downward_api_reference_skipped() {
        let source = MemorySource::default();
        let container = container(json!({
            "env": [
                { "name": "POD_NAME", "valueFrom": { "fieldRef": { "fieldPath": "metadata.name" } } },
            ],
        }));

        let env = resolve_container_env(&source, &container).await.unwrap();
        assert!(!env.contains("POD_NAME"));
    }

    #[tokio::test]
    async fn test_resolution_is_deterministic_and_uncached() {
        let source = MemorySource::default()
            .with_config_map("cm", &[("A", "1"), ("B", "2")])
            .with_secret("sec", &[("C", b"3")]);
        let container = container(json!({
            "envFrom": [
                { "configMapRef": { "name": "cm" } },
                { "secretRef": { "name": "sec" } },
            ],
        }));

        let first = resolve_container_env(&source, &container).await.unwrap();
        let second = resolve_container_env(&source, &container).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(source.fetches.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_deployment_without_containers() {
        let deployment: Deployment = serde_json::from_value(json!({
            "metadata": { "name": "empty" },
            "spec": {
                "selector": {},
                "template": { "spec": { "containers": [] } },
            },
        }))
        .unwrap();

        let err = resolve_deployment_env(&MemorySource::default(), &deployment)
            .await
            .unwrap_err();
        assert!(matches!(err, ResolveError::NoContainer { ref deployment } if deployment == "empty"));
    }

    #[test]
    fn test_from_iter_keeps_first_value() {
        let env: ResolvedEnv = [("A", "1"), ("A", "2"), ("B", "3")].into_iter().collect();

        assert_eq!(env.value("A"), "1");
        assert_eq!(env.value("MISSING"), "");
        assert_eq!(env.iter().count(), 2);
    }
}
