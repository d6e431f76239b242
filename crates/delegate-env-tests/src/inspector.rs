//! Resource inspector: fetch cluster objects by name within one namespace.
//!
//! Required lookups (`deployment`, `secret`, ...) turn an absent object into
//! [`InspectError::NotFound`]. The `find_*` variants return `Option` for
//! callers that must honour optionality or assert absence.

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::batch::v1::CronJob;
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, ServiceAccount};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::core::NamespaceResourceScope;
use kube::{Client, Resource};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::fmt::Debug;
use thiserror::Error;
use tracing::{debug, info};

/// Label marking namespaces created by this suite.
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value of [`MANAGED_BY_LABEL`] on suite-created namespaces.
pub const MANAGED_BY_VALUE: &str = "delegate-env-tests";

#[derive(Debug, Error)]
pub enum InspectError {
    #[error("{kind} '{name}' not found in namespace '{namespace}'")]
    NotFound {
        kind: &'static str,
        name: String,
        namespace: String,
    },

    #[error("Kubernetes API request for {kind} '{name}' failed: {source}")]
    Api {
        kind: &'static str,
        name: String,
        #[source]
        source: kube::Error,
    },
}

/// Namespace-scoped view of the cluster.
#[derive(Clone)]
pub struct ResourceInspector {
    client: Client,
    namespace: String,
}

impl ResourceInspector {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Namespace this inspector reads from.
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn find<K>(&self, kind: &'static str, name: &str) -> Result<Option<K>, InspectError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        debug!(kind, name, namespace = %self.namespace, "Fetching resource");
        self.api::<K>()
            .get_opt(name)
            .await
            .map_err(|source| InspectError::Api {
                kind,
                name: name.to_string(),
                source,
            })
    }

    async fn get<K>(&self, kind: &'static str, name: &str) -> Result<K, InspectError>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        <K as Resource>::DynamicType: Default,
    {
        self.find(kind, name)
            .await?
            .ok_or_else(|| InspectError::NotFound {
                kind,
                name: name.to_string(),
                namespace: self.namespace.clone(),
            })
    }

    // ------------------------------------------------------------------------
    // Namespaces (cluster scoped)
    // ------------------------------------------------------------------------

    pub async fn find_namespace(&self, name: &str) -> Result<Option<Namespace>, InspectError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        api.get_opt(name).await.map_err(|source| InspectError::Api {
            kind: "Namespace",
            name: name.to_string(),
            source,
        })
    }

    pub async fn namespace_object(&self, name: &str) -> Result<Namespace, InspectError> {
        self.find_namespace(name)
            .await?
            .ok_or_else(|| InspectError::NotFound {
                kind: "Namespace",
                name: name.to_string(),
                namespace: name.to_string(),
            })
    }

    // ------------------------------------------------------------------------
    // Namespaced lookups
    // ------------------------------------------------------------------------

    pub async fn deployment(&self, name: &str) -> Result<Deployment, InspectError> {
        self.get("Deployment", name).await
    }

    pub async fn find_deployment(&self, name: &str) -> Result<Option<Deployment>, InspectError> {
        self.find("Deployment", name).await
    }

    pub async fn config_map(&self, name: &str) -> Result<ConfigMap, InspectError> {
        self.get("ConfigMap", name).await
    }

    pub async fn find_config_map(&self, name: &str) -> Result<Option<ConfigMap>, InspectError> {
        self.find("ConfigMap", name).await
    }

    pub async fn secret(&self, name: &str) -> Result<Secret, InspectError> {
        self.get("Secret", name).await
    }

    pub async fn find_secret(&self, name: &str) -> Result<Option<Secret>, InspectError> {
        self.find("Secret", name).await
    }

    pub async fn service_account(&self, name: &str) -> Result<ServiceAccount, InspectError> {
        self.get("ServiceAccount", name).await
    }

    pub async fn find_service_account(
        &self,
        name: &str,
    ) -> Result<Option<ServiceAccount>, InspectError> {
        self.find("ServiceAccount", name).await
    }

    pub async fn cron_job(&self, name: &str) -> Result<CronJob, InspectError> {
        self.get("CronJob", name).await
    }

    pub async fn find_cron_job(&self, name: &str) -> Result<Option<CronJob>, InspectError> {
        self.find("CronJob", name).await
    }

    /// List pods matching a label selector.
    pub async fn list_pods(&self, selector: &LabelSelector) -> Result<Vec<Pod>, InspectError> {
        let selector = format_label_selector(selector);
        debug!(selector = %selector, namespace = %self.namespace, "Listing pods");

        let pods = self
            .api::<Pod>()
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|source| InspectError::Api {
                kind: "Pod",
                name: selector.clone(),
                source,
            })?;

        Ok(pods.items)
    }

    /// Pods selected by a deployment's label selector.
    pub async fn pods_for_deployment(
        &self,
        deployment: &Deployment,
    ) -> Result<Vec<Pod>, InspectError> {
        let selector = deployment
            .spec
            .as_ref()
            .map(|spec| spec.selector.clone())
            .unwrap_or_default();
        self.list_pods(&selector).await
    }

    // ------------------------------------------------------------------------
    // Setup and teardown
    // ------------------------------------------------------------------------

    /// Create this inspector's namespace, labelled as suite-managed.
    pub async fn create_namespace(&self) -> Result<Namespace, InspectError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        let namespace = Namespace {
            metadata: ObjectMeta {
                name: Some(self.namespace.clone()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    MANAGED_BY_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        let created = api
            .create(&PostParams::default(), &namespace)
            .await
            .map_err(|source| InspectError::Api {
                kind: "Namespace",
                name: self.namespace.clone(),
                source,
            })?;

        info!(namespace = %self.namespace, "Created namespace");
        Ok(created)
    }

    /// Delete this inspector's namespace. An already-deleted namespace is fine.
    pub async fn delete_namespace(&self) -> Result<(), InspectError> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(&self.namespace, &DeleteParams::default()).await {
            Ok(_) => {
                info!(namespace = %self.namespace, "Deleted namespace");
                Ok(())
            }
            Err(kube::Error::Api(ref response)) if response.code == 404 => Ok(()),
            Err(source) => Err(InspectError::Api {
                kind: "Namespace",
                name: self.namespace.clone(),
                source,
            }),
        }
    }

    /// Create a secret in this inspector's namespace.
    pub async fn create_secret(&self, secret: &Secret) -> Result<Secret, InspectError> {
        let mut secret = secret.clone();
        secret.metadata.namespace = Some(self.namespace.clone());
        let name = secret.metadata.name.clone().unwrap_or_default();

        let created = self
            .api::<Secret>()
            .create(&PostParams::default(), &secret)
            .await
            .map_err(|source| InspectError::Api {
                kind: "Secret",
                name: name.clone(),
                source,
            })?;

        info!(namespace = %self.namespace, name = %name, "Created secret");
        Ok(created)
    }

    /// Delete a secret. An already-deleted secret is fine.
    pub async fn delete_secret(&self, name: &str) -> Result<(), InspectError> {
        match self
            .api::<Secret>()
            .delete(name, &DeleteParams::default())
            .await
        {
            Ok(_) => {
                info!(namespace = %self.namespace, name, "Deleted secret");
                Ok(())
            }
            Err(kube::Error::Api(ref response)) if response.code == 404 => Ok(()),
            Err(source) => Err(InspectError::Api {
                kind: "Secret",
                name: name.to_string(),
                source,
            }),
        }
    }
}

/// Format a label selector the way `kubectl` expects it on the command line.
///
/// `matchLabels` become `key=value`; `matchExpressions` become `key in (a,b)`,
/// `key notin (a,b)`, `key` or `!key`. An empty selector formats as the empty
/// string, which selects everything.
pub fn format_label_selector(selector: &LabelSelector) -> String {
    let mut parts: Vec<String> = selector
        .match_labels
        .iter()
        .flatten()
        .map(|(key, value)| format!("{key}={value}"))
        .collect();

    for requirement in selector.match_expressions.iter().flatten() {
        let mut values = requirement.values.clone().unwrap_or_default();
        values.sort();
        let key = &requirement.key;

        let part = match requirement.operator.as_str() {
            "In" => format!("{key} in ({})", values.join(",")),
            "NotIn" => format!("{key} notin ({})", values.join(",")),
            "Exists" => key.clone(),
            "DoesNotExist" => format!("!{key}"),
            other => format!("{key} {} ({})", other.to_lowercase(), values.join(",")),
        };
        parts.push(part);
    }

    parts.join(",")
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelectorRequirement;

    fn requirement(key: &str, operator: &str, values: &[&str]) -> LabelSelectorRequirement {
        LabelSelectorRequirement {
            key: key.to_string(),
            operator: operator.to_string(),
            values: if values.is_empty() {
                None
            } else {
                Some(values.iter().map(|v| v.to_string()).collect())
            },
        }
    }

    #[test]
    fn test_format_empty_selector() {
        assert_eq!(format_label_selector(&LabelSelector::default()), "");
    }

    #[test]
    fn test_format_match_labels_sorted() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([
                ("harness.io/name".to_string(), "delegate-1".to_string()),
                ("app".to_string(), "delegate".to_string()),
            ])),
            ..Default::default()
        };

        assert_eq!(
            format_label_selector(&selector),
            "app=delegate,harness.io/name=delegate-1"
        );
    }

    #[test]
    fn test_format_match_expressions() {
        let selector = LabelSelector {
            match_labels: Some(BTreeMap::from([("app".to_string(), "d".to_string())])),
            match_expressions: Some(vec![
                requirement("tier", "In", &["web", "api"]),
                requirement("env", "NotIn", &["prod"]),
                requirement("canary", "Exists", &[]),
                requirement("legacy", "DoesNotExist", &[]),
            ]),
        };

        assert_eq!(
            format_label_selector(&selector),
            "app=d,tier in (api,web),env notin (prod),canary,!legacy"
        );
    }
}
