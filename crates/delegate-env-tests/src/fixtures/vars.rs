//! Typed Terraform variables for the delegate module.

use crate::config::{
    SuiteConfig, DEFAULT_ACCOUNT_ID, DEFAULT_DELEGATE_TOKEN, DEFAULT_MANAGER_ENDPOINT,
};
use crate::fixtures::ProxyConfig;
use secrecy::{ExposeSecret, SecretString};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Variables passed to the delegate module on apply and destroy.
///
/// `extra` holds module variables without a typed field (`deploy_mode`,
/// `next_gen`, ...). Entries in `extra` override typed fields of the same name.
#[derive(Clone)]
pub struct DelegateVars {
    pub namespace: String,
    pub delegate_name: String,
    pub account_id: String,
    pub delegate_token: SecretString,
    pub delegate_image: Option<String>,
    pub manager_endpoint: String,
    pub replicas: u32,
    pub upgrader_enabled: bool,
    pub create_namespace: bool,
    pub proxy: Option<ProxyConfig>,
    pub mtls_secret_name: Option<String>,
    pub values: Option<String>,
    pub extra: BTreeMap<String, Value>,
}

impl DelegateVars {
    /// Module defaults used by the self-contained scenarios.
    pub fn new(namespace: impl Into<String>, delegate_name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            delegate_name: delegate_name.into(),
            account_id: DEFAULT_ACCOUNT_ID.to_string(),
            delegate_token: SecretString::from(DEFAULT_DELEGATE_TOKEN),
            delegate_image: None,
            manager_endpoint: DEFAULT_MANAGER_ENDPOINT.to_string(),
            replicas: 1,
            upgrader_enabled: false,
            create_namespace: true,
            proxy: None,
            mtls_secret_name: None,
            values: None,
            extra: BTreeMap::new(),
        }
    }

    /// Variables carrying the live credentials from the suite configuration.
    pub fn from_config(
        config: &SuiteConfig,
        namespace: impl Into<String>,
        delegate_name: impl Into<String>,
    ) -> Self {
        Self {
            account_id: config.account_id.clone(),
            delegate_token: config.delegate_token.clone(),
            delegate_image: config.delegate_image.clone(),
            manager_endpoint: config.manager_endpoint.clone(),
            ..Self::new(namespace, delegate_name)
        }
    }

    pub fn with_replicas(mut self, replicas: u32) -> Self {
        self.replicas = replicas;
        self
    }

    pub fn with_upgrader(mut self, enabled: bool) -> Self {
        self.upgrader_enabled = enabled;
        self
    }

    pub fn with_create_namespace(mut self, create: bool) -> Self {
        self.create_namespace = create;
        self
    }

    /// Pass proxy settings. [`ProxyConfig::none`] renders explicit empty strings.
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_mtls_secret(mut self, secret_name: impl Into<String>) -> Self {
        self.mtls_secret_name = Some(secret_name.into());
        self
    }

    /// Raw Helm values block forwarded by the module.
    pub fn with_values(mut self, values: impl Into<String>) -> Self {
        self.values = Some(values.into());
        self
    }

    pub fn with_var(mut self, name: impl Into<String>, value: Value) -> Self {
        self.extra.insert(name.into(), value);
        self
    }

    /// Render the variable map handed to Terraform.
    pub fn to_map(&self) -> BTreeMap<String, Value> {
        let mut vars = BTreeMap::from([
            ("namespace".to_string(), json!(self.namespace)),
            ("delegate_name".to_string(), json!(self.delegate_name)),
            ("account_id".to_string(), json!(self.account_id)),
            (
                "delegate_token".to_string(),
                json!(self.delegate_token.expose_secret()),
            ),
            ("manager_endpoint".to_string(), json!(self.manager_endpoint)),
            ("replicas".to_string(), json!(self.replicas)),
            ("upgrader_enabled".to_string(), json!(self.upgrader_enabled)),
            ("create_namespace".to_string(), json!(self.create_namespace)),
        ]);

        if let Some(image) = &self.delegate_image {
            vars.insert("delegate_image".to_string(), json!(image));
        }

        if let Some(proxy) = &self.proxy {
            vars.insert("proxy_host".to_string(), json!(proxy.host));
            vars.insert("proxy_port".to_string(), json!(proxy.port));
            vars.insert("proxy_scheme".to_string(), json!(proxy.scheme));
            vars.insert("proxy_user".to_string(), json!(proxy.user));
            vars.insert(
                "proxy_password".to_string(),
                json!(proxy.password.expose_secret()),
            );
            vars.insert("no_proxy".to_string(), json!(proxy.no_proxy));
        }

        if let Some(secret_name) = &self.mtls_secret_name {
            vars.insert("mtls_secret_name".to_string(), json!(secret_name));
        }

        if let Some(values) = &self.values {
            vars.insert("values".to_string(), json!(values));
        }

        vars.extend(self.extra.clone());
        vars
    }
}

impl fmt::Debug for DelegateVars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelegateVars")
            .field("namespace", &self.namespace)
            .field("delegate_name", &self.delegate_name)
            .field("account_id", &self.account_id)
            .field("delegate_token", &"[REDACTED]")
            .field("delegate_image", &self.delegate_image)
            .field("manager_endpoint", &self.manager_endpoint)
            .field("replicas", &self.replicas)
            .field("upgrader_enabled", &self.upgrader_enabled)
            .field("create_namespace", &self.create_namespace)
            .field("proxy", &self.proxy)
            .field("mtls_secret_name", &self.mtls_secret_name)
            .field("values", &self.values.as_ref().map(|_| "<values block>"))
            .field("extra", &self.extra)
            .finish()
    }
}
