//! Proxy configuration fixture.

use base64::{engine::general_purpose::STANDARD, Engine};
use secrecy::{ExposeSecret, SecretString};
use std::fmt;

/// Environment variables the delegate module injects for proxy support.
pub const PROXY_ENV_VARS: [&str; 6] = [
    "PROXY_HOST",
    "PROXY_PORT",
    "PROXY_SCHEME",
    "PROXY_USER",
    "PROXY_PASSWORD",
    "NO_PROXY",
];

/// Expected proxy settings for a delegate.
///
/// Only used as an assertion fixture. The module stores `PROXY_USER` and
/// `PROXY_PASSWORD` base64-encoded in the `<delegate>-proxy` secret, so the
/// resolved container values are compared against [`ProxyConfig::encoded_user`]
/// and [`ProxyConfig::encoded_password`], never the literals.
#[derive(Clone)]
pub struct ProxyConfig {
    pub host: String,
    pub port: String,
    pub scheme: String,
    pub user: String,
    pub password: SecretString,
    pub no_proxy: String,
}

impl ProxyConfig {
    pub fn new(
        host: impl Into<String>,
        port: impl Into<String>,
        scheme: impl Into<String>,
        user: impl Into<String>,
        password: impl Into<String>,
        no_proxy: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: port.into(),
            scheme: scheme.into(),
            user: user.into(),
            password: SecretString::from(password.into()),
            no_proxy: no_proxy.into(),
        }
    }

    /// A proxy configuration with every field empty.
    pub fn none() -> Self {
        Self::new("", "", "", "", "", "")
    }

    /// A proxy is considered configured once a host is set.
    pub fn is_configured(&self) -> bool {
        !self.host.is_empty()
    }

    pub fn has_credentials(&self) -> bool {
        !self.user.is_empty() || !self.password.expose_secret().is_empty()
    }

    pub fn encoded_user(&self) -> String {
        STANDARD.encode(self.user.as_bytes())
    }

    pub fn encoded_password(&self) -> String {
        STANDARD.encode(self.password.expose_secret().as_bytes())
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("scheme", &self.scheme)
            .field("user", &self.user)
            .field("password", &"[REDACTED]")
            .field("no_proxy", &self.no_proxy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_none_is_not_configured() {
        let proxy = ProxyConfig::none();
        assert!(!proxy.is_configured());
        assert!(!proxy.has_credentials());
    }

    #[test]
    fn test_credentials_are_base64_encoded() {
        let proxy = ProxyConfig::new(
            "proxy.company.com",
            "8080",
            "http",
            "proxy_user",
            "proxy_password",
            ".company.com,localhost",
        );

        assert!(proxy.is_configured());
        assert_eq!(proxy.encoded_user(), "cHJveHlfdXNlcg==");
        assert_eq!(proxy.encoded_password(), "cHJveHlfcGFzc3dvcmQ=");
    }

    #[test]
    fn test_debug_redacts_password() {
        let proxy = ProxyConfig::new("h", "1", "http", "u", "hunter2", "");
        let debug = format!("{proxy:?}");

        assert!(debug.contains("REDACTED"));
        assert!(!debug.contains("hunter2"));
    }
}
