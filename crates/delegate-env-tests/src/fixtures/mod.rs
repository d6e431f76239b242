//! Test fixtures: names, expected values and module variables.

pub mod mtls;
pub mod names;
pub mod proxy;
pub mod vars;

pub use names::ScenarioNames;
pub use proxy::{ProxyConfig, PROXY_ENV_VARS};
pub use vars::DelegateVars;
