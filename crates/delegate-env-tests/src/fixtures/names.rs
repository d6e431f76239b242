//! Unique resource names for parallel scenarios.
//!
//! Every scenario provisions into its own namespace with its own delegate and
//! secret names, so scenarios never share mutable cluster state.

use uuid::Uuid;

/// Length of the random suffix appended to generated names.
pub const UNIQUE_ID_LEN: usize = 6;

/// Longest prefix kept in generated names.
///
/// Keeps `<prefix>-delegate-<id>-upgrader-job` within the 52 character limit
/// Kubernetes applies to CronJob names.
pub const MAX_PREFIX_LEN: usize = 20;

/// Short lowercase identifier for resource names.
pub fn unique_id() -> String {
    Uuid::new_v4()
        .simple()
        .to_string()
        .chars()
        .take(UNIQUE_ID_LEN)
        .collect()
}

/// Names for the resources one scenario provisions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScenarioNames {
    pub unique_id: String,
    pub namespace: String,
    pub delegate_name: String,
    pub mtls_secret_name: String,
}

impl ScenarioNames {
    /// Generate names with a fresh random suffix.
    pub fn generate(prefix: &str) -> Self {
        Self::with_id(prefix, &unique_id())
    }

    /// Build names from a known suffix.
    pub fn with_id(prefix: &str, id: &str) -> Self {
        let prefix = sanitize_prefix(prefix);
        let id = id.to_lowercase();

        Self {
            namespace: format!("{prefix}-{id}"),
            delegate_name: format!("{prefix}-delegate-{id}"),
            mtls_secret_name: format!("{prefix}-mtls-{id}"),
            unique_id: id,
        }
    }
}

/// Lowercase, map anything outside `[a-z0-9-]` to `-`, truncate, and trim
/// dashes so the result is a valid DNS label fragment.
fn sanitize_prefix(prefix: &str) -> String {
    let mapped: String = prefix
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() {
                c
            } else {
                '-'
            }
        })
        .take(MAX_PREFIX_LEN)
        .collect();

    let trimmed = mapped.trim_matches('-');
    if trimmed.is_empty() {
        "test".to_string()
    } else {
        trimmed.to_string()
    }
}
