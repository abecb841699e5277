//! Operator configuration injected into every control loop

use crate::crd::Persistence;
use std::time::Duration;

/// Default `app.kubernetes.io/managed-by` value
pub const DEFAULT_OPERATOR_NAME: &str = "apicurio-registry-operator";

/// Default registry version reported in resource labels
pub const DEFAULT_REGISTRY_VERSION: &str = "2.6.x";

/// Accepted values of the registry container `imagePullPolicy`
pub const IMAGE_PULL_POLICIES: [&str; 3] = ["Always", "IfNotPresent", "Never"];

/// Canonical pull policy for `value`, `None` if it is not one of [`IMAGE_PULL_POLICIES`]
pub fn parse_image_pull_policy(value: &str) -> Option<&'static str> {
    IMAGE_PULL_POLICIES
        .into_iter()
        .find(|policy| policy.eq_ignore_ascii_case(value.trim()))
}

/// Settings shared by all managed registries
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Value of the `app.kubernetes.io/managed-by` label
    pub operator_name: String,
    /// Value of the version labels
    pub registry_version: String,
    /// Default image for in-memory persistence
    pub image_mem: Option<String>,
    /// Default image for Kafka persistence
    pub image_kafkasql: Option<String>,
    /// Default image for SQL persistence
    pub image_sql: Option<String>,
    /// Pull policy of the registry container, left to the cluster when unset
    pub image_pull_policy: Option<String>,
    /// Resync interval when no earlier requeue was requested
    pub resync_interval: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            operator_name: DEFAULT_OPERATOR_NAME.to_string(),
            registry_version: DEFAULT_REGISTRY_VERSION.to_string(),
            image_mem: None,
            image_kafkasql: None,
            image_sql: None,
            image_pull_policy: None,
            resync_interval: Duration::from_secs(300),
        }
    }
}

impl OperatorConfig {
    /// Default registry image for `persistence`, if configured
    pub fn default_image(&self, persistence: Persistence) -> Option<&str> {
        let image = match persistence {
            Persistence::Mem => &self.image_mem,
            Persistence::Kafkasql => &self.image_kafkasql,
            Persistence::Sql => &self.image_sql,
        };
        image.as_deref().filter(|i| !i.trim().is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = OperatorConfig::default();
        assert_eq!(config.operator_name, DEFAULT_OPERATOR_NAME);
        assert_eq!(config.resync_interval, Duration::from_secs(300));
        assert!(config.default_image(Persistence::Mem).is_none());
    }

    #[test]
    fn test_default_image_by_persistence() {
        let config = OperatorConfig {
            image_mem: Some("registry-mem:1".to_string()),
            image_sql: Some(" ".to_string()),
            ..Default::default()
        };
        assert_eq!(config.default_image(Persistence::Mem), Some("registry-mem:1"));
        assert_eq!(config.default_image(Persistence::Sql), None);
        assert_eq!(config.default_image(Persistence::Kafkasql), None);
    }

    #[test]
    fn test_parse_image_pull_policy() {
        assert_eq!(parse_image_pull_policy("IfNotPresent"), Some("IfNotPresent"));
        assert_eq!(parse_image_pull_policy(" always "), Some("Always"));
        assert_eq!(parse_image_pull_policy("Sometimes"), None);
        assert_eq!(parse_image_pull_policy(""), None);
    }
}
