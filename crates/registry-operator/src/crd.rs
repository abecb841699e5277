//! Custom Resource Definition for the Apicurio Registry operator
//!
//! This module defines the `ApicurioRegistry` CRD that represents one managed
//! registry deployment together with its status.

use k8s_openapi::api::core::v1::{Affinity, EnvVar, LocalObjectReference, Toleration};
use kube::CustomResource;
use regex::Regex;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::fmt;
use std::sync::LazyLock;
use validator::{Validate, ValidationError};

/// API group of the registry resources
pub const API_GROUP: &str = "registry.apicur.io";

/// API version of the registry resources
pub const API_VERSION: &str = "registry.apicur.io/v1";

/// Regex for validating DNS host names (RFC 1123)
static HOST_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^([a-z0-9]([-a-z0-9]*[a-z0-9])?)(\.[a-z0-9]([-a-z0-9]*[a-z0-9])?)*$").unwrap()
});

/// Regex for validating environment variable names
static ENV_NAME_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[-._a-zA-Z][-._a-zA-Z0-9]*$").unwrap());

const LOG_LEVELS: [&str; 8] = ["ALL", "TRACE", "DEBUG", "INFO", "WARN", "ERROR", "FATAL", "OFF"];

/// Validate the persistence option
fn validate_persistence(value: &str) -> Result<(), ValidationError> {
    match value {
        "" | "mem" | "kafkasql" | "sql" => Ok(()),
        _ => Err(ValidationError::new("invalid_persistence").with_message(
            format!(
                "'{}' is not a supported persistence, use one of mem, kafkasql, sql",
                value
            )
            .into(),
        )),
    }
}

/// Validate a log level (empty uses the registry default)
fn validate_log_level(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() || LOG_LEVELS.contains(&value.to_uppercase().as_str()) {
        Ok(())
    } else {
        Err(ValidationError::new("invalid_log_level")
            .with_message(format!("'{}' is not a valid log level", value).into()))
    }
}

/// Validate a Secret key that is projected as a file name
fn validate_secret_key(value: &str) -> Result<(), ValidationError> {
    if value.contains('/') || value == "." || value == ".." {
        Err(ValidationError::new("invalid_secret_key")
            .with_message(format!("'{}' can not be used as a file name", value).into()))
    } else {
        Ok(())
    }
}

/// Validate the ingress host
fn validate_host(value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Ok(());
    }
    if value.len() > 253 {
        return Err(ValidationError::new("host_too_long")
            .with_message("host exceeds 253 characters".into()));
    }
    if !HOST_REGEX.is_match(value) {
        return Err(ValidationError::new("invalid_host")
            .with_message(format!("'{}' is not a valid host name", value).into()));
    }
    Ok(())
}

/// Validate user supplied environment variables
fn validate_env_vars(vars: &[EnvVar]) -> Result<(), ValidationError> {
    let mut seen = HashSet::with_capacity(vars.len());
    for var in vars {
        if var.name.trim().is_empty() {
            return Err(ValidationError::new("invalid_env_name")
                .with_message("environment variable can not be empty nor whitespace".into()));
        }
        if !ENV_NAME_REGEX.is_match(&var.name) {
            return Err(ValidationError::new("invalid_env_name").with_message(
                format!("'{}' is not a valid environment variable name", var.name).into(),
            ));
        }
        if !seen.insert(var.name.as_str()) {
            return Err(ValidationError::new("duplicate_env_name").with_message(
                format!("environment variable '{}' is declared twice", var.name).into(),
            ));
        }
    }
    Ok(())
}

/// Validate pod template labels
fn validate_labels(labels: &BTreeMap<String, String>) -> Result<(), ValidationError> {
    for (key, value) in labels {
        if key.len() > 253 || value.len() > 63 {
            return Err(ValidationError::new("label_too_long")
                .with_message("label key max 253 chars, value max 63 chars".into()));
        }
        // The selector label must stay under operator control
        if key == "app" {
            return Err(ValidationError::new("reserved_label")
                .with_message("label 'app' is reserved for the pod selector".into()));
        }
    }
    Ok(())
}

/// ApicurioRegistry custom resource definition
///
/// Declares one Apicurio Registry installation. The operator converges the
/// Deployment, Service, Ingress, PodDisruptionBudget and NetworkPolicy of the
/// registry towards this specification.
///
/// # Example
///
/// ```yaml
/// apiVersion: registry.apicur.io/v1
/// kind: ApicurioRegistry
/// metadata:
///   name: example
/// spec:
///   configuration:
///     persistence: sql
///     sql:
///       dataSource:
///         url: jdbc:postgresql://postgres:5432/registry
///         userName: registry
///         password: secret
///     env:
///       - name: REGISTRY_APIS_V2_DATE_FORMAT
///         value: "yyyy-MM-dd'T'HH:mm:ss'Z'"
///   deployment:
///     replicas: 2
///     host: registry.example.com
/// ```
#[derive(
    CustomResource, Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate,
)]
#[kube(
    group = "registry.apicur.io",
    version = "v1",
    kind = "ApicurioRegistry",
    plural = "apicurioregistries",
    shortname = "ar",
    namespaced,
    status = "ApicurioRegistryStatus",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Persistence","type":"string","jsonPath":".spec.configuration.persistence"}"#,
    printcolumn = r#"{"name":"Host","type":"string","jsonPath":".status.info.host"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ApicurioRegistrySpec {
    /// Registry application configuration
    #[serde(default)]
    #[validate(nested)]
    pub configuration: RegistryConfigurationSpec,

    /// Deployment and managed resources configuration
    #[serde(default)]
    #[validate(nested)]
    pub deployment: RegistryDeploymentSpec,
}

/// Application level configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegistryConfigurationSpec {
    /// Storage option: mem (default), kafkasql or sql
    #[serde(default)]
    #[validate(custom(function = "validate_persistence"))]
    pub persistence: String,

    /// SQL storage configuration
    #[serde(default)]
    pub sql: SqlSpec,

    /// Kafka storage configuration
    #[serde(default)]
    pub kafkasql: KafkasqlSpec,

    /// Web console configuration
    #[serde(default)]
    pub ui: UiSpec,

    /// HTTPS configuration
    #[serde(default)]
    #[validate(nested)]
    pub security: SecuritySpec,

    /// Log level of the non Apicurio components and libraries
    #[serde(default)]
    #[validate(custom(function = "validate_log_level"))]
    pub log_level: String,

    /// Log level of the Apicurio application components
    #[serde(default)]
    #[validate(custom(function = "validate_log_level"))]
    pub registry_log_level: String,

    /// Additional environment variables, in declaration order
    #[serde(default)]
    #[validate(
        length(max = 100, message = "maximum 100 environment variables allowed"),
        custom(function = "validate_env_vars")
    )]
    pub env: Vec<EnvVar>,
}

/// SQL storage configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SqlSpec {
    #[serde(default)]
    pub data_source: DataSourceSpec,
}

/// JDBC data source
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DataSourceSpec {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub user_name: String,
    #[serde(default)]
    pub password: String,
}

/// Kafka storage configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct KafkasqlSpec {
    /// Comma separated list of Kafka bootstrap servers
    #[serde(default)]
    pub bootstrap_servers: String,
}

/// Web console configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UiSpec {
    /// Disable editing in the web console
    #[serde(default)]
    pub read_only: bool,
}

/// Security configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct SecuritySpec {
    #[serde(default)]
    #[validate(nested)]
    pub tls: TlsSpec,
}

/// HTTPS endpoint backed by a certificate stored in a Secret
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct TlsSpec {
    /// Secret holding the certificate and key; HTTPS is disabled when empty
    #[serde(default)]
    pub secret_name: String,

    /// Secret key of the PEM certificate, `tls.crt` when empty
    #[serde(default)]
    #[validate(custom(function = "validate_secret_key"))]
    pub certificate: String,

    /// Secret key of the PEM private key, `tls.key` when empty
    #[serde(default)]
    #[validate(custom(function = "validate_secret_key"))]
    pub key: String,
}

impl TlsSpec {
    pub fn enabled(&self) -> bool {
        !self.secret_name.is_empty()
    }

    pub fn certificate_key(&self) -> &str {
        if self.certificate.is_empty() {
            "tls.crt"
        } else {
            &self.certificate
        }
    }

    pub fn private_key(&self) -> &str {
        if self.key.is_empty() {
            "tls.key"
        } else {
            &self.key
        }
    }
}

/// Deployment configuration
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegistryDeploymentSpec {
    /// Number of registry pods, at least one is always deployed
    #[serde(default)]
    #[validate(range(min = 0, max = 100, message = "replicas must be between 0 and 100"))]
    pub replicas: i32,

    /// Host name of the Ingress; no Ingress is created when empty
    #[serde(default)]
    #[validate(custom(function = "validate_host"))]
    pub host: String,

    /// Pod affinity
    #[serde(default)]
    pub affinity: Option<Affinity>,

    /// Pod tolerations
    #[serde(default)]
    #[validate(length(max = 20, message = "maximum 20 tolerations allowed"))]
    pub tolerations: Vec<Toleration>,

    /// Extra pod template metadata
    #[serde(default)]
    #[validate(nested)]
    pub metadata: PodMetadataSpec,

    /// Registry image, overrides the per-persistence default
    #[serde(default)]
    pub image: String,

    /// Pull secrets for the registry image
    #[serde(default)]
    pub image_pull_secrets: Vec<LocalObjectReference>,

    /// Opt out of optional managed resources
    #[serde(default)]
    pub managed_resources: ManagedResourcesSpec,
}

/// Extra pod template metadata
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema, Validate)]
#[serde(rename_all = "camelCase")]
pub struct PodMetadataSpec {
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,

    #[serde(default)]
    #[validate(custom(function = "validate_labels"))]
    pub labels: BTreeMap<String, String>,
}

/// Managed resources that can be disabled
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourcesSpec {
    #[serde(default)]
    pub disable_ingress: bool,
    #[serde(default)]
    pub disable_network_policy: bool,
    #[serde(default)]
    pub disable_pod_disruption_budget: bool,
}

/// Storage backend selected by `spec.configuration.persistence`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persistence {
    Mem,
    Kafkasql,
    Sql,
}

impl fmt::Display for Persistence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Persistence::Mem => "mem",
            Persistence::Kafkasql => "kafkasql",
            Persistence::Sql => "sql",
        })
    }
}

impl ApicurioRegistrySpec {
    /// Selected persistence, `None` for an unsupported value
    pub fn persistence(&self) -> Option<Persistence> {
        match self.configuration.persistence.as_str() {
            "" | "mem" => Some(Persistence::Mem),
            "kafkasql" => Some(Persistence::Kafkasql),
            "sql" => Some(Persistence::Sql),
            _ => None,
        }
    }

    /// Effective number of replicas
    pub fn target_replicas(&self) -> i32 {
        self.deployment.replicas.max(1)
    }
}

/// Status of an ApicurioRegistry resource
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ApicurioRegistryStatus {
    /// Information about the deployed registry
    #[serde(default)]
    pub info: RegistryStatusInfo,

    /// Conditions describing the registry state
    #[serde(default)]
    pub conditions: Vec<RegistryCondition>,

    /// Resources created and managed by the operator
    #[serde(default)]
    pub managed_resources: Vec<ManagedResourceStatus>,
}

/// Information about the deployed registry
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryStatusInfo {
    /// Host the registry is reachable at, if an Ingress exists
    #[serde(default)]
    pub host: String,
}

/// Condition describing an aspect of the registry state
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RegistryCondition {
    /// Type of condition (Ready, ConfigurationError)
    #[serde(rename = "type")]
    pub condition_type: String,

    /// Status of the condition (True, False, Unknown)
    pub status: String,

    /// Machine readable reason
    pub reason: Option<String>,

    /// Human-readable message
    pub message: Option<String>,

    /// Last time the status changed
    pub last_transition_time: Option<String>,
}

/// One resource managed on behalf of the registry
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ManagedResourceStatus {
    pub kind: String,
    pub name: String,
    pub namespace: String,
}
