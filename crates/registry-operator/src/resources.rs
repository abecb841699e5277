//! Kubernetes Resource Factory
//!
//! Builds the default manifests (Deployment, Service, Ingress, PodDisruptionBudget,
//! NetworkPolicy) for one registry. The factory only produces the skeleton every
//! registry shares; control functions then converge the spec dependent fields
//! (replicas, image, env, host, ...) on the cached copy.

use crate::capabilities::ClusterCapabilities;
use crate::config::OperatorConfig;
use crate::context::{AppRef, LoopContext};
use crate::crd::{ApicurioRegistry, API_VERSION};
use crate::kinds::ResourceKey;
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Capabilities, Container, ContainerPort, EmptyDirVolumeSource, HTTPGetAction, PodSecurityContext,
    PodSpec, PodTemplateSpec, Probe, ResourceRequirements, SeccompProfile, SecurityContext, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{
    HTTPIngressPath, HTTPIngressRuleValue, Ingress, IngressBackend, IngressRule,
    IngressServiceBackend, IngressSpec, NetworkPolicy, NetworkPolicyIngressRule,
    NetworkPolicyPort, NetworkPolicySpec, ServiceBackendPort,
};
use k8s_openapi::api::policy::v1::{PodDisruptionBudget, PodDisruptionBudgetSpec};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;

/// Name of the registry container in the pod template
pub const REGISTRY_CONTAINER_NAME: &str = "registry";

/// HTTP port of the registry container and Service
pub const REGISTRY_HTTP_PORT: i32 = 8080;

/// Label linking every managed object to its registry
pub const APP_LABEL: &str = "app";

/// Builder for the default resources of one registry
#[derive(Debug, Clone)]
pub struct ResourceFactory {
    name: String,
    namespace: String,
    operator_name: String,
    registry_version: String,
    openshift: bool,
}

impl ResourceFactory {
    pub fn new(app: &AppRef, config: &OperatorConfig, capabilities: &ClusterCapabilities) -> Self {
        Self {
            name: app.name.clone(),
            namespace: app.namespace.clone(),
            operator_name: config.operator_name.clone(),
            registry_version: config.registry_version.clone(),
            openshift: capabilities.openshift,
        }
    }

    /// Factory for the registry driven by `ctx`
    pub fn from_context(ctx: &LoopContext) -> Self {
        Self::new(ctx.app(), ctx.config(), ctx.capabilities())
    }

    pub fn deployment_name(&self) -> String {
        format!("{}-deployment", self.name)
    }

    pub fn service_name(&self) -> String {
        format!("{}-service", self.name)
    }

    pub fn ingress_name(&self) -> String {
        format!("{}-ingress", self.name)
    }

    pub fn pdb_name(&self) -> String {
        format!("{}-pdb", self.name)
    }

    pub fn network_policy_name(&self) -> String {
        format!("{}-networkpolicy", self.name)
    }

    /// Name given to a newly created object stored under `key`
    pub fn default_name(&self, key: ResourceKey) -> String {
        match key {
            ResourceKey::Registry => self.name.clone(),
            ResourceKey::Deployment => self.deployment_name(),
            ResourceKey::Service => self.service_name(),
            ResourceKey::Ingress => self.ingress_name(),
            ResourceKey::PodDisruptionBudget => self.pdb_name(),
            ResourceKey::NetworkPolicy => self.network_policy_name(),
        }
    }

    /// Labels carried by every managed object and the registry pods
    pub fn common_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            (APP_LABEL.to_string(), self.name.clone()),
            (
                "apicur.io/type".to_string(),
                "apicurio-registry".to_string(),
            ),
            ("apicur.io/name".to_string(), self.name.clone()),
            (
                "apicur.io/version".to_string(),
                self.registry_version.clone(),
            ),
            (
                "app.kubernetes.io/name".to_string(),
                "apicurio-registry".to_string(),
            ),
            ("app.kubernetes.io/instance".to_string(), self.name.clone()),
            (
                "app.kubernetes.io/version".to_string(),
                self.registry_version.clone(),
            ),
            (
                "app.kubernetes.io/managed-by".to_string(),
                self.operator_name.clone(),
            ),
        ])
    }

    /// Labels selecting the registry pods
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(APP_LABEL.to_string(), self.name.clone())])
    }

    /// Label selector used to adopt objects created by an earlier operator run
    pub fn adoption_selector(&self) -> String {
        format!("{}={}", APP_LABEL, self.name)
    }

    fn metadata(&self, name: String) -> ObjectMeta {
        ObjectMeta {
            name: Some(name),
            namespace: Some(self.namespace.clone()),
            labels: Some(self.common_labels()),
            ..Default::default()
        }
    }

    fn pod_selector(&self) -> LabelSelector {
        LabelSelector {
            match_labels: Some(self.selector_labels()),
            ..Default::default()
        }
    }

    /// Deployment with a single registry container and no image yet
    pub fn deployment(&self) -> Deployment {
        // OpenShift assigns the user and group through its security constraints
        let (run_as_user, run_as_group, fs_group) = if self.openshift {
            (None, None, None)
        } else {
            (Some(1001), Some(0), Some(0))
        };

        let pod_security_context = PodSecurityContext {
            run_as_non_root: Some(true),
            run_as_user,
            run_as_group,
            fs_group,
            seccomp_profile: Some(SeccompProfile {
                type_: "RuntimeDefault".to_string(),
                ..Default::default()
            }),
            ..Default::default()
        };

        let pod_spec = PodSpec {
            containers: vec![self.registry_container()],
            volumes: Some(vec![Volume {
                name: "tmp".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            security_context: Some(pod_security_context),
            termination_grace_period_seconds: Some(30),
            automount_service_account_token: Some(false),
            ..Default::default()
        };

        Deployment {
            metadata: self.metadata(self.deployment_name()),
            spec: Some(DeploymentSpec {
                replicas: Some(1),
                selector: self.pod_selector(),
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(self.common_labels()),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateDeployment {
                        max_surge: Some(IntOrString::String("25%".to_string())),
                        max_unavailable: Some(IntOrString::String("25%".to_string())),
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn registry_container(&self) -> Container {
        let probe = |path: &str| Probe {
            http_get: Some(HTTPGetAction {
                path: Some(path.to_string()),
                port: IntOrString::Int(REGISTRY_HTTP_PORT),
                scheme: Some("HTTP".to_string()),
                ..Default::default()
            }),
            initial_delay_seconds: Some(15),
            timeout_seconds: Some(5),
            period_seconds: Some(10),
            success_threshold: Some(1),
            failure_threshold: Some(3),
            ..Default::default()
        };

        let container_security_context = SecurityContext {
            allow_privilege_escalation: Some(false),
            // /tmp is the only writable path
            read_only_root_filesystem: Some(true),
            run_as_non_root: Some(true),
            capabilities: Some(Capabilities {
                drop: Some(vec!["ALL".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        };

        Container {
            name: REGISTRY_CONTAINER_NAME.to_string(),
            ports: Some(vec![ContainerPort {
                name: Some("http".to_string()),
                container_port: REGISTRY_HTTP_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            }]),
            resources: Some(ResourceRequirements {
                limits: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity("1".to_string())),
                    ("memory".to_string(), Quantity("1300Mi".to_string())),
                ])),
                requests: Some(BTreeMap::from([
                    ("cpu".to_string(), Quantity("500m".to_string())),
                    ("memory".to_string(), Quantity("512Mi".to_string())),
                ])),
                ..Default::default()
            }),
            liveness_probe: Some(probe("/health/live")),
            readiness_probe: Some(probe("/health/ready")),
            volume_mounts: Some(vec![VolumeMount {
                name: "tmp".to_string(),
                mount_path: "/tmp".to_string(),
                ..Default::default()
            }]),
            security_context: Some(container_security_context),
            ..Default::default()
        }
    }

    /// ClusterIP Service in front of the registry pods
    pub fn service(&self) -> Service {
        Service {
            metadata: self.metadata(self.service_name()),
            spec: Some(ServiceSpec {
                type_: Some("ClusterIP".to_string()),
                selector: Some(self.selector_labels()),
                ports: Some(vec![ServicePort {
                    name: Some("http".to_string()),
                    port: REGISTRY_HTTP_PORT,
                    target_port: Some(IntOrString::Int(REGISTRY_HTTP_PORT)),
                    protocol: Some("TCP".to_string()),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// Ingress routing `host` to the Service named `service_name`
    pub fn ingress(&self, host: &str, service_name: &str) -> Ingress {
        let mut metadata = self.metadata(self.ingress_name());
        metadata.annotations = Some(BTreeMap::from([
            (
                "nginx.ingress.kubernetes.io/force-ssl-redirect".to_string(),
                "false".to_string(),
            ),
            (
                "nginx.ingress.kubernetes.io/rewrite-target".to_string(),
                "/".to_string(),
            ),
            (
                "nginx.ingress.kubernetes.io/ssl-redirect".to_string(),
                "false".to_string(),
            ),
        ]));

        Ingress {
            metadata,
            spec: Some(IngressSpec {
                rules: Some(vec![IngressRule {
                    host: Some(host.to_string()),
                    http: Some(HTTPIngressRuleValue {
                        paths: vec![HTTPIngressPath {
                            path: Some("/".to_string()),
                            path_type: "Prefix".to_string(),
                            backend: IngressBackend {
                                service: Some(IngressServiceBackend {
                                    name: service_name.to_string(),
                                    port: Some(ServiceBackendPort {
                                        number: Some(REGISTRY_HTTP_PORT),
                                        ..Default::default()
                                    }),
                                }),
                                ..Default::default()
                            },
                        }],
                    }),
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// PodDisruptionBudget allowing one registry pod to be unavailable
    pub fn pod_disruption_budget(&self) -> PodDisruptionBudget {
        PodDisruptionBudget {
            metadata: self.metadata(self.pdb_name()),
            spec: Some(PodDisruptionBudgetSpec {
                selector: Some(self.pod_selector()),
                max_unavailable: Some(IntOrString::Int(1)),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    /// NetworkPolicy admitting HTTP traffic to the registry pods
    pub fn network_policy(&self) -> NetworkPolicy {
        NetworkPolicy {
            metadata: self.metadata(self.network_policy_name()),
            spec: Some(NetworkPolicySpec {
                pod_selector: self.pod_selector().into(),
                ingress: Some(vec![NetworkPolicyIngressRule {
                    ports: Some(vec![NetworkPolicyPort {
                        port: Some(IntOrString::Int(REGISTRY_HTTP_PORT)),
                        protocol: Some("TCP".to_string()),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }]),
                policy_types: Some(vec!["Ingress".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}

/// Host of the first Ingress rule routing to `service_name`
pub fn read_host(ingress: &Ingress, service_name: &str) -> Option<String> {
    ingress
        .spec
        .as_ref()?
        .rules
        .as_ref()?
        .iter()
        .find(|rule| routes_to(rule, service_name))
        .map(|rule| rule.host.clone().unwrap_or_default())
}

/// Set the host of every Ingress rule routing to `service_name`
pub fn write_host(ingress: &mut Ingress, service_name: &str, host: &str) {
    let rules = ingress
        .spec
        .as_mut()
        .and_then(|spec| spec.rules.as_mut())
        .into_iter()
        .flatten();
    for rule in rules {
        if routes_to(rule, service_name) {
            rule.host = Some(host.to_string());
        }
    }
}

fn routes_to(rule: &IngressRule, service_name: &str) -> bool {
    rule.http.as_ref().is_some_and(|http| {
        http.paths.iter().any(|path| {
            path.backend
                .service
                .as_ref()
                .is_some_and(|service| service.name == service_name)
        })
    })
}

/// Controller owner reference pointing at `registry`.
///
/// `None` until the API server has assigned the registry a UID.
pub fn owner_reference(registry: &ApicurioRegistry) -> Option<OwnerReference> {
    Some(OwnerReference {
        api_version: API_VERSION.to_string(),
        kind: "ApicurioRegistry".to_string(),
        name: registry.metadata.name.clone()?,
        uid: registry.metadata.uid.clone()?,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ApicurioRegistrySpec;
    use crate::testing;

    fn factory(openshift: bool) -> ResourceFactory {
        ResourceFactory::new(
            &AppRef::new("default", "my-registry"),
            &OperatorConfig::default(),
            &ClusterCapabilities {
                openshift,
                ..Default::default()
            },
        )
    }

    #[test]
    fn test_names() {
        let f = factory(false);
        assert_eq!(f.deployment_name(), "my-registry-deployment");
        assert_eq!(f.service_name(), "my-registry-service");
        assert_eq!(f.ingress_name(), "my-registry-ingress");
        assert_eq!(f.pdb_name(), "my-registry-pdb");
        assert_eq!(f.network_policy_name(), "my-registry-networkpolicy");
        assert_eq!(f.adoption_selector(), "app=my-registry");
    }

    #[test]
    fn test_common_labels() {
        let labels = factory(false).common_labels();
        assert_eq!(labels.get("app"), Some(&"my-registry".to_string()));
        assert_eq!(
            labels.get("app.kubernetes.io/managed-by"),
            Some(&"apicurio-registry-operator".to_string())
        );
        assert_eq!(
            labels.get("apicur.io/type"),
            Some(&"apicurio-registry".to_string())
        );
    }

    #[test]
    fn test_build_deployment() {
        let deployment = factory(false).deployment();
        assert_eq!(
            deployment.metadata.name,
            Some("my-registry-deployment".to_string())
        );

        let spec = deployment.spec.as_ref().unwrap();
        assert_eq!(spec.replicas, Some(1));
        assert_eq!(
            spec.selector.match_labels,
            Some(BTreeMap::from([(
                "app".to_string(),
                "my-registry".to_string()
            )]))
        );

        let pod = spec.template.spec.as_ref().unwrap();
        assert_eq!(pod.containers.len(), 1);
        let container = &pod.containers[0];
        assert_eq!(container.name, REGISTRY_CONTAINER_NAME);
        assert!(container.image.is_none());
        assert_eq!(
            container.ports.as_ref().unwrap()[0].container_port,
            REGISTRY_HTTP_PORT
        );
        assert_eq!(
            container
                .liveness_probe
                .as_ref()
                .and_then(|p| p.http_get.as_ref())
                .and_then(|h| h.path.as_deref()),
            Some("/health/live")
        );
        assert_eq!(
            pod.security_context.as_ref().unwrap().run_as_user,
            Some(1001)
        );
    }

    #[test]
    fn test_openshift_leaves_user_unset() {
        let deployment = factory(true).deployment();
        let pod = deployment.spec.unwrap().template.spec.unwrap();
        let security = pod.security_context.unwrap();
        assert_eq!(security.run_as_user, None);
        assert_eq!(security.run_as_non_root, Some(true));
    }

    #[test]
    fn test_build_service() {
        let svc = factory(false).service();
        assert_eq!(svc.metadata.name, Some("my-registry-service".to_string()));
        let spec = svc.spec.unwrap();
        assert_eq!(spec.type_, Some("ClusterIP".to_string()));
        assert_eq!(spec.ports.unwrap()[0].port, REGISTRY_HTTP_PORT);
    }

    #[test]
    fn test_build_ingress() {
        let ingress = factory(false).ingress("registry.example.com", "my-registry-service");
        let rules = ingress.spec.unwrap().rules.unwrap();
        assert_eq!(rules.len(), 1);
        assert_eq!(rules[0].host.as_deref(), Some("registry.example.com"));

        let path = &rules[0].http.as_ref().unwrap().paths[0];
        assert_eq!(path.path_type, "Prefix");
        assert_eq!(
            path.backend.service.as_ref().map(|s| s.name.as_str()),
            Some("my-registry-service")
        );
        assert!(ingress
            .metadata
            .annotations
            .unwrap()
            .contains_key("nginx.ingress.kubernetes.io/rewrite-target"));
    }

    #[test]
    fn test_read_and_write_host() {
        let mut ingress = factory(false).ingress("old.example.com", "my-registry-service");
        assert_eq!(
            read_host(&ingress, "my-registry-service"),
            Some("old.example.com".to_string())
        );
        assert_eq!(read_host(&ingress, "other-service"), None);

        write_host(&mut ingress, "other-service", "ignored.example.com");
        write_host(&mut ingress, "my-registry-service", "new.example.com");
        assert_eq!(
            read_host(&ingress, "my-registry-service"),
            Some("new.example.com".to_string())
        );
        assert_eq!(read_host(&Ingress::default(), "my-registry-service"), None);
    }

    #[test]
    fn test_build_pdb_and_network_policy() {
        let f = factory(false);
        let pdb = f.pod_disruption_budget();
        assert_eq!(pdb.metadata.name, Some("my-registry-pdb".to_string()));
        assert_eq!(
            pdb.spec.unwrap().max_unavailable,
            Some(IntOrString::Int(1))
        );

        let np = f.network_policy();
        assert_eq!(
            np.spec.unwrap().policy_types,
            Some(vec!["Ingress".to_string()])
        );
    }

    #[test]
    fn test_owner_reference() {
        let registry = testing::registry("my-registry", ApicurioRegistrySpec::default());
        let owner = owner_reference(&registry).unwrap();
        assert_eq!(owner.kind, "ApicurioRegistry");
        assert_eq!(owner.name, "my-registry");
        assert_eq!(owner.uid, "my-registry-uid");
        assert_eq!(owner.controller, Some(true));

        let mut unsaved = registry;
        unsaved.metadata.uid = None;
        assert!(owner_reference(&unsaved).is_none());
    }
}
