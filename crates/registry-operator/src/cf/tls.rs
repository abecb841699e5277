//! HTTPS endpoint of the registry
//!
//! With `spec.configuration.security.tls.secretName` set, the certificate and
//! key of that Secret are mounted into the registry container, port 8443 is
//! opened on the container, the Service and the NetworkPolicy, and the JVM is
//! told where to find the files. Plain HTTP requests are redirected.

use super::{pod_spec, pod_spec_mut, registry_container, registry_container_mut};
use crate::context::LoopContext;
use crate::control_loop::ControlFunction;
use crate::crd::TlsSpec;
use crate::env_cache::{EnvCacheEntry, EnvPriority};
use crate::java_options::{self, JavaOptions, JAVA_OPTIONS_OPERATOR};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{
    ContainerPort, KeyToPath, SecretVolumeSource, Service, ServicePort, Volume, VolumeMount,
};
use k8s_openapi::api::networking::v1::{NetworkPolicy, NetworkPolicyPort};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::{info, warn};

pub const TLS_VOLUME_NAME: &str = "registry-tls-cert-and-key";
pub const TLS_MOUNT_PATH: &str = "/etc/registry-tls-cert-and-key";
pub const HTTPS_PORT_NAME: &str = "https";
pub const HTTPS_PORT: i32 = 8443;

/// JVM options pointing Quarkus at the mounted certificate
fn tls_java_options(tls: &TlsSpec) -> JavaOptions {
    JavaOptions::from([
        (
            "-Dquarkus.http.ssl.certificate.file".to_string(),
            Some(format!("{}/{}", TLS_MOUNT_PATH, tls.certificate_key())),
        ),
        (
            "-Dquarkus.http.ssl.certificate.key-file".to_string(),
            Some(format!("{}/{}", TLS_MOUNT_PATH, tls.private_key())),
        ),
        (
            "-Dquarkus.http.insecure-requests".to_string(),
            Some("redirect".to_string()),
        ),
    ])
}

/// Whether the Deployment carries exactly the TLS pieces `tls` asks for.
///
/// Only the fields set by the operator are compared, server side defaults
/// such as `defaultMode` are ignored.
fn deployment_matches(deployment: &Deployment, tls: &TlsSpec) -> bool {
    let volume = pod_spec(deployment)
        .and_then(|spec| spec.volumes.as_ref())
        .and_then(|volumes| volumes.iter().find(|v| v.name == TLS_VOLUME_NAME));
    let container = registry_container(deployment);
    let mount = container
        .and_then(|c| c.volume_mounts.as_ref())
        .and_then(|mounts| mounts.iter().find(|m| m.name == TLS_VOLUME_NAME));
    let port = container
        .and_then(|c| c.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.container_port == HTTPS_PORT));

    if !tls.enabled() {
        return volume.is_none() && mount.is_none() && port.is_none();
    }

    let volume_matches = volume
        .and_then(|v| v.secret.as_ref())
        .is_some_and(|secret| {
            let keys: Vec<&str> = secret
                .items
                .iter()
                .flatten()
                .map(|item| item.key.as_str())
                .collect();
            secret.secret_name.as_deref() == Some(tls.secret_name.as_str())
                && keys == [tls.certificate_key(), tls.private_key()]
        });
    let mount_matches = mount.is_some_and(|m| m.mount_path == TLS_MOUNT_PATH);
    volume_matches && mount_matches && port.is_some()
}

/// Bring the TLS pieces of `deployment` in line with `tls`
fn apply_to_deployment(deployment: &mut Deployment, tls: &TlsSpec) {
    if let Some(spec) = pod_spec_mut(deployment) {
        let volumes = spec.volumes.get_or_insert_with(Vec::new);
        volumes.retain(|v| v.name != TLS_VOLUME_NAME);
        if tls.enabled() {
            let item = |key: &str| KeyToPath {
                key: key.to_string(),
                path: key.to_string(),
                ..Default::default()
            };
            volumes.push(Volume {
                name: TLS_VOLUME_NAME.to_string(),
                secret: Some(SecretVolumeSource {
                    secret_name: Some(tls.secret_name.clone()),
                    items: Some(vec![item(tls.certificate_key()), item(tls.private_key())]),
                    ..Default::default()
                }),
                ..Default::default()
            });
        }
    }

    if let Some(container) = registry_container_mut(deployment) {
        let mounts = container.volume_mounts.get_or_insert_with(Vec::new);
        mounts.retain(|m| m.name != TLS_VOLUME_NAME);
        let ports = container.ports.get_or_insert_with(Vec::new);
        ports.retain(|p| p.container_port != HTTPS_PORT);
        if tls.enabled() {
            mounts.push(VolumeMount {
                name: TLS_VOLUME_NAME.to_string(),
                mount_path: TLS_MOUNT_PATH.to_string(),
                read_only: Some(true),
                ..Default::default()
            });
            ports.push(ContainerPort {
                name: Some(HTTPS_PORT_NAME.to_string()),
                container_port: HTTPS_PORT,
                protocol: Some("TCP".to_string()),
                ..Default::default()
            });
        }
    }
}

fn service_matches(service: &Service, tls: &TlsSpec) -> bool {
    let found = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .is_some_and(|ports| ports.iter().any(|p| p.port == HTTPS_PORT));
    found == tls.enabled()
}

fn apply_to_service(service: &mut Service, tls: &TlsSpec) {
    let Some(spec) = service.spec.as_mut() else {
        return;
    };
    let ports = spec.ports.get_or_insert_with(Vec::new);
    ports.retain(|p| p.port != HTTPS_PORT);
    if tls.enabled() {
        ports.push(ServicePort {
            name: Some(HTTPS_PORT_NAME.to_string()),
            port: HTTPS_PORT,
            target_port: Some(IntOrString::Int(HTTPS_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
}

fn is_https(port: &NetworkPolicyPort) -> bool {
    port.port == Some(IntOrString::Int(HTTPS_PORT))
}

fn network_policy_matches(policy: &NetworkPolicy, tls: &TlsSpec) -> bool {
    let found = policy
        .spec
        .as_ref()
        .and_then(|s| s.ingress.as_ref())
        .and_then(|rules| rules.first())
        .and_then(|rule| rule.ports.as_ref())
        .is_some_and(|ports| ports.iter().any(is_https));
    found == tls.enabled()
}

fn apply_to_network_policy(policy: &mut NetworkPolicy, tls: &TlsSpec) {
    let Some(rule) = policy
        .spec
        .as_mut()
        .and_then(|s| s.ingress.as_mut())
        .and_then(|rules| rules.first_mut())
    else {
        return;
    };
    let ports = rule.ports.get_or_insert_with(Vec::new);
    ports.retain(|p| !is_https(p));
    if tls.enabled() {
        ports.push(NetworkPolicyPort {
            port: Some(IntOrString::Int(HTTPS_PORT)),
            protocol: Some("TCP".to_string()),
            ..Default::default()
        });
    }
}

/// Converges the HTTPS endpoint on the Deployment, Service and NetworkPolicy
#[derive(Debug, Default)]
pub struct TlsCF {
    tls: TlsSpec,
    update_deployment: bool,
    update_service: bool,
    update_network_policy: bool,
    set_options: Option<EnvCacheEntry>,
    remove_options: bool,
}

impl ControlFunction for TlsCF {
    fn describe(&self) -> &str {
        "TlsCF"
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.update_deployment = false;
        self.update_service = false;
        self.update_network_policy = false;
        self.set_options = None;
        self.remove_options = false;

        let Some(registry) = ctx.registry() else {
            return;
        };
        self.tls = registry.spec.configuration.security.tls.clone();
        let tls = &self.tls;

        let resources = ctx.resources();
        self.update_deployment = resources
            .typed::<Deployment>()
            .is_some_and(|d| !deployment_matches(d, tls));
        self.update_service = resources
            .typed::<Service>()
            .is_some_and(|s| !service_matches(s, tls));
        self.update_network_policy = resources
            .typed::<NetworkPolicy>()
            .is_some_and(|p| !network_policy_matches(p, tls));

        if tls.enabled() {
            let value = java_options::render(&tls_java_options(tls));
            match EnvCacheEntry::simple(JAVA_OPTIONS_OPERATOR, value).build() {
                Ok(entry) if ctx.env().would_change(&entry) => self.set_options = Some(entry),
                Ok(_) => {}
                Err(e) => warn!(app = %ctx.app(), error = %e, "Ignoring TLS JVM options"),
            }
        } else {
            self.remove_options = ctx
                .env()
                .get(JAVA_OPTIONS_OPERATOR)
                .is_some_and(|e| e.priority() == EnvPriority::Operator);
        }
    }

    fn compare(&self) -> bool {
        self.update_deployment
            || self.update_service
            || self.update_network_policy
            || self.set_options.is_some()
            || self.remove_options
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        let tls = &self.tls;
        if self.update_deployment {
            info!(app = %ctx.app(), enabled = tls.enabled(), secret = %tls.secret_name, "Updating TLS volume and port");
            ctx.resources_mut()
                .patch::<Deployment, _>(|d| apply_to_deployment(d, tls));
        }
        if self.update_service {
            ctx.resources_mut()
                .patch::<Service, _>(|s| apply_to_service(s, tls));
        }
        if self.update_network_policy {
            ctx.resources_mut()
                .patch::<NetworkPolicy, _>(|p| apply_to_network_policy(p, tls));
        }
        if let Some(entry) = self.set_options.take() {
            ctx.env_mut().set(entry);
        }
        if self.remove_options {
            ctx.env_mut().delete_by_name(JAVA_OPTIONS_OPERATOR);
        }
    }
}
