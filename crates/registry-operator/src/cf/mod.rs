//! Control functions
//!
//! Each function owns one aspect of the desired state. [`register_all`] fixes
//! the schedule: resources are created before they are adjusted, and the env
//! producers run before [`EnvApplyCF`] writes the merged list into the
//! Deployment.

mod configuration;
mod env;
mod host;
mod managed;
mod metadata;
mod pod;
mod tls;

pub use configuration::ConfigurationErrorCF;
pub use env::{
    DeploymentEnvCF, EnvApplyCF, EnvCF, JavaOptionsCF, OperatorEnvCF, ENV_CORS_ALLOWED_ORIGINS,
    ENV_DATASOURCE_PASSWORD, ENV_DATASOURCE_URL, ENV_DATASOURCE_USERNAME,
    ENV_KAFKA_BOOTSTRAP_SERVERS, ENV_LOG_LEVEL, ENV_QUARKUS_PROFILE, ENV_REGISTRY_LOG_LEVEL,
    ENV_UI_READ_ONLY,
};
pub use host::HostCF;
pub use managed::{
    DeploymentCF, IngressCF, Managed, ManagedResourceCF, NetworkPolicyCF, PodDisruptionBudgetCF,
    ServiceCF,
};
pub use metadata::{AnnotationsCF, LabelsCF};
pub use pod::{ImageCF, ImagePullPolicyCF, PodSpecFieldCF, ReplicasCF};
pub use tls::{TlsCF, HTTPS_PORT, TLS_MOUNT_PATH, TLS_VOLUME_NAME};

use crate::control_loop::{ControlLoop, LoopServices};
use crate::resources::REGISTRY_CONTAINER_NAME;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Container, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tracing::debug;

/// Register the control functions supported by the cluster, in schedule order
pub fn register_all<S: LoopServices>(control_loop: &mut ControlLoop<S>) {
    let capabilities = *control_loop.context().capabilities();

    control_loop.add_control_function(DeploymentCF::default());
    control_loop.add_control_function(ServiceCF::default());
    if capabilities.ingress_v1 {
        control_loop.add_control_function(IngressCF::default());
        control_loop.add_control_function(HostCF::default());
    }
    if capabilities.pod_disruption_budget_v1 {
        control_loop.add_control_function(PodDisruptionBudgetCF::default());
    }
    if capabilities.network_policy_v1 {
        control_loop.add_control_function(NetworkPolicyCF::default());
    }

    control_loop.add_control_function(LabelsCF::default());
    control_loop.add_control_function(AnnotationsCF::default());
    control_loop.add_control_function(ReplicasCF::default());
    control_loop.add_control_function(ImageCF::default());
    control_loop.add_control_function(ImagePullPolicyCF::default());
    control_loop.add_control_function(PodSpecFieldCF::affinity());
    control_loop.add_control_function(PodSpecFieldCF::tolerations());
    control_loop.add_control_function(PodSpecFieldCF::image_pull_secrets());
    control_loop.add_control_function(TlsCF::default());

    control_loop.add_control_function(DeploymentEnvCF::default());
    control_loop.add_control_function(EnvCF::default());
    control_loop.add_control_function(OperatorEnvCF::log_level());
    control_loop.add_control_function(OperatorEnvCF::sql());
    control_loop.add_control_function(OperatorEnvCF::kafkasql());
    control_loop.add_control_function(OperatorEnvCF::ui());
    control_loop.add_control_function(OperatorEnvCF::cors());
    control_loop.add_control_function(OperatorEnvCF::profile());
    control_loop.add_control_function(JavaOptionsCF::default());
    control_loop.add_control_function(EnvApplyCF::default());

    control_loop.add_control_function(ConfigurationErrorCF::default());

    debug!(functions = ?control_loop.describe(), "Registered control functions");
}

pub(crate) fn pod_spec(deployment: &Deployment) -> Option<&PodSpec> {
    deployment.spec.as_ref()?.template.spec.as_ref()
}

pub(crate) fn pod_spec_mut(deployment: &mut Deployment) -> Option<&mut PodSpec> {
    deployment.spec.as_mut()?.template.spec.as_mut()
}

/// Pod template metadata, created on demand
pub(crate) fn pod_metadata_mut(deployment: &mut Deployment) -> Option<&mut ObjectMeta> {
    let spec = deployment.spec.as_mut()?;
    Some(spec.template.metadata.get_or_insert_with(ObjectMeta::default))
}

pub(crate) fn registry_container(deployment: &Deployment) -> Option<&Container> {
    pod_spec(deployment)?
        .containers
        .iter()
        .find(|c| c.name == REGISTRY_CONTAINER_NAME)
}

pub(crate) fn registry_container_mut(deployment: &mut Deployment) -> Option<&mut Container> {
    pod_spec_mut(deployment)?
        .containers
        .iter_mut()
        .find(|c| c.name == REGISTRY_CONTAINER_NAME)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ClusterCapabilities;
    use crate::crd::ApicurioRegistrySpec;
    use crate::testing::{self, NoopServices};

    fn registered(capabilities: ClusterCapabilities) -> Vec<String> {
        let registry = testing::registry("registry", ApicurioRegistrySpec::default());
        let mut cl = ControlLoop::new(
            testing::context_for(registry, capabilities),
            NoopServices::default(),
        );
        register_all(&mut cl);
        cl.describe().into_iter().map(String::from).collect()
    }

    #[test]
    fn test_register_all_on_full_cluster() {
        let names = registered(ClusterCapabilities::all());
        assert_eq!(names.len(), 26);
        assert_eq!(names[0], "DeploymentCF");
        assert!(names.contains(&"NetworkPolicyCF".to_string()));

        let apply = names.iter().position(|n| n == "EnvApplyCF").unwrap();
        let env = names.iter().position(|n| n == "EnvCF").unwrap();
        let java = names.iter().position(|n| n == "JavaOptionsCF").unwrap();
        let tls = names.iter().position(|n| n == "TlsCF").unwrap();
        assert!(env < java && tls < java && java < apply);
    }

    #[test]
    fn test_register_all_skips_missing_apis() {
        let names = registered(ClusterCapabilities::default());
        assert_eq!(names.len(), 22);
        assert!(!names.contains(&"IngressCF".to_string()));
        assert!(!names.contains(&"HostCF".to_string()));
        assert!(!names.contains(&"PodDisruptionBudgetCF".to_string()));
    }
}
