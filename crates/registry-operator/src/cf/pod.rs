//! Deployment and pod template fields driven by the spec

use super::{pod_spec, pod_spec_mut, registry_container, registry_container_mut};
use crate::context::LoopContext;
use crate::control_loop::ControlFunction;
use crate::crd::ApicurioRegistrySpec;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Affinity, LocalObjectReference, PodSpec, Toleration};

/// Keeps `spec.replicas` of the Deployment at the requested count
#[derive(Debug, Default)]
pub struct ReplicasCF {
    existing: Option<i32>,
    target: Option<i32>,
}

impl ControlFunction for ReplicasCF {
    fn describe(&self) -> &str {
        "ReplicasCF"
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.existing = ctx
            .resources()
            .typed::<Deployment>()
            .and_then(|d| d.spec.as_ref())
            .and_then(|s| s.replicas);
        self.target = ctx.registry().map(|r| r.spec.target_replicas());
    }

    fn compare(&self) -> bool {
        self.target.is_some() && self.existing != self.target
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        let target = self.target;
        ctx.resources_mut().patch::<Deployment, _>(|deployment| {
            if let Some(spec) = deployment.spec.as_mut() {
                spec.replicas = target;
            }
        });
    }
}

/// Keeps the registry container image at the spec image or the operator default
#[derive(Debug, Default)]
pub struct ImageCF {
    has_container: bool,
    existing: Option<String>,
    target: Option<String>,
}

impl ControlFunction for ImageCF {
    fn describe(&self) -> &str {
        "ImageCF"
    }

    fn sense(&mut self, ctx: &LoopContext) {
        let container = ctx
            .resources()
            .typed::<Deployment>()
            .and_then(registry_container);
        self.has_container = container.is_some();
        self.existing = container.and_then(|c| c.image.clone());

        // Unresolvable images are reported by ConfigurationErrorCF
        self.target = ctx.registry().and_then(|registry| {
            let spec = &registry.spec;
            if !spec.deployment.image.is_empty() {
                return Some(spec.deployment.image.clone());
            }
            spec.persistence()
                .and_then(|p| ctx.config().default_image(p))
                .map(String::from)
        });
    }

    fn compare(&self) -> bool {
        self.has_container && self.target.is_some() && self.existing != self.target
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        let target = self.target.clone();
        ctx.resources_mut().patch::<Deployment, _>(|deployment| {
            if let Some(container) = registry_container_mut(deployment) {
                container.image = target;
            }
        });
    }
}

/// Applies the operator wide pull policy to the registry container
#[derive(Debug, Default)]
pub struct ImagePullPolicyCF {
    has_container: bool,
    existing: Option<String>,
    target: Option<String>,
}

impl ControlFunction for ImagePullPolicyCF {
    fn describe(&self) -> &str {
        "ImagePullPolicyCF"
    }

    fn sense(&mut self, ctx: &LoopContext) {
        let container = ctx
            .resources()
            .typed::<Deployment>()
            .and_then(registry_container);
        self.has_container = container.is_some();
        self.existing = container.and_then(|c| c.image_pull_policy.clone());
        self.target = ctx.config().image_pull_policy.clone();
    }

    fn compare(&self) -> bool {
        self.has_container && self.target.is_some() && self.existing != self.target
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        let target = self.target.clone();
        ctx.resources_mut().patch::<Deployment, _>(|deployment| {
            if let Some(container) = registry_container_mut(deployment) {
                container.image_pull_policy = target;
            }
        });
    }
}

/// Copies one optional pod spec field from the registry spec
pub struct PodSpecFieldCF<T> {
    describe: &'static str,
    target_of: fn(&ApicurioRegistrySpec) -> Option<T>,
    read: fn(&PodSpec) -> Option<T>,
    write: fn(&mut PodSpec, Option<T>),
    existing: Option<T>,
    target: Option<T>,
    has_pod: bool,
}

impl<T> PodSpecFieldCF<T> {
    fn new(
        describe: &'static str,
        target_of: fn(&ApicurioRegistrySpec) -> Option<T>,
        read: fn(&PodSpec) -> Option<T>,
        write: fn(&mut PodSpec, Option<T>),
    ) -> Self {
        Self {
            describe,
            target_of,
            read,
            write,
            existing: None,
            target: None,
            has_pod: false,
        }
    }
}

fn non_empty<T: Clone>(values: &[T]) -> Option<Vec<T>> {
    (!values.is_empty()).then(|| values.to_vec())
}

impl PodSpecFieldCF<Affinity> {
    pub fn affinity() -> Self {
        Self::new(
            "AffinityCF",
            |spec| spec.deployment.affinity.clone(),
            |pod| pod.affinity.clone(),
            |pod, value| pod.affinity = value,
        )
    }
}

impl PodSpecFieldCF<Vec<Toleration>> {
    pub fn tolerations() -> Self {
        Self::new(
            "TolerationsCF",
            |spec| non_empty(&spec.deployment.tolerations),
            |pod| pod.tolerations.clone(),
            |pod, value| pod.tolerations = value,
        )
    }
}

impl PodSpecFieldCF<Vec<LocalObjectReference>> {
    pub fn image_pull_secrets() -> Self {
        Self::new(
            "ImagePullSecretsCF",
            |spec| non_empty(&spec.deployment.image_pull_secrets),
            |pod| pod.image_pull_secrets.clone(),
            |pod, value| pod.image_pull_secrets = value,
        )
    }
}

impl<T> ControlFunction for PodSpecFieldCF<T>
where
    T: Clone + PartialEq + Send,
{
    fn describe(&self) -> &str {
        self.describe
    }

    fn sense(&mut self, ctx: &LoopContext) {
        let pod = ctx.resources().typed::<Deployment>().and_then(pod_spec);
        self.has_pod = pod.is_some();
        self.existing = pod.and_then(|p| (self.read)(p));
        self.target = ctx.registry().and_then(|r| (self.target_of)(&r.spec));
    }

    fn compare(&self) -> bool {
        self.has_pod && self.existing != self.target
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        let target = self.target.clone();
        let write = self.write;
        ctx.resources_mut().patch::<Deployment, _>(|deployment| {
            if let Some(pod) = pod_spec_mut(deployment) {
                write(pod, target);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ClusterCapabilities;
    use crate::config::OperatorConfig;
    use crate::resources::ResourceFactory;
    use crate::testing;

    fn context_with_deployment(spec: ApicurioRegistrySpec, config: OperatorConfig) -> LoopContext {
        let mut ctx = testing::context_with_config(
            testing::registry("registry", spec),
            config,
            ClusterCapabilities::all(),
        );
        let deployment = ResourceFactory::from_context(&ctx).deployment();
        ctx.resources_mut()
            .insert_observed("registry-deployment", deployment);
        ctx
    }

    fn converge(cf: &mut dyn ControlFunction, ctx: &mut LoopContext) {
        cf.sense(ctx);
        assert!(cf.compare(), "{} found nothing to do", cf.describe());
        cf.respond(ctx);
        cf.sense(ctx);
        assert!(!cf.compare(), "{} did not converge", cf.describe());
    }

    fn deployment(ctx: &LoopContext) -> &Deployment {
        ctx.resources().typed::<Deployment>().unwrap()
    }

    #[test]
    fn test_replicas() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.deployment.replicas = 3;
        let mut ctx = context_with_deployment(spec, OperatorConfig::default());

        converge(&mut ReplicasCF::default(), &mut ctx);
        assert_eq!(deployment(&ctx).spec.as_ref().unwrap().replicas, Some(3));
    }

    #[test]
    fn test_zero_replicas_means_one() {
        let mut ctx =
            context_with_deployment(ApicurioRegistrySpec::default(), OperatorConfig::default());
        let mut cf = ReplicasCF::default();
        cf.sense(&ctx);
        assert!(!cf.compare());

        ctx.resources_mut().patch::<Deployment, _>(|d| {
            d.spec.as_mut().unwrap().replicas = Some(5);
        });
        converge(&mut cf, &mut ctx);
        assert_eq!(deployment(&ctx).spec.as_ref().unwrap().replicas, Some(1));
    }

    #[test]
    fn test_image_from_operator_default() {
        let config = OperatorConfig {
            image_sql: Some("apicurio/apicurio-registry-sql:2.6.x".to_string()),
            ..Default::default()
        };
        let mut spec = ApicurioRegistrySpec::default();
        spec.configuration.persistence = "sql".to_string();
        let mut ctx = context_with_deployment(spec, config);

        converge(&mut ImageCF::default(), &mut ctx);
        assert_eq!(
            registry_container(deployment(&ctx)).unwrap().image.as_deref(),
            Some("apicurio/apicurio-registry-sql:2.6.x")
        );
    }

    #[test]
    fn test_spec_image_wins() {
        let config = OperatorConfig {
            image_mem: Some("default:1".to_string()),
            ..Default::default()
        };
        let mut spec = ApicurioRegistrySpec::default();
        spec.deployment.image = "custom:2".to_string();
        let mut ctx = context_with_deployment(spec, config);

        converge(&mut ImageCF::default(), &mut ctx);
        assert_eq!(
            registry_container(deployment(&ctx)).unwrap().image.as_deref(),
            Some("custom:2")
        );
    }

    #[test]
    fn test_unknown_image_is_left_alone() {
        let ctx =
            context_with_deployment(ApicurioRegistrySpec::default(), OperatorConfig::default());
        let mut cf = ImageCF::default();
        cf.sense(&ctx);
        assert!(!cf.compare());
    }

    #[test]
    fn test_image_pull_policy() {
        let config = OperatorConfig {
            image_pull_policy: Some("Always".to_string()),
            ..Default::default()
        };
        let mut ctx = context_with_deployment(ApicurioRegistrySpec::default(), config);
        converge(&mut ImagePullPolicyCF::default(), &mut ctx);
        assert_eq!(
            registry_container(deployment(&ctx))
                .unwrap()
                .image_pull_policy
                .as_deref(),
            Some("Always")
        );
    }

    #[test]
    fn test_unset_pull_policy_keeps_cluster_default() {
        let mut ctx =
            context_with_deployment(ApicurioRegistrySpec::default(), OperatorConfig::default());
        ctx.resources_mut().patch::<Deployment, _>(|d| {
            registry_container_mut(d).unwrap().image_pull_policy = Some("IfNotPresent".to_string());
        });
        let mut cf = ImagePullPolicyCF::default();
        cf.sense(&ctx);
        assert!(!cf.compare());
    }

    #[test]
    fn test_tolerations_are_set_and_cleared() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.deployment.tolerations = vec![Toleration {
            key: Some("dedicated".to_string()),
            operator: Some("Exists".to_string()),
            ..Default::default()
        }];
        let mut ctx = context_with_deployment(spec, OperatorConfig::default());
        let mut cf = PodSpecFieldCF::tolerations();
        converge(&mut cf, &mut ctx);
        assert_eq!(
            pod_spec(deployment(&ctx)).unwrap().tolerations.as_ref().map(Vec::len),
            Some(1)
        );

        let registry = testing::registry("registry", ApicurioRegistrySpec::default());
        ctx.resources_mut().insert_observed("registry", registry);
        converge(&mut cf, &mut ctx);
        assert_eq!(pod_spec(deployment(&ctx)).unwrap().tolerations, None);
    }

    #[test]
    fn test_image_pull_secrets() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.deployment.image_pull_secrets = vec![LocalObjectReference {
            name: "pull-secret".to_string(),
        }];
        let mut ctx = context_with_deployment(spec, OperatorConfig::default());
        converge(&mut PodSpecFieldCF::image_pull_secrets(), &mut ctx);
        assert_eq!(
            pod_spec(deployment(&ctx))
                .unwrap()
                .image_pull_secrets
                .as_ref()
                .map(|s| s[0].name.as_str()),
            Some("pull-secret")
        );
    }

    #[test]
    fn test_nothing_to_do_without_deployment() {
        let mut spec = ApicurioRegistrySpec::default();
        spec.deployment.affinity = Some(Affinity::default());
        let ctx = testing::context_for(
            testing::registry("registry", spec),
            ClusterCapabilities::all(),
        );
        let mut cf = PodSpecFieldCF::affinity();
        cf.sense(&ctx);
        assert!(!cf.compare());
    }
}
