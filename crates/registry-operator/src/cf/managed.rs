//! Existence of the managed resources
//!
//! One generic control function per kind: it puts a default object into the
//! cache when the resource is wanted but not tracked, and stages its deletion
//! when it is tracked but no longer wanted. Creation itself happens when the
//! services layer flushes the cache, so later functions can still adjust the
//! new object within the same run.

use crate::context::LoopContext;
use crate::control_loop::ControlFunction;
use crate::kinds::{ResourceKey, ResourceKind};
use crate::resources::ResourceFactory;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use tracing::{debug, info};

/// A resource kind whose existence is managed by [`ManagedResourceCF`]
pub trait Managed: ResourceKind + Send + 'static {
    const DESCRIBE: &'static str;

    /// Resource that has to be deleted before this one
    const DELETE_AFTER: Option<ResourceKey> = None;

    /// Whether the registry should currently have this resource
    fn wanted(ctx: &LoopContext) -> bool {
        ctx.registry().is_some()
    }

    /// Default object, `None` while a prerequisite is missing
    fn build(ctx: &LoopContext) -> Option<Self>;
}

impl Managed for Deployment {
    const DESCRIBE: &'static str = "DeploymentCF";
    const DELETE_AFTER: Option<ResourceKey> = Some(ResourceKey::Service);

    fn build(ctx: &LoopContext) -> Option<Self> {
        Some(ResourceFactory::from_context(ctx).deployment())
    }
}

impl Managed for Service {
    const DESCRIBE: &'static str = "ServiceCF";
    const DELETE_AFTER: Option<ResourceKey> = Some(ResourceKey::Ingress);

    fn build(ctx: &LoopContext) -> Option<Self> {
        Some(ResourceFactory::from_context(ctx).service())
    }
}

impl Managed for Ingress {
    const DESCRIBE: &'static str = "IngressCF";

    fn wanted(ctx: &LoopContext) -> bool {
        ctx.registry().is_some_and(|r| {
            !r.spec.deployment.host.is_empty()
                && !r.spec.deployment.managed_resources.disable_ingress
        })
    }

    fn build(ctx: &LoopContext) -> Option<Self> {
        let host = &ctx.registry()?.spec.deployment.host;
        // The backend must reference the real Service name
        let service = ctx.resources().entry_of::<Service>()?.name().as_str()?;
        Some(ResourceFactory::from_context(ctx).ingress(host, service))
    }
}

impl Managed for PodDisruptionBudget {
    const DESCRIBE: &'static str = "PodDisruptionBudgetCF";

    fn wanted(ctx: &LoopContext) -> bool {
        ctx.registry().is_some_and(|r| {
            !r.spec
                .deployment
                .managed_resources
                .disable_pod_disruption_budget
        })
    }

    fn build(ctx: &LoopContext) -> Option<Self> {
        Some(ResourceFactory::from_context(ctx).pod_disruption_budget())
    }
}

impl Managed for NetworkPolicy {
    const DESCRIBE: &'static str = "NetworkPolicyCF";

    fn wanted(ctx: &LoopContext) -> bool {
        ctx.registry()
            .is_some_and(|r| !r.spec.deployment.managed_resources.disable_network_policy)
    }

    fn build(ctx: &LoopContext) -> Option<Self> {
        Some(ResourceFactory::from_context(ctx).network_policy())
    }
}

/// Keeps exactly one `T` in the cache while it is wanted
pub struct ManagedResourceCF<T> {
    cached: bool,
    wanted: bool,
    desired: Option<T>,
}

impl<T> Default for ManagedResourceCF<T> {
    fn default() -> Self {
        Self {
            cached: false,
            wanted: false,
            desired: None,
        }
    }
}

pub type DeploymentCF = ManagedResourceCF<Deployment>;
pub type ServiceCF = ManagedResourceCF<Service>;
pub type IngressCF = ManagedResourceCF<Ingress>;
pub type PodDisruptionBudgetCF = ManagedResourceCF<PodDisruptionBudget>;
pub type NetworkPolicyCF = ManagedResourceCF<NetworkPolicy>;

impl<T: Managed> ControlFunction for ManagedResourceCF<T> {
    fn describe(&self) -> &str {
        T::DESCRIBE
    }

    fn sense(&mut self, ctx: &LoopContext) {
        self.cached = ctx.resources().contains(&T::KEY);
        self.wanted = T::wanted(ctx);
        self.desired = if self.wanted && !self.cached {
            T::build(ctx)
        } else {
            None
        };
    }

    fn compare(&self) -> bool {
        (self.cached && !self.wanted) || (!self.cached && self.desired.is_some())
    }

    fn respond(&mut self, ctx: &mut LoopContext) {
        if !self.wanted {
            info!(app = %ctx.app(), kind = %T::KEY, "Resource no longer wanted, deleting");
            ctx.request_deletion(T::KEY);
            return;
        }
        if let Some(value) = self.desired.take() {
            debug!(app = %ctx.app(), kind = %T::KEY, "Adding default resource to the cache");
            ctx.resources_mut().insert_new(value);
        }
    }

    fn cleanup(&mut self, ctx: &mut LoopContext) -> bool {
        if let Some(dependency) = T::DELETE_AFTER {
            if ctx.resources().contains(&dependency) {
                return false;
            }
        }
        ctx.request_deletion(T::KEY);
        true
    }
}
