//! Test support
//!
//! In-memory stand-ins for the cluster so control functions and whole loops can
//! be exercised without an API server.

use crate::capabilities::ClusterCapabilities;
use crate::config::OperatorConfig;
use crate::context::{AppRef, LoopContext};
use crate::control_loop::LoopServices;
use crate::crd::{ApicurioRegistry, ApicurioRegistrySpec};
use crate::kinds::{ResourceKey, ResourceKind};
use crate::patcher::{pending_write, KubeKind, PendingWrite};
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::sync::Arc;

/// Services that pretend every flush and deletion succeeds
#[derive(Debug, Default)]
pub struct NoopServices {
    pub before_runs: usize,
    pub after_runs: usize,
    pub cleanup_passes: usize,
    /// Keys deleted so far, in deletion order
    pub deleted: Vec<ResourceKey>,
}

#[async_trait]
impl LoopServices for NoopServices {
    async fn before_run(&mut self, _ctx: &mut LoopContext) {
        self.before_runs += 1;
    }

    async fn after_run(&mut self, ctx: &mut LoopContext) {
        self.after_runs += 1;
        flush_in_memory(ctx);
    }

    async fn after_cleanup_pass(&mut self, ctx: &mut LoopContext) -> bool {
        self.cleanup_passes += 1;
        self.deleted
            .extend(ctx.take_pending_deletions().into_iter().map(|(key, _)| key));
        true
    }
}

/// Write every changed entry the way the API server would see it.
///
/// Entries whose value did not actually change are marked clean without a
/// write, new objects are named after their metadata.
pub fn flush_in_memory(ctx: &mut LoopContext) {
    for key in ctx.resources().changed_keys() {
        match key {
            ResourceKey::Registry => flush_kind::<ApicurioRegistry>(ctx),
            ResourceKey::Deployment => flush_kind::<Deployment>(ctx),
            ResourceKey::Service => flush_kind::<Service>(ctx),
            ResourceKey::Ingress => flush_kind::<Ingress>(ctx),
            ResourceKey::PodDisruptionBudget => flush_kind::<PodDisruptionBudget>(ctx),
            ResourceKey::NetworkPolicy => flush_kind::<NetworkPolicy>(ctx),
        }
    }
}

fn flush_kind<K: KubeKind>(ctx: &mut LoopContext) {
    let (name, value) = match pending_write::<K>(ctx) {
        Ok(Some(PendingWrite::Create(object))) => (object.name_any(), object.into_resource()),
        Ok(Some(PendingWrite::Patch { name, .. })) => match ctx.resources().get(&K::KEY) {
            Some(entry) => (name, entry.value().clone()),
            None => return,
        },
        Ok(None) | Err(_) => return,
    };
    if let Some(entry) = ctx.resources_mut().get_mut(&K::KEY) {
        entry.mark_flushed(name, value);
    }
}

/// Registry resource named `name` in namespace `default`
pub fn registry(name: &str, spec: ApicurioRegistrySpec) -> ApicurioRegistry {
    let mut registry = ApicurioRegistry::new(name, spec);
    registry.metadata = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some("default".to_string()),
        uid: Some(format!("{}-uid", name)),
        ..Default::default()
    };
    registry
}

/// Context holding `registry` as observed desired state
pub fn context_for(registry: ApicurioRegistry, capabilities: ClusterCapabilities) -> LoopContext {
    context_with_config(registry, OperatorConfig::default(), capabilities)
}

/// Like [`context_for`] with a custom operator configuration
pub fn context_with_config(
    registry: ApicurioRegistry,
    config: OperatorConfig,
    capabilities: ClusterCapabilities,
) -> LoopContext {
    let name = registry.metadata.name.clone().unwrap_or_default();
    let namespace = registry
        .metadata
        .namespace
        .clone()
        .unwrap_or_else(|| "default".to_string());
    let mut ctx = LoopContext::new(
        AppRef::new(namespace, name.clone()),
        Arc::new(config),
        capabilities,
    );
    ctx.resources_mut().insert_observed(name, registry);
    ctx
}
