//! Kubernetes services of a control loop
//!
//! [`KubeServices`] synchronizes the resource cache with the API server:
//! before a run it reloads every tracked object and adopts objects left behind
//! by an earlier operator process; after a run it executes staged deletions,
//! writes changed objects back, computes the Ready condition and patches the
//! registry status.
//!
//! API failures never abort a run. The affected entry is dropped from the
//! cache, so the next run reloads it, and an immediate requeue is requested.

use crate::context::LoopContext;
use crate::control_loop::LoopServices;
use crate::crd::{ApicurioRegistry, ApicurioRegistryStatus, ManagedResourceStatus};
use crate::error::{OperatorError, Result};
use crate::kinds::{RegistryCacheEntry, ResourceKey, ResourceKind};
use crate::resources::{owner_reference, read_host, ResourceFactory};
use crate::status::ReadyReason;
use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::{Ingress, NetworkPolicy};
use k8s_openapi::api::policy::v1::PodDisruptionBudget;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::{Client, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fmt::Debug;
use tracing::{debug, info, warn};

/// A managed kind the services layer can read and write
pub trait KubeKind:
    ResourceKind
    + kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
    + Debug
    + Serialize
    + DeserializeOwned
    + Send
    + Sync
    + 'static
{
}

impl<K> KubeKind for K where
    K: ResourceKind
        + kube::Resource<Scope = NamespaceResourceScope, DynamicType = ()>
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Loop services backed by the API server
#[derive(Clone)]
pub struct KubeServices {
    client: Client,
}

impl KubeServices {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K: KubeKind>(&self, ctx: &LoopContext) -> Api<K> {
        Api::namespaced(self.client.clone(), &ctx.app().namespace)
    }

    /// Keys the cluster can serve, in creation order
    fn served_keys(ctx: &LoopContext) -> Vec<ResourceKey> {
        let capabilities = ctx.capabilities();
        ResourceKey::MANAGED
            .into_iter()
            .filter(|key| match key {
                ResourceKey::Ingress => capabilities.ingress_v1,
                ResourceKey::PodDisruptionBudget => capabilities.pod_disruption_budget_v1,
                ResourceKey::NetworkPolicy => capabilities.network_policy_v1,
                _ => true,
            })
            .collect()
    }

    async fn reload_key(&self, ctx: &mut LoopContext, key: ResourceKey) {
        match key {
            ResourceKey::Deployment => self.reload::<Deployment>(ctx).await,
            ResourceKey::Service => self.reload::<Service>(ctx).await,
            ResourceKey::Ingress => self.reload::<Ingress>(ctx).await,
            ResourceKey::PodDisruptionBudget => self.reload::<PodDisruptionBudget>(ctx).await,
            ResourceKey::NetworkPolicy => self.reload::<NetworkPolicy>(ctx).await,
            ResourceKey::Registry => {}
        }
    }

    /// Refresh the cached `K` from the cluster, or adopt an existing object
    async fn reload<K: KubeKind>(&self, ctx: &mut LoopContext) {
        let api = self.api::<K>(ctx);
        let tracked = ctx
            .resources()
            .entry_of::<K>()
            .map(|entry| entry.name().as_str().map(String::from));

        let result = match tracked {
            // Not written yet, the next flush creates it
            Some(None) => return,
            Some(Some(name)) => api.get_opt(&name).await.map(|found| (name, found)),
            None => {
                let factory = ResourceFactory::from_context(ctx);
                adopt(&api, &factory, K::KEY)
                    .await
                    .map(|found| (String::new(), found))
            }
        };

        match result {
            Ok((_, Some(object))) if !is_terminating(&object) => {
                let name = object.name_any();
                debug!(app = %ctx.app(), key = %K::KEY, name = %name, "Loaded resource");
                ctx.resources_mut().insert_observed(name, object);
            }
            Ok((name, _)) => {
                if ctx.resources_mut().remove(&K::KEY).is_some() {
                    info!(app = %ctx.app(), key = %K::KEY, name = %name, "Resource is gone, forgetting it");
                }
            }
            Err(e) => {
                warn!(app = %ctx.app(), key = %K::KEY, error = %e, "Failed to load resource");
                ctx.resources_mut().remove(&K::KEY);
                ctx.set_requeue_now();
            }
        }
    }

    /// Execute staged deletions; returns whether all of them succeeded
    async fn execute_deletions(&self, ctx: &mut LoopContext) -> bool {
        let mut succeeded = true;
        for (key, entry) in ctx.take_pending_deletions() {
            let Some(name) = entry.name().as_str().map(String::from) else {
                continue;
            };
            let result = match key {
                ResourceKey::Deployment => self.delete::<Deployment>(ctx, &name).await,
                ResourceKey::Service => self.delete::<Service>(ctx, &name).await,
                ResourceKey::Ingress => self.delete::<Ingress>(ctx, &name).await,
                ResourceKey::PodDisruptionBudget => {
                    self.delete::<PodDisruptionBudget>(ctx, &name).await
                }
                ResourceKey::NetworkPolicy => self.delete::<NetworkPolicy>(ctx, &name).await,
                ResourceKey::Registry => Ok(()),
            };
            match result {
                Ok(()) => info!(app = %ctx.app(), key = %key, name = %name, "Deleted resource"),
                Err(e) => {
                    warn!(app = %ctx.app(), key = %key, name = %name, error = %e, "Failed to delete resource");
                    // Keep tracking it so the deletion is retried
                    ctx.resources_mut().set(key, entry);
                    ctx.set_requeue_now();
                    succeeded = false;
                }
            }
        }
        succeeded
    }

    async fn delete<K: KubeKind>(&self, ctx: &LoopContext, name: &str) -> Result<()> {
        match self
            .api::<K>(ctx)
            .delete(name, &DeleteParams::background())
            .await
        {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Write changed entries back; returns how many objects were written
    async fn flush(&self, ctx: &mut LoopContext) -> usize {
        let mut written = 0;
        for key in Self::served_keys(ctx) {
            let changed = ctx
                .resources()
                .get(&key)
                .is_some_and(RegistryCacheEntry::has_changed);
            if !changed {
                continue;
            }
            let result = match key {
                ResourceKey::Deployment => self.flush_kind::<Deployment>(ctx).await,
                ResourceKey::Service => self.flush_kind::<Service>(ctx).await,
                ResourceKey::Ingress => self.flush_kind::<Ingress>(ctx).await,
                ResourceKey::PodDisruptionBudget => {
                    self.flush_kind::<PodDisruptionBudget>(ctx).await
                }
                ResourceKey::NetworkPolicy => self.flush_kind::<NetworkPolicy>(ctx).await,
                ResourceKey::Registry => Ok(false),
            };
            match result {
                Ok(true) => written += 1,
                Ok(false) => {}
                Err(OperatorError::MissingOwner(owner)) => {
                    warn!(app = %ctx.app(), key = %key, owner = %owner, "Owner is not available yet, postponing creation");
                    ctx.resources_mut().remove(&key);
                    ctx.set_requeue_soon();
                }
                Err(e) => {
                    warn!(app = %ctx.app(), key = %key, error = %e, "Failed to write resource");
                    ctx.resources_mut().remove(&key);
                    ctx.set_requeue_now();
                }
            }
        }
        written
    }

    /// Create or patch the cached `K`; returns whether anything was sent
    async fn flush_kind<K: KubeKind>(&self, ctx: &mut LoopContext) -> Result<bool> {
        let api = self.api::<K>(ctx);
        let written = match pending_write::<K>(ctx)? {
            None => return Ok(false),
            Some(PendingWrite::Create(mut object)) => {
                let owner = ctx
                    .registry()
                    .and_then(owner_reference)
                    .ok_or_else(|| OperatorError::MissingOwner(ctx.app().to_string()))?;
                object.meta_mut().owner_references = Some(vec![owner]);
                let created = api.create(&PostParams::default(), &object).await?;
                info!(app = %ctx.app(), key = %K::KEY, name = %created.name_any(), "Created resource");
                created
            }
            Some(PendingWrite::Patch { name, patch }) => {
                debug!(app = %ctx.app(), key = %K::KEY, name = %name, operations = patch.0.len(), "Patching resource");
                api.patch(&name, &PatchParams::default(), &Patch::Json::<()>(patch))
                    .await?
            }
        };

        if let Some(entry) = ctx.resources_mut().get_mut(&K::KEY) {
            entry.mark_flushed(written.name_any(), written.into_resource());
        }
        Ok(true)
    }

    async fn patch_status(
        &self,
        ctx: &LoopContext,
        status: &ApicurioRegistryStatus,
    ) -> Result<()> {
        let api: Api<ApicurioRegistry> = Api::namespaced(self.client.clone(), &ctx.app().namespace);
        let patch = serde_json::json!({ "status": status });
        api.patch_status(&ctx.app().name, &PatchParams::default(), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LoopServices for KubeServices {
    async fn before_run(&mut self, ctx: &mut LoopContext) {
        for key in Self::served_keys(ctx) {
            self.reload_key(ctx, key).await;
        }
    }

    async fn after_run(&mut self, ctx: &mut LoopContext) {
        self.execute_deletions(ctx).await;
        let written = self.flush(ctx).await;

        let ready = ready_reason(ctx, written);
        ctx.status_mut().transition(ready);
        if ctx.status().ready() != ReadyReason::Reconciled {
            ctx.set_requeue_soon();
        }

        let host = match (
            ctx.resources().typed::<Ingress>(),
            ctx.resources().entry_of::<Service>().and_then(|e| e.name().as_str()),
        ) {
            (Some(ingress), Some(service)) => read_host(ingress, service),
            _ => None,
        };
        if let Some(host) = host {
            ctx.status_mut().set_host(host);
        }

        let Some(previous) = ctx.registry().map(|r| r.status.clone()) else {
            return;
        };
        let status = ctx
            .status()
            .render(previous.as_ref(), managed_resources(ctx), Utc::now());
        if previous.as_ref() == Some(&status) {
            return;
        }
        match self.patch_status(ctx, &status).await {
            Ok(()) => debug!(app = %ctx.app(), ready = ctx.status().ready().as_str(), "Updated status"),
            Err(e) => {
                warn!(app = %ctx.app(), error = %e, "Failed to update status");
                ctx.set_requeue_soon();
            }
        }
    }

    async fn after_cleanup_pass(&mut self, ctx: &mut LoopContext) -> bool {
        self.execute_deletions(ctx).await
    }
}

/// Write the API server has to receive for a cached object
#[derive(Debug)]
pub(crate) enum PendingWrite<K> {
    Create(K),
    Patch { name: String, patch: json_patch::Patch },
}

/// Work a flush of the cached `K` has to send.
///
/// An entry that is marked changed but equals its original value is marked
/// clean here and needs no write.
pub(crate) fn pending_write<K: KubeKind>(ctx: &mut LoopContext) -> Result<Option<PendingWrite<K>>> {
    let Some(entry) = ctx.resources().entry_of::<K>() else {
        return Ok(None);
    };
    if !entry.has_changed() {
        return Ok(None);
    }
    let Some(current) = entry.typed::<K>().cloned() else {
        return Ok(None);
    };
    let Some(name) = entry.name().as_str().map(String::from) else {
        return Ok(Some(PendingWrite::Create(current)));
    };

    let original = K::from_resource(entry.original_value())
        .ok_or_else(|| OperatorError::Internal(format!("{} entry holds a different kind", K::KEY)))?;
    let patch = diff(original, &current)?;
    if patch.0.is_empty() {
        if let Some(entry) = ctx.resources_mut().get_mut(&K::KEY) {
            entry.reset_changed();
        }
        return Ok(None);
    }
    Ok(Some(PendingWrite::Patch { name, patch }))
}

/// Look up an object left behind by an earlier operator process.
///
/// A single live object carrying the registry's app label is adopted. With
/// several candidates only the one with the default name is taken.
async fn adopt<K: KubeKind>(
    api: &Api<K>,
    factory: &ResourceFactory,
    key: ResourceKey,
) -> std::result::Result<Option<K>, kube::Error> {
    let lp = ListParams::default().labels(&factory.adoption_selector());
    let candidates: Vec<K> = api
        .list(&lp)
        .await?
        .items
        .into_iter()
        .filter(|object| !is_terminating(object))
        .collect();
    Ok(select_adoptee(candidates, &factory.default_name(key)))
}

fn select_adoptee<K: kube::Resource>(mut candidates: Vec<K>, default_name: &str) -> Option<K> {
    if candidates.len() <= 1 {
        return candidates.pop();
    }
    let names: Vec<String> = candidates.iter().map(ResourceExt::name_any).collect();
    match candidates
        .into_iter()
        .find(|c| c.meta().name.as_deref() == Some(default_name))
    {
        Some(found) => Some(found),
        None => {
            warn!(?names, "Several candidates for adoption, leaving them alone");
            None
        }
    }
}

fn is_terminating<K: kube::Resource>(object: &K) -> bool {
    object.meta().deletion_timestamp.is_some()
}

/// JSON patch turning `original` into `current`
fn diff<K: Serialize>(original: &K, current: &K) -> Result<json_patch::Patch> {
    let original = serde_json::to_value(original)?;
    let current = serde_json::to_value(current)?;
    Ok(json_patch::diff(&original, &current))
}

/// Ready reason implied by the state after flushing
fn ready_reason(ctx: &LoopContext, written: usize) -> ReadyReason {
    let available = ctx
        .resources()
        .entry_of::<Deployment>()
        .filter(|entry| entry.name().is_created())
        .and_then(|entry| entry.typed::<Deployment>())
        .and_then(|d| d.status.as_ref())
        .and_then(|s| s.ready_replicas)
        .is_some_and(|ready| ready >= 1);

    if !available {
        ReadyReason::Initializing
    } else if written > 0 {
        ReadyReason::Reconciling
    } else {
        ReadyReason::Reconciled
    }
}

/// Created objects, for `status.managedResources`
fn managed_resources(ctx: &LoopContext) -> Vec<ManagedResourceStatus> {
    ResourceKey::MANAGED
        .into_iter()
        .filter_map(|key| {
            let name = ctx.resources().get(&key)?.name().as_str()?;
            Some(ManagedResourceStatus {
                kind: key.kind().to_string(),
                name: name.to_string(),
                namespace: ctx.app().namespace.clone(),
            })
        })
        .collect()
}
