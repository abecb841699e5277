//! Loop context
//!
//! Everything one registry instance carries across reconciliations: both
//! caches, the requeue accumulator, the status side channel and the deletions
//! staged for the services layer. A context is owned by exactly one
//! [`ControlLoop`](crate::control_loop::ControlLoop) and never shared.

use crate::capabilities::ClusterCapabilities;
use crate::config::OperatorConfig;
use crate::crd::ApicurioRegistry;
use crate::env_cache::EnvCache;
use crate::kinds::{RegistryCache, RegistryCacheEntry, ResourceKey};
use crate::status::StatusReporter;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Delay used by [`LoopContext::set_requeue_soon`]
pub const REQUEUE_SOON: Duration = Duration::from_secs(5);

/// Namespace and name of the managed registry
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AppRef {
    pub namespace: String,
    pub name: String,
}

impl AppRef {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for AppRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Shared state of one registry instance
#[derive(Debug)]
pub struct LoopContext {
    app: AppRef,
    attempt: usize,
    resources: RegistryCache,
    env: EnvCache,
    requeue: Option<Duration>,
    status: StatusReporter,
    pending_deletions: Vec<(ResourceKey, RegistryCacheEntry)>,
    config: Arc<OperatorConfig>,
    capabilities: ClusterCapabilities,
}

impl LoopContext {
    pub fn new(
        app: AppRef,
        config: Arc<OperatorConfig>,
        capabilities: ClusterCapabilities,
    ) -> Self {
        Self {
            app,
            attempt: 0,
            resources: RegistryCache::new(),
            env: EnvCache::new(),
            requeue: None,
            status: StatusReporter::default(),
            pending_deletions: Vec::new(),
            config,
            capabilities,
        }
    }

    pub fn app(&self) -> &AppRef {
        &self.app
    }

    /// Index of the current stabilization attempt within a run
    pub fn attempt(&self) -> usize {
        self.attempt
    }

    pub(crate) fn set_attempt(&mut self, attempt: usize) {
        self.attempt = attempt;
    }

    pub fn resources(&self) -> &RegistryCache {
        &self.resources
    }

    pub fn resources_mut(&mut self) -> &mut RegistryCache {
        &mut self.resources
    }

    pub fn env(&self) -> &EnvCache {
        &self.env
    }

    pub fn env_mut(&mut self) -> &mut EnvCache {
        &mut self.env
    }

    pub fn status(&self) -> &StatusReporter {
        &self.status
    }

    pub fn status_mut(&mut self) -> &mut StatusReporter {
        &mut self.status
    }

    pub fn config(&self) -> &OperatorConfig {
        &self.config
    }

    pub fn capabilities(&self) -> &ClusterCapabilities {
        &self.capabilities
    }

    /// Desired state of this run, if the trigger supplied it
    pub fn registry(&self) -> Option<&ApicurioRegistry> {
        self.resources.typed::<ApicurioRegistry>()
    }

    /// Ask for another reconciliation after `delay`; the shortest request wins
    pub fn set_requeue_after(&mut self, delay: Duration) {
        self.requeue = Some(match self.requeue {
            Some(current) => current.min(delay),
            None => delay,
        });
    }

    pub fn set_requeue_now(&mut self) {
        self.set_requeue_after(Duration::ZERO);
    }

    pub fn set_requeue_soon(&mut self) {
        self.set_requeue_after(REQUEUE_SOON);
    }

    /// Pending requeue request, without resetting it
    pub fn requeue(&self) -> Option<Duration> {
        self.requeue
    }

    /// Pending requeue request; resets the accumulator
    pub fn take_requeue(&mut self) -> Option<Duration> {
        self.requeue.take()
    }

    /// Stop tracking `key` and stage the object for deletion.
    ///
    /// Objects that were never created are simply forgotten. Returns whether
    /// anything was tracked under `key`.
    pub fn request_deletion(&mut self, key: ResourceKey) -> bool {
        match self.resources.remove(&key) {
            Some(entry) => {
                debug!(app = %self.app, key = %key, name = %entry.name(), "Staging deletion");
                if entry.name().is_created() {
                    self.pending_deletions.push((key, entry));
                }
                true
            }
            None => false,
        }
    }

    pub fn has_pending_deletions(&self) -> bool {
        !self.pending_deletions.is_empty()
    }

    /// Hand the staged deletions over to the services layer
    pub fn take_pending_deletions(&mut self) -> Vec<(ResourceKey, RegistryCacheEntry)> {
        std::mem::take(&mut self.pending_deletions)
    }
}
