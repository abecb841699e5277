//! Control loop
//!
//! Drives an ordered set of [`ControlFunction`]s to a fixed point. Each run
//! repeats sense → compare → respond over all functions until a full pass finds
//! no discrepancy. Registration order is the schedule: functions that create a
//! resource come before the ones adjusting it, env producers before the function
//! writing the env into the Deployment.
//!
//! The synchronous part ([`ControlLoop::converge`]) never performs I/O. Loading
//! and writing back the cached resources is done by the [`LoopServices`]
//! collaborator before and after each run.
//!
//! Failing to stabilize within `2 * N` attempts means two functions fight over
//! the same field. That is a programming error and panics.

use crate::context::LoopContext;
use async_trait::async_trait;
use std::time::Duration;
use tracing::{debug, info, instrument, warn};

/// How a function's discrepancy affects stabilization
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ControlMode {
    /// A discrepancy keeps the loop running
    #[default]
    Blocking,
    /// Responds at most once per run and never blocks stabilization.
    ///
    /// For functions that always fire, such as health reporting.
    Advisory,
}

/// One declarative rule of desired vs. actual state
pub trait ControlFunction: Send {
    /// Name used in logs and diagnostics
    fn describe(&self) -> &str;

    fn mode(&self) -> ControlMode {
        ControlMode::Blocking
    }

    /// Read current and desired state into private fields.
    ///
    /// May consult [`LoopContext::attempt`]; must not modify shared state.
    fn sense(&mut self, ctx: &LoopContext);

    /// Whether a discrepancy exists that [`respond`](Self::respond) must fix
    fn compare(&self) -> bool;

    /// Fix the discrepancy through the context's caches
    fn respond(&mut self, ctx: &mut LoopContext);

    /// Tear down owned resources; `false` means "not done yet, retry"
    fn cleanup(&mut self, _ctx: &mut LoopContext) -> bool {
        true
    }
}

/// External collaborators that synchronize the caches with the cluster
#[async_trait]
pub trait LoopServices: Send {
    /// Refresh the resource cache before a run
    async fn before_run(&mut self, ctx: &mut LoopContext);

    /// Publish status and flush changed cache entries after a run
    async fn after_run(&mut self, ctx: &mut LoopContext);

    /// Refresh the resource cache before cleanup
    async fn before_cleanup(&mut self, ctx: &mut LoopContext) {
        self.before_run(ctx).await;
    }

    /// Execute the deletions staged during a cleanup pass.
    ///
    /// Returns false when some deletion has to be retried.
    async fn after_cleanup_pass(&mut self, ctx: &mut LoopContext) -> bool;
}

/// Outcome of one [`ControlLoop::run`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunReport {
    /// Attempts needed to stabilize
    pub attempts: usize,
    /// Requested requeue delay, if any
    pub requeue: Option<Duration>,
}

/// Fixed-point scheduler of one registry instance
pub struct ControlLoop<S> {
    ctx: LoopContext,
    functions: Vec<Box<dyn ControlFunction>>,
    services: S,
}

impl<S: LoopServices> ControlLoop<S> {
    pub fn new(ctx: LoopContext, services: S) -> Self {
        Self {
            ctx,
            functions: Vec::new(),
            services,
        }
    }

    /// Append a function to the schedule
    pub fn add_control_function<F>(&mut self, function: F)
    where
        F: ControlFunction + 'static,
    {
        self.functions.push(Box::new(function));
    }

    pub fn context(&self) -> &LoopContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut LoopContext {
        &mut self.ctx
    }

    pub fn services(&self) -> &S {
        &self.services
    }

    /// Registered function names, in schedule order
    pub fn describe(&self) -> Vec<&str> {
        self.functions.iter().map(|f| f.describe()).collect()
    }

    fn max_attempts(&self) -> usize {
        self.functions.len() * 2
    }

    /// Reload, stabilize, then flush.
    ///
    /// Pending env tombstones are purged before the flush.
    #[instrument(skip(self), fields(app = %self.ctx.app()))]
    pub async fn run(&mut self) -> RunReport {
        self.services.before_run(&mut self.ctx).await;

        self.ctx.status_mut().reset();
        let attempts = self.converge();
        self.ctx.env_mut().process_and_advance_to_next_period();

        self.services.after_run(&mut self.ctx).await;

        RunReport {
            attempts,
            requeue: self.ctx.take_requeue(),
        }
    }

    /// Run all functions until a pass finds no blocking discrepancy.
    ///
    /// Returns the number of attempts used.
    ///
    /// # Panics
    ///
    /// Panics when the functions have not stabilized after `2 * N` attempts.
    pub fn converge(&mut self) -> usize {
        if self.functions.is_empty() {
            return 0;
        }

        let max_attempts = self.max_attempts();
        let mut advisory_responded = vec![false; self.functions.len()];
        let mut responders: Vec<String> = Vec::new();

        for attempt in 0..max_attempts {
            self.ctx.set_attempt(attempt);
            debug!(attempt, max_attempts, "Control loop executing");

            responders.clear();
            for (index, function) in self.functions.iter_mut().enumerate() {
                function.sense(&self.ctx);
                if !function.compare() {
                    continue;
                }
                match function.mode() {
                    ControlMode::Blocking => {
                        debug!(attempt, function = function.describe(), "Responding");
                        function.respond(&mut self.ctx);
                        responders.push(function.describe().to_string());
                    }
                    ControlMode::Advisory if !advisory_responded[index] => {
                        debug!(attempt, function = function.describe(), "Responding (advisory)");
                        function.respond(&mut self.ctx);
                        advisory_responded[index] = true;
                    }
                    ControlMode::Advisory => {}
                }
            }

            if responders.is_empty() {
                debug!(attempts = attempt + 1, "Control loop stabilized");
                return attempt + 1;
            }
        }

        panic!(
            "Control loop stabilization limit exceeded after {} attempts, still responding: {}",
            max_attempts,
            responders.join(", ")
        );
    }

    /// Undo the managed resources, retrying functions that are not done.
    ///
    /// Returns false when the attempt budget ran out; resources may then have
    /// to be removed manually.
    #[instrument(skip(self), fields(app = %self.ctx.app()))]
    pub async fn cleanup(&mut self) -> bool {
        if self.functions.is_empty() {
            return true;
        }

        self.services.before_cleanup(&mut self.ctx).await;

        let max_attempts = self.max_attempts();
        for attempt in 0..max_attempts {
            self.ctx.set_attempt(attempt);

            let mut finished = true;
            for function in self.functions.iter_mut() {
                if !function.cleanup(&mut self.ctx) {
                    debug!(attempt, function = function.describe(), "Cleanup not finished");
                    finished = false;
                }
            }

            let deleted = self.services.after_cleanup_pass(&mut self.ctx).await;
            if finished && deleted {
                info!(attempts = attempt + 1, "Cleanup finished");
                return true;
            }
        }

        warn!(
            max_attempts,
            "Cleanup limit exceeded, managed resources may have to be removed manually"
        );
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capabilities::ClusterCapabilities;
    use crate::config::OperatorConfig;
    use crate::context::AppRef;
    use crate::env_cache::EnvCacheEntry;
    use crate::kinds::ResourceKey;
    use crate::testing::NoopServices;
    use k8s_openapi::api::core::v1::Service;
    use k8s_openapi::api::networking::v1::Ingress;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    fn control_loop() -> ControlLoop<NoopServices> {
        let ctx = LoopContext::new(
            AppRef::new("default", "registry"),
            Arc::new(OperatorConfig::default()),
            ClusterCapabilities::default(),
        );
        ControlLoop::new(ctx, NoopServices::default())
    }

    /// Writes `name=value` into the env cache until it is there
    struct SetEnv {
        label: &'static str,
        name: &'static str,
        value: &'static str,
        present: bool,
    }

    impl SetEnv {
        fn new(label: &'static str, name: &'static str, value: &'static str) -> Self {
            Self {
                label,
                name,
                value,
                present: false,
            }
        }
    }

    impl ControlFunction for SetEnv {
        fn describe(&self) -> &str {
            self.label
        }

        fn sense(&mut self, ctx: &LoopContext) {
            self.present = ctx
                .env()
                .get(self.name)
                .and_then(|e| e.value().value.as_deref())
                == Some(self.value);
        }

        fn compare(&self) -> bool {
            !self.present
        }

        fn respond(&mut self, ctx: &mut LoopContext) {
            if let Ok(entry) = EnvCacheEntry::simple(self.name, self.value).build() {
                ctx.env_mut().set(entry);
            }
        }
    }

    /// Always finds a discrepancy and counts its responses
    struct AlwaysFires {
        mode: ControlMode,
        responses: Arc<AtomicUsize>,
    }

    impl ControlFunction for AlwaysFires {
        fn describe(&self) -> &str {
            "AlwaysFires"
        }

        fn mode(&self) -> ControlMode {
            self.mode
        }

        fn sense(&mut self, _ctx: &LoopContext) {}

        fn compare(&self) -> bool {
            true
        }

        fn respond(&mut self, ctx: &mut LoopContext) {
            self.responses.fetch_add(1, Ordering::SeqCst);
            ctx.set_requeue_soon();
        }
    }

    /// Records the attempt index it was sensed in
    struct RecordAttempts {
        seen: Arc<Mutex<Vec<usize>>>,
    }

    impl ControlFunction for RecordAttempts {
        fn describe(&self) -> &str {
            "RecordAttempts"
        }

        fn sense(&mut self, ctx: &LoopContext) {
            self.seen.lock().unwrap().push(ctx.attempt());
        }

        fn compare(&self) -> bool {
            false
        }

        fn respond(&mut self, _ctx: &mut LoopContext) {}
    }

    /// Deletes its resource only after `waits_for` is gone
    struct Teardown {
        key: ResourceKey,
        waits_for: Option<ResourceKey>,
    }

    impl ControlFunction for Teardown {
        fn describe(&self) -> &str {
            "Teardown"
        }

        fn sense(&mut self, _ctx: &LoopContext) {}

        fn compare(&self) -> bool {
            false
        }

        fn respond(&mut self, _ctx: &mut LoopContext) {}

        fn cleanup(&mut self, ctx: &mut LoopContext) -> bool {
            if let Some(dependency) = self.waits_for {
                if ctx.resources().contains(&dependency) {
                    return false;
                }
            }
            ctx.request_deletion(self.key);
            true
        }
    }

    #[tokio::test]
    async fn test_run_converges() {
        let mut cl = control_loop();
        cl.add_control_function(SetEnv::new("A", "A", "1"));
        cl.add_control_function(SetEnv::new("B", "B", "2"));

        let report = cl.run().await;
        assert_eq!(report.attempts, 2);
        assert_eq!(report.requeue, None);
        assert!(!cl.context().env().is_changed());

        // Nothing left to do on the next run
        let report = cl.run().await;
        assert_eq!(report.attempts, 1);
        assert_eq!(cl.services().before_runs, 2);
        assert_eq!(cl.services().after_runs, 2);
    }

    #[test]
    fn test_empty_loop_is_stable() {
        let mut cl = control_loop();
        assert_eq!(cl.converge(), 0);
    }

    #[test]
    #[should_panic(expected = "stabilization limit exceeded")]
    fn test_oscillation_panics() {
        let mut cl = control_loop();
        cl.add_control_function(SetEnv::new("FlipA", "X", "a"));
        cl.add_control_function(SetEnv::new("FlipB", "X", "b"));
        cl.converge();
    }

    #[test]
    fn test_blocking_always_firing_panics_with_name() {
        let mut cl = control_loop();
        cl.add_control_function(AlwaysFires {
            mode: ControlMode::Blocking,
            responses: Arc::new(AtomicUsize::new(0)),
        });
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| cl.converge()));
        let message = result
            .err()
            .and_then(|e| e.downcast_ref::<String>().cloned())
            .unwrap_or_default();
        assert!(message.contains("AlwaysFires"));
    }

    #[tokio::test]
    async fn test_advisory_responds_once_per_run() {
        let responses = Arc::new(AtomicUsize::new(0));
        let mut cl = control_loop();
        cl.add_control_function(SetEnv::new("A", "A", "1"));
        cl.add_control_function(AlwaysFires {
            mode: ControlMode::Advisory,
            responses: responses.clone(),
        });

        let report = cl.run().await;
        assert_eq!(report.attempts, 2);
        assert_eq!(responses.load(Ordering::SeqCst), 1);
        assert_eq!(report.requeue, Some(crate::context::REQUEUE_SOON));

        cl.run().await;
        assert_eq!(responses.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_attempt_is_recorded() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let mut cl = control_loop();
        cl.add_control_function(SetEnv::new("A", "A", "1"));
        cl.add_control_function(RecordAttempts { seen: seen.clone() });

        assert_eq!(cl.converge(), 2);
        assert_eq!(*seen.lock().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_describe_keeps_registration_order() {
        let mut cl = control_loop();
        cl.add_control_function(SetEnv::new("First", "A", "1"));
        cl.add_control_function(SetEnv::new("Second", "B", "1"));
        assert_eq!(cl.describe(), vec!["First", "Second"]);
    }

    #[tokio::test]
    async fn test_cleanup_retries_until_dependency_is_gone() {
        let mut cl = control_loop();
        cl.context_mut()
            .resources_mut()
            .insert_observed("registry-service", Service::default());
        cl.context_mut()
            .resources_mut()
            .insert_observed("registry-ingress", Ingress::default());

        // Service is registered first but must wait for the Ingress
        cl.add_control_function(Teardown {
            key: ResourceKey::Service,
            waits_for: Some(ResourceKey::Ingress),
        });
        cl.add_control_function(Teardown {
            key: ResourceKey::Ingress,
            waits_for: None,
        });

        assert!(cl.cleanup().await);
        assert!(cl.context().resources().is_empty());
        assert_eq!(
            cl.services().deleted,
            vec![ResourceKey::Ingress, ResourceKey::Service]
        );
        assert_eq!(cl.services().cleanup_passes, 2);
    }

    #[tokio::test]
    async fn test_cleanup_gives_up() {
        let mut cl = control_loop();
        cl.context_mut()
            .resources_mut()
            .insert_observed("registry-ingress", Ingress::default());
        cl.add_control_function(Teardown {
            key: ResourceKey::Service,
            waits_for: Some(ResourceKey::Ingress),
        });

        assert!(!cl.cleanup().await);
        assert_eq!(cl.services().cleanup_passes, 2);
    }
}
