//! ApicurioRegistry Controller
//!
//! Watches ApicurioRegistry resources and drives one [`ControlLoop`] per
//! registry. Loops live as long as their registry: the caches they carry are
//! what lets a run tell operator-owned env entries from user edits.

use crate::capabilities::ClusterCapabilities;
use crate::cf;
use crate::config::OperatorConfig;
use crate::context::{AppRef, LoopContext};
use crate::control_loop::ControlLoop;
use crate::crd::{ApicurioRegistry, ApicurioRegistryStatus};
use crate::error::{OperatorError, Result};
use crate::patcher::KubeServices;
use crate::status::{ConfigurationErrorReason, StatusReporter};
use chrono::Utc;
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Service;
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{self, finalizer, Event as FinalizerEvent};
use kube::runtime::watcher::Config;
use kube::{Client, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, instrument, warn};
use validator::Validate;

/// Finalizer name for cleanup operations
pub const FINALIZER_NAME: &str = "registry.apicur.io/finalizer";

/// Requeue interval for error cases (base for exponential backoff)
const ERROR_REQUEUE_SECONDS: u64 = 30;

/// Maximum requeue delay for error backoff
const MAX_ERROR_REQUEUE_SECONDS: u64 = 600;

type SharedLoop = Arc<Mutex<ControlLoop<KubeServices>>>;

/// Context passed to the controller
pub struct ControllerContext {
    /// Kubernetes client
    pub client: Client,
    /// Settings shared by all registries
    pub config: Arc<OperatorConfig>,
    /// Optional APIs served by the cluster
    pub capabilities: ClusterCapabilities,
    /// Metrics recorder (optional)
    pub metrics: Option<ControllerMetrics>,
    /// Per-registry error retry counts for exponential backoff
    pub error_counts: DashMap<String, u32>,
    /// Control loop of every known registry
    pub loops: DashMap<AppRef, SharedLoop>,
}

impl ControllerContext {
    pub fn new(client: Client, config: OperatorConfig, capabilities: ClusterCapabilities) -> Self {
        Self {
            client,
            config: Arc::new(config),
            capabilities,
            metrics: Some(ControllerMetrics::new()),
            error_counts: DashMap::new(),
            loops: DashMap::new(),
        }
    }

    /// Control loop of `app`, assembled on first use
    fn control_loop(&self, app: &AppRef) -> SharedLoop {
        self.loops
            .entry(app.clone())
            .or_insert_with(|| {
                let ctx = LoopContext::new(app.clone(), self.config.clone(), self.capabilities);
                let mut control_loop =
                    ControlLoop::new(ctx, KubeServices::new(self.client.clone()));
                cf::register_all(&mut control_loop);
                info!(app = %app, functions = control_loop.describe().len(), "Created control loop");
                Arc::new(Mutex::new(control_loop))
            })
            .clone()
    }
}

/// Metrics for the controller
#[derive(Clone)]
pub struct ControllerMetrics {
    /// Counter for reconciliation attempts
    pub reconciliations: metrics::Counter,
    /// Counter for reconciliation errors
    pub errors: metrics::Counter,
    /// Histogram for reconciliation duration
    pub duration: metrics::Histogram,
    /// Histogram for stabilization attempts per run
    pub attempts: metrics::Histogram,
}

impl ControllerMetrics {
    /// Create new controller metrics
    pub fn new() -> Self {
        Self {
            reconciliations: metrics::counter!("apicurio_operator_reconciliations_total"),
            errors: metrics::counter!("apicurio_operator_reconciliation_errors_total"),
            duration: metrics::histogram!("apicurio_operator_reconciliation_duration_seconds"),
            attempts: metrics::histogram!("apicurio_operator_control_loop_attempts"),
        }
    }
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Start the ApicurioRegistry controller
pub async fn run_controller(
    client: Client,
    namespace: Option<String>,
    config: OperatorConfig,
    capabilities: ClusterCapabilities,
) -> Result<()> {
    let registries: Api<ApicurioRegistry> = match &namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    };

    let ctx = Arc::new(ControllerContext::new(client.clone(), config, capabilities));

    info!(
        namespace = namespace.as_deref().unwrap_or("all"),
        "Starting ApicurioRegistry controller"
    );

    // Watch related resources for changes
    let deployments = match &namespace {
        Some(ns) => Api::<Deployment>::namespaced(client.clone(), ns),
        None => Api::<Deployment>::all(client.clone()),
    };

    let services = match &namespace {
        Some(ns) => Api::<Service>::namespaced(client.clone(), ns),
        None => Api::<Service>::all(client.clone()),
    };

    let mut controller = Controller::new(registries, Config::default())
        .owns(deployments, Config::default())
        .owns(services, Config::default());

    if capabilities.ingress_v1 {
        let ingresses = match &namespace {
            Some(ns) => Api::<Ingress>::namespaced(client.clone(), ns),
            None => Api::<Ingress>::all(client.clone()),
        };
        controller = controller.owns(ingresses, Config::default());
    }

    controller
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, action)) => {
                    debug!(
                        name = obj.name,
                        namespace = obj.namespace,
                        ?action,
                        "Reconciliation completed"
                    );
                }
                Err(e) => {
                    error!(error = %e, "Reconciliation failed");
                }
            }
        })
        .await;

    Ok(())
}

fn app_of(registry: &ApicurioRegistry) -> AppRef {
    AppRef::new(
        registry.namespace().unwrap_or_else(|| "default".to_string()),
        registry.name_any(),
    )
}

/// Main reconciliation function
#[instrument(skip(registry, ctx), fields(name = %registry.name_any(), namespace = registry.namespace()))]
async fn reconcile(registry: Arc<ApicurioRegistry>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let start = std::time::Instant::now();

    if let Some(ref metrics) = ctx.metrics {
        metrics.reconciliations.increment(1);
    }

    let app = app_of(&registry);
    let registries: Api<ApicurioRegistry> = Api::namespaced(ctx.client.clone(), &app.namespace);

    let result = finalizer(&registries, FINALIZER_NAME, registry, |event| async {
        match event {
            FinalizerEvent::Apply(registry) => apply_registry(registry, ctx.clone()).await,
            FinalizerEvent::Cleanup(registry) => cleanup_registry(registry, ctx.clone()).await,
        }
    })
    .await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.duration.record(start.elapsed().as_secs_f64());
    }

    // Reset error backoff counter on success
    if result.is_ok() {
        ctx.error_counts.remove(&app.to_string());
    }

    result.map_err(|e| {
        if let Some(ref metrics) = ctx.metrics {
            metrics.errors.increment(1);
        }
        into_operator_error(e)
    })
}

/// Unwrap the error of the apply or cleanup step so its backoff hints survive
fn into_operator_error(err: finalizer::Error<OperatorError>) -> OperatorError {
    match err {
        finalizer::Error::ApplyFailed(e) | finalizer::Error::CleanupFailed(e) => e,
        finalizer::Error::AddFinalizer(e) | finalizer::Error::RemoveFinalizer(e) => {
            OperatorError::KubeError(e)
        }
        other => OperatorError::ReconcileFailed(other.to_string()),
    }
}

/// Converge the managed resources of one registry
#[instrument(skip(registry, ctx))]
async fn apply_registry(registry: Arc<ApicurioRegistry>, ctx: Arc<ControllerContext>) -> Result<Action> {
    let app = app_of(&registry);

    info!(app = %app, "Reconciling ApicurioRegistry");

    if let Err(errors) = registry.spec.validate() {
        let message = validation_message(&errors);
        warn!(app = %app, errors = %message, "Registry spec validation failed");
        report_invalid_spec(&ctx.client, &registry, invalid_spec_reason(&errors), &message).await?;
        return Err(OperatorError::ValidationError(message));
    }

    let control_loop = ctx.control_loop(&app);
    let mut control_loop = control_loop.lock().await;
    control_loop
        .context_mut()
        .resources_mut()
        .insert_observed(app.name.clone(), (*registry).clone());

    let report = control_loop.run().await;

    if let Some(ref metrics) = ctx.metrics {
        metrics.attempts.record(report.attempts as f64);
    }

    let delay = report.requeue.unwrap_or(ctx.config.resync_interval);
    info!(app = %app, attempts = report.attempts, requeue_secs = delay.as_secs(), "Reconciliation complete");

    Ok(Action::requeue(delay))
}

/// Remove the managed resources when the registry is deleted
#[instrument(skip(registry, ctx))]
async fn cleanup_registry(
    registry: Arc<ApicurioRegistry>,
    ctx: Arc<ControllerContext>,
) -> Result<Action> {
    let app = app_of(&registry);

    info!(app = %app, "Cleaning up ApicurioRegistry resources");

    let control_loop = ctx.control_loop(&app);
    let finished = {
        let mut control_loop = control_loop.lock().await;
        control_loop
            .context_mut()
            .resources_mut()
            .insert_observed(app.name.clone(), (*registry).clone());
        control_loop.cleanup().await
    };

    Ok(finish_cleanup(&ctx.loops, &app, finished))
}

/// Drop the loop of a deleted registry and let the finalizer go.
///
/// Whatever is left after the cleanup budget is garbage collected through the
/// owner references, so an unfinished cleanup must not block the deletion.
fn finish_cleanup<V>(loops: &DashMap<AppRef, V>, app: &AppRef, finished: bool) -> Action {
    if finished {
        info!(app = %app, "Cleanup complete");
    } else {
        warn!(app = %app, "Cleanup did not finish, leaving remaining resources to garbage collection");
    }
    loops.remove(app);
    Action::await_change()
}

fn validation_message(errors: &validator::ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .errors()
        .iter()
        .map(|(field, kind)| format!("{}: {}", field, validation_kind_message(kind)))
        .collect();
    messages.sort();
    messages.join("; ")
}

/// A rejected persistence option gets its own condition reason
fn invalid_spec_reason(errors: &validator::ValidationErrors) -> ConfigurationErrorReason {
    match errors.errors().get("configuration") {
        Some(validator::ValidationErrorsKind::Struct(inner))
            if inner.errors().contains_key("persistence") =>
        {
            ConfigurationErrorReason::InvalidPersistence
        }
        _ => ConfigurationErrorReason::Invalid,
    }
}

fn validation_kind_message(kind: &validator::ValidationErrorsKind) -> String {
    match kind {
        validator::ValidationErrorsKind::Field(errors) => errors
            .iter()
            .map(|e| {
                e.message
                    .as_ref()
                    .map(|m| m.to_string())
                    .unwrap_or_else(|| e.code.to_string())
            })
            .collect::<Vec<_>>()
            .join(", "),
        validator::ValidationErrorsKind::Struct(errors) => validation_message(errors),
        validator::ValidationErrorsKind::List(errors) => errors
            .values()
            .map(|e| validation_message(e))
            .collect::<Vec<_>>()
            .join(", "),
    }
}

/// Status for a spec the control loop refuses to act upon
fn invalid_spec_status(
    registry: &ApicurioRegistry,
    reason: ConfigurationErrorReason,
    message: &str,
) -> ApicurioRegistryStatus {
    let previous = registry.status.as_ref();
    let mut status = StatusReporter::default();
    status.report_configuration_error(reason, message);
    if let Some(previous) = previous {
        status.set_host(previous.info.host.clone());
    }
    let managed = previous
        .map(|p| p.managed_resources.clone())
        .unwrap_or_default();
    status.render(previous, managed, Utc::now())
}

async fn report_invalid_spec(
    client: &Client,
    registry: &ApicurioRegistry,
    reason: ConfigurationErrorReason,
    message: &str,
) -> Result<()> {
    let status = invalid_spec_status(registry, reason, message);
    if registry.status.as_ref() == Some(&status) {
        return Ok(());
    }

    let app = app_of(registry);
    let api: Api<ApicurioRegistry> = Api::namespaced(client.clone(), &app.namespace);
    let patch = serde_json::json!({
        "status": status
    });
    api.patch_status(&app.name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
        .map_err(OperatorError::from)?;

    Ok(())
}

/// Error policy for the controller with exponential backoff
fn error_policy(
    registry: Arc<ApicurioRegistry>,
    error: &OperatorError,
    ctx: Arc<ControllerContext>,
) -> Action {
    let key = app_of(&registry).to_string();
    let retries = {
        let mut entry = ctx.error_counts.entry(key.clone()).or_insert(0);
        *entry += 1;
        *entry
    };

    let delay = backoff(retries, error);

    warn!(
        error = %error,
        retry = retries,
        delay_secs = delay.as_secs(),
        "Reconciliation error for '{}', will retry",
        key
    );

    Action::requeue(delay)
}

/// 30s, 60s, 120s, 240s, 480s, then 600s (capped); errors hinting at a shorter delay keep it
fn backoff(retries: u32, error: &OperatorError) -> Duration {
    let base = Duration::from_secs(ERROR_REQUEUE_SECONDS);
    let exponential = (base * 2u32.saturating_pow(retries.saturating_sub(1).min(5)))
        .min(Duration::from_secs(MAX_ERROR_REQUEUE_SECONDS));
    match error.requeue_delay() {
        Some(hint) if hint < base => hint,
        _ => exponential,
    }
}
