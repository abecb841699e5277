//! # Apicurio Registry Kubernetes Operator
//!
//! Kubernetes operator for deploying and managing Apicurio Registry instances.
//!
//! Each `ApicurioRegistry` resource is driven by its own control loop: an
//! ordered set of small control functions, each owning one aspect of the
//! desired state, run to a fixed point against an in-memory copy of the
//! managed resources. Only after the loop has stabilized are the changes
//! written back to the cluster.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use registry_operator::prelude::*;
//! use kube::Client;
//!
//! #[tokio::main]
//! async fn main() -> Result<()> {
//!     let client = Client::try_default().await?;
//!     let capabilities = ClusterCapabilities::discover(&client).await?;
//!
//!     run_controller(client, None, OperatorConfig::default(), capabilities).await
//! }
//! ```
//!
//! ## Architecture
//!
//! 1. **Reload**: [`patcher::KubeServices`] refreshes the resource cache and
//!    adopts objects created by an earlier operator process
//! 2. **Converge**: [`control_loop::ControlLoop`] runs sense → compare →
//!    respond over all control functions until a pass finds nothing to do
//! 3. **Flush**: staged deletions are executed and changed objects are
//!    created or patched
//! 4. **Status**: the Ready and ConfigurationError conditions are written to
//!    the registry status
//!
//! Environment variables of the registry container are merged from three
//! sources with increasing priority: variables found on the Deployment, the
//! variables in `spec.configuration.env`, and the variables the operator
//! derives from typed spec fields. See [`env_cache`].
//!
//! ## Modules
//!
//! - [`crd`] - Custom Resource Definition types with validation
//! - [`controller`] - Controller setup, finalizer handling and error backoff
//! - [`control_loop`] - The stabilization engine and the control function contract
//! - [`cf`] - Control functions for every managed aspect
//! - [`resource_cache`] / [`kinds`] - Cached copies of the managed objects
//! - [`env_cache`] - Prioritized, dependency ordered environment variables
//! - [`java_options`] - Parsing and merging of the JVM option variables
//! - [`patcher`] - Synchronization of the caches with the API server
//! - [`resources`] - Default manifests of the managed objects
//! - [`error`] - Error types for operator operations
//!
//! ## Custom Resource Definition
//!
//! ```yaml
//! apiVersion: registry.apicur.io/v1
//! kind: ApicurioRegistry
//! metadata:
//!   name: registry
//! spec:
//!   configuration:
//!     persistence: sql
//!     sql:
//!       dataSource:
//!         url: jdbc:postgresql://postgres:5432/registry
//!     security:
//!       tls:
//!         secretName: registry-tls
//!   deployment:
//!     host: registry.example.com
//! ```
//!
//! ## Metrics
//!
//! - `apicurio_operator_reconciliations_total` - Total reconciliation attempts
//! - `apicurio_operator_reconciliation_errors_total` - Reconciliation errors
//! - `apicurio_operator_reconciliation_duration_seconds` - Reconciliation latency
//! - `apicurio_operator_control_loop_attempts` - Stabilization attempts per run

pub mod capabilities;
pub mod cf;
pub mod config;
pub mod context;
pub mod control_loop;
pub mod controller;
pub mod crd;
pub mod env_cache;
pub mod error;
pub mod java_options;
pub mod kinds;
pub mod patcher;
pub mod resource_cache;
pub mod resources;
pub mod status;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::capabilities::ClusterCapabilities;
    pub use crate::config::OperatorConfig;
    pub use crate::context::{AppRef, LoopContext};
    pub use crate::control_loop::{ControlFunction, ControlLoop, ControlMode, LoopServices, RunReport};
    pub use crate::controller::{run_controller, ControllerContext, ControllerMetrics};
    pub use crate::crd::{ApicurioRegistry, ApicurioRegistrySpec, ApicurioRegistryStatus};
    pub use crate::env_cache::{EnvCache, EnvCacheEntry, EnvPriority};
    pub use crate::error::{OperatorError, Result};
    pub use crate::kinds::{Resource, ResourceKey, ResourceKind};
    pub use crate::patcher::KubeServices;
    pub use crate::resources::ResourceFactory;
}
