//! Cluster capabilities
//!
//! Discovered once at startup and handed to every control loop, so the set of
//! assembled control functions can be tested against any cluster shape.

use crate::error::Result;
use kube::discovery::Discovery;
use kube::Client;
use tracing::info;

/// API features of the cluster the operator runs in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ClusterCapabilities {
    /// `route.openshift.io` is served
    pub openshift: bool,
    /// `policy/v1` PodDisruptionBudgets are served
    pub pod_disruption_budget_v1: bool,
    /// `networking.k8s.io/v1` NetworkPolicies are served
    pub network_policy_v1: bool,
    /// `networking.k8s.io/v1` Ingresses are served
    pub ingress_v1: bool,
}

impl ClusterCapabilities {
    /// Every optional feature available
    pub fn all() -> Self {
        Self {
            openshift: true,
            pod_disruption_budget_v1: true,
            network_policy_v1: true,
            ingress_v1: true,
        }
    }

    /// Probe the API server
    pub async fn discover(client: &Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone()).run().await?;

        let serves = |group: &str, version: &str, kind: &str| {
            discovery.get(group).is_some_and(|g| {
                g.versioned_resources(version)
                    .iter()
                    .any(|(resource, _)| resource.kind == kind)
            })
        };

        let capabilities = Self {
            openshift: discovery.has_group("route.openshift.io"),
            pod_disruption_budget_v1: serves("policy", "v1", "PodDisruptionBudget"),
            network_policy_v1: serves("networking.k8s.io", "v1", "NetworkPolicy"),
            ingress_v1: serves("networking.k8s.io", "v1", "Ingress"),
        };

        info!(
            openshift = capabilities.openshift,
            pdb_v1 = capabilities.pod_disruption_budget_v1,
            network_policy_v1 = capabilities.network_policy_v1,
            ingress_v1 = capabilities.ingress_v1,
            "Discovered cluster capabilities"
        );

        Ok(capabilities)
    }
}
