use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Cluster publishes read-only information about a shoot to the extension
/// controllers running in its seed. It is cluster scoped and named after the
/// shoot's control plane namespace.
#[derive(CustomResource, Clone, Debug, Default, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "Cluster",
    plural = "clusters",
    derive = "Default",
)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    /// Shoot networking
    #[serde(default)]
    pub networking: ClusterNetworking,

    /// Kubernetes version of the shoot
    #[serde(default)]
    pub kubernetes_version: String,
}

/// Shoot networking ranges
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ClusterNetworking {
    /// Pod CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pods: Option<String>,

    /// Service CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub services: Option<String>,

    /// Node CIDR
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nodes: Option<String>,
}

/// Cluster information consumed while building infrastructure inputs
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ClusterContext {
    /// Cluster id, which is the shoot's namespace in the seed
    pub cluster_id: String,
    pub pods_cidr: Option<String>,
    pub services_cidr: Option<String>,
    pub kubernetes_version: String,
}

impl Cluster {
    /// Project the Cluster resource into the context used by actuators
    pub fn context(&self) -> ClusterContext {
        ClusterContext {
            cluster_id: self.name_any(),
            pods_cidr: self.spec.networking.pods.clone(),
            services_cidr: self.spec.networking.services.clone(),
            kubernetes_version: self.spec.kubernetes_version.clone(),
        }
    }
}
