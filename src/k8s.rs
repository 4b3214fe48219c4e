//! Kubernetes cluster view.
//!
//! The planner needs two things from the cluster API: resolving a cluster
//! member to its Kubernetes node by the advertise-ip label, and probing
//! whether the CoreDNS resources are already provisioned.

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Node};
use k8s_openapi::api::rbac::v1::{ClusterRole, ClusterRoleBinding};
use kube::Api;
use kube::api::ListParams;
use tracing::debug;

use crate::error::GupError;

/// Node label carrying a cluster member's advertise IP.
pub const ADVERTISE_IP_LABEL: &str = "gravitational.io/advertise-ip";

const COREDNS: &str = "coredns";
const KUBE_SYSTEM: &str = "kube-system";

/// What the planner observes about the live cluster.
#[async_trait]
pub trait ClusterView: Send + Sync {
    /// Resolve a Kubernetes node name by advertise IP. A missing node is a
    /// hard error: the plan cannot address a node the cluster does not know.
    async fn node_name_by_ip(&self, advertise_ip: &str) -> Result<String>;

    /// Returns true when the CoreDNS ClusterRole, ClusterRoleBinding and
    /// ConfigMap are all present.
    async fn coredns_configured(&self) -> Result<bool>;
}

/// [`ClusterView`] backed by the Kubernetes API.
pub struct KubeClusterView {
    client: kube::Client,
}

impl KubeClusterView {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterView for KubeClusterView {
    async fn node_name_by_ip(&self, advertise_ip: &str) -> Result<String> {
        let nodes: Api<Node> = Api::all(self.client.clone());
        let selector = format!("{ADVERTISE_IP_LABEL}={advertise_ip}");
        let list = nodes
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| GupError::KubernetesApi(format!("failed to list nodes: {e}")))?;

        list.items
            .first()
            .and_then(|node| node.metadata.name.clone())
            .ok_or_else(|| {
                GupError::NotFound(format!(
                    "Kubernetes node with label {selector} not found; make sure the node \
                     is registered and labelled with its advertise IP"
                ))
                .into()
            })
    }

    async fn coredns_configured(&self) -> Result<bool> {
        let roles: Api<ClusterRole> = Api::all(self.client.clone());
        let bindings: Api<ClusterRoleBinding> = Api::all(self.client.clone());
        let config_maps: Api<ConfigMap> = Api::namespaced(self.client.clone(), KUBE_SYSTEM);

        let role = roles
            .get_opt(COREDNS)
            .await
            .map_err(|e| GupError::KubernetesApi(format!("failed to get ClusterRole: {e}")))?;
        let binding = bindings.get_opt(COREDNS).await.map_err(|e| {
            GupError::KubernetesApi(format!("failed to get ClusterRoleBinding: {e}"))
        })?;
        let config_map = config_maps
            .get_opt(COREDNS)
            .await
            .map_err(|e| GupError::KubernetesApi(format!("failed to get ConfigMap: {e}")))?;

        let configured = role.is_some() && binding.is_some() && config_map.is_some();
        debug!(
            "CoreDNS resources: role={}, binding={}, configmap={}",
            role.is_some(),
            binding.is_some(),
            config_map.is_some(),
        );
        Ok(configured)
    }
}
