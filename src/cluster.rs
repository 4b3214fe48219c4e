//! Cluster membership types and per-server update descriptors.

use serde::{Deserialize, Serialize};

use crate::loc::Locator;

/// Docker storage driver that requires block-device repurposing on upgrade.
pub const STORAGE_DRIVER_DEVICEMAPPER: &str = "devicemapper";

/// Role a server plays in the cluster.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClusterRole {
    Master,
    Worker,
}

impl std::fmt::Display for ClusterRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Master => write!(f, "master"),
            Self::Worker => write!(f, "worker"),
        }
    }
}

/// A cluster member. The advertise IP is unique across the cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Server {
    pub advertise_ip: String,
    pub hostname: String,
    pub node_profile: String,
    pub cluster_role: ClusterRole,
}

impl Server {
    pub const fn is_master(&self) -> bool {
        matches!(self.cluster_role, ClusterRole::Master)
    }
}

/// Docker configuration relevant to upgrades.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerConfig {
    pub storage_driver: String,
    /// Block device backing the devicemapper driver, when configured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
}

/// User the cluster services run as on each node.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceUser {
    pub uid: u32,
    pub gid: u32,
}

/// Runtime (planet) rotation slot of an update descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeSlot {
    /// Host-image package currently installed on the node.
    pub installed: Locator,
    /// Secrets package produced by the dry-run rotation, when rotated.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secrets_package: Option<Locator>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<RuntimeUpdate>,
}

/// Pending runtime update for one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeUpdate {
    /// New host-image package.
    pub package: Locator,
    /// Rotated runtime configuration package.
    pub config_package: Locator,
}

/// Teleport rotation slot of an update descriptor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeleportSlot {
    pub installed: Locator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<TeleportUpdate>,
}

/// Pending teleport update for one node.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeleportUpdate {
    pub package: Locator,
    /// Per-node configuration package, when the rotation produced one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_config_package: Option<Locator>,
}

/// Docker rotation slot: installed vs target configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DockerSlot {
    pub installed: DockerConfig,
    pub update: DockerConfig,
}

impl DockerSlot {
    /// The devicemapper block device must be repurposed when the node moves
    /// off the devicemapper driver.
    pub fn needs_device_repurpose(&self) -> bool {
        self.installed.storage_driver == STORAGE_DRIVER_DEVICEMAPPER
            && self.update.storage_driver != STORAGE_DRIVER_DEVICEMAPPER
    }
}

/// Per-node plan descriptor computed by the config-update computer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServer {
    pub server: Server,
    pub runtime: RuntimeSlot,
    pub teleport: TeleportSlot,
    pub docker: DockerSlot,
}

impl UpdateServer {
    /// Returns true if any rotation slot carries a pending update.
    pub fn needs_update(&self) -> bool {
        self.runtime.update.is_some() || self.teleport.update.is_some()
    }
}

/// Move the server with the given advertise IP to the front, preserving the
/// relative order of all other servers. A stable partition, not a sort.
pub fn leader_first(servers: &[Server], leader_ip: &str) -> Vec<Server> {
    let (mut leader, rest): (Vec<Server>, Vec<Server>) = servers
        .iter()
        .cloned()
        .partition(|s| s.advertise_ip == leader_ip);
    leader.extend(rest);
    leader
}

/// Masters of the cluster with the leader first, then workers in input order.
pub fn masters_and_workers(servers: &[Server], leader_ip: &str) -> (Vec<Server>, Vec<Server>) {
    let masters: Vec<Server> = servers.iter().filter(|s| s.is_master()).cloned().collect();
    let workers = servers.iter().filter(|s| !s.is_master()).cloned().collect();
    (leader_first(&masters, leader_ip), workers)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// A server fixture with the conventional 172.28.128.0/24 test addresses.
    pub fn server(n: usize, role: ClusterRole) -> Server {
        Server {
            advertise_ip: format!("172.28.128.{n}"),
            hostname: format!("node-{n}"),
            node_profile: "node".to_string(),
            cluster_role: role,
        }
    }
}
