//! Cluster state backends.
//!
//! Two backends serve as durable truth: the local store on the coordinator
//! (authoritative for phase state) and the cluster-wide store (a best-effort
//! mirror for observers, authoritative for plan creation). Both speak the
//! same interface.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::{DockerConfig, ServiceUser};
use crate::loc::Locator;
use crate::plan::phase::{OperationPlan, PlanChange};

/// Kind of a cluster operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Install,
    Upgrade,
}

/// State of a cluster operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationState {
    Created,
    InProgress,
    Completed,
    Failed,
    RolledBack,
}

/// Update payload of an upgrade operation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationUpdate {
    /// The cluster app package this operation upgrades to.
    pub update_package: Locator,
}

/// A cluster operation record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Operation {
    pub id: Uuid,
    pub kind: OperationKind,
    pub cluster_name: String,
    pub state: OperationState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update: Option<OperationUpdate>,
    /// Failure reason, recorded when the operation fails.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

/// State of the cluster record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SiteState {
    Active,
    Updating,
    Failed,
}

/// The cluster record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SiteRecord {
    pub account_id: String,
    pub domain: String,
    pub state: SiteState,
    /// Installed cluster app; mutated once, on successful completion.
    pub app: Locator,
    /// Runtime app the installed cluster app is based on.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Locator>,
    pub docker: DockerConfig,
    pub service_user: ServiceUser,
}

/// A legacy remote hub link.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OpsCenterLink {
    pub hostname: String,
}

/// A configured trusted cluster.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrustedCluster {
    pub name: String,
    pub enabled: bool,
}

/// An access role resource, as much of it as migrations care about.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRecord {
    pub name: String,
    pub version: String,
}

impl RoleRecord {
    /// Roles below schema v3 must be migrated.
    pub fn is_legacy(&self) -> bool {
        matches!(self.version.as_str(), "v1" | "v2")
    }
}

/// Durable cluster state store.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn get_operation_plan(
        &self,
        cluster_name: &str,
        operation_id: Uuid,
    ) -> Result<OperationPlan>;

    /// Persist a new plan; `AlreadyExists` when one was created before.
    async fn create_operation_plan(&self, plan: &OperationPlan) -> Result<()>;

    /// Append a phase state transition. Rows carry unique IDs; appending an
    /// already-mirrored row is a no-op.
    async fn create_operation_plan_change(&self, change: &PlanChange) -> Result<()>;

    /// The append-only changelog of an operation, in insertion order.
    async fn get_operation_plan_changelog(
        &self,
        cluster_name: &str,
        operation_id: Uuid,
    ) -> Result<Vec<PlanChange>>;

    async fn get_last_operation(&self, cluster_name: &str) -> Result<Operation>;

    async fn update_operation(&self, operation: &Operation) -> Result<()>;

    async fn get_local_site(&self, account_id: &str) -> Result<SiteRecord>;

    async fn update_site(&self, site: &SiteRecord) -> Result<()>;

    async fn get_ops_center_links(&self, cluster_name: &str) -> Result<Vec<OpsCenterLink>>;

    async fn get_trusted_clusters(&self) -> Result<Vec<TrustedCluster>>;

    async fn get_roles(&self) -> Result<Vec<RoleRecord>>;
}
