//! Operation plan and phase types.
//!
//! A plan is an ordered tree of phases. Leaves carry an executor tag and are
//! dispatched to agents; interior phases only compose. Phase IDs are
//! absolute slash paths once the plan is resolved, and `requires` entries
//! reference other phases by absolute ID.

use chrono::{DateTime, Utc};
use semver::Version;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::cluster::{Server, UpdateServer};
use crate::dns::DnsConfig;
use crate::loc::Locator;

/// Execution state of a phase.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseState {
    #[default]
    Unstarted,
    InProgress,
    Completed,
    RolledBack,
    Failed,
}

impl PhaseState {
    /// Terminal states win over `in_progress` which wins over `unstarted`
    /// when reconciling changes with identical timestamps.
    pub const fn rank(self) -> u8 {
        match self {
            Self::Unstarted => 0,
            Self::InProgress => 1,
            Self::Completed | Self::RolledBack | Self::Failed => 2,
        }
    }
}

impl std::fmt::Display for PhaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unstarted => write!(f, "unstarted"),
            Self::InProgress => write!(f, "in_progress"),
            Self::Completed => write!(f, "completed"),
            Self::RolledBack => write!(f, "rolled_back"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Executor tag of a leaf phase. The engine resolves the tag to an executor
/// through the spec function injected at construction.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Executor {
    InitLeader,
    Init,
    Checks,
    PreUpdate,
    BootstrapLeader,
    Bootstrap,
    Coredns,
    KubeletPermissions,
    Elections,
    Drain,
    SystemUpgrade,
    DockerDevicemapper,
    DockerFormat,
    DockerMount,
    DockerPlanet,
    Taint,
    Uncordon,
    Endpoints,
    Untaint,
    EtcdBackup,
    EtcdShutdown,
    EtcdUpgrade,
    EtcdMigrate,
    EtcdRestore,
    EtcdRestart,
    EtcdRestartGravity,
    Config,
    RuntimeApp,
    MigrateLinks,
    UpdateLabels,
    MigrateRoles,
    App,
    Cleanup,
}

/// Payload of the `init` and `bootstrap` family of phases.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateData {
    pub servers: Vec<UpdateServer>,
    /// Tag for `system-upgrade` payloads so agents can idempotently detect
    /// already-applied changesets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub changeset_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gravity_package: Option<Locator>,
    /// Runtime app version of an intermediate step, so agents select the
    /// matching staged control binary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_app_version: Option<Version>,
}

/// Leader election change applied by an `elections` phase.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ElectionChange {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub enable: Vec<Server>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub disable: Vec<Server>,
}

/// Typed phase payload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum PhaseData {
    /// The server a phase concerns, with an optional distinct server the
    /// phase executes on (e.g. drain runs on the leader against a node).
    #[serde(rename_all = "camelCase")]
    Server {
        server: Server,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        exec_server: Option<Server>,
    },
    Update(UpdateData),
    Package(Locator),
    Elections(ElectionChange),
    Etcd { installed: String, update: String },
}

impl PhaseData {
    /// Advertise IPs of every server this payload references.
    pub fn server_ips(&self) -> Vec<&str> {
        match self {
            Self::Server { server, exec_server } => {
                let mut ips = vec![server.advertise_ip.as_str()];
                if let Some(exec) = exec_server {
                    ips.push(exec.advertise_ip.as_str());
                }
                ips
            }
            Self::Update(update) => update
                .servers
                .iter()
                .map(|s| s.server.advertise_ip.as_str())
                .collect(),
            Self::Elections(change) => change
                .enable
                .iter()
                .chain(change.disable.iter())
                .map(|s| s.advertise_ip.as_str())
                .collect(),
            Self::Package(_) | Self::Etcd { .. } => Vec::new(),
        }
    }

    /// The server the engine dispatches this phase to, when pinned. Update
    /// payloads run on the node of their first descriptor; leader-variant
    /// payloads keep the leader first for exactly this reason.
    pub fn exec_server(&self) -> Option<&Server> {
        match self {
            Self::Server { server, exec_server } => match exec_server {
                Some(exec) => Some(exec),
                None => Some(server),
            },
            Self::Update(update) => update.servers.first().map(|u| &u.server),
            _ => None,
        }
    }
}

/// One phase of an operation plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPhase {
    /// Absolute slash-path ID once the plan is resolved.
    pub id: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<Executor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<PhaseData>,
    /// Absolute IDs of phases that must complete before this one starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,
    /// Fan-out ceiling executors must respect for the children of this phase.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit_parallel: Option<usize>,
    #[serde(default, skip_serializing_if = "is_unstarted")]
    pub state: PhaseState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub phases: Vec<OperationPhase>,
}

#[allow(clippy::trivially_copy_pass_by_ref)]
fn is_unstarted(state: &PhaseState) -> bool {
    *state == PhaseState::Unstarted
}

impl OperationPhase {
    /// An executable leaf: no children and an executor tag. A childless
    /// phase without an executor is an empty composite (e.g. the `app`
    /// phase of a plan with nothing to update) and has nothing to run.
    pub fn is_leaf(&self) -> bool {
        self.phases.is_empty() && self.executor.is_some()
    }

    /// Preorder traversal over this phase and all descendants.
    pub fn walk<'a>(&'a self, visit: &mut dyn FnMut(&'a Self)) {
        visit(self);
        for child in &self.phases {
            child.walk(visit);
        }
    }

    fn walk_mut(&mut self, visit: &mut dyn FnMut(&mut Self)) {
        visit(self);
        for child in &mut self.phases {
            child.walk_mut(visit);
        }
    }
}

/// A complete operation plan.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationPlan {
    pub operation_id: Uuid,
    pub cluster_name: String,
    pub phases: Vec<OperationPhase>,
    pub servers: Vec<Server>,
    pub dns_config: DnsConfig,
    /// Control binary of the target runtime app.
    pub gravity_package: Locator,
    /// Master pinned as the operation coordinator at plan creation time.
    pub offline_coordinator: Server,
}

impl OperationPlan {
    /// All phases in preorder.
    pub fn all_phases(&self) -> Vec<&OperationPhase> {
        let mut all = Vec::new();
        for phase in &self.phases {
            phase.walk(&mut |p| all.push(p));
        }
        all
    }

    /// Executable leaf phases in execution (preorder) order.
    pub fn leaves(&self) -> Vec<&OperationPhase> {
        self.all_phases().into_iter().filter(|p| p.is_leaf()).collect()
    }

    pub fn find(&self, id: &str) -> Option<&OperationPhase> {
        self.all_phases().into_iter().find(|p| p.id == id)
    }

    /// Apply a state to the phase with the given ID. Returns false when the
    /// plan has no such phase.
    pub fn set_phase_state(
        &mut self,
        id: &str,
        state: PhaseState,
        updated: DateTime<Utc>,
    ) -> bool {
        let mut found = false;
        for phase in &mut self.phases {
            phase.walk_mut(&mut |p| {
                if p.id == id {
                    p.state = state;
                    p.updated = Some(updated);
                    found = true;
                }
            });
        }
        found
    }

    /// The plan is completed when every leaf completed.
    pub fn is_completed(&self) -> bool {
        self.leaves().iter().all(|p| p.state == PhaseState::Completed)
    }

    /// The plan is rolled back when every leaf is rolled back or was never
    /// started, with at least one leaf actually rolled back.
    pub fn is_rolled_back(&self) -> bool {
        let leaves = self.leaves();
        leaves.iter().all(|p| {
            matches!(p.state, PhaseState::RolledBack | PhaseState::Unstarted)
        }) && leaves.iter().any(|p| p.state == PhaseState::RolledBack)
    }

    /// Render the plan as an indented tree for operator-facing output, one
    /// phase per line with its state and description.
    pub fn render_text(&self) -> String {
        use std::fmt::Write;

        let mut out = String::new();
        for phase in &self.phases {
            phase.walk(&mut |p| {
                let depth = p.id.matches('/').count().saturating_sub(1);
                let _ = writeln!(
                    out,
                    "{:indent$}{:<12} {}  ({})",
                    "",
                    p.state.to_string(),
                    p.id,
                    p.description,
                    indent = depth * 2,
                );
            });
        }
        out
    }
}

/// Append-only audit row recording one phase state transition.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlanChange {
    pub id: Uuid,
    pub cluster_name: String,
    pub operation_id: Uuid,
    pub phase_id: String,
    pub new_state: PhaseState,
    pub created: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl PlanChange {
    pub fn new(plan: &OperationPlan, phase_id: &str, new_state: PhaseState) -> Self {
        Self {
            id: Uuid::new_v4(),
            cluster_name: plan.cluster_name.clone(),
            operation_id: plan.operation_id,
            phase_id: phase_id.to_string(),
            new_state,
            created: Utc::now(),
            error: None,
        }
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }
}
