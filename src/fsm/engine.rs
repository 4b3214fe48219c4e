//! The FSM execution engine.
//!
//! Walks the operation plan leaf by leaf in dependency order, dispatching
//! each leaf to the node it is pinned to through the agent runner (or to a
//! local executor on the coordinator), persisting every state transition as
//! a changelog row and re-reconciling after each write. Completion commits
//! the new application pointer and activates the cluster.

use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::{AgentRunner, PhaseCommand, WaitConfig, plan_command, wait_for_agents};
use crate::catalog::Applications;
use crate::cluster::Server;
use crate::error::GupError;
use crate::fsm::reconciler::Reconciler;
use crate::plan::phase::{OperationPhase, OperationPlan, PhaseData, PhaseState, PlanChange};
use crate::storage::{Backend, OperationState, SiteState};

/// Inputs the executor spec receives for one leaf phase.
pub struct PhaseParams {
    pub phase: OperationPhase,
    pub operation_id: Uuid,
    pub force: bool,
}

/// A resolved leaf phase executor. The engine is agnostic to what each
/// executor does.
#[async_trait::async_trait]
pub trait PhaseExecutor: Send + Sync {
    async fn execute(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}

/// Spec function resolving an executor from a phase's executor tag. The
/// plug-point used by tests.
pub type ExecutorSpec = Arc<dyn Fn(&PhaseParams) -> Result<Box<dyn PhaseExecutor>> + Send + Sync>;

/// Engine wiring.
pub struct EngineConfig {
    pub cluster_name: String,
    pub account_id: String,
    pub operation_id: Uuid,
    /// The server this engine runs on. Leaves pinned to other servers are
    /// dispatched over the agent runner.
    pub server: Server,
    pub force: bool,
    pub local_backend: Arc<dyn Backend>,
    pub cluster_backend: Arc<dyn Backend>,
    pub apps: Arc<dyn Applications>,
    pub runner: Arc<dyn AgentRunner>,
    pub spec: ExecutorSpec,
}

/// The finite-state machine executor.
pub struct FsmEngine {
    config: EngineConfig,
    reconciler: Reconciler,
    /// Freshly reconciled snapshot. Only `change_phase_state` replaces it;
    /// the lock serializes writers.
    plan: tokio::sync::Mutex<OperationPlan>,
}

impl FsmEngine {
    /// Construct the engine with a freshly reconciled plan snapshot.
    pub async fn new(config: EngineConfig) -> Result<Self> {
        let reconciler = Reconciler::new(
            config.local_backend.clone(),
            config.cluster_backend.clone(),
            config.cluster_name.clone(),
            config.operation_id,
        );
        let plan = reconciler.reconcile().await?;
        Ok(Self {
            config,
            reconciler,
            plan: tokio::sync::Mutex::new(plan),
        })
    }

    /// The current reconciled plan snapshot.
    pub async fn get_plan(&self) -> OperationPlan {
        self.plan.lock().await.clone()
    }

    /// Persist a phase state transition and refresh the snapshot. A failed
    /// refresh is non-critical: the change is applied to the last known
    /// plan and execution proceeds.
    pub async fn change_phase_state(&self, change: PlanChange) -> Result<()> {
        let mut plan = self.plan.lock().await;
        self.config
            .local_backend
            .create_operation_plan_change(&change)
            .await
            .context("failed to persist phase state change")?;
        match self.reconciler.reconcile().await {
            Ok(fresh) => *plan = fresh,
            Err(err) => {
                warn!("Failed to reconcile plan, proceeding with last known: {err:#}");
                plan.set_phase_state(&change.phase_id, change.new_state, change.created);
            }
        }
        Ok(())
    }

    /// Ship a phase subcommand to the given server through the agent runner.
    pub async fn run_command(
        &self,
        server: &Server,
        command: PhaseCommand,
        phase_id: &str,
    ) -> Result<()> {
        let args = plan_command(command, phase_id, self.config.operation_id, self.config.force);
        self.config
            .runner
            .exec(server, &args)
            .await
            .map_err(|err| GupError::rpc(&server.advertise_ip, format!("{err:#}")).into())
    }

    /// Execute the plan leaf by leaf. Already-completed leaves are skipped,
    /// so a resumed operation continues where it stopped. Returns the first
    /// leaf failure.
    pub async fn run(&self) -> Result<()> {
        let leaf_ids: Vec<String> = {
            let plan = self.get_plan().await;
            plan.leaves().iter().map(|p| p.id.clone()).collect()
        };
        for leaf_id in leaf_ids {
            let plan = self.get_plan().await;
            let leaf = plan
                .find(&leaf_id)
                .ok_or_else(|| GupError::Invalid(format!("no phase {leaf_id} in plan")))?
                .clone();
            if leaf.state == PhaseState::Completed {
                continue;
            }
            ready_check(&plan, &leaf.id)?;
            self.execute_phase(&plan, &leaf).await?;
        }
        info!("All phases of operation {} completed", self.config.operation_id);
        Ok(())
    }

    async fn execute_phase(&self, plan: &OperationPlan, leaf: &OperationPhase) -> Result<()> {
        self.change_phase_state(PlanChange::new(plan, &leaf.id, PhaseState::InProgress))
            .await?;
        match self.dispatch(leaf, PhaseCommand::Execute).await {
            Ok(()) => {
                self.change_phase_state(PlanChange::new(plan, &leaf.id, PhaseState::Completed))
                    .await?;
                Ok(())
            }
            Err(err) => {
                error!("Phase {} failed: {err:#}", leaf.id);
                self.change_phase_state(
                    PlanChange::new(plan, &leaf.id, PhaseState::Failed)
                        .with_error(format!("{err:#}")),
                )
                .await?;
                Err(err.context(format!("phase {} failed", leaf.id)))
            }
        }
    }

    async fn dispatch(&self, leaf: &OperationPhase, command: PhaseCommand) -> Result<()> {
        let target = leaf.data.as_ref().and_then(PhaseData::exec_server);
        match target {
            Some(server) if server.advertise_ip != self.config.server.advertise_ip => {
                info!("Dispatching {} to node {}", leaf.id, server.hostname);
                self.run_command(server, command, &leaf.id).await
            }
            _ => {
                let executor = (self.config.spec)(&PhaseParams {
                    phase: leaf.clone(),
                    operation_id: self.config.operation_id,
                    force: self.config.force,
                })?;
                match command {
                    PhaseCommand::Execute => executor.execute().await,
                    PhaseCommand::Rollback => executor.rollback().await,
                }
            }
        }
    }

    /// Roll back executed leaves in reverse order. Untouched leaves are
    /// skipped; the first rollback failure aborts.
    pub async fn rollback(&self) -> Result<()> {
        let leaf_ids: Vec<String> = {
            let plan = self.get_plan().await;
            plan.leaves().iter().rev().map(|p| p.id.clone()).collect()
        };
        for leaf_id in leaf_ids {
            let plan = self.get_plan().await;
            let leaf = plan
                .find(&leaf_id)
                .ok_or_else(|| GupError::Invalid(format!("no phase {leaf_id} in plan")))?
                .clone();
            if matches!(leaf.state, PhaseState::Unstarted | PhaseState::RolledBack) {
                continue;
            }
            info!("Rolling back {}", leaf.id);
            match self.dispatch(&leaf, PhaseCommand::Rollback).await {
                Ok(()) => {
                    self.change_phase_state(PlanChange::new(
                        &plan,
                        &leaf.id,
                        PhaseState::RolledBack,
                    ))
                    .await?;
                }
                Err(err) => {
                    error!("Rollback of {} failed: {err:#}", leaf.id);
                    self.change_phase_state(
                        PlanChange::new(&plan, &leaf.id, PhaseState::Failed)
                            .with_error(format!("{err:#}")),
                    )
                    .await?;
                    return Err(err.context(format!("rollback of {} failed", leaf.id)));
                }
            }
        }
        Ok(())
    }

    /// Finalize the operation from the final plan state: `completed` iff
    /// every leaf completed, `rolled_back` iff every leaf rolled back or was
    /// never started. Completion commits the new app pointer, overrides the
    /// docker config from the new manifest and activates the cluster in both
    /// stores; a failure records the reason and leaves the cluster alone.
    pub async fn complete(&self, fsm_err: Option<&anyhow::Error>) -> Result<()> {
        let plan = match self.reconciler.reconcile().await {
            Ok(plan) => plan,
            Err(err) => {
                warn!("Failed to reconcile before completion: {err:#}");
                self.get_plan().await
            }
        };
        let mut operation = self
            .config
            .cluster_backend
            .get_last_operation(&self.config.cluster_name)
            .await?;

        if plan.is_completed() {
            operation.state = OperationState::Completed;
            operation.failure = None;
            self.commit_app_pointer(&operation).await?;
            info!("Operation {} completed, cluster activated", operation.id);
        } else if plan.is_rolled_back() {
            operation.state = OperationState::RolledBack;
            self.activate_site(None).await?;
            info!("Operation {} rolled back, cluster activated", operation.id);
        } else {
            operation.state = OperationState::Failed;
            operation.failure = Some(
                fsm_err.map_or_else(|| "operation failed".to_string(), |err| format!("{err:#}")),
            );
            warn!(
                "Operation {} failed: {}",
                operation.id,
                operation.failure.as_deref().unwrap_or_default()
            );
        }

        self.config.cluster_backend.update_operation(&operation).await?;
        if let Err(err) = self.config.local_backend.update_operation(&operation).await {
            warn!("Failed to update operation in the local store: {err:#}");
        }
        Ok(())
    }

    /// Store the new app (and its resolved base runtime) on the cluster
    /// record, override the docker config from the new manifest and mark
    /// the cluster active.
    async fn commit_app_pointer(&self, operation: &crate::storage::Operation) -> Result<()> {
        let update_package = operation
            .update
            .as_ref()
            .map(|u| u.update_package.clone())
            .ok_or_else(|| {
                GupError::BadParameter(format!("operation {} has no update package", operation.id))
            })?;
        let app = self.config.apps.get_app(&update_package).await?;
        let base = match &app.manifest.base {
            Some(base) => Some(self.config.apps.get_app(base).await?.package),
            None => None,
        };
        self.activate_site(Some((app, base))).await
    }

    async fn activate_site(
        &self,
        new_app: Option<(crate::app::Application, Option<crate::loc::Locator>)>,
    ) -> Result<()> {
        let mut site = self
            .config
            .cluster_backend
            .get_local_site(&self.config.account_id)
            .await?;
        if let Some((app, base)) = new_app {
            site.base = base;
            if let Some(docker) = app.manifest.docker() {
                site.docker = docker.clone();
            }
            site.app = app.package;
        }
        site.state = SiteState::Active;
        self.config.cluster_backend.update_site(&site).await?;
        self.config.local_backend.update_site(&site).await?;
        Ok(())
    }
}

/// A leaf is eligible when its own `requires` and every ancestor's
/// `requires` are completed.
fn ready_check(plan: &OperationPlan, leaf_id: &str) -> Result<()> {
    for ancestor_id in ancestor_path(leaf_id) {
        let Some(ancestor) = plan.find(&ancestor_id) else {
            continue;
        };
        for require in &ancestor.requires {
            let required = plan.find(require).ok_or_else(|| {
                GupError::Invalid(format!("phase {ancestor_id} requires unknown phase {require}"))
            })?;
            if !subtree_completed(required) {
                return Err(GupError::BadParameter(format!(
                    "phase {leaf_id} requires {require} which is not completed"
                ))
                .into());
            }
        }
    }
    Ok(())
}

/// All path prefixes of an absolute phase ID, outermost first.
fn ancestor_path(id: &str) -> Vec<String> {
    let mut prefixes = Vec::new();
    let mut current = String::new();
    for segment in id.split('/').filter(|s| !s.is_empty()) {
        current.push('/');
        current.push_str(segment);
        prefixes.push(current.clone());
    }
    prefixes
}

fn subtree_completed(phase: &OperationPhase) -> bool {
    if phase.is_leaf() {
        return phase.state == PhaseState::Completed;
    }
    phase.phases.iter().all(subtree_completed)
}

/// Run the upgrade: wait for every agent to be reachable, construct the
/// engine, walk the plan and finalize the operation. Agents are shut down
/// once the operation completes; a failed operation keeps them around for
/// rollback or resume. Returns the failed phase's error, if any.
pub async fn run_upgrade(config: EngineConfig, wait: WaitConfig) -> Result<()> {
    let engine = FsmEngine::new(config).await?;
    let servers = engine.get_plan().await.servers.clone();
    wait_for_agents(engine.config.runner.as_ref(), &servers, wait).await?;

    let fsm_err = engine.run().await.err();
    engine.complete(fsm_err.as_ref()).await?;
    if fsm_err.is_none() {
        engine
            .config
            .runner
            .shutdown()
            .await
            .context("failed to shut down agents")?;
    }
    match fsm_err {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
