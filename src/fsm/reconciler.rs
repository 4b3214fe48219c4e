//! Plan state reconciliation.
//!
//! Phase state is derived, never stored on the plan itself: the append-only
//! changelog in the local store is folded over the persisted plan on every
//! transition. The cluster store keeps a best-effort mirror of the
//! changelog so observers without access to the coordinator see progress.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::Result;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::error::is_not_found;
use crate::plan::phase::{OperationPlan, PlanChange};
use crate::storage::Backend;

/// Fold a changelog into per-phase states on the plan.
///
/// Conflict rule: the most recent change by timestamp wins per phase; on a
/// timestamp tie, terminal states beat `in_progress` beat `unstarted`.
pub fn apply_changelog(plan: &mut OperationPlan, changelog: &[PlanChange]) {
    let mut latest: Vec<&PlanChange> = Vec::new();
    for change in changelog {
        match latest.iter_mut().find(|c| c.phase_id == change.phase_id) {
            Some(current) => {
                if wins(change, current) {
                    *current = change;
                }
            }
            None => latest.push(change),
        }
    }
    for change in latest {
        if !plan.set_phase_state(&change.phase_id, change.new_state, change.created) {
            warn!("Changelog references unknown phase {}", change.phase_id);
        }
    }
}

fn wins(candidate: &PlanChange, current: &PlanChange) -> bool {
    candidate.created > current.created
        || (candidate.created == current.created
            && candidate.new_state.rank() > current.new_state.rank())
}

/// Produces fresh plan snapshots from the persisted plan and the local
/// changelog.
pub struct Reconciler {
    local: Arc<dyn Backend>,
    cluster: Arc<dyn Backend>,
    cluster_name: String,
    operation_id: Uuid,
}

impl Reconciler {
    pub fn new(
        local: Arc<dyn Backend>,
        cluster: Arc<dyn Backend>,
        cluster_name: String,
        operation_id: Uuid,
    ) -> Self {
        Self {
            local,
            cluster,
            cluster_name,
            operation_id,
        }
    }

    /// Load the plan, fold the local changelog over it and mirror unseen
    /// changes to the cluster store. Mirroring failures are logged, never
    /// fatal.
    pub async fn reconcile(&self) -> Result<OperationPlan> {
        let mut plan = match self
            .local
            .get_operation_plan(&self.cluster_name, self.operation_id)
            .await
        {
            Ok(plan) => plan,
            Err(err) if is_not_found(&err) => {
                debug!("Plan not in the local store yet, falling back to the cluster store");
                self.cluster
                    .get_operation_plan(&self.cluster_name, self.operation_id)
                    .await?
            }
            Err(err) => return Err(err),
        };

        let changelog = self
            .local
            .get_operation_plan_changelog(&self.cluster_name, self.operation_id)
            .await?;
        apply_changelog(&mut plan, &changelog);

        self.mirror(&changelog).await;
        Ok(plan)
    }

    async fn mirror(&self, changelog: &[PlanChange]) {
        let known: HashSet<Uuid> = match self
            .cluster
            .get_operation_plan_changelog(&self.cluster_name, self.operation_id)
            .await
        {
            Ok(remote) => remote.iter().map(|c| c.id).collect(),
            Err(err) => {
                warn!("Failed to read the cluster changelog: {err:#}");
                return;
            }
        };
        for change in changelog.iter().filter(|c| !known.contains(&c.id)) {
            if let Err(err) = self.cluster.create_operation_plan_change(change).await {
                warn!("Failed to mirror change for {}: {err:#}", change.phase_id);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::{Duration, Utc};

    use super::*;
    use crate::cluster::ClusterRole;
    use crate::cluster::fixtures::server;
    use crate::dns::DnsConfig;
    use crate::loc::Locator;
    use crate::plan::phase::{Executor, OperationPhase, PhaseState};
    use crate::storage::memory::MemoryBackend;

    fn leaf(id: &str) -> OperationPhase {
        OperationPhase {
            id: id.to_string(),
            description: format!("Phase {id}"),
            executor: Some(Executor::SystemUpgrade),
            data: None,
            requires: vec![],
            limit_parallel: None,
            state: PhaseState::Unstarted,
            updated: None,
            phases: vec![],
        }
    }

    fn plan() -> OperationPlan {
        OperationPlan {
            operation_id: Uuid::new_v4(),
            cluster_name: "example.com".to_string(),
            phases: vec![leaf("/init"), leaf("/checks")],
            servers: vec![server(1, ClusterRole::Master)],
            dns_config: DnsConfig::default(),
            gravity_package: Locator::local("gravity", "2.0.0").unwrap(),
            offline_coordinator: server(1, ClusterRole::Master),
        }
    }

    fn change(
        plan: &OperationPlan,
        phase_id: &str,
        state: PhaseState,
        offset_secs: i64,
    ) -> PlanChange {
        PlanChange {
            id: Uuid::new_v4(),
            cluster_name: plan.cluster_name.clone(),
            operation_id: plan.operation_id,
            phase_id: phase_id.to_string(),
            new_state: state,
            created: Utc::now() + Duration::seconds(offset_secs),
            error: None,
        }
    }

    #[test]
    fn test_apply_changelog_latest_wins() {
        let mut plan = plan();
        let changelog = vec![
            change(&plan, "/init", PhaseState::InProgress, 0),
            change(&plan, "/init", PhaseState::Completed, 10),
        ];
        apply_changelog(&mut plan, &changelog);
        assert_eq!(plan.find("/init").unwrap().state, PhaseState::Completed);
    }

    #[test]
    fn test_apply_changelog_order_independent() {
        let mut plan_a = plan();
        let mut changelog = vec![
            change(&plan_a, "/init", PhaseState::Completed, 10),
            change(&plan_a, "/init", PhaseState::InProgress, 0),
        ];
        apply_changelog(&mut plan_a, &changelog);
        assert_eq!(plan_a.find("/init").unwrap().state, PhaseState::Completed);

        changelog.reverse();
        let mut plan_b = plan();
        plan_b.operation_id = plan_a.operation_id;
        apply_changelog(&mut plan_b, &changelog);
        assert_eq!(plan_b.find("/init").unwrap().state, PhaseState::Completed);
    }

    #[test]
    fn test_apply_changelog_tie_breaks_on_rank() {
        let mut plan = plan();
        let now = Utc::now();
        let mut completed = change(&plan, "/init", PhaseState::Completed, 0);
        let mut in_progress = change(&plan, "/init", PhaseState::InProgress, 0);
        completed.created = now;
        in_progress.created = now;

        apply_changelog(&mut plan, &[in_progress, completed]);
        assert_eq!(plan.find("/init").unwrap().state, PhaseState::Completed);
    }

    #[test]
    fn test_apply_changelog_unknown_phase_is_ignored() {
        let mut plan = plan();
        let changelog = vec![change(&plan, "/ghost", PhaseState::Completed, 0)];
        apply_changelog(&mut plan, &changelog);
        assert_eq!(plan.find("/init").unwrap().state, PhaseState::Unstarted);
    }

    #[tokio::test]
    async fn test_reconcile_folds_local_changelog() {
        let local = Arc::new(MemoryBackend::new());
        let cluster = Arc::new(MemoryBackend::new());
        let plan = plan();
        local.create_operation_plan(&plan).await.unwrap();
        local
            .create_operation_plan_change(&change(&plan, "/init", PhaseState::Completed, 0))
            .await
            .unwrap();

        let reconciler = Reconciler::new(
            local,
            cluster,
            plan.cluster_name.clone(),
            plan.operation_id,
        );
        let reconciled = reconciler.reconcile().await.unwrap();
        assert_eq!(reconciled.find("/init").unwrap().state, PhaseState::Completed);
        assert_eq!(reconciled.find("/checks").unwrap().state, PhaseState::Unstarted);
    }

    #[tokio::test]
    async fn test_reconcile_mirrors_to_cluster_store() {
        let local = Arc::new(MemoryBackend::new());
        let cluster = Arc::new(MemoryBackend::new());
        let plan = plan();
        local.create_operation_plan(&plan).await.unwrap();
        let row = change(&plan, "/init", PhaseState::InProgress, 0);
        local.create_operation_plan_change(&row).await.unwrap();

        let reconciler = Reconciler::new(
            local,
            cluster.clone(),
            plan.cluster_name.clone(),
            plan.operation_id,
        );
        reconciler.reconcile().await.unwrap();
        // Mirrored once; a second reconcile does not duplicate it.
        reconciler.reconcile().await.unwrap();

        let mirrored = cluster
            .get_operation_plan_changelog(&plan.cluster_name, plan.operation_id)
            .await
            .unwrap();
        assert_eq!(mirrored.len(), 1);
        assert_eq!(mirrored[0].id, row.id);
    }

    #[tokio::test]
    async fn test_reconcile_falls_back_to_cluster_plan() {
        let local = Arc::new(MemoryBackend::new());
        let cluster = Arc::new(MemoryBackend::new());
        let plan = plan();
        cluster.create_operation_plan(&plan).await.unwrap();

        let reconciler = Reconciler::new(
            local,
            cluster,
            plan.cluster_name.clone(),
            plan.operation_id,
        );
        let reconciled = reconciler.reconcile().await.unwrap();
        assert_eq!(reconciled.operation_id, plan.operation_id);
    }
}
