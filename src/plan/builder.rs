//! Phase tree builder.
//!
//! A builder node owns its children. `add_sequential` chains a child behind
//! the previous sibling, `add_parallel` leaves siblings unordered and
//! `add_with_dependency` wires an explicit requires edge instead. The
//! finished tree is resolved in one preorder traversal that turns relative
//! IDs into absolute slash paths and rewrites relative `requires` entries
//! against the parent path. Resolution is idempotent: absolute entries are
//! left untouched.

use std::collections::HashSet;

use crate::error::GupError;
use crate::plan::phase::{Executor, OperationPhase, OperationPlan, PhaseData, PhaseState};

/// Builder for one phase and its subtree.
#[derive(Debug)]
pub struct PhaseBuilder {
    phase: OperationPhase,
}

impl PhaseBuilder {
    /// Create a phase with a relative ID (a single path segment).
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            phase: OperationPhase {
                id: id.into(),
                description: description.into(),
                executor: None,
                data: None,
                requires: vec![],
                limit_parallel: None,
                state: PhaseState::Unstarted,
                updated: None,
                phases: vec![],
            },
        }
    }

    pub fn executor(mut self, executor: Executor) -> Self {
        self.phase.executor = Some(executor);
        self
    }

    pub fn data(mut self, data: PhaseData) -> Self {
        self.phase.data = Some(data);
        self
    }

    pub fn limit_parallel(mut self, limit: usize) -> Self {
        self.phase.limit_parallel = Some(limit);
        self
    }

    /// Add a requires edge; relative entries name siblings, absolute entries
    /// any phase in the plan.
    pub fn require(mut self, id: impl Into<String>) -> Self {
        self.phase.requires.push(id.into());
        self
    }

    /// Add a child that executes after the previously added child.
    pub fn add_sequential(&mut self, child: Self) {
        add_sequential(&mut self.phase.phases, child);
    }

    /// Add a child with no ordering against its siblings.
    pub fn add_parallel(&mut self, child: Self) {
        self.phase.phases.push(child.phase);
    }

    /// Add a child ordered only by an explicit requires edge.
    pub fn add_with_dependency(&mut self, dependency: impl Into<String>, child: Self) {
        let mut child = child;
        child.phase.requires.push(dependency.into());
        self.phase.phases.push(child.phase);
    }

    pub fn into_phase(self) -> OperationPhase {
        self.phase
    }
}

/// Builder for the root phase list of a plan.
#[derive(Debug, Default)]
pub struct PlanBuilder {
    phases: Vec<OperationPhase>,
}

impl PlanBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_sequential(&mut self, child: PhaseBuilder) {
        add_sequential(&mut self.phases, child);
    }

    pub fn add_parallel(&mut self, child: PhaseBuilder) {
        self.phases.push(child.into_phase());
    }

    pub fn add_with_dependency(&mut self, dependency: impl Into<String>, child: PhaseBuilder) {
        let mut child = child;
        child.phase.requires.push(dependency.into());
        self.phases.push(child.phase);
    }

    pub fn into_phases(self) -> Vec<OperationPhase> {
        self.phases
    }
}

/// Composition surface shared by the root builder and phase builders, so
/// step subtrees can be emitted at the plan root or under a wrapper phase.
pub trait Compose {
    fn sequential(&mut self, child: PhaseBuilder);
    fn parallel(&mut self, child: PhaseBuilder);
    fn with_dependency(&mut self, dependency: String, child: PhaseBuilder);
}

impl Compose for PlanBuilder {
    fn sequential(&mut self, child: PhaseBuilder) {
        self.add_sequential(child);
    }

    fn parallel(&mut self, child: PhaseBuilder) {
        self.add_parallel(child);
    }

    fn with_dependency(&mut self, dependency: String, child: PhaseBuilder) {
        self.add_with_dependency(dependency, child);
    }
}

impl Compose for PhaseBuilder {
    fn sequential(&mut self, child: PhaseBuilder) {
        self.add_sequential(child);
    }

    fn parallel(&mut self, child: PhaseBuilder) {
        self.add_parallel(child);
    }

    fn with_dependency(&mut self, dependency: String, child: PhaseBuilder) {
        self.add_with_dependency(dependency, child);
    }
}

fn add_sequential(siblings: &mut Vec<OperationPhase>, child: PhaseBuilder) {
    let mut phase = child.phase;
    if let Some(previous) = siblings.last() {
        phase.requires.push(previous.id.clone());
    }
    siblings.push(phase);
}

/// Assign absolute slash-path IDs and rewrite relative `requires` entries.
/// Safe to call more than once: absolute IDs are stable.
pub fn resolve_plan(plan: &mut OperationPlan) {
    for phase in &mut plan.phases {
        resolve_phase(phase, "");
    }
}

fn resolve_phase(phase: &mut OperationPhase, parent: &str) {
    if !phase.id.starts_with('/') {
        phase.id = format!("{parent}/{}", phase.id);
    }
    for require in &mut phase.requires {
        if !require.starts_with('/') {
            *require = format!("{parent}/{require}");
        }
    }
    let id = phase.id.clone();
    for child in &mut phase.phases {
        resolve_phase(child, &id);
    }
}

/// Check the structural invariants of a resolved plan: unique absolute IDs,
/// requires entries naming existing phases, leaves carrying executors,
/// interior phases not, and every referenced server present in the plan's
/// server list.
pub fn validate_plan(plan: &OperationPlan) -> Result<(), GupError> {
    let phases = plan.all_phases();

    let mut ids = HashSet::new();
    for phase in &phases {
        if !phase.id.starts_with('/') {
            return Err(GupError::Invalid(format!(
                "phase {:?} has an unresolved ID",
                phase.id
            )));
        }
        if !ids.insert(phase.id.as_str()) {
            return Err(GupError::Invalid(format!("duplicate phase ID {}", phase.id)));
        }
    }

    let known_ips: HashSet<&str> = plan
        .servers
        .iter()
        .map(|s| s.advertise_ip.as_str())
        .collect();

    for phase in &phases {
        for require in &phase.requires {
            if !ids.contains(require.as_str()) {
                return Err(GupError::Invalid(format!(
                    "phase {} requires unknown phase {}",
                    phase.id, require
                )));
            }
        }
        if phase.phases.is_empty() && phase.executor.is_none() && phase.data.is_some() {
            return Err(GupError::Invalid(format!(
                "phase {} carries data but no executor",
                phase.id
            )));
        }
        if !phase.phases.is_empty() && phase.executor.is_some() {
            return Err(GupError::Invalid(format!(
                "interior phase {} has an executor",
                phase.id
            )));
        }
        if let Some(data) = &phase.data {
            for ip in data.server_ips() {
                if !known_ips.contains(ip) {
                    return Err(GupError::Invalid(format!(
                        "phase {} references server {} not in the plan",
                        phase.id, ip
                    )));
                }
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::*;
    use crate::cluster::ClusterRole;
    use crate::cluster::fixtures::server;
    use crate::dns::DnsConfig;
    use crate::loc::Locator;
    use crate::plan::phase::{Executor, PhaseData};

    fn leaf(id: &str) -> PhaseBuilder {
        PhaseBuilder::new(id, format!("Phase {id}")).executor(Executor::SystemUpgrade)
    }

    fn plan_with(phases: Vec<OperationPhase>) -> OperationPlan {
        OperationPlan {
            operation_id: Uuid::new_v4(),
            cluster_name: "example".to_string(),
            phases,
            servers: vec![server(1, ClusterRole::Master)],
            dns_config: DnsConfig::default(),
            gravity_package: Locator::local("gravity", "2.0.0").unwrap(),
            offline_coordinator: server(1, ClusterRole::Master),
        }
    }

    #[test]
    fn test_add_sequential_chains_siblings() {
        let mut root = PlanBuilder::new();
        root.add_sequential(leaf("init"));
        root.add_sequential(leaf("checks"));
        root.add_sequential(leaf("bootstrap"));

        let phases = root.into_phases();
        assert!(phases[0].requires.is_empty());
        assert_eq!(phases[1].requires, vec!["init"]);
        assert_eq!(phases[2].requires, vec!["checks"]);
    }

    #[test]
    fn test_add_parallel_leaves_siblings_unordered() {
        let mut parent = PhaseBuilder::new("bootstrap", "Bootstrap nodes");
        parent.add_parallel(leaf("node-1"));
        parent.add_parallel(leaf("node-2"));

        let phase = parent.into_phase();
        assert!(phase.phases[0].requires.is_empty());
        assert!(phase.phases[1].requires.is_empty());
    }

    #[test]
    fn test_add_with_dependency() {
        let mut root = PlanBuilder::new();
        root.add_sequential(leaf("masters"));
        root.add_sequential(leaf("nodes"));
        root.add_with_dependency("/masters", leaf("etcd"));

        let phases = root.into_phases();
        // The explicit edge replaces sibling chaining entirely.
        assert_eq!(phases[2].requires, vec!["/masters"]);
    }

    #[test]
    fn test_resolve_plan_absolute_ids() {
        let mut masters = PhaseBuilder::new("masters", "Update masters");
        let mut node = PhaseBuilder::new("node-1", "Update node-1");
        node.add_sequential(leaf("drain"));
        node.add_sequential(leaf("system-upgrade"));
        masters.add_sequential(node);

        let mut root = PlanBuilder::new();
        root.add_sequential(leaf("init"));
        root.add_sequential(masters);

        let mut plan = plan_with(root.into_phases());
        resolve_plan(&mut plan);

        let ids: Vec<&str> = plan.all_phases().iter().map(|p| p.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "/init",
                "/masters",
                "/masters/node-1",
                "/masters/node-1/drain",
                "/masters/node-1/system-upgrade",
            ]
        );
        assert_eq!(
            plan.find("/masters/node-1/system-upgrade").unwrap().requires,
            vec!["/masters/node-1/drain"]
        );
        assert_eq!(plan.find("/masters").unwrap().requires, vec!["/init"]);
    }

    #[test]
    fn test_resolve_plan_idempotent() {
        let mut root = PlanBuilder::new();
        root.add_sequential(leaf("init"));
        root.add_sequential(leaf("checks"));
        let mut plan = plan_with(root.into_phases());

        resolve_plan(&mut plan);
        let once = plan.clone();
        resolve_plan(&mut plan);
        assert_eq!(plan, once);
    }

    #[test]
    fn test_resolve_keeps_absolute_requires() {
        let mut restart = PhaseBuilder::new("restart", "Restart etcd");
        restart.add_with_dependency("/etcd/restore", leaf("node-1"));
        let mut etcd = PhaseBuilder::new("etcd", "Upgrade etcd");
        etcd.add_parallel(restart);

        let mut root = PlanBuilder::new();
        root.add_parallel(etcd);
        let mut plan = plan_with(root.into_phases());
        resolve_plan(&mut plan);

        assert_eq!(
            plan.find("/etcd/restart/node-1").unwrap().requires,
            vec!["/etcd/restore"]
        );
    }

    #[test]
    fn test_validate_plan_ok() {
        let mut root = PlanBuilder::new();
        root.add_sequential(leaf("init"));
        root.add_sequential(leaf("checks"));
        let mut plan = plan_with(root.into_phases());
        resolve_plan(&mut plan);
        validate_plan(&plan).unwrap();
    }

    #[test]
    fn test_validate_plan_duplicate_id() {
        let mut root = PlanBuilder::new();
        root.add_parallel(leaf("init"));
        root.add_parallel(leaf("init"));
        let mut plan = plan_with(root.into_phases());
        resolve_plan(&mut plan);
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("duplicate phase ID"));
    }

    #[test]
    fn test_validate_plan_unknown_requires() {
        let mut root = PlanBuilder::new();
        root.add_with_dependency("/ghost", leaf("init"));
        let mut plan = plan_with(root.into_phases());
        resolve_plan(&mut plan);
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("unknown phase /ghost"));
    }

    #[test]
    fn test_validate_plan_data_without_executor() {
        let mut root = PlanBuilder::new();
        root.add_parallel(PhaseBuilder::new("init", "Initialize").data(PhaseData::Server {
            server: server(1, ClusterRole::Master),
            exec_server: None,
        }));
        let mut plan = plan_with(root.into_phases());
        resolve_plan(&mut plan);
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("no executor"));
    }

    #[test]
    fn test_validate_plan_allows_empty_composite() {
        // A plan with nothing to update still carries an empty `app` phase.
        let mut root = PlanBuilder::new();
        root.add_sequential(leaf("checks"));
        root.add_sequential(PhaseBuilder::new("app", "Update installed application"));
        let mut plan = plan_with(root.into_phases());
        resolve_plan(&mut plan);
        validate_plan(&plan).unwrap();
    }

    #[test]
    fn test_validate_plan_unknown_server() {
        let stranger = server(9, ClusterRole::Worker);
        let mut root = PlanBuilder::new();
        root.add_parallel(leaf("drain").data(PhaseData::Server {
            server: stranger,
            exec_server: None,
        }));
        let mut plan = plan_with(root.into_phases());
        resolve_plan(&mut plan);
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("not in the plan"));
    }

    #[test]
    fn test_validate_plan_unresolved_id() {
        let mut root = PlanBuilder::new();
        root.add_parallel(leaf("init"));
        let plan = plan_with(root.into_phases());
        // Not resolved: relative IDs must be rejected.
        let err = validate_plan(&plan).unwrap_err();
        assert!(err.to_string().contains("unresolved"));
    }
}
