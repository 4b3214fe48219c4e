//! Canonical phase tree of a single upgrade step.
//!
//! Emits the sub-phases of one runtime hop: bootstrap, coredns, masters,
//! nodes, etcd, config and runtime, plus the plan-wide phases that appear
//! once per plan (init, checks, pre-update, migration, app, gc). For
//! multi-step upgrades each hop is wrapped under a version-named subtree.

use semver::Version;
use uuid::Uuid;

use crate::app::Application;
use crate::catalog::EtcdUpgrade;
use crate::cluster::{Server, UpdateServer};
use crate::loc::Locator;
use crate::plan::builder::{Compose, PhaseBuilder};
use crate::plan::phase::{ElectionChange, Executor, PhaseData, UpdateData};

pub const INIT: &str = "init";
pub const CHECKS: &str = "checks";
pub const PRE_UPDATE: &str = "pre-update";
pub const BOOTSTRAP: &str = "bootstrap";
pub const COREDNS: &str = "coredns";
pub const MASTERS: &str = "masters";
pub const NODES: &str = "nodes";
pub const ETCD: &str = "etcd";
pub const CONFIG: &str = "config";
pub const RUNTIME: &str = "runtime";
pub const MIGRATION: &str = "migration";
pub const APP: &str = "app";
pub const GC: &str = "gc";

/// ID of the final step's wrapper subtree in a multi-step plan.
pub const TARGET: &str = "target";

/// The cluster controller service restarted alongside etcd to recover
/// leader elections.
pub const GRAVITY_SITE: &str = "gravity-site";

const KUBELET_PERMISSIONS: &str = "kubelet-permissions";
const STEPDOWN: &str = "stepdown";
const ELECT: &str = "elect";
const DRAIN: &str = "drain";
const SYSTEM_UPGRADE: &str = "system-upgrade";
const DOCKER: &str = "docker";
const TAINT: &str = "taint";
const UNCORDON: &str = "uncordon";
const ENDPOINTS: &str = "endpoints";
const UNTAINT: &str = "untaint";

/// Inputs for emitting one step's phase tree.
#[derive(Clone, Debug)]
pub struct StepConfig {
    /// Absolute path prefix of this step's phases: empty for a single-step
    /// plan, `/<version>` or `/target` for wrapped steps. Used to write the
    /// cross-parent requires edges of the etcd block.
    pub root: String,
    pub changeset_id: Uuid,
    pub servers: Vec<UpdateServer>,
    pub leader_ip: String,
    pub etcd: Option<EtcdUpgrade>,
    /// Control binary staged by this step's bootstrap.
    pub gravity_package: Locator,
    /// Set on intermediate steps so agents select the matching staged binary.
    pub runtime_app_version: Option<Version>,
    /// Changed system applications, RBAC app first.
    pub runtime_updates: Vec<Application>,
    /// Emit the CoreDNS provisioning phase (target step on clusters without
    /// the CoreDNS resources).
    pub coredns: bool,
    /// The runtime supports node taints.
    pub supports_taints: bool,
    pub num_parallel_workers: usize,
    pub num_parallel_phases: usize,
}

impl StepConfig {
    fn leader(&self) -> &UpdateServer {
        self.servers
            .iter()
            .find(|s| s.server.advertise_ip == self.leader_ip)
            .expect("leader is one of the cluster servers")
    }

    /// Masters with the leader first; the relative order of the rest is
    /// preserved.
    fn masters(&self) -> Vec<&UpdateServer> {
        let (mut leader, rest): (Vec<&UpdateServer>, Vec<&UpdateServer>) = self
            .servers
            .iter()
            .filter(|s| s.server.is_master())
            .partition(|s| s.server.advertise_ip == self.leader_ip);
        leader.extend(rest);
        leader
    }

    fn workers(&self) -> Vec<&UpdateServer> {
        self.servers
            .iter()
            .filter(|s| !s.server.is_master())
            .collect()
    }
}

fn server_data(server: &Server) -> PhaseData {
    PhaseData::Server {
        server: server.clone(),
        exec_server: None,
    }
}

/// The full descriptor list with the leader's own entry first, preserving
/// the relative order of the rest. Leader-variant payloads are dispatched to
/// the node of their first descriptor.
fn leader_first_updates(servers: &[UpdateServer], leader_ip: &str) -> Vec<UpdateServer> {
    let (mut leader, rest): (Vec<UpdateServer>, Vec<UpdateServer>) = servers
        .iter()
        .cloned()
        .partition(|s| s.server.advertise_ip == leader_ip);
    leader.extend(rest);
    leader
}

fn server_data_on(server: &Server, exec: &Server) -> PhaseData {
    PhaseData::Server {
        server: server.clone(),
        exec_server: Some(exec.clone()),
    }
}

/// Per-server initialization. The leader carries the whole update-server
/// list so it can seed follower state.
pub fn init_phase(servers: &[UpdateServer], leader: &Server) -> PhaseBuilder {
    let mut init = PhaseBuilder::new(INIT, "Initialize update operation");
    for update in servers {
        let hostname = &update.server.hostname;
        let child = PhaseBuilder::new(
            hostname,
            format!("Initialize operation on node {hostname}"),
        );
        let child = if update.server.advertise_ip == leader.advertise_ip {
            child
                .executor(Executor::InitLeader)
                .data(PhaseData::Update(UpdateData {
                    servers: leader_first_updates(servers, &leader.advertise_ip),
                    ..Default::default()
                }))
        } else {
            child
                .executor(Executor::Init)
                .data(server_data(&update.server))
        };
        init.add_parallel(child);
    }
    init
}

/// Preflight validation on the leader.
pub fn checks_phase(leader: &Server) -> PhaseBuilder {
    PhaseBuilder::new(CHECKS, "Run preflight checks")
        .executor(Executor::Checks)
        .data(server_data(leader))
}

/// Application-defined pre-update hook.
pub fn pre_update_phase(update_app: &Locator) -> PhaseBuilder {
    PhaseBuilder::new(PRE_UPDATE, "Run pre-update application hook")
        .executor(Executor::PreUpdate)
        .data(PhaseData::Package(update_app.clone()))
}

/// Emit this step's phases into the given composer: bootstrap, coredns?,
/// masters, nodes?, etcd?, config, runtime?.
pub fn add_step_phases(composer: &mut dyn Compose, config: &StepConfig) {
    composer.sequential(bootstrap_phase(config));
    if config.coredns {
        composer.sequential(coredns_phase(config));
    }
    composer.sequential(masters_phase(config));
    if let Some(nodes) = nodes_phase(config) {
        composer.sequential(nodes);
    }
    if let Some(etcd) = etcd_phase(config) {
        // The etcd block deliberately does not depend on the nodes step:
        // agents may lose plan visibility once etcd shuts down.
        composer.with_dependency(format!("{}/{MASTERS}", config.root), etcd);
    }
    composer.sequential(config_phase(config));
    if let Some(runtime) = runtime_phase(config) {
        composer.sequential(runtime);
    }
}

/// Wrap one step's phases under a version-named subtree for multi-step
/// plans.
pub fn wrapped_step(id: &str, description: impl Into<String>, config: &StepConfig) -> PhaseBuilder {
    let mut wrapper = PhaseBuilder::new(id, description);
    add_step_phases(&mut wrapper, config);
    wrapper
}

/// Stage update packages on every node, in parallel. The leader variant
/// carries the full server list; followers only their own descriptor.
fn bootstrap_phase(config: &StepConfig) -> PhaseBuilder {
    let mut bootstrap = PhaseBuilder::new(BOOTSTRAP, "Bootstrap update agents")
        .limit_parallel(config.num_parallel_phases);
    for update in &config.servers {
        let hostname = &update.server.hostname;
        let is_leader = update.server.advertise_ip == config.leader_ip;
        let data = UpdateData {
            servers: if is_leader {
                leader_first_updates(&config.servers, &config.leader_ip)
            } else {
                vec![update.clone()]
            },
            changeset_id: None,
            gravity_package: Some(config.gravity_package.clone()),
            runtime_app_version: config.runtime_app_version.clone(),
        };
        bootstrap.add_parallel(
            PhaseBuilder::new(hostname, format!("Bootstrap update agent on node {hostname}"))
                .executor(if is_leader {
                    Executor::BootstrapLeader
                } else {
                    Executor::Bootstrap
                })
                .data(PhaseData::Update(data)),
        );
    }
    bootstrap
}

fn coredns_phase(config: &StepConfig) -> PhaseBuilder {
    PhaseBuilder::new(COREDNS, "Provision CoreDNS resources")
        .executor(Executor::Coredns)
        .data(server_data(&config.leader().server))
}

/// Sequential per-master subtrees, leader first. Leadership is forced back
/// to the leader before any follower is touched, and re-enabled per
/// follower afterwards.
fn masters_phase(config: &StepConfig) -> PhaseBuilder {
    let masters = config.masters();
    let (leader, followers) = masters.split_first().expect("at least one master");
    let leader_hostname = &leader.server.hostname;

    let mut phase = PhaseBuilder::new(MASTERS, "Update master nodes");

    let mut leader_sub = PhaseBuilder::new(
        leader_hostname,
        format!("Update system software on master node {leader_hostname}"),
    );
    if !followers.is_empty() {
        leader_sub.add_sequential(
            PhaseBuilder::new(KUBELET_PERMISSIONS, "Update kubelet permissions")
                .executor(Executor::KubeletPermissions)
                .data(server_data(&leader.server)),
        );
        leader_sub.add_sequential(
            PhaseBuilder::new(
                STEPDOWN,
                format!("Step down {leader_hostname} as Kubernetes leader"),
            )
            .executor(Executor::Elections)
            .data(PhaseData::Elections(ElectionChange {
                enable: vec![],
                disable: vec![leader.server.clone()],
            })),
        );
    }
    add_common_pipeline(
        &mut leader_sub,
        config,
        leader,
        NodePosition::Leader {
            other_masters: !followers.is_empty(),
        },
    );
    phase.add_sequential(leader_sub);

    if !followers.is_empty() {
        phase.add_sequential(
            PhaseBuilder::new(
                ELECT,
                format!("Make sure the leader node {leader_hostname} is elected"),
            )
            .executor(Executor::Elections)
            .data(PhaseData::Elections(ElectionChange {
                enable: vec![leader.server.clone()],
                disable: followers.iter().map(|f| f.server.clone()).collect(),
            })),
        );
        for follower in followers {
            let hostname = &follower.server.hostname;
            let mut sub = PhaseBuilder::new(
                hostname,
                format!("Update system software on master node {hostname}"),
            );
            add_common_pipeline(&mut sub, config, follower, NodePosition::Other);
            phase.add_sequential(sub);
            phase.add_sequential(
                PhaseBuilder::new(
                    format!("enable-{hostname}"),
                    format!("Enable leader election on node {hostname}"),
                )
                .executor(Executor::Elections)
                .data(PhaseData::Elections(ElectionChange {
                    enable: vec![follower.server.clone()],
                    disable: vec![],
                })),
            );
        }
    }
    phase
}

/// Per-worker subtrees, upgraded concurrently up to the configured ceiling.
fn nodes_phase(config: &StepConfig) -> Option<PhaseBuilder> {
    let workers = config.workers();
    if workers.is_empty() {
        return None;
    }
    let mut phase =
        PhaseBuilder::new(NODES, "Update worker nodes").limit_parallel(config.num_parallel_workers);
    for worker in workers {
        let hostname = &worker.server.hostname;
        let mut sub = PhaseBuilder::new(
            hostname,
            format!("Update system software on node {hostname}"),
        );
        add_common_pipeline(&mut sub, config, worker, NodePosition::Other);
        phase.add_parallel(sub);
    }
    Some(phase)
}

#[derive(Clone, Copy)]
enum NodePosition {
    Leader { other_masters: bool },
    Other,
}

/// The common node pipeline: drain, system-upgrade, optional docker
/// repurpose, optional taints, uncordon, endpoints wait.
fn add_common_pipeline(
    parent: &mut PhaseBuilder,
    config: &StepConfig,
    node: &UpdateServer,
    position: NodePosition,
) {
    let leader = &config.leader().server;
    let hostname = &node.server.hostname;

    parent.add_sequential(
        PhaseBuilder::new(DRAIN, format!("Drain node {hostname}"))
            .executor(Executor::Drain)
            .data(server_data_on(&node.server, leader)),
    );
    parent.add_sequential(
        PhaseBuilder::new(
            SYSTEM_UPGRADE,
            format!("Update system software on node {hostname}"),
        )
        .executor(Executor::SystemUpgrade)
        .data(PhaseData::Update(UpdateData {
            servers: vec![node.clone()],
            changeset_id: Some(config.changeset_id),
            gravity_package: None,
            runtime_app_version: config.runtime_app_version.clone(),
        })),
    );
    if node.docker.needs_device_repurpose() {
        parent.add_sequential(docker_phase(node));
    }
    if config.supports_taints {
        parent.add_sequential(
            PhaseBuilder::new(TAINT, format!("Taint node {hostname}"))
                .executor(Executor::Taint)
                .data(server_data_on(&node.server, leader)),
        );
    }
    parent.add_sequential(
        PhaseBuilder::new(UNCORDON, format!("Uncordon node {hostname}"))
            .executor(Executor::Uncordon)
            .data(server_data_on(&node.server, leader)),
    );
    // Skipping the endpoints wait on a multi-master leader is a latency
    // optimization: the remaining masters still serve DNS.
    let endpoints = !matches!(position, NodePosition::Leader { other_masters: true });
    if endpoints {
        parent.add_sequential(
            PhaseBuilder::new(
                ENDPOINTS,
                format!("Wait for DNS and cluster endpoints on {hostname}"),
            )
            .executor(Executor::Endpoints)
            .data(server_data_on(&node.server, leader)),
        );
    }
    if config.supports_taints {
        parent.add_sequential(
            PhaseBuilder::new(UNTAINT, format!("Remove taint from node {hostname}"))
                .executor(Executor::Untaint)
                .data(server_data_on(&node.server, leader)),
        );
    }
}

/// Devicemapper block-device repurposing, linear.
fn docker_phase(node: &UpdateServer) -> PhaseBuilder {
    let device = node
        .docker
        .installed
        .device
        .clone()
        .unwrap_or_else(|| "unknown".to_string());
    let mut docker = PhaseBuilder::new(DOCKER, format!("Repurpose docker device {device}"));
    docker.add_sequential(
        PhaseBuilder::new("devicemapper", "Remove devicemapper environment")
            .executor(Executor::DockerDevicemapper)
            .data(server_data(&node.server)),
    );
    docker.add_sequential(
        PhaseBuilder::new("format", "Format docker devices")
            .executor(Executor::DockerFormat)
            .data(server_data(&node.server)),
    );
    docker.add_sequential(
        PhaseBuilder::new("mount", "Mount docker storage")
            .executor(Executor::DockerMount)
            .data(server_data(&node.server)),
    );
    docker.add_sequential(
        PhaseBuilder::new("planet", "Start planet with the new configuration")
            .executor(Executor::DockerPlanet)
            .data(server_data(&node.server)),
    );
    docker
}

/// The etcd upgrade block. Five sub-blocks whose ordering is expressed only
/// through the explicit cross-parent edges below; the sub-blocks themselves
/// are parallel parents.
fn etcd_phase(config: &StepConfig) -> Option<PhaseBuilder> {
    let versions = config.etcd.as_ref()?;
    let root = &config.root;
    let masters = config.masters();
    let workers = config.workers();
    let leader = &config.leader().server;
    let installed = if versions.installed.is_empty() {
        "unknown"
    } else {
        &versions.installed
    };

    let mut phase = PhaseBuilder::new(
        ETCD,
        format!("Upgrade etcd {installed} to {}", versions.update),
    )
    .data(PhaseData::Etcd {
        installed: versions.installed.clone(),
        update: versions.update.clone(),
    });

    let mut backup = PhaseBuilder::new("backup", "Backup etcd data");
    for master in &masters {
        let hostname = &master.server.hostname;
        backup.add_parallel(
            PhaseBuilder::new(hostname, format!("Backup etcd on node {hostname}"))
                .executor(Executor::EtcdBackup)
                .data(server_data(&master.server)),
        );
    }
    phase.add_parallel(backup);

    let mut shutdown = PhaseBuilder::new("shutdown", "Shutdown etcd cluster");
    for master in &masters {
        let hostname = &master.server.hostname;
        shutdown.add_with_dependency(
            format!("{root}/{ETCD}/backup/{hostname}"),
            PhaseBuilder::new(hostname, format!("Shutdown etcd on node {hostname}"))
                .executor(Executor::EtcdShutdown)
                .data(server_data(&master.server)),
        );
    }
    for worker in &workers {
        let hostname = &worker.server.hostname;
        shutdown.add_parallel(
            PhaseBuilder::new(hostname, format!("Shutdown etcd on node {hostname}"))
                .executor(Executor::EtcdShutdown)
                .data(server_data(&worker.server)),
        );
    }
    phase.add_parallel(shutdown);

    let mut upgrade = PhaseBuilder::new("upgrade", "Upgrade etcd servers");
    for node in masters.iter().chain(workers.iter()) {
        let hostname = &node.server.hostname;
        upgrade.add_with_dependency(
            format!("{root}/{ETCD}/shutdown/{hostname}"),
            PhaseBuilder::new(hostname, format!("Upgrade etcd on node {hostname}"))
                .executor(Executor::EtcdUpgrade)
                .data(server_data(&node.server)),
        );
    }
    phase.add_parallel(upgrade);

    let mut migrate = PhaseBuilder::new("migrate", "Migrate etcd data to the new version");
    for master in &masters {
        let hostname = &master.server.hostname;
        migrate.add_with_dependency(
            format!("{root}/{ETCD}/upgrade/{hostname}"),
            PhaseBuilder::new(hostname, format!("Migrate etcd data on node {hostname}"))
                .executor(Executor::EtcdMigrate)
                .data(server_data(&master.server)),
        );
    }
    phase.add_parallel(migrate);

    phase.add_with_dependency(
        format!("{root}/{ETCD}/migrate"),
        PhaseBuilder::new("restore", "Restore etcd data from backup")
            .executor(Executor::EtcdRestore)
            .data(server_data(leader)),
    );

    let mut restart = PhaseBuilder::new("restart", "Restart etcd servers");
    for node in masters.iter().chain(workers.iter()) {
        let hostname = &node.server.hostname;
        let dependency = if node.server.advertise_ip == config.leader_ip {
            format!("{root}/{ETCD}/restore")
        } else {
            format!("{root}/{ETCD}/upgrade/{hostname}")
        };
        restart.add_with_dependency(
            dependency,
            PhaseBuilder::new(hostname, format!("Restart etcd on node {hostname}"))
                .executor(Executor::EtcdRestart)
                .data(server_data(&node.server)),
        );
    }
    restart.add_with_dependency(
        format!("{root}/{ETCD}/restore"),
        PhaseBuilder::new(GRAVITY_SITE, "Restart gravity-site service")
            .executor(Executor::EtcdRestartGravity)
            .data(server_data(leader)),
    );
    phase.add_parallel(restart);

    Some(phase)
}

/// Update on-disk control-plane configuration on every master, in parallel,
/// so a freshly started control plane finds its config before runtime apps
/// are deployed.
fn config_phase(config: &StepConfig) -> PhaseBuilder {
    let mut phase = PhaseBuilder::new(CONFIG, "Update system configuration on nodes")
        .limit_parallel(config.num_parallel_phases);
    for master in config.masters() {
        let hostname = &master.server.hostname;
        phase.add_parallel(
            PhaseBuilder::new(hostname, format!("Update configuration on node {hostname}"))
                .executor(Executor::Config)
                .data(PhaseData::Update(UpdateData {
                    servers: vec![(*master).clone()],
                    ..Default::default()
                })),
        );
    }
    phase
}

/// Sequential system application updates. Serialization is a safety
/// property here, not a performance one.
fn runtime_phase(config: &StepConfig) -> Option<PhaseBuilder> {
    if config.runtime_updates.is_empty() {
        return None;
    }
    let mut phase = PhaseBuilder::new(RUNTIME, "Update system applications");
    for app in &config.runtime_updates {
        phase.add_sequential(
            PhaseBuilder::new(
                app.name(),
                format!("Update system application {} to {}", app.name(), app.version()),
            )
            .executor(Executor::RuntimeApp)
            .data(PhaseData::Package(app.package.clone())),
        );
    }
    Some(phase)
}

/// Cluster data migrations that apply to this upgrade.
#[derive(Clone, Copy, Debug, Default)]
pub struct Migrations {
    /// Legacy hub links exist and no trusted clusters are configured.
    pub links: bool,
    /// Installed roles match the legacy schema.
    pub roles: bool,
}

/// Migration phase; node label updates always run, links and roles only
/// when applicable.
pub fn migration_phase(migrations: Migrations) -> PhaseBuilder {
    let mut phase = PhaseBuilder::new(MIGRATION, "Migrate cluster data to the new version");
    if migrations.links {
        phase.add_sequential(
            PhaseBuilder::new("links", "Migrate remote Ops Center links to trusted clusters")
                .executor(Executor::MigrateLinks),
        );
    }
    phase.add_sequential(
        PhaseBuilder::new("labels", "Update node labels").executor(Executor::UpdateLabels),
    );
    if migrations.roles {
        phase.add_sequential(
            PhaseBuilder::new("roles", "Migrate cluster roles to the new schema")
                .executor(Executor::MigrateRoles),
        );
    }
    phase
}

/// Sequential user application updates, the cluster app last.
pub fn app_phase(updates: &[Application]) -> PhaseBuilder {
    let mut phase = PhaseBuilder::new(APP, "Update installed application");
    for app in updates {
        phase.add_sequential(
            PhaseBuilder::new(
                app.name(),
                format!("Update application {} to {}", app.name(), app.version()),
            )
            .executor(Executor::App)
            .data(PhaseData::Package(app.package.clone())),
        );
    }
    phase
}

/// Parallel per-node cleanup of staged artifacts.
pub fn gc_phase(servers: &[UpdateServer], num_parallel_phases: usize) -> PhaseBuilder {
    let mut phase =
        PhaseBuilder::new(GC, "Run cleanup on nodes").limit_parallel(num_parallel_phases);
    for update in servers {
        let hostname = &update.server.hostname;
        phase.add_parallel(
            PhaseBuilder::new(hostname, format!("Clean up node {hostname}"))
                .executor(Executor::Cleanup)
                .data(server_data(&update.server)),
        );
    }
    phase
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use crate::cluster::{
        ClusterRole, DockerConfig, DockerSlot, RuntimeSlot, RuntimeUpdate, TeleportSlot,
    };
    use crate::cluster::fixtures::server;

    pub fn update_server(n: usize, role: ClusterRole) -> UpdateServer {
        let docker = DockerConfig {
            storage_driver: "overlay2".to_string(),
            device: None,
        };
        UpdateServer {
            server: server(n, role),
            runtime: RuntimeSlot {
                installed: Locator::local("planet", "1.0.0").unwrap(),
                secrets_package: Some(Locator::local("secrets", "2.0.0").unwrap()),
                update: Some(RuntimeUpdate {
                    package: Locator::local("planet", "2.0.0").unwrap(),
                    config_package: Locator::local("planet-config", "2.0.0").unwrap(),
                }),
            },
            teleport: TeleportSlot {
                installed: Locator::local("teleport", "3.0.0").unwrap(),
                update: None,
            },
            docker: DockerSlot {
                installed: docker.clone(),
                update: docker,
            },
        }
    }

    /// Three-node config: masters node-1, node-2 (leader node-2), worker
    /// node-3, etcd 3.3.2 -> 3.3.3.
    pub fn three_node_config() -> StepConfig {
        StepConfig {
            root: String::new(),
            changeset_id: Uuid::new_v4(),
            servers: vec![
                update_server(1, ClusterRole::Master),
                update_server(2, ClusterRole::Master),
                update_server(3, ClusterRole::Worker),
            ],
            leader_ip: "172.28.128.2".to_string(),
            etcd: Some(EtcdUpgrade {
                installed: "3.3.2".to_string(),
                update: "3.3.3".to_string(),
            }),
            gravity_package: Locator::local("gravity", "2.0.0").unwrap(),
            runtime_app_version: None,
            runtime_updates: vec![],
            coredns: true,
            supports_taints: true,
            num_parallel_workers: 3,
            num_parallel_phases: 5,
        }
    }
}
