//! Plan orchestrator.
//!
//! Drives the step builder for every upgrade hop, allocates changeset IDs,
//! exports intermediate control binaries and persists the finished plan.
//! Initializing a plan twice fails with `AlreadyExists`.

use std::path::PathBuf;

use anyhow::{Context, Result};
use semver::Version;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::{Application, Manifest};
use crate::catalog::{Applications, Packages, etcd_upgrade};
use crate::cluster::{DockerConfig, Server};
use crate::diff;
use crate::dns::dns_config_from_package;
use crate::error::{GupError, is_not_found};
use crate::export::export_gravity_binary;
use crate::gate::{UpgradeGate, resolve_upgrade_path};
use crate::k8s::ClusterView;
use crate::loc::Locator;
use crate::plan::builder::{PlanBuilder, resolve_plan, validate_plan};
use crate::plan::phase::OperationPlan;
use crate::plan::step::{
    self, Migrations, StepConfig, TARGET, add_step_phases, app_phase, checks_phase, gc_phase,
    init_phase, migration_phase, pre_update_phase, wrapped_step,
};
use crate::rotation::{PackageRotator, UpdateConfig, compute_update_servers};
use crate::storage::{Backend, OperationKind};

/// Teleport package name in runtime app dependencies.
const TELEPORT_PACKAGE: &str = "teleport";

/// Planner knobs. The upgrade gate is normally read from the target runtime
/// manifest; tests inject their own.
#[derive(Clone, Debug)]
pub struct PlannerConfig {
    pub gate: Option<UpgradeGate>,
    pub num_parallel_workers: usize,
    pub num_parallel_phases: usize,
    /// Runtime version that introduced node taint support.
    pub taints_supported_since: Version,
    /// Directory intermediate control binaries are exported into.
    pub export_dir: PathBuf,
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            gate: None,
            num_parallel_workers: 10,
            num_parallel_phases: 5,
            taints_supported_since: Version::new(5, 5, 0),
            export_dir: PathBuf::from("/var/lib/gravity/site/update"),
        }
    }
}

/// Collaborators and inputs of plan creation.
pub struct InitPlanParams<'a> {
    pub account_id: String,
    pub cluster_name: String,
    pub servers: Vec<Server>,
    /// Master pinned as the operation coordinator.
    pub leader: Server,
    /// The installed runtime-config package, source of the persisted DNS
    /// configuration.
    pub runtime_config_package: Locator,
    /// Cluster-wide store, authoritative for plan creation.
    pub backend: &'a dyn Backend,
    /// Local store on the coordinator, mirrored best-effort.
    pub local_backend: &'a dyn Backend,
    pub apps: &'a dyn Applications,
    pub packages: &'a dyn Packages,
    pub rotator: &'a dyn PackageRotator,
    pub cluster_view: &'a dyn ClusterView,
    pub config: PlannerConfig,
}

/// Create and persist the operation plan for the cluster's pending upgrade
/// operation.
#[allow(clippy::too_many_lines)]
pub async fn init_operation_plan(params: &InitPlanParams<'_>) -> Result<OperationPlan> {
    let operation = params
        .backend
        .get_last_operation(&params.cluster_name)
        .await?;
    if operation.kind != OperationKind::Upgrade {
        return Err(GupError::BadParameter(format!(
            "last operation {} is not an upgrade",
            operation.id
        ))
        .into());
    }
    match params
        .backend
        .get_operation_plan(&params.cluster_name, operation.id)
        .await
    {
        Ok(_) => {
            return Err(GupError::AlreadyExists(format!(
                "plan for operation {}",
                operation.id
            ))
            .into());
        }
        Err(err) if is_not_found(&err) => {}
        Err(err) => return Err(err),
    }

    let site = params.backend.get_local_site(&params.account_id).await?;
    let installed_app = params.apps.get_app(&site.app).await?;
    let update_package = operation
        .update
        .as_ref()
        .map(|u| u.update_package.clone())
        .ok_or_else(|| {
            GupError::BadParameter(format!("operation {} has no update package", operation.id))
        })?;
    let update_app = params.apps.get_app(&update_package).await?;

    let installed_runtime = base_runtime(params.apps, &installed_app).await?;
    let update_runtime = base_runtime(params.apps, &update_app).await?;

    // Every cluster member must resolve to a registered Kubernetes node
    // before the plan can address it.
    for server in &params.servers {
        params
            .cluster_view
            .node_name_by_ip(&server.advertise_ip)
            .await
            .with_context(|| format!("failed to resolve node for {}", server.hostname))?;
    }
    let coredns_missing = !params.cluster_view.coredns_configured().await?;

    let hops = if installed_runtime.version() == update_runtime.version() {
        Vec::new()
    } else {
        let gate = params
            .config
            .gate
            .clone()
            .unwrap_or_else(|| UpgradeGate::from_manifest(&update_runtime.manifest));
        resolve_upgrade_path(&gate, installed_runtime.version(), params.packages).await?
    };

    let mut runtime_apps = Vec::with_capacity(hops.len() + 1);
    for (_, locator) in &hops {
        runtime_apps.push(params.apps.get_app(locator).await?);
    }
    runtime_apps.push(update_runtime.clone());
    let multi_step = runtime_apps.len() > 1;

    let gravity_package = update_runtime
        .manifest
        .gravity_package()
        .cloned()
        .ok_or_else(|| {
            GupError::BadParameter(format!(
                "runtime app {} has no gravity dependency",
                update_runtime.package
            ))
        })?;

    let dns_config =
        dns_config_from_package(params.packages, &params.runtime_config_package).await?;

    let mut steps = Vec::with_capacity(runtime_apps.len());
    let mut previous_runtime = installed_runtime.clone();
    let mut previous_teleport = teleport_package(&installed_runtime.manifest)?;
    let step_count = runtime_apps.len();
    for (index, runtime_app) in runtime_apps.into_iter().enumerate() {
        let is_target = index == step_count - 1;
        let step = build_step(
            params,
            &site.docker,
            &installed_app,
            &update_app,
            &previous_runtime,
            &runtime_app,
            &previous_teleport,
            StepContext {
                is_target,
                multi_step,
                coredns_missing,
            },
        )
        .await?;

        if !is_target {
            export_gravity_binary(
                params.packages,
                &step.gravity_package,
                &params.config.export_dir,
                site.service_user,
            )
            .await
            .context("failed to export intermediate gravity binary")?;
        }

        if let Some(teleport) = teleport_package_opt(&runtime_app.manifest) {
            previous_teleport = teleport;
        }
        previous_runtime = runtime_app;
        steps.push(step);
    }

    let runtime_changed = installed_runtime.version() != update_runtime.version()
        || steps
            .iter()
            .any(|s| s.servers.iter().any(crate::cluster::UpdateServer::needs_update));

    let migrations = applicable_migrations(params).await?;
    let app_updates = diff::app_updates(&installed_app, &update_app, params.apps).await?;

    let mut builder = PlanBuilder::new();
    if runtime_changed {
        builder.add_sequential(init_phase(&steps[0].servers, &params.leader));
    }
    builder.add_sequential(checks_phase(&params.leader));
    let mut pre_update = pre_update_phase(&update_app.package);
    if runtime_changed {
        pre_update = pre_update.require(format!("/{}", step::INIT));
    }
    builder.add_sequential(pre_update);

    if runtime_changed {
        if multi_step {
            for step in &steps {
                let id = step.root.trim_start_matches('/').to_string();
                let description = if id == TARGET {
                    "Update to the target runtime".to_string()
                } else {
                    format!("Update to intermediate runtime {id}")
                };
                builder.add_sequential(wrapped_step(&id, description, step));
            }
        } else {
            add_step_phases(&mut builder, &steps[0]);
        }
        builder.add_sequential(migration_phase(migrations));
    }
    builder.add_sequential(app_phase(&app_updates));
    let gc_servers = &steps.last().expect("at least the target step").servers;
    builder.add_sequential(gc_phase(gc_servers, params.config.num_parallel_phases));

    let mut plan = OperationPlan {
        operation_id: operation.id,
        cluster_name: params.cluster_name.clone(),
        phases: builder.into_phases(),
        servers: params.servers.clone(),
        dns_config,
        gravity_package,
        offline_coordinator: params.leader.clone(),
    };
    resolve_plan(&mut plan);
    validate_plan(&plan)?;

    params.backend.create_operation_plan(&plan).await?;
    if let Err(err) = params.local_backend.create_operation_plan(&plan).await {
        warn!("Failed to mirror plan to the local store: {err:#}");
    }
    info!(
        "Created upgrade plan for {} with {} phases across {} steps",
        params.cluster_name,
        plan.all_phases().len(),
        step_count,
    );
    Ok(plan)
}

struct StepContext {
    is_target: bool,
    multi_step: bool,
    coredns_missing: bool,
}

#[allow(clippy::too_many_arguments)]
async fn build_step(
    params: &InitPlanParams<'_>,
    installed_docker: &DockerConfig,
    installed_app: &Application,
    update_app: &Application,
    previous_runtime: &Application,
    runtime_app: &Application,
    installed_teleport: &Locator,
    context: StepContext,
) -> Result<StepConfig> {
    let StepContext {
        is_target,
        multi_step,
        coredns_missing,
    } = context;

    let step_gravity = runtime_app
        .manifest
        .gravity_package()
        .cloned()
        .ok_or_else(|| {
            GupError::BadParameter(format!(
                "runtime app {} has no gravity dependency",
                runtime_app.package
            ))
        })?;
    let update_teleport = teleport_package_opt(&runtime_app.manifest);

    // Docker reconfiguration only applies on the target step; intermediate
    // steps pin the installed config.
    let update_docker = if is_target {
        update_app
            .manifest
            .docker()
            .cloned()
            .unwrap_or_else(|| installed_docker.clone())
    } else {
        installed_docker.clone()
    };
    let step_app_manifest = if is_target {
        &update_app.manifest
    } else {
        &installed_app.manifest
    };

    let servers = compute_update_servers(
        &UpdateConfig {
            servers: &params.servers,
            installed_app_manifest: &installed_app.manifest,
            update_app_manifest: step_app_manifest,
            installed_runtime_manifest: &previous_runtime.manifest,
            update_runtime_manifest: &runtime_app.manifest,
            installed_teleport,
            update_teleport: update_teleport.as_ref(),
            installed_docker,
            update_docker: &update_docker,
        },
        params.rotator,
    )
    .await?;

    let previous_planet = previous_runtime
        .manifest
        .runtime_package(&params.leader.node_profile)?;
    let next_planet = runtime_app
        .manifest
        .runtime_package(&params.leader.node_profile)?;
    let etcd = etcd_upgrade(params.packages, &previous_planet, &next_planet).await?;

    let runtime_updates =
        diff::runtime_updates(previous_runtime, runtime_app, params.apps).await?;

    let root = if multi_step {
        if is_target {
            format!("/{TARGET}")
        } else {
            format!("/{}", runtime_app.version())
        }
    } else {
        String::new()
    };

    Ok(StepConfig {
        root,
        changeset_id: Uuid::new_v4(),
        servers,
        leader_ip: params.leader.advertise_ip.clone(),
        etcd,
        gravity_package: step_gravity,
        runtime_app_version: (!is_target).then(|| runtime_app.version().clone()),
        runtime_updates,
        coredns: is_target && coredns_missing,
        supports_taints: runtime_app.version() >= &params.config.taints_supported_since,
        num_parallel_workers: params.config.num_parallel_workers,
        num_parallel_phases: params.config.num_parallel_phases,
    })
}

async fn base_runtime(apps: &dyn Applications, app: &Application) -> Result<Application> {
    let base = app.manifest.base.clone().ok_or_else(|| {
        GupError::Invalid(format!("application {} has no base runtime", app.package))
    })?;
    apps.get_app(&base).await
}

fn teleport_package(manifest: &Manifest) -> Result<Locator, GupError> {
    teleport_package_opt(manifest).ok_or_else(|| {
        GupError::Invalid(format!(
            "runtime app {} has no teleport dependency",
            manifest.metadata.name
        ))
    })
}

fn teleport_package_opt(manifest: &Manifest) -> Option<Locator> {
    manifest.dependencies.package(TELEPORT_PACKAGE).cloned()
}

/// Decide which data migrations apply: hub links are migrated only when
/// legacy links exist and no trusted clusters are configured yet; roles only
/// when any installed role still uses the legacy schema.
async fn applicable_migrations(params: &InitPlanParams<'_>) -> Result<Migrations> {
    let links = params
        .backend
        .get_ops_center_links(&params.cluster_name)
        .await?;
    let trusted_clusters = params.backend.get_trusted_clusters().await?;
    let roles = params.backend.get_roles().await?;
    Ok(Migrations {
        links: !links.is_empty() && trusted_clusters.is_empty(),
        roles: roles.iter().any(crate::storage::RoleRecord::is_legacy),
    })
}
