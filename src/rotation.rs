//! Config-update computer.
//!
//! For each server, dry-runs the rotation of secrets, runtime-config and
//! teleport-config packages against the operator and produces an
//! [`UpdateServer`] descriptor. The computed locators are committed later by
//! the bootstrap executor; the planner itself never mutates package state.

use anyhow::{Context, Result};
use tracing::debug;

use crate::app::Manifest;
use crate::cluster::{
    DockerConfig, DockerSlot, RuntimeSlot, RuntimeUpdate, Server, TeleportSlot, TeleportUpdate,
    UpdateServer,
};
use crate::loc::Locator;

use async_trait::async_trait;

/// Dry-run secrets rotation request.
#[derive(Clone, Debug)]
pub struct RotateSecretsRequest {
    pub server: Server,
    pub runtime_package: Locator,
    pub dry_run: bool,
}

/// Dry-run runtime-config rotation request.
///
/// Carries the *installed* cluster-app manifest: manifest-driven environment
/// is computed from what is running on the node, not from the upgrade bundle.
#[derive(Clone, Debug)]
pub struct RotatePlanetConfigRequest {
    pub server: Server,
    pub runtime_package: Locator,
    pub manifest: Manifest,
    pub dry_run: bool,
}

/// Dry-run teleport-config rotation request.
#[derive(Clone, Debug)]
pub struct RotateTeleportConfigRequest {
    pub server: Server,
    pub teleport_package: Locator,
    pub dry_run: bool,
}

/// Result of a teleport config rotation; either config may be absent.
#[derive(Clone, Debug, Default)]
pub struct RotatedTeleportConfig {
    pub master_config: Option<Locator>,
    pub node_config: Option<Locator>,
}

/// Operator capability the planner depends on for package rotation.
#[async_trait]
pub trait PackageRotator: Send + Sync {
    async fn rotate_secrets(&self, req: RotateSecretsRequest) -> Result<Locator>;
    async fn rotate_planet_config(&self, req: RotatePlanetConfigRequest) -> Result<Locator>;
    async fn rotate_teleport_config(
        &self,
        req: RotateTeleportConfigRequest,
    ) -> Result<RotatedTeleportConfig>;
}

/// Inputs of the config-update computation for one upgrade step.
pub struct UpdateConfig<'a> {
    pub servers: &'a [Server],
    /// Manifest of the installed cluster app; source of runtime environment.
    pub installed_app_manifest: &'a Manifest,
    /// Manifest of the target cluster app; source of target system settings.
    pub update_app_manifest: &'a Manifest,
    /// Manifest of the installed runtime app; resolves installed planet
    /// packages per node profile.
    pub installed_runtime_manifest: &'a Manifest,
    /// Manifest of this step's target runtime app.
    pub update_runtime_manifest: &'a Manifest,
    pub installed_teleport: &'a Locator,
    pub update_teleport: Option<&'a Locator>,
    pub installed_docker: &'a DockerConfig,
    /// Target docker configuration. Intermediate steps pin this to the
    /// installed config: docker reconfiguration is a target-step concern.
    pub update_docker: &'a DockerConfig,
}

/// Compute the per-server update descriptors for one upgrade step.
///
/// `Update` slots are populated only when an update is required: planet when
/// the host-image version changes or system settings changed, teleport when
/// the teleport package version changes.
pub async fn compute_update_servers(
    config: &UpdateConfig<'_>,
    rotator: &dyn PackageRotator,
) -> Result<Vec<UpdateServer>> {
    let mut update_servers = Vec::with_capacity(config.servers.len());
    for server in config.servers {
        update_servers.push(compute_update_server(config, rotator, server).await?);
    }
    Ok(update_servers)
}

async fn compute_update_server(
    config: &UpdateConfig<'_>,
    rotator: &dyn PackageRotator,
    server: &Server,
) -> Result<UpdateServer> {
    let installed_runtime = config
        .installed_runtime_manifest
        .runtime_package(&server.node_profile)?;
    let update_runtime = config
        .update_runtime_manifest
        .runtime_package(&server.node_profile)?;

    let settings_changed = config
        .update_app_manifest
        .system_settings_changed(config.installed_app_manifest);
    let planet_needed = installed_runtime.version != update_runtime.version || settings_changed;

    let mut runtime = RuntimeSlot {
        installed: installed_runtime,
        secrets_package: None,
        update: None,
    };
    if planet_needed {
        let secrets = rotator
            .rotate_secrets(RotateSecretsRequest {
                server: server.clone(),
                runtime_package: update_runtime.clone(),
                dry_run: true,
            })
            .await
            .with_context(|| format!("failed to rotate secrets for {}", server.hostname))?;
        let config_package = rotator
            .rotate_planet_config(RotatePlanetConfigRequest {
                server: server.clone(),
                runtime_package: update_runtime.clone(),
                manifest: config.installed_app_manifest.clone(),
                dry_run: true,
            })
            .await
            .with_context(|| format!("failed to rotate planet config for {}", server.hostname))?;
        runtime.secrets_package = Some(secrets);
        runtime.update = Some(RuntimeUpdate {
            package: update_runtime,
            config_package,
        });
    }

    let mut teleport = TeleportSlot {
        installed: config.installed_teleport.clone(),
        update: None,
    };
    if let Some(update_teleport) = config.update_teleport
        && update_teleport.version != config.installed_teleport.version
    {
        let rotated = rotator
            .rotate_teleport_config(RotateTeleportConfigRequest {
                server: server.clone(),
                teleport_package: update_teleport.clone(),
                dry_run: true,
            })
            .await
            .with_context(|| {
                format!("failed to rotate teleport config for {}", server.hostname)
            })?;
        teleport.update = Some(TeleportUpdate {
            package: update_teleport.clone(),
            node_config_package: rotated.node_config,
        });
    }

    debug!(
        "Update descriptor for {}: planet={}, teleport={}",
        server.hostname,
        runtime.update.is_some(),
        teleport.update.is_some(),
    );

    Ok(UpdateServer {
        server: server.clone(),
        runtime,
        teleport,
        docker: DockerSlot {
            installed: config.installed_docker.clone(),
            update: config.update_docker.clone(),
        },
    })
}


#[cfg(test)]
mod tests {
    use super::fixtures::RecordingRotator;
    use super::*;
    use crate::app::AppKind;
    use crate::app::fixtures::{AppSpec, application};
    use crate::cluster::ClusterRole;
    use crate::cluster::fixtures::server;

    struct Setup {
        installed_app: Manifest,
        update_app: Manifest,
        installed_runtime: Manifest,
        update_runtime: Manifest,
        installed_teleport: Locator,
        update_teleport: Locator,
        docker: DockerConfig,
    }

    fn setup(update_version: &str) -> Setup {
        let app = |name: &str, version: &str, kind| {
            application(&AppSpec {
                kind,
                name,
                version,
                base: None,
                app_deps: vec![],
                package_deps: vec![],
            })
            .manifest
        };
        Setup {
            installed_app: app("example", "1.0.0", AppKind::Cluster),
            update_app: app("example", update_version, AppKind::Cluster),
            installed_runtime: app("runtime", "1.0.0", AppKind::Runtime),
            update_runtime: app("runtime", update_version, AppKind::Runtime),
            installed_teleport: Locator::local("teleport", "3.0.0").unwrap(),
            update_teleport: Locator::local("teleport", "3.2.0").unwrap(),
            docker: DockerConfig {
                storage_driver: "overlay2".to_string(),
                device: None,
            },
        }
    }

    fn config<'a>(s: &'a Setup, servers: &'a [Server]) -> UpdateConfig<'a> {
        UpdateConfig {
            servers,
            installed_app_manifest: &s.installed_app,
            update_app_manifest: &s.update_app,
            installed_runtime_manifest: &s.installed_runtime,
            update_runtime_manifest: &s.update_runtime,
            installed_teleport: &s.installed_teleport,
            update_teleport: Some(&s.update_teleport),
            installed_docker: &s.docker,
            update_docker: &s.docker,
        }
    }

    #[tokio::test]
    async fn test_compute_update_servers_with_runtime_change() {
        let s = setup("2.0.0");
        let servers = vec![server(1, ClusterRole::Master), server(2, ClusterRole::Worker)];
        let rotator = RecordingRotator::default();

        let updates = compute_update_servers(&config(&s, &servers), &rotator)
            .await
            .unwrap();

        assert_eq!(updates.len(), 2);
        for update in &updates {
            let runtime_update = update.runtime.update.as_ref().unwrap();
            assert_eq!(runtime_update.package.version.to_string(), "2.0.0");
            assert!(
                runtime_update
                    .config_package
                    .name
                    .starts_with("planet-config-")
            );
            assert!(update.runtime.secrets_package.is_some());
            let teleport_update = update.teleport.update.as_ref().unwrap();
            assert_eq!(teleport_update.package.version.to_string(), "3.2.0");
            assert!(teleport_update.node_config_package.is_some());
        }
    }

    #[tokio::test]
    async fn test_planet_config_uses_installed_manifest() {
        let s = setup("2.0.0");
        let servers = vec![server(1, ClusterRole::Master)];
        let rotator = RecordingRotator::default();

        compute_update_servers(&config(&s, &servers), &rotator)
            .await
            .unwrap();

        let requests = rotator.planet_config_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        // Env vars must come from the manifest of what is running.
        assert_eq!(
            requests[0].manifest.metadata.resource_version.to_string(),
            "1.0.0"
        );
    }

    #[tokio::test]
    async fn test_no_updates_when_versions_match() {
        let s = setup("1.0.0");
        let mut cfg_setup = s;
        cfg_setup.update_teleport = cfg_setup.installed_teleport.clone();
        let servers = vec![server(1, ClusterRole::Master)];
        let rotator = RecordingRotator::default();

        let updates = compute_update_servers(&config(&cfg_setup, &servers), &rotator)
            .await
            .unwrap();

        assert_eq!(updates.len(), 1);
        assert!(updates[0].runtime.update.is_none());
        assert!(updates[0].runtime.secrets_package.is_none());
        assert!(updates[0].teleport.update.is_none());
        assert!(!updates[0].needs_update());
        assert!(rotator.secrets_requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_settings_change_forces_planet_update() {
        let mut s = setup("1.0.0");
        // Same runtime version but the target app switches the docker driver.
        s.update_app.system_options.as_mut().unwrap().docker = Some(DockerConfig {
            storage_driver: "devicemapper".to_string(),
            device: Some("/dev/xvdb".to_string()),
        });
        let servers = vec![server(1, ClusterRole::Master)];
        let rotator = RecordingRotator::default();

        let updates = compute_update_servers(&config(&s, &servers), &rotator)
            .await
            .unwrap();

        assert!(updates[0].runtime.update.is_some());
    }

    #[tokio::test]
    async fn test_docker_slot_carries_configs() {
        let s = setup("2.0.0");
        let servers = vec![server(1, ClusterRole::Master)];
        let rotator = RecordingRotator::default();

        let updates = compute_update_servers(&config(&s, &servers), &rotator)
            .await
            .unwrap();

        assert_eq!(updates[0].docker.installed, s.docker);
        assert_eq!(updates[0].docker.update, s.docker);
    }
}
