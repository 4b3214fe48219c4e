//! Application manifests.
//!
//! An application is a package carrying a YAML manifest. The cluster app is
//! the user-facing bundle; its `base` points at the runtime app (the system
//! bundle with Kubernetes, etcd and the planet host image); both declare
//! dependencies on further system applications.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

use crate::cluster::{DockerConfig, ServiceUser};
use crate::error::GupError;
use crate::loc::Locator;

/// Name of the control binary package every runtime app depends on.
pub const GRAVITY_PACKAGE: &str = "gravity";

/// Name of the RBAC bootstrap app. It is always upgraded before any other
/// system application.
pub const RBAC_APP: &str = "rbac-app";

/// Kind of an application manifest.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AppKind {
    /// User-facing cluster application.
    Cluster,
    /// System bundle the cluster app is based on.
    Runtime,
    /// Dependent system or user application.
    Application,
}

/// Manifest metadata.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppMetadata {
    pub name: String,
    pub resource_version: Version,
}

/// Per-profile node configuration.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeProfile {
    pub name: String,
    /// Host-image package override for nodes with this profile.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_package: Option<Locator>,
}

/// System-wide options of a manifest.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SystemOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub docker: Option<DockerConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_user: Option<ServiceUser>,
    /// Default host-image package for profiles without an override.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_package: Option<Locator>,
}

/// Declared dependencies of an application.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Dependencies {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub apps: Vec<Locator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub packages: Vec<Locator>,
}

impl Dependencies {
    /// Find a package dependency by name.
    pub fn package(&self, name: &str) -> Option<&Locator> {
        self.packages.iter().find(|p| p.name == name)
    }
}

/// Upgrade path table: runtime versions that must be traversed when
/// upgrading from the given version.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeVia {
    pub from: Version,
    pub via: Vec<Version>,
}

/// Application manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub kind: AppKind,
    pub metadata: AppMetadata,
    /// Runtime app this application is based on (cluster apps only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<Locator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub node_profiles: Vec<NodeProfile>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_options: Option<SystemOptions>,
    #[serde(default)]
    pub dependencies: Dependencies,
    /// Runtime versions upgradable to this version directly.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub direct_upgrade_versions: Vec<Version>,
    /// Upgrade paths for runtime versions that need intermediate hops.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub upgrade_via_versions: Vec<UpgradeVia>,
}

impl Manifest {
    /// Parse a manifest from its YAML representation.
    pub fn parse(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).context("failed to parse application manifest")
    }

    /// Resolve the host-image (planet) package for the given node profile:
    /// profile override first, then the manifest-wide default.
    pub fn runtime_package(&self, node_profile: &str) -> Result<Locator, GupError> {
        if let Some(profile) = self.node_profiles.iter().find(|p| p.name == node_profile)
            && let Some(package) = &profile.runtime_package
        {
            return Ok(package.clone());
        }
        self.system_options
            .as_ref()
            .and_then(|o| o.runtime_package.clone())
            .ok_or_else(|| {
                GupError::NotFound(format!(
                    "runtime package for node profile {node_profile:?} in {}",
                    self.metadata.name
                ))
            })
    }

    /// Returns true when system-level settings differ from the installed
    /// manifest in a way that requires a runtime reconfiguration.
    pub fn system_settings_changed(&self, installed: &Self) -> bool {
        let options = self.system_options.clone().unwrap_or_default();
        let installed_options = installed.system_options.clone().unwrap_or_default();
        options.docker != installed_options.docker
            || options.service_user != installed_options.service_user
    }

    /// The gravity control binary this runtime app ships.
    pub fn gravity_package(&self) -> Option<&Locator> {
        self.dependencies.package(GRAVITY_PACKAGE)
    }

    pub fn docker(&self) -> Option<&DockerConfig> {
        self.system_options.as_ref().and_then(|o| o.docker.as_ref())
    }

    pub fn service_user(&self) -> Option<ServiceUser> {
        self.system_options.as_ref().and_then(|o| o.service_user)
    }
}

/// A package together with its parsed manifest.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub package: Locator,
    pub manifest: Manifest,
}

impl Application {
    pub fn name(&self) -> &str {
        &self.package.name
    }

    pub fn version(&self) -> &Version {
        &self.package.version
    }
}

/// Index applications by package name, preserving nothing but the last entry
/// per name. Used to diff installed against target dependency sets.
pub fn index_by_name(apps: &[Application]) -> BTreeMap<String, Application> {
    apps.iter()
        .map(|a| (a.package.name.clone(), a.clone()))
        .collect()
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub struct AppSpec<'a> {
        pub kind: AppKind,
        pub name: &'a str,
        pub version: &'a str,
        pub base: Option<Locator>,
        pub app_deps: Vec<Locator>,
        pub package_deps: Vec<Locator>,
    }

    pub fn application(spec: &AppSpec<'_>) -> Application {
        Application {
            package: Locator::local(spec.name, spec.version).unwrap(),
            manifest: Manifest {
                kind: spec.kind,
                metadata: AppMetadata {
                    name: spec.name.to_string(),
                    resource_version: Version::parse(spec.version).unwrap(),
                },
                base: spec.base.clone(),
                node_profiles: vec![],
                system_options: Some(SystemOptions {
                    docker: Some(DockerConfig {
                        storage_driver: "overlay2".to_string(),
                        device: None,
                    }),
                    service_user: Some(ServiceUser { uid: 1000, gid: 1000 }),
                    runtime_package: Some(
                        Locator::local("planet", spec.version).unwrap(),
                    ),
                }),
                dependencies: Dependencies {
                    apps: spec.app_deps.clone(),
                    packages: spec.package_deps.clone(),
                },
                direct_upgrade_versions: vec![],
                upgrade_via_versions: vec![],
            },
        }
    }
}
