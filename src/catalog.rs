//! Read-only view of installed and candidate packages and applications.
//!
//! The planner never mutates the package store; it reads manifests,
//! dependency lists and runtime labels. Runtime labels drive two decisions:
//! `version-etcd` on a planet package is authoritative for etcd version
//! detection, and `purpose: runtime-upgrade` marks the runtimes available as
//! intermediate upgrade hops.

pub mod memory;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use semver::Version;
use tracing::debug;

use crate::app::Application;
use crate::error::{GupError, is_not_found};
use crate::loc::Locator;

/// Label carrying the purpose of a package.
pub const PURPOSE_LABEL: &str = "purpose";

/// Purpose value marking a package as an intermediate upgrade runtime.
pub const PURPOSE_RUNTIME_UPGRADE: &str = "runtime-upgrade";

/// Label carrying the etcd version bundled in a planet package, as `v<semver>`.
pub const ETCD_VERSION_LABEL: &str = "version-etcd";

/// Package metadata as stored in the package store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PackageEnvelope {
    pub locator: Locator,
    pub runtime_labels: BTreeMap<String, String>,
}

impl PackageEnvelope {
    /// Look up a runtime label; `NotFound` when absent.
    pub fn runtime_label(&self, name: &str) -> Result<&str, GupError> {
        self.runtime_labels
            .get(name)
            .map(String::as_str)
            .ok_or_else(|| GupError::NotFound(format!("label {name} on package {}", self.locator)))
    }
}

/// Read-only package store interface.
#[async_trait]
pub trait Packages: Send + Sync {
    /// Visit every package envelope in the store.
    async fn foreach_package(
        &self,
        visit: &mut (dyn for<'a> FnMut(&'a PackageEnvelope) -> Result<()> + Send),
    ) -> Result<()>;

    /// Read package metadata without the payload.
    async fn read_package_envelope(&self, loc: &Locator) -> Result<PackageEnvelope>;

    /// Read package metadata and payload.
    async fn read_package(&self, loc: &Locator) -> Result<(PackageEnvelope, Vec<u8>)>;
}

/// Read-only application catalog interface.
#[async_trait]
pub trait Applications: Send + Sync {
    async fn get_app(&self, loc: &Locator) -> Result<Application>;

    /// Resolve the applications this app directly depends on, in manifest
    /// order.
    async fn get_direct_app_dependencies(&self, app: &Application) -> Result<Vec<Application>>;
}

/// Etcd versions of one upgrade step; present only when etcd changes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EtcdUpgrade {
    /// Installed version, empty when the installed runtime carries no
    /// `version-etcd` label.
    pub installed: String,
    pub update: String,
}

/// Decide whether the step upgrades etcd by comparing the `version-etcd`
/// labels of the installed and target planet packages.
///
/// A missing label on the installed package means the version is unknown and
/// etcd must be upgraded. A missing label on the target package is an error:
/// every shipped runtime declares its etcd version.
pub async fn etcd_upgrade(
    packages: &dyn Packages,
    installed_runtime: &Locator,
    update_runtime: &Locator,
) -> Result<Option<EtcdUpgrade>> {
    let update_envelope = packages.read_package_envelope(update_runtime).await?;
    let update = parse_etcd_label(update_envelope.runtime_label(ETCD_VERSION_LABEL)?)?;

    let installed = match packages.read_package_envelope(installed_runtime).await {
        Ok(envelope) => match envelope.runtime_label(ETCD_VERSION_LABEL) {
            Ok(label) => Some(parse_etcd_label(label)?),
            Err(err) if err.is_not_found() => None,
            Err(err) => return Err(err.into()),
        },
        Err(err) if is_not_found(&err) => None,
        Err(err) => return Err(err),
    };

    match installed {
        Some(installed) if installed == update => Ok(None),
        Some(installed) => Ok(Some(EtcdUpgrade { installed, update })),
        None => {
            debug!(
                "No {} label on {}, assuming etcd upgrade is required",
                ETCD_VERSION_LABEL, installed_runtime
            );
            Ok(Some(EtcdUpgrade {
                installed: String::new(),
                update,
            }))
        }
    }
}

/// Parse a `version-etcd` label value of the form `v<semver>`.
fn parse_etcd_label(value: &str) -> Result<String> {
    let version = value.strip_prefix('v').unwrap_or(value);
    Version::parse(version)
        .map_err(|e| GupError::Invalid(format!("etcd version label {value:?}: {e}")))?;
    Ok(version.to_string())
}

/// Discover intermediate upgrade runtimes in the package store, keyed by the
/// runtime semver declared in the `purpose: runtime-upgrade` label value and
/// sorted ascending.
pub async fn intermediate_runtimes(
    packages: &dyn Packages,
) -> Result<BTreeMap<Version, Locator>> {
    let mut found = BTreeMap::new();
    packages
        .foreach_package(&mut |envelope| {
            let Ok(purpose) = envelope.runtime_label(PURPOSE_LABEL) else {
                return Ok(());
            };
            if purpose == PURPOSE_RUNTIME_UPGRADE {
                found.insert(envelope.locator.version.clone(), envelope.locator.clone());
            }
            Ok(())
        })
        .await?;
    debug!("Discovered {} intermediate upgrade runtimes", found.len());
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryCatalog;
    use super::*;

    fn catalog_with_planets(installed_label: Option<&str>, update_label: &str) -> MemoryCatalog {
        let mut catalog = MemoryCatalog::new();
        let mut labels = BTreeMap::new();
        if let Some(label) = installed_label {
            labels.insert(ETCD_VERSION_LABEL.to_string(), label.to_string());
        }
        catalog.add_package(
            Locator::local("planet", "1.0.0").unwrap(),
            labels,
            Vec::new(),
        );
        catalog.add_package(
            Locator::local("planet", "2.0.0").unwrap(),
            BTreeMap::from([(ETCD_VERSION_LABEL.to_string(), update_label.to_string())]),
            Vec::new(),
        );
        catalog
    }

    #[tokio::test]
    async fn test_etcd_upgrade_version_change() {
        let catalog = catalog_with_planets(Some("v3.3.2"), "v3.3.3");
        let upgrade = etcd_upgrade(
            &catalog,
            &Locator::local("planet", "1.0.0").unwrap(),
            &Locator::local("planet", "2.0.0").unwrap(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(upgrade.installed, "3.3.2");
        assert_eq!(upgrade.update, "3.3.3");
    }

    #[tokio::test]
    async fn test_etcd_upgrade_no_change() {
        let catalog = catalog_with_planets(Some("v3.3.3"), "v3.3.3");
        let upgrade = etcd_upgrade(
            &catalog,
            &Locator::local("planet", "1.0.0").unwrap(),
            &Locator::local("planet", "2.0.0").unwrap(),
        )
        .await
        .unwrap();
        assert!(upgrade.is_none());
    }

    #[tokio::test]
    async fn test_etcd_upgrade_missing_installed_label() {
        let catalog = catalog_with_planets(None, "v3.3.3");
        let upgrade = etcd_upgrade(
            &catalog,
            &Locator::local("planet", "1.0.0").unwrap(),
            &Locator::local("planet", "2.0.0").unwrap(),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(upgrade.installed, "");
        assert_eq!(upgrade.update, "3.3.3");
    }

    #[tokio::test]
    async fn test_etcd_upgrade_invalid_label() {
        let catalog = catalog_with_planets(Some("v3.3.2"), "vnot-semver");
        let err = etcd_upgrade(
            &catalog,
            &Locator::local("planet", "1.0.0").unwrap(),
            &Locator::local("planet", "2.0.0").unwrap(),
        )
        .await
        .unwrap_err();
        assert!(err.to_string().contains("invalid"));
    }

    #[tokio::test]
    async fn test_intermediate_runtimes_sorted() {
        let mut catalog = MemoryCatalog::new();
        for version in ["2.1.0", "2.0.0"] {
            catalog.add_package(
                Locator::local("planet", version).unwrap(),
                BTreeMap::from([(
                    PURPOSE_LABEL.to_string(),
                    PURPOSE_RUNTIME_UPGRADE.to_string(),
                )]),
                Vec::new(),
            );
        }
        catalog.add_package(
            Locator::local("planet", "3.0.0").unwrap(),
            BTreeMap::new(),
            Vec::new(),
        );

        let found = intermediate_runtimes(&catalog).await.unwrap();
        let versions: Vec<String> = found.keys().map(ToString::to_string).collect();
        assert_eq!(versions, vec!["2.0.0", "2.1.0"]);
    }

    #[tokio::test]
    async fn test_intermediate_runtimes_empty() {
        let catalog = MemoryCatalog::new();
        let found = intermediate_runtimes(&catalog).await.unwrap();
        assert!(found.is_empty());
    }

    #[test]
    fn test_envelope_runtime_label_not_found() {
        let envelope = PackageEnvelope {
            locator: Locator::local("planet", "1.0.0").unwrap(),
            runtime_labels: BTreeMap::new(),
        };
        let err = envelope.runtime_label("purpose").unwrap_err();
        assert!(err.is_not_found());
    }
}
