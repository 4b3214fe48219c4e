//! Version gate: decides whether the installed runtime can upgrade straight
//! to the target or must traverse intermediate runtime versions first.

use anyhow::Result;
use semver::Version;
use tracing::info;

use crate::app::{Manifest, UpgradeVia};
use crate::catalog::{Packages, intermediate_runtimes};
use crate::error::GupError;
use crate::loc::Locator;

/// Upgrade compatibility data. Normally derived from the target runtime
/// app's manifest, injectable for tests.
#[derive(Clone, Debug, Default)]
pub struct UpgradeGate {
    /// Runtime versions the target can be reached from directly.
    pub direct_upgrade_versions: Vec<Version>,
    /// Ordered intermediate hops for runtime versions without a direct path.
    pub upgrade_via_versions: Vec<UpgradeVia>,
}

impl UpgradeGate {
    pub fn from_manifest(manifest: &Manifest) -> Self {
        Self {
            direct_upgrade_versions: manifest.direct_upgrade_versions.clone(),
            upgrade_via_versions: manifest.upgrade_via_versions.clone(),
        }
    }

    /// Returns true if the given installed runtime version upgrades to the
    /// target in a single step.
    pub fn supports_direct(&self, from: &Version) -> bool {
        self.direct_upgrade_versions.contains(from)
    }

    /// The ordered intermediate runtime versions that must be traversed from
    /// the given installed version. Empty for a direct upgrade.
    pub fn upgrade_path(&self, from: &Version) -> Result<Vec<Version>, GupError> {
        if self.supports_direct(from) {
            return Ok(Vec::new());
        }
        let via = self
            .upgrade_via_versions
            .iter()
            .find(|v| &v.from == from)
            .map(|v| v.via.clone())
            .ok_or_else(|| {
                GupError::BadParameter(format!(
                    "no upgrade path from runtime version {from}"
                ))
            })?;
        match via.last() {
            Some(last) if self.supports_direct(last) => Ok(via),
            Some(last) => Err(GupError::BadParameter(format!(
                "upgrade path from {from} ends at {last} which cannot reach the target directly"
            ))),
            None => Err(GupError::BadParameter(format!(
                "empty upgrade path from runtime version {from}"
            ))),
        }
    }
}

/// Resolve the intermediate hops for this upgrade against the package store:
/// every version the gate requires must exist as a `runtime-upgrade` labelled
/// package.
pub async fn resolve_upgrade_path(
    gate: &UpgradeGate,
    installed: &Version,
    packages: &dyn Packages,
) -> Result<Vec<(Version, Locator)>> {
    let path = gate.upgrade_path(installed)?;
    if path.is_empty() {
        info!("Direct upgrade from runtime {}", installed);
        return Ok(Vec::new());
    }

    let available = intermediate_runtimes(packages).await?;
    let mut steps = Vec::with_capacity(path.len());
    for version in path {
        let locator = available.get(&version).cloned().ok_or_else(|| {
            GupError::NotFound(format!("missing intermediate runtime {version}"))
        })?;
        steps.push((version, locator));
    }
    info!(
        "Upgrade from runtime {} via {} intermediate hops",
        installed,
        steps.len()
    );
    Ok(steps)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::catalog::memory::MemoryCatalog;
    use crate::catalog::{PURPOSE_LABEL, PURPOSE_RUNTIME_UPGRADE};
    use crate::error::is_not_found;

    fn version(s: &str) -> Version {
        Version::parse(s).unwrap()
    }

    fn gate() -> UpgradeGate {
        UpgradeGate {
            direct_upgrade_versions: vec![version("2.1.0")],
            upgrade_via_versions: vec![UpgradeVia {
                from: version("1.0.0"),
                via: vec![version("2.0.0"), version("2.1.0")],
            }],
        }
    }

    fn catalog_with_runtimes(versions: &[&str]) -> MemoryCatalog {
        let mut catalog = MemoryCatalog::new();
        for v in versions {
            catalog.add_package(
                Locator::local("planet", v).unwrap(),
                BTreeMap::from([(
                    PURPOSE_LABEL.to_string(),
                    PURPOSE_RUNTIME_UPGRADE.to_string(),
                )]),
                Vec::new(),
            );
        }
        catalog
    }

    #[test]
    fn test_gate_direct_upgrade() {
        assert!(gate().supports_direct(&version("2.1.0")));
        assert!(gate().upgrade_path(&version("2.1.0")).unwrap().is_empty());
    }

    #[test]
    fn test_gate_upgrade_path() {
        let path = gate().upgrade_path(&version("1.0.0")).unwrap();
        assert_eq!(path, vec![version("2.0.0"), version("2.1.0")]);
    }

    #[test]
    fn test_gate_no_path() {
        let err = gate().upgrade_path(&version("0.5.0")).unwrap_err();
        assert!(matches!(err, GupError::BadParameter(_)));
    }

    #[test]
    fn test_gate_unreachable_target() {
        let gate = UpgradeGate {
            direct_upgrade_versions: vec![version("2.1.0")],
            upgrade_via_versions: vec![UpgradeVia {
                from: version("1.0.0"),
                via: vec![version("2.0.0")],
            }],
        };
        let err = gate.upgrade_path(&version("1.0.0")).unwrap_err();
        assert!(err.to_string().contains("cannot reach the target"));
    }

    #[tokio::test]
    async fn test_resolve_upgrade_path() {
        let catalog = catalog_with_runtimes(&["2.0.0", "2.1.0"]);
        let steps = resolve_upgrade_path(&gate(), &version("1.0.0"), &catalog)
            .await
            .unwrap();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[0].0, version("2.0.0"));
        assert_eq!(steps[0].1.to_string(), "gravitational.io/planet:2.0.0");
        assert_eq!(steps[1].0, version("2.1.0"));
    }

    #[tokio::test]
    async fn test_resolve_upgrade_path_missing_intermediate() {
        let catalog = catalog_with_runtimes(&["2.1.0"]);
        let err = resolve_upgrade_path(&gate(), &version("1.0.0"), &catalog)
            .await
            .unwrap_err();
        assert!(is_not_found(&err));
        assert!(err.to_string().contains("missing intermediate runtime 2.0.0"));
    }

    #[tokio::test]
    async fn test_resolve_upgrade_path_direct_skips_store() {
        let catalog = MemoryCatalog::new();
        let steps = resolve_upgrade_path(&gate(), &version("2.1.0"), &catalog)
            .await
            .unwrap();
        assert!(steps.is_empty());
    }
}
