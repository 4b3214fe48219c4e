//! Differences between installed and target application dependency sets.
//!
//! Drives the `runtime` and `app` plan phases: a dependency appears in the
//! update list when the target bundle ships a version different from what is
//! installed (or ships a dependency that is not installed at all).

use anyhow::Result;
use tracing::debug;

use crate::app::{Application, RBAC_APP, index_by_name};
use crate::catalog::Applications;

/// Changed system applications between two runtime apps, RBAC app first.
///
/// The RBAC app ordering is an invariant: every other system app assumes its
/// access rules are already in place.
pub async fn runtime_updates(
    installed: &Application,
    update: &Application,
    apps: &dyn Applications,
) -> Result<Vec<Application>> {
    let updates = dependency_updates(installed, update, apps).await?;
    Ok(rbac_first(updates))
}

/// Changed user applications between two cluster apps, the cluster app
/// itself last.
pub async fn app_updates(
    installed: &Application,
    update: &Application,
    apps: &dyn Applications,
) -> Result<Vec<Application>> {
    let mut updates = dependency_updates(installed, update, apps).await?;
    if installed.package.version != update.package.version {
        updates.push(update.clone());
    }
    Ok(updates)
}

/// Target direct dependencies whose version differs from the installed one.
async fn dependency_updates(
    installed: &Application,
    update: &Application,
    apps: &dyn Applications,
) -> Result<Vec<Application>> {
    let installed_deps = index_by_name(&apps.get_direct_app_dependencies(installed).await?);
    let update_deps = apps.get_direct_app_dependencies(update).await?;

    let updates: Vec<Application> = update_deps
        .into_iter()
        .filter(|dep| {
            installed_deps
                .get(dep.name())
                .is_none_or(|i| i.package.version != dep.package.version)
        })
        .collect();
    debug!(
        "{} of {}'s dependencies need updating",
        updates.len(),
        update.name()
    );
    Ok(updates)
}

/// Move the RBAC app to the front, preserving the relative order of the
/// rest. A stable partition, not a sort.
pub fn rbac_first(apps: Vec<Application>) -> Vec<Application> {
    let (mut rbac, rest): (Vec<Application>, Vec<Application>) =
        apps.into_iter().partition(|a| a.name() == RBAC_APP);
    rbac.extend(rest);
    rbac
}
