//! Export of intermediate control binaries.
//!
//! Each intermediate step's gravity binary is written to a well-known
//! directory so agents can invoke it during the corresponding sub-plan. The
//! export is content-addressed: an existing file with the same digest is
//! left alone. Writes go through a temporary file and an atomic rename so a
//! failed export leaves no partial files.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use backon::{ExponentialBuilder, Retryable};
use sha2::{Digest, Sha256};
use tracing::{debug, info};
use uuid::Uuid;

use crate::catalog::Packages;
use crate::cluster::ServiceUser;
use crate::error::is_transient;
use crate::loc::Locator;

const BINARY_MODE: u32 = 0o755;

/// Export the gravity binary package into `dir`, returning the path of the
/// exported binary. Transient package store errors are retried with backoff.
pub async fn export_gravity_binary(
    packages: &dyn Packages,
    package: &Locator,
    dir: &Path,
    service_user: ServiceUser,
) -> Result<PathBuf> {
    let target = dir.join(format!("gravity-{}", package.version));

    let (_, payload) = (|| async { packages.read_package(package).await })
        .retry(ExponentialBuilder::default())
        .when(is_transient)
        .await
        .with_context(|| format!("failed to read gravity binary package {package}"))?;

    let digest = sha256(&payload);
    if let Ok(existing) = tokio::fs::read(&target).await
        && sha256(&existing) == digest
    {
        debug!("Binary {} already exported, digest matches", target.display());
        return Ok(target);
    }

    tokio::fs::create_dir_all(dir)
        .await
        .with_context(|| format!("failed to create export directory {}", dir.display()))?;

    let staging = dir.join(format!(".gravity-{}.{}", package.version, Uuid::new_v4()));
    if let Err(err) = write_binary(&staging, &payload, service_user).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(err);
    }
    if let Err(err) = tokio::fs::rename(&staging, &target).await {
        let _ = tokio::fs::remove_file(&staging).await;
        return Err(err).with_context(|| format!("failed to move binary to {}", target.display()));
    }

    info!("Exported {} to {}", package, target.display());
    Ok(target)
}

async fn write_binary(path: &Path, payload: &[u8], service_user: ServiceUser) -> Result<()> {
    tokio::fs::write(path, payload)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(BINARY_MODE))
        .await
        .with_context(|| format!("failed to set mode on {}", path.display()))?;
    std::os::unix::fs::chown(path, Some(service_user.uid), Some(service_user.gid))
        .with_context(|| format!("failed to chown {}", path.display()))?;
    Ok(())
}

fn sha256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}
