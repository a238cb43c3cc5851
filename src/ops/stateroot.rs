//! Stateroot provisioning with ostree on the host.

use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::{info, warn};

use crate::crd::{AutoRollbackConfig, ImageBasedUpgrade};
use crate::host::{HostExecutor, HostPaths, seed_manifest_path, stateroot_name};
use crate::precache::SeedClusterInfo;

/// Workspace file holding the rollback settings of the pending upgrade.
pub const ROLLBACK_CONFIG_FILE: &str = "auto-rollback-config.json";

/// Image list file shipped in the seed image.
const SEED_IMAGE_LIST: &str = "var/tmp/containers.list";

#[derive(Debug, Serialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
struct RollbackConfig {
    init_monitor_enabled: bool,
    init_monitor_timeout_seconds: u64,
}

impl From<Option<&AutoRollbackConfig>> for RollbackConfig {
    fn from(config: Option<&AutoRollbackConfig>) -> Self {
        let config = config.cloned().unwrap_or_default();
        Self {
            init_monitor_enabled: true,
            init_monitor_timeout_seconds: config.init_monitor_timeout_seconds,
        }
    }
}

/// Deploy the seed image as a new stateroot and copy its image list to
/// `image_list_file`. The seed image is always unmounted afterwards.
pub async fn setup(executor: &HostExecutor, image: &str, version: &str, image_list_file: &Path) -> Result<()> {
    let stateroot = stateroot_name(version);

    let mount = executor
        .execute("podman", &["image", "mount", image])
        .await
        .context("failed to mount seed image")?;
    let mount = mount.trim().to_string();

    let result = deploy(executor, image, &stateroot, &mount, image_list_file).await;

    if let Err(e) = executor.execute("podman", &["image", "unmount", image]).await {
        warn!(image, error = %e, "Failed to unmount seed image");
    }
    result
}

async fn deploy(
    executor: &HostExecutor,
    image: &str,
    stateroot: &str,
    mount: &str,
    image_list_file: &Path,
) -> Result<()> {
    let seed_list = format!("{}/{SEED_IMAGE_LIST}", mount.trim_end_matches('/'));
    let image_list_file = image_list_file.to_string_lossy();
    executor
        .execute("cp", &[&seed_list, &image_list_file])
        .await
        .context("failed to copy seed image list")?;

    executor
        .execute("ostree", &["admin", "os-init", stateroot])
        .await
        .with_context(|| format!("failed to initialize stateroot {stateroot}"))?;

    let imgref = format!("ostree-unverified-image:containers-storage:{image}");
    executor
        .execute(
            "ostree",
            &["container", "image", "deploy", "--stateroot", stateroot, "--imgref", &imgref],
        )
        .await
        .with_context(|| format!("failed to deploy seed image into {stateroot}"))?;

    info!(stateroot, "Deployed seed image");
    Ok(())
}

/// Remove the rollback deployment left by a previous upgrade.
pub async fn cleanup(executor: &HostExecutor) -> Result<()> {
    executor
        .execute("rpm-ostree", &["cleanup", "-b"])
        .await
        .context("failed to remove rollback deployment")?;
    Ok(())
}

pub async fn write_rollback_config(paths: &HostPaths, ibu: &ImageBasedUpgrade) -> Result<()> {
    let config = RollbackConfig::from(ibu.spec.auto_rollback_on_failure.as_ref());
    let file = paths.outside_chroot(paths.workspace_file(ROLLBACK_CONFIG_FILE));
    let content = serde_json::to_vec_pretty(&config)?;
    tokio::fs::write(&file, content)
        .await
        .with_context(|| format!("failed to write {}", file.display()))?;
    Ok(())
}

pub async fn read_seed_cluster_info(paths: &HostPaths, stateroot: &str) -> Result<SeedClusterInfo> {
    let file = paths.outside_chroot(seed_manifest_path(stateroot));
    let content = tokio::fs::read(&file)
        .await
        .with_context(|| format!("failed to read seed manifest {}", file.display()))?;
    serde_json::from_slice(&content)
        .with_context(|| format!("failed to parse seed manifest {}", file.display()))
}
