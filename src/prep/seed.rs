//! Seed image acquisition and compatibility check.

use std::collections::HashMap;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{info, warn};

use crate::crd::ImageBasedUpgrade;
use crate::error::IbuError;
use crate::host::{HostPaths, IMAGE_REGISTRY_AUTH_FILE};
use crate::ops::PrepOps;

/// Label carrying the seed image format version.
pub const SEED_FORMAT_VERSION_LABEL: &str = "com.openshift.lifecycle-agent.seed_format_version";

/// Seed format version this build understands.
pub const SEED_FORMAT_VERSION: u32 = 3;

/// Key holding registry credentials in a pull secret.
pub const DOCKER_CONFIG_KEY: &str = ".dockerconfigjson";

const PULL_SECRET_FILE: &str = "seed-pull-secret";

/// Pull secret written to the workspace for the duration of one pull.
/// The file is removed on drop.
#[derive(Debug)]
pub struct PullSecretFile {
    local: PathBuf,
    host: PathBuf,
}

impl PullSecretFile {
    pub fn write(paths: &HostPaths, contents: &[u8]) -> Result<Self> {
        let host = paths.workspace_file(PULL_SECRET_FILE);
        let local = paths.outside_chroot(&host);

        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .mode(0o600)
            .open(&local)
            .with_context(|| format!("failed to create pull secret file {}", local.display()))?;
        file.write_all(contents)
            .with_context(|| format!("failed to write pull secret file {}", local.display()))?;

        Ok(Self { local, host })
    }

    /// Path in the host's view, as passed to host commands.
    pub fn host_path(&self) -> &Path {
        &self.host
    }
}

impl Drop for PullSecretFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.local) {
            warn!(path = %self.local.display(), error = %e, "Failed to remove pull secret file");
        }
    }
}

/// Pull the seed image, with its dedicated pull secret when one is referenced.
pub async fn pull_seed_image(
    ops: &dyn PrepOps,
    paths: &HostPaths,
    namespace: &str,
    ibu: &ImageBasedUpgrade,
) -> Result<()> {
    let seed = &ibu.spec.seed_image_ref;

    let Some(secret) = &seed.pull_secret_ref else {
        info!(image = %seed.image, "Pulling seed image with cluster pull secret");
        return ops
            .pull_image(&seed.image, Path::new(IMAGE_REGISTRY_AUTH_FILE))
            .await
            .with_context(|| format!("failed to pull seed image {}", seed.image));
    };

    let data = ops
        .secret_field(&secret.name, namespace, DOCKER_CONFIG_KEY)
        .await
        .with_context(|| format!("failed to read pull secret {namespace}/{}", secret.name))?;
    let auth_file = PullSecretFile::write(paths, &data)?;

    info!(image = %seed.image, secret = %secret.name, "Pulling seed image");
    ops.pull_image(&seed.image, auth_file.host_path())
        .await
        .with_context(|| format!("failed to pull seed image {}", seed.image))
}

/// Confirm the seed image was built in the expected format.
pub fn check_seed_format(image: &str, labels: &HashMap<String, String>) -> Result<(), IbuError> {
    let Some(found) = labels.get(SEED_FORMAT_VERSION_LABEL) else {
        return Err(IbuError::IncompatibleSeed(format!(
            "image {image} has no {SEED_FORMAT_VERSION_LABEL} label"
        )));
    };

    if *found != SEED_FORMAT_VERSION.to_string() {
        return Err(IbuError::IncompatibleSeed(format!(
            "image {image} has seed format version {found}, expected {SEED_FORMAT_VERSION}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{ImageBasedUpgradeSpec, PullSecretRef, SeedImageRef, Stage};
    use crate::ops::fake::FakeOps;

    fn upgrade(pull_secret: Option<&str>) -> ImageBasedUpgrade {
        ImageBasedUpgrade::new(
            "upgrade",
            ImageBasedUpgradeSpec {
                stage: Stage::Prep,
                seed_image_ref: SeedImageRef {
                    image: "quay.io/org/seed:4.14.1".to_string(),
                    version: "4.14.1".to_string(),
                    pull_secret_ref: pull_secret.map(|name| PullSecretRef {
                        name: name.to_string(),
                    }),
                },
                auto_rollback_on_failure: None,
            },
        )
    }

    fn fake_with_workspace() -> (tempfile::TempDir, FakeOps) {
        let host = tempfile::tempdir().unwrap();
        let ops = FakeOps::new(host.path());
        ops.paths.ensure_ready().unwrap();
        (host, ops)
    }

    #[tokio::test]
    async fn test_pull_with_cluster_pull_secret() {
        let (_host, ops) = fake_with_workspace();

        pull_seed_image(&ops, &ops.paths, "ibuo", &upgrade(None)).await.unwrap();

        assert_eq!(ops.calls(), vec!["pull_image"]);
        assert!(ops.call_log()[0].contains(IMAGE_REGISTRY_AUTH_FILE));
    }

    #[tokio::test]
    async fn test_pull_secret_file_exists_only_during_pull() {
        let (host, ops) = fake_with_workspace();

        pull_seed_image(&ops, &ops.paths, "ibuo", &upgrade(Some("seed-creds")))
            .await
            .unwrap();

        assert_eq!(ops.calls(), vec!["secret_field", "pull_image"]);
        let log = ops.call_log();
        assert!(log[0].contains("ibuo/seed-creds/.dockerconfigjson"));
        // The fake records whether the auth file was present while pulling
        assert!(log[1].ends_with("/var/ibu/seed-pull-secret:true"));
        assert!(!host.path().join("var/ibu/seed-pull-secret").exists());
    }

    #[tokio::test]
    async fn test_pull_secret_file_removed_on_pull_failure() {
        let (host, mut ops) = fake_with_workspace();
        ops.fail_on = Some("pull_image");

        let err = pull_seed_image(&ops, &ops.paths, "ibuo", &upgrade(Some("seed-creds")))
            .await
            .unwrap_err();

        assert!(format!("{err:#}").contains("failed to pull seed image"));
        assert!(!host.path().join("var/ibu/seed-pull-secret").exists());
    }

    #[test]
    fn test_pull_secret_file_mode() {
        use std::os::unix::fs::PermissionsExt;

        let host = tempfile::tempdir().unwrap();
        let paths = HostPaths::new(host.path(), "/var/ibu");
        paths.ensure_ready().unwrap();

        let file = PullSecretFile::write(&paths, b"{}").unwrap();
        let local = host.path().join("var/ibu/seed-pull-secret");
        let mode = std::fs::metadata(&local).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert_eq!(file.host_path(), Path::new("/var/ibu/seed-pull-secret"));

        drop(file);
        assert!(!local.exists());
    }

    #[test]
    fn test_check_seed_format() {
        let ok = HashMap::from([(SEED_FORMAT_VERSION_LABEL.to_string(), "3".to_string())]);
        check_seed_format("seed", &ok).unwrap();

        let old = HashMap::from([(SEED_FORMAT_VERSION_LABEL.to_string(), "2".to_string())]);
        let err = check_seed_format("seed", &old).unwrap_err();
        assert!(matches!(err, IbuError::IncompatibleSeed(_)));
        assert!(err.to_string().contains("expected 3"));

        let err = check_seed_format("seed", &HashMap::new()).unwrap_err();
        assert!(err.to_string().contains("has no"));
    }

    #[test]
    fn test_check_seed_format_requires_exact_value() {
        let padded = HashMap::from([(SEED_FORMAT_VERSION_LABEL.to_string(), " 3 ".to_string())]);
        let err = check_seed_format("seed", &padded).unwrap_err();
        assert!(matches!(err, IbuError::IncompatibleSeed(_)));
    }
}
