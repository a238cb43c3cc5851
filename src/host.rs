//! Host filesystem view and host command execution.
//!
//! The operator container mounts the host root filesystem (default `/host`).
//! Paths handed to host commands are in the host's view; paths opened by the
//! operator itself must be translated with [`HostPaths::outside_chroot`].

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::debug;

use crate::error::IbuError;

/// Cluster-wide registry credentials on the host.
pub const IMAGE_REGISTRY_AUTH_FILE: &str = "/var/lib/kubelet/config.json";

/// Root of ostree stateroot deployments on the host.
pub const STATEROOT_BASE: &str = "/ostree/deploy";

/// Seed data directory inside a stateroot.
pub const SEED_DATA_DIR: &str = "/var/opt/openshift";

/// Seed cluster manifest file name inside [`SEED_DATA_DIR`].
pub const SEED_CLUSTER_INFO_FILE: &str = "manifest.json";

/// Host path layout.
#[derive(Debug, Clone)]
pub struct HostPaths {
    /// Where the host root is mounted inside the container.
    pub host_root: PathBuf,
    /// Operator workspace directory in the host's view.
    pub workspace: PathBuf,
}

impl HostPaths {
    pub fn new(host_root: impl Into<PathBuf>, workspace: impl Into<PathBuf>) -> Self {
        Self {
            host_root: host_root.into(),
            workspace: workspace.into(),
        }
    }

    /// Translate a host path into the path visible from this container.
    pub fn outside_chroot(&self, path: impl AsRef<Path>) -> PathBuf {
        let path = path.as_ref();
        self.host_root
            .join(path.strip_prefix("/").unwrap_or(path))
    }

    /// Host path of a file inside the workspace.
    pub fn workspace_file(&self, name: &str) -> PathBuf {
        self.workspace.join(name)
    }

    /// Check the host mount and create the workspace directory if missing.
    pub fn ensure_ready(&self) -> Result<(), IbuError> {
        std::fs::metadata(&self.host_root).map_err(|e| {
            IbuError::Precondition(format!(
                "host dir {} does not exist: {e}",
                self.host_root.display()
            ))
        })?;

        let workspace = self.outside_chroot(&self.workspace);
        if !workspace.exists() {
            create_private_dir(&workspace).map_err(|e| {
                IbuError::Precondition(format!(
                    "failed to create workspace {}: {e}",
                    workspace.display()
                ))
            })?;
        }
        Ok(())
    }
}

fn create_private_dir(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o700)
        .create(path)
}

/// Stateroot name for a seed version. Dashes are not allowed in stateroot names.
pub fn stateroot_name(seed_version: &str) -> String {
    format!("rhcos_{}", seed_version.replace('-', "_"))
}

/// Host path of a stateroot.
pub fn stateroot_path(name: &str) -> PathBuf {
    Path::new(STATEROOT_BASE).join(name)
}

/// Host directory receiving backed-up cluster crypto for a stateroot.
pub fn stateroot_certs_dir(name: &str) -> PathBuf {
    stateroot_path(name).join("var/opt/openshift/certs")
}

/// Host path of the seed cluster manifest inside a stateroot.
pub fn seed_manifest_path(name: &str) -> PathBuf {
    stateroot_path(name)
        .join(SEED_DATA_DIR.trim_start_matches('/'))
        .join(SEED_CLUSTER_INFO_FILE)
}

/// Runs commands inside the host namespaces via `nsenter`.
#[derive(Debug, Clone, Default)]
pub struct HostExecutor;

impl HostExecutor {
    /// Execute `command args...` on the host and return its stdout.
    pub async fn execute(&self, command: &str, args: &[&str]) -> Result<String, IbuError> {
        let rendered = format!("{command} {}", args.join(" "));
        debug!(command = %rendered, "Executing host command");

        let output = Command::new("nsenter")
            .args(["--target", "1", "--cgroup", "--mount", "--ipc", "--pid", "--"])
            .arg(command)
            .args(args)
            .output()
            .await
            .map_err(|e| IbuError::Command {
                command: rendered.clone(),
                status: "spawn".to_string(),
                stderr: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(IbuError::Command {
                command: rendered,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outside_chroot() {
        let paths = HostPaths::new("/host", "/var/ibu");
        assert_eq!(
            paths.outside_chroot("/var/ibu/seed-pull-secret"),
            PathBuf::from("/host/var/ibu/seed-pull-secret")
        );
        assert_eq!(paths.outside_chroot("relative"), PathBuf::from("/host/relative"));
    }

    #[test]
    fn test_stateroot_paths() {
        let name = stateroot_name("4.14.1");
        assert_eq!(name, "rhcos_4.14.1");
        assert_eq!(
            stateroot_certs_dir(&name),
            PathBuf::from("/ostree/deploy/rhcos_4.14.1/var/opt/openshift/certs")
        );
        assert_eq!(
            seed_manifest_path(&name),
            PathBuf::from("/ostree/deploy/rhcos_4.14.1/var/opt/openshift/manifest.json")
        );

        let name = stateroot_name("4.14.0-rc.3");
        assert_eq!(name, "rhcos_4.14.0_rc.3");
        assert_eq!(
            stateroot_certs_dir(&name),
            PathBuf::from("/ostree/deploy/rhcos_4.14.0_rc.3/var/opt/openshift/certs")
        );
    }

    #[test]
    fn test_ensure_ready_creates_workspace() {
        let host = tempfile::tempdir().unwrap();
        let paths = HostPaths::new(host.path(), "/var/ibu");
        paths.ensure_ready().unwrap();
        assert!(host.path().join("var/ibu").is_dir());
        // Idempotent
        paths.ensure_ready().unwrap();
    }

    #[test]
    fn test_ensure_ready_without_host_mount() {
        let paths = HostPaths::new("/nonexistent-host-root-for-test", "/var/ibu");
        let err = paths.ensure_ready().unwrap_err();
        assert!(matches!(err, IbuError::Precondition(_)));
    }
}
