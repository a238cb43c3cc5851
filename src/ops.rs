//! Collaborators used by the prep pipeline.
//!
//! The pipeline only talks to the outside world through [`PrepOps`].
//! [`HostOps`] is the production implementation backed by the Kubernetes API
//! and host commands.

pub mod cluster;
pub mod podman;
pub mod stateroot;

#[cfg(test)]
pub mod fake;

use std::collections::HashMap;
use std::path::Path;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::EnvVar;

use crate::crd::ImageBasedUpgrade;
use crate::host::{HostExecutor, HostPaths};
use crate::precache::{JobStatus, PrecacheConfig, SeedClusterInfo};
use crate::retry::Backoff;

#[async_trait]
pub trait PrepOps: Send + Sync {
    /// Desired version of the running cluster.
    async fn desired_cluster_version(&self) -> Result<String>;

    /// Registry hosting the running cluster's release image.
    async fn release_registry(&self) -> Result<String>;

    /// Pull an image using the given host auth file.
    async fn pull_image(&self, image: &str, auth_file: &Path) -> Result<()>;

    /// Labels of a pulled image. Errors unless exactly one image matches.
    async fn inspect_image_labels(&self, image: &str) -> Result<HashMap<String, String>>;

    /// Raw value of a key in a secret.
    async fn secret_field(&self, name: &str, namespace: &str, key: &str) -> Result<Vec<u8>>;

    /// Create the new stateroot from the seed image and write the precache
    /// image list to `image_list_file` (host path).
    async fn setup_stateroot(&self, image: &str, version: &str, image_list_file: &Path) -> Result<()>;

    /// Remove leftover rollback deployments.
    async fn cleanup_prior_deployments(&self) -> Result<()>;

    /// Persist the automatic rollback configuration for the upgrade.
    async fn write_rollback_config(&self, ibu: &ImageBasedUpgrade) -> Result<()>;

    /// Copy kubeconfig crypto material into `dest_dir` (host path).
    async fn backup_kubeconfig_crypto(&self, dest_dir: &Path) -> Result<()>;

    /// Seed cluster manifest stored in the new stateroot.
    async fn seed_cluster_info(&self, stateroot: &str) -> Result<SeedClusterInfo>;

    /// Start the precaching job. `Ok(false)` means the job was not accepted.
    async fn create_precache_job(&self, config: &PrecacheConfig) -> Result<bool>;

    /// Status of the precaching job. `Ok(None)` means the status is not available yet.
    async fn query_precache_status(&self) -> Result<Option<JobStatus>>;

    /// Literal env of a container in the operator pod (`valueFrom` entries excluded).
    async fn own_container_env(&self, container: &str) -> Result<Vec<EnvVar>>;
}

/// Production collaborators.
#[derive(Clone)]
pub struct HostOps {
    pub client: kube::Client,
    pub namespace: String,
    pub pod_name: String,
    /// Operator container, source of the precaching job image.
    pub container_name: String,
    pub paths: HostPaths,
    pub executor: HostExecutor,
    pub backoff: Backoff,
}

impl HostOps {
    pub fn new(
        client: kube::Client,
        namespace: &str,
        pod_name: &str,
        container_name: &str,
        paths: HostPaths,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            pod_name: pod_name.to_string(),
            container_name: container_name.to_string(),
            paths,
            executor: HostExecutor,
            backoff: Backoff::DEFAULT_BACKOFF,
        }
    }
}

#[async_trait]
impl PrepOps for HostOps {
    async fn desired_cluster_version(&self) -> Result<String> {
        cluster::desired_cluster_version(self).await
    }

    async fn release_registry(&self) -> Result<String> {
        cluster::release_registry(self).await
    }

    async fn pull_image(&self, image: &str, auth_file: &Path) -> Result<()> {
        podman::pull(&self.executor, image, auth_file).await
    }

    async fn inspect_image_labels(&self, image: &str) -> Result<HashMap<String, String>> {
        podman::inspect_labels(&self.executor, image).await
    }

    async fn secret_field(&self, name: &str, namespace: &str, key: &str) -> Result<Vec<u8>> {
        cluster::secret_field(self, name, namespace, key).await
    }

    async fn setup_stateroot(&self, image: &str, version: &str, image_list_file: &Path) -> Result<()> {
        stateroot::setup(&self.executor, image, version, image_list_file).await
    }

    async fn cleanup_prior_deployments(&self) -> Result<()> {
        stateroot::cleanup(&self.executor).await
    }

    async fn write_rollback_config(&self, ibu: &ImageBasedUpgrade) -> Result<()> {
        stateroot::write_rollback_config(&self.paths, ibu).await
    }

    async fn backup_kubeconfig_crypto(&self, dest_dir: &Path) -> Result<()> {
        cluster::backup_kubeconfig_crypto(self, dest_dir).await
    }

    async fn seed_cluster_info(&self, stateroot: &str) -> Result<SeedClusterInfo> {
        stateroot::read_seed_cluster_info(&self.paths, stateroot).await
    }

    async fn create_precache_job(&self, config: &PrecacheConfig) -> Result<bool> {
        cluster::create_precache_job(self, config).await
    }

    async fn query_precache_status(&self) -> Result<Option<JobStatus>> {
        cluster::query_precache_status(self).await
    }

    async fn own_container_env(&self, container: &str) -> Result<Vec<EnvVar>> {
        cluster::own_container_env(self, container).await
    }
}
