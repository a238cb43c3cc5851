//! In-memory [`PrepOps`] for tests. Records every call and replays scripted
//! precaching job statuses.

use std::collections::{HashMap, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::{Result, bail};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::EnvVar;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use super::PrepOps;
use crate::crd::ImageBasedUpgrade;
use crate::error::IbuError;
use crate::host::HostPaths;
use crate::precache::{JobStatus, PrecacheConfig, SeedClusterInfo};
use crate::prep::seed::{SEED_FORMAT_VERSION, SEED_FORMAT_VERSION_LABEL};

/// Scripted answer of a precaching status query.
#[derive(Debug, Clone)]
pub enum StatusReply {
    Status(JobStatus),
    Pending,
    Error(String),
    JobFailed,
}

pub struct FakeOps {
    pub paths: HostPaths,
    pub cluster_version: String,
    pub release_registry: String,
    pub labels: HashMap<String, String>,
    pub seed_info: SeedClusterInfo,
    pub image_list: Vec<String>,
    pub job_accepted: bool,
    /// Name of the operation that fails.
    pub fail_on: Option<&'static str>,
    /// When set, `pull_image` waits for a notification before returning.
    pub pull_gate: Option<Arc<Notify>>,
    /// Token cancelled when the named operation is called.
    pub cancel_on: Option<(&'static str, CancellationToken)>,
    statuses: Mutex<VecDeque<StatusReply>>,
    calls: Mutex<Vec<String>>,
    precache_config: Mutex<Option<PrecacheConfig>>,
}

impl FakeOps {
    /// Fake whose host root is `host_root`, describing a valid upgrade from 4.13.0.
    pub fn new(host_root: &Path) -> Self {
        Self {
            paths: HostPaths::new(host_root, "/var/ibu"),
            cluster_version: "4.13.0".to_string(),
            release_registry: "quay.io".to_string(),
            labels: HashMap::from([(
                SEED_FORMAT_VERSION_LABEL.to_string(),
                SEED_FORMAT_VERSION.to_string(),
            )]),
            seed_info: SeedClusterInfo {
                seed_cluster_ocp_version: "4.14.1".to_string(),
                release_registry: "quay.io".to_string(),
                mirror_registry_configured: false,
            },
            image_list: vec![
                "quay.io/openshift-release-dev/ocp-v4.0-art-dev@sha256:1".to_string(),
                "quay.io/openshift-release-dev/ocp-v4.0-art-dev@sha256:2".to_string(),
            ],
            job_accepted: true,
            fail_on: None,
            pull_gate: None,
            cancel_on: None,
            statuses: Mutex::new(VecDeque::new()),
            calls: Mutex::new(Vec::new()),
            precache_config: Mutex::new(None),
        }
    }

    pub fn with_statuses(self, statuses: impl IntoIterator<Item = StatusReply>) -> Self {
        *self.statuses.lock().unwrap() = statuses.into_iter().collect();
        self
    }

    /// Operation names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.split(':').next().unwrap_or_default().to_string())
            .collect()
    }

    /// Full call records, including arguments.
    pub fn call_log(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, op: &str) -> usize {
        self.calls().iter().filter(|c| *c == op).count()
    }

    pub fn precache_config(&self) -> Option<PrecacheConfig> {
        self.precache_config.lock().unwrap().clone()
    }

    fn record(&self, op: &'static str, detail: String) -> Result<()> {
        self.calls.lock().unwrap().push(format!("{op}:{detail}"));
        if let Some((name, token)) = &self.cancel_on
            && *name == op
        {
            token.cancel();
        }
        if self.fail_on == Some(op) {
            bail!("{op} failed");
        }
        Ok(())
    }
}

#[async_trait]
impl PrepOps for FakeOps {
    async fn desired_cluster_version(&self) -> Result<String> {
        self.record("desired_cluster_version", String::new())?;
        Ok(self.cluster_version.clone())
    }

    async fn release_registry(&self) -> Result<String> {
        self.record("release_registry", String::new())?;
        Ok(self.release_registry.clone())
    }

    async fn pull_image(&self, image: &str, auth_file: &Path) -> Result<()> {
        let local = self.paths.outside_chroot(auth_file);
        let auth_present = local.exists();
        self.record(
            "pull_image",
            format!("{image}:{}:{auth_present}", auth_file.display()),
        )?;
        if let Some(gate) = &self.pull_gate {
            gate.notified().await;
        }
        Ok(())
    }

    async fn inspect_image_labels(&self, image: &str) -> Result<HashMap<String, String>> {
        self.record("inspect_image_labels", image.to_string())?;
        Ok(self.labels.clone())
    }

    async fn secret_field(&self, name: &str, namespace: &str, key: &str) -> Result<Vec<u8>> {
        self.record("secret_field", format!("{namespace}/{name}/{key}"))?;
        Ok(br#"{"auths":{}}"#.to_vec())
    }

    async fn setup_stateroot(&self, image: &str, version: &str, image_list_file: &Path) -> Result<()> {
        self.record("setup_stateroot", format!("{image}:{version}"))?;
        let local = self.paths.outside_chroot(image_list_file);
        if let Some(parent) = local.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(local, self.image_list.join("\n"))?;
        Ok(())
    }

    async fn cleanup_prior_deployments(&self) -> Result<()> {
        self.record("cleanup_prior_deployments", String::new())
    }

    async fn write_rollback_config(&self, _ibu: &ImageBasedUpgrade) -> Result<()> {
        self.record("write_rollback_config", String::new())
    }

    async fn backup_kubeconfig_crypto(&self, dest_dir: &Path) -> Result<()> {
        self.record("backup_kubeconfig_crypto", dest_dir.display().to_string())
    }

    async fn seed_cluster_info(&self, stateroot: &str) -> Result<SeedClusterInfo> {
        self.record("seed_cluster_info", stateroot.to_string())?;
        Ok(self.seed_info.clone())
    }

    async fn create_precache_job(&self, config: &PrecacheConfig) -> Result<bool> {
        self.record("create_precache_job", config.image_list.len().to_string())?;
        *self.precache_config.lock().unwrap() = Some(config.clone());
        Ok(self.job_accepted)
    }

    async fn query_precache_status(&self) -> Result<Option<JobStatus>> {
        self.record("query_precache_status", String::new())?;
        let reply = self.statuses.lock().unwrap().pop_front();
        match reply {
            Some(StatusReply::Status(status)) => Ok(Some(status)),
            Some(StatusReply::Pending) | None => Ok(None),
            Some(StatusReply::Error(message)) => bail!(message),
            Some(StatusReply::JobFailed) => Err(IbuError::PrecacheFailed.into()),
        }
    }

    async fn own_container_env(&self, container: &str) -> Result<Vec<EnvVar>> {
        self.record("own_container_env", container.to_string())?;
        Ok(vec![EnvVar {
            name: "HTTP_PROXY".to_string(),
            value: Some("http://proxy:3128".to_string()),
            ..Default::default()
        }])
    }
}
