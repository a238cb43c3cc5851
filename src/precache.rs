//! Image precaching job types and helpers.

pub mod poller;
pub mod wait;

use std::path::Path;

use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::EnvVar;
use serde::Deserialize;

/// Name of the precaching job and its image list `ConfigMap`.
pub const JOB_NAME: &str = "ibuo-precache";

/// Progress file written by the precaching workload (host path).
pub const PROGRESS_FILE: &str = "/var/tmp/ibuo-precache/progress";

/// Concurrent image pulls used by the precaching workload by default.
pub const DEFAULT_MAX_CONCURRENT_PULLS: u32 = 10;

/// Phase of the precaching job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Active,
    Succeeded,
    Failed,
}

impl std::fmt::Display for JobPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Active => write!(f, "Active"),
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

/// Observed status of the precaching job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobStatus {
    pub phase: JobPhase,
    /// Progress or summary report, empty when unavailable.
    pub message: String,
}

impl JobStatus {
    pub fn new(phase: JobPhase, message: impl Into<String>) -> Self {
        Self {
            phase,
            message: message.into(),
        }
    }
}

/// Precaching job parameters.
#[derive(Debug, Clone)]
pub struct PrecacheConfig {
    pub job_name: String,
    pub image_list: Vec<String>,
    pub env: Vec<EnvVar>,
    pub max_concurrent_pulls: u32,
    pub best_effort: bool,
}

impl PrecacheConfig {
    /// Config with default job name and pull settings.
    pub fn new(image_list: Vec<String>, env: Vec<EnvVar>) -> Self {
        Self {
            job_name: JOB_NAME.to_string(),
            image_list,
            env,
            max_concurrent_pulls: DEFAULT_MAX_CONCURRENT_PULLS,
            best_effort: false,
        }
    }
}

/// Cluster details recorded in the seed image when it was built.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct SeedClusterInfo {
    #[serde(default)]
    pub seed_cluster_ocp_version: String,
    #[serde(default)]
    pub release_registry: String,
    #[serde(default)]
    pub mirror_registry_configured: bool,
}

/// Registry host of an image reference.
pub fn registry_of(image: &str) -> &str {
    image.split('/').next().unwrap_or(image)
}

/// Seed image references should point at the cluster registry when the seed
/// was built without a mirror and against another registry.
pub fn should_override_registry(seed: &SeedClusterInfo, cluster_registry: &str) -> bool {
    !seed.mirror_registry_configured
        && !seed.release_registry.is_empty()
        && seed.release_registry != cluster_registry
}

/// Read the seed image list, optionally rewriting seed registry references
/// to the cluster registry.
pub async fn read_precaching_list(
    path: &Path,
    cluster_registry: &str,
    seed_registry: &str,
    override_registry: bool,
) -> Result<Vec<String>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("failed to read image list {}", path.display()))?;

    Ok(content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|image| {
            if override_registry
                && let Some(rest) = image
                    .strip_prefix(seed_registry)
                    .filter(|r| r.starts_with('/'))
            {
                return format!("{cluster_registry}{rest}");
            }
            image.to_string()
        })
        .collect())
}
