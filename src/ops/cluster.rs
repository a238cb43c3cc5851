//! Kubernetes-backed operations of [`HostOps`].
//!
//! Every API call goes through the transient-error retry policy.

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::Path;

use anyhow::{Context, Result, anyhow};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{ConfigMap, Container, EnvVar, Pod, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Api;
use kube::api::{DeleteParams, PostParams};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use serde::de::DeserializeOwned;
use tracing::{debug, info, warn};

use super::HostOps;
use crate::error::IbuError;
use crate::precache::{JobPhase, JobStatus, PROGRESS_FILE, PrecacheConfig, registry_of};
use crate::retry::retry_transient;

const CLUSTER_VERSION_NAME: &str = "version";

const ADMIN_CA_NAMESPACE: &str = "openshift-config";
const ADMIN_CA_CONFIGMAP: &str = "admin-kubeconfig-client-ca";
const ADMIN_CA_KEY: &str = "ca-bundle.crt";

const SIGNER_NAMESPACE: &str = "openshift-kube-apiserver-operator";
const SIGNER_SECRETS: [&str; 3] = [
    "loadbalancer-serving-signer",
    "localhost-serving-signer",
    "service-network-serving-signer",
];
const SIGNER_KEY: &str = "tls.key";

/// Mount point of the image list inside the precaching job.
const IMAGE_LIST_MOUNT: &str = "/etc/ibuo-precache";
const IMAGE_LIST_KEY: &str = "images";

async fn get<K>(ops: &HostOps, api: &Api<K>, name: &str, component: &str) -> Result<K, IbuError>
where
    K: Clone + DeserializeOwned + Debug,
{
    retry_transient(&ops.backoff, || async move {
        api.get(name).await.map_err(|e| IbuError::kube(component, e))
    })
    .await
}

fn cluster_version_api(ops: &HostOps) -> Api<DynamicObject> {
    let gvk = GroupVersionKind::gvk("config.openshift.io", "v1", "ClusterVersion");
    Api::all_with(ops.client.clone(), &ApiResource::from_gvk(&gvk))
}

async fn desired_release(ops: &HostOps) -> Result<serde_json::Value> {
    let api = cluster_version_api(ops);
    let cv = get(ops, &api, CLUSTER_VERSION_NAME, "clusterversions").await?;
    cv.data
        .pointer("/status/desired")
        .cloned()
        .ok_or_else(|| anyhow!("ClusterVersion has no desired release"))
}

pub async fn desired_cluster_version(ops: &HostOps) -> Result<String> {
    let desired = desired_release(ops).await?;
    let version = desired
        .get("version")
        .and_then(serde_json::Value::as_str)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| anyhow!("ClusterVersion desired release has no version"))?;
    debug!(version, "Desired cluster version");
    Ok(version.to_string())
}

pub async fn release_registry(ops: &HostOps) -> Result<String> {
    let desired = desired_release(ops).await?;
    let image = desired
        .get("image")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| anyhow!("ClusterVersion desired release has no image"))?;
    Ok(registry_of(image).to_string())
}

pub async fn secret_field(ops: &HostOps, name: &str, namespace: &str, key: &str) -> Result<Vec<u8>> {
    let api: Api<Secret> = Api::namespaced(ops.client.clone(), namespace);
    let secret = get(ops, &api, name, "secrets").await?;
    secret
        .data
        .and_then(|mut data| data.remove(key))
        .map(|value| value.0)
        .ok_or_else(|| anyhow!("secret {namespace}/{name} has no key {key}"))
}

async fn configmap_field(ops: &HostOps, name: &str, namespace: &str, key: &str) -> Result<String> {
    let api: Api<ConfigMap> = Api::namespaced(ops.client.clone(), namespace);
    let cm = get(ops, &api, name, "configmaps").await?;
    cm.data
        .and_then(|mut data| data.remove(key))
        .ok_or_else(|| anyhow!("configmap {namespace}/{name} has no key {key}"))
}

pub async fn backup_kubeconfig_crypto(ops: &HostOps, dest_dir: &Path) -> Result<()> {
    let local_dir = ops.paths.outside_chroot(dest_dir);
    tokio::fs::create_dir_all(&local_dir)
        .await
        .with_context(|| format!("failed to create {}", local_dir.display()))?;

    let ca_bundle = configmap_field(ops, ADMIN_CA_CONFIGMAP, ADMIN_CA_NAMESPACE, ADMIN_CA_KEY).await?;
    let ca_file = local_dir.join(format!("{ADMIN_CA_CONFIGMAP}.crt"));
    tokio::fs::write(&ca_file, ca_bundle)
        .await
        .with_context(|| format!("failed to write {}", ca_file.display()))?;

    for signer in SIGNER_SECRETS {
        let key = secret_field(ops, signer, SIGNER_NAMESPACE, SIGNER_KEY).await?;
        let key_file = local_dir.join(format!("{signer}.key"));
        tokio::fs::write(&key_file, key)
            .await
            .with_context(|| format!("failed to write {}", key_file.display()))?;
    }

    info!(dir = %dest_dir.display(), "Backed up kubeconfig crypto");
    Ok(())
}

async fn own_container(ops: &HostOps, container: &str) -> Result<Container> {
    let api: Api<Pod> = Api::namespaced(ops.client.clone(), &ops.namespace);
    let pod = get(ops, &api, &ops.pod_name, "pods").await?;
    pod.spec
        .into_iter()
        .flat_map(|spec| spec.containers)
        .find(|c| c.name == container)
        .ok_or_else(|| anyhow!("container {container} not found in pod {}", ops.pod_name))
}

pub async fn own_container_env(ops: &HostOps, container: &str) -> Result<Vec<EnvVar>> {
    let env = own_container(ops, container).await?.env.unwrap_or_default();
    Ok(literal_env(env))
}

/// Drop entries sourced indirectly (`valueFrom`).
fn literal_env(env: Vec<EnvVar>) -> Vec<EnvVar> {
    env.into_iter().filter(|e| e.value_from.is_none()).collect()
}

/// Text of a Kubernetes error for status-code matching.
fn error_text(e: &IbuError) -> String {
    e.to_string().to_lowercase()
}

fn is_not_found(e: &IbuError) -> bool {
    let text = error_text(e);
    text.contains("notfound") || text.contains("not found") || text.contains("code: 404")
}

fn is_already_exists(e: &IbuError) -> bool {
    let text = error_text(e);
    text.contains("alreadyexists") || text.contains("already exists")
}

pub async fn create_precache_job(ops: &HostOps, config: &PrecacheConfig) -> Result<bool> {
    let image = own_container(ops, &ops.container_name)
        .await?
        .image
        .ok_or_else(|| anyhow!("operator container {} has no image", ops.container_name))?;

    let configmaps: Api<ConfigMap> = Api::namespaced(ops.client.clone(), &ops.namespace);
    let jobs: Api<Job> = Api::namespaced(ops.client.clone(), &ops.namespace);

    delete_if_exists(ops, &jobs, &config.job_name, "jobs").await?;
    delete_if_exists(ops, &configmaps, &config.job_name, "configmaps").await?;

    let cm = image_list_configmap(config, &ops.namespace);
    let cm = &cm;
    let configmaps = &configmaps;
    retry_transient(&ops.backoff, || async move {
        configmaps
            .create(&PostParams::default(), cm)
            .await
            .map_err(|e| IbuError::kube("configmaps", e))
    })
    .await?;

    let job = precache_job(config, &ops.namespace, &image)?;
    let job = &job;
    let jobs = &jobs;
    match retry_transient(&ops.backoff, || async move {
        jobs.create(&PostParams::default(), job)
            .await
            .map_err(|e| IbuError::kube("jobs", e))
    })
    .await
    {
        Ok(_) => {
            info!(job = %config.job_name, images = config.image_list.len(), "Created precaching job");
            Ok(true)
        }
        Err(e) if is_already_exists(&e) => {
            warn!(job = %config.job_name, error = %e, "Precaching job still exists");
            Ok(false)
        }
        Err(e) => Err(e.into()),
    }
}

async fn delete_if_exists<K>(ops: &HostOps, api: &Api<K>, name: &str, component: &str) -> Result<(), IbuError>
where
    K: Clone + DeserializeOwned + Debug,
{
    let result = retry_transient(&ops.backoff, || async move {
        api.delete(name, &DeleteParams::background())
            .await
            .map_err(|e| IbuError::kube(component, e))
    })
    .await;

    match result {
        Ok(_) => {
            debug!(name, component, "Deleted leftover precaching object");
            Ok(())
        }
        Err(e) if is_not_found(&e) => Ok(()),
        Err(e) => Err(e),
    }
}

fn image_list_configmap(config: &PrecacheConfig, namespace: &str) -> ConfigMap {
    ConfigMap {
        metadata: ObjectMeta {
            name: Some(config.job_name.clone()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: Some(BTreeMap::from([(
            IMAGE_LIST_KEY.to_string(),
            config.image_list.join("\n"),
        )])),
        ..Default::default()
    }
}

fn precache_job(config: &PrecacheConfig, namespace: &str, image: &str) -> Result<Job> {
    let mut env = config.env.clone();
    env.extend([
        literal("PRECACHE_IMAGE_LIST_FILE", format!("{IMAGE_LIST_MOUNT}/{IMAGE_LIST_KEY}")),
        literal("PRECACHE_PROGRESS_FILE", PROGRESS_FILE.to_string()),
        literal("MAX_CONCURRENT_PULLS", config.max_concurrent_pulls.to_string()),
        literal("PRECACHE_BEST_EFFORT", config.best_effort.to_string()),
    ]);

    let job = serde_json::json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": config.job_name,
            "namespace": namespace,
            "labels": { "app.kubernetes.io/managed-by": "ibuo" },
        },
        "spec": {
            "backoffLimit": 0,
            "template": {
                "metadata": {
                    "labels": { "app.kubernetes.io/managed-by": "ibuo" },
                },
                "spec": {
                    "restartPolicy": "Never",
                    "hostPID": true,
                    "containers": [{
                        "name": "precache",
                        "image": image,
                        "command": ["ibuo-precache"],
                        "env": env,
                        "securityContext": { "privileged": true },
                        "volumeMounts": [
                            { "name": "host", "mountPath": "/host" },
                            { "name": "image-list", "mountPath": IMAGE_LIST_MOUNT, "readOnly": true },
                        ],
                    }],
                    "volumes": [
                        { "name": "host", "hostPath": { "path": "/", "type": "Directory" } },
                        { "name": "image-list", "configMap": { "name": config.job_name } },
                    ],
                },
            },
        },
    });

    serde_json::from_value(job).context("failed to build precaching job")
}

fn literal(name: &str, value: String) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value),
        ..Default::default()
    }
}

pub async fn query_precache_status(ops: &HostOps) -> Result<Option<JobStatus>> {
    let jobs: Api<Job> = Api::namespaced(ops.client.clone(), &ops.namespace);
    let jobs = &jobs;
    let job = retry_transient(&ops.backoff, || async move {
        jobs.get_opt(crate::precache::JOB_NAME)
            .await
            .map_err(|e| IbuError::kube("jobs", e))
    })
    .await?;

    let Some(phase) = job.as_ref().and_then(job_phase) else {
        return Ok(None);
    };

    let progress_file = ops.paths.outside_chroot(PROGRESS_FILE);
    let message = tokio::fs::read_to_string(&progress_file)
        .await
        .map(|s| s.trim().to_string())
        .unwrap_or_default();

    Ok(Some(JobStatus::new(phase, message)))
}

/// Phase of a job from its pod counters. `None` while no pod has started.
fn job_phase(job: &Job) -> Option<JobPhase> {
    let status = job.status.as_ref()?;
    if status.failed.unwrap_or(0) > 0 {
        Some(JobPhase::Failed)
    } else if status.succeeded.unwrap_or(0) > 0 {
        Some(JobPhase::Succeeded)
    } else if status.active.unwrap_or(0) > 0 {
        Some(JobPhase::Active)
    } else {
        None
    }
}
