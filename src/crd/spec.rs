//! `ImageBasedUpgrade` spec types.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::status::ImageBasedUpgradeStatus;
use super::types::Stage;

/// `ImageBasedUpgrade` spec defines the desired stage of an image-based upgrade.
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "ibuo.io",
    version = "v1alpha1",
    kind = "ImageBasedUpgrade",
    status = "ImageBasedUpgradeStatus",
    printcolumn = r#"{"name":"STAGE","type":"string","jsonPath":".spec.stage"}"#,
    printcolumn = r#"{"name":"SEED","type":"string","jsonPath":".spec.seedImageRef.version"}"#,
    printcolumn = r#"{"name":"PREP","type":"string","jsonPath":".status.prep.phase"}"#,
    printcolumn = r#"{"name":"AGE","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ImageBasedUpgradeSpec {
    /// Desired stage of the upgrade.
    #[serde(default)]
    pub stage: Stage,

    /// Seed image to upgrade to.
    pub seed_image_ref: SeedImageRef,

    /// Automatic rollback settings persisted alongside the new stateroot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rollback_on_failure: Option<AutoRollbackConfig>,
}

/// Reference to the seed image.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SeedImageRef {
    /// Image pull spec (e.g., "quay.io/org/seed:4.14.1").
    pub image: String,

    /// Cluster version the seed was built from (e.g., "4.14.1").
    pub version: String,

    /// Secret holding registry credentials for the seed image.
    /// The cluster-wide pull secret is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_secret_ref: Option<PullSecretRef>,
}

/// Name of a secret in the operator namespace.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
pub struct PullSecretRef {
    pub name: String,
}

/// Automatic rollback configuration.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AutoRollbackConfig {
    /// Seconds the post-pivot init monitor waits before rolling back (default: 1800).
    #[serde(default = "default_init_monitor_timeout")]
    pub init_monitor_timeout_seconds: u64,
}

impl Default for AutoRollbackConfig {
    fn default() -> Self {
        Self {
            init_monitor_timeout_seconds: default_init_monitor_timeout(),
        }
    }
}

const fn default_init_monitor_timeout() -> u64 {
    1800
}
