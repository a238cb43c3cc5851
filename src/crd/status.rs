//! `ImageBasedUpgrade` status types.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::PrepPhase;

/// Prep phase status surfaced on the resource.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrepStatus {
    pub phase: PrepPhase,

    /// Latest progress or outcome message.
    #[serde(default)]
    pub message: String,

    /// Timestamp when the current prep run was started.
    /// NOTE: No `skip_serializing_if`. None must serialize as `null` so that
    /// JSON Merge Patch (RFC 7396) removes the field from the CRD status.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// Timestamp when the prep run completed or failed.
    /// NOTE: No `skip_serializing_if`, see `started_at`.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Condition on the `ImageBasedUpgrade` resource.
#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeCondition {
    pub r#type: String,
    pub status: String,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

/// `ImageBasedUpgrade` status defines the observed state of the upgrade.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageBasedUpgradeStatus {
    /// Last observed generation of the spec.
    #[serde(default)]
    pub observed_generation: i64,

    /// Prep phase status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prep: Option<PrepStatus>,

    /// Conditions.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<UpgradeCondition>,
}

impl ImageBasedUpgradeStatus {
    /// Phase of the prep status, if any.
    pub fn prep_phase(&self) -> Option<PrepPhase> {
        self.prep.as_ref().map(|p| p.phase)
    }

    /// Look up a condition by type.
    pub fn condition(&self, condition_type: &str) -> Option<&UpgradeCondition> {
        self.conditions.iter().find(|c| c.r#type == condition_type)
    }
}
