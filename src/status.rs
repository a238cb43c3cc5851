//! Status patch helpers, prep status setters, and event recording.

use chrono::Utc;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Api;
use kube::Resource;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::debug;

use crate::crd::{ImageBasedUpgrade, ImageBasedUpgradeStatus, PrepPhase, PrepStatus, UpgradeCondition};
use crate::error::IbuError;
use crate::retry::{Backoff, retry_transient};

/// Condition type tracking the prep phase.
pub const PREP_CONDITION: &str = "PrepCompleted";

/// Condition reasons for the prep phase.
pub mod reason {
    pub const IN_PROGRESS: &str = "PrepInProgress";
    pub const COMPLETED: &str = "PrepCompleted";
    pub const FAILED: &str = "PrepFailed";
    pub const CANCELLED: &str = "PrepCancelled";
    pub const IDLE: &str = "Idle";
}

/// Patch the status subresource of an `ImageBasedUpgrade`. Conflicts and
/// transient API errors are retried.
pub async fn patch_status(
    api: &Api<ImageBasedUpgrade>,
    name: &str,
    status: &ImageBasedUpgradeStatus,
) -> Result<ImageBasedUpgrade, IbuError> {
    debug!("Patching status for {}: prep={:?}", name, status.prep_phase());

    let patch = serde_json::json!({ "status": status });
    let params = &PatchParams::apply("ibuo");
    let patch = &patch;
    retry_transient(&Backoff::DEFAULT_RETRY, || async move {
        api.patch_status(name, params, &Patch::Merge(patch))
            .await
            .map_err(|e| IbuError::kube("imagebasedupgrades/status", e))
    })
    .await
}

fn set_prep(status: &mut ImageBasedUpgradeStatus, phase: PrepPhase, message: &str) {
    let now = Utc::now();
    let started_at = match (&status.prep, phase) {
        (_, PrepPhase::Initialized) => None,
        (Some(prev), _) if prev.phase == PrepPhase::InProgress => prev.started_at.or(Some(now)),
        (_, PrepPhase::InProgress) => Some(now),
        (Some(prev), _) => prev.started_at,
        (None, _) => None,
    };
    let completed_at = phase.is_terminal().then_some(now);

    status.prep = Some(PrepStatus {
        phase,
        message: message.to_string(),
        started_at,
        completed_at,
    });
}

/// Publish `Initialized(message)`.
pub fn set_prep_initialized(status: &mut ImageBasedUpgradeStatus, message: &str) {
    set_prep(status, PrepPhase::Initialized, message);
    set_condition(status, PREP_CONDITION, "False", reason::IDLE, Some(message.to_string()));
}

/// Publish `InProgress(message)`.
pub fn set_prep_in_progress(status: &mut ImageBasedUpgradeStatus, message: &str) {
    set_prep(status, PrepPhase::InProgress, message);
    set_condition(
        status,
        PREP_CONDITION,
        "False",
        reason::IN_PROGRESS,
        Some(message.to_string()),
    );
}

/// Publish `Completed(message)`.
pub fn set_prep_completed(status: &mut ImageBasedUpgradeStatus, message: &str) {
    set_prep(status, PrepPhase::Completed, message);
    set_condition(
        status,
        PREP_CONDITION,
        "True",
        reason::COMPLETED,
        Some(message.to_string()),
    );
}

/// Publish `Failed(message)`.
pub fn set_prep_failed(status: &mut ImageBasedUpgradeStatus, message: &str) {
    set_prep(status, PrepPhase::Failed, message);
    set_condition(status, PREP_CONDITION, "False", reason::FAILED, Some(message.to_string()));
}

/// Publish `Failed(message)` for a run that was canceled. A later cycle may
/// start the phase again.
pub fn set_prep_cancelled(status: &mut ImageBasedUpgradeStatus, message: &str) {
    set_prep(status, PrepPhase::Failed, message);
    set_condition(
        status,
        PREP_CONDITION,
        "False",
        reason::CANCELLED,
        Some(message.to_string()),
    );
}

/// Returns true if the last prep run ended by cancellation.
pub fn prep_was_cancelled(status: &ImageBasedUpgradeStatus) -> bool {
    status
        .condition(PREP_CONDITION)
        .is_some_and(|c| c.reason == reason::CANCELLED)
}

/// Set a condition on the status.
pub fn set_condition(
    status: &mut ImageBasedUpgradeStatus,
    condition_type: &str,
    condition_status: &str,
    reason: &str,
    message: Option<String>,
) {
    let now = Utc::now();

    // Keep the transition time when only the message changes
    let last_transition_time = status
        .condition(condition_type)
        .filter(|c| c.status == condition_status && c.reason == reason)
        .map_or(now, |c| c.last_transition_time);

    status.conditions.retain(|c| c.r#type != condition_type);

    status.conditions.push(UpgradeCondition {
        r#type: condition_type.to_string(),
        status: condition_status.to_string(),
        reason: reason.to_string(),
        message,
        last_transition_time,
    });
}

/// Event recorder bundled with its target `ObjectReference`.
pub struct EventRecorder {
    recorder: Recorder,
    obj_ref: ObjectReference,
}

impl EventRecorder {
    /// Create an event recorder for the given `ImageBasedUpgrade` resource.
    pub fn new(client: kube::Client, obj: &ImageBasedUpgrade) -> Self {
        let reporter = Reporter {
            controller: "ibuo".into(),
            instance: std::env::var("MY_POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
            obj_ref: obj.object_ref(&()),
        }
    }

    /// Publish a Normal event.
    pub async fn publish(&self, reason: &str, message: &str) {
        self.emit(EventType::Normal, reason, message).await;
    }

    /// Publish a Warning event.
    pub async fn publish_warning(&self, reason: &str, message: &str) {
        self.emit(EventType::Warning, reason, message).await;
    }

    async fn emit(&self, type_: EventType, reason: &str, message: &str) {
        self.recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note: Some(message.into()),
                    action: reason.into(),
                    secondary: None,
                },
                &self.obj_ref,
            )
            .await
            .unwrap_or_else(|e| tracing::warn!("Failed to publish event: {}", e));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_prep_in_progress_sets_started_at() {
        let mut status = ImageBasedUpgradeStatus::default();
        set_prep_in_progress(&mut status, "Prep stage initialized");
        let prep = status.prep.as_ref().unwrap();
        assert_eq!(prep.phase, PrepPhase::InProgress);
        assert_eq!(prep.message, "Prep stage initialized");
        assert!(prep.started_at.is_some());
        assert!(prep.completed_at.is_none());
    }

    #[test]
    fn test_in_progress_keeps_original_start_time() {
        let mut status = ImageBasedUpgradeStatus::default();
        set_prep_in_progress(&mut status, "Prep stage initialized");
        let started = status.prep.as_ref().unwrap().started_at;
        set_prep_in_progress(&mut status, "Pulling seed image");
        assert_eq!(status.prep.as_ref().unwrap().started_at, started);
        assert_eq!(status.prep.as_ref().unwrap().message, "Pulling seed image");
    }

    #[test]
    fn test_set_prep_completed() {
        let mut status = ImageBasedUpgradeStatus::default();
        set_prep_in_progress(&mut status, "Waiting for precaching job to complete");
        set_prep_completed(&mut status, "Prep completed successfully");
        let prep = status.prep.as_ref().unwrap();
        assert_eq!(prep.phase, PrepPhase::Completed);
        assert!(prep.started_at.is_some());
        assert!(prep.completed_at.is_some());
        let cond = status.condition(PREP_CONDITION).unwrap();
        assert_eq!(cond.status, "True");
        assert_eq!(cond.reason, reason::COMPLETED);
    }

    #[test]
    fn test_set_prep_failed_message_in_condition() {
        let mut status = ImageBasedUpgradeStatus::default();
        set_prep_failed(&mut status, "Prep failed with error: image pull");
        assert_eq!(status.prep_phase(), Some(PrepPhase::Failed));
        let cond = status.condition(PREP_CONDITION).unwrap();
        assert_eq!(cond.message.as_deref(), Some("Prep failed with error: image pull"));
        assert_eq!(cond.reason, reason::FAILED);
        assert!(!prep_was_cancelled(&status));
    }

    #[test]
    fn test_set_prep_cancelled() {
        let mut status = ImageBasedUpgradeStatus::default();
        set_prep_cancelled(&mut status, "Context canceled before setting up stateroot");
        assert_eq!(status.prep_phase(), Some(PrepPhase::Failed));
        assert!(prep_was_cancelled(&status));
    }

    #[test]
    fn test_set_prep_initialized_clears_timestamps() {
        let mut status = ImageBasedUpgradeStatus::default();
        set_prep_failed(&mut status, "boom");
        set_prep_initialized(&mut status, "Idle");
        let prep = status.prep.as_ref().unwrap();
        assert_eq!(prep.phase, PrepPhase::Initialized);
        assert!(prep.started_at.is_none());
        assert!(prep.completed_at.is_none());
    }

    #[test]
    fn test_set_condition_replaces_existing() {
        let mut status = ImageBasedUpgradeStatus::default();
        set_condition(&mut status, "Ready", "False", "NotReady", None);
        set_condition(&mut status, "Ready", "True", "NowReady", Some("ok".to_string()));
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].status, "True");
        assert_eq!(status.conditions[0].reason, "NowReady");
    }

    #[test]
    fn test_set_condition_keeps_transition_time_on_message_update() {
        let mut status = ImageBasedUpgradeStatus::default();
        set_condition(&mut status, PREP_CONDITION, "False", reason::IN_PROGRESS, None);
        let first = status.conditions[0].last_transition_time;
        set_condition(
            &mut status,
            PREP_CONDITION,
            "False",
            reason::IN_PROGRESS,
            Some("Pulling seed image".to_string()),
        );
        assert_eq!(status.conditions[0].last_transition_time, first);
    }

    #[test]
    fn test_set_condition_preserves_other_types() {
        let mut status = ImageBasedUpgradeStatus::default();
        set_condition(&mut status, "Idle", "True", "Idle", None);
        set_condition(&mut status, PREP_CONDITION, "True", reason::COMPLETED, None);
        assert_eq!(status.conditions.len(), 2);
    }
}
