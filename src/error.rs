//! Custom error types for ibuo.

use thiserror::Error;

/// Errors that can occur while orchestrating the prep phase.
#[derive(Error, Debug)]
pub enum IbuError {
    /// Host mount or workspace is missing. Fatal to the reconcile cycle.
    #[error("Precondition failed: {0}")]
    Precondition(String),

    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Upgrade not possible: {0}")]
    UpgradeNotPossible(String),

    #[error("Seed image incompatible: {0}")]
    IncompatibleSeed(String),

    #[error("[{0}] conflict: {1}")]
    Conflict(String, String),

    #[error("[{0}] internal server error: {1}")]
    InternalError(String, String),

    #[error("[{0}] service unavailable: {1}")]
    ServiceUnavailable(String, String),

    #[error("[{0}] connection refused: {1}")]
    ConnectionRefused(String, String),

    #[error("[{0}] Kubernetes API error: {1}")]
    KubernetesApi(String, String),

    #[error("Precaching job failed")]
    PrecacheFailed,

    #[error("Failed more than {0} times to fetch precaching job status")]
    PrecacheStatusExhausted(u32),

    #[error("Context canceled before {0}")]
    Cancelled(String),

    #[error("Command `{command}` failed ({status}): {stderr}")]
    Command {
        command: String,
        status: String,
        stderr: String,
    },
}

impl IbuError {
    /// Create a classified error from a Kubernetes client error.
    /// Analyzes the error message to detect the retriable classes.
    pub fn kube<E: std::fmt::Debug + std::fmt::Display>(component: &str, err: E) -> Self {
        let err_debug = format!("{err:?}");
        let err_display = err.to_string();
        let component = component.to_string();

        let combined_lower = format!("{err_display} {err_debug}").to_lowercase();

        if combined_lower.contains("connection refused") {
            return Self::ConnectionRefused(component, err_display);
        }

        // 409 is also returned for creates of existing objects, which never succeed on retry
        if combined_lower.contains("alreadyexists") {
            return Self::KubernetesApi(component, err_display);
        }

        if combined_lower.contains("code: 409")
            || combined_lower.contains("reason: \"conflict\"")
            || combined_lower.contains("the object has been modified")
        {
            return Self::Conflict(component, err_display);
        }

        if combined_lower.contains("code: 500") || combined_lower.contains("internalerror") {
            return Self::InternalError(component, err_display);
        }

        if combined_lower.contains("code: 503")
            || combined_lower.contains("serviceunavailable")
            || combined_lower.contains("service unavailable")
        {
            return Self::ServiceUnavailable(component, err_display);
        }

        Self::KubernetesApi(component, err_display)
    }

    /// Returns true if a remote call failing with this error may be retried.
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Conflict(_, _)
                | Self::InternalError(_, _)
                | Self::ServiceUnavailable(_, _)
                | Self::ConnectionRefused(_, _)
        )
    }

    /// Returns true if the error ends the run because cancellation was requested.
    pub const fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled(_))
    }

    /// Find the first `IbuError` in an `anyhow` context chain.
    pub fn find_in(err: &anyhow::Error) -> Option<&Self> {
        err.chain().find_map(|cause| cause.downcast_ref::<Self>())
    }
}
