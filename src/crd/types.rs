//! Enum types for upgrade stages and prep phases.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Stage requested by the user.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, JsonSchema)]
pub enum Stage {
    #[default]
    Idle,
    Prep,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "Idle"),
            Self::Prep => write!(f, "Prep"),
        }
    }
}

/// Externally visible state of the prep phase.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum PrepPhase {
    Initialized,
    InProgress,
    Completed,
    Failed,
}

impl PrepPhase {
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl std::fmt::Display for PrepPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Initialized => write!(f, "Initialized"),
            Self::InProgress => write!(f, "InProgress"),
            Self::Completed => write!(f, "Completed"),
            Self::Failed => write!(f, "Failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Idle.to_string(), "Idle");
        assert_eq!(Stage::Prep.to_string(), "Prep");
        assert_eq!(Stage::default(), Stage::Idle);
    }

    #[test]
    fn test_prep_phase_terminal() {
        assert!(!PrepPhase::Initialized.is_terminal());
        assert!(!PrepPhase::InProgress.is_terminal());
        assert!(PrepPhase::Completed.is_terminal());
        assert!(PrepPhase::Failed.is_terminal());
    }

    #[test]
    fn test_prep_phase_serde() {
        let json = serde_json::to_string(&PrepPhase::InProgress).unwrap();
        assert_eq!(json, "\"InProgress\"");
        let phase: PrepPhase = serde_json::from_str("\"Failed\"").unwrap();
        assert_eq!(phase, PrepPhase::Failed);
    }
}
