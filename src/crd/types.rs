//! Enum types for stages, condition types and condition statuses.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Stage of the image-based upgrade, as requested in `spec.stage`.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, Default, PartialEq, Eq, Hash, JsonSchema)]
pub enum Stage {
    #[default]
    Idle,
    Prep,
    Upgrade,
    Rollback,
}

impl Stage {
    pub const ALL: [Self; 4] = [Self::Idle, Self::Prep, Self::Upgrade, Self::Rollback];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::Prep => "Prep",
            Self::Upgrade => "Upgrade",
            Self::Rollback => "Rollback",
        }
    }

    /// Condition type that tracks work in progress for this stage.
    pub const fn in_progress_condition(self) -> ConditionType {
        match self {
            Self::Idle => ConditionType::Idle,
            Self::Prep => ConditionType::PrepInProgress,
            Self::Upgrade => ConditionType::UpgradeInProgress,
            Self::Rollback => ConditionType::RollbackInProgress,
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Status of a condition.
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl std::fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::True => write!(f, "True"),
            Self::False => write!(f, "False"),
            Self::Unknown => write!(f, "Unknown"),
        }
    }
}

/// Well-known condition types written by the stage machine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConditionType {
    Idle,
    PrepInProgress,
    PrepCompleted,
    UpgradeInProgress,
    UpgradeCompleted,
    RollbackInProgress,
    RollbackCompleted,
}

impl ConditionType {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "Idle",
            Self::PrepInProgress => "PrepInProgress",
            Self::PrepCompleted => "PrepCompleted",
            Self::UpgradeInProgress => "UpgradeInProgress",
            Self::UpgradeCompleted => "UpgradeCompleted",
            Self::RollbackInProgress => "RollbackInProgress",
            Self::RollbackCompleted => "RollbackCompleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        [
            Self::Idle,
            Self::PrepInProgress,
            Self::PrepCompleted,
            Self::UpgradeInProgress,
            Self::UpgradeCompleted,
            Self::RollbackInProgress,
            Self::RollbackCompleted,
        ]
        .into_iter()
        .find(|t| t.as_str() == s)
    }
}

impl std::fmt::Display for ConditionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Condition reasons.
pub mod reason {
    pub const IDLE: &str = "Idle";
    pub const IN_PROGRESS: &str = "InProgress";
    pub const COMPLETED: &str = "Completed";
    pub const FAILED: &str = "Failed";
    /// Transient failure; the next reconcile retries.
    pub const DEGRADED: &str = "Degraded";
    pub const INVALID_TRANSITION: &str = "InvalidTransition";
    pub const AUTO_ROLLBACK: &str = "AutoRollback";
    /// Rollback retry after a failed step; does not start a new step epoch.
    pub const RETRYING: &str = "Retrying";
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_display() {
        assert_eq!(Stage::Idle.to_string(), "Idle");
        assert_eq!(Stage::Prep.to_string(), "Prep");
        assert_eq!(Stage::Upgrade.to_string(), "Upgrade");
        assert_eq!(Stage::Rollback.to_string(), "Rollback");
    }

    #[test]
    fn test_stage_default_is_idle() {
        assert_eq!(Stage::default(), Stage::Idle);
    }

    #[test]
    fn test_stage_serde_uses_plain_names() {
        let json = serde_json::to_string(&Stage::Rollback).unwrap();
        assert_eq!(json, "\"Rollback\"");
        let stage: Stage = serde_json::from_str("\"Prep\"").unwrap();
        assert_eq!(stage, Stage::Prep);
        assert!(serde_json::from_str::<Stage>("\"Finalize\"").is_err());
    }

    #[test]
    fn test_condition_type_parse_roundtrip() {
        for t in [
            ConditionType::Idle,
            ConditionType::PrepInProgress,
            ConditionType::UpgradeCompleted,
            ConditionType::RollbackInProgress,
        ] {
            assert_eq!(ConditionType::parse(t.as_str()), Some(t));
        }
        assert_eq!(ConditionType::parse("Ready"), None);
    }

    #[test]
    fn test_stage_condition_mapping() {
        assert_eq!(
            Stage::Upgrade.in_progress_condition(),
            ConditionType::UpgradeInProgress
        );
        assert_eq!(Stage::Idle.in_progress_condition(), ConditionType::Idle);
    }
}
