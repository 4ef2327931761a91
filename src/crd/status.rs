//! `ImageBasedUpgrade` status types.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::spec::{AutoRollbackOnFailure, ConfigMapRef, ImageBasedUpgradeSpec, SeedImageRef};
use super::types::ConditionStatus;

/// Condition on the `ImageBasedUpgrade` resource.
///
/// Conditions are append-ordered. The last entry of a given type is the
/// current truth for that type.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct UpgradeCondition {
    pub r#type: String,
    pub status: ConditionStatus,
    pub reason: String,
    #[serde(default)]
    pub message: String,
    pub last_transition_time: DateTime<Utc>,
    #[serde(default)]
    pub observed_generation: i64,
}

/// Snapshot of the fields that must not change while an upgrade is in progress.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PinnedSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed_image_ref: Option<SeedImageRef>,
    #[serde(default)]
    pub oadp_content: Vec<ConfigMapRef>,
    #[serde(default)]
    pub extra_manifests: Vec<ConfigMapRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auto_rollback_on_failure: Option<AutoRollbackOnFailure>,
}

impl PinnedSpec {
    pub fn from_spec(spec: &ImageBasedUpgradeSpec) -> Self {
        Self {
            seed_image_ref: spec.seed_image_ref.clone(),
            oadp_content: spec.oadp_content.clone(),
            extra_manifests: spec.extra_manifests.clone(),
            auto_rollback_on_failure: spec.auto_rollback_on_failure.clone(),
        }
    }

    pub fn auto_rollback(&self) -> AutoRollbackOnFailure {
        self.auto_rollback_on_failure.clone().unwrap_or_default()
    }
}

/// `ImageBasedUpgrade` status defines the observed state of the upgrade.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImageBasedUpgradeStatus {
    /// Last generation whose stage request was evaluated.
    #[serde(default)]
    pub observed_generation: i64,

    /// Timestamp when the current stage started.
    /// NOTE: No `skip_serializing_if`: None must serialize as `null` so that
    /// JSON Merge Patch (RFC 7396) removes the field on return to Idle.
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,

    /// Timestamp when the current stage completed.
    /// NOTE: No `skip_serializing_if`, same reason as `started_at`.
    #[serde(default)]
    pub completed_at: Option<DateTime<Utc>>,

    /// Ordered condition history.
    #[serde(default)]
    pub conditions: Vec<UpgradeCondition>,

    /// Immutable fields captured when Prep was accepted.
    /// NOTE: No `skip_serializing_if`, same reason as `started_at`.
    #[serde(default)]
    pub pinned_spec: Option<PinnedSpec>,
}
