//! Condition history, stage observation, status patching and event recording.

use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::Api;
use kube::Resource;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use tracing::debug;

use crate::crd::{
    ConditionStatus, ConditionType, ImageBasedUpgrade, ImageBasedUpgradeStatus, Stage,
    UpgradeCondition, reason,
};

/// Where the observed stage stands.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Progress {
    /// Only used with `Stage::Idle`.
    Resting,
    InProgress,
    Completed,
    Failed,
}

/// Patch the status subresource of `obj` with a status computed from it.
pub async fn patch_status(
    api: &Api<ImageBasedUpgrade>,
    obj: &ImageBasedUpgrade,
    status: &ImageBasedUpgradeStatus,
) -> Result<ImageBasedUpgrade> {
    let name = obj.metadata.name.as_deref().unwrap_or_default();
    debug!(
        "Patching status for {}: conditions={}",
        name,
        status.conditions.len()
    );

    let patch = status_patch(obj, status);
    let result = api
        .patch_status(name, &PatchParams::apply("ibu"), &Patch::Merge(&patch))
        .await?;
    Ok(result)
}

/// Merge patch body replacing the status.
///
/// Carries the resourceVersion `obj` was read at, so the API server answers
/// 409 Conflict instead of overwriting a status written since that read.
pub fn status_patch(
    obj: &ImageBasedUpgrade,
    status: &ImageBasedUpgradeStatus,
) -> serde_json::Value {
    let mut patch = serde_json::json!({ "status": status });
    if let Some(version) = &obj.metadata.resource_version {
        patch["metadata"] = serde_json::json!({ "resourceVersion": version });
    }
    patch
}

/// True if a status patch lost a race with another writer.
pub fn is_conflict(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<kube::Error>(),
        Some(kube::Error::Api(status)) if status.code == 409
    )
}

/// Latest condition of the given type, scanning from the end.
pub fn latest<'a>(status: &'a ImageBasedUpgradeStatus, type_: &str) -> Option<&'a UpgradeCondition> {
    status.conditions.iter().rev().find(|c| c.r#type == type_)
}

/// Append a condition.
///
/// When the last condition already has the same type, status and reason,
/// only its message is refreshed.
pub fn append_condition(
    status: &mut ImageBasedUpgradeStatus,
    type_: &str,
    condition_status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    generation: i64,
) {
    let message = message.into();

    // Refresh in place only when the match is also the last entry overall,
    // otherwise stage anchors would be reordered.
    if let Some(existing) = status.conditions.last_mut()
        && existing.r#type == type_
        && existing.status == condition_status
        && existing.reason == reason
    {
        existing.message = message;
        existing.observed_generation = generation;
        return;
    }

    status.conditions.push(UpgradeCondition {
        r#type: type_.to_string(),
        status: condition_status,
        reason: reason.to_string(),
        message,
        last_transition_time: Utc::now(),
        observed_generation: generation,
    });
}

/// Append a well-known condition.
pub fn set(
    status: &mut ImageBasedUpgradeStatus,
    type_: ConditionType,
    condition_status: ConditionStatus,
    reason: &str,
    message: impl Into<String>,
    generation: i64,
) {
    append_condition(
        status,
        type_.as_str(),
        condition_status,
        reason,
        message,
        generation,
    );
}

fn anchor(cond: &UpgradeCondition) -> Option<(Stage, Progress)> {
    let failed = matches!(cond.reason.as_str(), reason::FAILED | reason::DEGRADED);
    match (ConditionType::parse(&cond.r#type)?, cond.status) {
        (ConditionType::Idle, ConditionStatus::True) => Some((Stage::Idle, Progress::Resting)),
        (ConditionType::PrepInProgress, ConditionStatus::True) => {
            Some((Stage::Prep, Progress::InProgress))
        }
        (ConditionType::UpgradeInProgress, ConditionStatus::True) => {
            Some((Stage::Upgrade, Progress::InProgress))
        }
        (ConditionType::RollbackInProgress, ConditionStatus::True) => {
            Some((Stage::Rollback, Progress::InProgress))
        }
        (ConditionType::PrepCompleted, ConditionStatus::True) => {
            Some((Stage::Prep, Progress::Completed))
        }
        (ConditionType::UpgradeCompleted, ConditionStatus::True) => {
            Some((Stage::Upgrade, Progress::Completed))
        }
        (ConditionType::RollbackCompleted, ConditionStatus::True) => {
            Some((Stage::Rollback, Progress::Completed))
        }
        (ConditionType::UpgradeInProgress, ConditionStatus::False) if failed => {
            Some((Stage::Upgrade, Progress::Failed))
        }
        (ConditionType::RollbackInProgress, ConditionStatus::False) if failed => {
            Some((Stage::Rollback, Progress::Failed))
        }
        _ => None,
    }
}

/// Derive the observed stage from the condition history.
///
/// Scans from the end and stops at the first stage anchor. Rejected
/// requests and prep failures are never anchors.
pub fn observe(conditions: &[UpgradeCondition]) -> (Stage, Progress) {
    conditions
        .iter()
        .rev()
        .find_map(anchor)
        .unwrap_or((Stage::Idle, Progress::Resting))
}

/// True while an upgrade is in progress: an `Idle` condition exists and the
/// latest one is not `True`.
pub fn upgrade_in_progress(status: &ImageBasedUpgradeStatus) -> bool {
    latest(status, ConditionType::Idle.as_str())
        .is_some_and(|c| c.status != ConditionStatus::True)
}

/// Compact the history into a single `Idle=True` and clear stage bookkeeping.
pub fn reset_to_idle(status: &mut ImageBasedUpgradeStatus, message: &str, generation: i64) {
    status.conditions.clear();
    set(
        status,
        ConditionType::Idle,
        ConditionStatus::True,
        reason::IDLE,
        message,
        generation,
    );
    status.started_at = None;
    status.completed_at = Some(Utc::now());
    status.pinned_spec = None;
}

/// Drop a failed attempt at `type_` from the tail of the history before it is
/// retried: the failure and, when present, the retry marker right before it.
///
/// Keeps the history bounded when the same step fails over and over, and
/// gives the next failure a fresh transition time for the backoff.
pub fn discard_failed_attempt(status: &mut ImageBasedUpgradeStatus, type_: ConditionType) {
    let failed = |c: &UpgradeCondition| {
        c.r#type == type_.as_str()
            && c.status == ConditionStatus::False
            && matches!(c.reason.as_str(), reason::FAILED | reason::DEGRADED)
    };
    if !status.conditions.last().is_some_and(failed) {
        return;
    }
    status.conditions.pop();

    if status.conditions.last().is_some_and(|c| {
        c.r#type == type_.as_str()
            && c.status == ConditionStatus::True
            && c.reason == reason::RETRYING
    }) {
        status.conditions.pop();
    }
}

/// Drop what earlier Prep attempts left behind, from the `Idle=False` that
/// started the first of them onwards. Only valid while resting at Idle.
pub fn discard_failed_prep(status: &mut ImageBasedUpgradeStatus) {
    if let Some(first) = status.conditions.iter().position(|c| {
        c.r#type == ConditionType::Idle.as_str()
            && c.status == ConditionStatus::False
            && c.reason == reason::IN_PROGRESS
    }) {
        status.conditions.truncate(first);
    }
}

/// Time left before `cond` is older than `window`, if any.
pub fn backoff_remaining(
    cond: &UpgradeCondition,
    window: Duration,
    now: DateTime<Utc>,
) -> Option<Duration> {
    let elapsed = now
        .signed_duration_since(cond.last_transition_time)
        .to_std()
        .unwrap_or_default();
    window.checked_sub(elapsed).filter(|d| !d.is_zero())
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
            controller: "ibu".into(),
            instance: None,
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
pub(crate) mod tests {
    use super::*;

    pub(crate) fn cond(type_: &str, status: ConditionStatus, reason: &str) -> UpgradeCondition {
        UpgradeCondition {
            r#type: type_.to_string(),
            status,
            reason: reason.to_string(),
            message: String::new(),
            last_transition_time: Utc::now(),
            observed_generation: 1,
        }
    }

    use ConditionStatus::{False, True};

    #[test]
    fn test_observe_empty_is_idle() {
        assert_eq!(observe(&[]), (Stage::Idle, Progress::Resting));
    }

    #[test]
    fn test_observe_last_anchor_wins() {
        let conditions = vec![
            cond("Idle", True, reason::IDLE),
            cond("Idle", False, reason::IN_PROGRESS),
            cond("PrepInProgress", True, reason::IN_PROGRESS),
            cond("PrepCompleted", True, reason::COMPLETED),
        ];
        assert_eq!(observe(&conditions), (Stage::Prep, Progress::Completed));
    }

    #[test]
    fn test_observe_skips_rejections() {
        let conditions = vec![
            cond("PrepCompleted", True, reason::COMPLETED),
            cond("UpgradeInProgress", False, reason::INVALID_TRANSITION),
            cond("Idle", False, reason::INVALID_TRANSITION),
        ];
        assert_eq!(observe(&conditions), (Stage::Prep, Progress::Completed));
    }

    #[test]
    fn test_observe_prep_failure_rests_at_idle() {
        let conditions = vec![
            cond("Idle", False, reason::IN_PROGRESS),
            cond("PrepInProgress", True, reason::IN_PROGRESS),
            cond("Idle", True, reason::IDLE),
            cond("PrepInProgress", False, reason::FAILED),
        ];
        assert_eq!(observe(&conditions), (Stage::Idle, Progress::Resting));
    }

    #[test]
    fn test_observe_upgrade_failure() {
        let conditions = vec![
            cond("UpgradeInProgress", True, reason::IN_PROGRESS),
            cond("UpgradeInProgress", False, reason::FAILED),
        ];
        assert_eq!(observe(&conditions), (Stage::Upgrade, Progress::Failed));
    }

    #[test]
    fn test_observe_rollback_markers_are_not_anchors() {
        let conditions = vec![
            cond("RollbackInProgress", True, reason::AUTO_ROLLBACK),
            cond("RollbackRestoreBootDeploymentDone", True, reason::COMPLETED),
        ];
        assert_eq!(observe(&conditions), (Stage::Rollback, Progress::InProgress));
    }

    #[test]
    fn test_latest_scans_from_end() {
        let status = ImageBasedUpgradeStatus {
            conditions: vec![
                cond("Idle", True, reason::IDLE),
                cond("PrepInProgress", True, reason::IN_PROGRESS),
                cond("Idle", False, reason::IN_PROGRESS),
            ],
            ..Default::default()
        };
        let idle = latest(&status, "Idle").unwrap();
        assert_eq!(idle.status, False);
        assert!(upgrade_in_progress(&status));
    }

    #[test]
    fn test_upgrade_not_in_progress_without_idle_condition() {
        assert!(!upgrade_in_progress(&ImageBasedUpgradeStatus::default()));
    }

    #[test]
    fn test_append_refreshes_identical_tail() {
        let mut status = ImageBasedUpgradeStatus::default();
        append_condition(&mut status, "UpgradeInProgress", True, reason::IN_PROGRESS, "a", 1);
        append_condition(&mut status, "UpgradeInProgress", True, reason::IN_PROGRESS, "b", 1);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].message, "b");
    }

    #[test]
    fn test_append_keeps_history_when_not_tail() {
        let mut status = ImageBasedUpgradeStatus::default();
        append_condition(&mut status, "Idle", True, reason::IDLE, "", 1);
        append_condition(&mut status, "PrepInProgress", True, reason::IN_PROGRESS, "", 1);
        append_condition(&mut status, "Idle", True, reason::IDLE, "", 1);
        assert_eq!(status.conditions.len(), 3);
        assert_eq!(observe(&status.conditions), (Stage::Idle, Progress::Resting));
    }

    #[test]
    fn test_reset_to_idle_compacts() {
        let mut status = ImageBasedUpgradeStatus {
            started_at: Some(Utc::now()),
            conditions: vec![
                cond("UpgradeInProgress", False, reason::FAILED),
                cond("RollbackCompleted", True, reason::COMPLETED),
            ],
            pinned_spec: Some(crate::crd::PinnedSpec::default()),
            ..Default::default()
        };
        reset_to_idle(&mut status, "Rollback completed", 4);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].r#type, "Idle");
        assert_eq!(status.conditions[0].status, True);
        assert!(status.started_at.is_none());
        assert!(status.completed_at.is_some());
        assert!(status.pinned_spec.is_none());
    }

    #[test]
    fn test_discard_failed_attempt_drops_failure_and_retry_marker() {
        let mut status = ImageBasedUpgradeStatus {
            conditions: vec![
                cond("UpgradeInProgress", True, reason::IN_PROGRESS),
                cond("UpgradeInProgress", True, reason::RETRYING),
                cond("UpgradeInProgress", False, reason::DEGRADED),
            ],
            ..Default::default()
        };
        discard_failed_attempt(&mut status, ConditionType::UpgradeInProgress);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(status.conditions[0].reason, reason::IN_PROGRESS);

        // Nothing to drop once the tail is no longer a failure.
        discard_failed_attempt(&mut status, ConditionType::UpgradeInProgress);
        assert_eq!(status.conditions.len(), 1);
    }

    #[test]
    fn test_discard_failed_attempt_ignores_other_types() {
        let mut status = ImageBasedUpgradeStatus {
            conditions: vec![
                cond("RollbackInProgress", True, reason::IN_PROGRESS),
                cond("RollbackInProgress", False, reason::FAILED),
            ],
            ..Default::default()
        };
        discard_failed_attempt(&mut status, ConditionType::UpgradeInProgress);
        assert_eq!(status.conditions.len(), 2);
        discard_failed_attempt(&mut status, ConditionType::RollbackInProgress);
        assert_eq!(status.conditions.len(), 1);
        assert_eq!(observe(&status.conditions), (Stage::Rollback, Progress::InProgress));
    }

    #[test]
    fn test_discard_failed_prep_keeps_earlier_history() {
        let mut status = ImageBasedUpgradeStatus {
            conditions: vec![
                cond("Idle", True, reason::IDLE),
                cond("UpgradeInProgress", False, reason::INVALID_TRANSITION),
                cond("Idle", False, reason::IN_PROGRESS),
                cond("PrepInProgress", True, reason::IN_PROGRESS),
                cond("Idle", True, reason::IDLE),
                cond("PrepInProgress", False, reason::DEGRADED),
            ],
            ..Default::default()
        };
        discard_failed_prep(&mut status);
        assert_eq!(status.conditions.len(), 2);
        assert_eq!(observe(&status.conditions), (Stage::Idle, Progress::Resting));
    }

    #[test]
    fn test_status_patch_pins_resource_version() {
        let mut obj =
            ImageBasedUpgrade::new("upgrade", crate::crd::ImageBasedUpgradeSpec::default());
        let status = ImageBasedUpgradeStatus {
            conditions: vec![cond("Idle", True, reason::IDLE)],
            ..Default::default()
        };

        let patch = status_patch(&obj, &status);
        assert!(patch.get("metadata").is_none());
        assert_eq!(patch["status"]["conditions"][0]["type"], "Idle");

        obj.metadata.resource_version = Some("4711".to_string());
        let patch = status_patch(&obj, &status);
        assert_eq!(patch["metadata"]["resourceVersion"], "4711");
    }

    #[test]
    fn test_is_conflict() {
        let api_error = |code| {
            anyhow::Error::from(kube::Error::Api(
                kube::core::Status::failure("the object has been modified", "Conflict")
                    .with_code(code)
                    .boxed(),
            ))
        };
        assert!(is_conflict(&api_error(409)));
        assert!(!is_conflict(&api_error(500)));
        assert!(!is_conflict(&anyhow::anyhow!("connection refused")));
    }

    #[test]
    fn test_backoff_remaining() {
        let now = Utc::now();
        let mut c = cond("RollbackInProgress", False, reason::FAILED);
        c.last_transition_time = now - chrono::Duration::seconds(20);
        let left = backoff_remaining(&c, Duration::from_secs(60), now).unwrap();
        assert!(left <= Duration::from_secs(40) && left > Duration::from_secs(39));

        c.last_transition_time = now - chrono::Duration::seconds(90);
        assert!(backoff_remaining(&c, Duration::from_secs(60), now).is_none());
    }
}
