//! Stage request validation: legal edges and immutable fields.
//!
//! The admission webhook and the controller share these functions, so the
//! immutability rule holds even when the webhook is not deployed.

use crate::crd::{ImageBasedUpgrade, ImageBasedUpgradeSpec, PinnedSpec, Stage};
use crate::status::{Progress, upgrade_in_progress};

/// Outcome of evaluating a stage request against the observed stage.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Decision {
    /// Nothing to do: already there, or a repeated request.
    NoOp,
    /// Begin work for the stage.
    Start(Stage),
    /// Retry the observed stage after a transient failure.
    Resume,
    /// Accepted, but acted on once the in-flight stage completes.
    Defer,
    /// Refused; the message names the edge or precondition.
    Reject(String),
}

/// Edges a stage request may follow. Everything else is rejected.
pub const fn is_valid_edge(from: Stage, to: Stage) -> bool {
    matches!(
        (from, to),
        (Stage::Idle, Stage::Prep)
            | (Stage::Prep, Stage::Upgrade)
            | (Stage::Upgrade, Stage::Idle)
            | (Stage::Prep | Stage::Upgrade, Stage::Rollback)
            | (Stage::Rollback, Stage::Idle)
    )
}

/// Evaluate a requested stage against the observed stage.
///
/// `degraded` is true when the last failure of the observed stage was
/// transient, which turns a same-stage request into a retry.
pub fn evaluate(
    desired: Stage,
    observed: Stage,
    progress: Progress,
    degraded: bool,
    spec: &ImageBasedUpgradeSpec,
) -> Decision {
    if desired == observed {
        return if progress == Progress::Failed && degraded {
            Decision::Resume
        } else {
            Decision::NoOp
        };
    }

    if !is_valid_edge(observed, desired) {
        return Decision::Reject(format!(
            "invalid stage transition from {observed} to {desired}"
        ));
    }

    match (observed, desired) {
        (Stage::Idle, Stage::Prep) => match &spec.seed_image_ref {
            Some(seed) if !seed.image.is_empty() && !seed.version.is_empty() => {
                Decision::Start(Stage::Prep)
            }
            _ => Decision::Reject(
                "spec.seedImageRef.image and spec.seedImageRef.version are required to start Prep"
                    .to_string(),
            ),
        },
        (Stage::Prep, Stage::Upgrade) if progress != Progress::Completed => {
            Decision::Reject("Prep stage is not completed".to_string())
        }
        (Stage::Upgrade, Stage::Idle) if progress != Progress::Completed => Decision::Reject(
            "Upgrade stage is not completed, request Rollback instead".to_string(),
        ),
        (Stage::Rollback, Stage::Idle) if progress != Progress::Completed => Decision::Defer,
        (_, to) => Decision::Start(to),
    }
}

/// Name of the first immutable field whose live value differs from the pinned one.
pub fn changed_immutable_field(
    pinned: &PinnedSpec,
    spec: &ImageBasedUpgradeSpec,
) -> Option<&'static str> {
    if pinned.seed_image_ref != spec.seed_image_ref {
        Some("seedImageRef")
    } else if pinned.oadp_content != spec.oadp_content {
        Some("oadpContent")
    } else if pinned.extra_manifests != spec.extra_manifests {
        Some("extraManifests")
    } else if pinned.auto_rollback_on_failure != spec.auto_rollback_on_failure {
        Some("autoRollbackOnFailure")
    } else {
        None
    }
}

/// Rejection message for a changed immutable field.
pub fn immutable_message(field: &str) -> String {
    format!("can not change spec.{field} while ibu is in progress")
}

/// Validate an update against the previous resource state.
pub fn validate_update(old: &ImageBasedUpgrade, new: &ImageBasedUpgrade) -> Result<(), String> {
    let in_progress = old.status.as_ref().is_some_and(upgrade_in_progress);
    if !in_progress {
        return Ok(());
    }
    let pinned = PinnedSpec::from_spec(&old.spec);
    match changed_immutable_field(&pinned, &new.spec) {
        Some(field) => Err(immutable_message(field)),
        None => Ok(()),
    }
}
