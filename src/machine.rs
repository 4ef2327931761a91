//! Stage transition state machine.
//!
//! Level-triggered: each call looks at the desired stage and the condition
//! history, decides what to do, runs at most one stage worth of host work and
//! returns the new status. Writing the status, publishing events and arming
//! the watchdog are left to the caller, which also serializes calls.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use crate::clusterconfig::ClusterConfigGatherer;
use crate::config::BundleLayout;
use crate::crd::{
    AutoRollbackOnFailure, ConditionStatus, ConditionType, ImageBasedUpgrade,
    ImageBasedUpgradeStatus, PinnedSpec, SeedImageRef, Stage, UpgradeCondition, reason,
};
use crate::error::IbuError;
use crate::handler::{RollbackStep, StageHandler, StepProgress};
use crate::seed::{SeedFlow, check_seed_version};
use crate::status::{
    Progress, append_condition, backoff_remaining, discard_failed_attempt, discard_failed_prep,
    latest, observe, reset_to_idle, set, upgrade_in_progress,
};
use crate::validation::{Decision, changed_immutable_field, evaluate, immutable_message};

/// Poll interval while waiting on out-of-band work (reboot, node readiness).
pub const POLL_INTERVAL: Duration = Duration::from_secs(30);
/// Wait before retrying a stage that failed with a transient error.
pub const DEGRADED_RETRY: Duration = Duration::from_secs(30);
/// Wait before retrying a failed rollback.
pub const ROLLBACK_RETRY: Duration = Duration::from_secs(60);

/// What started a rollback.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RollbackTrigger {
    Manual,
    PostRebootConfig,
    UpgradeCompletion,
    InitMonitor,
}

impl RollbackTrigger {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Manual => "Manual",
            Self::PostRebootConfig => "PostRebootConfig",
            Self::UpgradeCompletion => "UpgradeCompletion",
            Self::InitMonitor => "InitMonitor",
        }
    }

    /// Whether `auto_rollback` suppresses this trigger.
    pub const fn disabled_by(self, auto_rollback: &AutoRollbackOnFailure) -> bool {
        match self {
            Self::Manual => false,
            Self::PostRebootConfig => auto_rollback.disabled_for_post_reboot_config,
            Self::UpgradeCompletion => auto_rollback.disabled_for_upgrade_completion,
            Self::InitMonitor => auto_rollback.disabled_init_monitor,
        }
    }
}

impl std::fmt::Display for RollbackTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Something worth an event and a metric.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notice {
    Started { stage: Stage, message: String },
    Completed { stage: Stage, message: String },
    Failed { stage: Stage, message: String },
    Rollback { trigger: RollbackTrigger, message: String },
    Rejected { stage: Stage, message: String },
}

impl Notice {
    /// Event reason.
    pub const fn reason(&self) -> &'static str {
        match self {
            Self::Started { .. } => "StageStarted",
            Self::Rollback {
                trigger: RollbackTrigger::Manual,
                ..
            } => "StageStarted",
            Self::Completed { .. } => "StageCompleted",
            Self::Failed { .. } => "StageFailed",
            Self::Rollback { .. } => "AutoRollback",
            Self::Rejected { .. } => "TransitionRejected",
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::Started { message, .. }
            | Self::Completed { message, .. }
            | Self::Failed { message, .. }
            | Self::Rollback { message, .. }
            | Self::Rejected { message, .. } => message,
        }
    }

    pub const fn is_warning(&self) -> bool {
        match self {
            Self::Failed { .. } | Self::Rejected { .. } => true,
            Self::Rollback { trigger, .. } => !matches!(trigger, RollbackTrigger::Manual),
            Self::Started { .. } | Self::Completed { .. } => false,
        }
    }
}

/// What the caller should do with the init-monitor watchdog.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum WatchdogCommand {
    #[default]
    Keep,
    Arm(DateTime<Utc>),
    Disarm,
}

/// Result of one state machine step.
#[derive(Clone, Debug, PartialEq)]
pub struct Outcome {
    pub status: ImageBasedUpgradeStatus,
    pub notices: Vec<Notice>,
    /// `None` waits for the next change.
    pub requeue: Option<Duration>,
    pub watchdog: WatchdogCommand,
}

impl Outcome {
    fn new(status: ImageBasedUpgradeStatus) -> Self {
        Self {
            status,
            notices: Vec::new(),
            requeue: None,
            watchdog: WatchdogCommand::Keep,
        }
    }

    /// Requeue after `after`, keeping the earliest request.
    fn requeue(&mut self, after: Duration) {
        self.requeue = Some(self.requeue.map_or(after, |d| d.min(after)));
    }

    fn notify(&mut self, notice: Notice) {
        self.notices.push(notice);
    }
}

const fn failure_reason(err: &IbuError) -> &'static str {
    if err.is_transient() {
        reason::DEGRADED
    } else {
        reason::FAILED
    }
}

/// Latest in-progress condition of `stage` if it records a transient failure.
fn degraded_failure(status: &ImageBasedUpgradeStatus, stage: Stage) -> Option<&UpgradeCondition> {
    latest(status, stage.in_progress_condition().as_str()).filter(|c| {
        c.status == ConditionStatus::False && c.reason == reason::DEGRADED
    })
}

/// Index of the `RollbackInProgress` condition that started the current rollback.
fn rollback_start(conditions: &[UpgradeCondition]) -> Option<usize> {
    conditions.iter().rposition(|c| {
        c.r#type == ConditionType::RollbackInProgress.as_str()
            && c.status == ConditionStatus::True
            && matches!(c.reason.as_str(), reason::IN_PROGRESS | reason::AUTO_ROLLBACK)
    })
}

fn pinned(status: &ImageBasedUpgradeStatus) -> PinnedSpec {
    status.pinned_spec.clone().unwrap_or_default()
}

fn pinned_seed(status: &ImageBasedUpgradeStatus) -> Result<SeedImageRef, IbuError> {
    status
        .pinned_spec
        .as_ref()
        .and_then(|p| p.seed_image_ref.clone())
        .ok_or_else(|| IbuError::Validation("no seed image recorded for this upgrade".to_string()))
}

/// Append the start of a rollback. Used for manual requests and every guard.
fn begin_rollback(
    status: &mut ImageBasedUpgradeStatus,
    trigger: RollbackTrigger,
    message: String,
    generation: i64,
) -> Notice {
    let reason = if trigger == RollbackTrigger::Manual {
        reason::IN_PROGRESS
    } else {
        reason::AUTO_ROLLBACK
    };
    set(
        status,
        ConditionType::RollbackInProgress,
        ConditionStatus::True,
        reason,
        message.clone(),
        generation,
    );
    status.started_at = Some(Utc::now());
    status.completed_at = None;
    Notice::Rollback { trigger, message }
}

/// Init-monitor command for an upgrade in progress.
fn init_monitor(status: &ImageBasedUpgradeStatus) -> WatchdogCommand {
    let auto = pinned(status).auto_rollback();
    if auto.disabled_init_monitor {
        return WatchdogCommand::Disarm;
    }
    let started = status.started_at.unwrap_or_else(Utc::now);
    let deadline = i64::try_from(auto.effective_timeout_seconds())
        .ok()
        .and_then(chrono::TimeDelta::try_seconds)
        .and_then(|timeout| started.checked_add_signed(timeout))
        .unwrap_or(DateTime::<Utc>::MAX_UTC);
    WatchdogCommand::Arm(deadline)
}

pub struct StageMachine {
    handler: Arc<dyn StageHandler>,
    gatherer: ClusterConfigGatherer,
}

impl StageMachine {
    pub fn new(handler: Arc<dyn StageHandler>, gatherer: ClusterConfigGatherer) -> Self {
        Self { handler, gatherer }
    }

    /// Run one step for `obj`.
    pub async fn reconcile(&self, obj: &ImageBasedUpgrade) -> Outcome {
        let generation = obj.metadata.generation.unwrap_or(0);
        let mut out = Outcome::new(obj.status.clone().unwrap_or_default());

        if self.handle_request(obj, generation, &mut out).await {
            // Persist the accepted transition before doing any host work.
            out.requeue(Duration::ZERO);
            return out;
        }

        self.advance(generation, &mut out).await;
        out
    }

    /// Force a rollback on behalf of a guard.
    ///
    /// Returns `None` when the request does not apply: no upgrade is running,
    /// a rollback is already under way, or the guard is disabled. Repeated
    /// requests are therefore harmless.
    pub fn request_rollback(
        &self,
        obj: &ImageBasedUpgrade,
        trigger: RollbackTrigger,
        message: &str,
    ) -> Option<Outcome> {
        let mut out = Outcome::new(obj.status.clone().unwrap_or_default());
        let accepted = match observe(&out.status.conditions) {
            (Stage::Upgrade, Progress::InProgress) => true,
            (Stage::Upgrade, Progress::Failed) => {
                degraded_failure(&out.status, Stage::Upgrade).is_some()
            }
            _ => false,
        };
        if !accepted || trigger.disabled_by(&pinned(&out.status).auto_rollback()) {
            return None;
        }

        let generation = obj.metadata.generation.unwrap_or(0);
        warn!("Auto-rollback requested by {}: {}", trigger, message);
        let notice = begin_rollback(&mut out.status, trigger, message.to_string(), generation);
        out.notify(notice);
        out.watchdog = WatchdogCommand::Disarm;
        out.requeue(Duration::ZERO);
        Some(out)
    }

    /// Evaluate a new stage request. Returns true if status must be persisted first.
    async fn handle_request(
        &self,
        obj: &ImageBasedUpgrade,
        generation: i64,
        out: &mut Outcome,
    ) -> bool {
        let desired = obj.spec.stage;

        let retry_due = match degraded_failure(&out.status, desired) {
            Some(cond) => match backoff_remaining(cond, DEGRADED_RETRY, Utc::now()) {
                Some(left) => {
                    out.requeue(left);
                    false
                }
                None => true,
            },
            None => false,
        };
        if generation <= out.status.observed_generation && !retry_due {
            return false;
        }
        out.status.observed_generation = generation;

        if upgrade_in_progress(&out.status)
            && let Some(pinned) = &out.status.pinned_spec
            && let Some(field) = changed_immutable_field(pinned, &obj.spec)
        {
            self.reject(out, desired, immutable_message(field), generation);
            return true;
        }

        let (observed, progress) = observe(&out.status.conditions);
        let degraded = degraded_failure(&out.status, observed).is_some();
        info!(
            "Evaluating stage request {} (observed {} {:?})",
            desired, observed, progress
        );

        match evaluate(desired, observed, progress, degraded, &obj.spec) {
            Decision::NoOp => false,
            Decision::Defer => {
                info!("{} requested while {} is running, deferring", desired, observed);
                false
            }
            Decision::Reject(message) => {
                self.reject(out, desired, message, generation);
                true
            }
            Decision::Resume => {
                info!("Retrying {} after a transient failure", observed);
                discard_failed_attempt(&mut out.status, observed.in_progress_condition());
                set(
                    &mut out.status,
                    observed.in_progress_condition(),
                    ConditionStatus::True,
                    reason::RETRYING,
                    format!("Retrying {observed}"),
                    generation,
                );
                false
            }
            Decision::Start(Stage::Idle) => {
                self.finalize(observed, generation, out).await;
                true
            }
            Decision::Start(stage) => {
                self.start(obj, stage, generation, out);
                true
            }
        }
    }

    fn reject(&self, out: &mut Outcome, desired: Stage, message: String, generation: i64) {
        warn!("Rejecting {} request: {}", desired, message);
        set(
            &mut out.status,
            desired.in_progress_condition(),
            ConditionStatus::False,
            reason::INVALID_TRANSITION,
            message.clone(),
            generation,
        );
        out.notify(Notice::Rejected {
            stage: desired,
            message,
        });
    }

    fn start(&self, obj: &ImageBasedUpgrade, stage: Stage, generation: i64, out: &mut Outcome) {
        info!("Starting {} stage", stage);
        let status = &mut out.status;
        match stage {
            Stage::Prep => {
                discard_failed_prep(status);
                set(
                    status,
                    ConditionType::Idle,
                    ConditionStatus::False,
                    reason::IN_PROGRESS,
                    "Upgrade in progress",
                    generation,
                );
                status.pinned_spec = Some(PinnedSpec::from_spec(&obj.spec));
            }
            Stage::Rollback => {
                let notice = begin_rollback(
                    status,
                    RollbackTrigger::Manual,
                    "Rollback requested".to_string(),
                    generation,
                );
                out.notify(notice);
                out.watchdog = WatchdogCommand::Disarm;
                return;
            }
            Stage::Upgrade | Stage::Idle => {}
        }

        let message = format!("{stage} in progress");
        set(
            status,
            stage.in_progress_condition(),
            ConditionStatus::True,
            reason::IN_PROGRESS,
            message.clone(),
            generation,
        );
        status.started_at = Some(Utc::now());
        status.completed_at = None;
        out.notify(Notice::Started { stage, message });
    }

    /// Return to Idle after a completed upgrade or rollback.
    async fn finalize(&self, observed: Stage, generation: i64, out: &mut Outcome) {
        if observed == Stage::Upgrade {
            discard_failed_attempt(&mut out.status, ConditionType::Idle);
            let result = match pinned_seed(&out.status) {
                Ok(seed) => self.handler.finalize_upgrade(&seed).await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                let message = format!("Failed to finalize upgrade: {e}");
                warn!("{}", message);
                set(
                    &mut out.status,
                    ConditionType::Idle,
                    ConditionStatus::False,
                    failure_reason(&e),
                    message.clone(),
                    generation,
                );
                out.notify(Notice::Failed {
                    stage: Stage::Idle,
                    message,
                });
                return;
            }
        }

        let message = format!("{observed} finalized, back to Idle");
        info!("{}", message);
        reset_to_idle(&mut out.status, &message, generation);
        out.watchdog = WatchdogCommand::Disarm;
        out.notify(Notice::Started {
            stage: Stage::Idle,
            message,
        });
    }

    async fn advance(&self, generation: i64, out: &mut Outcome) {
        match observe(&out.status.conditions) {
            (Stage::Prep, Progress::InProgress) => self.run_prep(generation, out).await,
            (Stage::Upgrade, Progress::InProgress) => self.run_upgrade(generation, out).await,
            (Stage::Upgrade, Progress::Failed) => {
                // Transient failures keep the upgrade alive, and the init monitor with it.
                if degraded_failure(&out.status, Stage::Upgrade).is_some() {
                    out.watchdog = init_monitor(&out.status);
                }
            }
            (Stage::Rollback, Progress::InProgress) => self.run_rollback(generation, out).await,
            (Stage::Rollback, Progress::Failed) => {
                let left = latest(&out.status, ConditionType::RollbackInProgress.as_str())
                    .and_then(|c| backoff_remaining(c, ROLLBACK_RETRY, Utc::now()));
                if let Some(left) = left {
                    out.requeue(left);
                    return;
                }
                discard_failed_attempt(&mut out.status, ConditionType::RollbackInProgress);
                set(
                    &mut out.status,
                    ConditionType::RollbackInProgress,
                    ConditionStatus::True,
                    reason::RETRYING,
                    "Retrying rollback",
                    generation,
                );
                self.run_rollback(generation, out).await;
            }
            _ => {}
        }
    }

    async fn prepare(&self, seed: &SeedImageRef) -> Result<BundleLayout, IbuError> {
        self.handler.prep(seed).await?;
        let target = self.handler.target_root(seed);
        self.gatherer.gather(&target).await
    }

    async fn run_prep(&self, generation: i64, out: &mut Outcome) {
        let result = match pinned_seed(&out.status) {
            Ok(seed) => self.prepare(&seed).await,
            Err(e) => Err(e),
        };

        let status = &mut out.status;
        match result {
            Ok(bundle) => {
                let message = format!(
                    "Prep completed, cluster configuration saved to {}",
                    bundle.root().display()
                );
                info!("{}", message);
                set(
                    status,
                    ConditionType::PrepCompleted,
                    ConditionStatus::True,
                    reason::COMPLETED,
                    message.clone(),
                    generation,
                );
                status.completed_at = Some(Utc::now());
                out.notify(Notice::Completed {
                    stage: Stage::Prep,
                    message,
                });
            }
            Err(e) => {
                let message = format!("Prep failed: {e}");
                warn!("{}", message);
                // Back to the prior resting state; the failure stays visible after it.
                set(
                    status,
                    ConditionType::Idle,
                    ConditionStatus::True,
                    reason::IDLE,
                    "Prep did not complete",
                    generation,
                );
                set(
                    status,
                    ConditionType::PrepInProgress,
                    ConditionStatus::False,
                    failure_reason(&e),
                    message.clone(),
                    generation,
                );
                status.started_at = None;
                status.pinned_spec = None;
                if e.is_transient() {
                    out.requeue(DEGRADED_RETRY);
                }
                out.notify(Notice::Failed {
                    stage: Stage::Prep,
                    message,
                });
            }
        }
    }

    /// Upgrade steps, each idempotent. Errors carry the guard that covers them.
    async fn upgrade_steps(
        &self,
        seed: &SeedImageRef,
    ) -> Result<StepProgress, (RollbackTrigger, IbuError)> {
        let completion = |e| (RollbackTrigger::UpgradeCompletion, e);

        let info = self
            .handler
            .seed_cluster_info(seed)
            .await
            .map_err(completion)?;
        check_seed_version(&info, &seed.version, SeedFlow::Upgrade).map_err(completion)?;

        if self.handler.pivot(seed).await.map_err(completion)? == StepProgress::Pending {
            return Ok(StepProgress::Pending);
        }
        if self
            .handler
            .post_reboot_config()
            .await
            .map_err(|e| (RollbackTrigger::PostRebootConfig, e))?
            == StepProgress::Pending
        {
            return Ok(StepProgress::Pending);
        }
        self.handler.complete_upgrade().await.map_err(completion)
    }

    async fn run_upgrade(&self, generation: i64, out: &mut Outcome) {
        out.watchdog = init_monitor(&out.status);

        let result = match pinned_seed(&out.status) {
            Ok(seed) => self.upgrade_steps(&seed).await,
            Err(e) => Err((RollbackTrigger::UpgradeCompletion, e)),
        };

        match result {
            Ok(StepProgress::Pending) => out.requeue(POLL_INTERVAL),
            Ok(StepProgress::Done) => {
                let message = "Upgrade completed".to_string();
                info!("{}", message);
                set(
                    &mut out.status,
                    ConditionType::UpgradeCompleted,
                    ConditionStatus::True,
                    reason::COMPLETED,
                    message.clone(),
                    generation,
                );
                out.status.completed_at = Some(Utc::now());
                out.watchdog = WatchdogCommand::Disarm;
                out.notify(Notice::Completed {
                    stage: Stage::Upgrade,
                    message,
                });
            }
            Err((trigger, e)) => self.fail_upgrade(trigger, &e, generation, out),
        }
    }

    fn fail_upgrade(
        &self,
        trigger: RollbackTrigger,
        err: &IbuError,
        generation: i64,
        out: &mut Outcome,
    ) {
        let message = format!("Upgrade failed: {err}");
        warn!("{}", message);
        set(
            &mut out.status,
            ConditionType::UpgradeInProgress,
            ConditionStatus::False,
            failure_reason(err),
            message.clone(),
            generation,
        );
        out.notify(Notice::Failed {
            stage: Stage::Upgrade,
            message: message.clone(),
        });

        if err.is_transient() {
            out.requeue(DEGRADED_RETRY);
            return;
        }

        out.watchdog = WatchdogCommand::Disarm;
        if trigger.disabled_by(&pinned(&out.status).auto_rollback()) {
            info!(
                "Auto-rollback disabled for {}, waiting for manual intervention",
                trigger
            );
            return;
        }

        let notice = begin_rollback(
            &mut out.status,
            trigger,
            format!("Auto-rollback after {trigger} failure: {err}"),
            generation,
        );
        out.notify(notice);
        out.requeue(Duration::ZERO);
    }

    async fn run_rollback(&self, generation: i64, out: &mut Outcome) {
        let Some(start) = rollback_start(&out.status.conditions) else {
            warn!("Rollback in progress without a start marker");
            return;
        };
        let (origin, _) = observe(&out.status.conditions[..start]);

        let seed = match pinned_seed(&out.status) {
            Ok(seed) => Some(seed),
            Err(e) if RollbackStep::for_origin(origin).is_empty() => {
                info!("Nothing to roll back: {}", e);
                None
            }
            Err(e) => {
                self.fail_rollback(&e, generation, out);
                return;
            }
        };

        for step in RollbackStep::for_origin(origin) {
            let marker = step.marker();
            if out.status.conditions[start + 1..]
                .iter()
                .any(|c| c.r#type == marker && c.status == ConditionStatus::True)
            {
                continue;
            }
            let Some(seed) = seed.as_ref() else {
                break;
            };

            match self.handler.rollback_step(*step, seed).await {
                Ok(StepProgress::Done) => {
                    append_condition(
                        &mut out.status,
                        &marker,
                        ConditionStatus::True,
                        reason::COMPLETED,
                        format!("{step} done"),
                        generation,
                    );
                }
                Ok(StepProgress::Pending) => {
                    out.requeue(POLL_INTERVAL);
                    return;
                }
                Err(e) => {
                    self.fail_rollback(&e, generation, out);
                    return;
                }
            }
        }

        let message = format!("Rollback from {origin} completed");
        info!("{}", message);
        set(
            &mut out.status,
            ConditionType::RollbackCompleted,
            ConditionStatus::True,
            reason::COMPLETED,
            message.clone(),
            generation,
        );
        out.notify(Notice::Completed {
            stage: Stage::Rollback,
            message: message.clone(),
        });
        reset_to_idle(&mut out.status, &message, generation);
        out.watchdog = WatchdogCommand::Disarm;
    }

    fn fail_rollback(&self, err: &IbuError, generation: i64, out: &mut Outcome) {
        let message = format!("Rollback failed: {err}");
        warn!("{}", message);
        set(
            &mut out.status,
            ConditionType::RollbackInProgress,
            ConditionStatus::False,
            reason::FAILED,
            message.clone(),
            generation,
        );
        out.requeue(ROLLBACK_RETRY);
        out.notify(Notice::Failed {
            stage: Stage::Rollback,
            message,
        });
    }
}
