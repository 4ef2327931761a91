//! ImageBasedUpgrade controller - reconcile dispatch, watchdog pump and error policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::Api;
use kube::runtime::controller::Action;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::crd::{ImageBasedUpgrade, Stage};
use crate::machine::{Notice, Outcome, StageMachine};
use crate::status::{self, EventRecorder};
use crate::telemetry::metrics::Metrics;
use crate::watchdog::{RollbackRequest, Watchdog};

/// Shared context for the controller.
pub struct Context {
    pub kube_client: kube::Client,
    pub machine: StageMachine,
    pub metrics: Arc<Metrics>,
    pub watchdog: Watchdog,
    /// Serializes reconcile passes with watchdog-initiated rollbacks.
    pub lock: Mutex<()>,
}

impl Context {
    fn api(&self) -> Api<ImageBasedUpgrade> {
        Api::all(self.kube_client.clone())
    }
}

/// Reconcile an ImageBasedUpgrade resource.
///
/// Re-reads the resource under the lock, runs one state machine step on it,
/// persists the resulting status, then emits events and metrics for what
/// happened.
pub async fn reconcile(
    obj: Arc<ImageBasedUpgrade>,
    ctx: Arc<Context>,
) -> Result<Action, kube::Error> {
    let started = Instant::now();
    let _guard = ctx.lock.lock().await;
    let name = obj.metadata.name.as_deref().unwrap_or("unknown");

    // The cached object predates the lock; the rollback pump may have written since.
    let result = match ctx.api().get_opt(name).await {
        Ok(Some(current)) => {
            debug!(
                "Reconciling {} (desired stage: {}, resourceVersion: {})",
                name,
                current.spec.stage,
                current.metadata.resource_version.as_deref().unwrap_or("none")
            );
            let outcome = ctx.machine.reconcile(&current).await;
            apply(&ctx, &current, outcome).await
        }
        Ok(None) => {
            debug!("{} was deleted, nothing to reconcile", name);
            Ok(Action::await_change())
        }
        Err(e) => Err(e),
    };

    let label = if result.is_ok() { "success" } else { "error" };
    ctx.metrics
        .record_reconcile(label, started.elapsed().as_secs_f64());
    result
}

/// Persist an outcome and act on it.
async fn apply(
    ctx: &Context,
    obj: &ImageBasedUpgrade,
    outcome: Outcome,
) -> Result<Action, kube::Error> {
    let name = obj.metadata.name.as_deref().unwrap_or("unknown");

    if obj.status.as_ref() != Some(&outcome.status)
        && let Err(e) = status::patch_status(&ctx.api(), obj, &outcome.status).await
    {
        if status::is_conflict(&e) {
            info!("Status of {} changed since it was read, reconciling again", name);
            return Ok(Action::requeue(Duration::from_millis(100)));
        }
        warn!("Failed to patch status for {}: {}", name, e);
        return Ok(Action::requeue(Duration::from_secs(5)));
    }

    let (stage, _) = status::observe(&outcome.status.conditions);
    ctx.metrics.set_stage(stage);

    if !outcome.notices.is_empty() {
        let recorder = EventRecorder::new(ctx.kube_client.clone(), obj);
        for notice in &outcome.notices {
            record(&ctx.metrics, notice);
            if notice.is_warning() {
                recorder
                    .publish_warning(notice.reason(), notice.message())
                    .await;
            } else {
                recorder.publish(notice.reason(), notice.message()).await;
            }
        }
    }

    ctx.watchdog.apply(name, outcome.watchdog);

    Ok(match outcome.requeue {
        Some(d) if d.is_zero() => Action::requeue(Duration::from_millis(100)),
        Some(d) => Action::requeue(d),
        None => Action::await_change(),
    })
}

fn record(metrics: &Metrics, notice: &Notice) {
    match notice {
        Notice::Started { stage, .. } => metrics.record_transition(*stage),
        Notice::Rollback { trigger, .. } => {
            metrics.record_transition(Stage::Rollback);
            metrics.record_rollback(trigger.as_str());
        }
        Notice::Completed { stage, .. } => {
            if let Some(secs) = metrics.observe_stage_duration(*stage) {
                info!("{} stage completed in {:.1}s", stage, secs);
            }
        }
        Notice::Rejected { stage, .. } => metrics.record_rejection(*stage),
        Notice::Failed { .. } => {}
    }
}

/// Apply rollbacks requested by expired watchdog timers.
///
/// Runs until the watchdog is dropped.
pub async fn run_rollback_pump(ctx: Arc<Context>, mut rx: mpsc::Receiver<RollbackRequest>) {
    while let Some(request) = rx.recv().await {
        let _guard = ctx.lock.lock().await;
        let obj = match ctx.api().get_opt(&request.name).await {
            Ok(Some(obj)) => obj,
            Ok(None) => {
                debug!("{} no longer exists, ignoring rollback request", request.name);
                continue;
            }
            Err(e) => {
                // The timer is gone, so re-arm it from the recorded start on the next reconcile.
                error!("Failed to fetch {} for rollback: {}", request.name, e);
                continue;
            }
        };

        let Some(outcome) =
            ctx.machine
                .request_rollback(&obj, request.trigger, &request.message)
        else {
            info!(
                "Ignoring {} rollback request for {}: not applicable",
                request.trigger, request.name
            );
            continue;
        };
        if let Err(e) = apply(&ctx, &obj, outcome).await {
            error!("Failed to apply rollback for {}: {}", request.name, e);
        }
    }
}

/// Error policy for the controller.
pub fn error_policy(obj: Arc<ImageBasedUpgrade>, err: &kube::Error, _ctx: Arc<Context>) -> Action {
    let name = obj.metadata.name.as_deref().unwrap_or("unknown");
    error!("Controller error for {}: {}", name, err);
    Action::requeue(Duration::from_secs(30))
}
