//! Prometheus metrics for the ibu operator.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

use crate::crd::Stage;

/// Labels for reconcile metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ReconcileLabels {
    pub result: String,
}

/// Labels for stage metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StageLabels {
    pub stage: String,
}

/// Labels for rollback metrics.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct RollbackLabels {
    pub trigger: String,
}

/// All Prometheus metrics for the operator.
pub struct Metrics {
    pub reconcile_total: Family<ReconcileLabels, Counter>,
    pub reconcile_duration_seconds: Histogram,
    pub stage_info: Family<StageLabels, Gauge>,
    pub stage_transition_total: Family<StageLabels, Counter>,
    pub stage_duration_seconds: Family<StageLabels, Histogram>,
    pub rollback_total: Family<RollbackLabels, Counter>,
    pub transition_rejected_total: Family<StageLabels, Counter>,
    /// When the current stage started, keyed by stage.
    stage_start_times: Mutex<HashMap<Stage, Instant>>,
}

const RECONCILE_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0,
];

/// Prep pulls a seed image and Upgrade spans a reboot, so stages take minutes.
const STAGE_DURATION_BUCKETS: &[f64] = &[
    10.0, 30.0, 60.0, 120.0, 300.0, 600.0, 1200.0, 1800.0, 3600.0, 7200.0,
];

fn stage_labels(stage: Stage) -> StageLabels {
    StageLabels {
        stage: stage.as_str().to_string(),
    }
}

impl Metrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let reconcile_total = Family::<ReconcileLabels, Counter>::default();
        registry.register(
            "ibu_reconcile",
            "Total number of reconcile calls",
            reconcile_total.clone(),
        );

        let reconcile_duration_seconds = Histogram::new(RECONCILE_BUCKETS.iter().copied());
        registry.register(
            "ibu_reconcile_duration_seconds",
            "Duration of reconcile calls in seconds",
            reconcile_duration_seconds.clone(),
        );

        let stage_info = Family::<StageLabels, Gauge>::default();
        registry.register(
            "ibu_stage_info",
            "Observed stage (1=current, 0=not current)",
            stage_info.clone(),
        );

        let stage_transition_total = Family::<StageLabels, Counter>::default();
        registry.register(
            "ibu_stage_transition",
            "Total number of accepted stage transitions",
            stage_transition_total.clone(),
        );

        let stage_duration_seconds = Family::<StageLabels, Histogram>::new_with_constructor(|| {
            Histogram::new(STAGE_DURATION_BUCKETS.iter().copied())
        });
        registry.register(
            "ibu_stage_duration_seconds",
            "Time from stage start to stage completion in seconds",
            stage_duration_seconds.clone(),
        );

        let rollback_total = Family::<RollbackLabels, Counter>::default();
        registry.register(
            "ibu_rollback",
            "Total number of rollbacks by trigger",
            rollback_total.clone(),
        );

        let transition_rejected_total = Family::<StageLabels, Counter>::default();
        registry.register(
            "ibu_transition_rejected",
            "Total number of rejected stage requests by requested stage",
            transition_rejected_total.clone(),
        );

        Self {
            reconcile_total,
            reconcile_duration_seconds,
            stage_info,
            stage_transition_total,
            stage_duration_seconds,
            rollback_total,
            transition_rejected_total,
            stage_start_times: Mutex::new(HashMap::new()),
        }
    }

    pub fn record_reconcile(&self, result: &str, seconds: f64) {
        self.reconcile_total
            .get_or_create(&ReconcileLabels {
                result: result.to_string(),
            })
            .inc();
        self.reconcile_duration_seconds.observe(seconds);
    }

    /// Set the stage gauge: 1 for `current`, 0 for every other stage.
    pub fn set_stage(&self, current: Stage) {
        for stage in Stage::ALL {
            self.stage_info
                .get_or_create(&stage_labels(stage))
                .set(i64::from(stage == current));
        }
    }

    /// Count an accepted transition into `stage` and start its timer.
    pub fn record_transition(&self, stage: Stage) {
        self.stage_transition_total
            .get_or_create(&stage_labels(stage))
            .inc();
        if let Ok(mut starts) = self.stage_start_times.lock() {
            starts.insert(stage, Instant::now());
        }
    }

    /// Observe how long `stage` took. Returns `None` if its start was not seen
    /// by this process.
    pub fn observe_stage_duration(&self, stage: Stage) -> Option<f64> {
        let start = self.stage_start_times.lock().ok()?.remove(&stage)?;
        let duration = start.elapsed().as_secs_f64();
        self.stage_duration_seconds
            .get_or_create(&stage_labels(stage))
            .observe(duration);
        Some(duration)
    }

    pub fn record_rollback(&self, trigger: &str) {
        self.rollback_total
            .get_or_create(&RollbackLabels {
                trigger: trigger.to_string(),
            })
            .inc();
    }

    pub fn record_rejection(&self, requested: Stage) {
        self.transition_rejected_total
            .get_or_create(&stage_labels(requested))
            .inc();
    }
}

/// Axum handler that encodes the registry as OpenMetrics text.
async fn metrics_handler(State(registry): State<Arc<Registry>>) -> impl IntoResponse {
    let mut buf = String::new();
    if encode(&mut buf, &registry).is_err() {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to encode metrics".to_string(),
        );
    }
    (StatusCode::OK, buf)
}

/// Start the metrics server on the given port.
pub async fn serve(port: u16, registry: Arc<Registry>) -> anyhow::Result<()> {
    use axum::Router;
    use axum::routing::get;
    use tokio::net::TcpListener;
    use tracing::info;

    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(format!("0.0.0.0:{port}")).await?;
    info!("Metrics server listening on port {}", port);
    axum::serve(listener, app).await?;
    Ok(())
}
