//! ibu - image-based upgrade operator for single-node clusters.
//!
//! Watches the `ImageBasedUpgrade` resource and moves the node through the
//! Idle, Prep, Upgrade and Rollback stages by pivoting between ostree
//! stateroots. The same binary restores a seed image on a freshly installed
//! node and builds the installation ISO that performs that install.

mod clusterconfig;
mod config;
mod controller;
mod crd;
mod error;
mod handler;
mod machine;
mod media;
mod ops;
mod restore;
mod seed;
mod status;
mod telemetry;
mod validation;
mod watchdog;
mod webhook;

use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use futures::StreamExt;
use kube::Api;
use kube::runtime::Controller;
use kube::runtime::watcher::Config;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use clusterconfig::{ClusterConfigGatherer, KubeClusterAccessor};
use config::{
    BUILD_DATE, COMMIT, Cli, Command, CreateIsoArgs, HostLayout, OperatorArgs, RestoreArgs,
    VERSION,
};
use controller::Context;
use crd::ImageBasedUpgrade;
use handler::ostree::OstreeStageHandler;
use machine::StageMachine;
use media::{InstallationIso, MediaRequest};
use ops::HostCommandRunner;
use restore::{RestoreOptions, Restorer};
use watchdog::Watchdog;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // JSON for the in-cluster operator, plain text for the node-side tools.
    let json = matches!(cli.command, Command::Operator(_));
    if let Err(e) = init_tracing(&cli.log_level, json) {
        eprintln!("Failed to initialize logging: {e}");
        std::process::exit(1);
    }

    info!(
        "Starting ibu v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    let result = match &cli.command {
        Command::Operator(args) => run_operator(args).await,
        Command::Restore(args) => run_restore(args).await,
        Command::CreateIso(args) => run_create_iso(args).await,
    };
    if let Err(e) = result {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

fn init_tracing(level: &str, json: bool) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {e}"))?;

    if json {
        fmt()
            .with_env_filter(filter)
            .json()
            .with_target(true)
            .init();
    } else {
        fmt().with_env_filter(filter).with_target(false).init();
    }
    Ok(())
}

/// Main operator loop.
async fn run_operator(args: &OperatorArgs) -> Result<()> {
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(telemetry::metrics::Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = telemetry::health::HealthState::new();
    let health_state_clone = health_state.clone();
    let health_port = args.health_port;
    tokio::spawn(async move {
        if let Err(e) = telemetry::health::serve(health_port, health_state_clone).await {
            error!("Health server failed: {}", e);
        }
    });

    let metrics_port = args.metrics_port;
    let registry_clone = registry.clone();
    tokio::spawn(async move {
        if let Err(e) = telemetry::metrics::serve(metrics_port, registry_clone).await {
            error!("Metrics server failed: {}", e);
        }
    });

    match (&args.webhook_cert, &args.webhook_key) {
        (Some(cert), Some(key)) => {
            // axum-server resolves the process-wide rustls provider.
            if rustls::crypto::aws_lc_rs::default_provider()
                .install_default()
                .is_err()
            {
                warn!("rustls crypto provider already installed");
            }
            let (cert, key, port) = (cert.clone(), key.clone(), args.webhook_port);
            tokio::spawn(async move {
                if let Err(e) = webhook::serve(port, &cert, &key).await {
                    error!("Admission webhook failed: {:#}", e);
                }
            });
        }
        (None, None) => info!("Webhook certificate not configured, admission webhook disabled"),
        _ => anyhow::bail!("--webhook-cert and --webhook-key must be set together"),
    }

    let layout = HostLayout::new(&args.host_root);
    let accessor = Arc::new(KubeClusterAccessor::new(client.clone()));
    let handler = Arc::new(OstreeStageHandler::new(
        layout.clone(),
        Arc::new(HostCommandRunner::host()),
        accessor.clone(),
        args.authfile.clone(),
    ));
    let gatherer = ClusterConfigGatherer::new(accessor, layout);
    let (watchdog, expirations) = Watchdog::new();

    let ctx = Arc::new(Context {
        kube_client: client.clone(),
        machine: StageMachine::new(handler, gatherer),
        metrics,
        watchdog,
        lock: Mutex::new(()),
    });

    tokio::spawn(controller::run_rollback_pump(ctx.clone(), expirations));

    health_state.set_ready(true);

    info!("Starting ImageBasedUpgrade controller");
    let api: Api<ImageBasedUpgrade> = Api::all(client);
    Controller::new(api, Config::default())
        .run(controller::reconcile, controller::error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok(o) => info!("Reconciled: {:?}", o),
                Err(e) => error!("Reconcile failed: {:?}", e),
            }
        })
        .await;

    Ok(())
}

/// Restore a seed on a freshly booted node. Any failure exits non-zero.
async fn run_restore(args: &RestoreArgs) -> Result<()> {
    let restorer = Restorer::new(
        HostLayout::new(&args.host_root),
        Arc::new(HostCommandRunner::host()),
        RestoreOptions::from(args),
    );
    restorer.run_and_report().await.context("Restore failed")?;
    info!("Seed restore completed");
    Ok(())
}

async fn run_create_iso(args: &CreateIsoArgs) -> Result<()> {
    let iso = InstallationIso::new(&args.work_dir, Arc::new(HostCommandRunner::local()))
        .create(&MediaRequest::from(args))
        .await
        .context("Failed to create installation ISO")?;
    info!("Installation ISO ready: {}", iso.display());
    Ok(())
}
