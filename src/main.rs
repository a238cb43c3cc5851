//! ibuo - Image-Based Upgrade Operator.
//!
//! Watches `ImageBasedUpgrade` resources and drives the prep stage of an
//! image-based upgrade in a background worker: seed image pull, stateroot
//! setup, and image precaching on the host.

mod config;
mod controller;
mod crd;
mod error;
mod health;
mod host;
mod logging;
mod metrics;
mod ops;
mod precache;
mod prep;
mod retry;
mod status;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use futures::StreamExt;
use kube::Api;
use kube::runtime::{Controller, watcher};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use config::{BUILD_DATE, COMMIT, Config, VERSION};
use controller::Context;
use crd::ImageBasedUpgrade;
use host::HostPaths;
use ops::HostOps;
use prep::PrepSettings;
use prep::task::TaskRegistry;

#[tokio::main]
async fn main() {
    let config = Config::parse();
    logging::init(&config.log_format, &config.log_level);

    info!(
        "Starting ibuo v{} (commit: {}, build: {})",
        VERSION, COMMIT, BUILD_DATE
    );

    if let Err(e) = run(config).await {
        error!("Operator failed: {:#}", e);
        std::process::exit(1);
    }
}

/// Main operator loop.
async fn run(config: Config) -> Result<()> {
    let client = kube::Client::try_default().await?;
    info!("Connected to Kubernetes API server");

    let shutdown = CancellationToken::new();

    let mut registry = prometheus_client::registry::Registry::default();
    let metrics = Arc::new(metrics::Metrics::new(&mut registry));
    let registry = Arc::new(registry);

    let health_state = health::HealthState::new();
    let health_port = config.health_port;
    let health_server = health_state.clone();
    let health_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if let Err(e) = health::serve(health_port, health_server, health_shutdown).await {
            error!("Health server failed: {}", e);
        }
    });

    let metrics_port = config.metrics_port;
    tokio::spawn(async move {
        if let Err(e) = metrics::serve(metrics_port, registry).await {
            error!("Metrics server failed: {}", e);
        }
    });

    let paths = HostPaths::new(&config.host_root, &config.workspace_dir);
    if let Err(e) = paths.ensure_ready() {
        // Reported again by every reconcile until the host mount shows up
        error!("Host is not ready: {}", e);
    }

    let ops = HostOps::new(
        client.clone(),
        &config.namespace,
        &config.pod_name,
        &config.container_name,
        paths.clone(),
    );

    let ctx = Arc::new(Context {
        client: client.clone(),
        ops: Arc::new(ops),
        paths,
        settings: Arc::new(PrepSettings::from_config(&config)),
        tasks: TaskRegistry::default(),
        metrics,
        shutdown: shutdown.clone(),
        requeue_interval: Duration::from_secs(config.requeue_interval_secs),
    });

    let api: Api<ImageBasedUpgrade> = Api::all(client);
    let ibu_controller = Controller::new(api, watcher::Config::default());
    tokio::spawn(controller::sweep_deleted(
        Arc::clone(&ctx),
        ibu_controller.store(),
    ));

    health_state.set_ready(true);

    info!("Starting ImageBasedUpgrade controller");
    ibu_controller
        .shutdown_on_signal()
        .run(controller::reconcile, controller::error_policy, ctx)
        .for_each(|res| async move {
            match res {
                Ok((obj, action)) => info!("Reconciled {}: {:?}", obj.name, action),
                Err(e) => error!("Reconcile failed: {}", e),
            }
        })
        .await;

    info!("Controller stopped, cancelling prep workers");
    health_state.set_ready(false);
    shutdown.cancel();
    Ok(())
}
