//! `ImageBasedUpgrade` controller - reconcile dispatch and error policy.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::runtime::controller::Action;
use kube::runtime::reflector::{ObjectRef, Store};
use kube::{Api, ResourceExt};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::crd::{ImageBasedUpgrade, ImageBasedUpgradeStatus, PrepPhase, Stage};
use crate::error::IbuError;
use crate::host::HostPaths;
use crate::metrics::Metrics;
use crate::ops::PrepOps;
use crate::prep::PrepSettings;
use crate::prep::dispatcher::{Dispatcher, PrepReport};
use crate::prep::task::{TaskRegistry, WorkerOutcome};
use crate::status::{self, EventRecorder, reason};

/// Delay before retrying a reconcile that returned an error.
const ERROR_REQUEUE: Duration = Duration::from_secs(30);

/// Shared context for the controller.
pub struct Context {
    pub client: kube::Client,
    pub ops: Arc<dyn PrepOps>,
    pub paths: HostPaths,
    pub settings: Arc<PrepSettings>,
    pub tasks: TaskRegistry,
    pub metrics: Arc<Metrics>,
    /// Root of every worker cancellation token.
    pub shutdown: CancellationToken,
    /// Requeue delay while a worker runs.
    pub requeue_interval: Duration,
}

impl Context {
    pub fn dispatcher(&self) -> Dispatcher<'_> {
        Dispatcher {
            ops: &self.ops,
            paths: &self.paths,
            settings: &self.settings,
            tasks: &self.tasks,
            shutdown: &self.shutdown,
        }
    }
}

/// Reconcile an `ImageBasedUpgrade` resource.
///
/// One cycle never waits for the prep worker: it starts the worker, reports
/// its progress, or publishes its result, then requeues.
pub async fn reconcile(obj: Arc<ImageBasedUpgrade>, ctx: Arc<Context>) -> Result<Action, IbuError> {
    let started = Instant::now();
    let name = obj.name_any();

    let result = if obj.metadata.deletion_timestamp.is_some() || obj.spec.stage == Stage::Idle {
        reconcile_idle(&obj, &ctx, &name).await
    } else {
        reconcile_prep(&obj, &ctx, &name).await
    };

    let outcome = if result.is_ok() { "success" } else { "error" };
    ctx.metrics
        .observe_reconcile(&name, outcome, started.elapsed().as_secs_f64());
    result
}

async fn reconcile_prep(obj: &ImageBasedUpgrade, ctx: &Context, name: &str) -> Result<Action, IbuError> {
    let current = obj.status.clone().unwrap_or_default();
    let generation = obj.metadata.generation.unwrap_or(0);

    if prep_settled(&current, generation) && !ctx.tasks.is_active(name) {
        debug!("Prep of {} already settled ({:?})", name, current.prep_phase());
        return Ok(Action::await_change());
    }

    let report = ctx.dispatcher().dispatch(obj)?;

    let mut new_status = current;
    let action = apply_report(&mut new_status, &report, ctx.requeue_interval);
    new_status.observed_generation = generation;

    // A finished result stays in the task until its status is written
    let api: Api<ImageBasedUpgrade> = Api::all(ctx.client.clone());
    status::patch_status(&api, name, &new_status).await?;
    if matches!(report, PrepReport::Finished { .. }) {
        ctx.dispatcher().acknowledge(name);
    }
    ctx.metrics.observe_prep(name, &report);

    let recorder = EventRecorder::new(ctx.client.clone(), obj);
    publish_report(&recorder, &report).await;

    Ok(action)
}

async fn reconcile_idle(obj: &ImageBasedUpgrade, ctx: &Context, name: &str) -> Result<Action, IbuError> {
    let was_active = ctx.tasks.is_active(name);
    if !ctx.dispatcher().teardown(name) {
        info!("Waiting for prep worker of {} to stop", name);
        return Ok(Action::requeue(ctx.requeue_interval));
    }
    if was_active {
        ctx.metrics.set_prep_idle(name);
    }

    if obj.metadata.deletion_timestamp.is_some() {
        return Ok(Action::await_change());
    }

    let current = obj.status.clone().unwrap_or_default();
    let generation = obj.metadata.generation.unwrap_or(0);
    if current.prep_phase() == Some(PrepPhase::Initialized) && current.observed_generation >= generation {
        return Ok(Action::await_change());
    }

    let mut new_status = current;
    status::set_prep_initialized(&mut new_status, reason::IDLE);
    new_status.observed_generation = generation;

    let api: Api<ImageBasedUpgrade> = Api::all(ctx.client.clone());
    status::patch_status(&api, name, &new_status).await?;
    Ok(Action::await_change())
}

/// Returns true when the resource already shows a prep outcome that no
/// cycle should replace: completion, or a failure of the current generation.
/// A cancelled run is never settled.
fn prep_settled(status: &ImageBasedUpgradeStatus, generation: i64) -> bool {
    match status.prep_phase() {
        Some(PrepPhase::Completed) => true,
        Some(PrepPhase::Failed) => {
            !status::prep_was_cancelled(status) && status.observed_generation >= generation
        }
        _ => false,
    }
}

/// Publish `report` into `status` and pick the next requeue.
fn apply_report(status: &mut ImageBasedUpgradeStatus, report: &PrepReport, requeue: Duration) -> Action {
    match report {
        PrepReport::Started(message) | PrepReport::InProgress(message) => {
            status::set_prep_in_progress(status, message);
            Action::requeue(requeue)
        }
        PrepReport::Finished { outcome, message, .. } => match outcome {
            WorkerOutcome::Succeeded => {
                status::set_prep_completed(status, message);
                Action::await_change()
            }
            WorkerOutcome::Failed => {
                status::set_prep_failed(status, message);
                Action::await_change()
            }
            WorkerOutcome::Cancelled => {
                status::set_prep_cancelled(status, message);
                Action::requeue(requeue)
            }
        },
    }
}

async fn publish_report(recorder: &EventRecorder, report: &PrepReport) {
    match report {
        PrepReport::Started(_) => recorder.publish("PrepStarted", "Prep stage started").await,
        PrepReport::InProgress(_) => {}
        PrepReport::Finished { outcome, message, .. } => match outcome {
            WorkerOutcome::Succeeded => recorder.publish(reason::COMPLETED, message).await,
            WorkerOutcome::Failed => recorder.publish_warning(reason::FAILED, message).await,
            WorkerOutcome::Cancelled => recorder.publish_warning(reason::CANCELLED, message).await,
        },
    }
}

/// Error policy: requeue after 30 seconds on error.
pub fn error_policy(obj: Arc<ImageBasedUpgrade>, err: &IbuError, _ctx: Arc<Context>) -> Action {
    warn!("Reconcile error for {}: {}", obj.name_any(), err);
    Action::requeue(ERROR_REQUEUE)
}

/// Stop the workers of resources removed from the cluster. Deleted objects
/// are never reconciled, so their tasks are found by comparing the task
/// registry against the reflector store.
pub async fn sweep_deleted(ctx: Arc<Context>, store: Store<ImageBasedUpgrade>) {
    if store.wait_until_ready().await.is_err() {
        return;
    }

    let mut ticker = tokio::time::interval(ctx.requeue_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            () = ctx.shutdown.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let stopped = ctx
            .dispatcher()
            .sweep(|name| store.get(&ObjectRef::new(name)).is_some());
        for name in stopped {
            info!("Stopped prep worker of deleted resource {}", name);
            ctx.metrics.set_prep_idle(&name);
        }
    }
}
