//! Per-reconcile decision: start a worker, report its progress, or consume
//! its result.

use std::sync::Arc;
use std::time::Duration;

use kube::ResourceExt;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, info_span, warn};

use super::PrepSettings;
use super::pipeline::Pipeline;
use super::task::{Completion, TaskRegistry, WorkerHandles, WorkerOutcome};
use crate::crd::ImageBasedUpgrade;
use crate::error::IbuError;
use crate::host::HostPaths;
use crate::ops::PrepOps;

/// What a dispatch observed.
///
/// `Finished` is returned by every dispatch until [`Dispatcher::acknowledge`]
/// is called for the resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrepReport {
    /// A worker was started by this call.
    Started(String),
    /// A worker is running; carries its latest progress.
    InProgress(String),
    /// The worker finished; its result awaits acknowledgement.
    Finished {
        outcome: WorkerOutcome,
        message: String,
        elapsed: Duration,
    },
}

pub struct Dispatcher<'a> {
    pub ops: &'a Arc<dyn PrepOps>,
    pub paths: &'a HostPaths,
    pub settings: &'a Arc<PrepSettings>,
    pub tasks: &'a TaskRegistry,
    /// Parent of every worker token.
    pub shutdown: &'a CancellationToken,
}

impl Dispatcher<'_> {
    /// Start or poll the prep phase of `ibu`. Never waits for the worker.
    ///
    /// Host precondition failures are returned as errors and leave the task untouched.
    pub fn dispatch(&self, ibu: &ImageBasedUpgrade) -> Result<PrepReport, IbuError> {
        self.paths.ensure_ready()?;

        let name = ibu.name_any();
        let report = self.tasks.with_task(&name, |task| {
            if let Some(handles) = task.begin(self.shutdown) {
                self.spawn_worker(ibu.clone(), handles);
                return PrepReport::Started(task.progress());
            }

            match task.poll_completion() {
                Completion::Running => PrepReport::InProgress(task.progress()),
                Completion::Finished(outcome) => {
                    debug_assert_eq!(task.success(), outcome == WorkerOutcome::Succeeded);
                    PrepReport::Finished {
                        outcome,
                        message: task.progress(),
                        elapsed: task.elapsed(),
                    }
                }
            }
        });

        match &report {
            PrepReport::Started(_) => info!(%name, "Started prep worker"),
            PrepReport::InProgress(progress) => debug!(%name, %progress, "Prep in progress"),
            PrepReport::Finished { outcome, message, .. } => {
                info!(%name, ?outcome, %message, "Prep worker finished");
            }
        }
        Ok(report)
    }

    /// Reset the task of `name` once its finished result has been published.
    /// A task whose worker is still running is left untouched.
    pub fn acknowledge(&self, name: &str) {
        self.tasks.with_task(name, |task| {
            if task.is_finished() {
                task.reset();
            }
        });
    }

    /// Cancel the worker of `name` and consume its result once it exits.
    /// Returns `true` when no worker remains.
    pub fn teardown(&self, name: &str) -> bool {
        let idle = self.tasks.with_task(name, |task| {
            if !task.is_active() {
                return true;
            }
            task.cancel();
            match task.poll_completion() {
                Completion::Running => false,
                Completion::Finished(outcome) => {
                    info!(%name, ?outcome, "Prep worker stopped");
                    task.reset();
                    true
                }
            }
        });

        if idle {
            self.tasks.remove_idle(name);
        }
        idle
    }

    /// Tear down tasks whose resource no longer exists. Returns the names
    /// whose worker was running and has now stopped.
    pub fn sweep(&self, exists: impl Fn(&str) -> bool) -> Vec<String> {
        self.tasks
            .names()
            .into_iter()
            .filter(|name| !exists(name))
            .filter(|name| {
                let was_active = self.tasks.is_active(name);
                self.teardown(name) && was_active
            })
            .collect()
    }

    fn spawn_worker(&self, ibu: ImageBasedUpgrade, handles: WorkerHandles) {
        let ops = Arc::clone(self.ops);
        let paths = self.paths.clone();
        let settings = Arc::clone(self.settings);
        let span = info_span!("prep_worker", name = %ibu.name_any());

        tokio::spawn(
            async move {
                run_worker(ops.as_ref(), &paths, &settings, &ibu, handles).await;
            }
            .instrument(span),
        );
    }
}

/// Run the pipeline and report its outcome through the completion channel.
///
/// The worker token is always cancelled on exit and the outcome is sent
/// exactly once.
pub async fn run_worker(
    ops: &dyn PrepOps,
    paths: &HostPaths,
    settings: &PrepSettings,
    ibu: &ImageBasedUpgrade,
    handles: WorkerHandles,
) {
    let WorkerHandles { cancel, progress, done } = handles;

    let pipeline = Pipeline {
        ops,
        paths,
        settings,
        progress: &progress,
        cancel: &cancel,
    };

    let outcome = match pipeline.run(ibu).await {
        Ok(message) => {
            progress.set(message);
            WorkerOutcome::Succeeded
        }
        Err(e) if IbuError::find_in(&e).is_some_and(IbuError::is_cancellation) => {
            warn!(error = %e, "Prep cancelled");
            progress.set(format!("{e:#}"));
            WorkerOutcome::Cancelled
        }
        Err(e) => {
            error!("Prep failed: {e:#}");
            progress.set(format!("Prep failed with error: {e:#}"));
            WorkerOutcome::Failed
        }
    };

    cancel.cancel();
    if done.send(outcome).is_err() {
        debug!("Prep task was reset before the worker finished");
    }
}
