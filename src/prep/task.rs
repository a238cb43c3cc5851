//! Cross-reconcile state of the in-flight prep phase.
//!
//! The dispatcher owns a [`PrepTask`] per resource. A worker only ever touches
//! its own [`Progress`] handle and the sending half of the completion channel,
//! so the two execution contexts never mutate the same field.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Progress message shown before the first step runs.
pub const INITIAL_PROGRESS: &str = "Prep stage initialized";

/// Latest human-readable progress of a worker. Readers never wait on writers.
#[derive(Debug, Default)]
pub struct Progress(Mutex<String>);

impl Progress {
    pub fn new(message: impl Into<String>) -> Self {
        Self(Mutex::new(message.into()))
    }

    pub fn set(&self, message: impl Into<String>) {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner) = message.into();
    }

    pub fn get(&self) -> String {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }
}

/// How a worker run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerOutcome {
    Succeeded,
    Failed,
    Cancelled,
}

impl std::fmt::Display for WorkerOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Succeeded => write!(f, "Succeeded"),
            Self::Failed => write!(f, "Failed"),
            Self::Cancelled => write!(f, "Cancelled"),
        }
    }
}

/// Handles given to a newly started worker.
#[derive(Debug)]
pub struct WorkerHandles {
    pub cancel: CancellationToken,
    pub progress: Arc<Progress>,
    pub done: oneshot::Sender<WorkerOutcome>,
}

#[derive(Debug)]
struct ActiveRun {
    cancel: CancellationToken,
    done: oneshot::Receiver<WorkerOutcome>,
    started: Instant,
}

/// Result of a non-blocking completion check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Running,
    Finished(WorkerOutcome),
}

/// Phase task state for one resource.
#[derive(Debug)]
pub struct PrepTask {
    progress: Arc<Progress>,
    run: Option<ActiveRun>,
    /// Outcome received from the worker, kept until [`PrepTask::reset`].
    finished: Option<WorkerOutcome>,
    success: bool,
}

impl Default for PrepTask {
    fn default() -> Self {
        Self {
            progress: Arc::new(Progress::default()),
            run: None,
            finished: None,
            success: false,
        }
    }
}

impl PrepTask {
    /// True between [`PrepTask::begin`] and the reset that follows observed completion.
    pub const fn is_active(&self) -> bool {
        self.run.is_some()
    }

    /// True once the worker's outcome was received and not yet reset.
    pub const fn is_finished(&self) -> bool {
        self.finished.is_some()
    }

    /// Outcome of the last observed run. Only meaningful once inactive.
    pub const fn success(&self) -> bool {
        self.success
    }

    pub fn progress(&self) -> String {
        self.progress.get()
    }

    /// Time since the active run started.
    pub fn elapsed(&self) -> Duration {
        self.run
            .as_ref()
            .map_or(Duration::ZERO, |run| run.started.elapsed())
    }

    /// Mark the task active and hand out fresh handles for a new worker.
    ///
    /// The completion channel and progress holder are allocated per run, so
    /// a previous worker can never be observed as the new run's completion.
    /// Returns `None` if a worker is already active.
    pub fn begin(&mut self, parent: &CancellationToken) -> Option<WorkerHandles> {
        if self.is_active() {
            return None;
        }

        let cancel = parent.child_token();
        let (done_tx, done_rx) = oneshot::channel();
        self.progress = Arc::new(Progress::new(INITIAL_PROGRESS));
        self.success = false;
        self.finished = None;
        self.run = Some(ActiveRun {
            cancel: cancel.clone(),
            done: done_rx,
            started: Instant::now(),
        });

        Some(WorkerHandles {
            cancel,
            progress: Arc::clone(&self.progress),
            done: done_tx,
        })
    }

    /// Check the completion signal without waiting.
    ///
    /// A worker that went away without reporting (panic) counts as failed.
    /// Once received, the outcome is returned again by every call until
    /// [`PrepTask::reset`].
    pub fn poll_completion(&mut self) -> Completion {
        if let Some(outcome) = self.finished {
            return Completion::Finished(outcome);
        }
        let Some(run) = self.run.as_mut() else {
            return Completion::Running;
        };

        let outcome = match run.done.try_recv() {
            Ok(outcome) => outcome,
            Err(oneshot::error::TryRecvError::Empty) => return Completion::Running,
            Err(oneshot::error::TryRecvError::Closed) => {
                self.progress.set("Prep worker exited without reporting a result");
                WorkerOutcome::Failed
            }
        };
        self.success = outcome == WorkerOutcome::Succeeded;
        self.finished = Some(outcome);
        Completion::Finished(outcome)
    }

    /// Request cancellation of the active worker. Safe to call repeatedly.
    pub fn cancel(&self) {
        if let Some(run) = &self.run {
            run.cancel.cancel();
        }
    }

    /// Return to the initial state. Only call once completion was observed
    /// or before the first start.
    pub fn reset(&mut self) {
        if let Some(run) = self.run.take() {
            run.cancel.cancel();
        }
        self.success = false;
        self.finished = None;
        self.progress = Arc::new(Progress::default());
    }
}

/// Prep tasks keyed by resource name.
#[derive(Debug, Default)]
pub struct TaskRegistry {
    tasks: Mutex<HashMap<String, PrepTask>>,
}

impl TaskRegistry {
    /// Run `f` with exclusive access to the task for `name`.
    pub fn with_task<R>(&self, name: &str, f: impl FnOnce(&mut PrepTask) -> R) -> R {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        f(tasks.entry(name.to_string()).or_default())
    }

    /// Drop the entry of an inactive task.
    pub fn remove_idle(&self, name: &str) {
        let mut tasks = self.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        if tasks.get(name).is_some_and(|t| !t.is_active()) {
            tasks.remove(name);
        }
    }

    /// Names of all tracked tasks.
    pub fn names(&self) -> Vec<String> {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect()
    }

    pub fn is_active(&self, name: &str) -> bool {
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(name)
            .is_some_and(PrepTask::is_active)
    }
}
