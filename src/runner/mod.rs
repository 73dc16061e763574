//! Concurrent task runner.
//!
//! One generic [`Runner`] serves both flavors: [`ActionRunner`] applies a
//! default timeout to short-lived tasks, [`JobRunner`] lets tasks run until
//! stopped. Every started task produces exactly one [`TaskResult`] on the
//! result stream returned by [`Runner::new`], which ends only after the root
//! token is cancelled and every in-flight task has reported.

pub mod limits;
pub mod process;
pub mod task;

pub use limits::Limits;
pub use process::{ProcessBuilder, ProcessTask};
pub use task::{Progress, Task, TaskBuilder, TaskContext, TaskMessage, TaskResult, TaskRouter};

use std::any::Any;
use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::error::{RunnerError, TaskError};
use crate::sync::{lock, read, write};
use crate::transport::protocol::TaskFlavor;

/// Timeout applied to actions that do not set one.
pub const DEFAULT_ACTION_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of a runner's result stream.
pub const RESULT_BUFFER: usize = 256;

/// Fixes the timeout policy of a runner.
pub trait Flavor: Send + Sync + 'static {
    const FLAVOR: TaskFlavor;

    /// Applied when a task's own timeout is zero. `None` means no limit.
    const DEFAULT_TIMEOUT: Option<Duration>;
}

#[derive(Debug, Clone, Copy)]
pub struct Actions;

impl Flavor for Actions {
    const FLAVOR: TaskFlavor = TaskFlavor::Action;
    const DEFAULT_TIMEOUT: Option<Duration> = Some(DEFAULT_ACTION_TIMEOUT);
}

#[derive(Debug, Clone, Copy)]
pub struct Jobs;

impl Flavor for Jobs {
    const FLAVOR: TaskFlavor = TaskFlavor::Job;
    const DEFAULT_TIMEOUT: Option<Duration> = None;
}

pub type ActionRunner = Runner<Actions>;
pub type JobRunner = Runner<Jobs>;

struct Inner<F> {
    root: CancellationToken,
    /// Taken on root cancellation; `start` clones it under the same lock.
    admission: Mutex<Option<mpsc::Sender<TaskMessage>>>,
    active: RwLock<HashMap<String, CancellationToken>>,
    in_flight: AtomicUsize,
    tracker: TaskTracker,
    limits: Arc<Limits>,
    _flavor: PhantomData<fn() -> F>,
}

pub struct Runner<F> {
    inner: Arc<Inner<F>>,
}

impl<F> Clone for Runner<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<F: Flavor> Runner<F> {
    /// Create a runner whose tasks are children of `root`.
    ///
    /// Cancelling `root` stops admission, cancels every task, and ends the
    /// returned stream once all of them have reported.
    pub fn new(
        root: CancellationToken,
        limits: Arc<Limits>,
    ) -> (Self, mpsc::Receiver<TaskMessage>) {
        let (tx, rx) = mpsc::channel(RESULT_BUFFER);
        let inner = Arc::new(Inner {
            root,
            admission: Mutex::new(Some(tx)),
            active: RwLock::new(HashMap::new()),
            in_flight: AtomicUsize::new(0),
            tracker: TaskTracker::new(),
            limits,
            _flavor: PhantomData,
        });

        let drain = Arc::clone(&inner);
        tokio::spawn(async move {
            drain.root.cancelled().await;
            let sender = lock(&drain.admission).take();
            drop(sender);
            drain.tracker.close();
            drain.tracker.wait().await;
            debug!(flavor = %F::FLAVOR, "Runner drained");
        });

        (Self { inner }, rx)
    }

    /// Start `task` in the background.
    pub fn start(&self, task: Box<dyn Task>) -> Result<(), RunnerError> {
        let id = task.id().to_string();
        let admission = lock(&self.inner.admission);
        let tx = match admission.as_ref() {
            Some(tx) if !self.inner.root.is_cancelled() => tx.clone(),
            _ => {
                warn!(task_id = %id, flavor = %F::FLAVOR, "Runner is shutting down, task rejected");
                return Err(RunnerError::ShuttingDown);
            }
        };

        let cancel = {
            let mut active = write(&self.inner.active);
            if active.contains_key(&id) {
                return Err(RunnerError::AlreadyRunning(id));
            }
            let cancel = self.inner.root.child_token();
            active.insert(id, cancel.clone());
            cancel
        };
        self.inner.in_flight.fetch_add(1, Ordering::SeqCst);
        self.inner
            .tracker
            .spawn(execute(Arc::clone(&self.inner), task, cancel, tx));
        drop(admission);
        Ok(())
    }

    /// Cancel a running task. No-op for unknown IDs; never waits.
    pub fn stop(&self, id: &str) {
        if let Some(cancel) = read(&self.inner.active).get(id) {
            debug!(task_id = %id, flavor = %F::FLAVOR, "Stopping task");
            cancel.cancel();
        }
    }

    pub fn is_running(&self, id: &str) -> bool {
        read(&self.inner.active).contains_key(id)
    }

    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::SeqCst)
    }

    /// Resolves once the root is cancelled and every task has reported.
    pub async fn wait_idle(&self) {
        self.inner.tracker.wait().await;
    }

    pub const fn flavor(&self) -> TaskFlavor {
        F::FLAVOR
    }
}

async fn execute<F: Flavor>(
    inner: Arc<Inner<F>>,
    task: Box<dyn Task>,
    cancel: CancellationToken,
    tx: mpsc::Sender<TaskMessage>,
) {
    let id = task.id().to_string();
    let kind = task.kind().to_string();
    let started = Instant::now();

    let outcome = run_task::<F>(&inner.limits, task, &cancel, &tx).await;

    write(&inner.active).remove(&id);
    inner.in_flight.fetch_sub(1, Ordering::SeqCst);

    let elapsed = started.elapsed();
    match &outcome {
        Ok(_) => info!(task_id = %id, kind = %kind, flavor = %F::FLAVOR, ?elapsed, "Task finished"),
        Err(e) => warn!(
            task_id = %id,
            kind = %kind,
            flavor = %F::FLAVOR,
            ?elapsed,
            error = %e,
            "Task failed"
        ),
    }

    let result = TaskResult {
        task_id: id,
        kind,
        flavor: F::FLAVOR,
        outcome,
        finished_at: Utc::now(),
    };
    if tx.send(TaskMessage::Done(result)).await.is_err() {
        warn!(flavor = %F::FLAVOR, "Result stream dropped, result lost");
    }
}

async fn run_task<F: Flavor>(
    limits: &Arc<Limits>,
    task: Box<dyn Task>,
    cancel: &CancellationToken,
    tx: &mpsc::Sender<TaskMessage>,
) -> Result<String, TaskError> {
    let Some(_permit) = limits.acquire(task.resource_key(), cancel).await else {
        return Err(TaskError::Canceled);
    };

    let timeout = match task.timeout() {
        Duration::ZERO => F::DEFAULT_TIMEOUT,
        timeout => Some(timeout),
    };
    let ctx = TaskContext {
        cancel: cancel.clone(),
        progress: Progress::new(
            task.id().to_string(),
            task.kind().to_string(),
            F::FLAVOR,
            tx.clone(),
        ),
    };
    info!(task_id = %task.id(), kind = %task.kind(), flavor = %F::FLAVOR, ?timeout, "Task started");

    let mut body = tokio::spawn(async move { task.run(ctx).await });
    let deadline = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        joined = &mut body => match joined {
            Ok(Ok(output)) => Ok(output),
            Ok(Err(_)) if cancel.is_cancelled() => Err(TaskError::Canceled),
            Ok(Err(e)) => Err(TaskError::Failed(format!("{e:#}"))),
            Err(e) if e.is_panic() => Err(TaskError::Panicked(panic_message(e.into_panic()))),
            Err(_) => Err(TaskError::Canceled),
        },
        () = cancel.cancelled() => {
            body.abort();
            Err(TaskError::Canceled)
        }
        () = deadline => {
            cancel.cancel();
            body.abort();
            Err(TaskError::TimedOut(timeout.unwrap_or_default()))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic payload".to_string())
}
