//! Task bodies and the messages a runner emits about them.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{RunnerError, TaskError};
use crate::transport::protocol::{
    AgentRequest, StartTaskRequest, TaskFlavor, TaskProgressReport, TaskResultReport,
};

/// A unit of work executed by a runner.
#[async_trait]
pub trait Task: Send + Sync + 'static {
    fn id(&self) -> &str;

    fn kind(&self) -> &str;

    /// Zero selects the runner's default.
    fn timeout(&self) -> Duration;

    /// Resource the task operates on, for per-resource concurrency limits.
    fn resource_key(&self) -> Option<&str> {
        None
    }

    /// Run to completion. Implementations should return promptly once
    /// `ctx.cancel` fires; the runner aborts them otherwise.
    async fn run(&self, ctx: TaskContext) -> anyhow::Result<String>;
}

/// Handed to every task body.
#[derive(Clone)]
pub struct TaskContext {
    pub cancel: CancellationToken,
    pub progress: Progress,
}

/// Emits progress messages on the runner's result stream.
#[derive(Clone)]
pub struct Progress {
    task_id: String,
    kind: String,
    flavor: TaskFlavor,
    tx: mpsc::Sender<TaskMessage>,
}

impl Progress {
    pub(crate) const fn new(
        task_id: String,
        kind: String,
        flavor: TaskFlavor,
        tx: mpsc::Sender<TaskMessage>,
    ) -> Self {
        Self {
            task_id,
            kind,
            flavor,
            tx,
        }
    }

    pub async fn send(&self, message: impl Into<String>) {
        let report = TaskProgressReport {
            task_id: self.task_id.clone(),
            kind: self.kind.clone(),
            flavor: self.flavor,
            message: message.into(),
            at: Utc::now(),
        };
        if self.tx.send(TaskMessage::Progress(report)).await.is_err() {
            trace!(task_id = %self.task_id, "Result stream closed, progress dropped");
        }
    }
}

/// Final outcome of one task. Emitted exactly once per started task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskResult {
    pub task_id: String,
    pub kind: String,
    pub flavor: TaskFlavor,
    pub outcome: Result<String, TaskError>,
    pub finished_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn into_report(self) -> TaskResultReport {
        let (output, error) = match self.outcome {
            Ok(output) => (output, None),
            Err(e) => (String::new(), Some(e.to_string())),
        };
        TaskResultReport {
            task_id: self.task_id,
            kind: self.kind,
            flavor: self.flavor,
            output,
            error,
            finished_at: self.finished_at,
        }
    }
}

/// Item on a runner's result stream.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskMessage {
    Progress(TaskProgressReport),
    Done(TaskResult),
}

impl TaskMessage {
    pub fn task_id(&self) -> &str {
        match self {
            Self::Progress(p) => &p.task_id,
            Self::Done(r) => &r.task_id,
        }
    }

    /// Wire form, sent to the controller as a notification.
    pub fn into_request(self) -> AgentRequest {
        match self {
            Self::Progress(p) => AgentRequest::TaskProgress(p),
            Self::Done(r) => AgentRequest::TaskResult(r.into_report()),
        }
    }
}

/// Builds a task body from a controller request.
pub trait TaskBuilder: Send + Sync {
    fn build(&self, request: &StartTaskRequest) -> anyhow::Result<Box<dyn Task>>;
}

/// Routes `StartTaskRequest::kind` to a registered [`TaskBuilder`].
#[derive(Default, Clone)]
pub struct TaskRouter {
    builders: HashMap<String, Arc<dyn TaskBuilder>>,
}

impl TaskRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, kind: impl Into<String>, builder: Arc<dyn TaskBuilder>) {
        self.builders.insert(kind.into(), builder);
    }

    #[must_use]
    pub fn with(mut self, kind: impl Into<String>, builder: Arc<dyn TaskBuilder>) -> Self {
        self.register(kind, builder);
        self
    }

    pub fn kinds(&self) -> impl Iterator<Item = &str> {
        self.builders.keys().map(String::as_str)
    }

    pub fn build(&self, request: &StartTaskRequest) -> Result<Box<dyn Task>, RunnerError> {
        let builder = self
            .builders
            .get(&request.kind)
            .ok_or_else(|| RunnerError::UnknownKind(request.kind.clone()))?;
        let task = builder
            .build(request)
            .map_err(|e| RunnerError::InvalidTask(format!("{e:#}")))?;
        debug!(task_id = %request.task_id, kind = %request.kind, "Built task");
        Ok(task)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Task bodies used by runner and client tests.

    use super::*;

    /// Sleeps for `duration`, then returns `"slept"`.
    pub struct Sleep {
        pub id: String,
        pub duration: Duration,
        pub timeout: Duration,
        pub resource: Option<String>,
    }

    impl Sleep {
        pub fn new(id: &str, duration: Duration) -> Self {
            Self {
                id: id.to_string(),
                duration,
                timeout: Duration::ZERO,
                resource: None,
            }
        }

        pub const fn with_timeout(mut self, timeout: Duration) -> Self {
            self.timeout = timeout;
            self
        }
    }

    #[async_trait]
    impl Task for Sleep {
        fn id(&self) -> &str {
            &self.id
        }

        fn kind(&self) -> &str {
            "sleep"
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn resource_key(&self) -> Option<&str> {
            self.resource.as_deref()
        }

        async fn run(&self, ctx: TaskContext) -> anyhow::Result<String> {
            ctx.progress.send("sleeping").await;
            tokio::select! {
                () = ctx.cancel.cancelled() => anyhow::bail!("interrupted"),
                () = tokio::time::sleep(self.duration) => Ok("slept".to_string()),
            }
        }
    }

    /// Ignores cancellation entirely.
    pub struct Stubborn(pub String);

    #[async_trait]
    impl Task for Stubborn {
        fn id(&self) -> &str {
            &self.0
        }

        fn kind(&self) -> &str {
            "stubborn"
        }

        fn timeout(&self) -> Duration {
            Duration::ZERO
        }

        async fn run(&self, _ctx: TaskContext) -> anyhow::Result<String> {
            std::future::pending::<()>().await;
            Ok(String::new())
        }
    }

    /// Panics as soon as it runs.
    pub struct Panics(pub String);

    #[async_trait]
    impl Task for Panics {
        fn id(&self) -> &str {
            &self.0
        }

        fn kind(&self) -> &str {
            "panics"
        }

        fn timeout(&self) -> Duration {
            Duration::ZERO
        }

        async fn run(&self, _ctx: TaskContext) -> anyhow::Result<String> {
            panic!("boom");
        }
    }

    /// Builds [`Sleep`] tasks from `{"ms": n}` params.
    pub struct SleepBuilder;

    impl TaskBuilder for SleepBuilder {
        fn build(&self, request: &StartTaskRequest) -> anyhow::Result<Box<dyn Task>> {
            let ms = request
                .params
                .get("ms")
                .and_then(serde_json::Value::as_u64)
                .ok_or_else(|| anyhow::anyhow!("missing ms"))?;
            Ok(Box::new(
                Sleep::new(&request.task_id, Duration::from_millis(ms))
                    .with_timeout(Duration::from_millis(request.timeout_ms)),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::SleepBuilder;
    use super::*;
    use serde_json::json;

    fn request(kind: &str, params: serde_json::Value) -> StartTaskRequest {
        StartTaskRequest {
            task_id: "t1".into(),
            flavor: TaskFlavor::Action,
            kind: kind.into(),
            params,
            timeout_ms: 0,
        }
    }

    #[test]
    fn router_builds_registered_kind() {
        let router = TaskRouter::new().with("sleep", Arc::new(SleepBuilder));
        let task = router.build(&request("sleep", json!({"ms": 5}))).unwrap();
        assert_eq!(task.id(), "t1");
        assert_eq!(task.kind(), "sleep");
    }

    #[test]
    fn router_rejects_unknown_kind() {
        let router = TaskRouter::new();
        let err = router.build(&request("nope", json!({}))).err().unwrap();
        assert_eq!(err, RunnerError::UnknownKind("nope".into()));
    }

    #[test]
    fn router_reports_builder_errors() {
        let router = TaskRouter::new().with("sleep", Arc::new(SleepBuilder));
        let err = router.build(&request("sleep", json!({}))).err().unwrap();
        assert_eq!(err, RunnerError::InvalidTask("missing ms".into()));
    }

    #[test]
    fn failed_result_report_carries_error_text() {
        let result = TaskResult {
            task_id: "a".into(),
            kind: "sleep".into(),
            flavor: TaskFlavor::Job,
            outcome: Err(TaskError::TimedOut(Duration::from_secs(1))),
            finished_at: Utc::now(),
        };
        let report = result.into_report();
        assert!(report.output.is_empty());
        assert_eq!(report.error.as_deref(), Some("killed after timeout of 1s"));
    }
}
