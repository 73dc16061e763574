//! Built-in `process` task: runs an external program and captures its output.

use std::process::Stdio;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tracing::{debug, instrument};

use super::task::{Task, TaskBuilder, TaskContext};
use crate::transport::protocol::StartTaskRequest;

pub const KIND: &str = "process";

#[derive(Debug, Clone, Deserialize)]
struct ProcessParams {
    program: String,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    resource: Option<String>,
}

/// Runs `program args...`; stdout becomes the task output.
///
/// A non-zero exit fails the task with the trimmed stderr. The child is
/// killed on cancellation and whenever the task is dropped.
#[derive(Debug, Clone)]
pub struct ProcessTask {
    id: String,
    program: String,
    args: Vec<String>,
    timeout: Duration,
    resource: Option<String>,
}

impl ProcessTask {
    pub fn new(id: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            id: id.into(),
            program: program.into(),
            args,
            timeout: Duration::ZERO,
            resource: None,
        }
    }

    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl Task for ProcessTask {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> &str {
        KIND
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn resource_key(&self) -> Option<&str> {
        self.resource.as_deref()
    }

    #[instrument(skip(self, ctx), fields(task_id = %self.id, program = %self.program))]
    async fn run(&self, ctx: TaskContext) -> Result<String> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn {}", self.program))?;

        if let Some(pid) = child.id() {
            ctx.progress.send(format!("started pid {pid}")).await;
        }

        // Pipes are taken out so `child` stays available for kill.
        let mut child_stdout = child.stdout.take().context("Failed to open stdout")?;
        let mut child_stderr = child.stderr.take().context("Failed to open stderr")?;

        let read_all = async {
            let mut stdout_buf = Vec::new();
            let mut stderr_buf = Vec::new();
            let (r1, r2) = tokio::join!(
                child_stdout.read_to_end(&mut stdout_buf),
                child_stderr.read_to_end(&mut stderr_buf),
            );
            r1.context("Failed to read stdout")?;
            r2.context("Failed to read stderr")?;
            Ok::<_, anyhow::Error>((stdout_buf, stderr_buf))
        };

        let (stdout_buf, stderr_buf) = tokio::select! {
            result = read_all => result?,
            () = ctx.cancel.cancelled() => {
                let _ = child.kill().await;
                bail!("{} killed on cancellation", self.program);
            }
        };

        let status = child.wait().await.context("Failed to wait for process")?;
        debug!(exit_code = status.code().unwrap_or(-1), "Process exited");

        if !status.success() {
            let stderr = String::from_utf8_lossy(&stderr_buf);
            bail!("{} exited with {status}: {}", self.program, stderr.trim());
        }
        Ok(String::from_utf8_lossy(&stdout_buf).into_owned())
    }
}

/// Builds [`ProcessTask`]s from `{"program", "args", "resource"}` params.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessBuilder;

impl TaskBuilder for ProcessBuilder {
    fn build(&self, request: &StartTaskRequest) -> Result<Box<dyn Task>> {
        let params: ProcessParams = serde_json::from_value(request.params.clone())
            .context("process params must be {\"program\": string, \"args\": [string]}")?;
        if params.program.is_empty() {
            bail!("empty program");
        }
        Ok(Box::new(ProcessTask {
            id: request.task_id.clone(),
            program: params.program,
            args: params.args,
            timeout: Duration::from_millis(request.timeout_ms),
            resource: params.resource,
        }))
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::runner::task::Progress;
    use crate::transport::protocol::TaskFlavor;
    use serde_json::json;
    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    fn context() -> (TaskContext, mpsc::Receiver<crate::runner::TaskMessage>) {
        let (tx, rx) = mpsc::channel(8);
        let ctx = TaskContext {
            cancel: CancellationToken::new(),
            progress: Progress::new("t".into(), KIND.into(), TaskFlavor::Action, tx),
        };
        (ctx, rx)
    }

    fn sh(script: &str) -> ProcessTask {
        ProcessTask::new("t", "/bin/sh", vec!["-c".into(), script.into()])
    }

    #[tokio::test]
    async fn captures_stdout() {
        let (ctx, mut rx) = context();
        let output = sh("echo hello").run(ctx).await.unwrap();
        assert_eq!(output.trim(), "hello");
        assert!(rx.recv().await.is_some());
    }

    #[tokio::test]
    async fn non_zero_exit_fails_with_stderr() {
        let (ctx, _rx) = context();
        let err = sh("echo broken >&2; exit 3").run(ctx).await.unwrap_err();
        let message = format!("{err:#}");
        assert!(message.contains("broken"), "{message}");
    }

    #[tokio::test]
    async fn missing_program_fails_to_spawn() {
        let (ctx, _rx) = context();
        let err = ProcessTask::new("t", "/nonexistent/program", vec![])
            .run(ctx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to spawn"));
    }

    #[tokio::test]
    async fn cancellation_kills_child() {
        let (ctx, _rx) = context();
        let cancel = ctx.cancel.clone();
        let run = tokio::spawn(async move { sh("sleep 30").run(ctx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        let res = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert!(res.unwrap_err().to_string().contains("killed on cancellation"));
    }

    #[test]
    fn builder_reads_params() {
        let request = StartTaskRequest {
            task_id: "p1".into(),
            flavor: TaskFlavor::Job,
            kind: KIND.into(),
            params: json!({"program": "ls", "args": ["-l"], "resource": "db:1"}),
            timeout_ms: 1500,
        };
        let task = ProcessBuilder.build(&request).unwrap();
        assert_eq!(task.id(), "p1");
        assert_eq!(task.timeout(), Duration::from_millis(1500));
        assert_eq!(task.resource_key(), Some("db:1"));
    }

    #[test]
    fn builder_rejects_missing_program() {
        let request = StartTaskRequest {
            task_id: "p1".into(),
            flavor: TaskFlavor::Action,
            kind: KIND.into(),
            params: json!({"args": []}),
            timeout_ms: 0,
        };
        assert!(ProcessBuilder.build(&request).is_err());
    }
}
