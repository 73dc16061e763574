//! Controller-side handlers for agent requests, routed by payload kind.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::transport::protocol::{CollectResponse, StateChangedResponse};
use crate::transport::{AgentRequest, Payload, ServerResponse};

/// Domain logic for one or more agent request kinds.
///
/// Returning `Ok(None)` means no reply, which is right for notifications.
/// An error is logged and answered with an error frame; it never ends the
/// session.
#[async_trait]
pub trait RequestHandler: Send + Sync {
    async fn handle(
        &self,
        agent_id: &str,
        request: AgentRequest,
    ) -> anyhow::Result<Option<ServerResponse>>;
}

/// Kind → handler table.
#[derive(Default, Clone)]
pub struct Handlers {
    routes: HashMap<&'static str, Arc<dyn RequestHandler>>,
}

impl Handlers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every non-ping agent request kind answered by [`LogHandler`].
    pub fn logging() -> Self {
        let log: Arc<dyn RequestHandler> = Arc::new(LogHandler);
        let mut handlers = Self::new();
        for kind in AgentRequest::KINDS.iter().copied().filter(|k| *k != "ping") {
            handlers.register(kind, Arc::clone(&log));
        }
        handlers
    }

    pub fn register(&mut self, kind: &'static str, handler: Arc<dyn RequestHandler>) {
        self.routes.insert(kind, handler);
    }

    #[must_use]
    pub fn with(mut self, kind: &'static str, handler: Arc<dyn RequestHandler>) -> Self {
        self.register(kind, handler);
        self
    }

    pub fn get(&self, kind: &str) -> Option<&Arc<dyn RequestHandler>> {
        self.routes.get(kind)
    }
}

/// Logs every request and acknowledges the ones that expect an answer.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogHandler;

#[async_trait]
impl RequestHandler for LogHandler {
    async fn handle(
        &self,
        agent_id: &str,
        request: AgentRequest,
    ) -> anyhow::Result<Option<ServerResponse>> {
        Ok(match request {
            AgentRequest::StateChanged(change) => {
                info!(
                    agent_id,
                    process = %change.agent_id,
                    status = %change.status,
                    listen_port = change.listen_port,
                    "State changed"
                );
                Some(StateChangedResponse {}.into())
            }
            AgentRequest::Collect(collect) => {
                debug!(agent_id, buckets = collect.metrics.len(), "Collected metrics");
                Some(CollectResponse {}.into())
            }
            AgentRequest::TaskProgress(progress) => {
                debug!(
                    agent_id,
                    task_id = %progress.task_id,
                    message = %progress.message,
                    "Task progress"
                );
                None
            }
            AgentRequest::TaskResult(result) => {
                match &result.error {
                    None => info!(
                        agent_id,
                        task_id = %result.task_id,
                        kind = %result.kind,
                        "Task succeeded"
                    ),
                    Some(error) => warn!(
                        agent_id,
                        task_id = %result.task_id,
                        kind = %result.kind,
                        %error,
                        "Task failed"
                    ),
                }
                None
            }
            AgentRequest::Ping(_) => None,
        })
    }
}

/// Forwards requests to a stream, answering like [`LogHandler`].
#[derive(Clone)]
pub struct ForwardHandler {
    tx: mpsc::Sender<(String, AgentRequest)>,
}

impl ForwardHandler {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<(String, AgentRequest)>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl RequestHandler for ForwardHandler {
    async fn handle(
        &self,
        agent_id: &str,
        request: AgentRequest,
    ) -> anyhow::Result<Option<ServerResponse>> {
        let response = LogHandler.handle(agent_id, request.clone()).await?;
        self.tx
            .send((agent_id.to_string(), request))
            .await
            .map_err(|_| anyhow::anyhow!("forward stream closed"))?;
        Ok(response)
    }
}
