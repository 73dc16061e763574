//! Agent-side client.
//!
//! Dials the controller with backoff, performs the handshake, serves
//! controller requests by dispatching to the action and job runners, and
//! forwards runner output as ID-0 notifications. A lost connection is
//! redialed; task output produced meanwhile waits in the runner streams.

pub mod backoff;

pub use backoff::Backoff;

use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::TimeDelta;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{Channel, ChannelMetrics, NetworkInfo, Request, Requests};
use crate::error::{ChannelError, ConnectError, RequestError, RunnerError};
use crate::runner::{ActionRunner, JobRunner, Limits, TaskMessage, TaskRouter};
use crate::sync::{read, write};
use crate::transport::protocol::{
    Pong, SetStateResponse, StartTaskRequest, StartTaskResponse, StopTaskResponse, TaskFlavor,
    TaskStatusResponse,
};
use crate::transport::{
    read_json, write_json, AgentConnectMetadata, AgentRequest, AgentResponse, AgentSide, Connector,
    ServerConnectMetadata, ServerRequest, ServerResponse, Side,
};

/// Applies configuration pushed by the controller with `set_state`.
#[async_trait]
pub trait StateApplier: Send + Sync {
    async fn apply(&self, state: Value) -> anyhow::Result<()>;
}

/// Keeps the last pushed state in memory.
#[derive(Debug, Default)]
pub struct InMemoryState {
    current: RwLock<Value>,
}

impl InMemoryState {
    pub fn current(&self) -> Value {
        read(&self.current).clone()
    }
}

#[async_trait]
impl StateApplier for InMemoryState {
    async fn apply(&self, state: Value) -> anyhow::Result<()> {
        if !(state.is_object() || state.is_null()) {
            anyhow::bail!("state must be a JSON object");
        }
        debug!(state = %state, "Applying state");
        *write(&self.current) = state;
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub agent_id: String,
    pub version: String,
    pub dial_timeout: Duration,
    pub backoff_min: Duration,
    pub backoff_max: Duration,
    /// Clock drift above this is logged as a warning.
    pub clock_drift_warning: Duration,
    pub total_capacity: usize,
    pub resource_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            agent_id: String::new(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            dial_timeout: Duration::from_secs(5),
            backoff_min: Duration::from_secs(1),
            backoff_max: Duration::from_secs(15),
            clock_drift_warning: Duration::from_secs(5),
            total_capacity: 0,
            resource_capacity: 0,
        }
    }
}

/// Runner result streams, owned by whichever `run` call is active.
struct Outbox {
    actions: mpsc::Receiver<TaskMessage>,
    jobs: mpsc::Receiver<TaskMessage>,
}

enum SessionEnd {
    Shutdown,
    Disconnected(ChannelError),
}

pub struct Client {
    config: ClientConfig,
    connector: Arc<dyn Connector>,
    router: TaskRouter,
    state: Arc<dyn StateApplier>,
    actions: ActionRunner,
    jobs: JobRunner,
    root: CancellationToken,
    outbox: AsyncMutex<Outbox>,
    channel: RwLock<Option<Channel<AgentSide>>>,
    metadata: RwLock<Option<ServerConnectMetadata>>,
    metrics: Option<ChannelMetrics>,
}

impl Client {
    pub fn new(
        config: ClientConfig,
        connector: Arc<dyn Connector>,
        router: TaskRouter,
        state: Arc<dyn StateApplier>,
    ) -> Self {
        let root = CancellationToken::new();
        let limits = Limits::new(config.total_capacity, config.resource_capacity);
        let (actions, action_messages) = ActionRunner::new(root.clone(), Arc::clone(&limits));
        let (jobs, job_messages) = JobRunner::new(root.clone(), limits);
        Self {
            config,
            connector,
            router,
            state,
            actions,
            jobs,
            root,
            outbox: AsyncMutex::new(Outbox {
                actions: action_messages,
                jobs: job_messages,
            }),
            channel: RwLock::new(None),
            metadata: RwLock::new(None),
            metrics: None,
        }
    }

    #[must_use]
    pub fn with_metrics(mut self, metrics: ChannelMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Connect and serve until `shutdown` fires, redialing lost connections.
    ///
    /// On shutdown the runners are cancelled and their remaining results are
    /// forwarded before the connection is closed. The client cannot be run
    /// again afterwards.
    #[instrument(skip_all, fields(agent_id = %self.config.agent_id))]
    pub async fn run(&self, shutdown: CancellationToken) {
        let mut outbox = self.outbox.lock().await;

        if self.config.agent_id.is_empty() {
            error!("Agent ID is not provided, halting");
            shutdown.cancelled().await;
            self.root.cancel();
            return;
        }

        let mut backoff = Backoff::new(self.config.backoff_min, self.config.backoff_max);
        while !shutdown.is_cancelled() {
            let Some((channel, requests)) = self.connect_with_backoff(&mut backoff, &shutdown).await
            else {
                break;
            };
            backoff.reset();

            let end = self.serve(&channel, requests, &mut outbox, &shutdown).await;
            *write(&self.channel) = None;
            match end {
                SessionEnd::Shutdown => break,
                SessionEnd::Disconnected(reason) => {
                    warn!(error = %reason, "Connection lost");
                }
            }
        }

        self.root.cancel();
        discard(&mut outbox.actions).await;
        discard(&mut outbox.jobs).await;
        info!("Done");
    }

    async fn connect_with_backoff(
        &self,
        backoff: &mut Backoff,
        shutdown: &CancellationToken,
    ) -> Option<(Channel<AgentSide>, Requests<ServerRequest>)> {
        loop {
            let attempt = tokio::select! {
                () = shutdown.cancelled() => return None,
                attempt = self.connect() => attempt,
            };
            match attempt {
                Ok(connected) => return Some(connected),
                Err(e) => {
                    let delay = backoff.delay();
                    error!(
                        server = %self.connector.target(),
                        error = %e,
                        ?delay,
                        "Failed to connect"
                    );
                    tokio::select! {
                        () = shutdown.cancelled() => return None,
                        () = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One dial + handshake + initial ping.
    async fn connect(&self) -> Result<(Channel<AgentSide>, Requests<ServerRequest>), ConnectError> {
        let dial_timeout = self.config.dial_timeout;
        info!(server = %self.connector.target(), "Connecting");
        let mut stream = tokio::time::timeout(dial_timeout, self.connector.connect())
            .await
            .map_err(|_| ConnectError::Timeout(dial_timeout))?
            .map_err(ConnectError::Dial)?;

        let start = Instant::now();
        let metadata = AgentConnectMetadata {
            id: self.config.agent_id.clone(),
            version: self.config.version.clone(),
        };
        write_json(&mut stream, &metadata).await?;
        let server: ServerConnectMetadata = read_json(&mut stream, dial_timeout).await?;
        debug!(?server, "Received server metadata");
        if let Some(error) = server.error {
            return Err(ConnectError::Rejected(error));
        }
        if server.server_version.is_empty() {
            return Err(ConnectError::MissingServerVersion);
        }

        let counters = self
            .metrics
            .as_ref()
            .map(|m| m.counters(AgentSide::PEER));
        let (channel, requests) = Channel::<AgentSide>::from_stream(stream, counters);

        let info = match tokio::time::timeout(dial_timeout, channel.measure()).await {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                channel.close(ChannelError::Shutdown("initial ping failed".into()));
                return Err(e.into());
            }
            Err(_) => {
                channel.close(ChannelError::Shutdown("initial ping timed out".into()));
                return Err(ConnectError::Timeout(dial_timeout));
            }
        };

        let elapsed = start.elapsed();
        let drift_ms = info.clock_drift.num_milliseconds();
        if exceeds(info.clock_drift, self.config.clock_drift_warning) {
            warn!(
                ?elapsed,
                drift_ms,
                "Two-way communication channel established, clock drift is high"
            );
        } else {
            info!(?elapsed, drift_ms, "Two-way communication channel established");
        }

        *write(&self.metadata) = Some(server);
        *write(&self.channel) = Some(channel.clone());
        Ok((channel, requests))
    }

    async fn serve(
        &self,
        channel: &Channel<AgentSide>,
        mut requests: Requests<ServerRequest>,
        outbox: &mut Outbox,
        shutdown: &CancellationToken,
    ) -> SessionEnd {
        let mut draining = false;
        let mut actions_done = false;
        let mut jobs_done = false;

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled(), if !draining => {
                    info!(
                        actions = self.actions.in_flight(),
                        jobs = self.jobs.in_flight(),
                        "Stopping runners"
                    );
                    draining = true;
                    self.root.cancel();
                }
                request = requests.recv() => {
                    let Some(request) = request else {
                        return SessionEnd::Disconnected(channel.wait().await);
                    };
                    self.handle(channel, request, shutdown).await;
                }
                message = outbox.actions.recv(), if !actions_done => match message {
                    Some(message) => channel.send(message.into_request()).await,
                    None => actions_done = true,
                },
                message = outbox.jobs.recv(), if !jobs_done => match message {
                    Some(message) => channel.send(message.into_request()).await,
                    None => jobs_done = true,
                },
            }

            if actions_done && jobs_done {
                debug!("Runner streams drained");
                channel.close(ChannelError::Shutdown("agent stopped".into()));
                return SessionEnd::Shutdown;
            }
        }
    }

    async fn handle(
        &self,
        channel: &Channel<AgentSide>,
        request: Request<ServerRequest>,
        shutdown: &CancellationToken,
    ) {
        let Request { id, payload } = request;
        let response: Result<AgentResponse, String> = match payload {
            ServerRequest::Ping(_) => Ok(Pong::now().into()),
            ServerRequest::SetState(req) => {
                // An applier that never returns must not block shutdown.
                let applied = tokio::select! {
                    biased;
                    () = shutdown.cancelled() => Err(anyhow::anyhow!("agent is shutting down")),
                    applied = self.state.apply(req.state) => applied,
                };
                match applied {
                    Ok(()) => Ok(SetStateResponse {}.into()),
                    Err(e) => Err(format!("{e:#}")),
                }
            }
            ServerRequest::StartTask(req) => match self.start_task(&req) {
                Ok(()) => Ok(StartTaskResponse {}.into()),
                Err(e) => {
                    warn!(
                        task_id = %req.task_id,
                        kind = %req.kind,
                        error = %e,
                        "Failed to start task"
                    );
                    Err(e.to_string())
                }
            },
            ServerRequest::StopTask(req) => {
                self.actions.stop(&req.task_id);
                self.jobs.stop(&req.task_id);
                Ok(StopTaskResponse {}.into())
            }
            ServerRequest::TaskStatus(req) => Ok(TaskStatusResponse {
                alive: self.actions.is_running(&req.task_id) || self.jobs.is_running(&req.task_id),
            }
            .into()),
        };

        if id == 0 {
            debug!("Controller notification handled, no reply");
            return;
        }
        match response {
            Ok(response) => channel.reply(id, response).await,
            Err(message) => channel.reply_error(id, message).await,
        }
    }

    fn start_task(&self, request: &StartTaskRequest) -> Result<(), RunnerError> {
        let task = self.router.build(request)?;
        match request.flavor {
            TaskFlavor::Action => self.actions.start(task),
            TaskFlavor::Job => self.jobs.start(task),
        }
    }

    fn current_channel(&self) -> Result<Channel<AgentSide>, RequestError> {
        read(&self.channel)
            .clone()
            .ok_or_else(|| RequestError::NotConnected(AgentSide::PEER.to_string()))
    }

    /// Send a request to the controller, e.g. `state_changed` or `collect`.
    pub async fn send_request(
        &self,
        request: AgentRequest,
    ) -> Result<ServerResponse, RequestError> {
        self.current_channel()?.send_and_wait(request).await
    }

    /// Round trip and clock drift to the controller, measured now.
    pub async fn network_info(&self) -> Result<NetworkInfo, RequestError> {
        self.current_channel()?.measure().await
    }

    /// Metadata from the last successful handshake.
    pub fn server_metadata(&self) -> Option<ServerConnectMetadata> {
        read(&self.metadata).clone()
    }

    pub fn is_connected(&self) -> bool {
        read(&self.channel).as_ref().is_some_and(|c| !c.is_closed())
    }
}

fn exceeds(drift: TimeDelta, limit: Duration) -> bool {
    drift
        .abs()
        .to_std()
        .map_or(true, |drift| drift > limit)
}

async fn discard(messages: &mut mpsc::Receiver<TaskMessage>) {
    while let Some(message) = messages.recv().await {
        warn!(task_id = %message.task_id(), "Not connected, dropping task message");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{
        ForwardHandler, Handlers, Registry, RegistryConfig, RegistryMetrics, StaticAuthenticator,
    };
    use crate::runner::task::testing::SleepBuilder;
    use crate::runner::ProcessBuilder;
    use crate::transport::protocol::{StateChangedRequest, TaskResultReport};
    use crate::transport::BoxStream;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const TICK: Duration = Duration::from_secs(5);

    /// Connects straight into a registry over an in-memory pipe.
    struct PipeConnector {
        registry: Arc<Registry>,
        dials: AtomicUsize,
    }

    #[async_trait]
    impl Connector for PipeConnector {
        async fn connect(&self) -> std::io::Result<BoxStream> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (client, server) = tokio::io::duplex(64 * 1024);
            let registry = Arc::clone(&self.registry);
            tokio::spawn(async move { registry.run(server).await });
            Ok(Box::new(client))
        }

        fn target(&self) -> String {
            "pipe".to_string()
        }
    }

    struct Harness {
        registry: Arc<Registry>,
        connector: Arc<PipeConnector>,
        client: Arc<Client>,
        state: Arc<InMemoryState>,
        results: mpsc::Receiver<(String, AgentRequest)>,
        shutdown: CancellationToken,
        run: tokio::task::JoinHandle<()>,
    }

    fn harness(agent_id: &str) -> Harness {
        let state = Arc::new(InMemoryState::default());
        harness_with(agent_id, Arc::clone(&state), state)
    }

    /// `state` is what tests inspect; `applier` is what the client calls.
    fn harness_with(
        agent_id: &str,
        state: Arc<InMemoryState>,
        applier: Arc<dyn StateApplier>,
    ) -> Harness {
        let (forward, results) = ForwardHandler::new(64);
        let forward = Arc::new(forward);
        let handlers = Handlers::logging()
            .with("task_result", forward.clone())
            .with("task_progress", forward);
        let registry = Arc::new(Registry::new(
            RegistryConfig::default(),
            Arc::new(StaticAuthenticator::agents(["agent-1"])),
            handlers,
            RegistryMetrics::new("test").unwrap(),
        ));
        let connector = Arc::new(PipeConnector {
            registry: Arc::clone(&registry),
            dials: AtomicUsize::new(0),
        });
        let config = ClientConfig {
            agent_id: agent_id.to_string(),
            backoff_min: Duration::from_millis(10),
            backoff_max: Duration::from_millis(20),
            ..ClientConfig::default()
        };
        let router = TaskRouter::new()
            .with("sleep", Arc::new(SleepBuilder))
            .with(crate::runner::process::KIND, Arc::new(ProcessBuilder));
        let client = Arc::new(Client::new(config, connector.clone(), router, applier));
        let shutdown = CancellationToken::new();
        let run = {
            let client = Arc::clone(&client);
            let shutdown = shutdown.clone();
            tokio::spawn(async move { client.run(shutdown).await })
        };
        Harness {
            registry,
            connector,
            client,
            state,
            results,
            shutdown,
            run,
        }
    }

    impl Harness {
        async fn connected(&self) {
            tokio::time::timeout(TICK, async {
                while !(self.registry.is_connected("agent-1") && self.client.is_connected()) {
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .unwrap();
        }

        async fn next_result(&mut self) -> TaskResultReport {
            loop {
                let (_, request) = tokio::time::timeout(TICK, self.results.recv())
                    .await
                    .unwrap()
                    .unwrap();
                if let AgentRequest::TaskResult(result) = request {
                    return result;
                }
            }
        }
    }

    fn sleep_task(id: &str, flavor: TaskFlavor, ms: u64, timeout_ms: u64) -> StartTaskRequest {
        StartTaskRequest {
            task_id: id.into(),
            flavor,
            kind: "sleep".into(),
            params: json!({ "ms": ms }),
            timeout_ms,
        }
    }

    #[tokio::test]
    async fn two_tasks_report_results_to_controller() {
        let mut h = harness("agent-1");
        h.connected().await;

        for id in ["a", "b"] {
            h.registry
                .start_task("agent-1", sleep_task(id, TaskFlavor::Action, 10, 0))
                .await
                .unwrap();
        }

        let mut ids = vec![h.next_result().await, h.next_result().await];
        ids.sort_by(|x, y| x.task_id.cmp(&y.task_id));
        assert_eq!(ids[0].task_id, "a");
        assert_eq!(ids[1].task_id, "b");
        assert!(ids.iter().all(|r| r.error.is_none() && r.output == "slept"));
        assert!(!h.registry.task_status("agent-1", "a").await.unwrap());
    }

    #[tokio::test]
    async fn timed_out_task_reports_error() {
        let mut h = harness("agent-1");
        h.connected().await;

        h.registry
            .start_task("agent-1", sleep_task("slow", TaskFlavor::Job, 20_000, 100))
            .await
            .unwrap();

        let result = h.next_result().await;
        assert_eq!(result.task_id, "slow");
        assert_eq!(result.error.as_deref(), Some("killed after timeout of 100ms"));
    }

    #[tokio::test]
    async fn stop_task_cancels_on_agent() {
        let mut h = harness("agent-1");
        h.connected().await;

        h.registry
            .start_task("agent-1", sleep_task("j", TaskFlavor::Job, 60_000, 0))
            .await
            .unwrap();
        assert!(h.registry.task_status("agent-1", "j").await.unwrap());

        h.registry.stop_task("agent-1", "j").await.unwrap();
        let result = h.next_result().await;
        assert_eq!(result.error.as_deref(), Some("canceled"));
        assert_eq!(result.flavor, TaskFlavor::Job);
    }

    #[tokio::test]
    async fn start_task_errors_are_answered() {
        let h = harness("agent-1");
        h.connected().await;

        let mut bad = sleep_task("x", TaskFlavor::Action, 1, 0);
        bad.kind = "format_disk".into();
        assert_eq!(
            h.registry.start_task("agent-1", bad).await,
            Err(RequestError::Remote(r#"no task builder for kind "format_disk""#.into()))
        );

        h.registry
            .start_task("agent-1", sleep_task("dup", TaskFlavor::Job, 60_000, 0))
            .await
            .unwrap();
        assert_eq!(
            h.registry
                .start_task("agent-1", sleep_task("dup", TaskFlavor::Job, 60_000, 0))
                .await,
            Err(RequestError::Remote(r#"task "dup" is already running"#.into()))
        );
    }

    #[tokio::test]
    async fn set_state_is_applied() {
        let h = harness("agent-1");
        h.connected().await;

        h.registry
            .set_state("agent-1", json!({"exporters": ["node"]}))
            .await
            .unwrap();
        assert_eq!(h.state.current(), json!({"exporters": ["node"]}));

        assert!(matches!(
            h.registry.set_state("agent-1", json!([1, 2])).await,
            Err(RequestError::Remote(_))
        ));
    }

    /// Never finishes applying.
    struct StuckState;

    #[async_trait]
    impl StateApplier for StuckState {
        async fn apply(&self, _state: Value) -> anyhow::Result<()> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn shutdown_is_not_blocked_by_a_stuck_applier() {
        let h = harness_with("agent-1", Arc::default(), Arc::new(StuckState));
        h.connected().await;

        let pushed = {
            let registry = Arc::clone(&h.registry);
            tokio::spawn(async move { registry.set_state("agent-1", json!({"a": 1})).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!pushed.is_finished());

        h.shutdown.cancel();
        tokio::time::timeout(TICK, h.run).await.unwrap().unwrap();
        let pushed = tokio::time::timeout(TICK, pushed).await.unwrap().unwrap();
        assert!(pushed.is_err());
    }

    #[tokio::test]
    async fn agent_requests_reach_controller() {
        let h = harness("agent-1");
        h.connected().await;

        let change = StateChangedRequest {
            agent_id: "node-exporter".into(),
            status: "running".into(),
            listen_port: 42000,
            process_exec_path: String::new(),
        };
        let response = h.client.send_request(change.into()).await.unwrap();
        assert!(matches!(response, ServerResponse::StateChanged(_)));

        let info = h.client.network_info().await.unwrap();
        assert!(info.round_trip < TICK);
        assert_eq!(
            h.client.server_metadata().unwrap().server_version,
            env!("CARGO_PKG_VERSION")
        );
    }

    #[tokio::test]
    async fn kicked_client_reconnects() {
        let h = harness("agent-1");
        h.connected().await;
        assert_eq!(h.connector.dials.load(Ordering::SeqCst), 1);

        h.registry.kick("agent-1");
        tokio::time::timeout(TICK, async {
            while h.connector.dials.load(Ordering::SeqCst) < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        h.connected().await;
    }

    #[tokio::test]
    async fn rejected_agent_keeps_retrying_until_shutdown() {
        let h = harness("stranger");
        tokio::time::timeout(TICK, async {
            while h.connector.dials.load(Ordering::SeqCst) < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!h.client.is_connected());

        h.shutdown.cancel();
        tokio::time::timeout(TICK, h.run).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn shutdown_forwards_results_before_closing() {
        let mut h = harness("agent-1");
        h.connected().await;

        h.registry
            .start_task("agent-1", sleep_task("long", TaskFlavor::Job, 60_000, 0))
            .await
            .unwrap();
        h.shutdown.cancel();

        let result = h.next_result().await;
        assert_eq!(result.task_id, "long");
        assert_eq!(result.error.as_deref(), Some("canceled"));

        tokio::time::timeout(TICK, h.run).await.unwrap().unwrap();
        assert!(!h.client.is_connected());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn process_task_end_to_end() {
        let mut h = harness("agent-1");
        h.connected().await;

        let request = StartTaskRequest {
            task_id: "echo".into(),
            flavor: TaskFlavor::Action,
            kind: crate::runner::process::KIND.into(),
            params: json!({"program": "/bin/sh", "args": ["-c", "echo ready"]}),
            timeout_ms: 0,
        };
        h.registry.start_task("agent-1", request).await.unwrap();

        let result = h.next_result().await;
        assert_eq!(result.output.trim(), "ready");
    }

    #[tokio::test]
    async fn missing_agent_id_halts_until_shutdown() {
        let h = harness("");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(h.connector.dials.load(Ordering::SeqCst), 0);

        h.shutdown.cancel();
        tokio::time::timeout(TICK, h.run).await.unwrap().unwrap();
    }

    #[test]
    fn drift_threshold() {
        let limit = Duration::from_secs(5);
        assert!(!exceeds(TimeDelta::seconds(-4), limit));
        assert!(exceeds(TimeDelta::seconds(-6), limit));
        assert!(exceeds(TimeDelta::seconds(6), limit));
    }
}
