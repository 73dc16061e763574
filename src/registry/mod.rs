//! Controller-side session registry.
//!
//! Owns one [`Channel`] per connected agent identity. A newer connection
//! for an identity always supersedes the older one, whose session ends as
//! [`Disconnect::Kicked`].

pub mod auth;
pub mod handlers;
pub mod metrics;

pub use auth::{Authenticator, Principal, PrincipalRecord, StaticAuthenticator};
pub use handlers::{ForwardHandler, Handlers, LogHandler, RequestHandler};
pub use metrics::RegistryMetrics;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde_json::Value;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::channel::{Channel, Request, Requests};
use crate::error::{AuthError, ChannelError, RequestError};
use crate::sync::{read, write};
use crate::transport::protocol::{
    Pong, SetStateRequest, StartTaskRequest, StopTaskRequest, TaskStatusRequest,
};
use crate::transport::{
    read_json, write_json, AgentConnectMetadata, AgentRequest, AgentResponse, ControllerSide,
    Payload, ServerConnectMetadata, ServerRequest, Stream,
};

/// Why a session ended. Exactly one per [`Registry::run`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Disconnect {
    /// Handshake or authentication failed; no session was created.
    Auth,
    /// The agent violated the protocol.
    Protocol,
    /// The stream closed or failed.
    PeerDisconnected,
    /// Superseded by a newer connection or kicked explicitly.
    Kicked,
    /// The controller is shutting down.
    Done,
}

impl Disconnect {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::Protocol => "protocol",
            Self::PeerDisconnected => "peer_disconnected",
            Self::Kicked => "kicked",
            Self::Done => "done",
        }
    }
}

impl std::fmt::Display for Disconnect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registry tuning.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Interval between liveness pings.
    pub ping_interval: Duration,
    /// How long a new connection may take to send its metadata.
    pub handshake_timeout: Duration,
    pub server_version: String,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

struct Session {
    serial: u64,
    agent_id: String,
    channel: Channel<ControllerSide>,
    kill: CancellationToken,
}

pub struct Registry {
    sessions: RwLock<HashMap<String, Arc<Session>>>,
    serial: AtomicU64,
    authenticator: Arc<dyn Authenticator>,
    handlers: Handlers,
    config: RegistryConfig,
    metrics: RegistryMetrics,
    shutdown: CancellationToken,
}

impl Registry {
    pub fn new(
        config: RegistryConfig,
        authenticator: Arc<dyn Authenticator>,
        handlers: Handlers,
        metrics: RegistryMetrics,
    ) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            serial: AtomicU64::new(0),
            authenticator,
            handlers,
            config,
            metrics,
            shutdown: CancellationToken::new(),
        }
    }

    /// Serve one agent connection until it ends.
    #[instrument(skip_all, fields(agent_id = tracing::field::Empty))]
    pub async fn run<T: Stream>(&self, stream: T) -> Disconnect {
        self.metrics.connects.inc();
        let reason = self.serve(stream).await;
        self.metrics
            .disconnects
            .with_label_values(&[reason.as_str()])
            .inc();
        reason
    }

    async fn serve<T: Stream>(&self, mut stream: T) -> Disconnect {
        let principal = match self.handshake(&mut stream).await {
            Ok(principal) => principal,
            Err(e) => {
                warn!(error = %e, "Failed to authenticate connected agent");
                return Disconnect::Auth;
            }
        };
        tracing::Span::current().record("agent_id", principal.id.as_str());

        let counters = self.metrics.channel.counters(&principal.id);
        let (channel, requests) = Channel::<ControllerSide>::from_stream(stream, Some(counters));
        let session = self.register(&principal.id, channel);
        let prober = self.spawn_prober(&session);

        let reason = self.dispatch(&session, requests).await;

        prober.abort();
        self.unregister(&session);
        session
            .channel
            .close(ChannelError::Shutdown(reason.as_str().to_string()));
        info!(%reason, "Disconnecting agent");
        reason
    }

    async fn handshake<T: Stream>(&self, stream: &mut T) -> Result<Principal, AuthError> {
        let metadata: AgentConnectMetadata = read_json(stream, self.config.handshake_timeout)
            .await
            .map_err(|e| AuthError::Handshake(e.to_string()))?;

        let principal = match self.authenticator.authenticate(&metadata).await {
            Ok(principal) => principal,
            Err(e) => {
                let reply = ServerConnectMetadata {
                    server_version: self.config.server_version.clone(),
                    node_id: String::new(),
                    error: Some(e.to_string()),
                };
                if let Err(write_err) = write_json(stream, &reply).await {
                    debug!(error = %write_err, "Failed to deliver rejection");
                }
                return Err(e);
            }
        };

        let reply = ServerConnectMetadata {
            server_version: self.config.server_version.clone(),
            node_id: principal.node_id.clone(),
            error: None,
        };
        debug!(?reply, "Sending metadata");
        write_json(stream, &reply)
            .await
            .map_err(|e| AuthError::Handshake(e.to_string()))?;

        info!(agent_id = %principal.id, version = %metadata.version, "Connected agent");
        Ok(principal)
    }

    fn register(&self, agent_id: &str, channel: Channel<ControllerSide>) -> Arc<Session> {
        let session = Arc::new(Session {
            serial: self.serial.fetch_add(1, Ordering::Relaxed) + 1,
            agent_id: agent_id.to_string(),
            channel,
            kill: CancellationToken::new(),
        });

        let mut sessions = write(&self.sessions);
        if let Some(previous) = sessions.insert(agent_id.to_string(), Arc::clone(&session)) {
            warn!(agent_id, "Another agent with this ID is already connected, kicking it");
            previous.kill.cancel();
        }
        self.metrics.connected.set(gauge(sessions.len()));
        session
    }

    /// Remove `session` unless a newer session already replaced it.
    fn unregister(&self, session: &Session) {
        let mut sessions = write(&self.sessions);
        let current = sessions
            .get(&session.agent_id)
            .is_some_and(|s| s.serial == session.serial);
        if current {
            sessions.remove(&session.agent_id);
            self.metrics.channel.forget(&session.agent_id);
        }
        self.metrics.connected.set(gauge(sessions.len()));
    }

    fn spawn_prober(&self, session: &Session) -> JoinHandle<()> {
        let channel = session.channel.clone();
        let metrics = self.metrics.clone();
        let interval = self.config.ping_interval;
        let agent_id = session.agent_id.clone();

        tokio::spawn(async move {
            let closed = channel.closed_token();
            let mut ticker = tokio::time::interval(interval);
            // The first tick completes immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = closed.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                match channel.measure().await {
                    Ok(info) => {
                        metrics.observe(&info);
                        info!(
                            %agent_id,
                            round_trip = ?info.round_trip,
                            clock_drift_ms = info.clock_drift.num_milliseconds(),
                            "Measured network"
                        );
                    }
                    Err(RequestError::Closed) => break,
                    Err(e) => warn!(%agent_id, error = %e, "Ping failed"),
                }
            }
            debug!(%agent_id, "Prober stopped");
        })
    }

    async fn dispatch(
        &self,
        session: &Session,
        mut requests: Requests<AgentRequest>,
    ) -> Disconnect {
        loop {
            let request = tokio::select! {
                biased;
                reason = self.stopped(session) => return reason,
                request = requests.recv() => request,
            };
            let Some(request) = request else {
                let reason = session.channel.wait().await;
                if reason.is_protocol_violation() {
                    error!(error = %reason, "Protocol violation");
                    return Disconnect::Protocol;
                }
                info!(error = %reason, "Channel closed");
                return Disconnect::PeerDisconnected;
            };

            // A handler that never finishes must not keep the session alive.
            tokio::select! {
                biased;
                reason = self.stopped(session) => return reason,
                handled = self.handle(session, request) => {
                    if let Err(reason) = handled {
                        return reason;
                    }
                }
            }
        }
    }

    /// Resolves once the session is kicked or the controller shuts down.
    async fn stopped(&self, session: &Session) -> Disconnect {
        tokio::select! {
            biased;
            () = session.kill.cancelled() => {
                warn!("Kicked");
                Disconnect::Kicked
            }
            () = self.shutdown.cancelled() => Disconnect::Done,
        }
    }

    async fn handle(
        &self,
        session: &Session,
        request: Request<AgentRequest>,
    ) -> Result<(), Disconnect> {
        let Request { id, payload } = request;
        let channel = &session.channel;

        if let AgentRequest::Ping(_) = payload {
            channel.reply(id, Pong::now().into()).await;
            return Ok(());
        }

        let kind = payload.kind();
        let Some(handler) = self.handlers.get(kind) else {
            error!(kind, "Unimplemented request");
            if id != 0 {
                channel.reply_error(id, format!("unimplemented: {kind}")).await;
            }
            channel.close(ChannelError::UnhandledPayload(kind.to_string()));
            return Err(Disconnect::Protocol);
        };

        match handler.handle(&session.agent_id, payload).await {
            Ok(Some(response)) if id != 0 => channel.reply(id, response).await,
            Ok(Some(_)) => debug!(kind, "Dropping response to notification"),
            Ok(None) if id != 0 => {
                warn!(kind, id, "Handler produced no response for a request");
            }
            Ok(None) => {}
            Err(e) => {
                warn!(kind, error = %format!("{e:#}"), "Request handler failed");
                if id != 0 {
                    channel.reply_error(id, e.to_string()).await;
                }
            }
        }
        Ok(())
    }

    /// Disconnect an agent. No-op if it is not connected.
    pub fn kick(&self, agent_id: &str) -> bool {
        let mut sessions = write(&self.sessions);
        let Some(session) = sessions.remove(agent_id) else {
            return false;
        };
        self.metrics.channel.forget(agent_id);
        self.metrics.connected.set(gauge(sessions.len()));
        drop(sessions);
        debug!(agent_id, "Agent will be kicked in a moment");
        session.kill.cancel();
        true
    }

    pub fn is_connected(&self, agent_id: &str) -> bool {
        read(&self.sessions).contains_key(agent_id)
    }

    /// IDs of all connected agents, sorted.
    pub fn connected(&self) -> Vec<String> {
        let mut ids: Vec<String> = read(&self.sessions).keys().cloned().collect();
        ids.sort();
        ids
    }

    fn channel(&self, agent_id: &str) -> Result<Channel<ControllerSide>, RequestError> {
        read(&self.sessions)
            .get(agent_id)
            .map(|s| s.channel.clone())
            .ok_or_else(|| RequestError::NotConnected(agent_id.to_string()))
    }

    /// Send a request to a connected agent and wait for its answer.
    pub async fn request(
        &self,
        agent_id: &str,
        payload: ServerRequest,
    ) -> Result<AgentResponse, RequestError> {
        self.channel(agent_id)?.send_and_wait(payload).await
    }

    pub async fn start_task(
        &self,
        agent_id: &str,
        request: StartTaskRequest,
    ) -> Result<(), RequestError> {
        match self.request(agent_id, request.into()).await? {
            AgentResponse::StartTask(_) => Ok(()),
            other => Err(RequestError::UnexpectedResponse(other.kind())),
        }
    }

    pub async fn stop_task(&self, agent_id: &str, task_id: &str) -> Result<(), RequestError> {
        let request = StopTaskRequest {
            task_id: task_id.to_string(),
        };
        match self.request(agent_id, request.into()).await? {
            AgentResponse::StopTask(_) => Ok(()),
            other => Err(RequestError::UnexpectedResponse(other.kind())),
        }
    }

    /// Whether `task_id` is still running on the agent.
    pub async fn task_status(&self, agent_id: &str, task_id: &str) -> Result<bool, RequestError> {
        let request = TaskStatusRequest {
            task_id: task_id.to_string(),
        };
        match self.request(agent_id, request.into()).await? {
            AgentResponse::TaskStatus(status) => Ok(status.alive),
            other => Err(RequestError::UnexpectedResponse(other.kind())),
        }
    }

    pub async fn set_state(&self, agent_id: &str, state: Value) -> Result<(), RequestError> {
        match self.request(agent_id, SetStateRequest { state }.into()).await? {
            AgentResponse::SetState(_) => Ok(()),
            other => Err(RequestError::UnexpectedResponse(other.kind())),
        }
    }

    /// End every session with [`Disconnect::Done`].
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub fn metrics(&self) -> &RegistryMetrics {
        &self.metrics
    }
}

fn gauge(len: usize) -> i64 {
    i64::try_from(len).unwrap_or(i64::MAX)
}
