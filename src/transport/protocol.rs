//! Control-plane message catalogue.
//!
//! Each direction has its own disjoint request and response sets. Every
//! payload is a struct whose fields become the frame `body`; the enum variant
//! is identified on the wire by its `kind` string.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A set of payload variants that can travel in a [`Frame`](super::Frame).
pub trait Payload: Sized + Send + 'static {
    /// Every `kind` string this set can decode.
    const KINDS: &'static [&'static str];

    fn kind(&self) -> &'static str;

    fn to_body(&self) -> serde_json::Result<Value>;

    /// Decode `body` as the variant named by `kind`.
    ///
    /// Returns `None` when `kind` does not belong to this set. A missing body
    /// is treated as an empty object.
    fn from_body(kind: &str, body: Value) -> Option<serde_json::Result<Self>>;

    fn is_kind(kind: &str) -> bool {
        Self::KINDS.contains(&kind)
    }
}

macro_rules! payload_enum {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            $($variant:ident($ty:ty) = $kind:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq)]
        $vis enum $name {
            $($variant($ty)),+
        }

        impl Payload for $name {
            const KINDS: &'static [&'static str] = &[$($kind),+];

            fn kind(&self) -> &'static str {
                match self {
                    $(Self::$variant(_) => $kind),+
                }
            }

            fn to_body(&self) -> serde_json::Result<Value> {
                match self {
                    $(Self::$variant(inner) => serde_json::to_value(inner)),+
                }
            }

            fn from_body(kind: &str, body: Value) -> Option<serde_json::Result<Self>> {
                let body = if body.is_null() {
                    Value::Object(serde_json::Map::new())
                } else {
                    body
                };
                match kind {
                    $($kind => Some(serde_json::from_value::<$ty>(body).map(Self::$variant)),)+
                    _ => None,
                }
            }
        }

        $(
            impl From<$ty> for $name {
                fn from(inner: $ty) -> Self {
                    Self::$variant(inner)
                }
            }
        )+
    };
}

// ── Handshake ───────────────────────────────────────────────────────

/// First frame an agent writes after connecting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentConnectMetadata {
    pub id: String,
    #[serde(default)]
    pub version: String,
}

/// Controller's answer to [`AgentConnectMetadata`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConnectMetadata {
    #[serde(default)]
    pub server_version: String,
    /// Node the authenticated agent runs on.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub node_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

// ── Shared ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pong {
    pub current_time: DateTime<Utc>,
}

impl Pong {
    pub fn now() -> Self {
        Self {
            current_time: Utc::now(),
        }
    }
}

/// Which runner a task belongs to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskFlavor {
    /// Short-lived, bounded by a default timeout.
    #[default]
    Action,
    /// Long-running, runs until stopped unless a timeout is given.
    Job,
}

impl TaskFlavor {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Action => "action",
            Self::Job => "job",
        }
    }
}

impl std::fmt::Display for TaskFlavor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Controller → agent ──────────────────────────────────────────────

/// Desired agent configuration, applied by the agent's `StateApplier`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SetStateRequest {
    #[serde(default)]
    pub state: Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStateResponse {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartTaskRequest {
    pub task_id: String,
    #[serde(default)]
    pub flavor: TaskFlavor,
    pub kind: String,
    #[serde(default)]
    pub params: Value,
    /// Zero selects the flavor's default.
    #[serde(default)]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartTaskResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTaskRequest {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopTaskResponse {}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusRequest {
    pub task_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskStatusResponse {
    pub alive: bool,
}

// ── Agent → controller ──────────────────────────────────────────────

/// Status change of a process supervised by the agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangedRequest {
    pub agent_id: String,
    pub status: String,
    #[serde(default)]
    pub listen_port: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub process_exec_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateChangedResponse {}

/// Batch of collected metric buckets pushed to the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectRequest {
    #[serde(default)]
    pub metrics: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectResponse {}

/// Intermediate output of a running task. Sent with ID 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskProgressReport {
    pub task_id: String,
    pub kind: String,
    pub flavor: TaskFlavor,
    pub message: String,
    pub at: DateTime<Utc>,
}

/// Final outcome of a task. Sent with ID 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskResultReport {
    pub task_id: String,
    pub kind: String,
    pub flavor: TaskFlavor,
    #[serde(default)]
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

payload_enum! {
    /// Requests the controller sends to an agent.
    pub enum ServerRequest {
        Ping(Ping) = "ping",
        SetState(SetStateRequest) = "set_state",
        StartTask(StartTaskRequest) = "start_task",
        StopTask(StopTaskRequest) = "stop_task",
        TaskStatus(TaskStatusRequest) = "task_status",
    }
}

payload_enum! {
    /// Agent answers to [`ServerRequest`].
    pub enum AgentResponse {
        Pong(Pong) = "pong",
        SetState(SetStateResponse) = "set_state_ack",
        StartTask(StartTaskResponse) = "start_task_ack",
        StopTask(StopTaskResponse) = "stop_task_ack",
        TaskStatus(TaskStatusResponse) = "task_status",
    }
}

payload_enum! {
    /// Requests and notifications an agent sends to the controller.
    pub enum AgentRequest {
        Ping(Ping) = "ping",
        StateChanged(StateChangedRequest) = "state_changed",
        Collect(CollectRequest) = "collect",
        TaskProgress(TaskProgressReport) = "task_progress",
        TaskResult(TaskResultReport) = "task_result",
    }
}

payload_enum! {
    /// Controller answers to [`AgentRequest`].
    pub enum ServerResponse {
        Pong(Pong) = "pong",
        StateChanged(StateChangedResponse) = "state_changed_ack",
        Collect(CollectResponse) = "collect_ack",
    }
}

/// Fixes which payload sets one end of a channel sends and receives.
pub trait Side: Send + Sync + 'static {
    /// Requests arriving from the peer.
    type Request: Payload + std::fmt::Debug;
    /// Responses arriving from the peer.
    type Response: Payload + std::fmt::Debug;
    /// Requests this side sends.
    type OutRequest: Payload + std::fmt::Debug;
    /// Responses this side sends.
    type OutResponse: Payload + std::fmt::Debug;

    /// Label for the remote end, used in logs and metrics.
    const PEER: &'static str;

    fn ping() -> Self::OutRequest;

    /// Peer clock reading carried by a pong, if `response` is one.
    fn pong_time(response: &Self::Response) -> Option<DateTime<Utc>>;
}

/// The agent's end: receives [`ServerRequest`], sends [`AgentRequest`].
#[derive(Debug, Clone, Copy)]
pub struct AgentSide;

impl Side for AgentSide {
    type Request = ServerRequest;
    type Response = ServerResponse;
    type OutRequest = AgentRequest;
    type OutResponse = AgentResponse;

    const PEER: &'static str = "controller";

    fn ping() -> AgentRequest {
        AgentRequest::Ping(Ping {})
    }

    fn pong_time(response: &ServerResponse) -> Option<DateTime<Utc>> {
        match response {
            ServerResponse::Pong(pong) => Some(pong.current_time),
            _ => None,
        }
    }
}

/// The controller's end: receives [`AgentRequest`], sends [`ServerRequest`].
#[derive(Debug, Clone, Copy)]
pub struct ControllerSide;

impl Side for ControllerSide {
    type Request = AgentRequest;
    type Response = AgentResponse;
    type OutRequest = ServerRequest;
    type OutResponse = ServerResponse;

    const PEER: &'static str = "agent";

    fn ping() -> ServerRequest {
        ServerRequest::Ping(Ping {})
    }

    fn pong_time(response: &AgentResponse) -> Option<DateTime<Utc>> {
        match response {
            AgentResponse::Pong(pong) => Some(pong.current_time),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn start_task_defaults() {
        let req = ServerRequest::from_body(
            "start_task",
            json!({"task_id": "a", "kind": "process"}),
        )
        .unwrap()
        .unwrap();
        let ServerRequest::StartTask(req) = req else {
            panic!("wrong variant: {req:?}");
        };
        assert_eq!(req.flavor, TaskFlavor::Action);
        assert_eq!(req.timeout_ms, 0);
        assert!(req.params.is_null());
    }

    #[test]
    fn missing_body_decodes_empty_struct() {
        let ping = AgentRequest::from_body("ping", Value::Null).unwrap().unwrap();
        assert_eq!(ping, AgentRequest::Ping(Ping {}));
    }

    #[test]
    fn unknown_kind_is_none() {
        assert!(ServerRequest::from_body("collect", json!({})).is_none());
        assert!(!ServerResponse::is_kind("task_status"));
        assert!(AgentResponse::is_kind("task_status"));
    }

    #[test]
    fn bad_body_is_error() {
        let res = ServerRequest::from_body("stop_task", json!({"task_id": 7})).unwrap();
        assert!(res.is_err());
    }

    #[test]
    fn request_and_response_kinds_are_disjoint_per_direction() {
        for kind in ServerRequest::KINDS {
            assert!(!ServerResponse::KINDS.contains(kind), "{kind}");
        }
        for kind in AgentRequest::KINDS {
            assert!(!AgentResponse::KINDS.contains(kind), "{kind}");
            assert!(!ServerResponse::KINDS.contains(kind), "{kind}");
        }
    }

    #[test]
    fn flavor_wire_names() {
        assert_eq!(serde_json::to_value(TaskFlavor::Job).unwrap(), json!("job"));
        assert_eq!(TaskFlavor::Action.to_string(), "action");
    }

    #[test]
    fn from_impls_pick_variant() {
        let req: AgentRequest = CollectRequest { metrics: vec![] }.into();
        assert_eq!(req.kind(), "collect");
        let resp: ServerResponse = Pong::now().into();
        assert_eq!(resp.kind(), "pong");
    }
}
