//! Multiplexed request/response channel over one duplex stream.
//!
//! A single receive loop reads frames in wire order. Inbound requests are
//! queued on a bounded stream the owner must drain; inbound responses are
//! delivered to the caller waiting on the matching correlation ID. Outbound
//! frames are serialized by one async write lock.
//!
//! The same implementation serves both ends; the [`Side`] parameter fixes
//! which payload sets are sent and received.

pub mod metrics;

pub use metrics::{ChannelCounters, ChannelMetrics};

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use chrono::{TimeDelta, Utc};
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot, Mutex as AsyncMutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::error::{ChannelError, FrameError, RequestError};
use crate::sync::lock;
use crate::transport::{recv_message, send_message, Frame, Payload, Side, Stream, ERROR_KIND};

/// Capacity of the inbound request queue.
pub const REQUEST_QUEUE_CAPACITY: usize = 32;

const WRITER_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(1);

/// An inbound request. `id` is 0 for notifications that expect no reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Request<P> {
    pub id: u32,
    pub payload: P,
}

/// Inbound request stream; ends when the channel closes.
pub type Requests<P> = mpsc::Receiver<Request<P>>;

/// Result of one ping/pong exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkInfo {
    pub round_trip: Duration,
    /// Peer clock minus local clock, corrected by half the round trip.
    pub clock_drift: TimeDelta,
}

type Pending<R> = HashMap<u32, oneshot::Sender<Result<R, String>>>;
type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

struct Shared<S: Side> {
    writer: AsyncMutex<Option<BoxWriter>>,
    last_id: AtomicU32,
    /// `None` once closed; no new waiter can register after that.
    pending: Mutex<Option<Pending<S::Response>>>,
    reason: OnceLock<ChannelError>,
    closed: CancellationToken,
    counters: Option<ChannelCounters>,
    _side: PhantomData<fn() -> S>,
}

impl<S: Side> Shared<S> {
    fn close(&self, reason: ChannelError) {
        if self.reason.set(reason).is_err() {
            return;
        }
        // Dropping the senders wakes every waiter with `Closed`.
        let pending = lock(&self.pending).take();
        drop(pending);
        self.closed.cancel();
    }

    fn reason(&self) -> ChannelError {
        self.reason
            .get()
            .cloned()
            .unwrap_or(ChannelError::Disconnected)
    }

    fn forget(&self, id: u32) {
        if let Some(map) = lock(&self.pending).as_mut() {
            map.remove(&id);
        }
    }
}

/// Handle to a running channel. Cheap to clone; all clones share one stream.
pub struct Channel<S: Side> {
    shared: Arc<Shared<S>>,
}

impl<S: Side> Clone for Channel<S> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<S: Side> std::fmt::Debug for Channel<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("peer", &S::PEER)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl<S: Side> Channel<S> {
    /// Start a channel over separate read and write halves.
    ///
    /// Spawns the receive loop, so it must be called within a tokio runtime.
    pub fn new<R, W>(
        reader: R,
        writer: W,
        counters: Option<ChannelCounters>,
    ) -> (Self, Requests<S::Request>)
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        let shared = Arc::new(Shared {
            writer: AsyncMutex::new(Some(Box::new(writer) as BoxWriter)),
            last_id: AtomicU32::new(0),
            pending: Mutex::new(Some(HashMap::new())),
            reason: OnceLock::new(),
            closed: CancellationToken::new(),
            counters,
            _side: PhantomData,
        });

        let (tx, rx) = mpsc::channel(REQUEST_QUEUE_CAPACITY);
        tokio::spawn(receive_loop(Arc::clone(&shared), reader, tx));

        (Self { shared }, rx)
    }

    /// Start a channel over one full-duplex stream.
    pub fn from_stream<T: Stream>(
        stream: T,
        counters: Option<ChannelCounters>,
    ) -> (Self, Requests<S::Request>) {
        let (reader, writer) = tokio::io::split(stream);
        Self::new(reader, writer, counters)
    }

    /// Fire-and-forget send with ID 0. No-op once closed.
    pub async fn send(&self, payload: S::OutRequest) {
        self.send_frame(0, &payload).await;
    }

    /// Answer request `id`. No-op once closed.
    pub async fn reply(&self, id: u32, response: S::OutResponse) {
        self.send_frame(id, &response).await;
    }

    /// Answer request `id` with an error instead of a payload.
    pub async fn reply_error(&self, id: u32, message: impl Into<String>) {
        if let Err(e) = self.write_frame(&Frame::error(id, message)).await {
            debug!(peer = S::PEER, id, error = %e, "Dropped error reply");
        }
    }

    async fn send_frame<P: Payload>(&self, id: u32, payload: &P) {
        let frame = match Frame::new(id, payload) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(peer = S::PEER, kind = payload.kind(), error = %e, "Failed to encode frame");
                return;
            }
        };
        if let Err(e) = self.write_frame(&frame).await {
            debug!(peer = S::PEER, id, kind = %frame.kind, error = %e, "Dropped frame");
        }
    }

    /// Send a request and suspend until its response arrives or the channel
    /// closes. Safe to call concurrently from any number of tasks.
    pub async fn send_and_wait(&self, payload: S::OutRequest) -> Result<S::Response, RequestError> {
        let id = self.next_id();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = lock(&self.shared.pending);
            let map = pending.as_mut().ok_or(RequestError::Closed)?;
            if map.contains_key(&id) {
                return Err(RequestError::IdInUse(id));
            }
            map.insert(id, tx);
        }
        let guard = PendingGuard {
            shared: &self.shared,
            id,
        };

        let frame = Frame::new(id, &payload).map_err(|e| RequestError::Encode(e.to_string()))?;
        match self.write_frame(&frame).await {
            Ok(()) => {}
            Err(ChannelError::FrameTooLarge(msg)) => return Err(RequestError::Encode(msg)),
            Err(_) => return Err(RequestError::Closed),
        }

        let result = rx.await;
        drop(guard);
        match result {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(message)) => Err(RequestError::Remote(message)),
            Err(_) => Err(RequestError::Closed),
        }
    }

    /// Suspend until the channel is closed and return why.
    pub async fn wait(&self) -> ChannelError {
        self.shared.closed.cancelled().await;
        self.shared.reason()
    }

    /// Close the channel. Only the first reason is kept.
    pub fn close(&self, reason: ChannelError) {
        self.shared.close(reason);
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.is_cancelled()
    }

    /// Token cancelled when the channel closes.
    pub fn closed_token(&self) -> CancellationToken {
        self.shared.closed.clone()
    }

    /// Ping the peer and derive round trip and clock drift.
    pub async fn measure(&self) -> Result<NetworkInfo, RequestError> {
        let sent_at = Utc::now();
        let start = Instant::now();
        let response = self.send_and_wait(S::ping()).await?;
        let round_trip = start.elapsed();

        let peer_time =
            S::pong_time(&response).ok_or(RequestError::UnexpectedResponse(response.kind()))?;
        let latency = TimeDelta::from_std(round_trip / 2).unwrap_or_else(|_| TimeDelta::zero());
        Ok(NetworkInfo {
            round_trip,
            clock_drift: peer_time - sent_at - latency,
        })
    }

    fn next_id(&self) -> u32 {
        loop {
            let id = self
                .shared
                .last_id
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Write one frame under the write lock. Both the lock acquisition and
    /// the write give up as soon as the channel closes.
    async fn write_frame(&self, frame: &Frame) -> Result<(), ChannelError> {
        let bytes = serde_json::to_vec(frame).map_err(|e| ChannelError::Send(e.to_string()))?;
        let shared = &self.shared;

        let mut writer = tokio::select! {
            biased;
            () = shared.closed.cancelled() => return Err(shared.reason()),
            writer = shared.writer.lock() => writer,
        };
        let Some(stream) = writer.as_mut() else {
            return Err(shared.reason());
        };

        let result = tokio::select! {
            biased;
            () = shared.closed.cancelled() => return Err(shared.reason()),
            result = send_message(stream, &bytes) => result,
        };
        drop(writer);

        match result {
            Ok(()) => {
                if let Some(counters) = &shared.counters {
                    counters.sent.inc();
                }
                trace!(peer = S::PEER, id = frame.id, kind = %frame.kind, "Sent frame");
                Ok(())
            }
            // Nothing was written, the stream is still usable.
            Err(e @ FrameError::TooLarge { .. }) => Err(ChannelError::FrameTooLarge(e.to_string())),
            Err(e) => {
                let err = ChannelError::Send(e.to_string());
                shared.close(err.clone());
                Err(err)
            }
        }
    }

    #[cfg(test)]
    fn set_last_id(&self, id: u32) {
        self.shared.last_id.store(id, Ordering::Relaxed);
    }
}

/// Removes an abandoned pending slot when `send_and_wait` is dropped early.
struct PendingGuard<'a, S: Side> {
    shared: &'a Shared<S>,
    id: u32,
}

impl<S: Side> Drop for PendingGuard<'_, S> {
    fn drop(&mut self) {
        self.shared.forget(self.id);
    }
}

async fn receive_loop<S, R>(
    shared: Arc<Shared<S>>,
    mut reader: R,
    requests: mpsc::Sender<Request<S::Request>>,
) where
    S: Side,
    R: AsyncRead + Unpin,
{
    let failure = loop {
        let read = tokio::select! {
            biased;
            () = shared.closed.cancelled() => break None,
            read = recv_message(&mut reader) => read,
        };
        let bytes = match read {
            Ok(bytes) => bytes,
            Err(e) if e.is_eof() => break Some(ChannelError::Disconnected),
            Err(e @ FrameError::TooLarge { .. }) => {
                break Some(ChannelError::FrameTooLarge(e.to_string()));
            }
            Err(e) => break Some(ChannelError::Receive(e.to_string())),
        };
        if let Some(counters) = &shared.counters {
            counters.received.inc();
        }

        let Frame { id, kind, body, error } = match serde_json::from_slice(&bytes) {
            Ok(frame) => frame,
            Err(e) => break Some(ChannelError::Malformed(e.to_string())),
        };
        trace!(peer = S::PEER, id, kind = %kind, "Received frame");

        if kind == ERROR_KIND || S::Response::is_kind(&kind) {
            let response = if kind == ERROR_KIND {
                Err(error.unwrap_or_else(|| "unknown error".to_string()))
            } else {
                match S::Response::from_body(&kind, body) {
                    Some(Ok(payload)) => Ok(payload),
                    Some(Err(e)) => break Some(ChannelError::Malformed(format!("{kind}: {e}"))),
                    None => break Some(ChannelError::UnhandledPayload(kind)),
                }
            };
            let slot = lock(&shared.pending).as_mut().and_then(|map| map.remove(&id));
            match slot {
                // The waiter may have given up; that is not the peer's fault.
                Some(tx) => drop(tx.send(response)),
                None => break Some(ChannelError::NoSubscriber(id)),
            }
            continue;
        }

        let payload = match S::Request::from_body(&kind, body) {
            Some(Ok(payload)) => payload,
            Some(Err(e)) => break Some(ChannelError::Malformed(format!("{kind}: {e}"))),
            None => break Some(ChannelError::UnhandledPayload(kind)),
        };
        tokio::select! {
            biased;
            () = shared.closed.cancelled() => break None,
            sent = requests.send(Request { id, payload }) => {
                if sent.is_err() {
                    debug!(peer = S::PEER, id, "Request stream dropped, discarding request");
                }
            }
        }
        if let Some(counters) = &shared.counters {
            counters.queued.set(queue_length(&requests));
        }
    };

    if let Some(counters) = &shared.counters {
        counters.queued.set(0);
    }
    if let Some(reason) = failure {
        shared.close(reason);
    }
    drop(requests);

    if let Some(mut writer) = shared.writer.lock().await.take() {
        let _ = tokio::time::timeout(WRITER_SHUTDOWN_TIMEOUT, writer.shutdown()).await;
    }
    debug!(peer = S::PEER, reason = %shared.reason(), "Channel closed");
}

fn queue_length<T>(requests: &mpsc::Sender<T>) -> i64 {
    let queued = REQUEST_QUEUE_CAPACITY.saturating_sub(requests.capacity());
    i64::try_from(queued).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protocol::{
        AgentRequest, AgentResponse, Ping, Pong, ServerRequest, ServerResponse, TaskStatusRequest,
        TaskStatusResponse,
    };
    use crate::transport::{read_json, write_json, AgentSide, ControllerSide};
    use serde_json::json;
    use tokio::io::DuplexStream;

    const TICK: Duration = Duration::from_secs(2);

    fn pair() -> (
        (Channel<AgentSide>, Requests<ServerRequest>),
        (Channel<ControllerSide>, Requests<AgentRequest>),
    ) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (
            Channel::<AgentSide>::from_stream(a, None),
            Channel::<ControllerSide>::from_stream(b, None),
        )
    }

    /// Agent channel plus the raw peer stream, for injecting hand-made frames.
    fn raw_agent() -> (Channel<AgentSide>, Requests<ServerRequest>, DuplexStream) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        let (channel, requests) = Channel::<AgentSide>::from_stream(a, None);
        (channel, requests, b)
    }

    fn spawn_pong_responder(channel: Channel<AgentSide>, mut requests: Requests<ServerRequest>) {
        tokio::spawn(async move {
            while let Some(req) = requests.recv().await {
                if let ServerRequest::Ping(_) = req.payload {
                    channel.reply(req.id, Pong::now().into()).await;
                }
            }
        });
    }

    #[tokio::test]
    async fn ping_roundtrip() {
        let ((agent, agent_reqs), (ctrl, _ctrl_reqs)) = pair();
        spawn_pong_responder(agent, agent_reqs);

        let resp = ctrl.send_and_wait(Ping {}.into()).await.unwrap();
        assert!(matches!(resp, AgentResponse::Pong(_)));
    }

    #[tokio::test]
    async fn concurrent_requests_get_their_own_responses() {
        let ((agent, mut agent_reqs), (ctrl, _ctrl_reqs)) = pair();
        const N: usize = 30;

        // Collect every request first, then answer in reverse order.
        tokio::spawn(async move {
            let mut batch = Vec::new();
            while batch.len() < N {
                batch.push(agent_reqs.recv().await.unwrap());
            }
            for req in batch.into_iter().rev() {
                let ServerRequest::TaskStatus(status) = req.payload else {
                    panic!("unexpected request");
                };
                let n: usize = status.task_id.parse().unwrap();
                agent
                    .reply(req.id, TaskStatusResponse { alive: n % 3 == 0 }.into())
                    .await;
            }
        });

        let calls = (0..N).map(|n| {
            let ctrl = ctrl.clone();
            tokio::spawn(async move {
                let resp = ctrl
                    .send_and_wait(TaskStatusRequest { task_id: n.to_string() }.into())
                    .await
                    .unwrap();
                (n, resp)
            })
        });
        for call in calls.collect::<Vec<_>>() {
            let (n, resp) = call.await.unwrap();
            assert_eq!(
                resp,
                AgentResponse::TaskStatus(TaskStatusResponse { alive: n % 3 == 0 }),
                "request {n}"
            );
        }
    }

    #[tokio::test]
    async fn error_reply_completes_waiter() {
        let ((agent, mut agent_reqs), (ctrl, _ctrl_reqs)) = pair();
        tokio::spawn(async move {
            let req = agent_reqs.recv().await.unwrap();
            agent.reply_error(req.id, "no such task").await;
        });

        let err = ctrl
            .send_and_wait(TaskStatusRequest { task_id: "x".into() }.into())
            .await
            .unwrap_err();
        assert_eq!(err, RequestError::Remote("no such task".into()));
        assert!(!ctrl.is_closed());
    }

    #[tokio::test]
    async fn notifications_use_id_zero() {
        let ((agent, _agent_reqs), (_ctrl, mut ctrl_reqs)) = pair();
        agent.send(Ping {}.into()).await;

        let req = ctrl_reqs.recv().await.unwrap();
        assert_eq!(req.id, 0);
        assert_eq!(req.payload, AgentRequest::Ping(Ping {}));
    }

    #[tokio::test]
    async fn close_is_idempotent_and_keeps_first_reason() {
        let ((agent, _agent_reqs), _ctrl) = pair();

        let waiters: Vec<_> = (0..5)
            .map(|_| {
                let agent = agent.clone();
                tokio::spawn(async move { agent.wait().await })
            })
            .collect();

        let closers: Vec<_> = (0..5)
            .map(|i| {
                let agent = agent.clone();
                tokio::spawn(async move {
                    agent.close(ChannelError::Shutdown(format!("closer {i}")));
                })
            })
            .collect();
        for closer in closers {
            closer.await.unwrap();
        }

        let first = agent.wait().await;
        assert!(matches!(first, ChannelError::Shutdown(_)));
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), first);
        }
        agent.close(ChannelError::Disconnected);
        assert_eq!(agent.wait().await, first);
    }

    #[tokio::test]
    async fn operations_after_close_do_not_block() {
        let ((agent, mut agent_reqs), (ctrl, _ctrl_reqs)) = pair();
        agent.close(ChannelError::Shutdown("test".into()));

        tokio::time::timeout(TICK, async {
            agent.send(Ping {}.into()).await;
            agent.reply(7, Pong::now().into()).await;
            agent.reply_error(7, "x").await;
            assert_eq!(
                agent.send_and_wait(Ping {}.into()).await,
                Err(RequestError::Closed)
            );
        })
        .await
        .unwrap();

        // Request stream ends and the peer sees the stream go away.
        assert!(agent_reqs.recv().await.is_none());
        assert_eq!(
            tokio::time::timeout(TICK, ctrl.wait()).await.unwrap(),
            ChannelError::Disconnected
        );
    }

    #[tokio::test]
    async fn close_wakes_pending_waiters() {
        let ((agent, _agent_reqs), (_ctrl, _ctrl_reqs)) = pair();
        let waiting = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.send_and_wait(Ping {}.into()).await })
        };
        tokio::task::yield_now().await;
        agent.close(ChannelError::Shutdown("bye".into()));

        let res = tokio::time::timeout(TICK, waiting).await.unwrap().unwrap();
        assert_eq!(res, Err(RequestError::Closed));
    }

    #[tokio::test]
    async fn peer_drop_closes_with_disconnected() {
        let (agent, mut requests, peer) = raw_agent();
        drop(peer);

        assert_eq!(
            tokio::time::timeout(TICK, agent.wait()).await.unwrap(),
            ChannelError::Disconnected
        );
        assert!(requests.recv().await.is_none());
    }

    #[tokio::test]
    async fn response_without_subscriber_is_fatal() {
        let (agent, _requests, mut peer) = raw_agent();
        let waiters: Vec<_> = (0..2)
            .map(|_| {
                let agent = agent.clone();
                tokio::spawn(async move { agent.send_and_wait(AgentRequest::Ping(Ping {})).await })
            })
            .collect();
        for _ in 0..2 {
            let request: Frame = read_json(&mut peer, TICK).await.unwrap();
            assert_eq!(request.kind, "ping");
        }

        let frame = Frame::new(77, &ServerResponse::Pong(Pong::now())).unwrap();
        write_json(&mut peer, &frame).await.unwrap();

        let reason = tokio::time::timeout(TICK, agent.wait()).await.unwrap();
        assert_eq!(reason, ChannelError::NoSubscriber(77));
        assert!(reason.is_protocol_violation());
        for waiter in waiters {
            let result = tokio::time::timeout(TICK, waiter).await.unwrap().unwrap();
            assert_eq!(result.unwrap_err(), RequestError::Closed);
        }
    }

    #[tokio::test]
    async fn unknown_kind_is_fatal() {
        let (agent, _requests, mut peer) = raw_agent();
        let frame = Frame {
            id: 1,
            kind: "reboot".into(),
            body: json!({}),
            error: None,
        };
        write_json(&mut peer, &frame).await.unwrap();

        let reason = tokio::time::timeout(TICK, agent.wait()).await.unwrap();
        assert_eq!(reason, ChannelError::UnhandledPayload("reboot".into()));
    }

    #[tokio::test]
    async fn malformed_frame_is_fatal() {
        let (agent, _requests, mut peer) = raw_agent();
        send_message(&mut peer, b"{not json").await.unwrap();

        let reason = tokio::time::timeout(TICK, agent.wait()).await.unwrap();
        assert!(matches!(reason, ChannelError::Malformed(_)), "{reason:?}");
    }

    #[tokio::test]
    async fn malformed_body_is_fatal() {
        let (agent, _requests, mut peer) = raw_agent();
        let frame = Frame {
            id: 4,
            kind: "stop_task".into(),
            body: json!({"task_id": 12}),
            error: None,
        };
        write_json(&mut peer, &frame).await.unwrap();

        let reason = tokio::time::timeout(TICK, agent.wait()).await.unwrap();
        assert!(matches!(reason, ChannelError::Malformed(ref m) if m.starts_with("stop_task")));
    }

    #[tokio::test]
    async fn requests_arrive_in_wire_order() {
        let (_agent, mut requests, mut peer) = raw_agent();
        for id in 1..=5u32 {
            let frame = Frame::new(id, &ServerRequest::Ping(Ping {})).unwrap();
            write_json(&mut peer, &frame).await.unwrap();
        }
        for id in 1..=5u32 {
            assert_eq!(requests.recv().await.unwrap().id, id);
        }
    }

    #[tokio::test]
    async fn raw_peer_sees_framed_request() {
        let (agent, _requests, mut peer) = raw_agent();
        let call = {
            let agent = agent.clone();
            tokio::spawn(async move { agent.send_and_wait(Ping {}.into()).await })
        };

        let frame: Frame = read_json(&mut peer, TICK).await.unwrap();
        assert_eq!(frame.kind, "ping");
        assert_ne!(frame.id, 0);
        write_json(&mut peer, &Frame::new(frame.id, &ServerResponse::Pong(Pong::now())).unwrap())
            .await
            .unwrap();

        assert!(matches!(call.await.unwrap(), Ok(ServerResponse::Pong(_))));
    }

    #[tokio::test]
    async fn id_wraparound_skips_zero() {
        let ((agent, _agent_reqs), _ctrl) = pair();
        agent.set_last_id(u32::MAX - 1);
        assert_eq!(agent.next_id(), u32::MAX);
        assert_eq!(agent.next_id(), 1);
    }

    #[tokio::test]
    async fn measure_reports_small_drift_on_local_peer() {
        let ((agent, agent_reqs), (ctrl, _ctrl_reqs)) = pair();
        spawn_pong_responder(agent, agent_reqs);

        let info = ctrl.measure().await.unwrap();
        assert!(info.round_trip < TICK);
        assert!(info.clock_drift.num_milliseconds().abs() < 1000);
    }

    #[tokio::test]
    async fn counters_track_frames() {
        let metrics = ChannelMetrics::new("test").unwrap();
        let (a, b) = tokio::io::duplex(4096);
        let (agent, agent_reqs) =
            Channel::<AgentSide>::from_stream(a, Some(metrics.counters("controller")));
        let (ctrl, _ctrl_reqs) =
            Channel::<ControllerSide>::from_stream(b, Some(metrics.counters("agent")));
        spawn_pong_responder(agent, agent_reqs);

        ctrl.send_and_wait(Ping {}.into()).await.unwrap();
        assert_eq!(metrics.counters("agent").sent.get(), 1);
        assert_eq!(metrics.counters("agent").received.get(), 1);
        assert_eq!(metrics.counters("controller").received.get(), 1);
    }

    #[tokio::test]
    async fn queue_length_tracks_unconsumed_requests() {
        let metrics = ChannelMetrics::new("test").unwrap();
        let (a, mut peer) = tokio::io::duplex(64 * 1024);
        let (agent, mut requests) =
            Channel::<AgentSide>::from_stream(a, Some(metrics.counters("controller")));
        let queued = || metrics.counters("controller").queued.get();

        for id in 1..=3u32 {
            let frame = Frame::new(id, &ServerRequest::Ping(Ping {})).unwrap();
            write_json(&mut peer, &frame).await.unwrap();
        }
        tokio::time::timeout(TICK, async {
            while queued() < 3 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        requests.recv().await.unwrap();
        requests.recv().await.unwrap();
        let frame = Frame::new(4, &ServerRequest::Ping(Ping {})).unwrap();
        write_json(&mut peer, &frame).await.unwrap();
        tokio::time::timeout(TICK, async {
            while queued() != 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();

        drop(peer);
        tokio::time::timeout(TICK, agent.wait()).await.unwrap();
        assert_eq!(queued(), 0);
    }
}
