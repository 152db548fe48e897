//! In-memory collaborators for exercising a session without a network.
//!
//! Enabled for unit tests and, through the `testing` feature, for integration tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::channel::mpsc as fmpsc;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::Notify;
use url::Url;

use crate::devices::MediaStream;
use crate::error::{Result, SessionError};
use crate::peer::{
    IceCandidate, PeerConnector, PeerTransport, SdpKind, SignalSink, TrackUpdate, TransportEvent,
    TransportEvents,
};
use crate::protocol::OutboundMessage;
use crate::transport::{Connector, Frame, TransportChannel};

/// Let spawned tasks run until they park.
pub async fn settle() {
    for _ in 0..64 {
        tokio::task::yield_now().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Accept,
    Refuse,
    /// Never completes; exercises the connect timeout
    Hang,
}

struct ServerShared {
    behavior: Mutex<ConnectBehavior>,
    attempts: AtomicUsize,
    urls: Mutex<Vec<Url>>,
    auto_pong: AtomicBool,
    connection: Mutex<Option<(u64, fmpsc::UnboundedSender<Result<Frame>>)>>,
    next_connection: AtomicU64,
    unread: Mutex<VecDeque<Value>>,
    history: Mutex<Vec<Value>>,
    arrived: Notify,
}

/// Scripted signaling server reachable through [`Connector`].
#[derive(Clone)]
pub struct MemoryConnector {
    shared: Arc<ServerShared>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(ServerShared {
                behavior: Mutex::new(ConnectBehavior::Accept),
                attempts: AtomicUsize::new(0),
                urls: Mutex::new(Vec::new()),
                auto_pong: AtomicBool::new(true),
                connection: Mutex::new(None),
                next_connection: AtomicU64::new(0),
                unread: Mutex::new(VecDeque::new()),
                history: Mutex::new(Vec::new()),
                arrived: Notify::new(),
            }),
        }
    }

    pub fn set_behavior(&self, behavior: ConnectBehavior) {
        *self.shared.behavior.lock() = behavior;
    }

    pub fn set_auto_pong(&self, enabled: bool) {
        self.shared.auto_pong.store(enabled, Ordering::SeqCst);
    }

    /// Transport attempts made so far, successful or not
    pub fn attempts(&self) -> usize {
        self.shared.attempts.load(Ordering::SeqCst)
    }

    pub fn urls(&self) -> Vec<Url> {
        self.shared.urls.lock().clone()
    }

    pub fn is_open(&self) -> bool {
        self.shared.connection.lock().is_some()
    }

    /// Server-side hang-up of the current connection
    pub fn drop_connection(&self) {
        self.shared.connection.lock().take();
    }

    /// Deliver a JSON message to the client
    pub fn push(&self, message: Value) {
        self.push_raw(&message.to_string());
    }

    pub fn push_raw(&self, text: &str) {
        if let Some((_, tx)) = self.shared.connection.lock().as_ref() {
            let _ = tx.unbounded_send(Ok(Frame::Text(text.to_string())));
        }
    }

    /// Every message the client has sent, oldest first
    pub fn sent(&self) -> Vec<Value> {
        self.shared.history.lock().clone()
    }

    pub fn sent_events(&self) -> Vec<String> {
        self.sent()
            .iter()
            .filter_map(|m| m["event"].as_str().map(str::to_string))
            .collect()
    }

    /// Wait for the next not-yet-consumed client message with the given event name.
    pub async fn next_sent(&self, event: &str) -> Value {
        let wait = async {
            loop {
                let arrived = self.shared.arrived.notified();
                {
                    let mut unread = self.shared.unread.lock();
                    if let Some(pos) = unread.iter().position(|m| m["event"] == event) {
                        if let Some(message) = unread.remove(pos) {
                            return message;
                        }
                    }
                }
                arrived.await;
            }
        };
        match tokio::time::timeout(Duration::from_secs(5), wait).await {
            Ok(message) => message,
            Err(_) => panic!("client never sent {:?}; saw {:?}", event, self.sent_events()),
        }
    }

    fn accept(&self) -> TransportChannel {
        let id = self.shared.next_connection.fetch_add(1, Ordering::SeqCst) + 1;
        let (client_tx, mut server_rx) = fmpsc::unbounded::<Frame>();
        let (server_tx, client_rx) = fmpsc::unbounded::<Result<Frame>>();
        *self.shared.connection.lock() = Some((id, server_tx));

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move {
            while let Some(frame) = server_rx.next().await {
                match frame {
                    Frame::Text(text) => {
                        if let Ok(value) = serde_json::from_str::<Value>(&text) {
                            shared.history.lock().push(value.clone());
                            shared.unread.lock().push_back(value);
                            shared.arrived.notify_waiters();
                        }
                    }
                    Frame::Ping(payload) => {
                        if shared.auto_pong.load(Ordering::SeqCst) {
                            if let Some((current, tx)) = shared.connection.lock().as_ref() {
                                if *current == id {
                                    let _ = tx.unbounded_send(Ok(Frame::Pong(payload)));
                                }
                            }
                        }
                    }
                    Frame::Pong(_) => {}
                    Frame::Close => break,
                }
            }
            let mut connection = shared.connection.lock();
            if connection.as_ref().is_some_and(|(current, _)| *current == id) {
                connection.take();
            }
        });

        TransportChannel {
            sink: Box::pin(
                client_tx.sink_map_err(|e| SessionError::ConnectionFailed(e.to_string())),
            ),
            stream: Box::pin(client_rx),
        }
    }
}

impl Default for MemoryConnector {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(&self, url: &Url) -> Result<TransportChannel> {
        self.shared.attempts.fetch_add(1, Ordering::SeqCst);
        self.shared.urls.lock().push(url.clone());
        let behavior = *self.shared.behavior.lock();
        match behavior {
            ConnectBehavior::Accept => Ok(self.accept()),
            ConnectBehavior::Refuse => Err(SessionError::ConnectionFailed(
                "connection refused".to_string(),
            )),
            ConnectBehavior::Hang => std::future::pending().await,
        }
    }
}

/// Operation observed on a fake peer transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerOp {
    CreateOffer,
    CreateAnswer,
    SetRemote(SdpKind),
    AddCandidate(String),
    SetTracks(usize),
    Close,
}

#[derive(Default)]
struct FakePeerShared {
    ops: Mutex<HashMap<String, Vec<PeerOp>>>,
    events: Mutex<HashMap<String, TransportEvents>>,
    failures: Mutex<Vec<(String, PeerOp)>>,
    renegotiate: AtomicBool,
}

/// Records every peer operation, per participant.
#[derive(Clone, Default)]
pub struct FakePeerConnector {
    shared: Arc<FakePeerShared>,
}

impl FakePeerConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ops(&self, participant_id: &str) -> Vec<PeerOp> {
        self.shared
            .ops
            .lock()
            .get(participant_id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn participants(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.shared.events.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Make `op` fail for `participant_id`
    pub fn fail_on(&self, participant_id: &str, op: PeerOp) {
        self.shared
            .failures
            .lock()
            .push((participant_id.to_string(), op));
    }

    pub fn clear_failures(&self) {
        self.shared.failures.lock().clear();
    }

    /// Report `NeedsRenegotiation` from every subsequent track update
    pub fn require_renegotiation(&self, required: bool) {
        self.shared.renegotiate.store(required, Ordering::SeqCst);
    }

    /// Raise a transport event as if the participant's transport produced it
    pub fn emit(&self, participant_id: &str, event: TransportEvent) {
        if let Some(events) = self.shared.events.lock().get(participant_id) {
            events.emit(event);
        }
    }
}

#[async_trait]
impl PeerConnector for FakePeerConnector {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let participant_id = events.participant_id().to_string();
        self.shared
            .events
            .lock()
            .insert(participant_id.clone(), events);
        Ok(Arc::new(FakeTransport {
            participant_id,
            shared: Arc::clone(&self.shared),
        }))
    }
}

struct FakeTransport {
    participant_id: String,
    shared: Arc<FakePeerShared>,
}

impl FakeTransport {
    fn record(&self, op: PeerOp) -> Result<()> {
        self.shared
            .ops
            .lock()
            .entry(self.participant_id.clone())
            .or_default()
            .push(op.clone());
        let fails = self
            .shared
            .failures
            .lock()
            .iter()
            .any(|(id, failing)| *id == self.participant_id && *failing == op);
        if fails {
            Err(SessionError::peer(&self.participant_id, format!("injected {:?} failure", op)))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PeerTransport for FakeTransport {
    async fn create_offer(&self) -> Result<String> {
        self.record(PeerOp::CreateOffer)?;
        Ok(format!("offer-for-{}", self.participant_id))
    }

    async fn create_answer(&self) -> Result<String> {
        self.record(PeerOp::CreateAnswer)?;
        Ok(format!("answer-for-{}", self.participant_id))
    }

    async fn set_remote_description(&self, kind: SdpKind, _sdp: &str) -> Result<()> {
        self.record(PeerOp::SetRemote(kind))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.record(PeerOp::AddCandidate(candidate.candidate))
    }

    async fn set_local_tracks(&self, stream: Option<&MediaStream>) -> Result<TrackUpdate> {
        self.record(PeerOp::SetTracks(stream.map(|s| s.tracks().len()).unwrap_or(0)))?;
        if self.shared.renegotiate.load(Ordering::SeqCst) {
            Ok(TrackUpdate::NeedsRenegotiation)
        } else {
            Ok(TrackUpdate::Replaced)
        }
    }

    async fn close(&self) -> Result<()> {
        self.record(PeerOp::Close)
    }
}

/// [`SignalSink`] that keeps what it is given
#[derive(Default)]
pub struct RecordingSink {
    sent: Mutex<Vec<OutboundMessage>>,
}

impl RecordingSink {
    pub fn sent(&self) -> Vec<OutboundMessage> {
        self.sent.lock().clone()
    }

    pub fn sent_of(&self, event: &str) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .iter()
            .filter(|m| m.event_name() == event)
            .cloned()
            .collect()
    }
}

impl SignalSink for RecordingSink {
    fn send(&self, message: &OutboundMessage) -> Result<()> {
        self.sent.lock().push(message.clone());
        Ok(())
    }
}
