//! Signaling channel client
//!
//! One logical connection to the room's signaling endpoint. The client owns
//! connect/reconnect, the heartbeat, and in-order dispatch of inbound messages to
//! registered handlers.
//!
//! Single in-flight connect: at most one transport attempt runs at a time. The
//! attempt lives in `Inner::pending`; every concurrent caller awaits a clone of the
//! same shared future, so they all observe one outcome.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{sleep, timeout, Instant};
use tracing::{debug, info, warn};
use url::Url;

use crate::config::SignalingConfig;
use crate::connection::{ConnectionMonitor, ConnectionState, ConnectionStatus};
use crate::error::{Result, SessionError};
use crate::metrics::HeartbeatTracker;
use crate::protocol::{InboundMessage, MessageKind, OutboundMessage};
use crate::transport::{Connector, Frame, TransportChannel};

pub type MessageHandler = Arc<dyn Fn(&InboundMessage) + Send + Sync>;
pub type ConnectionHandler = Arc<dyn Fn(&ConnectionState) + Send + Sync>;

type PendingConnect = Shared<BoxFuture<'static, Result<()>>>;

const CLOSE_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Default)]
struct HandlerRegistry {
    next_id: u64,
    message: Vec<(u64, Vec<MessageKind>, MessageHandler)>,
    connection: Vec<(u64, ConnectionHandler)>,
}

impl HandlerRegistry {
    fn allocate(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn message_handlers(&self, kind: MessageKind) -> Vec<MessageHandler> {
        self.message
            .iter()
            .filter(|(_, kinds, _)| kinds.contains(&kind))
            .map(|(_, _, handler)| Arc::clone(handler))
            .collect()
    }

    fn connection_handlers(&self) -> Vec<ConnectionHandler> {
        self.connection.iter().map(|(_, h)| Arc::clone(h)).collect()
    }

    fn remove(&mut self, id: u64) {
        self.message.retain(|(handler_id, _, _)| *handler_id != id);
        self.connection.retain(|(handler_id, _)| *handler_id != id);
    }
}

/// Handler registration. Dropping it unregisters the handler.
#[must_use = "the handler is removed when the subscription is dropped"]
pub struct Subscription {
    id: u64,
    registry: Weak<Mutex<HandlerRegistry>>,
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.lock().remove(self.id);
        }
    }
}

/// The currently open transport
struct LiveLink {
    generation: u64,
    outbound: mpsc::UnboundedSender<Frame>,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
    heartbeat: JoinHandle<()>,
}

impl LiveLink {
    /// Stop reading and heartbeating; the writer drains and closes once the
    /// last sender is gone.
    fn shutdown(self) -> JoinHandle<()> {
        self.reader.abort();
        self.heartbeat.abort();
        drop(self.outbound);
        self.writer
    }
}

struct Inner {
    url: Url,
    config: SignalingConfig,
    connector: Arc<dyn Connector>,
    monitor: ConnectionMonitor,
    registry: Arc<Mutex<HandlerRegistry>>,
    link: Mutex<Option<LiveLink>>,
    pending: Mutex<Option<PendingConnect>>,
    opening: Mutex<Option<AbortHandle>>,
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
    closed_by_user: AtomicBool,
    generation: AtomicU64,
    /// Bumped by `disconnect`; an attempt started under an older value is void.
    epoch: AtomicU64,
}

/// Cheaply cloneable handle to one signaling channel
#[derive(Clone)]
pub struct SignalingClient {
    inner: Arc<Inner>,
}

impl SignalingClient {
    pub fn new(url: Url, config: SignalingConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                url,
                config,
                connector,
                monitor: ConnectionMonitor::new(),
                registry: Arc::new(Mutex::new(HandlerRegistry::default())),
                link: Mutex::new(None),
                pending: Mutex::new(None),
                opening: Mutex::new(None),
                reconnect_task: Mutex::new(None),
                closed_by_user: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn url(&self) -> &Url {
        &self.inner.url
    }

    /// Whether both handles drive the same channel
    pub fn same_channel(&self, other: &SignalingClient) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Open the channel. Resolves once the transport is open.
    ///
    /// Calls made while an attempt is in flight share that attempt and its result.
    pub async fn connect(&self) -> Result<()> {
        self.inner.closed_by_user.store(false, Ordering::SeqCst);
        self.inner.connect_shared(true).await
    }

    /// Resume connection attempts after the client gave up (`Failed`), or
    /// short-circuit a running backoff.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.closed_by_user.store(false, Ordering::SeqCst);
        if let Some(task) = self.inner.reconnect_task.lock().take() {
            task.abort();
        }
        info!(path = self.inner.url.path(), "Manual signaling reconnect");
        self.inner.connect_shared(true).await
    }

    /// Alias of [`reconnect`](Self::reconnect)
    pub async fn retry(&self) -> Result<()> {
        self.reconnect().await
    }

    /// Close the channel. No automatic reconnection follows.
    pub async fn disconnect(&self) {
        let inner = &self.inner;
        inner.closed_by_user.store(true, Ordering::SeqCst);
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        if let Some(task) = inner.reconnect_task.lock().take() {
            task.abort();
        }
        if let Some(attempt) = inner.opening.lock().take() {
            attempt.abort();
        }
        inner.pending.lock().take();

        let link = inner.link.lock().take();
        if let Some(link) = link {
            let _ = link.outbound.send(Frame::Close);
            let writer = link.shutdown();
            if timeout(CLOSE_FLUSH_TIMEOUT, writer).await.is_err() {
                debug!("Signaling writer did not flush close frame in time");
            }
            info!(path = inner.url.path(), "Signaling channel closed");
        }
        inner.monitor.reset();
        inner.notify_connection();
    }

    pub fn send(&self, message: &OutboundMessage) -> Result<()> {
        let text = message.encode()?;
        let link = self.inner.link.lock();
        let Some(link) = link.as_ref() else {
            return Err(SessionError::NotConnected);
        };
        link.outbound
            .send(Frame::Text(text))
            .map_err(|_| SessionError::NotConnected)?;
        debug!(event = message.event_name(), "Sent signaling message");
        Ok(())
    }

    pub fn on_message<F>(&self, kind: MessageKind, handler: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        self.on_messages(&[kind], handler)
    }

    pub fn on_messages<F>(&self, kinds: &[MessageKind], handler: F) -> Subscription
    where
        F: Fn(&InboundMessage) + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.lock();
        let id = registry.allocate();
        registry.message.push((id, kinds.to_vec(), Arc::new(handler)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner.registry),
        }
    }

    pub fn on_connection_change<F>(&self, handler: F) -> Subscription
    where
        F: Fn(&ConnectionState) + Send + Sync + 'static,
    {
        let mut registry = self.inner.registry.lock();
        let id = registry.allocate();
        registry.connection.push((id, Arc::new(handler)));
        Subscription {
            id,
            registry: Arc::downgrade(&self.inner.registry),
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.monitor.current()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.monitor.status() == ConnectionStatus::Connected
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.monitor.subscribe()
    }
}

impl Inner {
    fn connect_shared(self: &Arc<Self>, fail_on_error: bool) -> PendingConnect {
        let mut pending = self.pending.lock();
        if let Some(attempt) = pending.as_ref() {
            debug!("Joining in-flight signaling connect");
            return attempt.clone();
        }
        if self.link.lock().is_some() {
            return futures::future::ready(Ok(())).boxed().shared();
        }

        let inner = Arc::clone(self);
        let epoch = self.epoch.load(Ordering::SeqCst);
        let task = tokio::spawn(async move { inner.open(fail_on_error, epoch).await });
        *self.opening.lock() = Some(task.abort_handle());
        let attempt = async move {
            task.await.unwrap_or_else(|e| {
                Err(SessionError::ConnectionFailed(format!(
                    "connect task aborted: {}",
                    e
                )))
            })
        }
        .boxed()
        .shared();
        *pending = Some(attempt.clone());
        attempt
    }

    fn is_stale(&self, epoch: u64) -> bool {
        self.epoch.load(Ordering::SeqCst) != epoch
    }

    async fn open(self: Arc<Self>, fail_on_error: bool, epoch: u64) -> Result<()> {
        // Epoch checks and monitor writes happen under `pending`, which
        // disconnect() takes after bumping the epoch.
        let status = {
            let _pending = self.pending.lock();
            if self.is_stale(epoch) {
                return Err(closed_by_client());
            }
            let status = if self.monitor.status() == ConnectionStatus::Reconnecting {
                ConnectionStatus::Reconnecting
            } else {
                ConnectionStatus::Connecting
            };
            self.monitor.begin_attempt(status);
            status
        };
        self.notify_connection();
        debug!(path = self.url.path(), %status, "Opening signaling transport");

        let budget = self.config.connection_timeout();
        let result = match timeout(budget, self.connector.connect(&self.url)).await {
            Ok(result) => result,
            Err(_) => Err(SessionError::ConnectionTimeout {
                timeout_ms: budget.as_millis() as u64,
            }),
        };

        let outcome = {
            let mut pending = self.pending.lock();
            if self.is_stale(epoch) {
                debug!(path = self.url.path(), "Discarding connect attempt abandoned by disconnect");
                return Err(closed_by_client());
            }
            let outcome = match result {
                Ok(channel) => {
                    self.install(channel);
                    self.monitor.set_connected();
                    info!(path = self.url.path(), "Signaling channel open");
                    Ok(())
                }
                Err(e) => {
                    warn!(path = self.url.path(), error = %e, "Signaling connect failed");
                    if fail_on_error {
                        self.monitor.set_failed(e.to_string());
                    } else {
                        self.monitor.record_error(e.to_string());
                    }
                    Err(e)
                }
            };
            pending.take();
            self.opening.lock().take();
            outcome
        };
        self.notify_connection();
        outcome
    }

    fn install(self: &Arc<Self>, channel: TransportChannel) {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let TransportChannel { mut sink, mut stream } = channel;
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Frame>();
        let tracker = Arc::new(Mutex::new(HeartbeatTracker::new()));

        let writer = tokio::spawn(async move {
            while let Some(frame) = outbound_rx.recv().await {
                let closing = frame == Frame::Close;
                if let Err(e) = sink.send(frame).await {
                    debug!(error = %e, "Signaling write failed");
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader = {
            let weak = Arc::downgrade(self);
            let tracker = Arc::clone(&tracker);
            tokio::spawn(async move {
                let reason = loop {
                    let frame = stream.next().await;
                    let Some(inner) = weak.upgrade() else {
                        return;
                    };
                    match frame {
                        Some(Ok(Frame::Text(text))) => inner.dispatch(&text),
                        Some(Ok(Frame::Pong(payload))) => inner.acknowledge(&tracker, &payload),
                        Some(Ok(Frame::Ping(_))) => {}
                        Some(Ok(Frame::Close)) => break "closed by server".to_string(),
                        Some(Err(e)) => break e.to_string(),
                        None => break "transport ended".to_string(),
                    }
                };
                if let Some(inner) = weak.upgrade() {
                    inner.handle_closed(generation, reason);
                }
            })
        };

        let heartbeat = {
            let weak = Arc::downgrade(self);
            let outbound = outbound.clone();
            let interval = self.config.heartbeat_interval();
            let deadline = self.config.heartbeat_timeout();
            tokio::spawn(async move {
                loop {
                    sleep(interval).await;
                    let seq = tracker.lock().start(Instant::now());
                    if outbound.send(Frame::Ping(seq.to_be_bytes().to_vec())).is_err() {
                        break;
                    }
                    sleep(deadline).await;
                    if tracker.lock().is_overdue(Instant::now(), deadline) {
                        warn!(seq, "Heartbeat not acknowledged");
                        if let Some(inner) = weak.upgrade() {
                            inner.handle_closed(generation, "heartbeat timeout".to_string());
                        }
                        break;
                    }
                }
            })
        };

        let previous = self.link.lock().replace(LiveLink {
            generation,
            outbound,
            writer,
            reader,
            heartbeat,
        });
        if let Some(previous) = previous {
            previous.shutdown();
        }
    }

    fn dispatch(&self, text: &str) {
        match InboundMessage::decode(text) {
            Ok(Some(message)) => {
                let handlers = self.registry.lock().message_handlers(message.kind());
                debug!(event = %message.kind(), handlers = handlers.len(), "Dispatching signaling message");
                for handler in handlers {
                    handler(&message);
                }
            }
            Ok(None) => debug!("Ignoring unknown signaling event"),
            Err(e) => warn!(error = %e, "Dropping malformed signaling message"),
        }
    }

    fn acknowledge(&self, tracker: &Mutex<HeartbeatTracker>, payload: &[u8]) {
        let Ok(bytes) = <[u8; 8]>::try_from(payload) else {
            return;
        };
        let rtt = tracker
            .lock()
            .acknowledge(u64::from_be_bytes(bytes), Instant::now());
        if let Some(rtt) = rtt {
            self.monitor.update_latency(rtt.as_millis() as u64);
            self.notify_connection();
        }
    }

    fn handle_closed(self: &Arc<Self>, generation: u64, reason: String) {
        let link = {
            let mut link = self.link.lock();
            match link.as_ref() {
                Some(current) if current.generation == generation => link.take(),
                _ => return,
            }
        };
        if let Some(link) = link {
            link.shutdown();
        }
        if self.closed_by_user.load(Ordering::SeqCst) {
            return;
        }

        warn!(path = self.url.path(), %reason, "Signaling connection lost");
        self.monitor.record_error(reason.clone());
        if self.config.auto_reconnect && self.config.max_retries > 0 {
            self.spawn_reconnect();
        } else {
            self.monitor.set_failed(
                SessionError::ConnectionFailed(format!("connection lost: {}", reason)).to_string(),
            );
            self.notify_connection();
        }
    }

    fn spawn_reconnect(self: &Arc<Self>) {
        let mut slot = self.reconnect_task.lock();
        if slot.as_ref().is_some_and(|task| !task.is_finished()) {
            return;
        }
        let inner = Arc::clone(self);
        *slot = Some(tokio::spawn(async move { inner.reconnect_loop().await }));
    }

    async fn reconnect_loop(self: Arc<Self>) {
        let max_retries = self.config.max_retries;
        for attempt in 1..=max_retries {
            self.monitor.set_retry(attempt);
            self.notify_connection();
            let delay = self.config.retry_delay();
            info!(
                attempt,
                max_retries,
                delay_ms = delay.as_millis() as u64,
                "Scheduling signaling reconnect"
            );
            sleep(delay).await;
            if self.closed_by_user.load(Ordering::SeqCst) {
                return;
            }
            match self.connect_shared(false).await {
                Ok(()) => {
                    info!(attempt, "Signaling channel re-established");
                    return;
                }
                Err(e) => warn!(attempt, error = %e, "Reconnect attempt failed"),
            }
        }

        let error = SessionError::ConnectionFailed(format!(
            "gave up after {} reconnect attempts",
            max_retries
        ));
        warn!(%error, "Signaling reconnection exhausted");
        self.monitor.set_failed(error.to_string());
        self.notify_connection();
    }

    fn notify_connection(&self) {
        let handlers = self.registry.lock().connection_handlers();
        if handlers.is_empty() {
            return;
        }
        let state = self.monitor.current();
        for handler in handlers {
            handler(&state);
        }
    }
}

fn closed_by_client() -> SessionError {
    SessionError::ConnectionFailed("connection closed by client".to_string())
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.reconnect_task.get_mut().take() {
            task.abort();
        }
        if let Some(link) = self.link.get_mut().take() {
            link.shutdown();
        }
    }
}
