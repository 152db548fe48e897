//! Session state store
//!
//! [`SessionStore`] owns the one [`SessionState`] of a session and is the only
//! thing that mutates it. Readers take snapshots or subscribe with
//! [`SessionStore::watch`]. Every action commits its state change before it
//! returns.
//!
//! The store also wires its collaborators together: the signaling client it
//! builds per room, the media manager, and the peer orchestrator, which only
//! ever sees a [`RosterSnapshot`] derived from the state.

mod handlers;
pub mod state;

use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SessionConfig;
use crate::connection::ConnectionState;
use crate::devices::{DeviceCatalog, MediaDevices, MediaStream, TrackKind};
use crate::error::{Result, SessionError};
use crate::media::{MediaManager, MediaStatus, StreamOptions};
use crate::peer::{PeerConnector, PeerEvent, PeerOrchestrator, RosterSnapshot};
use crate::protocol::{ChatPayload, ClientInfo, JoinRequestPayload, OutboundMessage};
use crate::rtc::RtcPeerConnector;
use crate::signaling::{SignalingClient, Subscription};
use crate::transport::{Connector, WsConnector};

use self::state::{Layout, Participant, Role, RoomIdentity, RoomSettings, SessionState};

pub const MAX_CHAT_LENGTH: usize = 1000;

/// Signaling client of the current room and its handler registrations
struct LiveSession {
    client: SignalingClient,
    subscriptions: Vec<Subscription>,
}

pub(crate) struct StoreInner {
    config: SessionConfig,
    connector: Arc<dyn Connector>,
    state: watch::Sender<SessionState>,
    roster: watch::Sender<RosterSnapshot>,
    media: MediaManager,
    peers: PeerOrchestrator,
    session: Mutex<Option<LiveSession>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl StoreInner {
    /// Mutate the state and republish the roster view if it changed.
    pub(crate) fn update(&self, mutate: impl FnOnce(&mut SessionState)) {
        self.state.send_modify(mutate);
        let roster = self.state.borrow().roster_snapshot();
        self.roster.send_if_modified(|current| {
            if *current == roster {
                return false;
            }
            *current = roster;
            true
        });
    }

    fn client(&self) -> Option<SignalingClient> {
        self.session.lock().as_ref().map(|s| s.client.clone())
    }

    fn connected_client(&self) -> Result<SignalingClient> {
        match self.client() {
            Some(client) if client.is_connected() => Ok(client),
            _ => Err(SessionError::NotConnected),
        }
    }

    fn is_current(&self, client: &SignalingClient) -> bool {
        self.session
            .lock()
            .as_ref()
            .is_some_and(|s| s.client.same_channel(client))
    }

    fn local_info(&self) -> ClientInfo {
        self.state.borrow().local_info()
    }

    fn chat_history_request(&self) -> Result<()> {
        let local = self.local_info();
        self.connected_client()?
            .send(&OutboundMessage::RecentsChat(ChatPayload {
                client_id: local.client_id,
                display_name: local.display_name,
                chat_id: String::new(),
                chat_index: Utc::now().timestamp_millis(),
                chat_content: String::new(),
                target_client_id: None,
            }))
    }

    pub(crate) fn fetch_chat_history(&self) {
        if let Err(e) = self.chat_history_request() {
            debug!(error = %e, "Could not request chat history");
        }
    }

    fn sync_media(&self) {
        let status = self.media.status();
        self.update(|state| {
            if let Some(local) = &mut state.local {
                local.is_audio_enabled = status.is_audio_enabled;
                local.is_video_enabled = status.is_video_enabled;
                local.is_screen_sharing = status.is_screen_sharing;
            }
            state.media = status;
        });
    }

    fn on_peer_event(&self, event: PeerEvent) {
        match event {
            PeerEvent::RemoteTrack {
                participant_id,
                kind,
            } => {
                let track_ref = format!(
                    "{}/{}",
                    participant_id,
                    match kind {
                        TrackKind::Audio => "audio",
                        TrackKind::Video => "video",
                    }
                );
                self.update(|state| {
                    state.update_participant(&participant_id, |p| {
                        p.media_track_ref = Some(track_ref);
                    });
                });
            }
            PeerEvent::StateChanged {
                participant_id,
                state: link_state,
            } => {
                if link_state.is_terminal() {
                    self.update(|state| {
                        state.update_participant(&participant_id, |p| p.media_track_ref = None);
                    });
                }
                debug!(%participant_id, state = %link_state, "Peer link state");
            }
            PeerEvent::Failed {
                participant_id,
                error,
            } => {
                warn!(%participant_id, %error, "Peer link failed; session continues");
            }
        }
    }

    async fn refresh_devices(&self) -> Result<DeviceCatalog> {
        let catalog = self.media.enumerate_devices().await?;
        let devices = catalog.clone();
        self.update(|state| state.devices = devices);
        Ok(catalog)
    }

    /// Drop handlers and close the signaling channel of the current room, if any.
    async fn close_session(&self) {
        let session = self.session.lock().take();
        let Some(LiveSession {
            client,
            subscriptions,
        }) = session
        else {
            return;
        };
        drop(subscriptions);
        client.disconnect().await;
    }
}

impl Drop for StoreInner {
    fn drop(&mut self) {
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

/// Cheaply cloneable handle to one session
#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<StoreInner>,
}

impl SessionStore {
    /// Must be called inside a tokio runtime.
    pub fn new(
        config: SessionConfig,
        connector: Arc<dyn Connector>,
        devices: Arc<dyn MediaDevices>,
        peer_connector: Arc<dyn PeerConnector>,
    ) -> Self {
        let (state, _) = watch::channel(SessionState::default());
        let (roster, roster_rx) = watch::channel(RosterSnapshot::default());
        let media = MediaManager::new(devices, config.media.clone());
        let peers = PeerOrchestrator::spawn(peer_connector, roster_rx);

        let inner = Arc::new(StoreInner {
            config,
            connector,
            state,
            roster,
            media,
            peers,
            session: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        });

        let weak = Arc::downgrade(&inner);
        let tasks = vec![
            tokio::spawn(forward_outgoing(weak.clone(), inner.media.watch_outgoing())),
            tokio::spawn(mirror_media(weak.clone(), inner.media.watch_status())),
            tokio::spawn(track_peer_events(weak.clone(), inner.peers.subscribe())),
            tokio::spawn(follow_device_changes(weak, inner.media.device_changes())),
        ];
        inner.tasks.lock().extend(tasks);

        Self { inner }
    }

    /// Store backed by a WebSocket signaling transport and `webrtc` peer connections.
    pub fn with_network(config: SessionConfig, devices: Arc<dyn MediaDevices>) -> Result<Self> {
        let peer_connector = RtcPeerConnector::new(config.peer.clone())?;
        Ok(Self::new(
            config,
            Arc::new(WsConnector),
            devices,
            Arc::new(peer_connector),
        ))
    }

    /// Open the signaling channel for `room_id`.
    ///
    /// Any previous room's channel is closed first. Room identity is only set
    /// once the new channel is open.
    pub async fn initialize_room(&self, room_id: &str, username: &str, token: &str) -> Result<()> {
        validate_credentials(room_id, username, token)?;
        let url = self.inner.config.signaling_url(room_id, token)?;

        if self.inner.session.lock().is_some() {
            info!("Closing previous signaling session");
            self.inner.close_session().await;
            self.inner.peers.close_all().await;
            self.inner.update(|state| {
                state.reset_session();
            });
        }

        let client = SignalingClient::new(
            url,
            self.inner.config.signaling.clone(),
            Arc::clone(&self.inner.connector),
        );
        let subscriptions = handlers::register(&client, Arc::downgrade(&self.inner));
        self.inner.peers.bind_signaling(Some(Arc::new(client.clone())));
        let connection = client.state();
        self.inner.update(|state| {
            state.local = Some(Participant::new(username, username, Role::Participant));
            state.local_client_id = None;
            state.connection = connection;
            state.last_error = None;
        });
        *self.inner.session.lock() = Some(LiveSession {
            client: client.clone(),
            subscriptions,
        });

        info!(room_id, username, "Connecting to room");
        let connected = client.connect().await;
        if !self.inner.is_current(&client) {
            debug!(room_id, "Session was closed while connecting");
            return match connected {
                Ok(()) => Err(SessionError::NotConnected),
                Err(e) => Err(e),
            };
        }
        if let Err(e) = connected {
            let connection = client.state();
            self.inner.update(|state| {
                state.connection = connection;
                state.last_error = Some(e.to_string());
            });
            return Err(e);
        }

        let connection = client.state();
        self.inner.update(|state| {
            state.connection = connection;
            state.room = Some(RoomIdentity {
                room_id: room_id.to_string(),
                room_name: room_id.to_string(),
                room_settings: RoomSettings::default(),
            });
        });

        if let Err(e) = self.inner.refresh_devices().await {
            warn!(error = %e, "Device enumeration failed");
        }
        info!(room_id, "Room initialized");
        Ok(())
    }

    /// Ask to be admitted. Admission itself arrives as `accept_waiting`.
    pub async fn join_room(&self, approval_token: Option<String>) -> Result<()> {
        let client = self.inner.connected_client()?;
        let local = self.inner.local_info();
        client.send(&OutboundMessage::WaitingRequest(JoinRequestPayload {
            client_id: local.client_id,
            display_name: local.display_name,
            approval_token,
        }))?;
        self.inner.update(|state| {
            state.join_requested = true;
            if !state.is_joined {
                state.is_waiting_room = true;
            }
        });
        info!("Join requested");
        Ok(())
    }

    /// Tear the session down from any state. Never fails.
    pub async fn leave_room(&self) {
        let inner = &self.inner;
        let local = inner.local_info();
        inner.update(|state| {
            state.is_joined = false;
            state.is_waiting_room = false;
            state.join_requested = false;
        });
        inner.media.cleanup();
        inner.peers.close_all().await;

        if let Some(client) = inner.client() {
            if client.is_connected() && !local.client_id.is_empty() {
                if let Err(e) = client.send(&OutboundMessage::Disconnect(local)) {
                    debug!(error = %e, "Could not announce departure");
                }
            }
        }
        inner.close_session().await;
        inner.peers.bind_signaling(None);

        let media = inner.media.status();
        inner.update(|state| {
            state.reset_session();
            state.media = media;
        });
        info!("Left room");
    }

    /// Send a chat message; `target` makes it private. Returns the message id.
    ///
    /// The message enters the log when the server echoes it back.
    pub fn send_chat(&self, content: &str, target: Option<String>) -> Result<String> {
        if content.trim().is_empty() {
            return Err(SessionError::InvalidInput("chat message is empty".to_string()));
        }
        if content.chars().count() > MAX_CHAT_LENGTH {
            return Err(SessionError::InvalidInput(format!(
                "chat message exceeds {} characters",
                MAX_CHAT_LENGTH
            )));
        }
        let client = self.inner.connected_client()?;
        let local = self.inner.local_info();
        let chat_id = Uuid::new_v4().to_string();
        client.send(&OutboundMessage::AddChat(ChatPayload {
            client_id: local.client_id,
            display_name: local.display_name,
            chat_id: chat_id.clone(),
            chat_index: Utc::now().timestamp_millis(),
            chat_content: content.to_string(),
            target_client_id: target,
        }))?;
        Ok(chat_id)
    }

    pub fn mark_messages_read(&self) {
        self.inner.update(|state| state.mark_messages_read());
    }

    pub fn raise_hand(&self) -> Result<()> {
        self.set_hand(true)
    }

    pub fn lower_hand(&self) -> Result<()> {
        self.set_hand(false)
    }

    fn set_hand(&self, raised: bool) -> Result<()> {
        let client = self.inner.connected_client()?;
        let local = self.inner.local_info();
        let message = if raised {
            OutboundMessage::RaiseHand(local.clone())
        } else {
            OutboundMessage::LowerHand(local.clone())
        };
        client.send(&message)?;
        self.inner.update(|state| {
            if local.client_id.is_empty() {
                state.hand_raised = raised;
            } else {
                state.set_speaking(&local.client_id, raised);
            }
        });
        Ok(())
    }

    /// Ask the host for permission to share the screen.
    pub fn request_screen_share(&self) -> Result<()> {
        let client = self.inner.connected_client()?;
        client.send(&OutboundMessage::RequestScreenShare(self.inner.local_info()))
    }

    /// Grant a pending screen-share request (host action).
    pub fn accept_screen_share(&self, participant_id: &str) -> Result<()> {
        self.decide_screen_share(participant_id, true)
    }

    /// Refuse a pending screen-share request (host action).
    pub fn deny_screen_share(&self, participant_id: &str) -> Result<()> {
        self.decide_screen_share(participant_id, false)
    }

    fn decide_screen_share(&self, participant_id: &str, accept: bool) -> Result<()> {
        let requester = self
            .inner
            .state
            .borrow()
            .screen_share_requests
            .iter()
            .find(|p| p.id == participant_id)
            .map(Participant::client_info)
            .ok_or_else(|| {
                SessionError::InvalidInput(format!(
                    "{} has not asked to share their screen",
                    participant_id
                ))
            })?;
        let message = if accept {
            OutboundMessage::AcceptScreenShare(requester)
        } else {
            OutboundMessage::DenyScreenShare(requester)
        };
        self.inner.connected_client()?.send(&message)?;
        self.inner
            .update(|state| state.screen_share_requests.retain(|p| p.id != participant_id));
        info!(participant_id, accept, "Screen share request decided");
        Ok(())
    }

    /// Ask the server for the room's recent chat messages.
    ///
    /// Also sent on admission and whenever the channel comes back while joined.
    pub fn request_chat_history(&self) -> Result<()> {
        self.inner.chat_history_request()
    }

    pub async fn start_screen_share(&self) -> Result<MediaStream> {
        let result = self.inner.media.start_screen_share().await;
        self.inner.sync_media();
        result
    }

    pub fn stop_screen_share(&self) {
        self.inner.media.stop_screen_share();
        self.inner.sync_media();
    }

    /// Admit a user from the waiting list (host action).
    pub fn accept_waiting(&self, participant_id: &str) -> Result<()> {
        let user = self.pending(participant_id)?;
        self.inner
            .connected_client()?
            .send(&OutboundMessage::AcceptWaiting(user))
    }

    /// Refuse a user from the waiting list (host action).
    pub fn deny_waiting(&self, participant_id: &str) -> Result<()> {
        let user = self.pending(participant_id)?;
        self.inner
            .connected_client()?
            .send(&OutboundMessage::DenyWaiting(user))
    }

    fn pending(&self, participant_id: &str) -> Result<ClientInfo> {
        self.inner
            .state
            .borrow()
            .pending_participants
            .iter()
            .find(|p| p.id == participant_id)
            .map(Participant::client_info)
            .ok_or_else(|| {
                SessionError::InvalidInput(format!("{} is not waiting", participant_id))
            })
    }

    pub fn add_participant(&self, participant: Participant) {
        self.inner.update(|state| state.add_participant(participant));
    }

    pub fn update_participant(&self, participant_id: &str, update: impl FnOnce(&mut Participant)) -> bool {
        let mut found = false;
        self.inner
            .update(|state| found = state.update_participant(participant_id, update));
        found
    }

    pub fn remove_participant(&self, participant_id: &str) -> Option<Participant> {
        let mut removed = None;
        self.inner
            .update(|state| removed = state.remove_participant(participant_id));
        removed
    }

    /// Acquire camera and microphone.
    pub async fn initialize_media(&self, options: StreamOptions) -> Result<MediaStream> {
        let result = self.inner.media.initialize_stream(options).await;
        self.inner.sync_media();
        result
    }

    pub fn toggle_audio(&self) -> bool {
        let enabled = self.inner.media.toggle_audio();
        self.inner.sync_media();
        enabled
    }

    pub fn toggle_video(&self) -> bool {
        let enabled = self.inner.media.toggle_video();
        self.inner.sync_media();
        enabled
    }

    pub async fn switch_camera(&self, device_id: &str) -> Result<()> {
        let result = self.inner.media.switch_camera(device_id).await;
        self.inner.sync_media();
        result
    }

    pub async fn switch_microphone(&self, device_id: &str) -> Result<()> {
        let result = self.inner.media.switch_microphone(device_id).await;
        self.inner.sync_media();
        result
    }

    pub async fn select_speaker(&self, device_id: &str) -> Result<()> {
        let result = self.inner.media.select_speaker(device_id).await;
        self.inner.sync_media();
        result
    }

    pub async fn request_permissions(&self) -> Result<bool> {
        self.inner.media.request_permissions().await
    }

    pub async fn refresh_devices(&self) -> Result<DeviceCatalog> {
        self.inner.refresh_devices().await
    }

    /// Opening the chat panel marks every message read.
    pub fn set_chat_open(&self, open: bool) {
        self.inner.update(|state| {
            state.ui.is_chat_open = open;
            if open {
                state.mark_messages_read();
            }
        });
    }

    pub fn set_participants_open(&self, open: bool) {
        self.inner
            .update(|state| state.ui.is_participants_open = open);
    }

    pub fn set_layout(&self, layout: Layout) {
        self.inner.update(|state| state.ui.layout = layout);
    }

    /// Returns false when the id is not in the roster.
    pub fn select_participant(&self, participant_id: Option<&str>) -> bool {
        let mut accepted = false;
        self.inner.update(|state| {
            if let Some(id) = participant_id {
                if !state.participants.contains_key(id) {
                    return;
                }
            }
            state.selected_participant_id = participant_id.map(str::to_string);
            accepted = true;
        });
        accepted
    }

    /// Returns false when the id is not in the roster.
    pub fn pin_participant(&self, participant_id: Option<&str>) -> bool {
        let mut accepted = false;
        self.inner.update(|state| {
            if let Some(id) = participant_id {
                if !state.participants.contains_key(id) {
                    return;
                }
            }
            state.pinned_participant_id = participant_id.map(str::to_string);
            accepted = true;
        });
        accepted
    }

    /// Manually reconnect the signaling channel after it gave up.
    pub async fn retry(&self) -> Result<()> {
        let client = self.inner.client().ok_or(SessionError::NotConnected)?;
        let result = client.retry().await;
        if let Err(e) = &result {
            let message = e.to_string();
            self.inner.update(|state| state.last_error = Some(message));
        }
        result
    }

    pub fn snapshot(&self) -> SessionState {
        self.inner.state.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionState> {
        self.inner.state.subscribe()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.state.borrow().connection.clone()
    }

    pub fn media(&self) -> &MediaManager {
        &self.inner.media
    }

    pub fn peers(&self) -> &PeerOrchestrator {
        &self.inner.peers
    }

    /// Signaling client of the current room
    pub fn signaling(&self) -> Option<SignalingClient> {
        self.inner.client()
    }
}

fn validate_credentials(room_id: &str, username: &str, token: &str) -> Result<()> {
    let missing = if room_id.trim().is_empty() {
        "room id"
    } else if username.trim().is_empty() {
        "username"
    } else if token.trim().is_empty() {
        "token"
    } else {
        return Ok(());
    };
    Err(SessionError::Authentication(format!("{} is required", missing)))
}

async fn forward_outgoing(store: Weak<StoreInner>, mut outgoing: watch::Receiver<Option<MediaStream>>) {
    while outgoing.changed().await.is_ok() {
        let stream = outgoing.borrow_and_update().clone();
        let Some(inner) = store.upgrade() else {
            return;
        };
        match stream {
            Some(stream) => inner.peers.attach_local_stream(stream),
            None => inner.peers.detach_local_stream(),
        }
    }
}

async fn mirror_media(store: Weak<StoreInner>, mut status: watch::Receiver<MediaStatus>) {
    while status.changed().await.is_ok() {
        let Some(inner) = store.upgrade() else {
            return;
        };
        inner.sync_media();
    }
}

async fn track_peer_events(store: Weak<StoreInner>, mut events: broadcast::Receiver<PeerEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(skipped, "Peer events lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = store.upgrade() else {
            return;
        };
        inner.on_peer_event(event);
    }
}

async fn follow_device_changes(store: Weak<StoreInner>, changes: Option<broadcast::Receiver<()>>) {
    let Some(mut changes) = changes else {
        return;
    };
    loop {
        match changes.recv().await {
            Ok(()) | Err(broadcast::error::RecvError::Lagged(_)) => {}
            Err(broadcast::error::RecvError::Closed) => return,
        }
        let Some(inner) = store.upgrade() else {
            return;
        };
        match inner.refresh_devices().await {
            Ok(catalog) => debug!(
                cameras = catalog.cameras.len(),
                microphones = catalog.microphones.len(),
                "Device catalog refreshed"
            ),
            Err(e) => warn!(error = %e, "Device refresh after hot-plug failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::VirtualDevices;
    use crate::testing::{settle, FakePeerConnector, MemoryConnector};
    use serde_json::json;

    struct Harness {
        store: SessionStore,
        server: MemoryConnector,
        devices: Arc<VirtualDevices>,
    }

    fn harness() -> Harness {
        let server = MemoryConnector::new();
        let devices = Arc::new(VirtualDevices::standard());
        let store = SessionStore::new(
            SessionConfig::default(),
            Arc::new(server.clone()),
            devices.clone(),
            Arc::new(FakePeerConnector::new()),
        );
        Harness {
            store,
            server,
            devices,
        }
    }

    fn room_state(waiting: bool) -> serde_json::Value {
        let alice = json!({"clientId": "u1", "displayName": "Alice"});
        let bob = json!({"clientId": "u2", "displayName": "Bob"});
        let (participants, waiting_users) = if waiting {
            (json!([bob]), json!([alice]))
        } else {
            (json!([alice, bob]), json!([]))
        };
        json!({
            "event": "room_state",
            "payload": {
                "clientId": "u1",
                "displayName": "Alice",
                "roomId": "demo",
                "hosts": [{"clientId": "h1", "displayName": "Hana"}],
                "participants": participants,
                "handsRaised": [],
                "waitingUsers": waiting_users,
            }
        })
    }

    #[tokio::test]
    async fn test_missing_credentials_fail_fast() {
        let h = harness();
        for (room, user, token) in [("", "Alice", "t"), ("demo", " ", "t"), ("demo", "Alice", "")] {
            let err = h.store.initialize_room(room, user, token).await.unwrap_err();
            assert!(matches!(err, SessionError::Authentication(_)));
        }
        assert_eq!(h.server.attempts(), 0);
        assert!(h.store.signaling().is_none());
    }

    #[tokio::test]
    async fn test_room_identity_only_after_open() {
        let h = harness();
        h.server.set_behavior(crate::testing::ConnectBehavior::Refuse);
        assert!(h.store.initialize_room("demo", "Alice", "t").await.is_err());
        let state = h.store.snapshot();
        assert!(state.room.is_none());
        assert!(state.last_error.is_some());

        h.server.set_behavior(crate::testing::ConnectBehavior::Accept);
        h.store.initialize_room("demo", "Alice", "t").await.unwrap();
        let state = h.store.snapshot();
        assert_eq!(state.room.unwrap().room_id, "demo");
        assert!(state.connection.ws_connected());
        assert_eq!(state.devices.cameras.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_leave_during_connect_leaves_no_trace() {
        let h = harness();
        h.server.set_behavior(crate::testing::ConnectBehavior::Hang);
        let joining = tokio::spawn({
            let store = h.store.clone();
            async move { store.initialize_room("demo", "Alice", "t").await }
        });
        settle().await;
        assert_eq!(
            h.store.connection_state().status,
            crate::connection::ConnectionStatus::Connecting
        );

        h.store.leave_room().await;
        tokio::time::sleep(std::time::Duration::from_secs(30)).await;
        assert!(joining.await.unwrap().is_err());

        let state = h.store.snapshot();
        assert_eq!(state.connection.status, crate::connection::ConnectionStatus::Disconnected);
        assert_eq!(state.last_error, None);
        assert!(state.room.is_none());
        assert!(h.store.signaling().is_none());
    }

    #[tokio::test]
    async fn test_host_decides_screen_share_requests() {
        let h = harness();
        h.store.initialize_room("demo", "Alice", "t").await.unwrap();
        h.store.join_room(None).await.unwrap();
        h.server.push(room_state(false));
        settle().await;

        let err = h.store.accept_screen_share("u2").unwrap_err();
        assert!(matches!(err, SessionError::InvalidInput(_)));

        h.server.push(json!({
            "event": "request_screenshare",
            "payload": {"clientId": "u2", "displayName": "Bob"}
        }));
        settle().await;
        assert_eq!(h.store.snapshot().screen_share_requests.len(), 1);

        h.store.accept_screen_share("u2").unwrap();
        let sent = h.server.next_sent("accept_screenshare").await;
        assert_eq!(sent["payload"]["clientId"], "u2");
        assert!(h.store.snapshot().screen_share_requests.is_empty());
        assert!(h.store.deny_screen_share("u2").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_history_requested_on_admission_and_resume() {
        let h = harness();
        h.store.initialize_room("demo", "Alice", "t").await.unwrap();
        h.store.join_room(None).await.unwrap();
        settle().await;
        assert!(!h.server.sent_events().contains(&"recents_chat".to_string()));

        h.server.push(room_state(false));
        let request = h.server.next_sent("recents_chat").await;
        assert_eq!(request["payload"]["clientId"], "u1");

        h.server.push(json!({
            "event": "recents_chat",
            "payload": [{
                "clientId": "u2", "displayName": "Bob", "chatId": "c1",
                "chatIndex": 1_700_000_000_000i64, "chatContent": "welcome"
            }]
        }));
        settle().await;
        let state = h.store.snapshot();
        assert_eq!(state.messages.len(), 1);
        assert_eq!(state.unread_count, 0);

        h.server.drop_connection();
        h.server.next_sent("recents_chat").await;
        assert_eq!(h.server.attempts(), 2);
    }

    #[tokio::test]
    async fn test_room_state_drives_roster_and_peers() {
        let h = harness();
        h.store.initialize_room("demo", "Alice", "t").await.unwrap();
        h.store.join_room(None).await.unwrap();
        h.server.next_sent("waiting_request").await;
        h.server.push(room_state(false));
        settle().await;

        let state = h.store.snapshot();
        assert_eq!(state.local_client_id.as_deref(), Some("u1"));
        assert!(state.is_joined);
        assert_eq!(state.participants.len(), 2);
        assert!(h.store.peers().link("u2").is_some());
        assert!(h.store.peers().link("h1").is_none());
    }

    #[tokio::test]
    async fn test_send_chat_validation() {
        let h = harness();
        assert!(matches!(
            h.store.send_chat("hi", None),
            Err(SessionError::NotConnected)
        ));
        h.store.initialize_room("demo", "Alice", "t").await.unwrap();
        assert!(matches!(
            h.store.send_chat("   ", None),
            Err(SessionError::InvalidInput(_))
        ));
        let long = "x".repeat(MAX_CHAT_LENGTH + 1);
        assert!(matches!(
            h.store.send_chat(&long, None),
            Err(SessionError::InvalidInput(_))
        ));

        let id = h.store.send_chat("hello", Some("u2".into())).unwrap();
        let sent = h.server.next_sent("add_chat").await;
        assert_eq!(sent["payload"]["chatId"], id.as_str());
        assert_eq!(sent["payload"]["targetClientId"], "u2");
        assert!(h.store.snapshot().messages.is_empty());
    }

    #[tokio::test]
    async fn test_chat_panel_marks_read() {
        let h = harness();
        h.store.initialize_room("demo", "Alice", "t").await.unwrap();
        h.server.push(json!({
            "event": "add_chat",
            "payload": {
                "clientId": "u2", "displayName": "Bob", "chatId": "c1",
                "chatIndex": 1, "chatContent": "hi"
            }
        }));
        settle().await;
        assert_eq!(h.store.snapshot().unread_count, 1);

        h.store.set_chat_open(true);
        let state = h.store.snapshot();
        assert_eq!(state.unread_count, 0);
        assert_eq!(state.messages.len(), 1);
    }

    #[tokio::test]
    async fn test_toggle_visible_immediately() {
        let h = harness();
        h.store.initialize_room("demo", "Alice", "t").await.unwrap();
        h.store.initialize_media(StreamOptions::default()).await.unwrap();
        assert!(h.store.snapshot().media.is_audio_enabled);

        assert!(!h.store.toggle_audio());
        let state = h.store.snapshot();
        assert!(!state.media.is_audio_enabled);
        assert!(!state.local.unwrap().is_audio_enabled);
    }

    #[tokio::test]
    async fn test_hot_plug_refreshes_catalog() {
        let h = harness();
        h.store.refresh_devices().await.unwrap();
        assert_eq!(h.store.snapshot().devices.cameras.len(), 1);

        h.devices.plug(crate::devices::DeviceInfo::new(
            "cam-2",
            "USB Camera",
            crate::devices::DeviceKind::Camera,
        ));
        settle().await;
        assert_eq!(h.store.snapshot().devices.cameras.len(), 2);
    }

    #[tokio::test]
    async fn test_select_and_pin_require_roster_member() {
        let h = harness();
        h.store
            .add_participant(Participant::new("u2", "Bob", Role::Participant));
        assert!(h.store.select_participant(Some("u2")));
        assert!(!h.store.pin_participant(Some("nobody")));
        assert!(h.store.pin_participant(Some("u2")));

        h.store.remove_participant("u2");
        let state = h.store.snapshot();
        assert_eq!(state.selected_participant_id, None);
        assert_eq!(state.pinned_participant_id, None);
    }
}
