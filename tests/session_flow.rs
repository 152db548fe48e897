use std::sync::Arc;

use conference_session::devices::{DeviceInfo, DeviceKind, TrackSource};
use conference_session::testing::{settle, ConnectBehavior, FakePeerConnector, MemoryConnector, PeerOp};
use conference_session::{
    ConnectionStatus, ErrorKind, SessionConfig, SessionController, SessionStore, StreamOptions,
    VirtualDevices,
};
use serde_json::{json, Value};

struct Session {
    controller: SessionController,
    server: MemoryConnector,
    devices: Arc<VirtualDevices>,
    peers: FakePeerConnector,
}

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn session_with(devices: VirtualDevices) -> Session {
    init_logging();
    let server = MemoryConnector::new();
    let devices = Arc::new(devices);
    let peers = FakePeerConnector::new();
    let store = SessionStore::new(
        SessionConfig {
            server_url: "wss://meet.example.com".to_string(),
            ..Default::default()
        },
        Arc::new(server.clone()),
        devices.clone(),
        Arc::new(peers.clone()),
    );
    Session {
        controller: SessionController::new(store),
        server,
        devices,
        peers,
    }
}

fn session() -> Session {
    session_with(VirtualDevices::standard())
}

fn client(id: &str, name: &str) -> Value {
    json!({"clientId": id, "displayName": name})
}

fn room_state(participants: Vec<Value>, waiting: Vec<Value>, hands: Vec<Value>) -> Value {
    json!({
        "event": "room_state",
        "payload": {
            "clientId": "u1",
            "displayName": "Alice",
            "roomId": "demo",
            "hosts": [client("h1", "Hana")],
            "participants": participants,
            "handsRaised": hands,
            "waitingUsers": waiting,
            "sharingScreen": null,
        }
    })
}

async fn admitted(session: &Session) {
    session
        .controller
        .join_room_with_auth("demo", "Alice", "secret token", None)
        .await
        .unwrap();
    session.server.next_sent("waiting_request").await;
    session.server.push(json!({
        "event": "accept_waiting",
        "payload": client("u1", "Alice"),
    }));
    session.server.push(room_state(
        vec![client("u1", "Alice"), client("u2", "Bob")],
        vec![],
        vec![],
    ));
    settle().await;
}

#[tokio::test]
async fn test_join_waiting_then_admitted() {
    let s = session();
    let store = s.controller.store();

    store.initialize_room("demo", "Alice", "secret token").await.unwrap();
    assert!(store.snapshot().connection.ws_connected());
    let url = &s.server.urls()[0];
    assert_eq!(url.path(), "/ws/zoom/demo");
    assert_eq!(url.query(), Some("token=secret+token"));

    store.join_room(None).await.unwrap();
    let request = s.server.next_sent("waiting_request").await;
    assert_eq!(request["payload"]["displayName"], "Alice");

    s.server.push(room_state(vec![client("u2", "Bob")], vec![client("u1", "Alice")], vec![]));
    settle().await;
    let state = store.snapshot();
    assert!(state.is_waiting_room);
    assert!(!state.is_joined);
    assert!(!s.controller.is_room_ready());

    s.server.push(json!({"event": "accept_waiting", "payload": client("u1", "Alice")}));
    settle().await;
    let state = store.snapshot();
    assert!(!state.is_waiting_room);
    assert!(state.is_joined);
    assert!(s.controller.is_room_ready());
}

#[tokio::test]
async fn test_empty_room_id_never_touches_network() {
    let s = session();
    let err = s
        .controller
        .join_room_with_auth("", "user", "token", None)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Authentication);
    assert!(err.to_string().contains("AuthenticationError"));
    assert_eq!(s.server.attempts(), 0);
    assert!(s.controller.store().signaling().is_none());
}

#[tokio::test]
async fn test_leave_from_every_state() {
    // never initialized
    let s = session();
    s.controller.leave_room().await;
    s.controller.leave_room().await;
    assert_eq!(s.controller.connection_state().status, ConnectionStatus::Disconnected);

    // failed connect
    let s = session();
    s.server.set_behavior(ConnectBehavior::Refuse);
    assert!(s.controller.store().initialize_room("demo", "Alice", "t").await.is_err());
    assert_eq!(s.controller.connection_state().status, ConnectionStatus::Failed);
    s.controller.leave_room().await;
    assert_eq!(s.controller.connection_state().status, ConnectionStatus::Disconnected);

    // joined with media and chat
    let s = session();
    admitted(&s).await;
    s.controller.start_media(StreamOptions::default()).await.unwrap();
    s.server.push(json!({
        "event": "add_chat",
        "payload": {
            "clientId": "u2", "displayName": "Bob", "chatId": "c1",
            "chatIndex": 1_700_000_000_000i64, "chatContent": "hi"
        }
    }));
    settle().await;
    let before = s.controller.state();
    assert_eq!(before.messages.len(), 1);
    assert_eq!(before.participants.len(), 2);

    s.controller.leave_room().await;
    settle().await;
    let after = s.controller.state();
    assert!(s.devices.issued_tracks().iter().all(|t| !t.is_live()));
    assert!(after.participants.is_empty());
    assert!(after.messages.is_empty());
    assert!(after.room.is_none());
    assert_eq!(after.connection.status, ConnectionStatus::Disconnected);
    assert!(!s.server.is_open());
    assert!(s.server.sent_events().contains(&"disconnect".to_string()));
    assert!(s.peers.ops("u2").contains(&PeerOp::Close));

    s.controller.leave_room().await;
}

#[tokio::test]
async fn test_room_state_snapshot_is_idempotent() {
    let s = session();
    admitted(&s).await;
    let snapshot = room_state(
        vec![client("u1", "Alice"), client("u2", "Bob"), client("u3", "Cy")],
        vec![client("w1", "Wes")],
        vec![client("u3", "Cy")],
    );

    s.server.push(snapshot.clone());
    settle().await;
    let once = s.controller.state();
    s.server.push(snapshot);
    settle().await;
    let twice = s.controller.state();

    assert_eq!(once.participants, twice.participants);
    assert_eq!(once.pending_participants, twice.pending_participants);
    assert_eq!(once.speaking_participants, twice.speaking_participants);
    assert_eq!(twice.participants.len(), 3);
    assert_eq!(twice.pending_participants[0].id, "w1");
}

#[tokio::test]
async fn test_disconnect_clears_speaking_and_selection() {
    let s = session();
    admitted(&s).await;
    let store = s.controller.store();
    s.server.push(json!({"event": "raise_hand", "payload": client("u2", "Bob")}));
    settle().await;
    assert!(store.select_participant(Some("u2")));
    assert!(store.pin_participant(Some("u2")));
    assert!(store.snapshot().speaking_participants.contains("u2"));

    s.server.push(json!({"event": "disconnect", "payload": client("u2", "Bob")}));
    settle().await;
    let state = store.snapshot();
    assert!(!state.participants.contains_key("u2"));
    assert!(!state.speaking_participants.contains("u2"));
    assert_eq!(state.selected_participant_id, None);
    assert_eq!(state.pinned_participant_id, None);
}

#[tokio::test]
async fn test_zero_cameras_yields_audio_only_stream() {
    let s = session_with(
        VirtualDevices::new().with_device(DeviceInfo::new("mic-1", "Mic", DeviceKind::Microphone)),
    );
    let stream = s
        .controller
        .start_media(StreamOptions {
            audio: true,
            video: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(stream.audio_tracks().count(), 1);
    assert_eq!(stream.video_tracks().count(), 0);
}

#[tokio::test]
async fn test_screen_track_ending_resets_sharing() {
    let s = session();
    admitted(&s).await;
    assert!(s.controller.toggle_screen_share().await.unwrap());
    assert!(s.controller.state().media.is_screen_sharing);

    let screen = s
        .devices
        .issued_tracks()
        .into_iter()
        .find(|t| t.source() == TrackSource::Screen)
        .unwrap();
    screen.stop();
    settle().await;

    let state = s.controller.state();
    assert!(!state.media.is_screen_sharing);
    assert!(!state.local.unwrap().is_screen_sharing);
}

#[tokio::test]
async fn test_local_media_reaches_peer_links() {
    let s = session();
    admitted(&s).await;
    assert!(s.peers.ops("u2").contains(&PeerOp::CreateOffer));

    s.controller.start_media(StreamOptions::default()).await.unwrap();
    settle().await;
    assert!(s.peers.ops("u2").contains(&PeerOp::SetTracks(2)));

    let offer = s.server.next_sent("offer").await;
    assert_eq!(offer["payload"]["targetClientId"], "u2");
}

#[tokio::test]
async fn test_host_admits_waiting_user() {
    let s = session();
    admitted(&s).await;
    s.server.push(json!({"event": "waiting_request", "payload": client("w1", "Wes")}));
    settle().await;
    let store = s.controller.store();
    assert_eq!(store.snapshot().pending_participants.len(), 1);

    store.accept_waiting("w1").unwrap();
    let sent = s.server.next_sent("accept_waiting").await;
    assert_eq!(sent["payload"]["clientId"], "w1");
    assert!(store.deny_waiting("nobody").is_err());
}
