//! High-level session operations for the presentation layer
//!
//! Derived flags are computed from the store's current state on every call.

use std::sync::Arc;

use tracing::{error, info};

use crate::config::SessionConfig;
use crate::connection::{ConnectionState, ConnectionStatus};
use crate::devices::{MediaDevices, MediaStream};
use crate::error::{Result, SessionError};
use crate::media::StreamOptions;
use crate::store::state::SessionState;
use crate::store::SessionStore;

const JOIN_FAILED: &str = "Failed to join room";

pub struct SessionController {
    store: SessionStore,
}

impl SessionController {
    pub fn new(store: SessionStore) -> Self {
        Self { store }
    }

    /// Controller over a WebSocket/`webrtc` session.
    pub fn with_network(config: SessionConfig, devices: Arc<dyn MediaDevices>) -> Result<Self> {
        Ok(Self::new(SessionStore::with_network(config, devices)?))
    }

    pub fn store(&self) -> &SessionStore {
        &self.store
    }

    pub fn state(&self) -> SessionState {
        self.store.snapshot()
    }

    /// Connected, admitted and out of the waiting room
    pub fn is_room_ready(&self) -> bool {
        let state = self.store.snapshot();
        state.connection.ws_connected() && in_room(&state) && !state.is_waiting_room
    }

    /// Reconnecting, or lost the channel after asking to join
    pub fn has_connection_issues(&self) -> bool {
        let state = self.store.snapshot();
        state.connection.status == ConnectionStatus::Reconnecting
            || (in_room(&state) && !state.connection.ws_connected())
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.store.connection_state()
    }

    /// Session error if any, else the signaling channel's
    pub fn last_error(&self) -> Option<String> {
        let state = self.store.snapshot();
        state.last_error.or(state.connection.last_error)
    }

    /// Connect to the room and ask to be admitted.
    ///
    /// Failures of either step come back wrapped in [`SessionError::Join`]; the
    /// original error stays reachable through `source`, `kind()` and `root()`.
    pub async fn join_room_with_auth(
        &self,
        room_id: &str,
        username: &str,
        token: &str,
        approval_token: Option<String>,
    ) -> Result<()> {
        let joined = async {
            self.store.initialize_room(room_id, username, token).await?;
            self.store.join_room(approval_token).await
        }
        .await;

        joined.map_err(|e| {
            error!(room_id, error = %e, "Join failed");
            SessionError::Join {
                message: JOIN_FAILED.to_string(),
                source: Box::new(e),
            }
        })?;
        info!(room_id, username, "Waiting for admission");
        Ok(())
    }

    pub async fn leave_room(&self) {
        self.store.leave_room().await;
    }

    pub async fn start_media(&self, options: StreamOptions) -> Result<MediaStream> {
        self.store.initialize_media(options).await
    }

    pub fn toggle_audio(&self) -> bool {
        self.store.toggle_audio()
    }

    pub fn toggle_video(&self) -> bool {
        self.store.toggle_video()
    }

    /// Stop sharing when sharing, start otherwise. Returns whether sharing now.
    pub async fn toggle_screen_share(&self) -> Result<bool> {
        if self.store.snapshot().media.is_screen_sharing {
            self.store.stop_screen_share();
            return Ok(false);
        }
        self.store.start_screen_share().await?;
        Ok(true)
    }

    pub fn send_chat(&self, content: &str, target: Option<String>) -> Result<String> {
        self.store.send_chat(content, target)
    }

    pub fn toggle_hand(&self) -> Result<()> {
        if self.store.snapshot().hand_raised {
            self.store.lower_hand()
        } else {
            self.store.raise_hand()
        }
    }

    /// Manual reconnect once automatic retries are exhausted
    pub async fn retry(&self) -> Result<()> {
        self.store.retry().await
    }
}

/// Asked to join or already admitted; waiting room included.
fn in_room(state: &SessionState) -> bool {
    state.join_requested || state.is_joined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::VirtualDevices;
    use crate::error::ErrorKind;
    use crate::testing::{settle, ConnectBehavior, FakePeerConnector, MemoryConnector};
    use serde_json::json;

    fn controller(server: &MemoryConnector) -> SessionController {
        SessionController::new(SessionStore::new(
            SessionConfig::default(),
            Arc::new(server.clone()),
            Arc::new(VirtualDevices::standard()),
            Arc::new(FakePeerConnector::new()),
        ))
    }

    #[tokio::test]
    async fn test_join_failure_is_wrapped() {
        let server = MemoryConnector::new();
        server.set_behavior(ConnectBehavior::Refuse);
        let controller = controller(&server);

        let err = controller
            .join_room_with_auth("demo", "Alice", "token", None)
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with(JOIN_FAILED));
        assert_eq!(err.kind(), ErrorKind::ConnectionFailed);
        assert!(controller.last_error().is_some());
        assert!(!controller.is_room_ready());
    }

    #[tokio::test]
    async fn test_ready_only_after_admission() {
        let server = MemoryConnector::new();
        let controller = controller(&server);
        controller
            .join_room_with_auth("demo", "Alice", "token", None)
            .await
            .unwrap();
        assert!(!controller.is_room_ready());
        assert!(!controller.has_connection_issues());

        server.push(json!({
            "event": "accept_waiting",
            "payload": {"clientId": "u1", "displayName": "Alice"}
        }));
        settle().await;
        assert!(controller.is_room_ready());

        server.drop_connection();
        settle().await;
        assert!(controller.has_connection_issues());
        assert!(!controller.is_room_ready());
    }

    #[tokio::test]
    async fn test_waiting_user_sees_lost_connection() {
        let server = MemoryConnector::new();
        let mut config = SessionConfig::default();
        config.signaling.auto_reconnect = false;
        let controller = SessionController::new(SessionStore::new(
            config,
            Arc::new(server.clone()),
            Arc::new(VirtualDevices::standard()),
            Arc::new(FakePeerConnector::new()),
        ));
        controller
            .join_room_with_auth("demo", "Alice", "token", None)
            .await
            .unwrap();
        assert!(controller.state().is_waiting_room);
        assert!(!controller.has_connection_issues());

        server.drop_connection();
        settle().await;
        let state = controller.state();
        assert_eq!(state.connection.status, ConnectionStatus::Failed);
        assert!(!state.is_joined);
        assert!(controller.has_connection_issues());
        assert!(!controller.is_room_ready());
    }

    #[tokio::test]
    async fn test_hand_toggle_sends_both_ways() {
        let server = MemoryConnector::new();
        let controller = controller(&server);
        controller
            .join_room_with_auth("demo", "Alice", "token", None)
            .await
            .unwrap();

        controller.toggle_hand().unwrap();
        server.next_sent("raise_hand").await;
        assert!(controller.state().hand_raised);

        controller.toggle_hand().unwrap();
        server.next_sent("lower_hand").await;
        assert!(!controller.state().hand_raised);
    }
}
