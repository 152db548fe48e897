use std::collections::{BTreeSet, HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionState;
use crate::devices::DeviceCatalog;
use crate::media::MediaStatus;
use crate::peer::RosterSnapshot;
use crate::protocol::{ClientInfo, RoomStatePayload};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Host,
    Moderator,
    Participant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Participant {
    pub id: String,
    pub display_name: String,
    pub role: Role,
    pub is_audio_enabled: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub is_speaking: bool,
    pub last_activity: DateTime<Utc>,
    pub media_track_ref: Option<String>,
}

impl Participant {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>, role: Role) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            role,
            is_audio_enabled: true,
            is_video_enabled: true,
            is_screen_sharing: false,
            is_speaking: false,
            last_activity: Utc::now(),
            media_track_ref: None,
        }
    }

    pub fn from_client(info: &ClientInfo, role: Role) -> Self {
        Self::new(info.client_id.clone(), info.display_name.clone(), role)
    }

    pub fn client_info(&self) -> ClientInfo {
        ClientInfo::new(self.id.clone(), self.display_name.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSettings {
    pub max_participants: Option<usize>,
    pub waiting_room_enabled: bool,
    pub chat_enabled: bool,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            max_participants: None,
            waiting_room_enabled: true,
            chat_enabled: true,
        }
    }
}

/// Set once the signaling channel is open, cleared on leave
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomIdentity {
    pub room_id: String,
    pub room_name: String,
    pub room_settings: RoomSettings,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatKind {
    Text,
    Private,
    System,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub kind: ChatKind,
    pub target_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layout {
    #[default]
    Grid,
    Speaker,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiFlags {
    pub is_chat_open: bool,
    pub is_participants_open: bool,
    pub layout: Layout,
}

/// Everything the presentation layer reads
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub room: Option<RoomIdentity>,
    /// The local user. Its id is the display name until the server assigns one.
    pub local: Option<Participant>,
    pub local_client_id: Option<String>,
    /// Remote participants only
    pub participants: HashMap<String, Participant>,
    pub pending_participants: Vec<Participant>,
    pub speaking_participants: HashSet<String>,
    pub selected_participant_id: Option<String>,
    pub pinned_participant_id: Option<String>,
    pub messages: Vec<ChatMessage>,
    pub unread_count: usize,
    pub connection: ConnectionState,
    pub devices: DeviceCatalog,
    pub media: MediaStatus,
    pub ui: UiFlags,
    pub join_requested: bool,
    pub is_joined: bool,
    pub is_waiting_room: bool,
    pub hand_raised: bool,
    /// Screen-share requests awaiting a decision from this host
    pub screen_share_requests: Vec<Participant>,
    /// A host granted the local user's screen-share request
    pub screen_share_approved: bool,
    pub last_error: Option<String>,
}

impl SessionState {
    pub fn local_info(&self) -> ClientInfo {
        match &self.local {
            Some(local) => ClientInfo::new(
                self.local_client_id.clone().unwrap_or_default(),
                local.display_name.clone(),
            ),
            None => ClientInfo::default(),
        }
    }

    /// Whether `info` names the local user. Before the server id is known the
    /// display name is the only handle.
    pub fn is_local(&self, info: &ClientInfo) -> bool {
        match (&self.local_client_id, &self.local) {
            (Some(id), _) => *id == info.client_id,
            (None, Some(local)) => local.display_name == info.display_name,
            (None, None) => false,
        }
    }

    pub fn learn_local_id(&mut self, client_id: &str) {
        if client_id.is_empty() || self.local_client_id.is_some() {
            return;
        }
        self.local_client_id = Some(client_id.to_string());
        if let Some(local) = &mut self.local {
            local.id = client_id.to_string();
        }
        self.participants.remove(client_id);
    }

    fn local_id_matches(&self, id: &str) -> bool {
        self.local_client_id.as_deref() == Some(id)
    }

    /// Replace roster and waiting list with the server's snapshot.
    ///
    /// Per-participant media flags carry over for ids that stay. Speaking state
    /// survives, minus ids that are gone, plus everyone in `handsRaised`.
    pub fn apply_room_state(&mut self, snapshot: &RoomStatePayload) {
        self.learn_local_id(&snapshot.client_id);

        let host_ids: HashSet<&str> = snapshot.hosts.iter().map(|h| h.client_id.as_str()).collect();
        let sharing: HashSet<&str> = snapshot
            .sharing_screen
            .iter()
            .map(|s| s.client_id.as_str())
            .collect();

        let mut roster = HashMap::new();
        let mut local_admitted = false;
        for info in snapshot.hosts.iter().chain(snapshot.participants.iter()) {
            if info.client_id.is_empty() {
                continue;
            }
            if self.local_id_matches(&info.client_id) {
                local_admitted = true;
                continue;
            }
            if roster.contains_key(&info.client_id) {
                continue;
            }
            let role = if host_ids.contains(info.client_id.as_str()) {
                Role::Host
            } else {
                Role::Participant
            };
            let mut participant = match self.participants.get(&info.client_id) {
                Some(previous) => {
                    let mut kept = previous.clone();
                    kept.display_name = info.display_name.clone();
                    // moderator is only ever granted locally
                    if !(kept.role == Role::Moderator && role == Role::Participant) {
                        kept.role = role;
                    }
                    kept
                }
                None => Participant::from_client(info, role),
            };
            participant.is_screen_sharing = sharing.contains(info.client_id.as_str());
            roster.insert(info.client_id.clone(), participant);
        }
        self.participants = roster;

        self.pending_participants = Vec::new();
        for info in &snapshot.waiting_users {
            if self.local_id_matches(&info.client_id) {
                continue;
            }
            if !self.pending_participants.iter().any(|p| p.id == info.client_id) {
                self.pending_participants
                    .push(Participant::from_client(info, Role::Participant));
            }
        }

        let local_id = self.local_client_id.clone();
        let participants = &self.participants;
        let present = |id: &str| participants.contains_key(id) || local_id.as_deref() == Some(id);
        self.speaking_participants.retain(|id| present(id));
        for raised in &snapshot.hands_raised {
            if present(&raised.client_id) {
                self.speaking_participants.insert(raised.client_id.clone());
            }
        }
        self.sync_speaking_flags();

        if let Some(local_id) = &local_id {
            if local_admitted {
                self.is_joined = true;
                self.is_waiting_room = false;
            } else if snapshot.waiting_users.iter().any(|w| w.client_id == *local_id) {
                self.is_waiting_room = true;
            }
            self.hand_raised = self.speaking_participants.contains(local_id);
            if let Some(local) = &mut self.local {
                local.role = if host_ids.contains(local_id.as_str()) {
                    Role::Host
                } else {
                    Role::Participant
                };
                local.is_screen_sharing |= sharing.contains(local_id.as_str());
            }
        }

        self.drop_stale_selection();
    }

    pub fn add_participant(&mut self, participant: Participant) {
        if self.local_id_matches(&participant.id) {
            return;
        }
        self.pending_participants.retain(|p| p.id != participant.id);
        self.participants.insert(participant.id.clone(), participant);
    }

    /// Returns false when there is no such participant
    pub fn update_participant(&mut self, id: &str, update: impl FnOnce(&mut Participant)) -> bool {
        match self.participants.get_mut(id) {
            Some(participant) => {
                update(participant);
                participant.id = id.to_string();
                true
            }
            None => false,
        }
    }

    /// Remove from the roster together with every reference to the participant.
    pub fn remove_participant(&mut self, id: &str) -> Option<Participant> {
        let removed = self.participants.remove(id);
        self.speaking_participants.remove(id);
        if self.selected_participant_id.as_deref() == Some(id) {
            self.selected_participant_id = None;
        }
        if self.pinned_participant_id.as_deref() == Some(id) {
            self.pinned_participant_id = None;
        }
        removed
    }

    pub fn set_speaking(&mut self, id: &str, speaking: bool) {
        if speaking {
            self.speaking_participants.insert(id.to_string());
        } else {
            self.speaking_participants.remove(id);
        }
        if let Some(participant) = self.participants.get_mut(id) {
            participant.is_speaking = speaking;
            participant.last_activity = Utc::now();
        }
        if self.local_id_matches(id) {
            self.hand_raised = speaking;
            if let Some(local) = &mut self.local {
                local.is_speaking = speaking;
            }
        }
    }

    /// Append unless a message with the same id is already in the log.
    pub fn append_message(&mut self, message: ChatMessage) -> bool {
        if self.messages.iter().any(|m| m.id == message.id) {
            return false;
        }
        let from_local = self.local_id_matches(&message.sender_id);
        if !self.ui.is_chat_open && !from_local && message.kind != ChatKind::System {
            self.unread_count += 1;
        }
        self.messages.push(message);
        true
    }

    /// Merge fetched history: unknown messages join the log in timestamp order
    /// without counting as unread. Returns how many were new.
    pub fn restore_history(&mut self, history: impl IntoIterator<Item = ChatMessage>) -> usize {
        let before = self.messages.len();
        for message in history {
            if !self.messages.iter().any(|m| m.id == message.id) {
                self.messages.push(message);
            }
        }
        self.messages.sort_by_key(|m| m.timestamp);
        self.messages.len() - before
    }

    pub fn mark_messages_read(&mut self) {
        self.unread_count = 0;
    }

    /// Back to the state of a fresh store, keeping devices, media selection and UI flags.
    pub fn reset_session(&mut self) {
        let devices = std::mem::take(&mut self.devices);
        let media = std::mem::take(&mut self.media);
        let ui = std::mem::take(&mut self.ui);
        *self = SessionState {
            devices,
            media: MediaStatus {
                selected_camera: media.selected_camera,
                selected_microphone: media.selected_microphone,
                selected_speaker: media.selected_speaker,
                ..MediaStatus::default()
            },
            ui,
            ..SessionState::default()
        };
    }

    pub fn roster_snapshot(&self) -> RosterSnapshot {
        RosterSnapshot {
            local: self
                .local_client_id
                .as_ref()
                .map(|_| self.local_info()),
            active: self.is_joined && !self.is_waiting_room,
            remote_ids: self.participants.keys().cloned().collect::<BTreeSet<_>>(),
        }
    }

    fn sync_speaking_flags(&mut self) {
        for (id, participant) in self.participants.iter_mut() {
            participant.is_speaking = self.speaking_participants.contains(id);
        }
    }

    fn drop_stale_selection(&mut self) {
        let participants = &self.participants;
        if let Some(id) = &self.selected_participant_id {
            if !participants.contains_key(id) {
                self.selected_participant_id = None;
            }
        }
        if let Some(id) = &self.pinned_participant_id {
            if !participants.contains_key(id) {
                self.pinned_participant_id = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(id: &str, name: &str) -> ClientInfo {
        ClientInfo::new(id, name)
    }

    fn joined_state() -> SessionState {
        let mut state = SessionState {
            local: Some(Participant::new("Alice", "Alice", Role::Participant)),
            ..Default::default()
        };
        state.learn_local_id("u1");
        state
    }

    fn snapshot() -> RoomStatePayload {
        RoomStatePayload {
            client_id: "u1".into(),
            display_name: "Alice".into(),
            room_id: "demo".into(),
            hosts: vec![info("h1", "Hana")],
            participants: vec![info("u1", "Alice"), info("u2", "Bob"), info("u3", "Cy")],
            hands_raised: vec![info("u2", "Bob")],
            waiting_users: vec![info("w1", "Wes")],
            sharing_screen: vec![info("u3", "Cy")],
        }
    }

    #[test]
    fn test_room_state_is_full_replace() {
        let mut state = joined_state();
        state.add_participant(Participant::new("ghost", "Ghost", Role::Participant));
        state.apply_room_state(&snapshot());

        let mut ids: Vec<_> = state.participants.keys().cloned().collect();
        ids.sort();
        assert_eq!(ids, vec!["h1", "u2", "u3"]);
        assert_eq!(state.participants["h1"].role, Role::Host);
        assert!(state.participants["u3"].is_screen_sharing);
        assert!(state.participants["u2"].is_speaking);
        assert_eq!(state.pending_participants.len(), 1);
        assert!(state.is_joined);
        assert!(!state.is_waiting_room);
    }

    #[test]
    fn test_room_state_idempotent() {
        let mut state = joined_state();
        state.speaking_participants.insert("u3".into());
        state.apply_room_state(&snapshot());
        let once = state.clone();
        state.apply_room_state(&snapshot());
        assert_eq!(state, once);
    }

    #[test]
    fn test_speaking_survives_snapshot_unless_gone() {
        let mut state = joined_state();
        state.apply_room_state(&snapshot());
        state.set_speaking("u3", true);
        state.set_speaking("h1", true);

        let mut next = snapshot();
        next.hosts.clear();
        next.hands_raised.clear();
        state.apply_room_state(&next);

        assert!(state.speaking_participants.contains("u3"));
        assert!(state.speaking_participants.contains("u2"));
        assert!(!state.speaking_participants.contains("h1"));
    }

    #[test]
    fn test_remove_participant_clears_references() {
        let mut state = joined_state();
        state.apply_room_state(&snapshot());
        state.selected_participant_id = Some("u2".into());
        state.pinned_participant_id = Some("u2".into());

        assert!(state.remove_participant("u2").is_some());
        assert!(!state.speaking_participants.contains("u2"));
        assert_eq!(state.selected_participant_id, None);
        assert_eq!(state.pinned_participant_id, None);

        state.selected_participant_id = Some("u3".into());
        state.remove_participant("h1");
        assert_eq!(state.selected_participant_id.as_deref(), Some("u3"));
    }

    #[test]
    fn test_append_only_chat_and_unread() {
        let mut state = joined_state();
        let message = |id: &str, sender: &str| ChatMessage {
            id: id.into(),
            sender_id: sender.into(),
            sender_name: sender.into(),
            content: "hi".into(),
            timestamp: Utc::now(),
            kind: ChatKind::Text,
            target_id: None,
        };
        assert!(state.append_message(message("1", "u2")));
        assert!(!state.append_message(message("1", "u2")));
        assert!(state.append_message(message("2", "u1")));
        assert_eq!(state.messages.len(), 2);
        assert_eq!(state.unread_count, 1);

        state.mark_messages_read();
        assert_eq!(state.unread_count, 0);
        assert_eq!(state.messages.len(), 2);
    }

    #[test]
    fn test_is_local_before_and_after_id() {
        let mut state = SessionState {
            local: Some(Participant::new("Alice", "Alice", Role::Participant)),
            ..Default::default()
        };
        assert!(state.is_local(&info("", "Alice")));
        assert!(state.roster_snapshot().local.is_none());

        state.learn_local_id("u1");
        assert!(state.is_local(&info("u1", "Someone")));
        assert!(!state.is_local(&info("u9", "Alice")));
        assert_eq!(state.roster_snapshot().local.unwrap().client_id, "u1");
    }

    #[test]
    fn test_reset_keeps_devices_and_selection() {
        let mut state = joined_state();
        state.apply_room_state(&snapshot());
        state.media.selected_camera = Some("cam-1".into());
        state.media.is_video_enabled = true;
        state.ui.layout = Layout::Speaker;
        state.reset_session();

        assert!(state.participants.is_empty());
        assert!(state.local.is_none());
        assert_eq!(state.media.selected_camera.as_deref(), Some("cam-1"));
        assert!(!state.media.is_video_enabled);
        assert_eq!(state.ui.layout, Layout::Speaker);
    }
}
