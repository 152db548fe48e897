//! Inbound signaling handlers
//!
//! Room, chat and admission messages become state mutations; negotiation
//! messages are forwarded to the peer orchestrator untouched.

use std::sync::Weak;

use chrono::{TimeZone, Utc};
use tracing::{debug, info, warn};

use super::state::{ChatKind, ChatMessage, Participant, Role, SessionState};
use super::StoreInner;
use crate::protocol::{ChatPayload, ClientInfo, InboundMessage, MessageKind};
use crate::signaling::{SignalingClient, Subscription};

const STATE_EVENTS: [MessageKind; 12] = [
    MessageKind::RoomState,
    MessageKind::AddChat,
    MessageKind::AcceptWaiting,
    MessageKind::DenyWaiting,
    MessageKind::WaitingRequest,
    MessageKind::RaiseHand,
    MessageKind::LowerHand,
    MessageKind::Disconnect,
    MessageKind::RequestScreenShare,
    MessageKind::AcceptScreenShare,
    MessageKind::DenyScreenShare,
    MessageKind::RecentsChat,
];

const NEGOTIATION_EVENTS: [MessageKind; 4] = [
    MessageKind::Offer,
    MessageKind::Answer,
    MessageKind::Candidate,
    MessageKind::Renegotiate,
];

pub(super) fn register(client: &SignalingClient, store: Weak<StoreInner>) -> Vec<Subscription> {
    let connection = {
        let store = store.clone();
        client.on_connection_change(move |connection| {
            let Some(inner) = store.upgrade() else {
                return;
            };
            let mut resumed = false;
            inner.update(|state| {
                resumed = state.is_joined
                    && !state.connection.ws_connected()
                    && connection.ws_connected();
                state.connection = connection.clone();
            });
            // messages sent while the channel was down are only in the server's history
            if resumed {
                inner.fetch_chat_history();
            }
        })
    };

    let room = {
        let store = store.clone();
        client.on_messages(&STATE_EVENTS, move |message| {
            let Some(inner) = store.upgrade() else {
                return;
            };
            let mut admitted = false;
            inner.update(|state| {
                let was_joined = state.is_joined;
                apply(state, message);
                admitted = !was_joined && state.is_joined;
            });
            if admitted {
                inner.fetch_chat_history();
            }
        })
    };

    let negotiation = client.on_messages(&NEGOTIATION_EVENTS, move |message| {
        if let Some(inner) = store.upgrade() {
            inner.peers.handle_signal(message);
        }
    });

    vec![connection, room, negotiation]
}

/// Apply one room/chat/admission message to the session state.
pub(super) fn apply(state: &mut SessionState, message: &InboundMessage) {
    match message {
        InboundMessage::RoomState(snapshot) => {
            state.apply_room_state(snapshot);
            debug!(
                room_id = %snapshot.room_id,
                participants = state.participants.len(),
                waiting = state.pending_participants.len(),
                "Applied room state"
            );
        }
        InboundMessage::AddChat(chat) => {
            if let Some(sender) = state.participants.get_mut(&chat.client_id) {
                sender.last_activity = Utc::now();
            }
            state.append_message(chat_message(chat));
        }
        InboundMessage::AcceptWaiting(user) => accept(state, user),
        InboundMessage::DenyWaiting(user) => deny(state, user),
        InboundMessage::WaitingRequest(user) => {
            if state.is_local(user)
                || state.participants.contains_key(&user.client_id)
                || state.pending_participants.iter().any(|p| p.id == user.client_id)
            {
                return;
            }
            info!(participant_id = %user.client_id, "User is waiting for admission");
            state
                .pending_participants
                .push(Participant::from_client(user, Role::Participant));
        }
        InboundMessage::RaiseHand(user) => state.set_speaking(&user.client_id, true),
        InboundMessage::LowerHand(user) => state.set_speaking(&user.client_id, false),
        InboundMessage::Disconnect(user) => {
            if state.remove_participant(&user.client_id).is_some() {
                info!(participant_id = %user.client_id, "Participant left");
            }
            state.pending_participants.retain(|p| p.id != user.client_id);
            state.screen_share_requests.retain(|p| p.id != user.client_id);
        }
        InboundMessage::RequestScreenShare(user) => {
            if state.is_local(user)
                || state.screen_share_requests.iter().any(|p| p.id == user.client_id)
            {
                return;
            }
            info!(participant_id = %user.client_id, "Screen share requested");
            let requester = state
                .participants
                .get(&user.client_id)
                .cloned()
                .unwrap_or_else(|| Participant::from_client(user, Role::Participant));
            state.screen_share_requests.push(requester);
        }
        InboundMessage::AcceptScreenShare(user) => {
            if state.is_local(user) {
                info!("Screen share approved");
                state.screen_share_approved = true;
            }
            state.screen_share_requests.retain(|p| p.id != user.client_id);
        }
        InboundMessage::DenyScreenShare(user) => {
            if state.is_local(user) {
                warn!("Screen share request was denied");
                state.screen_share_approved = false;
                state.last_error = Some("Screen share request was denied by the host".to_string());
            }
            state.screen_share_requests.retain(|p| p.id != user.client_id);
        }
        InboundMessage::RecentsChat(history) => {
            let restored = state.restore_history(history.iter().map(chat_message));
            debug!(restored, "Restored chat history");
        }
        InboundMessage::Offer(_)
        | InboundMessage::Answer(_)
        | InboundMessage::Candidate(_)
        | InboundMessage::Renegotiate(_) => {}
    }
}

fn accept(state: &mut SessionState, user: &ClientInfo) {
    if state.is_local(user) {
        state.learn_local_id(&user.client_id);
        state.is_waiting_room = false;
        state.is_joined = true;
        state.last_error = None;
        info!(participant_id = %user.client_id, "Admitted to the room");
        return;
    }
    let position = state
        .pending_participants
        .iter()
        .position(|p| p.id == user.client_id);
    let participant = match position {
        Some(position) => state.pending_participants.remove(position),
        None if state.participants.contains_key(&user.client_id) => return,
        None => Participant::from_client(user, Role::Participant),
    };
    state.add_participant(participant);
}

fn deny(state: &mut SessionState, user: &ClientInfo) {
    if state.is_local(user) {
        warn!("Entry to the room was denied");
        state.is_waiting_room = false;
        state.join_requested = false;
        state.last_error = Some("Entry to the room was denied by the host".to_string());
        return;
    }
    state.pending_participants.retain(|p| p.id != user.client_id);
}

fn chat_message(chat: &ChatPayload) -> ChatMessage {
    let timestamp = Utc
        .timestamp_millis_opt(chat.chat_index)
        .single()
        .unwrap_or_else(Utc::now);
    ChatMessage {
        id: chat.chat_id.clone(),
        sender_id: chat.client_id.clone(),
        sender_name: chat.display_name.clone(),
        content: chat.chat_content.clone(),
        timestamp,
        kind: if chat.target_client_id.is_some() {
            ChatKind::Private
        } else {
            ChatKind::Text
        },
        target_id: chat.target_client_id.clone(),
    }
}
