//! Signaling wire format
//!
//! Every frame is a JSON envelope `{"event": "<name>", "payload": {...}}` with
//! camelCase payload fields. Slices the server never populated arrive as `null`
//! and decode as empty.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::error::{Result, SessionError};

fn null_as_empty<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    Ok(Option::<Vec<T>>::deserialize(deserializer)?.unwrap_or_default())
}

/// Identity of the actor (or target) of an event
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientInfo {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub display_name: String,
}

impl ClientInfo {
    pub fn new(client_id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            client_id: client_id.into(),
            display_name: display_name.into(),
        }
    }
}

/// Full room snapshot; addressed to the receiving client
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomStatePayload {
    #[serde(default)]
    pub client_id: String,
    #[serde(default)]
    pub display_name: String,
    #[serde(default)]
    pub room_id: String,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub hosts: Vec<ClientInfo>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub participants: Vec<ClientInfo>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub hands_raised: Vec<ClientInfo>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub waiting_users: Vec<ClientInfo>,
    #[serde(default, deserialize_with = "null_as_empty")]
    pub sharing_screen: Vec<ClientInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    pub client_id: String,
    pub display_name: String,
    pub chat_id: String,
    /// Milliseconds since the Unix epoch
    pub chat_index: i64,
    pub chat_content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_client_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRequestPayload {
    pub client_id: String,
    pub display_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval_token: Option<String>,
}

/// Offer or answer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpPayload {
    pub client_id: String,
    #[serde(default)]
    pub display_name: String,
    pub target_client_id: String,
    pub sdp: String,
    #[serde(rename = "type")]
    pub sdp_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidatePayload {
    pub client_id: String,
    #[serde(default)]
    pub display_name: String,
    pub target_client_id: String,
    pub candidate: String,
    #[serde(default)]
    pub sdp_mid: Option<String>,
    #[serde(default, rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenegotiatePayload {
    pub client_id: String,
    #[serde(default)]
    pub display_name: String,
    pub target_client_id: String,
    #[serde(default)]
    pub reason: String,
}

/// Inbound event names this client understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    RoomState,
    AddChat,
    AcceptWaiting,
    DenyWaiting,
    WaitingRequest,
    RaiseHand,
    LowerHand,
    Offer,
    Answer,
    Candidate,
    Renegotiate,
    Disconnect,
    RequestScreenShare,
    AcceptScreenShare,
    DenyScreenShare,
    RecentsChat,
}

impl MessageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::RoomState => "room_state",
            MessageKind::AddChat => "add_chat",
            MessageKind::AcceptWaiting => "accept_waiting",
            MessageKind::DenyWaiting => "deny_waiting",
            MessageKind::WaitingRequest => "waiting_request",
            MessageKind::RaiseHand => "raise_hand",
            MessageKind::LowerHand => "lower_hand",
            MessageKind::Offer => "offer",
            MessageKind::Answer => "answer",
            MessageKind::Candidate => "candidate",
            MessageKind::Renegotiate => "renegotiate",
            MessageKind::Disconnect => "disconnect",
            MessageKind::RequestScreenShare => "request_screenshare",
            MessageKind::AcceptScreenShare => "accept_screenshare",
            MessageKind::DenyScreenShare => "deny_screenshare",
            MessageKind::RecentsChat => "recents_chat",
        }
    }
}

impl FromStr for MessageKind {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let kind = match s {
            "room_state" => MessageKind::RoomState,
            "add_chat" => MessageKind::AddChat,
            "accept_waiting" => MessageKind::AcceptWaiting,
            "deny_waiting" => MessageKind::DenyWaiting,
            "waiting_request" => MessageKind::WaitingRequest,
            "raise_hand" => MessageKind::RaiseHand,
            "lower_hand" => MessageKind::LowerHand,
            "offer" => MessageKind::Offer,
            "answer" => MessageKind::Answer,
            "candidate" => MessageKind::Candidate,
            "renegotiate" => MessageKind::Renegotiate,
            "disconnect" => MessageKind::Disconnect,
            "request_screenshare" => MessageKind::RequestScreenShare,
            "accept_screenshare" => MessageKind::AcceptScreenShare,
            "deny_screenshare" => MessageKind::DenyScreenShare,
            "recents_chat" => MessageKind::RecentsChat,
            _ => return Err(()),
        };
        Ok(kind)
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Deserialize)]
struct Envelope {
    event: String,
    #[serde(default)]
    payload: Value,
}

/// Decoded server-to-client message
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    RoomState(RoomStatePayload),
    AddChat(ChatPayload),
    AcceptWaiting(ClientInfo),
    DenyWaiting(ClientInfo),
    WaitingRequest(ClientInfo),
    RaiseHand(ClientInfo),
    LowerHand(ClientInfo),
    Offer(SdpPayload),
    Answer(SdpPayload),
    Candidate(CandidatePayload),
    Renegotiate(RenegotiatePayload),
    Disconnect(ClientInfo),
    /// A participant asks the hosts for permission to share
    RequestScreenShare(ClientInfo),
    AcceptScreenShare(ClientInfo),
    DenyScreenShare(ClientInfo),
    /// Recent chat history, oldest first
    RecentsChat(Vec<ChatPayload>),
}

impl InboundMessage {
    /// Decode one text frame.
    ///
    /// `Ok(None)` means a well-formed envelope with an event this client does not
    /// handle; malformed frames and payloads are `SignalingProtocol` errors.
    pub fn decode(text: &str) -> Result<Option<Self>> {
        let envelope: Envelope = serde_json::from_str(text)
            .map_err(|e| SessionError::SignalingProtocol(format!("malformed envelope: {}", e)))?;
        let Ok(kind) = envelope.event.parse::<MessageKind>() else {
            return Ok(None);
        };
        let payload = envelope.payload;
        let message = match kind {
            MessageKind::RoomState => InboundMessage::RoomState(from_payload(kind, payload)?),
            MessageKind::AddChat => InboundMessage::AddChat(from_payload(kind, payload)?),
            MessageKind::AcceptWaiting => InboundMessage::AcceptWaiting(from_payload(kind, payload)?),
            MessageKind::DenyWaiting => InboundMessage::DenyWaiting(from_payload(kind, payload)?),
            MessageKind::WaitingRequest => {
                InboundMessage::WaitingRequest(from_payload(kind, payload)?)
            }
            MessageKind::RaiseHand => InboundMessage::RaiseHand(from_payload(kind, payload)?),
            MessageKind::LowerHand => InboundMessage::LowerHand(from_payload(kind, payload)?),
            MessageKind::Offer => InboundMessage::Offer(from_payload(kind, payload)?),
            MessageKind::Answer => InboundMessage::Answer(from_payload(kind, payload)?),
            MessageKind::Candidate => InboundMessage::Candidate(from_payload(kind, payload)?),
            MessageKind::Renegotiate => InboundMessage::Renegotiate(from_payload(kind, payload)?),
            MessageKind::Disconnect => InboundMessage::Disconnect(from_payload(kind, payload)?),
            MessageKind::RequestScreenShare => {
                InboundMessage::RequestScreenShare(from_payload(kind, payload)?)
            }
            MessageKind::AcceptScreenShare => {
                InboundMessage::AcceptScreenShare(from_payload(kind, payload)?)
            }
            MessageKind::DenyScreenShare => {
                InboundMessage::DenyScreenShare(from_payload(kind, payload)?)
            }
            MessageKind::RecentsChat => InboundMessage::RecentsChat(
                from_payload::<Option<Vec<ChatPayload>>>(kind, payload)?.unwrap_or_default(),
            ),
        };
        Ok(Some(message))
    }

    pub fn kind(&self) -> MessageKind {
        match self {
            InboundMessage::RoomState(_) => MessageKind::RoomState,
            InboundMessage::AddChat(_) => MessageKind::AddChat,
            InboundMessage::AcceptWaiting(_) => MessageKind::AcceptWaiting,
            InboundMessage::DenyWaiting(_) => MessageKind::DenyWaiting,
            InboundMessage::WaitingRequest(_) => MessageKind::WaitingRequest,
            InboundMessage::RaiseHand(_) => MessageKind::RaiseHand,
            InboundMessage::LowerHand(_) => MessageKind::LowerHand,
            InboundMessage::Offer(_) => MessageKind::Offer,
            InboundMessage::Answer(_) => MessageKind::Answer,
            InboundMessage::Candidate(_) => MessageKind::Candidate,
            InboundMessage::Renegotiate(_) => MessageKind::Renegotiate,
            InboundMessage::Disconnect(_) => MessageKind::Disconnect,
            InboundMessage::RequestScreenShare(_) => MessageKind::RequestScreenShare,
            InboundMessage::AcceptScreenShare(_) => MessageKind::AcceptScreenShare,
            InboundMessage::DenyScreenShare(_) => MessageKind::DenyScreenShare,
            InboundMessage::RecentsChat(_) => MessageKind::RecentsChat,
        }
    }
}

fn from_payload<T: serde::de::DeserializeOwned>(kind: MessageKind, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| SessionError::SignalingProtocol(format!("bad {} payload: {}", kind, e)))
}

/// Client-to-server message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", content = "payload", rename_all = "snake_case")]
pub enum OutboundMessage {
    WaitingRequest(JoinRequestPayload),
    AddChat(ChatPayload),
    RaiseHand(ClientInfo),
    LowerHand(ClientInfo),
    AcceptWaiting(ClientInfo),
    DenyWaiting(ClientInfo),
    #[serde(rename = "request_screenshare")]
    RequestScreenShare(ClientInfo),
    #[serde(rename = "accept_screenshare")]
    AcceptScreenShare(ClientInfo),
    #[serde(rename = "deny_screenshare")]
    DenyScreenShare(ClientInfo),
    /// History request; the server answers with the last 50 messages
    RecentsChat(ChatPayload),
    Offer(SdpPayload),
    Answer(SdpPayload),
    Candidate(CandidatePayload),
    Renegotiate(RenegotiatePayload),
    Disconnect(ClientInfo),
}

impl OutboundMessage {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            OutboundMessage::WaitingRequest(_) => "waiting_request",
            OutboundMessage::AddChat(_) => "add_chat",
            OutboundMessage::RaiseHand(_) => "raise_hand",
            OutboundMessage::LowerHand(_) => "lower_hand",
            OutboundMessage::AcceptWaiting(_) => "accept_waiting",
            OutboundMessage::DenyWaiting(_) => "deny_waiting",
            OutboundMessage::RequestScreenShare(_) => "request_screenshare",
            OutboundMessage::AcceptScreenShare(_) => "accept_screenshare",
            OutboundMessage::DenyScreenShare(_) => "deny_screenshare",
            OutboundMessage::RecentsChat(_) => "recents_chat",
            OutboundMessage::Offer(_) => "offer",
            OutboundMessage::Answer(_) => "answer",
            OutboundMessage::Candidate(_) => "candidate",
            OutboundMessage::Renegotiate(_) => "renegotiate",
            OutboundMessage::Disconnect(_) => "disconnect",
        }
    }
}
