use std::fmt;

use anyhow::Error as AnyhowError;
use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;
use webrtc::Error as WebRTCError;

/// Discriminant of [`SessionError`], stable across wrapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Authentication,
    ConnectionTimeout,
    ConnectionFailed,
    NotConnected,
    SignalingProtocol,
    MediaPermission,
    DeviceUnavailable,
    Media,
    PeerNegotiation,
    InvalidInput,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Authentication => "AuthenticationError",
            ErrorKind::ConnectionTimeout => "ConnectionTimeoutError",
            ErrorKind::ConnectionFailed => "ConnectionFailedError",
            ErrorKind::NotConnected => "NotConnectedError",
            ErrorKind::SignalingProtocol => "SignalingProtocolError",
            ErrorKind::MediaPermission => "MediaPermissionError",
            ErrorKind::DeviceUnavailable => "DeviceUnavailableError",
            ErrorKind::Media => "MediaError",
            ErrorKind::PeerNegotiation => "PeerNegotiationError",
            ErrorKind::InvalidInput => "InvalidInputError",
        };
        f.write_str(name)
    }
}

/// Every failure the session core reports.
///
/// Errors are `Clone` so a single in-flight operation can hand the same outcome to
/// every caller that joined it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("AuthenticationError: {0}")]
    Authentication(String),

    #[error("ConnectionTimeoutError: transport did not open within {timeout_ms} ms")]
    ConnectionTimeout { timeout_ms: u64 },

    #[error("ConnectionFailedError: {0}")]
    ConnectionFailed(String),

    #[error("signaling channel is not open")]
    NotConnected,

    #[error("SignalingProtocolError: {0}")]
    SignalingProtocol(String),

    #[error("MediaPermissionError: {0}")]
    MediaPermission(String),

    #[error("DeviceUnavailableError: {0}")]
    DeviceUnavailable(String),

    #[error("Media error: {0}")]
    Media(String),

    #[error("PeerNegotiationError [{participant_id}]: {reason}")]
    PeerNegotiation {
        participant_id: String,
        reason: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{message}: {source}")]
    Join {
        message: String,
        #[source]
        source: Box<SessionError>,
    },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::Authentication(_) => ErrorKind::Authentication,
            SessionError::ConnectionTimeout { .. } => ErrorKind::ConnectionTimeout,
            SessionError::ConnectionFailed(_) => ErrorKind::ConnectionFailed,
            SessionError::NotConnected => ErrorKind::NotConnected,
            SessionError::SignalingProtocol(_) => ErrorKind::SignalingProtocol,
            SessionError::MediaPermission(_) => ErrorKind::MediaPermission,
            SessionError::DeviceUnavailable(_) => ErrorKind::DeviceUnavailable,
            SessionError::Media(_) => ErrorKind::Media,
            SessionError::PeerNegotiation { .. } => ErrorKind::PeerNegotiation,
            SessionError::InvalidInput(_) => ErrorKind::InvalidInput,
            SessionError::Join { source, .. } => source.kind(),
        }
    }

    /// The innermost error, with any `Join` wrapping removed.
    pub fn root(&self) -> &SessionError {
        match self {
            SessionError::Join { source, .. } => source.root(),
            other => other,
        }
    }

    pub fn peer(participant_id: impl Into<String>, reason: impl fmt::Display) -> Self {
        SessionError::PeerNegotiation {
            participant_id: participant_id.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<WsError> for SessionError {
    fn from(err: WsError) -> Self {
        SessionError::ConnectionFailed(format!("WebSocket error: {}", err))
    }
}

impl From<WebRTCError> for SessionError {
    fn from(err: WebRTCError) -> Self {
        SessionError::PeerNegotiation {
            participant_id: String::new(),
            reason: format!("WebRTC error: {}", err),
        }
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(err: serde_json::Error) -> Self {
        SessionError::SignalingProtocol(err.to_string())
    }
}

impl From<url::ParseError> for SessionError {
    fn from(err: url::ParseError) -> Self {
        SessionError::ConnectionFailed(format!("invalid signaling address: {}", err))
    }
}

impl From<AnyhowError> for SessionError {
    fn from(err: AnyhowError) -> Self {
        SessionError::PeerNegotiation {
            participant_id: String::new(),
            reason: format!("{:#}", err),
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
