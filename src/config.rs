//! Session configuration
//!
//! All fields have defaults, so a partial JSON document (or none at all) is a valid
//! configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{Result, SessionError};

/// Top-level configuration for one session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Scheme and host of the signaling server, e.g. `wss://meet.example.com`
    pub server_url: String,
    /// Path segment between `/ws/` and the room id
    pub namespace: String,
    pub signaling: SignalingConfig,
    pub peer: PeerConfig,
    pub media: MediaDefaults,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            server_url: "wss://localhost:8080".to_string(),
            namespace: "zoom".to_string(),
            signaling: SignalingConfig::default(),
            peer: PeerConfig::default(),
            media: MediaDefaults::default(),
        }
    }
}

impl SessionConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| SessionError::InvalidInput(format!("invalid session config: {}", e)))
    }

    /// Build `<server>/ws/<namespace>/<roomId>?token=<token>`.
    ///
    /// The token is forwarded verbatim (query-encoded only).
    pub fn signaling_url(&self, room_id: &str, token: &str) -> Result<Url> {
        let mut url = Url::parse(&self.server_url)?;
        url.path_segments_mut()
            .map_err(|_| {
                SessionError::ConnectionFailed(format!(
                    "server url cannot carry a path: {}",
                    self.server_url
                ))
            })?
            .pop_if_empty()
            .extend(["ws", self.namespace.as_str(), room_id]);
        url.query_pairs_mut().clear().append_pair("token", token);
        Ok(url)
    }
}

/// Signaling channel tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub auto_reconnect: bool,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    /// Fraction of `retry_delay_ms` added as random jitter (0.0 disables)
    pub retry_jitter: f64,
    pub heartbeat_interval_ms: u64,
    pub heartbeat_timeout_ms: u64,
    pub connection_timeout_ms: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_retries: 5,
            retry_delay_ms: 3000,
            retry_jitter: 0.0,
            heartbeat_interval_ms: 30_000,
            heartbeat_timeout_ms: 10_000,
            connection_timeout_ms: 10_000,
        }
    }
}

impl SignalingConfig {
    pub fn retry_delay(&self) -> Duration {
        let base = self.retry_delay_ms as f64;
        let jitter = if self.retry_jitter > 0.0 {
            base * self.retry_jitter * rand::random::<f64>()
        } else {
            0.0
        };
        Duration::from_millis((base + jitter) as u64)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }
}

/// Peer connection settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    pub ice_servers: Vec<String>,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".to_owned()],
        }
    }
}

/// Default capture constraints layered under caller-supplied options
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaDefaults {
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

impl Default for MediaDefaults {
    fn default() -> Self {
        Self {
            width: 1280,
            height: 720,
            frame_rate: 30,
        }
    }
}
