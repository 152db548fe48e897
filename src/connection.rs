use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tokio::sync::watch;

use crate::metrics::ConnectionQuality;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionStatus::Disconnected => write!(f, "disconnected"),
            ConnectionStatus::Connecting => write!(f, "connecting"),
            ConnectionStatus::Connected => write!(f, "connected"),
            ConnectionStatus::Reconnecting => write!(f, "reconnecting"),
            ConnectionStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Health of the signaling channel. One per session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub status: ConnectionStatus,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub latency_ms: Option<u64>,
    pub quality: Option<ConnectionQuality>,
}

impl ConnectionState {
    pub fn ws_connected(&self) -> bool {
        self.status == ConnectionStatus::Connected
    }
}

/// Publishes [`ConnectionState`] changes to any number of watchers.
#[derive(Clone)]
pub struct ConnectionMonitor {
    status: Arc<watch::Sender<ConnectionState>>,
}

impl ConnectionMonitor {
    pub fn new() -> Self {
        let (status, _receiver) = watch::channel(ConnectionState::default());
        Self {
            status: Arc::new(status),
        }
    }

    pub fn current(&self) -> ConnectionState {
        self.status.borrow().clone()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.borrow().status
    }

    pub fn begin_attempt(&self, status: ConnectionStatus) {
        self.status.send_modify(|state| {
            state.status = status;
            state.last_attempt_at = Some(Utc::now());
        });
    }

    pub fn set_connected(&self) {
        self.status.send_modify(|state| {
            state.status = ConnectionStatus::Connected;
            state.retry_count = 0;
            state.last_error = None;
        });
    }

    pub fn set_retry(&self, retry_count: u32) {
        self.status.send_modify(|state| {
            state.status = ConnectionStatus::Reconnecting;
            state.retry_count = retry_count;
        });
    }

    pub fn record_error(&self, error: String) {
        self.status.send_modify(|state| {
            state.last_error = Some(error);
        });
    }

    pub fn set_failed(&self, error: String) {
        self.status.send_modify(|state| {
            state.status = ConnectionStatus::Failed;
            state.last_error = Some(error);
        });
    }

    pub fn update_latency(&self, latency_ms: u64) {
        self.status.send_modify(|state| {
            state.latency_ms = Some(latency_ms);
            state.quality = Some(ConnectionQuality::from_latency(latency_ms));
        });
    }

    pub fn reset(&self) {
        self.status.send_replace(ConnectionState::default());
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }
}

impl Default for ConnectionMonitor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transitions() {
        let monitor = ConnectionMonitor::new();
        let rx = monitor.subscribe();
        assert_eq!(rx.borrow().status, ConnectionStatus::Disconnected);

        monitor.begin_attempt(ConnectionStatus::Connecting);
        assert!(rx.borrow().last_attempt_at.is_some());

        monitor.set_retry(2);
        monitor.record_error("refused".to_string());
        assert_eq!(rx.borrow().retry_count, 2);

        monitor.set_connected();
        let state = monitor.current();
        assert!(state.ws_connected());
        assert_eq!(state.retry_count, 0);
        assert!(state.last_error.is_none());

        monitor.reset();
        assert_eq!(monitor.current(), ConnectionState::default());
    }

    #[test]
    fn test_latency_sets_quality() {
        let monitor = ConnectionMonitor::new();
        monitor.update_latency(40);
        let state = monitor.current();
        assert_eq!(state.latency_ms, Some(40));
        assert_eq!(state.quality, Some(ConnectionQuality::Excellent));
    }
}
