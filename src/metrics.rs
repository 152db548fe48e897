use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

/// Coarse signaling quality derived from heartbeat round-trip time
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl ConnectionQuality {
    pub fn from_latency(latency_ms: u64) -> Self {
        Self::from_score(quality_score(latency_ms))
    }

    fn from_score(score: u8) -> Self {
        match score {
            90..=100 => ConnectionQuality::Excellent,
            70..=89 => ConnectionQuality::Good,
            50..=69 => ConnectionQuality::Fair,
            _ => ConnectionQuality::Poor,
        }
    }
}

/// 0-100 score from RTT bands
fn quality_score(round_trip_ms: u64) -> u8 {
    match round_trip_ms {
        0..=149 => 100,
        150..=299 => 80,
        300..=499 => 60,
        500..=999 => 40,
        _ => 20,
    }
}

/// Tracks outstanding heartbeats for one signaling connection.
#[derive(Debug, Default)]
pub struct HeartbeatTracker {
    outstanding: Option<(u64, Instant)>,
    next_seq: u64,
}

impl HeartbeatTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a heartbeat; returns the sequence number to put on the wire.
    pub fn start(&mut self, now: Instant) -> u64 {
        self.next_seq += 1;
        self.outstanding = Some((self.next_seq, now));
        self.next_seq
    }

    /// Acknowledge a heartbeat; returns the round-trip time when `seq` matches.
    pub fn acknowledge(&mut self, seq: u64, now: Instant) -> Option<Duration> {
        match self.outstanding {
            Some((pending, sent_at)) if pending == seq => {
                self.outstanding = None;
                Some(now.saturating_duration_since(sent_at))
            }
            _ => None,
        }
    }

    /// Whether the outstanding heartbeat has been waiting longer than `timeout`.
    pub fn is_overdue(&self, now: Instant, timeout: Duration) -> bool {
        self.outstanding
            .map(|(_, sent_at)| now.saturating_duration_since(sent_at) >= timeout)
            .unwrap_or(false)
    }
}
