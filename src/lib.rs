//! Client-side session core for multi-party conferencing.
//!
//! A [`SessionController`] fronts a [`SessionStore`], which owns the signaling
//! client, the peer orchestrator and the media manager of one session.

pub mod config;
pub mod connection;
pub mod controller;
pub mod devices;
pub mod error;
pub mod media;
pub mod metrics;
pub mod peer;
pub mod protocol;
pub mod rtc;
pub mod signaling;
pub mod store;
pub mod transport;

#[cfg(feature = "native-audio")]
pub mod audio;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use config::SessionConfig;
pub use connection::{ConnectionState, ConnectionStatus};
pub use controller::SessionController;
pub use devices::{MediaDevices, MediaStream, MediaTrack, VirtualDevices};
pub use error::{ErrorKind, Result, SessionError};
pub use media::{MediaManager, MediaStatus, StreamOptions};
pub use peer::{NegotiationState, PeerOrchestrator};
pub use store::state::{ChatMessage, Participant, Role, SessionState};
pub use store::SessionStore;
