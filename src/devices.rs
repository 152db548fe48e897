//! Capture hardware abstraction
//!
//! [`MediaDevices`] is the seam between the media manager and whatever actually
//! produces frames: [`VirtualDevices`] for headless use and tests, and
//! `audio::CpalDevices` for real sound cards when the `native-audio` feature is on.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, watch};
use uuid::Uuid;

use crate::error::{Result, SessionError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    #[serde(rename = "videoinput")]
    Camera,
    #[serde(rename = "audioinput")]
    Microphone,
    #[serde(rename = "audiooutput")]
    Speaker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub device_id: String,
    pub label: String,
    pub kind: DeviceKind,
}

impl DeviceInfo {
    pub fn new(device_id: impl Into<String>, label: impl Into<String>, kind: DeviceKind) -> Self {
        Self {
            device_id: device_id.into(),
            label: label.into(),
            kind,
        }
    }
}

/// Devices grouped by class
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceCatalog {
    pub cameras: Vec<DeviceInfo>,
    pub microphones: Vec<DeviceInfo>,
    pub speakers: Vec<DeviceInfo>,
}

impl DeviceCatalog {
    pub fn from_devices(devices: impl IntoIterator<Item = DeviceInfo>) -> Self {
        let mut catalog = DeviceCatalog::default();
        for device in devices {
            let bucket = match device.kind {
                DeviceKind::Camera => &mut catalog.cameras,
                DeviceKind::Microphone => &mut catalog.microphones,
                DeviceKind::Speaker => &mut catalog.speakers,
            };
            if !bucket.iter().any(|d| d.device_id == device.device_id) {
                bucket.push(device);
            }
        }
        catalog
    }

    pub fn devices(&self, kind: DeviceKind) -> &[DeviceInfo] {
        match kind {
            DeviceKind::Camera => &self.cameras,
            DeviceKind::Microphone => &self.microphones,
            DeviceKind::Speaker => &self.speakers,
        }
    }

    pub fn contains(&self, kind: DeviceKind, device_id: &str) -> bool {
        self.devices(kind).iter().any(|d| d.device_id == device_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackSource {
    Microphone,
    Camera,
    Screen,
}

impl TrackSource {
    pub fn kind(&self) -> TrackKind {
        match self {
            TrackSource::Microphone => TrackKind::Audio,
            TrackSource::Camera | TrackSource::Screen => TrackKind::Video,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Live,
    Ended,
}

/// One local capture track.
///
/// A track ends either through [`stop`](MediaTrack::stop) or because the source
/// went away (device unplugged, OS-level "stop sharing"); both look the same to
/// watchers of [`ended`](MediaTrack::ended).
pub struct MediaTrack {
    id: String,
    source: TrackSource,
    label: String,
    device_id: Option<String>,
    enabled: AtomicBool,
    state: watch::Sender<TrackState>,
}

impl MediaTrack {
    pub fn new(source: TrackSource, label: impl Into<String>, device_id: Option<String>) -> Arc<Self> {
        let (state, _) = watch::channel(TrackState::Live);
        Arc::new(Self {
            id: Uuid::new_v4().to_string(),
            source,
            label: label.into(),
            device_id,
            enabled: AtomicBool::new(true),
            state,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> TrackKind {
        self.source.kind()
    }

    pub fn source(&self) -> TrackSource {
        self.source
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Mute/unmute without releasing the hardware
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        *self.state.borrow() == TrackState::Live
    }

    /// Release the source. Idempotent.
    pub fn stop(&self) {
        self.state.send_if_modified(|state| {
            let was_live = *state == TrackState::Live;
            *state = TrackState::Ended;
            was_live
        });
    }

    /// Resolves once the track has ended, whatever ended it.
    pub async fn ended(&self) {
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == TrackState::Ended).await;
    }
}

impl fmt::Debug for MediaTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaTrack")
            .field("id", &self.id)
            .field("source", &self.source)
            .field("label", &self.label)
            .field("device_id", &self.device_id)
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// A set of local tracks handed out together
#[derive(Debug, Clone)]
pub struct MediaStream {
    id: String,
    tracks: Vec<Arc<MediaTrack>>,
}

impl MediaStream {
    pub fn new(tracks: Vec<Arc<MediaTrack>>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            tracks,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[Arc<MediaTrack>] {
        &self.tracks
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &Arc<MediaTrack>> {
        self.tracks.iter().filter(|t| t.kind() == TrackKind::Video)
    }

    pub fn track(&self, kind: TrackKind) -> Option<&Arc<MediaTrack>> {
        self.tracks.iter().find(|t| t.kind() == kind)
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }

    /// Replace (or add) the track of `track`'s kind, keeping the stream id.
    pub fn with_track(&self, track: Arc<MediaTrack>) -> Self {
        let mut tracks: Vec<_> = self
            .tracks
            .iter()
            .filter(|t| t.kind() != track.kind())
            .cloned()
            .collect();
        tracks.push(track);
        Self {
            id: self.id.clone(),
            tracks,
        }
    }

    pub fn stop_all(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AudioConstraints {
    pub device_id: Option<String>,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VideoConstraints {
    pub device_id: Option<String>,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// Resolved request to the hardware. `None` omits that track class.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MediaConstraints {
    pub audio: Option<AudioConstraints>,
    pub video: Option<VideoConstraints>,
}

/// Capture hardware
#[async_trait]
pub trait MediaDevices: Send + Sync {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Ask for capture permission. `Ok(false)` means the user refused.
    async fn request_permissions(&self) -> Result<bool>;

    /// Acquire camera/microphone tracks.
    ///
    /// Denial is reported as `SessionError::MediaPermission`, a missing device id as
    /// `SessionError::DeviceUnavailable`.
    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream>;

    async fn get_display_media(&self) -> Result<MediaStream>;

    /// Hot-plug notifications, if the backend can observe them
    fn device_changes(&self) -> Option<broadcast::Receiver<()>> {
        None
    }
}

#[derive(Default)]
struct VirtualState {
    devices: Vec<DeviceInfo>,
    deny_permissions: bool,
    acquire_delay: Option<Duration>,
    issued: Vec<Arc<MediaTrack>>,
}

/// Software devices: a configurable catalog that mints synthetic tracks.
pub struct VirtualDevices {
    state: Mutex<VirtualState>,
    acquisitions: AtomicUsize,
    display_acquisitions: AtomicUsize,
    changes: broadcast::Sender<()>,
}

impl VirtualDevices {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(16);
        Self {
            state: Mutex::new(VirtualState::default()),
            acquisitions: AtomicUsize::new(0),
            display_acquisitions: AtomicUsize::new(0),
            changes,
        }
    }

    /// One camera, one microphone, one speaker
    pub fn standard() -> Self {
        Self::new()
            .with_device(DeviceInfo::new("cam-1", "Virtual Camera", DeviceKind::Camera))
            .with_device(DeviceInfo::new("mic-1", "Virtual Microphone", DeviceKind::Microphone))
            .with_device(DeviceInfo::new("spk-1", "Virtual Speaker", DeviceKind::Speaker))
    }

    pub fn with_device(self, device: DeviceInfo) -> Self {
        self.state.lock().devices.push(device);
        self
    }

    pub fn deny_permissions(&self, deny: bool) {
        self.state.lock().deny_permissions = deny;
    }

    /// Simulated hardware latency for `get_user_media`
    pub fn set_acquire_delay(&self, delay: Option<Duration>) {
        self.state.lock().acquire_delay = delay;
    }

    pub fn plug(&self, device: DeviceInfo) {
        self.state.lock().devices.push(device);
        let _ = self.changes.send(());
    }

    pub fn unplug(&self, device_id: &str) {
        self.state.lock().devices.retain(|d| d.device_id != device_id);
        let _ = self.changes.send(());
    }

    /// Number of `get_user_media` calls that reached the hardware
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Screen captures started
    pub fn display_acquisitions(&self) -> usize {
        self.display_acquisitions.load(Ordering::SeqCst)
    }

    /// Every track ever handed out
    pub fn issued_tracks(&self) -> Vec<Arc<MediaTrack>> {
        self.state.lock().issued.clone()
    }

    fn pick(&self, kind: DeviceKind, requested: Option<&str>) -> Result<DeviceInfo> {
        let state = self.state.lock();
        let mut candidates = state.devices.iter().filter(|d| d.kind == kind);
        let found = match requested {
            Some(id) => candidates.find(|d| d.device_id == id),
            None => candidates.next(),
        };
        found.cloned().ok_or_else(|| {
            SessionError::DeviceUnavailable(match requested {
                Some(id) => format!("device {} is not present", id),
                None => format!("no {:?} available", kind),
            })
        })
    }

    fn issue(&self, source: TrackSource, device: Option<&DeviceInfo>, label: &str) -> Arc<MediaTrack> {
        let track = MediaTrack::new(
            source,
            device.map(|d| d.label.clone()).unwrap_or_else(|| label.to_string()),
            device.map(|d| d.device_id.clone()),
        );
        self.state.lock().issued.push(Arc::clone(&track));
        track
    }
}

impl Default for VirtualDevices {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MediaDevices for VirtualDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        Ok(self.state.lock().devices.clone())
    }

    async fn request_permissions(&self) -> Result<bool> {
        Ok(!self.state.lock().deny_permissions)
    }

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        let (deny, delay) = {
            let state = self.state.lock();
            (state.deny_permissions, state.acquire_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if deny {
            return Err(SessionError::MediaPermission(
                "camera/microphone access denied".to_string(),
            ));
        }

        let mut tracks = Vec::new();
        if let Some(audio) = &constraints.audio {
            let device = self.pick(DeviceKind::Microphone, audio.device_id.as_deref())?;
            tracks.push(self.issue(TrackSource::Microphone, Some(&device), "microphone"));
        }
        if let Some(video) = &constraints.video {
            let device = self.pick(DeviceKind::Camera, video.device_id.as_deref())?;
            tracks.push(self.issue(TrackSource::Camera, Some(&device), "camera"));
        }
        Ok(MediaStream::new(tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStream> {
        self.display_acquisitions.fetch_add(1, Ordering::SeqCst);
        let (deny, delay) = {
            let state = self.state.lock();
            (state.deny_permissions, state.acquire_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if deny {
            return Err(SessionError::MediaPermission(
                "screen capture access denied".to_string(),
            ));
        }
        let track = self.issue(TrackSource::Screen, None, "Screen 1");
        Ok(MediaStream::new(vec![track]))
    }

    fn device_changes(&self) -> Option<broadcast::Receiver<()>> {
        Some(self.changes.subscribe())
    }
}
