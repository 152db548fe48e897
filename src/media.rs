//! Local media capture
//!
//! [`MediaManager`] is the only owner of hardware tracks. It keeps the
//! camera/microphone stream and the screen-share stream apart and publishes the
//! combination peers should send on [`MediaManager::watch_outgoing`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::MediaDefaults;
use crate::devices::{
    AudioConstraints, DeviceCatalog, DeviceKind, MediaConstraints, MediaDevices, MediaStream,
    MediaTrack, TrackKind, VideoConstraints,
};
use crate::error::{Result, SessionError};

type PendingStream = Shared<BoxFuture<'static, Result<MediaStream>>>;

/// Caller-side request for [`MediaManager::initialize_stream`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamOptions {
    pub audio: bool,
    pub video: bool,
    pub camera_id: Option<String>,
    pub microphone_id: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub frame_rate: Option<u32>,
}

impl Default for StreamOptions {
    fn default() -> Self {
        Self {
            audio: true,
            video: true,
            camera_id: None,
            microphone_id: None,
            width: None,
            height: None,
            frame_rate: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatus {
    pub is_starting: bool,
    pub is_initialized: bool,
    pub is_audio_enabled: bool,
    pub is_video_enabled: bool,
    pub is_screen_sharing: bool,
    pub selected_camera: Option<String>,
    pub selected_microphone: Option<String>,
    pub selected_speaker: Option<String>,
    pub last_error: Option<String>,
}

struct MediaInner {
    devices: Arc<dyn MediaDevices>,
    defaults: MediaDefaults,
    status: watch::Sender<MediaStatus>,
    outgoing: watch::Sender<Option<MediaStream>>,
    camera: Mutex<Option<MediaStream>>,
    screen: Mutex<Option<MediaStream>>,
    screen_watch: Mutex<Option<JoinHandle<()>>>,
    pending: Mutex<Option<PendingStream>>,
    screen_pending: Mutex<Option<PendingStream>>,
    /// Bumped by `cleanup`; voids camera acquisitions in flight
    epoch: AtomicU64,
    /// Bumped by `cleanup` and `stop_screen_share`
    screen_epoch: AtomicU64,
}

/// Cheaply cloneable handle to the capture manager
#[derive(Clone)]
pub struct MediaManager {
    inner: Arc<MediaInner>,
}

impl MediaManager {
    pub fn new(devices: Arc<dyn MediaDevices>, defaults: MediaDefaults) -> Self {
        let (status, _) = watch::channel(MediaStatus::default());
        let (outgoing, _) = watch::channel(None);
        Self {
            inner: Arc::new(MediaInner {
                devices,
                defaults,
                status,
                outgoing,
                camera: Mutex::new(None),
                screen: Mutex::new(None),
                screen_watch: Mutex::new(None),
                pending: Mutex::new(None),
                screen_pending: Mutex::new(None),
                epoch: AtomicU64::new(0),
                screen_epoch: AtomicU64::new(0),
            }),
        }
    }

    /// Acquire the camera/microphone stream.
    ///
    /// While a stream is held or being acquired, every call returns that same
    /// stream; the hardware is asked at most once.
    pub async fn initialize_stream(&self, options: StreamOptions) -> Result<MediaStream> {
        if let Some(stream) = self.inner.camera.lock().clone() {
            return Ok(stream);
        }
        let attempt = {
            let mut pending = self.inner.pending.lock();
            // acquire() stores the stream before clearing `pending`
            if let Some(stream) = self.inner.camera.lock().clone() {
                return Ok(stream);
            }
            match pending.as_ref() {
                Some(attempt) => {
                    debug!("Joining in-flight media acquisition");
                    attempt.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let attempt = async move { inner.acquire(options).await }.boxed().shared();
                    *pending = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Stop every held track and reset the status flags. Safe with no stream.
    pub fn cleanup(&self) {
        let inner = &self.inner;
        inner.epoch.fetch_add(1, Ordering::SeqCst);
        inner.screen_epoch.fetch_add(1, Ordering::SeqCst);
        inner.pending.lock().take();
        inner.screen_pending.lock().take();
        if let Some(watcher) = inner.screen_watch.lock().take() {
            watcher.abort();
        }
        let camera = inner.camera.lock().take();
        let screen = inner.screen.lock().take();
        let released = camera.is_some() || screen.is_some();
        for stream in camera.iter().chain(screen.iter()) {
            stream.stop_all();
        }
        inner.status.send_modify(|status| {
            status.is_starting = false;
            status.is_initialized = false;
            status.is_audio_enabled = false;
            status.is_video_enabled = false;
            status.is_screen_sharing = false;
            status.last_error = None;
        });
        inner.publish_outgoing();
        if released {
            info!("Local media released");
        }
    }

    pub async fn request_permissions(&self) -> Result<bool> {
        let granted = self.inner.devices.request_permissions().await?;
        if !granted {
            self.inner.status.send_modify(|status| {
                status.last_error =
                    Some(SessionError::MediaPermission("permission denied".into()).to_string());
            });
        }
        Ok(granted)
    }

    pub async fn enumerate_devices(&self) -> Result<DeviceCatalog> {
        Ok(DeviceCatalog::from_devices(
            self.inner.devices.enumerate_devices().await?,
        ))
    }

    pub fn device_changes(&self) -> Option<broadcast::Receiver<()>> {
        self.inner.devices.device_changes()
    }

    pub async fn switch_camera(&self, device_id: &str) -> Result<()> {
        self.switch_device(DeviceKind::Camera, device_id).await
    }

    pub async fn switch_microphone(&self, device_id: &str) -> Result<()> {
        self.switch_device(DeviceKind::Microphone, device_id).await
    }

    /// Output routing is the presentation layer's job; only the selection is kept.
    pub async fn select_speaker(&self, device_id: &str) -> Result<()> {
        self.inner.require_device(DeviceKind::Speaker, device_id).await?;
        self.inner.status.send_modify(|status| {
            status.selected_speaker = Some(device_id.to_string());
        });
        Ok(())
    }

    async fn switch_device(&self, kind: DeviceKind, device_id: &str) -> Result<()> {
        let inner = &self.inner;
        inner.require_device(kind, device_id).await?;

        let (track_kind, constraints) = match kind {
            DeviceKind::Camera => (
                TrackKind::Video,
                MediaConstraints {
                    audio: None,
                    video: Some(inner.video_constraints(&StreamOptions::default(), Some(device_id.to_string()))),
                },
            ),
            _ => (
                TrackKind::Audio,
                MediaConstraints {
                    audio: Some(audio_constraints(Some(device_id.to_string()))),
                    video: None,
                },
            ),
        };

        let current = inner.camera.lock().clone();
        if let Some(current) = current {
            let fresh = inner.devices.get_user_media(&constraints).await?;
            let Some(track) = fresh.track(track_kind).cloned() else {
                return Err(SessionError::DeviceUnavailable(format!(
                    "{} produced no track",
                    device_id
                )));
            };
            if let Some(old) = current.track(track_kind) {
                track.set_enabled(old.is_enabled());
                old.stop();
            }
            *inner.camera.lock() = Some(current.with_track(track));
            inner.publish_outgoing();
        }

        inner.status.send_modify(|status| match kind {
            DeviceKind::Camera => status.selected_camera = Some(device_id.to_string()),
            _ => status.selected_microphone = Some(device_id.to_string()),
        });
        info!(device_id, ?kind, "Switched capture device");
        Ok(())
    }

    /// Returns the new state
    pub fn toggle_audio(&self) -> bool {
        let enabled = !self.inner.status.borrow().is_audio_enabled;
        self.set_audio_enabled(enabled);
        enabled
    }

    pub fn toggle_video(&self) -> bool {
        let enabled = !self.inner.status.borrow().is_video_enabled;
        self.set_video_enabled(enabled);
        enabled
    }

    pub fn set_audio_enabled(&self, enabled: bool) {
        if let Some(stream) = self.inner.camera.lock().as_ref() {
            for track in stream.audio_tracks() {
                track.set_enabled(enabled);
            }
        }
        self.inner
            .status
            .send_modify(|status| status.is_audio_enabled = enabled);
    }

    pub fn set_video_enabled(&self, enabled: bool) {
        if let Some(stream) = self.inner.camera.lock().as_ref() {
            for track in stream.video_tracks() {
                track.set_enabled(enabled);
            }
        }
        self.inner
            .status
            .send_modify(|status| status.is_video_enabled = enabled);
    }

    /// Start sharing the screen. Already sharing returns the current share.
    ///
    /// Concurrent calls share one capture.
    pub async fn start_screen_share(&self) -> Result<MediaStream> {
        if let Some(stream) = self.inner.screen.lock().clone() {
            return Ok(stream);
        }
        let attempt = {
            let mut pending = self.inner.screen_pending.lock();
            if let Some(stream) = self.inner.screen.lock().clone() {
                return Ok(stream);
            }
            match pending.as_ref() {
                Some(attempt) => {
                    debug!("Joining in-flight screen capture");
                    attempt.clone()
                }
                None => {
                    let inner = Arc::clone(&self.inner);
                    let attempt = async move { inner.capture_screen().await }.boxed().shared();
                    *pending = Some(attempt.clone());
                    attempt
                }
            }
        };
        attempt.await
    }

    /// Idempotent. Also abandons a capture still being started.
    pub fn stop_screen_share(&self) {
        self.inner.screen_epoch.fetch_add(1, Ordering::SeqCst);
        self.inner.screen_pending.lock().take();
        if let Some(watcher) = self.inner.screen_watch.lock().take() {
            watcher.abort();
        }
        let stream_id = self.inner.screen.lock().as_ref().map(|s| s.id().to_string());
        if let Some(stream_id) = stream_id {
            self.inner.finish_screen_share(&stream_id);
        }
    }

    pub fn status(&self) -> MediaStatus {
        self.inner.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<MediaStatus> {
        self.inner.status.subscribe()
    }

    /// The camera/microphone stream, if acquired
    pub fn local_stream(&self) -> Option<MediaStream> {
        self.inner.camera.lock().clone()
    }

    pub fn screen_stream(&self) -> Option<MediaStream> {
        self.inner.screen.lock().clone()
    }

    /// What peers should be sending right now
    pub fn outgoing_stream(&self) -> Option<MediaStream> {
        self.inner.outgoing.borrow().clone()
    }

    pub fn watch_outgoing(&self) -> watch::Receiver<Option<MediaStream>> {
        self.inner.outgoing.subscribe()
    }
}

impl MediaInner {
    async fn acquire(self: Arc<Self>, options: StreamOptions) -> Result<MediaStream> {
        let epoch = self.epoch.load(Ordering::SeqCst);
        self.status.send_modify(|status| {
            status.is_starting = true;
            status.last_error = None;
        });

        let result = self.open_camera_stream(&options).await;
        let current = {
            let mut pending = self.pending.lock();
            let current = self.epoch.load(Ordering::SeqCst) == epoch;
            if current {
                if let Ok(stream) = &result {
                    *self.camera.lock() = Some(stream.clone());
                }
                pending.take();
            }
            current
        };

        if !current {
            if let Ok(stream) = &result {
                stream.stop_all();
            }
            return Err(SessionError::Media("acquisition cancelled by cleanup".into()));
        }

        match result {
            Ok(stream) => {
                let audio = stream.track(TrackKind::Audio).cloned();
                let video = stream.track(TrackKind::Video).cloned();
                self.status.send_modify(|status| {
                    status.is_starting = false;
                    status.is_initialized = true;
                    status.is_audio_enabled = audio.is_some();
                    status.is_video_enabled = video.is_some();
                    if let Some(id) = audio.as_ref().and_then(|t| t.device_id()) {
                        status.selected_microphone = Some(id.to_string());
                    }
                    if let Some(id) = video.as_ref().and_then(|t| t.device_id()) {
                        status.selected_camera = Some(id.to_string());
                    }
                });
                self.publish_outgoing();
                info!(
                    audio = audio.is_some(),
                    video = video.is_some(),
                    "Local media stream ready"
                );
                Ok(stream)
            }
            Err(e) => {
                warn!(error = %e, "Local media acquisition failed");
                self.status.send_modify(|status| {
                    status.is_starting = false;
                    status.last_error = Some(e.to_string());
                });
                Err(e)
            }
        }
    }

    async fn capture_screen(self: Arc<Self>) -> Result<MediaStream> {
        let epoch = self.screen_epoch.load(Ordering::SeqCst);
        let result = self.devices.get_display_media().await.and_then(|stream| {
            let video = stream.track(TrackKind::Video).cloned();
            match video {
                Some(track) => Ok((stream, track)),
                None => {
                    stream.stop_all();
                    Err(SessionError::Media("screen capture produced no video".into()))
                }
            }
        });

        // Installed under `screen_pending` so a concurrent stop or cleanup
        // either voids this capture or sees it fully in place.
        let current = {
            let mut pending = self.screen_pending.lock();
            let current = self.screen_epoch.load(Ordering::SeqCst) == epoch;
            if current {
                pending.take();
                if let Ok((stream, track)) = &result {
                    *self.screen.lock() = Some(stream.clone());
                    let watcher = tokio::spawn(watch_screen_track(
                        Arc::downgrade(&self),
                        Arc::clone(track),
                        stream.id().to_string(),
                    ));
                    if let Some(previous) = self.screen_watch.lock().replace(watcher) {
                        previous.abort();
                    }
                    self.status
                        .send_modify(|status| status.is_screen_sharing = true);
                }
            }
            current
        };
        if !current {
            if let Ok((stream, _)) = &result {
                stream.stop_all();
            }
            return Err(SessionError::Media("screen capture cancelled".into()));
        }

        match result {
            Ok((stream, _)) => {
                self.publish_outgoing();
                info!("Screen share started");
                Ok(stream)
            }
            Err(e) => {
                warn!(error = %e, "Screen capture failed");
                self.status
                    .send_modify(|status| status.last_error = Some(e.to_string()));
                Err(e)
            }
        }
    }

    async fn open_camera_stream(&self, options: &StreamOptions) -> Result<MediaStream> {
        let catalog = DeviceCatalog::from_devices(self.devices.enumerate_devices().await?);
        let (selected_camera, selected_microphone) = {
            let status = self.status.borrow();
            (status.selected_camera.clone(), status.selected_microphone.clone())
        };

        let mut constraints = MediaConstraints::default();
        if options.audio {
            if catalog.microphones.is_empty() {
                debug!("No microphones enumerated, omitting audio");
            } else {
                let device = options.microphone_id.clone().or(selected_microphone);
                constraints.audio = Some(audio_constraints(device));
            }
        }
        if options.video {
            if catalog.cameras.is_empty() {
                debug!("No cameras enumerated, omitting video");
            } else {
                let device = options.camera_id.clone().or(selected_camera);
                constraints.video = Some(self.video_constraints(options, device));
            }
        }
        if constraints.audio.is_none() && constraints.video.is_none() {
            return Err(SessionError::DeviceUnavailable(
                "no camera or microphone available".into(),
            ));
        }

        self.devices.get_user_media(&constraints).await
    }

    fn video_constraints(&self, options: &StreamOptions, device_id: Option<String>) -> VideoConstraints {
        VideoConstraints {
            device_id,
            width: options.width.unwrap_or(self.defaults.width),
            height: options.height.unwrap_or(self.defaults.height),
            frame_rate: options.frame_rate.unwrap_or(self.defaults.frame_rate),
        }
    }

    async fn require_device(&self, kind: DeviceKind, device_id: &str) -> Result<()> {
        let catalog = DeviceCatalog::from_devices(self.devices.enumerate_devices().await?);
        if catalog.contains(kind, device_id) {
            Ok(())
        } else {
            Err(SessionError::DeviceUnavailable(format!(
                "device {} is not present",
                device_id
            )))
        }
    }

    fn finish_screen_share(&self, stream_id: &str) {
        let stream = {
            let mut screen = self.screen.lock();
            match screen.as_ref() {
                Some(current) if current.id() == stream_id => screen.take(),
                _ => None,
            }
        };
        let Some(stream) = stream else {
            return;
        };
        stream.stop_all();
        self.status
            .send_modify(|status| status.is_screen_sharing = false);
        self.publish_outgoing();
        info!("Screen share ended");
    }

    /// Camera audio plus either the screen or the camera video
    fn publish_outgoing(&self) {
        let camera = self.camera.lock().clone();
        let screen = self.screen.lock().clone();

        let mut tracks: Vec<Arc<MediaTrack>> = Vec::new();
        if let Some(audio) = camera.as_ref().and_then(|s| s.track(TrackKind::Audio)) {
            tracks.push(Arc::clone(audio));
        }
        let video = screen
            .as_ref()
            .and_then(|s| s.track(TrackKind::Video))
            .or_else(|| camera.as_ref().and_then(|s| s.track(TrackKind::Video)));
        if let Some(video) = video {
            tracks.push(Arc::clone(video));
        }

        let next = if tracks.is_empty() {
            None
        } else {
            Some(MediaStream::new(tracks))
        };
        self.outgoing.send_replace(next);
    }
}

fn audio_constraints(device_id: Option<String>) -> AudioConstraints {
    AudioConstraints {
        device_id,
        echo_cancellation: true,
        noise_suppression: true,
    }
}

/// Ends the share when the track ends for any reason
async fn watch_screen_track(inner: Weak<MediaInner>, track: Arc<MediaTrack>, stream_id: String) {
    track.ended().await;
    debug!(track_id = track.id(), "Screen track ended");
    if let Some(inner) = inner.upgrade() {
        inner.screen_watch.lock().take();
        inner.finish_screen_share(&stream_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{DeviceInfo, TrackSource, VirtualDevices};
    use crate::testing::settle;
    use std::time::Duration;

    fn manager(devices: &Arc<VirtualDevices>) -> MediaManager {
        MediaManager::new(
            Arc::clone(devices) as Arc<dyn MediaDevices>,
            MediaDefaults::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_stream_single_acquisition() {
        let devices = Arc::new(VirtualDevices::standard());
        devices.set_acquire_delay(Some(Duration::from_millis(200)));
        let media = manager(&devices);

        let (a, b) = tokio::join!(
            media.initialize_stream(StreamOptions::default()),
            media.initialize_stream(StreamOptions::default())
        );
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id(), b.id());
        assert_eq!(devices.acquisitions(), 1);

        let c = media.initialize_stream(StreamOptions::default()).await.unwrap();
        assert_eq!(c.id(), a.id());
        assert_eq!(devices.acquisitions(), 1);
        assert!(media.status().is_initialized);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_parallel_callers_share_one_acquisition() {
        for _ in 0..50 {
            let devices = Arc::new(VirtualDevices::standard());
            let media = manager(&devices);
            let callers: Vec<_> = (0..8)
                .map(|_| {
                    let media = media.clone();
                    tokio::spawn(async move { media.initialize_stream(StreamOptions::default()).await })
                })
                .collect();

            let mut ids = std::collections::HashSet::new();
            for caller in callers {
                ids.insert(caller.await.unwrap().unwrap().id().to_string());
            }
            assert_eq!(ids.len(), 1);
            assert_eq!(devices.acquisitions(), 1);
        }
    }

    #[tokio::test]
    async fn test_zero_cameras_gives_audio_only() {
        let devices = Arc::new(
            VirtualDevices::new()
                .with_device(DeviceInfo::new("mic-1", "Mic", DeviceKind::Microphone)),
        );
        let media = manager(&devices);
        let stream = media.initialize_stream(StreamOptions::default()).await.unwrap();
        assert_eq!(stream.tracks().len(), 1);
        assert_eq!(stream.tracks()[0].kind(), TrackKind::Audio);
        let status = media.status();
        assert!(status.is_audio_enabled);
        assert!(!status.is_video_enabled);
    }

    #[tokio::test]
    async fn test_no_devices_at_all() {
        let devices = Arc::new(VirtualDevices::new());
        let media = manager(&devices);
        let err = media
            .initialize_stream(StreamOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DeviceUnavailable(_)));
        assert_eq!(devices.acquisitions(), 0);
    }

    #[tokio::test]
    async fn test_permission_denied_is_distinct() {
        let devices = Arc::new(VirtualDevices::standard());
        devices.deny_permissions(true);
        let media = manager(&devices);
        let err = media
            .initialize_stream(StreamOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::MediaPermission(_)));
        let status = media.status();
        assert!(!status.is_starting);
        assert!(status.last_error.unwrap().contains("MediaPermissionError"));

        // recoverable: allow and try again
        devices.deny_permissions(false);
        assert!(media.initialize_stream(StreamOptions::default()).await.is_ok());
    }

    #[tokio::test]
    async fn test_cleanup_stops_tracks_and_is_repeatable() {
        let devices = Arc::new(VirtualDevices::standard());
        let media = manager(&devices);
        media.cleanup();

        media.initialize_stream(StreamOptions::default()).await.unwrap();
        media.start_screen_share().await.unwrap();
        media.cleanup();
        media.cleanup();

        assert!(devices.issued_tracks().iter().all(|t| !t.is_live()));
        let status = media.status();
        assert!(!status.is_initialized);
        assert!(!status.is_screen_sharing);
        assert!(media.outgoing_stream().is_none());
    }

    #[tokio::test]
    async fn test_screen_track_ended_resets_sharing() {
        let devices = Arc::new(VirtualDevices::standard());
        let media = manager(&devices);
        media.initialize_stream(StreamOptions::default()).await.unwrap();
        let share = media.start_screen_share().await.unwrap();
        assert!(media.status().is_screen_sharing);
        let outgoing = media.outgoing_stream().unwrap();
        assert_eq!(
            outgoing.track(TrackKind::Video).unwrap().source(),
            TrackSource::Screen
        );

        // the OS "stop sharing" button
        share.tracks()[0].stop();
        settle().await;

        assert!(!media.status().is_screen_sharing);
        assert!(media.screen_stream().is_none());
        let outgoing = media.outgoing_stream().unwrap();
        assert_eq!(
            outgoing.track(TrackKind::Video).unwrap().source(),
            TrackSource::Camera
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_screen_share_captures_once() {
        let devices = Arc::new(VirtualDevices::standard());
        devices.set_acquire_delay(Some(Duration::from_millis(200)));
        let media = manager(&devices);

        let (a, b) = tokio::join!(media.start_screen_share(), media.start_screen_share());
        let (a, b) = (a.unwrap(), b.unwrap());
        assert_eq!(a.id(), b.id());
        assert_eq!(devices.display_acquisitions(), 1);
        assert!(media.status().is_screen_sharing);

        media.cleanup();
        assert!(devices.issued_tracks().iter().all(|t| !t.is_live()));
        assert!(!media.status().is_screen_sharing);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_while_screen_capture_starting() {
        let devices = Arc::new(VirtualDevices::standard());
        devices.set_acquire_delay(Some(Duration::from_millis(200)));
        let media = manager(&devices);

        let starting = tokio::spawn({
            let media = media.clone();
            async move { media.start_screen_share().await }
        });
        settle().await;
        media.stop_screen_share();

        assert!(starting.await.unwrap().is_err());
        assert!(media.screen_stream().is_none());
        assert!(!media.status().is_screen_sharing);
        assert!(devices.issued_tracks().iter().all(|t| !t.is_live()));
    }

    #[tokio::test]
    async fn test_switch_camera_replaces_video_track() {
        let devices = Arc::new(
            VirtualDevices::standard()
                .with_device(DeviceInfo::new("cam-2", "Second Camera", DeviceKind::Camera)),
        );
        let media = manager(&devices);
        let before = media.initialize_stream(StreamOptions::default()).await.unwrap();
        let old_video = before.track(TrackKind::Video).unwrap().clone();
        let mut outgoing = media.watch_outgoing();
        outgoing.borrow_and_update();

        media.switch_camera("cam-2").await.unwrap();
        let after = media.local_stream().unwrap();
        assert_eq!(after.id(), before.id());
        assert_eq!(after.track(TrackKind::Video).unwrap().device_id(), Some("cam-2"));
        assert!(!old_video.is_live());
        assert!(outgoing.has_changed().unwrap());
        assert_eq!(media.status().selected_camera.as_deref(), Some("cam-2"));

        let err = media.switch_camera("cam-404").await.unwrap_err();
        assert!(matches!(err, SessionError::DeviceUnavailable(_)));
    }

    #[tokio::test]
    async fn test_toggle_audio_mutes_track() {
        let devices = Arc::new(VirtualDevices::standard());
        let media = manager(&devices);
        let stream = media.initialize_stream(StreamOptions::default()).await.unwrap();
        assert!(!media.toggle_audio());
        assert!(!stream.track(TrackKind::Audio).unwrap().is_enabled());
        assert!(media.toggle_audio());
        assert!(stream.track(TrackKind::Audio).unwrap().is_enabled());
        assert!(!media.toggle_video());
        assert!(!stream.track(TrackKind::Video).unwrap().is_enabled());
    }
}
