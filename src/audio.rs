//! Sound-card backend (cpal)
//!
//! Microphones and speakers only; no cameras are enumerated, so callers asking
//! for video get an audio-only stream. Each microphone track owns a capture
//! thread that keeps the cpal stream open until the track ends.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{BuildStreamError, FromSample, Sample, SampleFormat, SizedSample};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::devices::{
    DeviceInfo, DeviceKind, MediaConstraints, MediaDevices, MediaStream, MediaTrack, TrackSource,
};
use crate::error::{Result, SessionError};

#[derive(Default)]
pub struct CpalDevices {
    levels: Mutex<HashMap<String, Arc<AtomicU32>>>,
}

impl CpalDevices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Peak input level (0.0..=1.0) of the last captured buffer
    pub fn input_level(&self, track_id: &str) -> Option<f32> {
        self.levels
            .lock()
            .get(track_id)
            .map(|level| f32::from_bits(level.load(Ordering::Relaxed)))
    }

    async fn capture(&self, device_name: Option<String>) -> Result<Arc<MediaTrack>> {
        let (ready, wait) = oneshot::channel();
        let level = Arc::new(AtomicU32::new(0));
        let meter = Arc::clone(&level);

        std::thread::Builder::new()
            .name("audio-capture".to_string())
            .spawn(move || {
                let opened = input_device(device_name.as_deref())
                    .and_then(|(device, name)| Ok((open_input(&device, meter)?, name)));
                let (stream, name) = match opened {
                    Ok(opened) => opened,
                    Err(e) => {
                        let _ = ready.send(Err(e));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready.send(Err(SessionError::Media(format!("starting capture: {}", e))));
                    return;
                }

                let track = MediaTrack::new(TrackSource::Microphone, name.clone(), Some(name));
                if ready.send(Ok(Arc::clone(&track))).is_err() {
                    return;
                }
                futures::executor::block_on(track.ended());
                drop(stream);
                debug!(track_id = track.id(), "Audio capture stopped");
            })
            .map_err(|e| SessionError::Media(format!("spawning capture thread: {}", e)))?;

        let track = wait
            .await
            .unwrap_or_else(|_| Err(SessionError::Media("capture thread exited".to_string())))?;
        self.levels.lock().insert(track.id().to_string(), level);
        info!(device = track.label(), "Microphone capture started");
        Ok(track)
    }
}

fn input_device(name: Option<&str>) -> Result<(cpal::Device, String)> {
    let host = cpal::default_host();
    let device = match name {
        Some(wanted) => host
            .input_devices()
            .map_err(|e| SessionError::Media(format!("listing inputs: {}", e)))?
            .find(|d| d.name().map(|n| n == wanted).unwrap_or(false)),
        None => host.default_input_device(),
    };
    let device = device.ok_or_else(|| {
        SessionError::DeviceUnavailable(match name {
            Some(wanted) => format!("device {} is not present", wanted),
            None => "no input device available".to_string(),
        })
    })?;
    let name = device
        .name()
        .map_err(|e| SessionError::Media(format!("reading device name: {}", e)))?;
    Ok((device, name))
}

fn open_input(device: &cpal::Device, level: Arc<AtomicU32>) -> Result<cpal::Stream> {
    let config = device
        .default_input_config()
        .map_err(|e| SessionError::Media(format!("input config: {}", e)))?;
    debug!(?config, "Input config");

    let stream = match config.sample_format() {
        SampleFormat::F32 => build_input_stream::<f32>(device, &config.into(), level),
        SampleFormat::I16 => build_input_stream::<i16>(device, &config.into(), level),
        SampleFormat::U16 => build_input_stream::<u16>(device, &config.into(), level),
        sample_format => {
            return Err(SessionError::Media(format!(
                "unsupported sample format: {:?}",
                sample_format
            )))
        }
    };
    stream.map_err(stream_error)
}

fn build_input_stream<T>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    level: Arc<AtomicU32>,
) -> std::result::Result<cpal::Stream, BuildStreamError>
where
    T: SizedSample + Send + 'static,
    f32: FromSample<T>,
{
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            let peak = data
                .iter()
                .map(|sample| sample.to_sample::<f32>().abs())
                .fold(0.0f32, f32::max);
            level.store(peak.to_bits(), Ordering::Relaxed);
        },
        |err| warn!(error = %err, "Input audio stream error"),
        None,
    )
}

fn stream_error(e: BuildStreamError) -> SessionError {
    match e {
        BuildStreamError::DeviceNotAvailable => {
            SessionError::DeviceUnavailable("input device disappeared".to_string())
        }
        other => SessionError::Media(format!("opening input stream: {}", other)),
    }
}

fn list(kind: DeviceKind) -> Result<Vec<DeviceInfo>> {
    let host = cpal::default_host();
    let devices = match kind {
        DeviceKind::Microphone => host.input_devices(),
        DeviceKind::Speaker => host.output_devices(),
        DeviceKind::Camera => return Ok(Vec::new()),
    }
    .map_err(|e| SessionError::Media(format!("enumerating devices: {}", e)))?;

    Ok(devices
        .filter_map(|device| device.name().ok())
        .map(|name| DeviceInfo::new(name.clone(), name, kind))
        .collect())
}

#[async_trait]
impl MediaDevices for CpalDevices {
    async fn enumerate_devices(&self) -> Result<Vec<DeviceInfo>> {
        tokio::task::spawn_blocking(|| {
            let mut devices = list(DeviceKind::Microphone)?;
            devices.extend(list(DeviceKind::Speaker)?);
            Ok(devices)
        })
        .await
        .map_err(|e| SessionError::Media(format!("device enumeration task: {}", e)))?
    }

    async fn request_permissions(&self) -> Result<bool> {
        // no permission API in cpal; report whether a default input exists
        let available = tokio::task::spawn_blocking(|| cpal::default_host().default_input_device().is_some())
            .await
            .unwrap_or(false);
        Ok(available)
    }

    async fn get_user_media(&self, constraints: &MediaConstraints) -> Result<MediaStream> {
        if constraints.video.is_some() {
            return Err(SessionError::DeviceUnavailable(
                "no camera backend available".to_string(),
            ));
        }
        let mut tracks = Vec::new();
        if let Some(audio) = &constraints.audio {
            tracks.push(self.capture(audio.device_id.clone()).await?);
        }
        Ok(MediaStream::new(tracks))
    }

    async fn get_display_media(&self) -> Result<MediaStream> {
        Err(SessionError::DeviceUnavailable(
            "screen capture is not supported by the audio backend".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stream_error_mapping() {
        assert!(matches!(
            stream_error(BuildStreamError::DeviceNotAvailable),
            SessionError::DeviceUnavailable(_)
        ));
        assert!(matches!(
            stream_error(BuildStreamError::InvalidArgument),
            SessionError::Media(_)
        ));
    }

    #[tokio::test]
    async fn test_video_is_refused() {
        let devices = CpalDevices::new();
        let err = devices
            .get_user_media(&MediaConstraints {
                audio: None,
                video: Some(Default::default()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DeviceUnavailable(_)));
        assert!(devices.get_display_media().await.is_err());
    }
}
