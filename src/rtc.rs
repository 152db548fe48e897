//! `webrtc`-crate peer transport

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::rtp_transceiver_direction::RTCRtpTransceiverDirection;
use webrtc::rtp_transceiver::{RTCRtpTransceiver, RTCRtpTransceiverInit};
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::PeerConfig;
use crate::devices::{MediaStream, TrackKind};
use crate::error::{Result, SessionError};
use crate::peer::{
    IceCandidate, PeerConnector, PeerTransport, SdpKind, TrackUpdate, TransportEvent,
    TransportEvents,
};

const TRACK_KINDS: [TrackKind; 2] = [TrackKind::Audio, TrackKind::Video];

/// Creates real peer connections
pub struct RtcPeerConnector {
    api: API,
    config: PeerConfig,
}

impl RtcPeerConnector {
    pub fn new(config: PeerConfig) -> Result<Self> {
        Ok(Self {
            api: build_api().map_err(|e| SessionError::peer("", format!("{:#}", e)))?,
            config,
        })
    }
}

fn build_api() -> anyhow::Result<API> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .context("registering default codecs")?;
    let registry = register_default_interceptors(Registry::new(), &mut media_engine)
        .context("registering interceptors")?;
    Ok(APIBuilder::new()
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

#[async_trait]
impl PeerConnector for RtcPeerConnector {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>> {
        let participant_id = events.participant_id().to_string();
        let transport = RtcPeerTransport::open(&self.api, &self.config, events)
            .await
            .map_err(|e| SessionError::peer(&participant_id, format!("{:#}", e)))?;
        Ok(Arc::new(transport))
    }
}

/// One `RTCPeerConnection` with an audio and a video sender
pub struct RtcPeerTransport {
    participant_id: String,
    peer_connection: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<TrackKind, Arc<RTCRtpSender>>>,
}

impl RtcPeerTransport {
    async fn open(api: &API, config: &PeerConfig, events: TransportEvents) -> anyhow::Result<Self> {
        let rtc_config = RTCConfiguration {
            ice_servers: vec![RTCIceServer {
                urls: config.ice_servers.clone(),
                ..Default::default()
            }],
            ..Default::default()
        };
        let peer_connection = Arc::new(
            api.new_peer_connection(rtc_config)
                .await
                .context("creating peer connection")?,
        );

        let candidate_events = events.clone();
        peer_connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let events = candidate_events.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    debug!(participant_id = events.participant_id(), "ICE gathering complete");
                    return;
                };
                match candidate.to_json() {
                    Ok(init) => events.emit(TransportEvent::LocalCandidate(IceCandidate {
                        candidate: init.candidate,
                        sdp_mid: init.sdp_mid,
                        sdp_mline_index: init.sdp_mline_index,
                    })),
                    Err(e) => debug!(error = %e, "Could not serialize local candidate"),
                }
            })
        }));

        let state_events = events.clone();
        peer_connection.on_peer_connection_state_change(Box::new(
            move |state: RTCPeerConnectionState| {
                let events = state_events.clone();
                Box::pin(async move {
                    debug!(participant_id = events.participant_id(), %state, "Peer connection state");
                    match state {
                        RTCPeerConnectionState::Connected => events.emit(TransportEvent::Connected),
                        RTCPeerConnectionState::Failed => events.emit(TransportEvent::Failed(
                            "peer connection failed".to_string(),
                        )),
                        RTCPeerConnectionState::Closed => events.emit(TransportEvent::Closed),
                        _ => {}
                    }
                })
            },
        ));

        let track_events = events.clone();
        peer_connection.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = track_events.clone();
                Box::pin(async move {
                    let kind = match track.kind() {
                        RTPCodecType::Audio => TrackKind::Audio,
                        RTPCodecType::Video => TrackKind::Video,
                        _ => return,
                    };
                    info!(participant_id = events.participant_id(), ?kind, "Remote track");
                    events.emit(TransportEvent::RemoteTrack(kind));
                })
            },
        ));

        let mut senders = HashMap::new();
        for kind in TRACK_KINDS {
            let transceiver = peer_connection
                .add_transceiver_from_kind(
                    codec_type(kind),
                    Some(RTCRtpTransceiverInit {
                        direction: RTCRtpTransceiverDirection::Sendrecv,
                        send_encodings: vec![],
                    }),
                )
                .await
                .with_context(|| format!("adding {:?} transceiver", kind))?;
            senders.insert(kind, transceiver.sender().await);
        }

        Ok(Self {
            participant_id: events.participant_id().to_string(),
            peer_connection,
            senders: Mutex::new(senders),
        })
    }

    fn negotiation_error(&self, e: anyhow::Error) -> SessionError {
        SessionError::peer(&self.participant_id, format!("{:#}", e))
    }

    async fn describe_local(&self, kind: SdpKind) -> anyhow::Result<String> {
        let description = match kind {
            SdpKind::Offer => self.peer_connection.create_offer(None).await,
            SdpKind::Answer => self.peer_connection.create_answer(None).await,
        }
        .with_context(|| format!("creating {}", kind.as_str()))?;
        let sdp = description.sdp.clone();
        self.peer_connection
            .set_local_description(description)
            .await
            .context("applying local description")?;
        Ok(sdp)
    }

    async fn swap_tracks(&self, stream: Option<&MediaStream>) -> anyhow::Result<TrackUpdate> {
        let mut senders = self.senders.lock().await;
        let mut update = TrackUpdate::Replaced;

        for kind in TRACK_KINDS {
            let local = stream
                .and_then(|s| s.track(kind).map(|track| (s.id(), track)))
                .map(|(stream_id, track)| {
                    Arc::new(TrackLocalStaticSample::new(
                        RTCRtpCodecCapability {
                            mime_type: mime_type(kind).to_owned(),
                            ..Default::default()
                        },
                        track.id().to_owned(),
                        stream_id.to_owned(),
                    )) as Arc<dyn TrackLocal + Send + Sync>
                });

            let Some(sender) = senders.get(&kind).cloned() else {
                if let Some(local) = local {
                    let sender = self
                        .peer_connection
                        .add_track(local)
                        .await
                        .with_context(|| format!("adding {:?} track", kind))?;
                    senders.insert(kind, sender);
                    update = TrackUpdate::NeedsRenegotiation;
                }
                continue;
            };

            if let Err(e) = sender.replace_track(local.clone()).await {
                // the sender cannot take this track; a new sender needs negotiating
                debug!(participant_id = %self.participant_id, error = %e, ?kind, "replace_track refused");
                let Some(local) = local else {
                    continue;
                };
                self.peer_connection
                    .remove_track(&sender)
                    .await
                    .with_context(|| format!("removing {:?} sender", kind))?;
                let sender = self
                    .peer_connection
                    .add_track(local)
                    .await
                    .with_context(|| format!("re-adding {:?} track", kind))?;
                senders.insert(kind, sender);
                update = TrackUpdate::NeedsRenegotiation;
            }
        }
        Ok(update)
    }
}

#[async_trait]
impl PeerTransport for RtcPeerTransport {
    async fn create_offer(&self) -> Result<String> {
        self.describe_local(SdpKind::Offer)
            .await
            .map_err(|e| self.negotiation_error(e))
    }

    async fn create_answer(&self) -> Result<String> {
        self.describe_local(SdpKind::Answer)
            .await
            .map_err(|e| self.negotiation_error(e))
    }

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()> {
        let description = match kind {
            SdpKind::Offer => RTCSessionDescription::offer(sdp.to_owned()),
            SdpKind::Answer => RTCSessionDescription::answer(sdp.to_owned()),
        }
        .map_err(|e| SessionError::peer(&self.participant_id, e))?;
        self.peer_connection
            .set_remote_description(description)
            .await
            .map_err(|e| SessionError::peer(&self.participant_id, e))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer_connection
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mid: candidate.sdp_mid,
                sdp_mline_index: candidate.sdp_mline_index,
                username_fragment: None,
            })
            .await
            .map_err(|e| SessionError::peer(&self.participant_id, e))
    }

    async fn set_local_tracks(&self, stream: Option<&MediaStream>) -> Result<TrackUpdate> {
        self.swap_tracks(stream)
            .await
            .map_err(|e| self.negotiation_error(e))
    }

    async fn close(&self) -> Result<()> {
        self.peer_connection
            .close()
            .await
            .map_err(|e| SessionError::peer(&self.participant_id, e))
    }
}

fn codec_type(kind: TrackKind) -> RTPCodecType {
    match kind {
        TrackKind::Audio => RTPCodecType::Audio,
        TrackKind::Video => RTPCodecType::Video,
    }
}

fn mime_type(kind: TrackKind) -> &'static str {
    match kind {
        TrackKind::Audio => MIME_TYPE_OPUS,
        TrackKind::Video => MIME_TYPE_VP8,
    }
}
