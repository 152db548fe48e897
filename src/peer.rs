//! Peer connection orchestration
//!
//! One [`PeerLink`] per remote participant. A single worker task owns every link
//! and serializes the three inputs that drive them: negotiation messages from
//! signaling, local track changes from the media manager, and roster snapshots.
//! The worker never sees the session store itself, only a [`RosterSnapshot`]
//! projected from it.

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::devices::{MediaStream, TrackKind};
use crate::error::{Result, SessionError};
use crate::protocol::{
    CandidatePayload, ClientInfo, InboundMessage, OutboundMessage, RenegotiatePayload, SdpPayload,
};
use crate::signaling::SignalingClient;

/// Candidates kept per participant while no usable link exists
const MAX_STRAY_CANDIDATES: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum NegotiationState {
    New,
    Negotiating,
    Connected,
    Failed,
    Closed,
}

impl NegotiationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, NegotiationState::Failed | NegotiationState::Closed)
    }
}

impl fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NegotiationState::New => "new",
            NegotiationState::Negotiating => "negotiating",
            NegotiationState::Connected => "connected",
            NegotiationState::Failed => "failed",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SdpKind {
    Offer,
    Answer,
}

impl SdpKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            SdpKind::Offer => "offer",
            SdpKind::Answer => "answer",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    pub sdp_mline_index: Option<u16>,
}

/// Outcome of pushing local tracks into a transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackUpdate {
    /// Swapped on the existing senders, no negotiation needed
    Replaced,
    NeedsRenegotiation,
}

/// Events a transport reports back about itself
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    LocalCandidate(IceCandidate),
    Connected,
    Failed(String),
    Closed,
    RemoteTrack(TrackKind),
}

/// Event sink handed to each transport, tagged with its participant.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    participant_id: String,
    tx: mpsc::UnboundedSender<(String, TransportEvent)>,
}

impl TransportEvents {
    pub fn new(
        participant_id: impl Into<String>,
        tx: mpsc::UnboundedSender<(String, TransportEvent)>,
    ) -> Self {
        Self {
            participant_id: participant_id.into(),
            tx,
        }
    }

    pub fn participant_id(&self) -> &str {
        &self.participant_id
    }

    pub fn emit(&self, event: TransportEvent) {
        let _ = self.tx.send((self.participant_id.clone(), event));
    }
}

/// One peer media connection
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<String>;

    /// Only valid once a remote offer has been applied.
    async fn create_answer(&self) -> Result<String>;

    async fn set_remote_description(&self, kind: SdpKind, sdp: &str) -> Result<()>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Point the outgoing senders at `stream`'s tracks, or silence them with `None`.
    async fn set_local_tracks(&self, stream: Option<&MediaStream>) -> Result<TrackUpdate>;

    async fn close(&self) -> Result<()>;
}

/// Creates peer transports
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(&self, events: TransportEvents) -> Result<Arc<dyn PeerTransport>>;
}

/// Where negotiation messages go out
pub trait SignalSink: Send + Sync {
    fn send(&self, message: &OutboundMessage) -> Result<()>;
}

impl SignalSink for SignalingClient {
    fn send(&self, message: &OutboundMessage) -> Result<()> {
        SignalingClient::send(self, message)
    }
}

/// What the orchestrator needs to know about the room
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RosterSnapshot {
    /// Local identity, once the server has assigned a client id
    pub local: Option<ClientInfo>,
    /// Whether the local user is admitted; links only exist while active
    pub active: bool,
    pub remote_ids: BTreeSet<String>,
}

/// Read-only view of one link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerLinkInfo {
    pub participant_id: String,
    pub state: NegotiationState,
    pub initiator: bool,
    pub local_tracks_attached: bool,
    pub remote_tracks_attached: bool,
    pub queued_candidates: usize,
}

#[derive(Debug, Clone)]
pub enum PeerEvent {
    StateChanged {
        participant_id: String,
        state: NegotiationState,
    },
    RemoteTrack {
        participant_id: String,
        kind: TrackKind,
    },
    Failed {
        participant_id: String,
        error: SessionError,
    },
}

enum PeerCommand {
    Signal(InboundMessage),
    LocalStream(Option<MediaStream>),
    BindSignaling(Option<Arc<dyn SignalSink>>),
    CloseAll(oneshot::Sender<()>),
}

struct PeerLink {
    transport: Arc<dyn PeerTransport>,
    info: PeerLinkInfo,
    remote_described: bool,
    awaiting_answer: bool,
    queued: Vec<IceCandidate>,
}

/// Handle to the orchestrator worker
pub struct PeerOrchestrator {
    commands: mpsc::UnboundedSender<PeerCommand>,
    links: watch::Receiver<HashMap<String, PeerLinkInfo>>,
    events: broadcast::Sender<PeerEvent>,
    task: JoinHandle<()>,
}

impl PeerOrchestrator {
    pub fn spawn(connector: Arc<dyn PeerConnector>, roster: watch::Receiver<RosterSnapshot>) -> Self {
        let (commands, command_rx) = mpsc::unbounded_channel();
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (links_tx, links) = watch::channel(HashMap::new());
        let (events, _) = broadcast::channel(64);

        let worker = Worker {
            connector,
            signals: None,
            roster,
            links: HashMap::new(),
            known: BTreeSet::new(),
            stray: HashMap::new(),
            local_stream: None,
            transport_tx,
            snapshot: links_tx,
            events: events.clone(),
        };
        let task = tokio::spawn(worker.run(command_rx, transport_rx));

        Self {
            commands,
            links,
            events,
            task,
        }
    }

    pub fn bind_signaling(&self, sink: Option<Arc<dyn SignalSink>>) {
        let _ = self.commands.send(PeerCommand::BindSignaling(sink));
    }

    /// Route a negotiation message; anything other than offer/answer/candidate/renegotiate is ignored.
    pub fn handle_signal(&self, message: &InboundMessage) {
        if matches!(
            message,
            InboundMessage::Offer(_)
                | InboundMessage::Answer(_)
                | InboundMessage::Candidate(_)
                | InboundMessage::Renegotiate(_)
        ) {
            let _ = self.commands.send(PeerCommand::Signal(message.clone()));
        }
    }

    pub fn attach_local_stream(&self, stream: MediaStream) {
        let _ = self.commands.send(PeerCommand::LocalStream(Some(stream)));
    }

    pub fn detach_local_stream(&self) {
        let _ = self.commands.send(PeerCommand::LocalStream(None));
    }

    /// Close every link and wait until they are gone.
    pub async fn close_all(&self) {
        let (done, wait) = oneshot::channel();
        if self.commands.send(PeerCommand::CloseAll(done)).is_ok() {
            let _ = wait.await;
        }
    }

    pub fn links(&self) -> HashMap<String, PeerLinkInfo> {
        self.links.borrow().clone()
    }

    pub fn link(&self, participant_id: &str) -> Option<PeerLinkInfo> {
        self.links.borrow().get(participant_id).cloned()
    }

    pub fn watch_links(&self) -> watch::Receiver<HashMap<String, PeerLinkInfo>> {
        self.links.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PeerEvent> {
        self.events.subscribe()
    }
}

impl Drop for PeerOrchestrator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

struct Worker {
    connector: Arc<dyn PeerConnector>,
    signals: Option<Arc<dyn SignalSink>>,
    roster: watch::Receiver<RosterSnapshot>,
    links: HashMap<String, PeerLink>,
    /// Remote ids seen in the last active roster
    known: BTreeSet<String>,
    /// Candidates that arrived before the offer that opens their link
    stray: HashMap<String, Vec<IceCandidate>>,
    local_stream: Option<MediaStream>,
    transport_tx: mpsc::UnboundedSender<(String, TransportEvent)>,
    snapshot: watch::Sender<HashMap<String, PeerLinkInfo>>,
    events: broadcast::Sender<PeerEvent>,
}

impl Worker {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<PeerCommand>,
        mut transport_events: mpsc::UnboundedReceiver<(String, TransportEvent)>,
    ) {
        let mut roster_open = true;
        self.reconcile().await;
        self.publish();
        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => break,
                },
                Some((participant_id, event)) = transport_events.recv() => {
                    self.handle_transport_event(participant_id, event).await;
                }
                changed = self.roster.changed(), if roster_open => match changed {
                    Ok(()) => self.reconcile().await,
                    Err(_) => roster_open = false,
                },
            }
            self.publish();
        }
        self.close_everything().await;
    }

    async fn handle_command(&mut self, command: PeerCommand) {
        match command {
            PeerCommand::Signal(message) => self.handle_signal(message).await,
            PeerCommand::LocalStream(stream) => self.apply_local_stream(stream).await,
            PeerCommand::BindSignaling(sink) => self.signals = sink,
            PeerCommand::CloseAll(done) => {
                self.close_everything().await;
                self.known.clear();
                let _ = done.send(());
            }
        }
    }

    fn local(&self) -> ClientInfo {
        self.roster.borrow().local.clone().unwrap_or_default()
    }

    fn addressed_to_us(&self, target: &str) -> bool {
        let local = self.local();
        target.is_empty() || local.client_id.is_empty() || local.client_id == target
    }

    fn initiates(&self, remote_id: &str) -> bool {
        let local = self.local();
        !local.client_id.is_empty() && local.client_id.as_str() < remote_id
    }

    fn signal(&self, message: OutboundMessage) -> Result<()> {
        match &self.signals {
            Some(sink) => sink.send(&message),
            None => Err(SessionError::NotConnected),
        }
    }

    async fn reconcile(&mut self) {
        let snapshot = self.roster.borrow_and_update().clone();
        let current = if snapshot.active {
            snapshot.remote_ids
        } else {
            BTreeSet::new()
        };

        let departed: Vec<String> = self.known.difference(&current).cloned().collect();
        for participant_id in departed {
            self.close_link(&participant_id).await;
        }
        if !snapshot.active {
            // links opened by remote offers are not in `known`
            let remaining: Vec<String> = self.links.keys().cloned().collect();
            for participant_id in remaining {
                self.close_link(&participant_id).await;
            }
        }

        for participant_id in &current {
            let usable = self
                .links
                .get(participant_id)
                .is_some_and(|link| !link.info.state.is_terminal());
            if !usable && self.initiates(participant_id) {
                if let Err(e) = self.initiate(participant_id).await {
                    self.fail(participant_id, e).await;
                }
            }
        }
        self.known = current;
    }

    async fn handle_signal(&mut self, message: InboundMessage) {
        let (participant_id, result) = match message {
            InboundMessage::Offer(payload) => {
                if !self.addressed_to_us(&payload.target_client_id) {
                    return;
                }
                let id = payload.client_id.clone();
                (id, self.on_offer(payload).await)
            }
            InboundMessage::Answer(payload) => {
                if !self.addressed_to_us(&payload.target_client_id) {
                    return;
                }
                let id = payload.client_id.clone();
                (id, self.on_answer(payload).await)
            }
            InboundMessage::Candidate(payload) => {
                if !self.addressed_to_us(&payload.target_client_id) {
                    return;
                }
                let id = payload.client_id.clone();
                (id, self.on_candidate(payload).await)
            }
            InboundMessage::Renegotiate(payload) => {
                if !self.addressed_to_us(&payload.target_client_id) {
                    return;
                }
                let id = payload.client_id.clone();
                (id, self.on_renegotiate(&payload.client_id).await)
            }
            _ => return,
        };
        if let Err(e) = result {
            self.fail(&participant_id, e).await;
        }
    }

    async fn on_offer(&mut self, payload: SdpPayload) -> Result<()> {
        let from = payload.client_id;
        if let Some(link) = self.links.get(&from) {
            if link.awaiting_answer && !link.info.state.is_terminal() {
                debug!(participant_id = %from, "Ignoring colliding offer while our own is outstanding");
                return Ok(());
            }
        }
        self.ensure_link(&from, false).await?;
        let Some(link) = self.links.get_mut(&from) else {
            return Ok(());
        };

        link.transport.set_remote_description(SdpKind::Offer, &payload.sdp).await?;
        link.remote_described = true;
        begin_negotiation(&mut link.info);
        flush_candidates(link).await?;
        let sdp = link.transport.create_answer().await?;

        let local = self.local();
        self.signal(OutboundMessage::Answer(SdpPayload {
            client_id: local.client_id,
            display_name: local.display_name,
            target_client_id: from.clone(),
            sdp,
            sdp_type: SdpKind::Answer.as_str().to_string(),
        }))?;
        debug!(participant_id = %from, "Answered offer");
        Ok(())
    }

    async fn on_answer(&mut self, payload: SdpPayload) -> Result<()> {
        let from = payload.client_id;
        let Some(link) = self.links.get_mut(&from) else {
            debug!(participant_id = %from, "Answer for unknown link");
            return Ok(());
        };
        if !link.awaiting_answer {
            debug!(participant_id = %from, "Stale answer ignored");
            return Ok(());
        }
        link.transport.set_remote_description(SdpKind::Answer, &payload.sdp).await?;
        link.remote_described = true;
        link.awaiting_answer = false;
        flush_candidates(link).await
    }

    async fn on_candidate(&mut self, payload: CandidatePayload) -> Result<()> {
        let from = payload.client_id;
        let candidate = IceCandidate {
            candidate: payload.candidate,
            sdp_mid: payload.sdp_mid,
            sdp_mline_index: payload.sdp_mline_index,
        };
        let link = match self.links.get_mut(&from) {
            Some(link) if !link.info.state.is_terminal() => link,
            _ => {
                let stray = self.stray.entry(from.clone()).or_default();
                if stray.len() < MAX_STRAY_CANDIDATES {
                    stray.push(candidate);
                }
                debug!(participant_id = %from, held = stray.len(), "Holding candidate until a link exists");
                return Ok(());
            }
        };
        if link.remote_described {
            link.transport.add_ice_candidate(candidate).await
        } else {
            link.queued.push(candidate);
            link.info.queued_candidates = link.queued.len();
            debug!(participant_id = %from, queued = link.queued.len(), "Queued early ICE candidate");
            Ok(())
        }
    }

    async fn on_renegotiate(&mut self, from: &str) -> Result<()> {
        match self.links.get(from) {
            Some(link) if link.info.initiator && !link.info.state.is_terminal() => {
                self.send_offer(from).await
            }
            _ => {
                debug!(participant_id = from, "Renegotiation request ignored");
                Ok(())
            }
        }
    }

    async fn ensure_link(&mut self, participant_id: &str, initiator: bool) -> Result<()> {
        if let Some(link) = self.links.get(participant_id) {
            if !link.info.state.is_terminal() {
                return Ok(());
            }
        }

        let events = TransportEvents::new(participant_id, self.transport_tx.clone());
        let transport = self.connector.create(events).await?;
        let mut local_tracks_attached = false;
        if let Some(stream) = &self.local_stream {
            transport.set_local_tracks(Some(stream)).await?;
            local_tracks_attached = true;
        }

        let queued = self.stray.remove(participant_id).unwrap_or_default();
        info!(participant_id, initiator, "Peer link created");
        self.links.insert(
            participant_id.to_string(),
            PeerLink {
                transport,
                info: PeerLinkInfo {
                    participant_id: participant_id.to_string(),
                    state: NegotiationState::New,
                    initiator,
                    local_tracks_attached,
                    remote_tracks_attached: false,
                    queued_candidates: queued.len(),
                },
                remote_described: false,
                awaiting_answer: false,
                queued,
            },
        );
        self.emit_state(participant_id, NegotiationState::New);
        Ok(())
    }

    async fn initiate(&mut self, participant_id: &str) -> Result<()> {
        self.ensure_link(participant_id, true).await?;
        self.send_offer(participant_id).await
    }

    async fn send_offer(&mut self, participant_id: &str) -> Result<()> {
        let Some(link) = self.links.get_mut(participant_id) else {
            return Ok(());
        };
        let sdp = link.transport.create_offer().await?;
        link.awaiting_answer = true;
        begin_negotiation(&mut link.info);

        let local = self.local();
        self.signal(OutboundMessage::Offer(SdpPayload {
            client_id: local.client_id,
            display_name: local.display_name,
            target_client_id: participant_id.to_string(),
            sdp,
            sdp_type: SdpKind::Offer.as_str().to_string(),
        }))?;
        debug!(participant_id, "Sent offer");
        Ok(())
    }

    async fn apply_local_stream(&mut self, stream: Option<MediaStream>) {
        self.local_stream = stream;
        let ids: Vec<String> = self
            .links
            .iter()
            .filter(|(_, link)| !link.info.state.is_terminal())
            .map(|(id, _)| id.clone())
            .collect();

        for participant_id in ids {
            if let Err(e) = self.push_tracks(&participant_id).await {
                self.fail(&participant_id, e).await;
            }
        }
    }

    async fn push_tracks(&mut self, participant_id: &str) -> Result<()> {
        let Some(link) = self.links.get_mut(participant_id) else {
            return Ok(());
        };
        let update = link
            .transport
            .set_local_tracks(self.local_stream.as_ref())
            .await?;
        link.info.local_tracks_attached = self.local_stream.is_some();
        let initiator = link.info.initiator;

        if update == TrackUpdate::NeedsRenegotiation {
            if initiator {
                self.send_offer(participant_id).await?;
            } else {
                let local = self.local();
                self.signal(OutboundMessage::Renegotiate(RenegotiatePayload {
                    client_id: local.client_id,
                    display_name: local.display_name,
                    target_client_id: participant_id.to_string(),
                    reason: "local tracks changed".to_string(),
                }))?;
            }
        }
        Ok(())
    }

    async fn handle_transport_event(&mut self, participant_id: String, event: TransportEvent) {
        let Some(link) = self.links.get_mut(&participant_id) else {
            return;
        };
        if link.info.state.is_terminal() {
            return;
        }
        match event {
            TransportEvent::LocalCandidate(candidate) => {
                let local = self.local();
                let message = OutboundMessage::Candidate(CandidatePayload {
                    client_id: local.client_id,
                    display_name: local.display_name,
                    target_client_id: participant_id.clone(),
                    candidate: candidate.candidate,
                    sdp_mid: candidate.sdp_mid,
                    sdp_mline_index: candidate.sdp_mline_index,
                });
                if let Err(e) = self.signal(message) {
                    debug!(participant_id = %participant_id, error = %e, "Could not relay local candidate");
                }
            }
            TransportEvent::Connected => {
                link.info.state = NegotiationState::Connected;
                info!(participant_id = %participant_id, "Peer link connected");
                self.emit_state(&participant_id, NegotiationState::Connected);
            }
            TransportEvent::RemoteTrack(kind) => {
                link.info.remote_tracks_attached = true;
                let _ = self.events.send(PeerEvent::RemoteTrack {
                    participant_id,
                    kind,
                });
            }
            TransportEvent::Failed(reason) => {
                self.fail(&participant_id, SessionError::peer(&participant_id, reason))
                    .await;
            }
            TransportEvent::Closed => {
                link.info.state = NegotiationState::Closed;
                self.emit_state(&participant_id, NegotiationState::Closed);
            }
        }
    }

    /// Mark one link failed. Other links and the signaling channel are untouched.
    async fn fail(&mut self, participant_id: &str, error: SessionError) {
        let error = match error {
            e @ SessionError::PeerNegotiation { .. } => e,
            other => SessionError::peer(participant_id, other),
        };
        warn!(participant_id, %error, "Peer link failed");
        if let Some(link) = self.links.get_mut(participant_id) {
            link.info.state = NegotiationState::Failed;
            link.awaiting_answer = false;
            if let Err(e) = link.transport.close().await {
                debug!(participant_id, error = %e, "Closing failed transport");
            }
        }
        let _ = self.events.send(PeerEvent::Failed {
            participant_id: participant_id.to_string(),
            error,
        });
    }

    async fn close_link(&mut self, participant_id: &str) {
        self.stray.remove(participant_id);
        if let Some(link) = self.links.remove(participant_id) {
            if let Err(e) = link.transport.close().await {
                debug!(participant_id, error = %e, "Closing peer transport");
            }
            info!(participant_id, "Peer link closed");
            self.emit_state(participant_id, NegotiationState::Closed);
        }
    }

    async fn close_everything(&mut self) {
        self.stray.clear();
        let ids: Vec<String> = self.links.keys().cloned().collect();
        for participant_id in ids {
            self.close_link(&participant_id).await;
        }
    }

    fn emit_state(&self, participant_id: &str, state: NegotiationState) {
        let _ = self.events.send(PeerEvent::StateChanged {
            participant_id: participant_id.to_string(),
            state,
        });
    }

    fn publish(&self) {
        let links: HashMap<String, PeerLinkInfo> = self
            .links
            .iter()
            .map(|(id, link)| (id.clone(), link.info.clone()))
            .collect();
        self.snapshot.send_if_modified(|current| {
            if *current != links {
                *current = links;
                true
            } else {
                false
            }
        });
    }
}

/// Renegotiating a live link keeps it `Connected`; media keeps flowing.
fn begin_negotiation(info: &mut PeerLinkInfo) {
    if info.state != NegotiationState::Connected {
        info.state = NegotiationState::Negotiating;
    }
}

async fn flush_candidates(link: &mut PeerLink) -> Result<()> {
    let queued = std::mem::take(&mut link.queued);
    link.info.queued_candidates = 0;
    for candidate in queued {
        link.transport.add_ice_candidate(candidate).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devices::{MediaTrack, TrackSource};
    use crate::testing::{settle, FakePeerConnector, PeerOp, RecordingSink};

    struct Harness {
        connector: FakePeerConnector,
        sink: Arc<RecordingSink>,
        roster: watch::Sender<RosterSnapshot>,
        orchestrator: PeerOrchestrator,
    }

    fn harness(local_id: &str) -> Harness {
        let connector = FakePeerConnector::new();
        let sink = Arc::new(RecordingSink::default());
        let (roster, roster_rx) = watch::channel(RosterSnapshot {
            local: Some(ClientInfo::new(local_id, "Local")),
            active: true,
            remote_ids: BTreeSet::new(),
        });
        let orchestrator = PeerOrchestrator::spawn(Arc::new(connector.clone()), roster_rx);
        orchestrator.bind_signaling(Some(sink.clone() as Arc<dyn SignalSink>));
        Harness {
            connector,
            sink,
            roster,
            orchestrator,
        }
    }

    fn sdp(kind: SdpKind, from: &str, to: &str) -> SdpPayload {
        SdpPayload {
            client_id: from.to_string(),
            display_name: from.to_string(),
            target_client_id: to.to_string(),
            sdp: format!("{}-sdp-from-{}", kind.as_str(), from),
            sdp_type: kind.as_str().to_string(),
        }
    }

    fn candidate(from: &str, to: &str, n: u16) -> InboundMessage {
        InboundMessage::Candidate(CandidatePayload {
            client_id: from.to_string(),
            display_name: from.to_string(),
            target_client_id: to.to_string(),
            candidate: format!("candidate:{}", n),
            sdp_mid: Some("0".to_string()),
            sdp_mline_index: Some(n),
        })
    }

    fn add_remote(h: &Harness, id: &str) {
        h.roster.send_modify(|r| {
            r.remote_ids.insert(id.to_string());
        });
    }

    #[tokio::test]
    async fn test_smaller_id_initiates() {
        let h = harness("b");
        add_remote(&h, "c");
        add_remote(&h, "a");
        settle().await;

        let links = h.orchestrator.links();
        assert_eq!(links.len(), 1);
        let link = &links["c"];
        assert!(link.initiator);
        assert_eq!(link.state, NegotiationState::Negotiating);

        let offers = h.sink.sent_of("offer");
        assert_eq!(offers.len(), 1);
        match &offers[0] {
            OutboundMessage::Offer(p) => {
                assert_eq!(p.target_client_id, "c");
                assert_eq!(p.client_id, "b");
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_offer_from_unknown_creates_answerer_link() {
        let h = harness("m");
        h.orchestrator
            .handle_signal(&InboundMessage::Offer(sdp(SdpKind::Offer, "a", "m")));
        settle().await;

        let link = h.orchestrator.link("a").unwrap();
        assert!(!link.initiator);
        assert_eq!(link.state, NegotiationState::Negotiating);
        assert_eq!(h.sink.sent_of("answer").len(), 1);
        assert_eq!(
            h.connector.ops("a"),
            vec![PeerOp::SetRemote(SdpKind::Offer), PeerOp::CreateAnswer]
        );
    }

    #[tokio::test]
    async fn test_candidates_before_offer_wait_for_it() {
        let h = harness("m");
        h.orchestrator.handle_signal(&candidate("a", "m", 0));
        h.orchestrator.handle_signal(&candidate("a", "m", 1));
        settle().await;
        assert!(h.orchestrator.link("a").is_none());
        assert!(h.connector.participants().is_empty());

        h.orchestrator
            .handle_signal(&InboundMessage::Offer(sdp(SdpKind::Offer, "a", "m")));
        h.orchestrator.handle_signal(&candidate("a", "m", 2));
        settle().await;

        assert_eq!(
            h.connector.ops("a"),
            vec![
                PeerOp::SetRemote(SdpKind::Offer),
                PeerOp::AddCandidate("candidate:0".to_string()),
                PeerOp::AddCandidate("candidate:1".to_string()),
                PeerOp::CreateAnswer,
                PeerOp::AddCandidate("candidate:2".to_string()),
            ]
        );
        assert_eq!(h.orchestrator.link("a").unwrap().queued_candidates, 0);
    }

    #[tokio::test]
    async fn test_answer_completes_initiated_link() {
        let h = harness("a");
        add_remote(&h, "b");
        settle().await;
        h.orchestrator
            .handle_signal(&InboundMessage::Answer(sdp(SdpKind::Answer, "b", "a")));
        // a second, stale answer is ignored
        h.orchestrator
            .handle_signal(&InboundMessage::Answer(sdp(SdpKind::Answer, "b", "a")));
        settle().await;

        assert_eq!(
            h.connector.ops("b"),
            vec![PeerOp::CreateOffer, PeerOp::SetRemote(SdpKind::Answer)]
        );

        h.connector.emit("b", TransportEvent::Connected);
        settle().await;
        assert_eq!(
            h.orchestrator.link("b").unwrap().state,
            NegotiationState::Connected
        );
    }

    #[tokio::test]
    async fn test_candidate_never_makes_answerer_initiate() {
        // "m" would initiate towards "z", but "z" is not in the roster
        let h = harness("m");
        h.orchestrator.handle_signal(&candidate("z", "m", 0));
        settle().await;
        assert!(h.orchestrator.links().is_empty());
        assert!(h.sink.sent_of("offer").is_empty());

        h.orchestrator
            .handle_signal(&InboundMessage::Offer(sdp(SdpKind::Offer, "z", "m")));
        settle().await;
        let link = h.orchestrator.link("z").unwrap();
        assert!(!link.initiator);
        assert!(h
            .connector
            .ops("z")
            .contains(&PeerOp::AddCandidate("candidate:0".to_string())));
        assert!(h.sink.sent_of("offer").is_empty());
    }

    #[tokio::test]
    async fn test_renegotiation_keeps_connected_state() {
        let h = harness("a");
        add_remote(&h, "b");
        settle().await;
        h.orchestrator
            .handle_signal(&InboundMessage::Answer(sdp(SdpKind::Answer, "b", "a")));
        h.connector.emit("b", TransportEvent::Connected);
        settle().await;
        assert_eq!(h.orchestrator.link("b").unwrap().state, NegotiationState::Connected);

        h.connector.require_renegotiation(true);
        let cam = MediaTrack::new(TrackSource::Camera, "cam", None);
        h.orchestrator.attach_local_stream(MediaStream::new(vec![cam]));
        settle().await;
        assert_eq!(h.sink.sent_of("offer").len(), 2);
        assert_eq!(h.orchestrator.link("b").unwrap().state, NegotiationState::Connected);

        h.orchestrator
            .handle_signal(&InboundMessage::Answer(sdp(SdpKind::Answer, "b", "a")));
        settle().await;
        assert_eq!(h.orchestrator.link("b").unwrap().state, NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_remote_renegotiation_keeps_connected_state() {
        let h = harness("m");
        h.orchestrator
            .handle_signal(&InboundMessage::Offer(sdp(SdpKind::Offer, "a", "m")));
        settle().await;
        h.connector.emit("a", TransportEvent::Connected);
        settle().await;

        h.orchestrator
            .handle_signal(&InboundMessage::Offer(sdp(SdpKind::Offer, "a", "m")));
        settle().await;
        assert_eq!(h.sink.sent_of("answer").len(), 2);
        assert_eq!(h.orchestrator.link("a").unwrap().state, NegotiationState::Connected);
    }

    #[tokio::test]
    async fn test_failed_link_retried_on_roster_update() {
        let h = harness("a");
        h.connector.fail_on("b", PeerOp::CreateOffer);
        add_remote(&h, "b");
        settle().await;
        assert_eq!(h.orchestrator.link("b").unwrap().state, NegotiationState::Failed);

        h.connector.clear_failures();
        add_remote(&h, "c");
        settle().await;

        let link = h.orchestrator.link("b").unwrap();
        assert_eq!(link.state, NegotiationState::Negotiating);
        assert!(link.initiator);
        let to_b = h
            .sink
            .sent_of("offer")
            .into_iter()
            .filter(|m| matches!(m, OutboundMessage::Offer(p) if p.target_client_id == "b"))
            .count();
        assert_eq!(to_b, 1);
    }

    #[tokio::test]
    async fn test_messages_for_other_targets_ignored() {
        let h = harness("m");
        h.orchestrator
            .handle_signal(&InboundMessage::Offer(sdp(SdpKind::Offer, "a", "someone-else")));
        settle().await;
        assert!(h.orchestrator.links().is_empty());
    }

    #[tokio::test]
    async fn test_failure_is_isolated() {
        let h = harness("a");
        let mut events = h.orchestrator.subscribe();
        h.connector.fail_on("c", PeerOp::CreateOffer);
        add_remote(&h, "b");
        add_remote(&h, "c");
        settle().await;

        let links = h.orchestrator.links();
        assert_eq!(links["b"].state, NegotiationState::Negotiating);
        assert_eq!(links["c"].state, NegotiationState::Failed);

        let mut failed = None;
        while let Ok(event) = events.try_recv() {
            if let PeerEvent::Failed { participant_id, error } = event {
                failed = Some((participant_id, error));
            }
        }
        let (who, error) = failed.unwrap();
        assert_eq!(who, "c");
        assert_eq!(error.kind(), crate::error::ErrorKind::PeerNegotiation);

        h.connector.emit("b", TransportEvent::Failed("ice failed".to_string()));
        settle().await;
        assert_eq!(
            h.orchestrator.link("b").unwrap().state,
            NegotiationState::Failed
        );
        assert!(h.connector.ops("b").contains(&PeerOp::Close));
    }

    #[tokio::test]
    async fn test_track_switch_replaces_without_renegotiation() {
        let h = harness("a");
        add_remote(&h, "b");
        settle().await;

        let mic = MediaTrack::new(TrackSource::Microphone, "mic", None);
        h.orchestrator
            .attach_local_stream(MediaStream::new(vec![mic]));
        settle().await;

        assert!(h.orchestrator.link("b").unwrap().local_tracks_attached);
        assert_eq!(h.sink.sent_of("offer").len(), 1);
    }

    #[tokio::test]
    async fn test_track_change_needing_negotiation() {
        let h = harness("b");
        add_remote(&h, "a");
        add_remote(&h, "c");
        h.orchestrator
            .handle_signal(&InboundMessage::Offer(sdp(SdpKind::Offer, "a", "b")));
        settle().await;

        h.connector.require_renegotiation(true);
        let cam = MediaTrack::new(TrackSource::Camera, "cam", None);
        h.orchestrator
            .attach_local_stream(MediaStream::new(vec![cam]));
        settle().await;

        // b initiates towards c: a fresh offer; b answers a: asks a to renegotiate
        assert_eq!(h.sink.sent_of("offer").len(), 2);
        let requests = h.sink.sent_of("renegotiate");
        assert_eq!(requests.len(), 1);
        match &requests[0] {
            OutboundMessage::Renegotiate(p) => assert_eq!(p.target_client_id, "a"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_roster_departure_and_inactive_close_links() {
        let h = harness("a");
        add_remote(&h, "b");
        add_remote(&h, "c");
        settle().await;
        assert_eq!(h.orchestrator.links().len(), 2);

        h.roster.send_modify(|r| {
            r.remote_ids.remove("b");
        });
        settle().await;
        assert_eq!(h.orchestrator.links().len(), 1);
        assert!(h.connector.ops("b").contains(&PeerOp::Close));

        h.roster.send_modify(|r| r.active = false);
        settle().await;
        assert!(h.orchestrator.links().is_empty());
    }

    #[tokio::test]
    async fn test_close_all() {
        let h = harness("a");
        add_remote(&h, "b");
        settle().await;
        h.orchestrator.close_all().await;
        assert!(h.orchestrator.links().is_empty());
        assert!(h.connector.ops("b").contains(&PeerOp::Close));
    }
}
