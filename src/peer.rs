//! Peer-connection seam between the Room SFU and the WebRTC engine.
//!
//! The Room SFU only ever talks to [`PeerConnector`] / [`MediaPeer`]. Engine
//! callbacks (ICE candidates, connection state, inbound tracks) are not
//! invoked re-entrantly: they are posted as [`PeerEvent`]s onto the owning
//! room's event queue and handled in order with its commands.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::rtp::packet::Packet;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;

use crate::error::SignalError;
use crate::protocol::{IceCandidate, SessionDescription};

// ─── Connection state ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// `closed` and `failed` end a peer's life.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Failed | Self::Closed)
    }

    /// States worth surfacing to the room.
    pub fn is_reported(self) -> bool {
        matches!(self, Self::Connected | Self::Failed | Self::Closed)
    }
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Unspecified | RTCPeerConnectionState::New => Self::New,
            RTCPeerConnectionState::Connecting => Self::Connecting,
            RTCPeerConnectionState::Connected => Self::Connected,
            RTCPeerConnectionState::Disconnected => Self::Disconnected,
            RTCPeerConnectionState::Failed => Self::Failed,
            RTCPeerConnectionState::Closed => Self::Closed,
        }
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "new",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

// ─── Relay tracks ───────────────────────────────────────────────────────────

/// One inbound producer track, fanned out to consumers.
///
/// RTP read from the producer is pushed into a broadcast channel; every
/// consumer sender subscribes independently. Capacities follow the usual
/// 300 (video) / 100 (audio) packets, enough to absorb short stalls.
#[derive(Clone)]
pub struct RelayTrack {
    pub label: String,
    pub stream_id: String,
    pub kind: RTPCodecType,
    pub codec: RTCRtpCodecCapability,
    packets: broadcast::Sender<Packet>,
}

impl RelayTrack {
    pub fn new(
        label: impl Into<String>,
        stream_id: impl Into<String>,
        kind: RTPCodecType,
        codec: RTCRtpCodecCapability,
    ) -> Self {
        let capacity = if kind == RTPCodecType::Video { 300 } else { 100 };
        let (packets, _) = broadcast::channel(capacity);
        Self {
            label: label.into(),
            stream_id: stream_id.into(),
            kind,
            codec,
            packets,
        }
    }

    /// Push a packet to every subscribed consumer. Packets are dropped
    /// while nobody is subscribed.
    pub fn publish(&self, packet: Packet) {
        let _ = self.packets.send(packet);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Packet> {
        self.packets.subscribe()
    }
}

impl std::fmt::Debug for RelayTrack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RelayTrack")
            .field("label", &self.label)
            .field("stream_id", &self.stream_id)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Handle to a relay track attached to a consumer's peer connection.
pub struct TrackSender {
    pub label: String,
    pub(crate) rtp_sender: Option<Arc<RTCRtpSender>>,
    pub(crate) cancel: CancellationToken,
}

impl TrackSender {
    pub(crate) fn new(
        label: impl Into<String>,
        rtp_sender: Option<Arc<RTCRtpSender>>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            label: label.into(),
            rtp_sender,
            cancel,
        }
    }
}

impl std::fmt::Debug for TrackSender {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackSender").field("label", &self.label).finish()
    }
}

// ─── Events ─────────────────────────────────────────────────────────────────

#[derive(Debug)]
pub enum PeerEventKind {
    IceCandidate(IceCandidate),
    StateChanged(PeerState),
    TrackAdded(RelayTrack),
    TrackRemoved(String),
}

#[derive(Debug)]
pub struct PeerEvent {
    pub participant: String,
    /// Distinguishes successive peer connections of the same participant.
    pub session: u64,
    pub kind: PeerEventKind,
}

/// Sink handed to the engine during negotiation.
#[derive(Debug, Clone)]
pub struct PeerEvents {
    participant: String,
    session: u64,
    tx: mpsc::UnboundedSender<PeerEvent>,
}

impl PeerEvents {
    pub fn new(
        participant: impl Into<String>,
        session: u64,
        tx: mpsc::UnboundedSender<PeerEvent>,
    ) -> Self {
        Self {
            participant: participant.into(),
            session,
            tx,
        }
    }

    pub fn participant(&self) -> &str {
        &self.participant
    }

    /// Returns `false` once the owning room is gone.
    pub fn emit(&self, kind: PeerEventKind) -> bool {
        self.tx
            .send(PeerEvent {
                participant: self.participant.clone(),
                session: self.session,
                kind,
            })
            .is_ok()
    }
}

// ─── Adapter traits ─────────────────────────────────────────────────────────

/// A single negotiated WebRTC session.
#[async_trait]
pub trait MediaPeer: Send + Sync {
    /// Apply the remote offer, wire engine callbacks into `events`, create
    /// and apply the local answer, and return it. Candidates are trickled
    /// through `events` one by one; only `connected`, `closed` and `failed`
    /// state changes are reported.
    async fn negotiate(
        &self,
        remote: SessionDescription,
        events: PeerEvents,
    ) -> Result<SessionDescription, SignalError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalError>;

    async fn add_track(&self, track: &RelayTrack) -> Result<TrackSender, SignalError>;

    async fn remove_track(&self, sender: TrackSender) -> Result<(), SignalError>;

    async fn close(&self) -> Result<(), SignalError>;
}

/// Creates peers configured with the service's ICE server list.
#[async_trait]
pub trait PeerConnector: Send + Sync {
    async fn create(&self, participant: &str) -> Result<Arc<dyn MediaPeer>, SignalError>;
}

// ─── Test double ────────────────────────────────────────────────────────────

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// Records every call and lets tests play the engine's part.
    #[derive(Default)]
    pub struct FakePeer {
        pub participant: String,
        pub remote: Mutex<Option<SessionDescription>>,
        pub candidates: Mutex<Vec<IceCandidate>>,
        pub tracks: Mutex<Vec<String>>,
        pub closed: AtomicBool,
        events: Mutex<Option<PeerEvents>>,
        fail: bool,
        stall: bool,
    }

    impl FakePeer {
        /// Inject an engine event as if the native stack had fired it.
        pub fn emit(&self, kind: PeerEventKind) {
            let events = self.events.lock().unwrap().clone();
            events.expect("peer was never negotiated").emit(kind);
        }

        pub fn track_labels(&self) -> Vec<String> {
            self.tracks.lock().unwrap().clone()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl MediaPeer for FakePeer {
        async fn negotiate(
            &self,
            remote: SessionDescription,
            events: PeerEvents,
        ) -> Result<SessionDescription, SignalError> {
            *self.remote.lock().unwrap() = Some(remote);
            *self.events.lock().unwrap() = Some(events);
            if self.stall {
                futures::future::pending::<()>().await;
            }
            if self.fail {
                return Err(SignalError::negotiation("set_remote_description failed"));
            }
            Ok(SessionDescription::answer(format!("answer-for-{}", self.participant)))
        }

        async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalError> {
            self.candidates.lock().unwrap().push(candidate);
            Ok(())
        }

        async fn add_track(&self, track: &RelayTrack) -> Result<TrackSender, SignalError> {
            self.tracks.lock().unwrap().push(track.label.clone());
            Ok(TrackSender::new(
                track.label.clone(),
                None,
                CancellationToken::new(),
            ))
        }

        async fn remove_track(&self, sender: TrackSender) -> Result<(), SignalError> {
            self.tracks.lock().unwrap().retain(|l| l != &sender.label);
            Ok(())
        }

        async fn close(&self) -> Result<(), SignalError> {
            self.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    pub struct FakeConnector {
        pub created: Mutex<Vec<Arc<FakePeer>>>,
        fail_for: Mutex<Vec<String>>,
        stall_for: Mutex<Vec<String>>,
    }

    impl FakeConnector {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// Negotiations for `participant` fail from now on.
        pub fn fail_for(&self, participant: &str) {
            self.fail_for.lock().unwrap().push(participant.to_string());
        }

        /// Negotiations for `participant` never complete.
        pub fn stall_for(&self, participant: &str) {
            self.stall_for.lock().unwrap().push(participant.to_string());
        }

        /// Latest peer created for `participant`.
        pub fn peer(&self, participant: &str) -> Arc<FakePeer> {
            self.created
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|p| p.participant == participant)
                .cloned()
                .expect("no peer created for participant")
        }

        pub fn created_count(&self) -> usize {
            self.created.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl PeerConnector for FakeConnector {
        async fn create(&self, participant: &str) -> Result<Arc<dyn MediaPeer>, SignalError> {
            let peer = Arc::new(FakePeer {
                participant: participant.to_string(),
                fail: self.fail_for.lock().unwrap().iter().any(|p| p == participant),
                stall: self.stall_for.lock().unwrap().iter().any(|p| p == participant),
                ..Default::default()
            });
            self.created.lock().unwrap().push(peer.clone());
            Ok(peer)
        }
    }

    pub fn video_track(label: &str) -> RelayTrack {
        RelayTrack::new(
            label,
            "producer-stream",
            RTPCodecType::Video,
            RTCRtpCodecCapability::default(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_connected_and_terminal_states_are_reported() {
        let reported: Vec<PeerState> = [
            PeerState::New,
            PeerState::Connecting,
            PeerState::Connected,
            PeerState::Disconnected,
            PeerState::Failed,
            PeerState::Closed,
        ]
        .into_iter()
        .filter(|s| s.is_reported())
        .collect();
        assert_eq!(
            reported,
            vec![PeerState::Connected, PeerState::Failed, PeerState::Closed]
        );
        assert!(!PeerState::Disconnected.is_terminal());
    }

    #[test]
    fn engine_state_maps_across() {
        assert_eq!(
            PeerState::from(RTCPeerConnectionState::Unspecified),
            PeerState::New
        );
        assert_eq!(
            PeerState::from(RTCPeerConnectionState::Failed),
            PeerState::Failed
        );
    }

    #[tokio::test]
    async fn events_carry_participant_and_session() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let events = PeerEvents::new("c1", 7, tx);
        assert!(events.emit(PeerEventKind::TrackRemoved("video".into())));

        let event = rx.recv().await.unwrap();
        assert_eq!(event.participant, "c1");
        assert_eq!(event.session, 7);

        drop(rx);
        assert!(!events.emit(PeerEventKind::StateChanged(PeerState::Closed)));
    }

    #[tokio::test]
    async fn relay_track_fans_out_to_every_subscriber() {
        let track = testing::video_track("cam");
        let mut a = track.subscribe();
        let mut b = track.subscribe();
        track.publish(Packet::default());

        assert!(a.recv().await.is_ok());
        assert!(b.recv().await.is_ok());
    }
}
