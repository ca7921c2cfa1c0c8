use async_trait::async_trait;
use std::sync::{Arc, Weak};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_candidate_type::RTCIceCandidateType;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::RTPCodecType;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

use crate::config::Config;
use crate::error::SignalError;
use crate::peer::{
    MediaPeer, PeerConnector, PeerEventKind, PeerEvents, PeerState, RelayTrack, TrackSender,
};
use crate::protocol::{IceCandidate, SdpType, SessionDescription};

const PLI_INTERVAL: std::time::Duration = std::time::Duration::from_secs(3);

// ─── Connector ──────────────────────────────────────────────────────────────

/// webrtc-rs backed [`PeerConnector`].
pub struct WebRtcConnector {
    ice_servers: Vec<RTCIceServer>,
    udp_port_range: Option<(u16, u16)>,
    nat_ip: Option<String>,
}

impl WebRtcConnector {
    pub fn new(cfg: &Config) -> Self {
        let ice_servers = cfg
            .ice_servers()
            .into_iter()
            .map(|s| RTCIceServer {
                urls: s.urls,
                username: s.username.unwrap_or_default(),
                credential: s.credential.unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let udp_port_range = (cfg.udp_port_min > 0 && cfg.udp_port_max > 0)
            .then_some((cfg.udp_port_min, cfg.udp_port_max));

        // NAT1To1 needs an address, not a hostname.
        let nat_ip = match cfg.public_host.as_str() {
            "localhost" => None,
            host if host.parse::<std::net::IpAddr>().is_ok() => Some(host.to_string()),
            host => {
                warn!("RELAY_PUBLIC_HOST '{host}' is not an IP address; host candidates are not rewritten");
                None
            }
        };

        Self {
            ice_servers,
            udp_port_range,
            nat_ip,
        }
    }

    fn build_api(&self) -> Result<API, webrtc::Error> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine)?;

        let mut setting_engine = SettingEngine::default();
        if let Some((min, max)) = self.udp_port_range {
            let ephemeral = webrtc::ice::udp_network::EphemeralUDP::new(min, max)
                .map_err(|e| webrtc::Error::new(format!("invalid UDP port range: {e}")))?;
            setting_engine
                .set_udp_network(webrtc::ice::udp_network::UDPNetwork::Ephemeral(ephemeral));
        }
        if let Some(ip) = &self.nat_ip {
            setting_engine.set_nat_1to1_ips(vec![ip.clone()], RTCIceCandidateType::Host);
        }

        Ok(APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .with_setting_engine(setting_engine)
            .build())
    }
}

#[async_trait]
impl PeerConnector for WebRtcConnector {
    async fn create(&self, participant: &str) -> Result<Arc<dyn MediaPeer>, SignalError> {
        let api = self.build_api().map_err(|e| {
            warn!("failed to build WebRTC API for '{participant}': {e}");
            SignalError::negotiation(e)
        })?;

        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = api.new_peer_connection(config).await.map_err(|e| {
            warn!("failed to create PeerConnection for '{participant}': {e}");
            SignalError::negotiation(e)
        })?;

        Ok(Arc::new(WebRtcPeer {
            participant: participant.to_string(),
            pc: Arc::new(pc),
            relays: CancellationToken::new(),
        }))
    }
}

// ─── Peer ───────────────────────────────────────────────────────────────────

pub struct WebRtcPeer {
    participant: String,
    pc: Arc<RTCPeerConnection>,
    /// Stops every reader / PLI task spawned for inbound tracks.
    relays: CancellationToken,
}

impl WebRtcPeer {
    fn hook_ice(&self, events: &PeerEvents) {
        let events = events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(candidate) = candidate else {
                        return;
                    };
                    match candidate.to_json() {
                        Ok(init) if !init.candidate.is_empty() => {
                            events.emit(PeerEventKind::IceCandidate(IceCandidate::from(init)));
                        }
                        Ok(_) => {}
                        Err(e) => warn!("failed to serialize ICE candidate: {e}"),
                    }
                })
            }));
    }

    fn hook_state(&self, events: &PeerEvents) {
        let events = events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let events = events.clone();
                Box::pin(async move {
                    let state = PeerState::from(state);
                    if state.is_reported() {
                        debug!("[{}] peer connection: {state}", events.participant());
                        events.emit(PeerEventKind::StateChanged(state));
                    }
                })
            }));
    }

    fn hook_tracks(&self, events: &PeerEvents) {
        let events = events.clone();
        let pc = Arc::downgrade(&self.pc);
        let relays = self.relays.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let events = events.clone();
                let pc = pc.clone();
                let relays = relays.clone();
                Box::pin(async move {
                    let kind = track.kind();
                    let relay = RelayTrack::new(
                        track.id(),
                        track.stream_id(),
                        kind,
                        track.codec().capability.clone(),
                    );
                    info!(
                        "[{}] track received: kind={kind}, label={}, ssrc={}",
                        events.participant(),
                        relay.label,
                        track.ssrc()
                    );

                    if kind == RTPCodecType::Video {
                        spawn_pli_sender(pc, track.ssrc(), relays.clone());
                    }
                    spawn_track_reader(track, relay.clone(), events.clone(), relays);
                    events.emit(PeerEventKind::TrackAdded(relay));
                })
            },
        ));
    }
}

#[async_trait]
impl MediaPeer for WebRtcPeer {
    async fn negotiate(
        &self,
        remote: SessionDescription,
        events: PeerEvents,
    ) -> Result<SessionDescription, SignalError> {
        if remote.sdp_type != SdpType::Offer {
            return Err(SignalError::negotiation(format!(
                "expected an offer, got {:?}",
                remote.sdp_type
            )));
        }
        let offer = RTCSessionDescription::offer(remote.sdp).map_err(|e| {
            warn!("[{}] invalid SDP offer: {e}", self.participant);
            SignalError::negotiation(e)
        })?;

        self.hook_ice(&events);
        self.hook_state(&events);
        self.hook_tracks(&events);

        self.pc.set_remote_description(offer).await.map_err(|e| {
            warn!("[{}] set_remote_description failed: {e}", self.participant);
            SignalError::negotiation(e)
        })?;

        let answer = self.pc.create_answer(None).await.map_err(|e| {
            warn!("[{}] create_answer failed: {e}", self.participant);
            SignalError::negotiation(e)
        })?;

        self.pc.set_local_description(answer).await.map_err(|e| {
            warn!("[{}] set_local_description failed: {e}", self.participant);
            SignalError::negotiation(e)
        })?;

        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| SignalError::negotiation("local description unavailable"))?;

        Ok(SessionDescription::answer(local.sdp))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), SignalError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(SignalError::negotiation)
    }

    async fn add_track(&self, track: &RelayTrack) -> Result<TrackSender, SignalError> {
        let local = Arc::new(TrackLocalStaticRTP::new(
            track.codec.clone(),
            track.label.clone(),
            track.stream_id.clone(),
        ));

        let rtp_sender = self
            .pc
            .add_track(Arc::clone(&local) as Arc<dyn TrackLocal + Send + Sync>)
            .await
            .map_err(|e| {
                warn!("[{}] add_track({}) failed: {e}", self.participant, track.label);
                SignalError::negotiation(e)
            })?;

        let cancel = CancellationToken::new();
        spawn_rtcp_drain(rtp_sender.clone(), cancel.clone());
        spawn_fanout_task(
            track.subscribe(),
            local,
            cancel.clone(),
            format!("{}/{}", self.participant, track.label),
        );

        Ok(TrackSender::new(track.label.clone(), Some(rtp_sender), cancel))
    }

    async fn remove_track(&self, sender: TrackSender) -> Result<(), SignalError> {
        sender.cancel.cancel();
        if let Some(rtp_sender) = sender.rtp_sender {
            self.pc
                .remove_track(&rtp_sender)
                .await
                .map_err(SignalError::negotiation)?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), SignalError> {
        self.relays.cancel();
        self.pc.close().await.map_err(SignalError::negotiation)
    }
}

// ─── ICE conversions ────────────────────────────────────────────────────────

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        Self {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

// ─── Relay tasks ────────────────────────────────────────────────────────────

/// Pump producer RTP into the relay channel. The end of the RTP stream is
/// reported as a removed track.
fn spawn_track_reader(
    track: Arc<TrackRemote>,
    relay: RelayTrack,
    events: PeerEvents,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = track.read_rtp() => match result {
                    Ok((pkt, _)) => relay.publish(pkt),
                    Err(e) => {
                        debug!("[{}] track '{}' ended: {e}", events.participant(), relay.label);
                        events.emit(PeerEventKind::TrackRemoved(relay.label.clone()));
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_fanout_task(
    mut rx: broadcast::Receiver<webrtc::rtp::packet::Packet>,
    track: Arc<TrackLocalStaticRTP>,
    cancel: CancellationToken,
    label: String,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("{label} fanout task cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(pkt) => {
                            if let Err(e) = track.write_rtp(&pkt).await {
                                warn!("{label} write_rtp error: {e}");
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!("{label} consumer lagged, skipped {n} packets");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            info!("{label} producer closed channel");
                            break;
                        }
                    }
                }
            }
        }
    });
}

/// Interceptors (NACK, reports) only run while RTCP is being read.
fn spawn_rtcp_drain(sender: Arc<RTCRtpSender>, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 1500];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = sender.read(&mut buf) => {
                    if result.is_err() {
                        break;
                    }
                }
            }
        }
    });
}

/// Periodic keyframe request so late consumers don't wait on a black frame.
fn spawn_pli_sender(pc: Weak<RTCPeerConnection>, media_ssrc: u32, cancel: CancellationToken) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(PLI_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            let Some(pc) = pc.upgrade() else {
                break;
            };
            let pli = PictureLossIndication {
                sender_ssrc: 0,
                media_ssrc,
            };
            if let Err(e) = pc.write_rtcp(&[Box::new(pli)]).await {
                warn!("PLI send error: {e}");
                break;
            }
        }
    });
}

// ─── Tests ──────────────────────────────────────────────────────────────────
