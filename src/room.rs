//! Room SFU: one producer, many consumers, one serialized owner.
//!
//! Each room runs as its own task. API calls arrive as [`RoomCommand`]s and
//! engine callbacks as [`PeerEvent`]s; both are handled one at a time, so
//! the producer/consumer maps are never touched concurrently and a second
//! negotiation queues behind the one in flight. Engine events are drained
//! before the next command.
//!
//! A negotiation in flight holds the whole room: later commands (ICE
//! candidates, removals, teardown) and engine events wait until it
//! finishes or hits the negotiation timeout. A candidate sent for a
//! consumer still negotiating is only looked up afterwards, so it lands
//! if the consumer made it in and is dropped otherwise.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::peer::{
    MediaPeer, PeerConnector, PeerEvent, PeerEventKind, PeerEvents, PeerState, RelayTrack,
    TrackSender,
};
use crate::protocol::{topics, CandidatePayload, Frame, IceCandidate, SessionDescription};
use crate::registry::SocketRegistry;

const COMMAND_QUEUE: usize = 64;

// ---------------------------------------------------------------------------
// Shared dependencies
// ---------------------------------------------------------------------------

/// What every Room SFU needs from the outside world.
#[derive(Clone)]
pub struct RoomDeps {
    pub registry: Arc<SocketRegistry>,
    pub connector: Arc<dyn PeerConnector>,
    pub negotiation_timeout: Option<Duration>,
}

/// Invoked once with `(room, generation)` when a Room SFU task ends.
pub type OnClosed = Box<dyn FnOnce(&str, u64) + Send>;

// ---------------------------------------------------------------------------
// Peers
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerPhase {
    Negotiating,
    Connected,
    Failed,
    Closed,
}

struct Producer {
    id: String,
    session: u64,
    peer: Arc<dyn MediaPeer>,
    /// `None` until the first inbound track arrives.
    stream: Option<Vec<RelayTrack>>,
    phase: PeerPhase,
}

struct Consumer {
    session: u64,
    peer: Arc<dyn MediaPeer>,
    senders: HashMap<String, TrackSender>,
    phase: PeerPhase,
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

type Reply<T> = oneshot::Sender<Result<T, SignalError>>;

pub enum RoomCommand {
    AddProducer {
        offer: SessionDescription,
        reply: Reply<SessionDescription>,
    },
    AddConsumer {
        participant: String,
        offer: SessionDescription,
        reply: Reply<SessionDescription>,
    },
    /// Replies `true` when the candidate reached a peer, `false` when dropped.
    AddIceCandidate {
        participant: String,
        candidate: IceCandidate,
        reply: Reply<bool>,
    },
    RemoveConsumer {
        participant: String,
        reply: Reply<()>,
    },
    RemoveProducer {
        reply: oneshot::Sender<()>,
    },
    Inspect {
        reply: oneshot::Sender<RoomSnapshot>,
    },
}

/// Point-in-time view of a room.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomSnapshot {
    pub producer: Option<String>,
    pub producer_phase: Option<PeerPhase>,
    pub streaming: bool,
    pub tracks: Vec<String>,
    pub consumers: Vec<String>,
    pub connected_consumers: usize,
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// Cheap, cloneable address of a running Room SFU.
#[derive(Clone)]
pub struct RoomHandle {
    room_id: String,
    producer_id: String,
    generation: u64,
    tx: mpsc::Sender<RoomCommand>,
}

impl RoomHandle {
    pub fn producer_id(&self) -> &str {
        &self.producer_id
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }

    pub async fn add_producer(
        &self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SignalError> {
        self.request(|reply| RoomCommand::AddProducer { offer, reply })
            .await?
    }

    pub async fn add_consumer(
        &self,
        participant: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SignalError> {
        self.request(|reply| RoomCommand::AddConsumer {
            participant: participant.to_string(),
            offer,
            reply,
        })
        .await?
    }

    pub async fn add_ice_candidate(
        &self,
        participant: &str,
        candidate: IceCandidate,
    ) -> Result<bool, SignalError> {
        self.request(|reply| RoomCommand::AddIceCandidate {
            participant: participant.to_string(),
            candidate,
            reply,
        })
        .await?
    }

    pub async fn remove_consumer(&self, participant: &str) -> Result<(), SignalError> {
        self.request(|reply| RoomCommand::RemoveConsumer {
            participant: participant.to_string(),
            reply,
        })
        .await?
    }

    pub async fn remove_producer(&self) -> Result<(), SignalError> {
        self.request(|reply| RoomCommand::RemoveProducer { reply })
            .await
    }

    pub async fn inspect(&self) -> Result<RoomSnapshot, SignalError> {
        self.request(|reply| RoomCommand::Inspect { reply }).await
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> RoomCommand,
    ) -> Result<T, SignalError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| SignalError::RoomClosed(self.room_id.clone()))?;
        rx.await
            .map_err(|_| SignalError::RoomClosed(self.room_id.clone()))
    }
}

// ---------------------------------------------------------------------------
// Room SFU task
// ---------------------------------------------------------------------------

pub struct RoomSfu {
    room_id: String,
    generation: u64,
    deps: RoomDeps,
    producer_id: String,
    producer: Option<Producer>,
    consumers: HashMap<String, Consumer>,
    next_session: u64,
    events_tx: mpsc::UnboundedSender<PeerEvent>,
    closed: bool,
}

impl RoomSfu {
    /// Start the task for `room_id`. The first command must be
    /// [`RoomHandle::add_producer`].
    pub fn spawn(
        room_id: &str,
        producer_id: &str,
        generation: u64,
        deps: RoomDeps,
        on_closed: OnClosed,
    ) -> RoomHandle {
        let (tx, commands) = mpsc::channel(COMMAND_QUEUE);
        let (events_tx, events) = mpsc::unbounded_channel();

        let room = RoomSfu {
            room_id: room_id.to_string(),
            generation,
            deps,
            producer_id: producer_id.to_string(),
            producer: None,
            consumers: HashMap::new(),
            next_session: 0,
            events_tx,
            closed: false,
        };
        tokio::spawn(room.run(commands, events, on_closed));

        RoomHandle {
            room_id: room_id.to_string(),
            producer_id: producer_id.to_string(),
            generation,
            tx,
        }
    }

    async fn run(
        mut self,
        mut commands: mpsc::Receiver<RoomCommand>,
        mut events: mpsc::UnboundedReceiver<PeerEvent>,
        on_closed: OnClosed,
    ) {
        debug!(room = %self.room_id, generation = self.generation, "room sfu started");
        while !self.closed {
            tokio::select! {
                biased;
                Some(event) = events.recv() => self.handle_event(event).await,
                command = commands.recv() => match command {
                    Some(command) => self.handle_command(command).await,
                    None => self.teardown().await,
                },
            }
        }
        // Pending requests see their reply channel dropped: `RoomClosed`.
        drop(commands);
        info!(room = %self.room_id, "room sfu closed");
        on_closed(&self.room_id, self.generation);
    }

    fn next_session(&mut self) -> u64 {
        self.next_session += 1;
        self.next_session
    }

    async fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::AddProducer { offer, reply } => {
                let result = self.add_producer(offer).await;
                let _ = reply.send(result);
            }
            RoomCommand::AddConsumer {
                participant,
                offer,
                reply,
            } => {
                let result = self.add_consumer(participant, offer).await;
                let _ = reply.send(result);
            }
            RoomCommand::AddIceCandidate {
                participant,
                candidate,
                reply,
            } => {
                let result = self.add_ice_candidate(&participant, candidate).await;
                let _ = reply.send(result);
            }
            RoomCommand::RemoveConsumer { participant, reply } => {
                let result = if self.remove_consumer(&participant).await {
                    Ok(())
                } else {
                    Err(SignalError::NotAConsumer(participant))
                };
                let _ = reply.send(result);
            }
            RoomCommand::RemoveProducer { reply } => {
                self.teardown().await;
                let _ = reply.send(());
            }
            RoomCommand::Inspect { reply } => {
                let _ = reply.send(self.snapshot());
            }
        }
    }

    // ── Producer ──────────────────────────────────────────────────────────

    async fn add_producer(
        &mut self,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SignalError> {
        if let Some(existing) = &self.producer {
            return Err(SignalError::AlreadyHasProducer {
                room: self.room_id.clone(),
                producer: existing.id.clone(),
            });
        }

        let id = self.producer_id.clone();
        let peer = match self.deps.connector.create(&id).await {
            Ok(peer) => peer,
            Err(e) => {
                self.closed = true;
                return Err(e);
            }
        };
        let session = self.next_session();
        self.producer = Some(Producer {
            id: id.clone(),
            session,
            peer: peer.clone(),
            stream: None,
            phase: PeerPhase::Negotiating,
        });

        let events = PeerEvents::new(&id, session, self.events_tx.clone());
        match self.negotiate(&peer, offer, events).await {
            Ok(answer) => {
                info!(room = %self.room_id, participant = %id, "producer negotiated");
                Ok(answer)
            }
            Err(e) => {
                warn!(room = %self.room_id, participant = %id, "producer negotiation failed: {e}");
                self.producer = None;
                close_peer(&peer, &self.room_id, &id).await;
                self.closed = true;
                Err(e)
            }
        }
    }

    async fn on_track_added(&mut self, track: RelayTrack) {
        let Some(producer) = self.producer.as_mut() else {
            return;
        };

        if producer.stream.is_none() {
            info!(room = %self.room_id, track = %track.label, "producer stream available");
            producer.stream = Some(vec![track]);
            let notified = self.deps.registry.notify_others(
                &self.room_id,
                &producer.id,
                &Frame::new(topics::RTC_NEW_PRODUCER, serde_json::json!({})),
            );
            debug!(room = %self.room_id, notified, "announced new producer");
            return;
        }

        let tracks = producer.stream.get_or_insert_with(Vec::new);
        if tracks.iter().any(|t| t.label == track.label) {
            debug!(room = %self.room_id, track = %track.label, "track already relayed");
            return;
        }
        tracks.push(track.clone());

        for (id, consumer) in self.consumers.iter_mut() {
            match consumer.peer.add_track(&track).await {
                Ok(sender) => {
                    consumer.senders.insert(track.label.clone(), sender);
                }
                Err(e) => {
                    warn!(room = %self.room_id, participant = %id, track = %track.label, "failed to mirror track: {e}")
                }
            }
        }
    }

    async fn on_track_removed(&mut self, label: String) {
        if let Some(tracks) = self
            .producer
            .as_mut()
            .and_then(|p| p.stream.as_mut())
        {
            tracks.retain(|t| t.label != label);
        }

        for (id, consumer) in self.consumers.iter_mut() {
            if let Some(sender) = consumer.senders.remove(&label) {
                if let Err(e) = consumer.peer.remove_track(sender).await {
                    debug!(room = %self.room_id, participant = %id, "remove_track failed: {e}");
                }
            }
        }
        debug!(room = %self.room_id, track = %label, "track removed from consumers");
    }

    /// Notify the room, drop every consumer, close the producer. The task
    /// exits afterwards.
    async fn teardown(&mut self) {
        self.closed = true;
        let Some(producer) = self.producer.take() else {
            return;
        };

        // Disconnect notices are queued before any peer is closed.
        let notified = self.deps.registry.notify_others(
            &self.room_id,
            &producer.id,
            &Frame::bare(topics::RTC_DISCONNECT_PRODUCER),
        );

        let members: HashSet<String> = self
            .deps
            .registry
            .participant_ids(&self.room_id)
            .into_iter()
            .collect();
        let (present, stale): (Vec<String>, Vec<String>) = self
            .consumers
            .keys()
            .cloned()
            .partition(|id| members.contains(id));

        for id in &present {
            self.remove_consumer(id).await;
        }
        if !stale.is_empty() {
            warn!(
                room = %self.room_id,
                stale = ?stale,
                "consumers without a socket left behind, force-removing"
            );
            for id in &stale {
                self.remove_consumer(id).await;
            }
        }

        close_peer(&producer.peer, &self.room_id, &producer.id).await;
        info!(
            room = %self.room_id,
            participant = %producer.id,
            notified,
            "producer removed"
        );
    }

    // ── Consumers ─────────────────────────────────────────────────────────

    async fn add_consumer(
        &mut self,
        id: String,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SignalError> {
        let tracks = match &self.producer {
            Some(Producer {
                stream: Some(tracks),
                id: producer_id,
                ..
            }) => {
                if *producer_id == id || self.consumers.contains_key(&id) {
                    return Err(SignalError::DuplicateConsumer(id));
                }
                tracks.clone()
            }
            _ => return Err(SignalError::NoProducer(self.room_id.clone())),
        };

        let peer = self.deps.connector.create(&id).await?;
        let session = self.next_session();
        let mut senders = HashMap::new();

        let result = self
            .attach_and_negotiate(&peer, &tracks, &mut senders, offer, session, &id)
            .await;

        match result {
            Ok(answer) => {
                self.consumers.insert(
                    id.clone(),
                    Consumer {
                        session,
                        peer,
                        senders,
                        phase: PeerPhase::Negotiating,
                    },
                );
                info!(room = %self.room_id, participant = %id, tracks = tracks.len(), "consumer added");
                Ok(answer)
            }
            Err(e) => {
                warn!(room = %self.room_id, participant = %id, "consumer negotiation failed: {e}");
                for (_, sender) in senders {
                    let _ = peer.remove_track(sender).await;
                }
                close_peer(&peer, &self.room_id, &id).await;
                Err(e)
            }
        }
    }

    async fn attach_and_negotiate(
        &self,
        peer: &Arc<dyn MediaPeer>,
        tracks: &[RelayTrack],
        senders: &mut HashMap<String, TrackSender>,
        offer: SessionDescription,
        session: u64,
        id: &str,
    ) -> Result<SessionDescription, SignalError> {
        for track in tracks {
            let sender = peer.add_track(track).await?;
            senders.insert(track.label.clone(), sender);
        }
        let events = PeerEvents::new(id, session, self.events_tx.clone());
        self.negotiate(peer, offer, events).await
    }

    /// Returns `false` if `id` is not a consumer.
    async fn remove_consumer(&mut self, id: &str) -> bool {
        let Some(consumer) = self.consumers.remove(id) else {
            return false;
        };
        for (label, sender) in consumer.senders {
            if let Err(e) = consumer.peer.remove_track(sender).await {
                debug!(room = %self.room_id, participant = %id, track = %label, "remove_track failed: {e}");
            }
        }
        close_peer(&consumer.peer, &self.room_id, id).await;
        info!(room = %self.room_id, participant = %id, "consumer removed");
        true
    }

    // ── ICE / negotiation ─────────────────────────────────────────────────

    async fn add_ice_candidate(
        &mut self,
        id: &str,
        candidate: IceCandidate,
    ) -> Result<bool, SignalError> {
        let peer = match &self.producer {
            Some(producer) if producer.id == id => Some(producer.peer.clone()),
            _ => self.consumers.get(id).map(|c| c.peer.clone()),
        };
        let Some(peer) = peer else {
            debug!(room = %self.room_id, participant = %id, "ICE candidate for unknown peer dropped");
            return Ok(false);
        };
        peer.add_ice_candidate(candidate).await.map_err(|e| {
            warn!(room = %self.room_id, participant = %id, "add_ice_candidate failed: {e}");
            e
        })?;
        Ok(true)
    }

    async fn negotiate(
        &self,
        peer: &Arc<dyn MediaPeer>,
        offer: SessionDescription,
        events: PeerEvents,
    ) -> Result<SessionDescription, SignalError> {
        let negotiation = peer.negotiate(offer, events);
        match self.deps.negotiation_timeout {
            Some(limit) => tokio::time::timeout(limit, negotiation)
                .await
                .map_err(|_| {
                    SignalError::negotiation(format!("no answer within {}ms", limit.as_millis()))
                })?,
            None => negotiation.await,
        }
    }

    // ── Engine events ─────────────────────────────────────────────────────

    fn is_current(&self, id: &str, session: u64) -> bool {
        match &self.producer {
            Some(p) if p.id == id && p.session == session => true,
            _ => self
                .consumers
                .get(id)
                .is_some_and(|c| c.session == session),
        }
    }

    async fn handle_event(&mut self, event: PeerEvent) {
        let PeerEvent {
            participant,
            session,
            kind,
        } = event;
        if !self.is_current(&participant, session) {
            debug!(room = %self.room_id, %participant, session, "event from a retired peer ignored");
            return;
        }
        let is_producer = self.producer.as_ref().is_some_and(|p| p.id == participant);

        match kind {
            PeerEventKind::IceCandidate(candidate) => self.forward_candidate(&participant, candidate),
            PeerEventKind::StateChanged(state) => {
                self.on_state_changed(&participant, is_producer, state).await
            }
            PeerEventKind::TrackAdded(track) if is_producer => self.on_track_added(track).await,
            PeerEventKind::TrackRemoved(label) if is_producer => {
                self.on_track_removed(label).await
            }
            PeerEventKind::TrackAdded(_) | PeerEventKind::TrackRemoved(_) => {
                debug!(room = %self.room_id, %participant, "track event from consumer ignored");
            }
        }
    }

    fn forward_candidate(&self, participant: &str, candidate: IceCandidate) {
        let payload = match serde_json::to_value(CandidatePayload { candidate }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("failed to encode ICE candidate: {e}");
                return;
            }
        };
        let frame = Frame::new(topics::NEW_ICE_CANDIDATE, payload);
        if !self.deps.registry.send_to(&self.room_id, participant, &frame) {
            debug!(room = %self.room_id, %participant, "no socket for server ICE candidate");
        }
    }

    async fn on_state_changed(&mut self, participant: &str, is_producer: bool, state: PeerState) {
        let phase = match state {
            PeerState::Connected => PeerPhase::Connected,
            PeerState::Failed => PeerPhase::Failed,
            PeerState::Closed => PeerPhase::Closed,
            _ => return,
        };
        info!(room = %self.room_id, %participant, %state, "peer connection state");

        if is_producer {
            if let Some(producer) = self.producer.as_mut() {
                producer.phase = phase;
            }
        } else if let Some(consumer) = self.consumers.get_mut(participant) {
            consumer.phase = phase;
        }

        if state.is_terminal() {
            if is_producer {
                self.teardown().await;
            } else {
                self.remove_consumer(participant).await;
            }
        }
    }

    fn snapshot(&self) -> RoomSnapshot {
        let mut consumers: Vec<String> = self.consumers.keys().cloned().collect();
        consumers.sort();
        let tracks = self
            .producer
            .as_ref()
            .and_then(|p| p.stream.as_ref())
            .map(|tracks| tracks.iter().map(|t| t.label.clone()).collect())
            .unwrap_or_default();
        RoomSnapshot {
            producer: self.producer.as_ref().map(|p| p.id.clone()),
            producer_phase: self.producer.as_ref().map(|p| p.phase),
            streaming: self.producer.as_ref().is_some_and(|p| p.stream.is_some()),
            tracks,
            consumers,
            connected_consumers: self
                .consumers
                .values()
                .filter(|c| c.phase == PeerPhase::Connected)
                .count(),
        }
    }
}

async fn close_peer(peer: &Arc<dyn MediaPeer>, room: &str, participant: &str) {
    if let Err(e) = peer.close().await {
        debug!(room, participant, "peer close failed: {e}");
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
