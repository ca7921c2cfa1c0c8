use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::peer::PeerConnector;
use crate::protocol::{topics, Ack, CandidatePayload, IceCandidate, SessionDescription};
use crate::registry::SocketRegistry;
use crate::room::{RoomDeps, RoomHandle, RoomSfu};
use crate::router::HandlerTable;

// ─── Manager ────────────────────────────────────────────────────────────────

/// Owns the `room -> Room SFU` map. A room has an entry exactly while it
/// has a producer: entries are created by [`SfuManager::add_producer`] and
/// removed when the producer goes away, by request or by connection loss.
pub struct SfuManager {
    rooms: Arc<DashMap<String, RoomHandle>>,
    deps: RoomDeps,
    generations: AtomicU64,
}

impl SfuManager {
    pub fn new(
        registry: Arc<SocketRegistry>,
        connector: Arc<dyn PeerConnector>,
        negotiation_timeout: Option<Duration>,
    ) -> Self {
        Self {
            rooms: Arc::new(DashMap::new()),
            deps: RoomDeps {
                registry,
                connector,
                negotiation_timeout,
            },
            generations: AtomicU64::new(0),
        }
    }

    fn handle(&self, room: &str) -> Option<RoomHandle> {
        self.rooms.get(room).map(|h| h.clone())
    }

    fn spawn_room(&self, room: &str, producer: &str) -> RoomHandle {
        let generation = self.generations.fetch_add(1, Ordering::Relaxed) + 1;
        let rooms = Arc::clone(&self.rooms);
        RoomSfu::spawn(
            room,
            producer,
            generation,
            self.deps.clone(),
            Box::new(move |room, generation| {
                if rooms
                    .remove_if(room, |_, h| h.generation() == generation)
                    .is_some()
                {
                    debug!(room, generation, "room sfu released");
                }
            }),
        )
    }

    /// Reserve the room's producer slot, then negotiate. The slot is
    /// released again if negotiation fails.
    pub async fn add_producer(
        &self,
        participant: &str,
        room: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SignalError> {
        let handle = match self.rooms.entry(room.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    let producer = entry.get().producer_id().to_string();
                    warn!(room, participant, %producer, "room already has a producer");
                    return Err(SignalError::AlreadyHasProducer {
                        room: room.to_string(),
                        producer,
                    });
                }
                let handle = self.spawn_room(room, participant);
                entry.insert(handle.clone());
                handle
            }
            Entry::Vacant(entry) => {
                let handle = self.spawn_room(room, participant);
                entry.insert(handle.clone());
                handle
            }
        };

        match handle.add_producer(offer).await {
            Ok(answer) => {
                info!(room, participant, "producer added");
                Ok(answer)
            }
            Err(e) => {
                self.rooms
                    .remove_if(room, |_, h| h.generation() == handle.generation());
                Err(e)
            }
        }
    }

    pub async fn add_consumer(
        &self,
        participant: &str,
        room: &str,
        offer: SessionDescription,
    ) -> Result<SessionDescription, SignalError> {
        let handle = self
            .handle(room)
            .ok_or_else(|| SignalError::NoProducer(room.to_string()))?;
        handle
            .add_consumer(participant, offer)
            .await
            .map_err(|e| match e {
                SignalError::RoomClosed(room) => SignalError::NoProducer(room),
                other => other,
            })
    }

    /// `Ok(false)` means the room exists but `participant` has no peer there,
    /// so the candidate was dropped.
    ///
    /// The candidate queues behind any negotiation the room is running. A
    /// candidate for a consumer that is still negotiating is therefore
    /// applied if that negotiation succeeds and dropped if it fails. Every
    /// other request to the room, the producer's candidates and teardown
    /// included, waits the same way, for at most the negotiation timeout.
    pub async fn add_ice_candidate(
        &self,
        participant: &str,
        room: &str,
        candidate: IceCandidate,
    ) -> Result<bool, SignalError> {
        let handle = self
            .handle(room)
            .ok_or_else(|| SignalError::NoRoom(room.to_string()))?;
        handle
            .add_ice_candidate(participant, candidate)
            .await
            .map_err(closed_is_no_room)
    }

    /// Remove `participant` from `room`: the whole Room SFU if it is the
    /// producer, only its consumer otherwise.
    pub async fn remove(&self, participant: &str, room: &str) -> Result<(), SignalError> {
        let handle = self
            .handle(room)
            .ok_or_else(|| SignalError::NoRoom(room.to_string()))?;

        if handle.producer_id() == participant {
            self.rooms
                .remove_if(room, |_, h| h.generation() == handle.generation());
            return match handle.remove_producer().await {
                Ok(()) | Err(SignalError::RoomClosed(_)) => Ok(()),
                Err(e) => Err(e),
            };
        }

        handle
            .remove_consumer(participant)
            .await
            .map_err(closed_is_no_room)
    }

    pub fn room_has_producer(&self, room: &str) -> bool {
        self.rooms.get(room).is_some_and(|h| !h.is_closed())
    }

    #[cfg(test)]
    pub async fn inspect(&self, room: &str) -> Option<crate::room::RoomSnapshot> {
        self.handle(room)?.inspect().await.ok()
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }

    /// Tear down every Room SFU through the producer-removal path.
    pub async fn shutdown(&self) {
        let handles: Vec<RoomHandle> = self.rooms.iter().map(|e| e.value().clone()).collect();
        self.rooms.clear();
        info!(rooms = handles.len(), "shutting down room sfus");
        futures::future::join_all(handles.iter().map(|h| async move {
            if let Ok(snapshot) = h.inspect().await {
                debug!(
                    producer = ?snapshot.producer,
                    consumers = snapshot.consumers.len(),
                    connected = snapshot.connected_consumers,
                    "closing room sfu"
                );
            }
            let _ = h.remove_producer().await;
        }))
        .await;
    }
}

fn closed_is_no_room(err: SignalError) -> SignalError {
    match err {
        SignalError::RoomClosed(room) => SignalError::NoRoom(room),
        other => other,
    }
}

// ─── Topic handlers ─────────────────────────────────────────────────────────

/// Wire the SFU-owned topics and the pre-leave hook into `table`.
pub fn register_handlers(manager: &Arc<SfuManager>, table: &mut HandlerTable) {
    let sfu = Arc::clone(manager);
    table.on(topics::RTC_END_CALL, move |ctx| {
        let sfu = Arc::clone(&sfu);
        async move {
            let result = sfu.remove(&ctx.participant_id, &ctx.room).await;
            if let Err(e) = &result {
                warn!(room = %ctx.room, participant = %ctx.participant_id, "end call failed: {e}");
            }
            ctx.socket.ack(Ack::from_result(&result, "Stream Ended!"));
        }
    });

    let sfu = Arc::clone(manager);
    table.on_pre_leave(move |ctx| {
        let sfu = Arc::clone(&sfu);
        async move {
            match sfu.remove(&ctx.participant_id, &ctx.room).await {
                Ok(()) => {
                    info!(room = %ctx.room, participant = %ctx.participant_id, "released media on leave")
                }
                // most sockets never publish or subscribe
                Err(SignalError::NoRoom(_)) | Err(SignalError::NotAConsumer(_)) => {}
                Err(e) => {
                    warn!(room = %ctx.room, participant = %ctx.participant_id, "media cleanup on leave failed: {e}")
                }
            }
        }
    });

    let sfu = Arc::clone(manager);
    table.on(topics::ICE_CANDIDATE, move |ctx| {
        let sfu = Arc::clone(&sfu);
        async move {
            let candidate = match serde_json::from_value::<CandidatePayload>(ctx.payload) {
                Ok(payload) => payload.candidate,
                Err(e) => {
                    warn!(room = %ctx.room, participant = %ctx.participant_id, "bad ICE payload: {e}");
                    ctx.socket.ack(Ack::error("Invalid Ice Candidate"));
                    return;
                }
            };
            let result = sfu
                .add_ice_candidate(&ctx.participant_id, &ctx.room, candidate)
                .await;
            if let Err(e) = &result {
                warn!(room = %ctx.room, participant = %ctx.participant_id, "ICE candidate rejected: {e}");
            }
            ctx.socket.ack(Ack::from_result(&result, "Received Ice Candidate"));
        }
    });
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::testing::{video_track, FakeConnector};
    use crate::peer::{PeerEventKind, PeerState};
    use crate::registry::Transport;
    use crate::router::RoomRouter;
    use serde_json::{json, Value};
    use tokio::sync::mpsc;

    fn manager_with(timeout: Option<Duration>) -> (Arc<SfuManager>, Arc<FakeConnector>, Arc<SocketRegistry>) {
        let registry = Arc::new(SocketRegistry::new());
        let connector = FakeConnector::new();
        let manager = Arc::new(SfuManager::new(
            registry.clone(),
            connector.clone(),
            timeout,
        ));
        (manager, connector, registry)
    }

    fn offer(tag: &str) -> SessionDescription {
        SessionDescription::offer(format!("{tag}-offer"))
    }

    /// Producer `p1` in `room`, with a video track already flowing.
    async fn start_stream(manager: &SfuManager, connector: &FakeConnector, room: &str) {
        manager.add_producer("p1", room, offer("p1")).await.unwrap();
        connector
            .peer("p1")
            .emit(PeerEventKind::TrackAdded(video_track("video")));
        assert!(manager.inspect(room).await.unwrap().streaming);
    }

    async fn wait_for_release(manager: &SfuManager, room: &str) {
        for _ in 0..100 {
            if !manager.room_has_producer(room) && manager.room_count() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("room {room} was never released");
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<String>) -> Vec<Value> {
        let mut out = Vec::new();
        while let Ok(text) = rx.try_recv() {
            out.push(serde_json::from_str(&text).unwrap());
        }
        out
    }

    #[tokio::test]
    async fn second_producer_is_rejected() {
        let (manager, connector, _) = manager_with(None);
        start_stream(&manager, &connector, "R1").await;

        let err = manager
            .add_producer("p2", "R1", offer("p2"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SignalError::AlreadyHasProducer { ref producer, .. } if producer == "p1"
        ));

        // no peer was ever created for p2, and p1 keeps streaming
        assert_eq!(connector.created_count(), 1);
        let snapshot = manager.inspect("R1").await.unwrap();
        assert_eq!(snapshot.producer.as_deref(), Some("p1"));
        assert!(snapshot.streaming);
        assert!(!connector.peer("p1").is_closed());
    }

    #[tokio::test]
    async fn consumer_before_producer() {
        let (manager, _, _) = manager_with(None);
        let err = manager
            .add_consumer("c1", "R1", offer("c1"))
            .await
            .unwrap_err();
        assert_eq!(err, SignalError::NoProducer("R1".into()));
    }

    #[tokio::test]
    async fn room_exists_exactly_while_producer_does() {
        let (manager, connector, _) = manager_with(None);
        assert!(!manager.room_has_producer("R1"));

        start_stream(&manager, &connector, "R1").await;
        assert!(manager.room_has_producer("R1"));
        assert_eq!(manager.room_count(), 1);

        manager.add_consumer("c1", "R1", offer("c1")).await.unwrap();
        manager.remove("c1", "R1").await.unwrap();
        assert!(manager.room_has_producer("R1"));

        manager.remove("p1", "R1").await.unwrap();
        assert!(!manager.room_has_producer("R1"));
        assert_eq!(manager.room_count(), 0);
    }

    #[tokio::test]
    async fn removing_producer_removes_every_consumer() {
        let (manager, connector, _) = manager_with(None);
        start_stream(&manager, &connector, "R1").await;
        for id in ["c1", "c2", "c3"] {
            manager.add_consumer(id, "R1", offer(id)).await.unwrap();
        }
        assert_eq!(manager.inspect("R1").await.unwrap().consumers.len(), 3);

        manager.remove("p1", "R1").await.unwrap();

        assert!(manager.inspect("R1").await.is_none());
        for id in ["p1", "c1", "c2", "c3"] {
            assert!(connector.peer(id).is_closed(), "{id} still open");
        }
        let err = manager
            .add_consumer("c4", "R1", offer("c4"))
            .await
            .unwrap_err();
        assert_eq!(err.code(), "no_producer");
    }

    #[tokio::test]
    async fn failed_producer_negotiation_frees_the_room() {
        let (manager, connector, _) = manager_with(None);
        connector.fail_for("p1");

        let err = manager.add_producer("p1", "R1", offer("p1")).await.unwrap_err();
        assert_eq!(err.code(), "negotiation_failed");
        assert!(!manager.room_has_producer("R1"));

        manager.add_producer("p2", "R1", offer("p2")).await.unwrap();
        assert_eq!(
            manager.inspect("R1").await.unwrap().producer.as_deref(),
            Some("p2")
        );
    }

    #[tokio::test]
    async fn stalled_producer_times_out() {
        let (manager, connector, _) = manager_with(Some(Duration::from_millis(50)));
        connector.stall_for("p1");

        let err = manager.add_producer("p1", "R1", offer("p1")).await.unwrap_err();
        assert_eq!(err.code(), "negotiation_failed");
        assert!(connector.peer("p1").is_closed());
        wait_for_release(&manager, "R1").await;
    }

    #[tokio::test]
    async fn producer_connection_failure_releases_room() {
        let (manager, connector, _) = manager_with(None);
        start_stream(&manager, &connector, "R1").await;
        manager.add_consumer("c1", "R1", offer("c1")).await.unwrap();

        connector
            .peer("p1")
            .emit(PeerEventKind::StateChanged(PeerState::Failed));
        wait_for_release(&manager, "R1").await;
        assert!(connector.peer("c1").is_closed());

        // the room can be reused right away
        manager.add_producer("p1", "R1", offer("p1")).await.unwrap();
        assert!(manager.room_has_producer("R1"));
    }

    #[tokio::test]
    async fn unknown_room_errors() {
        let (manager, _, _) = manager_with(None);
        let candidate = IceCandidate {
            candidate: "candidate:1 1 udp 1 10.0.0.1 5000 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        assert_eq!(
            manager.add_ice_candidate("x", "nowhere", candidate).await,
            Err(SignalError::NoRoom("nowhere".into()))
        );
        assert_eq!(
            manager.remove("x", "nowhere").await,
            Err(SignalError::NoRoom("nowhere".into()))
        );
    }

    #[tokio::test]
    async fn rooms_are_independent() {
        let (manager, connector, _) = manager_with(None);
        start_stream(&manager, &connector, "R1").await;
        manager.add_producer("p9", "R2", offer("p9")).await.unwrap();

        manager.remove("p1", "R1").await.unwrap();
        assert!(!manager.room_has_producer("R1"));
        assert!(manager.room_has_producer("R2"));
    }

    #[tokio::test]
    async fn shutdown_closes_all_rooms() {
        let (manager, connector, _) = manager_with(None);
        start_stream(&manager, &connector, "R1").await;
        manager.add_producer("p2", "R2", offer("p2")).await.unwrap();

        manager.shutdown().await;
        assert_eq!(manager.room_count(), 0);
        assert!(connector.peer("p1").is_closed());
        assert!(connector.peer("p2").is_closed());
    }

    // ── Through the router ─────────────────────────────────────────────────

    fn router_for(manager: &Arc<SfuManager>, registry: &Arc<SocketRegistry>) -> RoomRouter {
        let mut table = HandlerTable::new();
        register_handlers(manager, &mut table);
        RoomRouter::new(registry.clone(), table)
    }

    fn msg(topic: &str, id: &str, payload: Value) -> String {
        json!({"topic": topic, "room": "R1", "id": id, "payload": payload}).to_string()
    }

    #[tokio::test]
    async fn ice_and_end_call_over_the_router() {
        let (manager, connector, registry) = manager_with(None);
        let router = router_for(&manager, &registry);
        let (c_sock, mut c_rx) = Transport::channel();
        router.route(&c_sock, &msg("join-room", "c1", Value::Null)).await.unwrap();

        start_stream(&manager, &connector, "R1").await;
        manager.add_consumer("c1", "R1", offer("c1")).await.unwrap();
        frames(&mut c_rx);

        let candidate = json!({"candidate": {"candidate": "candidate:1 1 udp 1 10.0.0.1 5000 typ host", "sdpMid": "0"}});
        router.route(&c_sock, &msg("ice-candidate", "c1", candidate)).await.unwrap();
        assert_eq!(
            frames(&mut c_rx),
            vec![json!({"status": 200, "msg": "Received Ice Candidate"})]
        );
        assert_eq!(connector.peer("c1").candidates.lock().unwrap().len(), 1);

        router.route(&c_sock, &msg("ice-candidate", "c1", json!({"nope": 1}))).await.unwrap();
        assert_eq!(
            frames(&mut c_rx),
            vec![json!({"status": 400, "msg": "Invalid Ice Candidate"})]
        );

        router.route(&c_sock, &msg("rtc-end-call", "c1", Value::Null)).await.unwrap();
        assert_eq!(
            frames(&mut c_rx),
            vec![json!({"status": 200, "msg": "Stream Ended!"})]
        );
        assert!(manager.inspect("R1").await.unwrap().consumers.is_empty());

        router.route(&c_sock, &msg("rtc-end-call", "c1", Value::Null)).await.unwrap();
        assert_eq!(
            frames(&mut c_rx),
            vec![json!({"status": 400, "msg": "Stream Ended!"})]
        );
    }

    #[tokio::test]
    async fn producer_leaving_notifies_room_before_ack() {
        let (manager, connector, registry) = manager_with(None);
        let router = router_for(&manager, &registry);
        let (p_sock, mut p_rx) = Transport::channel();
        let (c_sock, mut c_rx) = Transport::channel();
        router.route(&p_sock, &msg("join-room", "p1", Value::Null)).await.unwrap();
        router.route(&c_sock, &msg("join-room", "c1", Value::Null)).await.unwrap();

        start_stream(&manager, &connector, "R1").await;
        manager.add_consumer("c1", "R1", offer("c1")).await.unwrap();
        frames(&mut p_rx);
        let got = frames(&mut c_rx);
        assert_eq!(got[1]["topic"], topics::RTC_NEW_PRODUCER);

        router.route(&p_sock, &msg("leave-room", "p1", Value::Null)).await.unwrap();

        assert_eq!(
            frames(&mut c_rx),
            vec![json!({"topic": "rtc-disconnect-producer"})]
        );
        assert_eq!(
            frames(&mut p_rx),
            vec![json!({"status": 200, "msg": "Socket left room!"})]
        );
        assert!(!manager.room_has_producer("R1"));
        assert!(connector.peer("c1").is_closed());
    }

    #[tokio::test]
    async fn socket_close_cascades_into_media_cleanup() {
        let (manager, connector, registry) = manager_with(None);
        let router = router_for(&manager, &registry);
        let (p_sock, _p_rx) = Transport::channel();
        router.route(&p_sock, &msg("join-room", "p1", Value::Null)).await.unwrap();
        start_stream(&manager, &connector, "R1").await;

        router.disconnect(&p_sock).await;

        assert!(!manager.room_has_producer("R1"));
        assert_eq!(registry.room_count(), 0);
        assert!(connector.peer("p1").is_closed());
    }

    #[tokio::test]
    async fn plain_leave_without_media_is_quiet() {
        let (manager, _, registry) = manager_with(None);
        let router = router_for(&manager, &registry);
        let (sock, mut rx) = Transport::channel();
        router.route(&sock, &msg("join-room", "viewer", Value::Null)).await.unwrap();
        router.route(&sock, &msg("leave-room", "viewer", Value::Null)).await.unwrap();

        assert_eq!(
            frames(&mut rx),
            vec![
                json!({"status": 200, "msg": "Socket joined room!"}),
                json!({"status": 200, "msg": "Socket left room!"}),
            ]
        );
    }
}
