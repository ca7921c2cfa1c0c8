use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::SignalError;
use crate::protocol::{topics, Ack, Frame, InboundMessage};
use crate::registry::{SocketRegistry, Transport};

// ─── Handler table ──────────────────────────────────────────────────────────

/// Arguments handed to a topic handler.
#[derive(Debug, Clone)]
pub struct HandlerContext {
    pub socket: Transport,
    pub room: String,
    pub payload: Value,
    pub participant_id: String,
}

pub type TopicHandler = Arc<dyn Fn(HandlerContext) -> BoxFuture<'static, ()> + Send + Sync>;

/// Topic -> handler mapping, built once while the service is constructed
/// and read-only once handed to [`RoomRouter::new`].
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, TopicHandler>,
    pre_leave: Option<TopicHandler>,
}

fn boxed<F, Fut>(handler: F) -> TopicHandler
where
    F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |ctx| Box::pin(handler(ctx)))
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` for `topic`. The last registration wins.
    ///
    /// `join-room` and `leave-room` are consumed by the router itself and
    /// cannot be overridden.
    pub fn on<F, Fut>(&mut self, topic: &str, handler: F) -> &mut Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if topic == topics::JOIN_ROOM || topic == topics::LEAVE_ROOM {
            warn!(topic, "ignoring handler for router-owned topic");
            return self;
        }
        if self.handlers.insert(topic.to_string(), boxed(handler)).is_some() {
            debug!(topic, "replaced topic handler");
        }
        self
    }

    /// Hook run by `leave` before the transport entry disappears.
    pub fn on_pre_leave<F, Fut>(&mut self, handler: F) -> &mut Self
    where
        F: Fn(HandlerContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.pre_leave = Some(boxed(handler));
        self
    }

    pub fn get(&self, topic: &str) -> Option<&TopicHandler> {
        self.handlers.get(topic)
    }

    pub fn topics(&self) -> Vec<&str> {
        self.handlers.keys().map(String::as_str).collect()
    }
}

// ─── RoomRouter ─────────────────────────────────────────────────────────────

/// Multiplexes every application message by room.
///
/// Control topics mutate the [`SocketRegistry`]; topics with a handler are
/// dispatched to it; anything else is rebroadcast to the rest of the room.
pub struct RoomRouter {
    registry: Arc<SocketRegistry>,
    handlers: HandlerTable,
}

impl RoomRouter {
    pub fn new(registry: Arc<SocketRegistry>, handlers: HandlerTable) -> Self {
        info!(topics = ?handlers.topics(), "room router ready");
        Self { registry, handlers }
    }

    #[cfg(test)]
    pub fn registry(&self) -> &Arc<SocketRegistry> {
        &self.registry
    }

    pub fn join(
        &self,
        room: &str,
        participant: &str,
        socket: &Transport,
    ) -> Result<(), SignalError> {
        let result = self.registry.join(room, participant, socket.clone());
        match &result {
            Ok(()) => {
                info!(room, participant, "socket joined room");
                socket.ack(Ack::ok("Socket joined room!"));
            }
            Err(e) => {
                warn!(room, participant, "join rejected: {e}");
                socket.ack(Ack::error("Socket already in room!"));
            }
        }
        result
    }

    /// Run the pre-leave hook, then drop the `(room, participant)` entry.
    pub async fn leave(&self, room: &str, participant: &str) -> Result<Transport, SignalError> {
        let Some(socket) = self.registry.get(room, participant) else {
            return Err(SignalError::NotInRoom {
                room: room.to_string(),
                participant: participant.to_string(),
            });
        };

        if let Some(hook) = &self.handlers.pre_leave {
            hook(HandlerContext {
                socket: socket.clone(),
                room: room.to_string(),
                payload: Value::Null,
                participant_id: participant.to_string(),
            })
            .await;
        }

        let removed = self.registry.leave(room, participant)?;
        info!(room, participant, "socket left room");
        Ok(removed)
    }

    /// Handle one raw frame from `socket`. Errors are acked to the sender
    /// and returned.
    pub async fn route(&self, socket: &Transport, raw: &str) -> Result<(), SignalError> {
        let result = self.dispatch(socket, raw).await;
        if let Err(e) = &result {
            match e {
                // join/leave already acked
                SignalError::AlreadyInRoom { .. } => {}
                SignalError::NotInRoom { .. } => {
                    socket.ack(Ack::error("Socket already is not in room!"));
                }
                other => {
                    socket.ack(Ack::error(other.to_string()));
                }
            }
        }
        result
    }

    async fn dispatch(&self, socket: &Transport, raw: &str) -> Result<(), SignalError> {
        let InboundMessage {
            topic,
            room,
            payload,
            id,
        } = InboundMessage::decode(raw)?;

        let Some(room) = room else {
            warn!(%topic, participant = %id, "message without room rejected");
            return Err(SignalError::MissingRoom);
        };

        match topic.as_str() {
            topics::JOIN_ROOM => self.join(&room, &id, socket),
            topics::LEAVE_ROOM => {
                self.leave(&room, &id).await?;
                socket.ack(Ack::ok("Socket left room!"));
                Ok(())
            }
            _ => {
                if let Some(handler) = self.handlers.get(&topic) {
                    debug!(%room, %topic, participant = %id, "dispatching to handler");
                    handler(HandlerContext {
                        socket: socket.clone(),
                        room,
                        payload,
                        participant_id: id,
                    })
                    .await;
                } else {
                    let delivered = self.registry.broadcast(
                        &room,
                        &Frame::new(topic.clone(), payload),
                        Some(socket.conn_id()),
                    );
                    debug!(%room, %topic, delivered, "broadcast");
                }
                Ok(())
            }
        }
    }

    /// The connection behind `socket` closed: leave every room it holds.
    pub async fn disconnect(&self, socket: &Transport) {
        for (room, participant) in self.registry.memberships(socket.conn_id()) {
            if let Err(e) = self.leave(&room, &participant).await {
                debug!(%room, %participant, "leave on disconnect: {e}");
            }
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
