use dashmap::DashMap;
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

use crate::error::SignalError;
use crate::protocol::{encode, Ack, Frame};

// ---------------------------------------------------------------------------
// Transport
// ---------------------------------------------------------------------------

/// Outbound half of one client connection.
///
/// The registry only references transports; the connection task that owns
/// the receiving end is responsible for closing the actual socket.
#[derive(Debug, Clone)]
pub struct Transport {
    conn_id: Uuid,
    tx: mpsc::UnboundedSender<String>,
}

impl Transport {
    /// Create a transport and the queue its writer task drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                conn_id: Uuid::new_v4(),
                tx,
            },
            rx,
        )
    }

    pub fn conn_id(&self) -> Uuid {
        self.conn_id
    }

    /// Enqueue a raw text frame. Returns `false` once the connection is gone.
    pub fn send(&self, text: String) -> bool {
        self.tx.send(text).is_ok()
    }

    pub fn send_json<T: Serialize>(&self, value: &T) -> bool {
        self.send(encode(value))
    }

    pub fn ack(&self, ack: Ack) -> bool {
        self.send_json(&ack)
    }

}

impl PartialEq for Transport {
    fn eq(&self, other: &Self) -> bool {
        self.conn_id == other.conn_id
    }
}

impl Eq for Transport {}

// ---------------------------------------------------------------------------
// SocketRegistry
// ---------------------------------------------------------------------------

/// `room -> participant -> transport` bookkeeping.
///
/// Each room lives in its own map entry so unrelated rooms only contend on
/// a shard, never on a global lock. A room entry is created on first join
/// and removed when its last member leaves.
#[derive(Default)]
pub struct SocketRegistry {
    rooms: DashMap<String, HashMap<String, Transport>>,
}

impl SocketRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(
        &self,
        room: &str,
        participant: &str,
        transport: Transport,
    ) -> Result<(), SignalError> {
        let mut members = self.rooms.entry(room.to_string()).or_default();
        if members.contains_key(participant) {
            return Err(SignalError::AlreadyInRoom {
                room: room.to_string(),
                participant: participant.to_string(),
            });
        }
        members.insert(participant.to_string(), transport);
        debug!(room, participant, members = members.len(), "joined room");
        Ok(())
    }

    pub fn leave(&self, room: &str, participant: &str) -> Result<Transport, SignalError> {
        let not_in_room = || SignalError::NotInRoom {
            room: room.to_string(),
            participant: participant.to_string(),
        };

        let removed = {
            let mut members = self.rooms.get_mut(room).ok_or_else(not_in_room)?;
            members.remove(participant).ok_or_else(not_in_room)?
        };
        self.rooms.remove_if(room, |_, members| members.is_empty());
        debug!(room, participant, "left room");
        Ok(removed)
    }

    #[cfg(test)]
    pub fn contains(&self, room: &str, participant: &str) -> bool {
        self.rooms
            .get(room)
            .map(|members| members.contains_key(participant))
            .unwrap_or(false)
    }

    pub fn get(&self, room: &str, participant: &str) -> Option<Transport> {
        self.rooms
            .get(room)
            .and_then(|members| members.get(participant).cloned())
    }

    /// Snapshot of a room's members. Empty for unknown rooms.
    pub fn members(&self, room: &str) -> Vec<(String, Transport)> {
        self.rooms
            .get(room)
            .map(|members| {
                members
                    .iter()
                    .map(|(id, t)| (id.clone(), t.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn participant_ids(&self, room: &str) -> Vec<String> {
        self.rooms
            .get(room)
            .map(|members| members.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Every `(room, participant)` pair held by one connection.
    pub fn memberships(&self, conn_id: Uuid) -> Vec<(String, String)> {
        self.rooms
            .iter()
            .flat_map(|entry| {
                let room = entry.key().clone();
                entry
                    .value()
                    .iter()
                    .filter(|(_, t)| t.conn_id == conn_id)
                    .map(|(id, _)| (room.clone(), id.clone()))
                    .collect::<Vec<_>>()
            })
            .collect()
    }

    /// Send `frame` to every socket in `room` except the one with
    /// `except_conn`. Returns how many sockets accepted the frame.
    pub fn broadcast(&self, room: &str, frame: &Frame, except_conn: Option<Uuid>) -> usize {
        let Some(members) = self.rooms.get(room) else {
            debug!(room, topic = %frame.topic, "broadcast to unknown room dropped");
            return 0;
        };
        let text = encode(frame);
        members
            .values()
            .filter(|t| Some(t.conn_id) != except_conn)
            .filter(|t| t.send(text.clone()))
            .count()
    }

    /// Send `frame` to every member except `except_participant`.
    pub fn notify_others(&self, room: &str, except_participant: &str, frame: &Frame) -> usize {
        let text = encode(frame);
        self.members(room)
            .into_iter()
            .filter(|(id, _)| id != except_participant)
            .filter(|(_, t)| t.send(text.clone()))
            .count()
    }

    /// Point-to-point send. Returns `false` when the participant has no socket.
    pub fn send_to(&self, room: &str, participant: &str, frame: &Frame) -> bool {
        match self.get(room, participant) {
            Some(t) => t.send_json(frame),
            None => false,
        }
    }

    pub fn room_count(&self) -> usize {
        self.rooms.len()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
