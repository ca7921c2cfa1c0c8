// Wire format shared by the WebSocket router and the REST boundary.
//
//   client -> server   { "topic", "room"?, "payload"?, "id" }
//   server -> client   { "status", "msg" }            control acks
//                      { "topic", "payload" }         broadcasts / events
//
// Outbound frames never carry `room` or `id`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::SignalError;

// ─── Reserved topics ────────────────────────────────────────────────────────

pub mod topics {
    /// Register the sending socket in a room.
    pub const JOIN_ROOM: &str = "join-room";
    /// Remove the sending socket from a room (runs the pre-leave hook first).
    pub const LEAVE_ROOM: &str = "leave-room";
    /// A participant ends its producer or consumer session.
    pub const RTC_END_CALL: &str = "rtc-end-call";
    /// Server -> room: a producer stream is available, consumers may subscribe.
    pub const RTC_NEW_PRODUCER: &str = "rtc-new-producer";
    /// Server -> room: the producer went away.
    pub const RTC_DISCONNECT_PRODUCER: &str = "rtc-disconnect-producer";
    /// Client -> server: trickled ICE candidate for the sender's peer.
    pub const ICE_CANDIDATE: &str = "ice-candidate";
    /// Server -> client: ICE candidate gathered by the server-side peer.
    pub const NEW_ICE_CANDIDATE: &str = "new-ice-candidate";
}

// ─── Status codes ───────────────────────────────────────────────────────────

pub const STATUS_SUCCESS: u16 = 200;
pub const STATUS_ERROR: u16 = 400;

// ─── Inbound ────────────────────────────────────────────────────────────────

/// A message received from a client socket.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundMessage {
    pub topic: String,
    #[serde(default)]
    pub room: Option<String>,
    #[serde(default)]
    pub payload: Value,
    /// Participant id of the sender.
    pub id: String,
}

impl InboundMessage {
    pub fn decode(raw: &str) -> Result<Self, SignalError> {
        serde_json::from_str(raw).map_err(|e| SignalError::MalformedMessage(e.to_string()))
    }
}

// ─── Outbound ───────────────────────────────────────────────────────────────

/// Point-to-point control acknowledgement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ack {
    pub status: u16,
    pub msg: String,
}

impl Ack {
    pub fn ok(msg: impl Into<String>) -> Self {
        Self {
            status: STATUS_SUCCESS,
            msg: msg.into(),
        }
    }

    pub fn error(msg: impl Into<String>) -> Self {
        Self {
            status: STATUS_ERROR,
            msg: msg.into(),
        }
    }

    pub fn from_result<T>(result: &Result<T, SignalError>, msg: &str) -> Self {
        match result {
            Ok(_) => Self::ok(msg),
            Err(_) => Self::error(msg),
        }
    }
}

/// Broadcast or forwarded event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub topic: String,
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub payload: Value,
}

impl Frame {
    pub fn new(topic: impl Into<String>, payload: Value) -> Self {
        Self {
            topic: topic.into(),
            payload,
        }
    }

    pub fn bare(topic: impl Into<String>) -> Self {
        Self::new(topic, Value::Null)
    }
}

/// Serialize an outbound value. Our outbound types cannot fail to encode.
pub fn encode<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|e| {
        tracing::error!("failed to encode outbound frame: {e}");
        String::from("{}")
    })
}

// ─── Session descriptions / ICE ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Pranswer,
    Answer,
    Rollback,
}

/// Browser-shaped `RTCSessionDescriptionInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[cfg(test)]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Browser-shaped `RTCIceCandidateInit`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(
        rename = "sdpMLineIndex",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub sdp_mline_index: Option<u16>,
    #[serde(
        rename = "usernameFragment",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub username_fragment: Option<String>,
}

/// Payload of both `ice-candidate` and `new-ice-candidate`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CandidatePayload {
    pub candidate: IceCandidate,
}

// ─── Tests ──────────────────────────────────────────────────────────────────
