use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

// ─── Domain errors ──────────────────────────────────────────────────────────

/// Every failure the signaling core can report back to a caller.
///
/// All variants are recoverable at the request boundary: the WebSocket
/// layer turns them into a `{status: 400, msg}` ack, the REST layer into an
/// [`ApiError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SignalError {
    #[error("Participant '{participant}' is already in room '{room}'.")]
    AlreadyInRoom { room: String, participant: String },

    #[error("Participant '{participant}' is not in room '{room}'.")]
    NotInRoom { room: String, participant: String },

    #[error("Received non-join message without room, ignoring!")]
    MissingRoom,

    #[error("Malformed message: {0}")]
    MalformedMessage(String),

    #[error("Room '{room}' already has producer '{producer}'.")]
    AlreadyHasProducer { room: String, producer: String },

    #[error("No producer is streaming in room '{0}'.")]
    NoProducer(String),

    #[error("Consumer '{0}' is already in the room.")]
    DuplicateConsumer(String),

    #[error("Consumer '{0}' is not in the room.")]
    NotAConsumer(String),

    #[error("Room '{0}' has no active stream.")]
    NoRoom(String),

    #[error("Room '{0}' was closed while the request was pending.")]
    RoomClosed(String),

    #[error("Negotiation failed: {0}")]
    NegotiationFailed(String),
}

impl SignalError {
    /// Stable machine-readable code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::AlreadyInRoom { .. } => "already_in_room",
            Self::NotInRoom { .. } => "not_in_room",
            Self::MissingRoom => "missing_room",
            Self::MalformedMessage(_) => "malformed_message",
            Self::AlreadyHasProducer { .. } => "producer_exists",
            Self::NoProducer(_) => "no_producer",
            Self::DuplicateConsumer(_) => "duplicate_consumer",
            Self::NotAConsumer(_) => "not_a_consumer",
            Self::NoRoom(_) => "no_room",
            Self::RoomClosed(_) => "room_closed",
            Self::NegotiationFailed(_) => "negotiation_failed",
        }
    }

    pub(crate) fn negotiation(err: impl std::fmt::Display) -> Self {
        Self::NegotiationFailed(err.to_string())
    }
}

// ─── JSON envelope ──────────────────────────────────────────────────────────

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
    status: u16,
}

// ─── ApiError ───────────────────────────────────────────────────────────────

/// Structured REST error that serializes to JSON.
///
/// ```json
/// {
///   "error": {
///     "code": "producer_exists",
///     "message": "Room 'abc123' already has producer 'u1'.",
///     "status": 400
///   }
/// }
/// ```
#[derive(Debug)]
pub struct ApiError {
    pub code: &'static str,
    pub message: String,
    pub status: StatusCode,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        } else if self.status.is_client_error() {
            tracing::warn!(
                code = self.code,
                status = self.status.as_u16(),
                "{}",
                self.message
            );
        }

        let envelope = ErrorEnvelope {
            error: ErrorBody {
                code: self.code,
                message: self.message,
                status: self.status.as_u16(),
            },
        };

        (self.status, Json(envelope)).into_response()
    }
}

impl From<SignalError> for ApiError {
    fn from(err: SignalError) -> Self {
        let status = match err {
            SignalError::NegotiationFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::BAD_REQUEST,
        };
        Self {
            code: err.code(),
            message: err.to_string(),
            status,
        }
    }
}

impl ApiError {
    /// 400 Bad Request with a custom message.
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self {
            code: "bad_request",
            message: msg.into(),
            status: StatusCode::BAD_REQUEST,
        }
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_json(err: ApiError) -> serde_json::Value {
        let response = err.into_response();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn json_structure() {
        let err: ApiError = SignalError::AlreadyHasProducer {
            room: "abc123".into(),
            producer: "u1".into(),
        }
        .into();
        let value = body_json(err).await;

        assert_eq!(value["error"]["code"], "producer_exists");
        assert_eq!(
            value["error"]["message"],
            "Room 'abc123' already has producer 'u1'."
        );
        assert_eq!(value["error"]["status"], 400);
    }

    #[tokio::test]
    async fn negotiation_failure_is_server_error() {
        let err: ApiError = SignalError::negotiation("create_answer failed").into();
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);

        let response = err.into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn missing_room_message_matches_wire_text() {
        assert_eq!(
            SignalError::MissingRoom.to_string(),
            "Received non-join message without room, ignoring!"
        );
        assert_eq!(SignalError::MissingRoom.code(), "missing_room");
    }
}
