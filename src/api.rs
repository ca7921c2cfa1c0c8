use axum::{
    extract::{rejection::JsonRejection, State},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use crate::error::ApiError;
use crate::protocol::SessionDescription;
use crate::AppState;

// ---------------------------------------------------------------------------
// Request / Response DTOs
// ---------------------------------------------------------------------------

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdpRequest {
    pub sdp: SessionDescription,
    pub room_id: String,
    pub user_id: String,
}

#[derive(Serialize)]
pub struct SdpResponse {
    pub sdp: SessionDescription,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomRequest {
    pub room_id: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PollResponse {
    pub room_has_producer: bool,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TenancyResponse {
    pub tenant_ids: Vec<String>,
}

fn sdp_body(body: Result<Json<SdpRequest>, JsonRejection>) -> Result<SdpRequest, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    if req.room_id.is_empty() || req.user_id.is_empty() {
        return Err(ApiError::bad_request("roomId and userId are required"));
    }
    Ok(req)
}

fn room_body(body: Result<Json<RoomRequest>, JsonRejection>) -> Result<String, ApiError> {
    let Json(req) = body.map_err(|e| ApiError::bad_request(e.body_text()))?;
    Ok(req.room_id)
}

// ---------------------------------------------------------------------------
// POST /broadcast — become the room's producer
// ---------------------------------------------------------------------------

pub async fn broadcast(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SdpRequest>, JsonRejection>,
) -> Result<Json<SdpResponse>, ApiError> {
    let req = sdp_body(body)?;
    let sdp = state
        .signaling
        .sfu
        .add_producer(&req.user_id, &req.room_id, req.sdp)
        .await?;
    info!(room = %req.room_id, participant = %req.user_id, "broadcast started");
    Ok(Json(SdpResponse { sdp }))
}

// ---------------------------------------------------------------------------
// POST /subscribe — consume the room's producer stream
// ---------------------------------------------------------------------------

pub async fn subscribe(
    State(state): State<Arc<AppState>>,
    body: Result<Json<SdpRequest>, JsonRejection>,
) -> Result<Json<SdpResponse>, ApiError> {
    let req = sdp_body(body)?;
    let sdp = state
        .signaling
        .sfu
        .add_consumer(&req.user_id, &req.room_id, req.sdp)
        .await?;
    info!(room = %req.room_id, participant = %req.user_id, "subscribed");
    Ok(Json(SdpResponse { sdp }))
}

// ---------------------------------------------------------------------------
// PUT /poll — is anybody broadcasting?
// ---------------------------------------------------------------------------

pub async fn poll(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RoomRequest>, JsonRejection>,
) -> Result<Json<PollResponse>, ApiError> {
    let room = room_body(body)?;
    Ok(Json(PollResponse {
        room_has_producer: state.signaling.sfu.room_has_producer(&room),
    }))
}

// ---------------------------------------------------------------------------
// PUT /room — who is connected?
// ---------------------------------------------------------------------------

pub async fn room_tenancy(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RoomRequest>, JsonRejection>,
) -> Result<Json<TenancyResponse>, ApiError> {
    let room = room_body(body)?;
    let mut tenant_ids = state.signaling.registry.participant_ids(&room);
    tenant_ids.sort();
    Ok(Json(TenancyResponse { tenant_ids }))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
