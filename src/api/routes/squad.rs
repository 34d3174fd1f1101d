use axum::{
    extract::{Path, State},
    Json,
};
use serde::Deserialize;

use crate::api::{error_response, ApiError};
use crate::models::{Marker, MarkerPosition, OperatorStatus, Position};
use crate::services;
use crate::state::ServiceContext;

#[derive(Deserialize)]
pub struct SetStatusRequest {
    pub status: OperatorStatus,
}

#[derive(Deserialize)]
pub struct SetBatteryRequest {
    pub percent: u8,
}

#[derive(Deserialize)]
pub struct CreateMarkerRequest {
    pub position: MarkerPosition,
    #[serde(default)]
    pub label: String,
}

#[derive(Deserialize)]
pub struct MoveMarkerRequest {
    pub position: MarkerPosition,
}

#[derive(Deserialize)]
pub struct SetSilenceRequest {
    pub silenced: bool,
}

fn ok() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true}))
}

pub async fn set_status(
    State(ctx): State<ServiceContext>,
    Json(body): Json<SetStatusRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    services::squad::set_status(&ctx, body.status)
        .await
        .map(|_| ok())
        .map_err(error_response)
}

pub async fn set_position(
    State(ctx): State<ServiceContext>,
    Json(body): Json<Position>,
) -> Result<Json<serde_json::Value>, ApiError> {
    services::squad::set_position(&ctx, body)
        .await
        .map(|_| ok())
        .map_err(error_response)
}

pub async fn set_battery(
    State(ctx): State<ServiceContext>,
    Json(body): Json<SetBatteryRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    services::squad::set_battery(&ctx, body.percent)
        .await
        .map(|_| ok())
        .map_err(error_response)
}

pub async fn create_marker(
    State(ctx): State<ServiceContext>,
    Json(body): Json<CreateMarkerRequest>,
) -> Result<Json<Marker>, ApiError> {
    services::squad::create_marker(&ctx, body.position, &body.label)
        .await
        .map(Json)
        .map_err(error_response)
}

pub async fn move_marker(
    State(ctx): State<ServiceContext>,
    Path(marker_id): Path<String>,
    Json(body): Json<MoveMarkerRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    services::squad::move_marker(&ctx, &marker_id, body.position)
        .await
        .map(|_| ok())
        .map_err(error_response)
}

pub async fn delete_marker(
    State(ctx): State<ServiceContext>,
    Path(marker_id): Path<String>,
) -> Result<Json<serde_json::Value>, ApiError> {
    services::squad::delete_marker(&ctx, &marker_id)
        .await
        .map(|_| ok())
        .map_err(error_response)
}

pub async fn set_silence(
    State(ctx): State<ServiceContext>,
    Json(body): Json<SetSilenceRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    services::squad::set_silence(&ctx, body.silenced)
        .await
        .map(|_| ok())
        .map_err(error_response)
}
