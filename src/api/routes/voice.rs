use axum::{extract::State, Json};

use crate::api::{error_response, ApiError};
use crate::services;
use crate::session::TransmitState;
use crate::state::ServiceContext;
use crate::voice::focus::HardwareEvent;

pub async fn hold_talk(State(ctx): State<ServiceContext>) -> Result<Json<TransmitState>, ApiError> {
    services::voice::hold_talk(&ctx).await.map(Json).map_err(error_response)
}

pub async fn release_talk(State(ctx): State<ServiceContext>) -> Result<Json<TransmitState>, ApiError> {
    services::voice::release_talk(&ctx).await.map(Json).map_err(error_response)
}

pub async fn toggle_mode(State(ctx): State<ServiceContext>) -> Result<Json<TransmitState>, ApiError> {
    services::voice::toggle_mode(&ctx).await.map(Json).map_err(error_response)
}

/// Headset and focus notifications from a platform bridge.
pub async fn hardware_event(
    State(ctx): State<ServiceContext>,
    Json(event): Json<HardwareEvent>,
) -> Result<Json<serde_json::Value>, ApiError> {
    services::voice::hardware_event(&ctx, event)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(error_response)
}

pub async fn list_devices() -> Json<serde_json::Value> {
    let devices = services::voice::list_devices();
    Json(serde_json::json!({ "devices": devices }))
}
