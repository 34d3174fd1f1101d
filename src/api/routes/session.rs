use axum::{extract::State, Json};
use serde::Deserialize;

use crate::api::{error_response, ApiError};
use crate::services;
use crate::session::SessionSnapshot;
use crate::state::ServiceContext;

#[derive(Deserialize)]
pub struct HostRequest {
    #[serde(default)]
    pub callsign: String,
}

#[derive(Deserialize)]
pub struct JoinRequest {
    #[serde(default)]
    pub callsign: String,
    pub session_id: String,
}

pub async fn get_session(State(ctx): State<ServiceContext>) -> Json<SessionSnapshot> {
    Json(services::session::snapshot(&ctx))
}

pub async fn start_host(
    State(ctx): State<ServiceContext>,
    Json(body): Json<HostRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    services::session::start_host(&ctx, &body.callsign)
        .await
        .map(|session_id| Json(serde_json::json!({ "session_id": session_id })))
        .map_err(error_response)
}

pub async fn join(
    State(ctx): State<ServiceContext>,
    Json(body): Json<JoinRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    services::session::join(&ctx, &body.callsign, &body.session_id)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(error_response)
}

pub async fn leave(State(ctx): State<ServiceContext>) -> Result<Json<serde_json::Value>, ApiError> {
    services::session::leave(&ctx)
        .await
        .map(|_| Json(serde_json::json!({"ok": true})))
        .map_err(error_response)
}
