use axum::{routing::{get, post, put}, Router};
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::api::{routes, websocket};
use crate::state::ServiceContext;

pub fn build_router(ctx: ServiceContext) -> Router {
    Router::new()
        // Session lifecycle
        .route("/api/v1/session", get(routes::session::get_session))
        .route("/api/v1/session/host", post(routes::session::start_host))
        .route("/api/v1/session/join", post(routes::session::join))
        .route("/api/v1/session/leave", post(routes::session::leave))
        // Local operator record
        .route("/api/v1/operator/status", put(routes::squad::set_status))
        .route("/api/v1/operator/position", put(routes::squad::set_position))
        .route("/api/v1/operator/battery", put(routes::squad::set_battery))
        // Markers
        .route("/api/v1/markers", post(routes::squad::create_marker))
        .route(
            "/api/v1/markers/:marker_id",
            put(routes::squad::move_marker).delete(routes::squad::delete_marker),
        )
        // Radio silence (host only)
        .route("/api/v1/silence", put(routes::squad::set_silence))
        // Transmission
        .route("/api/v1/voice/talk/hold", post(routes::voice::hold_talk))
        .route("/api/v1/voice/talk/release", post(routes::voice::release_talk))
        .route("/api/v1/voice/mode/toggle", post(routes::voice::toggle_mode))
        .route("/api/v1/voice/hardware", post(routes::voice::hardware_event))
        .route("/api/v1/voice/devices", get(routes::voice::list_devices))
        // WebSocket
        .route("/ws", get(websocket::ws_handler))
        // Middleware
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}

pub async fn start_api_server(ctx: ServiceContext, port: u16) -> std::io::Result<()> {
    let router = build_router(ctx);
    let addr = format!("127.0.0.1:{}", port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("API server listening on http://{}", addr);
    axum::serve(listener, router).await
}
