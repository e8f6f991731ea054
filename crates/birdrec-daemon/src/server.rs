//! Web server setup and routing

use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::info;

use crate::api;
use crate::state::AppState;
use crate::ws;

/// Build the control API router
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        // Devices
        .route("/api/devices", get(api::list_devices))
        .route("/api/scan", post(api::trigger_scan))
        .route("/api/devices/{name}", get(api::get_device))
        .route("/api/devices/{name}/select", post(api::select_device))
        .route("/api/devices/{name}/start", post(api::start_device))
        .route("/api/devices/{name}/stop", post(api::stop_device))
        .route("/api/devices/{name}/reset", post(api::reset_device))
        .route("/api/devices/{name}/sync", post(api::sync_device))
        .route("/api/devices/{name}/firmware", post(api::upload_firmware))
        // Files on a device
        .route("/api/devices/{name}/files", get(api::list_files))
        .route("/api/devices/{name}/files/download", post(api::download_all))
        .route("/api/devices/{name}/files/{file}", delete(api::delete_file))
        .route(
            "/api/devices/{name}/files/{file}/download",
            post(api::download_file),
        )
        .route(
            "/api/devices/{name}/files/{file}/rename",
            post(api::rename_file),
        )
        // Recording session
        .route("/api/recording", get(api::get_recording))
        .route("/api/recording/start", post(api::start_recording))
        .route("/api/recording/stop", post(api::stop_recording))
        // Schedule
        .route(
            "/api/schedule",
            get(api::list_schedule).post(api::add_schedule),
        )
        .route("/api/schedule/{index}", delete(api::remove_schedule))
        .route("/api/analyze", post(api::analyze))
        .route("/api/config", get(api::get_config))
        // WebSocket for real-time updates
        .route("/ws", get(ws::websocket_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Run background loops and serve the API until `cancel` fires
pub async fn run(state: Arc<AppState>, bind: &str, cancel: CancellationToken) -> Result<()> {
    state.spawn_background(&cancel);

    let app = router(state);
    let listener = tokio::net::TcpListener::bind(bind).await?;
    info!(address = %bind, protocol = "HTTP", "Starting control API");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;

    info!("Control API stopped");
    Ok(())
}
