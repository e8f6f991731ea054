//! WebSocket handler for real-time updates

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use birdrec_core::Device;
use birdrec_device::DownloadProgress;
use birdrec_discovery::DiscoveryEvent;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use crate::orchestrator::SessionEvent;
use crate::scheduler::ScheduleEvent;
use crate::state::AppState;

/// WebSocket message types
#[derive(Serialize)]
#[serde(tag = "type", content = "data")]
enum WsMessage {
    #[serde(rename = "device_discovered")]
    DeviceDiscovered(Device),
    #[serde(rename = "device_lost")]
    DeviceLost { name: String },
    #[serde(rename = "scan_started")]
    ScanStarted,
    #[serde(rename = "scan_completed")]
    ScanCompleted { found: usize },
    #[serde(rename = "time_synced")]
    TimeSynced { name: String, ok: bool },
    #[serde(rename = "session")]
    Session(SessionEvent),
    #[serde(rename = "schedule")]
    Schedule(ScheduleEvent),
    #[serde(rename = "download_progress")]
    DownloadProgress(DownloadProgress),
    #[serde(rename = "pong")]
    Pong,
}

impl From<DiscoveryEvent> for WsMessage {
    fn from(event: DiscoveryEvent) -> Self {
        match event {
            DiscoveryEvent::DeviceDiscovered(device) => WsMessage::DeviceDiscovered(device),
            DiscoveryEvent::DeviceLost(name) => WsMessage::DeviceLost { name },
            DiscoveryEvent::ScanStarted => WsMessage::ScanStarted,
            DiscoveryEvent::ScanCompleted { found } => WsMessage::ScanCompleted { found },
            DiscoveryEvent::TimeSynced { name, ok } => WsMessage::TimeSynced { name, ok },
        }
    }
}

type Sender = SplitSink<WebSocket, Message>;

/// Send one message; false once the client is gone
async fn send(sender: &mut Sender, msg: &WsMessage) -> bool {
    match serde_json::to_string(msg) {
        Ok(json) => sender.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode WebSocket message");
            true
        }
    }
}

/// Unwrap a broadcast result; `None` means keep going without sending
fn received<T>(result: Result<T, RecvError>, channel: &str) -> Result<Option<T>, ()> {
    match result {
        Ok(event) => Ok(Some(event)),
        Err(RecvError::Lagged(n)) => {
            debug!(channel = channel, skipped = n, "Event channel lagged");
            Ok(None)
        }
        Err(RecvError::Closed) => {
            debug!(channel = channel, "Event channel closed");
            Err(())
        }
    }
}

/// WebSocket upgrade handler
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut discovery_events = state.scanner.subscribe();
    let mut session_events = state.orchestrator.subscribe();
    let mut schedule_events = state.scheduler.subscribe();
    let mut download_events = state.subscribe_downloads();

    info!("WebSocket client connected");

    // Send current device list on connect
    for device in state.registry.devices().await {
        if !send(&mut sender, &WsMessage::DeviceDiscovered(device)).await {
            return;
        }
    }

    loop {
        let msg = tokio::select! {
            event = discovery_events.recv() => match received(event, "discovery") {
                Ok(event) => event.map(WsMessage::from),
                Err(()) => break,
            },
            event = session_events.recv() => match received(event, "session") {
                Ok(event) => event.map(WsMessage::Session),
                Err(()) => break,
            },
            event = schedule_events.recv() => match received(event, "schedule") {
                Ok(event) => event.map(WsMessage::Schedule),
                Err(()) => break,
            },
            event = download_events.recv() => match received(event, "download") {
                Ok(event) => event.map(WsMessage::DownloadProgress),
                Err(()) => break,
            },

            // Handle incoming messages from client
            msg = receiver.next() => match msg {
                Some(Ok(Message::Ping(data))) => {
                    if sender.send(Message::Pong(data)).await.is_err() {
                        break;
                    }
                    None
                }
                // Handle ping/pong for keepalive
                Some(Ok(Message::Text(text))) if text.as_str() == "ping" => Some(WsMessage::Pong),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Err(e)) => {
                    warn!(error = %e, "WebSocket error");
                    break;
                }
                _ => None,
            },
        };

        if let Some(msg) = msg {
            if !send(&mut sender, &msg).await {
                break;
            }
        }
    }

    info!("WebSocket client disconnected");
}
