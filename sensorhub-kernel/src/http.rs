/**
 * HTTP SURFACE - REST reads and WebSocket viewers
 *
 * ROLE :
 * Read-only REST routes over the sample store, plus the `/ws` endpoint
 * through which dashboards join the fan-out hub.
 *
 * ROUTES :
 * - /health              liveness, plain "ok"
 * - /system/health       kernel counters (broker, viewers, probes)
 * - /api/sensor_data     broker samples keyed by sensor name
 * - /api/system_info     probe samples keyed by probe name
 * - /api/snapshot        whole store
 * - /ws                  push channel: init snapshot, then updates
 *
 * VIEWER LIFECYCLE :
 * - Upgrade → split socket → writer half registered as the viewer transport
 * - Reader half drained until close/error → unregister
 * - Hub drops the viewer (failures, shutdown) → writer sends Close, the
 *   reader sees the peer's reply and the session ends
 * - Inbound frames are ignored, the channel is push-only
 */

use crate::health::{HealthTracker, KernelHealth};
use crate::hub::{DeliveryError, PushMessage, Viewer, ViewerTransport};
use crate::ingest::IngestHandle;
use crate::models::{SampleSource, SamplesMap};
use crate::store::{to_views, SampleStore};
use async_trait::async_trait;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::{routing::get, Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct AppState {
    pub store: SampleStore,
    pub ingest: IngestHandle,
    pub health: HealthTracker,
    pub sensors_configured: usize,
    pub probes_configured: usize,
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/api/sensor_data", get(get_sensor_data))
        .route("/api/system_info", get(get_system_info))
        .route("/api/snapshot", get(get_snapshot))
        .route("/ws", get(ws_upgrade))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<KernelHealth> {
    let viewers = app.ingest.viewer_count().await.unwrap_or(0);
    Json(app.health.report(
        app.store.len(),
        viewers,
        app.sensors_configured,
        app.probes_configured,
    ))
}

// GET /api/sensor_data
async fn get_sensor_data(State(app): State<AppState>) -> Json<SamplesMap> {
    Json(to_views(&app.store.snapshot_by_source(SampleSource::Sensor)))
}

// GET /api/system_info
async fn get_system_info(State(app): State<AppState>) -> Json<SamplesMap> {
    Json(to_views(&app.store.snapshot_by_source(SampleSource::Probe)))
}

// GET /api/snapshot
async fn get_snapshot(State(app): State<AppState>) -> Json<SamplesMap> {
    Json(to_views(&app.store.snapshot()))
}

// GET /ws
async fn ws_upgrade(ws: WebSocketUpgrade, State(app): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| serve_viewer(socket, app.ingest))
}

/// Writer half of a viewer socket; one JSON text frame per message.
pub struct WsTransport {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl ViewerTransport for WsTransport {
    async fn send(&mut self, message: &PushMessage) -> Result<(), DeliveryError> {
        self.sink
            .send(Message::Text(message.to_json().into()))
            .await
            .map_err(|e| DeliveryError::Transport(e.to_string()))
    }

    async fn close(&mut self) {
        if let Err(e) = self.sink.close().await {
            debug!("closing viewer socket: {}", e);
        }
    }
}

async fn serve_viewer(socket: WebSocket, ingest: IngestHandle) {
    let (sink, mut stream) = socket.split();

    let id = match ingest.register(Viewer::new(WsTransport { sink })).await {
        Ok(id) => id,
        Err(e) => {
            warn!("rejecting viewer: {}", e);
            return;
        }
    };

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!("viewer {} read error: {}", id, e);
                break;
            }
        }
    }

    // no-op if the hub already dropped it
    let _ = ingest.unregister(id).await;
}
