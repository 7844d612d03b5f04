//! Fan-out of accepted samples to connected viewers.
//!
//! ```text
//! broadcast(event)
//!     │
//!     ├──► [queue 1] ──► worker 1 ──► transport.send()
//!     │    (bounded, try_send)
//!     ├──► [queue 2] ──► worker 2 ──► transport.send()
//!     └──► [queue N] ──► worker N ──► transport.send()
//! ```
//!
//! The hub itself lives inside the ingestion actor and is never shared, so
//! register, unregister and broadcast are naturally serialized with store
//! writes. Broadcasting only enqueues: a slow viewer fills its own queue and
//! nobody else's.

use crate::config::ViewerSettings;
use crate::ingest::HubCommand;
use crate::models::{format_timestamp, SampleEvent, SampleSource, SampleView, SamplesMap};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub type ViewerId = Uuid;

/// Upper bound on a single transport send before it counts as failed.
const DELIVERY_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, thiserror::Error)]
pub enum DeliveryError {
    #[error("viewer queue is full")]
    QueueFull,
    #[error("viewer connection closed")]
    Closed,
    #[error("transport error: {0}")]
    Transport(String),
}

/// Delivery endpoint of one viewer (a WebSocket in production).
#[async_trait]
pub trait ViewerTransport: Send + 'static {
    async fn send(&mut self, message: &PushMessage) -> Result<(), DeliveryError>;

    /// Called once when the hub stops delivering to this viewer, so the
    /// remote end learns it was dropped.
    async fn close(&mut self) {}
}

pub struct Viewer {
    pub id: ViewerId,
    transport: Box<dyn ViewerTransport>,
}

impl Viewer {
    pub fn new<T: ViewerTransport>(transport: T) -> Self {
        Self::with_id(Uuid::new_v4(), transport)
    }

    pub fn with_id<T: ViewerTransport>(id: ViewerId, transport: T) -> Self {
        Self { id, transport: Box::new(transport) }
    }
}

/// Messages pushed to viewers, tagged by `type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PushMessage {
    /// full store snapshot sent once on join
    Init { sensors: SamplesMap },
    SensorUpdate { sensor: String, data: SampleView },
    SystemUpdate {
        key: String,
        value: String,
        description: String,
        timestamp: String,
    },
}

impl PushMessage {
    pub fn from_event(event: &SampleEvent) -> Self {
        match event.source {
            SampleSource::Sensor => PushMessage::SensorUpdate {
                sensor: event.key.clone(),
                data: event.view(),
            },
            SampleSource::Probe => PushMessage::SystemUpdate {
                key: event.key.clone(),
                value: event.value.clone(),
                description: event.description.clone(),
                timestamp: format_timestamp(event.timestamp),
            },
        }
    }

    pub fn to_json(&self) -> String {
        // only string keys and plain values, cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// Delivery state shared between the hub and a viewer's worker.
#[derive(Default)]
struct DeliveryState {
    failures: AtomicU32,
    removed: AtomicBool,
}

struct ViewerSlot {
    queue: mpsc::Sender<Arc<PushMessage>>,
    state: Arc<DeliveryState>,
}

pub struct FanoutHub {
    viewers: HashMap<ViewerId, ViewerSlot>,
    settings: ViewerSettings,
    control: mpsc::WeakSender<HubCommand>,
}

impl FanoutHub {
    pub(crate) fn new(settings: ViewerSettings, control: mpsc::WeakSender<HubCommand>) -> Self {
        Self {
            viewers: HashMap::new(),
            settings,
            control,
        }
    }

    /// Adds the viewer and queues the snapshot as its first message.
    pub(crate) fn register(&mut self, viewer: Viewer, snapshot: SamplesMap) -> ViewerId {
        let id = viewer.id;
        if self.viewers.contains_key(&id) {
            warn!("viewer {} registered twice, replacing previous connection", id);
            self.unregister(id);
        }

        let (tx, rx) = mpsc::channel(self.settings.queue_capacity.max(1));
        let state = Arc::new(DeliveryState::default());

        // fresh queue, capacity >= 1
        let _ = tx.try_send(Arc::new(PushMessage::Init { sensors: snapshot }));

        tokio::spawn(run_viewer_worker(
            id,
            viewer.transport,
            rx,
            state.clone(),
            self.settings.max_failures,
            self.control.clone(),
        ));

        self.viewers.insert(id, ViewerSlot { queue: tx, state });
        info!("viewer {} connected ({} total)", id, self.viewers.len());
        id
    }

    /// Idempotent.
    pub(crate) fn unregister(&mut self, id: ViewerId) -> bool {
        match self.viewers.remove(&id) {
            Some(slot) => {
                slot.state.removed.store(true, Ordering::Release);
                info!("viewer {} disconnected ({} left)", id, self.viewers.len());
                true
            }
            None => false,
        }
    }

    /// Drops every viewer; their workers close the transports.
    pub(crate) fn unregister_all(&mut self) -> usize {
        let ids: Vec<ViewerId> = self.viewers.keys().copied().collect();
        for id in &ids {
            self.unregister(*id);
        }
        ids.len()
    }

    /// Enqueues the event for every viewer without waiting on any of them.
    pub(crate) fn broadcast(&mut self, event: &SampleEvent) {
        if self.viewers.is_empty() {
            return;
        }
        let message = Arc::new(PushMessage::from_event(event));
        let max_failures = self.settings.max_failures;
        let mut dropped = Vec::new();

        for (id, slot) in &self.viewers {
            match slot.queue.try_send(message.clone()) {
                Ok(()) => {}
                Err(TrySendError::Full(_)) => {
                    let failures = slot.state.failures.fetch_add(1, Ordering::AcqRel) + 1;
                    warn!(
                        "viewer {}: {}, dropped {} ({}/{})",
                        id,
                        DeliveryError::QueueFull,
                        event.key,
                        failures,
                        max_failures
                    );
                    if failures >= max_failures {
                        dropped.push(*id);
                    }
                }
                Err(TrySendError::Closed(_)) => dropped.push(*id),
            }
        }

        for id in dropped {
            self.unregister(id);
        }
    }

    pub fn len(&self) -> usize {
        self.viewers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.viewers.is_empty()
    }
}

async fn run_viewer_worker(
    id: ViewerId,
    mut transport: Box<dyn ViewerTransport>,
    mut queue: mpsc::Receiver<Arc<PushMessage>>,
    state: Arc<DeliveryState>,
    max_failures: u32,
    control: mpsc::WeakSender<HubCommand>,
) {
    while let Some(message) = queue.recv().await {
        if state.removed.load(Ordering::Acquire) {
            break;
        }

        let result = match tokio::time::timeout(DELIVERY_TIMEOUT, transport.send(message.as_ref())).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Transport("send timed out".into())),
        };

        match result {
            Ok(()) => {
                state.failures.store(0, Ordering::Release);
            }
            Err(e) => {
                let failures = state.failures.fetch_add(1, Ordering::AcqRel) + 1;
                warn!("delivery to viewer {} failed: {} ({}/{})", id, e, failures, max_failures);
                if matches!(e, DeliveryError::Closed) || failures >= max_failures {
                    if let Some(control) = control.upgrade() {
                        let _ = control.send(HubCommand::Unregister(id)).await;
                    }
                    break;
                }
            }
        }
    }
    if tokio::time::timeout(DELIVERY_TIMEOUT, transport.close()).await.is_err() {
        debug!("viewer {} close timed out", id);
    }
    debug!("viewer {} worker stopped", id);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SampleSource;
    use time::OffsetDateTime;

    #[test]
    fn test_push_message_wire_format() {
        let sensor = SampleEvent {
            key: "temperature".into(),
            value: "23.5".into(),
            unit: Some("C".into()),
            description: "CPU".into(),
            timestamp: OffsetDateTime::UNIX_EPOCH,
            source: SampleSource::Sensor,
        };
        let json: serde_json::Value =
            serde_json::from_str(&PushMessage::from_event(&sensor).to_json()).unwrap();
        assert_eq!(json["type"], "sensor_update");
        assert_eq!(json["sensor"], "temperature");
        assert_eq!(json["data"]["value"], "23.5");
        assert_eq!(json["data"]["unit"], "C");

        let probe = SampleEvent {
            key: "uptime".into(),
            unit: None,
            source: SampleSource::Probe,
            ..sensor
        };
        let json = serde_json::to_value(PushMessage::from_event(&probe)).unwrap();
        assert_eq!(json["type"], "system_update");
        assert_eq!(json["key"], "uptime");
        assert_eq!(json["timestamp"], "1970-01-01T00:00:00Z");

        let json = serde_json::to_value(PushMessage::Init { sensors: SamplesMap::new() }).unwrap();
        assert_eq!(json["type"], "init");
        assert!(json["sensors"].as_object().unwrap().is_empty());
    }
}
