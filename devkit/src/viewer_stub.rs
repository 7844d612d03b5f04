/*!
Viewer stubs for testing the fan-out hub without WebSockets

- `RecordingViewer` keeps every pushed message, readable through a `ViewerLog`,
  and notes when the hub closes it
- `FailingViewer` rejects sends, optionally after a few successful ones
- `StalledViewer` never completes a send, its queue fills up
*/

use async_trait::async_trait;
use parking_lot::Mutex;
use sensorhub_kernel::hub::{DeliveryError, PushMessage, ViewerTransport};
use sensorhub_kernel::models::SamplesMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared view on what a [`RecordingViewer`] received.
#[derive(Clone, Default)]
pub struct ViewerLog {
    messages: Arc<Mutex<Vec<PushMessage>>>,
    closed: Arc<AtomicBool>,
}

impl ViewerLog {
    pub fn messages(&self) -> Vec<PushMessage> {
        self.messages.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Whether the hub has stopped delivering and closed the transport.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn init_count(&self) -> usize {
        self.messages
            .lock()
            .iter()
            .filter(|m| matches!(m, PushMessage::Init { .. }))
            .count()
    }

    /// Snapshot carried by the first `init` message.
    pub fn snapshot(&self) -> Option<SamplesMap> {
        self.messages.lock().iter().find_map(|m| match m {
            PushMessage::Init { sensors } => Some(sensors.clone()),
            _ => None,
        })
    }

    /// Values pushed as updates for `key`, in arrival order.
    pub fn updates_for(&self, key: &str) -> Vec<String> {
        self.messages
            .lock()
            .iter()
            .filter_map(|m| match m {
                PushMessage::SensorUpdate { sensor, data } if sensor == key => Some(data.value.clone()),
                PushMessage::SystemUpdate { key: k, value, .. } if k == key => Some(value.clone()),
                _ => None,
            })
            .collect()
    }
}

pub struct RecordingViewer {
    log: ViewerLog,
}

impl RecordingViewer {
    pub fn new() -> (Self, ViewerLog) {
        let log = ViewerLog::default();
        (Self { log: log.clone() }, log)
    }
}

#[async_trait]
impl ViewerTransport for RecordingViewer {
    async fn send(&mut self, message: &PushMessage) -> Result<(), DeliveryError> {
        self.log.messages.lock().push(message.clone());
        Ok(())
    }

    async fn close(&mut self) {
        self.log.closed.store(true, Ordering::SeqCst);
    }
}

pub struct FailingViewer {
    ok_sends: usize,
    attempts: Arc<AtomicUsize>,
}

impl FailingViewer {
    /// Fails from the very first message (the init snapshot).
    pub fn new() -> (Self, Arc<AtomicUsize>) {
        Self::after(0)
    }

    /// Accepts `ok_sends` messages, then fails every send.
    pub fn after(ok_sends: usize) -> (Self, Arc<AtomicUsize>) {
        let attempts = Arc::new(AtomicUsize::new(0));
        (Self { ok_sends, attempts: attempts.clone() }, attempts)
    }
}

#[async_trait]
impl ViewerTransport for FailingViewer {
    async fn send(&mut self, _message: &PushMessage) -> Result<(), DeliveryError> {
        let attempt = self.attempts.fetch_add(1, Ordering::SeqCst);
        if attempt < self.ok_sends {
            Ok(())
        } else {
            Err(DeliveryError::Transport("simulated failure".into()))
        }
    }
}

pub struct StalledViewer;

#[async_trait]
impl ViewerTransport for StalledViewer {
    async fn send(&mut self, _message: &PushMessage) -> Result<(), DeliveryError> {
        std::future::pending::<()>().await;
        Ok(())
    }
}
