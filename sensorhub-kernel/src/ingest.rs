/**
 * INGESTION ACTOR - Single writer of the sample store
 *
 * ROLE :
 * Every producer (broker bridge, probe poller, static seeding) and every
 * viewer lifecycle event (join, leave, delivery failure) goes through one
 * channel consumed by one task. That task is the only place where the
 * sample store is written and where the viewer set changes.
 *
 * CONSEQUENCES :
 * - Per-key ordering guard is applied without extra locking
 * - A joining viewer gets the snapshot and then every later update, no gap
 *   and no duplicate, since both happen between two commands
 * - Broadcast only enqueues to per-viewer queues, ingestion never waits on
 *   a viewer
 */

use crate::config::ViewerSettings;
use crate::hub::{FanoutHub, Viewer, ViewerId};
use crate::models::SampleEvent;
use crate::store::{to_views, Applied, SampleStore};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Producers block on a full channel, viewers never do.
const INGEST_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("ingestion pipeline stopped")]
    Stopped,
}

pub enum HubCommand {
    Ingest(SampleEvent),
    Register {
        viewer: Viewer,
        ack: oneshot::Sender<ViewerId>,
    },
    Unregister(ViewerId),
    /// Shutdown: drop every viewer, reply with how many there were.
    DisconnectAll(oneshot::Sender<usize>),
    ViewerCount(oneshot::Sender<usize>),
}

/// Cloneable entry point into the ingestion actor.
#[derive(Clone)]
pub struct IngestHandle {
    tx: mpsc::Sender<HubCommand>,
}

impl IngestHandle {
    pub async fn ingest(&self, event: SampleEvent) -> Result<(), HubError> {
        self.tx
            .send(HubCommand::Ingest(event))
            .await
            .map_err(|_| HubError::Stopped)
    }

    /// Resolves once the viewer is registered and its snapshot is queued.
    pub async fn register(&self, viewer: Viewer) -> Result<ViewerId, HubError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(HubCommand::Register { viewer, ack })
            .await
            .map_err(|_| HubError::Stopped)?;
        done.await.map_err(|_| HubError::Stopped)
    }

    pub async fn unregister(&self, id: ViewerId) -> Result<(), HubError> {
        self.tx
            .send(HubCommand::Unregister(id))
            .await
            .map_err(|_| HubError::Stopped)
    }

    pub async fn disconnect_all(&self) -> Result<usize, HubError> {
        let (reply, count) = oneshot::channel();
        self.tx
            .send(HubCommand::DisconnectAll(reply))
            .await
            .map_err(|_| HubError::Stopped)?;
        count.await.map_err(|_| HubError::Stopped)
    }

    pub async fn viewer_count(&self) -> Result<usize, HubError> {
        let (reply, count) = oneshot::channel();
        self.tx
            .send(HubCommand::ViewerCount(reply))
            .await
            .map_err(|_| HubError::Stopped)?;
        count.await.map_err(|_| HubError::Stopped)
    }
}

struct Ingestor {
    store: SampleStore,
    hub: FanoutHub,
    commands: mpsc::Receiver<HubCommand>,
}

impl Ingestor {
    async fn run(mut self) {
        while let Some(command) = self.commands.recv().await {
            match command {
                HubCommand::Ingest(event) => self.ingest(event),
                HubCommand::Register { viewer, ack } => {
                    let snapshot = to_views(&self.store.snapshot());
                    let id = self.hub.register(viewer, snapshot);
                    let _ = ack.send(id);
                }
                HubCommand::Unregister(id) => {
                    self.hub.unregister(id);
                }
                HubCommand::DisconnectAll(reply) => {
                    let _ = reply.send(self.hub.unregister_all());
                }
                HubCommand::ViewerCount(reply) => {
                    let _ = reply.send(self.hub.len());
                }
            }
        }
        info!("ingestion stopped, {} samples cached", self.store.len());
    }

    fn ingest(&mut self, event: SampleEvent) {
        match self.store.apply(&event) {
            Applied::Accepted => {
                debug!("accepted {} = {:?}", event.key, event.value);
                self.hub.broadcast(&event);
            }
            Applied::Stale => {
                debug!("discarded out-of-order sample for {}", event.key);
            }
        }
    }
}

/// Starts the actor. It stops once every [`IngestHandle`] is dropped.
pub fn spawn_ingestor(store: SampleStore, settings: ViewerSettings) -> (IngestHandle, JoinHandle<()>) {
    let (tx, rx) = mpsc::channel(INGEST_CHANNEL_CAPACITY);
    let hub = FanoutHub::new(settings, tx.downgrade());
    let ingestor = Ingestor { store, hub, commands: rx };
    let task = tokio::spawn(ingestor.run());
    (IngestHandle { tx }, task)
}
