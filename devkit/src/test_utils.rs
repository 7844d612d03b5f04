/*!
Test harness for the sensorhub core

Runs the ingestion actor, seeds static data sources and exposes the broker
bridge entry point, all in-process:
- no broker, no HTTP listener
- publishes are injected as if the event loop delivered them
- the probe poller is built from the same resolved config
*/

use crate::fixtures::ConfigFixture;
use crate::viewer_stub::{RecordingViewer, ViewerLog};
use anyhow::Result;
use sensorhub_kernel::bridge::BrokerBridge;
use sensorhub_kernel::config::ResolvedConfig;
use sensorhub_kernel::health::HealthTracker;
use sensorhub_kernel::hub::{Viewer, ViewerId, ViewerTransport};
use sensorhub_kernel::ingest::{spawn_ingestor, IngestHandle};
use sensorhub_kernel::poller::{seed_static_probes, ProbePoller};
use sensorhub_kernel::store::SampleStore;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::task::JoinHandle;
use tracing_subscriber::EnvFilter;

const POLL_STEP: Duration = Duration::from_millis(20);

pub struct TestHarness {
    pub store: SampleStore,
    pub ingest: IngestHandle,
    pub health: HealthTracker,
    pub config: ResolvedConfig,
    bridge: BrokerBridge,
    _ingest_task: JoinHandle<()>,
}

impl TestHarness {
    pub async fn start(config: ResolvedConfig) -> Result<Self> {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init()
            .ok();

        let store = SampleStore::new();
        let health = HealthTracker::new();
        let (ingest, task) = spawn_ingestor(store.clone(), config.viewers);
        let seeded = seed_static_probes(&config.probes, &ingest).await?;
        tracing::debug!("harness seeded {} static sources", seeded);

        let bridge = BrokerBridge::new(&config.sensors, ingest.clone(), health.clone());
        Ok(Self {
            store,
            ingest,
            health,
            config,
            bridge,
            _ingest_task: task,
        })
    }

    pub async fn from_fixture(fixture: ConfigFixture) -> Result<Self> {
        Self::start(fixture.resolve()?).await
    }

    /// Inbound publish stamped with the current time.
    pub async fn publish(&self, topic: &str, payload: impl AsRef<[u8]>) -> Result<()> {
        self.bridge.on_message(topic, payload.as_ref()).await;
        self.sync().await
    }

    /// Inbound publish with an explicit observation time.
    pub async fn publish_at(&self, topic: &str, payload: impl AsRef<[u8]>, at: OffsetDateTime) -> Result<()> {
        if let Some(event) = self.bridge.resolve(topic, payload.as_ref(), at)? {
            self.ingest.ingest(event).await?;
        }
        self.sync().await
    }

    pub async fn connect<T: ViewerTransport>(&self, transport: T) -> Result<ViewerId> {
        Ok(self.ingest.register(Viewer::new(transport)).await?)
    }

    pub async fn connect_recording(&self) -> Result<(ViewerId, ViewerLog)> {
        let (viewer, log) = RecordingViewer::new();
        let id = self.connect(viewer).await?;
        Ok((id, log))
    }

    pub fn poller(&self) -> ProbePoller {
        ProbePoller::new(
            &self.config.probes,
            self.config.poller,
            self.ingest.clone(),
            self.health.clone(),
        )
    }

    /// Returns once every command queued before this call is processed.
    pub async fn sync(&self) -> Result<()> {
        self.ingest.viewer_count().await?;
        Ok(())
    }

    pub async fn viewer_count(&self) -> Result<usize> {
        Ok(self.ingest.viewer_count().await?)
    }

    pub async fn wait_for_viewers(&self, expected: usize, timeout_ms: u64) -> Result<bool> {
        let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
        while tokio::time::Instant::now() < deadline {
            if self.viewer_count().await? == expected {
                return Ok(true);
            }
            tokio::time::sleep(POLL_STEP).await;
        }
        Ok(self.viewer_count().await? == expected)
    }
}

/// Polls `condition` until it holds or `timeout_ms` elapses.
pub async fn wait_until<F: Fn() -> bool>(timeout_ms: u64, condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(POLL_STEP).await;
    }
    condition()
}
