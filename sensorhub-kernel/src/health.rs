use parking_lot::Mutex;
use serde::Serialize;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerStatus {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
}

#[derive(Debug, Serialize)]
pub struct KernelHealth {
    pub uptime_seconds: u64,
    pub samples_cached: usize,
    pub viewers_connected: usize,
    pub sensors_configured: usize,
    pub probes_configured: usize,
    pub memory_usage_mb: f32,
    pub broker_status: BrokerStatus,
    pub broker_reconnects: u32,
    pub probe_failures: u64,
}

/// Runtime counters shared by the bridge, the poller and the HTTP layer.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    broker_reconnects: Arc<AtomicU32>,
    broker_status: Arc<Mutex<BrokerStatus>>,
    probe_failures: Arc<AtomicU64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            broker_reconnects: Arc::new(AtomicU32::new(0)),
            broker_status: Arc::new(Mutex::new(BrokerStatus::Connecting)),
            probe_failures: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn mark_broker_connected(&self) {
        *self.broker_status.lock() = BrokerStatus::Connected;
    }

    pub fn mark_broker_disconnected(&self) {
        *self.broker_status.lock() = BrokerStatus::Disconnected;
    }

    pub fn increment_reconnects(&self) {
        self.broker_reconnects.fetch_add(1, Ordering::Relaxed);
        *self.broker_status.lock() = BrokerStatus::Reconnecting;
    }

    pub fn record_probe_failure(&self) {
        self.probe_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn broker_status(&self) -> BrokerStatus {
        *self.broker_status.lock()
    }

    pub fn probe_failures(&self) -> u64 {
        self.probe_failures.load(Ordering::Relaxed)
    }

    pub fn report(
        &self,
        samples_cached: usize,
        viewers_connected: usize,
        sensors_configured: usize,
        probes_configured: usize,
    ) -> KernelHealth {
        KernelHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            samples_cached,
            viewers_connected,
            sensors_configured,
            probes_configured,
            memory_usage_mb: memory_usage_mb(),
            broker_status: self.broker_status(),
            broker_reconnects: self.broker_reconnects.load(Ordering::Relaxed),
            probe_failures: self.probe_failures(),
        }
    }
}

/// Resident set size from /proc, 0 where unavailable.
fn memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            let rss_kb = status
                .lines()
                .find(|l| l.starts_with("VmRSS:"))
                .and_then(|l| l.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }
    0.0
}
