//! Periodic system-command probes.
//!
//! Handles:
//! - One tick per interval, late ticks skipped rather than bursted
//! - Probes run one after another, so a probe never overlaps itself
//! - Hard per-probe timeout, the whole process group is killed on expiry
//! - Failures become the sample value ("Error: ...") instead of stalling the tile

use crate::config::PollerSettings;
use crate::health::HealthTracker;
use crate::ingest::{HubError, IngestHandle};
use crate::models::{CommandProbe, ProbeKind, SampleEvent};
use std::process::Stdio;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::process::Command;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ProbeError {
    #[error("command timed out after {0:?}")]
    Timeout(Duration),
    #[error("{0}")]
    Spawn(#[from] std::io::Error),
    #[error("exit status {code}: {stderr}")]
    NonZeroExit { code: i32, stderr: String },
}

/// Runs `command` through `sh -c` and returns its trimmed stdout.
///
/// The command gets its own process group. Unless the shell exits on its
/// own, the whole group is killed: on timeout and when this future is
/// dropped mid-flight (poller shutdown).
pub async fn run_command(command: &str, timeout: Duration) -> Result<String, ProbeError> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(unix)]
    cmd.process_group(0);

    let child = cmd.spawn()?;
    let mut group = ProcessGroupGuard::new(child.id());

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(output) => {
            let output = output?;
            group.disarm();
            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            } else {
                Err(ProbeError::NonZeroExit {
                    code: output.status.code().unwrap_or(-1),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        }
        Err(_) => Err(ProbeError::Timeout(timeout)),
    }
}

/// SIGKILLs the probe's process group on drop unless the shell was reaped.
/// `kill_on_drop` alone only reaches `sh`, not what it spawned.
struct ProcessGroupGuard {
    pgid: Option<u32>,
}

impl ProcessGroupGuard {
    fn new(pgid: Option<u32>) -> Self {
        Self { pgid }
    }

    fn disarm(&mut self) {
        self.pgid = None;
    }
}

impl Drop for ProcessGroupGuard {
    fn drop(&mut self) {
        if let Some(pgid) = self.pgid.take() {
            kill_process_group(pgid);
        }
    }
}

#[cfg(unix)]
fn kill_process_group(pgid: u32) {
    use nix::sys::signal::{killpg, Signal};
    use nix::unistd::Pid;

    if let Err(e) = killpg(Pid::from_raw(pgid as i32), Signal::SIGKILL) {
        debug!("killpg({}) failed: {}", pgid, e);
    }
}

#[cfg(not(unix))]
fn kill_process_group(_pgid: u32) {}

/// Ingests every static data source once, stamped with the current time.
pub async fn seed_static_probes(probes: &[CommandProbe], ingest: &IngestHandle) -> Result<usize, HubError> {
    let mut seeded = 0;
    for probe in probes {
        if let ProbeKind::Static { value } = &probe.kind {
            ingest
                .ingest(SampleEvent::from_probe(probe, value.clone(), OffsetDateTime::now_utc()))
                .await?;
            seeded += 1;
        }
    }
    Ok(seeded)
}

pub struct ProbePoller {
    probes: Vec<CommandProbe>,
    settings: PollerSettings,
    ingest: IngestHandle,
    health: HealthTracker,
}

impl ProbePoller {
    /// Keeps only `system_command` probes, static ones are seeded elsewhere.
    pub fn new(
        probes: &[CommandProbe],
        settings: PollerSettings,
        ingest: IngestHandle,
        health: HealthTracker,
    ) -> Self {
        let probes = probes
            .iter()
            .filter(|p| matches!(p.kind, ProbeKind::Command { .. }))
            .cloned()
            .collect();
        Self { probes, settings, ingest, health }
    }

    pub fn probe_count(&self) -> usize {
        self.probes.len()
    }

    /// Runs one probe; never fails, errors are rendered into the value.
    pub async fn sample(&self, probe: &CommandProbe) -> SampleEvent {
        let value = match &probe.kind {
            ProbeKind::Command { command } => match run_command(command, self.settings.timeout).await {
                Ok(stdout) => stdout,
                Err(e) => {
                    warn!("probe {} failed: {}", probe.name, e);
                    self.health.record_probe_failure();
                    format!("Error: {e}")
                }
            },
            ProbeKind::Static { value } => value.clone(),
        };
        SampleEvent::from_probe(probe, value, OffsetDateTime::now_utc())
    }

    /// One pass over every probe, in configuration order.
    pub async fn tick(&self) -> Result<usize, HubError> {
        for probe in &self.probes {
            let event = self.sample(probe).await;
            self.ingest.ingest(event).await?;
        }
        debug!("probe tick done ({} probes)", self.probes.len());
        Ok(self.probes.len())
    }

    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        if self.probes.is_empty() {
            info!("no system_command probes configured, poller idle");
            return;
        }
        info!(
            "probe poller started: {} probes every {:?} (timeout {:?})",
            self.probes.len(),
            self.settings.interval,
            self.settings.timeout
        );

        let mut interval = tokio::time::interval(self.settings.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                _ = interval.tick() => {}
            }
            tokio::select! {
                _ = shutdown.changed() => break,
                res = self.tick() => {
                    if res.is_err() {
                        warn!("ingestion stopped, poller exiting");
                        break;
                    }
                }
            }
        }
        info!("probe poller stopped");
    }
}
