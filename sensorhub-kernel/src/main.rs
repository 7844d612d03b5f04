/**
 * SENSORHUB KERNEL - Entry point
 *
 * ROLE : Loads the configuration, starts the ingestion actor, the broker
 * bridge and the probe poller, then serves REST + WebSocket until Ctrl-C or
 * SIGTERM.
 *
 * SHUTDOWN : one watch channel; HTTP drains, the bridge disconnects from the
 * broker, the poller exits its loop. Both tasks are awaited before return.
 */

use anyhow::{Context, Result};
use sensorhub_kernel::bridge::BrokerBridge;
use sensorhub_kernel::config::{config_path, load_config, resolve};
use sensorhub_kernel::health::HealthTracker;
use sensorhub_kernel::http::{build_router, AppState};
use sensorhub_kernel::ingest::spawn_ingestor;
use sensorhub_kernel::poller::{seed_static_probes, ProbePoller};
use sensorhub_kernel::store::SampleStore;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const INGEST_DRAIN: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sensorhub_kernel=info")),
        )
        .init();

    let path = config_path();
    let raw = load_config(&path)
        .await
        .with_context(|| format!("Failed to load config from {path}"))?;
    let cfg = resolve(&raw).context("Invalid configuration")?;
    info!(
        "[kernel] {} sensors, {} probes configured",
        cfg.sensors.len(),
        cfg.probes.len()
    );

    let store = SampleStore::new();
    let health = HealthTracker::new();
    let (ingest, ingest_task) = spawn_ingestor(store.clone(), cfg.viewers);

    let seeded = seed_static_probes(&cfg.probes, &ingest)
        .await
        .context("Failed to seed static data sources")?;
    info!("[kernel] seeded {} static data sources", seeded);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let bridge = BrokerBridge::new(&cfg.sensors, ingest.clone(), health.clone());
    let bridge_task = tokio::spawn(bridge.run(cfg.broker.clone(), shutdown_rx.clone()));

    let poller = ProbePoller::new(&cfg.probes, cfg.poller, ingest.clone(), health.clone());
    let poller_task = tokio::spawn(poller.run(shutdown_rx.clone()));

    let app = build_router(AppState {
        store,
        ingest: ingest.clone(),
        health,
        sensors_configured: cfg.sensors.len(),
        probes_configured: cfg.probes.len(),
    });

    let addr = format!("{}:{}", cfg.server.host, cfg.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("[kernel] listening on http://{addr}");

    let mut http_shutdown = shutdown_rx.clone();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        let _ = http_shutdown.changed().await;
    });
    let server_task = tokio::spawn(async move { server.await });

    shutdown_signal().await;
    info!("[kernel] shutting down");
    let _ = shutdown_tx.send(true);
    // graceful shutdown waits on upgraded sockets too
    match ingest.disconnect_all().await {
        Ok(n) => info!("[kernel] closed {} viewer connection(s)", n),
        Err(e) => warn!("[kernel] could not close viewers: {}", e),
    }

    if let Err(e) = bridge_task.await {
        warn!("[kernel] broker bridge task failed: {}", e);
    }
    if let Err(e) = poller_task.await {
        warn!("[kernel] probe poller task failed: {}", e);
    }
    server_task
        .await
        .context("HTTP server task panicked")?
        .context("HTTP server error")?;

    // open WebSocket sessions may still hold handles
    drop(ingest);
    if tokio::time::timeout(INGEST_DRAIN, ingest_task).await.is_err() {
        warn!("[kernel] ingestion still busy after {:?}, exiting anyway", INGEST_DRAIN);
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("[kernel] cannot listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("[kernel] cannot listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
