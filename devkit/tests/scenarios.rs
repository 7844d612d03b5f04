//! End-to-end scenarios over the in-process core: broker publishes and
//! probe ticks in, viewer messages out.

use sensorhub_devkit::{wait_until, ConfigFixture, FailingViewer, StalledViewer, TestHarness};
use sensorhub_kernel::config::ConfigError;
use sensorhub_kernel::hub::PushMessage;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use time::macros::datetime;

fn temperature_fixture() -> ConfigFixture {
    ConfigFixture::new()
        .sensor("temperature", "sensors/temp", Some("C"))
        .sensor("humidity", "sensors/hum", Some("%"))
        .sensor("pressure", "sensors/press", Some("hPa"))
}

#[tokio::test]
async fn test_temperature_older_duplicate_is_ignored() {
    let harness = TestHarness::from_fixture(temperature_fixture()).await.unwrap();
    let t0 = datetime!(2024-05-01 12:00:00 UTC);

    harness.publish_at("sensors/temp", "23.5", t0).await.unwrap();
    harness
        .publish_at("sensors/temp", "23.0", t0 - time::Duration::seconds(1))
        .await
        .unwrap();

    let stored = harness.store.get("temperature").unwrap();
    assert_eq!(stored.value, "23.5");
    assert_eq!(stored.unit.as_deref(), Some("C"));
    assert_eq!(stored.timestamp, t0);
}

#[tokio::test]
async fn test_latest_timestamp_wins_per_key() {
    let harness = TestHarness::from_fixture(temperature_fixture()).await.unwrap();
    let t0 = datetime!(2024-05-01 12:00:00 UTC);
    let at = |s: i64| t0 + time::Duration::seconds(s);

    // arrival order differs from observation order
    harness.publish_at("sensors/temp", "20", at(3)).await.unwrap();
    harness.publish_at("sensors/hum", "40", at(1)).await.unwrap();
    harness.publish_at("sensors/temp", "18", at(1)).await.unwrap();
    harness.publish_at("sensors/hum", "45", at(5)).await.unwrap();
    harness.publish_at("sensors/temp", "19", at(2)).await.unwrap();
    // equal timestamp overwrites
    harness.publish_at("sensors/hum", "46", at(5)).await.unwrap();

    assert_eq!(harness.store.get("temperature").unwrap().value, "20");
    assert_eq!(harness.store.get("humidity").unwrap().value, "46");
    assert_eq!(harness.store.len(), 2);
}

#[tokio::test]
async fn test_join_receives_single_snapshot_then_updates() {
    let harness = TestHarness::from_fixture(temperature_fixture()).await.unwrap();
    harness.publish("sensors/temp", "23.5").await.unwrap();
    harness.publish("sensors/hum", "41").await.unwrap();
    harness.publish("sensors/press", "1013").await.unwrap();

    let (_id, log) = harness.connect_recording().await.unwrap();
    harness.publish("sensors/temp", "23.7").await.unwrap();

    assert!(wait_until(2000, || log.len() == 2).await);
    assert_eq!(log.init_count(), 1);
    let snapshot = log.snapshot().unwrap();
    assert_eq!(snapshot.len(), 3);
    assert_eq!(snapshot["temperature"].value, "23.5");
    assert_eq!(snapshot["pressure"].unit.as_deref(), Some("hPa"));
    assert_eq!(log.updates_for("temperature"), vec!["23.7"]);
    assert!(log.updates_for("humidity").is_empty());
}

#[tokio::test]
async fn test_failing_viewer_removed_others_keep_receiving() {
    let harness = TestHarness::from_fixture(temperature_fixture().viewers(16, 1))
        .await
        .unwrap();

    let mut logs = Vec::new();
    for _ in 0..3 {
        let (_id, log) = harness.connect_recording().await.unwrap();
        logs.push(log);
    }
    let (failing, attempts) = FailingViewer::new();
    harness.connect(failing).await.unwrap();

    harness.publish("sensors/temp", "22.0").await.unwrap();
    assert!(harness.wait_for_viewers(3, 2000).await.unwrap());
    assert!(attempts.load(Ordering::SeqCst) >= 1);

    harness.publish("sensors/temp", "22.5").await.unwrap();
    for log in &logs {
        assert!(wait_until(2000, || log.len() == 3).await);
        assert_eq!(log.updates_for("temperature"), vec!["22.0", "22.5"]);
    }
    assert_eq!(harness.viewer_count().await.unwrap(), 3);
}

#[tokio::test]
async fn test_viewer_tolerates_failures_below_limit() {
    let harness = TestHarness::from_fixture(temperature_fixture().viewers(16, 3))
        .await
        .unwrap();
    // init goes through, then every send fails
    let (flaky, attempts) = FailingViewer::after(1);
    harness.connect(flaky).await.unwrap();

    harness.publish("sensors/temp", "1").await.unwrap();
    harness.publish("sensors/temp", "2").await.unwrap();
    assert!(wait_until(2000, || attempts.load(Ordering::SeqCst) == 3).await);
    assert_eq!(harness.viewer_count().await.unwrap(), 1);

    harness.publish("sensors/temp", "3").await.unwrap();
    assert!(harness.wait_for_viewers(0, 2000).await.unwrap());
}

#[tokio::test]
async fn test_disconnect_all_closes_viewers_and_stops_delivery() {
    let harness = TestHarness::from_fixture(temperature_fixture()).await.unwrap();
    let (_a, first) = harness.connect_recording().await.unwrap();
    let (_b, second) = harness.connect_recording().await.unwrap();
    harness.publish("sensors/temp", "21.0").await.unwrap();
    assert!(wait_until(2000, || first.len() == 2 && second.len() == 2).await);

    assert_eq!(harness.ingest.disconnect_all().await.unwrap(), 2);
    assert!(wait_until(2000, || first.is_closed() && second.is_closed()).await);
    assert_eq!(harness.viewer_count().await.unwrap(), 0);

    harness.publish("sensors/temp", "21.5").await.unwrap();
    assert_eq!(first.updates_for("temperature"), vec!["21.0"]);
    // the store still takes samples with nobody watching
    assert_eq!(harness.store.get("temperature").unwrap().value, "21.5");
}

#[tokio::test]
async fn test_stalled_viewer_does_not_hold_back_others() {
    let harness = TestHarness::from_fixture(temperature_fixture().viewers(4, 2))
        .await
        .unwrap();
    harness.connect(StalledViewer).await.unwrap();
    let (_id, log) = harness.connect_recording().await.unwrap();

    let start = Instant::now();
    for i in 0..10 {
        harness.publish("sensors/temp", format!("{i}")).await.unwrap();
    }
    assert!(start.elapsed() < Duration::from_secs(2));

    assert!(harness.wait_for_viewers(1, 2000).await.unwrap());
    assert!(wait_until(2000, || log.len() == 11).await);
    assert_eq!(log.updates_for("temperature").last().map(String::as_str), Some("9"));
}

#[tokio::test]
async fn test_probe_timeout_does_not_delay_next_probe() {
    let harness = TestHarness::from_fixture(
        ConfigFixture::new()
            .command_probe("slow", "sleep 10")
            .command_probe("fast", "echo ok")
            .poller(5.0, 0.3),
    )
    .await
    .unwrap();

    let start = Instant::now();
    harness.poller().tick().await.unwrap();
    assert!(start.elapsed() < Duration::from_secs(3));

    harness.sync().await.unwrap();
    assert!(harness.store.get("slow").unwrap().value.starts_with("Error: command timed out"));
    assert_eq!(harness.store.get("fast").unwrap().value, "ok");
    assert_eq!(harness.health.probe_failures(), 1);
}

#[tokio::test]
async fn test_uptime_probe_recovers_after_timeout() {
    let dir = tempfile::tempdir().unwrap();
    let marker = dir.path().join("hang");
    let command = format!(
        "if [ -f '{}' ]; then sleep 10; else echo 'up 1 day'; fi",
        marker.display()
    );
    let harness = TestHarness::from_fixture(
        ConfigFixture::new()
            .command_probe("uptime", &command)
            .poller(5.0, 0.3),
    )
    .await
    .unwrap();
    let (_id, log) = harness.connect_recording().await.unwrap();
    let poller = harness.poller();

    poller.tick().await.unwrap();
    std::fs::write(&marker, b"").unwrap();
    poller.tick().await.unwrap();
    std::fs::remove_file(&marker).unwrap();
    poller.tick().await.unwrap();

    assert!(wait_until(2000, || log.updates_for("uptime").len() == 3).await);
    let values = log.updates_for("uptime");
    assert_eq!(values[0], "up 1 day");
    assert_eq!(values[1], "Error: command timed out after 300ms");
    assert_eq!(values[2], "up 1 day");
    assert!(log
        .messages()
        .iter()
        .any(|m| matches!(m, PushMessage::SystemUpdate { key, .. } if key == "uptime")));
}

#[tokio::test]
async fn test_static_sources_in_initial_snapshot() {
    let harness = TestHarness::from_fixture(
        temperature_fixture()
            .static_probe("board", "IMX8MP")
            .static_probe("os", "Yocto"),
    )
    .await
    .unwrap();
    let (_id, log) = harness.connect_recording().await.unwrap();

    assert!(wait_until(2000, || log.init_count() == 1).await);
    let snapshot = log.snapshot().unwrap();
    assert_eq!(snapshot["board"].value, "IMX8MP");
    assert_eq!(snapshot["os"].value, "Yocto");
    // statics are not polled
    assert_eq!(harness.poller().probe_count(), 0);
}

#[tokio::test]
async fn test_unknown_topic_and_invalid_payload_discarded() {
    let harness = TestHarness::from_fixture(temperature_fixture()).await.unwrap();
    let (_id, log) = harness.connect_recording().await.unwrap();

    harness.publish("sensors/unknown", "1").await.unwrap();
    harness.publish("sensors/temp", [0xc3u8, 0x28]).await.unwrap();
    harness.publish("sensors/temp", "24.1").await.unwrap();

    assert!(wait_until(2000, || log.len() == 2).await);
    assert_eq!(harness.store.len(), 1);
    assert_eq!(log.updates_for("temperature"), vec!["24.1"]);
}

#[test]
fn test_config_rejects_shared_topic_and_duplicate_name() {
    let shared = ConfigFixture::new()
        .sensor("temperature", "sensors/temp", Some("C"))
        .sensor("temp2", "sensors/temp", None);
    assert!(matches!(shared.resolve(), Err(ConfigError::DuplicateTopic { .. })));

    let duplicate = ConfigFixture::new()
        .sensor("temperature", "sensors/a", None)
        .sensor("temperature", "sensors/b", None);
    assert!(matches!(duplicate.resolve(), Err(ConfigError::DuplicateKey { .. })));

    let clash = ConfigFixture::new()
        .sensor("uptime", "sensors/up", None)
        .command_probe("uptime", "uptime");
    assert!(matches!(clash.resolve(), Err(ConfigError::DuplicateKey { .. })));
}

#[tokio::test]
async fn test_config_file_round_trip_through_loader() {
    let dir = tempfile::tempdir().unwrap();
    let path = temperature_fixture()
        .command_probe("uptime", "uptime")
        .poller(10.0, 2.0)
        .write_json(dir.path())
        .unwrap();

    let raw = sensorhub_kernel::config::load_config(&path).await.unwrap();
    let cfg = sensorhub_kernel::config::resolve(&raw).unwrap();
    assert_eq!(cfg.sensors.len(), 3);
    assert_eq!(cfg.sensors[0].name, "temperature");
    assert_eq!(cfg.probes.len(), 1);
    assert_eq!(cfg.poller.interval, Duration::from_secs(10));
    assert_eq!(cfg.poller.timeout, Duration::from_secs(2));
}
