//! MQTT side of the kernel: subscribes to every configured sensor topic and
//! turns inbound publishes into samples for the ingestion actor.
//!
//! Reconnection is left to rumqttc: polling the event loop again after an
//! error reconnects, and every successful ConnAck re-subscribes.

use crate::config::BrokerSettings;
use crate::health::HealthTracker;
use crate::ingest::IngestHandle;
use crate::models::{SampleEvent, SensorTopic};
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, Incoming, MqttOptions, Outgoing, QoS,
    SubscribeFilter,
};
use std::collections::HashMap;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(2);
const DISCONNECT_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, thiserror::Error)]
#[error("payload on `{topic}` is not valid UTF-8: {source}")]
pub struct DecodeError {
    pub topic: String,
    #[source]
    pub source: std::str::Utf8Error,
}

/// Builds the client options: client id, keepalive and optional credentials.
pub fn mqtt_options(settings: &BrokerSettings) -> MqttOptions {
    let mut opts = MqttOptions::new(&settings.client_id, &settings.host, settings.port);
    opts.set_keep_alive(settings.keepalive);
    if let Some(creds) = &settings.credentials {
        opts.set_credentials(&creds.username, &creds.password);
    }
    opts
}

pub struct BrokerBridge {
    /// topic -> sensor, exact match
    index: HashMap<String, SensorTopic>,
    ingest: IngestHandle,
    health: HealthTracker,
}

impl BrokerBridge {
    pub fn new(sensors: &[SensorTopic], ingest: IngestHandle, health: HealthTracker) -> Self {
        let index = sensors
            .iter()
            .map(|s| (s.topic.clone(), s.clone()))
            .collect();
        Self { index, ingest, health }
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.index.keys().cloned().collect();
        topics.sort();
        topics
    }

    /// `Ok(None)` when no sensor listens on `topic`.
    pub fn resolve(
        &self,
        topic: &str,
        payload: &[u8],
        received_at: OffsetDateTime,
    ) -> Result<Option<SampleEvent>, DecodeError> {
        let Some(sensor) = self.index.get(topic) else {
            return Ok(None);
        };
        let text = std::str::from_utf8(payload).map_err(|source| DecodeError {
            topic: topic.to_string(),
            source,
        })?;
        Ok(Some(SampleEvent::from_sensor(sensor, text.to_string(), received_at)))
    }

    /// Handles one inbound publish. Never fails: bad messages are logged and dropped.
    pub async fn on_message(&self, topic: &str, payload: &[u8]) {
        match self.resolve(topic, payload, OffsetDateTime::now_utc()) {
            Ok(Some(event)) => {
                debug!("mqtt {} -> {} = {:?}", topic, event.key, event.value);
                if self.ingest.ingest(event).await.is_err() {
                    warn!("ingestion stopped, dropping message on {}", topic);
                }
            }
            Ok(None) => debug!("no sensor for topic {}, message ignored", topic),
            Err(e) => warn!("{}", e),
        }
    }

    fn on_connected(&self, client: &AsyncClient, code: ConnectReturnCode) {
        if code != ConnectReturnCode::Success {
            error!("broker refused connection: {:?}", code);
            return;
        }
        self.health.mark_broker_connected();
        info!("connected to MQTT broker");

        let topics = self.topics();
        if topics.is_empty() {
            return;
        }
        let filters = topics
            .iter()
            .map(|t| SubscribeFilter::new(t.clone(), QoS::AtLeastOnce));
        // the event loop is driven by this same task: never await the request channel here
        match client.try_subscribe_many(filters) {
            Ok(()) => {
                for topic in &topics {
                    info!("subscribed to topic: {}", topic);
                }
            }
            Err(e) => error!("subscribe failed: {:?}", e),
        }
    }

    /// Drives the MQTT connection until `shutdown` flips, then disconnects cleanly.
    pub async fn run(self, settings: BrokerSettings, mut shutdown: watch::Receiver<bool>) {
        info!("connecting to MQTT broker {}:{}", settings.host, settings.port);
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(&settings), 10);

        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                event = eventloop.poll() => match event {
                    Ok(Event::Incoming(Incoming::ConnAck(ack))) => self.on_connected(&client, ack.code),
                    Ok(Event::Incoming(Incoming::Publish(p))) => self.on_message(&p.topic, &p.payload).await,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("MQTT connection error: {}", e);
                        self.health.mark_broker_disconnected();
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                        }
                        self.health.increment_reconnects();
                    }
                },
            }
        }

        disconnect(&client, &mut eventloop).await;
        self.health.mark_broker_disconnected();
        info!("broker bridge stopped");
    }
}

async fn disconnect(client: &AsyncClient, eventloop: &mut EventLoop) {
    if client.try_disconnect().is_err() {
        return;
    }
    let flushed = tokio::time::timeout(DISCONNECT_GRACE, async {
        loop {
            match eventloop.poll().await {
                Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    })
    .await;
    if flushed.is_err() {
        warn!("MQTT disconnect not acknowledged in time");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Credentials, ViewerSettings};
    use crate::ingest::spawn_ingestor;
    use crate::store::SampleStore;
    use time::macros::datetime;

    fn temperature() -> SensorTopic {
        SensorTopic {
            name: "temperature".into(),
            topic: "sensors/temp".into(),
            unit: Some("C".into()),
            description: "CPU temperature".into(),
        }
    }

    fn bridge(store: &SampleStore) -> BrokerBridge {
        let (ingest, _task) = spawn_ingestor(store.clone(), ViewerSettings::default());
        BrokerBridge::new(&[temperature()], ingest, HealthTracker::new())
    }

    #[tokio::test]
    async fn test_resolve_matching_topic() {
        let bridge = bridge(&SampleStore::new());
        let at = datetime!(2024-05-01 12:00 UTC);
        let ev = bridge.resolve("sensors/temp", b"23.5", at).unwrap().unwrap();
        assert_eq!(ev.key, "temperature");
        assert_eq!(ev.value, "23.5");
        assert_eq!(ev.unit.as_deref(), Some("C"));
        assert_eq!(ev.timestamp, at);
    }

    #[tokio::test]
    async fn test_unknown_topic_and_bad_payload_are_dropped() {
        let store = SampleStore::new();
        let bridge = bridge(&store);
        let at = OffsetDateTime::now_utc();

        assert!(bridge.resolve("sensors/other", b"1", at).unwrap().is_none());
        // prefix of a configured topic is not a match
        assert!(bridge.resolve("sensors", b"1", at).unwrap().is_none());
        assert!(bridge.resolve("sensors/temp", &[0xff, 0xfe], at).is_err());

        bridge.on_message("sensors/temp", &[0xff, 0xfe]).await;
        bridge.on_message("sensors/other", b"1").await;
        bridge.on_message("sensors/temp", b"21.0").await;

        let ingest = bridge.ingest.clone();
        // round trip through the actor so the previous commands are processed
        ingest.viewer_count().await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.get("temperature").unwrap().value, "21.0");
    }

    #[test]
    fn test_mqtt_options_from_settings() {
        let settings = BrokerSettings {
            host: "broker.lan".into(),
            port: 1884,
            keepalive: Duration::from_secs(30),
            client_id: "web_server".into(),
            credentials: Some(Credentials { username: "dash".into(), password: "pw".into() }),
        };
        let opts = mqtt_options(&settings);
        assert_eq!(opts.broker_address(), ("broker.lan".to_string(), 1884));
        assert_eq!(opts.keep_alive(), Duration::from_secs(30));
        assert_eq!(opts.client_id(), "web_server");
    }

    #[test]
    fn test_mqtt_options_accept_keepalive_bounds() {
        for secs in [1, u16::MAX as u64] {
            let settings = BrokerSettings {
                host: "localhost".into(),
                port: 1883,
                keepalive: Duration::from_secs(secs),
                client_id: "web_server".into(),
                credentials: None,
            };
            assert_eq!(mqtt_options(&settings).keep_alive(), Duration::from_secs(secs));
        }
    }
}
