use serde::Serialize;
use std::collections::BTreeMap;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Sensor published on the broker, keyed by `name` in the sample store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SensorTopic {
    pub name: String,
    pub topic: String,
    pub unit: Option<String>,
    pub description: String,
}

/// Dashboard data source sampled by the poller (or seeded once when static).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandProbe {
    pub name: String,
    pub kind: ProbeKind,
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeKind {
    /// `type: "system_command"`, run through `sh -c` every tick
    Command { command: String },
    /// `type: "static"`, fixed value
    Static { value: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SampleSource {
    Sensor,
    Probe,
}

/// One observation for one key. Never mutated: a newer observation replaces it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SampleEvent {
    pub key: String,
    pub value: String,
    pub unit: Option<String>,
    pub description: String,
    /// instant of observation, not of delivery
    pub timestamp: OffsetDateTime,
    pub source: SampleSource,
}

impl SampleEvent {
    pub fn from_sensor(sensor: &SensorTopic, value: String, observed_at: OffsetDateTime) -> Self {
        Self {
            key: sensor.name.clone(),
            value,
            unit: sensor.unit.clone(),
            description: sensor.description.clone(),
            timestamp: observed_at,
            source: SampleSource::Sensor,
        }
    }

    pub fn from_probe(probe: &CommandProbe, value: String, observed_at: OffsetDateTime) -> Self {
        Self {
            key: probe.name.clone(),
            value,
            unit: None,
            description: probe.description.clone(),
            timestamp: observed_at,
            source: SampleSource::Probe,
        }
    }

    pub fn view(&self) -> SampleView {
        SampleView {
            value: self.value.clone(),
            unit: self.unit.clone(),
            description: self.description.clone(),
            timestamp: format_timestamp(self.timestamp),
        }
    }
}

/// JSON shape of a sample on the REST and push surfaces.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SampleView {
    pub value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub description: String,
    pub timestamp: String, // RFC3339
}

pub type SamplesMap = BTreeMap<String, SampleView>;

pub fn format_timestamp(ts: OffsetDateTime) -> String {
    ts.format(&Rfc3339).unwrap_or_default()
}
