/*!
Configuration fixtures

Builds the same mapping the kernel reads from config.json, so tests go
through the real resolver instead of hand-assembling descriptor structs.
Entries are emitted in list form to keep their declaration order.
*/

use anyhow::Result;
use sensorhub_kernel::config::{resolve, ConfigError, ResolvedConfig};
use serde_json::{json, Map, Value};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default)]
pub struct ConfigFixture {
    sensors: Vec<Value>,
    data_sources: Vec<Value>,
    poller: Map<String, Value>,
    viewers: Map<String, Value>,
    broker: Map<String, Value>,
}

impl ConfigFixture {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sensor(mut self, name: &str, topic: &str, unit: Option<&str>) -> Self {
        let mut entry = json!({
            "name": name,
            "topic": topic,
            "description": format!("{name} sensor"),
        });
        if let Some(unit) = unit {
            entry["unit"] = json!(unit);
        }
        self.sensors.push(entry);
        self
    }

    pub fn command_probe(mut self, name: &str, command: &str) -> Self {
        self.data_sources.push(json!({
            "name": name,
            "type": "system_command",
            "command": command,
            "description": format!("{name} probe"),
        }));
        self
    }

    pub fn static_probe(mut self, name: &str, value: &str) -> Self {
        self.data_sources.push(json!({
            "name": name,
            "type": "static",
            "value": value,
            "description": format!("{name} info"),
        }));
        self
    }

    /// Seconds, fractions allowed.
    pub fn poller(mut self, interval_secs: f64, timeout_secs: f64) -> Self {
        self.poller.insert("interval_secs".into(), json!(interval_secs));
        self.poller.insert("timeout_secs".into(), json!(timeout_secs));
        self
    }

    pub fn viewers(mut self, queue_capacity: usize, max_failures: u32) -> Self {
        self.viewers.insert("queue_capacity".into(), json!(queue_capacity));
        self.viewers.insert("max_failures".into(), json!(max_failures));
        self
    }

    pub fn broker(mut self, host: &str, port: u16) -> Self {
        self.broker.insert("host".into(), json!(host));
        self.broker.insert("port".into(), json!(port));
        self
    }

    pub fn to_value(&self) -> Value {
        let mut root = Map::new();
        if !self.broker.is_empty() {
            root.insert("broker_config".into(), Value::Object(self.broker.clone()));
        }
        if !self.poller.is_empty() {
            root.insert("poller_config".into(), Value::Object(self.poller.clone()));
        }
        if !self.viewers.is_empty() {
            root.insert("viewer_config".into(), Value::Object(self.viewers.clone()));
        }
        root.insert(
            "tabs".into(),
            json!({
                "sensors": { "broker_config": { "topics": self.sensors } },
                "general": { "data_sources": self.data_sources },
            }),
        );
        Value::Object(root)
    }

    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        resolve(&self.to_value())
    }

    /// Writes `config.json` into `dir` and returns its path.
    pub fn write_json(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join("config.json");
        std::fs::write(&path, serde_json::to_string_pretty(&self.to_value())?)?;
        Ok(path)
    }
}
