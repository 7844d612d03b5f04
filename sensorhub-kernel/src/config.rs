/**
 * CONFIG RESOLVER - Typed view over the dashboard configuration
 *
 * ROLE :
 * Loads the configuration file into an opaque mapping, then resolves that
 * mapping once, at startup, into typed descriptor sets (sensors, probes) and
 * settings (broker, server, poller, viewers).
 *
 * RULES :
 * - Every section is optional, absent sections fall back to defaults
 * - A malformed field aborts startup with a ConfigError naming its path
 * - Duplicate sensor/probe names and shared topics are rejected
 */

use crate::models::{CommandProbe, ProbeKind, SensorTopic};
use serde_json::{Map, Value};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing field `{0}`")]
    MissingField(String),
    #[error("invalid field `{path}`: {reason}")]
    InvalidField { path: String, reason: String },
    #[error("duplicate key `{key}` in `{path}`")]
    DuplicateKey { path: String, key: String },
    #[error("topic `{topic}` is used by both `{first}` and `{second}`")]
    DuplicateTopic { topic: String, first: String, second: String },
    #[error("cannot load {path}: {reason}")]
    Load { path: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerSettings {
    pub host: String,
    pub port: u16,
    pub keepalive: Duration,
    pub client_id: String,
    pub credentials: Option<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollerSettings {
    pub interval: Duration,
    pub timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewerSettings {
    /// per-viewer queue depth before deliveries start failing
    pub queue_capacity: usize,
    /// consecutive failed deliveries before a viewer is dropped
    pub max_failures: u32,
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".into(),
            port: 1883,
            keepalive: Duration::from_secs(60),
            client_id: "sensorhub".into(),
            credentials: None,
        }
    }
}

impl Default for ServerSettings {
    fn default() -> Self {
        Self { host: "0.0.0.0".into(), port: 8080 }
    }
}

impl Default for PollerSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            timeout: Duration::from_secs(5),
        }
    }
}

impl Default for ViewerSettings {
    fn default() -> Self {
        Self { queue_capacity: 64, max_failures: 3 }
    }
}

#[derive(Debug, Clone, Default)]
pub struct ResolvedConfig {
    pub broker: BrokerSettings,
    pub server: ServerSettings,
    pub poller: PollerSettings,
    pub viewers: ViewerSettings,
    pub sensors: Vec<SensorTopic>,
    pub probes: Vec<CommandProbe>,
}

pub fn config_path() -> String {
    std::env::var("SENSORHUB_CONFIG").unwrap_or_else(|_| "config.json".into())
}

/// Reads the configuration file into the opaque mapping handed to [`resolve`].
/// `.yaml`/`.yml` files go through serde_yaml, anything else is JSON.
pub async fn load_config<P: AsRef<Path>>(path: P) -> Result<Value, ConfigError> {
    let path = path.as_ref();
    if !path.exists() {
        warn!("no config file at {}, using defaults", path.display());
        return Ok(Value::Object(Map::new()));
    }

    let load_err = |reason: String| ConfigError::Load {
        path: path.display().to_string(),
        reason,
    };

    let txt = fs::read_to_string(path).await.map_err(|e| load_err(e.to_string()))?;
    if txt.trim().is_empty() {
        return Ok(Value::Object(Map::new()));
    }

    let is_yaml = matches!(
        path.extension().and_then(|s| s.to_str()),
        Some("yaml") | Some("yml")
    );
    let raw = if is_yaml {
        serde_yaml::from_str::<Value>(&txt).map_err(|e| load_err(e.to_string()))?
    } else {
        serde_json::from_str::<Value>(&txt).map_err(|e| load_err(e.to_string()))?
    };

    info!("loaded config from {}", path.display());
    Ok(raw)
}

/// Resolves the raw mapping into validated descriptor sets and settings.
pub fn resolve(raw: &Value) -> Result<ResolvedConfig, ConfigError> {
    let root = match raw {
        Value::Null => return Ok(ResolvedConfig::default()),
        Value::Object(map) => map,
        _ => return Err(invalid("", "expected a mapping")),
    };

    let broker = resolve_broker(section(root, "broker_config", "")?)?;
    let server = resolve_server(section(root, "server_config", "")?)?;
    let poller = resolve_poller(section(root, "poller_config", "")?)?;
    let viewers = resolve_viewers(section(root, "viewer_config", "")?)?;

    let tabs = section(root, "tabs", "")?;
    let sensors = match tabs
        .map(|t| section(t, "sensors", "tabs"))
        .transpose()?
        .flatten()
        .map(|s| section(s, "broker_config", "tabs.sensors"))
        .transpose()?
        .flatten()
    {
        Some(bc) => resolve_sensors(bc.get("topics"), "tabs.sensors.broker_config.topics")?,
        None => Vec::new(),
    };
    let probes = match tabs
        .map(|t| section(t, "general", "tabs"))
        .transpose()?
        .flatten()
    {
        Some(general) => resolve_probes(general.get("data_sources"), "tabs.general.data_sources")?,
        None => Vec::new(),
    };

    // sensors and probes share the sample store key space
    let sensor_names: HashSet<&str> = sensors.iter().map(|s| s.name.as_str()).collect();
    if let Some(clash) = probes.iter().find(|p| sensor_names.contains(p.name.as_str())) {
        return Err(ConfigError::DuplicateKey {
            path: "tabs.general.data_sources".into(),
            key: clash.name.clone(),
        });
    }

    Ok(ResolvedConfig { broker, server, poller, viewers, sensors, probes })
}

fn resolve_broker(sec: Option<&Map<String, Value>>) -> Result<BrokerSettings, ConfigError> {
    let mut out = BrokerSettings::default();
    let Some(sec) = sec else { return Ok(out) };
    let p = "broker_config";

    if let Some(host) = opt_str(sec, "host", p)? {
        out.host = host;
    }
    if let Some(port) = opt_u64(sec, "port", p)? {
        out.port = to_port(port, &join(p, "port"))?;
    }
    if let Some(keepalive) = opt_u64(sec, "keepalive", p)? {
        // the MQTT client takes whole seconds, 1..=u16::MAX
        if keepalive == 0 || keepalive > u16::MAX as u64 {
            return Err(invalid(&join(p, "keepalive"), "expected whole seconds between 1 and 65535"));
        }
        out.keepalive = Duration::from_secs(keepalive);
    }
    if let Some(client_id) = opt_str(sec, "client_id", p)? {
        out.client_id = client_id;
    }
    if let Some(username) = opt_str(sec, "username", p)?.filter(|u| !u.is_empty()) {
        let password = opt_str(sec, "password", p)?.unwrap_or_default();
        out.credentials = Some(Credentials { username, password });
    }
    Ok(out)
}

fn resolve_server(sec: Option<&Map<String, Value>>) -> Result<ServerSettings, ConfigError> {
    let mut out = ServerSettings::default();
    let Some(sec) = sec else { return Ok(out) };
    if let Some(host) = opt_str(sec, "host", "server_config")? {
        out.host = host;
    }
    if let Some(port) = opt_u64(sec, "port", "server_config")? {
        out.port = to_port(port, "server_config.port")?;
    }
    Ok(out)
}

fn resolve_poller(sec: Option<&Map<String, Value>>) -> Result<PollerSettings, ConfigError> {
    let mut out = PollerSettings::default();
    let Some(sec) = sec else { return Ok(out) };
    if let Some(interval) = opt_secs(sec, "interval_secs", "poller_config")? {
        out.interval = interval;
    }
    if let Some(timeout) = opt_secs(sec, "timeout_secs", "poller_config")? {
        out.timeout = timeout;
    }
    Ok(out)
}

fn resolve_viewers(sec: Option<&Map<String, Value>>) -> Result<ViewerSettings, ConfigError> {
    let mut out = ViewerSettings::default();
    let Some(sec) = sec else { return Ok(out) };
    if let Some(cap) = opt_u64(sec, "queue_capacity", "viewer_config")? {
        if cap == 0 {
            return Err(invalid("viewer_config.queue_capacity", "must be at least 1"));
        }
        out.queue_capacity = cap as usize;
    }
    if let Some(max) = opt_u64(sec, "max_failures", "viewer_config")? {
        if max == 0 || max > u32::MAX as u64 {
            return Err(invalid("viewer_config.max_failures", "must be between 1 and 2^32-1"));
        }
        out.max_failures = max as u32;
    }
    Ok(out)
}

fn resolve_sensors(raw: Option<&Value>, path: &str) -> Result<Vec<SensorTopic>, ConfigError> {
    let mut sensors = Vec::new();
    let mut by_topic: HashMap<String, String> = HashMap::new();

    for (name, entry, entry_path) in named_entries(raw, path)? {
        let topic = req_str(entry, "topic", &entry_path)?;
        if topic.is_empty() {
            return Err(invalid(&join(&entry_path, "topic"), "must not be empty"));
        }
        if let Some(first) = by_topic.insert(topic.clone(), name.clone()) {
            return Err(ConfigError::DuplicateTopic { topic, first, second: name });
        }
        sensors.push(SensorTopic {
            unit: opt_str(entry, "unit", &entry_path)?.filter(|u| !u.is_empty()),
            description: opt_str(entry, "description", &entry_path)?.unwrap_or_default(),
            name,
            topic,
        });
    }
    Ok(sensors)
}

fn resolve_probes(raw: Option<&Value>, path: &str) -> Result<Vec<CommandProbe>, ConfigError> {
    let mut probes = Vec::new();

    for (name, entry, entry_path) in named_entries(raw, path)? {
        let kind = match req_str(entry, "type", &entry_path)?.as_str() {
            "system_command" => ProbeKind::Command {
                command: req_str(entry, "command", &entry_path)?,
            },
            "static" => ProbeKind::Static {
                value: req_str(entry, "value", &entry_path)?,
            },
            other => {
                return Err(invalid(
                    &join(&entry_path, "type"),
                    &format!("unknown data source type `{other}`"),
                ))
            }
        };
        probes.push(CommandProbe {
            description: opt_str(entry, "description", &entry_path)?.unwrap_or_default(),
            name,
            kind,
        });
    }
    Ok(probes)
}

/// Entries given either as `{name: {...}}` or as `[{"name": ..., ...}]`.
fn named_entries<'a>(
    raw: Option<&'a Value>,
    path: &str,
) -> Result<Vec<(String, &'a Map<String, Value>, String)>, ConfigError> {
    let mut out = Vec::new();
    match raw {
        None | Some(Value::Null) => {}
        Some(Value::Object(map)) => {
            for (name, entry) in map {
                let entry_path = join(path, name);
                let entry = entry
                    .as_object()
                    .ok_or_else(|| invalid(&entry_path, "expected a mapping"))?;
                out.push((name.clone(), entry, entry_path));
            }
        }
        Some(Value::Array(list)) => {
            let mut seen = HashSet::new();
            for (i, entry) in list.iter().enumerate() {
                let entry_path = format!("{path}[{i}]");
                let entry = entry
                    .as_object()
                    .ok_or_else(|| invalid(&entry_path, "expected a mapping"))?;
                let name = req_str(entry, "name", &entry_path)?;
                if !seen.insert(name.clone()) {
                    return Err(ConfigError::DuplicateKey { path: path.into(), key: name });
                }
                out.push((name, entry, entry_path));
            }
        }
        Some(_) => return Err(invalid(path, "expected a mapping or a list")),
    }

    if let Some((_, _, p)) = out.iter().find(|(name, _, _)| name.is_empty()) {
        return Err(invalid(p, "name must not be empty"));
    }
    Ok(out)
}

fn section<'a>(
    parent: &'a Map<String, Value>,
    key: &str,
    path: &str,
) -> Result<Option<&'a Map<String, Value>>, ConfigError> {
    match parent.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Object(map)) => Ok(Some(map)),
        Some(_) => Err(invalid(&join(path, key), "expected a mapping")),
    }
}

fn opt_str(obj: &Map<String, Value>, key: &str, path: &str) -> Result<Option<String>, ConfigError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(invalid(&join(path, key), "expected a string")),
    }
}

fn req_str(obj: &Map<String, Value>, key: &str, path: &str) -> Result<String, ConfigError> {
    opt_str(obj, key, path)?.ok_or_else(|| ConfigError::MissingField(join(path, key)))
}

fn opt_u64(obj: &Map<String, Value>, key: &str, path: &str) -> Result<Option<u64>, ConfigError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => v
            .as_u64()
            .map(Some)
            .ok_or_else(|| invalid(&join(path, key), "expected a non-negative integer")),
    }
}

/// One day; longer poll intervals or probe timeouts are configuration mistakes.
const MAX_DURATION_SECS: f64 = 86_400.0;

fn opt_secs(obj: &Map<String, Value>, key: &str, path: &str) -> Result<Option<Duration>, ConfigError> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(v) => match v.as_f64() {
            // millisecond resolution
            Some(secs) if (0.001..=MAX_DURATION_SECS).contains(&secs) => {
                Ok(Some(Duration::from_millis((secs * 1000.0).round() as u64)))
            }
            _ => Err(invalid(
                &join(path, key),
                &format!("expected seconds between 0.001 and {MAX_DURATION_SECS}"),
            )),
        },
    }
}

fn to_port(port: u64, path: &str) -> Result<u16, ConfigError> {
    u16::try_from(port)
        .ok()
        .filter(|p| *p != 0)
        .ok_or_else(|| invalid(path, "expected a port between 1 and 65535"))
}

fn join(path: &str, key: &str) -> String {
    if path.is_empty() {
        key.to_string()
    } else {
        format!("{path}.{key}")
    }
}

fn invalid(path: &str, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        path: if path.is_empty() { "<root>".into() } else { path.into() },
        reason: reason.into(),
    }
}
