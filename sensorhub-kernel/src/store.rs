//! Latest-value cache, one entry per sample key.
//!
//! Readers clone entries out under a read lock, so they never observe a
//! partially updated sample. Writes go through [`SampleStore::apply`], which is
//! crate-private and only called by the ingestion actor.

use crate::models::{SampleEvent, SampleSource, SamplesMap};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Outcome of offering a sample to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Accepted,
    /// stored sample for that key is strictly newer
    Stale,
}

#[derive(Clone, Default)]
pub struct SampleStore {
    samples: Arc<RwLock<HashMap<String, SampleEvent>>>,
}

impl SampleStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ordering guard + overwrite. An equal timestamp replaces the stored sample.
    pub(crate) fn apply(&self, event: &SampleEvent) -> Applied {
        let mut samples = self.samples.write();
        if let Some(current) = samples.get(&event.key) {
            if current.timestamp > event.timestamp {
                return Applied::Stale;
            }
        }
        samples.insert(event.key.clone(), event.clone());
        Applied::Accepted
    }

    pub fn get(&self, key: &str) -> Option<SampleEvent> {
        self.samples.read().get(key).cloned()
    }

    pub fn snapshot(&self) -> Vec<SampleEvent> {
        self.samples.read().values().cloned().collect()
    }

    pub fn snapshot_by_source(&self, source: SampleSource) -> Vec<SampleEvent> {
        self.samples
            .read()
            .values()
            .filter(|s| s.source == source)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.samples.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// `{key: {value, unit, description, timestamp}}`
pub fn to_views(samples: &[SampleEvent]) -> SamplesMap {
    samples.iter().map(|s| (s.key.clone(), s.view())).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::{Duration, OffsetDateTime};

    fn sample(key: &str, value: &str, secs: i64) -> SampleEvent {
        SampleEvent {
            key: key.into(),
            value: value.into(),
            unit: Some("C".into()),
            description: String::new(),
            timestamp: OffsetDateTime::UNIX_EPOCH + Duration::seconds(secs),
            source: SampleSource::Sensor,
        }
    }

    #[test]
    fn test_older_sample_is_discarded() {
        let store = SampleStore::new();
        assert_eq!(store.apply(&sample("temperature", "23.5", 10)), Applied::Accepted);
        assert_eq!(store.apply(&sample("temperature", "23.0", 5)), Applied::Stale);
        assert_eq!(store.get("temperature").unwrap().value, "23.5");
    }

    #[test]
    fn test_final_value_is_latest_timestamp_whatever_the_order() {
        let store = SampleStore::new();
        for (value, secs) in [("b", 20), ("a", 10), ("d", 40), ("c", 30), ("d2", 40)] {
            store.apply(&sample("k", value, secs));
        }
        // equal timestamp overwrites
        assert_eq!(store.get("k").unwrap().value, "d2");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_snapshot_by_source() {
        let store = SampleStore::new();
        store.apply(&sample("temperature", "21", 1));
        let mut probe = sample("uptime", "up", 1);
        probe.source = SampleSource::Probe;
        probe.unit = None;
        store.apply(&probe);

        let probes = store.snapshot_by_source(SampleSource::Probe);
        assert_eq!(probes.len(), 1);
        assert_eq!(probes[0].key, "uptime");

        let views = to_views(&store.snapshot());
        assert_eq!(views.keys().cloned().collect::<Vec<_>>(), vec!["temperature", "uptime"]);
    }
}
