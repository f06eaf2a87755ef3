//! Per-stream window aggregation of raw sensor readings.

pub mod aggregator;
pub mod welford;
pub mod window;

pub use self::aggregator::{Accepted, StreamAggregator};
pub use self::window::WindowPolicy;

use crate::model::DedupKey;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TelemetryError {
    #[error("stale reading for {key}: {timestamp} is not after {last}")]
    StaleReading {
        key: DedupKey,
        timestamp: DateTime<Utc>,
        last: DateTime<Utc>,
    },

    #[error("invalid reading: {0}")]
    InvalidReading(String),
}

/// Live aggregators, one per stream, each behind its own async lock so
/// independent streams never contend.
#[derive(Default)]
pub struct StreamRegistry {
    streams: Mutex<HashMap<DedupKey, Arc<tokio::sync::Mutex<StreamAggregator>>>>,
}

impl StreamRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &DedupKey) -> Option<Arc<tokio::sync::Mutex<StreamAggregator>>> {
        self.streams
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }

    /// Register `aggregator` unless another task got there first; either
    /// way return the registered handle.
    pub fn insert(&self, aggregator: StreamAggregator) -> Arc<tokio::sync::Mutex<StreamAggregator>> {
        let mut streams = self.streams.lock().unwrap_or_else(|e| e.into_inner());
        streams
            .entry(aggregator.key().clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(aggregator)))
            .clone()
    }

    pub fn len(&self) -> usize {
        self.streams.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_registration_wins() {
        let registry = StreamRegistry::new();
        let key = DedupKey::new("M1", "temp");
        let first = registry.insert(StreamAggregator::new(key.clone(), WindowPolicy::Count { size: 3 }));
        let second = registry.insert(StreamAggregator::new(key.clone(), WindowPolicy::Count { size: 9 }));
        assert!(Arc::ptr_eq(&first, &second));
        assert!(registry.get(&key).is_some());
        assert_eq!(registry.len(), 1);
    }
}
