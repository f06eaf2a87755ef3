use super::{AnomalySource, DedupKey, Severity};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A raw sensor measurement. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorReading {
    /// Assigned by storage on insert.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reading_id: Option<i64>,
    pub machine_id: String,
    pub sensor_type: String,
    pub value: f64,
    pub unit: String,
    pub timestamp: DateTime<Utc>,
    /// |z| of this reading against the window it was scored on.
    #[serde(default)]
    pub anomaly_score: f64,
}

impl SensorReading {
    pub fn new(
        machine_id: impl Into<String>,
        sensor_type: impl Into<String>,
        value: f64,
        unit: impl Into<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            reading_id: None,
            machine_id: machine_id.into(),
            sensor_type: sensor_type.into(),
            value,
            unit: unit.into(),
            timestamp,
            anomaly_score: 0.0,
        }
    }

    /// The stream (and incident dedup key) this reading belongs to.
    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.machine_id.clone(), self.sensor_type.clone())
    }
}

/// Statistics for one closed window `[window_start, window_end)` of a stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SensorAggregate {
    pub machine_id: String,
    pub metric_name: String,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    #[serde(rename = "rolling_average")]
    pub rolling_avg: f64,
    pub rolling_std: f64,
    /// Drift of this window's mean from the previous window, in previous-window σ.
    pub anomaly_score: f64,
    pub sample_count: u64,
}

impl SensorAggregate {
    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.machine_id.clone(), self.metric_name.clone())
    }

    pub fn overlaps(&self, other: &SensorAggregate) -> bool {
        self.window_start < other.window_end && other.window_start < self.window_end
    }
}

/// Accumulator of a stream's window that has not closed yet. Persisted with
/// every accepted reading so a restarted stream continues the same window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenWindow {
    pub machine_id: String,
    pub metric_name: String,
    pub window_start: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub mean: f64,
    /// Sum of squared deviations from `mean`.
    pub m2: f64,
}

impl OpenWindow {
    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.machine_id.clone(), self.metric_name.clone())
    }
}

/// A statistically significant deviation. Immutable once created.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Anomaly {
    pub anomaly_id: Uuid,
    pub machine_id: String,
    pub metric_name: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub z_score: f64,
    pub severity: Severity,
    pub description: Option<String>,
    pub source: AnomalySource,
}

impl Anomaly {
    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.machine_id.clone(), self.metric_name.clone())
    }

    /// Replay-stable identifier: the same stream, instant and source always
    /// map to the same anomaly id.
    pub fn stable_id(key: &DedupKey, timestamp: DateTime<Utc>, source: AnomalySource) -> Uuid {
        let name = format!(
            "{}\u{1f}{}\u{1f}{}\u{1f}{}",
            key.machine_id,
            key.metric_name,
            timestamp.timestamp_nanos_opt().unwrap_or_else(|| timestamp.timestamp_micros()),
            source.as_str()
        );
        Uuid::new_v5(&Uuid::NAMESPACE_OID, name.as_bytes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_reading_deserializes_ingestion_contract() {
        let json = r#"{"machine_id":"M1","sensor_type":"temp","value":71.5,"unit":"C","timestamp":"2026-03-01T10:00:00Z"}"#;
        let r: SensorReading = serde_json::from_str(json).unwrap();
        assert_eq!(r.reading_id, None);
        assert_eq!(r.key(), DedupKey::new("M1", "temp"));
        assert_eq!(r.anomaly_score, 0.0);
    }

    #[test]
    fn test_stable_id_depends_on_source() {
        let key = DedupKey::new("M1", "temp");
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let a = Anomaly::stable_id(&key, ts, AnomalySource::Telemetry);
        assert_eq!(a, Anomaly::stable_id(&key, ts, AnomalySource::Telemetry));
        assert_ne!(a, Anomaly::stable_id(&key, ts, AnomalySource::Forecast));
    }

    #[test]
    fn test_aggregate_overlap() {
        let t = |m| Utc.with_ymd_and_hms(2026, 3, 1, 10, m, 0).unwrap();
        let agg = |s, e| SensorAggregate {
            machine_id: "M1".into(),
            metric_name: "temp".into(),
            window_start: t(s),
            window_end: t(e),
            rolling_avg: 0.0,
            rolling_std: 0.0,
            anomaly_score: 0.0,
            sample_count: 1,
        };
        assert!(!agg(0, 5).overlaps(&agg(5, 10)));
        assert!(agg(0, 6).overlaps(&agg(5, 10)));
    }
}
