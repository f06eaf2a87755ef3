use crate::model::{Anomaly, AnomalySource, DedupKey, SensorAggregate, SensorReading, Severity};
use crate::telemetry::aggregator::MIN_STD;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lower |z| bounds for each severity band. Must be strictly ascending.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeverityThresholds {
    pub low: f64,
    pub medium: f64,
    pub high: f64,
    pub critical: f64,
}

impl Default for SeverityThresholds {
    fn default() -> Self {
        Self {
            low: 2.0,
            medium: 3.0,
            high: 4.5,
            critical: 6.0,
        }
    }
}

impl SeverityThresholds {
    pub fn validate(&self) -> Result<(), String> {
        let bands = [self.low, self.medium, self.high, self.critical];
        if bands.iter().any(|b| !b.is_finite() || *b <= 0.0) {
            return Err(format!("severity thresholds must be positive and finite: {bands:?}"));
        }
        if bands.windows(2).any(|w| w[0] >= w[1]) {
            return Err(format!("severity thresholds must be strictly ascending: {bands:?}"));
        }
        Ok(())
    }

    /// Step function from |z| to severity.
    pub fn classify(&self, z: f64) -> Severity {
        let z = z.abs();
        if z >= self.critical {
            Severity::Critical
        } else if z >= self.high {
            Severity::High
        } else if z >= self.medium {
            Severity::Medium
        } else if z >= self.low {
            Severity::Low
        } else {
            Severity::None
        }
    }
}

/// Scores values against a closed window. Holds no state between calls.
#[derive(Debug, Clone, Copy)]
pub struct AnomalyDetector {
    thresholds: SeverityThresholds,
    min_samples: u64,
}

impl AnomalyDetector {
    pub fn new(thresholds: SeverityThresholds, min_samples: u64) -> Self {
        Self {
            thresholds,
            min_samples,
        }
    }

    pub fn thresholds(&self) -> &SeverityThresholds {
        &self.thresholds
    }

    /// Z-score of `value` against `baseline`, or `None` when the baseline's
    /// variance is undefined (too few samples or no spread).
    pub fn z_score(&self, value: f64, baseline: &SensorAggregate) -> Option<f64> {
        if baseline.sample_count < self.min_samples || baseline.rolling_std < MIN_STD {
            return None;
        }
        Some((value - baseline.rolling_avg) / baseline.rolling_std)
    }

    /// Anomaly for a reading, if its severity against `baseline` is above none.
    pub fn evaluate(&self, reading: &SensorReading, baseline: &SensorAggregate) -> Option<Anomaly> {
        self.score(
            &reading.key(),
            reading.timestamp,
            reading.value,
            baseline,
            AnomalySource::Telemetry,
        )
    }

    /// Shared by reactive detection and forecasting.
    pub fn score(
        &self,
        key: &DedupKey,
        timestamp: DateTime<Utc>,
        value: f64,
        baseline: &SensorAggregate,
        source: AnomalySource,
    ) -> Option<Anomaly> {
        let z = self.z_score(value, baseline)?;
        let severity = self.thresholds.classify(z);
        if severity == Severity::None {
            return None;
        }
        Some(Anomaly {
            anomaly_id: Anomaly::stable_id(key, timestamp, source),
            machine_id: key.machine_id.clone(),
            metric_name: key.metric_name.clone(),
            timestamp,
            value,
            z_score: z,
            severity,
            description: Some(format!(
                "{} {} = {:.3} is {:+.2} sigma from window mean {:.3}",
                key.machine_id, key.metric_name, value, z, baseline.rolling_avg
            )),
            source,
        })
    }
}
