//! Predictive forecasting: project each stream's trend forward and raise
//! proactive incidents for values that would be anomalous.

pub mod schedule;
pub mod trend;

pub use self::schedule::{parse_schedule, run_forecast_loop};
pub use self::trend::Projection;

use crate::detect::{AnomalyDetector, AnomalyOutcome, DetectError, IncidentManager};
use crate::model::{Anomaly, AnomalySource, DedupKey, PredictiveForecast, Priority};
use crate::storage::{ForecastStore, IncidentStore, StoreError, TelemetryStore};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error("{key} has {have} closed windows, forecasting needs {need}")]
    InsufficientHistory { key: DedupKey, have: usize, need: usize },

    #[error("{0} has no usable trend")]
    Degenerate(DedupKey),

    #[error("invalid schedule '{expr}': {reason}")]
    Schedule { expr: String, reason: String },
}

#[derive(Debug, Clone)]
pub struct ForecastSettings {
    /// Windows fitted, newest last.
    pub lookback: usize,
    pub min_history: usize,
    pub horizon: Duration,
    /// Proactive incidents need at least this much confidence.
    pub min_confidence: f64,
}

impl Default for ForecastSettings {
    fn default() -> Self {
        Self {
            lookback: 12,
            min_history: 4,
            horizon: Duration::hours(1),
            min_confidence: 0.6,
        }
    }
}

/// What forecasting one stream produced.
#[derive(Debug, Clone, Serialize)]
pub struct ForecastOutcome {
    pub forecast: PredictiveForecast,
    /// Set when the projection crossed a severity threshold with enough confidence.
    pub anomaly: Option<Anomaly>,
    #[serde(skip)]
    pub incident: Option<AnomalyOutcome>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub streams: usize,
    pub forecasts: usize,
    pub skipped: usize,
    pub proactive: usize,
    pub failed: usize,
}

pub struct ForecastEngine<S> {
    store: Arc<S>,
    detector: AnomalyDetector,
    incidents: Arc<IncidentManager<S>>,
    settings: ForecastSettings,
}

impl<S> ForecastEngine<S>
where
    S: TelemetryStore + IncidentStore + ForecastStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        detector: AnomalyDetector,
        incidents: Arc<IncidentManager<S>>,
        settings: ForecastSettings,
    ) -> Self {
        Self {
            store,
            detector,
            incidents,
            settings,
        }
    }

    /// Forecast one stream, persist the forecast and raise a proactive
    /// anomaly when warranted.
    pub async fn forecast(&self, key: &DedupKey) -> Result<ForecastOutcome, ForecastError> {
        let history = self.store.recent_aggregates(key, self.settings.lookback)?;
        if history.len() < self.settings.min_history.max(2) {
            return Err(ForecastError::InsufficientHistory {
                key: key.clone(),
                have: history.len(),
                need: self.settings.min_history.max(2),
            });
        }
        let projection =
            trend::project(&history, self.settings.horizon).ok_or_else(|| ForecastError::Degenerate(key.clone()))?;
        let latest = &history[history.len() - 1];

        let forecast = PredictiveForecast {
            forecast_id: Uuid::new_v4(),
            machine_id: key.machine_id.clone(),
            metric_name: key.metric_name.clone(),
            forecast_time: projection.forecast_time,
            predicted_value: projection.predicted_value,
            confidence: projection.confidence,
            created_at: crate::model::now(),
        };
        self.store.insert_forecast(&forecast)?;
        debug!(
            key = %key,
            at = %forecast.forecast_time,
            value = forecast.predicted_value,
            confidence = forecast.confidence,
            "forecast stored"
        );

        let anomaly = if projection.confidence >= self.settings.min_confidence {
            self.detector.score(
                key,
                projection.forecast_time,
                projection.predicted_value,
                latest,
                AnomalySource::Forecast,
            )
        } else {
            None
        };

        let incident = match &anomaly {
            Some(anomaly) if self.store.get_anomaly(anomaly.anomaly_id)?.is_none() => {
                let priority = if projection.confidence >= 0.9 {
                    Priority::Medium
                } else {
                    Priority::Low
                };
                let outcome = self.incidents.on_anomaly(anomaly, priority).await?;
                self.store.record_anomaly(anomaly)?;
                info!(
                    key = %key,
                    severity = %anomaly.severity,
                    at = %anomaly.timestamp,
                    incident = %outcome.incident().incident_id,
                    "proactive anomaly raised"
                );
                Some(outcome)
            }
            _ => None,
        };

        Ok(ForecastOutcome {
            forecast,
            anomaly,
            incident,
        })
    }

    /// Forecast every stream with closed windows. Failures are logged per
    /// stream and do not stop the scan.
    pub async fn run_scan(&self) -> Result<ScanReport, ForecastError> {
        let streams = self.store.streams()?;
        let mut report = ScanReport {
            streams: streams.len(),
            ..ScanReport::default()
        };
        for key in &streams {
            match self.forecast(key).await {
                Ok(outcome) => {
                    report.forecasts += 1;
                    if outcome.incident.is_some() {
                        report.proactive += 1;
                    }
                }
                Err(ForecastError::InsufficientHistory { have, need, .. }) => {
                    debug!(key = %key, have, need, "not enough history to forecast");
                    report.skipped += 1;
                }
                Err(e) => {
                    warn!(key = %key, error = %e, "forecast failed");
                    report.failed += 1;
                }
            }
        }
        info!(
            streams = report.streams,
            forecasts = report.forecasts,
            proactive = report.proactive,
            failed = report.failed,
            "forecast scan finished"
        );
        Ok(report)
    }

    /// Stored forecasts for a stream with `forecast_time` in `[from, to]`.
    pub fn series(
        &self,
        key: &DedupKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PredictiveForecast>, ForecastError> {
        Ok(self.store.forecasts(key, from, to)?)
    }
}
