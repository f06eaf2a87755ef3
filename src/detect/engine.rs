use crate::detect::anomaly::AnomalyDetector;
use crate::detect::incident::{AnomalyOutcome, IncidentManager};
use crate::detect::DetectError;
use crate::model::{Anomaly, DedupKey, Priority, SensorAggregate, SensorReading};
use crate::storage::{IncidentStore, TelemetryStore};
use crate::telemetry::{Accepted, StreamAggregator, StreamRegistry, TelemetryError, WindowPolicy};
use chrono::SubsecRound;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one accepted reading produced.
#[derive(Debug, Clone)]
pub struct IngestOutcome {
    /// `None` when the reading was already stored by an earlier run.
    pub reading_id: Option<i64>,
    pub closed: Option<SensorAggregate>,
    pub anomaly: Option<Anomaly>,
    pub incident: Option<AnomalyOutcome>,
}

/// Tally of a batch ingest.
#[derive(Debug, Clone, Default, Serialize)]
pub struct IngestReport {
    pub accepted: usize,
    pub stale: usize,
    pub invalid: usize,
    pub failed: usize,
    pub aggregates: usize,
    pub anomalies: usize,
    pub escalated: usize,
    pub deduplicated: usize,
    /// Incidents opened or reopened by the batch, in first-seen order.
    pub opened: Vec<Uuid>,
}

impl IngestReport {
    fn record(&mut self, result: &Result<IngestOutcome, DetectError>) {
        match result {
            Ok(out) => {
                self.accepted += 1;
                self.aggregates += usize::from(out.closed.is_some());
                self.anomalies += usize::from(out.anomaly.is_some());
                match &out.incident {
                    Some(AnomalyOutcome::Opened(i)) | Some(AnomalyOutcome::Reopened(i)) => {
                        if !self.opened.contains(&i.incident_id) {
                            self.opened.push(i.incident_id);
                        }
                    }
                    Some(AnomalyOutcome::Escalated(_)) => self.escalated += 1,
                    Some(AnomalyOutcome::Deduplicated(_)) => self.deduplicated += 1,
                    None => {}
                }
            }
            Err(DetectError::Telemetry(TelemetryError::StaleReading { .. })) => self.stale += 1,
            Err(DetectError::Telemetry(TelemetryError::InvalidReading(_))) => self.invalid += 1,
            Err(_) => self.failed += 1,
        }
    }

    fn merge(&mut self, other: IngestReport) {
        self.accepted += other.accepted;
        self.stale += other.stale;
        self.invalid += other.invalid;
        self.failed += other.failed;
        self.aggregates += other.aggregates;
        self.anomalies += other.anomalies;
        self.escalated += other.escalated;
        self.deduplicated += other.deduplicated;
        for id in other.opened {
            if !self.opened.contains(&id) {
                self.opened.push(id);
            }
        }
    }
}

/// Reading ingest: aggregate, detect, and fold anomalies into incidents.
pub struct DetectionEngine<S> {
    store: Arc<S>,
    streams: StreamRegistry,
    policy: WindowPolicy,
    detector: AnomalyDetector,
    incidents: Arc<IncidentManager<S>>,
}

impl<S> DetectionEngine<S>
where
    S: TelemetryStore + IncidentStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        policy: WindowPolicy,
        detector: AnomalyDetector,
        incidents: Arc<IncidentManager<S>>,
    ) -> Self {
        Self {
            store,
            streams: StreamRegistry::new(),
            policy,
            detector,
            incidents,
        }
    }

    pub fn detector(&self) -> &AnomalyDetector {
        &self.detector
    }

    /// Live aggregator for `key`, resumed from storage on first use.
    fn stream(&self, key: &DedupKey) -> Result<Arc<tokio::sync::Mutex<StreamAggregator>>, DetectError> {
        if let Some(handle) = self.streams.get(key) {
            return Ok(handle);
        }
        let aggregator = match self.store.open_window(key)? {
            Some(open) => {
                // A window closed by a reading whose ingest then failed ends
                // after `open` started; score against the one before it.
                let baseline = self.store.aggregate_before(key, open.window_start)?;
                debug!(
                    key = %key,
                    window_start = %open.window_start,
                    pending = open.count,
                    "restoring open window"
                );
                StreamAggregator::restore(key.clone(), self.policy, open, baseline)
            }
            None => match self.store.latest_aggregate(key)? {
                Some(latest) => {
                    debug!(key = %key, window_end = %latest.window_end, "resuming stream");
                    StreamAggregator::resume(key.clone(), self.policy, latest)
                }
                None => StreamAggregator::new(key.clone(), self.policy),
            },
        };
        Ok(self.streams.insert(aggregator))
    }

    /// Ingest one reading.
    ///
    /// Stale and invalid readings change nothing. If any write fails after
    /// the reading was accepted, the stream is rolled back so the same
    /// reading can be replayed.
    pub async fn ingest(&self, mut reading: SensorReading) -> Result<IngestOutcome, DetectError> {
        reading.reading_id = None;
        reading.anomaly_score = 0.0;
        reading.timestamp = reading.timestamp.trunc_subsecs(6);

        let key = reading.key();
        let handle = self.stream(&key)?;
        let mut aggregator = handle.lock().await;

        let snapshot = aggregator.clone();
        let accepted = match aggregator.accept(&reading) {
            Ok(accepted) => accepted,
            Err(e) => {
                debug!(key = %key, error = %e, "reading rejected");
                return Err(e.into());
            }
        };

        match self.persist(reading, accepted).await {
            Ok(outcome) => Ok(outcome),
            Err(e) => {
                warn!(key = %key, error = %e, "ingest failed, stream state restored");
                *aggregator = snapshot;
                Err(e)
            }
        }
    }

    async fn persist(&self, mut reading: SensorReading, accepted: Accepted) -> Result<IngestOutcome, DetectError> {
        if let Some(closed) = &accepted.closed {
            if self.store.record_aggregate(closed)? {
                debug!(
                    key = %closed.key(),
                    mean = closed.rolling_avg,
                    std = closed.rolling_std,
                    samples = closed.sample_count,
                    "window closed"
                );
            }
        }

        let mut anomaly = None;
        let mut incident = None;
        if let Some(baseline) = &accepted.baseline {
            if let Some(z) = self.detector.z_score(reading.value, baseline) {
                reading.anomaly_score = z.abs();
            }
            if let Some(found) = self.detector.evaluate(&reading, baseline) {
                // A replayed anomaly was already folded into its incident.
                if self.store.get_anomaly(found.anomaly_id)?.is_none() {
                    info!(
                        key = %found.key(),
                        z = found.z_score,
                        severity = %found.severity,
                        value = found.value,
                        "anomaly detected"
                    );
                    incident = Some(
                        self.incidents
                            .on_anomaly(&found, Priority::from(found.severity))
                            .await?,
                    );
                    self.store.record_anomaly(&found)?;
                }
                anomaly = Some(found);
            }
        }

        let reading_id = self.store.record_reading(&reading, &accepted.open)?;
        if reading_id.is_none() {
            debug!(key = %reading.key(), ts = %reading.timestamp, "reading already stored");
        }

        Ok(IngestOutcome {
            reading_id,
            closed: accepted.closed,
            anomaly,
            incident,
        })
    }

    /// Ingest a batch. Streams are processed concurrently, readings within a
    /// stream in the order given.
    pub async fn ingest_batch(self: &Arc<Self>, readings: Vec<SensorReading>) -> IngestReport {
        let mut by_stream: HashMap<DedupKey, Vec<SensorReading>> = HashMap::new();
        for r in readings {
            by_stream.entry(r.key()).or_default().push(r);
        }

        let mut tasks = JoinSet::new();
        for (key, readings) in by_stream {
            let engine = Arc::clone(self);
            tasks.spawn(async move {
                let mut report = IngestReport::default();
                for reading in readings {
                    let result = engine.ingest(reading).await;
                    if let Err(e) = &result {
                        match e {
                            DetectError::Telemetry(_) => debug!(key = %key, error = %e, "reading dropped"),
                            _ => error!(key = %key, error = %e, "reading failed"),
                        }
                    }
                    report.record(&result);
                }
                report
            });
        }

        let mut total = IngestReport::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(report) => total.merge(report),
                Err(e) => error!(error = %e, "ingest task panicked"),
            }
        }
        info!(
            accepted = total.accepted,
            stale = total.stale,
            invalid = total.invalid,
            failed = total.failed,
            anomalies = total.anomalies,
            opened = total.opened.len(),
            "batch ingested"
        );
        total
    }
}
