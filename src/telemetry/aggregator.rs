use super::welford::RunningStats;
use super::window::WindowPolicy;
use super::TelemetryError;
use crate::model::{DedupKey, OpenWindow, SensorAggregate, SensorReading};
use chrono::{DateTime, Utc};

/// Below this a window's spread is treated as zero.
pub const MIN_STD: f64 = 1e-9;

/// Result of accepting one reading.
#[derive(Debug, Clone, PartialEq)]
pub struct Accepted {
    /// Window closed by this reading, if any.
    pub closed: Option<SensorAggregate>,
    /// Latest closed window, which the reading is scored against.
    pub baseline: Option<SensorAggregate>,
    /// The open window including this reading, to be persisted with it.
    pub open: OpenWindow,
}

/// Window state for a single `(machine, metric)` stream.
///
/// `Clone` is cheap; callers snapshot before [`accept`](Self::accept) and
/// restore the snapshot if the downstream write fails.
#[derive(Debug, Clone)]
pub struct StreamAggregator {
    key: DedupKey,
    policy: WindowPolicy,
    stats: RunningStats,
    window_start: Option<DateTime<Utc>>,
    last_seen: Option<DateTime<Utc>>,
    baseline: Option<SensorAggregate>,
}

impl StreamAggregator {
    pub fn new(key: DedupKey, policy: WindowPolicy) -> Self {
        Self {
            key,
            policy,
            stats: RunningStats::new(),
            window_start: None,
            last_seen: None,
            baseline: None,
        }
    }

    /// Continue a stream after its latest persisted window. Readings before
    /// that window's end are stale.
    pub fn resume(key: DedupKey, policy: WindowPolicy, latest: SensorAggregate) -> Self {
        let mut agg = Self::new(key, policy);
        agg.window_start = Some(latest.window_end);
        agg.baseline = Some(latest);
        agg
    }

    /// Continue a stream inside its persisted open window. `baseline` is the
    /// last window closed before `open` started.
    pub fn restore(key: DedupKey, policy: WindowPolicy, open: OpenWindow, baseline: Option<SensorAggregate>) -> Self {
        let mut agg = Self::new(key, policy);
        agg.stats = RunningStats::from_parts(open.count, open.mean, open.m2);
        agg.window_start = Some(open.window_start);
        agg.last_seen = Some(open.last_seen);
        agg.baseline = baseline;
        agg
    }

    pub fn key(&self) -> &DedupKey {
        &self.key
    }

    pub fn baseline(&self) -> Option<&SensorAggregate> {
        self.baseline.as_ref()
    }

    /// Readings in the open window.
    pub fn pending(&self) -> u64 {
        self.stats.count()
    }

    /// Accept the next reading of the stream. Rejected readings leave the
    /// state untouched.
    pub fn accept(&mut self, reading: &SensorReading) -> Result<Accepted, TelemetryError> {
        self.validate(reading)?;
        let ts = reading.timestamp;

        let mut closed = None;
        match self.window_start {
            None => self.window_start = Some(self.policy.open_at(ts)),
            Some(start) => match self.policy {
                WindowPolicy::Count { size } => {
                    if self.stats.count() >= size {
                        closed = Some(self.close(start, ts));
                        self.window_start = Some(ts);
                    }
                }
                WindowPolicy::Time { seconds } => {
                    let aligned = self.policy.open_at(ts);
                    if aligned > start {
                        if !self.stats.is_empty() {
                            let end = start + chrono::Duration::seconds(seconds as i64);
                            closed = Some(self.close(start, end));
                        }
                        self.window_start = Some(aligned);
                    }
                }
            },
        }

        self.stats.push(reading.value);
        self.last_seen = Some(ts);

        let open = OpenWindow {
            machine_id: self.key.machine_id.clone(),
            metric_name: self.key.metric_name.clone(),
            window_start: self.window_start.unwrap_or(ts),
            last_seen: ts,
            count: self.stats.count(),
            mean: self.stats.mean(),
            m2: self.stats.m2(),
        };
        Ok(Accepted {
            closed,
            baseline: self.baseline.clone(),
            open,
        })
    }

    fn validate(&self, reading: &SensorReading) -> Result<(), TelemetryError> {
        if reading.machine_id != self.key.machine_id || reading.sensor_type != self.key.metric_name {
            return Err(TelemetryError::InvalidReading(format!(
                "reading for {}/{} routed to stream {}",
                reading.machine_id, reading.sensor_type, self.key
            )));
        }
        if !reading.value.is_finite() {
            return Err(TelemetryError::InvalidReading(format!(
                "non-finite value {} for {}",
                reading.value, self.key
            )));
        }
        let floor = match (self.last_seen, self.window_start) {
            (Some(last), _) if reading.timestamp <= last => Some(last),
            (_, Some(start)) if reading.timestamp < start => Some(start),
            _ => None,
        };
        if let Some(last) = floor {
            return Err(TelemetryError::StaleReading {
                key: self.key.clone(),
                timestamp: reading.timestamp,
                last,
            });
        }
        Ok(())
    }

    fn close(&mut self, start: DateTime<Utc>, end: DateTime<Utc>) -> SensorAggregate {
        let mean = self.stats.mean();
        let drift = match &self.baseline {
            Some(prev) if prev.rolling_std >= MIN_STD => (mean - prev.rolling_avg).abs() / prev.rolling_std,
            _ => 0.0,
        };
        let aggregate = SensorAggregate {
            machine_id: self.key.machine_id.clone(),
            metric_name: self.key.metric_name.clone(),
            window_start: start,
            window_end: end,
            rolling_avg: mean,
            rolling_std: self.stats.std_dev(),
            anomaly_score: drift,
            sample_count: self.stats.count(),
        };
        self.stats.reset();
        self.baseline = Some(aggregate.clone());
        aggregate
    }
}
