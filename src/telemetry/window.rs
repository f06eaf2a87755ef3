use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// When an open window closes.
///
/// ```toml
/// [telemetry.window]
/// mode = "count"
/// size = 30
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum WindowPolicy {
    /// Close after `size` readings. The next window starts at the reading
    /// that triggered the close.
    Count { size: u64 },
    /// Fixed spans aligned to the Unix epoch. Spans without readings emit nothing.
    Time { seconds: u64 },
}

impl Default for WindowPolicy {
    fn default() -> Self {
        WindowPolicy::Count { size: 30 }
    }
}

impl WindowPolicy {
    pub fn validate(&self) -> Result<(), String> {
        match *self {
            WindowPolicy::Count { size: 0 } => Err("window size must be at least 1".into()),
            WindowPolicy::Time { seconds: 0 } => Err("window span must be at least 1 second".into()),
            WindowPolicy::Time { seconds } if seconds > i64::MAX as u64 / 1000 => {
                Err(format!("window span of {seconds}s is out of range"))
            }
            _ => Ok(()),
        }
    }

    /// Start of the window a fresh stream opens for a reading at `ts`.
    pub fn open_at(&self, ts: DateTime<Utc>) -> DateTime<Utc> {
        match *self {
            WindowPolicy::Count { .. } => ts,
            WindowPolicy::Time { seconds } => align_down(ts, seconds),
        }
    }

    pub fn span(&self) -> Option<Duration> {
        match *self {
            WindowPolicy::Count { .. } => None,
            WindowPolicy::Time { seconds } => Some(Duration::seconds(seconds as i64)),
        }
    }
}

fn align_down(ts: DateTime<Utc>, seconds: u64) -> DateTime<Utc> {
    let span_ms = (seconds.max(1) as i64).saturating_mul(1000);
    let bucket_ms = ts.timestamp_millis().div_euclid(span_ms) * span_ms;
    Utc.timestamp_millis_opt(bucket_ms).single().unwrap_or(ts)
}
