//! Persisted records shared by every stage of the pipeline.
//!
//! Field names follow the persisted schema. Nullable columns are `Option`,
//! schema-less JSON columns are [`Payload`].

pub mod catalog;
pub mod forecast;
pub mod incident;
pub mod investigation;
pub mod resolution;
pub mod telemetry;

mod payload;

pub use self::catalog::{Machine, SlackMessage, SupportTicket};
pub use self::forecast::PredictiveForecast;
pub use self::incident::{Audit, AuditAction, Incident, IncidentStatus};
pub use self::investigation::{Evidence, InvestigationReport, ToolCall};
pub use self::payload::Payload;
pub use self::resolution::{ResolutionPlan, ResolutionStep};
pub use self::telemetry::{Anomaly, OpenWindow, SensorAggregate, SensorReading};

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Current time truncated to the microsecond precision used in storage, so
/// values handed back to callers compare equal to what is read back later.
pub fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(6)
}

#[derive(Debug, Error)]
#[error("unknown {kind} '{value}'")]
pub struct ParseEnumError {
    pub kind: &'static str,
    pub value: String,
}

impl ParseEnumError {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}

/// Anomaly severity. Ordered: `None < Low < Medium < High < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    None,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::None => "none",
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "none" => Ok(Severity::None),
            "low" => Ok(Severity::Low),
            "medium" => Ok(Severity::Medium),
            "high" => Ok(Severity::High),
            "critical" => Ok(Severity::Critical),
            other => Err(ParseEnumError::new("severity", other)),
        }
    }
}

/// Incident priority. Escalation only ever moves up this ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl From<Severity> for Priority {
    fn from(severity: Severity) -> Self {
        match severity {
            Severity::None | Severity::Low => Priority::Low,
            Severity::Medium => Priority::Medium,
            Severity::High => Priority::High,
            Severity::Critical => Priority::Critical,
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "low" => Ok(Priority::Low),
            "medium" => Ok(Priority::Medium),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => Err(ParseEnumError::new("priority", other)),
        }
    }
}

/// What raised an anomaly (and therefore an incident).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalySource {
    /// Observed sensor reading.
    Telemetry,
    /// Predicted by the forecast engine.
    Forecast,
}

impl AnomalySource {
    pub fn as_str(self) -> &'static str {
        match self {
            AnomalySource::Telemetry => "telemetry",
            AnomalySource::Forecast => "forecast",
        }
    }
}

impl fmt::Display for AnomalySource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AnomalySource {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "telemetry" => Ok(AnomalySource::Telemetry),
            "forecast" => Ok(AnomalySource::Forecast),
            other => Err(ParseEnumError::new("source", other)),
        }
    }
}

/// `(machine, metric)` pair identifying one telemetry stream and the
/// deduplication key for incidents raised from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DedupKey {
    pub machine_id: String,
    pub metric_name: String,
}

impl DedupKey {
    pub fn new(machine_id: impl Into<String>, metric_name: impl Into<String>) -> Self {
        Self {
            machine_id: machine_id.into(),
            metric_name: metric_name.into(),
        }
    }
}

impl fmt::Display for DedupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.machine_id, self.metric_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_severity_ordering_is_monotonic() {
        assert!(Severity::None < Severity::Low);
        assert!(Severity::Low < Severity::Medium);
        assert!(Severity::Medium < Severity::High);
        assert!(Severity::High < Severity::Critical);
    }

    #[test]
    fn test_priority_from_severity() {
        assert_eq!(Priority::from(Severity::None), Priority::Low);
        assert_eq!(Priority::from(Severity::Medium), Priority::Medium);
        assert_eq!(Priority::from(Severity::Critical), Priority::Critical);
        assert_eq!(Priority::High.max(Priority::Medium), Priority::High);
    }

    #[test]
    fn test_enum_strings_parse_back() {
        for s in [Severity::None, Severity::Low, Severity::High, Severity::Critical] {
            assert_eq!(s.as_str().parse::<Severity>().unwrap(), s);
        }
        for p in [Priority::Low, Priority::Critical] {
            assert_eq!(p.as_str().parse::<Priority>().unwrap(), p);
        }
        assert!("urgent".parse::<Priority>().is_err());
        assert_eq!("forecast".parse::<AnomalySource>().unwrap(), AnomalySource::Forecast);
    }

    #[test]
    fn test_now_is_microsecond_precision() {
        let t = now();
        assert_eq!(t.timestamp_subsec_nanos() % 1_000, 0);
    }
}
