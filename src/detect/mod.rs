//! Anomaly detection, incident deduplication and the ingest path that ties
//! them to the telemetry aggregator.

pub mod anomaly;
pub mod engine;
pub mod incident;

pub use self::anomaly::{AnomalyDetector, SeverityThresholds};
pub use self::engine::{DetectionEngine, IngestOutcome, IngestReport};
pub use self::incident::{AnomalyOutcome, IncidentManager};

use crate::model::IncidentStatus;
use crate::storage::StoreError;
use crate::telemetry::TelemetryError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error(transparent)]
    Telemetry(#[from] TelemetryError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("incident {0} not found")]
    NotFound(Uuid),

    #[error("incident {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: IncidentStatus,
        to: IncidentStatus,
    },
}

impl DetectError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, DetectError::Store(e) if e.is_retryable())
    }
}
