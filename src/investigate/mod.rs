//! Investigation: concurrent analysis tools, competing reports, evidence
//! driven confidence and acceptance of the report that drives resolution.

pub mod builtin;
pub mod confidence;
pub mod orchestrator;
pub mod tool;

pub use self::builtin::BaselineShiftTool;
pub use self::orchestrator::{InvestigationOutcome, InvestigationSettings, Orchestrator};
pub use self::tool::{AnalysisTool, Finding, Hypothesis, ToolRequest, ToolResponse};

use crate::detect::DetectError;
use crate::model::IncidentStatus;
use crate::storage::StoreError;
use thiserror::Error;
use uuid::Uuid;

/// Why a single tool invocation produced no usable hypothesis. Never fatal to
/// the investigation; the call is still logged.
#[derive(Debug, Clone, Error)]
pub enum ToolError {
    #[error("tool failed: {0}")]
    Failed(String),

    #[error("tool timed out after {0} ms")]
    Timeout(u64),

    #[error("malformed tool response: {0}")]
    MalformedResponse(String),
}

impl ToolError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ToolError::Timeout(_))
    }
}

#[derive(Debug, Error)]
pub enum InvestigationError {
    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to encode investigation context: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("report {0} not found")]
    ReportNotFound(Uuid),

    #[error("incident {id} is {status}, expected {expected}")]
    WrongStatus {
        id: Uuid,
        status: IncidentStatus,
        expected: IncidentStatus,
    },
}

impl InvestigationError {
    pub fn is_retryable(&self) -> bool {
        match self {
            InvestigationError::Detect(e) => e.is_retryable(),
            InvestigationError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}
