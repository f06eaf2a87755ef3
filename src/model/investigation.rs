use super::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A competing hypothesis for one incident.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvestigationReport {
    pub report_id: Uuid,
    pub incident_id: Uuid,
    pub investigator_id: String,
    pub hypothesis: String,
    pub confidence: f64,
    pub created_at: DateTime<Utc>,
    /// Set when this report was selected to drive resolution.
    pub accepted_at: Option<DateTime<Utc>>,
}

impl InvestigationReport {
    pub fn is_accepted(&self) -> bool {
        self.accepted_at.is_some()
    }
}

/// One item supporting (or contradicting) a report. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Evidence {
    pub evidence_id: Uuid,
    pub report_id: Uuid,
    pub source: String,
    #[serde(rename = "type")]
    pub evidence_type: String,
    pub details: Payload,
    pub timestamp: DateTime<Utc>,
}

/// Immutable log of one external tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: Uuid,
    pub agent_id: String,
    pub tool_name: String,
    pub request: Payload,
    pub response: Payload,
    pub latency_ms: i64,
    pub tokens_used: i64,
    pub timestamp: DateTime<Utc>,
}

impl ToolCall {
    pub fn is_error(&self) -> bool {
        self.response.get("error").is_some()
    }

    pub fn timed_out(&self) -> bool {
        self.response.get_bool("timeout").unwrap_or(false)
    }
}
