use super::Payload;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// One ordered action of a resolution plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionStep {
    pub action: String,
    #[serde(default)]
    pub params: Payload,
}

impl ResolutionStep {
    pub fn new(action: impl Into<String>, params: Payload) -> Self {
        Self {
            action: action.into(),
            params,
        }
    }
}

/// Ordered remediation for an incident. `executed` flips to true exactly once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolutionPlan {
    pub plan_id: Uuid,
    pub incident_id: Uuid,
    /// `{"report_id": ..., "steps": [{"action": ..., "params": {...}}]}`
    pub resolution_steps: Payload,
    pub executed: bool,
    pub created_at: DateTime<Utc>,
    pub executed_at: Option<DateTime<Utc>>,
}

impl ResolutionPlan {
    pub fn new(incident_id: Uuid, report_id: Uuid, steps: &[ResolutionStep]) -> Self {
        let steps: Vec<Value> = steps
            .iter()
            .map(|s| serde_json::json!({ "action": s.action, "params": s.params }))
            .collect();
        Self {
            plan_id: Uuid::new_v4(),
            incident_id,
            resolution_steps: Payload::new()
                .with("report_id", report_id.to_string())
                .with("steps", steps),
            executed: false,
            created_at: super::now(),
            executed_at: None,
        }
    }

    /// Typed view of `resolution_steps.steps`.
    pub fn steps(&self) -> Result<Vec<ResolutionStep>, serde_json::Error> {
        let raw = self
            .resolution_steps
            .get("steps")
            .cloned()
            .unwrap_or(Value::Array(Vec::new()));
        serde_json::from_value(raw)
    }

    pub fn report_id(&self) -> Option<Uuid> {
        self.resolution_steps
            .get_str("report_id")
            .and_then(|s| Uuid::parse_str(s).ok())
    }
}
