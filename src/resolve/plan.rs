use crate::model::{Evidence, Incident, Payload, ResolutionStep};
use serde_json::Value;
use tracing::warn;

/// Evidence type whose `details.steps` carries a proposed remediation.
pub const REMEDIATION: &str = "remediation";

/// Steps for an incident from the accepted report's evidence. The latest
/// readable remediation wins; without one the operator is notified and an
/// inspection scheduled.
pub fn steps_for(incident: &Incident, evidence: &[Evidence]) -> Vec<ResolutionStep> {
    for item in evidence.iter().rev().filter(|e| e.evidence_type == REMEDIATION) {
        let raw = item.details.get("steps").cloned().unwrap_or(Value::Null);
        match serde_json::from_value::<Vec<ResolutionStep>>(raw) {
            Ok(steps) if !steps.is_empty() => return steps,
            Ok(_) => {}
            Err(e) => warn!(evidence = %item.evidence_id, error = %e, "unreadable remediation steps ignored"),
        }
    }
    default_steps(incident)
}

pub fn default_steps(incident: &Incident) -> Vec<ResolutionStep> {
    let target = Payload::new()
        .with("machine_id", incident.machine_id.clone())
        .with("metric_name", incident.metric_name.clone());
    vec![
        ResolutionStep::new("notify_operator", target.clone().with("priority", incident.priority.as_str())),
        ResolutionStep::new("schedule_inspection", target),
    ]
}
