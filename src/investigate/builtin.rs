use super::tool::{AnalysisTool, ToolRequest, ToolResponse};
use super::ToolError;
use crate::model::Payload;
use async_trait::async_trait;
use serde_json::{json, Value};

/// Window drift (in previous-window σ) at which a sustained shift is assumed.
const SHIFT_DRIFT: f64 = 2.0;

/// Reads the investigation context and decides between a sustained baseline
/// shift and a transient excursion, from the drift of the latest closed window.
#[derive(Debug, Clone, Default)]
pub struct BaselineShiftTool;

impl BaselineShiftTool {
    pub const NAME: &'static str = "baseline-shift";

    fn analyse(context: &Payload) -> Payload {
        let metric = context
            .get_object("incident")
            .and_then(|i| i.get_str("metric_name").map(str::to_string))
            .unwrap_or_else(|| "metric".to_string());

        let aggregates = context.get_array("aggregates").cloned().unwrap_or_default();
        let Some(latest) = aggregates.last() else {
            return Payload::from_value(json!({
                "hypothesis": format!("insufficient telemetry to characterise {metric}"),
                "confidence": 0.3,
                "evidence": [],
            }));
        };

        let drift = latest.get("anomaly_score").and_then(Value::as_f64).unwrap_or(0.0).abs();
        let mean = latest.get("rolling_average").and_then(Value::as_f64).unwrap_or(0.0);
        let shifted = drift >= SHIFT_DRIFT;
        let anomalies = context.get_array("anomalies").map(Vec::len).unwrap_or(0);
        let tickets = context.get_array("tickets").cloned().unwrap_or_default();

        let (hypothesis, confidence, support) = if shifted {
            (
                format!("sustained baseline shift in {metric}: window mean {mean:.3} drifted {drift:.2} sigma"),
                0.6,
                (0.5 + 0.1 * drift).min(0.95),
            )
        } else {
            (
                format!("transient excursion in {metric}: baseline stable at {mean:.3}"),
                0.55,
                0.5 + 0.1 * (SHIFT_DRIFT - drift),
            )
        };

        let mut evidence = vec![json!({
            "source": "telemetry",
            "type": "aggregate_drift",
            "details": {
                "drift_sigma": drift,
                "window_mean": mean,
                "windows": aggregates.len(),
                "recent_anomalies": anomalies,
                "support": support,
            },
        })];

        if !tickets.is_empty() {
            let ids: Vec<Value> = tickets.iter().filter_map(|t| t.get("ticket_id").cloned()).collect();
            evidence.push(json!({
                "source": "support",
                "type": "support_ticket",
                "details": { "open_tickets": ids, "support": 0.7 },
            }));
        }

        let mut steps = vec![
            json!({"action": "notify_operator", "params": {"reason": hypothesis}}),
            json!({"action": "schedule_inspection", "params": {"metric": metric}}),
        ];
        if shifted {
            steps.push(json!({"action": "recalibrate_sensor", "params": {"metric": metric}}));
        }
        evidence.push(json!({
            "source": Self::NAME,
            "type": "remediation",
            "details": { "steps": steps },
        }));

        Payload::from_value(json!({
            "hypothesis": hypothesis,
            "confidence": confidence,
            "evidence": evidence,
        }))
    }
}

#[async_trait]
impl AnalysisTool for BaselineShiftTool {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn invoke(&self, request: &ToolRequest) -> Result<ToolResponse, ToolError> {
        Ok(ToolResponse {
            response: Self::analyse(&request.request),
            tokens_used: 0,
        })
    }
}
