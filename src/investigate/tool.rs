//! The contract between the orchestrator and an analysis tool.

use super::ToolError;
use crate::model::Payload;
use async_trait::async_trait;
use serde::Serialize;

/// One invocation of a tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolRequest {
    pub agent_id: String,
    pub tool_name: String,
    pub request: Payload,
}

#[derive(Debug, Clone, Default)]
pub struct ToolResponse {
    pub response: Payload,
    pub tokens_used: i64,
}

/// An external analysis capability. Implementations report what they found;
/// the orchestrator measures latency, applies the timeout and logs the call.
#[async_trait]
pub trait AnalysisTool: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &ToolRequest) -> Result<ToolResponse, ToolError>;
}

/// One evidence item proposed by a tool.
#[derive(Debug, Clone, PartialEq)]
pub struct Finding {
    pub source: String,
    pub evidence_type: String,
    pub details: Payload,
}

impl Finding {
    /// How strongly this item supports its hypothesis, in `[0, 1]`.
    pub fn support(&self) -> Option<f64> {
        self.details.get_f64("support").filter(|s| s.is_finite())
    }
}

/// A tool response read as `{hypothesis, confidence, evidence: [{source, type, details}]}`.
#[derive(Debug, Clone, PartialEq)]
pub struct Hypothesis {
    pub hypothesis: String,
    pub confidence: f64,
    pub evidence: Vec<Finding>,
}

impl Hypothesis {
    pub fn from_payload(response: &Payload) -> Result<Self, ToolError> {
        let malformed = |reason: String| ToolError::MalformedResponse(reason);

        let hypothesis = response
            .get_str("hypothesis")
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| malformed("missing hypothesis".into()))?
            .to_string();

        let confidence = response
            .get_f64("confidence")
            .ok_or_else(|| malformed("missing numeric confidence".into()))?;
        if !(0.0..=1.0).contains(&confidence) {
            return Err(malformed(format!("confidence {confidence} outside [0, 1]")));
        }

        let mut evidence = Vec::new();
        if let Some(items) = response.get("evidence") {
            let items = items
                .as_array()
                .ok_or_else(|| malformed("evidence is not an array".into()))?;
            for (i, item) in items.iter().enumerate() {
                let item = item
                    .as_object()
                    .ok_or_else(|| malformed(format!("evidence[{i}] is not an object")))?;
                let text = |field: &str| {
                    item.get(field)
                        .and_then(|v| v.as_str())
                        .map(str::to_string)
                        .ok_or_else(|| malformed(format!("evidence[{i}] missing {field}")))
                };
                let details = match item.get("details") {
                    None | Some(serde_json::Value::Null) => Payload::new(),
                    Some(serde_json::Value::Object(map)) => Payload::from(map.clone()),
                    Some(_) => return Err(malformed(format!("evidence[{i}] details is not an object"))),
                };
                evidence.push(Finding {
                    source: text("source")?,
                    evidence_type: text("type")?,
                    details,
                });
            }
        }

        Ok(Self {
            hypothesis,
            confidence,
            evidence,
        })
    }
}
