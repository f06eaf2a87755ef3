use super::confidence;
use super::tool::{AnalysisTool, Finding, Hypothesis, ToolRequest};
use super::{InvestigationError, ToolError};
use crate::detect::incident::prepare_transition;
use crate::detect::{DetectError, IncidentManager};
use crate::model::{
    self, Audit, AuditAction, Evidence, Incident, IncidentStatus, InvestigationReport, Payload, ToolCall,
};
use crate::storage::{AuditStore, CatalogStore, IncidentStore, InvestigationStore, StoreError, TelemetryStore};
use futures::future::join_all;
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct InvestigationSettings {
    /// Recorded on every tool call and lifecycle transition the orchestrator makes.
    pub agent_id: String,
    /// Reports must score strictly above this to be accepted.
    pub acceptance_threshold: f64,
    pub tool_timeout: Duration,
    pub aggregate_limit: usize,
    pub anomaly_limit: usize,
    pub message_limit: usize,
}

impl Default for InvestigationSettings {
    fn default() -> Self {
        Self {
            agent_id: "faultline-investigator".to_string(),
            acceptance_threshold: 0.7,
            tool_timeout: Duration::from_secs(30),
            aggregate_limit: 12,
            anomaly_limit: 20,
            message_limit: 20,
        }
    }
}

/// Result of one investigation spell.
#[derive(Debug, Clone, Serialize)]
pub struct InvestigationOutcome {
    /// The incident after the spell: RESOLVING when a report was accepted,
    /// otherwise still INVESTIGATING.
    pub incident: Incident,
    /// Reports filed during this spell with their final confidence.
    pub reports: Vec<InvestigationReport>,
    pub accepted: Option<InvestigationReport>,
    pub tool_calls: Vec<ToolCall>,
}

/// Runs every configured analysis tool against an incident and accepts the
/// strongest hypothesis.
pub struct Orchestrator<S> {
    store: Arc<S>,
    incidents: Arc<IncidentManager<S>>,
    tools: Vec<Arc<dyn AnalysisTool>>,
    settings: InvestigationSettings,
}

impl<S> Orchestrator<S>
where
    S: IncidentStore + AuditStore + InvestigationStore + TelemetryStore + CatalogStore + 'static,
{
    pub fn new(store: Arc<S>, incidents: Arc<IncidentManager<S>>, settings: InvestigationSettings) -> Self {
        Self {
            store,
            incidents,
            tools: Vec::new(),
            settings,
        }
    }

    /// Builder-style tool registration.
    pub fn with_tool(mut self, tool: Arc<dyn AnalysisTool>) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn tool_names(&self) -> Vec<&str> {
        self.tools.iter().map(|t| t.name()).collect()
    }

    pub fn settings(&self) -> &InvestigationSettings {
        &self.settings
    }

    /// Move an OPEN incident to INVESTIGATING, run every tool, file their
    /// reports and accept the best one if it clears the threshold.
    ///
    /// An incident already INVESTIGATING (an earlier spell found nothing
    /// acceptable) is investigated again.
    pub async fn investigate(&self, incident_id: Uuid) -> Result<InvestigationOutcome, InvestigationError> {
        let incident = self
            .store
            .get_incident(incident_id)?
            .ok_or(DetectError::NotFound(incident_id))?;

        let incident = match incident.status {
            IncidentStatus::Open => {
                self.incidents
                    .transition(
                        incident_id,
                        IncidentStatus::Investigating,
                        &self.settings.agent_id,
                        "investigation started",
                    )
                    .await?
            }
            IncidentStatus::Investigating => incident,
            status => {
                return Err(InvestigationError::WrongStatus {
                    id: incident_id,
                    status,
                    expected: IncidentStatus::Open,
                })
            }
        };

        let context = self.context(&incident)?;
        info!(
            incident = %incident_id,
            tools = self.tools.len(),
            "investigation started"
        );

        let results = join_all(self.tools.iter().map(|tool| self.call_tool(tool.as_ref(), &context))).await;

        let mut tool_calls = Vec::with_capacity(results.len());
        let mut filed = Vec::with_capacity(results.len());
        for result in results {
            let (call, parsed) = result?;
            let report = match parsed {
                Ok(h) => {
                    let report = self
                        .file_report(incident_id, &call.tool_name, &h.hypothesis, h.confidence)
                        .await?;
                    for finding in h.evidence {
                        self.attach_evidence(report.report_id, finding).await?;
                    }
                    report
                }
                Err(e) => {
                    self.file_report(
                        incident_id,
                        &call.tool_name,
                        &format!("no hypothesis from {}: {}", call.tool_name, e),
                        0.0,
                    )
                    .await?
                }
            };
            filed.push(report.report_id);
            tool_calls.push(call);
        }

        let accepted = self.accept(incident_id).await?;
        let incident = self
            .store
            .get_incident(incident_id)?
            .ok_or(DetectError::NotFound(incident_id))?;
        let reports = self
            .store
            .reports_for_incident(incident_id)?
            .into_iter()
            .filter(|r| filed.contains(&r.report_id))
            .collect();

        Ok(InvestigationOutcome {
            incident,
            reports,
            accepted,
            tool_calls,
        })
    }

    /// Record a hypothesis for an incident under investigation.
    pub async fn file_report(
        &self,
        incident_id: Uuid,
        investigator_id: &str,
        hypothesis: &str,
        confidence: f64,
    ) -> Result<InvestigationReport, InvestigationError> {
        let incident = self
            .store
            .get_incident(incident_id)?
            .ok_or(DetectError::NotFound(incident_id))?;
        let _guard = self.incidents.lock(&incident.key()).await;
        let incident = self
            .store
            .get_incident(incident_id)?
            .ok_or(DetectError::NotFound(incident_id))?;
        if incident.status != IncidentStatus::Investigating {
            return Err(InvestigationError::WrongStatus {
                id: incident_id,
                status: incident.status,
                expected: IncidentStatus::Investigating,
            });
        }

        let report = InvestigationReport {
            report_id: Uuid::new_v4(),
            incident_id,
            investigator_id: investigator_id.to_string(),
            hypothesis: hypothesis.to_string(),
            confidence,
            created_at: model::now(),
            accepted_at: None,
        };
        let audit = Audit::new(incident_id, investigator_id, AuditAction::ReportFiled)
            .with_comments(format!("report {} ({:.3}): {}", report.report_id, confidence, hypothesis));
        self.store.insert_report(&report, &audit)?;
        debug!(incident = %incident_id, report = %report.report_id, investigator = investigator_id, confidence, "report filed");
        Ok(report)
    }

    /// Append one evidence item and fold its support into the report's
    /// confidence. Returns the stored evidence and the new confidence.
    pub async fn attach_evidence(&self, report_id: Uuid, finding: Finding) -> Result<(Evidence, f64), InvestigationError> {
        let report = self
            .store
            .get_report(report_id)?
            .ok_or(InvestigationError::ReportNotFound(report_id))?;
        let incident = self
            .store
            .get_incident(report.incident_id)?
            .ok_or(DetectError::NotFound(report.incident_id))?;

        // Confidence is read-modify-write; attachments for one incident go one at a time.
        let _guard = self.incidents.lock(&incident.key()).await;
        let report = self
            .store
            .get_report(report_id)?
            .ok_or(InvestigationError::ReportNotFound(report_id))?;

        let support = finding.support();
        let updated = confidence::update(report.confidence, support);
        let evidence = Evidence {
            evidence_id: Uuid::new_v4(),
            report_id,
            source: finding.source,
            evidence_type: finding.evidence_type,
            details: finding.details,
            timestamp: model::now(),
        };
        let audit = Audit::new(report.incident_id, &report.investigator_id, AuditAction::EvidenceAttached)
            .with_comments(format!(
                "{} evidence from {} on report {}: confidence {:.3} -> {:.3}",
                evidence.evidence_type, evidence.source, report_id, report.confidence, updated
            ));
        self.store.attach_evidence(&evidence, updated, &audit)?;
        debug!(report = %report_id, kind = %evidence.evidence_type, from = report.confidence, to = updated, "evidence attached");
        Ok((evidence, updated))
    }

    /// Accept the best report of the current investigation spell and move the
    /// incident to RESOLVING. `None` when no report clears the threshold.
    pub async fn accept(&self, incident_id: Uuid) -> Result<Option<InvestigationReport>, InvestigationError> {
        let incident = self
            .store
            .get_incident(incident_id)?
            .ok_or(DetectError::NotFound(incident_id))?;
        let _guard = self.incidents.lock(&incident.key()).await;

        let incident = self
            .store
            .get_incident(incident_id)?
            .ok_or(DetectError::NotFound(incident_id))?;
        if incident.status != IncidentStatus::Investigating {
            return Err(InvestigationError::WrongStatus {
                id: incident_id,
                status: incident.status,
                expected: IncidentStatus::Investigating,
            });
        }

        // Only reports from the spell that began with the latest move to INVESTIGATING compete.
        let spell_start = self
            .store
            .audit_trail(incident_id)?
            .iter()
            .rev()
            .find(|a| {
                matches!(
                    a.action,
                    AuditAction::Transition {
                        to: IncidentStatus::Investigating,
                        ..
                    }
                )
            })
            .map(|a| a.timestamp);
        let reports: Vec<_> = self
            .store
            .reports_for_incident(incident_id)?
            .into_iter()
            .filter(|r| spell_start.map_or(true, |start| r.created_at >= start))
            .collect();

        let Some(best) = confidence::select_accepted(&reports, self.settings.acceptance_threshold) else {
            info!(
                incident = %incident_id,
                reports = reports.len(),
                threshold = self.settings.acceptance_threshold,
                "no report cleared the acceptance threshold"
            );
            return Ok(None);
        };

        let (next, audit) = prepare_transition(
            &incident,
            IncidentStatus::Resolving,
            &self.settings.agent_id,
            &format!(
                "accepted report {} from {} ({:.3}): {}",
                best.report_id, best.investigator_id, best.confidence, best.hypothesis
            ),
        )?;
        let accepted_at = next.updated_at;
        self.store.accept_report(best.report_id, accepted_at, &next, &audit)?;
        info!(
            incident = %incident_id,
            report = %best.report_id,
            investigator = %best.investigator_id,
            confidence = best.confidence,
            "report accepted"
        );

        let mut accepted = best.clone();
        accepted.accepted_at = Some(accepted_at);
        Ok(Some(accepted))
    }

    fn context(&self, incident: &Incident) -> Result<Payload, InvestigationError> {
        let key = incident.key();
        let aggregates = self.store.recent_aggregates(&key, self.settings.aggregate_limit)?;
        let anomalies = self.store.recent_anomalies(&key, self.settings.anomaly_limit)?;
        let machine = self.store.get_machine(&incident.machine_id)?;
        let messages = self
            .store
            .slack_messages_for_machine(&incident.machine_id, self.settings.message_limit)?;
        let tickets = self.store.open_tickets_for_machine(&incident.machine_id)?;

        Ok(Payload::new()
            .with("incident", serde_json::to_value(incident)?)
            .with("aggregates", serde_json::to_value(aggregates)?)
            .with("anomalies", serde_json::to_value(anomalies)?)
            .with("machine", serde_json::to_value(machine)?)
            .with("messages", serde_json::to_value(messages)?)
            .with("tickets", serde_json::to_value(tickets)?))
    }

    /// Invoke one tool under the timeout and log the call whatever happened.
    async fn call_tool(
        &self,
        tool: &dyn AnalysisTool,
        context: &Payload,
    ) -> Result<(ToolCall, Result<Hypothesis, ToolError>), StoreError> {
        let request = ToolRequest {
            agent_id: self.settings.agent_id.clone(),
            tool_name: tool.name().to_string(),
            request: context.clone(),
        };
        let timestamp = model::now();
        let started = Instant::now();
        let result = match tokio::time::timeout(self.settings.tool_timeout, tool.invoke(&request)).await {
            Ok(result) => result,
            Err(_) => Err(ToolError::Timeout(
                u64::try_from(self.settings.tool_timeout.as_millis()).unwrap_or(u64::MAX),
            )),
        };
        let latency_ms = i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX);

        let (response, tokens_used, parsed) = match result {
            Ok(resp) => {
                let parsed = Hypothesis::from_payload(&resp.response);
                let mut response = resp.response;
                if let Err(e) = &parsed {
                    response.insert("error", e.to_string());
                    response.insert("timeout", false);
                }
                (response, resp.tokens_used, parsed)
            }
            Err(e) => (
                Payload::new()
                    .with("error", e.to_string())
                    .with("timeout", e.is_timeout()),
                0,
                Err(e),
            ),
        };

        let call = ToolCall {
            call_id: Uuid::new_v4(),
            agent_id: request.agent_id,
            tool_name: request.tool_name,
            request: request.request,
            response,
            latency_ms,
            tokens_used,
            timestamp,
        };
        self.store.record_tool_call(&call)?;

        match &parsed {
            Ok(h) => debug!(tool = %call.tool_name, latency_ms, confidence = h.confidence, "tool answered"),
            Err(e) => warn!(tool = %call.tool_name, latency_ms, error = %e, "tool produced no hypothesis"),
        }
        Ok((call, parsed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::investigate::{BaselineShiftTool, ToolResponse};
    use crate::model::{AnomalySource, DedupKey, Priority, Severity, Anomaly};
    use crate::storage::SqliteStore;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    struct Scripted {
        name: &'static str,
        response: serde_json::Value,
    }

    #[async_trait]
    impl AnalysisTool for Scripted {
        fn name(&self) -> &str {
            self.name
        }

        async fn invoke(&self, _request: &ToolRequest) -> Result<ToolResponse, ToolError> {
            Ok(ToolResponse {
                response: Payload::from_value(self.response.clone()),
                tokens_used: 42,
            })
        }
    }

    struct Stalled;

    #[async_trait]
    impl AnalysisTool for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn invoke(&self, _request: &ToolRequest) -> Result<ToolResponse, ToolError> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Err(ToolError::Failed("unreachable".into()))
        }
    }

    fn setup() -> (tempfile::TempDir, Arc<SqliteStore>, Arc<IncidentManager<SqliteStore>>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let manager = Arc::new(IncidentManager::new(store.clone(), chrono::Duration::hours(1), "detector"));
        (dir, store, manager)
    }

    async fn open_incident(manager: &IncidentManager<SqliteStore>) -> Incident {
        let key = DedupKey::new("M1", "temp");
        let ts = Utc.with_ymd_and_hms(2026, 3, 1, 10, 0, 0).unwrap();
        let anomaly = Anomaly {
            anomaly_id: Anomaly::stable_id(&key, ts, AnomalySource::Telemetry),
            machine_id: "M1".into(),
            metric_name: "temp".into(),
            timestamp: ts,
            value: 50.0,
            z_score: 39.0,
            severity: Severity::Critical,
            description: None,
            source: AnomalySource::Telemetry,
        };
        manager.on_anomaly(&anomaly, Priority::Critical).await.unwrap().incident().clone()
    }

    fn settings(timeout_ms: u64) -> InvestigationSettings {
        InvestigationSettings {
            tool_timeout: Duration::from_millis(timeout_ms),
            ..InvestigationSettings::default()
        }
    }

    #[tokio::test]
    async fn test_best_report_is_accepted() {
        let (_dir, store, manager) = setup();
        let incident = open_incident(&manager).await;
        let orchestrator = Orchestrator::new(store.clone(), manager.clone(), settings(1_000))
            .with_tool(Arc::new(Scripted {
                name: "weak",
                response: json!({"hypothesis": "sensor noise", "confidence": 0.4}),
            }))
            .with_tool(Arc::new(Scripted {
                name: "strong",
                response: json!({
                    "hypothesis": "bearing wear",
                    "confidence": 0.65,
                    "evidence": [{"source": "vibration", "type": "spectrum", "details": {"support": 0.8}}]
                }),
            }));

        let outcome = orchestrator.investigate(incident.incident_id).await.unwrap();
        assert_eq!(outcome.incident.status, IncidentStatus::Resolving);
        assert_eq!(outcome.reports.len(), 2);
        assert_eq!(outcome.tool_calls.len(), 2);
        let accepted = outcome.accepted.unwrap();
        assert_eq!(accepted.investigator_id, "strong");
        assert!(accepted.confidence > 0.65);
        assert!(store.get_report(accepted.report_id).unwrap().unwrap().is_accepted());
        assert_eq!(store.evidence_for_report(accepted.report_id).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_nothing_above_threshold_keeps_investigating() {
        let (_dir, store, manager) = setup();
        let incident = open_incident(&manager).await;
        let orchestrator = Orchestrator::new(store.clone(), manager, settings(1_000)).with_tool(Arc::new(Scripted {
            name: "doubtful",
            response: json!({
                "hypothesis": "operator error",
                "confidence": 0.75,
                "evidence": [{"source": "logs", "type": "shift_log", "details": {"support": 0.2}}]
            }),
        }));

        let outcome = orchestrator.investigate(incident.incident_id).await.unwrap();
        assert!(outcome.accepted.is_none());
        assert_eq!(outcome.incident.status, IncidentStatus::Investigating);
        // Contradicting evidence pulled confidence below the threshold.
        assert!(outcome.reports[0].confidence < 0.7);

        // A later spell may investigate again.
        let again = orchestrator.investigate(incident.incident_id).await.unwrap();
        assert_eq!(again.reports.len(), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_logged_and_not_fatal() {
        let (_dir, store, manager) = setup();
        let incident = open_incident(&manager).await;
        let orchestrator = Orchestrator::new(store.clone(), manager, settings(50))
            .with_tool(Arc::new(Stalled))
            .with_tool(Arc::new(BaselineShiftTool))
            .with_tool(Arc::new(Scripted {
                name: "garbled",
                response: json!({"answer": 42}),
            }));

        let outcome = orchestrator.investigate(incident.incident_id).await.unwrap();
        assert_eq!(outcome.tool_calls.len(), 3);

        let calls = store.tool_calls(Some("faultline-investigator"), 10).unwrap();
        let stalled = calls.iter().find(|c| c.tool_name == "stalled").unwrap();
        assert!(stalled.is_error());
        assert!(stalled.timed_out());
        let garbled = calls.iter().find(|c| c.tool_name == "garbled").unwrap();
        assert!(garbled.is_error());
        assert!(!garbled.timed_out());
        assert_eq!(garbled.tokens_used, 42);

        let zero: Vec<_> = outcome.reports.iter().filter(|r| r.confidence == 0.0).collect();
        assert_eq!(zero.len(), 2);
    }

    #[tokio::test]
    async fn test_only_open_incidents_start_an_investigation() {
        let (_dir, store, manager) = setup();
        let incident = open_incident(&manager).await;
        let orchestrator = Orchestrator::new(store.clone(), manager.clone(), settings(1_000));
        manager
            .transition(incident.incident_id, IncidentStatus::Investigating, "op", "")
            .await
            .unwrap();
        manager
            .transition(incident.incident_id, IncidentStatus::Resolving, "op", "")
            .await
            .unwrap();

        let err = orchestrator.investigate(incident.incident_id).await.unwrap_err();
        assert!(matches!(err, InvestigationError::WrongStatus { status: IncidentStatus::Resolving, .. }));
        let err = orchestrator
            .file_report(incident.incident_id, "late", "too late", 0.9)
            .await
            .unwrap_err();
        assert!(matches!(err, InvestigationError::WrongStatus { .. }));
    }

    #[tokio::test]
    async fn test_report_waits_for_incident_lock_and_rechecks_status() {
        let (_dir, store, manager) = setup();
        let incident = open_incident(&manager).await;
        let investigating = manager
            .transition(incident.incident_id, IncidentStatus::Investigating, "op", "")
            .await
            .unwrap();
        let orchestrator = Arc::new(Orchestrator::new(store.clone(), manager.clone(), settings(1_000)));

        let guard = manager.lock(&incident.key()).await;
        let filing = {
            let orchestrator = orchestrator.clone();
            let id = incident.incident_id;
            tokio::spawn(async move { orchestrator.file_report(id, "slow", "late hypothesis", 0.9).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!filing.is_finished());

        // The incident moves on while the report is still waiting.
        let (next, audit) = prepare_transition(&investigating, IncidentStatus::Resolving, "op", "").unwrap();
        store.update_incident(&next, &audit).unwrap();
        drop(guard);

        let err = filing.await.unwrap().unwrap_err();
        assert!(matches!(err, InvestigationError::WrongStatus { status: IncidentStatus::Resolving, .. }));
        assert!(store.reports_for_incident(incident.incident_id).unwrap().is_empty());
    }
}
