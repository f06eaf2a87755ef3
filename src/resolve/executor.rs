use super::{plan, ResolutionError, StepRunner};
use crate::detect::incident::prepare_transition;
use crate::detect::{DetectError, IncidentManager};
use crate::keyed::KeyedLocks;
use crate::model::{Audit, AuditAction, Incident, IncidentStatus, ResolutionPlan};
use crate::storage::{AuditStore, IncidentStore, InvestigationStore, MarkExecuted, ResolutionStore};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct ExecutorSettings {
    pub actor_id: String,
    pub step_timeout: Duration,
}

impl Default for ExecutorSettings {
    fn default() -> Self {
        Self {
            actor_id: "faultline-resolver".to_string(),
            step_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    Executed { plan_id: Uuid, executed_at: DateTime<Utc> },
    /// The plan had already run; nothing was done this time.
    AlreadyExecuted { plan_id: Uuid, executed_at: DateTime<Utc> },
}

impl ExecutionOutcome {
    pub fn executed_at(&self) -> DateTime<Utc> {
        match self {
            ExecutionOutcome::Executed { executed_at, .. } | ExecutionOutcome::AlreadyExecuted { executed_at, .. } => {
                *executed_at
            }
        }
    }
}

pub struct ResolutionExecutor<S> {
    store: Arc<S>,
    incidents: Arc<IncidentManager<S>>,
    runner: Arc<dyn StepRunner>,
    plan_locks: KeyedLocks<Uuid>,
    settings: ExecutorSettings,
}

impl<S> ResolutionExecutor<S>
where
    S: IncidentStore + AuditStore + InvestigationStore + ResolutionStore + 'static,
{
    pub fn new(
        store: Arc<S>,
        incidents: Arc<IncidentManager<S>>,
        runner: Arc<dyn StepRunner>,
        settings: ExecutorSettings,
    ) -> Self {
        Self {
            store,
            incidents,
            runner,
            plan_locks: KeyedLocks::new(),
            settings,
        }
    }

    /// The plan for a RESOLVING incident: the pending one if a previous
    /// attempt left it unexecuted for the same accepted report, otherwise a
    /// new plan from the accepted report.
    pub async fn prepare(&self, incident_id: Uuid) -> Result<ResolutionPlan, ResolutionError> {
        let incident = self.resolving(incident_id)?;
        let _guard = self.incidents.lock(&incident.key()).await;
        let incident = self.resolving(incident_id)?;

        let report = self
            .store
            .reports_for_incident(incident_id)?
            .into_iter()
            .filter(|r| r.is_accepted())
            .max_by_key(|r| r.accepted_at)
            .ok_or(ResolutionError::NoAcceptedReport(incident_id))?;

        // Plans left over from an earlier investigation are never reused.
        if let Some(pending) = self
            .store
            .plans_for_incident(incident_id)?
            .into_iter()
            .rev()
            .find(|p| !p.executed && p.report_id() == Some(report.report_id))
        {
            debug!(incident = %incident_id, plan = %pending.plan_id, "reusing pending plan");
            return Ok(pending);
        }

        let evidence = self.store.evidence_for_report(report.report_id)?;
        let steps = plan::steps_for(&incident, &evidence);

        let plan = ResolutionPlan::new(incident_id, report.report_id, &steps);
        let actions: Vec<_> = steps.iter().map(|s| s.action.as_str()).collect();
        let audit = Audit::new(incident_id, &self.settings.actor_id, AuditAction::PlanCreated).with_comments(format!(
            "plan {} from report {}: {}",
            plan.plan_id,
            report.report_id,
            actions.join(", ")
        ));
        self.store.insert_plan(&plan, &audit)?;
        info!(incident = %incident_id, plan = %plan.plan_id, steps = steps.len(), "resolution plan created");
        Ok(plan)
    }

    /// Run a plan's steps in order and resolve the incident. Running a plan
    /// that already ran is a no-op returning the original completion time.
    pub async fn execute(&self, plan_id: Uuid) -> Result<ExecutionOutcome, ResolutionError> {
        let _plan_guard = self.plan_locks.lock(&plan_id).await;

        let plan = self
            .store
            .get_plan(plan_id)?
            .ok_or(ResolutionError::PlanNotFound(plan_id))?;
        if let Some(executed_at) = plan.executed_at {
            debug!(plan = %plan_id, "plan already executed");
            return Ok(ExecutionOutcome::AlreadyExecuted { plan_id, executed_at });
        }

        let incident = self.resolving(plan.incident_id)?;
        let steps = plan.steps().map_err(|e| ResolutionError::MalformedPlan {
            plan_id,
            reason: e.to_string(),
        })?;

        for (index, step) in steps.iter().enumerate() {
            let reason = match tokio::time::timeout(self.settings.step_timeout, self.runner.run(&incident, step)).await {
                Ok(Ok(())) => {
                    debug!(plan = %plan_id, step = index, action = %step.action, "step completed");
                    continue;
                }
                Ok(Err(e)) => format!("{e:#}"),
                Err(_) => format!("timed out after {} ms", self.settings.step_timeout.as_millis()),
            };

            warn!(plan = %plan_id, step = index, action = %step.action, %reason, "resolution step failed");
            let audit = Audit::new(incident.incident_id, &self.settings.actor_id, AuditAction::PlanFailed)
                .with_comments(format!("plan {} step {} ({}): {}", plan_id, index, step.action, reason));
            self.store.append_audit(&audit)?;
            return Err(ResolutionError::StepFailed {
                plan_id,
                step: index,
                action: step.action.clone(),
                reason,
            });
        }

        let _key_guard = self.incidents.lock(&incident.key()).await;
        let incident = self.resolving(plan.incident_id)?;
        let (next, audit) = prepare_transition(
            &incident,
            IncidentStatus::Resolved,
            &self.settings.actor_id,
            &format!("plan {} executed ({} steps)", plan_id, steps.len()),
        )?;
        let executed_at = next.updated_at;
        match self.store.mark_executed(plan_id, executed_at, &next, &audit)? {
            MarkExecuted::Marked => {
                info!(incident = %incident.incident_id, plan = %plan_id, "incident resolved");
                Ok(ExecutionOutcome::Executed { plan_id, executed_at })
            }
            MarkExecuted::AlreadyExecuted(executed_at) => {
                debug!(plan = %plan_id, "plan executed concurrently");
                Ok(ExecutionOutcome::AlreadyExecuted { plan_id, executed_at })
            }
        }
    }

    /// `prepare` then `execute`.
    pub async fn resolve(&self, incident_id: Uuid) -> Result<ExecutionOutcome, ResolutionError> {
        let plan = self.prepare(incident_id).await?;
        self.execute(plan.plan_id).await
    }

    fn resolving(&self, incident_id: Uuid) -> Result<Incident, ResolutionError> {
        let incident = self
            .store
            .get_incident(incident_id)?
            .ok_or(DetectError::NotFound(incident_id))?;
        if incident.status != IncidentStatus::Resolving {
            return Err(ResolutionError::NotResolving {
                id: incident_id,
                status: incident.status,
            });
        }
        Ok(incident)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Anomaly, AnomalySource, DedupKey, Evidence, InvestigationReport, Payload, Priority, ResolutionStep, Severity};
    use crate::resolve::DryRunStepRunner;
    use crate::storage::SqliteStore;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` runs of `action`, counting every step run.
    #[derive(Default)]
    struct Flaky {
        action: &'static str,
        failures: AtomicUsize,
        runs: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl StepRunner for Flaky {
        async fn run(&self, _incident: &Incident, step: &ResolutionStep) -> anyhow::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            if step.action == self.action
                && self
                    .failures
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok()
            {
                anyhow::bail!("actuator offline");
            }
            Ok(())
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<SqliteStore>,
        manager: Arc<IncidentManager<SqliteStore>>,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("t.db").to_str().unwrap()).unwrap());
        let manager = Arc::new(IncidentManager::new(store.clone(), chrono::Duration::hours(1), "detector"));
        Fixture {
            _dir: dir,
            store,
            manager,
        }
    }

    /// An incident moved to RESOLVING through an accepted report.
    async fn resolving_incident(fx: &Fixture, remediation: Option<serde_json::Value>) -> Incident {
        let key = DedupKey::new("M9", "pressure");
        let ts = Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).unwrap();
        let anomaly = Anomaly {
            anomaly_id: Anomaly::stable_id(&key, ts, AnomalySource::Telemetry),
            machine_id: key.machine_id.clone(),
            metric_name: key.metric_name.clone(),
            timestamp: ts,
            value: 9.0,
            z_score: 5.0,
            severity: Severity::High,
            description: None,
            source: AnomalySource::Telemetry,
        };
        let incident = fx.manager.on_anomaly(&anomaly, Priority::High).await.unwrap().incident().clone();
        let investigating = fx
            .manager
            .transition(incident.incident_id, IncidentStatus::Investigating, "agent", "")
            .await
            .unwrap();

        let report = InvestigationReport {
            report_id: Uuid::new_v4(),
            incident_id: incident.incident_id,
            investigator_id: "agent".into(),
            hypothesis: "valve stuck".into(),
            confidence: 0.9,
            created_at: crate::model::now(),
            accepted_at: None,
        };
        fx.store
            .insert_report(&report, &Audit::new(incident.incident_id, "agent", AuditAction::ReportFiled))
            .unwrap();
        if let Some(details) = remediation {
            let ev = Evidence {
                evidence_id: Uuid::new_v4(),
                report_id: report.report_id,
                source: "agent".into(),
                evidence_type: plan::REMEDIATION.into(),
                details: Payload::from_value(details),
                timestamp: crate::model::now(),
            };
            fx.store
                .attach_evidence(&ev, 0.9, &Audit::new(incident.incident_id, "agent", AuditAction::EvidenceAttached))
                .unwrap();
        }
        let (next, audit) = prepare_transition(&investigating, IncidentStatus::Resolving, "agent", "accepted").unwrap();
        fx.store.accept_report(report.report_id, next.updated_at, &next, &audit).unwrap();
        next
    }

    fn executor(fx: &Fixture, runner: Arc<dyn StepRunner>) -> ResolutionExecutor<SqliteStore> {
        ResolutionExecutor::new(
            fx.store.clone(),
            fx.manager.clone(),
            runner,
            ExecutorSettings {
                actor_id: "resolver".into(),
                step_timeout: Duration::from_millis(200),
            },
        )
    }

    fn resolved_transitions(fx: &Fixture, incident_id: Uuid) -> usize {
        fx.store
            .audit_trail(incident_id)
            .unwrap()
            .iter()
            .filter(|a| {
                a.action
                    == AuditAction::Transition {
                        from: IncidentStatus::Resolving,
                        to: IncidentStatus::Resolved,
                    }
            })
            .count()
    }

    #[tokio::test]
    async fn test_plan_follows_remediation_and_resolves() {
        let fx = fixture();
        let incident = resolving_incident(
            &fx,
            Some(serde_json::json!({"steps": [{"action": "close_valve"}, {"action": "notify_operator"}]})),
        )
        .await;
        let exec = executor(&fx, Arc::new(DryRunStepRunner));

        let plan = exec.prepare(incident.incident_id).await.unwrap();
        assert_eq!(plan.steps().unwrap()[0].action, "close_valve");
        // A second prepare reuses the pending plan.
        assert_eq!(exec.prepare(incident.incident_id).await.unwrap().plan_id, plan.plan_id);

        let outcome = exec.execute(plan.plan_id).await.unwrap();
        assert!(matches!(outcome, ExecutionOutcome::Executed { .. }));
        let resolved = fx.store.get_incident(incident.incident_id).unwrap().unwrap();
        assert_eq!(resolved.status, IncidentStatus::Resolved);
        assert_eq!(resolved.resolved_at, Some(outcome.executed_at()));

        let again = exec.execute(plan.plan_id).await.unwrap();
        assert_eq!(
            again,
            ExecutionOutcome::AlreadyExecuted {
                plan_id: plan.plan_id,
                executed_at: outcome.executed_at()
            }
        );
        assert_eq!(resolved_transitions(&fx, incident.incident_id), 1);
    }

    #[tokio::test]
    async fn test_concurrent_execution_runs_once() {
        let fx = fixture();
        let incident = resolving_incident(&fx, None).await;
        let runner = Arc::new(Flaky {
            action: "none",
            ..Flaky::default()
        });
        let exec = Arc::new(executor(&fx, runner.clone()));
        let plan = exec.prepare(incident.incident_id).await.unwrap();

        let a = tokio::spawn({
            let exec = exec.clone();
            async move { exec.execute(plan.plan_id).await.unwrap() }
        });
        let b = tokio::spawn({
            let exec = exec.clone();
            async move { exec.execute(plan.plan_id).await.unwrap() }
        });
        let (a, b) = (a.await.unwrap(), b.await.unwrap());

        assert_eq!(a.executed_at(), b.executed_at());
        let executed = [a, b].iter().filter(|o| matches!(o, ExecutionOutcome::Executed { .. })).count();
        assert_eq!(executed, 1);
        // Default plan has two steps, run by one caller only.
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
        assert_eq!(resolved_transitions(&fx, incident.incident_id), 1);
    }

    #[tokio::test]
    async fn test_failed_step_is_retryable() {
        let fx = fixture();
        let incident = resolving_incident(&fx, None).await;
        let runner = Arc::new(Flaky {
            action: "schedule_inspection",
            failures: AtomicUsize::new(1),
            runs: AtomicUsize::new(0),
        });
        let exec = executor(&fx, runner);

        let err = exec.resolve(incident.incident_id).await.unwrap_err();
        assert!(err.is_retryable());
        assert!(matches!(err, ResolutionError::StepFailed { step: 1, .. }));
        let still = fx.store.get_incident(incident.incident_id).unwrap().unwrap();
        assert_eq!(still.status, IncidentStatus::Resolving);
        let plans = fx.store.plans_for_incident(incident.incident_id).unwrap();
        assert_eq!(plans.len(), 1);
        assert!(!plans[0].executed);
        assert!(fx
            .store
            .audit_trail(incident.incident_id)
            .unwrap()
            .iter()
            .any(|a| a.action == AuditAction::PlanFailed));

        // Retry reuses the same plan and succeeds.
        let outcome = exec.resolve(incident.incident_id).await.unwrap();
        match outcome {
            ExecutionOutcome::Executed { plan_id, .. } => assert_eq!(plan_id, plans[0].plan_id),
            other => panic!("expected execution, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_pending_plan_from_earlier_report_is_not_reused() {
        let fx = fixture();
        let incident = resolving_incident(&fx, None).await;
        let exec = executor(&fx, Arc::new(DryRunStepRunner));
        let first_report = fx
            .store
            .reports_for_incident(incident.incident_id)
            .unwrap()
            .remove(0)
            .report_id;
        let stale = exec.prepare(incident.incident_id).await.unwrap();

        // A second plan for the same report resolves the incident and leaves the first pending.
        let steps = plan::steps_for(&incident, &[]);
        let other = ResolutionPlan::new(incident.incident_id, first_report, &steps);
        fx.store
            .insert_plan(&other, &Audit::new(incident.incident_id, "resolver", AuditAction::PlanCreated))
            .unwrap();
        exec.execute(other.plan_id).await.unwrap();

        fx.manager
            .transition(incident.incident_id, IncidentStatus::Open, "op", "recurred")
            .await
            .unwrap();
        let investigating = fx
            .manager
            .transition(incident.incident_id, IncidentStatus::Investigating, "agent", "")
            .await
            .unwrap();
        let report = InvestigationReport {
            report_id: Uuid::new_v4(),
            incident_id: incident.incident_id,
            investigator_id: "agent".into(),
            hypothesis: "seal worn".into(),
            confidence: 0.8,
            created_at: crate::model::now(),
            accepted_at: None,
        };
        fx.store
            .insert_report(&report, &Audit::new(incident.incident_id, "agent", AuditAction::ReportFiled))
            .unwrap();
        let (next, audit) = prepare_transition(&investigating, IncidentStatus::Resolving, "agent", "accepted").unwrap();
        fx.store.accept_report(report.report_id, next.updated_at, &next, &audit).unwrap();

        let plan = exec.prepare(incident.incident_id).await.unwrap();
        assert_ne!(plan.plan_id, stale.plan_id);
        assert_eq!(plan.report_id(), Some(report.report_id));
        assert_eq!(stale.report_id(), Some(first_report));
        // The new plan is reused on the next attempt.
        assert_eq!(exec.prepare(incident.incident_id).await.unwrap().plan_id, plan.plan_id);
    }

    #[tokio::test]
    async fn test_requires_resolving_incident() {
        let fx = fixture();
        let key = DedupKey::new("M1", "temp");
        let ts = Utc.with_ymd_and_hms(2026, 4, 2, 8, 0, 0).unwrap();
        let anomaly = Anomaly {
            anomaly_id: Anomaly::stable_id(&key, ts, AnomalySource::Telemetry),
            machine_id: "M1".into(),
            metric_name: "temp".into(),
            timestamp: ts,
            value: 1.0,
            z_score: 3.5,
            severity: Severity::Medium,
            description: None,
            source: AnomalySource::Telemetry,
        };
        let open = fx.manager.on_anomaly(&anomaly, Priority::Medium).await.unwrap().incident().clone();
        let exec = executor(&fx, Arc::new(DryRunStepRunner));
        let err = exec.prepare(open.incident_id).await.unwrap_err();
        assert!(matches!(err, ResolutionError::NotResolving { status: IncidentStatus::Open, .. }));
        assert!(!err.is_retryable());
    }
}
