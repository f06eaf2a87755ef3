//! Wires the stages together over one store: ingest, respond
//! (investigate then resolve), forecast and incident queries.

use crate::audit::AuditLogger;
use crate::config::AppConfig;
use crate::detect::{AnomalyDetector, DetectionEngine, IncidentManager, IngestReport};
use crate::forecast::ForecastEngine;
use crate::investigate::{AnalysisTool, BaselineShiftTool, InvestigationOutcome, Orchestrator};
use crate::model::{Audit, Evidence, Incident, IncidentStatus, InvestigationReport, ResolutionPlan, SensorReading};
use crate::resolve::{DryRunStepRunner, ExecutionOutcome, ResolutionExecutor, StepRunner};
use crate::storage::{
    AuditStore, CatalogStore, ForecastStore, IncidentStore, InvestigationStore, ResolutionStore, SqliteStore,
    TelemetryStore,
};
use anyhow::{bail, Context, Result};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{error, info};
use uuid::Uuid;

/// Everything the pipeline needs from storage.
pub trait PipelineStore:
    TelemetryStore + IncidentStore + AuditStore + InvestigationStore + ResolutionStore + ForecastStore + CatalogStore + 'static
{
}

impl<T> PipelineStore for T where
    T: TelemetryStore
        + IncidentStore
        + AuditStore
        + InvestigationStore
        + ResolutionStore
        + ForecastStore
        + CatalogStore
        + 'static
{
}

/// A report with the evidence attached to it.
#[derive(Debug, Clone, Serialize)]
pub struct ReportDossier {
    #[serde(flatten)]
    pub report: InvestigationReport,
    pub evidence: Vec<Evidence>,
}

/// Everything recorded about one incident.
#[derive(Debug, Clone, Serialize)]
pub struct IncidentDossier {
    pub incident: Incident,
    pub reports: Vec<ReportDossier>,
    pub plans: Vec<ResolutionPlan>,
    pub audit: Vec<Audit>,
}

/// What responding to one incident did.
#[derive(Debug, Clone, Serialize)]
pub struct ResponseOutcome {
    pub incident: Incident,
    pub investigation: Option<InvestigationOutcome>,
    pub execution: Option<ExecutionOutcome>,
}

pub struct Pipeline<S = SqliteStore> {
    store: Arc<S>,
    incidents: Arc<IncidentManager<S>>,
    engine: Arc<DetectionEngine<S>>,
    orchestrator: Orchestrator<S>,
    executor: ResolutionExecutor<S>,
    forecaster: Arc<ForecastEngine<S>>,
    audit: AuditLogger<S>,
}

impl Pipeline<SqliteStore> {
    /// Open the configured database and register the configured built-in tools.
    /// Resolution steps are logged, not acted on.
    pub fn open(config: &AppConfig) -> Result<Self> {
        config.validate()?;
        let path = config.storage.db_path.to_string_lossy();
        let store = Arc::new(
            SqliteStore::open(&path).with_context(|| format!("failed to open database {}", path))?,
        );

        let mut tools: Vec<Arc<dyn AnalysisTool>> = Vec::new();
        for name in &config.investigation.tools {
            match name.as_str() {
                BaselineShiftTool::NAME => tools.push(Arc::new(BaselineShiftTool)),
                other => bail!("[investigation] unknown tool '{}'", other),
            }
        }
        Ok(Self::build(store, config, tools, Arc::new(DryRunStepRunner)))
    }
}

impl<S: PipelineStore> Pipeline<S> {
    pub fn build(
        store: Arc<S>,
        config: &AppConfig,
        tools: Vec<Arc<dyn AnalysisTool>>,
        runner: Arc<dyn StepRunner>,
    ) -> Self {
        let incidents = Arc::new(IncidentManager::new(
            store.clone(),
            config.incidents.reopen_cooldown(),
            config.incidents.auditor_id.clone(),
        ));
        let detector = AnomalyDetector::new(config.detection.thresholds, config.detection.min_samples);
        let engine = Arc::new(DetectionEngine::new(
            store.clone(),
            config.telemetry.window,
            detector,
            incidents.clone(),
        ));
        let orchestrator = tools.into_iter().fold(
            Orchestrator::new(store.clone(), incidents.clone(), config.investigation.settings()),
            Orchestrator::with_tool,
        );
        let executor = ResolutionExecutor::new(store.clone(), incidents.clone(), runner, config.resolution.settings());
        let forecaster = Arc::new(ForecastEngine::new(
            store.clone(),
            detector,
            incidents.clone(),
            config.forecast.settings(),
        ));
        let audit = AuditLogger::new(store.clone());

        Self {
            store,
            incidents,
            engine,
            orchestrator,
            executor,
            forecaster,
            audit,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn incidents(&self) -> &IncidentManager<S> {
        &self.incidents
    }

    pub fn engine(&self) -> &Arc<DetectionEngine<S>> {
        &self.engine
    }

    pub fn orchestrator(&self) -> &Orchestrator<S> {
        &self.orchestrator
    }

    pub fn executor(&self) -> &ResolutionExecutor<S> {
        &self.executor
    }

    pub fn forecaster(&self) -> &Arc<ForecastEngine<S>> {
        &self.forecaster
    }

    pub fn audit(&self) -> &AuditLogger<S> {
        &self.audit
    }

    pub async fn ingest_batch(&self, readings: Vec<SensorReading>) -> IngestReport {
        self.engine.ingest_batch(readings).await
    }

    /// Drive an incident as far along its lifecycle as it will go: investigate
    /// OPEN and INVESTIGATING incidents, then execute the plan of a RESOLVING one.
    pub async fn respond(&self, incident_id: Uuid) -> Result<ResponseOutcome> {
        let incident = self
            .incidents
            .get(incident_id)?
            .with_context(|| format!("incident {incident_id} not found"))?;

        let investigation = match incident.status {
            IncidentStatus::Open | IncidentStatus::Investigating => Some(
                self.orchestrator
                    .investigate(incident_id)
                    .await
                    .with_context(|| format!("investigation of incident {incident_id} failed"))?,
            ),
            IncidentStatus::Resolving => None,
            status @ (IncidentStatus::Resolved | IncidentStatus::Closed) => {
                bail!("incident {incident_id} is already {status}")
            }
        };

        let resolving = match &investigation {
            Some(outcome) => outcome.incident.status == IncidentStatus::Resolving,
            None => true,
        };
        let execution = if resolving {
            Some(
                self.executor
                    .resolve(incident_id)
                    .await
                    .with_context(|| format!("resolution of incident {incident_id} failed"))?,
            )
        } else {
            None
        };

        let incident = self
            .incidents
            .get(incident_id)?
            .with_context(|| format!("incident {incident_id} not found"))?;
        info!(
            incident = %incident_id,
            status = %incident.status,
            executed = execution.is_some(),
            "response finished"
        );
        Ok(ResponseOutcome {
            incident,
            investigation,
            execution,
        })
    }

    /// Respond to several incidents in parallel. Results come back in the
    /// order the ids were given.
    pub async fn respond_all(self: &Arc<Self>, incident_ids: Vec<Uuid>) -> Vec<(Uuid, Result<ResponseOutcome>)> {
        let mut tasks = JoinSet::new();
        for (index, id) in incident_ids.iter().copied().enumerate() {
            let pipeline = Arc::clone(self);
            tasks.spawn(async move { (index, id, pipeline.respond(id).await) });
        }

        let mut results: Vec<Option<(Uuid, Result<ResponseOutcome>)>> = incident_ids.iter().map(|_| None).collect();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((index, id, result)) => {
                    if let Err(e) = &result {
                        error!(incident = %id, error = %format!("{e:#}"), "response failed");
                    }
                    results[index] = Some((id, result));
                }
                Err(e) => error!(error = %e, "response task panicked"),
            }
        }
        results
            .into_iter()
            .zip(incident_ids)
            .map(|(slot, id)| slot.unwrap_or_else(|| (id, Err(anyhow::anyhow!("response task for {id} aborted")))))
            .collect()
    }

    /// The incident with its reports, evidence, plans and audit trail.
    pub fn dossier(&self, incident_id: Uuid) -> Result<IncidentDossier> {
        let incident = self
            .store
            .get_incident(incident_id)?
            .with_context(|| format!("incident {incident_id} not found"))?;
        let reports = self
            .store
            .reports_for_incident(incident_id)?
            .into_iter()
            .map(|report| {
                let evidence = self.store.evidence_for_report(report.report_id)?;
                Ok(ReportDossier { report, evidence })
            })
            .collect::<Result<Vec<_>>>()?;
        let plans = self.store.plans_for_incident(incident_id)?;
        let audit = self.audit.trail(incident_id)?;
        Ok(IncidentDossier {
            incident,
            reports,
            plans,
            audit,
        })
    }
}
