//! Resolution: turn the accepted report into an ordered plan and execute it
//! exactly once.

pub mod executor;
pub mod plan;

pub use self::executor::{ExecutionOutcome, ExecutorSettings, ResolutionExecutor};

use crate::detect::DetectError;
use crate::model::{Incident, IncidentStatus, ResolutionStep};
use crate::storage::StoreError;
use anyhow::Result;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error(transparent)]
    Detect(#[from] DetectError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("plan {0} not found")]
    PlanNotFound(Uuid),

    #[error("incident {id} is {status}, plans run only while RESOLVING")]
    NotResolving { id: Uuid, status: IncidentStatus },

    #[error("incident {0} has no accepted report")]
    NoAcceptedReport(Uuid),

    #[error("plan {plan_id} has unreadable steps: {reason}")]
    MalformedPlan { plan_id: Uuid, reason: String },

    /// The plan stays unexecuted and the incident RESOLVING; running the plan
    /// again retries from the first step.
    #[error("plan {plan_id} failed at step {step} ({action}): {reason}")]
    StepFailed {
        plan_id: Uuid,
        step: usize,
        action: String,
        reason: String,
    },
}

impl ResolutionError {
    pub fn is_retryable(&self) -> bool {
        match self {
            ResolutionError::StepFailed { .. } => true,
            ResolutionError::Detect(e) => e.is_retryable(),
            ResolutionError::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}

/// Carries out one resolution step against the outside world.
#[async_trait::async_trait]
pub trait StepRunner: Send + Sync {
    async fn run(&self, incident: &Incident, step: &ResolutionStep) -> Result<()>;
}

/// Logs each step instead of acting on it.
#[derive(Debug, Clone, Default)]
pub struct DryRunStepRunner;

#[async_trait::async_trait]
impl StepRunner for DryRunStepRunner {
    async fn run(&self, incident: &Incident, step: &ResolutionStep) -> Result<()> {
        info!(
            incident = %incident.incident_id,
            machine = %incident.machine_id,
            action = %step.action,
            params = %serde_json::to_string(&step.params)?,
            "dry run: step skipped"
        );
        Ok(())
    }
}
