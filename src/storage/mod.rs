//! SQLite storage layer -- schema, migrations, and the repository traits the
//! pipeline components are built against.

pub mod schema;

mod catalog;
mod codec;
mod forecasts;
mod incidents;
mod investigations;
mod resolutions;
mod telemetry;

use crate::model::{
    Anomaly, Audit, DedupKey, Evidence, Incident, IncidentStatus, InvestigationReport, Machine,
    OpenWindow, PredictiveForecast, ResolutionPlan, SensorAggregate, SensorReading, SlackMessage,
    SupportTicket, ToolCall,
};
use chrono::{DateTime, Utc};
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use thiserror::Error;
use uuid::Uuid;

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("sqlite error: {0}")]
    Sqlite(#[source] rusqlite::Error),

    #[error("payload serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// A persisted row failed validation on read (bad uuid, timestamp, enum or JSON).
    #[error("malformed record in column {column}: {reason}")]
    Malformed { column: usize, reason: String },

    /// The audit entry for a mutation could not be written; the mutation was rolled back.
    #[error("audit write failed, mutation rolled back: {0}")]
    AuditWrite(#[source] rusqlite::Error),

    #[error("cannot create database directory {path}: {source}")]
    Directory {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A uniqueness or integrity constraint rejected the write.
    #[error("constraint violation: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Whether repeating the whole operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::AuditWrite(_) | StoreError::Pool(_))
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(err: rusqlite::Error) -> Self {
        match err {
            rusqlite::Error::FromSqlConversionFailure(column, _, source) => StoreError::Malformed {
                column,
                reason: source.to_string(),
            },
            rusqlite::Error::SqliteFailure(code, msg)
                if code.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                StoreError::Conflict(msg.unwrap_or_else(|| code.to_string()))
            }
            other => StoreError::Sqlite(other),
        }
    }
}

/// Open (or create) the SQLite database and return a connection pool.
pub fn open_pool(path: &str) -> Result<Pool, StoreError> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).map_err(|source| StoreError::Directory {
                path: parent.display().to_string(),
                source,
            })?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(|c| {
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA temp_store = MEMORY;
                 PRAGMA foreign_keys = ON;
                 PRAGMA busy_timeout = 5000;",
        )
    });

    let pool = R2D2Pool::new(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    Ok(pool)
}

/// Outcome of the compare-and-set that marks a plan executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkExecuted {
    Marked,
    AlreadyExecuted(DateTime<Utc>),
}

/// Raw readings, closed windows and detected anomalies.
pub trait TelemetryStore: Send + Sync {
    /// Insert a reading and save the stream's open window in one transaction.
    /// Returns `None` when the same `(machine, sensor, timestamp)` was already
    /// stored; the window is saved either way.
    fn record_reading(&self, reading: &SensorReading, window: &OpenWindow) -> Result<Option<i64>, StoreError>;
    fn open_window(&self, key: &DedupKey) -> Result<Option<OpenWindow>, StoreError>;
    /// Insert a closed window. Returns false when the identical window already exists;
    /// an overlapping but different window is a conflict.
    fn record_aggregate(&self, aggregate: &SensorAggregate) -> Result<bool, StoreError>;
    /// Most recent `limit` windows for a stream, oldest first.
    fn recent_aggregates(&self, key: &DedupKey, limit: usize) -> Result<Vec<SensorAggregate>, StoreError>;
    fn latest_aggregate(&self, key: &DedupKey) -> Result<Option<SensorAggregate>, StoreError>;
    /// Latest window that ended at or before `end`.
    fn aggregate_before(&self, key: &DedupKey, end: DateTime<Utc>) -> Result<Option<SensorAggregate>, StoreError>;
    /// Insert an anomaly. Returns false when the same anomaly id was already recorded.
    fn record_anomaly(&self, anomaly: &Anomaly) -> Result<bool, StoreError>;
    fn get_anomaly(&self, id: Uuid) -> Result<Option<Anomaly>, StoreError>;
    fn recent_anomalies(&self, key: &DedupKey, limit: usize) -> Result<Vec<Anomaly>, StoreError>;
    /// Every stream that has at least one closed window.
    fn streams(&self) -> Result<Vec<DedupKey>, StoreError>;
}

/// Incidents. Every mutation carries the audit entry that describes it and
/// commits both in one transaction.
pub trait IncidentStore: Send + Sync {
    fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError>;
    fn find_active(&self, key: &DedupKey) -> Result<Option<Incident>, StoreError>;
    /// Most recently updated RESOLVED/CLOSED incident for the key.
    fn find_latest_terminal(&self, key: &DedupKey) -> Result<Option<Incident>, StoreError>;
    fn list_incidents(&self, status: Option<IncidentStatus>, limit: usize) -> Result<Vec<Incident>, StoreError>;
    fn insert_incident(&self, incident: &Incident, audit: &Audit) -> Result<(), StoreError>;
    fn update_incident(&self, incident: &Incident, audit: &Audit) -> Result<(), StoreError>;
}

/// The append-only audit trail.
pub trait AuditStore: Send + Sync {
    /// Append an entry and return it as stored, with its assigned sequence
    /// and clamped timestamp.
    fn append_audit(&self, audit: &Audit) -> Result<Audit, StoreError>;
    /// Entries for one incident ordered by `(timestamp, sequence)`.
    fn audit_trail(&self, incident_id: Uuid) -> Result<Vec<Audit>, StoreError>;
}

pub trait InvestigationStore: Send + Sync {
    fn insert_report(&self, report: &InvestigationReport, audit: &Audit) -> Result<(), StoreError>;
    fn get_report(&self, id: Uuid) -> Result<Option<InvestigationReport>, StoreError>;
    /// Reports for an incident ordered by `created_at`.
    fn reports_for_incident(&self, incident_id: Uuid) -> Result<Vec<InvestigationReport>, StoreError>;
    /// Append evidence and store the report's recomputed confidence.
    fn attach_evidence(&self, evidence: &Evidence, confidence: f64, audit: &Audit) -> Result<(), StoreError>;
    fn evidence_for_report(&self, report_id: Uuid) -> Result<Vec<Evidence>, StoreError>;
    /// Stamp the report accepted and apply the incident transition it drives.
    /// A conflict unless the incident is still INVESTIGATING.
    fn accept_report(
        &self,
        report_id: Uuid,
        accepted_at: DateTime<Utc>,
        incident: &Incident,
        audit: &Audit,
    ) -> Result<(), StoreError>;
    fn record_tool_call(&self, call: &ToolCall) -> Result<(), StoreError>;
    fn tool_calls(&self, agent_id: Option<&str>, limit: usize) -> Result<Vec<ToolCall>, StoreError>;
}

pub trait ResolutionStore: Send + Sync {
    fn insert_plan(&self, plan: &ResolutionPlan, audit: &Audit) -> Result<(), StoreError>;
    fn get_plan(&self, id: Uuid) -> Result<Option<ResolutionPlan>, StoreError>;
    /// Plans for an incident ordered by `created_at`.
    fn plans_for_incident(&self, incident_id: Uuid) -> Result<Vec<ResolutionPlan>, StoreError>;
    /// Set `executed` only if it is still false, together with the incident
    /// transition and its audit entry.
    fn mark_executed(
        &self,
        plan_id: Uuid,
        executed_at: DateTime<Utc>,
        incident: &Incident,
        audit: &Audit,
    ) -> Result<MarkExecuted, StoreError>;
}

pub trait ForecastStore: Send + Sync {
    fn insert_forecast(&self, forecast: &PredictiveForecast) -> Result<(), StoreError>;
    /// Forecasts whose `forecast_time` lies in `[from, to]`, ordered by time.
    fn forecasts(
        &self,
        key: &DedupKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PredictiveForecast>, StoreError>;
}

/// Externally owned records read as investigation context.
pub trait CatalogStore: Send + Sync {
    fn upsert_machine(&self, machine: &Machine) -> Result<(), StoreError>;
    fn get_machine(&self, machine_id: &str) -> Result<Option<Machine>, StoreError>;
    fn record_slack_message(&self, message: &SlackMessage) -> Result<(), StoreError>;
    /// Newest first.
    fn slack_messages_for_machine(&self, machine_id: &str, limit: usize) -> Result<Vec<SlackMessage>, StoreError>;
    fn upsert_ticket(&self, ticket: &SupportTicket) -> Result<(), StoreError>;
    /// Unresolved tickets whose related entity is the machine.
    fn open_tickets_for_machine(&self, machine_id: &str) -> Result<Vec<SupportTicket>, StoreError>;
}

/// SQLite implementation of every repository trait over a shared pool.
#[derive(Clone)]
pub struct SqliteStore {
    pool: Pool,
}

impl SqliteStore {
    pub fn new(pool: Pool) -> Self {
        Self { pool }
    }

    pub fn open(path: &str) -> Result<Self, StoreError> {
        Ok(Self::new(open_pool(path)?))
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }
}
