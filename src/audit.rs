//! The incident audit trail.
//!
//! Lifecycle mutations write their own entries in the same transaction as the
//! change (see [`crate::storage`]); this module covers free-form notes, reading
//! the trail back, and checking that a trail replays to the incident's state.

use std::path::Path;

use crate::model::{Audit, AuditAction, IncidentStatus};
use crate::storage::{AuditStore, StoreError};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AuditError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("incident {0} has no audit trail")]
    Empty(Uuid),

    #[error("audit trail of incident {incident_id} does not start with an open entry (found {found})")]
    MissingOpen { incident_id: Uuid, found: AuditAction },

    /// A transition entry does not continue from the state the trail had reached.
    #[error("audit trail of incident {incident_id} breaks at sequence {sequence}: expected a move from {expected}, found {found}")]
    Gap {
        incident_id: Uuid,
        sequence: i64,
        expected: IncidentStatus,
        found: AuditAction,
    },

    #[error("failed to export audit trail: {0}")]
    Export(#[from] std::io::Error),

    #[error("failed to encode audit entry: {0}")]
    Encode(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// AuditLogger
// ---------------------------------------------------------------------------

/// Append-only access to the audit trail of each incident.
pub struct AuditLogger<S> {
    store: Arc<S>,
}

impl<S: AuditStore> AuditLogger<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Append a prepared entry on its own and return it as stored.
    pub fn record(&self, audit: &Audit) -> Result<Audit, AuditError> {
        let stored = self.store.append_audit(audit)?;
        debug!(
            incident = %stored.incident_id,
            action = %stored.action,
            sequence = stored.sequence,
            "audit entry appended"
        );
        Ok(stored)
    }

    /// Free-form comment from an operator or agent.
    pub fn note(&self, incident_id: Uuid, auditor_id: &str, comments: &str) -> Result<Audit, AuditError> {
        self.record(&Audit::new(incident_id, auditor_id, AuditAction::Note).with_comments(comments))
    }

    /// Entries ordered by `(timestamp, sequence)`.
    pub fn trail(&self, incident_id: Uuid) -> Result<Vec<Audit>, AuditError> {
        Ok(self.store.audit_trail(incident_id)?)
    }

    /// Replay the trail's transitions and return every status the incident
    /// passed through, starting at OPEN.
    pub fn status_path(&self, incident_id: Uuid) -> Result<Vec<IncidentStatus>, AuditError> {
        replay(incident_id, &self.trail(incident_id)?)
    }

    /// Write the trail as JSON lines to `path`, replacing any existing file.
    pub async fn export_jsonl(&self, incident_id: Uuid, path: &Path) -> Result<usize, AuditError> {
        let trail = self.trail(incident_id)?;
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut out = String::new();
        for entry in &trail {
            out.push_str(&serde_json::to_string(entry)?);
            out.push('\n');
        }

        let mut file = tokio::fs::File::create(path).await?;
        file.write_all(out.as_bytes()).await?;
        file.flush().await?;

        info!(incident = %incident_id, path = %path.display(), entries = trail.len(), "audit trail exported");
        Ok(trail.len())
    }
}

/// Check an ordered trail and return the statuses it walks through.
pub fn replay(incident_id: Uuid, trail: &[Audit]) -> Result<Vec<IncidentStatus>, AuditError> {
    let first = trail.first().ok_or(AuditError::Empty(incident_id))?;
    if first.action != AuditAction::Opened {
        return Err(AuditError::MissingOpen {
            incident_id,
            found: first.action,
        });
    }

    let mut path = vec![IncidentStatus::Open];
    let mut current = IncidentStatus::Open;
    for entry in &trail[1..] {
        if let AuditAction::Transition { from, to } = entry.action {
            if from != current || !from.can_transition_to(to) {
                return Err(AuditError::Gap {
                    incident_id,
                    sequence: entry.sequence,
                    expected: current,
                    found: entry.action,
                });
            }
            current = to;
            path.push(to);
        }
    }
    Ok(path)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{self, AnomalySource, Incident, Priority};
    use crate::storage::{IncidentStore, SqliteStore};

    fn entry(incident_id: Uuid, action: AuditAction, sequence: i64) -> Audit {
        let mut a = Audit::new(incident_id, "ops", action);
        a.sequence = sequence;
        a
    }

    fn transition(from: IncidentStatus, to: IncidentStatus) -> AuditAction {
        AuditAction::Transition { from, to }
    }

    #[test]
    fn test_replay_full_lifecycle() {
        use IncidentStatus::*;
        let id = Uuid::new_v4();
        let trail = vec![
            entry(id, AuditAction::Opened, 1),
            entry(id, AuditAction::Escalated, 2),
            entry(id, transition(Open, Investigating), 3),
            entry(id, AuditAction::ReportFiled, 4),
            entry(id, transition(Investigating, Resolving), 5),
            entry(id, transition(Resolving, Resolved), 6),
            entry(id, transition(Resolved, Closed), 7),
            entry(id, transition(Closed, Open), 8),
        ];
        assert_eq!(
            replay(id, &trail).unwrap(),
            vec![Open, Investigating, Resolving, Resolved, Closed, Open]
        );
    }

    #[test]
    fn test_replay_detects_gap() {
        use IncidentStatus::*;
        let id = Uuid::new_v4();
        let trail = vec![
            entry(id, AuditAction::Opened, 1),
            entry(id, transition(Investigating, Resolving), 2),
        ];
        let err = replay(id, &trail).unwrap_err();
        assert!(matches!(err, AuditError::Gap { sequence: 2, expected: Open, .. }));
        assert!(matches!(replay(id, &[]), Err(AuditError::Empty(_))));
    }

    #[tokio::test]
    async fn test_note_and_export() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("a.db").to_str().unwrap()).unwrap());
        let now = model::now();
        let incident = Incident {
            incident_id: Uuid::new_v4(),
            source: AnomalySource::Telemetry,
            machine_id: "M1".into(),
            metric_name: "temp".into(),
            status: IncidentStatus::Open,
            priority: Priority::Low,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        store
            .insert_incident(&incident, &Audit::new(incident.incident_id, "ops", AuditAction::Opened))
            .unwrap();

        let logger = AuditLogger::new(store.clone());
        let note = logger
            .note(incident.incident_id, "operator", "checked coolant level")
            .unwrap();
        let trail = logger.trail(incident.incident_id).unwrap();
        assert_eq!(note.sequence, 2);
        assert_eq!(trail.last(), Some(&note));
        assert_eq!(
            logger.status_path(incident.incident_id).unwrap(),
            vec![IncidentStatus::Open]
        );

        let path = dir.path().join("export").join("trail.jsonl");
        let n = logger.export_jsonl(incident.incident_id, &path).await.unwrap();
        assert_eq!(n, 2);

        let content = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = content.trim().split('\n').collect();
        assert_eq!(lines.len(), 2);
        let parsed: Audit = serde_json::from_str(lines[1]).unwrap();
        assert_eq!(parsed.action, AuditAction::Note);
        assert_eq!(parsed.comments, "checked coolant level");
        assert_eq!(parsed.sequence, 2);
    }
}
