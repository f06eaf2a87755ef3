use super::codec::{self, fmt_opt_ts, fmt_ts};
use super::{AuditStore, IncidentStore, SqliteStore, StoreError};
use crate::model::{Audit, DedupKey, Incident, IncidentStatus};
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

const INCIDENT_COLUMNS: &str = "incident_id, source, machine_id, metric_name, status, priority, \
     created_at, updated_at, resolved_at";

const AUDIT_COLUMNS: &str = "audit_id, incident_id, auditor_id, action, comments, timestamp, sequence";

fn incident_row(row: &Row<'_>) -> rusqlite::Result<Incident> {
    Ok(Incident {
        incident_id: codec::uuid(row, 0)?,
        source: codec::parsed(row, 1)?,
        machine_id: row.get(2)?,
        metric_name: row.get(3)?,
        status: codec::parsed(row, 4)?,
        priority: codec::parsed(row, 5)?,
        created_at: codec::ts(row, 6)?,
        updated_at: codec::ts(row, 7)?,
        resolved_at: codec::opt_ts(row, 8)?,
    })
}

fn audit_row(row: &Row<'_>) -> rusqlite::Result<Audit> {
    Ok(Audit {
        audit_id: codec::uuid(row, 0)?,
        incident_id: codec::uuid(row, 1)?,
        auditor_id: row.get(2)?,
        action: codec::parsed(row, 3)?,
        comments: row.get(4)?,
        timestamp: codec::ts(row, 5)?,
        sequence: row.get(6)?,
    })
}

/// Append one audit entry inside the caller's transaction.
///
/// The sequence is the next number for the incident and the timestamp is
/// clamped to the incident's latest entry, so the trail is non-decreasing in
/// `(timestamp, sequence)`. Any failure is reported as `AuditWrite` and the
/// caller's transaction is expected to roll back by dropping.
pub(super) fn insert_audit(conn: &Connection, audit: &Audit) -> Result<Audit, StoreError> {
    let write = || -> rusqlite::Result<Audit> {
        let (next, last) = conn.query_row(
            "SELECT COALESCE(MAX(sequence), 0) + 1, MAX(timestamp) FROM audits WHERE incident_id = ?1",
            [audit.incident_id.to_string()],
            |row| Ok((row.get::<_, i64>(0)?, codec::opt_ts(row, 1)?)),
        )?;
        let timestamp = match last {
            Some(last) if last > audit.timestamp => last,
            _ => audit.timestamp,
        };
        conn.execute(
            &format!("INSERT INTO audits ({AUDIT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                audit.audit_id.to_string(),
                audit.incident_id.to_string(),
                audit.auditor_id,
                audit.action.to_string(),
                audit.comments,
                fmt_ts(&timestamp),
                next,
            ],
        )?;
        Ok(Audit {
            timestamp,
            sequence: next,
            ..audit.clone()
        })
    };
    write().map_err(StoreError::AuditWrite)
}

/// Persist the mutable incident columns inside the caller's transaction.
pub(super) fn write_incident(conn: &Connection, incident: &Incident) -> Result<(), StoreError> {
    let changed = conn.execute(
        "UPDATE incidents SET status = ?2, priority = ?3, updated_at = ?4, resolved_at = ?5
         WHERE incident_id = ?1",
        params![
            incident.incident_id.to_string(),
            incident.status.as_str(),
            incident.priority.as_str(),
            fmt_ts(&incident.updated_at),
            fmt_opt_ts(&incident.resolved_at),
        ],
    )?;
    if changed == 0 {
        return Err(StoreError::Conflict(format!(
            "incident {} does not exist",
            incident.incident_id
        )));
    }
    Ok(())
}

impl IncidentStore for SqliteStore {
    fn get_incident(&self, id: Uuid) -> Result<Option<Incident>, StoreError> {
        let conn = self.pool.get()?;
        let incident = conn
            .query_row(
                &format!("SELECT {INCIDENT_COLUMNS} FROM incidents WHERE incident_id = ?1"),
                [id.to_string()],
                incident_row,
            )
            .optional()?;
        Ok(incident)
    }

    fn find_active(&self, key: &DedupKey) -> Result<Option<Incident>, StoreError> {
        let conn = self.pool.get()?;
        let incident = conn
            .query_row(
                &format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents
                     WHERE machine_id = ?1 AND metric_name = ?2
                       AND status NOT IN ('RESOLVED', 'CLOSED')"
                ),
                params![key.machine_id, key.metric_name],
                incident_row,
            )
            .optional()?;
        Ok(incident)
    }

    fn find_latest_terminal(&self, key: &DedupKey) -> Result<Option<Incident>, StoreError> {
        let conn = self.pool.get()?;
        let incident = conn
            .query_row(
                &format!(
                    "SELECT {INCIDENT_COLUMNS} FROM incidents
                     WHERE machine_id = ?1 AND metric_name = ?2
                       AND status IN ('RESOLVED', 'CLOSED')
                     ORDER BY updated_at DESC LIMIT 1"
                ),
                params![key.machine_id, key.metric_name],
                incident_row,
            )
            .optional()?;
        Ok(incident)
    }

    fn list_incidents(&self, status: Option<IncidentStatus>, limit: usize) -> Result<Vec<Incident>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {INCIDENT_COLUMNS} FROM incidents
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY updated_at DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![status.map(IncidentStatus::as_str), codec::limit(limit)],
            incident_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn insert_incident(&self, incident: &Incident, audit: &Audit) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            &format!("INSERT INTO incidents ({INCIDENT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                incident.incident_id.to_string(),
                incident.source.as_str(),
                incident.machine_id,
                incident.metric_name,
                incident.status.as_str(),
                incident.priority.as_str(),
                fmt_ts(&incident.created_at),
                fmt_ts(&incident.updated_at),
                fmt_opt_ts(&incident.resolved_at),
            ],
        )?;
        insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }

    fn update_incident(&self, incident: &Incident, audit: &Audit) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        write_incident(&tx, incident)?;
        insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }
}

impl AuditStore for SqliteStore {
    fn append_audit(&self, audit: &Audit) -> Result<Audit, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let stored = insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(stored)
    }

    fn audit_trail(&self, incident_id: Uuid) -> Result<Vec<Audit>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AUDIT_COLUMNS} FROM audits WHERE incident_id = ?1 ORDER BY timestamp, sequence"
        ))?;
        let rows = stmt.query_map([incident_id.to_string()], audit_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
