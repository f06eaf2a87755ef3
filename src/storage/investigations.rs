use super::codec::{self, fmt_ts};
use super::incidents::{insert_audit, write_incident};
use super::{InvestigationStore, SqliteStore, StoreError};
use crate::model::{Audit, Evidence, Incident, IncidentStatus, InvestigationReport, ToolCall};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

const REPORT_COLUMNS: &str =
    "report_id, incident_id, investigator_id, hypothesis, confidence, created_at, accepted_at";

const EVIDENCE_COLUMNS: &str = "evidence_id, report_id, source, type, details, timestamp";

const TOOL_CALL_COLUMNS: &str =
    "call_id, agent_id, tool_name, request, response, latency_ms, tokens_used, timestamp";

fn report_row(row: &Row<'_>) -> rusqlite::Result<InvestigationReport> {
    Ok(InvestigationReport {
        report_id: codec::uuid(row, 0)?,
        incident_id: codec::uuid(row, 1)?,
        investigator_id: row.get(2)?,
        hypothesis: row.get(3)?,
        confidence: row.get(4)?,
        created_at: codec::ts(row, 5)?,
        accepted_at: codec::opt_ts(row, 6)?,
    })
}

fn evidence_row(row: &Row<'_>) -> rusqlite::Result<Evidence> {
    Ok(Evidence {
        evidence_id: codec::uuid(row, 0)?,
        report_id: codec::uuid(row, 1)?,
        source: row.get(2)?,
        evidence_type: row.get(3)?,
        details: codec::payload(row, 4)?,
        timestamp: codec::ts(row, 5)?,
    })
}

fn tool_call_row(row: &Row<'_>) -> rusqlite::Result<ToolCall> {
    Ok(ToolCall {
        call_id: codec::uuid(row, 0)?,
        agent_id: row.get(1)?,
        tool_name: row.get(2)?,
        request: codec::payload(row, 3)?,
        response: codec::payload(row, 4)?,
        latency_ms: row.get(5)?,
        tokens_used: row.get(6)?,
        timestamp: codec::ts(row, 7)?,
    })
}

impl InvestigationStore for SqliteStore {
    fn insert_report(&self, report: &InvestigationReport, audit: &Audit) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            &format!("INSERT INTO investigation_reports ({REPORT_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                report.report_id.to_string(),
                report.incident_id.to_string(),
                report.investigator_id,
                report.hypothesis,
                report.confidence,
                fmt_ts(&report.created_at),
                codec::fmt_opt_ts(&report.accepted_at),
            ],
        )?;
        insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }

    fn get_report(&self, id: Uuid) -> Result<Option<InvestigationReport>, StoreError> {
        let conn = self.pool.get()?;
        let report = conn
            .query_row(
                &format!("SELECT {REPORT_COLUMNS} FROM investigation_reports WHERE report_id = ?1"),
                [id.to_string()],
                report_row,
            )
            .optional()?;
        Ok(report)
    }

    fn reports_for_incident(&self, incident_id: Uuid) -> Result<Vec<InvestigationReport>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {REPORT_COLUMNS} FROM investigation_reports
             WHERE incident_id = ?1 ORDER BY created_at, rowid"
        ))?;
        let rows = stmt.query_map([incident_id.to_string()], report_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn attach_evidence(&self, evidence: &Evidence, confidence: f64, audit: &Audit) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            &format!("INSERT INTO evidence ({EVIDENCE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                evidence.evidence_id.to_string(),
                evidence.report_id.to_string(),
                evidence.source,
                evidence.evidence_type,
                codec::to_json(&evidence.details)?,
                fmt_ts(&evidence.timestamp),
            ],
        )?;
        let changed = tx.execute(
            "UPDATE investigation_reports SET confidence = ?2 WHERE report_id = ?1",
            params![evidence.report_id.to_string(), confidence],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "report {} does not exist",
                evidence.report_id
            )));
        }
        insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }

    fn evidence_for_report(&self, report_id: Uuid) -> Result<Vec<Evidence>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {EVIDENCE_COLUMNS} FROM evidence WHERE report_id = ?1 ORDER BY timestamp, rowid"
        ))?;
        let rows = stmt.query_map([report_id.to_string()], evidence_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn accept_report(
        &self,
        report_id: Uuid,
        accepted_at: DateTime<Utc>,
        incident: &Incident,
        audit: &Audit,
    ) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        // Acceptance ends an investigation: exactly one per INVESTIGATING spell.
        let status: Option<String> = tx
            .query_row(
                "SELECT status FROM incidents WHERE incident_id = ?1",
                [incident.incident_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        if status.as_deref() != Some(IncidentStatus::Investigating.as_str()) {
            return Err(StoreError::Conflict(format!(
                "incident {} is not under investigation ({})",
                incident.incident_id,
                status.as_deref().unwrap_or("missing")
            )));
        }

        let changed = tx.execute(
            "UPDATE investigation_reports SET accepted_at = ?2
             WHERE report_id = ?1 AND incident_id = ?3",
            params![
                report_id.to_string(),
                fmt_ts(&accepted_at),
                incident.incident_id.to_string()
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!(
                "report {report_id} does not belong to incident {}",
                incident.incident_id
            )));
        }
        write_incident(&tx, incident)?;
        insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }

    fn record_tool_call(&self, call: &ToolCall) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!("INSERT INTO tool_calls ({TOOL_CALL_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                call.call_id.to_string(),
                call.agent_id,
                call.tool_name,
                codec::to_json(&call.request)?,
                codec::to_json(&call.response)?,
                call.latency_ms,
                call.tokens_used,
                fmt_ts(&call.timestamp),
            ],
        )?;
        Ok(())
    }

    fn tool_calls(&self, agent_id: Option<&str>, limit: usize) -> Result<Vec<ToolCall>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TOOL_CALL_COLUMNS} FROM tool_calls
             WHERE ?1 IS NULL OR agent_id = ?1
             ORDER BY timestamp DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![agent_id, codec::limit(limit)], tool_call_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
