use super::codec::{self, fmt_ts};
use super::incidents::{insert_audit, write_incident};
use super::{MarkExecuted, ResolutionStore, SqliteStore, StoreError};
use crate::model::{Audit, Incident, ResolutionPlan};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

const PLAN_COLUMNS: &str = "plan_id, incident_id, resolution_steps, executed, created_at, executed_at";

fn plan_row(row: &Row<'_>) -> rusqlite::Result<ResolutionPlan> {
    Ok(ResolutionPlan {
        plan_id: codec::uuid(row, 0)?,
        incident_id: codec::uuid(row, 1)?,
        resolution_steps: codec::payload(row, 2)?,
        executed: row.get(3)?,
        created_at: codec::ts(row, 4)?,
        executed_at: codec::opt_ts(row, 5)?,
    })
}

impl ResolutionStore for SqliteStore {
    fn insert_plan(&self, plan: &ResolutionPlan, audit: &Audit) -> Result<(), StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        tx.execute(
            &format!("INSERT INTO resolution_plans ({PLAN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                plan.plan_id.to_string(),
                plan.incident_id.to_string(),
                codec::to_json(&plan.resolution_steps)?,
                plan.executed,
                fmt_ts(&plan.created_at),
                codec::fmt_opt_ts(&plan.executed_at),
            ],
        )?;
        insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(())
    }

    fn get_plan(&self, id: Uuid) -> Result<Option<ResolutionPlan>, StoreError> {
        let conn = self.pool.get()?;
        let plan = conn
            .query_row(
                &format!("SELECT {PLAN_COLUMNS} FROM resolution_plans WHERE plan_id = ?1"),
                [id.to_string()],
                plan_row,
            )
            .optional()?;
        Ok(plan)
    }

    fn plans_for_incident(&self, incident_id: Uuid) -> Result<Vec<ResolutionPlan>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {PLAN_COLUMNS} FROM resolution_plans WHERE incident_id = ?1 ORDER BY created_at, rowid"
        ))?;
        let rows = stmt.query_map([incident_id.to_string()], plan_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn mark_executed(
        &self,
        plan_id: Uuid,
        executed_at: DateTime<Utc>,
        incident: &Incident,
        audit: &Audit,
    ) -> Result<MarkExecuted, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let previous = tx
            .query_row(
                "SELECT executed_at FROM resolution_plans WHERE plan_id = ?1",
                [plan_id.to_string()],
                |row| codec::opt_ts(row, 0),
            )
            .optional()?;
        match previous {
            None => {
                return Err(StoreError::Conflict(format!("plan {plan_id} does not exist")));
            }
            Some(Some(at)) => return Ok(MarkExecuted::AlreadyExecuted(at)),
            Some(None) => {}
        }

        let changed = tx.execute(
            "UPDATE resolution_plans SET executed = 1, executed_at = ?2
             WHERE plan_id = ?1 AND executed = 0",
            params![plan_id.to_string(), fmt_ts(&executed_at)],
        )?;
        if changed == 0 {
            return Err(StoreError::Conflict(format!("plan {plan_id} changed concurrently")));
        }
        write_incident(&tx, incident)?;
        insert_audit(&tx, audit)?;
        tx.commit()?;
        Ok(MarkExecuted::Marked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnomalySource, AuditAction, IncidentStatus, Payload, Priority, ResolutionStep};
    use crate::storage::{AuditStore, IncidentStore};

    fn store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("test.db");
        let store = SqliteStore::open(path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    fn resolving(store: &SqliteStore) -> Incident {
        let now = crate::model::now();
        let inc = Incident {
            incident_id: Uuid::new_v4(),
            source: AnomalySource::Telemetry,
            machine_id: "M7".into(),
            metric_name: "pressure".into(),
            status: IncidentStatus::Resolving,
            priority: Priority::High,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        store
            .insert_incident(&inc, &Audit::new(inc.incident_id, "ops", AuditAction::Opened))
            .unwrap();
        inc
    }

    #[test]
    fn test_mark_executed_once() {
        let (_dir, store) = store();
        let inc = resolving(&store);
        let plan = ResolutionPlan::new(
            inc.incident_id,
            Uuid::new_v4(),
            &[ResolutionStep::new("notify_operator", Payload::new())],
        );
        store
            .insert_plan(&plan, &Audit::new(inc.incident_id, "executor", AuditAction::PlanCreated))
            .unwrap();
        assert_eq!(store.get_plan(plan.plan_id).unwrap().unwrap(), plan);

        let at = crate::model::now();
        let mut next = inc.clone();
        next.status = IncidentStatus::Resolved;
        next.resolved_at = Some(at);
        let action = AuditAction::Transition {
            from: IncidentStatus::Resolving,
            to: IncidentStatus::Resolved,
        };
        let first = store
            .mark_executed(plan.plan_id, at, &next, &Audit::new(inc.incident_id, "executor", action))
            .unwrap();
        assert_eq!(first, MarkExecuted::Marked);

        let later = at + chrono::Duration::seconds(5);
        let second = store
            .mark_executed(plan.plan_id, later, &next, &Audit::new(inc.incident_id, "executor", action))
            .unwrap();
        assert_eq!(second, MarkExecuted::AlreadyExecuted(at));

        let stored = store.get_plan(plan.plan_id).unwrap().unwrap();
        assert!(stored.executed);
        assert_eq!(stored.executed_at, Some(at));
        let transitions = store
            .audit_trail(inc.incident_id)
            .unwrap()
            .into_iter()
            .filter(|a| a.action == action)
            .count();
        assert_eq!(transitions, 1);
    }

    #[test]
    fn test_plans_listed_per_incident() {
        let (_dir, store) = store();
        let inc = resolving(&store);
        for _ in 0..2 {
            let plan = ResolutionPlan::new(inc.incident_id, Uuid::new_v4(), &[]);
            store
                .insert_plan(&plan, &Audit::new(inc.incident_id, "executor", AuditAction::PlanCreated))
                .unwrap();
        }
        assert_eq!(store.plans_for_incident(inc.incident_id).unwrap().len(), 2);
        assert!(store.plans_for_incident(Uuid::new_v4()).unwrap().is_empty());
    }
}
