use crate::detect::DetectError;
use crate::keyed::KeyedLocks;
use crate::model::{self, Anomaly, Audit, AuditAction, DedupKey, Incident, IncidentStatus, Priority};
use crate::storage::{IncidentStore, StoreError};
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// What an anomaly did to the incident table.
#[derive(Debug, Clone, PartialEq)]
pub enum AnomalyOutcome {
    Opened(Incident),
    Reopened(Incident),
    Escalated(Incident),
    /// Folded into the active incident without changing it.
    Deduplicated(Incident),
}

impl AnomalyOutcome {
    pub fn incident(&self) -> &Incident {
        match self {
            AnomalyOutcome::Opened(i)
            | AnomalyOutcome::Reopened(i)
            | AnomalyOutcome::Escalated(i)
            | AnomalyOutcome::Deduplicated(i) => i,
        }
    }

    /// Opened or reopened incidents start a new investigation.
    pub fn needs_response(&self) -> bool {
        matches!(self, AnomalyOutcome::Opened(_) | AnomalyOutcome::Reopened(_))
    }
}

/// Deduplicates anomalies into incidents and drives the incident lifecycle.
///
/// Every decision for a `(machine, metric)` key runs under that key's lock;
/// the partial unique index in storage covers writers in other processes.
pub struct IncidentManager<S> {
    store: Arc<S>,
    locks: KeyedLocks<DedupKey>,
    reopen_cooldown: Duration,
    auditor_id: String,
}

impl<S: IncidentStore> IncidentManager<S> {
    pub fn new(store: Arc<S>, reopen_cooldown: Duration, auditor_id: impl Into<String>) -> Self {
        Self {
            store,
            locks: KeyedLocks::new(),
            reopen_cooldown,
            auditor_id: auditor_id.into(),
        }
    }

    pub fn auditor_id(&self) -> &str {
        &self.auditor_id
    }

    /// Serialize with dedup and transitions for `key`.
    pub(crate) async fn lock(&self, key: &DedupKey) -> OwnedMutexGuard<()> {
        self.locks.lock(key).await
    }

    pub fn get(&self, id: Uuid) -> Result<Option<Incident>, DetectError> {
        Ok(self.store.get_incident(id)?)
    }

    pub fn list(&self, status: Option<IncidentStatus>, limit: usize) -> Result<Vec<Incident>, DetectError> {
        Ok(self.store.list_incidents(status, limit)?)
    }

    /// Fold an anomaly into the incident table: escalate the active incident
    /// for its key, reopen a recently finished one, or open a new one.
    pub async fn on_anomaly(&self, anomaly: &Anomaly, priority: Priority) -> Result<AnomalyOutcome, DetectError> {
        let key = anomaly.key();
        let _guard = self.lock(&key).await;

        if let Some(active) = self.store.find_active(&key)? {
            return self.escalate(active, anomaly, priority);
        }

        if let Some(prev) = self.store.find_latest_terminal(&key)? {
            if anomaly.timestamp <= prev.updated_at + self.reopen_cooldown {
                return match self.reopen(prev, anomaly, priority) {
                    Err(DetectError::Store(StoreError::Conflict(reason))) => {
                        self.recover_conflict(&key, anomaly, priority, reason)
                    }
                    other => other,
                };
            }
        }

        let now = model::now();
        let incident = Incident {
            incident_id: Uuid::new_v4(),
            source: anomaly.source,
            machine_id: key.machine_id.clone(),
            metric_name: key.metric_name.clone(),
            status: IncidentStatus::Open,
            priority,
            created_at: now,
            updated_at: now,
            resolved_at: None,
        };
        let audit = Audit::new(incident.incident_id, &self.auditor_id, AuditAction::Opened)
            .with_comments(describe(anomaly, priority));

        match self.store.insert_incident(&incident, &audit) {
            Ok(()) => {
                info!(
                    incident = %incident.incident_id,
                    key = %key,
                    priority = %priority,
                    source = %anomaly.source,
                    "incident opened"
                );
                Ok(AnomalyOutcome::Opened(incident))
            }
            Err(StoreError::Conflict(reason)) => self.recover_conflict(&key, anomaly, priority, reason),
            Err(e) => Err(e.into()),
        }
    }

    /// Another process opened an incident for the key between our read and write.
    fn recover_conflict(
        &self,
        key: &DedupKey,
        anomaly: &Anomaly,
        priority: Priority,
        reason: String,
    ) -> Result<AnomalyOutcome, DetectError> {
        warn!(key = %key, %reason, "active incident appeared concurrently, folding anomaly into it");
        match self.store.find_active(key)? {
            Some(active) => self.escalate(active, anomaly, priority),
            None => Err(StoreError::Conflict(reason).into()),
        }
    }

    fn escalate(&self, active: Incident, anomaly: &Anomaly, priority: Priority) -> Result<AnomalyOutcome, DetectError> {
        let raised = active.priority.max(priority);
        if raised == active.priority {
            debug!(incident = %active.incident_id, anomaly = %anomaly.anomaly_id, "anomaly deduplicated");
            return Ok(AnomalyOutcome::Deduplicated(active));
        }

        let mut next = active.clone();
        next.priority = raised;
        next.updated_at = model::now();
        let audit = Audit::new(next.incident_id, &self.auditor_id, AuditAction::Escalated).with_comments(format!(
            "priority {} -> {}: {}",
            active.priority,
            raised,
            describe(anomaly, priority)
        ));
        self.store.update_incident(&next, &audit)?;
        info!(incident = %next.incident_id, from = %active.priority, to = %raised, "incident escalated");
        Ok(AnomalyOutcome::Escalated(next))
    }

    fn reopen(&self, prev: Incident, anomaly: &Anomaly, priority: Priority) -> Result<AnomalyOutcome, DetectError> {
        let mut next = prev.clone();
        next.status = IncidentStatus::Open;
        next.priority = prev.priority.max(priority);
        next.updated_at = model::now();
        next.resolved_at = None;
        let audit = Audit::new(
            next.incident_id,
            &self.auditor_id,
            AuditAction::Transition {
                from: prev.status,
                to: IncidentStatus::Open,
            },
        )
        .with_comments(format!("reopened: {}", describe(anomaly, priority)));
        self.store.update_incident(&next, &audit)?;
        info!(incident = %next.incident_id, from = %prev.status, "incident reopened");
        Ok(AnomalyOutcome::Reopened(next))
    }

    /// Move an incident along its lifecycle on behalf of `actor`.
    pub async fn transition(
        &self,
        id: Uuid,
        to: IncidentStatus,
        actor: &str,
        comments: &str,
    ) -> Result<Incident, DetectError> {
        let current = self.store.get_incident(id)?.ok_or(DetectError::NotFound(id))?;
        let _guard = self.lock(&current.key()).await;

        // Re-read under the lock; the status may have moved while we waited.
        let current = self.store.get_incident(id)?.ok_or(DetectError::NotFound(id))?;
        let (next, audit) = prepare_transition(&current, to, actor, comments)?;
        self.store.update_incident(&next, &audit)?;
        info!(incident = %id, from = %current.status, to = %to, actor, "incident transitioned");
        Ok(next)
    }

    /// Operator close of a RESOLVED incident.
    pub async fn close(&self, id: Uuid, actor: &str, comments: &str) -> Result<Incident, DetectError> {
        self.transition(id, IncidentStatus::Closed, actor, comments).await
    }
}

/// The incident after moving to `to`, and the audit entry describing it.
pub(crate) fn prepare_transition(
    current: &Incident,
    to: IncidentStatus,
    actor: &str,
    comments: &str,
) -> Result<(Incident, Audit), DetectError> {
    if !current.status.can_transition_to(to) {
        return Err(DetectError::InvalidTransition {
            id: current.incident_id,
            from: current.status,
            to,
        });
    }
    let mut next = current.clone();
    next.status = to;
    next.updated_at = model::now();
    match to {
        IncidentStatus::Resolved => next.resolved_at = Some(next.updated_at),
        IncidentStatus::Open => next.resolved_at = None,
        _ => {}
    }
    let audit = Audit::new(
        current.incident_id,
        actor,
        AuditAction::Transition {
            from: current.status,
            to,
        },
    )
    .with_comments(comments);
    Ok((next, audit))
}

fn describe(anomaly: &Anomaly, priority: Priority) -> String {
    format!(
        "anomaly {} ({}, z={:.2}, value={}) at {} as {} priority",
        anomaly.anomaly_id,
        anomaly.severity,
        anomaly.z_score,
        anomaly.value,
        anomaly.timestamp.to_rfc3339(),
        priority
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{AnomalySource, Severity};
    use crate::storage::{AuditStore, SqliteStore};
    use chrono::{DateTime, Utc};

    fn manager() -> (tempfile::TempDir, Arc<SqliteStore>, IncidentManager<SqliteStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SqliteStore::open(dir.path().join("i.db").to_str().unwrap()).unwrap());
        let manager = IncidentManager::new(store.clone(), Duration::hours(1), "incident-manager");
        (dir, store, manager)
    }

    fn anomaly(machine: &str, at: DateTime<Utc>, severity: Severity) -> Anomaly {
        let key = DedupKey::new(machine, "temp");
        Anomaly {
            anomaly_id: Anomaly::stable_id(&key, at, AnomalySource::Telemetry),
            machine_id: machine.into(),
            metric_name: "temp".into(),
            timestamp: at,
            value: 50.0,
            z_score: 7.0,
            severity,
            description: None,
            source: AnomalySource::Telemetry,
        }
    }

    #[tokio::test]
    async fn test_repeat_anomalies_share_one_incident() {
        let (_dir, store, mgr) = manager();
        let t0 = model::now();

        let first = mgr
            .on_anomaly(&anomaly("M1", t0, Severity::Medium), Priority::Medium)
            .await
            .unwrap();
        assert!(matches!(first, AnomalyOutcome::Opened(_)));

        let same = mgr
            .on_anomaly(&anomaly("M1", t0 + Duration::minutes(1), Severity::Low), Priority::Low)
            .await
            .unwrap();
        assert!(matches!(same, AnomalyOutcome::Deduplicated(_)));

        let raised = mgr
            .on_anomaly(&anomaly("M1", t0 + Duration::minutes(5), Severity::High), Priority::High)
            .await
            .unwrap();
        let inc = match raised {
            AnomalyOutcome::Escalated(inc) => inc,
            other => panic!("expected escalation, got {other:?}"),
        };
        assert_eq!(inc.incident_id, first.incident().incident_id);
        assert_eq!(inc.priority, Priority::High);

        let trail = store.audit_trail(inc.incident_id).unwrap();
        let actions: Vec<_> = trail.iter().map(|a| a.action).collect();
        assert_eq!(actions, vec![AuditAction::Opened, AuditAction::Escalated]);
        assert_eq!(mgr.list(None, 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_anomalies_open_one_incident() {
        let (_dir, _store, mgr) = manager();
        let mgr = Arc::new(mgr);
        let t0 = model::now();

        let mut tasks = Vec::new();
        for i in 0..10 {
            let mgr = mgr.clone();
            tasks.push(tokio::spawn(async move {
                mgr.on_anomaly(&anomaly("M2", t0 + Duration::seconds(i), Severity::Low), Priority::Low)
                    .await
                    .unwrap()
            }));
        }
        let mut opened = 0;
        for t in tasks {
            if matches!(t.await.unwrap(), AnomalyOutcome::Opened(_)) {
                opened += 1;
            }
        }
        assert_eq!(opened, 1);
        assert_eq!(mgr.list(Some(IncidentStatus::Open), 10).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lifecycle_rejects_skips() {
        let (_dir, _store, mgr) = manager();
        let out = mgr
            .on_anomaly(&anomaly("M3", model::now(), Severity::High), Priority::High)
            .await
            .unwrap();
        let id = out.incident().incident_id;

        let err = mgr.transition(id, IncidentStatus::Resolved, "ops", "").await.unwrap_err();
        assert!(matches!(err, DetectError::InvalidTransition { .. }));
        let err = mgr.close(id, "ops", "").await.unwrap_err();
        assert!(matches!(err, DetectError::InvalidTransition { .. }));

        let missing = mgr
            .transition(Uuid::new_v4(), IncidentStatus::Investigating, "ops", "")
            .await
            .unwrap_err();
        assert!(matches!(missing, DetectError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_resolved_incident_reopens_within_cooldown() {
        let (_dir, store, mgr) = manager();
        let t0 = model::now();
        let id = mgr
            .on_anomaly(&anomaly("M4", t0, Severity::Medium), Priority::Medium)
            .await
            .unwrap()
            .incident()
            .incident_id;
        for to in [
            IncidentStatus::Investigating,
            IncidentStatus::Resolving,
            IncidentStatus::Resolved,
        ] {
            mgr.transition(id, to, "ops", "").await.unwrap();
        }
        let resolved = mgr.get(id).unwrap().unwrap();
        assert!(resolved.resolved_at.is_some());

        let out = mgr
            .on_anomaly(&anomaly("M4", t0 + Duration::minutes(10), Severity::Low), Priority::Low)
            .await
            .unwrap();
        let inc = match out {
            AnomalyOutcome::Reopened(inc) => inc,
            other => panic!("expected reopen, got {other:?}"),
        };
        assert_eq!(inc.incident_id, id);
        assert_eq!(inc.status, IncidentStatus::Open);
        assert_eq!(inc.priority, Priority::Medium);
        assert!(inc.resolved_at.is_none());

        let last = store.audit_trail(id).unwrap().pop().unwrap();
        assert_eq!(
            last.action,
            AuditAction::Transition {
                from: IncidentStatus::Resolved,
                to: IncidentStatus::Open
            }
        );
    }

    #[tokio::test]
    async fn test_closed_incident_stays_closed_after_cooldown() {
        let (_dir, _store, mgr) = manager();
        let t0 = model::now();
        let id = mgr
            .on_anomaly(&anomaly("M5", t0, Severity::Low), Priority::Low)
            .await
            .unwrap()
            .incident()
            .incident_id;
        for to in [
            IncidentStatus::Investigating,
            IncidentStatus::Resolving,
            IncidentStatus::Resolved,
            IncidentStatus::Closed,
        ] {
            mgr.transition(id, to, "ops", "").await.unwrap();
        }

        let later = model::now() + Duration::hours(2);
        let out = mgr
            .on_anomaly(&anomaly("M5", later, Severity::Low), Priority::Low)
            .await
            .unwrap();
        assert!(matches!(out, AnomalyOutcome::Opened(_)));
        assert_ne!(out.incident().incident_id, id);
        assert_eq!(mgr.get(id).unwrap().unwrap().status, IncidentStatus::Closed);
    }
}
