use super::{AnomalySource, DedupKey, ParseEnumError, Priority};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Incident lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    Investigating,
    Resolving,
    Resolved,
    Closed,
}

impl IncidentStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            IncidentStatus::Open => "OPEN",
            IncidentStatus::Investigating => "INVESTIGATING",
            IncidentStatus::Resolving => "RESOLVING",
            IncidentStatus::Resolved => "RESOLVED",
            IncidentStatus::Closed => "CLOSED",
        }
    }

    /// RESOLVED and CLOSED no longer hold the dedup key.
    pub fn is_terminal(self) -> bool {
        matches!(self, IncidentStatus::Resolved | IncidentStatus::Closed)
    }

    /// Forward edges of the lifecycle plus the reopen edge from either
    /// terminal state back to OPEN.
    pub fn can_transition_to(self, next: IncidentStatus) -> bool {
        use IncidentStatus::*;
        matches!(
            (self, next),
            (Open, Investigating)
                | (Investigating, Resolving)
                | (Resolving, Resolved)
                | (Resolved, Closed)
                | (Resolved, Open)
                | (Closed, Open)
        )
    }
}

impl fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IncidentStatus {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OPEN" => Ok(IncidentStatus::Open),
            "INVESTIGATING" => Ok(IncidentStatus::Investigating),
            "RESOLVING" => Ok(IncidentStatus::Resolving),
            "RESOLVED" => Ok(IncidentStatus::Resolved),
            "CLOSED" => Ok(IncidentStatus::Closed),
            other => Err(ParseEnumError::new("incident status", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Incident {
    pub incident_id: Uuid,
    pub source: AnomalySource,
    pub machine_id: String,
    pub metric_name: String,
    pub status: IncidentStatus,
    pub priority: Priority,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl Incident {
    pub fn key(&self) -> DedupKey {
        DedupKey::new(self.machine_id.clone(), self.metric_name.clone())
    }

    pub fn is_active(&self) -> bool {
        !self.status.is_terminal()
    }
}

/// What an audit entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum AuditAction {
    Opened,
    Escalated,
    Transition {
        from: IncidentStatus,
        to: IncidentStatus,
    },
    ReportFiled,
    EvidenceAttached,
    PlanCreated,
    PlanFailed,
    Note,
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditAction::Opened => f.write_str("opened"),
            AuditAction::Escalated => f.write_str("escalated"),
            AuditAction::Transition { from, to } => write!(f, "transition:{}->{}", from, to),
            AuditAction::ReportFiled => f.write_str("report_filed"),
            AuditAction::EvidenceAttached => f.write_str("evidence_attached"),
            AuditAction::PlanCreated => f.write_str("plan_created"),
            AuditAction::PlanFailed => f.write_str("plan_failed"),
            AuditAction::Note => f.write_str("note"),
        }
    }
}

impl FromStr for AuditAction {
    type Err = ParseEnumError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(edge) = s.strip_prefix("transition:") {
            let (from, to) = edge
                .split_once("->")
                .ok_or_else(|| ParseEnumError::new("audit action", s))?;
            return Ok(AuditAction::Transition {
                from: from.parse()?,
                to: to.parse()?,
            });
        }
        match s {
            "opened" => Ok(AuditAction::Opened),
            "escalated" => Ok(AuditAction::Escalated),
            "report_filed" => Ok(AuditAction::ReportFiled),
            "evidence_attached" => Ok(AuditAction::EvidenceAttached),
            "plan_created" => Ok(AuditAction::PlanCreated),
            "plan_failed" => Ok(AuditAction::PlanFailed),
            "note" => Ok(AuditAction::Note),
            other => Err(ParseEnumError::new("audit action", other)),
        }
    }
}

impl From<AuditAction> for String {
    fn from(action: AuditAction) -> Self {
        action.to_string()
    }
}

impl TryFrom<String> for AuditAction {
    type Error = ParseEnumError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// One entry of an incident's append-only audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Audit {
    pub audit_id: Uuid,
    pub incident_id: Uuid,
    pub auditor_id: String,
    pub action: AuditAction,
    pub comments: String,
    pub timestamp: DateTime<Utc>,
    /// Per-incident insertion order, assigned by storage. Breaks timestamp ties.
    pub sequence: i64,
}

impl Audit {
    pub fn new(incident_id: Uuid, auditor_id: impl Into<String>, action: AuditAction) -> Self {
        Self {
            audit_id: Uuid::new_v4(),
            incident_id,
            auditor_id: auditor_id.into(),
            action,
            comments: String::new(),
            timestamp: super::now(),
            sequence: 0,
        }
    }

    /// Builder-style setter for `comments`.
    pub fn with_comments(mut self, comments: impl Into<String>) -> Self {
        self.comments = comments.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use IncidentStatus::*;

    #[test]
    fn test_lifecycle_edges() {
        assert!(Open.can_transition_to(Investigating));
        assert!(Investigating.can_transition_to(Resolving));
        assert!(Resolving.can_transition_to(Resolved));
        assert!(Resolved.can_transition_to(Closed));
        assert!(Closed.can_transition_to(Open));
        assert!(Resolved.can_transition_to(Open));
    }

    #[test]
    fn test_no_skipping_or_regression() {
        assert!(!Open.can_transition_to(Resolving));
        assert!(!Open.can_transition_to(Resolved));
        assert!(!Investigating.can_transition_to(Open));
        assert!(!Resolving.can_transition_to(Investigating));
        assert!(!Closed.can_transition_to(Resolved));
        assert!(!Open.can_transition_to(Open));
    }

    #[test]
    fn test_terminal_states() {
        assert!(Resolved.is_terminal());
        assert!(Closed.is_terminal());
        assert!(!Resolving.is_terminal());
    }

    #[test]
    fn test_audit_action_strings() {
        let t = AuditAction::Transition {
            from: Resolving,
            to: Resolved,
        };
        assert_eq!(t.to_string(), "transition:RESOLVING->RESOLVED");
        assert_eq!("transition:RESOLVING->RESOLVED".parse::<AuditAction>().unwrap(), t);
        assert_eq!("plan_failed".parse::<AuditAction>().unwrap(), AuditAction::PlanFailed);
        assert!("transition:RESOLVING".parse::<AuditAction>().is_err());
        assert!("transition:OPEN->DONE".parse::<AuditAction>().is_err());
    }

    #[test]
    fn test_audit_action_serializes_as_string() {
        let json = serde_json::to_string(&AuditAction::Escalated).unwrap();
        assert_eq!(json, r#""escalated""#);
        let back: AuditAction = serde_json::from_str(r#""transition:OPEN->INVESTIGATING""#).unwrap();
        assert_eq!(
            back,
            AuditAction::Transition {
                from: Open,
                to: Investigating
            }
        );
    }
}
