//! Records owned by other systems. The pipeline reads them as investigation
//! context and never drives their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Machine {
    pub machine_id: String,
    pub facility_id: String,
    pub machine_type: String,
    pub model: String,
    pub installation_date: DateTime<Utc>,
    pub last_maintenance_date: DateTime<Utc>,
    pub status: String,
    pub location: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlackMessage {
    pub message_id: String,
    pub channel: String,
    pub user_id: String,
    pub text: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub machine_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SupportTicket {
    pub ticket_id: String,
    pub customer_id: String,
    pub title: String,
    pub description: Option<String>,
    pub category: String,
    pub priority: String,
    pub status: String,
    pub assigned_to: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub sla_deadline: DateTime<Utc>,
    pub related_entity_type: String,
    pub related_entity_id: String,
}

impl SupportTicket {
    pub fn is_open(&self) -> bool {
        self.resolved_at.is_none()
    }
}
