use super::codec::{self, fmt_opt_ts, fmt_ts};
use super::{CatalogStore, SqliteStore, StoreError};
use crate::model::{Machine, SlackMessage, SupportTicket};
use rusqlite::{params, OptionalExtension, Row};

const MACHINE_COLUMNS: &str = "machine_id, facility_id, machine_type, model, installation_date, \
     last_maintenance_date, status, location";

const SLACK_COLUMNS: &str = "message_id, channel, user_id, text, timestamp, machine_id";

const TICKET_COLUMNS: &str = "ticket_id, customer_id, title, description, category, priority, status, \
     assigned_to, created_at, updated_at, resolved_at, sla_deadline, related_entity_type, related_entity_id";

fn machine_row(row: &Row<'_>) -> rusqlite::Result<Machine> {
    Ok(Machine {
        machine_id: row.get(0)?,
        facility_id: row.get(1)?,
        machine_type: row.get(2)?,
        model: row.get(3)?,
        installation_date: codec::ts(row, 4)?,
        last_maintenance_date: codec::ts(row, 5)?,
        status: row.get(6)?,
        location: row.get(7)?,
    })
}

fn slack_row(row: &Row<'_>) -> rusqlite::Result<SlackMessage> {
    Ok(SlackMessage {
        message_id: row.get(0)?,
        channel: row.get(1)?,
        user_id: row.get(2)?,
        text: row.get(3)?,
        timestamp: codec::opt_ts(row, 4)?,
        machine_id: row.get(5)?,
    })
}

fn ticket_row(row: &Row<'_>) -> rusqlite::Result<SupportTicket> {
    Ok(SupportTicket {
        ticket_id: row.get(0)?,
        customer_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        category: row.get(4)?,
        priority: row.get(5)?,
        status: row.get(6)?,
        assigned_to: row.get(7)?,
        created_at: codec::ts(row, 8)?,
        updated_at: codec::ts(row, 9)?,
        resolved_at: codec::opt_ts(row, 10)?,
        sla_deadline: codec::ts(row, 11)?,
        related_entity_type: row.get(12)?,
        related_entity_id: row.get(13)?,
    })
}

impl CatalogStore for SqliteStore {
    fn upsert_machine(&self, machine: &Machine) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO machines ({MACHINE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                machine.machine_id,
                machine.facility_id,
                machine.machine_type,
                machine.model,
                fmt_ts(&machine.installation_date),
                fmt_ts(&machine.last_maintenance_date),
                machine.status,
                machine.location,
            ],
        )?;
        Ok(())
    }

    fn get_machine(&self, machine_id: &str) -> Result<Option<Machine>, StoreError> {
        let conn = self.pool.get()?;
        let machine = conn
            .query_row(
                &format!("SELECT {MACHINE_COLUMNS} FROM machines WHERE machine_id = ?1"),
                [machine_id],
                machine_row,
            )
            .optional()?;
        Ok(machine)
    }

    fn record_slack_message(&self, message: &SlackMessage) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!("INSERT OR IGNORE INTO slack_messages ({SLACK_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6)"),
            params![
                message.message_id,
                message.channel,
                message.user_id,
                message.text,
                fmt_opt_ts(&message.timestamp),
                message.machine_id,
            ],
        )?;
        Ok(())
    }

    fn slack_messages_for_machine(&self, machine_id: &str, limit: usize) -> Result<Vec<SlackMessage>, StoreError> {
        let conn = self.pool.get()?;
        // Messages without a timestamp sort last.
        let mut stmt = conn.prepare(&format!(
            "SELECT {SLACK_COLUMNS} FROM slack_messages WHERE machine_id = ?1
             ORDER BY timestamp IS NULL, timestamp DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![machine_id, codec::limit(limit)], slack_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn upsert_ticket(&self, ticket: &SupportTicket) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO support_tickets ({TICKET_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)"
            ),
            params![
                ticket.ticket_id,
                ticket.customer_id,
                ticket.title,
                ticket.description,
                ticket.category,
                ticket.priority,
                ticket.status,
                ticket.assigned_to,
                fmt_ts(&ticket.created_at),
                fmt_ts(&ticket.updated_at),
                fmt_opt_ts(&ticket.resolved_at),
                fmt_ts(&ticket.sla_deadline),
                ticket.related_entity_type,
                ticket.related_entity_id,
            ],
        )?;
        Ok(())
    }

    fn open_tickets_for_machine(&self, machine_id: &str) -> Result<Vec<SupportTicket>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {TICKET_COLUMNS} FROM support_tickets
             WHERE related_entity_type = 'machine' AND related_entity_id = ?1
               AND resolved_at IS NULL
             ORDER BY sla_deadline"
        ))?;
        let rows = stmt.query_map([machine_id], ticket_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
