//! Database schema and migrations.

use rusqlite::Connection;

const SCHEMA_VERSION: i64 = 2;

/// Run all pending migrations.
pub fn migrate(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE TABLE IF NOT EXISTS sensor_readings (
            reading_id INTEGER PRIMARY KEY,
            machine_id TEXT NOT NULL,
            sensor_type TEXT NOT NULL,
            value REAL NOT NULL,
            unit TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            anomaly_score REAL NOT NULL DEFAULT 0,
            UNIQUE (machine_id, sensor_type, timestamp)
        );

        CREATE TABLE IF NOT EXISTS sensor_aggregates (
            machine_id TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            window_start TEXT NOT NULL,
            window_end TEXT NOT NULL,
            rolling_average REAL NOT NULL,
            rolling_std REAL NOT NULL CHECK (rolling_std >= 0),
            anomaly_score REAL NOT NULL DEFAULT 0,
            sample_count INTEGER NOT NULL CHECK (sample_count > 0),
            PRIMARY KEY (machine_id, metric_name, window_start),
            CHECK (window_end > window_start)
        );

        -- One row per stream: the window still accumulating readings.
        CREATE TABLE IF NOT EXISTS open_windows (
            machine_id TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            window_start TEXT NOT NULL,
            last_seen TEXT NOT NULL,
            sample_count INTEGER NOT NULL CHECK (sample_count > 0),
            mean REAL NOT NULL,
            m2 REAL NOT NULL CHECK (m2 >= 0),
            PRIMARY KEY (machine_id, metric_name),
            CHECK (last_seen >= window_start)
        );

        CREATE TABLE IF NOT EXISTS anomalies (
            anomaly_id TEXT PRIMARY KEY,
            machine_id TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            timestamp TEXT NOT NULL,
            value REAL NOT NULL,
            z_score REAL NOT NULL,
            severity TEXT NOT NULL CHECK (severity IN ('low', 'medium', 'high', 'critical')),
            description TEXT,
            source TEXT NOT NULL CHECK (source IN ('telemetry', 'forecast'))
        );

        CREATE TABLE IF NOT EXISTS incidents (
            incident_id TEXT PRIMARY KEY,
            source TEXT NOT NULL CHECK (source IN ('telemetry', 'forecast')),
            machine_id TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            status TEXT NOT NULL
                CHECK (status IN ('OPEN', 'INVESTIGATING', 'RESOLVING', 'RESOLVED', 'CLOSED')),
            priority TEXT NOT NULL CHECK (priority IN ('low', 'medium', 'high', 'critical')),
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            resolved_at TEXT
        );

        -- At most one active incident per dedup key.
        CREATE UNIQUE INDEX IF NOT EXISTS idx_incidents_active_key
            ON incidents(machine_id, metric_name)
            WHERE status NOT IN ('RESOLVED', 'CLOSED');

        CREATE TABLE IF NOT EXISTS investigation_reports (
            report_id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL REFERENCES incidents(incident_id),
            investigator_id TEXT NOT NULL,
            hypothesis TEXT NOT NULL,
            confidence REAL NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
            created_at TEXT NOT NULL,
            accepted_at TEXT
        );

        CREATE TABLE IF NOT EXISTS evidence (
            evidence_id TEXT PRIMARY KEY,
            report_id TEXT NOT NULL REFERENCES investigation_reports(report_id),
            source TEXT NOT NULL,
            type TEXT NOT NULL,
            details TEXT NOT NULL,
            timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS resolution_plans (
            plan_id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL REFERENCES incidents(incident_id),
            resolution_steps TEXT NOT NULL,
            executed INTEGER NOT NULL DEFAULT 0 CHECK (executed IN (0, 1)),
            created_at TEXT NOT NULL,
            executed_at TEXT,
            CHECK ((executed = 0 AND executed_at IS NULL) OR (executed = 1 AND executed_at IS NOT NULL))
        );

        CREATE TABLE IF NOT EXISTS audits (
            audit_id TEXT PRIMARY KEY,
            incident_id TEXT NOT NULL REFERENCES incidents(incident_id),
            auditor_id TEXT NOT NULL,
            action TEXT NOT NULL,
            comments TEXT NOT NULL DEFAULT '',
            timestamp TEXT NOT NULL,
            sequence INTEGER NOT NULL,
            UNIQUE (incident_id, sequence)
        );

        CREATE TABLE IF NOT EXISTS predictive_forecasts (
            forecast_id TEXT PRIMARY KEY,
            machine_id TEXT NOT NULL,
            metric_name TEXT NOT NULL,
            forecast_time TEXT NOT NULL,
            predicted_value REAL NOT NULL,
            confidence REAL NOT NULL CHECK (confidence >= 0 AND confidence <= 1),
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS tool_calls (
            call_id TEXT PRIMARY KEY,
            agent_id TEXT NOT NULL,
            tool_name TEXT NOT NULL,
            request TEXT NOT NULL,
            response TEXT NOT NULL,
            latency_ms INTEGER NOT NULL CHECK (latency_ms >= 0),
            tokens_used INTEGER NOT NULL DEFAULT 0,
            timestamp TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS machines (
            machine_id TEXT PRIMARY KEY,
            facility_id TEXT NOT NULL,
            machine_type TEXT NOT NULL,
            model TEXT NOT NULL,
            installation_date TEXT NOT NULL,
            last_maintenance_date TEXT NOT NULL,
            status TEXT NOT NULL,
            location TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS slack_messages (
            message_id TEXT PRIMARY KEY,
            channel TEXT NOT NULL,
            user_id TEXT NOT NULL,
            text TEXT NOT NULL,
            timestamp TEXT,
            machine_id TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS support_tickets (
            ticket_id TEXT PRIMARY KEY,
            customer_id TEXT NOT NULL,
            title TEXT NOT NULL,
            description TEXT,
            category TEXT NOT NULL,
            priority TEXT NOT NULL,
            status TEXT NOT NULL,
            assigned_to TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            resolved_at TEXT,
            sla_deadline TEXT NOT NULL,
            related_entity_type TEXT NOT NULL,
            related_entity_id TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_readings_stream ON sensor_readings(machine_id, sensor_type, timestamp);
        CREATE INDEX IF NOT EXISTS idx_anomalies_stream ON anomalies(machine_id, metric_name, timestamp);
        CREATE INDEX IF NOT EXISTS idx_reports_incident ON investigation_reports(incident_id);
        CREATE INDEX IF NOT EXISTS idx_evidence_report ON evidence(report_id);
        CREATE INDEX IF NOT EXISTS idx_plans_incident ON resolution_plans(incident_id);
        CREATE INDEX IF NOT EXISTS idx_audits_incident ON audits(incident_id, timestamp, sequence);
        CREATE INDEX IF NOT EXISTS idx_forecasts_stream ON predictive_forecasts(machine_id, metric_name, forecast_time);
        CREATE INDEX IF NOT EXISTS idx_tool_calls_agent ON tool_calls(agent_id, timestamp);
        CREATE INDEX IF NOT EXISTS idx_slack_machine ON slack_messages(machine_id, timestamp);

        -- Append-only tables.
        CREATE TRIGGER IF NOT EXISTS audits_no_update BEFORE UPDATE ON audits
            BEGIN SELECT RAISE(ABORT, 'audits are append-only'); END;
        CREATE TRIGGER IF NOT EXISTS audits_no_delete BEFORE DELETE ON audits
            BEGIN SELECT RAISE(ABORT, 'audits are append-only'); END;
        CREATE TRIGGER IF NOT EXISTS evidence_no_update BEFORE UPDATE ON evidence
            BEGIN SELECT RAISE(ABORT, 'evidence is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS evidence_no_delete BEFORE DELETE ON evidence
            BEGIN SELECT RAISE(ABORT, 'evidence is append-only'); END;
        CREATE TRIGGER IF NOT EXISTS readings_no_update BEFORE UPDATE ON sensor_readings
            BEGIN SELECT RAISE(ABORT, 'sensor readings are immutable'); END;
        CREATE TRIGGER IF NOT EXISTS anomalies_no_update BEFORE UPDATE ON anomalies
            BEGIN SELECT RAISE(ABORT, 'anomalies are immutable'); END;
        CREATE TRIGGER IF NOT EXISTS tool_calls_no_update BEFORE UPDATE ON tool_calls
            BEGIN SELECT RAISE(ABORT, 'tool calls are immutable'); END;

        -- executed flips false -> true once and never back.
        CREATE TRIGGER IF NOT EXISTS plans_executed_monotonic
            BEFORE UPDATE OF executed, executed_at ON resolution_plans
            WHEN OLD.executed = 1
            BEGIN SELECT RAISE(ABORT, 'resolution plan already executed'); END;",
    )?;

    conn.execute(
        "INSERT OR IGNORE INTO schema_version (version) VALUES (?1)",
        [SCHEMA_VERSION],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_creates_tables() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        // Verify tables exist by querying them
        for table in ["sensor_readings", "open_windows", "incidents", "audits", "tool_calls", "machines"] {
            let count: i64 = conn
                .query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |row| row.get(0))
                .unwrap();
            assert_eq!(count, 0, "{table} should start empty");
        }
    }

    #[test]
    fn test_migrate_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        migrate(&conn).unwrap(); // Should not error

        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    fn seed_incident(conn: &Connection, id: &str, status: &str) -> rusqlite::Result<usize> {
        conn.execute(
            "INSERT INTO incidents (incident_id, source, machine_id, metric_name, status, priority, created_at, updated_at)
             VALUES (?1, 'telemetry', 'M1', 'temp', ?2, 'low', '2026-01-01T00:00:00.000000Z', '2026-01-01T00:00:00.000000Z')",
            rusqlite::params![id, status],
        )
    }

    #[test]
    fn test_one_active_incident_per_key() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();

        seed_incident(&conn, "a", "OPEN").unwrap();
        assert!(seed_incident(&conn, "b", "INVESTIGATING").is_err());
        // Terminal incidents do not hold the key.
        seed_incident(&conn, "c", "CLOSED").unwrap();
        seed_incident(&conn, "d", "RESOLVED").unwrap();
    }

    #[test]
    fn test_audits_are_append_only() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        seed_incident(&conn, "a", "OPEN").unwrap();
        conn.execute(
            "INSERT INTO audits (audit_id, incident_id, auditor_id, action, timestamp, sequence)
             VALUES ('x', 'a', 'ops', 'opened', '2026-01-01T00:00:00.000000Z', 1)",
            [],
        )
        .unwrap();

        assert!(conn.execute("UPDATE audits SET comments = 'edited'", []).is_err());
        assert!(conn.execute("DELETE FROM audits", []).is_err());
    }

    #[test]
    fn test_executed_flag_never_reverses() {
        let conn = Connection::open_in_memory().unwrap();
        migrate(&conn).unwrap();
        seed_incident(&conn, "a", "RESOLVING").unwrap();
        conn.execute(
            "INSERT INTO resolution_plans (plan_id, incident_id, resolution_steps, executed, created_at)
             VALUES ('p', 'a', '{}', 0, '2026-01-01T00:00:00.000000Z')",
            [],
        )
        .unwrap();

        // executed without a timestamp violates the CHECK.
        assert!(conn
            .execute("UPDATE resolution_plans SET executed = 1", [])
            .is_err());

        conn.execute(
            "UPDATE resolution_plans SET executed = 1, executed_at = '2026-01-01T00:01:00.000000Z'",
            [],
        )
        .unwrap();
        assert!(conn
            .execute("UPDATE resolution_plans SET executed = 0, executed_at = NULL", [])
            .is_err());
    }
}
