use super::codec::{self, fmt_ts};
use super::{SqliteStore, StoreError, TelemetryStore};
use crate::model::{Anomaly, DedupKey, OpenWindow, SensorAggregate, SensorReading};
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row, TransactionBehavior};
use uuid::Uuid;

const AGGREGATE_COLUMNS: &str = "machine_id, metric_name, window_start, window_end, \
     rolling_average, rolling_std, anomaly_score, sample_count";

const WINDOW_COLUMNS: &str = "machine_id, metric_name, window_start, last_seen, sample_count, mean, m2";

const ANOMALY_COLUMNS: &str = "anomaly_id, machine_id, metric_name, timestamp, value, \
     z_score, severity, description, source";

fn aggregate_row(row: &Row<'_>) -> rusqlite::Result<SensorAggregate> {
    let sample_count: i64 = row.get(7)?;
    Ok(SensorAggregate {
        machine_id: row.get(0)?,
        metric_name: row.get(1)?,
        window_start: codec::ts(row, 2)?,
        window_end: codec::ts(row, 3)?,
        rolling_avg: row.get(4)?,
        rolling_std: row.get(5)?,
        anomaly_score: row.get(6)?,
        sample_count: sample_count.max(0) as u64,
    })
}

fn window_row(row: &Row<'_>) -> rusqlite::Result<OpenWindow> {
    let count: i64 = row.get(4)?;
    Ok(OpenWindow {
        machine_id: row.get(0)?,
        metric_name: row.get(1)?,
        window_start: codec::ts(row, 2)?,
        last_seen: codec::ts(row, 3)?,
        count: count.max(0) as u64,
        mean: row.get(5)?,
        m2: row.get(6)?,
    })
}

fn anomaly_row(row: &Row<'_>) -> rusqlite::Result<Anomaly> {
    Ok(Anomaly {
        anomaly_id: codec::uuid(row, 0)?,
        machine_id: row.get(1)?,
        metric_name: row.get(2)?,
        timestamp: codec::ts(row, 3)?,
        value: row.get(4)?,
        z_score: row.get(5)?,
        severity: codec::parsed(row, 6)?,
        description: row.get(7)?,
        source: codec::parsed(row, 8)?,
    })
}

impl TelemetryStore for SqliteStore {
    fn record_reading(&self, reading: &SensorReading, window: &OpenWindow) -> Result<Option<i64>, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let inserted = tx.execute(
            "INSERT INTO sensor_readings (machine_id, sensor_type, value, unit, timestamp, anomaly_score)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (machine_id, sensor_type, timestamp) DO NOTHING",
            params![
                reading.machine_id,
                reading.sensor_type,
                reading.value,
                reading.unit,
                fmt_ts(&reading.timestamp),
                reading.anomaly_score,
            ],
        )?;
        let id = (inserted > 0).then(|| tx.last_insert_rowid());

        tx.execute(
            &format!(
                "INSERT INTO open_windows ({WINDOW_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT (machine_id, metric_name) DO UPDATE SET
                     window_start = excluded.window_start,
                     last_seen = excluded.last_seen,
                     sample_count = excluded.sample_count,
                     mean = excluded.mean,
                     m2 = excluded.m2"
            ),
            params![
                window.machine_id,
                window.metric_name,
                fmt_ts(&window.window_start),
                fmt_ts(&window.last_seen),
                i64::try_from(window.count).unwrap_or(i64::MAX),
                window.mean,
                window.m2,
            ],
        )?;
        tx.commit()?;
        Ok(id)
    }

    fn open_window(&self, key: &DedupKey) -> Result<Option<OpenWindow>, StoreError> {
        let conn = self.pool.get()?;
        let window = conn
            .query_row(
                &format!("SELECT {WINDOW_COLUMNS} FROM open_windows WHERE machine_id = ?1 AND metric_name = ?2"),
                params![key.machine_id, key.metric_name],
                window_row,
            )
            .optional()?;
        Ok(window)
    }

    fn record_aggregate(&self, aggregate: &SensorAggregate) -> Result<bool, StoreError> {
        let mut conn = self.pool.get()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing = {
            let mut stmt = tx.prepare(&format!(
                "SELECT {AGGREGATE_COLUMNS} FROM sensor_aggregates
                 WHERE machine_id = ?1 AND metric_name = ?2
                   AND window_start < ?4 AND window_end > ?3"
            ))?;
            let rows = stmt.query_map(
                params![
                    aggregate.machine_id,
                    aggregate.metric_name,
                    fmt_ts(&aggregate.window_start),
                    fmt_ts(&aggregate.window_end),
                ],
                aggregate_row,
            )?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        if let Some(other) = existing.first() {
            if existing.len() == 1
                && other.window_start == aggregate.window_start
                && other.window_end == aggregate.window_end
            {
                return Ok(false);
            }
            return Err(StoreError::Conflict(format!(
                "window [{}, {}) overlaps [{}, {}) for {}",
                fmt_ts(&aggregate.window_start),
                fmt_ts(&aggregate.window_end),
                fmt_ts(&other.window_start),
                fmt_ts(&other.window_end),
                aggregate.key(),
            )));
        }

        tx.execute(
            &format!("INSERT INTO sensor_aggregates ({AGGREGATE_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
            params![
                aggregate.machine_id,
                aggregate.metric_name,
                fmt_ts(&aggregate.window_start),
                fmt_ts(&aggregate.window_end),
                aggregate.rolling_avg,
                aggregate.rolling_std,
                aggregate.anomaly_score,
                i64::try_from(aggregate.sample_count).unwrap_or(i64::MAX),
            ],
        )?;
        tx.commit()?;
        Ok(true)
    }

    fn recent_aggregates(&self, key: &DedupKey, limit: usize) -> Result<Vec<SensorAggregate>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {AGGREGATE_COLUMNS} FROM sensor_aggregates
             WHERE machine_id = ?1 AND metric_name = ?2
             ORDER BY window_start DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![key.machine_id, key.metric_name, codec::limit(limit)],
            aggregate_row,
        )?;
        let mut aggregates = rows.collect::<Result<Vec<_>, _>>()?;
        aggregates.reverse();
        Ok(aggregates)
    }

    fn latest_aggregate(&self, key: &DedupKey) -> Result<Option<SensorAggregate>, StoreError> {
        let conn = self.pool.get()?;
        let latest = conn
            .query_row(
                &format!(
                    "SELECT {AGGREGATE_COLUMNS} FROM sensor_aggregates
                     WHERE machine_id = ?1 AND metric_name = ?2
                     ORDER BY window_start DESC LIMIT 1"
                ),
                params![key.machine_id, key.metric_name],
                aggregate_row,
            )
            .optional()?;
        Ok(latest)
    }

    fn aggregate_before(&self, key: &DedupKey, end: DateTime<Utc>) -> Result<Option<SensorAggregate>, StoreError> {
        let conn = self.pool.get()?;
        let before = conn
            .query_row(
                &format!(
                    "SELECT {AGGREGATE_COLUMNS} FROM sensor_aggregates
                     WHERE machine_id = ?1 AND metric_name = ?2 AND window_end <= ?3
                     ORDER BY window_start DESC LIMIT 1"
                ),
                params![key.machine_id, key.metric_name, fmt_ts(&end)],
                aggregate_row,
            )
            .optional()?;
        Ok(before)
    }

    fn record_anomaly(&self, anomaly: &Anomaly) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let inserted = conn.execute(
            &format!(
                "INSERT OR IGNORE INTO anomalies ({ANOMALY_COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                anomaly.anomaly_id.to_string(),
                anomaly.machine_id,
                anomaly.metric_name,
                fmt_ts(&anomaly.timestamp),
                anomaly.value,
                anomaly.z_score,
                anomaly.severity.as_str(),
                anomaly.description,
                anomaly.source.as_str(),
            ],
        )?;
        Ok(inserted > 0)
    }

    fn get_anomaly(&self, id: Uuid) -> Result<Option<Anomaly>, StoreError> {
        let conn = self.pool.get()?;
        let anomaly = conn
            .query_row(
                &format!("SELECT {ANOMALY_COLUMNS} FROM anomalies WHERE anomaly_id = ?1"),
                [id.to_string()],
                anomaly_row,
            )
            .optional()?;
        Ok(anomaly)
    }

    fn recent_anomalies(&self, key: &DedupKey, limit: usize) -> Result<Vec<Anomaly>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {ANOMALY_COLUMNS} FROM anomalies
             WHERE machine_id = ?1 AND metric_name = ?2
             ORDER BY timestamp DESC LIMIT ?3"
        ))?;
        let rows = stmt.query_map(
            params![key.machine_id, key.metric_name, codec::limit(limit)],
            anomaly_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn streams(&self) -> Result<Vec<DedupKey>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT machine_id, metric_name FROM sensor_aggregates
             ORDER BY machine_id, metric_name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(DedupKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
