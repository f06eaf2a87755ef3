use super::codec::{self, fmt_ts};
use super::{ForecastStore, SqliteStore, StoreError};
use crate::model::{DedupKey, PredictiveForecast};
use chrono::{DateTime, Utc};
use rusqlite::{params, Row};

const FORECAST_COLUMNS: &str =
    "forecast_id, machine_id, metric_name, forecast_time, predicted_value, confidence, created_at";

fn forecast_row(row: &Row<'_>) -> rusqlite::Result<PredictiveForecast> {
    Ok(PredictiveForecast {
        forecast_id: codec::uuid(row, 0)?,
        machine_id: row.get(1)?,
        metric_name: row.get(2)?,
        forecast_time: codec::ts(row, 3)?,
        predicted_value: row.get(4)?,
        confidence: row.get(5)?,
        created_at: codec::ts(row, 6)?,
    })
}

impl ForecastStore for SqliteStore {
    fn insert_forecast(&self, forecast: &PredictiveForecast) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            &format!("INSERT INTO predictive_forecasts ({FORECAST_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                forecast.forecast_id.to_string(),
                forecast.machine_id,
                forecast.metric_name,
                fmt_ts(&forecast.forecast_time),
                forecast.predicted_value,
                forecast.confidence,
                fmt_ts(&forecast.created_at),
            ],
        )?;
        Ok(())
    }

    fn forecasts(
        &self,
        key: &DedupKey,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<PredictiveForecast>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {FORECAST_COLUMNS} FROM predictive_forecasts
             WHERE machine_id = ?1 AND metric_name = ?2
               AND forecast_time >= ?3 AND forecast_time <= ?4
             ORDER BY forecast_time, created_at"
        ))?;
        let rows = stmt.query_map(
            params![key.machine_id, key.metric_name, fmt_ts(&from), fmt_ts(&to)],
            forecast_row,
        )?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    #[test]
    fn test_forecast_range_query() {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(dir.path().join("f.db").to_str().unwrap()).unwrap();
        let key = DedupKey::new("M1", "temp");
        let at = |h| Utc.with_ymd_and_hms(2026, 3, 1, h, 0, 0).unwrap();
        for h in [1, 5, 9] {
            store
                .insert_forecast(&PredictiveForecast {
                    forecast_id: Uuid::new_v4(),
                    machine_id: "M1".into(),
                    metric_name: "temp".into(),
                    forecast_time: at(h),
                    predicted_value: h as f64,
                    confidence: 0.75,
                    created_at: crate::model::now(),
                })
                .unwrap();
        }
        let hits = store.forecasts(&key, at(1), at(5)).unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[1].predicted_value, 5.0);
        assert!(store
            .forecasts(&DedupKey::new("M2", "temp"), at(0), at(23))
            .unwrap()
            .is_empty());
    }
}
