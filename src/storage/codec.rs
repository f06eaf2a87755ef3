//! Column encoding shared by the repository implementations.
//!
//! Timestamps are persisted as RFC 3339 with microsecond precision so that
//! lexical order matches chronological order.

use crate::model::Payload;
use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::types::Type;
use rusqlite::Row;
use std::str::FromStr;
use uuid::Uuid;

pub(crate) fn fmt_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub(crate) fn fmt_opt_ts(ts: &Option<DateTime<Utc>>) -> Option<String> {
    ts.as_ref().map(fmt_ts)
}

fn conversion<E>(idx: usize, err: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn parse_ts(idx: usize, raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion(idx, e))
}

pub(crate) fn ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(idx, &raw)
}

pub(crate) fn opt_ts(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let raw: Option<String> = row.get(idx)?;
    raw.map(|r| parse_ts(idx, &r)).transpose()
}

pub(crate) fn uuid(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion(idx, e))
}

/// Enum columns stored as their string form.
pub(crate) fn parsed<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(idx)?;
    raw.parse().map_err(|e| conversion(idx, e))
}

/// JSON object columns. Anything other than an object is malformed.
pub(crate) fn payload(row: &Row<'_>, idx: usize) -> rusqlite::Result<Payload> {
    let raw: String = row.get(idx)?;
    let value: serde_json::Value = serde_json::from_str(&raw).map_err(|e| conversion(idx, e))?;
    if !value.is_object() {
        return Err(rusqlite::Error::FromSqlConversionFailure(
            idx,
            Type::Text,
            format!("expected a JSON object, found {value}").into(),
        ));
    }
    Ok(Payload::from_value(value))
}

pub(crate) fn to_json(payload: &Payload) -> Result<String, serde_json::Error> {
    serde_json::to_string(payload)
}

/// SQLite integers are signed; clamp row limits into range.
pub(crate) fn limit(n: usize) -> i64 {
    i64::try_from(n).unwrap_or(i64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rusqlite::Connection;

    #[test]
    fn test_timestamp_text_sorts_chronologically() {
        let a = Utc.with_ymd_and_hms(2026, 3, 1, 9, 59, 59).unwrap();
        let b = a + chrono::Duration::microseconds(1);
        assert!(fmt_ts(&a) < fmt_ts(&b));
        assert!(fmt_ts(&a).ends_with('Z'));
    }

    #[test]
    fn test_malformed_columns_are_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        let err = conn
            .query_row("SELECT 'not-a-uuid'", [], |row| uuid(row, 0))
            .unwrap_err();
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(0, _, _)));

        let err = conn
            .query_row("SELECT '[1,2]'", [], |row| payload(row, 0))
            .unwrap_err();
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(0, _, _)));

        let err = conn
            .query_row("SELECT 'yesterday'", [], |row| ts(row, 0))
            .unwrap_err();
        assert!(matches!(err, rusqlite::Error::FromSqlConversionFailure(0, _, _)));
    }

    #[test]
    fn test_timestamp_reads_back_equal() {
        let conn = Connection::open_in_memory().unwrap();
        let t = crate::model::now();
        let back = conn
            .query_row("SELECT ?1", [fmt_ts(&t)], |row| ts(row, 0))
            .unwrap();
        assert_eq!(back, t);
    }
}
