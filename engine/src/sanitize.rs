//! Row sanitizing: live row + schema -> deterministic, transport-safe map.
//!
//! Every declared attribute is carried over except the bookkeeping columns in
//! [`COLUMNS_EXCLUDED_FROM_SYNC`]. Date-like columns are normalized by their
//! declared kind. Attributes missing from the row are omitted, never turned
//! into nulls; explicit nulls stay null.

use crate::{error::Result, Error, FieldType, ModelSchema};
use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

/// Columns that only mean something to the node that wrote them.
pub const COLUMNS_EXCLUDED_FROM_SYNC: &[&str] = &[
    "created_at",
    "updated_at",
    "updated_at_sync_tick",
    "updated_at_by_field",
    "marked_for_push",
    "is_pushing",
];

const DATE_TIME_STRING_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const DATE_STRING_FORMAT: &str = "%Y-%m-%d";

/// Sanitize one live row.
pub fn sanitize(row: &Map<String, Value>, schema: &ModelSchema) -> Result<Map<String, Value>> {
    let mut out = Map::new();
    for field in &schema.attributes {
        if COLUMNS_EXCLUDED_FROM_SYNC.contains(&field.name.as_str()) {
            continue;
        }
        let Some(value) = row.get(&field.name) else {
            continue;
        };
        let value = match (field.field_type, value) {
            (_, Value::Null) => Value::Null,
            (FieldType::Timestamp, v) => Value::String(timestamp(&field.name, v)?),
            (FieldType::DateTimeString, v) => Value::String(date_time_string(&field.name, v)?),
            (FieldType::DateString, v) => Value::String(date_string(&field.name, v)?),
            (_, v) => v.clone(),
        };
        out.insert(field.name.clone(), value);
    }
    Ok(out)
}

fn invalid(field: &str, reason: impl Into<String>) -> Error {
    Error::InvalidFieldValue {
        field: field.to_string(),
        reason: reason.into(),
    }
}

/// ISO-8601 instant in UTC with millisecond precision. Accepts RFC 3339
/// strings, `YYYY-MM-DD HH:MM:SS[.fff][+zz]` strings, or epoch milliseconds.
fn timestamp(field: &str, value: &Value) -> Result<String> {
    let instant: DateTime<Utc> = match value {
        Value::Number(n) => n
            .as_i64()
            .and_then(DateTime::from_timestamp_millis)
            .ok_or_else(|| invalid(field, "timestamp out of range"))?,
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .or_else(|_| DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z"))
            .map(|dt| dt.with_timezone(&Utc))
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f").map(|n| n.and_utc()))
            .map_err(|_| invalid(field, format!("'{s}' is not a timestamp")))?,
        other => return Err(invalid(field, format!("expected timestamp, got {other}"))),
    };
    Ok(instant.to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// Canonical 19-character `YYYY-MM-DD HH:MM:SS`. Longer inputs (fractional
/// seconds, a `T` separator) are truncated to whole seconds.
fn date_time_string(field: &str, value: &Value) -> Result<String> {
    let s = value
        .as_str()
        .ok_or_else(|| invalid(field, "expected date-time string"))?;
    let normalized = s.replacen('T', " ", 1);
    let head = normalized.get(..19).unwrap_or(&normalized);
    let parsed = NaiveDateTime::parse_from_str(head, DATE_TIME_STRING_FORMAT)
        .map_err(|_| invalid(field, format!("'{s}' is not a date-time string")))?;
    Ok(parsed.format(DATE_TIME_STRING_FORMAT).to_string())
}

/// Canonical 10-character `YYYY-MM-DD`.
fn date_string(field: &str, value: &Value) -> Result<String> {
    let s = value
        .as_str()
        .ok_or_else(|| invalid(field, "expected date string"))?;
    let head = s.get(..10).unwrap_or(s);
    let parsed = NaiveDate::parse_from_str(head, DATE_STRING_FORMAT)
        .map_err(|_| invalid(field, format!("'{s}' is not a date string")))?;
    Ok(parsed.format(DATE_STRING_FORMAT).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::FieldDef;
    use serde_json::json;

    fn schema() -> ModelSchema {
        ModelSchema::new(vec![
            FieldDef::new("id", FieldType::String),
            FieldDef::new("display_id", FieldType::String),
            FieldDef::new("date_of_birth", FieldType::DateString),
            FieldDef::new("registered_at", FieldType::DateTimeString),
            FieldDef::new("verified_at", FieldType::Timestamp),
            FieldDef::new("tags", FieldType::Json),
            FieldDef::new("updated_at", FieldType::Timestamp),
            FieldDef::new("updated_at_sync_tick", FieldType::Int),
        ])
    }

    fn row() -> Map<String, Value> {
        json!({
            "id": "p1",
            "display_id": "ABC123",
            "date_of_birth": "1990-04-01",
            "registered_at": "2024-02-03 04:05:06",
            "verified_at": "2024-02-03T04:05:06.789+02:00",
            "tags": ["a", {"b": 1}],
            "updated_at": "2024-02-03T04:05:06Z",
            "updated_at_sync_tick": 42,
            "undeclared": "ignored"
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    #[test]
    fn excludes_bookkeeping_and_undeclared() {
        let out = sanitize(&row(), &schema()).unwrap();
        assert!(!out.contains_key("updated_at"));
        assert!(!out.contains_key("updated_at_sync_tick"));
        assert!(!out.contains_key("undeclared"));
        assert_eq!(out["display_id"], "ABC123");
        assert_eq!(out["tags"], json!(["a", {"b": 1}]));
    }

    #[test]
    fn dates_serialize_by_kind() {
        let out = sanitize(&row(), &schema()).unwrap();
        assert_eq!(out["date_of_birth"], "1990-04-01");
        assert_eq!(out["registered_at"], "2024-02-03 04:05:06");
        assert_eq!(out["verified_at"], "2024-02-03T02:05:06.789Z");
    }

    #[test]
    fn date_time_string_is_canonical_and_lossless() {
        let mut input = row();
        input.insert("registered_at".into(), json!("2024-02-03T04:05:06.123"));
        let out = sanitize(&input, &schema()).unwrap();
        let canonical = out["registered_at"].as_str().unwrap();
        assert_eq!(canonical.len(), 19);
        assert_eq!(canonical, "2024-02-03 04:05:06");

        // feeding the canonical form back is a fixed point
        input.insert("registered_at".into(), json!(canonical));
        let again = sanitize(&input, &schema()).unwrap();
        assert_eq!(again["registered_at"], canonical);
    }

    #[test]
    fn epoch_millis_timestamp() {
        let mut input = row();
        input.insert("verified_at".into(), json!(0));
        let out = sanitize(&input, &schema()).unwrap();
        assert_eq!(out["verified_at"], "1970-01-01T00:00:00.000Z");
    }

    #[test]
    fn absent_is_omitted_null_is_kept() {
        let mut input = row();
        input.remove("display_id");
        input.insert("date_of_birth".into(), Value::Null);
        let out = sanitize(&input, &schema()).unwrap();
        assert!(!out.contains_key("display_id"));
        assert_eq!(out["date_of_birth"], Value::Null);
    }

    #[test]
    fn deterministic() {
        let first = sanitize(&row(), &schema()).unwrap();
        let second = sanitize(&row(), &schema()).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn rejects_garbage_dates() {
        let mut input = row();
        input.insert("date_of_birth".into(), json!("yesterday"));
        let err = sanitize(&input, &schema()).unwrap_err();
        assert!(matches!(err, Error::InvalidFieldValue { field, .. } if field == "date_of_birth"));
    }
}
