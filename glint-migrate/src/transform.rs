//! Document to relational record mapping.

use bson::{Bson, Document};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{MigrateResult, MigrationError};
use crate::schema::{ColumnType, SqlValue, TableDefinition, TargetRecord, table_for_collection};

/// Options controlling how documents are mapped.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformOptions {
    /// Keep null-valued unmapped fields in `additional_properties`.
    pub preserve_null_properties: bool,
}

impl TransformOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep null-valued unmapped fields.
    pub fn preserve_null_properties(mut self, preserve: bool) -> Self {
        self.preserve_null_properties = preserve;
        self
    }
}

/// A document that could not be transformed.
#[derive(Debug)]
pub struct TransformFailure {
    /// Source `_id`, rendered as text.
    pub id: String,
    /// Why it failed.
    pub error: MigrationError,
}

/// Maps source documents onto the fixed target schema.
#[derive(Debug, Clone, Copy, Default)]
pub struct DataTransformationService;

impl DataTransformationService {
    /// Create the service.
    pub fn new() -> Self {
        Self
    }

    /// Transform one document of `collection`.
    pub fn transform(
        &self,
        collection: &str,
        document: &Document,
        options: &TransformOptions,
    ) -> MigrateResult<TargetRecord> {
        let table = table_for_collection(collection).ok_or_else(|| {
            MigrationError::validation(format!("no target mapping for collection '{collection}'"))
        })?;
        transform_with(table, document, options)
    }

    /// Transform a batch, separating records from failures. Order is kept.
    pub fn transform_batch(
        &self,
        table: &TableDefinition,
        documents: &[Document],
        options: &TransformOptions,
    ) -> (Vec<TargetRecord>, Vec<TransformFailure>) {
        let mut records = Vec::with_capacity(documents.len());
        let mut failures = Vec::new();
        for document in documents {
            match transform_with(table, document, options) {
                Ok(record) => records.push(record),
                Err(error) => failures.push(TransformFailure {
                    id: document.get("_id").map(id_string).unwrap_or_default(),
                    error,
                }),
            }
        }
        (records, failures)
    }
}

fn transform_with(
    table: &TableDefinition,
    document: &Document,
    options: &TransformOptions,
) -> MigrateResult<TargetRecord> {
    let original_id = match document.get("_id") {
        Some(Bson::Null) | None => {
            return Err(MigrationError::transformation("<missing>", "document has no _id"));
        }
        Some(id) => id_string(id),
    };

    let mut values = Vec::with_capacity(table.columns.len());
    for column in table.columns {
        let value = match document.get(column.source) {
            None => SqlValue::Null,
            Some(raw) => coerce(raw, column.column_type).map_err(|message| {
                MigrationError::transformation(
                    &original_id,
                    format!("field '{}': {message}", column.source),
                )
            })?,
        };
        values.push(value);
    }

    let mut extra = Map::new();
    for (key, value) in document {
        if table.maps_field(key) {
            continue;
        }
        if matches!(value, Bson::Null) && !options.preserve_null_properties {
            continue;
        }
        extra.insert(key.clone(), bson_to_json(value));
    }

    Ok(TargetRecord {
        id: Uuid::new_v4(),
        original_id,
        values,
        additional_properties: (!extra.is_empty()).then_some(Value::Object(extra)),
    })
}

/// Text form of an `_id`.
pub fn id_string(id: &Bson) -> String {
    match id {
        Bson::ObjectId(oid) => oid.to_hex(),
        Bson::String(s) => s.clone(),
        Bson::Int32(i) => i.to_string(),
        Bson::Int64(i) => i.to_string(),
        other => bson_to_json(other).to_string(),
    }
}

/// Plain JSON rendering of a BSON value. ObjectIds become hex strings and
/// dates become RFC 3339 strings.
pub fn bson_to_json(value: &Bson) -> Value {
    match value {
        Bson::Null | Bson::Undefined => Value::Null,
        Bson::Boolean(b) => Value::Bool(*b),
        Bson::Int32(i) => Value::from(*i),
        Bson::Int64(i) => Value::from(*i),
        Bson::Double(f) => serde_json::Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Bson::String(s) => Value::String(s.clone()),
        Bson::ObjectId(oid) => Value::String(oid.to_hex()),
        Bson::DateTime(dt) => Value::String(dt.to_chrono().to_rfc3339()),
        Bson::Decimal128(_) => decimal_string(value)
            .map(Value::String)
            .unwrap_or(Value::Null),
        Bson::Array(items) => Value::Array(items.iter().map(bson_to_json).collect()),
        Bson::Document(doc) => Value::Object(
            doc.iter()
                .map(|(k, v)| (k.clone(), bson_to_json(v)))
                .collect(),
        ),
        Bson::Timestamp(ts) => Value::from(ts.time),
        Bson::Binary(bin) => Value::String(hex::encode(&bin.bytes)),
        Bson::RegularExpression(re) => Value::String(format!("/{}/{}", re.pattern, re.options)),
        Bson::Symbol(s) | Bson::JavaScriptCode(s) => Value::String(s.clone()),
        other => Value::String(other.to_string()),
    }
}

pub(crate) fn decimal_string(value: &Bson) -> Option<String> {
    match value.clone().into_relaxed_extjson() {
        Value::Object(map) => map.get("$numberDecimal")?.as_str().map(str::to_string),
        _ => None,
    }
}

pub(crate) fn coerce(value: &Bson, column_type: ColumnType) -> Result<SqlValue, String> {
    if matches!(value, Bson::Null | Bson::Undefined) {
        return Ok(SqlValue::Null);
    }
    match column_type {
        ColumnType::Text => Ok(SqlValue::Text(match value {
            Bson::String(s) => s.clone(),
            Bson::ObjectId(oid) => oid.to_hex(),
            Bson::DateTime(dt) => dt.to_chrono().to_rfc3339(),
            Bson::Document(_) | Bson::Array(_) => bson_to_json(value).to_string(),
            other => match bson_to_json(other) {
                Value::String(s) => s,
                v => v.to_string(),
            },
        })),
        ColumnType::Integer => {
            let n = as_i64(value)?;
            i32::try_from(n)
                .map(SqlValue::Int)
                .map_err(|_| format!("{n} does not fit in an integer column"))
        }
        ColumnType::BigInt => as_i64(value).map(SqlValue::BigInt),
        ColumnType::Double => as_f64(value).map(SqlValue::Double),
        ColumnType::Boolean => as_bool(value).map(SqlValue::Bool),
        ColumnType::Timestamptz => as_timestamp(value).map(SqlValue::Timestamp),
        ColumnType::Jsonb => Ok(SqlValue::Json(bson_to_json(value))),
        ColumnType::Uuid => match value {
            Bson::String(s) => Uuid::parse_str(s)
                .map(SqlValue::Uuid)
                .map_err(|e| e.to_string()),
            other => Err(format!("cannot store {:?} as uuid", other.element_type())),
        },
    }
}

fn as_f64(value: &Bson) -> Result<f64, String> {
    let n = match value {
        Bson::Double(f) => *f,
        Bson::Int32(i) => f64::from(*i),
        Bson::Int64(i) => *i as f64,
        Bson::Decimal128(_) => decimal_string(value)
            .and_then(|d| d.parse().ok())
            .ok_or_else(|| "unsupported decimal".to_string())?,
        Bson::String(s) => s
            .trim()
            .parse()
            .map_err(|_| format!("'{s}' is not a number"))?,
        Bson::Boolean(b) => f64::from(u8::from(*b)),
        other => return Err(format!("cannot store {:?} as a number", other.element_type())),
    };
    if n.is_finite() {
        Ok(n)
    } else {
        Err("non-finite number".to_string())
    }
}

fn as_i64(value: &Bson) -> Result<i64, String> {
    match value {
        Bson::Int32(i) => Ok(i64::from(*i)),
        Bson::Int64(i) => Ok(*i),
        Bson::String(s) if s.trim().parse::<i64>().is_ok() => {
            s.trim().parse().map_err(|_| format!("'{s}' is not an integer"))
        }
        other => {
            let f = as_f64(other)?;
            if f.abs() > 9.0e18 {
                return Err(format!("{f} is out of range"));
            }
            Ok(f.round() as i64)
        }
    }
}

fn as_bool(value: &Bson) -> Result<bool, String> {
    match value {
        Bson::Boolean(b) => Ok(*b),
        Bson::Int32(i) => Ok(*i != 0),
        Bson::Int64(i) => Ok(*i != 0),
        Bson::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            _ => Err(format!("'{s}' is not a boolean")),
        },
        other => Err(format!("cannot store {:?} as boolean", other.element_type())),
    }
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>, String> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| format!("{ms} is not a valid epoch timestamp"))
}

fn as_timestamp(value: &Bson) -> Result<DateTime<Utc>, String> {
    match value {
        Bson::DateTime(dt) => Ok(dt.to_chrono()),
        Bson::Timestamp(ts) => Utc
            .timestamp_opt(i64::from(ts.time), 0)
            .single()
            .ok_or_else(|| "invalid timestamp".to_string()),
        Bson::Int32(_) | Bson::Int64(_) | Bson::Double(_) => from_millis(as_i64(value)?),
        Bson::String(s) => parse_date_string(s.trim()),
        other => Err(format!("cannot store {:?} as timestamp", other.element_type())),
    }
}

/// Parse the date strings seen in the wild: RFC 3339, naive ISO-8601
/// (taken as UTC) and numeric epoch milliseconds.
pub fn parse_date_string(s: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f%z", "%Y-%m-%dT%H:%M:%S%z"] {
        if let Ok(dt) = DateTime::parse_from_str(s, format) {
            return Ok(dt.with_timezone(&Utc));
        }
    }
    for format in ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S", "%Y-%m-%d %H:%M:%S"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(s, format) {
            return Ok(naive.and_utc());
        }
    }
    if let Ok(ms) = s.parse::<i64>() {
        return from_millis(ms);
    }
    Err(format!("'{s}' is not a recognised date"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::{doc, oid::ObjectId};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn column<'a>(table: &TableDefinition, record: &'a TargetRecord, name: &str) -> &'a SqlValue {
        let idx = table.columns.iter().position(|c| c.name == name).unwrap();
        &record.values[idx]
    }

    #[test]
    fn test_entry_mapping() {
        let oid = ObjectId::new();
        let doc = doc! {
            "_id": oid,
            "type": "sgv",
            "sgv": 120,
            "direction": "Flat",
            "date": 1_700_000_000_000_i64,
            "dateString": "2023-11-14T22:13:20.000Z",
            "custom": "kept",
        };
        let service = DataTransformationService::new();
        let record = service
            .transform("entries", &doc, &TransformOptions::default())
            .unwrap();
        let table = table_for_collection("entries").unwrap();

        assert_eq!(record.original_id, oid.to_hex());
        assert_eq!(column(table, &record, "sgv"), &SqlValue::Double(120.0));
        assert_eq!(column(table, &record, "mills"), &SqlValue::BigInt(1_700_000_000_000));
        assert_eq!(
            column(table, &record, "timestamp"),
            &SqlValue::Timestamp("2023-11-14T22:13:20Z".parse().unwrap())
        );
        assert_eq!(column(table, &record, "noise"), &SqlValue::Null);
        assert_eq!(record.additional_properties, Some(json!({ "custom": "kept" })));
    }

    #[test]
    fn test_lenient_coercions() {
        let doc = doc! {
            "_id": "t1",
            "eventType": "Meal Bolus",
            "created_at": "2024-01-02T03:04:05",
            "carbs": "45",
            "insulin": "3.5",
            "utcOffset": 60.0,
        };
        let table = table_for_collection("treatments").unwrap();
        let record = DataTransformationService::new()
            .transform("treatments", &doc, &TransformOptions::default())
            .unwrap();

        assert_eq!(column(table, &record, "carbs"), &SqlValue::Double(45.0));
        assert_eq!(column(table, &record, "insulin"), &SqlValue::Double(3.5));
        assert_eq!(column(table, &record, "utc_offset"), &SqlValue::Int(60));
        assert_eq!(
            column(table, &record, "created_at"),
            &SqlValue::Timestamp("2024-01-02T03:04:05Z".parse().unwrap())
        );
        assert_eq!(record.additional_properties, None);
    }

    #[test]
    fn test_preserve_null_properties() {
        let doc = doc! { "_id": 1, "name": "Apple", "barcode": Bson::Null };
        let service = DataTransformationService::new();

        let dropped = service
            .transform("food", &doc, &TransformOptions::default())
            .unwrap();
        assert_eq!(dropped.additional_properties, None);

        let kept = service
            .transform("food", &doc, &TransformOptions::new().preserve_null_properties(true))
            .unwrap();
        assert_eq!(kept.additional_properties, Some(json!({ "barcode": null })));
    }

    #[test]
    fn test_nested_documents_become_json() {
        let doc = doc! {
            "_id": "d1",
            "created_at": "2024-01-01T00:00:00Z",
            "pump": { "battery": { "percent": 80 }, "reservoir": 120.5 },
        };
        let table = table_for_collection("devicestatus").unwrap();
        let record = DataTransformationService::new()
            .transform("devicestatus", &doc, &TransformOptions::default())
            .unwrap();
        assert_eq!(
            column(table, &record, "pump"),
            &SqlValue::Json(json!({ "battery": { "percent": 80 }, "reservoir": 120.5 }))
        );
    }

    #[test]
    fn test_uncoercible_value_fails() {
        let doc = doc! { "_id": "e1", "sgv": "high", "date": 1 };
        let err = DataTransformationService::new()
            .transform("entries", &doc, &TransformOptions::default())
            .unwrap_err();
        assert!(matches!(err, MigrationError::Transformation { ref id, .. } if id == "e1"));
        assert!(err.to_string().contains("sgv"));
    }

    #[test]
    fn test_missing_id_fails() {
        let doc = doc! { "sgv": 100 };
        let err = DataTransformationService::new()
            .transform("entries", &doc, &TransformOptions::default())
            .unwrap_err();
        assert!(matches!(err, MigrationError::Transformation { .. }));
    }

    #[test]
    fn test_unknown_collection() {
        let err = DataTransformationService::new()
            .transform("settings", &doc! { "_id": 1 }, &TransformOptions::default())
            .unwrap_err();
        assert!(matches!(err, MigrationError::Validation(_)));
    }

    #[test]
    fn test_transform_batch_separates_failures() {
        let table = table_for_collection("entries").unwrap();
        let docs = vec![
            doc! { "_id": 1, "sgv": 100 },
            doc! { "_id": 2, "sgv": "bad" },
            doc! { "_id": 3, "sgv": 110 },
        ];
        let (records, failures) = DataTransformationService::new().transform_batch(
            table,
            &docs,
            &TransformOptions::default(),
        );
        assert_eq!(records.len(), 2);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].id, "2");
    }

    #[test]
    fn test_parse_date_string_variants() {
        let expected: DateTime<Utc> = "2024-01-02T03:04:05Z".parse().unwrap();
        assert_eq!(parse_date_string("2024-01-02T03:04:05Z").unwrap(), expected);
        assert_eq!(parse_date_string("2024-01-02T04:04:05+0100").unwrap(), expected);
        assert_eq!(parse_date_string("2024-01-02 03:04:05").unwrap(), expected);
        assert_eq!(
            parse_date_string(&expected.timestamp_millis().to_string()).unwrap(),
            expected
        );
        assert!(parse_date_string("yesterday").is_err());
    }
}
