//! The fixed relational target schema.
//!
//! Every source collection the engine knows how to migrate has exactly one
//! [`TableDefinition`]. Mapped source fields become typed columns; everything
//! else lands in the `additional_properties` JSONB overflow column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Name of the overflow column holding unmapped source fields.
pub const ADDITIONAL_PROPERTIES: &str = "additional_properties";

/// Name of the column holding the source `_id`.
pub const ORIGINAL_ID: &str = "original_id";

/// Relational column types used by the target schema.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ColumnType {
    /// `uuid`
    Uuid,
    /// `text`
    Text,
    /// `integer`
    Integer,
    /// `bigint`
    BigInt,
    /// `double precision`
    Double,
    /// `boolean`
    Boolean,
    /// `timestamptz`
    Timestamptz,
    /// `jsonb`
    Jsonb,
}

impl ColumnType {
    /// SQL spelling of the type.
    pub fn sql(&self) -> &'static str {
        match self {
            Self::Uuid => "UUID",
            Self::Text => "TEXT",
            Self::Integer => "INTEGER",
            Self::BigInt => "BIGINT",
            Self::Double => "DOUBLE PRECISION",
            Self::Boolean => "BOOLEAN",
            Self::Timestamptz => "TIMESTAMPTZ",
            Self::Jsonb => "JSONB",
        }
    }

    /// Whether an existing column reported by `information_schema` (its
    /// `data_type`) can hold values of this type.
    pub fn accepts(&self, data_type: &str) -> bool {
        let data_type = data_type.to_ascii_lowercase();
        match self {
            Self::Uuid => data_type == "uuid",
            Self::Text => matches!(data_type.as_str(), "text" | "character varying" | "varchar"),
            Self::Integer => matches!(data_type.as_str(), "integer" | "int4" | "bigint" | "int8"),
            Self::BigInt => matches!(data_type.as_str(), "bigint" | "int8" | "numeric"),
            Self::Double => matches!(
                data_type.as_str(),
                "double precision" | "float8" | "numeric" | "real"
            ),
            Self::Boolean => matches!(data_type.as_str(), "boolean" | "bool"),
            Self::Timestamptz => matches!(
                data_type.as_str(),
                "timestamp with time zone" | "timestamptz"
            ),
            Self::Jsonb => matches!(data_type.as_str(), "jsonb" | "json"),
        }
    }
}

/// How a collection encodes its primary timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DateEncoding {
    /// Milliseconds since the Unix epoch stored as a number.
    EpochMillis,
    /// ISO-8601 string.
    IsoString,
}

/// The field used for date-range filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateField {
    /// Source field name.
    pub field: &'static str,
    /// Encoding of the field.
    pub encoding: DateEncoding,
}

/// A mapped column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ColumnDefinition {
    /// Target column name.
    pub name: &'static str,
    /// Source document field.
    pub source: &'static str,
    /// Column type.
    pub column_type: ColumnType,
}

const fn col(name: &'static str, source: &'static str, column_type: ColumnType) -> ColumnDefinition {
    ColumnDefinition {
        name,
        source,
        column_type,
    }
}

/// Definition of one target table and its source collection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableDefinition {
    /// Source collection name.
    pub collection: &'static str,
    /// Target table name.
    pub table: &'static str,
    /// Mapped columns, in insert order.
    pub columns: &'static [ColumnDefinition],
    /// Field used for date-range filtering.
    pub date_field: Option<DateField>,
    /// Source fields that together identify a logical record.
    pub natural_key: &'static [&'static str],
    /// Source fields that must be present for a record to be meaningful.
    pub required_fields: &'static [&'static str],
}

use ColumnType::*;

const ENTRIES: &[ColumnDefinition] = &[
    col("type", "type", Text),
    col("sgv", "sgv", Double),
    col("mbg", "mbg", Double),
    col("direction", "direction", Text),
    col("noise", "noise", Integer),
    col("filtered", "filtered", Double),
    col("unfiltered", "unfiltered", Double),
    col("rssi", "rssi", Integer),
    col("delta", "delta", Double),
    col("device", "device", Text),
    col("mills", "date", BigInt),
    col("timestamp", "date", Timestamptz),
    col("date_string", "dateString", Text),
    col("utc_offset", "utcOffset", Integer),
    col("sys_time", "sysTime", Text),
];

const TREATMENTS: &[ColumnDefinition] = &[
    col("event_type", "eventType", Text),
    col("created_at", "created_at", Timestamptz),
    col("glucose", "glucose", Double),
    col("glucose_type", "glucoseType", Text),
    col("carbs", "carbs", Double),
    col("protein", "protein", Double),
    col("fat", "fat", Double),
    col("insulin", "insulin", Double),
    col("duration", "duration", Double),
    col("percent", "percent", Double),
    col("absolute", "absolute", Double),
    col("rate", "rate", Double),
    col("notes", "notes", Text),
    col("entered_by", "enteredBy", Text),
    col("units", "units", Text),
    col("target_top", "targetTop", Double),
    col("target_bottom", "targetBottom", Double),
    col("profile", "profile", Text),
    col("reason", "reason", Text),
    col("utc_offset", "utcOffset", Integer),
];

const DEVICE_STATUS: &[ColumnDefinition] = &[
    col("created_at", "created_at", Timestamptz),
    col("device", "device", Text),
    col("uploader_battery", "uploaderBattery", Integer),
    col("is_charging", "isCharging", Boolean),
    col("pump", "pump", Jsonb),
    col("openaps", "openaps", Jsonb),
    col("loop", "loop", Jsonb),
    col("uploader", "uploader", Jsonb),
    col("xdripjs", "xdripjs", Jsonb),
    col("utc_offset", "utcOffset", Integer),
];

const PROFILE: &[ColumnDefinition] = &[
    col("default_profile", "defaultProfile", Text),
    col("start_date", "startDate", Timestamptz),
    col("units", "units", Text),
    col("store", "store", Jsonb),
    col("created_at", "created_at", Timestamptz),
    col("mills", "mills", BigInt),
];

const FOOD: &[ColumnDefinition] = &[
    col("type", "type", Text),
    col("category", "category", Text),
    col("subcategory", "subcategory", Text),
    col("name", "name", Text),
    col("portion", "portion", Double),
    col("unit", "unit", Text),
    col("carbs", "carbs", Double),
    col("fat", "fat", Double),
    col("protein", "protein", Double),
    col("energy", "energy", Double),
    col("gi", "gi", Double),
    col("hide_after_use", "hideafteruse", Boolean),
    col("hidden", "hidden", Boolean),
    col("position", "position", Integer),
];

const ACTIVITY: &[ColumnDefinition] = &[
    col("created_at", "created_at", Timestamptz),
    col("type", "type", Text),
    col("description", "description", Text),
    col("duration", "duration", Double),
    col("distance", "distance", Double),
    col("steps", "steps", BigInt),
    col("heart_rate", "heartRate", Integer),
    col("entered_by", "enteredBy", Text),
    col("utc_offset", "utcOffset", Integer),
];

/// All known tables, in creation order.
pub const TABLES: &[TableDefinition] = &[
    TableDefinition {
        collection: "entries",
        table: "entries",
        columns: ENTRIES,
        date_field: Some(DateField {
            field: "date",
            encoding: DateEncoding::EpochMillis,
        }),
        natural_key: &["type", "date", "device"],
        required_fields: &["date"],
    },
    TableDefinition {
        collection: "treatments",
        table: "treatments",
        columns: TREATMENTS,
        date_field: Some(DateField {
            field: "created_at",
            encoding: DateEncoding::IsoString,
        }),
        natural_key: &["eventType", "created_at", "enteredBy"],
        required_fields: &["created_at"],
    },
    TableDefinition {
        collection: "devicestatus",
        table: "device_status",
        columns: DEVICE_STATUS,
        date_field: Some(DateField {
            field: "created_at",
            encoding: DateEncoding::IsoString,
        }),
        natural_key: &["device", "created_at"],
        required_fields: &["created_at"],
    },
    TableDefinition {
        collection: "profile",
        table: "profiles",
        columns: PROFILE,
        date_field: Some(DateField {
            field: "startDate",
            encoding: DateEncoding::IsoString,
        }),
        natural_key: &["startDate", "defaultProfile"],
        required_fields: &["store"],
    },
    TableDefinition {
        collection: "food",
        table: "foods",
        columns: FOOD,
        date_field: None,
        natural_key: &["name", "category", "subcategory"],
        required_fields: &["name"],
    },
    TableDefinition {
        collection: "activity",
        table: "activities",
        columns: ACTIVITY,
        date_field: Some(DateField {
            field: "created_at",
            encoding: DateEncoding::IsoString,
        }),
        natural_key: &["created_at", "type"],
        required_fields: &["created_at"],
    },
];

/// Look up the table definition for a source collection.
pub fn table_for_collection(collection: &str) -> Option<&'static TableDefinition> {
    TABLES.iter().find(|t| t.collection == collection)
}

/// Look up a table definition by target table name.
pub fn table_by_name(table: &str) -> Option<&'static TableDefinition> {
    TABLES.iter().find(|t| t.table == table)
}

impl TableDefinition {
    /// All column names in insert order, including system columns.
    pub fn column_names(&self) -> Vec<&'static str> {
        let mut names = Vec::with_capacity(self.columns.len() + 3);
        names.push("id");
        names.push(ORIGINAL_ID);
        names.extend(self.columns.iter().map(|c| c.name));
        names.push(ADDITIONAL_PROPERTIES);
        names
    }

    /// Column mapped from the given source field, if any.
    pub fn column_for_field(&self, field: &str) -> Option<&ColumnDefinition> {
        self.columns.iter().find(|c| c.source == field)
    }

    /// Whether a source field is mapped to at least one column.
    pub fn maps_field(&self, field: &str) -> bool {
        field == "_id" || self.columns.iter().any(|c| c.source == field)
    }

    /// Expected type of a system or mapped column.
    pub fn column_type(&self, name: &str) -> Option<ColumnType> {
        match name {
            "id" => Some(ColumnType::Uuid),
            ORIGINAL_ID => Some(ColumnType::Text),
            ADDITIONAL_PROPERTIES => Some(ColumnType::Jsonb),
            other => self
                .columns
                .iter()
                .find(|c| c.name == other)
                .map(|c| c.column_type),
        }
    }

    /// `CREATE TABLE` statement for this table.
    pub fn create_table_sql(&self) -> String {
        let mut lines = vec![
            "    \"id\" UUID PRIMARY KEY".to_string(),
            format!("    \"{}\" TEXT NOT NULL UNIQUE", ORIGINAL_ID),
        ];
        for column in self.columns {
            lines.push(format!("    \"{}\" {}", column.name, column.column_type.sql()));
        }
        lines.push(format!("    \"{}\" JSONB", ADDITIONAL_PROPERTIES));
        lines.push("    \"migrated_at\" TIMESTAMPTZ NOT NULL DEFAULT NOW()".to_string());

        format!(
            "CREATE TABLE IF NOT EXISTS \"{}\" (\n{}\n);",
            self.table,
            lines.join(",\n")
        )
    }

    /// `DROP TABLE` statement for this table.
    pub fn drop_table_sql(&self) -> String {
        format!("DROP TABLE IF EXISTS \"{}\" CASCADE;", self.table)
    }
}

/// A typed relational value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Boolean.
    Bool(bool),
    /// 32-bit integer.
    Int(i32),
    /// 64-bit integer.
    BigInt(i64),
    /// Double precision float.
    Double(f64),
    /// Text.
    Text(String),
    /// Timestamp with time zone.
    Timestamp(DateTime<Utc>),
    /// JSON document.
    Json(serde_json::Value),
    /// UUID.
    Uuid(Uuid),
}

impl SqlValue {
    /// Check whether this is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Rough in-memory footprint, used by the memory budget.
    pub fn estimated_size(&self) -> usize {
        match self {
            Self::Null | Self::Bool(_) => 1,
            Self::Int(_) => 4,
            Self::BigInt(_) | Self::Double(_) | Self::Timestamp(_) => 8,
            Self::Uuid(_) => 16,
            Self::Text(s) => s.len() + 24,
            Self::Json(v) => v.to_string().len() + 24,
        }
    }
}

/// A transformed record ready for insertion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecord {
    /// Generated primary key.
    pub id: Uuid,
    /// The source `_id`, rendered as text.
    pub original_id: String,
    /// Values aligned with [`TableDefinition::columns`].
    pub values: Vec<SqlValue>,
    /// Unmapped source fields.
    pub additional_properties: Option<serde_json::Value>,
}

impl TargetRecord {
    /// All values in [`TableDefinition::column_names`] order.
    pub fn row(&self) -> Vec<SqlValue> {
        let mut row = Vec::with_capacity(self.values.len() + 3);
        row.push(SqlValue::Uuid(self.id));
        row.push(SqlValue::Text(self.original_id.clone()));
        row.extend(self.values.iter().cloned());
        row.push(
            self.additional_properties
                .clone()
                .map(SqlValue::Json)
                .unwrap_or(SqlValue::Null),
        );
        row
    }

    /// Rough in-memory footprint.
    pub fn estimated_size(&self) -> usize {
        let values: usize = self.values.iter().map(SqlValue::estimated_size).sum();
        let extra = self
            .additional_properties
            .as_ref()
            .map(|v| v.to_string().len())
            .unwrap_or(0);
        values + extra + self.original_id.len() + 40
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_collection_has_unique_table() {
        let mut tables: Vec<_> = TABLES.iter().map(|t| t.table).collect();
        tables.sort();
        tables.dedup();
        assert_eq!(tables.len(), TABLES.len());
    }

    #[test]
    fn test_lookup() {
        assert_eq!(table_for_collection("devicestatus").map(|t| t.table), Some("device_status"));
        assert_eq!(table_by_name("foods").map(|t| t.collection), Some("food"));
        assert!(table_for_collection("system.users").is_none());
    }

    #[test]
    fn test_create_table_sql() {
        let entries = table_for_collection("entries").unwrap();
        let sql = entries.create_table_sql();
        assert!(sql.contains("CREATE TABLE IF NOT EXISTS \"entries\""));
        assert!(sql.contains("\"original_id\" TEXT NOT NULL UNIQUE"));
        assert!(sql.contains("\"sgv\" DOUBLE PRECISION"));
        assert!(sql.contains("\"additional_properties\" JSONB"));
    }

    #[test]
    fn test_column_names_include_system_columns() {
        let food = table_for_collection("food").unwrap();
        let names = food.column_names();
        assert_eq!(names.first(), Some(&"id"));
        assert_eq!(names.get(1), Some(&ORIGINAL_ID));
        assert_eq!(names.last(), Some(&ADDITIONAL_PROPERTIES));
        assert_eq!(names.len(), food.columns.len() + 3);
    }

    #[test]
    fn test_column_type_accepts() {
        assert!(ColumnType::Double.accepts("double precision"));
        assert!(ColumnType::Text.accepts("character varying"));
        assert!(!ColumnType::Integer.accepts("text"));
        assert!(ColumnType::Timestamptz.accepts("timestamp with time zone"));
    }
}
