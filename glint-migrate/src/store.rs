//! Store interfaces consumed by the engine.
//!
//! The engine never talks to a driver directly. The document store is read
//! through [`DocumentSource`] and the relational store is written through
//! [`RelationalTarget`]; `glint-mongodb` and `glint-postgres` provide the
//! production implementations, [`crate::memory`] provides in-process ones.

use std::cmp::Ordering;

use bson::spec::BinarySubtype;
use bson::{Binary, Bson, Decimal128, Document, oid::ObjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::MigrateResult;
use crate::index::IndexStrategy;
use crate::schema::{DateField, TableDefinition, TargetRecord};
use crate::transform::decimal_string;

/// Version information reported by a store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerInfo {
    /// Product name, e.g. `MongoDB` or `PostgreSQL`.
    pub product: String,
    /// Server version string.
    pub version: String,
}

/// Inclusive date range filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DateRange {
    /// Lower bound (inclusive).
    pub start: Option<DateTime<Utc>>,
    /// Upper bound (inclusive).
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    /// Whether either bound is set.
    pub fn is_bounded(&self) -> bool {
        self.start.is_some() || self.end.is_some()
    }

    /// Check whether a timestamp falls inside the range.
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.start.is_none_or(|s| at >= s) && self.end.is_none_or(|e| at <= e)
    }
}

/// Filter applied when reading a collection.
#[derive(Debug, Clone, Copy, Default)]
pub struct SourceFilter {
    /// Date range, applied to `date_field`.
    pub date_range: DateRange,
    /// Field and encoding to filter on.
    pub date_field: Option<DateField>,
}

impl SourceFilter {
    /// Filter for a collection with an optional date range.
    pub fn new(date_range: DateRange, date_field: Option<DateField>) -> Self {
        Self {
            date_range,
            date_field,
        }
    }
}

/// BSON type bracket of an `_id`, in the document store's sort order.
///
/// Range operators such as `$gt` only match values of the same bracket, so a
/// cursor query has to name every later bracket explicitly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IdBracket {
    /// Int32, Int64, Double and Decimal128.
    Number,
    /// String.
    String,
    /// Binary data, including UUIDs.
    Binary,
    /// ObjectId.
    ObjectId,
    /// Boolean.
    Boolean,
    /// UTC datetime.
    Date,
}

impl IdBracket {
    /// Every bracket, lowest first.
    pub const ALL: [Self; 6] = [
        Self::Number,
        Self::String,
        Self::Binary,
        Self::ObjectId,
        Self::Boolean,
        Self::Date,
    ];

    /// `$type` alias matching the bracket.
    pub fn type_alias(self) -> &'static str {
        match self {
            Self::Number => "number",
            Self::String => "string",
            Self::Binary => "binData",
            Self::ObjectId => "objectId",
            Self::Boolean => "bool",
            Self::Date => "date",
        }
    }

    /// Brackets that sort after this one.
    pub fn following(self) -> impl Iterator<Item = Self> {
        Self::ALL.into_iter().filter(move |b| *b > self)
    }
}

/// Position of a document in `_id` order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum SourcePosition {
    /// Int32 or Int64 `_id`.
    Int(i64),
    /// Double `_id`.
    Double(f64),
    /// Decimal128 `_id`, stored as the hex of its 16 bytes.
    Decimal(String),
    /// String `_id`.
    String(String),
    /// Binary `_id`.
    Binary {
        /// Binary subtype byte.
        subtype: u8,
        /// Payload as hex.
        bytes: String,
    },
    /// ObjectId `_id`, stored as hex.
    ObjectId(String),
    /// Boolean `_id`.
    Bool(bool),
    /// Datetime `_id`, milliseconds since the epoch.
    DateTime(i64),
}

impl SourcePosition {
    /// Position of a document, derived from its `_id`.
    pub fn of(document: &Document) -> Option<Self> {
        document.get("_id").and_then(Self::from_bson)
    }

    /// Convert an `_id` value into a position. Types the cursor cannot page
    /// over (null, embedded documents, regexes, timestamps) yield `None`.
    pub fn from_bson(id: &Bson) -> Option<Self> {
        match id {
            Bson::ObjectId(oid) => Some(Self::ObjectId(oid.to_hex())),
            Bson::String(s) => Some(Self::String(s.clone())),
            Bson::Int32(i) => Some(Self::Int(i64::from(*i))),
            Bson::Int64(i) => Some(Self::Int(*i)),
            Bson::Double(f) => Some(Self::Double(*f)),
            Bson::Decimal128(d) => Some(Self::Decimal(hex::encode(d.bytes()))),
            Bson::Binary(bin) => Some(Self::Binary {
                subtype: u8::from(bin.subtype),
                bytes: hex::encode(&bin.bytes),
            }),
            Bson::Boolean(b) => Some(Self::Bool(*b)),
            Bson::DateTime(dt) => Some(Self::DateTime(dt.timestamp_millis())),
            _ => None,
        }
    }

    /// Convert back into the `_id` value used for range queries.
    pub fn to_bson(&self) -> Bson {
        match self {
            Self::Int(i) => Bson::Int64(*i),
            Self::Double(f) => Bson::Double(*f),
            Self::Decimal(hex) => decimal_bytes(hex)
                .map(|bytes| Bson::Decimal128(Decimal128::from_bytes(bytes)))
                .unwrap_or_else(|| Bson::String(hex.clone())),
            Self::String(s) => Bson::String(s.clone()),
            Self::Binary { subtype, bytes } => Bson::Binary(Binary {
                subtype: BinarySubtype::from(*subtype),
                bytes: hex::decode(bytes).unwrap_or_default(),
            }),
            Self::ObjectId(hex) => ObjectId::parse_str(hex)
                .map(Bson::ObjectId)
                .unwrap_or_else(|_| Bson::String(hex.clone())),
            Self::Bool(b) => Bson::Boolean(*b),
            Self::DateTime(ms) => Bson::DateTime(bson::DateTime::from_millis(*ms)),
        }
    }

    /// Display form, stored as `last_processed_id`.
    pub fn as_string(&self) -> String {
        match self {
            Self::Int(i) => i.to_string(),
            Self::Double(f) => f.to_string(),
            Self::Decimal(hex) => decimal_string(&self.to_bson()).unwrap_or_else(|| hex.clone()),
            Self::String(s) | Self::ObjectId(s) => s.clone(),
            Self::Binary { bytes, .. } => bytes.clone(),
            Self::Bool(b) => b.to_string(),
            Self::DateTime(ms) => ms.to_string(),
        }
    }

    /// Type bracket of the position.
    pub fn bracket(&self) -> IdBracket {
        match self {
            Self::Int(_) | Self::Double(_) | Self::Decimal(_) => IdBracket::Number,
            Self::String(_) => IdBracket::String,
            Self::Binary { .. } => IdBracket::Binary,
            Self::ObjectId(_) => IdBracket::ObjectId,
            Self::Bool(_) => IdBracket::Boolean,
            Self::DateTime(_) => IdBracket::Date,
        }
    }

    /// Whether a document at this position is returned by a cursor query
    /// after `after`: greater within the same bracket, or in a later one.
    pub fn follows(&self, after: &SourcePosition) -> bool {
        let (mine, theirs) = (self.bracket(), after.bracket());
        if mine == theirs {
            self > after
        } else {
            theirs.following().any(|b| b == mine)
        }
    }

    fn numeric(&self) -> f64 {
        match self {
            Self::Int(i) => *i as f64,
            Self::Double(f) => *f,
            Self::Decimal(_) => decimal_string(&self.to_bson())
                .and_then(|s| s.parse().ok())
                .unwrap_or(f64::NAN),
            _ => f64::NAN,
        }
    }
}

fn decimal_bytes(hex: &str) -> Option<[u8; 16]> {
    hex::decode(hex).ok()?.try_into().ok()
}

// NaN sorts below every other number.
fn compare_numbers(a: f64, b: f64) -> Ordering {
    match (a.is_nan(), b.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
    }
}

impl PartialEq for SourcePosition {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for SourcePosition {}

impl PartialOrd for SourcePosition {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Matches the document store's sort order for mixed `_id` types: brackets
/// in [`IdBracket`] order, numbers by value across their encodings, binary
/// by length then subtype then bytes.
impl Ord for SourcePosition {
    fn cmp(&self, other: &Self) -> Ordering {
        let bracket = self.bracket().cmp(&other.bracket());
        if bracket != Ordering::Equal {
            return bracket;
        }
        match (self, other) {
            (Self::Int(a), Self::Int(b)) => a.cmp(b),
            (Self::String(a), Self::String(b)) | (Self::ObjectId(a), Self::ObjectId(b)) => a.cmp(b),
            (
                Self::Binary {
                    subtype: sa,
                    bytes: ba,
                },
                Self::Binary {
                    subtype: sb,
                    bytes: bb,
                },
            ) => ba.len().cmp(&bb.len()).then(sa.cmp(sb)).then_with(|| ba.cmp(bb)),
            (Self::Bool(a), Self::Bool(b)) => a.cmp(b),
            (Self::DateTime(a), Self::DateTime(b)) => a.cmp(b),
            _ => compare_numbers(self.numeric(), other.numeric()),
        }
    }
}

/// One page request against a collection.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    /// Return documents strictly after this position.
    pub after: Option<SourcePosition>,
    /// Maximum number of documents.
    pub limit: usize,
    /// Filter.
    pub filter: SourceFilter,
}

/// Key kind of a document-store index field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexKeyKind {
    /// `1`
    Ascending,
    /// `-1`
    Descending,
    /// `"text"`
    Text,
    /// `"hashed"`
    Hashed,
    /// `"2dsphere"` / `"2d"`
    Geo,
    /// `"$**"` wildcard.
    Wildcard,
}

impl IndexKeyKind {
    /// Parse the value side of an index key document.
    pub fn from_bson(value: &Bson) -> Self {
        match value {
            Bson::String(s) => match s.as_str() {
                "text" => Self::Text,
                "hashed" => Self::Hashed,
                "2dsphere" | "2d" | "geoHaystack" => Self::Geo,
                _ => Self::Ascending,
            },
            Bson::Int32(v) if *v < 0 => Self::Descending,
            Bson::Int64(v) if *v < 0 => Self::Descending,
            Bson::Double(v) if *v < 0.0 => Self::Descending,
            _ => Self::Ascending,
        }
    }
}

/// An index that exists on a source collection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceIndex {
    /// Index name.
    pub name: String,
    /// Indexed fields in key order.
    pub keys: Vec<(String, IndexKeyKind)>,
    /// Whether the index is unique.
    pub unique: bool,
    /// Whether the index is sparse.
    pub sparse: bool,
    /// Partial filter expression, rendered as JSON.
    pub partial_filter: Option<serde_json::Value>,
    /// Number of operations that used this index, if the server reports it.
    pub usage_ops: Option<u64>,
}

impl SourceIndex {
    /// Whether this is the implicit `_id` index.
    pub fn is_id_index(&self) -> bool {
        self.name == "_id_" || (self.keys.len() == 1 && self.keys[0].0 == "_id")
    }
}

/// Read interface over the document store.
#[async_trait::async_trait]
pub trait DocumentSource: Send + Sync {
    /// Round-trip to the server.
    async fn ping(&self) -> MigrateResult<()>;

    /// Server product and version.
    async fn server_info(&self) -> MigrateResult<ServerInfo>;

    /// Database name being read.
    fn database_name(&self) -> &str;

    /// All user collections.
    async fn list_collections(&self) -> MigrateResult<Vec<String>>;

    /// Number of documents matching a filter.
    async fn count_documents(&self, collection: &str, filter: &SourceFilter) -> MigrateResult<u64>;

    /// Fetch the next page in ascending `_id` order.
    async fn fetch_batch(&self, collection: &str, request: &BatchRequest)
    -> MigrateResult<Vec<Document>>;

    /// A sample of documents used for shape inference.
    async fn sample_documents(&self, collection: &str, size: usize) -> MigrateResult<Vec<Document>>;

    /// Indexes defined on a collection.
    async fn list_indexes(&self, collection: &str) -> MigrateResult<Vec<SourceIndex>>;
}

/// What to do when an insert violates a unique constraint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConflictPolicy {
    /// Skip the conflicting rows and count them.
    SkipDuplicates,
    /// Fail the whole batch.
    Fail,
}

/// Outcome of a batch insert.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchWriteOutcome {
    /// Rows inserted.
    pub inserted: u64,
    /// Rows skipped because they already existed.
    pub skipped_duplicates: u64,
}

/// A column as it exists in the target database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExistingColumn {
    /// Column name.
    pub name: String,
    /// `information_schema.columns.data_type`.
    pub data_type: String,
    /// Whether the column is nullable.
    pub nullable: bool,
}

/// An index as it exists in the target database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetIndex {
    /// Index name.
    pub name: String,
    /// Table name.
    pub table: String,
    /// `pg_indexes.indexdef`.
    pub definition: String,
    /// Whether this index backs the primary key.
    pub is_primary: bool,
    /// Whether this index backs a unique constraint.
    pub is_constraint: bool,
}

/// DDL/DML interface over the relational store.
#[async_trait::async_trait]
pub trait RelationalTarget: Send + Sync {
    /// Round-trip to the server.
    async fn ping(&self) -> MigrateResult<()>;

    /// Server product and version.
    async fn server_info(&self) -> MigrateResult<ServerInfo>;

    /// Check whether a table exists.
    async fn table_exists(&self, table: &str) -> MigrateResult<bool>;

    /// Columns of an existing table (empty when the table is missing).
    async fn describe_table(&self, table: &str) -> MigrateResult<Vec<ExistingColumn>>;

    /// Create a table if it does not exist.
    async fn create_table(&self, definition: &TableDefinition) -> MigrateResult<()>;

    /// Drop a table if it exists.
    async fn drop_table(&self, table: &str) -> MigrateResult<()>;

    /// Indexes defined on a table.
    async fn list_indexes(&self, table: &str) -> MigrateResult<Vec<TargetIndex>>;

    /// Create an index.
    async fn create_index(&self, strategy: &IndexStrategy) -> MigrateResult<()>;

    /// Drop an index by name.
    async fn drop_index(&self, name: &str, concurrently: bool) -> MigrateResult<()>;

    /// Insert a batch atomically.
    async fn insert_batch(
        &self,
        definition: &TableDefinition,
        records: &[TargetRecord],
        policy: ConflictPolicy,
    ) -> MigrateResult<BatchWriteOutcome>;

    /// Number of rows in a table.
    async fn count_rows(&self, table: &str) -> MigrateResult<u64>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_position_round_trip_object_id() {
        let oid = ObjectId::new();
        let doc = doc! { "_id": oid };
        let pos = SourcePosition::of(&doc).unwrap();
        assert_eq!(pos.as_string(), oid.to_hex());
        assert_eq!(pos.to_bson(), Bson::ObjectId(oid));
    }

    #[test]
    fn test_position_ordering_matches_store() {
        let mut positions = vec![
            SourcePosition::ObjectId("650000000000000000000001".into()),
            SourcePosition::String("b".into()),
            SourcePosition::Int(10),
            SourcePosition::Int(2),
            SourcePosition::String("a".into()),
        ];
        positions.sort();
        assert_eq!(
            positions,
            vec![
                SourcePosition::Int(2),
                SourcePosition::Int(10),
                SourcePosition::String("a".into()),
                SourcePosition::String("b".into()),
                SourcePosition::ObjectId("650000000000000000000001".into()),
            ]
        );
    }

    #[test]
    fn test_numbers_compare_across_encodings() {
        let decimal = SourcePosition::from_bson(&Bson::Decimal128(Decimal128::from_bytes(
            // 25E-1
            [0x19, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x3e, 0x30],
        )))
        .unwrap();
        assert_eq!(decimal.bracket(), IdBracket::Number);
        assert!(SourcePosition::Int(2) < decimal);
        assert!(decimal < SourcePosition::Double(2.75));
        assert_eq!(SourcePosition::Int(3), SourcePosition::Double(3.0));
        assert!(SourcePosition::Double(f64::NAN) < SourcePosition::Int(i64::MIN));
        assert_eq!(decimal.to_bson(), Bson::Decimal128(Decimal128::from_bytes(
            [0x19, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0x3e, 0x30],
        )));
    }

    #[test]
    fn test_every_bracket_round_trips() {
        let ids = vec![
            Bson::Double(1.5),
            Bson::Binary(Binary {
                subtype: BinarySubtype::Uuid,
                bytes: vec![7; 16],
            }),
            Bson::Boolean(true),
            Bson::DateTime(bson::DateTime::from_millis(1_700_000_000_000)),
        ];
        for id in ids {
            let position = SourcePosition::from_bson(&id).unwrap();
            assert_eq!(position.to_bson(), id);
        }
        assert!(SourcePosition::from_bson(&Bson::Null).is_none());
        assert!(SourcePosition::from_bson(&Bson::Document(doc! { "a": 1 })).is_none());
    }

    #[test]
    fn test_follows_crosses_brackets() {
        let after = SourcePosition::Int(2);
        assert!(!SourcePosition::Int(1).follows(&after));
        assert!(!SourcePosition::Double(2.0).follows(&after));
        assert!(SourcePosition::Double(2.5).follows(&after));
        assert!(SourcePosition::String("a".into()).follows(&after));
        assert!(SourcePosition::ObjectId("650000000000000000000001".into()).follows(&after));
        assert!(SourcePosition::DateTime(0).follows(&after));

        let after = SourcePosition::String("m".into());
        assert!(!SourcePosition::Int(100).follows(&after));
        assert!(!SourcePosition::String("a".into()).follows(&after));
        assert!(SourcePosition::String("z".into()).follows(&after));
        assert!(SourcePosition::Bool(false).follows(&after));
    }

    #[test]
    fn test_bracket_following() {
        assert_eq!(
            IdBracket::String.following().map(IdBracket::type_alias).collect::<Vec<_>>(),
            vec!["binData", "objectId", "bool", "date"]
        );
        assert_eq!(IdBracket::Date.following().count(), 0);
    }

    #[test]
    fn test_binary_orders_by_length_first() {
        let short = SourcePosition::Binary {
            subtype: 0,
            bytes: "ff".into(),
        };
        let long = SourcePosition::Binary {
            subtype: 0,
            bytes: "0000".into(),
        };
        assert!(short < long);
    }

    #[test]
    fn test_date_range_contains() {
        let start = "2024-01-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let end = "2024-02-01T00:00:00Z".parse::<DateTime<Utc>>().unwrap();
        let range = DateRange {
            start: Some(start),
            end: Some(end),
        };
        assert!(range.contains(start));
        assert!(range.contains(end));
        assert!(!range.contains(end + chrono::Duration::seconds(1)));
        assert!(DateRange::default().contains(start));
    }

    #[test]
    fn test_index_key_kind() {
        assert_eq!(IndexKeyKind::from_bson(&Bson::Int32(-1)), IndexKeyKind::Descending);
        assert_eq!(IndexKeyKind::from_bson(&Bson::String("text".into())), IndexKeyKind::Text);
        assert_eq!(IndexKeyKind::from_bson(&Bson::String("2dsphere".into())), IndexKeyKind::Geo);
        assert_eq!(IndexKeyKind::from_bson(&Bson::Int32(1)), IndexKeyKind::Ascending);
    }
}
