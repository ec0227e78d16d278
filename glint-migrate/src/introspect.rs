//! Source schema discovery: collections, sampled shapes and index usage.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::MigrateResult;
use crate::index::{IndexStrategy, OperationType, partial_filter_to_sql};
use crate::schema::{TableDefinition, table_for_collection};
use crate::store::{DocumentSource, IndexKeyKind, SourceIndex};

/// Coarse BSON type observed for a field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FieldKind {
    /// null
    Null,
    /// boolean
    Boolean,
    /// int32 / int64
    Integer,
    /// double / decimal
    Double,
    /// string
    String,
    /// date / timestamp
    Date,
    /// ObjectId
    ObjectId,
    /// embedded document
    Document,
    /// array
    Array,
    /// anything else
    Other,
}

impl FieldKind {
    /// Classify a BSON value.
    pub fn of(value: &Bson) -> Self {
        match value {
            Bson::Null | Bson::Undefined => Self::Null,
            Bson::Boolean(_) => Self::Boolean,
            Bson::Int32(_) | Bson::Int64(_) => Self::Integer,
            Bson::Double(_) | Bson::Decimal128(_) => Self::Double,
            Bson::String(_) => Self::String,
            Bson::DateTime(_) | Bson::Timestamp(_) => Self::Date,
            Bson::ObjectId(_) => Self::ObjectId,
            Bson::Document(_) => Self::Document,
            Bson::Array(_) => Self::Array,
            _ => Self::Other,
        }
    }
}

/// Observed shape of one field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldShape {
    /// Types seen.
    pub kinds: BTreeSet<FieldKind>,
    /// Documents in which the field was present.
    pub present: usize,
}

/// Shape of a collection inferred from a sample.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CollectionShape {
    /// Collection name.
    pub collection: String,
    /// Documents sampled.
    pub sampled: usize,
    /// Top-level fields.
    pub fields: BTreeMap<String, FieldShape>,
}

impl CollectionShape {
    /// Infer a shape from sample documents.
    pub fn infer(collection: &str, documents: &[Document]) -> Self {
        let mut shape = Self {
            collection: collection.to_string(),
            sampled: documents.len(),
            fields: BTreeMap::new(),
        };
        for document in documents {
            for (key, value) in document {
                let field = shape.fields.entry(key.clone()).or_default();
                field.kinds.insert(FieldKind::of(value));
                field.present += 1;
            }
        }
        shape
    }

    /// Fraction of sampled documents containing `field`.
    pub fn presence_ratio(&self, field: &str) -> f64 {
        match (self.fields.get(field), self.sampled) {
            (Some(shape), n) if n > 0 => shape.present as f64 / n as f64,
            _ => 0.0,
        }
    }

    /// Whether `field` was seen holding the given kind.
    pub fn has_kind(&self, field: &str, kind: FieldKind) -> bool {
        let top = field.split('.').next().unwrap_or(field);
        self.fields
            .get(top)
            .is_some_and(|shape| shape.kinds.contains(&kind))
    }
}

/// A way the source collection is queried.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryPattern {
    /// Fields used, in key order.
    pub fields: Vec<String>,
    /// How they are used.
    pub operation_type: OperationType,
    /// Observed uses.
    pub frequency: u64,
    /// The backing source index enforces uniqueness.
    pub unique: bool,
    /// A partial index would serve the pattern.
    pub benefits_from_partial_index: bool,
    /// SQL condition for the partial index.
    pub partial_index_condition: Option<String>,
}

/// Contract between introspection and index optimization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MongoIndexAnalysis {
    /// Collection name.
    pub collection_name: String,
    /// Indexes defined on the collection.
    pub existing_indexes: Vec<SourceIndex>,
    /// Patterns derived from those indexes.
    pub query_patterns: Vec<QueryPattern>,
    /// Filled in once recommendations are computed.
    pub recommended_indexes: Vec<IndexStrategy>,
}

/// Derive query patterns from the indexes a collection already has.
pub fn derive_patterns(
    table: &TableDefinition,
    indexes: &[SourceIndex],
    shape: &CollectionShape,
) -> Vec<QueryPattern> {
    let mut patterns = Vec::new();

    for index in indexes.iter().filter(|i| !i.is_id_index()) {
        let frequency = index.usage_ops.unwrap_or(0).max(1);
        let condition = index
            .partial_filter
            .as_ref()
            .and_then(|filter| partial_filter_to_sql(table, filter));
        let pattern = |fields: Vec<String>, operation_type: OperationType| QueryPattern {
            fields,
            operation_type,
            frequency,
            unique: index.unique,
            benefits_from_partial_index: condition.is_some() || index.sparse,
            partial_index_condition: condition.clone().or_else(|| {
                index.sparse.then(|| sparse_condition(table, &index.keys))
            }),
        };

        let text: Vec<String> = index
            .keys
            .iter()
            .filter(|(_, kind)| *kind == IndexKeyKind::Text)
            .map(|(field, _)| field.clone())
            .collect();
        if !text.is_empty() {
            patterns.push(pattern(text, OperationType::TextSearch));
        }

        for (field, kind) in &index.keys {
            match kind {
                IndexKeyKind::Geo => patterns.push(pattern(vec![field.clone()], OperationType::Geo)),
                IndexKeyKind::Wildcard => {
                    let base = field.trim_end_matches("$**").trim_end_matches('.');
                    if !base.is_empty() {
                        patterns.push(pattern(vec![base.to_string()], OperationType::JsonB));
                    }
                }
                _ => {}
            }
        }

        let ordered: Vec<&(String, IndexKeyKind)> = index
            .keys
            .iter()
            .filter(|(_, kind)| {
                matches!(
                    kind,
                    IndexKeyKind::Ascending | IndexKeyKind::Descending | IndexKeyKind::Hashed
                )
            })
            .collect();
        match ordered.as_slice() {
            [] => {}
            [(field, kind)] => {
                let operation = if shape.has_kind(field, FieldKind::Array) {
                    OperationType::Array
                } else if shape.has_kind(field, FieldKind::Document) && !field.contains('.') {
                    OperationType::JsonB
                } else if *kind == IndexKeyKind::Descending {
                    OperationType::Sort
                } else {
                    OperationType::Equality
                };
                patterns.push(pattern(vec![field.clone()], operation));
            }
            many => patterns.push(pattern(
                many.iter().map(|(field, _)| field.clone()).collect(),
                OperationType::Range,
            )),
        }
    }

    if let Some(date) = table.date_field {
        let covered = patterns.iter().any(|p| {
            p.fields.first().map(String::as_str) == Some(date.field)
                && matches!(p.operation_type, OperationType::Range | OperationType::Sort)
        });
        if !covered {
            patterns.push(QueryPattern {
                fields: vec![date.field.to_string()],
                operation_type: OperationType::Range,
                frequency: 1,
                unique: false,
                benefits_from_partial_index: false,
                partial_index_condition: None,
            });
        }
    }

    patterns
}

fn sparse_condition(table: &TableDefinition, keys: &[(String, IndexKeyKind)]) -> String {
    keys.iter()
        .map(|(field, _)| match crate::index::field_expression(table, field) {
            (column, None) => format!("\"{column}\" IS NOT NULL"),
            (_, Some(expr)) => format!("({expr}) IS NOT NULL"),
        })
        .collect::<Vec<_>>()
        .join(" AND ")
}

/// Enumerates source collections, samples shapes and reads index usage.
#[derive(Clone)]
pub struct SchemaIntrospectionService {
    source: Arc<dyn DocumentSource>,
}

impl std::fmt::Debug for SchemaIntrospectionService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaIntrospectionService")
            .field("database", &self.source.database_name())
            .finish()
    }
}

impl SchemaIntrospectionService {
    /// Create the service.
    pub fn new(source: Arc<dyn DocumentSource>) -> Self {
        Self { source }
    }

    /// User collections, excluding `system.*`.
    pub async fn list_collections(&self) -> MigrateResult<Vec<String>> {
        let mut collections: Vec<String> = self
            .source
            .list_collections()
            .await?
            .into_iter()
            .filter(|c| !c.starts_with("system."))
            .collect();
        collections.sort();
        Ok(collections)
    }

    /// Collections that have a target table.
    pub async fn migratable_collections(&self) -> MigrateResult<Vec<String>> {
        Ok(self
            .list_collections()
            .await?
            .into_iter()
            .filter(|c| table_for_collection(c).is_some())
            .collect())
    }

    /// Sample a collection and infer its shape.
    pub async fn collection_shape(
        &self,
        collection: &str,
        sample_size: usize,
    ) -> MigrateResult<(CollectionShape, Vec<Document>)> {
        let sample = self.source.sample_documents(collection, sample_size).await?;
        let shape = CollectionShape::infer(collection, &sample);
        debug!(
            collection,
            sampled = shape.sampled,
            fields = shape.fields.len(),
            "Inferred collection shape"
        );
        Ok((shape, sample))
    }

    /// Index analysis of one collection.
    pub async fn analyze_indexes(
        &self,
        collection: &str,
        sample_size: usize,
    ) -> MigrateResult<MongoIndexAnalysis> {
        let existing_indexes = self.source.list_indexes(collection).await?;
        let query_patterns = match table_for_collection(collection) {
            Some(table) => {
                let (shape, _) = self.collection_shape(collection, sample_size).await?;
                derive_patterns(table, &existing_indexes, &shape)
            }
            None => Vec::new(),
        };
        debug!(
            collection,
            indexes = existing_indexes.len(),
            patterns = query_patterns.len(),
            "Analyzed source indexes"
        );
        Ok(MongoIndexAnalysis {
            collection_name: collection.to_string(),
            existing_indexes,
            query_patterns,
            recommended_indexes: Vec::new(),
        })
    }

    /// Index analyses for several collections.
    pub async fn analyze_all(
        &self,
        collections: &[String],
        sample_size: usize,
    ) -> MigrateResult<Vec<MongoIndexAnalysis>> {
        let mut analyses = Vec::with_capacity(collections.len());
        for collection in collections {
            analyses.push(self.analyze_indexes(collection, sample_size).await?);
        }
        Ok(analyses)
    }
}
