//! Pre-flight schema and data validation.
//!
//! Errors (unreachable stores, unknown collections, incompatible existing
//! tables) block a run. Conflicts found in sampled data are reported to the
//! operator but do not.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bson::{Bson, Document};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::MigrationConfig;
use crate::error::MigrateResult;
use crate::introspect::CollectionShape;
use crate::schema::{TableDefinition, table_for_collection};
use crate::store::{DocumentSource, RelationalTarget, SourceFilter};
use crate::transform::{bson_to_json, coerce};

/// What kind of data problem a conflict describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConflictKind {
    /// Field values that cannot be stored in the mapped column.
    TypeMismatch,
    /// Several sampled documents share a natural key.
    DuplicateNaturalKey,
    /// Sampled documents lack a required field.
    MissingRequiredField,
}

/// A non-blocking data problem found in sampled documents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchemaConflict {
    /// Collection.
    pub collection: String,
    /// Field (or comma-joined key fields).
    pub field: Option<String>,
    /// Kind.
    pub kind: ConflictKind,
    /// Description, with an example.
    pub message: String,
    /// Affected sampled documents.
    pub occurrences: usize,
}

/// Outcome of a validation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResult {
    /// Blocking problems.
    pub errors: Vec<String>,
    /// Informational findings.
    pub warnings: Vec<String>,
    /// Data conflicts found in samples.
    pub conflicts: Vec<SchemaConflict>,
    /// Collections that were validated.
    pub collections: Vec<String>,
}

impl ValidationResult {
    /// Result holding a single error.
    pub fn with_error(message: impl Into<String>) -> Self {
        let mut result = Self::default();
        result.error(message);
        result
    }

    /// Whether there are no blocking errors.
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Record a blocking error.
    pub fn error(&mut self, message: impl Into<String>) {
        self.errors.push(message.into());
    }

    /// Record a warning.
    pub fn warning(&mut self, message: impl Into<String>) {
        self.warnings.push(message.into());
    }

    /// Fold another result into this one.
    pub fn merge(&mut self, other: ValidationResult) {
        self.errors.extend(other.errors);
        self.warnings.extend(other.warnings);
        self.conflicts.extend(other.conflicts);
        for collection in other.collections {
            if !self.collections.contains(&collection) {
                self.collections.push(collection);
            }
        }
    }
}

/// Which checks to run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ValidationOptions {
    /// Ping both stores first.
    pub check_connectivity: bool,
    /// Compare existing target tables with the expected schema.
    pub check_existing_tables: bool,
    /// Sample documents and look for data conflicts.
    pub check_data: bool,
    /// Documents sampled per collection.
    pub sample_size: usize,
}

impl Default for ValidationOptions {
    fn default() -> Self {
        Self {
            check_connectivity: true,
            check_existing_tables: true,
            check_data: true,
            sample_size: 100,
        }
    }
}

impl ValidationOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Skip the connectivity check.
    pub fn check_connectivity(mut self, check: bool) -> Self {
        self.check_connectivity = check;
        self
    }

    /// Skip the data checks.
    pub fn check_data(mut self, check: bool) -> Self {
        self.check_data = check;
        self
    }

    /// Set the sample size.
    pub fn sample_size(mut self, size: usize) -> Self {
        self.sample_size = size;
        self
    }
}

/// Sampled data checks for one collection.
pub fn find_conflicts(table: &TableDefinition, documents: &[Document]) -> Vec<SchemaConflict> {
    let mut conflicts = Vec::new();

    // Type mismatches, grouped by field.
    let mut mismatches: BTreeMap<&str, (usize, String)> = BTreeMap::new();
    for document in documents {
        for column in table.columns {
            let Some(value) = document.get(column.source) else {
                continue;
            };
            if let Err(message) = coerce(value, column.column_type) {
                let entry = mismatches
                    .entry(column.source)
                    .or_insert_with(|| (0, message));
                entry.0 += 1;
            }
        }
    }
    for (field, (occurrences, example)) in mismatches {
        conflicts.push(SchemaConflict {
            collection: table.collection.to_string(),
            field: Some(field.to_string()),
            kind: ConflictKind::TypeMismatch,
            message: format!("values of '{field}' do not fit the target column ({example})"),
            occurrences,
        });
    }

    // Duplicate natural keys.
    if !table.natural_key.is_empty() {
        let mut keys: HashMap<Vec<String>, usize> = HashMap::new();
        for document in documents {
            let key: Vec<String> = table
                .natural_key
                .iter()
                .map(|field| {
                    document
                        .get(*field)
                        .map(|v| bson_to_json(v).to_string())
                        .unwrap_or_else(|| "null".to_string())
                })
                .collect();
            if key.iter().all(|k| k == "null") {
                continue;
            }
            *keys.entry(key).or_default() += 1;
        }
        let duplicated: usize = keys.values().filter(|n| **n > 1).map(|n| n - 1).sum();
        if duplicated > 0 {
            conflicts.push(SchemaConflict {
                collection: table.collection.to_string(),
                field: Some(table.natural_key.join(",")),
                kind: ConflictKind::DuplicateNaturalKey,
                message: format!(
                    "{duplicated} sampled documents repeat the natural key ({})",
                    table.natural_key.join(", ")
                ),
                occurrences: duplicated,
            });
        }
    }

    // Required fields.
    for field in table.required_fields {
        let missing = documents
            .iter()
            .filter(|d| matches!(d.get(*field), None | Some(Bson::Null)))
            .count();
        if missing > 0 {
            conflicts.push(SchemaConflict {
                collection: table.collection.to_string(),
                field: Some(field.to_string()),
                kind: ConflictKind::MissingRequiredField,
                message: format!("{missing} sampled documents lack required field '{field}'"),
                occurrences: missing,
            });
        }
    }

    conflicts
}

/// Runs connectivity, schema and data checks without touching the target.
#[derive(Clone)]
pub struct ValidationService {
    source: Arc<dyn DocumentSource>,
    target: Arc<dyn RelationalTarget>,
}

impl std::fmt::Debug for ValidationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidationService").finish_non_exhaustive()
    }
}

impl ValidationService {
    /// Create the service.
    pub fn new(source: Arc<dyn DocumentSource>, target: Arc<dyn RelationalTarget>) -> Self {
        Self { source, target }
    }

    /// Collections a config targets: the explicit list, or every source
    /// collection with a target mapping. Unknown requested names are errors.
    pub async fn resolve_collections(
        &self,
        config: &MigrationConfig,
        result: &mut ValidationResult,
    ) -> MigrateResult<Vec<String>> {
        let available: Vec<String> = self
            .source
            .list_collections()
            .await?
            .into_iter()
            .filter(|c| !c.starts_with("system."))
            .collect();

        if config.collections.is_empty() {
            let mut collections: Vec<String> = available
                .into_iter()
                .filter(|c| table_for_collection(c).is_some())
                .collect();
            collections.sort();
            return Ok(collections);
        }

        let mut collections = Vec::new();
        for requested in &config.collections {
            if table_for_collection(requested).is_none() {
                result.error(format!("collection '{requested}' has no target mapping"));
            } else if !available.contains(requested) {
                result.error(format!("collection '{requested}' does not exist in the source"));
            } else if !collections.contains(requested) {
                collections.push(requested.clone());
            }
        }
        Ok(collections)
    }

    /// Schema and data validation.
    pub async fn validate(
        &self,
        config: &MigrationConfig,
        options: &ValidationOptions,
    ) -> MigrateResult<ValidationResult> {
        config.validate()?;
        let mut result = ValidationResult::default();

        if options.check_connectivity {
            if let Err(err) = self.source.ping().await {
                result.error(format!("source unreachable: {err}"));
            }
            if let Err(err) = self.target.ping().await {
                result.error(format!("target unreachable: {err}"));
            }
            if !result.is_valid() {
                warn!(errors = ?result.errors, "Validation stopped: store unreachable");
                return Ok(result);
            }
        }

        let collections = self.resolve_collections(config, &mut result).await?;
        if collections.is_empty() && result.is_valid() {
            result.warning("no collections to migrate");
        }

        for collection in &collections {
            let Some(table) = table_for_collection(collection) else {
                continue;
            };

            if options.check_existing_tables {
                self.check_existing_table(table, config.drop_existing_tables, &mut result)
                    .await?;
            }

            if options.check_data {
                let sample = self
                    .source
                    .sample_documents(collection, options.sample_size)
                    .await?;
                let shape = CollectionShape::infer(collection, &sample);
                for (field, _) in shape.fields.iter().filter(|(f, _)| !table.maps_field(f)) {
                    debug!(collection = %collection, field = %field, "Unmapped field goes to additional_properties");
                }
                result.conflicts.extend(find_conflicts(table, &sample));
            }

            result.collections.push(collection.clone());
        }

        debug!(
            errors = result.errors.len(),
            warnings = result.warnings.len(),
            conflicts = result.conflicts.len(),
            "Validation finished"
        );
        Ok(result)
    }

    /// [`validate`](Self::validate) plus sizing checks against the run's
    /// memory ceiling and source document counts.
    pub async fn validate_pre_migration(
        &self,
        config: &MigrationConfig,
        options: &ValidationOptions,
    ) -> MigrateResult<ValidationResult> {
        let mut result = self.validate(config, options).await?;
        if !result.is_valid() {
            return Ok(result);
        }

        let filter_for = |table: &TableDefinition| SourceFilter::new(config.date_range, table.date_field);
        for collection in result.collections.clone() {
            let Some(table) = table_for_collection(&collection) else {
                continue;
            };
            let count = self
                .source
                .count_documents(&collection, &filter_for(table))
                .await?;
            if count == 0 {
                result.warning(format!("collection '{collection}' has no documents to migrate"));
            }
            if config.date_range.is_bounded() && table.date_field.is_none() {
                result.warning(format!(
                    "collection '{collection}' has no date field; the date range is ignored"
                ));
            }

            let sample = self.source.sample_documents(&collection, 20).await?;
            if !sample.is_empty() {
                let avg: usize = sample
                    .iter()
                    .map(|d| bson::to_vec(d).map(|b| b.len()).unwrap_or(0))
                    .sum::<usize>()
                    / sample.len();
                let batch_bytes = avg.saturating_mul(config.batch_size).saturating_mul(2);
                if batch_bytes > config.memory_ceiling_bytes() {
                    result.warning(format!(
                        "one batch of '{collection}' (~{} KB) exceeds the memory ceiling; \
                         batches will run one at a time",
                        batch_bytes / 1024
                    ));
                }
            }
        }

        if !result.conflicts.is_empty() && !config.skip_duplicates
            && result
                .conflicts
                .iter()
                .any(|c| c.kind == ConflictKind::DuplicateNaturalKey)
        {
            result.warning("duplicate natural keys found; consider --skip-duplicates");
        }

        Ok(result)
    }

    async fn check_existing_table(
        &self,
        table: &TableDefinition,
        will_drop: bool,
        result: &mut ValidationResult,
    ) -> MigrateResult<()> {
        if !self.target.table_exists(table.table).await? {
            return Ok(());
        }
        if will_drop {
            result.warning(format!("table '{}' exists and will be dropped", table.table));
            return Ok(());
        }

        let existing = self.target.describe_table(table.table).await?;
        for name in table.column_names() {
            let Some(expected) = table.column_type(name) else {
                continue;
            };
            match existing.iter().find(|c| c.name == name) {
                None => result.error(format!(
                    "existing table '{}' is missing column '{name}'",
                    table.table
                )),
                Some(column) if !expected.accepts(&column.data_type) => result.error(format!(
                    "existing column '{}.{name}' is {} but {} is required",
                    table.table,
                    column.data_type,
                    expected.sql()
                )),
                Some(_) => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bson::doc;

    #[test]
    fn test_result_merge() {
        let mut a = ValidationResult::with_error("a");
        let mut b = ValidationResult::default();
        b.warning("w");
        b.collections.push("entries".into());
        a.merge(b);
        assert!(!a.is_valid());
        assert_eq!(a.warnings, vec!["w"]);
        assert_eq!(a.collections, vec!["entries"]);
    }

    #[test]
    fn test_find_conflicts() {
        let table = table_for_collection("entries").unwrap();
        let docs = vec![
            doc! { "_id": 1, "type": "sgv", "date": 1000_i64, "device": "g6", "sgv": 100 },
            doc! { "_id": 2, "type": "sgv", "date": 1000_i64, "device": "g6", "sgv": "HIGH" },
            doc! { "_id": 3, "type": "mbg", "mbg": 90 },
        ];
        let conflicts = find_conflicts(table, &docs);

        let kinds: Vec<_> = conflicts.iter().map(|c| c.kind).collect();
        assert_eq!(
            kinds,
            vec![
                ConflictKind::TypeMismatch,
                ConflictKind::DuplicateNaturalKey,
                ConflictKind::MissingRequiredField,
            ]
        );
        assert_eq!(conflicts[0].field.as_deref(), Some("sgv"));
        assert_eq!(conflicts[1].occurrences, 1);
        assert_eq!(conflicts[2].field.as_deref(), Some("date"));
    }

    #[test]
    fn test_clean_sample_has_no_conflicts() {
        let table = table_for_collection("food").unwrap();
        let docs = vec![
            doc! { "_id": 1, "name": "Apple", "category": "Fruit", "carbs": 14 },
            doc! { "_id": 2, "name": "Pear", "category": "Fruit", "carbs": "15" },
        ];
        assert!(find_conflicts(table, &docs).is_empty());
    }
}
