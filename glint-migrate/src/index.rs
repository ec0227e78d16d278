//! Relational index recommendations derived from source query patterns.
//!
//! Equality, range and sort patterns become B-tree indexes; text search,
//! array and embedded-document patterns become GIN indexes; geo patterns
//! become GiST indexes. Source fields without a typed column are indexed
//! through expressions over the `additional_properties` JSONB column.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{MigrateResult, MigrationError};
use crate::introspect::{MongoIndexAnalysis, QueryPattern};
use crate::schema::{ADDITIONAL_PROPERTIES, ColumnType, TableDefinition, table_for_collection};
use crate::store::RelationalTarget;

/// PostgreSQL limit on identifier length.
const MAX_IDENTIFIER_LEN: usize = 63;

/// How a source query uses its fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// `{field: value}`
    Equality,
    /// `{field: {$gt: ..}}` or compound prefix scans.
    Range,
    /// Ordered scans.
    Sort,
    /// `$text` queries.
    TextSearch,
    /// Array membership.
    Array,
    /// Queries into embedded documents.
    JsonB,
    /// Geospatial queries.
    Geo,
}

/// PostgreSQL access methods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IndexType {
    /// `btree`
    BTree,
    /// `gin`
    Gin,
    /// `gist`
    Gist,
    /// `hash`
    Hash,
    /// `spgist`
    SpGist,
    /// `brin`
    Brin,
}

impl IndexType {
    /// Access method name used in `USING`.
    pub fn as_sql(&self) -> &'static str {
        match self {
            Self::BTree => "btree",
            Self::Gin => "gin",
            Self::Gist => "gist",
            Self::Hash => "hash",
            Self::SpGist => "spgist",
            Self::Brin => "brin",
        }
    }

    /// Whether the access method honors column direction and null ordering.
    pub fn is_ordered(&self) -> bool {
        matches!(self, Self::BTree)
    }
}

impl std::fmt::Display for IndexType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_sql())
    }
}

impl OperationType {
    /// Access method serving this kind of query.
    pub fn index_type(&self) -> IndexType {
        match self {
            Self::Equality | Self::Range | Self::Sort => IndexType::BTree,
            Self::TextSearch | Self::Array | Self::JsonB => IndexType::Gin,
            Self::Geo => IndexType::Gist,
        }
    }
}

/// Column sort direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum SortDirection {
    /// `ASC`
    #[default]
    Asc,
    /// `DESC`
    Desc,
}

/// Null placement.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NullHandling {
    /// Access method default.
    #[default]
    Default,
    /// `NULLS FIRST`
    NullsFirst,
    /// `NULLS LAST`
    NullsLast,
}

/// Estimated payoff of an index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EstimatedBenefit {
    /// Rarely used.
    Low,
    /// Occasionally used.
    Medium,
    /// Frequently used.
    High,
    /// Hot path.
    Critical,
}

impl EstimatedBenefit {
    /// Benefit implied by how often a pattern was observed.
    pub fn from_frequency(frequency: u64) -> Self {
        match frequency {
            f if f >= 10_000 => Self::Critical,
            f if f >= 1_000 => Self::High,
            f if f >= 100 => Self::Medium,
            _ => Self::Low,
        }
    }

    fn rank(&self) -> u32 {
        match self {
            Self::Low => 0,
            Self::Medium => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

/// One indexed column or expression.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IndexColumn {
    /// Column name, or the source field for expressions.
    pub name: String,
    /// Sort direction.
    pub direction: SortDirection,
    /// Null placement.
    pub null_handling: NullHandling,
    /// Expression indexed instead of the column.
    pub expression: Option<String>,
    /// Operator class.
    pub operator_class: Option<String>,
}

impl IndexColumn {
    /// Plain ascending column.
    pub fn column(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            direction: SortDirection::Asc,
            null_handling: NullHandling::Default,
            expression: None,
            operator_class: None,
        }
    }

    /// Expression column.
    pub fn expression(name: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            expression: Some(expression.into()),
            ..Self::column(name)
        }
    }

    /// Set the direction.
    pub fn direction(mut self, direction: SortDirection) -> Self {
        self.direction = direction;
        self
    }

    /// Set the null placement.
    pub fn nulls(mut self, handling: NullHandling) -> Self {
        self.null_handling = handling;
        self
    }

    /// Set the operator class.
    pub fn operator_class(mut self, class: impl Into<String>) -> Self {
        self.operator_class = Some(class.into());
        self
    }

    fn to_sql(&self, index_type: IndexType) -> String {
        let mut sql = match &self.expression {
            Some(expr) => format!("({expr})"),
            None => format!("\"{}\"", self.name),
        };
        if let Some(class) = &self.operator_class {
            sql.push(' ');
            sql.push_str(class);
        }
        if index_type.is_ordered() {
            if self.direction == SortDirection::Desc {
                sql.push_str(" DESC");
            }
            match self.null_handling {
                NullHandling::Default => {}
                NullHandling::NullsFirst => sql.push_str(" NULLS FIRST"),
                NullHandling::NullsLast => sql.push_str(" NULLS LAST"),
            }
        }
        sql
    }
}

/// A fully specified target index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexStrategy {
    /// Index name.
    pub index_name: String,
    /// Target table.
    pub table_name: String,
    /// Indexed columns in key order.
    pub columns: Vec<IndexColumn>,
    /// Access method.
    pub index_type: IndexType,
    /// `UNIQUE`
    pub is_unique: bool,
    /// Whether `partial_condition` applies.
    pub is_partial: bool,
    /// `WHERE` clause of a partial index.
    pub partial_condition: Option<String>,
    /// Build with `CONCURRENTLY`.
    pub create_concurrently: bool,
    /// Higher builds first.
    pub priority: u32,
    /// Estimated payoff.
    pub estimated_benefit: EstimatedBenefit,
    /// Collection whose patterns produced this index.
    pub source_collection: String,
}

impl IndexStrategy {
    /// `CREATE INDEX` statement.
    pub fn create_sql(&self) -> String {
        let columns: Vec<String> = self
            .columns
            .iter()
            .map(|c| c.to_sql(self.index_type))
            .collect();
        let mut sql = format!(
            "CREATE {}INDEX {}IF NOT EXISTS \"{}\" ON \"{}\" USING {} ({})",
            if self.is_unique { "UNIQUE " } else { "" },
            if self.create_concurrently { "CONCURRENTLY " } else { "" },
            self.index_name,
            self.table_name,
            self.index_type.as_sql(),
            columns.join(", ")
        );
        if let (true, Some(condition)) = (self.is_partial, &self.partial_condition) {
            sql.push_str(" WHERE ");
            sql.push_str(condition);
        }
        sql.push(';');
        sql
    }

    fn dedup_key(&self) -> (String, Vec<IndexColumn>, IndexType, Option<String>) {
        (
            self.table_name.clone(),
            self.columns.clone(),
            self.index_type,
            self.is_partial.then(|| self.partial_condition.clone()).flatten(),
        )
    }
}

/// `DROP INDEX` statement.
pub fn drop_index_sql(name: &str, concurrently: bool) -> String {
    format!(
        "DROP INDEX {}IF EXISTS \"{}\";",
        if concurrently { "CONCURRENTLY " } else { "" },
        name
    )
}

/// SQL expression addressing a source field on `table`: the quoted column for
/// mapped fields, a JSONB text extraction from the overflow column otherwise.
pub fn field_expression(table: &TableDefinition, field: &str) -> (String, Option<String>) {
    if let Some(column) = table.column_for_field(field) {
        return (column.name.to_string(), None);
    }
    let path = json_path(field);
    (field.to_string(), Some(format!("{ADDITIONAL_PROPERTIES}{path}")))
}

/// `->'a'->>'b'` path for a dotted field.
fn json_path(field: &str) -> String {
    let parts: Vec<&str> = field.split('.').collect();
    let mut path = String::new();
    for (i, part) in parts.iter().enumerate() {
        let arrow = if i + 1 == parts.len() { "->>" } else { "->" };
        path.push_str(&format!("{arrow}'{}'", part.replace('\'', "''")));
    }
    path
}

/// `->'a'->'b'` path returning JSONB.
fn json_path_jsonb(field: &str) -> String {
    field
        .split('.')
        .map(|part| format!("->'{}'", part.replace('\'', "''")))
        .collect()
}

/// Render a partial filter expression as a SQL condition. Supports field
/// equality, `$exists`, and comparison operators; returns `None` otherwise.
pub fn partial_filter_to_sql(table: &TableDefinition, filter: &serde_json::Value) -> Option<String> {
    let object = filter.as_object()?;
    let mut clauses = Vec::new();
    for (field, condition) in object {
        let target = match field_expression(table, field) {
            (column, None) => format!("\"{column}\""),
            (_, Some(expr)) => format!("({expr})"),
        };
        let numeric = table
            .column_for_field(field)
            .map(|c| matches!(c.column_type, ColumnType::Integer | ColumnType::BigInt | ColumnType::Double))
            .unwrap_or(false);

        match condition {
            serde_json::Value::Object(ops) => {
                for (op, value) in ops {
                    let clause = match op.as_str() {
                        "$exists" => {
                            if value.as_bool().unwrap_or(true) {
                                format!("{target} IS NOT NULL")
                            } else {
                                format!("{target} IS NULL")
                            }
                        }
                        "$eq" => format!("{target} = {}", sql_literal(value, numeric)?),
                        "$ne" => format!("{target} <> {}", sql_literal(value, numeric)?),
                        "$gt" => format!("{target} > {}", sql_literal(value, numeric)?),
                        "$gte" => format!("{target} >= {}", sql_literal(value, numeric)?),
                        "$lt" => format!("{target} < {}", sql_literal(value, numeric)?),
                        "$lte" => format!("{target} <= {}", sql_literal(value, numeric)?),
                        _ => return None,
                    };
                    clauses.push(clause);
                }
            }
            value => clauses.push(format!("{target} = {}", sql_literal(value, numeric)?)),
        }
    }
    (!clauses.is_empty()).then(|| clauses.join(" AND "))
}

fn sql_literal(value: &serde_json::Value, numeric: bool) -> Option<String> {
    match value {
        serde_json::Value::Number(n) if numeric => Some(n.to_string()),
        serde_json::Value::Number(n) => Some(format!("'{n}'")),
        serde_json::Value::String(s) => Some(format!("'{}'", s.replace('\'', "''"))),
        serde_json::Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn index_name(table: &str, columns: &[IndexColumn], suffix: &str) -> String {
    let cols: Vec<String> = columns
        .iter()
        .map(|c| {
            c.name
                .chars()
                .map(|ch| if ch.is_ascii_alphanumeric() { ch.to_ascii_lowercase() } else { '_' })
                .collect()
        })
        .collect();
    let name = format!("idx_{}_{}_{}", table, cols.join("_"), suffix);
    if name.len() <= MAX_IDENTIFIER_LEN {
        return name;
    }
    let hash = crate::checkpoint::lock_key(&name) as u64;
    let mut cut = MAX_IDENTIFIER_LEN - 9;
    while !name.is_char_boundary(cut) {
        cut -= 1;
    }
    format!("{}_{:08x}", &name[..cut], hash & 0xffff_ffff)
}

fn strategy_columns(table: &TableDefinition, pattern: &QueryPattern) -> Vec<IndexColumn> {
    match pattern.operation_type {
        OperationType::Equality | OperationType::Range | OperationType::Sort => pattern
            .fields
            .iter()
            .map(|field| {
                let column = match field_expression(table, field) {
                    (name, None) => IndexColumn::column(name),
                    (name, Some(expr)) => IndexColumn::expression(name, expr),
                };
                if pattern.operation_type == OperationType::Sort {
                    column.direction(SortDirection::Desc).nulls(NullHandling::NullsLast)
                } else {
                    column
                }
            })
            .collect(),
        OperationType::TextSearch => {
            let parts: Vec<String> = pattern
                .fields
                .iter()
                .map(|field| match field_expression(table, field) {
                    (name, None) => format!("coalesce(\"{name}\", '')"),
                    (_, Some(expr)) => format!("coalesce({expr}, '')"),
                })
                .collect();
            let name = pattern.fields.join("_");
            vec![IndexColumn::expression(
                format!("{name}_tsv"),
                format!("to_tsvector('simple', {})", parts.join(" || ' ' || ")),
            )]
        }
        OperationType::Array | OperationType::JsonB => pattern
            .fields
            .iter()
            .map(|field| match table.column_for_field(field) {
                Some(col) if col.column_type == ColumnType::Jsonb => {
                    IndexColumn::column(col.name).operator_class("jsonb_path_ops")
                }
                _ => IndexColumn::expression(
                    field.clone(),
                    format!("{ADDITIONAL_PROPERTIES}{}", json_path_jsonb(field)),
                )
                .operator_class("jsonb_path_ops"),
            })
            .collect(),
        OperationType::Geo => pattern
            .fields
            .iter()
            .map(|field| {
                let base = match table.column_for_field(field) {
                    Some(col) => format!("\"{}\"", col.name),
                    None => format!("{ADDITIONAL_PROPERTIES}{}", json_path_jsonb(field)),
                };
                IndexColumn::expression(
                    field.clone(),
                    format!(
                        "point(({base}->'coordinates'->>0)::float8, ({base}->'coordinates'->>1)::float8)"
                    ),
                )
            })
            .collect(),
    }
}

fn strategy_for(
    table: &TableDefinition,
    pattern: &QueryPattern,
    unique: bool,
    partial: bool,
) -> IndexStrategy {
    let index_type = pattern.operation_type.index_type();
    let columns = strategy_columns(table, pattern);
    let mut benefit = EstimatedBenefit::from_frequency(pattern.frequency);
    if unique && benefit < EstimatedBenefit::High {
        benefit = EstimatedBenefit::High;
    }
    // Unique only when all columns are typed; JSONB extraction can collide
    // on values the source considered distinct.
    let is_unique = unique
        && index_type == IndexType::BTree
        && pattern.fields.iter().all(|f| table.column_for_field(f).is_some());
    let suffix = match (partial, is_unique) {
        (true, _) => "partial",
        (false, true) => "uniq",
        (false, false) => index_type.as_sql(),
    };
    let partial_condition = if partial {
        pattern.partial_index_condition.clone()
    } else {
        None
    };

    IndexStrategy {
        index_name: index_name(table.table, &columns, suffix),
        table_name: table.table.to_string(),
        columns,
        index_type,
        is_unique,
        is_partial: partial_condition.is_some(),
        partial_condition,
        create_concurrently: true,
        priority: benefit.rank() * 1000 + pattern.frequency.min(999) as u32 + u32::from(partial),
        estimated_benefit: benefit,
        source_collection: table.collection.to_string(),
    }
}

/// Map analyses to index strategies: one per pattern, one more per
/// partial-index candidate, duplicates collapsed, highest priority first.
pub fn recommend(analyses: &[MongoIndexAnalysis]) -> Vec<IndexStrategy> {
    let mut strategies: Vec<IndexStrategy> = Vec::new();
    let mut seen: HashMap<(String, Vec<IndexColumn>, IndexType, Option<String>), usize> =
        HashMap::new();

    for analysis in analyses {
        let Some(table) = table_for_collection(&analysis.collection_name) else {
            continue;
        };
        for pattern in &analysis.query_patterns {
            if pattern.fields.is_empty() {
                continue;
            }
            let mut candidates = vec![strategy_for(table, pattern, pattern.unique, false)];
            if pattern.benefits_from_partial_index && pattern.partial_index_condition.is_some() {
                candidates.push(strategy_for(table, pattern, false, true));
            }

            for candidate in candidates {
                match seen.get(&candidate.dedup_key()) {
                    Some(&idx) => {
                        let existing = &mut strategies[idx];
                        if candidate.priority > existing.priority {
                            existing.priority = candidate.priority;
                            existing.estimated_benefit =
                                existing.estimated_benefit.max(candidate.estimated_benefit);
                        }
                        // The name carries the uniqueness suffix.
                        if candidate.is_unique && !existing.is_unique {
                            existing.is_unique = true;
                            existing.index_name = candidate.index_name;
                        }
                    }
                    None => {
                        seen.insert(candidate.dedup_key(), strategies.len());
                        strategies.push(candidate);
                    }
                }
            }
        }
    }

    sort_by_priority(&mut strategies);
    strategies
}

/// Order strategies by descending (priority, benefit), then name.
pub fn sort_by_priority(strategies: &mut [IndexStrategy]) {
    strategies.sort_by(|a, b| {
        b.priority
            .cmp(&a.priority)
            .then_with(|| b.estimated_benefit.cmp(&a.estimated_benefit))
            .then_with(|| a.index_name.cmp(&b.index_name))
    });
}

/// Options for [`IndexOptimizationService::create_indexes`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexCreationOptions {
    /// Index builds running at once.
    pub max_concurrent_creations: usize,
    /// Override each strategy's `create_concurrently`.
    pub create_concurrently: Option<bool>,
    /// Per-index timeout in seconds.
    pub timeout_secs: u64,
    /// Keep going after a failed build.
    pub continue_on_error: bool,
}

impl Default for IndexCreationOptions {
    fn default() -> Self {
        Self {
            max_concurrent_creations: 2,
            create_concurrently: None,
            timeout_secs: 1800,
            continue_on_error: true,
        }
    }
}

impl IndexCreationOptions {
    /// Create default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the build concurrency.
    pub fn max_concurrent_creations(mut self, max: usize) -> Self {
        self.max_concurrent_creations = max;
        self
    }

    /// Force `CONCURRENTLY` on or off.
    pub fn create_concurrently(mut self, concurrently: bool) -> Self {
        self.create_concurrently = Some(concurrently);
        self
    }

    /// Stop after the first failure.
    pub fn continue_on_error(mut self, keep_going: bool) -> Self {
        self.continue_on_error = keep_going;
        self
    }
}

/// Options for [`IndexOptimizationService::drop_indexes`].
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct IndexDropOptions {
    /// Drop with `CONCURRENTLY`.
    pub concurrently: bool,
}

/// Outcome of one index build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexCreationResult {
    /// Index name.
    pub index_name: String,
    /// Target table.
    pub table_name: String,
    /// Whether the index exists afterwards.
    pub is_success: bool,
    /// Whether the index already existed and nothing was built.
    pub already_existed: bool,
    /// Failure description.
    pub error_message: Option<String>,
    /// Statement executed.
    pub sql: String,
    /// Wall time.
    #[serde(skip)]
    pub duration: Duration,
}

/// Outcome of one index drop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexDropResult {
    /// Index name.
    pub index_name: String,
    /// Whether the drop succeeded.
    pub is_success: bool,
    /// Failure description.
    pub error_message: Option<String>,
}

/// Recommends, builds and drops target indexes.
#[derive(Clone)]
pub struct IndexOptimizationService {
    target: Arc<dyn RelationalTarget>,
}

impl std::fmt::Debug for IndexOptimizationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexOptimizationService").finish_non_exhaustive()
    }
}

impl IndexOptimizationService {
    /// Create the service.
    pub fn new(target: Arc<dyn RelationalTarget>) -> Self {
        Self { target }
    }

    /// See [`recommend`].
    pub fn analyze_and_recommend(&self, analyses: &[MongoIndexAnalysis]) -> Vec<IndexStrategy> {
        recommend(analyses)
    }

    /// Build indexes in priority order with bounded concurrency.
    pub async fn create_indexes(
        &self,
        strategies: &[IndexStrategy],
        options: &IndexCreationOptions,
        cancel: &CancellationToken,
    ) -> MigrateResult<Vec<IndexCreationResult>> {
        if options.max_concurrent_creations == 0 {
            return Err(MigrationError::invalid_argument(
                "max_concurrent_creations must be at least 1",
            ));
        }

        let mut ordered = strategies.to_vec();
        sort_by_priority(&mut ordered);
        if let Some(concurrently) = options.create_concurrently {
            for strategy in &mut ordered {
                strategy.create_concurrently = concurrently;
            }
        }

        let mut existing = std::collections::HashSet::new();
        let mut tables: Vec<&str> = ordered.iter().map(|s| s.table_name.as_str()).collect();
        tables.sort_unstable();
        tables.dedup();
        for table in tables {
            for index in self.target.list_indexes(table).await? {
                existing.insert(index.name);
            }
        }

        let timeout = Duration::from_secs(options.timeout_secs);
        let stop = cancel.child_token();
        let results: Vec<IndexCreationResult> = futures::stream::iter(ordered)
            .map(|strategy| {
                let stop = stop.clone();
                let exists = existing.contains(&strategy.index_name);
                async move {
                    let sql = strategy.create_sql();
                    let start = Instant::now();
                    let mut result = IndexCreationResult {
                        index_name: strategy.index_name.clone(),
                        table_name: strategy.table_name.clone(),
                        is_success: false,
                        already_existed: exists,
                        error_message: None,
                        sql,
                        duration: Duration::ZERO,
                    };
                    if exists {
                        debug!(index = %strategy.index_name, "Index already exists");
                        result.is_success = true;
                        return result;
                    }
                    if stop.is_cancelled() {
                        result.error_message = Some(MigrationError::Cancelled.to_string());
                        return result;
                    }

                    let outcome = tokio::select! {
                        _ = stop.cancelled() => Err(MigrationError::Cancelled),
                        r = tokio::time::timeout(timeout, self.target.create_index(&strategy)) => {
                            r.unwrap_or(Err(MigrationError::Timeout(timeout.as_millis() as u64)))
                        }
                    };
                    result.duration = start.elapsed();
                    match outcome {
                        Ok(()) => {
                            info!(
                                index = %strategy.index_name,
                                table = %strategy.table_name,
                                index_type = %strategy.index_type,
                                duration_ms = result.duration.as_millis() as u64,
                                "Index created"
                            );
                            result.is_success = true;
                        }
                        Err(err) => {
                            warn!(index = %strategy.index_name, error = %err, "Index creation failed");
                            result.error_message = Some(err.to_string());
                            if !options.continue_on_error {
                                stop.cancel();
                            }
                        }
                    }
                    result
                }
            })
            .buffered(options.max_concurrent_creations)
            .collect()
            .await;

        Ok(results)
    }

    /// Drop indexes by name.
    pub async fn drop_indexes(
        &self,
        names: &[String],
        options: &IndexDropOptions,
    ) -> Vec<IndexDropResult> {
        let mut results = Vec::with_capacity(names.len());
        for name in names {
            let outcome = self.target.drop_index(name, options.concurrently).await;
            if let Err(err) = &outcome {
                warn!(index = %name, error = %err, "Index drop failed");
            } else {
                debug!(index = %name, "Index dropped");
            }
            results.push(IndexDropResult {
                index_name: name.clone(),
                is_success: outcome.is_ok(),
                error_message: outcome.err().map(|e| e.to_string()),
            });
        }
        results
    }

    /// Drop every non-primary, non-constraint index on the given tables.
    pub async fn drop_existing_indexes(
        &self,
        tables: &[&str],
        options: &IndexDropOptions,
    ) -> MigrateResult<Vec<IndexDropResult>> {
        let mut names = Vec::new();
        for table in tables {
            for index in self.target.list_indexes(table).await? {
                if !index.is_primary && !index.is_constraint {
                    names.push(index.name);
                }
            }
        }
        Ok(self.drop_indexes(&names, options).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pattern(fields: &[&str], op: OperationType, frequency: u64) -> QueryPattern {
        QueryPattern {
            fields: fields.iter().map(|f| f.to_string()).collect(),
            operation_type: op,
            frequency,
            unique: false,
            benefits_from_partial_index: false,
            partial_index_condition: None,
        }
    }

    fn analysis(collection: &str, patterns: Vec<QueryPattern>) -> MongoIndexAnalysis {
        MongoIndexAnalysis {
            collection_name: collection.to_string(),
            existing_indexes: Vec::new(),
            query_patterns: patterns,
            recommended_indexes: Vec::new(),
        }
    }

    #[test]
    fn test_operation_type_mapping_is_exhaustive() {
        assert_eq!(OperationType::Equality.index_type(), IndexType::BTree);
        assert_eq!(OperationType::Range.index_type(), IndexType::BTree);
        assert_eq!(OperationType::Sort.index_type(), IndexType::BTree);
        assert_eq!(OperationType::TextSearch.index_type(), IndexType::Gin);
        assert_eq!(OperationType::Array.index_type(), IndexType::Gin);
        assert_eq!(OperationType::JsonB.index_type(), IndexType::Gin);
        assert_eq!(OperationType::Geo.index_type(), IndexType::Gist);
    }

    #[test]
    fn test_single_field_equality_is_btree() {
        let strategies = recommend(&[analysis(
            "entries",
            vec![pattern(&["type"], OperationType::Equality, 50)],
        )]);
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].index_type, IndexType::BTree);
        assert_eq!(strategies[0].columns[0].name, "type");
        assert_eq!(strategies[0].estimated_benefit, EstimatedBenefit::Low);
    }

    #[test]
    fn test_jsonb_pattern_is_gin() {
        let strategies = recommend(&[analysis(
            "devicestatus",
            vec![pattern(&["pump"], OperationType::JsonB, 10)],
        )]);
        assert_eq!(strategies[0].index_type, IndexType::Gin);
        assert_eq!(
            strategies[0].columns[0].operator_class.as_deref(),
            Some("jsonb_path_ops")
        );
    }

    #[test]
    fn test_unmapped_field_uses_overflow_expression() {
        let strategies = recommend(&[analysis(
            "entries",
            vec![pattern(&["app.name"], OperationType::Equality, 5)],
        )]);
        let sql = strategies[0].create_sql();
        assert!(sql.contains("(additional_properties->'app'->>'name')"), "{sql}");
    }

    #[test]
    fn test_partial_candidate_added() {
        let mut p = pattern(&["sgv"], OperationType::Equality, 500);
        p.benefits_from_partial_index = true;
        p.partial_index_condition = Some("\"sgv\" IS NOT NULL".to_string());
        let strategies = recommend(&[analysis("entries", vec![p])]);

        assert_eq!(strategies.len(), 2);
        let partial = strategies.iter().find(|s| s.is_partial).unwrap();
        assert!(partial.create_sql().ends_with("WHERE \"sgv\" IS NOT NULL;"));
        assert!(partial.index_name.ends_with("_partial"));
    }

    #[test]
    fn test_duplicates_collapsed_keeping_highest_priority() {
        let strategies = recommend(&[analysis(
            "entries",
            vec![
                pattern(&["type"], OperationType::Equality, 5),
                pattern(&["type"], OperationType::Equality, 5_000),
            ],
        )]);
        assert_eq!(strategies.len(), 1);
        assert_eq!(strategies[0].estimated_benefit, EstimatedBenefit::High);
    }

    #[test]
    fn test_unique_duplicate_renames_collapsed_index() {
        let mut unique = pattern(&["created_at"], OperationType::Equality, 5);
        unique.unique = true;
        let strategies = recommend(&[analysis(
            "treatments",
            vec![pattern(&["created_at"], OperationType::Equality, 5), unique],
        )]);
        assert_eq!(strategies.len(), 1);
        assert!(strategies[0].is_unique);
        assert_eq!(strategies[0].index_name, "idx_treatments_created_at_uniq");
        assert!(strategies[0].create_sql().starts_with(
            "CREATE UNIQUE INDEX CONCURRENTLY IF NOT EXISTS \"idx_treatments_created_at_uniq\""
        ));
    }

    #[test]
    fn test_untyped_unique_keeps_type_suffix() {
        let mut unique = pattern(&["metadata.source"], OperationType::Equality, 5);
        unique.unique = true;
        let strategies = recommend(&[analysis("treatments", vec![unique])]);
        assert!(!strategies[0].is_unique);
        assert!(strategies[0].index_name.ends_with("_btree"));
    }

    #[test]
    fn test_priority_order() {
        let strategies = recommend(&[analysis(
            "treatments",
            vec![
                pattern(&["notes"], OperationType::TextSearch, 10),
                pattern(&["eventType"], OperationType::Equality, 20_000),
                pattern(&["created_at"], OperationType::Sort, 2_000),
            ],
        )]);
        let names: Vec<_> = strategies.iter().map(|s| s.estimated_benefit).collect();
        assert_eq!(
            names,
            vec![EstimatedBenefit::Critical, EstimatedBenefit::High, EstimatedBenefit::Low]
        );
    }

    #[test]
    fn test_create_sql_rendering() {
        let strategies = recommend(&[analysis(
            "treatments",
            vec![pattern(&["created_at"], OperationType::Sort, 1)],
        )]);
        assert_eq!(
            strategies[0].create_sql(),
            "CREATE INDEX CONCURRENTLY IF NOT EXISTS \"idx_treatments_created_at_btree\" \
             ON \"treatments\" USING btree (\"created_at\" DESC NULLS LAST);"
        );
        assert_eq!(
            drop_index_sql("idx_a", true),
            "DROP INDEX CONCURRENTLY IF EXISTS \"idx_a\";"
        );
    }

    #[test]
    fn test_geo_is_gist_point() {
        let strategies = recommend(&[analysis(
            "activity",
            vec![pattern(&["location"], OperationType::Geo, 1)],
        )]);
        assert_eq!(strategies[0].index_type, IndexType::Gist);
        assert!(strategies[0].create_sql().contains("point("));
    }

    #[test]
    fn test_long_names_truncated() {
        let cols = vec![IndexColumn::column("a".repeat(80))];
        let name = index_name("entries", &cols, "btree");
        assert!(name.len() <= MAX_IDENTIFIER_LEN);
    }

    #[test]
    fn test_partial_filter_to_sql() {
        let table = table_for_collection("entries").unwrap();
        assert_eq!(
            partial_filter_to_sql(table, &json!({ "sgv": { "$exists": true } })).as_deref(),
            Some("\"sgv\" IS NOT NULL")
        );
        assert_eq!(
            partial_filter_to_sql(table, &json!({ "type": "sgv", "sgv": { "$gt": 40 } })).as_deref(),
            Some("\"sgv\" > 40 AND \"type\" = 'sgv'")
        );
        assert_eq!(partial_filter_to_sql(table, &json!({ "$or": [] })), None);
    }

    #[test]
    fn test_unknown_collection_ignored() {
        let strategies = recommend(&[analysis(
            "settings",
            vec![pattern(&["x"], OperationType::Equality, 1)],
        )]);
        assert!(strategies.is_empty());
    }
}
