//! Migration run configuration.

use serde::{Deserialize, Serialize};

use crate::error::{MigrateResult, MigrationError};
use crate::retry::RetryPolicy;
use crate::store::DateRange;

/// Configuration for one migration run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Identity of the run. Checkpoints and logs are keyed by it.
    pub migration_id: String,
    /// Collections to migrate. Empty means every discovered collection with
    /// a target mapping.
    pub collections: Vec<String>,
    /// Documents per batch.
    pub batch_size: usize,
    /// Memory ceiling shared by all collections.
    pub max_memory_mb: u64,
    /// Collections processed concurrently.
    pub max_degree_of_parallelism: usize,
    /// Persist the checkpoint every N batches.
    pub checkpoint_interval: usize,
    /// Drop and recreate target tables before the run.
    pub drop_existing_tables: bool,
    /// Skip rows that violate a unique constraint instead of failing.
    pub skip_duplicates: bool,
    /// Only migrate documents whose date field falls in this range.
    pub date_range: DateRange,
    /// Keep null-valued unmapped fields in `additional_properties`.
    pub preserve_null_properties: bool,
    /// Do not compute index recommendations after the run.
    pub skip_index_creation: bool,
    /// Report index recommendations without creating them.
    pub defer_index_creation: bool,
    /// Drop non-primary indexes on migrated tables before creating new ones.
    pub drop_existing_indexes: bool,
    /// Index builds running at once.
    pub max_concurrent_indexes: usize,
    /// Documents that may fail transformation before a collection fails.
    pub max_skipped_documents: u64,
    /// Record a rollback point every N percent of overall progress (0 disables).
    pub rollback_point_interval: u8,
    /// Documents sampled per collection for shape inference.
    pub sample_size: usize,
    /// Backoff for transient store errors.
    pub retry: RetryPolicy,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            migration_id: uuid::Uuid::new_v4().to_string(),
            collections: Vec::new(),
            batch_size: 1000,
            max_memory_mb: 512,
            max_degree_of_parallelism: 2,
            checkpoint_interval: 10,
            drop_existing_tables: false,
            skip_duplicates: false,
            date_range: DateRange::default(),
            preserve_null_properties: false,
            skip_index_creation: false,
            defer_index_creation: false,
            drop_existing_indexes: false,
            max_concurrent_indexes: 2,
            max_skipped_documents: 0,
            rollback_point_interval: 25,
            sample_size: 100,
            retry: RetryPolicy::default(),
        }
    }
}

impl MigrationConfig {
    /// Create a new configuration with a fresh migration id.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the migration id.
    pub fn migration_id(mut self, id: impl Into<String>) -> Self {
        self.migration_id = id.into();
        self
    }

    /// Restrict the run to the given collections.
    pub fn collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    /// Set the batch size.
    pub fn batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the memory ceiling in megabytes.
    pub fn max_memory_mb(mut self, mb: u64) -> Self {
        self.max_memory_mb = mb;
        self
    }

    /// Set cross-collection parallelism.
    pub fn parallelism(mut self, degree: usize) -> Self {
        self.max_degree_of_parallelism = degree;
        self
    }

    /// Set the checkpoint interval in batches.
    pub fn checkpoint_interval(mut self, batches: usize) -> Self {
        self.checkpoint_interval = batches;
        self
    }

    /// Drop existing target tables first.
    pub fn drop_existing_tables(mut self, drop: bool) -> Self {
        self.drop_existing_tables = drop;
        self
    }

    /// Skip duplicate rows.
    pub fn skip_duplicates(mut self, skip: bool) -> Self {
        self.skip_duplicates = skip;
        self
    }

    /// Set the date range filter.
    pub fn date_range(mut self, range: DateRange) -> Self {
        self.date_range = range;
        self
    }

    /// Keep null-valued unmapped properties.
    pub fn preserve_null_properties(mut self, preserve: bool) -> Self {
        self.preserve_null_properties = preserve;
        self
    }

    /// Skip index recommendations.
    pub fn skip_index_creation(mut self, skip: bool) -> Self {
        self.skip_index_creation = skip;
        self
    }

    /// Defer index creation.
    pub fn defer_index_creation(mut self, defer: bool) -> Self {
        self.defer_index_creation = defer;
        self
    }

    /// Drop existing indexes before creating recommendations.
    pub fn drop_existing_indexes(mut self, drop: bool) -> Self {
        self.drop_existing_indexes = drop;
        self
    }

    /// Set the index build concurrency.
    pub fn max_concurrent_indexes(mut self, max: usize) -> Self {
        self.max_concurrent_indexes = max;
        self
    }

    /// Allow up to `max` documents to be skipped on transformation failure.
    pub fn max_skipped_documents(mut self, max: u64) -> Self {
        self.max_skipped_documents = max;
        self
    }

    /// Set the rollback point interval in percent.
    pub fn rollback_point_interval(mut self, percent: u8) -> Self {
        self.rollback_point_interval = percent;
        self
    }

    /// Set the retry policy.
    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Memory ceiling in bytes.
    pub fn memory_ceiling_bytes(&self) -> usize {
        (self.max_memory_mb as usize).saturating_mul(1024 * 1024)
    }

    /// Variant used by the retry-with-adjusted-parameters recovery strategy:
    /// half the batch size, half the parallelism, duplicates skipped.
    pub fn with_adjusted_parameters(&self) -> Self {
        let mut adjusted = self.clone();
        adjusted.batch_size = (self.batch_size / 2).max(1);
        adjusted.max_degree_of_parallelism = (self.max_degree_of_parallelism / 2).max(1);
        adjusted.skip_duplicates = true;
        adjusted
    }

    /// Reject programming errors before any work starts.
    pub fn validate(&self) -> MigrateResult<()> {
        if self.migration_id.trim().is_empty() {
            return Err(MigrationError::invalid_argument("migration_id must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(MigrationError::invalid_argument("batch_size must be at least 1"));
        }
        if self.max_memory_mb == 0 {
            return Err(MigrationError::invalid_argument("max_memory_mb must be at least 1"));
        }
        if self.max_degree_of_parallelism == 0 {
            return Err(MigrationError::invalid_argument("parallelism must be at least 1"));
        }
        if self.checkpoint_interval == 0 {
            return Err(MigrationError::invalid_argument(
                "checkpoint_interval must be at least 1",
            ));
        }
        if self.max_concurrent_indexes == 0 {
            return Err(MigrationError::invalid_argument(
                "max_concurrent_indexes must be at least 1",
            ));
        }
        if self.rollback_point_interval > 100 {
            return Err(MigrationError::invalid_argument(
                "rollback_point_interval is a percentage (0-100)",
            ));
        }
        if let (Some(start), Some(end)) = (self.date_range.start, self.date_range.end) {
            if start > end {
                return Err(MigrationError::invalid_argument("start date is after end date"));
            }
        }
        self.retry.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = MigrationConfig::default();
        assert_eq!(config.batch_size, 1000);
        assert_eq!(config.max_memory_mb, 512);
        assert_eq!(config.max_degree_of_parallelism, 2);
        assert_eq!(config.checkpoint_interval, 10);
        assert!(!config.migration_id.is_empty());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = MigrationConfig::new()
            .migration_id("m1")
            .collections(["entries", "treatments"])
            .batch_size(50)
            .skip_duplicates(true);

        assert_eq!(config.migration_id, "m1");
        assert_eq!(config.collections, vec!["entries", "treatments"]);
        assert_eq!(config.batch_size, 50);
        assert!(config.skip_duplicates);
    }

    #[test]
    fn test_zero_batch_size_is_invalid_argument() {
        let err = MigrationConfig::new().batch_size(0).validate().unwrap_err();
        assert!(matches!(err, MigrationError::InvalidArgument(_)));
    }

    #[test]
    fn test_inverted_date_range_rejected() {
        let start = "2024-02-01T00:00:00Z".parse().unwrap();
        let end = "2024-01-01T00:00:00Z".parse().unwrap();
        let config = MigrationConfig::new().date_range(DateRange {
            start: Some(start),
            end: Some(end),
        });
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_adjusted_parameters() {
        let config = MigrationConfig::new().batch_size(1000).parallelism(4);
        let adjusted = config.with_adjusted_parameters();
        assert_eq!(adjusted.batch_size, 500);
        assert_eq!(adjusted.max_degree_of_parallelism, 2);
        assert!(adjusted.skip_duplicates);

        let tiny = MigrationConfig::new().batch_size(1).parallelism(1);
        let adjusted = tiny.with_adjusted_parameters();
        assert_eq!(adjusted.batch_size, 1);
        assert_eq!(adjusted.max_degree_of_parallelism, 1);
    }
}
