//! `glint migrate` - Move collections from MongoDB into PostgreSQL.

use std::sync::Arc;
use std::time::Duration;

use glint_migrate::store::DateRange;
use glint_migrate::{
    ConnectionTestOptions, ConnectionTestService, MigrationConfig, MigrationResult,
    StatusRegistry, ValidationOptions,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::cli::MigrateArgs;
use crate::commands::test_connections::print_check;
use crate::commands::{self, Outcome};
use crate::config::Config;
use crate::error::{CliError, CliResult};
use crate::output::{self, success, warn};

/// Run the migrate command
pub async fn run(args: MigrateArgs, config: &Config, cancel: &CancellationToken) -> CliResult<Outcome> {
    output::header(if args.resume.is_some() { "Migrate (resume)" } else { "Migrate" });

    let migration = migration_config(&args, config)?;
    output::kv("Migration", &migration.migration_id);
    output::kv("MongoDB", &args.mongo.mongo_database);
    if !migration.collections.is_empty() {
        output::kv("Collections", &migration.collections.join(", "));
    }
    output::kv("Batch size", &migration.batch_size.to_string());
    output::newline();

    let source = commands::connect_source(&args.mongo).await?;
    let pool = commands::connect_pool(
        &args.postgres_connection,
        migration.max_degree_of_parallelism,
        migration.max_concurrent_indexes,
    )?;
    let engine = commands::engine(source, &pool, StatusRegistry::new());

    let total_steps = 3;

    if args.skip_connection_test {
        output::step(1, total_steps, "Skipping connection test (--skip-connection-test)");
    } else {
        output::step(1, total_steps, "Testing connections...");
        let tester = ConnectionTestService::new()
            .source(Arc::clone(engine.source()))
            .target(Arc::clone(engine.target()));
        let result = tester
            .test_connections(&ConnectionTestOptions::new().timeout(Duration::from_secs(10)))
            .await;
        for check in result.source.iter().chain(result.target.iter()) {
            print_check(check, false);
        }
        if !result.is_success() {
            pool.close();
            return Err(CliError::Connection(
                "one or more stores are unreachable".to_string(),
            ));
        }
    }

    if args.skip_validation || args.resume.is_some() {
        output::step(2, total_steps, "Skipping validation");
    } else {
        output::step(2, total_steps, "Validating schema and data...");
        let options = ValidationOptions::new()
            .check_connectivity(false)
            .sample_size(migration.sample_size);
        let validation = engine.validate_pre_migration(&migration, &options).await?;
        for conflict in &validation.conflicts {
            output::list_item(&format!(
                "{}: {} ({} occurrence(s))",
                conflict.collection, conflict.message, conflict.occurrences
            ));
        }
        for warning in &validation.warnings {
            warn(warning);
        }
        if !validation.is_valid() {
            for error in &validation.errors {
                output::error(error);
            }
            pool.close();
            return Err(CliError::Validation(format!(
                "{} blocking problem(s) found",
                validation.errors.len()
            )));
        }
    }

    output::step(3, total_steps, "Migrating documents...");
    let result = match &args.resume {
        Some(checkpoint_id) => engine.resume(&migration, checkpoint_id, cancel).await?,
        None => engine.migrate(&migration, cancel).await?,
    };
    pool.close();

    print_result(&result);
    Ok(Outcome::from_result(result.is_success, result.error_kind))
}

/// Engine configuration from glint.toml, overridden by flags.
pub fn migration_config(args: &MigrateArgs, config: &Config) -> CliResult<MigrationConfig> {
    let mut migration = config
        .migration_config()
        .collections(args.collections.clone())
        .drop_existing_tables(args.drop_tables)
        .skip_duplicates(args.skip_duplicates)
        .preserve_null_properties(args.preserve_null_properties)
        .skip_index_creation(args.skip_index_creation)
        .defer_index_creation(args.defer_index_creation)
        .drop_existing_indexes(args.drop_existing_indexes)
        .date_range(DateRange {
            start: args.start_date,
            end: args.end_date,
        });

    if let Some(id) = &args.migration_id {
        migration = migration.migration_id(id.clone());
    }
    if let Some(size) = args.batch_size {
        migration = migration.batch_size(size);
    }
    if let Some(mb) = args.max_memory_mb {
        migration = migration.max_memory_mb(mb);
    }
    if let Some(degree) = args.parallelism {
        migration = migration.parallelism(degree);
    }
    if let Some(max) = args.max_concurrent_indexes {
        migration = migration.max_concurrent_indexes(max);
    }

    if let (Some(start), Some(end)) = (args.start_date, args.end_date) {
        if start > end {
            return Err(CliError::Config(
                "--start-date must not be after --end-date".to_string(),
            ));
        }
    }
    migration.validate()?;
    Ok(migration)
}

fn print_result(result: &MigrationResult) {
    output::newline();
    output::section("Collections");
    for stats in &result.collections {
        output::check_item(
            stats.documents_failed == 0 && stats.documents_processed >= stats.total_documents,
            &format!(
                "{} → {}: {}/{} processed, {} inserted, {} skipped, {} failed ({}, {:.0} docs/s)",
                stats.collection,
                stats.table,
                stats.documents_processed,
                stats.total_documents,
                stats.documents_inserted,
                stats.documents_skipped,
                stats.documents_failed,
                output::format_duration(stats.duration),
                stats.throughput()
            ),
        );
    }

    let stats = &result.statistics;
    output::newline();
    output::kv("Peak memory", &output::format_bytes(stats.peak_memory_bytes as u64));
    output::kv("Throttle events", &stats.throttle_events.to_string());
    output::kv("Retries", &stats.retries.to_string());

    if let Some(indexes) = &result.indexes {
        output::newline();
        if indexes.deferred {
            output::section("Recommended indexes (deferred)");
            for strategy in &indexes.recommended {
                output::code(&format!("{};", strategy.create_sql()));
            }
        } else {
            output::section("Indexes");
            for dropped in &indexes.dropped {
                output::check_item(dropped.is_success, &format!("dropped {}", dropped.index_name));
            }
            for created in &indexes.created {
                let label = if created.already_existed {
                    format!("{} (already present)", created.index_name)
                } else {
                    format!("{} on {}", created.index_name, created.table_name)
                };
                output::check_item(created.is_success, &label);
            }
        }
        if let Some(message) = &indexes.error_message {
            warn(message);
        }
    }

    output::newline();
    if result.is_success {
        info!(migration_id = %result.migration_id, "Migration finished");
        success(&format!("Migration complete: {}", result.summary()));
        return;
    }

    if result.is_cancelled() {
        warn(&format!("Migration cancelled: {}", result.summary()));
    } else {
        output::error(&format!(
            "Migration failed: {}",
            result.error_message.as_deref().unwrap_or("unknown error")
        ));
    }
    if let Some(checkpoint) = &result.checkpoint_id {
        output::newline();
        output::section("Next steps");
        output::list_item(&format!("Resume with `glint migrate --resume {}`", checkpoint));
        output::list_item(&format!(
            "Or analyze with `glint recovery --migration-id {} --analyze-only`",
            result.migration_id
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;

    fn parse(extra: &[&str]) -> MigrateArgs {
        let mut argv = vec![
            "glint",
            "migrate",
            "--mongo-connection",
            "mongodb://localhost",
            "--mongo-database",
            "care",
            "--postgres-connection",
            "postgresql://localhost/care",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Migrate(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_flags_override_file() {
        let config: Config = toml::from_str("[migration]\nbatch_size = 250\nparallelism = 3\n").unwrap();
        let args = parse(&["--batch-size", "50", "--migration-id", "nightly"]);
        let migration = migration_config(&args, &config).unwrap();
        assert_eq!(migration.batch_size, 50);
        assert_eq!(migration.max_degree_of_parallelism, 3);
        assert_eq!(migration.migration_id, "nightly");
    }

    #[test]
    fn test_date_range_from_flags() {
        let args = parse(&["--start-date", "2024-01-01", "--end-date", "2024-02-01"]);
        let migration = migration_config(&args, &Config::default()).unwrap();
        assert!(migration.date_range.is_bounded());
    }

    #[test]
    fn test_inverted_date_range_rejected() {
        let args = parse(&["--start-date", "2024-02-01", "--end-date", "2024-01-01"]);
        assert!(matches!(
            migration_config(&args, &Config::default()),
            Err(CliError::Config(_))
        ));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let args = parse(&["--batch-size", "0"]);
        assert!(matches!(
            migration_config(&args, &Config::default()),
            Err(CliError::Config(_))
        ));
    }
}
