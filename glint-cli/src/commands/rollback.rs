//! `glint rollback` - Undo a migration.

use std::sync::Arc;

use glint_migrate::{BackupType, RollbackConfig, RollbackResult, RollbackService};
use glint_postgres::{PgCheckpointRepository, PgTarget};
use tokio_util::sync::CancellationToken;

use crate::cli::RollbackArgs;
use crate::commands::{self, Outcome};
use crate::config::Config;
use crate::error::{CliError, CliResult};
use crate::output::{self, success, warn};

/// Run the rollback command
pub async fn run(args: RollbackArgs, config: &Config, cancel: &CancellationToken) -> CliResult<Outcome> {
    output::header(if args.dry_run { "Rollback (dry run)" } else { "Rollback" });

    let rollback = rollback_config(&args)?;
    output::kv("Migration", &rollback.migration_id);
    if let Some(path) = &rollback.backup_file {
        output::kv("Backup", &path.display().to_string());
    }
    if let Some(point) = &rollback.rollback_point {
        output::kv("Rollback point", point);
    }
    output::newline();

    let pool = commands::connect_pool(&args.postgres_connection, 1, 1)?;
    let service = RollbackService::new(
        Arc::new(PgTarget::new(pool.clone())),
        Arc::new(PgCheckpointRepository::new(pool.clone())),
        commands::backup_service(config),
    );

    output::step(1, 2, "Validating rollback...");
    let validation = service.validate_rollback(&rollback).await?;
    for warning in &validation.warnings {
        warn(warning);
    }
    if !validation.is_valid() {
        for error in &validation.errors {
            output::error(error);
        }
        pool.close();
        return Err(CliError::Rollback(format!(
            "{} blocking problem(s) found",
            validation.errors.len()
        )));
    }

    if !args.dry_run && !args.skip_confirmation {
        warn("This will drop migrated data and may overwrite a database from a backup!");
        output::newline();
        if !output::confirm("Are you sure you want to roll back?") {
            output::newline();
            output::info("Rollback cancelled.");
            pool.close();
            return Ok(Outcome::Success);
        }
    }

    output::step(2, 2, if args.dry_run { "Planning operations..." } else { "Rolling back..." });
    let result = service.rollback(&rollback, cancel).await?;
    pool.close();

    print_result(&result);
    Ok(if result.is_success {
        Outcome::Success
    } else if cancel.is_cancelled() {
        Outcome::Interrupted
    } else {
        Outcome::Failure
    })
}

/// Rollback configuration from flags.
///
/// Backups restore into PostgreSQL unless `--restore-mongo-data` is given.
pub fn rollback_config(args: &RollbackArgs) -> CliResult<RollbackConfig> {
    let mut rollback = RollbackConfig::new(&args.migration_id)
        .drop_tables(args.drop_tables)
        .dry_run(args.dry_run);

    let (connection, database, backup_type) = if args.restore_mongo_data {
        let connection = args.mongo_connection.clone().ok_or_else(|| {
            CliError::Config("--restore-mongo-data requires --mongo-connection".to_string())
        })?;
        if args.backup_file.is_none() && args.rollback_point.is_none() {
            return Err(CliError::Config(
                "--restore-mongo-data requires --backup-file or --rollback-point".to_string(),
            ));
        }
        (connection, args.mongo_database.clone(), BackupType::DocumentStore)
    } else {
        (args.postgres_connection.clone(), None, BackupType::Relational)
    };

    if let Some(path) = &args.backup_file {
        rollback = rollback
            .restore(path.clone(), connection, database)
            .backup_type(backup_type);
    } else if let Some(point) = &args.rollback_point {
        rollback = rollback.rollback_point(point.clone());
        rollback.restore_connection = Some(connection);
        rollback.restore_database = database;
        rollback.backup_type = Some(backup_type);
    }

    Ok(rollback)
}

fn print_result(result: &RollbackResult) {
    output::newline();
    output::section("Operations");
    for operation in &result.operations {
        let label = format!(
            "{} ({})",
            operation.step,
            output::format_duration(operation.duration)
        );
        if !operation.executed {
            output::list_item(&format!("{} [planned]", operation.step));
        } else {
            output::check_item(operation.is_success, &label);
        }
        if let Some(error) = &operation.error_message {
            output::dim(&format!("      {}", error));
        }
    }

    if result.integrity_verified {
        output::kv("Backup integrity", "verified");
    }
    if let Some(point) = &result.rollback_point {
        output::kv("Consumed rollback point", point);
    }

    output::newline();
    if result.dry_run {
        output::info("Dry run: nothing was changed.");
    } else if result.is_success {
        success(&format!(
            "Rolled back migration '{}' in {}",
            result.migration_id,
            output::format_duration(result.duration)
        ));
    } else {
        output::error(&format!(
            "Rollback failed: {}",
            result.error_message.as_deref().unwrap_or("one or more operations failed")
        ));
    }
}
