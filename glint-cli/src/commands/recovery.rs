//! `glint recovery` - Classify a failed migration and recover it.

use glint_migrate::{FailureAnalysis, RecoveryConfig, RecoveryResult, RecoveryService, StatusRegistry};
use tokio_util::sync::CancellationToken;

use crate::cli::RecoveryArgs;
use crate::commands::{self, Outcome};
use crate::config::Config;
use crate::error::{CliError, CliResult};
use crate::output::{self, success, warn};

/// Run the recovery command
pub async fn run(args: RecoveryArgs, config: &Config, cancel: &CancellationToken) -> CliResult<Outcome> {
    output::header(if args.analyze_only { "Recovery (analysis)" } else { "Recovery" });

    let recovery = recovery_config(&args, config);
    recovery.validate()?;
    output::kv("Migration", &recovery.migration_id);
    output::newline();

    let source = commands::connect_source(&args.mongo).await?;
    let pool = commands::connect_pool(&args.postgres_connection, 2, 1)?;
    let engine = commands::engine(source, &pool, StatusRegistry::new());
    let service = RecoveryService::new(engine, commands::backup_service(config));

    if args.analyze_only {
        let analysis = service.analyze_failure(&recovery.migration_id).await;
        pool.close();
        print_analysis(&analysis.map_err(|e| CliError::Recovery(e.to_string()))?);
        return Ok(Outcome::Success);
    }

    output::step(1, 1, "Recovering...");
    let result = service.recover(&recovery, None, cancel).await?;
    pool.close();

    print_result(&result);
    Ok(Outcome::from_result(result.is_success, result.error_kind))
}

/// Recovery configuration from glint.toml, overridden by flags.
pub fn recovery_config(args: &RecoveryArgs, config: &Config) -> RecoveryConfig {
    let mut recovery = config
        .recovery_config(&args.migration_id)
        .postgres_connection(args.postgres_connection.clone());

    if let Some(strategy) = &args.recovery_strategy {
        recovery = recovery.strategy(strategy.clone());
    }
    if let Some(attempts) = args.max_retry_attempts {
        recovery = recovery.max_retry_attempts(attempts);
    }
    if args.create_backup {
        recovery = recovery.create_backup(config.backup.directory.clone());
    }
    if let Some(path) = &args.backup_file {
        recovery = recovery.backup_file(path.clone());
    }
    if args.skip_problematic_data {
        recovery = recovery.allow_data_skipping(config.recovery.max_data_skip_percentage);
    }
    recovery
}

fn print_analysis(analysis: &FailureAnalysis) {
    output::section("Failure analysis");
    output::kv("Failure type", &analysis.failure_type.to_string());
    if let Some(error) = &analysis.last_error {
        output::kv("Last error", error);
    }
    output::kv(
        "Progress",
        &format!(
            "{}/{} documents",
            analysis.documents_processed, analysis.total_documents
        ),
    );
    if !analysis.incomplete_collections.is_empty() {
        output::kv("Incomplete", &analysis.incomplete_collections.join(", "));
    }
    output::kv("Recovery likelihood", &format!("{}%", analysis.recovery_likelihood));
    if let Some(checkpoint) = &analysis.resume_checkpoint_id {
        output::kv("Resume checkpoint", checkpoint);
    }

    output::newline();
    output::section("Candidate strategies");
    if analysis.candidates.is_empty() {
        output::list_item("none applicable");
    }
    for (rank, candidate) in analysis.candidates.iter().enumerate() {
        output::list_item(&format!(
            "{}. {} (success rate {:.0}%, ~{})",
            rank + 1,
            candidate.name,
            candidate.success_rate * 100.0,
            output::format_duration(candidate.estimated_duration)
        ));
    }
}

fn print_result(result: &RecoveryResult) {
    output::newline();
    if let Some(failure_type) = &result.failure_type {
        output::kv("Failure type", &failure_type.to_string());
    }
    if let Some(strategy) = &result.strategy {
        output::kv("Strategy", strategy);
    }
    output::kv("Attempts", &result.attempts.to_string());
    if result.documents_skipped > 0 {
        output::kv("Documents skipped", &result.documents_skipped.to_string());
    }
    if let Some(path) = &result.backup_path {
        output::kv("Pre-recovery backup", &path.display().to_string());
    }
    if let Some(migration) = &result.migration {
        output::kv("Rerun", &migration.summary());
    }
    output::kv("Duration", &output::format_duration(result.duration));

    output::newline();
    if result.is_success {
        success("Recovery succeeded");
        return;
    }

    output::error(&format!(
        "Recovery failed: {}",
        result.error_message.as_deref().unwrap_or("unknown error")
    ));
    if result.can_resume_migration {
        if let Some(checkpoint) = &result.resume_checkpoint_id {
            warn(&format!(
                "The migration can still be resumed: `glint migrate --resume {}`",
                checkpoint
            ));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;
    use std::path::PathBuf;

    fn parse(extra: &[&str]) -> RecoveryArgs {
        let mut argv = vec![
            "glint",
            "recovery",
            "--migration-id",
            "m1",
            "--mongo-connection",
            "mongodb://localhost",
            "--mongo-database",
            "care",
            "--postgres-connection",
            "postgresql://localhost/care",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Recovery(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_defaults() {
        let recovery = recovery_config(&parse(&[]), &Config::default());
        assert_eq!(recovery.migration_id, "m1");
        assert!(recovery.strategy.is_none());
        assert!(!recovery.create_backup);
        assert!(!recovery.allow_data_skipping);
        assert_eq!(
            recovery.postgres_connection.as_deref(),
            Some("postgresql://localhost/care")
        );
        assert!(recovery.validate().is_ok());
    }

    #[test]
    fn test_flags() {
        let config: Config =
            toml::from_str("[backup]\ndirectory = \"/srv/dumps\"\n[recovery]\nmax_data_skip_percentage = 2.5\n")
                .unwrap();
        let recovery = recovery_config(
            &parse(&[
                "--recovery-strategy",
                "resume-from-checkpoint",
                "--max-retry-attempts",
                "7",
                "--create-backup",
                "--skip-problematic-data",
            ]),
            &config,
        );
        assert_eq!(recovery.strategy.as_deref(), Some("resume-from-checkpoint"));
        assert_eq!(recovery.max_retry_attempts, 7);
        assert!(recovery.create_backup);
        assert_eq!(recovery.backup_directory, PathBuf::from("/srv/dumps"));
        assert!(recovery.allow_data_skipping);
        assert_eq!(recovery.max_data_skip_percentage, 2.5);
    }
}
