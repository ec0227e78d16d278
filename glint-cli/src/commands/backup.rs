//! `glint backup` - Dump MongoDB with mongodump.

use glint_migrate::{BackupConfig, BackupResult, RetentionPolicy};
use tokio_util::sync::CancellationToken;

use crate::cli::BackupArgs;
use crate::commands::{self, Outcome};
use crate::config::Config;
use crate::error::CliResult;
use crate::output::{self, success, warn};

/// Run the backup command
pub async fn run(args: BackupArgs, config: &Config, cancel: &CancellationToken) -> CliResult<Outcome> {
    output::header("Backup");

    let backup_config = backup_config(&args, config);
    output::kv("Database", &backup_config.database);
    output::kv("Directory", &backup_config.output_directory.display().to_string());
    output::kv("Tool", &config.backup.tools.mongodump);
    output::newline();

    let service = commands::backup_service(config);
    let total_steps = if args.retain.is_some() { 2 } else { 1 };

    output::step(1, total_steps, "Dumping database...");
    let result = service.create_backup(&backup_config, cancel).await?;
    print_result(&result);
    if !result.is_success {
        return Ok(Outcome::from_result(false, result.error_kind));
    }

    if let Some(keep) = args.retain {
        output::step(2, total_steps, &format!("Applying retention (keep {})...", keep));
        let policy = RetentionPolicy {
            max_count: Some(keep),
            ..config.backup.retention.clone()
        };
        let cleanup = service
            .cleanup_backups(&backup_config.output_directory, &policy)
            .await?;
        for path in &cleanup.removed {
            output::list_item(&format!("removed {}", path.display()));
        }
        for error in &cleanup.errors {
            warn(error);
        }
        output::kv("Freed", &output::format_bytes(cleanup.bytes_freed));
        if !cleanup.is_success() {
            output::newline();
            output::error("Retention cleanup did not complete");
            return Ok(Outcome::Failure);
        }
    }

    output::newline();
    success("Backup complete");
    Ok(Outcome::Success)
}

/// Backup configuration from flags and glint.toml.
pub fn backup_config(args: &BackupArgs, config: &Config) -> BackupConfig {
    let directory = args
        .output_directory
        .clone()
        .unwrap_or_else(|| config.backup.directory.clone());

    let mut backup = BackupConfig::document_store(
        &args.mongo.mongo_connection,
        &args.mongo.mongo_database,
        directory,
    )
    .collections(args.collections.clone())
    .compress(args.compress)
    .verify(args.verify)
    .timeout(config.backup.timeout());

    if let Some(name) = &args.backup_filename {
        backup = backup.filename(name.clone());
    }
    backup
}

fn print_result(result: &BackupResult) {
    if let Some(metadata) = &result.metadata {
        output::kv("File", &metadata.file_path.display().to_string());
        output::kv("Size", &output::format_bytes(metadata.file_size_bytes));
        output::kv("Collections", &metadata.collection_count.to_string());
        output::kv("SHA-256", &metadata.checksum);
        if let Some(version) = &metadata.tool_version {
            output::kv("Tool version", version);
        }
    }
    output::kv("Duration", &output::format_duration(result.duration));

    if let Some(verification) = &result.verification {
        output::check_item(verification.is_valid(), "verification");
        for error in &verification.errors {
            output::dim(&format!("      {}", error));
        }
    }

    if let Some(message) = &result.error_message {
        output::newline();
        output::error(&format!("Backup failed: {}", message));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cli::{Cli, Command};
    use clap::Parser;
    use std::path::PathBuf;

    fn parse(extra: &[&str]) -> BackupArgs {
        let mut argv = vec![
            "glint",
            "backup",
            "--mongo-connection",
            "mongodb://localhost",
            "--mongo-database",
            "care",
        ];
        argv.extend_from_slice(extra);
        match Cli::try_parse_from(argv).unwrap().command {
            Command::Backup(args) => args,
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn test_directory_defaults_to_config() {
        let config: Config = toml::from_str("[backup]\ndirectory = \"/srv/dumps\"\n").unwrap();
        let backup = backup_config(&parse(&[]), &config);
        assert_eq!(backup.output_directory, PathBuf::from("/srv/dumps"));
        assert!(!backup.compress);
        assert!(backup.filename.is_none());
    }

    #[test]
    fn test_flags_applied() {
        let backup = backup_config(
            &parse(&[
                "--output-directory",
                "out",
                "--backup-filename",
                "nightly.archive",
                "--collections",
                "entries,food",
                "--compress",
                "--verify",
            ]),
            &Config::default(),
        );
        assert_eq!(backup.output_directory, PathBuf::from("out"));
        assert_eq!(backup.filename.as_deref(), Some("nightly.archive"));
        assert_eq!(backup.collections, vec!["entries", "food"]);
        assert!(backup.compress && backup.verify);
    }
}
