//! Integration tests for the glint CLI

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Get the glint binary with no connection variables leaking in
#[allow(deprecated)]
fn glint_cmd() -> Command {
    let mut cmd = Command::cargo_bin("glint").unwrap();
    cmd.env_remove("GLINT_MONGO_CONNECTION")
        .env_remove("GLINT_MONGO_DATABASE")
        .env_remove("GLINT_POSTGRES_CONNECTION")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_help_command() {
    glint_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("MongoDB to PostgreSQL"))
        .stdout(predicate::str::contains("migrate"))
        .stdout(predicate::str::contains("rollback"))
        .stdout(predicate::str::contains("backup"))
        .stdout(predicate::str::contains("recovery"))
        .stdout(predicate::str::contains("test-connections"));
}

#[test]
fn test_version_flag() {
    glint_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_migrate_help() {
    glint_cmd()
        .args(["migrate", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--mongo-connection"))
        .stdout(predicate::str::contains("--skip-duplicates"))
        .stdout(predicate::str::contains("--defer-index-creation"))
        .stdout(predicate::str::contains("--resume"))
        .stdout(predicate::str::contains("GLINT_POSTGRES_CONNECTION"));
}

#[test]
fn test_rollback_help() {
    glint_cmd()
        .args(["rollback", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--dry-run"))
        .stdout(predicate::str::contains("--restore-mongo-data"));
}

#[test]
fn test_recovery_help() {
    glint_cmd()
        .args(["recovery", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--recovery-strategy"))
        .stdout(predicate::str::contains("--analyze-only"));
}

#[test]
fn test_migrate_requires_connections() {
    glint_cmd()
        .arg("migrate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--mongo-connection"));
}

#[test]
fn test_connections_from_environment() {
    // Required flags satisfied through the environment; batch size 0 is
    // rejected before anything connects.
    glint_cmd()
        .env("GLINT_MONGO_CONNECTION", "mongodb://127.0.0.1:1")
        .env("GLINT_MONGO_DATABASE", "care")
        .env("GLINT_POSTGRES_CONNECTION", "postgresql://127.0.0.1:1/care")
        .args(["migrate", "--batch-size", "0"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("batch_size"));
}

#[test]
fn test_test_connections_without_stores() {
    glint_cmd()
        .arg("test-connections")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("nothing to test"));
}

#[test]
fn test_test_connections_unreachable_postgres() {
    glint_cmd()
        .args([
            "test-connections",
            "--postgres-connection",
            "postgresql://glint@127.0.0.1:1/care",
            "--timeout",
            "2",
        ])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("relational store"))
        .stderr(predicate::str::contains("One or more connections failed"));
}

#[test]
fn test_invalid_config_file() {
    let temp_dir = TempDir::new().unwrap();
    let config = temp_dir.path().join("glint.toml");
    fs::write(&config, "[migration\nbatch_size = ").unwrap();

    glint_cmd()
        .current_dir(temp_dir.path())
        .args(["test-connections"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Failed to parse TOML"));
}

#[test]
fn test_backup_with_missing_tool_fails() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("glint.toml"),
        "[backup.tools]\nmongodump = \"/nonexistent/glint-test/mongodump\"\n",
    )
    .unwrap();

    glint_cmd()
        .current_dir(temp_dir.path())
        .args([
            "backup",
            "--mongo-connection",
            "mongodb://127.0.0.1:1",
            "--mongo-database",
            "care",
            "--output-directory",
            "dumps",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Backup failed"));

    let leftovers: Vec<_> = fs::read_dir(temp_dir.path().join("dumps"))
        .map(|entries| entries.filter_map(Result::ok).collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "no partial backup should remain");
}

#[test]
fn test_rollback_restore_mongo_requires_connection() {
    glint_cmd()
        .args([
            "rollback",
            "--migration-id",
            "m1",
            "--postgres-connection",
            "postgresql://127.0.0.1:1/care",
            "--backup-file",
            "care.archive",
            "--restore-mongo-data",
        ])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("--mongo-connection"));
}
