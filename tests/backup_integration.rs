//! Integration tests for backup creation, verification and retention.
//!
//! The dump tools are replaced by a scripted runner that writes a minimal
//! archive, so these tests exercise everything but the external binaries.

use std::path::Path;
use std::sync::Arc;

use glint::migrate::backup::{MONGO_ARCHIVE_MAGIC, sidecar_path};
use glint::migrate::process::ScriptedProcessRunner;
use glint::migrate::{BackupType, ProcessOutput, RetentionPolicy};
use glint::prelude::*;
use pretty_assertions::assert_eq;
use tempfile::TempDir;

/// A mongodump stand-in reporting `documents` dumped from `entries`.
fn fake_mongodump(documents: u64) -> ScriptedProcessRunner {
    ScriptedProcessRunner::new(move |cmd| {
        if cmd.args.iter().any(|a| a == "--version") {
            return Ok(ProcessOutput::success(""));
        }
        let path = cmd.flag_value("--archive").unwrap_or_default();
        let mut bytes = MONGO_ARCHIVE_MAGIC.to_vec();
        bytes.extend_from_slice(b"entries payload");
        std::fs::write(path, bytes)?;
        Ok(ProcessOutput::success(format!(
            "2024-01-01T00:00:00.000+0000\tdone dumping care.entries ({documents} documents)\n"
        )))
    })
}

fn write_archive(dir: &Path, name: &str) {
    let mut bytes = MONGO_ARCHIVE_MAGIC.to_vec();
    bytes.extend_from_slice(name.as_bytes());
    std::fs::write(dir.join(name), bytes).unwrap();
}

/// A fresh backup verifies; flipping one byte breaks the checksum
#[tokio::test]
async fn test_checksum_detects_tampering() {
    let dir = TempDir::new().unwrap();
    let service = BackupService::new(Arc::new(fake_mongodump(12)));
    let config = BackupConfig::document_store("mongodb://localhost", "care", dir.path());

    let result = service
        .create_backup(&config, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.is_success, "{:?}", result.error_message);
    let metadata = result.metadata.unwrap();
    assert_eq!(metadata.checksum.len(), 64);
    assert_eq!(metadata.collection_count, 1);
    assert!(sidecar_path(&metadata.file_path).exists());

    let verification = service
        .verify_backup(&metadata.file_path, BackupType::DocumentStore)
        .await;
    assert!(verification.is_valid(), "{:?}", verification.errors);

    let mut bytes = std::fs::read(&metadata.file_path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0xff;
    std::fs::write(&metadata.file_path, bytes).unwrap();

    let verification = service
        .verify_backup(&metadata.file_path, BackupType::DocumentStore)
        .await;
    assert!(!verification.is_valid());
    assert!(verification.errors.iter().any(|e| e.contains("Checksum mismatch")));
}

/// Backups of an empty database succeed and count no collections
#[tokio::test]
async fn test_empty_database_backup() {
    let dir = TempDir::new().unwrap();
    let service = BackupService::new(Arc::new(fake_mongodump(0)));
    let config = BackupConfig::document_store("mongodb://localhost", "care", dir.path())
        .compress(true)
        .verify(true);

    let result = service
        .create_backup(&config, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.is_success, "{:?}", result.error_message);
    let metadata = result.metadata.unwrap();
    assert_eq!(metadata.collection_count, 0);
    assert!(metadata.is_compressed);
    assert!(result.verification.unwrap().is_valid());
}

/// Retention keeps the five newest of eight backups
#[tokio::test]
async fn test_retention_keeps_newest() {
    let dir = TempDir::new().unwrap();
    for day in 1..=8 {
        write_archive(dir.path(), &format!("care_2024010{day}_120000.archive"));
    }

    let service = BackupService::new(Arc::new(fake_mongodump(0)));
    let listed = service.list_backups(dir.path(), None).await.unwrap();
    assert_eq!(listed.len(), 8);
    assert!(listed[0].path.ends_with("care_20240108_120000.archive"));

    let cleanup = service
        .cleanup_backups(dir.path(), &RetentionPolicy::new().max_count(5))
        .await
        .unwrap();
    assert!(cleanup.is_success());
    assert_eq!(cleanup.removed.len(), 3);
    assert!(cleanup.bytes_freed > 0);

    let mut kept: Vec<String> = service
        .list_backups(dir.path(), Some(BackupType::DocumentStore))
        .await
        .unwrap()
        .into_iter()
        .filter_map(|b| b.path.file_name().map(|n| n.to_string_lossy().into_owned()))
        .collect();
    kept.sort();
    assert_eq!(
        kept,
        vec![
            "care_20240104_120000.archive",
            "care_20240105_120000.archive",
            "care_20240106_120000.archive",
            "care_20240107_120000.archive",
            "care_20240108_120000.archive",
        ]
    );
}

/// A size ceiling removes the oldest backups until the rest fit
#[tokio::test]
async fn test_retention_by_total_size() {
    let dir = TempDir::new().unwrap();
    for day in 1..=4 {
        write_archive(dir.path(), &format!("care_2024020{day}_000000.archive"));
    }
    let size = std::fs::metadata(dir.path().join("care_20240201_000000.archive"))
        .unwrap()
        .len();

    let service = BackupService::new(Arc::new(fake_mongodump(0)));
    let cleanup = service
        .cleanup_backups(
            dir.path(),
            &RetentionPolicy::new().max_total_size_bytes(size * 2),
        )
        .await
        .unwrap();
    assert_eq!(cleanup.removed.len(), 2);
    assert_eq!(cleanup.retained.len(), 2);
    assert!(cleanup.retained[0].ends_with("care_20240204_000000.archive"));
}

/// Cleanup of a missing directory is a no-op
#[tokio::test]
async fn test_cleanup_missing_directory() {
    let dir = TempDir::new().unwrap();
    let service = BackupService::new(Arc::new(fake_mongodump(0)));
    let cleanup = service
        .cleanup_backups(&dir.path().join("absent"), &RetentionPolicy::new().max_count(1))
        .await
        .unwrap();
    assert!(cleanup.removed.is_empty());
    assert!(cleanup.is_success());
}

/// When the sidecar cannot be written, no backup file is left behind
#[tokio::test]
async fn test_unwritable_sidecar_leaves_no_backup() {
    for (compress, name) in [(false, "care.archive"), (true, "care.archive.gz")] {
        let dir = TempDir::new().unwrap();
        let sidecar = format!("{name}.metadata");
        // A directory in the sidecar's place makes the final rename fail.
        std::fs::create_dir(dir.path().join(&sidecar)).unwrap();

        let service = BackupService::new(Arc::new(fake_mongodump(3)));
        let config = BackupConfig::document_store("mongodb://localhost", "care", dir.path())
            .filename(name)
            .compress(compress);
        let result = service
            .create_backup(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.is_success);
        assert!(result.metadata.is_none());
        assert!(!dir.path().join(name).exists());

        let left: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(left, vec![sidecar]);
        assert!(service.list_backups(dir.path(), None).await.unwrap().is_empty());
    }
}
