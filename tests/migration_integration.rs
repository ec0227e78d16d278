//! Integration tests for end-to-end migration runs.
//!
//! These tests drive the engine over the in-memory stores: repeated runs,
//! interruption and resume, the index phase and recovery of a failed run.

use std::sync::Arc;

use bson::{Document, doc};
use chrono::Utc;
use glint::migrate::process::ScriptedProcessRunner;
use glint::migrate::store::{IndexKeyKind, SourceIndex};
use glint::migrate::{
    BackupService, CheckpointRepository, CheckpointStatus, FailureType, InMemoryCheckpointRepository,
    InMemorySource, InMemoryTarget, MigrationState, ProcessOutput, RecoveryAttempt, RecoveryConfig,
};
use glint::prelude::*;
use glint::ErrorKind;
use pretty_assertions::assert_eq;

fn entries(n: i64) -> Vec<Document> {
    (0..n)
        .map(|i| {
            doc! {
                "_id": i,
                "type": "sgv",
                "sgv": 90 + (i % 120),
                "date": 1_700_000_000_000_i64 + i * 300_000,
                "device": "xdrip",
            }
        })
        .collect()
}

struct Harness {
    engine: MigrationEngine,
    target: Arc<InMemoryTarget>,
    repo: Arc<InMemoryCheckpointRepository>,
}

fn harness(source: InMemorySource) -> Harness {
    let target = Arc::new(InMemoryTarget::new());
    let repo = Arc::new(InMemoryCheckpointRepository::new());
    let engine = MigrationEngine::new(Arc::new(source), target.clone(), repo.clone());
    Harness {
        engine,
        target,
        repo,
    }
}

fn config(id: &str) -> MigrationConfig {
    MigrationConfig::new()
        .migration_id(id)
        .batch_size(100)
        .skip_index_creation(true)
        .retry(RetryPolicy::none())
}

/// Running the same migration twice with duplicate skipping leaves the
/// target unchanged
#[tokio::test]
async fn test_repeated_run_is_idempotent() {
    let source = InMemorySource::new("care")
        .with_collection("entries", entries(250))
        .with_collection(
            "treatments",
            vec![
                doc! { "_id": "t1", "eventType": "Meal Bolus", "insulin": 4.5, "carbs": 40, "created_at": "2024-01-01T08:00:00Z" },
                doc! { "_id": "t2", "eventType": "Correction Bolus", "insulin": 1.0, "created_at": "2024-01-01T10:00:00Z" },
            ],
        );
    let h = harness(source);
    let cfg = config("idempotent").skip_duplicates(true);

    let first = h.engine.migrate(&cfg, &CancellationToken::new()).await.unwrap();
    assert!(first.is_success, "{:?}", first.error_message);
    assert_eq!(first.statistics.documents_inserted, 252);
    let entries_rows = h.target.row_count("entries");
    let treatment_rows = h.target.row_count("treatments");

    let second = h.engine.migrate(&cfg, &CancellationToken::new()).await.unwrap();
    assert!(second.is_success, "{:?}", second.error_message);
    assert_eq!(second.statistics.documents_inserted, 0);
    assert_eq!(second.statistics.documents_skipped, 252);
    assert_eq!(h.target.row_count("entries"), entries_rows);
    assert_eq!(h.target.row_count("treatments"), treatment_rows);
    assert_eq!(entries_rows, 250);
}

/// Cancelling after four batches leaves a checkpoint at 4000; resuming
/// copies exactly the remaining 6000 documents
#[tokio::test]
async fn test_cancel_then_resume_completes_without_duplicates() {
    let h = harness(InMemorySource::new("care").with_collection("entries", entries(10_000)));
    let cfg = config("resumable").batch_size(1000);

    let cancel = CancellationToken::new();
    h.target.cancel_after_writes(4, cancel.clone());
    let interrupted = h.engine.migrate(&cfg, &cancel).await.unwrap();

    assert!(!interrupted.is_success);
    assert!(interrupted.is_cancelled());
    assert_eq!(interrupted.checkpoint_id.as_deref(), Some("resumable/entries"));

    let checkpoint = h
        .repo
        .get_checkpoint("resumable/entries")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(checkpoint.status, CheckpointStatus::Cancelled);
    assert_eq!(checkpoint.documents_processed, 4000);
    assert_eq!(h.target.row_count("entries"), 4000);

    let status = h.engine.status("resumable").await.unwrap();
    assert_eq!(status.documents_processed, 4000);
    assert_eq!(status.total_documents, 10_000);

    let resumed = h
        .engine
        .resume(&cfg, "resumable/entries", &CancellationToken::new())
        .await
        .unwrap();
    assert!(resumed.is_success, "{:?}", resumed.error_message);
    assert_eq!(resumed.statistics.documents_processed, 6000);
    assert_eq!(resumed.collections[0].resumed_from, 4000);

    let mut ids = h.target.original_ids("entries");
    assert_eq!(ids.len(), 10_000);
    ids.sort();
    ids.dedup();
    assert_eq!(ids.len(), 10_000);

    let status = h.engine.status("resumable").await.unwrap();
    assert_eq!(status.state, MigrationState::Completed);
}

/// A bare migration id resumes every incomplete collection
#[tokio::test]
async fn test_resume_by_migration_id() {
    let source = InMemorySource::new("care")
        .with_collection("entries", entries(300))
        .with_collection("food", vec![doc! { "_id": "f1", "name": "apple", "carbs": 14 }]);
    let h = harness(source);
    let cfg = config("by-id").parallelism(1);

    let cancel = CancellationToken::new();
    h.target.cancel_after_writes(1, cancel.clone());
    let interrupted = h.engine.migrate(&cfg, &cancel).await.unwrap();
    assert!(!interrupted.is_success);

    let resumed = h
        .engine
        .resume(&cfg, "by-id", &CancellationToken::new())
        .await
        .unwrap();
    assert!(resumed.is_success, "{:?}", resumed.error_message);
    assert_eq!(h.target.row_count("entries"), 300);
    assert_eq!(h.target.row_count("foods"), 1);
}

/// Source indexes turn into target indexes once the data is copied
#[tokio::test]
async fn test_index_phase_builds_recommendations() {
    let source = InMemorySource::new("care").with_collection("entries", entries(50));
    source.set_indexes(
        "entries",
        vec![SourceIndex {
            name: "type_1_date_-1".to_string(),
            keys: vec![
                ("type".to_string(), IndexKeyKind::Ascending),
                ("date".to_string(), IndexKeyKind::Descending),
            ],
            unique: false,
            sparse: false,
            partial_filter: None,
            usage_ops: Some(1200),
        }],
    );
    let h = harness(source);
    let cfg = config("indexed").skip_index_creation(false);

    let result = h.engine.migrate(&cfg, &CancellationToken::new()).await.unwrap();
    assert!(result.is_success, "{:?}", result.error_message);

    let report = result.indexes.expect("index phase ran");
    assert!(!report.deferred);
    assert!(!report.recommended.is_empty());
    assert!(report.recommended.iter().all(|s| s.table_name == "entries"));
    assert_eq!(report.failed_count(), 0);
    assert_eq!(h.target.created_indexes().len(), report.created.len());
}

/// Deferred index creation reports recommendations without building them
#[tokio::test]
async fn test_deferred_index_creation() {
    let source = InMemorySource::new("care").with_collection("entries", entries(10));
    source.set_indexes(
        "entries",
        vec![SourceIndex {
            name: "date_-1".to_string(),
            keys: vec![("date".to_string(), IndexKeyKind::Descending)],
            unique: false,
            sparse: false,
            partial_filter: None,
            usage_ops: None,
        }],
    );
    let h = harness(source);
    let cfg = config("deferred")
        .skip_index_creation(false)
        .defer_index_creation(true);

    let result = h.engine.migrate(&cfg, &CancellationToken::new()).await.unwrap();
    let report = result.indexes.expect("index phase ran");
    assert!(report.deferred);
    assert!(!report.recommended.is_empty());
    assert!(report.created.is_empty());
    assert!(h.target.created_indexes().is_empty());
}

/// A run that exhausted its retries is classified and resumed by recovery
/// with the settings it was started with
#[tokio::test]
async fn test_recovery_resumes_failed_migration() {
    let h = harness(InMemorySource::new("care").with_collection("entries", entries(120)));
    let cfg = config("flaky").checkpoint_interval(1);

    h.target.fail_next_writes(u32::MAX);
    let failed = h.engine.migrate(&cfg, &CancellationToken::new()).await.unwrap();
    assert!(!failed.is_success);
    assert_eq!(failed.error_kind, Some(ErrorKind::Transient));
    h.target.fail_next_writes(0);

    let runner = ScriptedProcessRunner::new(|_| Ok(ProcessOutput::success("")));
    let service = RecoveryService::new(h.engine, BackupService::new(Arc::new(runner)));

    let analysis = service.analyze_failure("flaky").await.unwrap();
    assert_eq!(analysis.failure_type, FailureType::Timeout);
    assert!(analysis.can_resume);
    assert_eq!(analysis.incomplete_collections, vec!["entries"]);
    assert_eq!(
        analysis.candidates.first().map(|c| c.name.as_str()),
        Some("resume-from-checkpoint")
    );

    let result = service
        .recover(&RecoveryConfig::new("flaky"), None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.is_success, "{:?}", result.error_message);
    assert_eq!(result.attempts, 1);
    assert_eq!(result.failure_type, Some(FailureType::Timeout));
    assert_eq!(h.target.row_count("entries"), 120);

    let attempts = h.repo.list_recovery_attempts().await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert!(attempts[0].succeeded);
}

/// Analysis of a failure does not change when nothing new happened, and a
/// successful recovery elsewhere only raises the likelihood
#[tokio::test]
async fn test_failure_analysis_is_stable() {
    let h = harness(InMemorySource::new("care").with_collection("entries", entries(40)));
    h.target.set_writes_broken(true);
    let failed = h
        .engine
        .migrate(&config("exhausted"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!failed.is_success);

    let runner = ScriptedProcessRunner::new(|_| Ok(ProcessOutput::success("")));
    let service = RecoveryService::new(h.engine, BackupService::new(Arc::new(runner)));

    let first = service.analyze_failure("exhausted").await.unwrap();
    let second = service.analyze_failure("exhausted").await.unwrap();
    assert_eq!(first.failure_type, FailureType::ResourceExhaustion);
    assert_eq!(first.failure_type, second.failure_type);
    assert_eq!(first.recovery_likelihood, second.recovery_likelihood);
    assert_eq!(
        first.candidates.iter().map(|c| &c.name).collect::<Vec<_>>(),
        second.candidates.iter().map(|c| &c.name).collect::<Vec<_>>()
    );

    h.repo
        .record_recovery_attempt(&RecoveryAttempt {
            migration_id: "exhausted".to_string(),
            strategy: "retry-with-adjusted-parameters".to_string(),
            failure_type: FailureType::ResourceExhaustion,
            succeeded: true,
            started_at: Utc::now(),
            duration_ms: 40,
        })
        .await
        .unwrap();
    let third = service.analyze_failure("exhausted").await.unwrap();
    assert_eq!(third.failure_type, first.failure_type);
    assert!(third.recovery_likelihood >= first.recovery_likelihood);
}

/// Unknown migrations have nothing to analyze
#[tokio::test]
async fn test_analysis_of_unknown_migration() {
    let h = harness(InMemorySource::new("care"));
    let runner = ScriptedProcessRunner::new(|_| Ok(ProcessOutput::success("")));
    let service = RecoveryService::new(h.engine, BackupService::new(Arc::new(runner)));
    assert!(service.analyze_failure("never-ran").await.is_err());
}

/// A recovery attempt that copies part of the remainder and then fails
/// again keeps the classification and does not lower the likelihood
#[tokio::test]
async fn test_partial_recovery_keeps_classification() {
    let h = harness(InMemorySource::new("care").with_collection("entries", entries(300)));
    let cfg = config("partial").checkpoint_interval(1);

    h.target.fail_next_writes(u32::MAX);
    let failed = h.engine.migrate(&cfg, &CancellationToken::new()).await.unwrap();
    assert!(!failed.is_success);
    h.target.fail_next_writes(0);

    let runner = ScriptedProcessRunner::new(|_| Ok(ProcessOutput::success("")));
    let service = RecoveryService::new(h.engine, BackupService::new(Arc::new(runner)));
    let before = service.analyze_failure("partial").await.unwrap();
    assert_eq!(before.failure_type, FailureType::Timeout);
    assert_eq!(before.documents_processed, 0);

    h.target.fail_writes_after(1, u32::MAX);
    let partial = service
        .recover(
            &RecoveryConfig::new("partial").max_retry_attempts(1),
            None,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
    assert!(!partial.is_success);
    assert_eq!(partial.attempts, 1);
    assert!(partial.can_resume_migration);
    assert_eq!(h.target.row_count("entries"), 100);

    let after = service.analyze_failure("partial").await.unwrap();
    assert_eq!(after.failure_type, before.failure_type);
    assert_eq!(after.documents_processed, 100);
    assert!(after.recovery_likelihood >= before.recovery_likelihood);

    h.target.fail_next_writes(0);
    let finished = service
        .recover(&RecoveryConfig::new("partial"), None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(finished.is_success, "{:?}", finished.error_message);
    assert_eq!(h.target.row_count("entries"), 300);
}

/// A run that failed while counting its second collection is recovered in
/// full, not just the collections it had prepared
#[tokio::test]
async fn test_recovery_after_failed_planning() {
    let source = InMemorySource::new("care")
        .with_collection("entries", entries(20))
        .with_collection("food", vec![doc! { "_id": "f1", "name": "apple", "carbs": 14 }]);
    source.fail_next_counts("food", 1);
    let h = harness(source);

    let failed = h
        .engine
        .migrate(&config("planning"), &CancellationToken::new())
        .await
        .unwrap();
    assert!(!failed.is_success);
    assert_eq!(failed.error_kind, Some(ErrorKind::Connectivity));

    let runner = ScriptedProcessRunner::new(|_| Ok(ProcessOutput::success("")));
    let service = RecoveryService::new(h.engine, BackupService::new(Arc::new(runner)));
    let analysis = service.analyze_failure("planning").await.unwrap();
    assert_eq!(analysis.failure_type, FailureType::ConnectivityLoss);
    assert_eq!(analysis.incomplete_collections, vec!["entries", "food"]);

    let result = service
        .recover(&RecoveryConfig::new("planning"), None, &CancellationToken::new())
        .await
        .unwrap();
    assert!(result.is_success, "{:?}", result.error_message);
    assert_eq!(h.target.row_count("entries"), 20);
    assert_eq!(h.target.row_count("foods"), 1);
}
