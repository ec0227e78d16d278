//! Point-in-time backups of either store.
//!
//! Dumps are produced by the stores' own tools (`mongodump --archive`,
//! `pg_dump --format=custom`) through a [`ProcessRunner`]. Each backup file
//! gets exactly one JSON sidecar, `<file>.metadata`, recording its SHA-256
//! checksum and what it contains.

use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDateTime, Utc};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{ErrorKind, MigrateResult, MigrationError};
use crate::process::{ProcessCommand, ProcessRunner};
use crate::validation::ValidationResult;

/// Leading bytes of a gzip stream.
pub const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Leading bytes of a mongodump archive (`0x8199e26d`, little endian).
pub const MONGO_ARCHIVE_MAGIC: [u8; 4] = 0x8199_e26d_u32.to_le_bytes();

/// Leading bytes of a `pg_dump --format=custom` file.
pub const PG_DUMP_MAGIC: &[u8; 5] = b"PGDMP";

const SIDECAR_EXTENSION: &str = "metadata";

/// Which store a backup was taken from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BackupType {
    /// MongoDB archive.
    DocumentStore,
    /// PostgreSQL dump.
    Relational,
}

impl BackupType {
    /// Default file extension, without compression suffix.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::DocumentStore => "archive",
            Self::Relational => "dump",
        }
    }

    /// Guess the type from a file name.
    pub fn from_path(path: &Path) -> Option<Self> {
        let name = path.file_name()?.to_str()?;
        let name = name.strip_suffix(".gz").unwrap_or(name);
        if name.ends_with(".archive") {
            Some(Self::DocumentStore)
        } else if name.ends_with(".dump") || name.ends_with(".sql") {
            Some(Self::Relational)
        } else {
            None
        }
    }
}

impl std::fmt::Display for BackupType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::DocumentStore => write!(f, "document-store"),
            Self::Relational => write!(f, "relational"),
        }
    }
}

/// Names or paths of the external dump and restore tools.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupTools {
    /// `mongodump`
    pub mongodump: String,
    /// `mongorestore`
    pub mongorestore: String,
    /// `pg_dump`
    pub pg_dump: String,
    /// `pg_restore`
    pub pg_restore: String,
    /// `psql`, used to replay plain SQL dumps.
    pub psql: String,
}

impl Default for BackupTools {
    fn default() -> Self {
        Self {
            mongodump: "mongodump".to_string(),
            mongorestore: "mongorestore".to_string(),
            pg_dump: "pg_dump".to_string(),
            pg_restore: "pg_restore".to_string(),
            psql: "psql".to_string(),
        }
    }
}

/// What to back up and where.
#[derive(Debug, Clone)]
pub struct BackupConfig {
    /// Store to dump.
    pub backup_type: BackupType,
    /// Connection string passed to the dump tool.
    pub connection_string: String,
    /// Database name.
    pub database: String,
    /// Directory receiving the backup.
    pub output_directory: PathBuf,
    /// Explicit file name; generated when `None`.
    pub filename: Option<String>,
    /// Collections (or tables) to include. Empty means all.
    pub collections: Vec<String>,
    /// Gzip the dump.
    pub compress: bool,
    /// Verify the backup after writing it.
    pub verify: bool,
    /// Kill the dump tool after this long.
    pub timeout: Duration,
}

impl BackupConfig {
    /// Document-store backup of a database.
    pub fn document_store(
        connection_string: impl Into<String>,
        database: impl Into<String>,
        output_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backup_type: BackupType::DocumentStore,
            connection_string: connection_string.into(),
            database: database.into(),
            output_directory: output_directory.into(),
            filename: None,
            collections: Vec::new(),
            compress: false,
            verify: false,
            timeout: Duration::from_secs(3600),
        }
    }

    /// Relational backup of a database.
    pub fn relational(
        connection_string: impl Into<String>,
        database: impl Into<String>,
        output_directory: impl Into<PathBuf>,
    ) -> Self {
        Self {
            backup_type: BackupType::Relational,
            ..Self::document_store(connection_string, database, output_directory)
        }
    }

    /// Use an explicit file name.
    pub fn filename(mut self, filename: impl Into<String>) -> Self {
        self.filename = Some(filename.into());
        self
    }

    /// Restrict to the given collections.
    pub fn collections<I, S>(mut self, collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.collections = collections.into_iter().map(Into::into).collect();
        self
    }

    /// Enable gzip compression.
    pub fn compress(mut self, compress: bool) -> Self {
        self.compress = compress;
        self
    }

    /// Verify after writing.
    pub fn verify(mut self, verify: bool) -> Self {
        self.verify = verify;
        self
    }

    /// Set the dump timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn target_path(&self, now: DateTime<Utc>) -> PathBuf {
        let name = match &self.filename {
            Some(name) => name.clone(),
            None => {
                let base = format!(
                    "{}_{}.{}",
                    self.database,
                    now.format("%Y%m%d_%H%M%S"),
                    self.backup_type.extension()
                );
                if self.compress { format!("{base}.gz") } else { base }
            }
        };

        let mut path = self.output_directory.join(&name);
        let mut n = 1;
        while path.exists() {
            path = self.output_directory.join(format!("{n}_{name}"));
            n += 1;
        }
        path
    }
}

/// Sidecar contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupMetadata {
    /// Backup file.
    pub file_path: PathBuf,
    /// Store type.
    pub backup_type: BackupType,
    /// Creation time.
    pub created_at: DateTime<Utc>,
    /// File size in bytes.
    pub file_size_bytes: u64,
    /// Whether the file is gzip-compressed.
    pub is_compressed: bool,
    /// First line of `<tool> --version`.
    pub tool_version: Option<String>,
    /// SHA-256 of the file, lowercase hex.
    pub checksum: String,
    /// Collections (or tables) with at least one document dumped.
    pub collection_count: u64,
    /// Database name.
    pub database: String,
    /// Every collection (or table) the dump tool reported.
    pub collections: Vec<String>,
}

/// A backup found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupInfo {
    /// Backup file.
    pub path: PathBuf,
    /// Store type.
    pub backup_type: BackupType,
    /// Creation time (sidecar, else file name, else mtime).
    pub created_at: DateTime<Utc>,
    /// File size in bytes.
    pub file_size_bytes: u64,
    /// Whether the file is gzip-compressed.
    pub is_compressed: bool,
    /// Sidecar, when present and readable.
    pub metadata: Option<BackupMetadata>,
}

/// Outcome of [`BackupService::create_backup`].
#[derive(Debug, Clone)]
pub struct BackupResult {
    /// Whether a usable backup was written.
    pub is_success: bool,
    /// Metadata of the written backup.
    pub metadata: Option<BackupMetadata>,
    /// Failure description.
    pub error_message: Option<String>,
    /// Failure classification.
    pub error_kind: Option<ErrorKind>,
    /// Verification outcome when requested.
    pub verification: Option<ValidationResult>,
    /// Wall time.
    pub duration: Duration,
}

impl BackupResult {
    fn failed(err: &MigrationError, start: Instant) -> Self {
        Self {
            is_success: false,
            metadata: None,
            error_message: Some(err.to_string()),
            error_kind: Some(err.kind()),
            verification: None,
            duration: start.elapsed(),
        }
    }

    /// Path of the written backup.
    pub fn path(&self) -> Option<&Path> {
        self.metadata.as_ref().map(|m| m.file_path.as_path())
    }
}

/// Retention rules applied by [`BackupService::cleanup_backups`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionPolicy {
    /// Keep at most this many backups.
    pub max_count: Option<usize>,
    /// Remove backups older than this many seconds.
    pub max_age_secs: Option<u64>,
    /// Keep the retained set under this many bytes.
    pub max_total_size_bytes: Option<u64>,
}

impl RetentionPolicy {
    /// Policy that keeps everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `count` backups.
    pub fn max_count(mut self, count: usize) -> Self {
        self.max_count = Some(count);
        self
    }

    /// Remove backups older than `age`.
    pub fn max_age(mut self, age: Duration) -> Self {
        self.max_age_secs = Some(age.as_secs());
        self
    }

    /// Cap the total size.
    pub fn max_total_size_bytes(mut self, bytes: u64) -> Self {
        self.max_total_size_bytes = Some(bytes);
        self
    }
}

/// Outcome of [`BackupService::cleanup_backups`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupResult {
    /// Removed backup files (their sidecars were removed too).
    pub removed: Vec<PathBuf>,
    /// Backups kept.
    pub retained: Vec<PathBuf>,
    /// Bytes freed.
    pub bytes_freed: u64,
    /// Files that could not be removed.
    pub errors: Vec<String>,
}

impl CleanupResult {
    /// Whether every planned removal succeeded.
    pub fn is_success(&self) -> bool {
        self.errors.is_empty()
    }
}

/// Outcome of [`BackupService::restore_backup`].
#[derive(Debug, Clone)]
pub struct RestoreResult {
    /// Whether the restore tool succeeded.
    pub is_success: bool,
    /// Failure description.
    pub error_message: Option<String>,
    /// Failure classification.
    pub error_kind: Option<ErrorKind>,
    /// Wall time.
    pub duration: Duration,
}

/// Path of the sidecar for a backup file.
pub fn sidecar_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(SIDECAR_EXTENSION);
    PathBuf::from(name)
}

/// SHA-256 of a file, lowercase hex.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

/// Read the sidecar of a backup, if one exists.
pub fn read_sidecar(path: &Path) -> MigrateResult<Option<BackupMetadata>> {
    let sidecar = sidecar_path(path);
    if !sidecar.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(&sidecar)?;
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Write the sidecar of a backup. The file appears complete or not at all.
pub fn write_sidecar(metadata: &BackupMetadata) -> MigrateResult<()> {
    let json = serde_json::to_vec_pretty(metadata)?;
    let sidecar = sidecar_path(&metadata.file_path);
    let staged = suffixed(&sidecar, ".partial");
    std::fs::write(&staged, json)?;
    if let Err(err) = std::fs::rename(&staged, &sidecar) {
        let _ = std::fs::remove_file(&staged);
        return Err(err.into());
    }
    Ok(())
}

fn suffixed(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

async fn publish(staged: &Path, metadata: &BackupMetadata) -> MigrateResult<()> {
    tokio::fs::rename(staged, &metadata.file_path).await?;
    write_sidecar(metadata)
}

async fn discard(paths: &[&Path]) {
    for path in paths {
        let _ = tokio::fs::remove_file(path).await;
    }
}

async fn blocking<T, F>(f: F) -> MigrateResult<T>
where
    F: FnOnce() -> MigrateResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| MigrationError::other(format!("blocking task failed: {e}")))?
}

fn gzip_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut input = File::open(src)?;
    let mut encoder = GzEncoder::new(File::create(dst)?, Compression::default());
    io::copy(&mut input, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

fn gunzip_file(src: &Path, dst: &Path) -> io::Result<()> {
    let mut decoder = GzDecoder::new(File::open(src)?);
    let mut output = File::create(dst)?;
    io::copy(&mut decoder, &mut output)?;
    Ok(())
}

/// Leading bytes of a file; decompressed when the file is gzip.
fn read_signature(path: &Path) -> io::Result<(bool, Vec<u8>)> {
    let mut head = [0u8; 2];
    let mut file = File::open(path)?;
    let n = file.read(&mut head)?;
    let compressed = n == 2 && head == GZIP_MAGIC;

    let file = File::open(path)?;
    let mut buf = Vec::with_capacity(64);
    if compressed {
        GzDecoder::new(file).take(64).read_to_end(&mut buf)?;
    } else {
        file.take(64).read_to_end(&mut buf)?;
    }
    Ok((compressed, buf))
}

fn looks_like_sql(head: &[u8]) -> bool {
    let text = String::from_utf8_lossy(head);
    let text = text.trim_start();
    ["--", "SET ", "CREATE ", "BEGIN", "/*"]
        .iter()
        .any(|p| text.starts_with(p))
}

/// Collections reported by the dump tool, with the number reported non-empty.
fn parse_dumped_collections(backup_type: BackupType, stderr: &str) -> (Vec<String>, u64) {
    let mut names = Vec::new();
    let mut non_empty = 0;
    for line in stderr.lines() {
        match backup_type {
            BackupType::DocumentStore => {
                let Some(rest) = line.split("done dumping ").nth(1) else {
                    continue;
                };
                let (ns, count) = rest.split_once(" (").unwrap_or((rest, ""));
                let name = ns.split_once('.').map(|(_, c)| c).unwrap_or(ns).trim();
                let docs: u64 = count
                    .split_whitespace()
                    .next()
                    .and_then(|n| n.parse().ok())
                    .unwrap_or(0);
                if docs > 0 {
                    non_empty += 1;
                }
                names.push(name.to_string());
            }
            BackupType::Relational => {
                let Some(rest) = line.split("dumping contents of table ").nth(1) else {
                    continue;
                };
                let table = rest.trim().trim_matches('"');
                let table = table.split_once('.').map(|(_, t)| t).unwrap_or(table);
                names.push(table.trim_matches('"').to_string());
                non_empty += 1;
            }
        }
    }
    (names, non_empty)
}

fn parse_filename_timestamp(path: &Path) -> Option<DateTime<Utc>> {
    let name = path.file_name()?.to_str()?;
    let stem = name.split('.').next()?;
    let mut parts = stem.rsplitn(3, '_');
    let time = parts.next()?;
    let date = parts.next()?;
    NaiveDateTime::parse_from_str(&format!("{date}_{time}"), "%Y%m%d_%H%M%S")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Creates, verifies, lists, prunes and restores backups.
#[derive(Clone)]
pub struct BackupService {
    runner: Arc<dyn ProcessRunner>,
    tools: BackupTools,
}

impl std::fmt::Debug for BackupService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupService").field("tools", &self.tools).finish()
    }
}

impl BackupService {
    /// Create a service running tools through `runner`.
    pub fn new(runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            runner,
            tools: BackupTools::default(),
        }
    }

    /// Override tool names or paths.
    pub fn with_tools(mut self, tools: BackupTools) -> Self {
        self.tools = tools;
        self
    }

    /// Tool names in use.
    pub fn tools(&self) -> &BackupTools {
        &self.tools
    }

    /// Dump a store into `config.output_directory`.
    pub async fn create_backup(
        &self,
        config: &BackupConfig,
        cancel: &CancellationToken,
    ) -> MigrateResult<BackupResult> {
        if config.database.trim().is_empty() {
            return Err(MigrationError::invalid_argument("backup database must not be empty"));
        }
        if config.connection_string.trim().is_empty() {
            return Err(MigrationError::invalid_argument(
                "backup connection string must not be empty",
            ));
        }

        let start = Instant::now();
        match self.run_backup(config, cancel).await {
            Ok((metadata, verification)) => {
                let verified = verification.as_ref().is_none_or(ValidationResult::is_valid);
                if verified {
                    info!(
                        path = %metadata.file_path.display(),
                        size = metadata.file_size_bytes,
                        collections = metadata.collection_count,
                        "Backup created"
                    );
                } else {
                    error!(path = %metadata.file_path.display(), "Backup failed verification");
                }
                Ok(BackupResult {
                    is_success: verified,
                    error_message: (!verified).then(|| "backup failed verification".to_string()),
                    error_kind: (!verified).then_some(ErrorKind::Validation),
                    metadata: Some(metadata),
                    verification,
                    duration: start.elapsed(),
                })
            }
            Err(err) => {
                error!(database = %config.database, error = %err, "Backup failed");
                Ok(BackupResult::failed(&err, start))
            }
        }
    }

    async fn run_backup(
        &self,
        config: &BackupConfig,
        cancel: &CancellationToken,
    ) -> MigrateResult<(BackupMetadata, Option<ValidationResult>)> {
        tokio::fs::create_dir_all(&config.output_directory).await?;

        let created_at = Utc::now();
        let final_path = config.target_path(created_at);
        let partial = suffixed(&final_path, ".partial");

        let tool_version = self.tool_version(config.backup_type, cancel).await;
        let command = self.dump_command(config, &partial);
        info!(
            program = %command.program,
            database = %config.database,
            path = %final_path.display(),
            "Starting backup"
        );

        let output = match self.runner.run(&command, cancel).await {
            Ok(output) => output,
            Err(err) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(err);
            }
        };
        if !output.is_success() {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(MigrationError::process(
                &command.program,
                format!(
                    "exited with {:?}: {}",
                    output.exit_code,
                    output.stderr.trim()
                ),
            ));
        }

        let size = tokio::fs::metadata(&partial).await.map(|m| m.len()).unwrap_or(0);
        if size == 0 {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(MigrationError::process(
                &command.program,
                "produced no output",
            ));
        }

        let (collections, collection_count) =
            parse_dumped_collections(config.backup_type, &output.stderr);

        let compress = config.compress;
        let staged = if compress {
            suffixed(&final_path, ".gz-partial")
        } else {
            partial.clone()
        };
        let sealed = {
            let partial = partial.clone();
            let staged = staged.clone();
            blocking(move || {
                if compress {
                    gzip_file(&partial, &staged)?;
                    std::fs::remove_file(&partial)?;
                }
                let size = std::fs::metadata(&staged)?.len();
                Ok((sha256_file(&staged)?, size))
            })
            .await
        };
        let (checksum, file_size_bytes) = match sealed {
            Ok(sealed) => sealed,
            Err(err) => {
                discard(&[partial.as_path(), staged.as_path()]).await;
                return Err(err);
            }
        };

        let metadata = BackupMetadata {
            file_size_bytes,
            file_path: final_path.clone(),
            backup_type: config.backup_type,
            created_at,
            is_compressed: compress,
            tool_version,
            checksum,
            collection_count,
            database: config.database.clone(),
            collections,
        };
        // A backup file is only visible together with its sidecar.
        if let Err(err) = publish(&staged, &metadata).await {
            discard(&[partial.as_path(), staged.as_path(), final_path.as_path()]).await;
            return Err(err);
        }
        debug!(checksum = %metadata.checksum, "Wrote backup sidecar");

        let verification = if config.verify {
            Some(self.verify_backup(&metadata.file_path, config.backup_type).await)
        } else {
            None
        };

        Ok((metadata, verification))
    }

    fn dump_command(&self, config: &BackupConfig, path: &Path) -> ProcessCommand {
        match config.backup_type {
            BackupType::DocumentStore => {
                let mut cmd = ProcessCommand::new(&self.tools.mongodump)
                    .arg(format!("--uri={}", config.connection_string))
                    .arg(format!("--db={}", config.database))
                    .arg(format!("--archive={}", path.display()));
                for collection in &config.collections {
                    cmd = cmd.arg(format!("--nsInclude={}.{}", config.database, collection));
                }
                cmd.timeout(config.timeout)
            }
            BackupType::Relational => {
                let mut cmd = ProcessCommand::new(&self.tools.pg_dump)
                    .arg("--format=custom")
                    .arg("--verbose")
                    .arg(format!("--file={}", path.display()))
                    .arg(format!("--dbname={}", config.connection_string));
                for table in &config.collections {
                    cmd = cmd.arg(format!("--table={table}"));
                }
                cmd.timeout(config.timeout)
            }
        }
    }

    async fn tool_version(&self, backup_type: BackupType, cancel: &CancellationToken) -> Option<String> {
        let program = match backup_type {
            BackupType::DocumentStore => &self.tools.mongodump,
            BackupType::Relational => &self.tools.pg_dump,
        };
        let command = ProcessCommand::new(program)
            .arg("--version")
            .timeout(Duration::from_secs(30));
        match self.runner.run(&command, cancel).await {
            Ok(output) if output.is_success() => output
                .stdout
                .lines()
                .map(str::trim)
                .find(|l| !l.is_empty())
                .map(str::to_string),
            Ok(_) | Err(_) => {
                warn!(program = %program, "Could not determine tool version");
                None
            }
        }
    }

    /// Check a backup file: existence, size, format signature and, when a
    /// sidecar exists, checksum.
    pub async fn verify_backup(&self, path: &Path, backup_type: BackupType) -> ValidationResult {
        let path = path.to_path_buf();
        let outcome = blocking(move || Ok(verify_blocking(&path, backup_type))).await;
        match outcome {
            Ok(result) => result,
            Err(err) => ValidationResult::with_error(err.to_string()),
        }
    }

    /// Apply a retention policy to a directory, removing the oldest backups
    /// first.
    pub async fn cleanup_backups(
        &self,
        directory: &Path,
        policy: &RetentionPolicy,
    ) -> MigrateResult<CleanupResult> {
        let mut backups = self.list_backups(directory, None).await?;
        // Oldest first.
        backups.reverse();

        let now = Utc::now();
        let mut result = CleanupResult::default();
        let mut doomed = Vec::new();
        let mut kept: Vec<BackupInfo> = Vec::new();

        for backup in backups {
            let age = now.signed_duration_since(backup.created_at).num_seconds().max(0) as u64;
            if policy.max_age_secs.is_some_and(|max| age > max) {
                doomed.push(backup);
            } else {
                kept.push(backup);
            }
        }

        let mut total: u64 = kept.iter().map(|b| b.file_size_bytes).sum();
        while !kept.is_empty()
            && (policy.max_count.is_some_and(|max| kept.len() > max)
                || policy.max_total_size_bytes.is_some_and(|max| total > max))
        {
            let oldest = kept.remove(0);
            total -= oldest.file_size_bytes;
            doomed.push(oldest);
        }

        for backup in doomed {
            match tokio::fs::remove_file(&backup.path).await {
                Ok(()) => {
                    let sidecar = sidecar_path(&backup.path);
                    if sidecar.exists() {
                        if let Err(e) = tokio::fs::remove_file(&sidecar).await {
                            result.errors.push(format!("{}: {e}", sidecar.display()));
                        }
                    }
                    debug!(path = %backup.path.display(), "Removed backup");
                    result.bytes_freed += backup.file_size_bytes;
                    result.removed.push(backup.path);
                }
                Err(e) => result.errors.push(format!("{}: {e}", backup.path.display())),
            }
        }
        result.retained = kept.into_iter().rev().map(|b| b.path).collect();

        info!(
            directory = %directory.display(),
            removed = result.removed.len(),
            retained = result.retained.len(),
            bytes_freed = result.bytes_freed,
            "Backup cleanup finished"
        );
        Ok(result)
    }

    /// Backups in a directory, newest first.
    pub async fn list_backups(
        &self,
        directory: &Path,
        backup_type: Option<BackupType>,
    ) -> MigrateResult<Vec<BackupInfo>> {
        let directory = directory.to_path_buf();
        let mut backups = blocking(move || list_blocking(&directory)).await?;
        if let Some(wanted) = backup_type {
            backups.retain(|b| b.backup_type == wanted);
        }
        backups.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.path.cmp(&a.path)));
        Ok(backups)
    }

    /// Restore a backup with `mongorestore --drop` or `pg_restore --clean`.
    pub async fn restore_backup(
        &self,
        path: &Path,
        backup_type: BackupType,
        connection_string: &str,
        database: Option<&str>,
        cancel: &CancellationToken,
    ) -> MigrateResult<RestoreResult> {
        let start = Instant::now();
        match self
            .run_restore(path, backup_type, connection_string, database, cancel)
            .await
        {
            Ok(()) => {
                info!(path = %path.display(), "Backup restored");
                Ok(RestoreResult {
                    is_success: true,
                    error_message: None,
                    error_kind: None,
                    duration: start.elapsed(),
                })
            }
            Err(err) => {
                error!(path = %path.display(), error = %err, "Restore failed");
                Ok(RestoreResult {
                    is_success: false,
                    error_message: Some(err.to_string()),
                    error_kind: Some(err.kind()),
                    duration: start.elapsed(),
                })
            }
        }
    }

    async fn run_restore(
        &self,
        path: &Path,
        backup_type: BackupType,
        connection_string: &str,
        database: Option<&str>,
        cancel: &CancellationToken,
    ) -> MigrateResult<()> {
        if !path.exists() {
            return Err(MigrationError::validation(format!(
                "backup file not found: {}",
                path.display()
            )));
        }

        let source = path.to_path_buf();
        let (compressed, head) = {
            let source = source.clone();
            blocking(move || Ok(read_signature(&source)?)).await?
        };

        let mut staged = None;
        let input = if compressed {
            let mut name = source.as_os_str().to_owned();
            name.push(".restore");
            let target = PathBuf::from(name);
            let (src, dst) = (source.clone(), target.clone());
            blocking(move || Ok(gunzip_file(&src, &dst)?)).await?;
            staged = Some(target.clone());
            target
        } else {
            source
        };

        let command = match backup_type {
            BackupType::DocumentStore => {
                let mut cmd = ProcessCommand::new(&self.tools.mongorestore)
                    .arg(format!("--uri={connection_string}"))
                    .arg(format!("--archive={}", input.display()))
                    .arg("--drop");
                if let Some(db) = database {
                    cmd = cmd.arg(format!("--nsInclude={db}.*"));
                }
                cmd
            }
            BackupType::Relational if head.starts_with(PG_DUMP_MAGIC) => {
                ProcessCommand::new(&self.tools.pg_restore)
                    .arg("--clean")
                    .arg("--if-exists")
                    .arg("--no-owner")
                    .arg(format!("--dbname={connection_string}"))
                    .arg(input.display().to_string())
            }
            BackupType::Relational => ProcessCommand::new(&self.tools.psql)
                .arg(format!("--dbname={connection_string}"))
                .arg(format!("--file={}", input.display())),
        };

        let outcome = self.runner.run(&command, cancel).await;
        if let Some(staged) = staged {
            let _ = tokio::fs::remove_file(staged).await;
        }
        let output = outcome?;
        if output.is_success() {
            Ok(())
        } else {
            Err(MigrationError::process(
                &command.program,
                format!("exited with {:?}: {}", output.exit_code, output.stderr.trim()),
            ))
        }
    }
}

fn verify_blocking(path: &Path, backup_type: BackupType) -> ValidationResult {
    let mut result = ValidationResult::default();

    let size = match std::fs::metadata(path) {
        Ok(meta) => meta.len(),
        Err(_) => {
            result.error(format!("backup file not found: {}", path.display()));
            return result;
        }
    };
    if size == 0 {
        result.error("backup file is empty");
        return result;
    }

    let (compressed, head) = match read_signature(path) {
        Ok(sig) => sig,
        Err(e) => {
            result.error(format!("backup file is not readable: {e}"));
            return result;
        }
    };

    match backup_type {
        BackupType::DocumentStore => {
            if !head.starts_with(&MONGO_ARCHIVE_MAGIC) {
                result.error("file is not a mongodump archive");
            }
        }
        BackupType::Relational => {
            if !head.starts_with(PG_DUMP_MAGIC) && !looks_like_sql(&head) {
                result.error("file is neither a pg_dump custom archive nor SQL text");
            }
        }
    }

    match read_sidecar(path) {
        Ok(Some(metadata)) => {
            if metadata.is_compressed != compressed {
                result.error(format!(
                    "sidecar says compressed={}, file says compressed={}",
                    metadata.is_compressed, compressed
                ));
            }
            if metadata.backup_type != backup_type {
                result.warning(format!(
                    "sidecar records a {} backup, verifying as {}",
                    metadata.backup_type, backup_type
                ));
            }
            match sha256_file(path) {
                Ok(actual) if actual == metadata.checksum => {}
                Ok(actual) => result.error(
                    MigrationError::ChecksumMismatch {
                        path: path.display().to_string(),
                        expected: metadata.checksum,
                        actual,
                    }
                    .to_string(),
                ),
                Err(e) => result.error(format!("could not checksum backup: {e}")),
            }
        }
        Ok(None) => result.warning("no metadata sidecar, checksum not verified"),
        Err(e) => result.error(format!("unreadable metadata sidecar: {e}")),
    }

    result
}

fn list_blocking(directory: &Path) -> MigrateResult<Vec<BackupInfo>> {
    let mut backups = Vec::new();
    if !directory.exists() {
        return Ok(backups);
    }

    for entry in std::fs::read_dir(directory)? {
        let entry = entry?;
        let path = entry.path();
        if !entry.file_type()?.is_file() {
            continue;
        }
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if name.ends_with(".metadata") || name.ends_with(".partial") || name.ends_with(".restore") {
            continue;
        }

        let metadata = match read_sidecar(&path) {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Ignoring unreadable sidecar");
                None
            }
        };
        let Some(backup_type) = metadata
            .as_ref()
            .map(|m| m.backup_type)
            .or_else(|| BackupType::from_path(&path))
        else {
            continue;
        };

        let fs_meta = entry.metadata()?;
        let created_at = metadata
            .as_ref()
            .map(|m| m.created_at)
            .or_else(|| parse_filename_timestamp(&path))
            .or_else(|| fs_meta.modified().ok().map(DateTime::<Utc>::from))
            .unwrap_or_else(Utc::now);

        backups.push(BackupInfo {
            is_compressed: metadata
                .as_ref()
                .map(|m| m.is_compressed)
                .unwrap_or_else(|| name.ends_with(".gz")),
            file_size_bytes: fs_meta.len(),
            path,
            backup_type,
            created_at,
            metadata,
        });
    }
    Ok(backups)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::{ProcessOutput, ScriptedProcessRunner};

    fn fake_mongodump(docs: u64) -> ScriptedProcessRunner {
        ScriptedProcessRunner::new(move |cmd| {
            if cmd.args.iter().any(|a| a == "--version") {
                return Ok(ProcessOutput {
                    exit_code: Some(0),
                    stdout: "mongodump version: 100.9.4\n".to_string(),
                    ..Default::default()
                });
            }
            let path = cmd.flag_value("--archive").unwrap_or_default();
            let mut bytes = MONGO_ARCHIVE_MAGIC.to_vec();
            bytes.extend_from_slice(&[0u8; 64]);
            std::fs::write(path, bytes)?;
            Ok(ProcessOutput::success(format!(
                "2024-01-01T00:00:00.000+0000\twriting care.entries to archive\n\
                 2024-01-01T00:00:00.000+0000\tdone dumping care.entries ({docs} documents)\n"
            )))
        })
    }

    #[test]
    fn test_sidecar_path() {
        assert_eq!(
            sidecar_path(Path::new("/b/care_20240101_000000.archive.gz")),
            PathBuf::from("/b/care_20240101_000000.archive.gz.metadata")
        );
    }

    #[test]
    fn test_parse_dumped_collections() {
        let stderr = "x\tdone dumping care.entries (10 documents)\n\
                      x\tdone dumping care.food (0 documents)\n";
        let (names, count) = parse_dumped_collections(BackupType::DocumentStore, stderr);
        assert_eq!(names, vec!["entries", "food"]);
        assert_eq!(count, 1);

        let stderr = "pg_dump: dumping contents of table \"public.entries\"\n";
        let (names, count) = parse_dumped_collections(BackupType::Relational, stderr);
        assert_eq!(names, vec!["entries"]);
        assert_eq!(count, 1);
    }

    #[test]
    fn test_parse_filename_timestamp() {
        let ts = parse_filename_timestamp(Path::new("care_20240305_141516.archive.gz")).unwrap();
        assert_eq!(ts.to_rfc3339(), "2024-03-05T14:15:16+00:00");
        assert!(parse_filename_timestamp(Path::new("random.archive")).is_none());
    }

    #[tokio::test]
    async fn test_create_and_verify_compressed() {
        let dir = tempfile::tempdir().unwrap();
        let service = BackupService::new(Arc::new(fake_mongodump(3)));
        let config = BackupConfig::document_store("mongodb://localhost", "care", dir.path())
            .compress(true)
            .verify(true);

        let result = service
            .create_backup(&config, &CancellationToken::new())
            .await
            .unwrap();

        assert!(result.is_success, "{:?}", result.error_message);
        let metadata = result.metadata.unwrap();
        assert!(metadata.is_compressed);
        assert!(metadata.file_path.to_string_lossy().ends_with(".archive.gz"));
        assert_eq!(metadata.collection_count, 1);
        assert_eq!(metadata.tool_version.as_deref(), Some("mongodump version: 100.9.4"));
        assert!(sidecar_path(&metadata.file_path).exists());
        assert!(result.verification.unwrap().is_valid());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure_result() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedProcessRunner::new(|_| Ok(ProcessOutput::failure(1, "auth failed")));
        let service = BackupService::new(Arc::new(runner));
        let config = BackupConfig::document_store("mongodb://localhost", "care", dir.path());

        let result = service
            .create_backup(&config, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.is_success);
        assert_eq!(result.error_kind, Some(ErrorKind::Subprocess));
        assert!(result.error_message.unwrap().contains("auth failed"));
    }

    #[tokio::test]
    async fn test_timeout_is_failure_result() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedProcessRunner::new(|_| Err(MigrationError::Timeout(10)));
        let service = BackupService::new(Arc::new(runner));
        let config = BackupConfig::document_store("mongodb://localhost", "care", dir.path());

        let result = service
            .create_backup(&config, &CancellationToken::new())
            .await
            .unwrap();

        assert!(!result.is_success);
        assert_eq!(result.error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_empty_output_is_failure() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedProcessRunner::new(|cmd| {
            if let Some(path) = cmd.flag_value("--archive") {
                std::fs::write(path, b"")?;
            }
            Ok(ProcessOutput::success(""))
        });
        let service = BackupService::new(Arc::new(runner));
        let config = BackupConfig::document_store("mongodb://localhost", "care", dir.path());

        let result = service
            .create_backup(&config, &CancellationToken::new())
            .await
            .unwrap();
        assert!(!result.is_success);
        assert!(service.list_backups(dir.path(), None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_empty_database_rejected() {
        let service = BackupService::new(Arc::new(fake_mongodump(0)));
        let config = BackupConfig::document_store("mongodb://localhost", "", "/tmp");
        let err = service
            .create_backup(&config, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::InvalidArgument(_)));
    }

    #[tokio::test]
    async fn test_verify_detects_wrong_signature() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("care_20240101_000000.dump");
        std::fs::write(&path, b"not a dump at all").unwrap();

        let service = BackupService::new(Arc::new(fake_mongodump(0)));
        let result = service.verify_backup(&path, BackupType::Relational).await;
        assert!(!result.is_valid());

        std::fs::write(&path, b"PGDMP\x01\x0e\x00").unwrap();
        let result = service.verify_backup(&path, BackupType::Relational).await;
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);
    }

    #[tokio::test]
    async fn test_restore_decompresses_and_runs_mongorestore() {
        let dir = tempfile::tempdir().unwrap();
        let runner = fake_mongodump(1);
        let service = BackupService::new(Arc::new(runner.clone()));
        let config = BackupConfig::document_store("mongodb://localhost", "care", dir.path()).compress(true);
        let created = service
            .create_backup(&config, &CancellationToken::new())
            .await
            .unwrap();
        let path = created.path().unwrap().to_path_buf();

        let restored = service
            .restore_backup(
                &path,
                BackupType::DocumentStore,
                "mongodb://localhost",
                Some("care"),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(restored.is_success);
        let last = runner.calls().pop().unwrap();
        assert_eq!(last.program, "mongorestore");
        assert!(last.args.iter().any(|a| a == "--drop"));
        assert!(last.flag_value("--archive").unwrap().ends_with(".restore"));
        assert!(!dir.path().read_dir().unwrap().any(|e| {
            e.unwrap().path().to_string_lossy().ends_with(".restore")
        }));
    }
}
