//! External process execution for dump and restore tools.

use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::{MigrateResult, MigrationError};

/// A command to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    /// Executable name or path.
    pub program: String,
    /// Arguments.
    pub args: Vec<String>,
    /// Kill the process after this long.
    pub timeout: Duration,
}

impl ProcessCommand {
    /// Create a command with a one hour timeout.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: Duration::from_secs(3600),
        }
    }

    /// Append an argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set the timeout.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Value of a `--name=value` argument.
    pub fn flag_value(&self, name: &str) -> Option<&str> {
        let prefix = format!("{name}=");
        self.args.iter().find_map(|a| a.strip_prefix(prefix.as_str()))
    }

    /// Arguments with credentials in connection strings masked, for logging.
    pub fn redacted_args(&self) -> Vec<String> {
        self.args.iter().map(|a| redact(a)).collect()
    }
}

fn redact(arg: &str) -> String {
    match (arg.find("://"), arg.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => {
            format!("{}://***{}", &arg[..scheme], &arg[at..])
        }
        _ => arg.to_string(),
    }
}

/// Captured result of a finished process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    /// Exit code; `None` when terminated by a signal.
    pub exit_code: Option<i32>,
    /// Captured stdout.
    pub stdout: String,
    /// Captured stderr.
    pub stderr: String,
    /// Wall time.
    pub duration: Duration,
}

impl ProcessOutput {
    /// Successful output with the given stderr.
    pub fn success(stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// Failed output with the given exit code and stderr.
    pub fn failure(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(code),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// Whether the process exited with status 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Runs external processes.
///
/// Implementations return `Err(MigrationError::Timeout)` or
/// `Err(MigrationError::Cancelled)` after killing the process, and
/// `Ok` with a nonzero exit code when the process itself fails.
#[async_trait::async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Run a command to completion.
    async fn run(
        &self,
        command: &ProcessCommand,
        cancel: &CancellationToken,
    ) -> MigrateResult<ProcessOutput>;
}

/// [`ProcessRunner`] backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioProcessRunner;

#[async_trait::async_trait]
impl ProcessRunner for TokioProcessRunner {
    async fn run(
        &self,
        command: &ProcessCommand,
        cancel: &CancellationToken,
    ) -> MigrateResult<ProcessOutput> {
        debug!(program = %command.program, args = ?command.redacted_args(), "Spawning process");
        let start = Instant::now();

        let child = tokio::process::Command::new(&command.program)
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| MigrationError::process(&command.program, e.to_string()))?;

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                warn!(program = %command.program, "Process cancelled, killing");
                return Err(MigrationError::Cancelled);
            }
            result = tokio::time::timeout(command.timeout, child.wait_with_output()) => match result {
                Ok(output) => output.map_err(|e| MigrationError::process(&command.program, e.to_string()))?,
                Err(_) => {
                    warn!(
                        program = %command.program,
                        timeout_ms = command.timeout.as_millis() as u64,
                        "Process timed out, killing"
                    );
                    return Err(MigrationError::Timeout(command.timeout.as_millis() as u64));
                }
            },
        };

        Ok(ProcessOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            duration: start.elapsed(),
        })
    }
}

type Script = dyn Fn(&ProcessCommand) -> MigrateResult<ProcessOutput> + Send + Sync;

/// [`ProcessRunner`] that answers every command with a closure and records
/// what was run. Used in tests and dry runs.
#[derive(Clone)]
pub struct ScriptedProcessRunner {
    script: Arc<Script>,
    calls: Arc<Mutex<Vec<ProcessCommand>>>,
}

impl ScriptedProcessRunner {
    /// Create a runner from a closure.
    pub fn new(
        script: impl Fn(&ProcessCommand) -> MigrateResult<ProcessOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Arc::new(script),
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Commands run so far.
    pub fn calls(&self) -> Vec<ProcessCommand> {
        self.calls.lock().clone()
    }
}

impl std::fmt::Debug for ScriptedProcessRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScriptedProcessRunner")
            .field("calls", &self.calls.lock().len())
            .finish()
    }
}

#[async_trait::async_trait]
impl ProcessRunner for ScriptedProcessRunner {
    async fn run(
        &self,
        command: &ProcessCommand,
        cancel: &CancellationToken,
    ) -> MigrateResult<ProcessOutput> {
        if cancel.is_cancelled() {
            return Err(MigrationError::Cancelled);
        }
        self.calls.lock().push(command.clone());
        (self.script)(command)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flag_value() {
        let cmd = ProcessCommand::new("mongodump")
            .arg("--db=care")
            .arg("--archive=/tmp/a.archive");
        assert_eq!(cmd.flag_value("--archive"), Some("/tmp/a.archive"));
        assert_eq!(cmd.flag_value("--uri"), None);
    }

    #[test]
    fn test_redacts_credentials() {
        let cmd = ProcessCommand::new("mongodump").arg("--uri=mongodb://user:secret@db:27017");
        let args = cmd.redacted_args();
        assert!(!args[0].contains("secret"));
        assert!(args[0].ends_with("@db:27017"));
    }

    #[tokio::test]
    async fn test_scripted_runner_records_calls() {
        let runner = ScriptedProcessRunner::new(|cmd| {
            if cmd.program == "fail" {
                Ok(ProcessOutput::failure(2, "boom"))
            } else {
                Ok(ProcessOutput::success(""))
            }
        });
        let cancel = CancellationToken::new();

        let ok = runner.run(&ProcessCommand::new("ok"), &cancel).await.unwrap();
        let failed = runner.run(&ProcessCommand::new("fail"), &cancel).await.unwrap();

        assert!(ok.is_success());
        assert!(!failed.is_success());
        assert_eq!(runner.calls().len(), 2);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_captures_output() {
        let output = TokioProcessRunner
            .run(
                &ProcessCommand::new("sh").args(["-c", "echo out; echo err 1>&2; exit 3"]),
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_tokio_runner_times_out() {
        let err = TokioProcessRunner
            .run(
                &ProcessCommand::new("sleep")
                    .arg("5")
                    .timeout(Duration::from_millis(50)),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Timeout(50)));
    }

    #[tokio::test]
    async fn test_missing_program_is_process_error() {
        let err = TokioProcessRunner
            .run(
                &ProcessCommand::new("glint-definitely-not-installed"),
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MigrationError::Process { .. }));
    }
}
