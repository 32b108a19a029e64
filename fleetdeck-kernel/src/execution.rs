//! Typed subprocess execution.
//!
//! Every external tool call (compose, container runtime) is described by a
//! `CommandSpec` and answered with a structured `CommandOutput`, so callers
//! parse data instead of juggling raw process handles. `CommandRunner` is the
//! seam that lets backends run against scripted output in tests.

use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::process::Command as AsyncCommand;
use tracing::debug;

pub const STATUS_TIMEOUT: Duration = Duration::from_secs(15);
pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(60);
pub const LOG_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub timeout: Duration,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            timeout: STATUS_TIMEOUT,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Shell-quoted rendering for logs and error messages.
    pub fn display(&self) -> String {
        let mut parts = Vec::with_capacity(self.args.len() + 1);
        parts.push(self.program.as_str());
        parts.extend(self.args.iter().map(String::as_str));
        shell_words::join(parts)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub execution_time_ms: u128,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Most useful text to show a human when the command failed.
    pub fn error_text(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` timed out after {timeout:?}")]
    Timeout { command: String, timeout: Duration },
    #[error("`{command}` exited with {code:?}: {message}")]
    Failed {
        command: String,
        code: Option<i32>,
        message: String,
    },
}

impl ExecError {
    pub fn is_transient(&self) -> bool {
        matches!(self, ExecError::Spawn { .. } | ExecError::Timeout { .. })
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs to completion. A non-zero exit is still `Ok`; see `run_checked`.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError>;
}

/// Like `CommandRunner::run`, but a non-zero exit becomes `ExecError::Failed`.
pub async fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
) -> Result<CommandOutput, ExecError> {
    let output = runner.run(spec).await?;
    if output.success() {
        Ok(output)
    } else {
        Err(ExecError::Failed {
            command: spec.display(),
            code: output.exit_code,
            message: output.error_text(),
        })
    }
}

/// Runs real processes through tokio.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, ExecError> {
        let start_time = Instant::now();
        debug!(command = %spec.display(), timeout = ?spec.timeout, "executing command");

        let mut command = AsyncCommand::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let output = tokio::time::timeout(spec.timeout, command.output())
            .await
            .map_err(|_| ExecError::Timeout {
                command: spec.display(),
                timeout: spec.timeout,
            })?
            .map_err(|source| ExecError::Spawn {
                command: spec.display(),
                source,
            })?;

        Ok(CommandOutput {
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            execution_time_ms: start_time.elapsed().as_millis(),
        })
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_stdout_and_exit_code() {
        let spec = CommandSpec::new("sh").args(["-c", "echo hello; echo oops >&2; exit 3"]);
        let output = SystemRunner.run(&spec).await.unwrap();
        assert_eq!(output.exit_code, Some(3));
        assert_eq!(output.stdout.trim(), "hello");
        assert_eq!(output.error_text(), "oops");
        assert!(!output.success());
    }

    #[tokio::test]
    async fn run_checked_turns_exit_codes_into_errors() {
        let spec = CommandSpec::new("sh").args(["-c", "echo nope >&2; exit 1"]);
        let err = run_checked(&SystemRunner, &spec).await.unwrap_err();
        assert!(matches!(err, ExecError::Failed { code: Some(1), ref message, .. } if message == "nope"));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn enforces_timeout() {
        let spec = CommandSpec::new("sleep")
            .arg("10")
            .timeout(Duration::from_millis(200));
        let err = SystemRunner.run(&spec).await.unwrap_err();
        assert!(matches!(err, ExecError::Timeout { .. }));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn missing_program_is_a_spawn_error() {
        let spec = CommandSpec::new("fleetdeck-definitely-not-installed");
        assert!(matches!(
            SystemRunner.run(&spec).await.unwrap_err(),
            ExecError::Spawn { .. }
        ));
    }

    #[test]
    fn display_quotes_arguments() {
        let spec = CommandSpec::new("docker").args(["ps", "--format", "{{json .}}"]);
        assert_eq!(spec.display(), "docker ps --format '{{json .}}'");
    }
}
