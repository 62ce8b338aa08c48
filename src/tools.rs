//! # tools: uniform invocation of external command-line tools
//!
//! Every external program the pipeline depends on (archivers, the image
//! converter, the metadata stripper, the `file` sniffer) is reached through
//! the [`ToolRunner`] trait, so stages handle missing tools, non-zero exits
//! and hangs the same way and tests can substitute a mock.
//!
//! - [`SystemToolRunner`] spawns real processes with `tokio::process` and an
//!   optional per-call timeout.
//! - `MockToolRunner` is generated by `mockall` for tests (exported behind the
//!   `test-export-mocks` feature).

use async_trait::async_trait;
use std::ffi::{OsStr, OsString};
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::process::Command;
use tracing::{debug, warn};

#[cfg(any(test, feature = "test-export-mocks"))]
use mockall::automock;

/// One external command: program name, arguments and optional working dir.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<OsString>,
    pub cwd: Option<PathBuf>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Position of `needle` among the arguments, for tests and fakes that
    /// need to pick out a flag's value.
    pub fn arg_position(&self, needle: &str) -> Option<usize> {
        self.args.iter().position(|a| a == needle)
    }
}

/// Captured output of a successful tool run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    pub status_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("tool `{tool}` is not installed")]
    NotFound { tool: String },
    #[error("failed to launch `{tool}`: {source}")]
    Spawn {
        tool: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{tool}` exited with status {code:?}: {stderr}")]
    Failed {
        tool: String,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },
    #[error("`{tool}` did not finish within {after:?}")]
    TimedOut { tool: String, after: Duration },
}

impl ToolError {
    pub fn tool(&self) -> &str {
        match self {
            ToolError::NotFound { tool }
            | ToolError::Spawn { tool, .. }
            | ToolError::Failed { tool, .. }
            | ToolError::TimedOut { tool, .. } => tool,
        }
    }
}

/// Runs external tools. Implemented by [`SystemToolRunner`] and by mocks.
#[cfg_attr(any(test, feature = "test-export-mocks"), automock)]
#[async_trait]
pub trait ToolRunner: Send + Sync {
    /// Whether `tool` can be found on the search path.
    fn is_available(&self, tool: &str) -> bool;

    /// Run the invocation to completion. A non-zero exit status is an error.
    async fn invoke(&self, invocation: Invocation) -> Result<ToolOutput, ToolError>;
}

/// Spawns real processes.
#[derive(Debug, Clone, Default)]
pub struct SystemToolRunner {
    timeout: Option<Duration>,
}

impl SystemToolRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ToolRunner for SystemToolRunner {
    fn is_available(&self, tool: &str) -> bool {
        which::which(tool).is_ok()
    }

    async fn invoke(&self, invocation: Invocation) -> Result<ToolOutput, ToolError> {
        let tool = invocation.program.clone();
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        debug!(tool = %tool, args = ?invocation.args, cwd = ?invocation.cwd, "Invoking external tool");

        let run = command.output();
        let output = match self.timeout {
            Some(limit) => match tokio::time::timeout(limit, run).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(tool = %tool, timeout = ?limit, "External tool timed out and was killed");
                    return Err(ToolError::TimedOut { tool, after: limit });
                }
            },
            None => run.await,
        };

        let output = output.map_err(|source| {
            if source.kind() == std::io::ErrorKind::NotFound {
                ToolError::NotFound { tool: tool.clone() }
            } else {
                ToolError::Spawn {
                    tool: tool.clone(),
                    source,
                }
            }
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if output.status.success() {
            Ok(ToolOutput {
                status_code: output.status.code(),
                stdout,
                stderr,
            })
        } else {
            Err(ToolError::Failed {
                tool,
                code: output.status.code(),
                stdout,
                stderr: stderr.trim().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_builder_collects_arguments() {
        let inv = Invocation::new("zip")
            .args(["-r", "-q"])
            .arg("out.zip")
            .current_dir("/tmp");
        assert_eq!(inv.program, "zip");
        assert_eq!(inv.args, vec!["-r", "-q", "out.zip"]);
        assert_eq!(inv.cwd, Some(PathBuf::from("/tmp")));
        assert_eq!(inv.arg_position("out.zip"), Some(2));
    }

    #[tokio::test]
    async fn missing_program_is_reported_as_not_found() {
        let runner = SystemToolRunner::default();
        assert!(!runner.is_available("definitely-not-a-real-tool-4711"));
        let err = runner
            .invoke(Invocation::new("definitely-not-a-real-tool-4711"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::NotFound { .. }), "got {err:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_error_with_output() {
        let runner = SystemToolRunner::default();
        let err = runner
            .invoke(Invocation::new("sh").args(["-c", "echo partial; exit 3"]))
            .await
            .unwrap_err();
        match err {
            ToolError::Failed { code, stdout, .. } => {
                assert_eq!(code, Some(3));
                assert!(stdout.contains("partial"));
            }
            other => panic!("expected Failed, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_tool_times_out() {
        let runner = SystemToolRunner::new(Some(Duration::from_millis(100)));
        let err = runner
            .invoke(Invocation::new("sleep").arg("5"))
            .await
            .unwrap_err();
        assert!(matches!(err, ToolError::TimedOut { .. }), "got {err:?}");
    }
}
