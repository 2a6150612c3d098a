// file: src/process/mod.rs
// version: 1.0.0
// guid: 4a7c1e85-d93f-4b60-82a4-6e58f0c2d917

//! External tool invocation
//!
//! Every external process the build engine runs goes through [`ToolCommand`]:
//! the cancellation token is consulted before the spawn, stdout and stderr are
//! captured, and non-zero exits are matched against a tolerated-output list
//! before becoming a `ToolFailure`.

use crate::{FledgeError, Result};
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Captured output of a completed tool invocation
#[derive(Debug)]
pub struct ToolOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    /// Stdout and stderr concatenated, for parsers that accept either stream.
    pub fn combined(&self) -> String {
        format!("{}{}", self.stdout, self.stderr)
    }
}

/// Builder for a single external tool invocation
#[derive(Debug)]
pub struct ToolCommand {
    program: OsString,
    args: Vec<OsString>,
    current_dir: Option<PathBuf>,
    tolerated: Vec<String>,
}

impl ToolCommand {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            current_dir: None,
            tolerated: Vec::new(),
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
        for arg in args {
            self.args.push(arg.as_ref().to_os_string());
        }
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Treat a non-zero exit as success when the combined output contains
    /// `pattern` ("not mounted", "No such device", ...).
    pub fn tolerate(mut self, pattern: impl Into<String>) -> Self {
        self.tolerated.push(pattern.into());
        self
    }

    fn tool_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Run the tool to completion, capturing output.
    ///
    /// Cancellation is observed before the spawn and while the child runs;
    /// a cancelled child is killed.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<ToolOutput> {
        if cancel.is_cancelled() {
            return Err(FledgeError::Cancelled);
        }

        debug!("Running tool: {} {:?}", self.tool_name(), self.args);

        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.current_dir {
            command.current_dir(dir);
        }

        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(FledgeError::Cancelled),
            result = command.output() => result?,
        };

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        let status = output.status.code().unwrap_or(-1);

        if output.status.success() {
            return Ok(ToolOutput {
                status,
                stdout,
                stderr,
            });
        }

        let combined = format!("{}{}", stdout, stderr);
        if self.tolerated.iter().any(|p| combined.contains(p)) {
            debug!(
                "Tolerated non-zero exit from {}: {}",
                self.tool_name(),
                combined.trim()
            );
            return Ok(ToolOutput {
                status,
                stdout,
                stderr,
            });
        }

        Err(FledgeError::ToolFailure {
            tool: self.tool_name(),
            status,
            output: combined.trim().to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_captures_stdout() {
        let cancel = CancellationToken::new();
        let out = ToolCommand::new("sh")
            .args(["-c", "echo hello"])
            .run(&cancel)
            .await
            .unwrap();

        assert_eq!(out.status, 0);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_tool_failure() {
        let cancel = CancellationToken::new();
        let err = ToolCommand::new("sh")
            .args(["-c", "echo broken >&2; exit 3"])
            .run(&cancel)
            .await
            .unwrap_err();

        match err {
            FledgeError::ToolFailure {
                tool,
                status,
                output,
            } => {
                assert_eq!(tool, "sh");
                assert_eq!(status, 3);
                assert!(output.contains("broken"));
            }
            other => panic!("expected ToolFailure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_tolerated_output_is_success() {
        let cancel = CancellationToken::new();
        let out = ToolCommand::new("sh")
            .args(["-c", "echo 'umount: not mounted'; exit 1"])
            .tolerate("not mounted")
            .run(&cancel)
            .await
            .unwrap();

        assert_eq!(out.status, 1);
    }

    #[tokio::test]
    async fn test_cancelled_before_spawn() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = ToolCommand::new("sh")
            .args(["-c", "true"])
            .run(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FledgeError::Cancelled));
    }
}
