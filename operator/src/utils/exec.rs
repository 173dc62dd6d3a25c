//! Running host commands with a deadline.
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument};

/// Define the behavior we consume from the host to run commands.
#[async_trait]
pub trait CommandExecutor: Send + Sync {
    /// Run `command` with `args`, returning stdout. Fails on a non zero exit or when `timeout`
    /// elapses, in which case the child is killed.
    async fn execute(&self, command: &str, args: &[String], timeout: Duration) -> Result<String>;
}

/// A command ran and exited unsuccessfully.
#[derive(Debug, thiserror::Error)]
#[error("{command} {subcommand} failed with {status}: {stderr}")]
pub struct CommandFailed {
    /// Program name
    pub command: String,
    /// First argument, usually the subcommand
    pub subcommand: String,
    /// Exit code, None when killed by a signal
    pub code: Option<i32>,
    /// Rendered exit status
    pub status: String,
    /// Trimmed stderr
    pub stderr: String,
}

impl CommandFailed {
    /// Exit code of a failed command anywhere in the chain of `err`.
    pub fn exit_code(err: &anyhow::Error) -> Option<i32> {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<CommandFailed>())
            .and_then(|failed| failed.code)
    }
}

/// Runs commands as child processes of the current process.
#[derive(Clone, Copy, Debug, Default)]
pub struct ProcessExecutor;

#[async_trait]
impl CommandExecutor for ProcessExecutor {
    #[instrument(skip(self, args), fields(args = %args.join(" ")))]
    async fn execute(&self, command: &str, args: &[String], timeout: Duration) -> Result<String> {
        let output = tokio::time::timeout(
            timeout,
            Command::new(command).args(args).kill_on_drop(true).output(),
        )
        .await
        .map_err(|_| anyhow!("{command} timed out after {}s", timeout.as_secs()))?
        .with_context(|| format!("failed to start {command}"))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(CommandFailed {
                command: command.to_owned(),
                subcommand: args.first().cloned().unwrap_or_default(),
                code: output.status.code(),
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_owned(),
            }
            .into());
        }
        debug!(bytes = stdout.len(), "command succeeded");
        Ok(stdout)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use mockall::mock;

    mock! {
        pub Executor {}
        #[async_trait]
        impl CommandExecutor for Executor {
            async fn execute(
                &self,
                command: &str,
                args: &[String],
                timeout: Duration,
            ) -> Result<String>;
        }
    }

    #[tokio::test]
    async fn captures_stdout() {
        let out = ProcessExecutor
            .execute("echo", &["hello".to_owned()], Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(out, "hello\n");
    }

    #[tokio::test]
    async fn reports_failures() {
        let err = ProcessExecutor
            .execute(
                "sh",
                &["-c".to_owned(), "echo boom >&2; exit 3".to_owned()],
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("boom"), "{err}");
        assert_eq!(CommandFailed::exit_code(&err), Some(3));
    }

    #[tokio::test]
    async fn enforces_timeout() {
        let err = ProcessExecutor
            .execute("sleep", &["5".to_owned()], Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("timed out"), "{err}");
    }
}
