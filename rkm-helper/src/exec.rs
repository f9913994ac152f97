//! Running the external mount tools.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

/// How a step's process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepStatus {
    Exited(i32),
    Signaled,
    /// The process was killed after running for this long.
    TimedOut(Duration),
}

impl StepStatus {
    pub fn success(&self) -> bool {
        matches!(self, StepStatus::Exited(0))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ExecError {
    #[error("failed to launch {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to wait for {}: {source}", .program.display())]
    Wait {
        program: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion, killing it once `timeout` elapses.
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<StepStatus, ExecError>;
}

/// Runs steps as child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        program: &Path,
        args: &[String],
        timeout: Duration,
    ) -> Result<StepStatus, ExecError> {
        debug!(program = %program.display(), ?args, "running step");
        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecError::Launch {
                program: program.to_path_buf(),
                source,
            })?;

        // On timeout the child is dropped, which kills it.
        let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(output) => output.map_err(|source| ExecError::Wait {
                program: program.to_path_buf(),
                source,
            })?,
            Err(_) => {
                warn!(program = %program.display(), "step timed out after {timeout:?}");
                return Ok(StepStatus::TimedOut(timeout));
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            warn!(program = %program.display(), "{stderr}");
        }
        Ok(match output.status.code() {
            Some(code) => StepStatus::Exited(code),
            None => StepStatus::Signaled,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(script: &str) -> Vec<String> {
        vec!["-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_exit_codes() {
        let runner = ProcessRunner;
        let timeout = Duration::from_secs(10);
        assert_eq!(
            runner.run(Path::new("/bin/sh"), &sh("exit 0"), timeout).await.unwrap(),
            StepStatus::Exited(0)
        );
        assert_eq!(
            runner
                .run(Path::new("/bin/sh"), &sh("echo oops >&2; exit 3"), timeout)
                .await
                .unwrap(),
            StepStatus::Exited(3)
        );
        assert_eq!(
            runner.run(Path::new("/bin/sh"), &sh("kill -9 $$"), timeout).await.unwrap(),
            StepStatus::Signaled
        );
    }

    #[tokio::test]
    async fn test_timeout_kills_step() {
        let started = std::time::Instant::now();
        let status = ProcessRunner
            .run(Path::new("/bin/sh"), &sh("sleep 30"), Duration::from_millis(200))
            .await
            .unwrap();
        assert_eq!(status, StepStatus::TimedOut(Duration::from_millis(200)));
        assert!(!status.success());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = ProcessRunner
            .run(Path::new("/nonexistent/ntfs-3g"), &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Launch { .. }));
        assert!(err.to_string().contains("/nonexistent/ntfs-3g"));
    }
}
