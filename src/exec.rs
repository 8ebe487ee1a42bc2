//! Abstraction over external command execution (loader tools, mount table).
//!
//! This allows mocking OS-level commands in tests.

use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;

use crate::error::{HarnessError, Result};
use crate::poll::poll_until;

/// Captured result of an external command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    /// Whether the process exited with status zero.
    pub success: bool,
    /// Exit code, if the process terminated normally.
    pub code: Option<i32>,
    /// Captured standard output.
    pub stdout: String,
    /// Captured standard error.
    pub stderr: String,
}

/// Abstraction over external command execution.
#[cfg_attr(test, automock)]
pub trait CommandExecutor: Send + Sync {
    /// Execute an external command and wait for it to finish.
    fn execute(&self, program: &str, args: Vec<String>) -> Result<ExecOutput>;

    /// Execute an external command with an execution deadline.
    ///
    /// The child is killed and reaped if it exceeds the deadline. Output
    /// pipes are drained by dedicated threads so a chatty child cannot
    /// deadlock on a full pipe buffer.
    fn execute_with_timeout(
        &self,
        program: &str,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecOutput>;
}

/// Real implementation that delegates to std::process::Command.
#[derive(Default)]
pub struct RealCommandExecutor;

impl CommandExecutor for RealCommandExecutor {
    fn execute(&self, program: &str, args: Vec<String>) -> Result<ExecOutput> {
        let output = Command::new(program).args(&args).output()?;
        Ok(ExecOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn execute_with_timeout(
        &self,
        program: &str,
        args: Vec<String>,
        timeout: Duration,
    ) -> Result<ExecOutput> {
        let mut child = Command::new(program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        // Drain both pipes concurrently; the child is reaped only after its
        // output has been consumed.
        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        let stdout_reader = thread::spawn(move || drain_pipe(stdout_pipe));
        let stderr_reader = thread::spawn(move || drain_pipe(stderr_pipe));

        let deadline = Instant::now() + timeout;
        let mut exit_status = None;
        let mut wait_error = None;
        poll_until(Duration::from_millis(100), deadline, || {
            match child.try_wait() {
                Ok(Some(status)) => {
                    exit_status = Some(status);
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    wait_error = Some(e);
                    true
                }
            }
        });

        if let Some(e) = wait_error {
            child.kill().ok();
            child.wait().ok();
            join_reader(stdout_reader);
            join_reader(stderr_reader);
            return Err(HarnessError::Io(e));
        }

        let status = match exit_status {
            Some(status) => status,
            None => {
                child.kill().ok();
                child.wait().ok();
                join_reader(stdout_reader);
                join_reader(stderr_reader);
                return Err(HarnessError::SubprocessTimeout {
                    program: program.to_string(),
                    timeout_ms: timeout.as_millis() as u64,
                });
            }
        };

        Ok(ExecOutput {
            success: status.success(),
            code: status.code(),
            stdout: join_reader(stdout_reader),
            stderr: join_reader(stderr_reader),
        })
    }
}

fn drain_pipe<R: Read>(pipe: Option<R>) -> String {
    let mut buf = String::new();
    if let Some(mut pipe) = pipe {
        pipe.read_to_string(&mut buf).ok();
    }
    buf
}

fn join_reader(handle: thread::JoinHandle<String>) -> String {
    handle.join().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_captures_output() {
        let executor = RealCommandExecutor;
        let output = executor
            .execute("echo", vec!["hello".to_string()])
            .expect("echo should run");
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn test_execute_with_timeout_kills_slow_child() {
        let executor = RealCommandExecutor;
        let result = executor.execute_with_timeout(
            "sleep",
            vec!["5".to_string()],
            Duration::from_millis(200),
        );
        assert!(matches!(
            result,
            Err(HarnessError::SubprocessTimeout { .. })
        ));
    }

    #[test]
    fn test_execute_with_timeout_fast_child() {
        let executor = RealCommandExecutor;
        let output = executor
            .execute_with_timeout("echo", vec!["ok".to_string()], Duration::from_secs(5))
            .expect("echo should run");
        assert!(output.success);
        assert_eq!(output.stdout.trim(), "ok");
    }

    #[test]
    fn test_execute_missing_program() {
        let executor = RealCommandExecutor;
        assert!(executor
            .execute("definitely-not-a-real-binary", vec![])
            .is_err());
    }
}
