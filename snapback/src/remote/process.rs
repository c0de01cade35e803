//! Process spawning behind a small trait seam.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::utils::errors::{display_argv, CommandError};

/// Upper bound on extra attempts a config may request.
pub const MAX_RETRIES: u32 = 5;

const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Captured result of a command that exited with status 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs an argument vector as one external process. Never goes through a shell.
///
/// Implementations must turn any non-zero exit status into
/// [`CommandError::Failed`] with both output streams attached.
pub trait CommandRunner: Send + Sync + 'static {
    fn run(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> impl Future<Output = Result<CommandOutput, CommandError>> + Send;
}

/// The real runner, backed by `tokio::process`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    async fn run(
        &self,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, CommandError> {
        let Some((program, args)) = argv.split_first() else {
            return Err(CommandError::Spawn {
                argv: Vec::new(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command"),
            });
        };

        debug!(command = %display_argv(argv), "Spawning process");

        let child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| CommandError::Spawn {
                argv: argv.to_vec(),
                source,
            })?;

        // Dropping the future on timeout drops the child, which kills it.
        let waited = match timeout {
            Some(limit) => match tokio::time::timeout(limit, child.wait_with_output()).await {
                Ok(waited) => waited,
                Err(_) => {
                    warn!(command = %display_argv(argv), timeout_secs = limit.as_secs(), "Command timed out, killed");
                    return Err(CommandError::TimedOut {
                        argv: argv.to_vec(),
                        timeout: limit,
                    });
                }
            },
            None => child.wait_with_output().await,
        };

        let output = waited.map_err(|source| CommandError::Wait {
            argv: argv.to_vec(),
            source,
        })?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if output.status.success() {
            Ok(CommandOutput {
                exit_code: output.status.code().unwrap_or(0),
                stdout,
                stderr,
            })
        } else {
            Err(CommandError::Failed {
                argv: argv.to_vec(),
                code: output.status.code(),
                stdout,
                stderr,
            })
        }
    }
}

/// Opt-in retry of failed external calls. The default performs no retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub retries: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            retries: 0,
            backoff: Duration::from_secs(5),
        }
    }
}

impl RetryPolicy {
    pub fn new(retries: u32, backoff: Duration) -> Self {
        Self {
            retries: retries.min(MAX_RETRIES),
            backoff,
        }
    }

    /// Delay before retry number `attempt` (1-based): doubles each time, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
        self.backoff.saturating_mul(factor).min(MAX_BACKOFF)
    }

    /// Spawn failures (missing binary, bad path) are not transient.
    fn is_retryable(err: &CommandError) -> bool {
        !matches!(err, CommandError::Spawn { .. })
    }

    pub async fn run<R: CommandRunner>(
        &self,
        runner: &R,
        argv: &[String],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, CommandError> {
        let mut attempt = 0;
        loop {
            match runner.run(argv, timeout).await {
                Ok(output) => return Ok(output),
                Err(e) if attempt < self.retries && Self::is_retryable(&e) => {
                    attempt += 1;
                    let delay = self.delay(attempt);
                    warn!(
                        error = %e,
                        attempt,
                        max_attempts = self.retries + 1,
                        delay_secs = delay.as_secs(),
                        "Command failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn argv(words: &[&str]) -> Vec<String> {
        words.iter().map(|w| w.to_string()).collect()
    }

    #[tokio::test]
    async fn test_run_success_captures_stdout() {
        let output = ProcessRunner
            .run(&argv(&["echo", "hello"]), Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 0);
        assert!(output.stdout.contains("hello"));
    }

    #[tokio::test]
    async fn test_run_nonzero_exit_is_failure() {
        let err = ProcessRunner
            .run(&argv(&["sh", "-c", "echo out; echo err >&2; exit 3"]), None)
            .await
            .unwrap_err();
        match err {
            CommandError::Failed { code, stdout, stderr, argv } => {
                assert_eq!(code, Some(3));
                assert_eq!(stdout.trim(), "out");
                assert_eq!(stderr.trim(), "err");
                assert_eq!(argv[0], "sh");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_not_found() {
        let err = ProcessRunner
            .run(&argv(&["nonexistent_command_12345"]), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_run_timeout() {
        let err = ProcessRunner
            .run(&argv(&["sleep", "5"]), Some(Duration::from_millis(100)))
            .await
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn test_empty_argv_rejected() {
        let err = ProcessRunner.run(&[], None).await.unwrap_err();
        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(3, Duration::from_secs(5));
        assert_eq!(policy.delay(1), Duration::from_secs(5));
        assert_eq!(policy.delay(2), Duration::from_secs(10));
        assert_eq!(policy.delay(3), Duration::from_secs(20));
        assert_eq!(policy.delay(40), MAX_BACKOFF);
    }

    #[test]
    fn test_retry_count_is_capped() {
        assert_eq!(RetryPolicy::new(50, Duration::ZERO).retries, MAX_RETRIES);
    }

    struct Flaky {
        failures_left: AtomicU32,
        calls: AtomicU32,
    }

    impl CommandRunner for Flaky {
        async fn run(
            &self,
            argv: &[String],
            _timeout: Option<Duration>,
        ) -> Result<CommandOutput, CommandError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(CommandError::Failed {
                    argv: argv.to_vec(),
                    code: Some(255),
                    stdout: String::new(),
                    stderr: "Connection reset".into(),
                });
            }
            Ok(CommandOutput::default())
        }
    }

    #[tokio::test]
    async fn test_no_retries_by_default() {
        let flaky = Flaky {
            failures_left: AtomicU32::new(1),
            calls: AtomicU32::new(0),
        };
        let result = RetryPolicy::default().run(&flaky, &argv(&["true"]), None).await;
        assert!(result.is_err());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let flaky = Flaky {
            failures_left: AtomicU32::new(2),
            calls: AtomicU32::new(0),
        };
        let policy = RetryPolicy::new(2, Duration::ZERO);
        let result = policy.run(&flaky, &argv(&["true"]), None).await;
        assert!(result.is_ok());
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }
}
