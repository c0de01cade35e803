//! Remote command execution over ssh, and the rsync transfer call.
//!
//! All commands are built as argument vectors. Remote argv elements are
//! quoted for the far-side login shell by [`quote`], never by callers.

pub mod process;
pub mod quote;
#[cfg(test)]
pub(crate) mod testing;

use chrono::{DateTime, Utc};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::{BackupTarget, Config};
use crate::utils::errors::CommandError;
pub use process::{CommandOutput, CommandRunner, ProcessRunner, RetryPolicy};

/// `find -printf` format: directory name, a tab, ctime as fractional epoch seconds.
pub const LISTING_FORMAT: &str = "%f\\t%C@\\n";

/// Fixed rsync options: recursive, links, times, group, owner, devices, compress.
const RSYNC_BASE_FLAGS: [&str; 5] = [
    "-rltgoDz",
    "--stats",
    "--ignore-errors",
    "--delete",
    "--delete-excluded",
];

/// An immediate subdirectory of a remote base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteDir {
    pub name: String,
    /// Metadata-change time as reported by the remote filesystem.
    pub changed: DateTime<Utc>,
}

/// Everything needed to build one rsync invocation.
#[derive(Debug, Clone)]
pub struct TransferRequest<'a> {
    pub local_dir: &'a Path,
    pub remote_staging: &'a str,
    pub excludes: &'a [String],
    /// Hard-link reference, relative to the staging directory.
    pub link_dest: Option<&'a str>,
}

pub struct RemoteExecutor<R = ProcessRunner> {
    runner: R,
    ssh: String,
    rsync: String,
    command_timeout: Option<Duration>,
    transfer_timeout: Option<Duration>,
    retry: RetryPolicy,
}

impl<R: CommandRunner> RemoteExecutor<R> {
    pub fn new(runner: R, ssh: impl Into<String>, rsync: impl Into<String>) -> Self {
        Self {
            runner,
            ssh: ssh.into(),
            rsync: rsync.into(),
            command_timeout: None,
            transfer_timeout: None,
            retry: RetryPolicy::default(),
        }
    }

    /// Build an executor with binaries, timeouts and retry policy taken from the config.
    pub fn from_config(runner: R, config: &Config) -> Self {
        Self::new(runner, config.ssh.clone(), config.rsync.clone())
            .with_timeouts(config.command_timeout(), config.transfer_timeout())
            .with_retry(config.retry_policy())
    }

    pub fn with_timeouts(mut self, command: Option<Duration>, transfer: Option<Duration>) -> Self {
        self.command_timeout = command;
        self.transfer_timeout = transfer;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn runner(&self) -> &R {
        &self.runner
    }

    /// ssh options shared by direct calls and rsync's `-e`.
    fn ssh_options(target: &BackupTarget) -> Vec<String> {
        vec![
            "-i".to_string(),
            target.key.display().to_string(),
            "-p".to_string(),
            target.port.to_string(),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ]
    }

    /// Full local argv for running `argv` on `target`.
    pub fn remote_argv(&self, target: &BackupTarget, argv: &[&str]) -> Vec<String> {
        let mut full = vec![self.ssh.clone()];
        full.extend(Self::ssh_options(target));
        full.push(target.destination());
        full.extend(argv.iter().map(|word| quote::quote(word)));
        full
    }

    /// Run `argv` on the remote host.
    pub async fn execute(
        &self,
        target: &BackupTarget,
        argv: &[&str],
    ) -> Result<CommandOutput, CommandError> {
        let full = self.remote_argv(target, argv);
        self.retry.run(&self.runner, &full, self.command_timeout).await
    }

    /// Run `argv` locally, for post-processing that needs no remote host.
    pub async fn execute_local(&self, argv: &[&str]) -> Result<CommandOutput, CommandError> {
        let full: Vec<String> = argv.iter().map(|w| w.to_string()).collect();
        self.retry.run(&self.runner, &full, self.command_timeout).await
    }

    /// One remote listing of the immediate subdirectories of `base`.
    ///
    /// Sorting and filtering happen on this side; nothing but `find` is
    /// required on the remote host. It must be GNU find: `-printf` is not
    /// available in busybox or BSD find, and every listing fails there.
    pub async fn list_directories(
        &self,
        target: &BackupTarget,
        base: &str,
    ) -> Result<Vec<RemoteDir>, CommandError> {
        let output = self
            .execute(
                target,
                &[
                    "find",
                    base,
                    "-mindepth",
                    "1",
                    "-maxdepth",
                    "1",
                    "-type",
                    "d",
                    "-printf",
                    LISTING_FORMAT,
                ],
            )
            .await?;
        Ok(parse_listing(&output.stdout))
    }

    pub fn transfer_argv(&self, target: &BackupTarget, request: &TransferRequest<'_>) -> Vec<String> {
        let mut shell = vec![quote::quote(&self.ssh)];
        shell.extend(Self::ssh_options(target).iter().map(|o| quote::quote(o)));

        let mut argv = vec![self.rsync.clone()];
        argv.extend(RSYNC_BASE_FLAGS.iter().map(|f| f.to_string()));
        argv.extend(request.excludes.iter().map(|pattern| format!("--exclude={pattern}")));
        argv.push("-e".to_string());
        argv.push(shell.join(" "));
        if let Some(link_dest) = request.link_dest {
            argv.push(format!("--link-dest={link_dest}"));
        }
        argv.push(request.local_dir.display().to_string());
        argv.push(format!("{}:{}", target.destination(), request.remote_staging));
        argv
    }

    /// Run rsync from the local source into the remote staging directory.
    pub async fn transfer(
        &self,
        target: &BackupTarget,
        request: &TransferRequest<'_>,
    ) -> Result<CommandOutput, CommandError> {
        let argv = self.transfer_argv(target, request);
        self.retry.run(&self.runner, &argv, self.transfer_timeout).await
    }
}

/// Parse `find -printf` output produced with [`LISTING_FORMAT`].
pub fn parse_listing(stdout: &str) -> Vec<RemoteDir> {
    let mut dirs = Vec::new();
    for line in stdout.lines().filter(|l| !l.is_empty()) {
        let Some((name, ctime)) = line.rsplit_once('\t') else {
            warn!(line, "Ignoring malformed listing line");
            continue;
        };
        match parse_epoch(ctime) {
            Some(changed) => dirs.push(RemoteDir {
                name: name.to_string(),
                changed,
            }),
            None => warn!(line, "Ignoring listing line with unparseable ctime"),
        }
    }
    debug!(count = dirs.len(), "Parsed remote listing");
    dirs
}

/// `1700000000.1234567890` -> UTC timestamp. Fraction is truncated to nanoseconds.
fn parse_epoch(value: &str) -> Option<DateTime<Utc>> {
    let (secs, frac) = value.trim().split_once('.').unwrap_or((value.trim(), ""));
    let secs: i64 = secs.parse().ok()?;
    let nanos = if frac.is_empty() {
        0
    } else {
        if !frac.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        let digits: String = frac.chars().chain(std::iter::repeat('0')).take(9).collect();
        digits.parse::<u32>().ok()?
    };
    DateTime::from_timestamp(secs, nanos)
}
