//! Result aggregation for a backup run.
//!
//! Every pipeline records exactly one outcome here. The run driver reads
//! it once at the end to build the report handed to a [`Notifier`].

pub mod notifier;

use std::fmt;
use std::sync::{Mutex, MutexGuard};

use crate::utils::errors::{display_argv, CommandError};
pub use notifier::{Notifier, SmtpNotifier, StdoutNotifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeKind {
    Success,
    Warning,
    Error,
}

impl OutcomeKind {
    fn banner(&self) -> &'static str {
        match self {
            OutcomeKind::Success => "--- OK:",
            OutcomeKind::Warning => "--- WARNING:",
            OutcomeKind::Error => "--- ERROR:",
        }
    }
}

/// The (target, backup set) pair an outcome concerns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairRef {
    pub target: String,
    pub local_dir: String,
    pub remote_dir: String,
}

impl fmt::Display for PairRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}:{}", self.local_dir, self.target, self.remote_dir)
    }
}

/// Captured context of a failed external call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureContext {
    pub command: String,
    pub exit_code: Option<i32>,
    pub status: String,
    pub stdout: String,
    pub stderr: String,
}

impl From<&CommandError> for FailureContext {
    fn from(err: &CommandError) -> Self {
        let status = match err {
            CommandError::Failed { code: Some(code), .. } => format!("Call exited with status {code}"),
            CommandError::Failed { code: None, .. } => "Call was terminated by a signal".to_string(),
            CommandError::TimedOut { timeout, .. } => {
                format!("Call timed out after {}s and was killed", timeout.as_secs())
            }
            CommandError::Spawn { source, .. } => format!("Call could not be started: {source}"),
            CommandError::Wait { source, .. } => format!("Call could not be awaited: {source}"),
        };
        let (stdout, stderr) = match err {
            CommandError::Failed { stdout, stderr, .. } => (stdout.clone(), stderr.clone()),
            _ => (String::new(), String::new()),
        };
        Self {
            command: display_argv(err.argv()),
            exit_code: err.exit_code(),
            status,
            stdout,
            stderr,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
    pub kind: OutcomeKind,
    pub pair: Option<PairRef>,
    pub message: String,
    pub failure: Option<FailureContext>,
}

impl Outcome {
    fn new(kind: OutcomeKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            pair: None,
            message: message.into(),
            failure: None,
        }
    }

    pub fn success(message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Success, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Warning, message)
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(OutcomeKind::Error, message)
    }

    pub fn for_pair(mut self, pair: PairRef) -> Self {
        self.pair = Some(pair);
        self
    }

    pub fn with_failure(mut self, err: &CommandError) -> Self {
        self.failure = Some(FailureContext::from(err));
        self
    }

    fn render(&self) -> String {
        let mut out = String::new();
        if let Some(pair) = &self.pair {
            out.push_str(&format!("Backup set: {pair}\n\n"));
        }
        out.push_str(&self.message);
        out.push('\n');
        if let Some(failure) = &self.failure {
            out.push_str(&format!(
                "Call:\n {}\n\n{}\n\nStdout:\n{}\n\nStderr:\n{}\n\n",
                failure.command, failure.status, failure.stdout, failure.stderr
            ));
        }
        out
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counts {
    pub errors: usize,
    pub warnings: usize,
    pub successes: usize,
}

/// Final subject and body for the notifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Report {
    pub subject: String,
    pub body: String,
}

/// Collects outcomes from every pipeline of a run. Safe to share across tasks.
#[derive(Debug, Default)]
pub struct Aggregator {
    outcomes: Mutex<Vec<Outcome>>,
}

impl Aggregator {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Outcome>> {
        // A panicking writer cannot leave a Vec half-pushed.
        self.outcomes.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn record(&self, outcome: Outcome) {
        self.lock().push(outcome);
    }

    pub fn add_success(&self, message: impl Into<String>) {
        self.record(Outcome::success(message));
    }

    pub fn add_warning(&self, message: impl Into<String>, context: Option<&CommandError>) {
        let mut outcome = Outcome::warning(message);
        if let Some(err) = context {
            outcome = outcome.with_failure(err);
        }
        self.record(outcome);
    }

    pub fn add_error(&self, message: impl Into<String>, context: Option<&CommandError>) {
        let mut outcome = Outcome::error(message);
        if let Some(err) = context {
            outcome = outcome.with_failure(err);
        }
        self.record(outcome);
    }

    /// Copy of everything recorded so far, in insertion order.
    pub fn outcomes(&self) -> Vec<Outcome> {
        self.lock().clone()
    }

    pub fn counts(&self) -> Counts {
        let outcomes = self.lock();
        let count = |kind: OutcomeKind| outcomes.iter().filter(|o| o.kind == kind).count();
        Counts {
            errors: count(OutcomeKind::Error),
            warnings: count(OutcomeKind::Warning),
            successes: count(OutcomeKind::Success),
        }
    }

    pub fn has_errors(&self) -> bool {
        self.lock().iter().any(|o| o.kind == OutcomeKind::Error)
    }

    /// Errors first, then warnings, then successes.
    pub fn build_report(&self, hostname: &str) -> Report {
        let counts = self.counts();
        let subject = format!(
            "{hostname} Backup Complete: {} Errors, {} Successes, {} Warnings.",
            counts.errors, counts.successes, counts.warnings
        );

        let outcomes = self.lock();
        let mut body = String::new();
        for kind in [OutcomeKind::Error, OutcomeKind::Warning, OutcomeKind::Success] {
            for outcome in outcomes.iter().filter(|o| o.kind == kind) {
                body.push_str(kind.banner());
                body.push('\n');
                body.push_str(&outcome.render());
                body.push_str("\n\n");
            }
        }

        Report { subject, body }
    }
}
