//! Error types for snapback.

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

use crate::pipeline::PipelineStage;

/// Fatal configuration problems. Raised before any backup activity.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Cannot parse configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// An external command that did not complete successfully.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("`{}` exited with status {}", display_argv(.argv), display_code(.code))]
    Failed {
        argv: Vec<String>,
        code: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("`{}` timed out after {}s", display_argv(.argv), .timeout.as_secs())]
    TimedOut { argv: Vec<String>, timeout: Duration },

    #[error("Failed to start `{}`: {source}", display_argv(.argv))]
    Spawn {
        argv: Vec<String>,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed waiting for `{}`: {source}", display_argv(.argv))]
    Wait {
        argv: Vec<String>,
        #[source]
        source: std::io::Error,
    },
}

impl CommandError {
    pub fn argv(&self) -> &[String] {
        match self {
            CommandError::Failed { argv, .. }
            | CommandError::TimedOut { argv, .. }
            | CommandError::Spawn { argv, .. }
            | CommandError::Wait { argv, .. } => argv,
        }
    }

    /// Exit code, when the process ran to completion and was not killed by a signal.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            CommandError::Failed { code, .. } => *code,
            _ => None,
        }
    }
}

/// A command failure tagged with the pipeline state it aborted.
#[derive(Error, Debug)]
#[error("{stage} failed: {source}")]
pub struct PipelineError {
    pub stage: PipelineStage,
    pub message: String,
    #[source]
    pub source: CommandError,
}

impl PipelineError {
    /// True when the delta-transfer step was the one that failed.
    pub fn is_transfer_failure(&self) -> bool {
        self.stage == PipelineStage::Transfer
    }
}

#[derive(Error, Debug)]
pub enum SnapbackError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Notification error: {0}")]
    Notify(String),
}

pub type Result<T> = std::result::Result<T, SnapbackError>;

pub(crate) fn display_argv(argv: &[String]) -> String {
    argv.join(" ")
}

fn display_code(code: &Option<i32>) -> String {
    match code {
        Some(c) => c.to_string(),
        None => "unknown (terminated by signal)".to_string(),
    }
}
