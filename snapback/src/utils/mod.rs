//! Utility modules for snapback.

pub mod errors;
pub mod logger;

pub use errors::{CommandError, ConfigError, PipelineError, Result, SnapbackError};
