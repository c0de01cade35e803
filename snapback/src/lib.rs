//! Snapback library
//!
//! Incremental, hard-linked snapshot backups of local directories to remote
//! hosts, driven through ssh and rsync.

pub mod config;
pub mod pipeline;
pub mod remote;
pub mod report;
pub mod retention;
pub mod run;
pub mod shutdown;
pub mod utils;

// Re-export commonly used types
pub use config::Config;
pub use pipeline::{BackupDataset, Orchestrator};
pub use report::{Aggregator, Report};
pub use utils::errors::SnapbackError;
