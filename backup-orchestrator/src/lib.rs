//! Backup Orchestrator Library
//!
//! Backup and disaster-recovery orchestration for a compose-managed
//! deployment: capture, seal, verify, replicate, retain, notify and restore.

pub mod archive;
pub mod capture;
pub mod config;
pub mod cycle;
pub mod engines;
pub mod fs;
pub mod lock;
pub mod metadata;
pub mod notify;
pub mod preflight;
pub mod replication;
pub mod restore;
pub mod retention;
pub mod runtime;
pub mod utils;

#[cfg(test)]
pub(crate) mod testing;

// Re-export commonly used types
pub use config::Config;
pub use cycle::Orchestrator;
pub use utils::errors::BackupError;
pub type Result<T> = std::result::Result<T, BackupError>;
