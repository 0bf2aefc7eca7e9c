//! Error taxonomy for the backup orchestrator.
//!
//! Fatal variants abort the current cycle and always reach the notification
//! sink. Non-fatal variants are accumulated into the manifest or the
//! notification body and never abort anything.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BackupError {
    /// Runtime, compose tool or project directory unavailable.
    #[error("Environment error: {0}")]
    Environment(String),

    /// A single engine or directory could not be captured.
    #[error("Capture of {component} failed: {reason}")]
    ComponentCapture { component: String, reason: String },

    #[error("Packaging error: {0}")]
    Packaging(String),

    #[error("Verification error: {0}")]
    Verification(String),

    #[error("Replication error: {0}")]
    Replication(String),

    #[error("Restore declined by user")]
    RestoreDeclined,

    #[error("Restore payload missing for {0}")]
    RestoreComponentMissing(String),

    #[error("Restore failed during {stage}: {reason}{}", snapshot_hint(.safety_snapshot))]
    RestoreFatal {
        stage: String,
        reason: String,
        safety_snapshot: Option<PathBuf>,
    },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Another backup operation holds the lock at {0}")]
    Locked(PathBuf),

    #[error("Service runtime error: {0}")]
    Runtime(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

fn snapshot_hint(snapshot: &Option<PathBuf>) -> String {
    match snapshot {
        Some(path) => format!(" (safety snapshot for manual recovery: {})", path.display()),
        None => String::new(),
    }
}

impl BackupError {
    /// Whether this error aborts the operation that raised it.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            BackupError::ComponentCapture { .. }
                | BackupError::Replication(_)
                | BackupError::RestoreComponentMissing(_)
                | BackupError::RestoreDeclined
        )
    }

    pub fn component(component: impl Into<String>, reason: impl ToString) -> Self {
        BackupError::ComponentCapture {
            component: component.into(),
            reason: reason.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, BackupError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(BackupError::Environment("docker".into()).is_fatal());
        assert!(BackupError::Packaging("tar".into()).is_fatal());
        assert!(BackupError::Verification("empty".into()).is_fatal());
        assert!(!BackupError::component("redis", "stopped").is_fatal());
        assert!(!BackupError::Replication("timeout".into()).is_fatal());
        assert!(!BackupError::RestoreDeclined.is_fatal());
        assert!(!BackupError::RestoreComponentMissing("config".into()).is_fatal());
    }

    #[test]
    fn test_restore_fatal_mentions_snapshot() {
        let err = BackupError::RestoreFatal {
            stage: "components_restored".into(),
            reason: "psql exited with 1".into(),
            safety_snapshot: Some(PathBuf::from("/backups/pre_restore_20260101_000000.tar.gz")),
        };
        let msg = err.to_string();
        assert!(msg.contains("components_restored"));
        assert!(msg.contains("pre_restore_20260101_000000.tar.gz"));

        let bare = BackupError::RestoreFatal {
            stage: "extracted".into(),
            reason: "corrupt".into(),
            safety_snapshot: None,
        };
        assert!(!bare.to_string().contains("safety snapshot"));
    }
}
