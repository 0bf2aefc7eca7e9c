//! Preflight checks run before any capture work starts.

use crate::config::Config;
use crate::runtime::ServiceRuntime;
use crate::utils::errors::{BackupError, Result};
use tracing::{debug, info};

/// What the environment reported when it passed.
#[derive(Debug, Clone, PartialEq)]
pub struct Ready {
    pub engine_version: String,
    pub compose_version: String,
}

/// Container engine reachable, compose tool present, project directory
/// present. Any miss is an `Environment` error and nothing has been written.
pub async fn check_environment(config: &Config, runtime: &dyn ServiceRuntime) -> Result<Ready> {
    let project_dir = &config.project.dir;
    if !project_dir.is_dir() {
        return Err(BackupError::Environment(format!(
            "project directory {} does not exist",
            project_dir.display()
        )));
    }

    let engine_version = runtime
        .engine_version()
        .await
        .map_err(|e| BackupError::Environment(format!("container engine unreachable: {}", e)))?;
    let compose_version = runtime
        .compose_version()
        .await
        .map_err(|e| BackupError::Environment(format!("compose tool unavailable: {}", e)))?;

    let compose_file = config.compose_file();
    if !compose_file.is_file() {
        debug!("Compose file {} not found; relying on compose defaults", compose_file.display());
    }

    info!(
        "Preflight passed: engine {}, compose {}",
        engine_version, compose_version
    );
    Ok(Ready {
        engine_version,
        compose_version,
    })
}
