//! Capture orchestrator - produces the raw capture tree for one cycle.
//!
//! Layout of `target_dir` after a capture:
//! - `database/` engine exports, each compressed individually
//! - `files/` copies of the data, uploads and certificate trees
//! - `config/` environment and deployment descriptor copies
//! - `logs/` per-service container logs and the application log tree
//!
//! A stopped engine or missing directory never aborts the capture: the
//! component is recorded as not included, with a warning, and the next
//! component is attempted. Nothing here ever deletes source data.

use crate::config::Config;
use crate::engines::{ExportOutcome, PostgresEngine, RedisEngine};
use crate::fs::compress::compress_file;
use crate::fs::walker::{calculate_total_size, copy_tree, walk_directory, CopyStats};
use crate::metadata::manifest::{ComponentKind, ComponentRecord};
use crate::runtime::ServiceRuntime;
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

pub const DATABASE_DIR: &str = "database";
pub const FILES_DIR: &str = "files";
pub const CONFIG_DIR: &str = "config";
pub const LOGS_DIR: &str = "logs";

/// Result of one capture pass.
#[derive(Debug)]
pub struct CaptureResult {
    pub target_dir: PathBuf,
    pub started_at: DateTime<Utc>,
    pub components: BTreeMap<ComponentKind, ComponentRecord>,
    /// Non-fatal failures, in the order they happened
    pub errors: Vec<BackupError>,
}

impl CaptureResult {
    pub fn included(&self) -> Vec<ComponentKind> {
        self.components
            .iter()
            .filter(|(_, r)| r.included)
            .map(|(k, _)| *k)
            .collect()
    }

    pub fn warnings(&self) -> Vec<String> {
        self.components
            .iter()
            .flat_map(|(kind, r)| r.warnings.iter().map(move |w| format!("{}: {}", kind, w)))
            .collect()
    }
}

pub struct CaptureOrchestrator {
    config: Arc<Config>,
    runtime: Arc<dyn ServiceRuntime>,
}

impl CaptureOrchestrator {
    pub fn new(config: Arc<Config>, runtime: Arc<dyn ServiceRuntime>) -> Self {
        Self { config, runtime }
    }

    /// Capture every registered component into `target_dir`.
    ///
    /// Only failure to create the capture tree itself is an error.
    pub async fn capture(&self, target_dir: &Path) -> Result<CaptureResult> {
        let started_at = Utc::now();
        if let Some(parent) = target_dir.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // A capture directory is never reused.
        tokio::fs::create_dir(target_dir).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::AlreadyExists => BackupError::Packaging(format!(
                "capture directory {} already exists",
                target_dir.display()
            )),
            _ => BackupError::Io(e),
        })?;
        for sub in [DATABASE_DIR, FILES_DIR, CONFIG_DIR, LOGS_DIR] {
            tokio::fs::create_dir_all(target_dir.join(sub)).await?;
        }

        info!("Starting capture into {}", target_dir.display());

        let mut result = CaptureResult {
            target_dir: target_dir.to_path_buf(),
            started_at,
            components: BTreeMap::new(),
            errors: Vec::new(),
        };

        let level = self.config.archive.compression_level;
        let db_dir = target_dir.join(DATABASE_DIR);

        let postgres = PostgresEngine::new(self.runtime.as_ref(), &self.config.database)
            .export(&db_dir, level)
            .await;
        self.settle(&mut result, ComponentKind::Postgres, postgres);

        let redis = RedisEngine::new(self.runtime.as_ref(), &self.config.cache)
            .export(&db_dir, level)
            .await;
        self.settle(&mut result, ComponentKind::Redis, redis);

        let files = self.capture_file_trees(&target_dir.join(FILES_DIR)).await;
        self.settle_record(&mut result, ComponentKind::Files, files);

        let config_files = self.capture_config(&target_dir.join(CONFIG_DIR)).await;
        self.settle_record(&mut result, ComponentKind::Config, config_files);

        let logs = self.capture_logs(&target_dir.join(LOGS_DIR)).await;
        self.settle_record(&mut result, ComponentKind::Logs, logs);

        info!(
            "Capture finished: {} included, {} degraded",
            result.included().len(),
            result.components.len() - result.included().len()
        );
        Ok(result)
    }

    /// Fold an engine export into the result, degrading on failure.
    fn settle(&self, result: &mut CaptureResult, kind: ComponentKind, outcome: Result<ExportOutcome>) {
        let record = outcome.map(|export| {
            let payload = export
                .files
                .first()
                .and_then(|p| p.file_name())
                .map(|n| format!("{}/{}", DATABASE_DIR, n.to_string_lossy()))
                .unwrap_or_else(|| DATABASE_DIR.to_string());
            ComponentRecord {
                included: true,
                payload: Some(payload),
                size_bytes: export.size_bytes,
                warnings: export.warnings,
            }
        });
        self.settle_record(result, kind, record);
    }

    fn settle_record(
        &self,
        result: &mut CaptureResult,
        kind: ComponentKind,
        outcome: Result<ComponentRecord>,
    ) {
        let record = match outcome {
            Ok(record) => record,
            Err(e) if !e.is_fatal() => {
                warn!("Component {} not captured: {}", kind, e);
                let record = ComponentRecord::skipped(reason(&e));
                result.errors.push(e);
                record
            }
            Err(e) => {
                warn!("Component {} not captured: {}", kind, e);
                let record = ComponentRecord::skipped(e.to_string());
                result.errors.push(BackupError::component(kind.as_str(), e));
                record
            }
        };
        result.components.insert(kind, record);
    }

    /// Copy the data, uploads and certificate trees into `files/`.
    async fn capture_file_trees(&self, dest: &Path) -> Result<ComponentRecord> {
        let mut warnings = Vec::new();
        let mut copied = CopyStats::default();

        for (name, source) in self.config.file_trees() {
            if !source.is_dir() {
                warn!("Skipping {} tree: {} does not exist", name, source.display());
                warnings.push(format!("{} directory {} not found", name, source.display()));
                continue;
            }

            let target = dest.join(name);
            match tokio::task::spawn_blocking(move || copy_tree(&source, &target)).await {
                Ok(Ok(stats)) => {
                    info!("Copied {} tree ({} files, {} bytes)", name, stats.files, stats.bytes);
                    copied.files += stats.files;
                    copied.bytes += stats.bytes;
                }
                Ok(Err(e)) => warnings.push(format!("{} copy failed: {}", name, e)),
                Err(e) => warnings.push(format!("{} copy task failed: {}", name, e)),
            }
        }

        if copied.files == 0 {
            return Err(BackupError::component(
                "files",
                if warnings.is_empty() {
                    "no files found in data, uploads or certificate trees".to_string()
                } else {
                    warnings.join("; ")
                },
            ));
        }

        let mut record = ComponentRecord::included(FILES_DIR, copied.bytes);
        record.warnings = warnings;
        Ok(record)
    }

    /// Copy environment and deployment descriptors into `config/`.
    async fn capture_config(&self, dest: &Path) -> Result<ComponentRecord> {
        let mut warnings = Vec::new();
        let mut copied = 0usize;

        for file in &self.config.paths.config_files {
            let source = self.config.resolve(file);
            let Some(name) = source.file_name() else {
                continue;
            };
            let target = dest.join(name);

            let outcome = if source.is_dir() {
                let (s, t) = (source.clone(), target.clone());
                tokio::task::spawn_blocking(move || copy_tree(&s, &t).map(|stats| stats.files))
                    .await
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                    .and_then(|r| r)
            } else if source.is_file() {
                tokio::fs::copy(&source, &target).await.map(|_| 1)
            } else {
                warnings.push(format!("{} not found", source.display()));
                continue;
            };

            match outcome {
                Ok(files) => copied += files,
                Err(e) => warnings.push(format!("{} copy failed: {}", source.display(), e)),
            }
        }

        if copied == 0 {
            return Err(BackupError::component(
                "config",
                if warnings.is_empty() {
                    "no configuration files configured".to_string()
                } else {
                    warnings.join("; ")
                },
            ));
        }

        let size = calculate_total_size(dest)?;
        let mut record = ComponentRecord::included(CONFIG_DIR, size);
        record.warnings = warnings;
        Ok(record)
    }

    /// Collect container logs (fanned out per service) and the application
    /// log tree. Large files are compressed individually.
    async fn capture_logs(&self, dest: &Path) -> Result<ComponentRecord> {
        let mut services: Vec<String> = vec![
            self.config.database.service.clone(),
            self.config.cache.service.clone(),
        ];
        services.extend(self.config.services.app.iter().cloned());

        let tail = self.config.services.log_tail_lines;
        let runtime = &self.runtime;
        let fetches = services.iter().map(|service| async move {
            (service.clone(), runtime.logs(service, tail).await)
        });
        let results = join_all(fetches).await;

        let mut warnings = Vec::new();
        let mut written = Vec::new();
        for (service, logs) in results {
            match logs {
                Ok(bytes) if !bytes.is_empty() => {
                    let path = dest.join(format!("{}.log", service));
                    tokio::fs::write(&path, &bytes).await?;
                    written.push(path);
                }
                Ok(_) => {}
                Err(e) => warnings.push(format!("{} logs unavailable: {}", service, e)),
            }
        }

        let app_logs = self.config.resolve(&self.config.paths.logs_dir);
        if app_logs.is_dir() {
            let target = dest.join("app");
            let copied = tokio::task::spawn_blocking(move || copy_tree(&app_logs, &target))
                .await
                .map_err(|e| BackupError::component("logs", e))?;
            match copied {
                Ok(stats) if stats.files > 0 => {
                    for file in walk_directory(&dest.join("app"))? {
                        written.push(file.path);
                    }
                }
                Ok(_) => {}
                Err(e) => warnings.push(format!("application logs copy failed: {}", e)),
            }
        }

        if written.is_empty() {
            return Err(BackupError::component(
                "logs",
                if warnings.is_empty() {
                    "no logs available".to_string()
                } else {
                    warnings.join("; ")
                },
            ));
        }

        let threshold = self.config.archive.large_log_bytes;
        let level = self.config.archive.compression_level;
        let compress_warnings = tokio::task::spawn_blocking(move || {
            let mut failures = Vec::new();
            for path in written {
                let large = std::fs::metadata(&path).map(|m| m.len() > threshold).unwrap_or(false);
                if large {
                    if let Err(e) = compress_file(&path, level) {
                        failures.push(format!("{} compression failed: {}", path.display(), e));
                    }
                }
            }
            failures
        })
        .await
        .map_err(|e| BackupError::component("logs", e))?;
        warnings.extend(compress_warnings);

        let size = calculate_total_size(dest)?;
        let mut record = ComponentRecord::included(LOGS_DIR, size);
        record.warnings = warnings;
        Ok(record)
    }
}

fn reason(error: &BackupError) -> String {
    match error {
        BackupError::ComponentCapture { reason, .. } => reason.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRuntime;
    use std::fs;
    use tempfile::TempDir;

    /// A project directory with data, uploads, config files and app logs.
    fn project() -> (TempDir, Config) {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("data/users")).unwrap();
        fs::create_dir_all(root.join("uploads")).unwrap();
        fs::create_dir_all(root.join("logs")).unwrap();
        fs::write(root.join("data/users/1.json"), b"{\"id\":1}").unwrap();
        fs::write(root.join("uploads/chart.png"), [137u8, 80, 78, 71]).unwrap();
        fs::write(root.join(".env"), b"BOT_TOKEN=secret\n").unwrap();
        fs::write(root.join("docker-compose.yml"), b"services: {}\n").unwrap();
        fs::write(root.join("logs/bot.log"), b"INFO started\n").unwrap();

        let config = Config::default_for(root);
        (temp_dir, config)
    }

    fn orchestrator(config: Config, runtime: FakeRuntime) -> CaptureOrchestrator {
        CaptureOrchestrator::new(Arc::new(config), Arc::new(runtime))
    }

    #[tokio::test]
    async fn test_full_capture_layout() {
        let (temp_dir, config) = project();
        let runtime = FakeRuntime::new()
            .with_running(&["postgres", "redis", "bot", "web_panel", "nginx"])
            .with_container_file("redis", "/data/dump.rdb", b"REDIS0011");
        let target = temp_dir.path().join("backups/backup_20260101_000000");

        let result = orchestrator(config, runtime).capture(&target).await.unwrap();

        assert_eq!(result.included(), ComponentKind::ALL.to_vec());
        assert!(target.join("database/pg_full.sql.zst").exists());
        assert!(target.join("database/redis_dump.rdb.zst").exists());
        assert!(target.join("files/data/users/1.json").exists());
        assert!(target.join("files/uploads/chart.png").exists());
        assert!(target.join("config/.env").exists());
        assert!(target.join("logs/postgres.log").exists());
        assert!(target.join("logs/app/bot.log").exists());

        // ssl/ is absent in the fixture: warned about, not fatal
        let files = &result.components[&ComponentKind::Files];
        assert!(files.included);
        assert!(files.warnings.iter().any(|w| w.contains("ssl")));
        assert_eq!(
            result.components[&ComponentKind::Postgres].payload.as_deref(),
            Some("database/pg_full.sql.zst")
        );
    }

    #[tokio::test]
    async fn test_stopped_engine_degrades() {
        let (temp_dir, config) = project();
        let runtime = FakeRuntime::new()
            .with_running(&["postgres"])
            .with_container_file("redis", "/data/dump.rdb", b"REDIS0011");
        let target = temp_dir.path().join("backups/backup_20260101_000000");

        let result = orchestrator(config, runtime).capture(&target).await.unwrap();

        let redis = &result.components[&ComponentKind::Redis];
        assert!(!redis.included);
        assert!(redis.warnings[0].contains("not running"));
        assert!(result.components[&ComponentKind::Postgres].included);
        assert_eq!(result.errors.len(), 1);
        assert!(!target.join("database/redis_dump.rdb.zst").exists());
    }

    #[tokio::test]
    async fn test_missing_directories_do_not_touch_sources() {
        let temp_dir = TempDir::new().unwrap();
        let config = Config::default_for(temp_dir.path());
        let target = temp_dir.path().join("backups/backup_20260101_000000");

        let result = orchestrator(config, FakeRuntime::new())
            .capture(&target)
            .await
            .unwrap();

        // container logs are still reachable; everything else degrades
        assert_eq!(result.included(), vec![ComponentKind::Logs]);
        assert!(!result.components[&ComponentKind::Files].included);
        assert!(!result.components[&ComponentKind::Config].included);
        assert!(!temp_dir.path().join("data").exists());
    }

    #[tokio::test]
    async fn test_existing_target_is_never_reused() {
        let (temp_dir, config) = project();
        let target = temp_dir.path().join("backups/backup_20260101_000000");
        fs::create_dir_all(target.join("database")).unwrap();
        fs::write(target.join("database/pg_full.sql.zst"), b"earlier").unwrap();

        let err = orchestrator(config, FakeRuntime::new().with_running(&["postgres"]))
            .capture(&target)
            .await
            .unwrap_err();

        assert!(matches!(err, BackupError::Packaging(_)));
        assert_eq!(fs::read(target.join("database/pg_full.sql.zst")).unwrap(), b"earlier");
    }

    #[tokio::test]
    async fn test_trees_without_files_are_not_included() {
        let (temp_dir, config) = project();
        fs::remove_dir_all(temp_dir.path().join("data")).unwrap();
        fs::remove_dir_all(temp_dir.path().join("uploads")).unwrap();
        fs::create_dir_all(temp_dir.path().join("data/empty")).unwrap();
        let target = temp_dir.path().join("backups/backup_20260101_000000");

        let result = orchestrator(config, FakeRuntime::new())
            .capture(&target)
            .await
            .unwrap();

        let files = &result.components[&ComponentKind::Files];
        assert!(!files.included);
        assert!(files.payload.is_none());
    }

    #[tokio::test]
    async fn test_large_logs_compressed_individually() {
        let (temp_dir, mut config) = project();
        fs::write(temp_dir.path().join("logs/huge.log"), vec![b'x'; 4096]).unwrap();
        config.archive.large_log_bytes = 1024;
        let target = temp_dir.path().join("backups/backup_20260101_000000");

        orchestrator(config, FakeRuntime::new())
            .capture(&target)
            .await
            .unwrap();

        assert!(target.join("logs/app/huge.log.zst").exists());
        assert!(!target.join("logs/app/huge.log").exists());
        assert!(target.join("logs/app/bot.log").exists());
    }
}
