//! Key-value engine: persisted snapshot file capture and swap.

use super::{first_line, ExportOutcome};
use crate::config::CacheConfig;
use crate::fs::compress::{compress_file, decompress_file, is_compressed};
use crate::runtime::ServiceRuntime;
use crate::utils::errors::{BackupError, Result};
use std::path::Path;
use tracing::info;

pub const SNAPSHOT_FILE: &str = "redis_dump.rdb";

pub struct RedisEngine<'a> {
    runtime: &'a dyn ServiceRuntime,
    config: &'a CacheConfig,
}

impl<'a> RedisEngine<'a> {
    pub fn new(runtime: &'a dyn ServiceRuntime, config: &'a CacheConfig) -> Self {
        Self { runtime, config }
    }

    /// Force a synchronous save, then copy the persisted snapshot out.
    pub async fn export(&self, dest_dir: &Path, level: i32) -> Result<ExportOutcome> {
        if !self.runtime.is_running(&self.config.service).await? {
            return Err(BackupError::component(
                "redis",
                format!("service {} is not running", self.config.service),
            ));
        }

        self.runtime
            .exec(&self.config.service, &["redis-cli", "SAVE"])
            .await
            .map_err(|e| BackupError::component("redis", e))?;

        let raw = dest_dir.join(SNAPSHOT_FILE);
        self.runtime
            .copy_from(&self.config.service, &self.config.dump_path, &raw)
            .await
            .map_err(|e| BackupError::component("redis", e))?;

        let packed = tokio::task::spawn_blocking(move || compress_file(&raw, level))
            .await
            .map_err(|e| BackupError::component("redis", e))?
            .map_err(|e| BackupError::component("redis", e))?;
        let size_bytes = tokio::fs::metadata(&packed).await?.len();

        info!("Exported cache snapshot ({} bytes compressed)", size_bytes);
        Ok(ExportOutcome {
            files: vec![packed],
            size_bytes,
            warnings: Vec::new(),
        })
    }

    pub async fn version(&self) -> Option<String> {
        self.runtime
            .exec(&self.config.service, &["redis-server", "--version"])
            .await
            .ok()
            .and_then(|out| first_line(&out))
    }

    /// Stop the engine and swap its persisted snapshot for `snapshot`.
    ///
    /// The engine is left stopped; the caller restarts it with the rest of
    /// the stack so it loads the new file on boot.
    pub async fn restore(&self, snapshot: &Path, scratch: &Path) -> Result<()> {
        let service = vec![self.config.service.clone()];
        self.runtime.stop(&service).await?;

        let plain = if is_compressed(snapshot) {
            let target = scratch.join(SNAPSHOT_FILE);
            let (src, dest) = (snapshot.to_path_buf(), target.clone());
            tokio::task::spawn_blocking(move || decompress_file(&src, &dest))
                .await
                .map_err(|e| BackupError::Runtime(e.to_string()))??;
            target
        } else {
            snapshot.to_path_buf()
        };

        self.runtime
            .copy_to(&self.config.service, &plain, &self.config.dump_path)
            .await?;

        info!("Swapped cache snapshot into {}", self.config.dump_path);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::compress::compress_file;
    use crate::testing::FakeRuntime;
    use tempfile::TempDir;

    fn cache_config() -> CacheConfig {
        CacheConfig {
            service: "redis".to_string(),
            dump_path: "/data/dump.rdb".to_string(),
        }
    }

    #[tokio::test]
    async fn test_export_saves_then_copies() {
        let temp_dir = TempDir::new().unwrap();
        let runtime = FakeRuntime::new()
            .with_running(&["redis"])
            .with_container_file("redis", "/data/dump.rdb", b"REDIS0011snapshot");
        let config = cache_config();

        let outcome = RedisEngine::new(&runtime, &config)
            .export(temp_dir.path(), 3)
            .await
            .unwrap();

        assert_eq!(outcome.files, vec![temp_dir.path().join("redis_dump.rdb.zst")]);
        let calls = runtime.calls();
        let save = calls.iter().position(|c| c.contains("redis-cli SAVE")).unwrap();
        let copy = calls.iter().position(|c| c.starts_with("copy_from redis")).unwrap();
        assert!(save < copy);
    }

    #[tokio::test]
    async fn test_restore_swaps_while_stopped() {
        let temp_dir = TempDir::new().unwrap();
        let snapshot = temp_dir.path().join("redis_dump.rdb");
        std::fs::write(&snapshot, b"REDIS0011restored").unwrap();
        let packed = compress_file(&snapshot, 3).unwrap();

        let runtime = FakeRuntime::new().with_running(&["redis"]);
        let config = cache_config();
        RedisEngine::new(&runtime, &config)
            .restore(&packed, temp_dir.path())
            .await
            .unwrap();

        assert!(!runtime.running("redis"));
        assert_eq!(
            runtime.container_file("redis", "/data/dump.rdb"),
            Some(b"REDIS0011restored".to_vec())
        );
    }
}
