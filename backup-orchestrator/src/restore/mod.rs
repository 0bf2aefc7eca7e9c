//! Restore controller.
//!
//! ```text
//! Idle -> Confirmed -> SafetySnapshot -> ServicesStopped -> Extracted
//!      -> ComponentsRestored -> ServicesStarted -> Done
//! ```
//!
//! `Aborted` is reachable from `Idle` only (confirmation declined), and
//! nothing has been touched at that point. `Failed` is reachable from any
//! state after confirmation. There is no automatic rollback: a failure
//! surfaces the safety snapshot so an operator can recover by hand, and
//! stopped services are left stopped.

pub mod confirm;

use crate::archive::{extract, write_archive, Archiver};
use crate::capture::{CONFIG_DIR, DATABASE_DIR, FILES_DIR};
use crate::config::Config;
use crate::engines::postgres::FULL_DUMP;
use crate::engines::redis::SNAPSHOT_FILE;
use crate::engines::{PostgresEngine, RedisEngine};
use crate::fs::compress::ZSTD_EXTENSION;
use crate::fs::walker::replace_tree;
use crate::metadata::manifest::ComponentKind;
use crate::runtime::ServiceRuntime;
use crate::utils::errors::{BackupError, Result};
use chrono::Utc;
use confirm::ConfirmationProvider;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};

pub const SAFETY_SNAPSHOT_PREFIX: &str = "pre_restore_";
pub const SCRATCH_PREFIX: &str = "restore_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    Idle,
    Confirmed,
    SafetySnapshot,
    ServicesStopped,
    Extracted,
    ComponentsRestored,
    ServicesStarted,
    Done,
    Aborted,
    Failed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ComponentOutcome {
    Restored,
    Skipped(String),
    Failed(String),
}

/// One restore invocation. Dropped once services are back up or the
/// session has failed.
#[derive(Debug)]
pub struct RestoreSession {
    pub artifact: PathBuf,
    pub safety_snapshot: Option<PathBuf>,
    pub state: RestoreState,
    pub components: BTreeMap<ComponentKind, ComponentOutcome>,
    pub warnings: Vec<String>,
}

impl RestoreSession {
    fn new(artifact: &Path) -> Self {
        Self {
            artifact: artifact.to_path_buf(),
            safety_snapshot: None,
            state: RestoreState::Idle,
            components: BTreeMap::new(),
            warnings: Vec::new(),
        }
    }

    fn advance(&mut self, next: RestoreState) {
        info!("Restore: {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Move to `Failed` and build the error that carries the snapshot.
    fn fail(&mut self, stage: &str, reason: impl ToString) -> BackupError {
        let reason = reason.to_string();
        error!("Restore failed during {} ({:?}): {}", stage, self.state, reason);
        self.state = RestoreState::Failed;
        BackupError::RestoreFatal {
            stage: stage.to_string(),
            reason,
            safety_snapshot: self.safety_snapshot.clone(),
        }
    }

    fn skip(&mut self, kind: ComponentKind) {
        let missing = BackupError::RestoreComponentMissing(kind.to_string());
        warn!("{}; leaving current {} untouched", missing, kind);
        self.warnings.push(missing.to_string());
        self.components
            .insert(kind, ComponentOutcome::Skipped("no payload in artifact".into()));
    }

    pub fn restored(&self) -> Vec<ComponentKind> {
        self.components
            .iter()
            .filter(|(_, o)| **o == ComponentOutcome::Restored)
            .map(|(k, _)| *k)
            .collect()
    }
}

pub struct RestoreController {
    config: Arc<Config>,
    runtime: Arc<dyn ServiceRuntime>,
    confirmation: Arc<dyn ConfirmationProvider>,
    archiver: Archiver,
}

impl RestoreController {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn ServiceRuntime>,
        confirmation: Arc<dyn ConfirmationProvider>,
    ) -> Self {
        let archiver = Archiver::new(config.archive.min_artifact_bytes);
        Self {
            config,
            runtime,
            confirmation,
            archiver,
        }
    }

    /// Replace live state with the contents of `artifact`.
    ///
    /// Returns `RestoreDeclined` when the operator says no, a verification
    /// error when the artifact is unusable (nothing touched in either case),
    /// and `RestoreFatal` for anything after confirmation.
    pub async fn restore(&self, artifact: &Path) -> Result<RestoreSession> {
        let mut session = RestoreSession::new(artifact);

        self.archiver.verify(artifact).await?;

        let prompt = format!(
            "Restore {} into {}? Application services will be stopped and live data replaced",
            artifact.display(),
            self.config.project.dir.display()
        );
        if !self.confirmation.confirm(&prompt).await {
            session.advance(RestoreState::Aborted);
            return Err(BackupError::RestoreDeclined);
        }
        session.advance(RestoreState::Confirmed);

        let stamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let backup_dir = self.config.resolve(&self.config.paths.backup_dir);

        let snapshot = backup_dir.join(format!("{}{}.tar.gz", SAFETY_SNAPSHOT_PREFIX, stamp));
        match self.safety_snapshot(&snapshot, &mut session.warnings).await {
            Ok(()) => session.safety_snapshot = Some(snapshot),
            Err(e) => return Err(session.fail("safety snapshot", e)),
        }
        session.advance(RestoreState::SafetySnapshot);

        let mut app_services = self.config.services.app.clone();
        app_services.reverse();
        if let Err(e) = self.runtime.stop(&app_services).await {
            return Err(session.fail("stopping services", e));
        }
        session.advance(RestoreState::ServicesStopped);

        let scratch = backup_dir.join(format!("{}{}", SCRATCH_PREFIX, stamp));
        let (src, dest) = (artifact.to_path_buf(), scratch.clone());
        let root = match tokio::task::spawn_blocking(move || extract(&src, &dest)).await {
            Ok(Ok(root)) => root,
            Ok(Err(e)) => return Err(session.fail("extraction", e)),
            Err(e) => return Err(session.fail("extraction", e)),
        };
        session.advance(RestoreState::Extracted);

        self.restore_components(&root, &scratch, &mut session).await?;
        session.advance(RestoreState::ComponentsRestored);

        if let Err(e) = self.start_services().await {
            return Err(session.fail("starting services", e));
        }
        session.advance(RestoreState::ServicesStarted);

        if let Err(e) = tokio::fs::remove_dir_all(&scratch).await {
            warn!("Could not remove restore scratch {}: {}", scratch.display(), e);
        }
        session.advance(RestoreState::Done);
        Ok(session)
    }

    /// Archive the live file trees, the configuration files and, when the
    /// database answers, a fresh dump.
    async fn safety_snapshot(&self, dest: &Path, warnings: &mut Vec<String>) -> Result<()> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent).await?;

        let mut sources: Vec<(String, PathBuf)> = self
            .config
            .file_trees()
            .into_iter()
            .map(|(name, path)| (format!("{}/{}", FILES_DIR, name), path))
            .collect();
        for file in &self.config.paths.config_files {
            let path = self.config.resolve(file);
            if let Some(name) = path.file_name() {
                sources.push((format!("{}/{}", CONFIG_DIR, name.to_string_lossy()), path.clone()));
            }
        }

        let staging = dest.with_extension("staging");
        let db_dir = staging.join(DATABASE_DIR);
        tokio::fs::create_dir_all(&db_dir).await?;
        match PostgresEngine::new(self.runtime.as_ref(), &self.config.database)
            .export(&db_dir, self.config.archive.compression_level)
            .await
        {
            Ok(_) => sources.push((DATABASE_DIR.to_string(), db_dir.clone())),
            Err(e) => {
                warn!("Safety snapshot has no database dump: {}", e);
                warnings.push(format!("safety snapshot has no database dump: {}", e));
            }
        }

        let target = dest.to_path_buf();
        let packed = tokio::task::spawn_blocking(move || write_archive(&target, &sources))
            .await
            .map_err(|e| BackupError::Runtime(e.to_string()))?;
        if let Err(e) = tokio::fs::remove_dir_all(&staging).await {
            warn!("Could not remove snapshot staging {}: {}", staging.display(), e);
        }
        let packed = packed?;

        info!("Safety snapshot written to {} ({} sources)", dest.display(), packed);
        Ok(())
    }

    async fn restore_components(
        &self,
        root: &Path,
        scratch: &Path,
        session: &mut RestoreSession,
    ) -> Result<()> {
        // File trees: each present subtree fully replaces its live directory.
        let mut restored_trees = 0;
        for (name, live) in self.config.file_trees() {
            let payload = root.join(FILES_DIR).join(name);
            if !payload.is_dir() {
                continue;
            }
            let target = live.clone();
            match tokio::task::spawn_blocking(move || replace_tree(&payload, &target)).await {
                Ok(Ok(stats)) => {
                    info!("Restored {} ({} files) into {}", name, stats.files, live.display());
                    restored_trees += 1;
                }
                Ok(Err(e)) => {
                    session.components.insert(ComponentKind::Files, ComponentOutcome::Failed(e.to_string()));
                    return Err(session.fail("restoring files", e));
                }
                Err(e) => return Err(session.fail("restoring files", e)),
            }
        }
        if restored_trees > 0 {
            session.components.insert(ComponentKind::Files, ComponentOutcome::Restored);
        } else {
            session.skip(ComponentKind::Files);
        }

        // Configuration: each configured file present in the artifact
        // replaces the live one.
        let mut restored_configs = 0;
        for file in &self.config.paths.config_files {
            let live = self.config.resolve(file);
            let Some(name) = live.file_name() else {
                continue;
            };
            let payload = root.join(CONFIG_DIR).join(name);
            let outcome = if payload.is_dir() {
                let (src, dest) = (payload.clone(), live.clone());
                tokio::task::spawn_blocking(move || replace_tree(&src, &dest).map(|_| ()))
                    .await
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))
                    .and_then(|r| r)
            } else if payload.is_file() {
                tokio::fs::copy(&payload, &live).await.map(|_| ())
            } else {
                continue;
            };
            if let Err(e) = outcome {
                session.components.insert(ComponentKind::Config, ComponentOutcome::Failed(e.to_string()));
                return Err(session.fail("restoring configuration", e));
            }
            restored_configs += 1;
        }
        if restored_configs > 0 {
            session.components.insert(ComponentKind::Config, ComponentOutcome::Restored);
        } else {
            session.skip(ComponentKind::Config);
        }

        match find_payload(&root.join(DATABASE_DIR), FULL_DUMP) {
            Some(dump) => {
                let engine = PostgresEngine::new(self.runtime.as_ref(), &self.config.database);
                if let Err(e) = engine.restore(&dump).await {
                    session.components.insert(ComponentKind::Postgres, ComponentOutcome::Failed(e.to_string()));
                    return Err(session.fail("restoring database", e));
                }
                session.components.insert(ComponentKind::Postgres, ComponentOutcome::Restored);
            }
            None => session.skip(ComponentKind::Postgres),
        }

        match find_payload(&root.join(DATABASE_DIR), SNAPSHOT_FILE) {
            Some(snapshot) => {
                let engine = RedisEngine::new(self.runtime.as_ref(), &self.config.cache);
                if let Err(e) = engine.restore(&snapshot, scratch).await {
                    session.components.insert(ComponentKind::Redis, ComponentOutcome::Failed(e.to_string()));
                    return Err(session.fail("restoring cache", e));
                }
                session.components.insert(ComponentKind::Redis, ComponentOutcome::Restored);
            }
            None => session.skip(ComponentKind::Redis),
        }

        Ok(())
    }

    /// Engines first, then application services in configured order.
    async fn start_services(&self) -> Result<()> {
        self.runtime
            .start(&[self.config.database.service.clone()])
            .await?;
        self.runtime.start(&[self.config.cache.service.clone()]).await?;
        self.runtime.start(&self.config.services.app).await
    }
}

/// `<dir>/<name>.zst`, falling back to the uncompressed `<dir>/<name>`.
fn find_payload(dir: &Path, name: &str) -> Option<PathBuf> {
    let compressed = dir.join(format!("{}.{}", name, ZSTD_EXTENSION));
    if compressed.is_file() {
        return Some(compressed);
    }
    let plain = dir.join(name);
    plain.is_file().then_some(plain)
}
