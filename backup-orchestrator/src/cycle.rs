//! Cycle driver: wires preflight, capture, metadata, archive, verification,
//! replication, retention and notification into the `backup` command, and
//! hosts the `list`, `cleanup`, `verify` and `restore` commands.

use crate::archive::{artifact_name, Archiver, BackupArtifact, VerifyReport, ARTIFACT_EXTENSION, ARTIFACT_PREFIX};
use crate::capture::CaptureOrchestrator;
use crate::config::Config;
use crate::lock::CycleLock;
use crate::metadata::manifest::ComponentKind;
use crate::metadata::MetadataRecorder;
use crate::notify::{self, NotificationEvent, Notifier};
use crate::preflight::check_environment;
use crate::replication::{ObjectStore, RemoteStore, ReplicationOutcome, Replicator, S3ObjectStore};
use crate::restore::confirm::ConfirmationProvider;
use crate::restore::{RestoreController, RestoreSession, SAFETY_SNAPSHOT_PREFIX, SCRATCH_PREFIX};
use crate::retention::{enforce_retention, sort_newest_first, ArtifactStore, LocalStore, StoredArtifact};
use crate::runtime::{ComposeRuntime, ServiceRuntime};
use crate::utils::errors::{BackupError, Result};
use chrono::Utc;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

pub const INVALID_SUFFIX: &str = ".invalid";

/// Outcome of a successful backup cycle.
#[derive(Debug)]
pub struct BackupReport {
    pub artifact: BackupArtifact,
    pub replication: ReplicationOutcome,
    pub local_deleted: Vec<String>,
    pub remote_deleted: Vec<String>,
    /// Degraded components, replication and retention problems
    pub warnings: Vec<String>,
    pub duration: Duration,
}

impl BackupReport {
    pub fn summary(&self) -> String {
        let mut out = String::new();
        let components: Vec<&str> = self.artifact.components.iter().map(ComponentKind::as_str).collect();
        let _ = writeln!(out, "Artifact:   {}", self.artifact.path.display());
        let _ = writeln!(out, "Size:       {} bytes", self.artifact.size_bytes);
        let _ = writeln!(out, "Components: {}", components.join(", "));
        match &self.replication {
            ReplicationOutcome::Disabled => {
                let _ = writeln!(out, "Remote:     disabled");
            }
            ReplicationOutcome::Uploaded { key, local_deleted, .. } => {
                let _ = writeln!(
                    out,
                    "Remote:     {}{}",
                    key,
                    if *local_deleted { " (local copy removed)" } else { "" }
                );
            }
            ReplicationOutcome::Failed { reason } => {
                let _ = writeln!(out, "Remote:     FAILED ({})", reason);
            }
        }
        if !self.local_deleted.is_empty() || !self.remote_deleted.is_empty() {
            let _ = writeln!(
                out,
                "Retention:  removed {} local, {} remote",
                self.local_deleted.len(),
                self.remote_deleted.len()
            );
        }
        if !self.warnings.is_empty() {
            let _ = writeln!(out, "Warnings:");
            for warning in &self.warnings {
                let _ = writeln!(out, "  - {}", warning);
            }
        }
        out
    }
}

#[derive(Debug, Default)]
pub struct ArtifactListing {
    pub local: Vec<StoredArtifact>,
    /// `None` when replication is not configured or the listing failed
    pub remote: Option<Vec<StoredArtifact>>,
}

#[derive(Debug, Default)]
pub struct CleanupReport {
    pub local_deleted: Vec<String>,
    pub remote_deleted: Vec<String>,
    pub stale_dirs: Vec<PathBuf>,
}

pub struct Orchestrator {
    config: Arc<Config>,
    runtime: Arc<dyn ServiceRuntime>,
    notifier: Arc<dyn Notifier>,
    remote: Option<Arc<dyn ObjectStore>>,
}

impl Orchestrator {
    pub fn new(
        config: Arc<Config>,
        runtime: Arc<dyn ServiceRuntime>,
        notifier: Arc<dyn Notifier>,
        remote: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        Self {
            config,
            runtime,
            notifier,
            remote,
        }
    }

    /// Production wiring: compose runtime, S3 store and Telegram sink as
    /// configured.
    pub fn from_config(config: Config) -> Self {
        let config = Arc::new(config);
        let runtime: Arc<dyn ServiceRuntime> = Arc::new(ComposeRuntime::new(&config));
        let notifier = notify::from_config(config.notify.as_ref());

        let remote = config.remote.as_ref().and_then(|remote| {
            match S3ObjectStore::new(remote) {
                Ok(store) => Some(Arc::new(store) as Arc<dyn ObjectStore>),
                Err(e) => {
                    warn!("Remote replication disabled: {}", e);
                    None
                }
            }
        });

        Self::new(config, runtime, notifier, remote)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn backup_dir(&self) -> PathBuf {
        self.config.resolve(&self.config.paths.backup_dir)
    }

    fn local_store(&self) -> LocalStore {
        LocalStore::new(self.backup_dir())
    }

    fn archiver(&self) -> Archiver {
        Archiver::new(self.config.archive.min_artifact_bytes)
    }

    /// Run one backup cycle. Exactly one notification is sent, whatever
    /// the outcome.
    pub async fn run_backup(&self) -> Result<BackupReport> {
        let started = Instant::now();
        let name = artifact_name(Utc::now());

        let outcome = self.backup_cycle(&name, started).await;
        let file_name = format!("{}{}", name, ARTIFACT_EXTENSION);
        let event = match &outcome {
            Ok(report) => NotificationEvent::success(
                "backup",
                started.elapsed(),
                Some(report.artifact.file_name()),
                report.summary(),
            ),
            Err(e) => {
                let artifact = matches!(e, BackupError::Packaging(_) | BackupError::Verification(_))
                    .then_some(file_name);
                NotificationEvent::failure("backup", started.elapsed(), artifact, e.to_string())
            }
        };
        self.notifier.report(&event).await;
        outcome
    }

    async fn backup_cycle(&self, name: &str, started: Instant) -> Result<BackupReport> {
        check_environment(&self.config, self.runtime.as_ref()).await?;
        let _lock = CycleLock::try_acquire(self.config.lock_path())?;

        let backup_dir = self.backup_dir();
        tokio::fs::create_dir_all(&backup_dir).await?;
        let target = backup_dir.join(name);
        let existing = backup_dir.join(format!("{}{}", name, ARTIFACT_EXTENSION));
        if tokio::fs::try_exists(&existing).await? {
            return Err(BackupError::Packaging(format!(
                "{} already exists",
                existing.display()
            )));
        }
        info!("Backup cycle {} started", name);

        let capture = CaptureOrchestrator::new(self.config.clone(), self.runtime.clone())
            .capture(&target)
            .await?;
        let manifest = MetadataRecorder::new(self.config.clone(), self.runtime.clone())
            .record(&capture, &target)
            .await;
        let mut warnings = manifest.notes.clone();

        let archiver = self.archiver();
        let artifact = archiver.seal(&target).await?;
        if let Err(e) = archiver.verify(&artifact.path).await {
            mark_invalid(&artifact.path).await;
            return Err(e);
        }

        let replicator = Replicator::new(
            self.remote.clone(),
            self.config
                .remote
                .as_ref()
                .map(|r| r.delete_local_after_upload)
                .unwrap_or(false),
        );
        let replication = replicator.replicate(&artifact).await;
        if let ReplicationOutcome::Failed { reason } = &replication {
            warnings.push(BackupError::Replication(reason.clone()).to_string());
        }

        let protect = artifact.file_name();
        let local_deleted = match enforce_retention(
            &self.local_store(),
            self.config.retention.local_max_count,
            Some(&protect),
        )
        .await
        {
            Ok(deleted) => deleted,
            Err(e) => {
                warn!("Local retention failed: {}", e);
                warnings.push(format!("local retention failed: {}", e));
                Vec::new()
            }
        };

        let mut remote_deleted = Vec::new();
        if let Some(store) = &self.remote {
            match enforce_retention(
                &RemoteStore::new(store.clone()),
                self.config.retention.remote_max_count,
                Some(&protect),
            )
            .await
            {
                Ok(deleted) => remote_deleted = deleted,
                Err(e) => {
                    warn!("Remote retention failed: {}", e);
                    warnings.push(format!("remote retention failed: {}", e));
                }
            }
        }

        info!("Backup cycle {} finished in {:?}", name, started.elapsed());
        Ok(BackupReport {
            artifact,
            replication,
            local_deleted,
            remote_deleted,
            warnings,
            duration: started.elapsed(),
        })
    }

    /// Local artifacts newest first, plus remote ones when configured.
    pub async fn list(&self) -> Result<ArtifactListing> {
        let mut local = self.local_store().list().await?;
        sort_newest_first(&mut local);

        let remote = match &self.remote {
            Some(store) => match RemoteStore::new(store.clone()).list().await {
                Ok(mut remote) => {
                    sort_newest_first(&mut remote);
                    Some(remote)
                }
                Err(e) => {
                    warn!("Could not list remote artifacts: {}", e);
                    None
                }
            },
            None => None,
        };

        Ok(ArtifactListing { local, remote })
    }

    /// Enforce retention on both stores and drop directories abandoned by
    /// interrupted runs.
    pub async fn cleanup(&self) -> Result<CleanupReport> {
        let _lock = CycleLock::try_acquire(self.config.lock_path())?;
        let mut report = CleanupReport::default();

        report.local_deleted = enforce_retention(
            &self.local_store(),
            self.config.retention.local_max_count,
            None,
        )
        .await?;

        if let Some(store) = &self.remote {
            match enforce_retention(
                &RemoteStore::new(store.clone()),
                self.config.retention.remote_max_count,
                None,
            )
            .await
            {
                Ok(deleted) => report.remote_deleted = deleted,
                Err(e) => warn!("Remote retention failed: {}", e),
            }
        }

        report.stale_dirs = remove_stale_dirs(&self.backup_dir()).await?;
        Ok(report)
    }

    pub async fn verify(&self, artifact: &str) -> Result<VerifyReport> {
        let path = self.resolve_artifact(artifact);
        self.archiver().verify(&path).await
    }

    /// Restore from `artifact`. Declining sends no notification; every
    /// other outcome sends exactly one.
    pub async fn restore(
        &self,
        artifact: &str,
        confirmation: Arc<dyn ConfirmationProvider>,
    ) -> Result<RestoreSession> {
        let started = Instant::now();
        let path = self.resolve_artifact(artifact);
        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string());

        let outcome = self.restore_locked(&path, confirmation).await;

        let event = match &outcome {
            Ok(session) => {
                let mut detail = format!(
                    "Restored: {}",
                    session
                        .restored()
                        .iter()
                        .map(ComponentKind::as_str)
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                if let Some(snapshot) = &session.safety_snapshot {
                    let _ = write!(detail, "\nSafety snapshot: {}", snapshot.display());
                }
                for warning in &session.warnings {
                    let _ = write!(detail, "\n  - {}", warning);
                }
                Some(NotificationEvent::success("restore", started.elapsed(), file_name, detail))
            }
            Err(BackupError::RestoreDeclined) => None,
            Err(e) => Some(NotificationEvent::failure(
                "restore",
                started.elapsed(),
                file_name,
                e.to_string(),
            )),
        };
        if let Some(event) = event {
            self.notifier.report(&event).await;
        }
        outcome
    }

    async fn restore_locked(
        &self,
        path: &Path,
        confirmation: Arc<dyn ConfirmationProvider>,
    ) -> Result<RestoreSession> {
        check_environment(&self.config, self.runtime.as_ref()).await?;
        let _lock = CycleLock::try_acquire(self.config.lock_path())?;
        RestoreController::new(self.config.clone(), self.runtime.clone(), confirmation)
            .restore(path)
            .await
    }

    /// A path as given, or a name looked up in the backup directory.
    pub fn resolve_artifact(&self, artifact: &str) -> PathBuf {
        let given = PathBuf::from(artifact);
        if given.is_file() || given.components().count() > 1 {
            return given;
        }
        let in_dir = self.backup_dir().join(artifact);
        if in_dir.is_file() || artifact.ends_with(ARTIFACT_EXTENSION) {
            return in_dir;
        }
        self.backup_dir().join(format!("{}{}", artifact, ARTIFACT_EXTENSION))
    }
}

/// Keep a failed artifact out of retention and replication.
async fn mark_invalid(path: &Path) {
    let mut invalid = path.as_os_str().to_owned();
    invalid.push(INVALID_SUFFIX);
    match tokio::fs::rename(path, &invalid).await {
        Ok(()) => warn!("Artifact failed verification, moved to {}", PathBuf::from(invalid).display()),
        Err(e) => warn!("Artifact failed verification and could not be renamed: {}", e),
    }
}

/// Remove `backup_<ts>/` and `restore_<ts>/` directories in `dir`.
async fn remove_stale_dirs(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(removed),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let name = entry.file_name().to_string_lossy().to_string();
        // Only directories: sealed artifacts and safety snapshots are files.
        let stale = [ARTIFACT_PREFIX, SCRATCH_PREFIX, SAFETY_SNAPSHOT_PREFIX]
            .iter()
            .any(|prefix| name.starts_with(prefix));
        if !stale || !entry.file_type().await?.is_dir() {
            continue;
        }
        match tokio::fs::remove_dir_all(entry.path()).await {
            Ok(()) => {
                info!("Removed stale directory {}", entry.path().display());
                removed.push(entry.path());
            }
            Err(e) => warn!("Could not remove {}: {}", entry.path().display(), e),
        }
    }
    Ok(removed)
}
