//! Retention - keep the newest N artifacts in a store.

use crate::archive::{parse_artifact_name, ARTIFACT_EXTENSION, ARTIFACT_PREFIX};
use crate::utils::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use tracing::{info, warn};

/// One artifact as a store reports it.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredArtifact {
    /// File name, e.g. `backup_20260101_030000.tar.gz`
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

/// A place artifacts accumulate in.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    fn label(&self) -> &str;

    /// Artifacts following the `backup_<ts>.tar.gz` convention, any order.
    async fn list(&self) -> Result<Vec<StoredArtifact>>;

    async fn delete(&self, name: &str) -> Result<()>;
}

/// Local backup directory.
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }
}

#[async_trait]
impl ArtifactStore for LocalStore {
    fn label(&self) -> &str {
        "local"
    }

    async fn list(&self) -> Result<Vec<StoredArtifact>> {
        let mut artifacts = Vec::new();
        let mut entries = match tokio::fs::read_dir(&self.dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(artifacts),
            Err(e) => return Err(e.into()),
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name().to_string_lossy().to_string();
            if !is_artifact_file(&name) {
                continue;
            }
            let Some(created_at) = parse_artifact_name(&name) else {
                continue;
            };
            let metadata = entry.metadata().await?;
            if !metadata.is_file() {
                continue;
            }
            artifacts.push(StoredArtifact {
                name,
                created_at,
                size_bytes: metadata.len(),
            });
        }
        Ok(artifacts)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        tokio::fs::remove_file(self.dir.join(name)).await?;
        Ok(())
    }
}

/// `backup_<ts>.tar.gz` only; safety snapshots and `.invalid` files never match.
pub fn is_artifact_file(name: &str) -> bool {
    name.starts_with(ARTIFACT_PREFIX) && name.ends_with(ARTIFACT_EXTENSION)
}

/// Newest first, name as tie-break so the order is total.
pub fn sort_newest_first(artifacts: &mut [StoredArtifact]) {
    artifacts.sort_by(|a, b| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| b.name.cmp(&a.name))
    });
}

/// Delete everything beyond the newest `max_count` artifacts.
///
/// `protect` names the artifact just produced by this cycle. It is never
/// deleted and always counts toward `max_count`, so the store holds at most
/// `max_count` artifacts afterwards. Running twice in a row deletes nothing
/// the second time. A failed delete is logged and skipped.
pub async fn enforce_retention(
    store: &dyn ArtifactStore,
    max_count: usize,
    protect: Option<&str>,
) -> Result<Vec<String>> {
    let mut artifacts = store.list().await?;
    sort_newest_first(&mut artifacts);

    let protected_present = protect
        .map(|p| artifacts.iter().any(|a| a.name == p))
        .unwrap_or(false);
    let mut keep_budget = max_count.saturating_sub(usize::from(protected_present));

    let mut deleted = Vec::new();
    for artifact in &artifacts {
        if Some(artifact.name.as_str()) == protect {
            continue;
        }
        if keep_budget > 0 {
            keep_budget -= 1;
            continue;
        }
        match store.delete(&artifact.name).await {
            Ok(()) => {
                info!("Retention ({}): removed {}", store.label(), artifact.name);
                deleted.push(artifact.name.clone());
            }
            Err(e) => warn!(
                "Retention ({}): could not remove {}: {}",
                store.label(),
                artifact.name,
                e
            ),
        }
    }

    if deleted.is_empty() {
        info!(
            "Retention ({}): {} artifact(s), nothing to remove",
            store.label(),
            artifacts.len()
        );
    }
    Ok(deleted)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn seed(dir: &std::path::Path, names: &[&str]) {
        for name in names {
            fs::write(dir.join(name), b"artifact").unwrap();
        }
    }

    async fn remaining(store: &LocalStore) -> Vec<String> {
        let mut list = store.list().await.unwrap();
        sort_newest_first(&mut list);
        list.into_iter().map(|a| a.name).collect()
    }

    #[tokio::test]
    async fn test_keeps_newest_and_is_idempotent() {
        let temp_dir = TempDir::new().unwrap();
        seed(
            temp_dir.path(),
            &[
                "backup_20260101_000000.tar.gz",
                "backup_20260102_000000.tar.gz",
                "backup_20260103_000000.tar.gz",
                "backup_20260104_000000.tar.gz",
                "backup_20260105_000000.tar.gz",
            ],
        );
        let store = LocalStore::new(temp_dir.path());

        let deleted = enforce_retention(&store, 3, None).await.unwrap();
        assert_eq!(
            deleted,
            vec![
                "backup_20260102_000000.tar.gz".to_string(),
                "backup_20260101_000000.tar.gz".to_string()
            ]
        );
        assert_eq!(
            remaining(&store).await,
            vec![
                "backup_20260105_000000.tar.gz",
                "backup_20260104_000000.tar.gz",
                "backup_20260103_000000.tar.gz"
            ]
        );

        assert!(enforce_retention(&store, 3, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_max_one_with_two_artifacts_deletes_oldest() {
        let temp_dir = TempDir::new().unwrap();
        seed(
            temp_dir.path(),
            &["backup_20260101_000000.tar.gz", "backup_20260102_000000.tar.gz"],
        );
        let store = LocalStore::new(temp_dir.path());

        let deleted = enforce_retention(&store, 1, None).await.unwrap();
        assert_eq!(deleted, vec!["backup_20260101_000000.tar.gz".to_string()]);
        assert_eq!(remaining(&store).await, vec!["backup_20260102_000000.tar.gz"]);
    }

    #[tokio::test]
    async fn test_max_one_keeps_only_current() {
        let temp_dir = TempDir::new().unwrap();
        seed(
            temp_dir.path(),
            &[
                "backup_20260101_000000.tar.gz",
                "backup_20260102_000000.tar.gz",
                "backup_20260103_000000.tar.gz",
            ],
        );
        let store = LocalStore::new(temp_dir.path());

        let deleted = enforce_retention(&store, 1, Some("backup_20260103_000000.tar.gz"))
            .await
            .unwrap();
        assert_eq!(deleted.len(), 2);
        assert_eq!(remaining(&store).await, vec!["backup_20260103_000000.tar.gz"]);
    }

    #[tokio::test]
    async fn test_protected_artifact_survives_even_if_older() {
        let temp_dir = TempDir::new().unwrap();
        seed(
            temp_dir.path(),
            &["backup_20260101_000000.tar.gz", "backup_20260301_000000.tar.gz"],
        );
        let store = LocalStore::new(temp_dir.path());

        enforce_retention(&store, 1, Some("backup_20260101_000000.tar.gz"))
            .await
            .unwrap();
        assert_eq!(remaining(&store).await, vec!["backup_20260101_000000.tar.gz"]);
    }

    #[tokio::test]
    async fn test_ignores_foreign_files() {
        let temp_dir = TempDir::new().unwrap();
        seed(
            temp_dir.path(),
            &[
                "backup_20260101_000000.tar.gz",
                "backup_20260102_000000.tar.gz.invalid",
                "pre_restore_20260101_000000.tar.gz",
                "notes.txt",
            ],
        );
        fs::create_dir(temp_dir.path().join("backup_20260103_000000")).unwrap();
        let store = LocalStore::new(temp_dir.path());

        let deleted = enforce_retention(&store, 0, None).await.unwrap();
        assert_eq!(deleted, vec!["backup_20260101_000000.tar.gz".to_string()]);
        assert!(temp_dir.path().join("pre_restore_20260101_000000.tar.gz").exists());
        assert!(temp_dir.path().join("backup_20260102_000000.tar.gz.invalid").exists());
        assert!(temp_dir.path().join("backup_20260103_000000").is_dir());
    }

    #[tokio::test]
    async fn test_missing_dir_lists_empty() {
        let temp_dir = TempDir::new().unwrap();
        let store = LocalStore::new(temp_dir.path().join("nope"));
        assert!(store.list().await.unwrap().is_empty());
    }
}
