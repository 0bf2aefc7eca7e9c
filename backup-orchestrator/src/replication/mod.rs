//! Off-site replication to an S3-compatible object store.
//!
//! Replication is optional and never fails a cycle: an upload error leaves
//! the local artifact in place and is reported as a warning.

use crate::archive::{parse_artifact_name, BackupArtifact};
use crate::config::{RemoteConfig, REMOTE_PREFIX};
use crate::retention::{is_artifact_file, ArtifactStore, StoredArtifact};
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use s3::creds::Credentials;
use s3::{Bucket, Region};
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ObjectInfo {
    pub key: String,
    pub size_bytes: u64,
    pub last_modified: DateTime<Utc>,
}

/// Minimal object store surface used by replication and remote retention.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Upload `path` under `key`; returns the bytes sent.
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64>;
    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

pub struct S3ObjectStore {
    bucket: Box<Bucket>,
}

impl S3ObjectStore {
    /// Credentials come from the standard AWS environment/profile chain.
    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let region = match &config.endpoint {
            Some(endpoint) => Region::Custom {
                region: config.region.clone(),
                endpoint: endpoint.clone(),
            },
            None => config
                .region
                .parse()
                .map_err(|e| BackupError::Config(format!("invalid region {}: {}", config.region, e)))?,
        };
        let credentials = Credentials::default()
            .map_err(|e| BackupError::Config(format!("object store credentials: {}", e)))?;

        let mut bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| BackupError::Config(format!("bucket {}: {}", config.bucket, e)))?;
        if config.endpoint.is_some() {
            bucket = bucket.with_path_style();
        }
        Ok(Self { bucket })
    }
}

fn s3_error(action: &str, e: impl std::fmt::Display) -> BackupError {
    BackupError::Replication(format!("{} failed: {}", action, e))
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn put_file(&self, key: &str, path: &Path) -> Result<u64> {
        let mut file = tokio::fs::File::open(path).await?;
        let size = file.metadata().await?.len();

        let response = self
            .bucket
            .put_object_stream(&mut file, key)
            .await
            .map_err(|e| s3_error("upload", e))?;
        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(BackupError::Replication(format!(
                "upload of {} returned HTTP {}",
                key, status
            )));
        }
        Ok(size)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let pages = self
            .bucket
            .list(prefix.to_string(), None)
            .await
            .map_err(|e| s3_error("list", e))?;

        Ok(pages
            .into_iter()
            .flat_map(|page| page.contents)
            .map(|object| ObjectInfo {
                last_modified: DateTime::parse_from_rfc3339(&object.last_modified)
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(|_| Utc::now()),
                key: object.key,
                size_bytes: object.size,
            })
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self
            .bucket
            .delete_object(key)
            .await
            .map_err(|e| s3_error("delete", e))?;
        let status = response.status_code();
        if !(200..300).contains(&status) {
            return Err(BackupError::Replication(format!(
                "delete of {} returned HTTP {}",
                key, status
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ReplicationOutcome {
    Disabled,
    Uploaded {
        key: String,
        bytes: u64,
        local_deleted: bool,
    },
    Failed {
        reason: String,
    },
}

pub fn remote_key(file_name: &str) -> String {
    format!("{}{}", REMOTE_PREFIX, file_name)
}

pub struct Replicator {
    store: Option<Arc<dyn ObjectStore>>,
    delete_local: bool,
}

impl Replicator {
    pub fn new(store: Option<Arc<dyn ObjectStore>>, delete_local: bool) -> Self {
        Self {
            store,
            delete_local,
        }
    }

    pub async fn replicate(&self, artifact: &BackupArtifact) -> ReplicationOutcome {
        let Some(store) = &self.store else {
            return ReplicationOutcome::Disabled;
        };

        let key = remote_key(&artifact.file_name());
        info!("Uploading {} to {}", artifact.path.display(), key);

        let bytes = match store.put_file(&key, &artifact.path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Replication of {} failed, local copy kept: {}", artifact.name, e);
                return ReplicationOutcome::Failed {
                    reason: e.to_string(),
                };
            }
        };

        let mut local_deleted = false;
        if self.delete_local {
            match tokio::fs::remove_file(&artifact.path).await {
                Ok(()) => local_deleted = true,
                Err(e) => warn!("Uploaded {} but could not remove local copy: {}", artifact.name, e),
            }
        }

        info!("Replicated {} ({} bytes)", key, bytes);
        ReplicationOutcome::Uploaded {
            key,
            bytes,
            local_deleted,
        }
    }
}

/// The remote prefix seen as an artifact store, for retention and listing.
pub struct RemoteStore {
    store: Arc<dyn ObjectStore>,
}

impl RemoteStore {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl ArtifactStore for RemoteStore {
    fn label(&self) -> &str {
        "remote"
    }

    async fn list(&self) -> Result<Vec<StoredArtifact>> {
        let objects = self.store.list(REMOTE_PREFIX).await?;
        Ok(objects
            .into_iter()
            .filter_map(|object| {
                let name = object.key.strip_prefix(REMOTE_PREFIX)?.to_string();
                if name.contains('/') || !is_artifact_file(&name) {
                    return None;
                }
                let created_at = parse_artifact_name(&name).unwrap_or(object.last_modified);
                Some(StoredArtifact {
                    name,
                    created_at,
                    size_bytes: object.size_bytes,
                })
            })
            .collect())
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.store.delete(&remote_key(name)).await
    }
}
