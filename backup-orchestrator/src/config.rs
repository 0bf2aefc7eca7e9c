//! Configuration management for the backup orchestrator.
//!
//! Loads configuration from a TOML file (or defaults) and overlays
//! environment variables. The result is frozen behind an `Arc` and handed to
//! every component; nothing downstream reads the environment.

use crate::utils::errors::{BackupError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Key prefix for artifacts replicated to object storage.
pub const REMOTE_PREFIX: &str = "backups/";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub project: ProjectConfig,
    pub paths: PathsConfig,
    #[serde(default)]
    pub services: ServicesConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    #[serde(default)]
    pub archive: ArchiveConfig,
    #[serde(default)]
    pub retention: RetentionPolicy,
    #[serde(default)]
    pub remote: Option<RemoteConfig>,
    #[serde(default)]
    pub notify: Option<NotifyConfig>,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectConfig {
    /// Directory holding the compose file and the deployment's `.env`
    pub dir: PathBuf,

    /// Compose file, relative to `dir` unless absolute
    #[serde(default = "default_compose_file")]
    pub compose_file: PathBuf,

    /// Command used to drive compose (`docker compose` or `docker-compose`)
    #[serde(default = "default_compose_command")]
    pub compose_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathsConfig {
    /// Local artifact store
    pub backup_dir: PathBuf,

    /// User data directory (relative paths resolve against the project dir)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Uploaded files
    #[serde(default = "default_uploads_dir")]
    pub uploads_dir: PathBuf,

    /// TLS certificates
    #[serde(default = "default_ssl_dir")]
    pub ssl_dir: PathBuf,

    /// Application log directory
    #[serde(default = "default_logs_dir")]
    pub logs_dir: PathBuf,

    /// Environment and deployment descriptor files copied into `config/`
    #[serde(default = "default_config_files")]
    pub config_files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServicesConfig {
    /// Application services in start order; they are stopped in reverse
    #[serde(default = "default_app_services")]
    pub app: Vec<String>,

    /// Lines of container log captured per service
    #[serde(default = "default_log_tail_lines")]
    pub log_tail_lines: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_database_service")]
    pub service: String,

    #[serde(default = "default_database_user")]
    pub user: String,

    pub name: String,

    /// Also produce data-only and schema-only dumps
    #[serde(default = "default_true")]
    pub extra_dumps: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_service")]
    pub service: String,

    /// Persisted snapshot file inside the cache container
    #[serde(default = "default_cache_dump_path")]
    pub dump_path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// zstd level for individually compressed payloads (1-22)
    #[serde(default = "default_compression_level")]
    pub compression_level: i32,

    /// Sealed artifacts smaller than this are treated as failed captures
    #[serde(default = "default_min_artifact_bytes")]
    pub min_artifact_bytes: u64,

    /// Log files above this size are compressed individually
    #[serde(default = "default_large_log_bytes")]
    pub large_log_bytes: u64,
}

/// Bounded count of most-recent artifacts kept per store.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RetentionPolicy {
    #[serde(default = "default_local_max_count")]
    pub local_max_count: usize,

    #[serde(default = "default_remote_max_count")]
    pub remote_max_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub bucket: String,

    #[serde(default = "default_region")]
    pub region: String,

    /// Custom endpoint for S3-compatible stores
    #[serde(default)]
    pub endpoint: Option<String>,

    /// Remove the local artifact once the upload is confirmed
    #[serde(default)]
    pub delete_local_after_upload: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifyConfig {
    pub bot_token: String,
    pub chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values
fn default_compose_file() -> PathBuf {
    PathBuf::from("docker-compose.yml")
}

fn default_compose_command() -> Vec<String> {
    vec!["docker".to_string(), "compose".to_string()]
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

fn default_uploads_dir() -> PathBuf {
    PathBuf::from("uploads")
}

fn default_ssl_dir() -> PathBuf {
    PathBuf::from("ssl")
}

fn default_logs_dir() -> PathBuf {
    PathBuf::from("logs")
}

fn default_config_files() -> Vec<PathBuf> {
    vec![
        PathBuf::from(".env"),
        PathBuf::from("docker-compose.yml"),
        PathBuf::from("nginx.conf"),
    ]
}

fn default_app_services() -> Vec<String> {
    vec![
        "bot".to_string(),
        "web_panel".to_string(),
        "nginx".to_string(),
    ]
}

fn default_log_tail_lines() -> usize {
    10_000
}

fn default_database_service() -> String {
    "postgres".to_string()
}

fn default_database_user() -> String {
    "postgres".to_string()
}

fn default_cache_service() -> String {
    "redis".to_string()
}

fn default_cache_dump_path() -> String {
    "/data/dump.rdb".to_string()
}

fn default_true() -> bool {
    true
}

fn default_compression_level() -> i32 {
    3
}

fn default_min_artifact_bytes() -> u64 {
    1024
}

fn default_large_log_bytes() -> u64 {
    1024 * 1024 // 1MB
}

fn default_local_max_count() -> usize {
    7
}

fn default_remote_max_count() -> usize {
    30
}

fn default_region() -> String {
    "us-east-1".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServicesConfig {
    fn default() -> Self {
        Self {
            app: default_app_services(),
            log_tail_lines: default_log_tail_lines(),
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            compression_level: default_compression_level(),
            min_artifact_bytes: default_min_artifact_bytes(),
            large_log_bytes: default_large_log_bytes(),
        }
    }
}

impl Default for RetentionPolicy {
    fn default() -> Self {
        Self {
            local_max_count: default_local_max_count(),
            remote_max_count: default_remote_max_count(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| BackupError::Config(format!("{}: {}", path.display(), e)))
    }

    /// Create a default configuration rooted at the given project directory
    pub fn default_for(project_dir: &Path) -> Self {
        Config {
            project: ProjectConfig {
                dir: project_dir.to_path_buf(),
                compose_file: default_compose_file(),
                compose_command: default_compose_command(),
            },
            paths: PathsConfig {
                backup_dir: PathBuf::from("backups"),
                data_dir: default_data_dir(),
                uploads_dir: default_uploads_dir(),
                ssl_dir: default_ssl_dir(),
                logs_dir: default_logs_dir(),
                config_files: default_config_files(),
            },
            services: ServicesConfig::default(),
            database: DatabaseConfig {
                service: default_database_service(),
                user: default_database_user(),
                name: "trading_bot".to_string(),
                extra_dumps: true,
            },
            cache: CacheConfig {
                service: default_cache_service(),
                dump_path: default_cache_dump_path(),
            },
            archive: ArchiveConfig::default(),
            retention: RetentionPolicy::default(),
            remote: None,
            notify: None,
            log: LogConfig::default(),
        }
    }

    /// Load from file (or defaults for the current directory), then apply
    /// the process environment, including the project's `.env`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Config::from_file(path)?,
            None => Config::default_for(&std::env::current_dir()?),
        };

        // PROJECT_DIR decides which `.env` is read, so apply it first.
        let process_env = |key: &str| std::env::var(key).ok();
        config.apply_overrides(process_env);
        let _ = dotenvy::from_path(config.env_file());
        config.apply_overrides(process_env);
        config.validate()?;
        Ok(config)
    }

    /// The project's `.env` file.
    pub fn env_file(&self) -> PathBuf {
        self.project.dir.join(".env")
    }

    /// Overlay environment values obtained through `lookup`.
    ///
    /// Remote replication and notification are enabled only when their
    /// identifying variables are present; absence is never an error.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(dir) = non_empty("PROJECT_DIR") {
            self.project.dir = PathBuf::from(dir);
        }
        if let Some(dir) = non_empty("BACKUP_DIR") {
            self.paths.backup_dir = PathBuf::from(dir);
        }
        if let Some(level) = non_empty("LOG_LEVEL") {
            self.log.level = level.to_lowercase();
        }

        if let Some(bucket) = non_empty("S3_BUCKET") {
            let remote = self.remote.get_or_insert_with(|| RemoteConfig {
                bucket: bucket.clone(),
                region: default_region(),
                endpoint: None,
                delete_local_after_upload: false,
            });
            remote.bucket = bucket;
        }
        if let Some(remote) = self.remote.as_mut() {
            if let Some(region) = non_empty("S3_REGION") {
                remote.region = region;
            }
            if let Some(endpoint) = non_empty("S3_ENDPOINT") {
                remote.endpoint = Some(endpoint);
            }
            if let Some(flag) = non_empty("S3_DELETE_LOCAL_AFTER_UPLOAD") {
                remote.delete_local_after_upload = parse_bool(&flag);
            }
        }

        match (non_empty("TELEGRAM_BOT_TOKEN"), non_empty("TELEGRAM_CHAT_ID")) {
            (Some(bot_token), Some(chat_id)) => {
                self.notify = Some(NotifyConfig { bot_token, chat_id });
            }
            (Some(bot_token), None) => {
                if let Some(notify) = self.notify.as_mut() {
                    notify.bot_token = bot_token;
                }
            }
            _ => {}
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.retention.local_max_count == 0 {
            return Err(BackupError::Config(
                "retention.local_max_count must be at least 1".into(),
            ));
        }
        if self.remote.is_some() && self.retention.remote_max_count == 0 {
            return Err(BackupError::Config(
                "retention.remote_max_count must be at least 1".into(),
            ));
        }
        if self.database.name.trim().is_empty() {
            return Err(BackupError::Config("database.name must not be empty".into()));
        }
        if self.archive.min_artifact_bytes == 0 {
            return Err(BackupError::Config(
                "archive.min_artifact_bytes must be positive".into(),
            ));
        }
        if self.project.compose_command.is_empty() {
            return Err(BackupError::Config(
                "project.compose_command must not be empty".into(),
            ));
        }
        Ok(())
    }

    /// Resolve a configured path against the project directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.project.dir.join(path)
        }
    }

    pub fn compose_file(&self) -> PathBuf {
        self.resolve(&self.project.compose_file)
    }

    /// Advisory lock file, keyed by project directory.
    pub fn lock_path(&self) -> PathBuf {
        self.project.dir.join(".backup.lock")
    }

    /// File-bearing components, as (name inside `files/`, live path).
    pub fn file_trees(&self) -> Vec<(&'static str, PathBuf)> {
        vec![
            ("data", self.resolve(&self.paths.data_dir)),
            ("uploads", self.resolve(&self.paths.uploads_dir)),
            ("ssl", self.resolve(&self.paths.ssl_dir)),
        ]
    }
}

fn parse_bool(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "true" | "1" | "yes"
    )
}
