//! Relational engine: `pg_dump` exports, drop-and-recreate restores.

use super::{first_line, ExportOutcome};
use crate::config::DatabaseConfig;
use crate::fs::compress::{compress_file, read_payload};
use crate::runtime::ServiceRuntime;
use crate::utils::errors::{BackupError, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const FULL_DUMP: &str = "pg_full.sql";
pub const DATA_DUMP: &str = "pg_data.sql";
pub const SCHEMA_DUMP: &str = "pg_schema.sql";

pub struct PostgresEngine<'a> {
    runtime: &'a dyn ServiceRuntime,
    config: &'a DatabaseConfig,
}

impl<'a> PostgresEngine<'a> {
    pub fn new(runtime: &'a dyn ServiceRuntime, config: &'a DatabaseConfig) -> Self {
        Self { runtime, config }
    }

    /// Export the configured database into `dest_dir`.
    ///
    /// The full dump is mandatory; the data-only and schema-only variants
    /// only add warnings when they fail.
    pub async fn export(&self, dest_dir: &Path, level: i32) -> Result<ExportOutcome> {
        if !self.runtime.is_running(&self.config.service).await? {
            return Err(BackupError::component(
                "postgres",
                format!("service {} is not running", self.config.service),
            ));
        }

        let mut outcome = ExportOutcome::default();

        let full = self.dump(&[], dest_dir.join(FULL_DUMP)).await?;
        outcome.files.push(full);

        if self.config.extra_dumps {
            for (flag, name) in [("--data-only", DATA_DUMP), ("--schema-only", SCHEMA_DUMP)] {
                match self.dump(&[flag], dest_dir.join(name)).await {
                    Ok(path) => outcome.files.push(path),
                    Err(e) => {
                        warn!("Optional {} dump failed: {}", flag, e);
                        outcome.warnings.push(format!("{} dump failed: {}", flag, e));
                    }
                }
            }
        }

        let mut compressed = Vec::with_capacity(outcome.files.len());
        for path in std::mem::take(&mut outcome.files) {
            let packed = tokio::task::spawn_blocking(move || compress_file(&path, level))
                .await
                .map_err(|e| BackupError::component("postgres", e))?
                .map_err(|e| BackupError::component("postgres", e))?;
            outcome.size_bytes += tokio::fs::metadata(&packed).await?.len();
            compressed.push(packed);
        }
        outcome.files = compressed;

        info!(
            "Exported database {} ({} files, {} bytes compressed)",
            self.config.name,
            outcome.files.len(),
            outcome.size_bytes
        );
        Ok(outcome)
    }

    async fn dump(&self, extra: &[&str], dest: PathBuf) -> Result<PathBuf> {
        let mut args = vec![
            "pg_dump",
            "-U",
            self.config.user.as_str(),
            "-d",
            self.config.name.as_str(),
        ];
        args.extend_from_slice(extra);

        let output = self
            .runtime
            .exec(&self.config.service, &args)
            .await
            .map_err(|e| BackupError::component("postgres", e))?;

        if output.is_empty() {
            return Err(BackupError::component("postgres", "pg_dump produced no output"));
        }

        tokio::fs::write(&dest, &output).await?;
        Ok(dest)
    }

    pub async fn version(&self) -> Option<String> {
        self.runtime
            .exec(&self.config.service, &["psql", "--version"])
            .await
            .ok()
            .and_then(|out| first_line(&out))
    }

    /// Drop and recreate the target database, then load `dump` into it.
    ///
    /// Requires the engine to be running; callers treat any error as fatal.
    pub async fn restore(&self, dump: &Path) -> Result<()> {
        if !self.runtime.is_running(&self.config.service).await? {
            return Err(BackupError::Runtime(format!(
                "database service {} is not running",
                self.config.service
            )));
        }

        let dump_path = dump.to_path_buf();
        let sql = tokio::task::spawn_blocking(move || read_payload(&dump_path))
            .await
            .map_err(|e| BackupError::Runtime(e.to_string()))??;

        let name = &self.config.name;
        let terminate = format!(
            "SELECT pg_terminate_backend(pid) FROM pg_stat_activity \
             WHERE datname = '{}' AND pid <> pg_backend_pid();",
            name.replace('\'', "''")
        );
        let drop_db = format!("DROP DATABASE IF EXISTS {};", quote_ident(name));
        let create = format!(
            "CREATE DATABASE {} OWNER {};",
            quote_ident(name),
            quote_ident(&self.config.user)
        );

        for statement in [terminate, drop_db, create] {
            self.runtime
                .exec(
                    &self.config.service,
                    &[
                        "psql", "-U", &self.config.user, "-d", "postgres",
                        "-v", "ON_ERROR_STOP=1", "-c", &statement,
                    ],
                )
                .await?;
        }

        info!("Recreated database {}, loading {} bytes", name, sql.len());
        self.runtime
            .exec_with_input(
                &self.config.service,
                &[
                    "psql", "-U", &self.config.user, "-d", name,
                    "-v", "ON_ERROR_STOP=1", "--single-transaction",
                ],
                sql,
            )
            .await
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
