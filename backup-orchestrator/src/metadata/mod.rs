//! Metadata recorder - writes `manifest.json` and the restore guide.
//!
//! Recording never fails a cycle. Version queries that do not answer are
//! recorded as `unknown`, and a manifest that cannot be written is noted in
//! the log; the verifier decides later whether the artifact is usable.

pub mod manifest;

use crate::capture::CaptureResult;
use crate::config::Config;
use crate::engines::{PostgresEngine, RedisEngine};
use crate::fs::walker::calculate_total_size;
use crate::runtime::ServiceRuntime;
use manifest::{
    ComponentKind, EnvironmentFingerprint, Manifest, MANIFEST_FILE, MANIFEST_VERSION, README_FILE,
    UNKNOWN,
};
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

pub struct MetadataRecorder {
    config: Arc<Config>,
    runtime: Arc<dyn ServiceRuntime>,
}

impl MetadataRecorder {
    pub fn new(config: Arc<Config>, runtime: Arc<dyn ServiceRuntime>) -> Self {
        Self { config, runtime }
    }

    pub async fn record(&self, capture: &CaptureResult, target_dir: &Path) -> Manifest {
        let environment = self.fingerprint().await;
        let name = target_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| UNKNOWN.to_string());

        let total_size_bytes = calculate_total_size(target_dir).unwrap_or_else(|e| {
            warn!("Could not size capture directory: {}", e);
            0
        });

        // Degraded components already carry their reason as a warning.
        let notes = capture.warnings();

        let manifest = Manifest {
            version: MANIFEST_VERSION,
            name,
            created_at: capture.started_at,
            host: environment.host.clone(),
            components: capture.components.clone(),
            environment,
            total_size_bytes,
            notes,
        };

        match serde_json::to_vec_pretty(&manifest) {
            Ok(json) => {
                if let Err(e) = tokio::fs::write(target_dir.join(MANIFEST_FILE), json).await {
                    warn!("Failed to write manifest: {}", e);
                }
            }
            Err(e) => warn!("Failed to serialize manifest: {}", e),
        }

        let guide = render_restore_guide(&manifest, &self.config);
        if let Err(e) = tokio::fs::write(target_dir.join(README_FILE), guide).await {
            warn!("Failed to write restore guide: {}", e);
        }

        info!(
            "Recorded manifest for {} ({} bytes, components: {:?})",
            manifest.name,
            manifest.total_size_bytes,
            manifest.included()
        );
        manifest
    }

    /// Host and engine versions; anything that does not answer becomes `unknown`.
    pub async fn fingerprint(&self) -> EnvironmentFingerprint {
        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| UNKNOWN.to_string());

        let runtime = self.runtime.as_ref();
        let docker = runtime.engine_version().await.ok();
        let compose = runtime.compose_version().await.ok();
        let postgres = PostgresEngine::new(runtime, &self.config.database).version().await;
        let redis = RedisEngine::new(runtime, &self.config.cache).version().await;

        let or_unknown = |v: Option<String>| v.filter(|s| !s.is_empty()).unwrap_or_else(|| UNKNOWN.to_string());
        EnvironmentFingerprint {
            host,
            docker: or_unknown(docker),
            compose: or_unknown(compose),
            postgres: or_unknown(postgres),
            redis: or_unknown(redis),
        }
    }
}

/// Human-readable restore guide stored as `README` inside the artifact.
pub fn render_restore_guide(manifest: &Manifest, config: &Config) -> String {
    let mut guide = String::new();
    let _ = writeln!(guide, "Backup {}", manifest.name);
    let _ = writeln!(guide, "Created: {}", manifest.created_at.to_rfc3339());
    let _ = writeln!(guide, "Host:    {}", manifest.host);
    let _ = writeln!(guide);
    let _ = writeln!(guide, "Components:");
    for kind in ComponentKind::ALL {
        let status = match manifest.components.get(&kind) {
            Some(record) if record.included => format!(
                "included ({})",
                record.payload.as_deref().unwrap_or("-")
            ),
            Some(record) => format!("NOT included: {}", record.warnings.join("; ")),
            None => "not captured".to_string(),
        };
        let _ = writeln!(guide, "  {:<9} {}", kind, status);
    }
    let _ = writeln!(guide);
    let _ = writeln!(
        guide,
        "Engines: docker {}, compose {}, {}, {}",
        manifest.environment.docker,
        manifest.environment.compose,
        manifest.environment.postgres,
        manifest.environment.redis
    );
    let _ = writeln!(guide);
    let _ = writeln!(guide, "Automated restore:");
    let _ = writeln!(guide, "  backup restore {}.tar.gz", manifest.name);
    let _ = writeln!(guide);
    let _ = writeln!(guide, "Manual restore:");
    let _ = writeln!(guide, "  1. Stop application services: {}", config.services.app.join(", "));
    let _ = writeln!(
        guide,
        "  2. Load database/pg_full.sql.zst: zstd -dc database/pg_full.sql.zst | \
         docker compose exec -T {} psql -U {} -d {}",
        config.database.service, config.database.user, config.database.name
    );
    let _ = writeln!(
        guide,
        "  3. Stop {}, decompress database/redis_dump.rdb.zst and copy it to {}",
        config.cache.service, config.cache.dump_path
    );
    let _ = writeln!(guide, "  4. Copy files/data, files/uploads and files/ssl back into the project");
    let _ = writeln!(guide, "  5. Copy config/* back into the project directory");
    let _ = writeln!(guide, "  6. Start all services");

    if !manifest.notes.is_empty() {
        let _ = writeln!(guide);
        let _ = writeln!(guide, "Notes:");
        for note in &manifest.notes {
            let _ = writeln!(guide, "  - {}", note);
        }
    }
    guide
}
