//! Archiver and verifier.
//!
//! Sealing turns a capture directory `backup_<ts>/` into the single artifact
//! `backup_<ts>.tar.gz` next to it. Entries are rooted at `backup_<ts>/`.
//! The capture directory is removed only after the archive has been fully
//! written, finished and synced.

use crate::metadata::manifest::{ComponentKind, Manifest, MANIFEST_FILE, UNKNOWN};
use crate::utils::errors::{BackupError, Result};
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::{info, warn};

pub const ARTIFACT_PREFIX: &str = "backup_";
pub const ARTIFACT_EXTENSION: &str = ".tar.gz";
const TIMESTAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// A sealed backup. Read-only once created.
#[derive(Debug, Clone, Serialize)]
pub struct BackupArtifact {
    pub name: String,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub host: String,
    pub size_bytes: u64,
    pub components: Vec<ComponentKind>,
    pub compressed: bool,
}

impl BackupArtifact {
    pub fn file_name(&self) -> String {
        format!("{}{}", self.name, ARTIFACT_EXTENSION)
    }
}

/// What verification found inside an artifact.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    pub path: PathBuf,
    pub entries: usize,
    pub size_bytes: u64,
    pub manifest: Option<Manifest>,
}

/// Capture directory name for a cycle started at `at`.
pub fn artifact_name(at: DateTime<Utc>) -> String {
    format!("{}{}", ARTIFACT_PREFIX, at.format(TIMESTAMP_FORMAT))
}

/// Parse the creation time out of `backup_<ts>` or `backup_<ts>.tar.gz`.
///
/// Returns `None` for anything outside the naming convention.
pub fn parse_artifact_name(name: &str) -> Option<DateTime<Utc>> {
    let stem = name.strip_suffix(ARTIFACT_EXTENSION).unwrap_or(name);
    let ts = stem.strip_prefix(ARTIFACT_PREFIX)?;
    NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT)
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive))
}

pub struct Archiver {
    min_artifact_bytes: u64,
}

impl Archiver {
    pub fn new(min_artifact_bytes: u64) -> Self {
        Self { min_artifact_bytes }
    }

    /// Compress `target_dir` into `<target_dir>.tar.gz` and remove the tree.
    pub async fn seal(&self, target_dir: &Path) -> Result<BackupArtifact> {
        let dir = target_dir.to_path_buf();
        tokio::task::spawn_blocking(move || seal_blocking(&dir))
            .await
            .map_err(|e| BackupError::Packaging(format!("seal task failed: {}", e)))?
    }

    /// Open the artifact, list every entry and check the size floor and
    /// the manifest invariant.
    pub async fn verify(&self, artifact: &Path) -> Result<VerifyReport> {
        let path = artifact.to_path_buf();
        let floor = self.min_artifact_bytes;
        tokio::task::spawn_blocking(move || verify_blocking(&path, floor))
            .await
            .map_err(|e| BackupError::Verification(format!("verify task failed: {}", e)))?
    }
}

fn seal_blocking(target_dir: &Path) -> Result<BackupArtifact> {
    if !target_dir.is_dir() {
        return Err(BackupError::Packaging(format!(
            "capture directory {} does not exist",
            target_dir.display()
        )));
    }

    let name = target_dir
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .ok_or_else(|| BackupError::Packaging("capture directory has no name".into()))?;
    let parent = target_dir.parent().unwrap_or_else(|| Path::new("."));
    let artifact_path = parent.join(format!("{}{}", name, ARTIFACT_EXTENSION));
    let partial_path = parent.join(format!("{}{}.partial", name, ARTIFACT_EXTENSION));

    if artifact_path.exists() {
        return Err(BackupError::Packaging(format!(
            "{} already exists",
            artifact_path.display()
        )));
    }

    if let Err(e) = write_archive(&partial_path, &[(name.clone(), target_dir.to_path_buf())]) {
        let _ = fs::remove_file(&partial_path);
        return Err(BackupError::Packaging(format!("{}: {}", artifact_path.display(), e)));
    }
    fs::rename(&partial_path, &artifact_path)
        .map_err(|e| BackupError::Packaging(format!("{}: {}", artifact_path.display(), e)))?;

    let manifest = read_manifest(&target_dir.join(MANIFEST_FILE));

    // Only now is the uncompressed tree redundant.
    if let Err(e) = fs::remove_dir_all(target_dir) {
        warn!("Sealed {} but could not remove capture tree: {}", name, e);
    }

    let size_bytes = fs::metadata(&artifact_path)?.len();
    info!("Sealed {} ({} bytes)", artifact_path.display(), size_bytes);

    Ok(BackupArtifact {
        created_at: manifest
            .as_ref()
            .map(|m| m.created_at)
            .or_else(|| parse_artifact_name(&name))
            .unwrap_or_else(Utc::now),
        host: manifest
            .as_ref()
            .map(|m| m.host.clone())
            .unwrap_or_else(|| UNKNOWN.to_string()),
        components: manifest.as_ref().map(Manifest::included).unwrap_or_default(),
        name,
        path: artifact_path,
        size_bytes,
        compressed: true,
    })
}

/// Write a gzip'd tarball containing each `(name in archive, source)`.
///
/// Missing sources are skipped. Returns the number of sources packed.
pub fn write_archive(dest: &Path, sources: &[(String, PathBuf)]) -> io::Result<usize> {
    let file = File::create(dest)?;
    let encoder = GzEncoder::new(BufWriter::new(file), Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    let mut packed = 0;
    for (name, source) in sources {
        if source.is_dir() {
            builder.append_dir_all(name, source)?;
        } else if source.is_file() {
            builder.append_path_with_name(source, name)?;
        } else {
            continue;
        }
        packed += 1;
    }

    let encoder = builder.into_inner()?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    writer
        .into_inner()
        .map_err(|e| e.into_error())?
        .sync_all()?;
    Ok(packed)
}

fn read_manifest(path: &Path) -> Option<Manifest> {
    let bytes = fs::read(path).ok()?;
    serde_json::from_slice(&bytes).ok()
}

/// Path of an entry relative to the artifact root (`backup_<ts>/`).
fn relative_entry(path: &Path) -> Option<String> {
    let mut components = path
        .components()
        .filter(|c| !matches!(c, Component::CurDir));
    components.next()?;
    let rest: PathBuf = components.collect();
    if rest.as_os_str().is_empty() {
        None
    } else {
        Some(rest.to_string_lossy().to_string())
    }
}

fn verify_blocking(path: &Path, min_bytes: u64) -> Result<VerifyReport> {
    let size_bytes = fs::metadata(path)
        .map_err(|e| BackupError::Verification(format!("{}: {}", path.display(), e)))?
        .len();

    if size_bytes < min_bytes {
        return Err(BackupError::Verification(format!(
            "{} is {} bytes, below the {} byte floor",
            path.display(),
            size_bytes,
            min_bytes
        )));
    }

    let corrupt = |e: io::Error| {
        BackupError::Verification(format!("{} is not a readable archive: {}", path.display(), e))
    };

    let file = File::open(path).map_err(corrupt)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));

    let mut entries = 0usize;
    // Directory headers alone never satisfy a payload.
    let mut file_entries = Vec::new();
    let mut manifest = None;
    for entry in archive.entries().map_err(corrupt)? {
        let mut entry = entry.map_err(corrupt)?;
        let is_dir = entry.header().entry_type().is_dir();
        let entry_path = entry.path().map_err(corrupt)?.into_owned();

        let relative = relative_entry(&entry_path);
        if relative.as_deref() == Some(MANIFEST_FILE) {
            let mut json = Vec::new();
            entry.read_to_end(&mut json).map_err(corrupt)?;
            manifest = Some(serde_json::from_slice::<Manifest>(&json).map_err(|e| {
                BackupError::Verification(format!("manifest.json is unreadable: {}", e))
            })?);
        } else {
            io::copy(&mut entry, &mut io::sink()).map_err(corrupt)?;
        }

        if let Some(relative) = relative {
            entries += 1;
            if !is_dir {
                file_entries.push(relative);
            }
        }
    }

    // Drain to the gzip trailer so a truncated tail is caught too.
    let mut rest = archive.into_inner();
    io::copy(&mut rest, &mut io::sink()).map_err(corrupt)?;

    if entries == 0 {
        return Err(BackupError::Verification(format!(
            "{} contains no entries",
            path.display()
        )));
    }

    if let Some(manifest) = &manifest {
        let missing = manifest.missing_payloads(file_entries.iter().map(String::as_str));
        if !missing.is_empty() {
            return Err(BackupError::Verification(format!(
                "manifest lists {:?} as included but the artifact has no payload for them",
                missing
            )));
        }
    }

    info!("Verified {} ({} entries, {} bytes)", path.display(), entries, size_bytes);
    Ok(VerifyReport {
        path: path.to_path_buf(),
        entries,
        size_bytes,
        manifest,
    })
}

/// Unpack an artifact into `dest` and return the artifact root inside it.
///
/// Entries that would escape `dest` are refused by `tar`'s unpacker.
pub fn extract(artifact: &Path, dest: &Path) -> io::Result<PathBuf> {
    fs::create_dir_all(dest)?;
    let file = File::open(artifact)?;
    let mut archive = tar::Archive::new(GzDecoder::new(BufReader::new(file)));
    archive.set_preserve_permissions(true);
    archive.unpack(dest)?;

    if dest.join(MANIFEST_FILE).exists() {
        return Ok(dest.to_path_buf());
    }

    let dirs: Vec<PathBuf> = fs::read_dir(dest)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.is_dir())
        .collect();
    match dirs.as_slice() {
        [root] => Ok(root.clone()),
        _ => Ok(dest.to_path_buf()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    /// Deterministic bytes that gzip cannot shrink much.
    fn noise(len: usize, seed: u64) -> Vec<u8> {
        let mut state = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
        (0..len)
            .map(|_| {
                state = state
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (state >> 33) as u8
            })
            .collect()
    }

    fn capture_dir(root: &Path, name: &str) -> PathBuf {
        let dir = root.join(name);
        fs::create_dir_all(dir.join("database")).unwrap();
        fs::create_dir_all(dir.join("files/data")).unwrap();
        fs::write(dir.join("database/pg_full.sql"), noise(500, 1)).unwrap();
        for i in 0..3 {
            fs::write(dir.join(format!("files/data/{}.bin", i)), noise(300, 10 + i)).unwrap();
        }
        dir
    }

    #[tokio::test]
    async fn test_seal_then_verify() {
        let temp_dir = TempDir::new().unwrap();
        let dir = capture_dir(temp_dir.path(), "backup_20260101_030000");

        let archiver = Archiver::new(1000);
        let artifact = archiver.seal(&dir).await.unwrap();

        assert_eq!(artifact.path, temp_dir.path().join("backup_20260101_030000.tar.gz"));
        assert!(artifact.size_bytes > 1000);
        assert!(!dir.exists());
        assert!(!temp_dir.path().join("backup_20260101_030000.tar.gz.partial").exists());

        let report = archiver.verify(&artifact.path).await.unwrap();
        assert!(report.entries >= 5);
        assert!(report.manifest.is_none());
    }

    #[tokio::test]
    async fn test_seal_missing_dir_is_packaging_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = Archiver::new(1).seal(&temp_dir.path().join("backup_x")).await;
        assert!(matches!(result, Err(BackupError::Packaging(_))));
    }

    #[tokio::test]
    async fn test_verify_rejects_zero_byte_and_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let archiver = Archiver::new(100);

        let empty = temp_dir.path().join("backup_20260101_000000.tar.gz");
        fs::write(&empty, b"").unwrap();
        assert!(matches!(
            archiver.verify(&empty).await,
            Err(BackupError::Verification(_))
        ));

        let dir = capture_dir(temp_dir.path(), "backup_20260102_000000");
        let artifact = archiver.seal(&dir).await.unwrap();
        let bytes = fs::read(&artifact.path).unwrap();
        fs::write(&artifact.path, &bytes[..bytes.len() / 2]).unwrap();
        assert!(matches!(
            archiver.verify(&artifact.path).await,
            Err(BackupError::Verification(_))
        ));
    }

    fn write_manifest(dir: &Path, included: &[(ComponentKind, &str)]) {
        use crate::metadata::manifest::{ComponentRecord, EnvironmentFingerprint, MANIFEST_VERSION};
        use std::collections::BTreeMap;

        let components: BTreeMap<_, _> = included
            .iter()
            .map(|(kind, payload)| (*kind, ComponentRecord::included(*payload, 100)))
            .collect();
        let manifest = Manifest {
            version: MANIFEST_VERSION,
            name: dir.file_name().unwrap().to_string_lossy().to_string(),
            created_at: Utc::now(),
            host: "bot-01".into(),
            components,
            environment: EnvironmentFingerprint::default(),
            total_size_bytes: 100,
            notes: vec![],
        };
        fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec(&manifest).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_seal_refuses_to_overwrite() {
        let temp_dir = TempDir::new().unwrap();
        let dir = capture_dir(temp_dir.path(), "backup_20260105_000000");
        let existing = temp_dir.path().join("backup_20260105_000000.tar.gz");
        fs::write(&existing, b"earlier artifact").unwrap();

        let result = Archiver::new(1).seal(&dir).await;
        assert!(matches!(result, Err(BackupError::Packaging(_))));
        assert_eq!(fs::read(&existing).unwrap(), b"earlier artifact");
        assert!(dir.join("database/pg_full.sql").exists());
        assert!(!temp_dir.path().join("backup_20260105_000000.tar.gz.partial").exists());
    }

    #[tokio::test]
    async fn test_verify_enforces_manifest_payloads() {
        let temp_dir = TempDir::new().unwrap();
        let dir = capture_dir(temp_dir.path(), "backup_20260103_000000");
        write_manifest(
            &dir,
            &[(ComponentKind::Files, "files"), (ComponentKind::Config, "config")],
        );

        let archiver = Archiver::new(100);
        let artifact = archiver.seal(&dir).await.unwrap();
        assert_eq!(artifact.host, "bot-01");

        let err = archiver.verify(&artifact.path).await.unwrap_err();
        assert!(err.to_string().contains("Config"));
    }

    #[tokio::test]
    async fn test_empty_payload_directory_fails_verification() {
        let temp_dir = TempDir::new().unwrap();
        let dir = capture_dir(temp_dir.path(), "backup_20260106_000000");
        fs::create_dir_all(dir.join("logs")).unwrap();
        write_manifest(
            &dir,
            &[(ComponentKind::Files, "files"), (ComponentKind::Logs, "logs")],
        );

        let archiver = Archiver::new(100);
        let artifact = archiver.seal(&dir).await.unwrap();
        let err = archiver.verify(&artifact.path).await.unwrap_err();
        assert!(err.to_string().contains("Logs"));
        assert!(!err.to_string().contains("Files"));
    }

    #[tokio::test]
    async fn test_extract_returns_root() {
        let temp_dir = TempDir::new().unwrap();
        let dir = capture_dir(temp_dir.path(), "backup_20260104_000000");
        let artifact = Archiver::new(1).seal(&dir).await.unwrap();

        let scratch = temp_dir.path().join("restore_1");
        let root = extract(&artifact.path, &scratch).unwrap();
        assert_eq!(root, scratch.join("backup_20260104_000000"));
        assert_eq!(fs::read(root.join("database/pg_full.sql")).unwrap(), noise(500, 1));
    }

    #[test]
    fn test_artifact_naming() {
        let at = Utc.with_ymd_and_hms(2026, 10, 19, 3, 0, 5).unwrap();
        let name = artifact_name(at);
        assert_eq!(name, "backup_20261019_030005");
        assert_eq!(parse_artifact_name(&name), Some(at));
        assert_eq!(parse_artifact_name("backup_20261019_030005.tar.gz"), Some(at));
        assert_eq!(parse_artifact_name("pre_restore_20261019_030005.tar.gz"), None);
        assert_eq!(parse_artifact_name("backup_latest.tar.gz"), None);
    }
}
