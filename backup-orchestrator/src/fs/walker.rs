//! Directory traversal, tree copies and size accounting.
//!
//! Capture copies live trees into the capture directory; restore copies
//! extracted trees back. Both go through [`copy_tree`], which walks with
//! `walkdir` and recreates directories, regular files and symlinks.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// A file discovered during walking
#[derive(Debug, Clone)]
pub struct FileInfo {
    /// Full path to the file
    pub path: PathBuf,

    /// File size in bytes
    pub size: u64,
}

/// Totals produced by a tree copy
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyStats {
    pub files: usize,
    pub bytes: u64,
}

/// Walk a directory tree and collect every regular file.
///
/// Symlinks are not followed.
pub fn walk_directory(root: &Path) -> io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = entry.map_err(io::Error::from)?;
        if !entry.file_type().is_file() {
            continue;
        }

        files.push(FileInfo {
            size: entry.metadata().map_err(io::Error::from)?.len(),
            path: entry.path().to_path_buf(),
        });
    }

    Ok(files)
}

/// Calculate total size of all regular files under `root`.
///
/// A missing root counts as zero bytes.
pub fn calculate_total_size(root: &Path) -> io::Result<u64> {
    if !root.exists() {
        return Ok(0);
    }
    if root.is_file() {
        return Ok(fs::metadata(root)?.len());
    }
    Ok(walk_directory(root)?
        .iter()
        .map(|f| f.size)
        .sum())
}

/// Recursively copy `src` into `dest`, creating `dest` if needed.
///
/// Symlinks are recreated as symlinks, never followed, so a certificate
/// directory full of `live/ -> archive/` links survives a round trip.
pub fn copy_tree(src: &Path, dest: &Path) -> io::Result<CopyStats> {
    let mut stats = CopyStats::default();
    fs::create_dir_all(dest)?;

    for entry in WalkDir::new(src).follow_links(false).min_depth(1) {
        let entry = entry.map_err(io::Error::from)?;
        let relative = entry.path().strip_prefix(src).unwrap_or(entry.path());
        let target = dest.join(relative);
        let file_type = entry.file_type();

        if file_type.is_dir() {
            fs::create_dir_all(&target)?;
        } else if file_type.is_symlink() {
            copy_symlink(entry.path(), &target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            stats.bytes += fs::copy(entry.path(), &target)?;
            stats.files += 1;
        }
    }

    Ok(stats)
}

/// Replace `dest` entirely with a copy of `src`.
pub fn replace_tree(src: &Path, dest: &Path) -> io::Result<CopyStats> {
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    copy_tree(src, dest)
}

#[cfg(unix)]
fn copy_symlink(src: &Path, target: &Path) -> io::Result<()> {
    let link = fs::read_link(src)?;
    if target.symlink_metadata().is_ok() {
        fs::remove_file(target)?;
    }
    std::os::unix::fs::symlink(link, target)
}

#[cfg(not(unix))]
fn copy_symlink(src: &Path, target: &Path) -> io::Result<()> {
    fs::copy(src, target).map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_walk_empty_directory() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path())?;
        assert!(files.is_empty());
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("subdir"))?;
        fs::create_dir_all(temp_dir.path().join("empty"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content22")?;

        let mut files = walk_directory(temp_dir.path())?;
        files.sort_by(|a, b| a.path.cmp(&b.path));

        assert_eq!(files.len(), 2);
        assert_eq!(files[0].path, temp_dir.path().join("file1.txt"));
        assert_eq!(files[0].size, 8);
        assert_eq!(files[1].path, temp_dir.path().join("subdir/file2.txt"));
        assert_eq!(files[1].size, 9);
        Ok(())
    }

    #[test]
    fn test_calculate_total_size() -> io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::write(temp_dir.path().join("file1.txt"), b"12345")?;
        fs::write(temp_dir.path().join("file2.txt"), b"1234567")?;

        assert_eq!(calculate_total_size(temp_dir.path())?, 12);
        assert_eq!(calculate_total_size(&temp_dir.path().join("missing"))?, 0);
        Ok(())
    }

    #[test]
    fn test_copy_tree_is_byte_identical() -> io::Result<()> {
        let src = TempDir::new()?;
        let dest = TempDir::new()?;
        fs::create_dir_all(src.path().join("a/b"))?;
        fs::create_dir_all(src.path().join("empty"))?;
        fs::write(src.path().join("a/b/deep.bin"), [0u8, 1, 2, 3, 255])?;
        fs::write(src.path().join("top.txt"), b"top")?;

        let stats = copy_tree(src.path(), &dest.path().join("copy"))?;
        assert_eq!(stats, CopyStats { files: 2, bytes: 8 });
        assert_eq!(fs::read(dest.path().join("copy/a/b/deep.bin"))?, vec![0u8, 1, 2, 3, 255]);
        assert!(dest.path().join("copy/empty").is_dir());
        Ok(())
    }

    #[test]
    #[cfg(unix)]
    fn test_copy_tree_preserves_symlinks() -> io::Result<()> {
        let src = TempDir::new()?;
        let dest = TempDir::new()?;
        fs::write(src.path().join("cert.pem"), b"pem")?;
        std::os::unix::fs::symlink("cert.pem", src.path().join("live.pem"))?;

        copy_tree(src.path(), dest.path())?;
        let link = fs::read_link(dest.path().join("live.pem"))?;
        assert_eq!(link, PathBuf::from("cert.pem"));
        Ok(())
    }

    #[test]
    fn test_replace_tree_drops_stale_files() -> io::Result<()> {
        let src = TempDir::new()?;
        let dest = TempDir::new()?;
        fs::write(src.path().join("fresh.txt"), b"new")?;
        fs::write(dest.path().join("stale.txt"), b"old")?;

        replace_tree(src.path(), dest.path())?;
        assert!(dest.path().join("fresh.txt").exists());
        assert!(!dest.path().join("stale.txt").exists());
        Ok(())
    }
}
