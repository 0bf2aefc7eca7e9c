//! Per-file zstd compression for engine dumps and large log files.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

pub const ZSTD_EXTENSION: &str = "zst";

/// Compress `path` into `<path>.zst` and remove the original.
///
/// The original is removed only after the compressed file has been fully
/// written and flushed.
pub fn compress_file(path: &Path, level: i32) -> io::Result<PathBuf> {
    let target = with_zst_extension(path);

    {
        let input = BufReader::new(File::open(path)?);
        let mut output = BufWriter::new(File::create(&target)?);
        zstd::stream::copy_encode(input, &mut output, level)?;
        output.flush()?;
        output.get_ref().sync_all()?;
    }

    std::fs::remove_file(path)?;
    Ok(target)
}

/// Decompress a `.zst` file to `dest`.
pub fn decompress_file(src: &Path, dest: &Path) -> io::Result<u64> {
    let input = BufReader::new(File::open(src)?);
    let mut output = BufWriter::new(File::create(dest)?);
    zstd::stream::copy_decode(input, &mut output)?;
    output.flush()?;
    Ok(std::fs::metadata(dest)?.len())
}

/// Read a payload that may or may not be zstd compressed.
pub fn read_payload(path: &Path) -> io::Result<Vec<u8>> {
    if is_compressed(path) {
        zstd::stream::decode_all(BufReader::new(File::open(path)?))
    } else {
        std::fs::read(path)
    }
}

pub fn is_compressed(path: &Path) -> bool {
    path.extension().and_then(|e| e.to_str()) == Some(ZSTD_EXTENSION)
}

fn with_zst_extension(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".");
    name.push(ZSTD_EXTENSION);
    PathBuf::from(name)
}
