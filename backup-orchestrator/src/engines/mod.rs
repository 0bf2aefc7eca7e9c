//! Stateful engines with native export/import primitives.
//!
//! Capture treats a stopped engine as "nothing to export" and degrades;
//! restore treats it as fatal because data cannot be loaded into an engine
//! that is not running. Both behaviours live in the callers; the engines
//! only report what happened.

pub mod postgres;
pub mod redis;

pub use postgres::PostgresEngine;
pub use redis::RedisEngine;

use std::path::PathBuf;

/// Files written by an engine export, already compressed.
#[derive(Debug, Default)]
pub struct ExportOutcome {
    pub files: Vec<PathBuf>,
    pub size_bytes: u64,
    pub warnings: Vec<String>,
}

/// First non-empty line of a version query, or `None`.
fn first_line(output: &[u8]) -> Option<String> {
    String::from_utf8_lossy(output)
        .lines()
        .map(str::trim)
        .find(|l| !l.is_empty())
        .map(str::to_string)
}
