//! Manifest types.
//!
//! A manifest is serialized as `manifest.json` at the root of every artifact
//! and describes what was captured, from where, and with which engine
//! versions. Every component flagged `included` must have its payload inside
//! the artifact or the artifact fails verification.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const README_FILE: &str = "README";
pub const MANIFEST_VERSION: u32 = 1;

/// Placeholder for version queries that could not be answered.
pub const UNKNOWN: &str = "unknown";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentKind {
    Postgres,
    Redis,
    Files,
    Config,
    Logs,
}

impl ComponentKind {
    pub const ALL: [ComponentKind; 5] = [
        ComponentKind::Postgres,
        ComponentKind::Redis,
        ComponentKind::Files,
        ComponentKind::Config,
        ComponentKind::Logs,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ComponentKind::Postgres => "postgres",
            ComponentKind::Redis => "redis",
            ComponentKind::Files => "files",
            ComponentKind::Config => "config",
            ComponentKind::Logs => "logs",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// Capture outcome for one component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ComponentRecord {
    pub included: bool,

    /// Payload path relative to the artifact root (file or directory)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,

    #[serde(default)]
    pub size_bytes: u64,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl ComponentRecord {
    pub fn included(payload: impl Into<String>, size_bytes: u64) -> Self {
        Self {
            included: true,
            payload: Some(payload.into()),
            size_bytes,
            warnings: Vec::new(),
        }
    }

    pub fn skipped(warning: impl Into<String>) -> Self {
        Self {
            included: false,
            payload: None,
            size_bytes: 0,
            warnings: vec![warning.into()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentFingerprint {
    pub host: String,
    pub docker: String,
    pub compose: String,
    pub postgres: String,
    pub redis: String,
}

impl Default for EnvironmentFingerprint {
    fn default() -> Self {
        Self {
            host: UNKNOWN.to_string(),
            docker: UNKNOWN.to_string(),
            compose: UNKNOWN.to_string(),
            postgres: UNKNOWN.to_string(),
            redis: UNKNOWN.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub name: String,
    pub created_at: DateTime<Utc>,
    pub host: String,
    pub components: BTreeMap<ComponentKind, ComponentRecord>,
    pub environment: EnvironmentFingerprint,
    pub total_size_bytes: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
}

impl Manifest {
    /// Components whose capture succeeded.
    pub fn included(&self) -> Vec<ComponentKind> {
        self.components
            .iter()
            .filter(|(_, record)| record.included)
            .map(|(kind, _)| *kind)
            .collect()
    }

    /// Included components with no payload among `entries`: the file (not
    /// directory) entries of an artifact, relative to its root.
    pub fn missing_payloads<'a, I>(&self, entries: I) -> Vec<ComponentKind>
    where
        I: IntoIterator<Item = &'a str> + Clone,
    {
        self.components
            .iter()
            .filter(|(_, record)| record.included)
            .filter(|(_, record)| match record.payload.as_deref() {
                Some(payload) => !entries.clone().into_iter().any(|e| covers(payload, e)),
                None => true,
            })
            .map(|(kind, _)| *kind)
            .collect()
    }
}

/// Whether archive entry `entry` satisfies payload `payload`.
fn covers(payload: &str, entry: &str) -> bool {
    let payload = payload.trim_end_matches('/');
    let entry = entry.trim_end_matches('/');
    entry == payload || entry.starts_with(&format!("{}/", payload))
}
