//! Container runtime seam.
//!
//! Everything the orchestrator does to running services (probing, exec,
//! copying files in and out, stop/start, log collection) goes through
//! [`ServiceRuntime`]. Production uses [`compose::ComposeRuntime`].

pub mod compose;

use crate::utils::errors::Result;
use async_trait::async_trait;
use std::path::Path;

pub use compose::ComposeRuntime;

#[async_trait]
pub trait ServiceRuntime: Send + Sync {
    /// Container engine server version; errors when the daemon is unreachable.
    async fn engine_version(&self) -> Result<String>;

    /// Compose tool version; errors when the tool is absent.
    async fn compose_version(&self) -> Result<String>;

    async fn is_running(&self, service: &str) -> Result<bool>;

    /// Run a command inside a service container and return its stdout.
    async fn exec(&self, service: &str, args: &[&str]) -> Result<Vec<u8>>;

    /// Run a command inside a service container, feeding `input` on stdin.
    async fn exec_with_input(&self, service: &str, args: &[&str], input: Vec<u8>) -> Result<()>;

    async fn copy_from(&self, service: &str, container_path: &str, host_path: &Path) -> Result<()>;

    async fn copy_to(&self, service: &str, host_path: &Path, container_path: &str) -> Result<()>;

    async fn stop(&self, services: &[String]) -> Result<()>;

    async fn start(&self, services: &[String]) -> Result<()>;

    /// Last `tail` lines of a service's log output.
    async fn logs(&self, service: &str, tail: usize) -> Result<Vec<u8>>;
}
