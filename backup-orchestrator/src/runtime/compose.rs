//! `docker compose` backed service runtime.

use super::ServiceRuntime;
use crate::config::Config;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub struct ComposeRuntime {
    compose_command: Vec<String>,
    compose_file: PathBuf,
    project_dir: PathBuf,
}

impl ComposeRuntime {
    pub fn new(config: &Config) -> Self {
        Self {
            compose_command: config.project.compose_command.clone(),
            compose_file: config.compose_file(),
            project_dir: config.project.dir.clone(),
        }
    }

    /// The container engine binary (first word of the compose command for
    /// `docker compose`, plain `docker` for standalone `docker-compose`).
    fn engine_program(&self) -> &str {
        match self.compose_command.first().map(String::as_str) {
            Some("docker-compose") | None => "docker",
            Some(program) => program,
        }
    }

    fn compose_args<I, S>(&self, sub: I) -> Vec<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut args: Vec<String> = self.compose_command.iter().skip(1).cloned().collect();
        args.push("-f".to_string());
        args.push(self.compose_file.display().to_string());
        args.push("--project-directory".to_string());
        args.push(self.project_dir.display().to_string());
        args.extend(sub.into_iter().map(Into::into));
        args
    }

    async fn compose<I, S>(&self, sub: I, input: Option<Vec<u8>>) -> Result<Vec<u8>>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let program = self
            .compose_command
            .first()
            .ok_or_else(|| BackupError::Config("empty compose command".into()))?;
        run(program, &self.compose_args(sub), input).await
    }
}

/// Run a program to completion, returning stdout or a `Runtime` error
/// carrying stderr.
async fn run(program: &str, args: &[String], input: Option<Vec<u8>>) -> Result<Vec<u8>> {
    debug!("Running {} {}", program, args.join(" "));

    let mut child = Command::new(program)
        .args(args)
        .stdin(if input.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| BackupError::Runtime(format!("failed to spawn {}: {}", program, e)))?;

    // Feed stdin concurrently so large inputs cannot deadlock against a full stdout pipe.
    let writer = match (input, child.stdin.take()) {
        (Some(data), Some(mut stdin)) => Some(tokio::spawn(async move {
            stdin.write_all(&data).await?;
            stdin.shutdown().await
        })),
        _ => None,
    };

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| BackupError::Runtime(format!("{} did not complete: {}", program, e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(BackupError::Runtime(format!(
            "{} {} exited with {}: {}",
            program,
            args.last().map(String::as_str).unwrap_or_default(),
            output.status,
            stderr.trim()
        )));
    }

    if let Some(writer) = writer {
        match writer.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(BackupError::Runtime(format!("writing stdin to {} failed: {}", program, e)))
            }
            Err(e) => return Err(BackupError::Runtime(format!("stdin writer panicked: {}", e))),
        }
    }

    Ok(output.stdout)
}

fn exec_args(service: &str, args: &[&str]) -> Vec<String> {
    let mut sub = vec!["exec".to_string(), "-T".to_string(), service.to_string()];
    sub.extend(args.iter().map(|a| a.to_string()));
    sub
}

#[async_trait]
impl ServiceRuntime for ComposeRuntime {
    async fn engine_version(&self) -> Result<String> {
        let args = vec![
            "version".to_string(),
            "--format".to_string(),
            "{{.Server.Version}}".to_string(),
        ];
        let out = run(self.engine_program(), &args, None).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    async fn compose_version(&self) -> Result<String> {
        let out = self.compose(["version", "--short"], None).await?;
        Ok(String::from_utf8_lossy(&out).trim().to_string())
    }

    async fn is_running(&self, service: &str) -> Result<bool> {
        let out = self
            .compose(["ps", "--services", "--filter", "status=running"], None)
            .await?;
        Ok(String::from_utf8_lossy(&out)
            .lines()
            .any(|line| line.trim() == service))
    }

    async fn exec(&self, service: &str, args: &[&str]) -> Result<Vec<u8>> {
        self.compose(exec_args(service, args), None).await
    }

    async fn exec_with_input(&self, service: &str, args: &[&str], input: Vec<u8>) -> Result<()> {
        self.compose(exec_args(service, args), Some(input)).await.map(|_| ())
    }

    async fn copy_from(&self, service: &str, container_path: &str, host_path: &Path) -> Result<()> {
        let source = format!("{}:{}", service, container_path);
        self.compose(["cp".to_string(), source, host_path.display().to_string()], None)
            .await
            .map(|_| ())
    }

    async fn copy_to(&self, service: &str, host_path: &Path, container_path: &str) -> Result<()> {
        let dest = format!("{}:{}", service, container_path);
        self.compose(["cp".to_string(), host_path.display().to_string(), dest], None)
            .await
            .map(|_| ())
    }

    async fn stop(&self, services: &[String]) -> Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        let mut sub = vec!["stop".to_string()];
        sub.extend(services.iter().cloned());
        self.compose(sub, None).await.map(|_| ())
    }

    async fn start(&self, services: &[String]) -> Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        let mut sub = vec!["start".to_string()];
        sub.extend(services.iter().cloned());
        self.compose(sub, None).await.map(|_| ())
    }

    async fn logs(&self, service: &str, tail: usize) -> Result<Vec<u8>> {
        let tail = tail.to_string();
        self.compose(["logs", "--no-color", "--tail", tail.as_str(), service], None)
            .await
    }
}
