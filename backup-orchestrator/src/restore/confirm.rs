//! Operator confirmation for destructive restores.

use async_trait::async_trait;
use std::io::{BufRead, IsTerminal, Write};
use tracing::warn;

#[async_trait]
pub trait ConfirmationProvider: Send + Sync {
    /// `true` only on an explicit yes.
    async fn confirm(&self, prompt: &str) -> bool;
}

/// Always declines.
pub struct Decline;

#[async_trait]
impl ConfirmationProvider for Decline {
    async fn confirm(&self, _prompt: &str) -> bool {
        false
    }
}

/// Pre-approved, for `restore --yes`.
pub struct AssumeYes;

#[async_trait]
impl ConfirmationProvider for AssumeYes {
    async fn confirm(&self, _prompt: &str) -> bool {
        true
    }
}

/// Interactive `[y/N]` prompt on the controlling terminal.
///
/// A non-terminal stdin, end of input or a read error all count as no.
pub struct StdinConfirmation;

#[async_trait]
impl ConfirmationProvider for StdinConfirmation {
    async fn confirm(&self, prompt: &str) -> bool {
        if !std::io::stdin().is_terminal() {
            warn!("stdin is not a terminal; restore not confirmed (use --yes)");
            return false;
        }

        let prompt = prompt.to_string();
        tokio::task::spawn_blocking(move || {
            let mut stderr = std::io::stderr();
            let _ = write!(stderr, "{} [y/N]: ", prompt);
            let _ = stderr.flush();

            let mut answer = String::new();
            match std::io::stdin().lock().read_line(&mut answer) {
                Ok(0) | Err(_) => false,
                Ok(_) => is_yes(&answer),
            }
        })
        .await
        .unwrap_or(false)
    }
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
