//! Run summaries for operators.
//!
//! Delivery is best-effort: callers log a failed notification and carry on.

use crate::config::GeneralConfig;
use crate::utils::errors::{BackupError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, subject: &str, message: &str) -> Result<()>;
}

/// Writes the summary to the log only
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, subject: &str, message: &str) -> Result<()> {
        info!(subject = %subject, "{}", message);
        Ok(())
    }
}

/// Hands a mail to the local MTA via `sendmail -t`
#[derive(Debug, Clone)]
pub struct SendmailNotifier {
    program: PathBuf,
    recipient: String,
    sender: String,
}

impl SendmailNotifier {
    pub fn new(recipient: impl Into<String>, host: &str) -> Self {
        Self {
            program: PathBuf::from("/usr/sbin/sendmail"),
            recipient: recipient.into(),
            sender: format!("universal-backup@{}", host),
        }
    }

    pub fn with_program(mut self, program: impl Into<PathBuf>) -> Self {
        self.program = program.into();
        self
    }

    fn render(&self, subject: &str, message: &str) -> String {
        format!(
            "From: {}\nTo: {}\nSubject: {}\nContent-Type: text/plain; charset=utf-8\n\n{}\n",
            self.sender,
            self.recipient,
            subject.replace('\n', " "),
            message
        )
    }
}

#[async_trait]
impl Notifier for SendmailNotifier {
    async fn notify(&self, subject: &str, message: &str) -> Result<()> {
        let mut child = Command::new(&self.program)
            .arg("-t")
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                BackupError::Transfer(format!("cannot run {}: {}", self.program.display(), e))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(self.render(subject, message).as_bytes()).await?;
        }

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            return Err(BackupError::Transfer(format!(
                "sendmail exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }

        info!(recipient = %self.recipient, "Notification sent");
        Ok(())
    }
}

/// Mail when an address is configured, otherwise log.
pub fn from_config(general: &GeneralConfig) -> Arc<dyn Notifier> {
    match &general.notification_email {
        Some(email) if !email.trim().is_empty() => {
            Arc::new(SendmailNotifier::new(email.trim(), &general.server_id))
        }
        _ => Arc::new(LogNotifier),
    }
}

/// Send and swallow the error; a notification never fails a run.
pub async fn send_best_effort(notifier: &dyn Notifier, subject: &str, message: &str) {
    if let Err(e) = notifier.notify(subject, message).await {
        warn!(subject = %subject, "Notification failed: {}", e);
    }
}
