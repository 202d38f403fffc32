//! Operator confirmation before a destructive restore.

use crate::utils::errors::Result;
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

/// The operator must type exactly this to allow a restore
pub const CONFIRMATION_TOKEN: &str = "YES";

#[async_trait]
pub trait Confirmation: Send + Sync {
    /// Show `prompt` and return the operator's answer.
    async fn ask(&self, prompt: &str) -> Result<String>;
}

/// Prompts on stderr and reads one line from stdin
#[derive(Debug, Default)]
pub struct TerminalConfirmation;

#[async_trait]
impl Confirmation for TerminalConfirmation {
    async fn ask(&self, prompt: &str) -> Result<String> {
        let mut stderr = tokio::io::stderr();
        stderr.write_all(prompt.as_bytes()).await?;
        stderr.flush().await?;

        let mut line = String::new();
        BufReader::new(tokio::io::stdin()).read_line(&mut line).await?;
        Ok(line)
    }
}

/// Always gives the same answer; records nothing.
#[derive(Debug, Clone)]
pub struct CannedConfirmation {
    answer: String,
}

impl CannedConfirmation {
    pub fn new(answer: impl Into<String>) -> Self {
        Self {
            answer: answer.into(),
        }
    }

    pub fn accept() -> Self {
        Self::new(CONFIRMATION_TOKEN)
    }

    pub fn decline() -> Self {
        Self::new("no")
    }
}

#[async_trait]
impl Confirmation for CannedConfirmation {
    async fn ask(&self, _prompt: &str) -> Result<String> {
        Ok(self.answer.clone())
    }
}

/// Literal, case-sensitive match after trimming the line ending.
pub fn is_confirmed(answer: &str) -> bool {
    answer.trim() == CONFIRMATION_TOKEN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_exact_token_confirms() {
        assert!(is_confirmed("YES\n"));
        assert!(is_confirmed("  YES "));
        assert!(!is_confirmed("yes"));
        assert!(!is_confirmed("Y"));
        assert!(!is_confirmed("YES please"));
        assert!(!is_confirmed(""));
    }

    #[tokio::test]
    async fn test_canned_answers() {
        assert!(is_confirmed(&CannedConfirmation::accept().ask("?").await.unwrap()));
        assert!(!is_confirmed(&CannedConfirmation::decline().ask("?").await.unwrap()));
    }
}
