//! Backup rotation per backend.
//!
//! Rotation runs after a successful upload, never during restore. Blobs are
//! ranked by the backend's `last_modified`; a blob is deleted together with
//! its manifest sidecar. One failed deletion does not stop the others.

use crate::config::RetentionConfig;
use crate::storage::{StorageBackend, StoredBlob};
use crate::utils::errors::Result;
use chrono::Datelike;
use std::collections::HashSet;
use tracing::{info, warn};

/// Which blobs survive rotation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetentionRule {
    /// Keep the newest `n` blobs
    MaxCount(usize),
    /// Keep the newest blob of each of the last `daily` days, `weekly` ISO
    /// weeks and `monthly` months
    Calendar {
        daily: usize,
        weekly: usize,
        monthly: usize,
    },
}

#[derive(Debug, Clone)]
pub struct RetentionPolicy {
    rule: RetentionRule,
}

/// What one rotation did
#[derive(Debug, Default)]
pub struct RotationReport {
    pub deleted: Vec<String>,
    pub kept: Vec<String>,
    /// (blob, error) for deletions that failed
    pub failures: Vec<(String, String)>,
}

impl RotationReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

impl RetentionPolicy {
    pub fn new(rule: RetentionRule) -> Self {
        Self { rule }
    }

    /// Calendar rule when any keep_* count is set, else the flat cap.
    pub fn from_config(config: &RetentionConfig) -> Self {
        let calendar = config.keep_daily.is_some()
            || config.keep_weekly.is_some()
            || config.keep_monthly.is_some();

        let rule = if calendar {
            RetentionRule::Calendar {
                daily: config.keep_daily.unwrap_or(0),
                weekly: config.keep_weekly.unwrap_or(0),
                monthly: config.keep_monthly.unwrap_or(0),
            }
        } else {
            RetentionRule::MaxCount(config.max_count)
        };
        Self { rule }
    }

    pub fn rule(&self) -> &RetentionRule {
        &self.rule
    }

    /// Split `blobs` (newest first) into (keep, delete). The newest blob is
    /// always kept; the delete list is oldest first.
    pub fn select(&self, blobs: &[StoredBlob]) -> (Vec<StoredBlob>, Vec<StoredBlob>) {
        let keep: HashSet<usize> = match &self.rule {
            RetentionRule::MaxCount(max) => (0..blobs.len().min((*max).max(1))).collect(),
            RetentionRule::Calendar {
                daily,
                weekly,
                monthly,
            } => {
                let mut keep = HashSet::new();
                keep.insert(0);
                keep.extend(newest_per_bucket(blobs, *daily, |b| {
                    let d = b.last_modified.date_naive();
                    (d.year(), d.ordinal())
                }));
                keep.extend(newest_per_bucket(blobs, *weekly, |b| {
                    let w = b.last_modified.iso_week();
                    (w.year(), w.week())
                }));
                keep.extend(newest_per_bucket(blobs, *monthly, |b| {
                    let d = b.last_modified.date_naive();
                    (d.year(), d.month())
                }));
                keep.retain(|i| *i < blobs.len());
                keep
            }
        };

        let mut kept = Vec::new();
        let mut doomed = Vec::new();
        for (i, blob) in blobs.iter().enumerate() {
            if keep.contains(&i) {
                kept.push(blob.clone());
            } else {
                doomed.push(blob.clone());
            }
        }
        doomed.reverse();
        (kept, doomed)
    }

    /// Delete what the rule does not keep. Errors listing the backend fail
    /// the call; errors deleting one blob are collected in the report.
    pub async fn rotate(&self, backend: &dyn StorageBackend) -> Result<RotationReport> {
        let blobs = backend.list().await?;
        let (kept, doomed) = self.select(&blobs);

        let mut report = RotationReport {
            kept: kept.into_iter().map(|b| b.name).collect(),
            ..RotationReport::default()
        };

        if doomed.is_empty() {
            info!(backend = %backend.name(), blobs = blobs.len(), "Nothing to rotate");
            return Ok(report);
        }

        info!(
            backend = %backend.name(),
            deleting = doomed.len(),
            keeping = report.kept.len(),
            "Rotating old backups"
        );

        for blob in doomed {
            match backend.delete(&blob.name).await {
                Ok(()) => report.deleted.push(blob.name),
                Err(e) => {
                    warn!(backend = %backend.name(), blob = %blob.name, "Rotation delete failed: {}", e);
                    report.failures.push((blob.name, e.to_string()));
                }
            }
        }

        Ok(report)
    }
}

/// Indices of the newest blob in each of the first `count` distinct buckets.
fn newest_per_bucket<K, F>(blobs: &[StoredBlob], count: usize, bucket: F) -> Vec<usize>
where
    K: PartialEq,
    F: Fn(&StoredBlob) -> K,
{
    let mut picked = Vec::new();
    let mut last: Option<K> = None;

    for (i, blob) in blobs.iter().enumerate() {
        if picked.len() >= count {
            break;
        }
        let key = bucket(blob);
        if last.as_ref() != Some(&key) {
            picked.push(i);
            last = Some(key);
        }
    }
    picked
}
