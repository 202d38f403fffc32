//! Byte-level progress tracking for captures and transfers.
//!
//! Progress is advisory: it feeds log lines and never influences control flow.

use super::progress_stream::ProgressCallback;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;

/// Progress information for one long-running byte stream
#[derive(Debug, Clone)]
pub struct TransferProgress {
    /// Total bytes expected (0 when unknown)
    pub total_bytes: u64,

    /// Bytes processed so far
    pub transferred_bytes: u64,

    /// Current speed in bytes/second
    pub bytes_per_second: u64,

    /// Estimated time remaining (seconds)
    pub eta_seconds: u64,

    /// Percentage complete (0-100)
    pub percent_complete: f64,
}

impl TransferProgress {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            total_bytes,
            transferred_bytes: 0,
            bytes_per_second: 0,
            eta_seconds: 0,
            percent_complete: 0.0,
        }
    }

    pub fn update(&mut self, transferred_bytes: u64) {
        self.transferred_bytes = transferred_bytes;
        self.percent_complete = if self.total_bytes > 0 {
            ((self.transferred_bytes as f64 / self.total_bytes as f64) * 100.0).min(100.0)
        } else {
            0.0
        };
    }

    pub fn is_complete(&self) -> bool {
        self.total_bytes > 0 && self.transferred_bytes >= self.total_bytes
    }
}

/// Progress tracker with time-based speed calculation
pub struct ProgressTracker {
    start_time: Instant,
    last_update_time: Instant,
    last_bytes: u64,
    progress: TransferProgress,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            last_update_time: now,
            last_bytes: 0,
            progress: TransferProgress::new(total_bytes),
        }
    }

    /// Update progress and recompute speed and ETA
    pub fn update(&mut self, transferred_bytes: u64) -> &TransferProgress {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update_time).as_secs_f64();

        if elapsed > 0.0 {
            let bytes_diff = transferred_bytes.saturating_sub(self.last_bytes);
            self.progress.bytes_per_second = (bytes_diff as f64 / elapsed) as u64;
        }

        if self.progress.bytes_per_second > 0 {
            let remaining_bytes = self.progress.total_bytes.saturating_sub(transferred_bytes);
            self.progress.eta_seconds = remaining_bytes / self.progress.bytes_per_second;
        }

        self.progress.update(transferred_bytes);
        self.last_update_time = now;
        self.last_bytes = transferred_bytes;

        &self.progress
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.progress.transferred_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    pub fn progress(&self) -> &TransferProgress {
        &self.progress
    }
}

/// A callback that logs `label` progress every 10 percent.
pub fn logging_callback(label: impl Into<String>, total_bytes: u64) -> ProgressCallback {
    let label = label.into();
    let state = Mutex::new((ProgressTracker::new(total_bytes), 0u64));

    Arc::new(move |bytes: u64| {
        let Ok(mut guard) = state.lock() else { return };
        let (tracker, last_decile) = &mut *guard;
        let progress = tracker.update(bytes).clone();

        let decile = (progress.percent_complete / 10.0) as u64;
        if total_bytes > 0 && decile > *last_decile {
            *last_decile = decile;
            info!(
                "{}: {} / {} ({:.0}%, {}, ETA {})",
                label,
                format_bytes(progress.transferred_bytes),
                format_bytes(progress.total_bytes),
                progress.percent_complete,
                format_speed(tracker.average_speed()),
                format_duration(progress.eta_seconds),
            );
        }
    })
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format speed as human-readable string
pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}

/// Format duration as human-readable string
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        format!("{}m {}s", seconds / 60, seconds % 60)
    } else {
        format!("{}h {}m", seconds / 3600, (seconds % 3600) / 60)
    }
}
