//! Download progress tracking.
//!
//! Reports at most once per 10% step so a large artifact does not flood the
//! log with one line per chunk.

use std::time::{Duration, Instant};

const REPORT_STEP_PERCENT: u64 = 10;

/// Progress of one artifact download
#[derive(Debug)]
pub struct DownloadProgress {
    /// Advertised size, when the server sent one
    total_bytes: Option<u64>,
    received_bytes: u64,
    start_time: Instant,
    last_reported_step: u64,
}

impl DownloadProgress {
    pub fn new(total_bytes: Option<u64>) -> Self {
        Self {
            total_bytes: total_bytes.filter(|total| *total > 0),
            received_bytes: 0,
            start_time: Instant::now(),
            last_reported_step: 0,
        }
    }

    /// Account for a received chunk. Returns the percentage when a new step was crossed.
    pub fn record(&mut self, chunk_len: usize) -> Option<u64> {
        self.received_bytes += chunk_len as u64;

        let total = self.total_bytes?;
        let percent = (self.received_bytes.saturating_mul(100) / total).min(100);
        let step = percent / REPORT_STEP_PERCENT;

        if step > self.last_reported_step {
            self.last_reported_step = step;
            Some(percent)
        } else {
            None
        }
    }

    pub fn received_bytes(&self) -> u64 {
        self.received_bytes
    }

    pub fn total_bytes(&self) -> Option<u64> {
        self.total_bytes
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Average speed since start
    pub fn average_speed(&self) -> u64 {
        let elapsed = self.elapsed().as_secs_f64();
        if elapsed > 0.0 {
            (self.received_bytes as f64 / elapsed) as u64
        } else {
            0
        }
    }

    /// True when a size was advertised and a different amount arrived
    pub fn is_short(&self) -> bool {
        self.total_bytes
            .is_some_and(|total| self.received_bytes != total)
    }
}

/// Format bytes as human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit = 0;

    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }

    format!("{:.2} {}", size, UNITS[unit])
}

pub fn format_speed(bytes_per_second: u64) -> String {
    format!("{}/s", format_bytes(bytes_per_second))
}
