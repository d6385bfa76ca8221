use serde::Serialize;
use std::time::{Duration, Instant};
use uuid::Uuid;

use crate::config::MIB;

/// Progress of one transfer at a chunk boundary.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Progress {
    pub transfer_id: Uuid,
    pub bytes_done: u64,
    pub total_bytes: u64,
    pub percentage: f64,
    pub elapsed: Duration,
    /// Bytes per second since the chunk loop started.
    pub speed: f64,
    pub eta: Option<Duration>,
}

/// Turns byte counts into [`Progress`] reports, at most one per
/// `max(1% of total, 1 MiB)` bytes; the final boundary is always reported.
#[derive(Debug)]
pub struct ProgressTracker {
    transfer_id: Uuid,
    total: u64,
    step: u64,
    next_report: u64,
    started: Instant,
}

impl ProgressTracker {
    pub fn new(transfer_id: Uuid, total: u64) -> Self {
        let step = (total / 100).max(MIB as u64);
        Self {
            transfer_id,
            total,
            step,
            next_report: step.min(total),
            started: Instant::now(),
        }
    }

    /// Restart the clock, e.g. once the handshake is done.
    pub fn start(&mut self) {
        self.started = Instant::now();
    }

    /// Report for `bytes_done` if a throttle step was crossed.
    pub fn record(&mut self, bytes_done: u64) -> Option<Progress> {
        if bytes_done < self.next_report && bytes_done < self.total {
            return None;
        }
        self.next_report = bytes_done.saturating_add(self.step);
        Some(self.snapshot(bytes_done))
    }

    pub fn snapshot(&self, bytes_done: u64) -> Progress {
        let elapsed = self.started.elapsed();
        let secs = elapsed.as_secs_f64();
        let speed = if secs > 0.0 { bytes_done as f64 / secs } else { 0.0 };
        let remaining = self.total.saturating_sub(bytes_done);
        let eta = if remaining == 0 {
            Some(Duration::ZERO)
        } else if speed > 0.0 {
            Some(Duration::from_secs_f64(remaining as f64 / speed))
        } else {
            None
        };
        let percentage = if self.total == 0 {
            100.0
        } else {
            bytes_done as f64 * 100.0 / self.total as f64
        };

        Progress {
            transfer_id: self.transfer_id,
            bytes_done,
            total_bytes: self.total,
            percentage,
            elapsed,
            speed,
            eta,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}
