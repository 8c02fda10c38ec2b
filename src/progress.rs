//! Progress reporting shared by archive build/extract and file transfer.

use serde::Serialize;
use std::time::{Duration, Instant};

/// One progress update, computed by a [`ProgressTracker`] and handed to
/// whatever sink the caller wired up (CLI progress bar, GUI callback, log).
#[derive(Debug, Clone, Serialize)]
pub struct ProgressEvent {
    pub total_bytes: u64,
    pub current_bytes: u64,
    pub throughput_bps: f64,
    pub eta: Option<Duration>,
    pub current_file: String,
    pub phase: Phase,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Connecting,
    Comparing,
    Downloading,
    Extracting,
    Deleting,
    Complete,
    Error,
}

/// Tracks elapsed time and bytes moved so throughput/ETA can be derived
/// without every caller reimplementing the arithmetic.
pub struct ProgressTracker {
    start: Instant,
    total_bytes: u64,
    current_bytes: u64,
}

impl ProgressTracker {
    pub fn new(total_bytes: u64) -> Self {
        Self {
            start: Instant::now(),
            total_bytes,
            current_bytes: 0,
        }
    }

    pub fn advance(&mut self, by: u64) {
        self.current_bytes += by;
    }

    pub fn event(&self, current_file: impl Into<String>, phase: Phase) -> ProgressEvent {
        let elapsed = self.start.elapsed().as_secs_f64().max(f64::EPSILON);
        let throughput_bps = self.current_bytes as f64 / elapsed;
        let eta = if throughput_bps > 0.0 && self.total_bytes > self.current_bytes {
            let remaining = (self.total_bytes - self.current_bytes) as f64;
            Some(Duration::from_secs_f64(remaining / throughput_bps))
        } else {
            None
        };
        ProgressEvent {
            total_bytes: self.total_bytes,
            current_bytes: self.current_bytes,
            throughput_bps,
            eta,
            current_file: current_file.into(),
            phase,
        }
    }
}

/// Sink for progress events. The GUI (out of scope) implements this with a
/// widget update; the CLI implements it with `indicatif`; tests implement it
/// with a `Vec` collector.
pub trait ProgressSink: Send + Sync {
    fn on_progress(&self, event: ProgressEvent);
}

pub struct NullProgressSink;

impl ProgressSink for NullProgressSink {
    fn on_progress(&self, _event: ProgressEvent) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_reports_zero_eta_when_no_bytes_moved() {
        let tracker = ProgressTracker::new(100);
        let event = tracker.event("a.txt", Phase::Downloading);
        assert_eq!(event.current_bytes, 0);
        assert_eq!(event.total_bytes, 100);
    }

    #[test]
    fn tracker_advances_current_bytes() {
        let mut tracker = ProgressTracker::new(100);
        tracker.advance(40);
        let event = tracker.event("a.txt", Phase::Downloading);
        assert_eq!(event.current_bytes, 40);
    }
}
