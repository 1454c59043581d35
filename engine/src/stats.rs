//! Per-actor playback statistics
//!
//! Tracks decode throughput for one actor:
//! - Frames decoded and cycles skipped for lack of a free buffer
//! - Completed loops
//! - Mean decode time

use std::time::{Duration, Instant};

/// Tracks playback statistics for one actor
#[derive(Debug)]
pub struct PlaybackStats {
    /// Frames successfully decoded into the ring
    pub(crate) frames_decoded: u64,

    /// Decode cycles skipped because every buffer was busy
    pub(crate) skipped_no_buffer: u64,

    /// Loop boundaries crossed
    pub(crate) loops: u64,

    /// Total time spent inside decode calls
    decode_time: Duration,

    /// Last time stats were logged
    last_stats_log: Instant,
}

impl Default for PlaybackStats {
    fn default() -> Self {
        Self::new()
    }
}

impl PlaybackStats {
    pub fn new() -> Self {
        Self {
            frames_decoded: 0,
            skipped_no_buffer: 0,
            loops: 0,
            decode_time: Duration::ZERO,
            last_stats_log: Instant::now(),
        }
    }

    pub fn record_frame(&mut self, took: Duration) {
        self.frames_decoded += 1;
        self.decode_time += took;
    }

    pub fn record_skip(&mut self) {
        self.skipped_no_buffer += 1;
    }

    pub fn record_loop(&mut self) {
        self.loops += 1;
    }

    pub fn frames_decoded(&self) -> u64 {
        self.frames_decoded
    }

    /// Mean time per decoded frame
    pub fn mean_decode_time(&self) -> Duration {
        if self.frames_decoded == 0 {
            Duration::ZERO
        } else {
            self.decode_time / self.frames_decoded as u32
        }
    }

    /// Log statistics if interval has elapsed
    pub fn maybe_log_stats(&mut self, label: &str, interval: Duration) {
        if self.last_stats_log.elapsed() < interval {
            return;
        }
        self.log_summary(label);
        self.last_stats_log = Instant::now();
    }

    pub fn log_summary(&self, label: &str) {
        log::debug!(
            "Playback stats [{}]: {} decoded, {} skipped (no buffer), {} loops, {:.2}ms mean decode",
            label,
            self.frames_decoded,
            self.skipped_no_buffer,
            self.loops,
            self.mean_decode_time().as_secs_f64() * 1000.0
        );
    }
}
