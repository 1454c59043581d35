//! Frame pacing policy.
//!
//! The effective rate of an item is the lowest of the display refresh rate,
//! the configured hard cap and the policy ceiling for the current
//! performance mode (lowered further for sources declaring the optimized
//! profile). Vector animations skip `frame_delta` source frames per decode so
//! that playback speed is preserved at the reduced rate.

use std::time::Duration;

use common::{ItemKind, OptimizationProfile};

use crate::config::PlaybackSettings;
use crate::resource_monitor::PerformanceMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacingPolicy {
    pub display_refresh_rate: u32,
    pub max_frame_rate: u32,
    pub optimized_frame_rate: u32,
    pub mode: PerformanceMode,
}

impl PacingPolicy {
    pub fn from_settings(settings: &PlaybackSettings, mode: PerformanceMode) -> Self {
        Self {
            display_refresh_rate: settings.display_refresh_rate,
            max_frame_rate: settings.max_frame_rate,
            optimized_frame_rate: settings.optimized_frame_rate,
            mode,
        }
    }

    fn ceiling(&self, kind: ItemKind, profile: OptimizationProfile) -> u32 {
        let mode_ceiling = match kind {
            ItemKind::VectorAnimation => self.mode.vector_fps_limit(),
            ItemKind::RasterLoop | ItemKind::VideoLoop => self.mode.raster_fps_limit(),
        };
        match profile {
            OptimizationProfile::Optimized => mode_ceiling.min(self.optimized_frame_rate),
            OptimizationProfile::Standard => mode_ceiling,
        }
    }

    /// Frames per second an item of this kind may be decoded at
    pub fn effective_frame_rate(&self, kind: ItemKind, profile: OptimizationProfile) -> u32 {
        self.display_refresh_rate
            .min(self.max_frame_rate)
            .min(self.ceiling(kind, profile))
            .max(1)
    }
}

/// Source frames to advance per decode
pub fn frame_delta(intrinsic_rate: u32, effective_rate: u32) -> u32 {
    (intrinsic_rate / effective_rate.max(1)).max(1)
}

/// Wall time covered by one vector decode that advances `delta` frames
pub fn vector_interval(intrinsic_rate: u32, delta: u32) -> Duration {
    let rate = intrinsic_rate.max(1) as u64;
    Duration::from_millis(1000 * delta as u64 / rate)
}

/// Display time of a raster frame, never shorter than the effective rate allows
pub fn raster_interval(frame_duration: Duration, effective_rate: u32) -> Duration {
    let floor = Duration::from_millis(1000 / effective_rate.max(1) as u64);
    frame_duration.max(floor)
}
