//! Haptic side channel for vector animations.
//!
//! A pattern is a table keyed by the second within the loop and the tenth of
//! that second. Frames are looked up as they retire from the screen.

use common::VibrationPattern;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Haptic {
    Simple,
    Strong,
}

/// Which second of the loop an entry applies to
#[derive(Debug, Clone, Copy)]
enum Second {
    Every,
    At(u32),
}

struct Beat {
    second: Second,
    tenth: u32,
    haptic: Haptic,
}

const fn beat(second: Second, tenth: u32, haptic: Haptic) -> Beat {
    Beat {
        second,
        tenth,
        haptic,
    }
}

const HEARTBEAT: &[Beat] = &[
    beat(Second::Every, 0, Haptic::Strong),
    beat(Second::Every, 2, Haptic::Simple),
];

const PULSE: &[Beat] = &[beat(Second::Every, 0, Haptic::Simple)];

const FIREWORKS: &[Beat] = &[
    beat(Second::At(0), 5, Haptic::Simple),
    beat(Second::At(1), 0, Haptic::Strong),
    beat(Second::At(1), 3, Haptic::Simple),
    beat(Second::At(1), 6, Haptic::Simple),
];

fn table(pattern: VibrationPattern) -> &'static [Beat] {
    match pattern {
        VibrationPattern::Heartbeat => HEARTBEAT,
        VibrationPattern::Pulse => PULSE,
        VibrationPattern::Fireworks => FIREWORKS,
    }
}

/// Position of a frame inside its loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopPosition {
    pub second: u32,
    pub tenth: u32,
}

impl LoopPosition {
    pub fn of_frame(frame_index: u32, frame_rate: u32) -> Self {
        let rate = frame_rate.max(1);
        Self {
            second: frame_index / rate,
            tenth: (frame_index % rate) * 10 / rate,
        }
    }
}

pub fn lookup(pattern: VibrationPattern, position: LoopPosition) -> Option<Haptic> {
    table(pattern)
        .iter()
        .find(|b| {
            let second_matches = match b.second {
                Second::Every => true,
                Second::At(s) => s == position.second,
            };
            second_matches && b.tenth == position.tenth
        })
        .map(|b| b.haptic)
}

/// Fires each table slot at most once while frames dwell in it
#[derive(Debug, Default)]
pub struct VibrationTracker {
    last: Option<LoopPosition>,
}

impl VibrationTracker {
    pub fn on_frame_retired(
        &mut self,
        pattern: VibrationPattern,
        frame_index: u32,
        frame_rate: u32,
    ) -> Option<Haptic> {
        let position = LoopPosition::of_frame(frame_index, frame_rate);
        if self.last == Some(position) {
            return None;
        }
        self.last = Some(position);
        lookup(pattern, position)
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
