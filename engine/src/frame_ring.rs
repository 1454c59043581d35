//! Bounded pool of reusable pixel buffers.
//!
//! The decode side takes a buffer from `free`, fills it and publishes it to
//! `busy`. The render side reads the head of `busy` and, once a newer frame is
//! queued behind it, retires the head back to `free`. Both queues live under
//! one lock that is held only for queue operations.

use std::collections::VecDeque;
use std::sync::Mutex;

use common::EngineError;

use crate::lock;

/// RGBA8 pixel buffer plus the source frame it holds
#[derive(Debug)]
pub struct FrameBuffer {
    pixels: Vec<u8>,
    width: u32,
    height: u32,
    /// Frame position in the source
    frame_index: u32,
    /// Publication order, strictly increasing per ring
    sequence: u64,
}

impl FrameBuffer {
    /// Allocate a zeroed buffer, reporting allocation failure instead of aborting
    pub fn try_new(width: u32, height: u32) -> Result<Self, EngineError> {
        let len = (width as usize)
            .checked_mul(height as usize)
            .and_then(|n| n.checked_mul(4))
            .ok_or_else(|| EngineError::OutOfMemory(format!("{}x{} overflows", width, height)))?;

        let mut pixels = Vec::new();
        pixels.try_reserve_exact(len).map_err(|e| {
            EngineError::OutOfMemory(format!("{}x{} frame buffer: {}", width, height, e))
        })?;
        pixels.resize(len, 0);

        Ok(Self {
            pixels,
            width,
            height,
            frame_index: 0,
            sequence: 0,
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[u8] {
        &self.pixels
    }

    pub fn pixels_mut(&mut self) -> &mut [u8] {
        &mut self.pixels
    }

    pub fn frame_index(&self) -> u32 {
        self.frame_index
    }

    pub fn set_frame_index(&mut self, index: u32) {
        self.frame_index = index;
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }
}

#[derive(Debug, Default)]
struct Queues {
    free: VecDeque<FrameBuffer>,
    busy: VecDeque<FrameBuffer>,
    /// Buffers handed out by `take_free` and not yet returned
    in_flight: usize,
    next_sequence: u64,
}

impl Queues {
    fn publish(&mut self, mut buffer: FrameBuffer) {
        buffer.sequence = self.next_sequence;
        self.next_sequence += 1;
        self.busy.push_back(buffer);
    }
}

/// Snapshot of queue sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingCounts {
    pub free: usize,
    pub busy: usize,
    pub in_flight: usize,
}

#[derive(Debug)]
pub struct FrameRing {
    capacity: usize,
    width: u32,
    height: u32,
    queues: Mutex<Queues>,
}

impl FrameRing {
    /// Allocate `capacity` buffers and synchronously fill `initial_filled` of
    /// them with `reader`. Fails if any allocation or initial decode fails.
    pub fn init<F>(
        initial_filled: usize,
        capacity: usize,
        width: u32,
        height: u32,
        mut reader: F,
    ) -> Result<Self, EngineError>
    where
        F: FnMut(&mut FrameBuffer) -> Result<(), EngineError>,
    {
        if capacity == 0 || initial_filled > capacity {
            return Err(EngineError::InvalidState(format!(
                "ring of {} buffers cannot start with {} filled",
                capacity, initial_filled
            )));
        }

        let mut queues = Queues::default();
        for i in 0..capacity {
            let mut buffer = FrameBuffer::try_new(width, height)?;
            if i < initial_filled {
                reader(&mut buffer)?;
                queues.publish(buffer);
            } else {
                queues.free.push_back(buffer);
            }
        }

        log::trace!(
            "Frame ring {}x{}: {} busy, {} free",
            width,
            height,
            queues.busy.len(),
            queues.free.len()
        );

        Ok(Self {
            capacity,
            width,
            height,
            queues: Mutex::new(queues),
        })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    /// Take a free buffer for decoding, without blocking
    pub fn take_free(&self) -> Option<FrameBuffer> {
        let mut queues = lock!(self.queues);
        let buffer = queues.free.pop_front()?;
        queues.in_flight += 1;
        Some(buffer)
    }

    /// Publish a freshly decoded buffer
    pub fn add_busy(&self, buffer: FrameBuffer) {
        let mut queues = lock!(self.queues);
        queues.in_flight = queues.in_flight.saturating_sub(1);
        queues.publish(buffer);
    }

    /// Return a taken buffer without publishing it
    pub fn add_free(&self, buffer: FrameBuffer) {
        let mut queues = lock!(self.queues);
        queues.in_flight = queues.in_flight.saturating_sub(1);
        queues.free.push_back(buffer);
    }

    /// Called by the render path before presenting. If a newer frame is
    /// queued, retire the oldest busy buffer and return its frame index.
    pub fn apply_next(&self) -> Option<u32> {
        let mut queues = lock!(self.queues);
        if queues.busy.len() <= 1 {
            return None;
        }
        let retired = queues.busy.pop_front()?;
        let index = retired.frame_index;
        queues.free.push_back(retired);
        Some(index)
    }

    /// Drop every busy buffer except the newest back into `free`
    pub fn clear_busy(&self) {
        let mut queues = lock!(self.queues);
        while queues.busy.len() > 1 {
            if let Some(buffer) = queues.busy.pop_front() {
                queues.free.push_back(buffer);
            }
        }
    }

    /// Run `f` against the frame currently on screen
    pub fn with_head<R>(&self, f: impl FnOnce(&FrameBuffer) -> R) -> Option<R> {
        let queues = lock!(self.queues);
        queues.busy.front().map(f)
    }

    /// Frame index of the newest published frame
    pub fn latest_frame_index(&self) -> Option<u32> {
        let queues = lock!(self.queues);
        queues.busy.back().map(|b| b.frame_index)
    }

    pub fn counts(&self) -> RingCounts {
        let queues = lock!(self.queues);
        RingCounts {
            free: queues.free.len(),
            busy: queues.busy.len(),
            in_flight: queues.in_flight,
        }
    }

    pub fn free_count(&self) -> usize {
        lock!(self.queues).free.len()
    }

    pub fn busy_count(&self) -> usize {
        lock!(self.queues).busy.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_reader() -> impl FnMut(&mut FrameBuffer) -> Result<(), EngineError> {
        let mut next = 0u32;
        move |buffer: &mut FrameBuffer| {
            buffer.set_frame_index(next);
            buffer.pixels_mut()[0] = next as u8;
            next += 1;
            Ok(())
        }
    }

    fn assert_balanced(ring: &FrameRing) {
        let counts = ring.counts();
        assert_eq!(
            counts.busy + counts.free + counts.in_flight,
            ring.capacity(),
            "{:?}",
            counts
        );
    }

    #[test]
    fn test_init_and_one_decode_step() {
        let ring = FrameRing::init(1, 3, 4, 4, counting_reader()).unwrap();
        assert_eq!(ring.busy_count(), 1);
        assert_eq!(ring.free_count(), 2);

        let mut buffer = ring.take_free().unwrap();
        assert_balanced(&ring);
        buffer.set_frame_index(1);
        ring.add_busy(buffer);

        assert_eq!(ring.busy_count(), 2);
        assert_eq!(ring.free_count(), 1);
        assert_balanced(&ring);
    }

    #[test]
    fn test_apply_next_retires_oldest() {
        let ring = FrameRing::init(2, 3, 2, 2, counting_reader()).unwrap();
        assert_eq!(ring.with_head(|b| b.frame_index()), Some(0));

        assert_eq!(ring.apply_next(), Some(0));
        assert_eq!(ring.with_head(|b| b.frame_index()), Some(1));
        assert_balanced(&ring);

        // A single busy buffer always stays on screen
        assert_eq!(ring.apply_next(), None);
        assert_eq!(ring.busy_count(), 1);
        assert_balanced(&ring);
    }

    #[test]
    fn test_take_free_exhausts_without_blocking() {
        let ring = FrameRing::init(1, 2, 2, 2, counting_reader()).unwrap();
        let taken = ring.take_free().unwrap();
        assert!(ring.take_free().is_none());
        ring.add_free(taken);
        assert_eq!(ring.free_count(), 1);
        assert_balanced(&ring);
    }

    #[test]
    fn test_clear_busy_keeps_newest() {
        let ring = FrameRing::init(3, 4, 2, 2, counting_reader()).unwrap();
        assert_eq!(ring.busy_count(), 3);
        ring.clear_busy();
        assert_eq!(ring.busy_count(), 1);
        assert_eq!(ring.with_head(|b| b.frame_index()), Some(2));
        assert_eq!(ring.latest_frame_index(), Some(2));
        assert_balanced(&ring);
    }

    #[test]
    fn test_sequence_is_monotonic() {
        let ring = FrameRing::init(1, 3, 1, 1, counting_reader()).unwrap();
        let first = ring.with_head(|b| b.sequence()).unwrap();
        let buffer = ring.take_free().unwrap();
        ring.add_busy(buffer);
        ring.apply_next();
        let second = ring.with_head(|b| b.sequence()).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_init_propagates_reader_failure() {
        let result = FrameRing::init(1, 3, 2, 2, |_buffer: &mut FrameBuffer| {
            Err(EngineError::DecodeOpen("corrupt header".to_string()))
        });
        assert!(matches!(result, Err(EngineError::DecodeOpen(_))));
    }

    #[test]
    fn test_oversized_allocation_is_out_of_memory() {
        let result = FrameBuffer::try_new(u32::MAX, u32::MAX);
        assert!(matches!(result, Err(EngineError::OutOfMemory(_))));
    }
}
