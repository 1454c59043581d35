//! Render-side adapter.
//!
//! A [`RenderSurface`] binds one descriptor at a time, subscribes to its actor
//! through the coordinator and draws the head of the actor's frame ring into
//! a caller-owned [`Canvas`]. Until the first frame arrives it reports a
//! placeholder with download progress.

use rayon::prelude::*;
use std::sync::{Arc, Mutex};

use common::{Descriptor, EngineError, Rotation, ScaleMode};

use crate::actor::PlaybackHandle;
use crate::context::EngineContext;
use crate::coordinator::{WatchRegistration, Watcher};
use crate::frame_ring::FrameBuffer;
use crate::lock;
use crate::vibration::{Haptic, VibrationTracker};

/// RGBA8 target a surface presents into
#[derive(Debug, Clone)]
pub struct Canvas {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl Canvas {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            pixels: vec![0; width as usize * height as usize * 4],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> [u8; 4] {
        let i = (y as usize * self.width as usize + x as usize) * 4;
        [
            self.pixels[i],
            self.pixels[i + 1],
            self.pixels[i + 2],
            self.pixels[i + 3],
        ]
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PresentOutcome {
    /// A new frame was drawn
    Presented { frame_index: u32 },
    /// The head frame was already on the canvas
    Unchanged,
    /// Nothing decoded yet; progress while downloading
    Placeholder { progress: Option<f32> },
    Failed,
}

/// Maps canvas pixels back to frame pixels for one (source, canvas, mode, rotation)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitTransform {
    source: (u32, u32),
    rotated: (u32, u32),
    rotation: Rotation,
    scale_x: f32,
    scale_y: f32,
    offset_x: f32,
    offset_y: f32,
}

impl FitTransform {
    pub fn compute(
        source: (u32, u32),
        target: (u32, u32),
        mode: ScaleMode,
        rotation: Rotation,
    ) -> Self {
        let rotated = if rotation.is_transposed() {
            (source.1, source.0)
        } else {
            source
        };
        let (rw, rh) = (rotated.0.max(1) as f32, rotated.1.max(1) as f32);
        let (tw, th) = (target.0 as f32, target.1 as f32);

        let (scale_x, scale_y) = match mode {
            ScaleMode::Center => (1.0, 1.0),
            ScaleMode::Fit => {
                let s = (tw / rw).min(th / rh);
                (s, s)
            }
            ScaleMode::Fill => {
                let s = (tw / rw).max(th / rh);
                (s, s)
            }
            ScaleMode::Stretch => (tw / rw, th / rh),
        };

        Self {
            source,
            rotated,
            rotation,
            scale_x,
            scale_y,
            offset_x: (tw - rw * scale_x) / 2.0,
            offset_y: (th - rh * scale_y) / 2.0,
        }
    }

    /// Frame pixel shown at canvas pixel (x, y), if any
    pub fn source_pixel(&self, x: u32, y: u32) -> Option<(u32, u32)> {
        let u = ((x as f32 + 0.5 - self.offset_x) / self.scale_x).floor();
        let v = ((y as f32 + 0.5 - self.offset_y) / self.scale_y).floor();
        if u < 0.0 || v < 0.0 || u >= self.rotated.0 as f32 || v >= self.rotated.1 as f32 {
            return None;
        }
        let (u, v) = (u as u32, v as u32);
        let (w, h) = self.source;

        Some(match self.rotation {
            Rotation::None => (u, v),
            Rotation::Cw90 => (v, h - 1 - u),
            Rotation::Cw180 => (w - 1 - u, h - 1 - v),
            Rotation::Cw270 => (w - 1 - v, u),
        })
    }

    pub fn blit(&self, frame: &FrameBuffer, canvas: &mut Canvas) {
        let stride = canvas.width as usize * 4;
        if stride == 0 {
            return;
        }
        let frame_width = frame.width() as usize;
        let pixels = frame.pixels();

        canvas
            .pixels
            .par_chunks_mut(stride)
            .enumerate()
            .for_each(|(y, row)| {
                for (x, out) in row.chunks_exact_mut(4).enumerate() {
                    match self.source_pixel(x as u32, y as u32) {
                        Some((sx, sy)) => {
                            let i = (sy as usize * frame_width + sx as usize) * 4;
                            out.copy_from_slice(&pixels[i..i + 4]);
                        }
                        None => out.fill(0),
                    }
                }
            });
    }
}

#[derive(Default)]
struct SurfaceState {
    handle: Option<PlaybackHandle>,
    progress: Option<f32>,
    failed: Option<EngineError>,
    /// Last frame drawn to the canvas
    last_frame: Option<u32>,
    latest_ready: Option<u32>,
    loops: u64,
    /// Bumped on every re-subscription; callbacks from older ones are dropped
    generation: u64,
}

struct SurfaceWatcher {
    state: Arc<Mutex<SurfaceState>>,
    generation: u64,
}

impl SurfaceWatcher {
    fn update(&self, f: impl FnOnce(&mut SurfaceState)) {
        let mut state = lock!(self.state);
        if state.generation == self.generation {
            f(&mut state);
        }
    }
}

impl Watcher for SurfaceWatcher {
    fn on_progress(&self, fraction: f32) {
        self.update(|s| s.progress = Some(fraction));
    }

    fn on_loaded(&self, handle: PlaybackHandle) {
        self.update(|s| {
            s.handle = Some(handle);
            s.progress = None;
        });
    }

    fn on_frame_ready(&self, frame_index: u32) {
        self.update(|s| s.latest_ready = Some(frame_index));
    }

    fn on_loop_boundary(&self) {
        self.update(|s| s.loops += 1);
    }

    fn on_failed(&self, error: &EngineError) {
        self.update(|s| {
            s.handle = None;
            s.failed = Some(error.clone());
        });
    }
}

pub struct RenderSurface {
    ctx: Arc<EngineContext>,
    state: Arc<Mutex<SurfaceState>>,
    descriptor: Option<Descriptor>,
    registration: Option<WatchRegistration>,
    scale_mode: ScaleMode,
    rotation: Rotation,
    transform: Option<(u32, u32, u32, u32, FitTransform)>,
    presented_sequence: Option<u64>,
    vibration: VibrationTracker,
    haptics: Option<Box<dyn FnMut(Haptic) + Send>>,
    /// Frame to resume from after a detach tore the actor down
    resume_hint: Option<u32>,
}

impl RenderSurface {
    pub(crate) fn new(ctx: Arc<EngineContext>) -> Self {
        Self {
            ctx,
            state: Arc::new(Mutex::new(SurfaceState::default())),
            descriptor: None,
            registration: None,
            scale_mode: ScaleMode::default(),
            rotation: Rotation::default(),
            transform: None,
            presented_sequence: None,
            vibration: VibrationTracker::default(),
            haptics: None,
            resume_hint: None,
        }
    }

    /// Bind `descriptor`. A different identity detaches from the previous
    /// item and starts over with a placeholder.
    pub fn request_file(&mut self, descriptor: Descriptor) {
        if let Some(current) = &self.descriptor {
            if current.key() == descriptor.key() {
                if let Some(handle) = &lock!(self.state).handle {
                    handle.set_runtime(*descriptor.runtime());
                }
                self.descriptor = Some(descriptor);
                return;
            }
        }

        self.detach();
        self.reset();
        self.descriptor = Some(descriptor);
        self.attach();
    }

    fn reset(&mut self) {
        let mut state = lock!(self.state);
        let generation = state.generation + 1;
        *state = SurfaceState {
            generation,
            ..Default::default()
        };
        drop(state);

        self.transform = None;
        self.presented_sequence = None;
        self.resume_hint = None;
        self.vibration.reset();
    }

    /// Subscribe to the bound descriptor. No-op when already attached.
    pub fn attach(&mut self) {
        if self.registration.is_some() {
            return;
        }
        let Some(descriptor) = self.descriptor.clone() else {
            return;
        };

        let generation = {
            let mut state = lock!(self.state);
            state.generation += 1;
            state.handle = None;
            state.failed = None;
            state.generation
        };
        self.presented_sequence = None;

        let watcher = Arc::new(SurfaceWatcher {
            state: Arc::clone(&self.state),
            generation,
        });
        self.registration = Some(self.ctx.watch(descriptor, watcher, self.resume_hint));
    }

    /// Drop the subscription but keep the descriptor for a later `attach`
    pub fn detach(&mut self) {
        let Some(registration) = self.registration.take() else {
            return;
        };
        let mut state = lock!(self.state);
        self.resume_hint = state.last_frame;
        state.generation += 1;
        state.handle = None;
        drop(state);
        drop(registration);
    }

    pub fn is_attached(&self) -> bool {
        self.registration.is_some()
    }

    pub fn descriptor(&self) -> Option<&Descriptor> {
        self.descriptor.as_ref()
    }

    pub fn set_scale_mode(&mut self, mode: ScaleMode) {
        if self.scale_mode != mode {
            self.scale_mode = mode;
            self.transform = None;
            self.presented_sequence = None;
        }
    }

    pub fn set_rotation(&mut self, rotation: Rotation) {
        if self.rotation != rotation {
            self.rotation = rotation;
            self.transform = None;
            self.presented_sequence = None;
        }
    }

    /// Receive haptic events for vector items carrying a vibration pattern
    pub fn on_haptic(&mut self, f: impl FnMut(Haptic) + Send + 'static) {
        self.haptics = Some(Box::new(f));
    }

    pub fn handle(&self) -> Option<PlaybackHandle> {
        lock!(self.state).handle.clone()
    }

    pub fn is_loaded(&self) -> bool {
        lock!(self.state).handle.is_some()
    }

    pub fn progress(&self) -> Option<f32> {
        lock!(self.state).progress
    }

    pub fn failure(&self) -> Option<EngineError> {
        lock!(self.state).failed.clone()
    }

    pub fn last_frame(&self) -> Option<u32> {
        lock!(self.state).last_frame
    }

    /// Newest frame the actor reported decoded
    pub fn latest_ready_frame(&self) -> Option<u32> {
        lock!(self.state).latest_ready
    }

    pub fn loop_count(&self) -> u64 {
        lock!(self.state).loops
    }

    pub fn has_looped(&self) -> bool {
        self.handle().is_some_and(|h| h.has_looped())
    }

    pub fn resume(&self) {
        if let Some(handle) = self.handle() {
            handle.resume();
        }
    }

    pub fn seek_to_start(&self) {
        if let Some(handle) = self.handle() {
            handle.seek_to_start();
        }
    }

    fn transform_for(&mut self, source: (u32, u32), target: (u32, u32)) -> FitTransform {
        if let Some((sw, sh, tw, th, transform)) = self.transform {
            if (sw, sh) == source && (tw, th) == target {
                return transform;
            }
        }
        let transform = FitTransform::compute(source, target, self.scale_mode, self.rotation);
        self.transform = Some((source.0, source.1, target.0, target.1, transform));
        transform
    }

    /// Draw the current frame. Retires the previous head first so the
    /// actor can decode ahead.
    pub fn present(&mut self, canvas: &mut Canvas) -> PresentOutcome {
        let (handle, failed, progress) = {
            let state = lock!(self.state);
            (state.handle.clone(), state.failed.is_some(), state.progress)
        };
        if failed {
            return PresentOutcome::Failed;
        }
        let Some(handle) = handle else {
            return PresentOutcome::Placeholder { progress };
        };

        if let Some(retired) = handle.apply_next() {
            self.vibrate(&handle, retired);
        }

        let transform = self.transform_for(handle.dimensions(), (canvas.width, canvas.height));
        let last = self.presented_sequence;
        let drawn = handle.with_head(|frame| {
            if last == Some(frame.sequence()) {
                return None;
            }
            transform.blit(frame, canvas);
            Some((frame.sequence(), frame.frame_index()))
        });

        match drawn {
            Some(Some((sequence, frame_index))) => {
                self.presented_sequence = Some(sequence);
                lock!(self.state).last_frame = Some(frame_index);
                PresentOutcome::Presented { frame_index }
            }
            Some(None) => PresentOutcome::Unchanged,
            None => PresentOutcome::Placeholder { progress },
        }
    }

    fn vibrate(&mut self, handle: &PlaybackHandle, retired: u32) {
        let frame_rate = handle.frame_rate();
        if frame_rate == 0 {
            return;
        }
        let Some(pattern) = handle.runtime().vibration else {
            return;
        };
        if let Some(haptic) = self.vibration.on_frame_retired(pattern, retired, frame_rate) {
            log::trace!("Haptic {:?} at frame {}", haptic, retired);
            if let Some(haptics) = self.haptics.as_mut() {
                haptics(haptic);
            }
        }
    }
}

impl Drop for RenderSurface {
    fn drop(&mut self) {
        self.detach();
    }
}
