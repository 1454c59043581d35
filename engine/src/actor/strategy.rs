//! Per-kind decode strategies, selected once when an actor opens its file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use common::{Descriptor, EngineError, ItemKind};

use crate::decode::{DecoderBackend, FrameSource, ReadOutcome, VectorInfo, VectorSource};
use crate::frame_ring::FrameBuffer;
use crate::pacing;

/// Inputs for one decode step, sampled by the actor
#[derive(Debug, Clone, Copy)]
pub(crate) struct StepEnv {
    pub effective_rate: u32,
    pub play_once: bool,
    pub still: bool,
    pub decode_last_frame: bool,
    /// Round-video position to align to before reading
    pub align_to: Option<Duration>,
}

/// What a step put into the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
    Frame {
        index: u32,
        interval: Duration,
        loop_boundary: bool,
    },
    /// Play-once item reached its end; the buffer was not written
    LoopEnd,
}

pub(crate) enum Strategy {
    Raster(StreamStrategy),
    Video(StreamStrategy),
    Vector(VectorStrategy),
}

impl Strategy {
    pub fn open(
        backend: &dyn DecoderBackend,
        descriptor: &Descriptor,
        path: &Path,
        resume_from: Option<u32>,
    ) -> Result<Self, EngineError> {
        match descriptor.kind() {
            ItemKind::RasterLoop => Ok(Self::Raster(StreamStrategy::open(
                backend,
                path,
                ItemKind::RasterLoop,
                resume_from,
            )?)),
            ItemKind::VideoLoop => Ok(Self::Video(StreamStrategy::open(
                backend,
                path,
                ItemKind::VideoLoop,
                resume_from,
            )?)),
            ItemKind::VectorAnimation => {
                let source = backend
                    .open_vector(
                        path,
                        descriptor.key().render_size,
                        descriptor.key().color_variant,
                    )
                    .map_err(|e| e.into_open_error())?;
                Ok(Self::Vector(VectorStrategy::new(source, resume_from)?))
            }
        }
    }

    pub fn dimensions(&self) -> (u32, u32) {
        match self {
            Self::Raster(s) | Self::Video(s) => s.source.dimensions(),
            Self::Vector(v) => (v.info.width, v.info.height),
        }
    }

    /// Intrinsic frame rate, zero when frames carry their own durations
    pub fn frame_rate(&self) -> u32 {
        match self {
            Self::Raster(_) | Self::Video(_) => 0,
            Self::Vector(v) => v.info.frame_rate,
        }
    }

    pub fn fill_initial(
        &mut self,
        buffer: &mut FrameBuffer,
        env: &StepEnv,
        first: bool,
    ) -> Result<Duration, EngineError> {
        match self {
            Self::Raster(s) | Self::Video(s) => s.fill_initial(buffer, env, first),
            Self::Vector(v) => v.fill_initial(buffer, env, first),
        }
    }

    pub fn step(&mut self, buffer: &mut FrameBuffer, env: &StepEnv) -> Result<Step, EngineError> {
        match self {
            Self::Raster(s) => s.step(buffer, &StepEnv { align_to: None, ..*env }),
            Self::Video(s) => s.step(buffer, env),
            Self::Vector(v) => v.step(buffer, env),
        }
    }

    /// Back to frame zero for a seek-to-start
    pub fn rewind(&mut self) -> Result<(), EngineError> {
        match self {
            Self::Raster(s) | Self::Video(s) => s
                .source
                .seek_to_start()
                .map_err(|e| e.into_step_error()),
            Self::Vector(v) => {
                v.cursor = 0;
                Ok(())
            }
        }
    }
}

pub(crate) struct StreamStrategy {
    source: Box<dyn FrameSource>,
    /// Frame to skip forward to on the first fill
    start_frame: Option<u32>,
}

impl StreamStrategy {
    fn open(
        backend: &dyn DecoderBackend,
        path: &Path,
        kind: ItemKind,
        resume_from: Option<u32>,
    ) -> Result<Self, EngineError> {
        let source = backend
            .open_stream(path, kind)
            .map_err(|e| e.into_open_error())?;
        let (width, height) = source.dimensions();
        if width == 0 || height == 0 {
            return Err(EngineError::DecodeOpen(format!(
                "bad dimensions {}x{}",
                width, height
            )));
        }
        Ok(Self {
            source,
            start_frame: resume_from.filter(|f| *f > 0),
        })
    }

    fn read(&mut self, buffer: &mut FrameBuffer) -> Result<ReadOutcome, EngineError> {
        self.source
            .read_next_frame(buffer)
            .map_err(|e| e.into_step_error())
    }

    fn fill_initial(
        &mut self,
        buffer: &mut FrameBuffer,
        env: &StepEnv,
        first: bool,
    ) -> Result<Duration, EngineError> {
        if first && env.still && env.decode_last_frame {
            // EndOfStream leaves the buffer untouched, so it holds the last frame
            let mut last = None;
            while let ReadOutcome::Frame { index, duration } = self.read(buffer)? {
                last = Some((index, duration));
            }
            let (index, duration) =
                last.ok_or_else(|| EngineError::DecodeOpen("stream has no frames".to_string()))?;
            buffer.set_frame_index(index);
            return Ok(duration);
        }

        if first {
            if let Some(target) = self.start_frame.take() {
                let skipped = self.skip_to(buffer, target, env).map_err(|e| match e {
                    EngineError::DecodeStep(msg) => EngineError::DecodeOpen(msg),
                    other => other,
                })?;
                if let Some(interval) = skipped {
                    return Ok(interval);
                }
            }
        }

        match self.step(buffer, &StepEnv {
            play_once: false,
            ..*env
        }) {
            Ok(Step::Frame {
                index, interval, ..
            }) => {
                buffer.set_frame_index(index);
                Ok(interval)
            }
            Ok(Step::LoopEnd) => Err(EngineError::DecodeOpen("stream has no frames".to_string())),
            Err(EngineError::DecodeStep(msg)) if first => Err(EngineError::DecodeOpen(msg)),
            Err(e) => Err(e),
        }
    }

    /// Read forward until frame `target`. A target past the end of the
    /// stream rewinds and yields `None`.
    fn skip_to(
        &mut self,
        buffer: &mut FrameBuffer,
        target: u32,
        env: &StepEnv,
    ) -> Result<Option<Duration>, EngineError> {
        loop {
            match self.read(buffer)? {
                ReadOutcome::Frame { index, duration } if index >= target => {
                    buffer.set_frame_index(index);
                    return Ok(Some(pacing::raster_interval(duration, env.effective_rate)));
                }
                ReadOutcome::Frame { .. } => {}
                ReadOutcome::EndOfStream => {
                    self.source
                        .seek_to_start()
                        .map_err(|e| e.into_step_error())?;
                    return Ok(None);
                }
            }
        }
    }

    fn step(&mut self, buffer: &mut FrameBuffer, env: &StepEnv) -> Result<Step, EngineError> {
        if let Some(position) = env.align_to {
            self.source
                .seek_to_time(position)
                .map_err(|e| e.into_step_error())?;
        }

        match self.read(buffer)? {
            ReadOutcome::Frame { index, duration } => Ok(Step::Frame {
                index,
                interval: pacing::raster_interval(duration, env.effective_rate),
                loop_boundary: false,
            }),
            ReadOutcome::EndOfStream if env.play_once => {
                // Rewound now so a resume starts the next pass at frame zero
                self.source
                    .seek_to_start()
                    .map_err(|e| e.into_step_error())?;
                Ok(Step::LoopEnd)
            }
            ReadOutcome::EndOfStream => {
                self.source
                    .seek_to_start()
                    .map_err(|e| e.into_step_error())?;
                match self.read(buffer)? {
                    ReadOutcome::Frame { index, duration } => Ok(Step::Frame {
                        index,
                        interval: pacing::raster_interval(duration, env.effective_rate),
                        loop_boundary: true,
                    }),
                    ReadOutcome::EndOfStream => Err(EngineError::DecodeStep(
                        "stream produced no frames after rewinding".to_string(),
                    )),
                }
            }
        }
    }
}

/// Disk cache use by a vector strategy
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CacheUse {
    /// Rendering from the live context only
    Live,
    /// A maintenance-thread build is in flight for this file
    Building(PathBuf),
    Attached,
}

pub(crate) struct VectorStrategy {
    pub(crate) source: Box<dyn VectorSource>,
    pub(crate) info: VectorInfo,
    /// Next frame index to render
    cursor: u32,
    start_frame: Option<u32>,
    pub(crate) cache: CacheUse,
}

impl VectorStrategy {
    fn new(source: Box<dyn VectorSource>, resume_from: Option<u32>) -> Result<Self, EngineError> {
        let info = source.info();
        if info.frame_count == 0 {
            return Err(EngineError::DecodeOpen("zero frame count".to_string()));
        }
        if info.width == 0 || info.height == 0 || info.frame_rate == 0 {
            return Err(EngineError::DecodeOpen(format!(
                "bad vector header {}x{} @ {}fps",
                info.width, info.height, info.frame_rate
            )));
        }
        Ok(Self {
            source,
            info,
            cursor: 0,
            start_frame: resume_from.filter(|f| *f < info.frame_count),
            cache: CacheUse::Live,
        })
    }

    fn render(&mut self, index: u32, buffer: &mut FrameBuffer) -> Result<(), EngineError> {
        self.source
            .render_frame_at_index(index, buffer)
            .map_err(|e| e.into_step_error())?;
        buffer.set_frame_index(index);
        Ok(())
    }

    fn delta(&self, env: &StepEnv) -> u32 {
        pacing::frame_delta(self.info.frame_rate, env.effective_rate)
    }

    fn fill_initial(
        &mut self,
        buffer: &mut FrameBuffer,
        env: &StepEnv,
        first: bool,
    ) -> Result<Duration, EngineError> {
        let delta = self.delta(env);
        let index = if first && env.still {
            if env.decode_last_frame {
                self.info.frame_count - 1
            } else {
                0
            }
        } else if first {
            self.start_frame.take().unwrap_or(0)
        } else {
            self.cursor % self.info.frame_count
        };

        self.render(index, buffer).map_err(|e| match e {
            EngineError::DecodeStep(msg) if first => EngineError::DecodeOpen(msg),
            other => other,
        })?;
        self.cursor = index + delta;
        Ok(pacing::vector_interval(self.info.frame_rate, delta))
    }

    fn step(&mut self, buffer: &mut FrameBuffer, env: &StepEnv) -> Result<Step, EngineError> {
        let delta = self.delta(env);
        let mut loop_boundary = false;
        if self.cursor >= self.info.frame_count {
            loop_boundary = true;
            self.cursor = 0;
            if env.play_once {
                return Ok(Step::LoopEnd);
            }
        }

        let index = self.cursor;
        self.render(index, buffer)?;
        self.cursor = index + delta;
        Ok(Step::Frame {
            index,
            interval: pacing::vector_interval(self.info.frame_rate, delta),
            loop_boundary,
        })
    }

    /// Switch to a cache file built elsewhere; failure keeps live decoding
    pub fn attach_built_cache(&mut self) {
        if let CacheUse::Building(path) = &self.cache {
            match self.source.attach_cache(path) {
                Ok(()) => {
                    log::debug!("Attached frame cache {}", path.display());
                    self.cache = CacheUse::Attached;
                }
                Err(e) => {
                    log::warn!(
                        "Failed to attach frame cache {}: {}, decoding live",
                        path.display(),
                        e
                    );
                    self.cache = CacheUse::Live;
                }
            }
        }
    }
}
