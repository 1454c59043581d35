//! Decode primitive boundary.
//!
//! The engine treats codecs as opaque: a [`DecoderBackend`] opens a file and
//! hands back either a sequential [`FrameSource`] (raster and video loops) or
//! a random-access [`VectorSource`]. Every call is blocking and runs on a
//! decoder pool thread. Dropping a source closes it.

mod gif;

pub use gif::GifBackend;

use std::path::Path;
use std::sync::atomic::AtomicBool;
use std::time::Duration;

use common::{ColorVariant, EngineError, ItemKind, RenderSize};
use thiserror::Error;

use crate::frame_ring::FrameBuffer;

#[derive(Error, Debug)]
pub enum DecodeError {
    #[error("cannot open: {0}")]
    Open(String),

    #[error("broken stream: {0}")]
    Broken(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl DecodeError {
    /// Map to the engine taxonomy for a failure while opening
    pub fn into_open_error(self) -> EngineError {
        EngineError::DecodeOpen(self.to_string())
    }

    /// Map to the engine taxonomy for a failure mid-stream
    pub fn into_step_error(self) -> EngineError {
        EngineError::DecodeStep(self.to_string())
    }
}

/// Result of one sequential read
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// The buffer now holds frame `index`, to be shown for `duration`
    Frame { index: u32, duration: Duration },
    /// No more frames; the buffer was not written
    EndOfStream,
}

/// Sequential decoder for raster and video loops
pub trait FrameSource: Send {
    /// Frame size in pixels
    fn dimensions(&self) -> (u32, u32);

    fn read_next_frame(&mut self, buffer: &mut FrameBuffer) -> Result<ReadOutcome, DecodeError>;

    fn seek_to_start(&mut self) -> Result<(), DecodeError>;

    /// Position the stream so the next read returns the frame at `position`
    fn seek_to_time(&mut self, position: Duration) -> Result<(), DecodeError>;
}

/// Static properties of a vector animation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorInfo {
    pub width: u32,
    pub height: u32,
    pub frame_count: u32,
    /// Intrinsic frames per second
    pub frame_rate: u32,
}

/// Outcome of checking a pre-rasterized cache file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheValidation {
    AlreadyValid,
    NeedsBuild,
    Error(String),
    Canceled,
}

/// Random-access rasterizer for vector animations
pub trait VectorSource: Send {
    fn info(&self) -> VectorInfo;

    fn render_frame_at_index(
        &mut self,
        index: u32,
        buffer: &mut FrameBuffer,
    ) -> Result<(), DecodeError>;

    fn validate_cache(&mut self, cache_file: &Path) -> CacheValidation;

    /// Rasterize every frame into `cache_file`. Stops early when `cancel` is set.
    fn build_cache(&mut self, cache_file: &Path, cancel: &AtomicBool) -> Result<(), DecodeError>;

    /// Serve subsequent renders from a valid cache file
    fn attach_cache(&mut self, cache_file: &Path) -> Result<(), DecodeError>;
}

/// Opens decode contexts
pub trait DecoderBackend: Send + Sync {
    fn open_stream(&self, path: &Path, kind: ItemKind) -> Result<Box<dyn FrameSource>, DecodeError>;

    fn open_vector(
        &self,
        path: &Path,
        size: RenderSize,
        variant: ColorVariant,
    ) -> Result<Box<dyn VectorSource>, DecodeError>;
}
