use image::{AnimationDecoder, codecs::gif::GifDecoder};
use rayon::prelude::*;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::time::{Duration, Instant};

use common::{ColorVariant, ItemKind, RenderSize};

use super::{DecodeError, DecoderBackend, FrameSource, ReadOutcome, VectorSource};
use crate::frame_ring::FrameBuffer;

/// Minimum frame delay (100fps max)
const MIN_FRAME_DELAY: Duration = Duration::from_millis(10);

/// Decodes animated GIFs with the `image` crate
#[derive(Debug, Default, Clone, Copy)]
pub struct GifBackend;

impl DecoderBackend for GifBackend {
    fn open_stream(&self, path: &Path, kind: ItemKind) -> Result<Box<dyn FrameSource>, DecodeError> {
        match kind {
            ItemKind::RasterLoop => Ok(Box::new(GifSource::open(path)?)),
            other => Err(DecodeError::Unsupported(format!(
                "{} streams are not handled by the GIF backend",
                other.name()
            ))),
        }
    }

    fn open_vector(
        &self,
        path: &Path,
        _size: RenderSize,
        _variant: ColorVariant,
    ) -> Result<Box<dyn VectorSource>, DecodeError> {
        Err(DecodeError::Unsupported(format!(
            "no vector rasterizer for {}",
            path.display()
        )))
    }
}

/// One composited RGBA frame
struct GifFrame {
    rgba: Vec<u8>,
    delay: Duration,
}

/// Fully decoded GIF, replayed frame by frame
pub struct GifSource {
    frames: Vec<GifFrame>,
    width: u32,
    height: u32,
    cursor: usize,
}

impl GifSource {
    pub fn open(path: &Path) -> Result<Self, DecodeError> {
        let load_start = Instant::now();
        let file = File::open(path)?;
        let decoder = GifDecoder::new(BufReader::new(file))
            .map_err(|e| DecodeError::Open(format!("{}: {}", path.display(), e)))?;

        let decoded = decoder
            .into_frames()
            .collect_frames()
            .map_err(|e| DecodeError::Broken(format!("{}: {}", path.display(), e)))?;

        let Some(first) = decoded.first() else {
            return Err(DecodeError::Open(format!("{} has no frames", path.display())));
        };
        let (width, height) = first.buffer().dimensions();
        if width == 0 || height == 0 {
            return Err(DecodeError::Open(format!(
                "{} has invalid dimensions {}x{}",
                path.display(),
                width,
                height
            )));
        }

        // Frames come out composited to the full canvas; only the delay needs work
        let frames: Vec<GifFrame> = decoded
            .into_par_iter()
            .map(|frame| {
                let (numer, denom) = frame.delay().numer_denom_ms();
                let delay = Duration::from_millis(numer as u64 / denom.max(1) as u64)
                    .max(MIN_FRAME_DELAY);
                GifFrame {
                    rgba: frame.into_buffer().into_raw(),
                    delay,
                }
            })
            .collect();

        log::debug!(
            "Decoded GIF {} ({}x{}, {} frames) in {:.2}s",
            path.display(),
            width,
            height,
            frames.len(),
            load_start.elapsed().as_secs_f64()
        );

        Ok(Self {
            frames,
            width,
            height,
            cursor: 0,
        })
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }
}

impl FrameSource for GifSource {
    fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    fn read_next_frame(&mut self, buffer: &mut FrameBuffer) -> Result<ReadOutcome, DecodeError> {
        let Some(frame) = self.frames.get(self.cursor) else {
            return Ok(ReadOutcome::EndOfStream);
        };

        let target = buffer.pixels_mut();
        if target.len() != frame.rgba.len() {
            return Err(DecodeError::Broken(format!(
                "frame {} is {} bytes, buffer holds {}",
                self.cursor,
                frame.rgba.len(),
                target.len()
            )));
        }
        target.copy_from_slice(&frame.rgba);

        let index = self.cursor as u32;
        self.cursor += 1;
        Ok(ReadOutcome::Frame {
            index,
            duration: frame.delay,
        })
    }

    fn seek_to_start(&mut self) -> Result<(), DecodeError> {
        self.cursor = 0;
        Ok(())
    }

    fn seek_to_time(&mut self, position: Duration) -> Result<(), DecodeError> {
        let total: Duration = self.frames.iter().map(|f| f.delay).sum();
        if total.is_zero() {
            self.cursor = 0;
            return Ok(());
        }

        let mut remaining = Duration::from_nanos((position.as_nanos() % total.as_nanos()) as u64);
        self.cursor = 0;
        for (idx, frame) in self.frames.iter().enumerate() {
            if remaining < frame.delay {
                self.cursor = idx;
                break;
            }
            remaining -= frame.delay;
        }
        Ok(())
    }
}
