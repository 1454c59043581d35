//! Headless preview surfaces driven by the daemon.
//!
//! Each preview owns a [`RenderSurface`] on its own thread and presents into
//! an off-screen canvas at the display refresh rate, so IPC clients can
//! exercise the full decode path without a compositor.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use common::Descriptor;
use engine::{Canvas, PresentOutcome, RenderSurface};

pub struct Preview {
    id: u64,
    stop: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Preview {
    pub fn spawn(
        id: u64,
        mut surface: RenderSurface,
        descriptor: Descriptor,
        width: u32,
        height: u32,
        refresh_rate: u32,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let thread_stop = Arc::clone(&stop);
        let period = Duration::from_secs_f64(1.0 / refresh_rate.max(1) as f64);

        let thread = thread::Builder::new()
            .name(format!("animd-preview-{}", id))
            .spawn(move || {
                let mut canvas = Canvas::new(width, height);
                surface.request_file(descriptor);
                let mut presented = 0u64;

                while !thread_stop.load(Ordering::Acquire) {
                    match surface.present(&mut canvas) {
                        PresentOutcome::Presented { frame_index } => {
                            presented += 1;
                            log::trace!("Preview {} presented frame {}", id, frame_index);
                        }
                        PresentOutcome::Failed => {
                            if let Some(e) = surface.failure() {
                                log::warn!("Preview {} failed: {}", id, e);
                            }
                            break;
                        }
                        PresentOutcome::Unchanged | PresentOutcome::Placeholder { .. } => {}
                    }
                    thread::sleep(period);
                }

                log::info!(
                    "Preview {} stopped after {} frames ({} loops)",
                    id,
                    presented,
                    surface.loop_count()
                );
            })
            .with_context(|| format!("Failed to spawn preview thread {}", id))?;

        Ok(Self {
            id,
            stop,
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop presenting and wait for the thread; its surface detaches on drop
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                log::error!("Preview {} thread panicked", self.id);
            }
        }
    }
}

impl Drop for Preview {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
    }
}
