//! Animated media playback engine.
//!
//! Decodes raster loops, video loops and vector animations on a small fixed
//! pool of worker threads and hands frames to render surfaces through
//! bounded frame rings. Requests for the same descriptor share one decode
//! stream. Pre-rasterized vector frames are kept in a disk cache with
//! per-entry expiry.
//!
//! The [`Engine`] is the process-scoped entry point: it owns the decoder
//! pools, the coordinator thread, the disk cache and the global freeze
//! counter.

pub mod acquisition;
pub mod actor;
pub mod clock;
pub mod config;
pub mod coordinator;
pub mod decode;
pub mod disk_cache;
pub mod frame_ring;
pub mod pacing;
pub mod resource_monitor;
pub mod stats;
pub mod surface;
pub mod vibration;

mod context;
mod macros;
mod pool;

pub use acquisition::{Acquisition, AcquisitionEvents, LocalFiles, Resolution};
pub use actor::{ActorId, ActorState, PlaybackHandle};
pub use config::EngineConfig;
pub use context::RoundVideoPlayer;
pub use coordinator::{WatchRegistration, Watcher, WatcherId};
pub use decode::{DecoderBackend, GifBackend};
pub use disk_cache::DiskFrameCache;
pub use resource_monitor::PerformanceMode;
pub use surface::{Canvas, FitTransform, PresentOutcome, RenderSurface};
pub use vibration::Haptic;

use anyhow::Context;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use common::{CacheStatus, Descriptor, EngineError, EngineStatus};

use crate::context::EngineContext;
use crate::coordinator::{Coordinator, CoordinatorMessage};
use crate::pool::DecoderThreadPool;

const STATUS_TIMEOUT: Duration = Duration::from_secs(2);
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Engine {
    ctx: Arc<EngineContext>,
    coordinator: Mutex<Option<JoinHandle<()>>>,
}

impl Engine {
    /// Start with the disk cache described by `config.cache`. A cache that
    /// cannot be opened disables caching instead of failing startup.
    pub fn start(
        config: EngineConfig,
        backend: Arc<dyn DecoderBackend>,
        acquisition: Arc<dyn Acquisition>,
    ) -> anyhow::Result<Self> {
        let disk_cache = if config.cache.enabled {
            match DiskFrameCache::open(&config.cache) {
                Ok(cache) => Some(cache),
                Err(e) => {
                    log::warn!("Frame cache disabled: {:#}", e);
                    None
                }
            }
        } else {
            log::info!("Frame cache disabled by configuration");
            None
        };
        Self::start_with_cache(config, backend, acquisition, disk_cache)
    }

    pub fn start_with_cache(
        config: EngineConfig,
        backend: Arc<dyn DecoderBackend>,
        acquisition: Arc<dyn Acquisition>,
        disk_cache: Option<DiskFrameCache>,
    ) -> anyhow::Result<Self> {
        config.validate().context("Invalid engine configuration")?;

        let pool = DecoderThreadPool::new(&config.decoder)?;
        let (tx, rx) = crossbeam_channel::unbounded();
        let ctx = Arc::new(EngineContext::new(
            config,
            backend,
            acquisition,
            disk_cache,
            pool,
            tx,
        ));

        let coordinator = Coordinator::new(Arc::clone(&ctx), rx);
        let handle = thread::Builder::new()
            .name("animd-coordinator".to_string())
            .spawn(move || coordinator.run())
            .context("Failed to spawn coordinator thread")?;

        log::info!(
            "Engine started ({} mode)",
            ctx.performance_mode().name()
        );
        Ok(Self {
            ctx,
            coordinator: Mutex::new(Some(handle)),
        })
    }

    /// Subscribe `watcher` to `descriptor` without a render surface
    pub fn watch(&self, descriptor: Descriptor, watcher: Arc<dyn Watcher>) -> WatchRegistration {
        self.ctx.watch(descriptor, watcher, None)
    }

    pub fn surface(&self) -> RenderSurface {
        RenderSurface::new(Arc::clone(&self.ctx))
    }

    /// Suppress decoding for non-whitelisted items while the guard lives
    pub fn freeze(&self) -> FreezeGuard {
        let count = self.ctx.acquire_freeze();
        log::debug!("Global freeze acquired ({} held)", count);
        FreezeGuard {
            ctx: Arc::clone(&self.ctx),
        }
    }

    pub fn freeze_count(&self) -> u32 {
        self.ctx.freeze_count()
    }

    pub fn set_round_video_player(&self, player: Option<Arc<dyn RoundVideoPlayer>>) {
        self.ctx.set_round_video_player(player);
        self.notify_player_changed();
    }

    /// Re-evaluate round-video items after the player changed file or state
    pub fn notify_player_changed(&self) {
        let _ = self.ctx.coordinator_tx.send(CoordinatorMessage::Unfrozen);
    }

    pub fn performance_mode(&self) -> PerformanceMode {
        self.ctx.performance_mode()
    }

    pub fn set_performance_mode(&self, mode: PerformanceMode) {
        if self.ctx.set_performance_mode(mode) {
            log::info!("Performance mode set to {}", mode.name());
            let _ = self.ctx.coordinator_tx.send(CoordinatorMessage::Unfrozen);
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn disk_cache(&self) -> Option<&DiskFrameCache> {
        self.ctx.disk_cache.as_ref()
    }

    pub fn uptime_secs(&self) -> u64 {
        self.ctx.uptime().as_secs()
    }

    /// Snapshot of every live actor, answered by the coordinator thread
    pub fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply, rx) = crossbeam_channel::bounded(1);
        self.ctx
            .coordinator_tx
            .send(CoordinatorMessage::Query { reply })
            .map_err(|_| EngineError::InvalidState("coordinator is not running".to_string()))?;
        let actors = rx
            .recv_timeout(STATUS_TIMEOUT)
            .map_err(|e| EngineError::InvalidState(format!("status query failed: {}", e)))?;

        let cache = match &self.ctx.disk_cache {
            Some(cache) => CacheStatus {
                enabled: true,
                directory: cache.root().display().to_string(),
                entries: cache.entry_count(),
            },
            None => CacheStatus::default(),
        };

        Ok(EngineStatus {
            version: env!("CARGO_PKG_VERSION").to_string(),
            uptime_secs: self.uptime_secs(),
            freeze_count: self.freeze_count(),
            performance_mode: self.performance_mode().name().to_string(),
            actors,
            cache,
        })
    }

    /// Cancel every actor, stop the coordinator, workers and cache thread.
    /// Idempotent.
    pub fn shutdown(&self) {
        let Some(handle) = lock!(self.coordinator).take() else {
            return;
        };
        log::info!("Engine shutting down");
        self.ctx.shutting_down.store(true, Ordering::Release);

        let (done, done_rx) = crossbeam_channel::bounded(1);
        if self
            .ctx
            .coordinator_tx
            .send(CoordinatorMessage::Shutdown { done })
            .is_ok()
            && done_rx.recv_timeout(SHUTDOWN_TIMEOUT).is_err()
        {
            log::warn!("Coordinator did not acknowledge shutdown");
        }
        let _ = handle.join();

        self.ctx.pool.shutdown();
        if let Some(cache) = &self.ctx.disk_cache {
            cache.shutdown();
        }
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Holds one global freeze; dropping it releases the hold
pub struct FreezeGuard {
    ctx: Arc<EngineContext>,
}

impl Drop for FreezeGuard {
    fn drop(&mut self) {
        self.ctx.release_freeze();
    }
}
