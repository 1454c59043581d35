//! State shared by the coordinator, actors and render surfaces.

use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use common::{Descriptor, FileId};

use crate::acquisition::Acquisition;
use crate::config::EngineConfig;
use crate::coordinator::{CoordinatorMessage, WatchRegistration, Watcher, WatcherId};
use crate::decode::DecoderBackend;
use crate::disk_cache::DiskFrameCache;
use crate::pacing::PacingPolicy;
use crate::pool::DecoderThreadPool;
use crate::resource_monitor::PerformanceMode;

/// External round-video player an item may follow
pub trait RoundVideoPlayer: Send + Sync {
    /// File currently loaded in the player, if any
    fn playing_file(&self) -> Option<FileId>;

    fn position(&self) -> Duration;

    /// Whether other round items must pause while this player runs
    fn is_exclusive(&self) -> bool {
        true
    }
}

/// How a round-video item relates to the external player
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RoundVideo {
    /// No player, or a non-exclusive one playing something else
    Idle,
    /// The player is playing this very file
    Aligned(Duration),
    /// An exclusive player is playing another file
    Conflict,
}

pub(crate) struct EngineContext {
    pub config: EngineConfig,
    pub backend: Arc<dyn DecoderBackend>,
    pub acquisition: Arc<dyn Acquisition>,
    pub disk_cache: Option<DiskFrameCache>,
    pub pool: DecoderThreadPool,
    pub coordinator_tx: Sender<CoordinatorMessage>,
    freeze_count: AtomicU32,
    mode: AtomicU8,
    round_video_player: RwLock<Option<Arc<dyn RoundVideoPlayer>>>,
    next_watcher_id: AtomicU64,
    /// Set once at shutdown; cancels in-flight cache builds
    pub shutting_down: Arc<AtomicBool>,
    started_at: Instant,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        backend: Arc<dyn DecoderBackend>,
        acquisition: Arc<dyn Acquisition>,
        disk_cache: Option<DiskFrameCache>,
        pool: DecoderThreadPool,
        coordinator_tx: Sender<CoordinatorMessage>,
    ) -> Self {
        let mode = config.playback.mode();
        Self {
            config,
            backend,
            acquisition,
            disk_cache,
            pool,
            coordinator_tx,
            freeze_count: AtomicU32::new(0),
            mode: AtomicU8::new(mode.to_u8()),
            round_video_player: RwLock::new(None),
            next_watcher_id: AtomicU64::new(1),
            shutting_down: Arc::new(AtomicBool::new(false)),
            started_at: Instant::now(),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn freeze_count(&self) -> u32 {
        self.freeze_count.load(Ordering::Acquire)
    }

    pub fn acquire_freeze(&self) -> u32 {
        self.freeze_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one freeze; the last release reschedules every actor
    pub fn release_freeze(&self) {
        let previous = self
            .freeze_count
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1));
        if previous == Ok(1) {
            log::debug!("Global freeze released");
            let _ = self.coordinator_tx.send(CoordinatorMessage::Unfrozen);
        }
    }

    pub fn performance_mode(&self) -> PerformanceMode {
        PerformanceMode::from_u8(self.mode.load(Ordering::Acquire))
    }

    pub fn set_performance_mode(&self, mode: PerformanceMode) -> bool {
        self.mode.swap(mode.to_u8(), Ordering::AcqRel) != mode.to_u8()
    }

    pub fn pacing_policy(&self) -> PacingPolicy {
        PacingPolicy::from_settings(&self.config.playback, self.performance_mode())
    }

    pub fn set_round_video_player(&self, player: Option<Arc<dyn RoundVideoPlayer>>) {
        *self
            .round_video_player
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = player;
    }

    pub fn round_video_state(&self, file_id: FileId) -> RoundVideo {
        let player = self
            .round_video_player
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Some(player) = player.as_ref() else {
            return RoundVideo::Idle;
        };
        match player.playing_file() {
            Some(playing) if playing == file_id => RoundVideo::Aligned(player.position()),
            Some(_) if player.is_exclusive() => RoundVideo::Conflict,
            _ => RoundVideo::Idle,
        }
    }

    /// Register `watcher` for `descriptor`; dropping the registration detaches it
    pub fn watch(
        &self,
        descriptor: Descriptor,
        watcher: Arc<dyn Watcher>,
        resume_from: Option<u32>,
    ) -> WatchRegistration {
        let watcher_id: WatcherId = self.next_watcher_id.fetch_add(1, Ordering::Relaxed);
        let _ = self.coordinator_tx.send(CoordinatorMessage::RequestFile {
            descriptor,
            watcher_id,
            watcher,
            resume_from,
        });
        WatchRegistration::new(watcher_id, self.coordinator_tx.clone())
    }
}
