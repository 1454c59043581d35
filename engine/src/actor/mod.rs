//! Per-descriptor decode/playback state machine.
//!
//! An actor is created and started by the coordinator, decodes on the single
//! pool worker it was assigned at construction and publishes frames into its
//! [`FrameRing`]. Scheduling decisions (`request_next_frame`) run on the
//! coordinator thread; decode steps run on the worker. At most one worker
//! message per actor is in flight, which keeps native calls for one item
//! strictly sequential.

mod strategy;

pub(crate) use strategy::{CacheUse, Step, StepEnv, Strategy};

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use common::{ActorStatus, Descriptor, EngineError, FileId, ItemKind, RuntimeFlags};

use crate::acquisition::{AcquisitionEvents, Resolution};
use crate::context::{EngineContext, RoundVideo};
use crate::coordinator::CoordinatorMessage;
use crate::decode::CacheValidation;
use crate::disk_cache::{BuildRequest, CacheKey};
use crate::frame_ring::{FrameBuffer, FrameRing, RingCounts};
use crate::lock;
use crate::pool::{WorkerHandle, WorkerMessage};
use crate::stats::PlaybackStats;

pub type ActorId = u64;

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(30);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ActorState {
    Created = 0,
    /// Waiting for the source file to become local
    Acquiring = 1,
    /// Opening the decoder and reading the first frame
    Decoding = 2,
    Playing = 3,
    /// No render surface currently needs a frame
    Awaiting = 4,
    /// A global or per-item freeze holds
    Frozen = 5,
    Destroyed = 6,
}

impl ActorState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Acquiring,
            2 => Self::Decoding,
            3 => Self::Playing,
            4 => Self::Awaiting,
            5 => Self::Frozen,
            6 => Self::Destroyed,
            _ => Self::Created,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Acquiring => "acquiring",
            Self::Decoding => "decoding",
            Self::Playing => "playing",
            Self::Awaiting => "awaiting",
            Self::Frozen => "frozen",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Result of a worker job, reported to the coordinator
#[derive(Debug)]
pub(crate) enum StepOutcome {
    /// Decoder opened and the ring holds its first frame(s)
    Loaded,
    Frame { index: u32, loop_boundary: bool },
    /// No free buffer this cycle
    Skipped,
    /// Play-once item finished its loop and waits for a resume
    LoopFrozen,
    Failed(EngineError),
    Cancelled,
}

/// Why `request_next_frame` did or did not post work
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum NextFrame {
    Inactive,
    Frozen,
    AwaitingResume,
    Awaiting,
    InFlight,
    Deferred(Instant),
    Scheduled,
}

pub struct PlaybackActor {
    id: ActorId,
    descriptor: Descriptor,
    runtime: Mutex<RuntimeFlags>,
    ctx: Arc<EngineContext>,
    worker: WorkerHandle,
    resume_from: Option<u32>,

    state: AtomicU8,
    started: AtomicBool,
    cancelled: AtomicBool,
    in_flight: AtomicBool,
    loaded: AtomicBool,
    has_looped: AtomicBool,
    loop_frozen: AtomicBool,
    seek_pending: AtomicBool,
    cache_ready: AtomicBool,
    watchers: AtomicUsize,
    frame_rate: AtomicU32,

    ring: OnceLock<Arc<FrameRing>>,
    /// Only touched by the assigned worker
    decoder: Mutex<Option<Strategy>>,
    local_path: Mutex<Option<PathBuf>>,
    next_due: Mutex<Option<Instant>>,
    align_to: Mutex<Option<Duration>>,
    stats: Mutex<PlaybackStats>,
}

impl PlaybackActor {
    pub(crate) fn new(
        id: ActorId,
        descriptor: Descriptor,
        ctx: Arc<EngineContext>,
        resume_from: Option<u32>,
    ) -> Arc<Self> {
        let worker = ctx
            .pool
            .assign(descriptor.kind(), descriptor.modifiers().compact);
        log::debug!(
            "Actor {} for {} file {} on {}",
            id,
            descriptor.kind().name(),
            descriptor.file_id(),
            worker.name()
        );

        Arc::new(Self {
            id,
            runtime: Mutex::new(*descriptor.runtime()),
            descriptor,
            ctx,
            worker,
            resume_from,
            state: AtomicU8::new(ActorState::Created as u8),
            started: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            in_flight: AtomicBool::new(false),
            loaded: AtomicBool::new(false),
            has_looped: AtomicBool::new(false),
            loop_frozen: AtomicBool::new(false),
            seek_pending: AtomicBool::new(false),
            cache_ready: AtomicBool::new(false),
            watchers: AtomicUsize::new(0),
            frame_rate: AtomicU32::new(0),
            ring: OnceLock::new(),
            decoder: Mutex::new(None),
            local_path: Mutex::new(None),
            next_due: Mutex::new(None),
            align_to: Mutex::new(None),
            stats: Mutex::new(PlaybackStats::new()),
        })
    }

    pub fn id(&self) -> ActorId {
        self.id
    }

    pub fn descriptor(&self) -> &Descriptor {
        &self.descriptor
    }

    pub fn file_id(&self) -> FileId {
        self.descriptor.file_id()
    }

    pub fn state(&self) -> ActorState {
        ActorState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ActorState) {
        let previous = ActorState::from_u8(self.state.swap(state as u8, Ordering::AcqRel));
        if previous != state {
            log::trace!("Actor {}: {} -> {}", self.id, previous.name(), state.name());
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.load(Ordering::Acquire)
    }

    pub fn has_looped(&self) -> bool {
        self.has_looped.load(Ordering::Acquire)
    }

    pub fn runtime(&self) -> RuntimeFlags {
        *lock!(self.runtime)
    }

    pub fn set_runtime(&self, flags: RuntimeFlags) {
        *lock!(self.runtime) = flags;
    }

    pub(crate) fn set_watcher_count(&self, count: usize) {
        self.watchers.store(count, Ordering::Release);
    }

    pub(crate) fn ring(&self) -> Option<&Arc<FrameRing>> {
        self.ring.get()
    }

    pub(crate) fn handle(self: &Arc<Self>) -> PlaybackHandle {
        PlaybackHandle {
            actor: Arc::clone(self),
        }
    }

    pub(crate) fn status(&self, watchers: usize) -> ActorStatus {
        ActorStatus {
            file_id: self.file_id(),
            kind: self.descriptor.kind(),
            state: self.state().name().to_string(),
            watchers,
            frames_decoded: lock!(self.stats).frames_decoded(),
            has_looped: self.has_looped(),
        }
    }

    fn label(&self) -> String {
        format!("actor {} file {}", self.id, self.file_id())
    }

    fn is_play_once(&self) -> bool {
        self.descriptor.modifiers().play_once || self.runtime().loop_once
    }

    fn step_env(&self) -> StepEnv {
        let runtime = self.runtime();
        let policy = self.ctx.pacing_policy();
        StepEnv {
            effective_rate: policy.effective_frame_rate(
                self.descriptor.kind(),
                self.descriptor.modifiers().optimization,
            ),
            play_once: self.is_play_once(),
            still: self.descriptor.modifiers().still,
            decode_last_frame: runtime.decode_last_frame,
            align_to: lock!(self.align_to).take(),
        }
    }

    fn post(self: &Arc<Self>, message: fn(Arc<PlaybackActor>) -> WorkerMessage) -> bool {
        if self.worker.post(message(Arc::clone(self))) {
            true
        } else {
            log::warn!("Decoder worker for {} is gone", self.label());
            false
        }
    }

    // Coordinator side

    /// Begin acquisition, or go straight to decoding if the file is local.
    /// Starting twice is a caller error.
    pub(crate) fn start(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.started.swap(true, Ordering::AcqRel) {
            return Err(EngineError::InvalidState(format!(
                "{} already started",
                self.label()
            )));
        }

        match self.ctx.acquisition.resolve(&self.descriptor)? {
            Resolution::Local(path) => {
                self.begin_decoding(path);
                Ok(())
            }
            Resolution::Remote => {
                self.set_state(ActorState::Acquiring);
                log::debug!("{} waiting for download", self.label());
                self.ctx.acquisition.download(
                    self.file_id(),
                    AcquisitionEvents::new(self.ctx.coordinator_tx.clone()),
                );
                Ok(())
            }
        }
    }

    pub(crate) fn is_acquiring(&self) -> bool {
        self.state() == ActorState::Acquiring
    }

    pub(crate) fn on_local_file_ready(self: &Arc<Self>, path: PathBuf) {
        if self.is_cancelled() || self.state() != ActorState::Acquiring {
            return;
        }
        self.begin_decoding(path);
    }

    fn begin_decoding(self: &Arc<Self>, path: PathBuf) {
        *lock!(self.local_path) = Some(path);
        self.set_state(ActorState::Decoding);
        self.in_flight.store(true, Ordering::Release);
        if !self.post(WorkerMessage::StartDecoding) {
            self.in_flight.store(false, Ordering::Release);
        }
    }

    /// Idempotent. An in-flight decode finishes before the worker tears down.
    pub(crate) fn cancel(self: &Arc<Self>) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        log::debug!("Cancelling {}", self.label());
        if !self.post(WorkerMessage::Destroy) {
            self.set_state(ActorState::Destroyed);
        }
    }

    pub(crate) fn mark_loaded(&self) {
        self.loaded.store(true, Ordering::Release);
        self.set_state(ActorState::Playing);
    }

    /// Clear the play-once freeze
    pub(crate) fn resume(&self) {
        if self.loop_frozen.swap(false, Ordering::AcqRel) {
            log::debug!("Resuming {}", self.label());
        }
    }

    /// Honored only mid-loop: keeps the newest frame and restarts at zero
    pub(crate) fn request_seek_to_start(&self) -> bool {
        if !self.is_loaded() || self.is_cancelled() || self.descriptor.modifiers().still {
            return false;
        }
        let Some(ring) = self.ring.get() else {
            return false;
        };
        if self.loop_frozen.load(Ordering::Acquire) || ring.latest_frame_index().unwrap_or(0) == 0
        {
            return false;
        }
        ring.clear_busy();
        *lock!(self.next_due) = None;
        self.seek_pending.store(true, Ordering::Release);
        true
    }

    pub(crate) fn cache_built(&self) {
        self.cache_ready.store(true, Ordering::Release);
    }

    /// Decide whether to post the next decode. Coordinator thread only.
    pub(crate) fn request_next_frame(self: &Arc<Self>) -> NextFrame {
        if self.is_cancelled() || !self.is_loaded() || self.descriptor.modifiers().still {
            return NextFrame::Inactive;
        }

        let runtime = self.runtime();
        if self.ctx.freeze_count() > 0 && !runtime.ignore_global_freeze {
            self.set_state(ActorState::Frozen);
            return NextFrame::Frozen;
        }

        if self.loop_frozen.load(Ordering::Acquire) {
            self.set_state(ActorState::Awaiting);
            return NextFrame::AwaitingResume;
        }

        let mut align = None;
        if self.descriptor.modifiers().round_video {
            match self.ctx.round_video_state(self.file_id()) {
                RoundVideo::Aligned(position) => align = Some(position),
                RoundVideo::Conflict => {
                    self.set_state(ActorState::Frozen);
                    return NextFrame::Frozen;
                }
                RoundVideo::Idle => {}
            }
        }

        if self.watchers.load(Ordering::Acquire) == 0 {
            self.set_state(ActorState::Awaiting);
            return NextFrame::Awaiting;
        }

        if self.in_flight.load(Ordering::Acquire) {
            return NextFrame::InFlight;
        }

        let Some(ring) = self.ring.get() else {
            return NextFrame::Inactive;
        };
        let seek = self.seek_pending.load(Ordering::Acquire);
        if !seek && ring.free_count() == 0 {
            self.set_state(ActorState::Awaiting);
            return NextFrame::Awaiting;
        }

        if !seek {
            if let Some(due) = *lock!(self.next_due) {
                if Instant::now() < due {
                    return NextFrame::Deferred(due);
                }
            }
        }

        if self
            .in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return NextFrame::InFlight;
        }

        *lock!(self.align_to) = align;
        self.set_state(ActorState::Playing);
        let message = if seek {
            self.seek_pending.store(false, Ordering::Release);
            WorkerMessage::PrepareStartFrame
        } else {
            WorkerMessage::PrepareNextFrame
        };

        if self.post(message) {
            NextFrame::Scheduled
        } else {
            self.in_flight.store(false, Ordering::Release);
            NextFrame::Inactive
        }
    }

    // Worker side

    fn report(&self, outcome: StepOutcome) {
        self.in_flight.store(false, Ordering::Release);
        let _ = self.ctx.coordinator_tx.send(CoordinatorMessage::Decoded {
            actor_id: self.id,
            outcome,
        });
    }

    pub(crate) fn start_decoding(self: &Arc<Self>) {
        let outcome = match self.open_and_fill() {
            Ok(()) => StepOutcome::Loaded,
            Err(_) if self.is_cancelled() => StepOutcome::Cancelled,
            Err(e) => {
                log::warn!("Failed to open {}: {}", self.label(), e);
                StepOutcome::Failed(e)
            }
        };
        self.report(outcome);
    }

    fn open_and_fill(self: &Arc<Self>) -> Result<(), EngineError> {
        if self.is_cancelled() {
            return Err(EngineError::InvalidState("cancelled".to_string()));
        }
        let path = lock!(self.local_path)
            .clone()
            .ok_or_else(|| EngineError::InvalidState("no local file".to_string()))?;

        let open_start = Instant::now();
        let mut strategy = Strategy::open(
            self.ctx.backend.as_ref(),
            &self.descriptor,
            &path,
            self.resume_from,
        )?;

        if let Strategy::Vector(vector) = &mut strategy {
            if !self.descriptor.modifiers().still {
                self.prepare_vector_cache(vector, &path);
            }
        }

        let settings = &self.ctx.config.decoder;
        let (width, height) = strategy.dimensions();
        let env = self.step_env();
        let mut first = true;
        let mut interval = Duration::ZERO;
        let ring = FrameRing::init(
            settings.initial_filled,
            settings.ring_capacity,
            width,
            height,
            |buffer: &mut FrameBuffer| {
                interval = strategy.fill_initial(buffer, &env, first)?;
                first = false;
                Ok(())
            },
        )
        .map_err(|e| match e {
            EngineError::OutOfMemory(msg) => {
                EngineError::DecodeOpen(format!("out of memory: {}", msg))
            }
            other => other,
        })?;

        self.frame_rate
            .store(strategy.frame_rate(), Ordering::Release);
        *lock!(self.next_due) = Some(Instant::now() + interval);
        let _ = self.ring.set(Arc::new(ring));
        *lock!(self.decoder) = Some(strategy);
        lock!(self.stats).record_frame(open_start.elapsed());

        log::debug!(
            "{} loaded {}x{} in {:.1}ms",
            self.label(),
            width,
            height,
            open_start.elapsed().as_secs_f64() * 1000.0
        );
        Ok(())
    }

    fn prepare_vector_cache(&self, vector: &mut strategy::VectorStrategy, source: &std::path::Path) {
        let Some(cache) = self.ctx.disk_cache.as_ref() else {
            return;
        };
        let settings = &self.ctx.config.cache;
        if !settings.enabled {
            return;
        }

        let info = vector.info;
        let key = CacheKey::for_descriptor(&self.descriptor, info.width, info.height);
        let cache_file =
            match cache.get_or_build_cache_file(&key, settings.ttl(), settings.max_entries) {
                Ok(path) => path,
                Err(e) => {
                    log::warn!("No frame cache for {}: {}", self.label(), e);
                    return;
                }
            };

        match vector.source.validate_cache(&cache_file) {
            CacheValidation::AlreadyValid => {
                vector.cache = CacheUse::Building(cache_file);
                vector.attach_built_cache();
            }
            CacheValidation::NeedsBuild => {
                let estimate = info.frame_count as u64 * info.width as u64 * info.height as u64 * 4;
                if estimate <= settings.sync_build_limit_bytes {
                    let _writer = cache.begin_write(&cache_file);
                    match vector.source.build_cache(&cache_file, &self.cancelled) {
                        Ok(()) => {
                            vector.cache = CacheUse::Building(cache_file);
                            vector.attach_built_cache();
                        }
                        Err(e) => log::warn!(
                            "{}",
                            EngineError::CacheBuild(format!("{}: {}", self.label(), e))
                        ),
                    }
                } else {
                    let tx = self.ctx.coordinator_tx.clone();
                    let actor_id = self.id;
                    vector.cache = CacheUse::Building(cache_file.clone());
                    cache.build_async(BuildRequest {
                        backend: Arc::clone(&self.ctx.backend),
                        source: source.to_path_buf(),
                        size: self.descriptor.key().render_size,
                        variant: self.descriptor.key().color_variant,
                        cache_file,
                        cancel: Arc::clone(&self.ctx.shutting_down),
                        done: Box::new(move |result| {
                            let _ = tx.send(CoordinatorMessage::CacheReady { actor_id, result });
                        }),
                    });
                }
            }
            CacheValidation::Error(e) => {
                log::warn!("Frame cache for {} unusable: {}", self.label(), e);
            }
            CacheValidation::Canceled => {}
        }
    }

    pub(crate) fn prepare_next_frame(self: &Arc<Self>) {
        let outcome = self.decode_step(false);
        self.report(outcome);
    }

    pub(crate) fn prepare_start_frame(self: &Arc<Self>) {
        let outcome = self.decode_step(true);
        self.report(outcome);
    }

    fn decode_step(&self, rewind: bool) -> StepOutcome {
        if self.is_cancelled() {
            return StepOutcome::Cancelled;
        }
        let Some(ring) = self.ring.get() else {
            return StepOutcome::Failed(EngineError::InvalidState("no frame ring".to_string()));
        };
        let mut decoder = lock!(self.decoder);
        let Some(strategy) = decoder.as_mut() else {
            return StepOutcome::Cancelled;
        };

        if self.cache_ready.swap(false, Ordering::AcqRel) {
            if let Strategy::Vector(vector) = strategy {
                vector.attach_built_cache();
            }
        }

        if rewind {
            if let Err(e) = strategy.rewind() {
                *decoder = None;
                return StepOutcome::Failed(e);
            }
        }

        let Some(mut buffer) = ring.take_free() else {
            lock!(self.stats).record_skip();
            return StepOutcome::Skipped;
        };

        let env = self.step_env();
        let step_start = Instant::now();
        match strategy.step(&mut buffer, &env) {
            Ok(Step::Frame {
                index,
                interval,
                loop_boundary,
            }) => {
                buffer.set_frame_index(index);
                ring.add_busy(buffer);
                *lock!(self.next_due) = Some(step_start + interval);

                let mut stats = lock!(self.stats);
                stats.record_frame(step_start.elapsed());
                if loop_boundary {
                    stats.record_loop();
                    self.has_looped.store(true, Ordering::Release);
                }
                stats.maybe_log_stats(&self.label(), STATS_LOG_INTERVAL);
                log::trace!("{} decoded frame {}", self.label(), index);

                StepOutcome::Frame {
                    index,
                    loop_boundary,
                }
            }
            Ok(Step::LoopEnd) => {
                ring.add_free(buffer);
                lock!(self.stats).record_loop();
                self.has_looped.store(true, Ordering::Release);
                self.loop_frozen.store(true, Ordering::Release);
                log::debug!("{} finished its single play-through", self.label());
                StepOutcome::LoopFrozen
            }
            Err(e) => {
                ring.add_free(buffer);
                // Broken context is not reopened
                *decoder = None;
                log::error!("Decode failed for {}: {}", self.label(), e);
                StepOutcome::Failed(e)
            }
        }
    }

    pub(crate) fn destroy(&self) {
        let strategy = lock!(self.decoder).take();
        drop(strategy);
        self.set_state(ActorState::Destroyed);
        lock!(self.stats).log_summary(&self.label());
        log::debug!("{} destroyed", self.label());
    }
}

/// Render-side view of an actor's output
#[derive(Clone)]
pub struct PlaybackHandle {
    actor: Arc<PlaybackActor>,
}

impl std::fmt::Debug for PlaybackHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackHandle")
            .field("actor", &self.actor.id)
            .field("state", &self.actor.state())
            .finish()
    }
}

impl PlaybackHandle {
    pub fn actor_id(&self) -> ActorId {
        self.actor.id
    }

    pub fn kind(&self) -> ItemKind {
        self.actor.descriptor.kind()
    }

    pub fn state(&self) -> ActorState {
        self.actor.state()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        self.actor.ring().map_or((0, 0), |r| r.dimensions())
    }

    /// Intrinsic frame rate of vector items, zero otherwise
    pub fn frame_rate(&self) -> u32 {
        self.actor.frame_rate.load(Ordering::Acquire)
    }

    pub fn has_looped(&self) -> bool {
        self.actor.has_looped()
    }

    pub fn runtime(&self) -> RuntimeFlags {
        self.actor.runtime()
    }

    pub fn set_runtime(&self, flags: RuntimeFlags) {
        self.actor.set_runtime(flags);
    }

    /// Retire the oldest busy frame if a newer one is ready, and let the
    /// actor schedule another decode. Returns the retired frame index.
    pub fn apply_next(&self) -> Option<u32> {
        let retired = self.actor.ring()?.apply_next()?;
        let _ = self
            .actor
            .ctx
            .coordinator_tx
            .send(CoordinatorMessage::FrameConsumed {
                actor_id: self.actor.id,
            });
        Some(retired)
    }

    pub fn with_head<R>(&self, f: impl FnOnce(&FrameBuffer) -> R) -> Option<R> {
        self.actor.ring()?.with_head(f)
    }

    pub fn latest_frame_index(&self) -> Option<u32> {
        self.actor.ring()?.latest_frame_index()
    }

    pub fn ring_counts(&self) -> Option<RingCounts> {
        self.actor.ring().map(|r| r.counts())
    }

    /// Continue a play-once item past its loop boundary
    pub fn resume(&self) {
        let _ = self
            .actor
            .ctx
            .coordinator_tx
            .send(CoordinatorMessage::Resume {
                actor_id: self.actor.id,
            });
    }

    /// Best-effort restart from frame zero
    pub fn seek_to_start(&self) {
        let _ = self
            .actor
            .ctx
            .coordinator_tx
            .send(CoordinatorMessage::SeekToStart {
                actor_id: self.actor.id,
            });
    }
}
