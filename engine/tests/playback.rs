/// End-to-end playback tests
/// These drive a real engine (coordinator, decoder pools, frame rings and
/// surfaces) with in-memory decode backends and acquisition layers
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use common::{
    ActorStatus, ColorVariant, Descriptor, EngineError, FileId, ItemKind, Modifiers, RenderSize,
    RuntimeFlags, VibrationPattern,
};
use engine::acquisition::{Acquisition, AcquisitionEvents, Resolution};
use engine::decode::{
    CacheValidation, DecodeError, DecoderBackend, FrameSource, ReadOutcome, VectorInfo,
    VectorSource,
};
use engine::frame_ring::{FrameBuffer, RingCounts};
use engine::{
    Canvas, Engine, EngineConfig, Haptic, LocalFiles, PerformanceMode, PlaybackHandle,
    PresentOutcome, RenderSurface, RoundVideoPlayer, Watcher,
};

// ---------------------------------------------------------------------------
// Fakes
// ---------------------------------------------------------------------------

#[derive(Default)]
struct Counters {
    opens: AtomicUsize,
    reads: AtomicUsize,
    builds: AtomicUsize,
    attaches: AtomicUsize,
    rendered: Mutex<Vec<u32>>,
}

#[derive(Clone)]
struct FakeBackend {
    counters: Arc<Counters>,
    stream_frames: u32,
    frame_duration: Duration,
    fail_open: bool,
    fail_read_at: Option<u32>,
    vector: VectorInfo,
    validation: CacheValidation,
}

impl FakeBackend {
    fn stream(frames: u32) -> Self {
        Self {
            counters: Arc::new(Counters::default()),
            stream_frames: frames,
            frame_duration: Duration::from_millis(10),
            fail_open: false,
            fail_read_at: None,
            vector: VectorInfo {
                width: 4,
                height: 4,
                frame_count: 10,
                frame_rate: 60,
            },
            validation: CacheValidation::NeedsBuild,
        }
    }

    fn vector(frame_count: u32, frame_rate: u32) -> Self {
        let mut backend = Self::stream(0);
        backend.vector = VectorInfo {
            width: 4,
            height: 4,
            frame_count,
            frame_rate,
        };
        backend
    }

    fn reads(&self) -> usize {
        self.counters.reads.load(Ordering::SeqCst)
    }

    fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }

    fn rendered(&self) -> Vec<u32> {
        self.counters.rendered.lock().unwrap().clone()
    }
}

fn fill(buffer: &mut FrameBuffer, index: u32) {
    buffer.pixels_mut().fill(index as u8);
}

struct FakeStream {
    counters: Arc<Counters>,
    frames: u32,
    duration: Duration,
    fail_at: Option<u32>,
    cursor: u32,
}

impl FrameSource for FakeStream {
    fn dimensions(&self) -> (u32, u32) {
        (4, 4)
    }

    fn read_next_frame(&mut self, buffer: &mut FrameBuffer) -> Result<ReadOutcome, DecodeError> {
        if self.fail_at == Some(self.cursor) {
            return Err(DecodeError::Broken(format!("frame {}", self.cursor)));
        }
        if self.cursor >= self.frames {
            return Ok(ReadOutcome::EndOfStream);
        }
        self.counters.reads.fetch_add(1, Ordering::SeqCst);
        let index = self.cursor;
        fill(buffer, index);
        self.cursor += 1;
        Ok(ReadOutcome::Frame {
            index,
            duration: self.duration,
        })
    }

    fn seek_to_start(&mut self) -> Result<(), DecodeError> {
        self.cursor = 0;
        Ok(())
    }

    fn seek_to_time(&mut self, position: Duration) -> Result<(), DecodeError> {
        let step = self.duration.as_millis().max(1);
        self.cursor = ((position.as_millis() / step) as u32) % self.frames.max(1);
        Ok(())
    }
}

struct FakeVector {
    counters: Arc<Counters>,
    info: VectorInfo,
    validation: CacheValidation,
}

impl VectorSource for FakeVector {
    fn info(&self) -> VectorInfo {
        self.info
    }

    fn render_frame_at_index(
        &mut self,
        index: u32,
        buffer: &mut FrameBuffer,
    ) -> Result<(), DecodeError> {
        self.counters.rendered.lock().unwrap().push(index);
        fill(buffer, index);
        Ok(())
    }

    fn validate_cache(&mut self, _cache_file: &Path) -> CacheValidation {
        self.validation.clone()
    }

    fn build_cache(&mut self, cache_file: &Path, _cancel: &AtomicBool) -> Result<(), DecodeError> {
        self.counters.builds.fetch_add(1, Ordering::SeqCst);
        std::fs::write(cache_file, b"frames")?;
        Ok(())
    }

    fn attach_cache(&mut self, _cache_file: &Path) -> Result<(), DecodeError> {
        self.counters.attaches.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

impl DecoderBackend for FakeBackend {
    fn open_stream(&self, _path: &Path, _kind: ItemKind) -> Result<Box<dyn FrameSource>, DecodeError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(DecodeError::Open("corrupt header".to_string()));
        }
        Ok(Box::new(FakeStream {
            counters: Arc::clone(&self.counters),
            frames: self.stream_frames,
            duration: self.frame_duration,
            fail_at: self.fail_read_at,
            cursor: 0,
        }))
    }

    fn open_vector(
        &self,
        _path: &Path,
        _size: RenderSize,
        _variant: ColorVariant,
    ) -> Result<Box<dyn VectorSource>, DecodeError> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(DecodeError::Open("corrupt header".to_string()));
        }
        Ok(Box::new(FakeVector {
            counters: Arc::clone(&self.counters),
            info: self.vector,
            validation: self.validation.clone(),
        }))
    }
}

/// Remote files whose download the test drives by hand
struct ManualAcquisition {
    path: PathBuf,
    events: Mutex<Option<AcquisitionEvents>>,
    downloads: AtomicUsize,
    cancels: AtomicUsize,
}

impl ManualAcquisition {
    fn new(path: PathBuf) -> Arc<Self> {
        Arc::new(Self {
            path,
            events: Mutex::new(None),
            downloads: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
        })
    }

    fn events(&self) -> AcquisitionEvents {
        assert!(wait_until(|| self.events.lock().unwrap().is_some()));
        self.events.lock().unwrap().clone().unwrap()
    }

    fn progress(&self, file_id: FileId, fraction: f32) {
        self.events().progress(file_id, fraction);
    }

    fn ready(&self, file_id: FileId) {
        self.events().local_file_ready(file_id, self.path.clone());
    }

    fn fail(&self, file_id: FileId) {
        self.events().failed(file_id, "connection reset");
    }
}

impl Acquisition for ManualAcquisition {
    fn resolve(&self, _descriptor: &Descriptor) -> Result<Resolution, EngineError> {
        Ok(Resolution::Remote)
    }

    fn download(&self, _file_id: FileId, events: AcquisitionEvents) {
        self.downloads.fetch_add(1, Ordering::SeqCst);
        *self.events.lock().unwrap() = Some(events);
    }

    fn cancel_download(&self, _file_id: FileId) {
        self.cancels.fetch_add(1, Ordering::SeqCst);
    }
}

/// External round-video player the test moves between files
#[derive(Default)]
struct FakePlayer {
    file: Mutex<Option<FileId>>,
    position: Mutex<Duration>,
}

impl FakePlayer {
    fn play(&self, file_id: Option<FileId>, position: Duration) {
        *self.file.lock().unwrap() = file_id;
        *self.position.lock().unwrap() = position;
    }
}

impl RoundVideoPlayer for FakePlayer {
    fn playing_file(&self) -> Option<FileId> {
        *self.file.lock().unwrap()
    }

    fn position(&self) -> Duration {
        *self.position.lock().unwrap()
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    Progress(f32),
    Loaded,
    Frame(u32),
    LoopBoundary,
    Failed(EngineError),
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
    handle: Mutex<Option<PlaybackHandle>>,
}

impl Recorder {
    fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    fn handle(&self) -> Option<PlaybackHandle> {
        self.handle.lock().unwrap().clone()
    }

    fn frames(&self) -> Vec<u32> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Event::Frame(i) => Some(i),
                _ => None,
            })
            .collect()
    }

    fn failure(&self) -> Option<EngineError> {
        self.events().into_iter().find_map(|e| match e {
            Event::Failed(err) => Some(err),
            _ => None,
        })
    }
}

impl Watcher for Recorder {
    fn on_progress(&self, fraction: f32) {
        self.events.lock().unwrap().push(Event::Progress(fraction));
    }

    fn on_loaded(&self, handle: PlaybackHandle) {
        *self.handle.lock().unwrap() = Some(handle);
        self.events.lock().unwrap().push(Event::Loaded);
    }

    fn on_frame_ready(&self, frame_index: u32) {
        self.events.lock().unwrap().push(Event::Frame(frame_index));
    }

    fn on_loop_boundary(&self) {
        self.events.lock().unwrap().push(Event::LoopBoundary);
    }

    fn on_failed(&self, error: &EngineError) {
        self.events
            .lock()
            .unwrap()
            .push(Event::Failed(error.clone()));
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

const DEADLINE: Duration = Duration::from_secs(5);

fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

fn present_until(
    surface: &mut RenderSurface,
    canvas: &mut Canvas,
    mut condition: impl FnMut(&RenderSurface) -> bool,
) -> bool {
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline {
        surface.present(canvas);
        if condition(surface) {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    false
}

fn present_for(surface: &mut RenderSurface, canvas: &mut Canvas, duration: Duration) {
    let end = Instant::now() + duration;
    while Instant::now() < end {
        surface.present(canvas);
        thread::sleep(Duration::from_millis(5));
    }
}

fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.decoder.general_threads = 2;
    config.decoder.compact_threads = 1;
    config.decoder.vector_threads = 1;
    config.cache.enabled = false;
    config
}

/// Local acquisition with an on-disk placeholder for each id
fn local_files(dir: &tempfile::TempDir, ids: &[FileId]) -> Arc<LocalFiles> {
    let files = Arc::new(LocalFiles::new());
    for id in ids {
        let path = dir.path().join(format!("{}.bin", id));
        std::fs::write(&path, b"x").unwrap();
        files.register(*id, path);
    }
    files
}

fn start(backend: &FakeBackend, acquisition: Arc<dyn Acquisition>) -> Engine {
    Engine::start_with_cache(test_config(), Arc::new(backend.clone()), acquisition, None).unwrap()
}

fn actors(engine: &Engine) -> Vec<ActorStatus> {
    engine.status().unwrap().actors
}

fn raster(file_id: FileId) -> Descriptor {
    Descriptor::new(1, file_id, format!("{}.gif", file_id), ItemKind::RasterLoop)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[test]
fn test_ring_fills_then_waits_for_consumer() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(100);
    let engine = start(&backend, local_files(&dir, &[1]));

    let recorder = Arc::new(Recorder::default());
    let _registration = engine.watch(raster(1), recorder.clone());

    assert!(wait_until(|| recorder.handle().is_some()));
    let handle = recorder.handle().unwrap();
    assert_eq!(handle.dimensions(), (4, 4));

    let full = RingCounts {
        free: 0,
        busy: 3,
        in_flight: 0,
    };
    assert!(wait_until(|| handle.ring_counts() == Some(full)));

    // Nothing consumes, so nothing more is decoded
    let reads = backend.reads();
    thread::sleep(Duration::from_millis(150));
    assert_eq!(backend.reads(), reads);
    assert_eq!(handle.ring_counts(), Some(full));

    // Retiring the oldest frame frees one buffer and triggers one decode
    assert_eq!(handle.apply_next(), Some(0));
    assert!(wait_until(|| backend.reads() == reads + 1));
    assert!(wait_until(|| handle.ring_counts() == Some(full)));
    assert_eq!(handle.latest_frame_index(), Some(3));
}

#[test]
fn test_join_does_not_duplicate_decoders() {
    let dir = tempfile::tempdir().unwrap();
    let source = dir.path().join("remote.bin");
    std::fs::write(&source, b"x").unwrap();

    let backend = FakeBackend::stream(100);
    let acquisition = ManualAcquisition::new(source);
    let engine = start(&backend, acquisition.clone());

    let first = Arc::new(Recorder::default());
    let second = Arc::new(Recorder::default());
    let _a = engine.watch(raster(5), first.clone());

    acquisition.progress(5, 0.25);
    assert!(wait_until(|| first.events().contains(&Event::Progress(0.25))));

    // A late joiner sees the cached progress without waiting for the next update
    let _b = engine.watch(raster(5), second.clone());
    assert!(wait_until(|| second.events().contains(&Event::Progress(0.25))));

    acquisition.ready(5);
    assert!(wait_until(|| first.handle().is_some() && second.handle().is_some()));

    assert_eq!(backend.opens(), 1);
    assert_eq!(acquisition.downloads.load(Ordering::SeqCst), 1);
    assert_eq!(
        first.handle().unwrap().actor_id(),
        second.handle().unwrap().actor_id()
    );

    let statuses = actors(&engine);
    assert_eq!(statuses.len(), 1);
    assert_eq!(statuses[0].watchers, 2);
}

#[test]
fn test_join_delivers_latest_frame_immediately() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(100);
    let engine = start(&backend, local_files(&dir, &[1]));

    let first = Arc::new(Recorder::default());
    let _a = engine.watch(raster(1), first.clone());
    assert!(wait_until(|| !first.frames().is_empty()));

    let late = Arc::new(Recorder::default());
    let _b = engine.watch(raster(1), late.clone());
    assert!(wait_until(|| late.events().len() >= 2));
    let events = late.events();
    assert_eq!(events[0], Event::Loaded);
    assert!(matches!(events.get(1), Some(Event::Frame(_))));
    assert_eq!(backend.opens(), 1);
}

#[test]
fn test_detaching_last_surface_removes_actor() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(100);
    let engine = start(&backend, local_files(&dir, &[1]));

    let mut one = engine.surface();
    let mut two = engine.surface();
    let mut canvas = Canvas::new(8, 8);
    one.request_file(raster(1));
    two.request_file(raster(1));

    assert!(present_until(&mut one, &mut canvas, |s| s.last_frame().is_some()));
    assert!(present_until(&mut two, &mut canvas, |s| s.last_frame().is_some()));
    assert!(wait_until(|| actors(&engine).first().map(|a| a.watchers) == Some(2)));

    one.detach();
    assert!(wait_until(|| actors(&engine).first().map(|a| a.watchers) == Some(1)));
    assert!(!one.is_attached());
    assert!(one.descriptor().is_some());

    two.detach();
    assert!(wait_until(|| actors(&engine).is_empty()));
    assert_eq!(backend.opens(), 1);

    // Re-attaching starts a fresh actor for the kept descriptor
    one.attach();
    assert!(present_until(&mut one, &mut canvas, |s| s.is_loaded()));
    assert_eq!(backend.opens(), 2);
}

#[test]
fn test_request_file_with_new_identity_switches_actor() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(100);
    let engine = start(&backend, local_files(&dir, &[1, 2]));

    let mut surface = engine.surface();
    let mut canvas = Canvas::new(4, 4);
    surface.request_file(raster(1));
    assert!(present_until(&mut surface, &mut canvas, |s| s.is_loaded()));

    // Same identity, new runtime flags: no new actor
    surface.request_file(raster(1).with_runtime(RuntimeFlags {
        loop_once: true,
        ..Default::default()
    }));
    assert_eq!(backend.opens(), 1);
    assert!(surface.handle().unwrap().runtime().loop_once);

    surface.request_file(raster(2));
    assert!(!surface.is_loaded());
    assert!(present_until(&mut surface, &mut canvas, |s| s.is_loaded()));
    assert!(wait_until(|| {
        let a = actors(&engine);
        a.len() == 1 && a[0].file_id == 2
    }));
    assert_eq!(backend.opens(), 2);
}

#[test]
fn test_play_once_vector_freezes_at_loop_boundary() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::vector(10, 60);
    let mut config = test_config();
    // Effective 30fps against an intrinsic 60fps: every other frame
    config.playback.display_refresh_rate = 30;
    let engine = Engine::start_with_cache(
        config,
        Arc::new(backend.clone()),
        local_files(&dir, &[9]),
        None,
    )
    .unwrap();

    let descriptor = Descriptor::new(1, 9, "sticker.tgs", ItemKind::VectorAnimation).with_modifiers(
        Modifiers {
            play_once: true,
            ..Default::default()
        },
    );
    let mut surface = engine.surface();
    let mut canvas = Canvas::new(4, 4);
    surface.request_file(descriptor);

    assert!(present_until(&mut surface, &mut canvas, |s| s.has_looped()));
    assert!(present_until(&mut surface, &mut canvas, |s| s.last_frame() == Some(8)));

    // Delivery stays on the last rendered frame until resumed
    present_for(&mut surface, &mut canvas, Duration::from_millis(200));
    assert_eq!(backend.rendered(), vec![0, 2, 4, 6, 8]);
    assert_eq!(surface.last_frame(), Some(8));
    assert!(surface.has_looped());
    assert!(surface.loop_count() >= 1);
    assert_eq!(canvas.pixel(0, 0), [8, 8, 8, 8]);

    surface.resume();
    assert!(present_until(&mut surface, &mut canvas, |_| backend.rendered().len() > 5));
    assert_eq!(backend.rendered()[5], 0);
    assert!(surface.has_looped());
}

#[test]
fn test_looping_vector_wraps_and_reports_boundaries() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::vector(3, 60);
    let engine = start(&backend, local_files(&dir, &[4]));

    let recorder = Arc::new(Recorder::default());
    let _registration = engine.watch(
        Descriptor::new(1, 4, "loop.tgs", ItemKind::VectorAnimation),
        recorder.clone(),
    );
    assert!(wait_until(|| recorder.handle().is_some()));
    let handle = recorder.handle().unwrap();
    assert_eq!(handle.frame_rate(), 60);

    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline && !recorder.events().contains(&Event::LoopBoundary) {
        handle.apply_next();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(recorder.events().contains(&Event::LoopBoundary));
    assert_eq!(&backend.rendered()[..4], &[0, 1, 2, 0]);
    assert!(handle.has_looped());
}

#[test]
fn test_open_failure_notifies_and_removes_entry() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = FakeBackend::stream(10);
    backend.fail_open = true;
    let engine = start(&backend, local_files(&dir, &[1]));

    let recorder = Arc::new(Recorder::default());
    let _registration = engine.watch(raster(1), recorder.clone());

    assert!(wait_until(|| recorder.failure().is_some()));
    assert!(matches!(
        recorder.failure(),
        Some(EngineError::DecodeOpen(_))
    ));
    assert!(recorder.handle().is_none());
    assert!(wait_until(|| actors(&engine).is_empty()));
}

#[test]
fn test_step_failure_tears_down_without_retry() {
    let dir = tempfile::tempdir().unwrap();
    let mut backend = FakeBackend::stream(10);
    backend.fail_read_at = Some(2);
    let engine = start(&backend, local_files(&dir, &[1]));

    let mut surface = engine.surface();
    let mut canvas = Canvas::new(4, 4);
    surface.request_file(raster(1));

    assert!(present_until(&mut surface, &mut canvas, |s| s.failure().is_some()));
    assert!(matches!(surface.failure(), Some(EngineError::DecodeStep(_))));
    assert_eq!(surface.present(&mut canvas), PresentOutcome::Failed);
    assert!(wait_until(|| actors(&engine).is_empty()));
    assert_eq!(backend.opens(), 1);
}

#[test]
fn test_unregistered_file_fails_at_start() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(10);
    let engine = start(&backend, local_files(&dir, &[]));

    let recorder = Arc::new(Recorder::default());
    let _registration = engine.watch(raster(77), recorder.clone());
    assert!(wait_until(|| recorder.failure().is_some()));
    assert!(matches!(recorder.failure(), Some(EngineError::NotFound(_))));
    assert_eq!(backend.opens(), 0);
}

#[test]
fn test_acquisition_failure_reaches_every_watcher() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(10);
    let acquisition = ManualAcquisition::new(dir.path().join("never"));
    let engine = start(&backend, acquisition.clone());

    let a = Arc::new(Recorder::default());
    let b = Arc::new(Recorder::default());
    let _ra = engine.watch(raster(3), a.clone());
    let _rb = engine.watch(raster(3), b.clone());
    assert!(wait_until(|| actors(&engine).first().map(|s| s.watchers) == Some(2)));

    acquisition.fail(3);
    assert!(wait_until(|| a.failure().is_some() && b.failure().is_some()));
    assert!(matches!(a.failure(), Some(EngineError::Acquisition(_))));
    assert!(wait_until(|| actors(&engine).is_empty()));
    assert_eq!(backend.opens(), 0);
}

#[test]
fn test_leaving_during_download_cancels_it() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(10);
    let acquisition = ManualAcquisition::new(dir.path().join("never"));
    let engine = start(&backend, acquisition.clone());

    let recorder = Arc::new(Recorder::default());
    let registration = engine.watch(raster(3), recorder.clone());
    assert!(wait_until(|| acquisition.downloads.load(Ordering::SeqCst) == 1));

    drop(registration);
    assert!(wait_until(|| acquisition.cancels.load(Ordering::SeqCst) == 1));
    assert!(wait_until(|| actors(&engine).is_empty()));
}

#[test]
fn test_global_freeze_pauses_all_but_whitelisted() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(1000);
    let engine = start(&backend, local_files(&dir, &[1, 2]));

    let guard = engine.freeze();
    assert_eq!(engine.freeze_count(), 1);

    let mut normal = engine.surface();
    let mut whitelisted = engine.surface();
    let mut canvas = Canvas::new(4, 4);
    normal.request_file(raster(1));
    whitelisted.request_file(raster(2).with_runtime(RuntimeFlags {
        ignore_global_freeze: true,
        ..Default::default()
    }));

    assert!(present_until(&mut whitelisted, &mut canvas, |s| {
        s.last_frame().unwrap_or(0) >= 3
    }));
    present_for(&mut normal, &mut canvas, Duration::from_millis(200));
    assert_eq!(normal.last_frame(), Some(0));

    drop(guard);
    assert_eq!(engine.freeze_count(), 0);
    assert!(present_until(&mut normal, &mut canvas, |s| {
        s.last_frame().unwrap_or(0) >= 2
    }));
}

#[test]
fn test_freeze_holds_until_last_guard() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(1000);
    let engine = start(&backend, local_files(&dir, &[1]));

    let mut surface = engine.surface();
    let mut canvas = Canvas::new(4, 4);
    surface.request_file(raster(1));
    assert!(present_until(&mut surface, &mut canvas, |s| {
        s.last_frame().unwrap_or(0) >= 2
    }));

    let first = engine.freeze();
    let second = engine.freeze();
    present_for(&mut surface, &mut canvas, Duration::from_millis(100));
    let reads = backend.reads();
    present_for(&mut surface, &mut canvas, Duration::from_millis(200));
    assert_eq!(backend.reads(), reads);

    drop(first);
    present_for(&mut surface, &mut canvas, Duration::from_millis(150));
    assert_eq!(backend.reads(), reads);

    drop(second);
    assert!(present_until(&mut surface, &mut canvas, |_| backend.reads() > reads));
}

#[test]
fn test_seek_to_start_restarts_mid_loop() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(1000);
    let engine = start(&backend, local_files(&dir, &[1]));

    let recorder = Arc::new(Recorder::default());
    let _registration = engine.watch(raster(1), recorder.clone());
    assert!(wait_until(|| recorder.handle().is_some()));
    let handle = recorder.handle().unwrap();

    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline && handle.latest_frame_index().unwrap_or(0) < 4 {
        handle.apply_next();
        thread::sleep(Duration::from_millis(5));
    }
    let before = recorder.frames().len();

    handle.seek_to_start();
    let deadline = Instant::now() + DEADLINE;
    while Instant::now() < deadline && !recorder.frames()[before..].contains(&0) {
        handle.apply_next();
        thread::sleep(Duration::from_millis(5));
    }
    assert!(recorder.frames()[before..].contains(&0));
}

#[test]
fn test_vector_cache_built_synchronously_and_attached() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::vector(10, 60);

    let mut config = test_config();
    config.cache.enabled = true;
    config.cache.directory = Some(cache_dir.path().to_string_lossy().to_string());
    let engine =
        Engine::start(config, Arc::new(backend.clone()), local_files(&dir, &[6])).unwrap();

    let recorder = Arc::new(Recorder::default());
    let _registration = engine.watch(
        Descriptor::new(1, 6, "cached.tgs", ItemKind::VectorAnimation),
        recorder.clone(),
    );
    assert!(wait_until(|| recorder.handle().is_some()));

    assert_eq!(backend.counters.builds.load(Ordering::SeqCst), 1);
    assert_eq!(backend.counters.attaches.load(Ordering::SeqCst), 1);
    let cache = engine.disk_cache().unwrap();
    assert_eq!(cache.entry_count(), 1);

    let status = engine.status().unwrap();
    assert!(status.cache.enabled);
    assert_eq!(status.cache.entries, 1);
}

#[test]
fn test_large_vector_cache_builds_in_background() {
    let dir = tempfile::tempdir().unwrap();
    let cache_dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::vector(10, 60);

    let mut config = test_config();
    config.cache.enabled = true;
    config.cache.directory = Some(cache_dir.path().to_string_lossy().to_string());
    config.cache.sync_build_limit_bytes = 0;
    let engine =
        Engine::start(config, Arc::new(backend.clone()), local_files(&dir, &[6])).unwrap();

    let mut surface = engine.surface();
    let mut canvas = Canvas::new(4, 4);
    surface.request_file(Descriptor::new(1, 6, "big.tgs", ItemKind::VectorAnimation));

    // Frames keep coming from the live context while the build runs
    assert!(present_until(&mut surface, &mut canvas, |_| {
        backend.counters.attaches.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(backend.counters.builds.load(Ordering::SeqCst), 1);
    assert!(surface.last_frame().is_some());
}

#[test]
fn test_performance_mode_and_status() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(10);
    let engine = start(&backend, local_files(&dir, &[]));

    assert_eq!(engine.performance_mode(), PerformanceMode::Balanced);
    engine.set_performance_mode(PerformanceMode::PowerSave);
    let status = engine.status().unwrap();
    assert_eq!(status.performance_mode, "powersave");
    assert!(status.actors.is_empty());
    assert!(!status.cache.enabled);
}

#[test]
fn test_shutdown_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(100);
    let engine = start(&backend, local_files(&dir, &[1]));

    let recorder = Arc::new(Recorder::default());
    let _registration = engine.watch(raster(1), recorder.clone());
    assert!(wait_until(|| recorder.handle().is_some()));

    engine.shutdown();
    engine.shutdown();
    assert!(engine.status().is_err());
}

#[test]
fn test_play_once_raster_resumes_from_start() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(3);
    let engine = start(&backend, local_files(&dir, &[1]));

    let mut surface = engine.surface();
    let mut canvas = Canvas::new(4, 4);
    surface.request_file(raster(1).with_modifiers(Modifiers {
        play_once: true,
        ..Default::default()
    }));

    assert!(present_until(&mut surface, &mut canvas, |s| s.has_looped()));
    assert!(present_until(&mut surface, &mut canvas, |s| s.last_frame() == Some(2)));
    present_for(&mut surface, &mut canvas, Duration::from_millis(150));
    assert_eq!(backend.reads(), 3);
    assert_eq!(surface.last_frame(), Some(2));

    surface.resume();
    assert!(present_until(&mut surface, &mut canvas, |s| s.last_frame() == Some(0)));
    assert!(backend.reads() > 3);
}

#[test]
fn test_reattach_resumes_raster_where_it_left_off() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(100);
    let engine = start(&backend, local_files(&dir, &[1]));

    let mut surface = engine.surface();
    let mut canvas = Canvas::new(4, 4);
    surface.request_file(raster(1));
    assert!(present_until(&mut surface, &mut canvas, |s| {
        s.last_frame().unwrap_or(0) >= 10
    }));
    let left_at = surface.last_frame().unwrap();

    surface.detach();
    assert!(wait_until(|| actors(&engine).is_empty()));

    surface.attach();
    let deadline = Instant::now() + DEADLINE;
    let mut first = None;
    while Instant::now() < deadline && first.is_none() {
        if let PresentOutcome::Presented { frame_index } = surface.present(&mut canvas) {
            first = Some(frame_index);
        }
        thread::sleep(Duration::from_millis(5));
    }
    assert!(first.unwrap() >= left_at);
    assert_eq!(backend.opens(), 2);
}

#[test]
fn test_round_video_aligns_and_yields_to_player() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::stream(1000);
    let engine = start(&backend, local_files(&dir, &[1, 2]));

    let player = Arc::new(FakePlayer::default());
    // 10ms frames: 500ms is frame 50
    player.play(Some(1), Duration::from_millis(500));
    engine.set_round_video_player(Some(player.clone()));

    let round = |file_id: FileId| {
        Descriptor::new(1, file_id, format!("{}.mp4", file_id), ItemKind::VideoLoop)
            .with_modifiers(Modifiers {
                round_video: true,
                ..Default::default()
            })
    };
    let mut playing = engine.surface();
    let mut other = engine.surface();
    let mut canvas = Canvas::new(4, 4);
    playing.request_file(round(1));
    other.request_file(round(2));

    assert!(present_until(&mut playing, &mut canvas, |s| s.last_frame() == Some(50)));

    // The exclusive player holds every other round item on its first frame
    assert!(present_until(&mut other, &mut canvas, |s| s.last_frame() == Some(0)));
    present_for(&mut other, &mut canvas, Duration::from_millis(200));
    assert_eq!(other.last_frame(), Some(0));

    player.play(None, Duration::ZERO);
    engine.notify_player_changed();
    assert!(present_until(&mut other, &mut canvas, |s| {
        s.last_frame().unwrap_or(0) >= 2
    }));
}

#[test]
fn test_vibration_fires_as_frames_retire() {
    let dir = tempfile::tempdir().unwrap();
    let backend = FakeBackend::vector(60, 60);
    let engine = start(&backend, local_files(&dir, &[8]));

    let haptics = Arc::new(Mutex::new(Vec::new()));
    let mut surface = engine.surface();
    let sink = haptics.clone();
    surface.on_haptic(move |h| sink.lock().unwrap().push(h));
    surface.request_file(
        Descriptor::new(1, 8, "heart.tgs", ItemKind::VectorAnimation).with_runtime(RuntimeFlags {
            vibration: Some(VibrationPattern::Heartbeat),
            ..Default::default()
        }),
    );

    let mut canvas = Canvas::new(4, 4);
    assert!(present_until(&mut surface, &mut canvas, |_| {
        haptics.lock().unwrap().contains(&Haptic::Simple)
    }));
    let fired = haptics.lock().unwrap().clone();
    assert_eq!(fired[0], Haptic::Strong);
    assert_eq!(fired.iter().filter(|h| **h == Haptic::Strong).count(), 1);
}
