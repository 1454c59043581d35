//! The coordinator thread.
//!
//! Owns the registry of actors keyed by [`DescriptorKey`] and every watcher
//! subscription. All scheduling decisions, joins and teardowns run here, so
//! the registry needs no locking. Workers, the acquisition layer and render
//! surfaces talk to it through [`CoordinatorMessage`].

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use common::{ActorStatus, Descriptor, DescriptorKey, EngineError, FileId};

use crate::actor::{ActorId, NextFrame, PlaybackActor, PlaybackHandle, StepOutcome};
use crate::context::EngineContext;

pub type WatcherId = u64;

/// Receives playback events for one descriptor.
///
/// Callbacks run on the coordinator thread and must not block.
pub trait Watcher: Send + Sync {
    /// Download progress in `0.0..=1.0`
    fn on_progress(&self, _fraction: f32) {}

    /// The decoder is open and `handle` has at least one frame
    fn on_loaded(&self, handle: PlaybackHandle);

    fn on_frame_ready(&self, frame_index: u32);

    fn on_loop_boundary(&self) {}

    /// Terminal. The registration is dead after this.
    fn on_failed(&self, error: &EngineError);
}

pub(crate) enum CoordinatorMessage {
    RequestFile {
        descriptor: Descriptor,
        watcher_id: WatcherId,
        watcher: Arc<dyn Watcher>,
        resume_from: Option<u32>,
    },
    RemoveWatcher {
        watcher_id: WatcherId,
    },
    FrameConsumed {
        actor_id: ActorId,
    },
    Progress {
        file_id: FileId,
        fraction: f32,
    },
    LocalFileReady {
        file_id: FileId,
        path: PathBuf,
    },
    AcquisitionFailed {
        file_id: FileId,
        error: EngineError,
    },
    Decoded {
        actor_id: ActorId,
        outcome: StepOutcome,
    },
    CacheReady {
        actor_id: ActorId,
        result: Result<(), EngineError>,
    },
    /// Freeze released or pacing changed; reschedule everything
    Unfrozen,
    Resume {
        actor_id: ActorId,
    },
    SeekToStart {
        actor_id: ActorId,
    },
    Query {
        reply: Sender<Vec<ActorStatus>>,
    },
    Shutdown {
        done: Sender<()>,
    },
}

impl fmt::Debug for CoordinatorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RequestFile {
                descriptor,
                watcher_id,
                resume_from,
                ..
            } => f
                .debug_struct("RequestFile")
                .field("file_id", &descriptor.file_id())
                .field("watcher_id", watcher_id)
                .field("resume_from", resume_from)
                .finish(),
            Self::RemoveWatcher { watcher_id } => f
                .debug_struct("RemoveWatcher")
                .field("watcher_id", watcher_id)
                .finish(),
            Self::FrameConsumed { actor_id } => f
                .debug_struct("FrameConsumed")
                .field("actor_id", actor_id)
                .finish(),
            Self::Progress { file_id, fraction } => f
                .debug_struct("Progress")
                .field("file_id", file_id)
                .field("fraction", fraction)
                .finish(),
            Self::LocalFileReady { file_id, path } => f
                .debug_struct("LocalFileReady")
                .field("file_id", file_id)
                .field("path", path)
                .finish(),
            Self::AcquisitionFailed { file_id, error } => f
                .debug_struct("AcquisitionFailed")
                .field("file_id", file_id)
                .field("error", error)
                .finish(),
            Self::Decoded { actor_id, outcome } => f
                .debug_struct("Decoded")
                .field("actor_id", actor_id)
                .field("outcome", outcome)
                .finish(),
            Self::CacheReady { actor_id, result } => f
                .debug_struct("CacheReady")
                .field("actor_id", actor_id)
                .field("result", result)
                .finish(),
            Self::Unfrozen => f.write_str("Unfrozen"),
            Self::Resume { actor_id } => {
                f.debug_struct("Resume").field("actor_id", actor_id).finish()
            }
            Self::SeekToStart { actor_id } => f
                .debug_struct("SeekToStart")
                .field("actor_id", actor_id)
                .finish(),
            Self::Query { .. } => f.write_str("Query"),
            Self::Shutdown { .. } => f.write_str("Shutdown"),
        }
    }
}

/// Keeps a watcher subscribed. Dropping it detaches the watcher.
#[derive(Debug)]
pub struct WatchRegistration {
    watcher_id: WatcherId,
    tx: Sender<CoordinatorMessage>,
}

impl WatchRegistration {
    pub(crate) fn new(watcher_id: WatcherId, tx: Sender<CoordinatorMessage>) -> Self {
        Self { watcher_id, tx }
    }

    pub fn watcher_id(&self) -> WatcherId {
        self.watcher_id
    }
}

impl Drop for WatchRegistration {
    fn drop(&mut self) {
        let _ = self.tx.send(CoordinatorMessage::RemoveWatcher {
            watcher_id: self.watcher_id,
        });
    }
}

struct Entry {
    actor: Arc<PlaybackActor>,
    watchers: HashMap<WatcherId, Arc<dyn Watcher>>,
    last_progress: Option<f32>,
}

impl Entry {
    fn fan_out(&self, f: impl Fn(&dyn Watcher)) {
        for watcher in self.watchers.values() {
            if self.actor.is_cancelled() {
                return;
            }
            f(watcher.as_ref());
        }
    }
}

pub(crate) struct Coordinator {
    ctx: Arc<EngineContext>,
    rx: Receiver<CoordinatorMessage>,
    entries: HashMap<DescriptorKey, Entry>,
    by_actor: HashMap<ActorId, DescriptorKey>,
    by_watcher: HashMap<WatcherId, DescriptorKey>,
    timers: BinaryHeap<Reverse<(Instant, ActorId)>>,
    /// Earliest pending wake-up per actor; stale heap entries are skipped
    armed: HashMap<ActorId, Instant>,
    next_actor_id: ActorId,
}

impl Coordinator {
    pub fn new(ctx: Arc<EngineContext>, rx: Receiver<CoordinatorMessage>) -> Self {
        Self {
            ctx,
            rx,
            entries: HashMap::new(),
            by_actor: HashMap::new(),
            by_watcher: HashMap::new(),
            timers: BinaryHeap::new(),
            armed: HashMap::new(),
            next_actor_id: 1,
        }
    }

    pub fn run(mut self) {
        log::debug!("Coordinator started");
        loop {
            let received = match self.timers.peek() {
                Some(Reverse((deadline, _))) => match self.rx.recv_deadline(*deadline) {
                    Ok(message) => Some(message),
                    Err(RecvTimeoutError::Timeout) => None,
                    Err(RecvTimeoutError::Disconnected) => break,
                },
                None => match self.rx.recv() {
                    Ok(message) => Some(message),
                    Err(_) => break,
                },
            };

            if let Some(message) = received {
                log::trace!("Coordinator: {:?}", message);
                if let CoordinatorMessage::Shutdown { done } = message {
                    self.teardown();
                    let _ = done.send(());
                    break;
                }
                self.handle(message);
            }
            self.fire_timers();
        }
        log::debug!("Coordinator stopped");
    }

    fn handle(&mut self, message: CoordinatorMessage) {
        match message {
            CoordinatorMessage::RequestFile {
                descriptor,
                watcher_id,
                watcher,
                resume_from,
            } => self.request_file(descriptor, watcher_id, watcher, resume_from),
            CoordinatorMessage::RemoveWatcher { watcher_id } => self.remove_watcher(watcher_id),
            CoordinatorMessage::FrameConsumed { actor_id } => self.schedule(actor_id),
            CoordinatorMessage::Progress { file_id, fraction } => {
                for entry in self.entries.values_mut() {
                    if entry.actor.file_id() == file_id && entry.actor.is_acquiring() {
                        entry.last_progress = Some(fraction);
                        entry.fan_out(|w| w.on_progress(fraction));
                    }
                }
            }
            CoordinatorMessage::LocalFileReady { file_id, path } => {
                for entry in self.entries.values() {
                    if entry.actor.file_id() == file_id {
                        entry.actor.on_local_file_ready(path.clone());
                    }
                }
            }
            CoordinatorMessage::AcquisitionFailed { file_id, error } => {
                let failed: Vec<DescriptorKey> = self
                    .entries
                    .iter()
                    .filter(|(_, e)| e.actor.file_id() == file_id && e.actor.is_acquiring())
                    .map(|(key, _)| *key)
                    .collect();
                for key in failed {
                    self.fail_entry(&key, &error);
                }
            }
            CoordinatorMessage::Decoded { actor_id, outcome } => {
                self.on_decoded(actor_id, outcome)
            }
            CoordinatorMessage::CacheReady { actor_id, result } => match result {
                Ok(()) => {
                    if let Some(entry) = self.entry_for_actor(actor_id) {
                        entry.actor.cache_built();
                    }
                }
                Err(e) => log::warn!("Frame cache build for actor {} failed: {}", actor_id, e),
            },
            CoordinatorMessage::Unfrozen => {
                let ids: Vec<ActorId> = self.by_actor.keys().copied().collect();
                for id in ids {
                    self.schedule(id);
                }
            }
            CoordinatorMessage::Resume { actor_id } => {
                if let Some(entry) = self.entry_for_actor(actor_id) {
                    entry.actor.resume();
                    self.schedule(actor_id);
                }
            }
            CoordinatorMessage::SeekToStart { actor_id } => {
                let accepted = self
                    .entry_for_actor(actor_id)
                    .is_some_and(|entry| entry.actor.request_seek_to_start());
                if accepted {
                    self.schedule(actor_id);
                }
            }
            CoordinatorMessage::Query { reply } => {
                let statuses = self
                    .entries
                    .values()
                    .map(|entry| entry.actor.status(entry.watchers.len()))
                    .collect();
                let _ = reply.send(statuses);
            }
            CoordinatorMessage::Shutdown { done } => {
                self.teardown();
                let _ = done.send(());
            }
        }
    }

    fn entry_for_actor(&self, actor_id: ActorId) -> Option<&Entry> {
        self.by_actor
            .get(&actor_id)
            .and_then(|key| self.entries.get(key))
    }

    fn request_file(
        &mut self,
        descriptor: Descriptor,
        watcher_id: WatcherId,
        watcher: Arc<dyn Watcher>,
        resume_from: Option<u32>,
    ) {
        let key = *descriptor.key();

        if let Some(entry) = self.entries.get_mut(&key) {
            // Join the running stream
            entry.watchers.insert(watcher_id, Arc::clone(&watcher));
            self.by_watcher.insert(watcher_id, key);
            let actor = Arc::clone(&entry.actor);
            actor.set_runtime(*descriptor.runtime());
            actor.set_watcher_count(entry.watchers.len());

            if actor.is_loaded() {
                let handle = actor.handle();
                let latest = handle.latest_frame_index();
                watcher.on_loaded(handle);
                if let Some(index) = latest {
                    watcher.on_frame_ready(index);
                }
            } else if let Some(fraction) = entry.last_progress {
                watcher.on_progress(fraction);
            }
            self.schedule(actor.id());
            return;
        }

        let actor_id = self.next_actor_id;
        self.next_actor_id += 1;
        let actor = PlaybackActor::new(actor_id, descriptor, Arc::clone(&self.ctx), resume_from);
        actor.set_watcher_count(1);

        let mut watchers = HashMap::new();
        watchers.insert(watcher_id, watcher);
        self.entries.insert(
            key,
            Entry {
                actor: Arc::clone(&actor),
                watchers,
                last_progress: None,
            },
        );
        self.by_actor.insert(actor_id, key);
        self.by_watcher.insert(watcher_id, key);

        if let Err(e) = actor.start() {
            log::warn!("Failed to start actor {}: {}", actor_id, e);
            self.fail_entry(&key, &e);
        }
    }

    fn remove_watcher(&mut self, watcher_id: WatcherId) {
        let Some(key) = self.by_watcher.remove(&watcher_id) else {
            return;
        };
        let Some(entry) = self.entries.get_mut(&key) else {
            return;
        };
        entry.watchers.remove(&watcher_id);
        if entry.watchers.is_empty() {
            self.remove_entry(&key);
        } else {
            entry.actor.set_watcher_count(entry.watchers.len());
        }
    }

    fn on_decoded(&mut self, actor_id: ActorId, outcome: StepOutcome) {
        let Some(key) = self.by_actor.get(&actor_id).copied() else {
            return;
        };
        let Some(entry) = self.entries.get(&key) else {
            return;
        };
        if entry.actor.is_cancelled() {
            return;
        }

        match outcome {
            StepOutcome::Loaded => {
                entry.actor.mark_loaded();
                let handle = entry.actor.handle();
                let latest = handle.latest_frame_index();
                entry.fan_out(|w| w.on_loaded(handle.clone()));
                if let Some(index) = latest {
                    entry.fan_out(|w| w.on_frame_ready(index));
                }
                self.schedule(actor_id);
            }
            StepOutcome::Frame {
                index,
                loop_boundary,
            } => {
                if loop_boundary {
                    entry.fan_out(|w| w.on_loop_boundary());
                }
                entry.fan_out(|w| w.on_frame_ready(index));
                self.schedule(actor_id);
            }
            StepOutcome::Skipped => self.schedule(actor_id),
            StepOutcome::LoopFrozen => entry.fan_out(|w| w.on_loop_boundary()),
            StepOutcome::Failed(error) => self.fail_entry(&key, &error),
            StepOutcome::Cancelled => {}
        }
    }

    /// Notify every watcher of `key` and drop the entry
    fn fail_entry(&mut self, key: &DescriptorKey, error: &EngineError) {
        if let Some(entry) = self.entries.get(key) {
            log::warn!(
                "File {} failed for {} watcher(s): {}",
                entry.actor.file_id(),
                entry.watchers.len(),
                error
            );
            entry.fan_out(|w| w.on_failed(error));
        }
        self.remove_entry(key);
    }

    fn remove_entry(&mut self, key: &DescriptorKey) {
        let Some(entry) = self.entries.remove(key) else {
            return;
        };
        let actor = entry.actor;
        for watcher_id in entry.watchers.keys() {
            self.by_watcher.remove(watcher_id);
        }
        self.by_actor.remove(&actor.id());
        self.armed.remove(&actor.id());

        let file_id = actor.file_id();
        let was_acquiring = actor.is_acquiring();
        actor.cancel();

        let shared = self.entries.values().any(|e| e.actor.file_id() == file_id);
        if was_acquiring && !shared {
            log::debug!("Cancelling download of file {}", file_id);
            self.ctx.acquisition.cancel_download(file_id);
        }
    }

    fn schedule(&mut self, actor_id: ActorId) {
        let Some(actor) = self.entry_for_actor(actor_id).map(|e| Arc::clone(&e.actor)) else {
            return;
        };
        if let NextFrame::Deferred(due) = actor.request_next_frame() {
            self.arm(actor_id, due);
        }
    }

    fn arm(&mut self, actor_id: ActorId, due: Instant) {
        match self.armed.get(&actor_id) {
            Some(existing) if *existing <= due => {}
            _ => {
                self.armed.insert(actor_id, due);
                self.timers.push(Reverse((due, actor_id)));
            }
        }
    }

    fn fire_timers(&mut self) {
        let now = Instant::now();
        while let Some(Reverse((due, actor_id))) = self.timers.peek().copied() {
            if due > now {
                break;
            }
            self.timers.pop();
            if self.armed.get(&actor_id) == Some(&due) {
                self.armed.remove(&actor_id);
                self.schedule(actor_id);
            }
        }
    }

    fn teardown(&mut self) {
        let keys: Vec<DescriptorKey> = self.entries.keys().copied().collect();
        log::debug!("Coordinator tearing down {} actor(s)", keys.len());
        for key in keys {
            self.remove_entry(&key);
        }
        self.timers.clear();
    }
}
