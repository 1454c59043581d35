//! Decoder thread pool.
//!
//! Three fixed sets of named worker threads: general-purpose, compact
//! (emoji-sized items) and vector. Each worker owns a private queue, so every
//! message for one actor runs on the same thread in posting order.

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};

use common::ItemKind;

use crate::actor::PlaybackActor;
use crate::config::DecoderSettings;
use crate::lock;

pub(crate) enum WorkerMessage {
    StartDecoding(Arc<PlaybackActor>),
    PrepareNextFrame(Arc<PlaybackActor>),
    PrepareStartFrame(Arc<PlaybackActor>),
    Destroy(Arc<PlaybackActor>),
    Shutdown,
}

/// Posting end of one worker's queue
#[derive(Clone)]
pub(crate) struct WorkerHandle {
    name: Arc<str>,
    tx: Sender<WorkerMessage>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once the worker has exited
    pub fn post(&self, message: WorkerMessage) -> bool {
        self.tx.send(message).is_ok()
    }
}

struct WorkerSet {
    workers: Vec<WorkerHandle>,
    next: AtomicUsize,
}

impl WorkerSet {
    fn spawn(
        label: &str,
        count: usize,
        joins: &mut Vec<JoinHandle<()>>,
    ) -> anyhow::Result<Self> {
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let name = format!("animd-{}-{}", label, i);
            let (tx, rx) = crossbeam_channel::unbounded();
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || worker_loop(rx))
                .with_context(|| format!("Failed to spawn decoder thread {}", name))?;
            joins.push(handle);
            workers.push(WorkerHandle {
                name: Arc::from(name),
                tx,
            });
        }
        Ok(Self {
            workers,
            next: AtomicUsize::new(0),
        })
    }

    fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    fn pick(&self) -> Option<WorkerHandle> {
        if self.workers.is_empty() {
            return None;
        }
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        Some(self.workers[i].clone())
    }
}

pub(crate) struct DecoderThreadPool {
    general: WorkerSet,
    compact: WorkerSet,
    vector: WorkerSet,
    joins: Mutex<Vec<JoinHandle<()>>>,
}

impl DecoderThreadPool {
    pub fn new(settings: &DecoderSettings) -> anyhow::Result<Self> {
        let mut joins = Vec::new();
        let general = WorkerSet::spawn("decode", settings.general_threads.max(1), &mut joins)?;
        let compact = WorkerSet::spawn("compact", settings.compact_threads, &mut joins)?;
        let vector = WorkerSet::spawn("vector", settings.vector_threads.max(1), &mut joins)?;

        log::info!(
            "Decoder pool: {} general, {} compact, {} vector threads",
            general.workers.len(),
            compact.workers.len(),
            vector.workers.len()
        );

        Ok(Self {
            general,
            compact,
            vector,
            joins: Mutex::new(joins),
        })
    }

    /// Round-robin worker for a new actor
    pub fn assign(&self, kind: ItemKind, compact: bool) -> WorkerHandle {
        let set = match kind {
            ItemKind::VectorAnimation => &self.vector,
            _ if compact && !self.compact.is_empty() => &self.compact,
            _ => &self.general,
        };
        set.pick()
            .or_else(|| self.general.pick())
            .unwrap_or_else(|| {
                // Both sets are sized at least 1 in `new`; a detached handle
                // makes every post fail instead of panicking
                let (tx, _rx) = crossbeam_channel::bounded(0);
                WorkerHandle {
                    name: Arc::from("detached"),
                    tx,
                }
            })
    }

    /// Stop every worker after it drains its queue
    pub fn shutdown(&self) {
        let all = self
            .general
            .workers
            .iter()
            .chain(&self.compact.workers)
            .chain(&self.vector.workers);
        for worker in all {
            worker.post(WorkerMessage::Shutdown);
        }
        let joins: Vec<_> = lock!(self.joins).drain(..).collect();
        for handle in joins {
            let _ = handle.join();
        }
    }
}

fn worker_loop(rx: Receiver<WorkerMessage>) {
    while let Ok(message) = rx.recv() {
        match message {
            WorkerMessage::StartDecoding(actor) => actor.start_decoding(),
            WorkerMessage::PrepareNextFrame(actor) => actor.prepare_next_frame(),
            WorkerMessage::PrepareStartFrame(actor) => actor.prepare_start_frame(),
            WorkerMessage::Destroy(actor) => actor.destroy(),
            WorkerMessage::Shutdown => break,
        }
    }
    log::trace!(
        "Decoder thread {} exiting",
        thread::current().name().unwrap_or("?")
    );
}
