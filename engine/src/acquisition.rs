//! File acquisition collaborator.
//!
//! The engine never downloads anything itself. It asks an [`Acquisition`]
//! implementation whether a descriptor's file is already local, requests a
//! download when it is not and then only observes progress and completion
//! through [`AcquisitionEvents`], keyed by source file id.

use crossbeam_channel::Sender;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::RwLock;

use common::{Descriptor, EngineError, FileId};

use crate::coordinator::CoordinatorMessage;

/// Where a descriptor's bytes currently are
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Local(PathBuf),
    Remote,
}

/// Callback handle given to the acquisition layer
#[derive(Debug, Clone)]
pub struct AcquisitionEvents {
    tx: Sender<CoordinatorMessage>,
}

impl AcquisitionEvents {
    pub(crate) fn new(tx: Sender<CoordinatorMessage>) -> Self {
        Self { tx }
    }

    /// Download progress in `0.0..=1.0`
    pub fn progress(&self, file_id: FileId, fraction: f32) {
        let _ = self.tx.send(CoordinatorMessage::Progress {
            file_id,
            fraction: fraction.clamp(0.0, 1.0),
        });
    }

    pub fn local_file_ready(&self, file_id: FileId, path: PathBuf) {
        let _ = self.tx.send(CoordinatorMessage::LocalFileReady { file_id, path });
    }

    pub fn failed(&self, file_id: FileId, reason: impl Into<String>) {
        let _ = self.tx.send(CoordinatorMessage::AcquisitionFailed {
            file_id,
            error: EngineError::Acquisition(reason.into()),
        });
    }
}

/// Network/storage layer that supplies encoded source files
pub trait Acquisition: Send + Sync {
    fn resolve(&self, descriptor: &Descriptor) -> Result<Resolution, EngineError>;

    /// Start or join a download. Must not block; results arrive through `events`.
    fn download(&self, file_id: FileId, events: AcquisitionEvents);

    fn cancel_download(&self, file_id: FileId);
}

/// Serves files already on disk, registered by id
#[derive(Debug, Default)]
pub struct LocalFiles {
    files: RwLock<HashMap<FileId, PathBuf>>,
}

impl LocalFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, file_id: FileId, path: impl Into<PathBuf>) {
        let mut files = self
            .files
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        files.insert(file_id, path.into());
    }

    /// Forget `file_id`. Returns the path it was registered with.
    pub fn unregister(&self, file_id: FileId) -> Option<PathBuf> {
        let mut files = self
            .files
            .write()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        files.remove(&file_id)
    }

    pub fn len(&self) -> usize {
        self.files
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, file_id: FileId) -> Option<PathBuf> {
        let files = self
            .files
            .read()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        files.get(&file_id).cloned()
    }
}

impl Acquisition for LocalFiles {
    fn resolve(&self, descriptor: &Descriptor) -> Result<Resolution, EngineError> {
        match self.lookup(descriptor.file_id()) {
            Some(path) if path.exists() => Ok(Resolution::Local(path)),
            Some(_) => Ok(Resolution::Remote),
            None => Err(EngineError::NotFound(format!(
                "file {} is not registered",
                descriptor.file_id()
            ))),
        }
    }

    fn download(&self, file_id: FileId, events: AcquisitionEvents) {
        match self.lookup(file_id) {
            Some(path) if path.exists() => events.local_file_ready(file_id, path),
            Some(path) => events.failed(file_id, format!("{} does not exist", path.display())),
            None => events.failed(file_id, format!("file {} is not registered", file_id)),
        }
    }

    fn cancel_download(&self, _file_id: FileId) {}
}
