//! Common types and utilities for the animation engine.
//!
//! This crate defines the shared data model (descriptors and their flags),
//! the error type reported by the engine, and the IPC protocol used between
//! the playback host (`animd`) and its controller (`animctl`).
//!
//! # IPC Protocol
//!
//! Communication happens over a Unix domain socket using JSON-serialized
//! messages, one per line. The client sends [`Command`] variants and
//! receives [`Response`] variants.
//!
//! # Examples
//!
//! ```no_run
//! use common::{Command, ItemKind};
//!
//! let cmd = Command::Play {
//!     path: "/tmp/loop.gif".to_string(),
//!     kind: ItemKind::RasterLoop,
//!     play_once: false,
//!     width: 256,
//!     height: 256,
//! };
//!
//! let json = serde_json::to_string(&cmd).unwrap();
//! ```

mod descriptor;

pub use descriptor::{
    ColorVariant, Descriptor, DescriptorKey, FileId, ItemKind, Modifiers, OptimizationProfile,
    RenderSize, RuntimeFlags, SessionId, VibrationPattern,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reported by the engine.
///
/// All errors are serializable for transmission over IPC.
#[derive(Error, Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EngineError {
    #[error("Acquisition failed: {0}")]
    Acquisition(String),

    #[error("Failed to open decoder: {0}")]
    DecodeOpen(String),

    #[error("Decode step failed: {0}")]
    DecodeStep(String),

    #[error("Cache build failed: {0}")]
    CacheBuild(String),

    #[error("Out of memory: {0}")]
    OutOfMemory(String),

    #[error("IO error: {0}")]
    Io(String),

    #[error("IPC error: {0}")]
    Ipc(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        Self::Ipc(e.to_string())
    }
}

/// Commands sent from client to the playback host via IPC.
#[derive(Debug, Serialize, Deserialize)]
pub enum Command {
    /// Play a local file on a headless preview surface.
    Play {
        /// Path to the animation file (must be absolute)
        path: String,
        kind: ItemKind,
        play_once: bool,
        /// Surface width in pixels
        width: u32,
        /// Surface height in pixels
        height: u32,
    },
    /// Tear down a preview surface created by `Play`
    Stop { surface: u64 },
    /// Hold a global freeze (pauses all non-whitelisted decoding)
    Freeze,
    /// Release one global freeze hold
    Unfreeze,
    /// Run a disk cache GC pass now
    CacheGc,
    /// Delete the whole disk frame cache
    CacheClear,
    /// Query engine status
    Query,
    /// Kill the host
    Kill,
    /// Ping the host
    Ping,
    /// Get current resource usage and performance mode
    GetResources,
    /// Set performance mode (performance, balanced, powersave)
    SetPerformanceMode { mode: String },
}

/// Response from the playback host to the client
#[derive(Debug, Serialize, Deserialize)]
pub enum Response {
    Ok,
    Error(EngineError),
    Status(EngineStatus),
    Pong,
    Resources(ResourceStatus),
    /// A preview surface was created
    Surface(u64),
    /// Result of a GC pass
    Collected { deleted: usize },
}

/// Engine status information
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineStatus {
    pub version: String,
    pub uptime_secs: u64,
    pub freeze_count: u32,
    pub performance_mode: String,
    pub actors: Vec<ActorStatus>,
    pub cache: CacheStatus,
}

/// One registry entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActorStatus {
    pub file_id: FileId,
    pub kind: ItemKind,
    pub state: String,
    pub watchers: usize,
    pub frames_decoded: u64,
    pub has_looped: bool,
}

/// Disk frame cache status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheStatus {
    pub enabled: bool,
    pub directory: String,
    pub entries: usize,
}

/// Resource usage and performance mode status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceStatus {
    pub performance_mode: String,
    pub memory_mb: u64,
    pub cpu_percent: f32,
    pub on_battery: bool,
    pub battery_percent: Option<u8>,
}

/// Image scaling/fitting mode for render surfaces
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScaleMode {
    /// Center frame without scaling
    Center,
    /// Scale to fill the surface (may crop)
    #[default]
    Fill,
    /// Scale to fit within the surface (may letterbox)
    Fit,
    /// Stretch to fill the surface (may distort)
    Stretch,
}

/// Clockwise rotation applied at presentation time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Rotation {
    #[default]
    None,
    Cw90,
    Cw180,
    Cw270,
}

impl Rotation {
    pub fn from_degrees(degrees: u32) -> Option<Self> {
        match degrees % 360 {
            0 => Some(Self::None),
            90 => Some(Self::Cw90),
            180 => Some(Self::Cw180),
            270 => Some(Self::Cw270),
            _ => None,
        }
    }

    /// Whether width and height swap on screen
    pub fn is_transposed(&self) -> bool {
        matches!(self, Self::Cw90 | Self::Cw270)
    }
}

/// IPC socket path helper
pub fn get_socket_path() -> std::path::PathBuf {
    let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
        .unwrap_or_else(|_| format!("/run/user/{}", unsafe { libc::getuid() }));

    std::path::PathBuf::from(runtime_dir).join("animd.sock")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_mode_default() {
        assert_eq!(ScaleMode::default(), ScaleMode::Fill);
    }

    #[test]
    fn test_rotation_from_degrees() {
        assert_eq!(Rotation::from_degrees(0), Some(Rotation::None));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Cw90));
        assert_eq!(Rotation::from_degrees(45), None);
        assert!(Rotation::Cw270.is_transposed());
        assert!(!Rotation::Cw180.is_transposed());
    }

    #[test]
    fn test_response_serialization() {
        let resp = Response::Error(EngineError::NotFound("test".to_string()));
        let json = serde_json::to_string(&resp).unwrap();
        let deserialized: Response = serde_json::from_str(&json).unwrap();
        match deserialized {
            Response::Error(EngineError::NotFound(msg)) => assert_eq!(msg, "test"),
            other => panic!("unexpected response: {:?}", other),
        }

        let resp = Response::Collected { deleted: 3 };
        let json = serde_json::to_string(&resp).unwrap();
        let deserialized: Response = serde_json::from_str(&json).unwrap();
        assert!(matches!(deserialized, Response::Collected { deleted: 3 }));
    }

    #[test]
    fn test_engine_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: EngineError = io_err.into();
        assert!(matches!(err, EngineError::Io(_)));

        let json_err = serde_json::from_str::<Command>("invalid json").unwrap_err();
        let err: EngineError = json_err.into();
        assert!(matches!(err, EngineError::Ipc(_)));
    }

    #[test]
    fn test_socket_path() {
        let path = get_socket_path();
        assert!(path.to_str().unwrap().contains("animd.sock"));
    }
}
