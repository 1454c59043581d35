//! Playable item identity.
//!
//! A [`Descriptor`] names one animated item: where its bytes come from, what
//! kind of decoder it needs and which presentation modifiers apply. Its
//! [`DescriptorKey`] is the identity used by the engine registry; two
//! descriptors with equal keys share one decode stream.

use serde::{Deserialize, Serialize};

/// Account/session that owns a descriptor.
pub type SessionId = u32;

/// Identifier of the encoded source file, as known to the acquisition layer.
pub type FileId = u64;

/// Decoder family for an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ItemKind {
    /// Animated raster image (GIF, animated WebP).
    RasterLoop,
    /// Short muted video loop (MP4/WebM).
    VideoLoop,
    /// Vector ("Lottie"-style) animation rasterized per frame.
    VectorAnimation,
}

impl ItemKind {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "raster" | "gif" | "raster-loop" => Some(Self::RasterLoop),
            "video" | "video-loop" => Some(Self::VideoLoop),
            "vector" | "lottie" | "vector-animation" => Some(Self::VectorAnimation),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RasterLoop => "raster-loop",
            Self::VideoLoop => "video-loop",
            Self::VectorAnimation => "vector-animation",
        }
    }
}

/// Frame-rate profile declared by the source.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OptimizationProfile {
    #[default]
    Standard,
    /// The source asks to be played at a reduced rate.
    Optimized,
}

/// Identity-bearing presentation modifiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Modifiers {
    /// Round video message; may be aligned to an external player.
    pub round_video: bool,
    /// Decode a single frame and never advance.
    pub still: bool,
    /// Stop after the first full loop until resumed.
    pub play_once: bool,
    /// Never share the decode stream with another request.
    pub unique: bool,
    /// Emoji-sized item, decoded on the compact pool.
    pub compact: bool,
    pub optimization: OptimizationProfile,
}

/// Recolouring variant for vector animations (0 = original colours).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ColorVariant(pub u32);

/// Raster size a vector animation is rendered at. Zero for intrinsic size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RenderSize {
    pub width: u32,
    pub height: u32,
}

impl RenderSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Registry identity of a playable item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DescriptorKey {
    pub session_id: SessionId,
    pub file_id: FileId,
    pub kind: ItemKind,
    pub modifiers: Modifiers,
    pub color_variant: ColorVariant,
    pub render_size: RenderSize,
    /// Creation timestamp, only set for unique instances.
    pub created_at: Option<u64>,
}

/// Haptic pattern attached to a vector animation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VibrationPattern {
    Heartbeat,
    Fireworks,
    Pulse,
}

/// Flags that may change while an item plays. They never affect identity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuntimeFlags {
    /// Play once even if the descriptor itself loops.
    pub loop_once: bool,
    /// For still items, show the final frame instead of the first.
    pub decode_last_frame: bool,
    pub vibration: Option<VibrationPattern>,
    /// Keep decoding while a global freeze is held.
    pub ignore_global_freeze: bool,
}

/// A playable animated item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Descriptor {
    key: DescriptorKey,
    /// Source file name, used for cache file naming.
    file_name: String,
    runtime: RuntimeFlags,
}

impl Descriptor {
    pub fn new(
        session_id: SessionId,
        file_id: FileId,
        file_name: impl Into<String>,
        kind: ItemKind,
    ) -> Self {
        Self {
            key: DescriptorKey {
                session_id,
                file_id,
                kind,
                modifiers: Modifiers::default(),
                color_variant: ColorVariant::default(),
                render_size: RenderSize::default(),
                created_at: None,
            },
            file_name: file_name.into(),
            runtime: RuntimeFlags::default(),
        }
    }

    pub fn with_modifiers(mut self, modifiers: Modifiers) -> Self {
        self.key.modifiers = modifiers;
        if !modifiers.unique {
            self.key.created_at = None;
        }
        self
    }

    pub fn with_color_variant(mut self, variant: ColorVariant) -> Self {
        self.key.color_variant = variant;
        self
    }

    pub fn with_render_size(mut self, width: u32, height: u32) -> Self {
        self.key.render_size = RenderSize::new(width, height);
        self
    }

    /// Mark as a unique instance created at `created_at`.
    pub fn unique(mut self, created_at: u64) -> Self {
        self.key.modifiers.unique = true;
        self.key.created_at = Some(created_at);
        self
    }

    pub fn with_runtime(mut self, runtime: RuntimeFlags) -> Self {
        self.runtime = runtime;
        self
    }

    pub fn key(&self) -> &DescriptorKey {
        &self.key
    }

    pub fn kind(&self) -> ItemKind {
        self.key.kind
    }

    pub fn file_id(&self) -> FileId {
        self.key.file_id
    }

    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    pub fn modifiers(&self) -> &Modifiers {
        &self.key.modifiers
    }

    pub fn runtime(&self) -> &RuntimeFlags {
        &self.runtime
    }
}
