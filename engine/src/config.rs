use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::resource_monitor::PerformanceMode;
use crate::validate_enum;

/// Main configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub general: GeneralSettings,

    #[serde(default)]
    pub decoder: DecoderSettings,

    #[serde(default)]
    pub playback: PlaybackSettings,

    #[serde(default)]
    pub cache: CacheSettings,
}

/// General settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeneralSettings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

impl Default for GeneralSettings {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Decoder thread pools and frame rings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DecoderSettings {
    #[serde(default = "default_general_threads")]
    pub general_threads: usize,

    #[serde(default = "default_compact_threads")]
    pub compact_threads: usize,

    #[serde(default = "default_vector_threads")]
    pub vector_threads: usize,

    /// Buffers per frame ring
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,

    /// Buffers decoded synchronously when a ring is created
    #[serde(default = "default_initial_filled")]
    pub initial_filled: usize,
}

impl Default for DecoderSettings {
    fn default() -> Self {
        Self {
            general_threads: default_general_threads(),
            compact_threads: default_compact_threads(),
            vector_threads: default_vector_threads(),
            ring_capacity: default_ring_capacity(),
            initial_filled: default_initial_filled(),
        }
    }
}

fn default_general_threads() -> usize {
    3
}
fn default_compact_threads() -> usize {
    1
}
fn default_vector_threads() -> usize {
    2
}
fn default_ring_capacity() -> usize {
    3
}
fn default_initial_filled() -> usize {
    1
}

/// Frame pacing
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct PlaybackSettings {
    #[serde(default = "default_refresh_rate")]
    pub display_refresh_rate: u32,

    /// Hard cap applied to every item
    #[serde(default = "default_refresh_rate")]
    pub max_frame_rate: u32,

    /// Cap for sources declaring the optimized profile
    #[serde(default = "default_optimized_frame_rate")]
    pub optimized_frame_rate: u32,

    #[serde(default = "default_performance_mode")]
    pub performance_mode: String,

    #[serde(default = "default_true")]
    pub auto_battery_mode: bool,
}

impl Default for PlaybackSettings {
    fn default() -> Self {
        Self {
            display_refresh_rate: default_refresh_rate(),
            max_frame_rate: default_refresh_rate(),
            optimized_frame_rate: default_optimized_frame_rate(),
            performance_mode: default_performance_mode(),
            auto_battery_mode: true,
        }
    }
}

impl PlaybackSettings {
    pub fn mode(&self) -> PerformanceMode {
        PerformanceMode::from_str(&self.performance_mode).unwrap_or_default()
    }
}

fn default_refresh_rate() -> u32 {
    60
}
fn default_optimized_frame_rate() -> u32 {
    30
}
fn default_performance_mode() -> String {
    "balanced".to_string()
}
fn default_true() -> bool {
    true
}

/// Disk frame cache for vector animations
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CacheSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Cache directory; `None` means the platform cache dir
    #[serde(default)]
    pub directory: Option<String>,

    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_max_entries")]
    pub max_entries: usize,

    /// Cache files smaller than this are built on the decoder thread
    #[serde(default = "default_sync_build_limit")]
    pub sync_build_limit_bytes: u64,

    #[serde(default = "default_gc_interval_secs")]
    pub gc_interval_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            directory: None,
            ttl_secs: default_ttl_secs(),
            max_entries: default_max_entries(),
            sync_build_limit_bytes: default_sync_build_limit(),
            gc_interval_secs: default_gc_interval_secs(),
        }
    }
}

impl CacheSettings {
    /// Resolve the cache directory, expanding `~`
    pub fn resolve_directory(&self) -> Result<PathBuf> {
        match &self.directory {
            Some(dir) => Ok(PathBuf::from(shellexpand::tilde(dir).to_string())),
            None => Ok(dirs::cache_dir()
                .context("Failed to get cache directory")?
                .join("animd")
                .join("frames")),
        }
    }

    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    pub fn gc_interval(&self) -> Duration {
        Duration::from_secs(self.gc_interval_secs)
    }
}

fn default_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}
fn default_max_entries() -> usize {
    50
}
fn default_sync_build_limit() -> u64 {
    4 * 1024 * 1024
}
fn default_gc_interval_secs() -> u64 {
    60 * 60
}

impl EngineConfig {
    /// Load configuration from the default location
    pub fn load() -> Result<Self> {
        let config_path = Self::default_config_path()?;
        Self::load_from_path(&config_path)
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        if !path.exists() {
            log::info!(
                "Config file not found at {}, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: EngineConfig = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        log::info!("Loaded configuration from {}", path.display());
        config.validate()?;

        Ok(config)
    }

    /// Get the default config file path
    pub fn default_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("animd");

        Ok(config_dir.join("config.toml"))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        validate_log_level(&self.general.log_level)?;
        validate_performance_mode(&self.playback.performance_mode)?;

        let decoder = &self.decoder;
        if decoder.general_threads == 0 || decoder.vector_threads == 0 {
            anyhow::bail!("general_threads and vector_threads must be at least 1");
        }
        if decoder.ring_capacity < 2 {
            anyhow::bail!(
                "ring_capacity must be at least 2 (got {})",
                decoder.ring_capacity
            );
        }
        if decoder.initial_filled == 0 || decoder.initial_filled >= decoder.ring_capacity {
            anyhow::bail!(
                "initial_filled must be between 1 and ring_capacity - 1 (got {})",
                decoder.initial_filled
            );
        }

        if self.playback.display_refresh_rate == 0 || self.playback.max_frame_rate == 0 {
            anyhow::bail!("Frame rates must be positive");
        }

        Ok(())
    }
}

fn validate_log_level(level: &str) -> Result<()> {
    validate_enum!(level, "trace", "debug", "info", "warn", "error")
}

fn validate_performance_mode(mode: &str) -> Result<()> {
    validate_enum!(mode, "performance", "balanced", "powersave")
}
