mod ipc_server;
mod preview;

use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use engine::resource_monitor::{ResourceMonitor, ResourceStats};
use engine::{Engine, EngineConfig, FreezeGuard, GifBackend, LocalFiles};

#[tokio::main]
async fn main() -> Result<()> {
    // Config first so its log level can seed the filter; report errors once logging is up
    let (config, load_error) = match EngineConfig::load() {
        Ok(cfg) => (cfg, None),
        Err(e) => (EngineConfig::default(), Some(e)),
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(config.general.log_level.as_str()),
    )
    .init();

    log::info!(
        "Starting animation playback host v{}",
        env!("CARGO_PKG_VERSION")
    );

    match load_error {
        Some(e) => {
            log::warn!("Failed to load config: {:#}. Using defaults.", e);
            if let Ok(path) = EngineConfig::default_config_path() {
                log::info!("Config is read from {}", path.display());
            }
        }
        None => {
            log::info!("✓ Configuration loaded successfully");
            log::info!("  Decoder settings:");
            log::info!(
                "    - Threads: {} general, {} compact, {} vector",
                config.decoder.general_threads,
                config.decoder.compact_threads,
                config.decoder.vector_threads
            );
            log::info!(
                "    - Frame ring: {} buffers, {} filled at start",
                config.decoder.ring_capacity,
                config.decoder.initial_filled
            );
            log::info!("  Playback settings:");
            log::info!(
                "    - Refresh rate: {}Hz (cap {}fps, optimized {}fps)",
                config.playback.display_refresh_rate,
                config.playback.max_frame_rate,
                config.playback.optimized_frame_rate
            );
            log::info!("    - Performance mode: {}", config.playback.performance_mode);
            if config.cache.enabled {
                log::info!("  Frame cache:");
                log::info!(
                    "    - TTL: {}s, {} entries per group",
                    config.cache.ttl_secs,
                    config.cache.max_entries
                );
            } else {
                log::info!("  Frame cache: disabled");
            }
        }
    }

    let files = Arc::new(LocalFiles::new());
    let monitor = ResourceMonitor::new(config.playback.mode(), config.playback.auto_battery_mode);
    let engine = Arc::new(Engine::start(config, Arc::new(GifBackend), files.clone())?);

    let state = Arc::new(Mutex::new(DaemonState::new(engine, files, monitor)));

    // Start IPC server
    let ipc_state = state.clone();
    let ipc_handle = tokio::spawn(async move {
        if let Err(e) = ipc_server::start(ipc_state).await {
            log::error!("IPC server error: {}", e);
        }
    });

    // Sample resources and follow battery-driven mode changes
    let monitor_state = state.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(1));
        loop {
            interval.tick().await;
            let mut state = monitor_state.lock().await;
            if state.should_exit {
                break;
            }
            if !state.monitor.should_check() {
                continue;
            }

            let before = state.monitor.mode();
            match state.monitor.update() {
                Ok(stats) => state.resource_stats = Some(stats),
                Err(e) => log::warn!("Failed to sample resources: {}", e),
            }
            let after = state.monitor.mode();
            if before != after {
                state.engine.set_performance_mode(after);
            }
        }
    });

    // Set up signal handlers
    let signal_state = state.clone();
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};

        let (mut sigterm, mut sigint) = match (
            signal(SignalKind::terminate()),
            signal(SignalKind::interrupt()),
        ) {
            (Ok(term), Ok(int)) => (term, int),
            (Err(e), _) | (_, Err(e)) => {
                log::error!("Failed to set up signal handlers: {}", e);
                return;
            }
        };

        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received SIGTERM, shutting down...");
            }
            _ = sigint.recv() => {
                log::info!("Received SIGINT, shutting down...");
            }
        }

        signal_state.lock().await.should_exit = true;
    });

    if let Err(e) = ipc_handle.await {
        log::error!("IPC server task failed: {}", e);
    }

    let (engine, previews, freezes) = {
        let mut state = state.lock().await;
        state.should_exit = true;
        (
            state.engine.clone(),
            std::mem::take(&mut state.previews),
            std::mem::take(&mut state.freezes),
        )
    };

    tokio::task::spawn_blocking(move || {
        for (_, preview) in previews {
            preview.stop();
        }
        drop(freezes);
        engine.shutdown();
    })
    .await?;

    log::info!("Daemon shutting down");
    Ok(())
}

/// Shared daemon state
pub struct DaemonState {
    pub should_exit: bool,
    pub engine: Arc<Engine>,
    pub files: Arc<LocalFiles>,
    pub previews: HashMap<u64, preview::Preview>,
    /// Global freezes held on behalf of IPC clients
    pub freezes: Vec<FreezeGuard>,
    pub monitor: ResourceMonitor,
    pub resource_stats: Option<ResourceStats>,
    next_file_id: u64,
}

impl DaemonState {
    fn new(engine: Arc<Engine>, files: Arc<LocalFiles>, monitor: ResourceMonitor) -> Self {
        Self {
            should_exit: false,
            engine,
            files,
            previews: HashMap::new(),
            freezes: Vec::new(),
            monitor,
            resource_stats: None,
            next_file_id: 1,
        }
    }

    /// Fresh id for a file played through IPC, also used as the preview id
    pub fn allocate_file_id(&mut self) -> u64 {
        let id = self.next_file_id;
        self.next_file_id += 1;
        id
    }
}
