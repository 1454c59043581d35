use anyhow::Result;
use common::{Command, Descriptor, EngineError, Modifiers, Response};
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::Mutex;

use engine::PerformanceMode;

use crate::DaemonState;
use crate::preview::Preview;

pub async fn start(state: Arc<Mutex<DaemonState>>) -> Result<()> {
    let socket_path = common::get_socket_path();

    // Remove old socket if it exists
    if socket_path.exists() {
        std::fs::remove_file(&socket_path)?;
    }

    let listener = UnixListener::bind(&socket_path)?;
    log::info!("IPC server listening on: {}", socket_path.display());

    loop {
        // Check if we should exit
        if state.lock().await.should_exit {
            break;
        }

        // Accept connections with timeout
        let accept_result =
            tokio::time::timeout(std::time::Duration::from_millis(100), listener.accept()).await;

        match accept_result {
            Ok(Ok((stream, _addr))) => {
                let state = state.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_client(stream, state).await {
                        log::error!("Error handling client: {}", e);
                    }
                });
            }
            Ok(Err(e)) => {
                log::error!("Error accepting connection: {}", e);
            }
            Err(_) => {
                // Timeout, continue loop to check exit condition
                continue;
            }
        }
    }

    // Clean up socket
    let _ = std::fs::remove_file(&socket_path);
    log::info!("IPC server stopped");
    Ok(())
}

async fn handle_client(stream: UnixStream, state: Arc<Mutex<DaemonState>>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<Command>(&line) {
            Ok(command) => handle_command(command, &state).await,
            Err(e) => {
                log::warn!("Invalid command: {}", e);
                Response::Error(EngineError::Ipc(format!("Invalid command: {}", e)))
            }
        };

        // Send response
        let response_json = serde_json::to_string(&response)?;
        writer.write_all(response_json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;

        line.clear();
    }

    Ok(())
}

/// Run a blocking engine call off the async workers
async fn blocking<T, F>(f: F) -> Result<T, EngineError>
where
    F: FnOnce() -> Result<T, EngineError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| EngineError::InvalidState(format!("Engine task failed: {}", e)))?
}

async fn handle_command(command: Command, state: &Arc<Mutex<DaemonState>>) -> Response {
    log::debug!("Handling command: {:?}", command);

    match command {
        Command::Ping => Response::Pong,

        Command::Query => {
            let engine = state.lock().await.engine.clone();
            match blocking(move || engine.status()).await {
                Ok(status) => Response::Status(status),
                Err(e) => Response::Error(e),
            }
        }

        Command::Play {
            path,
            kind,
            play_once,
            width,
            height,
        } => {
            log::info!(
                "Playing {} as {} on a {}x{} preview{}",
                path,
                kind.name(),
                width,
                height,
                if play_once { " (once)" } else { "" }
            );

            let file = Path::new(&path);
            if !file.is_absolute() {
                return Response::Error(EngineError::Ipc(format!(
                    "Path must be absolute: {}",
                    path
                )));
            }
            if !file.exists() {
                return Response::Error(EngineError::NotFound(format!(
                    "Animation file not found: {}",
                    path
                )));
            }
            if width == 0 || height == 0 {
                return Response::Error(EngineError::Ipc(format!(
                    "Invalid surface size {}x{}",
                    width, height
                )));
            }

            let mut state = state.lock().await;
            // Previews whose item failed have already stopped
            let finished: Vec<u64> = state
                .previews
                .iter()
                .filter(|(_, preview)| !preview.is_running())
                .map(|(id, _)| *id)
                .collect();
            for id in finished {
                state.previews.remove(&id);
                state.files.unregister(id);
            }
            let file_id = state.allocate_file_id();
            state.files.register(file_id, file);

            let file_name = file
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.clone());
            let descriptor = Descriptor::new(0, file_id, file_name, kind).with_modifiers(
                Modifiers {
                    play_once,
                    ..Default::default()
                },
            );

            let refresh_rate = state.engine.config().playback.display_refresh_rate;
            let surface = state.engine.surface();
            match Preview::spawn(file_id, surface, descriptor, width, height, refresh_rate) {
                Ok(preview) => {
                    state.previews.insert(file_id, preview);
                    Response::Surface(file_id)
                }
                Err(e) => Response::Error(EngineError::InvalidState(format!("{:#}", e))),
            }
        }

        Command::Stop { surface } => {
            let (preview, files) = {
                let mut guard = state.lock().await;
                (guard.previews.remove(&surface), guard.files.clone())
            };
            match preview {
                Some(preview) => {
                    let stopped = blocking(move || {
                        preview.stop();
                        // Preview ids double as file ids
                        files.unregister(surface);
                        Ok(())
                    })
                    .await;
                    match stopped {
                        Ok(()) => Response::Ok,
                        Err(e) => Response::Error(e),
                    }
                }
                None => Response::Error(EngineError::NotFound(format!(
                    "No preview surface {}",
                    surface
                ))),
            }
        }

        Command::Freeze => {
            let mut state = state.lock().await;
            let guard = state.engine.freeze();
            state.freezes.push(guard);
            log::info!("Freeze held ({} from IPC)", state.freezes.len());
            Response::Ok
        }

        Command::Unfreeze => {
            let mut state = state.lock().await;
            match state.freezes.pop() {
                Some(guard) => {
                    drop(guard);
                    log::info!("Freeze released ({} left from IPC)", state.freezes.len());
                    Response::Ok
                }
                None => Response::Error(EngineError::InvalidState(
                    "No freeze is held".to_string(),
                )),
            }
        }

        Command::CacheGc => {
            let engine = state.lock().await.engine.clone();
            let result = blocking(move || match engine.disk_cache() {
                Some(cache) => cache.gc(),
                None => Err(EngineError::Config("Frame cache is disabled".to_string())),
            })
            .await;
            match result {
                Ok(report) => {
                    log::info!(
                        "Cache GC: {} expired, {} corrupt, {} orphaned",
                        report.expired,
                        report.corrupt,
                        report.orphans
                    );
                    Response::Collected {
                        deleted: report.total(),
                    }
                }
                Err(e) => Response::Error(e),
            }
        }

        Command::CacheClear => {
            let engine = state.lock().await.engine.clone();
            let result = blocking(move || match engine.disk_cache() {
                Some(cache) => cache.clear(),
                None => Err(EngineError::Config("Frame cache is disabled".to_string())),
            })
            .await;
            match result {
                Ok(()) => Response::Ok,
                Err(e) => Response::Error(e),
            }
        }

        Command::Kill => {
            log::info!("Received kill command");
            state.lock().await.should_exit = true;
            Response::Ok
        }

        Command::GetResources => {
            let state = state.lock().await;
            if let Some(ref stats) = state.resource_stats {
                Response::Resources(common::ResourceStatus {
                    performance_mode: state.engine.performance_mode().name().to_string(),
                    memory_mb: stats.memory_bytes / 1024 / 1024,
                    cpu_percent: stats.cpu_percent,
                    on_battery: stats.on_battery,
                    battery_percent: stats.battery_percent,
                })
            } else {
                Response::Error(EngineError::InvalidState(
                    "Resource stats not yet available".to_string(),
                ))
            }
        }

        Command::SetPerformanceMode { mode } => match PerformanceMode::from_str(&mode) {
            Some(mode) => {
                let mut state = state.lock().await;
                state.monitor.set_mode(mode);
                state.engine.set_performance_mode(mode);
                Response::Ok
            }
            None => Response::Error(EngineError::Config(format!(
                "Unknown performance mode: {} (expected performance, balanced or powersave)",
                mode
            ))),
        },
    }
}
