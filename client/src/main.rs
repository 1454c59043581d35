use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use common::{Command, ItemKind, Response};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;

#[derive(Parser)]
#[command(name = "animctl")]
#[command(about = "Animation playback host control", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Play an animation file on a headless preview surface
    Play {
        /// Path to the animation file
        path: String,

        /// Item kind (raster, video, vector)
        #[arg(short, long, default_value = "raster")]
        kind: String,

        /// Stop after the first full loop
        #[arg(long)]
        once: bool,

        /// Surface width in pixels
        #[arg(long, default_value = "512")]
        width: u32,

        /// Surface height in pixels
        #[arg(long, default_value = "512")]
        height: u32,
    },

    /// Stop a preview surface
    Stop {
        /// Surface id printed by `play`
        surface: u64,
    },

    /// Hold a global freeze (pauses decoding)
    Freeze,

    /// Release one global freeze
    Unfreeze,

    /// Disk frame cache commands
    Cache {
        #[command(subcommand)]
        action: CacheCommands,
    },

    /// Query host status and live actors
    Query,

    /// Kill the running host
    Kill,

    /// Ping the host to check if it's running
    Ping,

    /// Show resource usage and performance mode
    Resources,

    /// Set performance mode (performance, balanced, powersave)
    Mode {
        mode: String,
    },
}

#[derive(Subcommand)]
enum CacheCommands {
    /// Delete expired and orphaned cache entries now
    Gc,

    /// Delete the whole frame cache
    Clear,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let command = match cli.command {
        Commands::Play {
            path,
            kind,
            once,
            width,
            height,
        } => {
            let kind = parse_kind(&kind)?;
            let path = std::fs::canonicalize(&path)
                .with_context(|| format!("Cannot resolve {}", path))?
                .to_string_lossy()
                .to_string();
            Command::Play {
                path,
                kind,
                play_once: once,
                width,
                height,
            }
        }
        Commands::Stop { surface } => Command::Stop { surface },
        Commands::Freeze => Command::Freeze,
        Commands::Unfreeze => Command::Unfreeze,
        Commands::Cache { action } => match action {
            CacheCommands::Gc => Command::CacheGc,
            CacheCommands::Clear => Command::CacheClear,
        },
        Commands::Query => Command::Query,
        Commands::Kill => Command::Kill,
        Commands::Ping => Command::Ping,
        Commands::Resources => Command::GetResources,
        Commands::Mode { mode } => Command::SetPerformanceMode { mode },
    };

    match send_command(command).await {
        Ok(response) => {
            handle_response(response);
            Ok(())
        }
        Err(e) => {
            eprintln!("Error: {}", e);
            eprintln!("\nIs the host running? Try starting it with: animd");
            std::process::exit(1);
        }
    }
}

async fn send_command(command: Command) -> Result<Response> {
    let socket_path = common::get_socket_path();

    let stream = UnixStream::connect(&socket_path).await?;
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    // Send command
    let command_json = serde_json::to_string(&command)?;
    writer.write_all(command_json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;

    // Read response
    let mut response_line = String::new();
    reader.read_line(&mut response_line).await?;

    let response: Response = serde_json::from_str(&response_line)?;
    Ok(response)
}

fn handle_response(response: Response) {
    match response {
        Response::Ok => {
            println!("✓ Success");
        }
        Response::Error(e) => {
            eprintln!("✗ Error: {}", e);
            std::process::exit(1);
        }
        Response::Status(status) => {
            println!("Host Status:");
            println!("  Version: {}", status.version);
            println!("  Uptime: {}s", status.uptime_secs);
            println!("  Performance Mode: {}", status.performance_mode);
            println!("  Freezes Held: {}", status.freeze_count);
            if status.cache.enabled {
                println!(
                    "  Frame Cache: {} ({} entries)",
                    status.cache.directory, status.cache.entries
                );
            } else {
                println!("  Frame Cache: disabled");
            }
            println!("  Actors:");
            if status.actors.is_empty() {
                println!("    (none)");
            }
            for actor in status.actors {
                println!(
                    "    file {} [{}] {} - {} watcher(s), {} frames{}",
                    actor.file_id,
                    actor.kind.name(),
                    actor.state,
                    actor.watchers,
                    actor.frames_decoded,
                    if actor.has_looped { ", looped" } else { "" }
                );
            }
        }
        Response::Pong => {
            println!("✓ Host is running");
        }
        Response::Resources(res) => {
            println!("Resource Status:");
            println!("  Performance Mode: {}", res.performance_mode);
            println!("  Memory Usage: {} MB", res.memory_mb);
            println!("  CPU Usage: {:.1}%", res.cpu_percent);
            println!("  Power: {}", if res.on_battery { "Battery" } else { "AC" });
            if let Some(pct) = res.battery_percent {
                println!("  Battery: {}%", pct);
            }
        }
        Response::Surface(id) => {
            println!("✓ Playing on surface {}", id);
        }
        Response::Collected { deleted } => {
            println!("✓ Removed {} cache entries", deleted);
        }
    }
}

fn parse_kind(name: &str) -> Result<ItemKind> {
    ItemKind::from_str(name)
        .with_context(|| format!("Unknown kind '{}' (expected raster, video or vector)", name))
}
