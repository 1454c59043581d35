use anyhow::Result;
use std::fs;
use std::time::{Duration, Instant};
use sysinfo::{ProcessesToUpdate, System};

/// Performance mode for resource management
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PerformanceMode {
    /// No restrictions, full frame rate
    Performance,
    /// Moderate throttling, good balance (default)
    #[default]
    Balanced,
    /// Aggressive throttling for battery life
    PowerSave,
}

impl PerformanceMode {
    /// Parse from string (case-insensitive)
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "performance" => Some(PerformanceMode::Performance),
            "balanced" => Some(PerformanceMode::Balanced),
            "powersave" | "power-save" | "power_save" => Some(PerformanceMode::PowerSave),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            PerformanceMode::Performance => "performance",
            PerformanceMode::Balanced => "balanced",
            PerformanceMode::PowerSave => "powersave",
        }
    }

    /// Frame rate ceiling for vector animations
    pub fn vector_fps_limit(&self) -> u32 {
        match self {
            PerformanceMode::Performance => 60,
            PerformanceMode::Balanced => 60,
            PerformanceMode::PowerSave => 30,
        }
    }

    /// Frame rate ceiling for raster and video loops
    pub fn raster_fps_limit(&self) -> u32 {
        match self {
            PerformanceMode::Performance => 60,
            PerformanceMode::Balanced => 30,
            PerformanceMode::PowerSave => 15,
        }
    }

    pub fn to_u8(self) -> u8 {
        match self {
            PerformanceMode::Performance => 0,
            PerformanceMode::Balanced => 1,
            PerformanceMode::PowerSave => 2,
        }
    }

    pub fn from_u8(value: u8) -> Self {
        match value {
            0 => PerformanceMode::Performance,
            2 => PerformanceMode::PowerSave,
            _ => PerformanceMode::Balanced,
        }
    }
}

/// Resource usage statistics
#[derive(Debug, Clone)]
pub struct ResourceStats {
    /// Current memory usage in bytes
    pub memory_bytes: u64,
    /// Current CPU usage percentage (0-100)
    pub cpu_percent: f32,
    /// Whether system is on battery power
    pub on_battery: bool,
    /// Battery percentage (0-100), None if not available
    pub battery_percent: Option<u8>,
}

/// Resource monitor that tracks system resources
pub struct ResourceMonitor {
    /// System information tracker
    system: System,
    /// Current performance mode
    mode: PerformanceMode,
    /// Switch modes from battery state
    auto_battery_mode: bool,
    /// Last check time
    last_check: Instant,
    /// Check interval
    check_interval: Duration,
    /// Our process PID
    pid: sysinfo::Pid,
}

impl ResourceMonitor {
    /// Create a new resource monitor
    pub fn new(mode: PerformanceMode, auto_battery_mode: bool) -> Self {
        let pid = sysinfo::Pid::from(std::process::id() as usize);

        // Use System::new() instead of new_all() to avoid loading all processes
        ResourceMonitor {
            system: System::new(),
            mode,
            auto_battery_mode,
            last_check: Instant::now(),
            check_interval: Duration::from_secs(5),
            pid,
        }
    }

    /// Get current performance mode
    pub fn mode(&self) -> PerformanceMode {
        self.mode
    }

    /// Set performance mode manually
    pub fn set_mode(&mut self, mode: PerformanceMode) {
        if self.mode != mode {
            log::info!("Performance mode changed: {:?} -> {:?}", self.mode, mode);
            self.mode = mode;
        }
    }

    /// Check if we should update resource stats
    pub fn should_check(&self) -> bool {
        self.last_check.elapsed() >= self.check_interval
    }

    /// Update resource statistics and adjust performance mode if needed
    pub fn update(&mut self) -> Result<ResourceStats> {
        self.last_check = Instant::now();

        // Refresh ONLY our process stats
        self.system
            .refresh_processes(ProcessesToUpdate::Some(&[self.pid]), false);

        let memory_bytes = self
            .system
            .process(self.pid)
            .map(|p| p.memory())
            .unwrap_or(0);

        let cpu_percent = self
            .system
            .process(self.pid)
            .map(|p| p.cpu_usage())
            .unwrap_or(0.0);

        let (on_battery, battery_percent) = self.check_battery();

        if self.auto_battery_mode {
            let new_mode = mode_for_battery(on_battery, battery_percent);
            if new_mode != self.mode {
                log::info!(
                    "Auto-switching performance mode: {:?} -> {:?} (battery: {}%, on_battery: {})",
                    self.mode,
                    new_mode,
                    battery_percent.unwrap_or(0),
                    on_battery
                );
                self.mode = new_mode;
            }
        }

        let stats = ResourceStats {
            memory_bytes,
            cpu_percent,
            on_battery,
            battery_percent,
        };

        log::debug!(
            "Resource stats: mem={}MB cpu={:.1}% battery={}%{}",
            memory_bytes / 1024 / 1024,
            cpu_percent,
            battery_percent.unwrap_or(0),
            if on_battery { " (on battery)" } else { "" }
        );

        Ok(stats)
    }

    /// Check battery status via /sys/class/power_supply
    fn check_battery(&self) -> (bool, Option<u8>) {
        let battery_path = "/sys/class/power_supply/BAT0";

        let on_battery = fs::read_to_string(format!("{}/status", battery_path))
            .ok()
            .map(|s| s.trim().to_lowercase() == "discharging")
            .unwrap_or(false);

        let battery_percent = fs::read_to_string(format!("{}/capacity", battery_path))
            .ok()
            .and_then(|s| s.trim().parse::<u8>().ok());

        (on_battery, battery_percent)
    }
}

fn mode_for_battery(on_battery: bool, battery_percent: Option<u8>) -> PerformanceMode {
    if on_battery {
        if battery_percent.unwrap_or(100) < 20 {
            PerformanceMode::PowerSave
        } else {
            PerformanceMode::Balanced
        }
    } else {
        PerformanceMode::Performance
    }
}
