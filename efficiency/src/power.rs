//! Power-source and wall-clock inputs to the auto policy

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveTime, Timelike};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Battery and AC state at one instant
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerStatus {
    pub on_ac: bool,
    pub battery_percent: f64,
    pub discharging: bool,
}

impl Default for PowerStatus {
    fn default() -> Self {
        // Desktop-like default: mains power, no battery concern
        Self {
            on_ac: true,
            battery_percent: 100.0,
            discharging: false,
        }
    }
}

#[async_trait]
pub trait PowerSource: Send + Sync + std::fmt::Debug {
    async fn status(&self) -> Result<PowerStatus>;
}

/// Reads `/sys/class/power_supply` the way the kernel exposes it
#[derive(Debug, Clone)]
pub struct SysfsPowerSource {
    battery_dir: PathBuf,
    ac_online_path: PathBuf,
}

impl SysfsPowerSource {
    pub fn new() -> Self {
        Self {
            battery_dir: PathBuf::from("/sys/class/power_supply/BAT0"),
            ac_online_path: PathBuf::from("/sys/class/power_supply/AC/online"),
        }
    }

    pub fn with_paths(battery_dir: impl Into<PathBuf>, ac_online_path: impl Into<PathBuf>) -> Self {
        Self {
            battery_dir: battery_dir.into(),
            ac_online_path: ac_online_path.into(),
        }
    }

    fn read(&self) -> Result<PowerStatus> {
        let capacity_path = self.battery_dir.join("capacity");
        let status_path = self.battery_dir.join("status");

        // No battery node at all means a desktop on mains
        if !capacity_path.exists() {
            return Ok(PowerStatus::default());
        }

        let capacity: f64 = std::fs::read_to_string(&capacity_path)
            .with_context(|| format!("reading {}", capacity_path.display()))?
            .trim()
            .parse()
            .context("battery capacity")?;
        let status = std::fs::read_to_string(&status_path).unwrap_or_default();
        let discharging = status.trim().eq_ignore_ascii_case("discharging");
        let on_ac = std::fs::read_to_string(&self.ac_online_path)
            .map(|s| s.trim() == "1")
            .unwrap_or(!discharging);

        Ok(PowerStatus {
            on_ac,
            battery_percent: capacity,
            discharging,
        })
    }
}

impl Default for SysfsPowerSource {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PowerSource for SysfsPowerSource {
    async fn status(&self) -> Result<PowerStatus> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.read())
            .await
            .context("power probe task join")?
    }
}

/// Fake power source for tests
#[derive(Debug, Default)]
pub struct StaticPowerSource {
    status: Mutex<PowerStatus>,
}

impl StaticPowerSource {
    pub fn new(status: PowerStatus) -> Self {
        Self {
            status: Mutex::new(status),
        }
    }

    pub fn set(&self, status: PowerStatus) {
        *self.status.lock() = status;
    }
}

#[async_trait]
impl PowerSource for StaticPowerSource {
    async fn status(&self) -> Result<PowerStatus> {
        Ok(*self.status.lock())
    }
}

/// Wall-clock seam so quiet hours are testable
pub trait Clock: Send + Sync + std::fmt::Debug {
    fn local_time(&self) -> NaiveTime;
}

#[derive(Debug, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn local_time(&self) -> NaiveTime {
        let now = Local::now();
        NaiveTime::from_hms_opt(now.hour(), now.minute(), now.second())
            .unwrap_or(NaiveTime::MIN)
    }
}

/// Fake clock for tests
#[derive(Debug)]
pub struct StaticClock {
    time: Mutex<NaiveTime>,
}

impl StaticClock {
    pub fn at(hour: u32, minute: u32) -> Self {
        Self {
            time: Mutex::new(NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN)),
        }
    }

    pub fn set(&self, hour: u32, minute: u32) {
        *self.time.lock() = NaiveTime::from_hms_opt(hour, minute, 0).unwrap_or(NaiveTime::MIN);
    }
}

impl Clock for StaticClock {
    fn local_time(&self) -> NaiveTime {
        *self.time.lock()
    }
}
