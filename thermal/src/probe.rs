//! Telemetry probes
//!
//! One probe per backend, chosen by hardware class: the discrete GPU is
//! read through the vendor command-line tool, the CPU through sysfs hwmon,
//! and the NPU/integrated GPU through vendor sysfs nodes. Probe reads are
//! short blocking OS calls and run on the blocking worker pool.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use inference_fabric_contracts::HardwareClass;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::process::Command;

/// One reading from a backend's accelerator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TelemetrySample {
    pub temperature_celsius: f64,
    pub fan_percent: f64,
    pub throttling: bool,
    /// Coarse draw; 0.0 when the interface exposes none
    pub power_watts: f64,
}

impl Default for TelemetrySample {
    fn default() -> Self {
        Self {
            temperature_celsius: 25.0,
            fan_percent: 0.0,
            throttling: false,
            power_watts: 0.0,
        }
    }
}

#[async_trait]
pub trait TelemetryProbe: Send + Sync + std::fmt::Debug {
    async fn sample(&self) -> Result<TelemetrySample>;
}

/// Discrete-GPU probe via `nvidia-smi`
#[derive(Debug, Clone)]
pub struct NvidiaSmiProbe {
    binary: String,
}

impl NvidiaSmiProbe {
    pub fn new() -> Self {
        Self {
            binary: "nvidia-smi".to_string(),
        }
    }

    fn query(binary: &str) -> Result<TelemetrySample> {
        let output = Command::new(binary)
            .args([
                "--query-gpu=temperature.gpu,fan.speed,power.draw,clocks_event_reasons.sw_thermal_slowdown",
                "--format=csv,noheader,nounits",
            ])
            .output()
            .context("spawning nvidia-smi")?;

        if !output.status.success() {
            return Err(anyhow!(
                "nvidia-smi exited with {}",
                output.status.code().unwrap_or(-1)
            ));
        }

        let line = String::from_utf8(output.stdout).context("nvidia-smi output not utf-8")?;
        Self::parse_line(line.lines().next().unwrap_or(""))
    }

    fn parse_line(line: &str) -> Result<TelemetrySample> {
        let fields: Vec<&str> = line.split(',').map(str::trim).collect();
        if fields.len() < 4 {
            return Err(anyhow!("unexpected nvidia-smi line: {:?}", line));
        }
        Ok(TelemetrySample {
            temperature_celsius: fields[0].parse().context("temperature field")?,
            // Passively cooled boards report "[N/A]"
            fan_percent: fields[1].parse().unwrap_or(0.0),
            power_watts: fields[2].parse().unwrap_or(0.0),
            throttling: matches!(fields[3].to_lowercase().as_str(), "active" | "enabled"),
        })
    }
}

impl Default for NvidiaSmiProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TelemetryProbe for NvidiaSmiProbe {
    async fn sample(&self) -> Result<TelemetrySample> {
        let binary = self.binary.clone();
        tokio::task::spawn_blocking(move || Self::query(&binary))
            .await
            .context("probe task join")?
    }
}

/// Sysfs-backed probe for CPU hwmon and vendor NPU/IGPU nodes
///
/// Temperatures are read in millidegrees (the hwmon convention); fan as a
/// percent node; throttle as a 0/1 flag; power in microwatts.
#[derive(Debug, Clone)]
pub struct SysfsProbe {
    temp_path: PathBuf,
    fan_path: Option<PathBuf>,
    throttle_path: Option<PathBuf>,
    power_path: Option<PathBuf>,
}

impl SysfsProbe {
    pub fn new(
        temp_path: impl Into<PathBuf>,
        fan_path: Option<PathBuf>,
        throttle_path: Option<PathBuf>,
        power_path: Option<PathBuf>,
    ) -> Self {
        Self {
            temp_path: temp_path.into(),
            fan_path,
            throttle_path,
            power_path,
        }
    }

    /// Conventional node locations per hardware class
    pub fn for_hardware(hardware: HardwareClass) -> Self {
        match hardware {
            HardwareClass::Cpu => Self::new(
                "/sys/class/hwmon/hwmon0/temp1_input",
                None,
                None,
                Some(PathBuf::from(
                    "/sys/class/powercap/intel-rapl:0/energy_uj",
                )),
            ),
            HardwareClass::Igpu => Self::new(
                "/sys/class/drm/card0/device/hwmon/hwmon1/temp1_input",
                None,
                Some(PathBuf::from(
                    "/sys/class/drm/card0/device/gt_throttle_reason_status",
                )),
                None,
            ),
            HardwareClass::Npu => Self::new(
                "/sys/class/accel/accel0/device/hwmon/hwmon2/temp1_input",
                None,
                None,
                None,
            ),
            // Discrete GPUs go through NvidiaSmiProbe; this is a fallback
            HardwareClass::Dgpu => Self::new(
                "/sys/class/hwmon/hwmon3/temp1_input",
                Some(PathBuf::from("/sys/class/hwmon/hwmon3/fan1_input")),
                None,
                None,
            ),
        }
    }

    fn read_all(&self) -> Result<TelemetrySample> {
        let raw = std::fs::read_to_string(&self.temp_path)
            .with_context(|| format!("reading {}", self.temp_path.display()))?;
        let millidegrees: f64 = raw.trim().parse().context("temperature node")?;

        let fan_percent = match &self.fan_path {
            Some(path) => std::fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .unwrap_or(0.0),
            None => 0.0,
        };
        let throttling = match &self.throttle_path {
            Some(path) => std::fs::read_to_string(path)
                .map(|s| {
                    let v = s.trim();
                    v != "0" && !v.is_empty()
                })
                .unwrap_or(false),
            None => false,
        };
        let power_watts = match &self.power_path {
            Some(path) => std::fs::read_to_string(path)
                .ok()
                .and_then(|s| s.trim().parse::<f64>().ok())
                .map(|uw| uw / 1_000_000.0)
                .unwrap_or(0.0),
            None => 0.0,
        };

        Ok(TelemetrySample {
            temperature_celsius: millidegrees / 1000.0,
            fan_percent,
            throttling,
            power_watts,
        })
    }
}

#[async_trait]
impl TelemetryProbe for SysfsProbe {
    async fn sample(&self) -> Result<TelemetrySample> {
        let probe = self.clone();
        tokio::task::spawn_blocking(move || probe.read_all())
            .await
            .context("probe task join")?
    }
}

/// Fake telemetry source for tests
///
/// Holds a settable sample and an optional failure switch so tests can
/// drive temperatures, fans, and reachability without hardware.
#[derive(Debug, Default)]
pub struct StaticProbe {
    sample: Mutex<TelemetrySample>,
    failing: Mutex<bool>,
}

impl StaticProbe {
    pub fn new(sample: TelemetrySample) -> Self {
        Self {
            sample: Mutex::new(sample),
            failing: Mutex::new(false),
        }
    }

    pub fn set(&self, sample: TelemetrySample) {
        *self.sample.lock() = sample;
    }

    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }
}

#[async_trait]
impl TelemetryProbe for StaticProbe {
    async fn sample(&self) -> Result<TelemetrySample> {
        if *self.failing.lock() {
            return Err(anyhow!("probe unreachable"));
        }
        Ok(*self.sample.lock())
    }
}
