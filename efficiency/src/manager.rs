//! Mode state machine and profile publication

use crate::power::{Clock, PowerSource, PowerStatus, SystemClock};
use anyhow::Result;
use chrono::Timelike;
use inference_fabric_contracts::{EfficiencyMode, EfficiencyProfile};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Battery percentages driving the auto policy
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BatteryThresholds {
    /// Below this: UltraEfficiency
    pub critical: f64,
    /// Below this while discharging: Efficiency
    pub low: f64,
    /// At or above this on AC: Performance is permitted
    pub conservative: f64,
}

impl Default for BatteryThresholds {
    fn default() -> Self {
        Self {
            critical: 20.0,
            low: 50.0,
            conservative: 80.0,
        }
    }
}

/// Local-time window during which Auto prefers Quiet
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuietHours {
    /// Start hour, inclusive (wraps midnight when start > end)
    pub start: u32,
    /// End hour, exclusive
    pub end: u32,
}

impl Default for QuietHours {
    fn default() -> Self {
        Self { start: 22, end: 6 }
    }
}

impl QuietHours {
    pub fn contains(&self, hour: u32) -> bool {
        if self.start <= self.end {
            hour >= self.start && hour < self.end
        } else {
            hour >= self.start || hour < self.end
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EfficiencyConfig {
    pub default_mode: EfficiencyMode,
    pub quiet_hours: QuietHours,
    pub battery_thresholds: BatteryThresholds,
    /// Auto re-evaluation period
    pub tick_interval: Duration,
}

impl Default for EfficiencyConfig {
    fn default() -> Self {
        Self {
            default_mode: EfficiencyMode::Balanced,
            quiet_hours: QuietHours::default(),
            battery_thresholds: BatteryThresholds::default(),
            tick_interval: Duration::from_secs(10),
        }
    }
}

/// Owns the requested mode and the published profile
///
/// The published profile is swapped whole behind a short lock; readers
/// clone the `Arc` and hold a consistent snapshot for as long as they
/// need it. Listeners receive the new profile only after the swap.
#[derive(Debug)]
pub struct EfficiencyManager {
    config: EfficiencyConfig,
    /// What the user asked for; may be `Auto`
    requested: RwLock<EfficiencyMode>,
    active: RwLock<Arc<EfficiencyProfile>>,
    events: broadcast::Sender<Arc<EfficiencyProfile>>,
    power: Arc<dyn PowerSource>,
    clock: Arc<dyn Clock>,
}

impl EfficiencyManager {
    pub fn new(
        config: EfficiencyConfig,
        power: Arc<dyn PowerSource>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let initial_mode = config.default_mode;
        let profile = EfficiencyProfile::for_mode(initial_mode)
            .unwrap_or_else(|| {
                // Auto as default resolves on the first tick; start Balanced
                EfficiencyProfile::for_mode(EfficiencyMode::Balanced)
                    .map(|mut p| {
                        p.origin = Some("auto: awaiting first evaluation".to_string());
                        p
                    })
                    .unwrap()
            });
        let (events, _) = broadcast::channel(16);
        Self {
            config,
            requested: RwLock::new(initial_mode),
            active: RwLock::new(Arc::new(profile)),
            events,
            power,
            clock,
        }
    }

    pub fn with_system_inputs(config: EfficiencyConfig) -> Self {
        Self::new(
            config,
            Arc::new(crate::power::SysfsPowerSource::new()),
            Arc::new(SystemClock),
        )
    }

    /// The profile snapshot a decision holds start-to-finish
    pub fn active_profile(&self) -> Arc<EfficiencyProfile> {
        self.active.read().clone()
    }

    /// The mode the user requested, which may be `Auto`
    pub fn requested_mode(&self) -> EfficiencyMode {
        *self.requested.read()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<EfficiencyProfile>> {
        self.events.subscribe()
    }

    /// Set the mode from a user command or the control surface.
    ///
    /// Setting the same mode twice is a no-op; listeners see at most one
    /// change event.
    pub async fn set_mode(&self, mode: EfficiencyMode) -> Result<Arc<EfficiencyProfile>> {
        *self.requested.write() = mode;
        let profile = match mode {
            EfficiencyMode::Auto => self.derive_auto().await,
            concrete => EfficiencyProfile::for_mode(concrete)
                .expect("every concrete mode has a profile row"),
        };
        Ok(self.publish(profile))
    }

    /// One auto-policy evaluation; called by the tick loop
    pub async fn tick(&self) {
        if self.requested_mode() != EfficiencyMode::Auto {
            return;
        }
        let profile = self.derive_auto().await;
        self.publish(profile);
    }

    /// Re-evaluate Auto every `tick_interval` until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        info!(
            interval_s = self.config.tick_interval.as_secs(),
            "efficiency auto-tick started"
        );
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("efficiency manager stopped");
                    return;
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }
    }

    /// Auto rules, first match wins:
    /// battery < critical -> UltraEfficiency; battery < low while
    /// discharging -> Efficiency; quiet hours -> Quiet; AC with battery at
    /// or above the conservative threshold -> Performance; else Balanced.
    async fn derive_auto(&self) -> EfficiencyProfile {
        let thresholds = self.config.battery_thresholds;
        let power = match self.power.status().await {
            Ok(status) => status,
            Err(error) => {
                warn!(%error, "power probe failed, assuming mains power");
                PowerStatus::default()
            }
        };
        let hour = self.clock.local_time().hour();

        let (mode, origin) = if power.battery_percent < thresholds.critical {
            (
                EfficiencyMode::UltraEfficiency,
                format!("auto: battery {:.0}% (critical)", power.battery_percent),
            )
        } else if power.discharging && power.battery_percent < thresholds.low {
            (
                EfficiencyMode::Efficiency,
                format!("auto: battery {:.0}% discharging", power.battery_percent),
            )
        } else if self.config.quiet_hours.contains(hour) {
            (
                EfficiencyMode::Quiet,
                format!(
                    "auto: quiet hours {:02}:00-{:02}:00",
                    self.config.quiet_hours.start, self.config.quiet_hours.end
                ),
            )
        } else if power.on_ac && power.battery_percent >= thresholds.conservative {
            (
                EfficiencyMode::Performance,
                format!("auto: mains power, battery {:.0}%", power.battery_percent),
            )
        } else {
            (EfficiencyMode::Balanced, "auto: default".to_string())
        };

        let mut profile = EfficiencyProfile::for_mode(mode)
            .expect("auto never derives Auto");
        profile.origin = Some(origin);
        profile
    }

    /// Swap the active profile and notify listeners, skipping no-op swaps
    fn publish(&self, profile: EfficiencyProfile) -> Arc<EfficiencyProfile> {
        let mut active = self.active.write();
        if **active == profile {
            debug!(mode = %profile.mode, "mode unchanged, no event");
            return active.clone();
        }
        let previous = active.mode;
        let next = Arc::new(profile);
        *active = next.clone();
        drop(active);

        info!(from = %previous, to = %next.mode, origin = ?next.origin, "efficiency profile changed");
        let _ = self.events.send(next.clone());
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::power::{StaticClock, StaticPowerSource};
    use inference_fabric_contracts::HardwareClass;

    fn manager(power: PowerStatus, hour: u32) -> (Arc<EfficiencyManager>, Arc<StaticPowerSource>) {
        let source = Arc::new(StaticPowerSource::new(power));
        let manager = Arc::new(EfficiencyManager::new(
            EfficiencyConfig::default(),
            source.clone(),
            Arc::new(StaticClock::at(hour, 0)),
        ));
        (manager, source)
    }

    #[tokio::test]
    async fn explicit_mode_publishes_profile() {
        let (manager, _) = manager(PowerStatus::default(), 12);
        let profile = manager.set_mode(EfficiencyMode::Quiet).await.unwrap();
        assert_eq!(profile.mode, EfficiencyMode::Quiet);
        assert_eq!(manager.active_profile().mode, EfficiencyMode::Quiet);
    }

    #[tokio::test]
    async fn setting_same_mode_twice_emits_one_event() {
        let (manager, _) = manager(PowerStatus::default(), 12);
        let mut events = manager.subscribe();
        manager.set_mode(EfficiencyMode::Efficiency).await.unwrap();
        manager.set_mode(EfficiencyMode::Efficiency).await.unwrap();

        let first = events.recv().await.unwrap();
        assert_eq!(first.mode, EfficiencyMode::Efficiency);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn critical_battery_derives_ultra_efficiency() {
        let (manager, _) = manager(
            PowerStatus {
                on_ac: false,
                battery_percent: 15.0,
                discharging: true,
            },
            12,
        );
        let profile = manager.set_mode(EfficiencyMode::Auto).await.unwrap();
        assert_eq!(profile.mode, EfficiencyMode::UltraEfficiency);
        assert_eq!(profile.allowed_hardware, vec![HardwareClass::Npu]);
        assert!(profile.origin.as_deref().unwrap().contains("battery"));
    }

    #[tokio::test]
    async fn low_battery_discharging_derives_efficiency() {
        let (manager, _) = manager(
            PowerStatus {
                on_ac: false,
                battery_percent: 40.0,
                discharging: true,
            },
            12,
        );
        let profile = manager.set_mode(EfficiencyMode::Auto).await.unwrap();
        assert_eq!(profile.mode, EfficiencyMode::Efficiency);
    }

    #[tokio::test]
    async fn quiet_hours_derive_quiet() {
        let (manager_night, _) = manager(PowerStatus {
            on_ac: false,
            battery_percent: 70.0,
            discharging: false,
        }, 23);
        let profile = manager_night.set_mode(EfficiencyMode::Auto).await.unwrap();
        assert_eq!(profile.mode, EfficiencyMode::Quiet);

        let (manager_early, _) = manager(PowerStatus {
            on_ac: false,
            battery_percent: 70.0,
            discharging: false,
        }, 5);
        let profile = manager_early.set_mode(EfficiencyMode::Auto).await.unwrap();
        assert_eq!(profile.mode, EfficiencyMode::Quiet);
    }

    #[tokio::test]
    async fn mains_with_charged_battery_derives_performance() {
        let (manager, _) = manager(
            PowerStatus {
                on_ac: true,
                battery_percent: 95.0,
                discharging: false,
            },
            12,
        );
        let profile = manager.set_mode(EfficiencyMode::Auto).await.unwrap();
        assert_eq!(profile.mode, EfficiencyMode::Performance);
    }

    #[tokio::test]
    async fn auto_falls_back_to_balanced() {
        let (manager, _) = manager(
            PowerStatus {
                on_ac: true,
                battery_percent: 60.0,
                discharging: false,
            },
            12,
        );
        let profile = manager.set_mode(EfficiencyMode::Auto).await.unwrap();
        assert_eq!(profile.mode, EfficiencyMode::Balanced);
    }

    #[tokio::test]
    async fn tick_tracks_battery_drain() {
        let (manager, source) = manager(
            PowerStatus {
                on_ac: false,
                battery_percent: 60.0,
                discharging: true,
            },
            12,
        );
        manager.set_mode(EfficiencyMode::Auto).await.unwrap();
        assert_eq!(manager.active_profile().mode, EfficiencyMode::Balanced);

        source.set(PowerStatus {
            on_ac: false,
            battery_percent: 18.0,
            discharging: true,
        });
        manager.tick().await;
        assert_eq!(manager.active_profile().mode, EfficiencyMode::UltraEfficiency);
    }

    #[tokio::test]
    async fn tick_ignores_explicit_modes() {
        let (manager, source) = manager(PowerStatus::default(), 12);
        manager.set_mode(EfficiencyMode::Performance).await.unwrap();
        source.set(PowerStatus {
            on_ac: false,
            battery_percent: 5.0,
            discharging: true,
        });
        manager.tick().await;
        assert_eq!(manager.active_profile().mode, EfficiencyMode::Performance);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_mode_changes_never_tear_profiles() {
        let (manager, _) = manager(PowerStatus::default(), 12);
        let writer = {
            let manager = manager.clone();
            tokio::spawn(async move {
                for round in 0..200 {
                    let mode = if round % 2 == 0 {
                        EfficiencyMode::Performance
                    } else {
                        EfficiencyMode::Quiet
                    };
                    manager.set_mode(mode).await.unwrap();
                }
            })
        };

        for _ in 0..2000 {
            let profile = manager.active_profile();
            // Every observed profile is exactly one table row, never a blend
            let expected = EfficiencyProfile::for_mode(profile.mode)
                .expect("published modes are concrete");
            assert_eq!(*profile, expected);
        }
        writer.await.unwrap();
    }

    #[test]
    fn quiet_hours_wrap_midnight() {
        let hours = QuietHours { start: 22, end: 6 };
        assert!(hours.contains(22));
        assert!(hours.contains(2));
        assert!(!hours.contains(6));
        assert!(!hours.contains(12));
    }
}
