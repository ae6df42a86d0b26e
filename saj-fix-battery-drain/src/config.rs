//! Configuration for the battery-drain fix.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use saj_common::BaseConfig;
use saj_tool_framework::{Result, ToolConfig, ToolError};

/// Complete tool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixBatteryDrainConfig {
    /// Broker, device, request and logging sections.
    #[serde(flatten)]
    pub base: BaseConfig,

    /// Control loop settings.
    #[serde(default)]
    pub battery_drain: BatteryDrainSettings,
}

impl ToolConfig for FixBatteryDrainConfig {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseConfig {
        &mut self.base
    }

    fn validate(&self) -> Result<()> {
        self.battery_drain.validate()
    }
}

/// Thresholds and timings of the control loop.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatteryDrainSettings {
    /// Grid export (negative meter power, W) beyond which reverse flow is
    /// blocked.
    #[serde(default = "default_threshold")]
    pub threshold_watts: i16,

    /// Cycle length while nothing is being corrected, in seconds.
    #[serde(default = "default_normal_cycle")]
    pub normal_cycle_secs: u64,

    /// Cycle length after a correction, in seconds.
    #[serde(default = "default_fix_cycle")]
    pub fix_cycle_secs: u64,

    /// Delay between attempts to read the initial state, in seconds.
    #[serde(default = "default_init_retry")]
    pub init_retry_secs: u64,
}

fn default_threshold() -> i16 {
    -5
}

fn default_normal_cycle() -> u64 {
    120
}

fn default_fix_cycle() -> u64 {
    1800
}

fn default_init_retry() -> u64 {
    10
}

impl Default for BatteryDrainSettings {
    fn default() -> Self {
        Self {
            threshold_watts: default_threshold(),
            normal_cycle_secs: default_normal_cycle(),
            fix_cycle_secs: default_fix_cycle(),
            init_retry_secs: default_init_retry(),
        }
    }
}

impl BatteryDrainSettings {
    pub fn normal_cycle(&self) -> Duration {
        Duration::from_secs(self.normal_cycle_secs)
    }

    pub fn fix_cycle(&self) -> Duration {
        Duration::from_secs(self.fix_cycle_secs)
    }

    pub fn init_retry(&self) -> Duration {
        Duration::from_secs(self.init_retry_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.normal_cycle_secs == 0 || self.fix_cycle_secs == 0 || self.init_retry_secs == 0 {
            return Err(ToolError::validation(
                "battery_drain cycle durations must be greater than zero",
            ));
        }
        if self.threshold_watts > 0 {
            return Err(ToolError::validation(format!(
                "threshold_watts must be zero or negative, got {}",
                self.threshold_watts
            )));
        }
        Ok(())
    }
}
