//! Configuration for the oscillation fix.

use serde::{Deserialize, Serialize};
use std::time::Duration;

use saj_common::BaseConfig;
use saj_tool_framework::{Result, ToolConfig, ToolError};

/// Complete tool configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FixOscConfig {
    /// Broker, device, request and logging sections.
    #[serde(flatten)]
    pub base: BaseConfig,

    /// Control loop settings.
    #[serde(default)]
    pub fix_osc: FixOscSettings,
}

impl ToolConfig for FixOscConfig {
    fn base(&self) -> &BaseConfig {
        &self.base
    }

    fn base_mut(&mut self) -> &mut BaseConfig {
        &mut self.base
    }

    fn validate(&self) -> Result<()> {
        self.fix_osc.validate()
    }
}

/// Thresholds and timings of the control loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixOscSettings {
    /// Above this photovoltaic power (W) no fix is needed.
    #[serde(default = "default_pv_threshold")]
    pub pv_threshold_watts: i16,

    /// Above this backup load (W) no fix is needed.
    #[serde(default = "default_backup_threshold")]
    pub backup_threshold_watts: u16,

    /// Battery and grid power (W) beyond which they are oscillating.
    #[serde(default = "default_oscillation_threshold")]
    pub oscillation_threshold_watts: i16,

    /// Initial length of a fix, in seconds.
    #[serde(default = "default_fix_timeout")]
    pub fix_timeout_secs: u64,

    /// Longest a fix may last, in seconds.
    #[serde(default = "default_max_fix_timeout")]
    pub max_fix_timeout_secs: u64,

    /// A new fix this soon after the previous one doubles the fix length.
    #[serde(default = "default_relax")]
    pub relax_secs: u64,

    /// Output limit written while the fix is active.
    #[serde(default = "default_power_limited")]
    pub power_limited: u16,

    /// Output limit restored when the fix ends.
    #[serde(default = "default_power_nominal")]
    pub power_nominal: u16,

    /// Delay between polls, in seconds.
    #[serde(default = "default_poll_delay")]
    pub poll_delay_secs: u64,

    /// Delay between polls while photovoltaic power is marginal.
    #[serde(default = "default_short_poll_delay")]
    pub short_poll_delay_secs: u64,

    /// Loop resolution, in milliseconds.
    #[serde(default = "default_tick_millis")]
    pub tick_millis: u64,
}

fn default_pv_threshold() -> i16 {
    250
}

fn default_backup_threshold() -> u16 {
    150
}

fn default_oscillation_threshold() -> i16 {
    500
}

fn default_fix_timeout() -> u64 {
    300
}

fn default_max_fix_timeout() -> u64 {
    1800
}

fn default_relax() -> u64 {
    300
}

fn default_power_limited() -> u16 {
    100
}

fn default_power_nominal() -> u16 {
    6000
}

fn default_poll_delay() -> u64 {
    30
}

fn default_short_poll_delay() -> u64 {
    5
}

fn default_tick_millis() -> u64 {
    1000
}

impl Default for FixOscSettings {
    fn default() -> Self {
        Self {
            pv_threshold_watts: default_pv_threshold(),
            backup_threshold_watts: default_backup_threshold(),
            oscillation_threshold_watts: default_oscillation_threshold(),
            fix_timeout_secs: default_fix_timeout(),
            max_fix_timeout_secs: default_max_fix_timeout(),
            relax_secs: default_relax(),
            power_limited: default_power_limited(),
            power_nominal: default_power_nominal(),
            poll_delay_secs: default_poll_delay(),
            short_poll_delay_secs: default_short_poll_delay(),
            tick_millis: default_tick_millis(),
        }
    }
}

impl FixOscSettings {
    pub fn fix_timeout(&self) -> Duration {
        Duration::from_secs(self.fix_timeout_secs)
    }

    pub fn max_fix_timeout(&self) -> Duration {
        Duration::from_secs(self.max_fix_timeout_secs)
    }

    pub fn relax(&self) -> Duration {
        Duration::from_secs(self.relax_secs)
    }

    pub fn poll_delay(&self) -> Duration {
        Duration::from_secs(self.poll_delay_secs)
    }

    pub fn short_poll_delay(&self) -> Duration {
        Duration::from_secs(self.short_poll_delay_secs)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_millis)
    }

    fn validate(&self) -> Result<()> {
        if self.fix_timeout_secs == 0 || self.fix_timeout_secs > self.max_fix_timeout_secs {
            return Err(ToolError::validation(format!(
                "fix_timeout_secs must be 1-{} (max_fix_timeout_secs)",
                self.max_fix_timeout_secs
            )));
        }
        if self.oscillation_threshold_watts < 0 {
            return Err(ToolError::validation(
                "oscillation_threshold_watts cannot be negative",
            ));
        }
        if self.tick_millis == 0 {
            return Err(ToolError::validation("tick_millis must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config: FixOscConfig = saj_common::parse_config(
            r#"{ device: { serial: "H1S267K2429B029410" } }"#,
        )
        .unwrap();

        assert_eq!(config.base.device.serial, "H1S267K2429B029410");
        assert_eq!(config.fix_osc, FixOscSettings::default());
        assert_eq!(config.fix_osc.fix_timeout(), Duration::from_secs(300));
        assert_eq!(config.fix_osc.power_limited, 100);
        assert_eq!(config.fix_osc.power_nominal, 6000);
        assert!(ToolConfig::validate(&config).is_ok());
    }

    #[test]
    fn test_overrides() {
        let config: FixOscConfig = saj_common::parse_config(
            r#"{
                mqtt: { host: "192.168.1.30" },
                fix_osc: { fix_timeout_secs: 120, poll_delay_secs: 10 },
            }"#,
        )
        .unwrap();

        assert_eq!(config.base.mqtt.host, "192.168.1.30");
        assert_eq!(config.fix_osc.fix_timeout_secs, 120);
        assert_eq!(config.fix_osc.poll_delay(), Duration::from_secs(10));
        assert_eq!(config.fix_osc.max_fix_timeout_secs, 1800);
    }

    #[test]
    fn test_validate_fix_timeout_bounds() {
        let mut config = FixOscConfig::default();
        config.fix_osc.fix_timeout_secs = 3600;
        assert!(matches!(
            ToolConfig::validate(&config),
            Err(ToolError::ConfigValidation(_))
        ));

        config.fix_osc.fix_timeout_secs = 0;
        assert!(ToolConfig::validate(&config).is_err());
    }
}
