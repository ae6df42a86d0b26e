//! CLI argument parsing for tools.

use std::path::PathBuf;

use clap::Args;

use saj_common::BaseConfig;

use crate::error::Result;

/// Common CLI arguments for all tools.
///
/// Every flag overrides the matching setting of the configuration file, so
/// a tool can run with no file at all given `--broker` and `--serial`.
/// Flatten into a tool's own parser with `#[command(flatten)]`.
#[derive(Args, Debug, Clone, Default)]
pub struct ToolArgs {
    /// Path to configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// MQTT broker address (host or host:port).
    #[arg(short, long, global = true)]
    pub broker: Option<String>,

    /// Inverter serial number.
    #[arg(short, long, global = true)]
    pub serial: Option<String>,

    /// Override log level (trace, debug, info, warn, error).
    #[arg(long, global = true)]
    pub log_level: Option<String>,
}

impl ToolArgs {
    /// Apply the command-line overrides to `config`.
    pub fn apply(&self, config: &mut BaseConfig) -> Result<()> {
        if let Some(ref broker) = self.broker {
            config.mqtt.set_address(broker)?;
        }
        if let Some(ref serial) = self.serial {
            config.device.serial = serial.clone();
        }
        if let Some(ref level) = self.log_level {
            config.logging.level = level.clone();
        }
        Ok(())
    }
}

/// Parse a register address or value, in decimal or `0x` hexadecimal.
pub fn parse_u16(s: &str) -> std::result::Result<u16, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16),
        None => s.parse::<u16>(),
    };
    parsed.map_err(|e| format!("invalid 16-bit number '{}': {}", s, e))
}
