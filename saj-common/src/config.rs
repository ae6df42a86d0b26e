use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{Error, Result};

/// Default MQTT broker port.
pub const DEFAULT_MQTT_PORT: u16 = 1883;

/// Default per-call timeout, in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// Default number of registers read by a single request.
pub const DEFAULT_MAX_REGISTERS_PER_REQUEST: u16 = 100;

/// Hard Modbus limit for a "read multiple registers" request (0x7b).
pub const MODBUS_MAX_READ_REGISTERS: u16 = 123;

/// Shortest keep-alive interval the MQTT client accepts.
pub const MIN_KEEP_ALIVE_SECS: u64 = 5;

/// Default Modbus slave address of the inverter.
pub const DEFAULT_SLAVE_ADDRESS: u8 = 1;

/// MQTT broker connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MqttConfig {
    /// Broker host name or IP address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Broker TCP port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Username passed through to the broker.
    #[serde(default = "default_username")]
    pub username: String,

    /// Password passed through to the broker.
    #[serde(default = "default_password")]
    pub password: String,

    /// Keep-alive interval in seconds.
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,

    /// QoS used when publishing requests (0, 1 or 2).
    #[serde(default = "default_qos")]
    pub qos: u8,

    /// Explicit client id. Generated from the process id when absent.
    #[serde(default)]
    pub client_id: Option<String>,
}

fn default_host() -> String {
    "localhost".to_string()
}

fn default_port() -> u16 {
    DEFAULT_MQTT_PORT
}

// The inverter's embedded broker accepts any credentials.
fn default_username() -> String {
    "empty_user".to_string()
}

fn default_password() -> String {
    "empty_pass".to_string()
}

fn default_keep_alive() -> u64 {
    60
}

fn default_qos() -> u8 {
    1
}

impl Default for MqttConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            username: default_username(),
            password: default_password(),
            keep_alive_secs: default_keep_alive(),
            qos: default_qos(),
            client_id: None,
        }
    }
}

impl MqttConfig {
    /// Apply a `host` or `host:port` broker address.
    pub fn set_address(&mut self, address: &str) -> Result<()> {
        match address.rsplit_once(':') {
            Some((host, port)) => {
                let port = port.parse::<u16>().map_err(|e| {
                    Error::Config(format!("Invalid broker port in '{}': {}", address, e))
                })?;
                self.host = host.to_string();
                self.port = port;
            }
            None => self.host = address.to_string(),
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::Config("MQTT host cannot be empty".to_string()));
        }
        if self.qos > 2 {
            return Err(Error::Config(format!(
                "Invalid MQTT qos {} (use 0, 1 or 2)",
                self.qos
            )));
        }
        if self.keep_alive_secs < MIN_KEEP_ALIVE_SECS {
            return Err(Error::Config(format!(
                "MQTT keep_alive_secs must be at least {}",
                MIN_KEEP_ALIVE_SECS
            )));
        }
        Ok(())
    }
}

/// Identity of the inverter being addressed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Inverter serial number, used to scope topic names.
    #[serde(default)]
    pub serial: String,

    /// Modbus slave address (1-247).
    #[serde(default = "default_slave_address")]
    pub slave_address: u8,
}

fn default_slave_address() -> u8 {
    DEFAULT_SLAVE_ADDRESS
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial: String::new(),
            slave_address: default_slave_address(),
        }
    }
}

impl DeviceConfig {
    fn validate(&self) -> Result<()> {
        if self.serial.is_empty() {
            return Err(Error::Config("Device serial cannot be empty".to_string()));
        }
        if !(1..=247).contains(&self.slave_address) {
            return Err(Error::Config(format!(
                "Invalid slave_address {} (must be 1-247)",
                self.slave_address
            )));
        }
        Ok(())
    }
}

/// Request timing and chunking settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestConfig {
    /// How long a `query`/`write` call waits for its responses.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,

    /// How long `connect` waits for the subscription to be acknowledged.
    #[serde(default = "default_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Largest register count sent in a single read request.
    #[serde(default = "default_max_registers")]
    pub max_registers_per_request: u16,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

fn default_max_registers() -> u16 {
    DEFAULT_MAX_REGISTERS_PER_REQUEST
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            timeout_secs: default_timeout_secs(),
            connect_timeout_secs: default_timeout_secs(),
            max_registers_per_request: default_max_registers(),
        }
    }
}

impl RequestConfig {
    /// Per-call timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Connection readiness timeout as a [`Duration`].
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn validate(&self) -> Result<()> {
        if self.timeout_secs == 0 || self.connect_timeout_secs == 0 {
            return Err(Error::Config(
                "Timeouts must be greater than zero".to_string(),
            ));
        }
        if !(1..=MODBUS_MAX_READ_REGISTERS).contains(&self.max_registers_per_request) {
            return Err(Error::Config(format!(
                "Invalid max_registers_per_request {} (must be 1-{})",
                self.max_registers_per_request, MODBUS_MAX_READ_REGISTERS
            )));
        }
        Ok(())
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

/// Base configuration shared by every tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BaseConfig {
    /// Broker connection settings.
    #[serde(default)]
    pub mqtt: MqttConfig,

    /// Inverter identity.
    #[serde(default)]
    pub device: DeviceConfig,

    /// Request timing and chunking.
    #[serde(default)]
    pub requests: RequestConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BaseConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<()> {
        self.mqtt.validate()?;
        self.device.validate()?;
        self.requests.validate()
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    let config = json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    tracing::debug!(path = %path.display(), "Loaded configuration");
    Ok(config)
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}
