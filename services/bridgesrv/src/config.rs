//! Service configuration
//!
//! Layered with figment, later layers win:
//! 1. built-in defaults
//! 2. YAML file (`--config`)
//! 3. environment, `BRIDGESRV_` prefix, `__` between section and key
//!    (e.g. `BRIDGESRV_SERIAL__BAUD_RATE=19200`)

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use errors::{config_error, BridgeError, BridgeResult};
use figment::{
    providers::{Env, Format, Serialized, Yaml},
    Figment,
};
use serde::{Deserialize, Serialize};

use crate::bridge::BridgeSettings;

/// Environment variable prefix
pub const ENV_PREFIX: &str = "BRIDGESRV_";

/// Root configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub network: NetworkConfig,
    pub serial: SerialConfig,
    pub bridge: EngineConfig,
    pub logging: LoggingConfig,
}

/// Modbus TCP server side
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub bind_address: String,
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:502".to_string(),
            max_connections: 8,
        }
    }
}

/// Serial line settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SerialConfig {
    /// Serial port path (e.g., "/dev/ttyUSB0", "COM1")
    pub port: String,
    pub baud_rate: u32,
    /// Data bits (5, 6, 7, 8)
    pub data_bits: u8,
    /// Stop bits (1, 2)
    pub stop_bits: u8,
    /// Parity ("None", "Even", "Odd")
    pub parity: String,
    /// Bus silence that terminates a frame, microseconds
    pub inter_frame_time_us: u64,
    /// How long the master waits for a reply before accepting the next send,
    /// kept below `bridge.response_timeout_ms`
    pub turnaround_timeout_ms: u64,
    /// Bound on writing one request to the port
    pub write_timeout_ms: u64,
    /// The transceiver reads back its own transmissions
    pub local_echo: bool,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 9600,
            data_bits: 8,
            stop_bits: 1,
            parity: "None".to_string(),
            inter_frame_time_us: 8000,
            turnaround_timeout_ms: 450,
            write_timeout_ms: 1000,
            local_echo: false,
        }
    }
}

impl SerialConfig {
    pub fn inter_frame_time(&self) -> Duration {
        Duration::from_micros(self.inter_frame_time_us)
    }

    pub fn turnaround_timeout(&self) -> Duration {
        Duration::from_millis(self.turnaround_timeout_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

/// Bridge engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue_capacity: usize,
    pub response_timeout_ms: u64,
    pub watchdog_timeout_ms: u64,
    pub tick_interval_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 4,
            response_timeout_ms: 500,
            watchdog_timeout_ms: 5000,
            tick_interval_ms: 1,
        }
    }
}

impl EngineConfig {
    pub fn settings(&self) -> BridgeSettings {
        BridgeSettings {
            queue_capacity: self.queue_capacity,
            response_timeout: Duration::from_millis(self.response_timeout_ms),
            watchdog_timeout: Duration::from_millis(self.watchdog_timeout_ms),
        }
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    /// Daily rolling log files go here when set
    pub dir: Option<PathBuf>,
    /// JSON lines in the log file
    pub json: bool,
    /// Address of the remote log mirror, disabled when unset
    pub telnet_bind: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            dir: None,
            json: false,
            telnet_bind: None,
        }
    }
}

impl BridgeConfig {
    /// Load defaults, then `path` (must exist when given), then environment
    pub fn load(path: Option<&Path>) -> BridgeResult<Self> {
        Self::load_with_env(path, ENV_PREFIX)
    }

    fn load_with_env(path: Option<&Path>, env_prefix: &str) -> BridgeResult<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(Self::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(config_error!("Config file not found: {}", path.display()));
            }
            figment = figment.merge(Yaml::file(path));
        }

        figment
            .merge(Env::prefixed(env_prefix).split("__"))
            .extract()
            .map_err(|e| config_error!("Failed to load config: {}", e))
    }

    pub fn validate(&self) -> BridgeResult<()> {
        self.bind_address()?;
        if self.network.max_connections == 0 {
            return Err(invalid("network.max_connections", "must be at least 1"));
        }

        let serial = &self.serial;
        if serial.port.is_empty() {
            return Err(invalid("serial.port", "cannot be empty"));
        }
        if serial.baud_rate == 0 {
            return Err(invalid("serial.baud_rate", "must be greater than zero"));
        }
        if ![5, 6, 7, 8].contains(&serial.data_bits) {
            return Err(invalid("serial.data_bits", "must be 5, 6, 7, or 8"));
        }
        if ![1, 2].contains(&serial.stop_bits) {
            return Err(invalid("serial.stop_bits", "must be 1 or 2"));
        }
        if !["None", "Even", "Odd"].contains(&serial.parity.as_str()) {
            return Err(invalid("serial.parity", "must be None, Even, or Odd"));
        }
        if serial.inter_frame_time_us == 0 {
            return Err(invalid("serial.inter_frame_time_us", "must be greater than zero"));
        }
        if serial.turnaround_timeout_ms == 0 {
            return Err(invalid("serial.turnaround_timeout_ms", "must be greater than zero"));
        }
        if serial.write_timeout_ms == 0 {
            return Err(invalid("serial.write_timeout_ms", "must be greater than zero"));
        }

        let engine = &self.bridge;
        if engine.queue_capacity == 0 {
            return Err(invalid("bridge.queue_capacity", "must be at least 1"));
        }
        if engine.response_timeout_ms == 0 {
            return Err(invalid("bridge.response_timeout_ms", "must be greater than zero"));
        }
        // The line must be free again once the engine gives up on a request
        if engine.response_timeout_ms <= serial.turnaround_timeout_ms {
            return Err(invalid(
                "bridge.response_timeout_ms",
                "must be longer than serial.turnaround_timeout_ms",
            ));
        }
        if engine.watchdog_timeout_ms <= engine.response_timeout_ms {
            return Err(invalid(
                "bridge.watchdog_timeout_ms",
                "must be longer than bridge.response_timeout_ms",
            ));
        }
        if engine.tick_interval_ms == 0 {
            return Err(invalid("bridge.tick_interval_ms", "must be greater than zero"));
        }

        if let Some(bind) = &self.logging.telnet_bind {
            parse_addr("logging.telnet_bind", bind)?;
        }
        Ok(())
    }

    pub fn bind_address(&self) -> BridgeResult<SocketAddr> {
        parse_addr("network.bind_address", &self.network.bind_address)
    }

    pub fn telnet_address(&self) -> BridgeResult<Option<SocketAddr>> {
        self.logging
            .telnet_bind
            .as_deref()
            .map(|bind| parse_addr("logging.telnet_bind", bind))
            .transpose()
    }
}

fn invalid(field: &str, reason: &str) -> BridgeError {
    BridgeError::InvalidConfig {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

fn parse_addr(field: &str, value: &str) -> BridgeResult<SocketAddr> {
    value
        .parse()
        .map_err(|e| invalid(field, &format!("'{value}' is not a socket address: {e}")))
}
