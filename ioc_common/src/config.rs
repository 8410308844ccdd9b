//! Configuration loading traits and types.
//!
//! All IOC processes load TOML configuration the same way: an `ioc.toml`
//! with process-level settings plus a `devices.toml` describing the
//! power supplies on the serial bus. Parsing and semantic validation are
//! separate steps so error messages point at the right layer.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::csdev::OpModeTable;

/// Error type for configuration loading operations.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at specified path.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),

    /// TOML parsing failed.
    #[error("failed to parse configuration: {0}")]
    ParseError(String),

    /// Semantic validation failed.
    #[error("configuration validation failed: {0}")]
    ValidationError(String),
}

/// Log level for application logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    /// Filter directive string for `tracing_subscriber::EnvFilter`.
    pub fn as_directive(&self) -> &'static str {
        match self {
            Self::Trace => "trace",
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warn => "warn",
            Self::Error => "error",
        }
    }
}

/// Trait for loading configuration from TOML files.
///
/// # Contract
///
/// - Returns [`ConfigError::FileNotFound`] if the file does not exist
/// - Returns [`ConfigError::ParseError`] if TOML syntax is invalid
/// - Semantic validation is the caller's next step (`validate()`)
pub trait ConfigLoader: Sized + serde::de::DeserializeOwned {
    /// Load configuration from a TOML file.
    fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }
        let content =
            fs::read_to_string(path).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }
}

// ─── Process Configuration (ioc.toml) ───────────────────────────────

/// Serial line settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialConfig {
    /// Device file of the RS-485 adapter.
    #[serde(default = "SerialConfig::default_device")]
    pub device: String,
    /// Per-exchange timeout in milliseconds.
    #[serde(default = "SerialConfig::default_timeout_ms")]
    pub timeout_ms: u64,
    /// Retries per exchange before a device is marked disconnected.
    #[serde(default = "SerialConfig::default_retries")]
    pub retries: u8,
    /// Backoff between retries in milliseconds.
    #[serde(default = "SerialConfig::default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
}

impl SerialConfig {
    fn default_device() -> String {
        "/dev/ttyUSB0".to_string()
    }
    fn default_timeout_ms() -> u64 {
        100
    }
    fn default_retries() -> u8 {
        3
    }
    fn default_retry_backoff_ms() -> u64 {
        10
    }
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: Self::default_device(),
            timeout_ms: Self::default_timeout_ms(),
            retries: Self::default_retries(),
            retry_backoff_ms: Self::default_retry_backoff_ms(),
        }
    }
}

/// Process-level IOC configuration (`ioc.toml`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IocConfig {
    /// Application instance identifier, used as the PV name prefix
    /// section for diagnostics.
    pub service_name: String,

    /// Logging verbosity level.
    #[serde(default)]
    pub log_level: LogLevel,

    /// Main-loop scan interval in seconds.
    #[serde(default = "IocConfig::default_scan_interval_s")]
    pub scan_interval_s: f64,

    /// Serial line settings.
    #[serde(default)]
    pub serial: SerialConfig,
}

impl IocConfig {
    fn default_scan_interval_s() -> f64 {
        0.1
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - `service_name` is empty
    /// - the scan interval is outside [0.001, 10] seconds
    /// - the serial timeout is zero
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.service_name.is_empty() {
            return Err(ConfigError::ValidationError(
                "service_name cannot be empty".to_string(),
            ));
        }
        if !(0.001..=10.0).contains(&self.scan_interval_s) {
            return Err(ConfigError::ValidationError(format!(
                "scan_interval_s {} outside [0.001, 10]",
                self.scan_interval_s
            )));
        }
        if self.serial.timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "serial.timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

impl ConfigLoader for IocConfig {}

// ─── Device Configuration (devices.toml) ────────────────────────────

/// One power supply on the bus.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Device name, used as the PV prefix (`<name>:<property>`).
    pub name: String,
    /// BSMP slave address, unique per bus segment.
    pub address: u8,
    /// Power-supply type key, indexes the waveform tolerance table.
    pub pstype: String,
}

/// Device list plus type-level tables (`devices.toml`).
#[derive(Debug, Clone, Deserialize)]
pub struct DevicesConfig {
    /// Power supplies served by this IOC.
    pub devices: Vec<DeviceConfig>,

    /// Waveform-deviation tolerance per power-supply type.
    #[serde(default)]
    pub wfm_tolerance: HashMap<String, f64>,

    /// Operating-mode index translation table override.
    #[serde(default)]
    pub opmode: OpModeTable,
}

impl DevicesConfig {
    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if:
    /// - no devices are configured
    /// - a device name is empty or duplicated
    /// - a bus address is duplicated
    /// - a tolerance entry is not positive
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.devices.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one device must be configured".to_string(),
            ));
        }
        for (i, dev) in self.devices.iter().enumerate() {
            if dev.name.is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "device {i} has an empty name"
                )));
            }
            for other in &self.devices[i + 1..] {
                if other.name == dev.name {
                    return Err(ConfigError::ValidationError(format!(
                        "duplicate device name '{}'",
                        dev.name
                    )));
                }
                if other.address == dev.address {
                    return Err(ConfigError::ValidationError(format!(
                        "devices '{}' and '{}' share bus address {}",
                        dev.name, other.name, dev.address
                    )));
                }
            }
        }
        for (pstype, tol) in &self.wfm_tolerance {
            if *tol <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "wfm_tolerance for '{pstype}' must be positive, got {tol}"
                )));
            }
        }
        Ok(())
    }
}

impl ConfigLoader for DevicesConfig {}

/// Everything a soft IOC needs at startup.
#[derive(Debug, Clone)]
pub struct FullConfig {
    pub ioc: IocConfig,
    pub devices: DevicesConfig,
}

/// Load and validate `ioc.toml` + `devices.toml` from a directory.
pub fn load_config_dir(dir: &Path) -> Result<FullConfig, ConfigError> {
    let ioc = IocConfig::load(&dir.join("ioc.toml"))?;
    ioc.validate()?;
    let devices = DevicesConfig::load(&dir.join("devices.toml"))?;
    devices.validate()?;
    info!(
        service = %ioc.service_name,
        devices = devices.devices.len(),
        "configuration loaded from {}",
        dir.display()
    );
    Ok(FullConfig { ioc, devices })
}
