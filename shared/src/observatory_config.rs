//! Observatory configuration: which device to drive and how to drive it.
//!
//! Stored as `observatory.json` under the config root. Every field carries a
//! default so a partial file (or no file at all) still yields a usable config.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default TCP port of the smart-telescope control service.
pub const DEFAULT_DEVICE_PORT: u16 = 4700;

/// Top-level configuration for one telescope installation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct ObservatoryConfig {
    pub device: DeviceConfig,
    pub execution: ExecutionConfig,
    pub imaging: ImagingDefaults,
}

/// How to reach the device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Adapter registry key (e.g. `"seestar"`)
    pub kind: String,
    pub host: String,
    pub port: u16,
    pub connect_timeout_secs: f64,
    pub command_timeout_secs: f64,
    /// Name presented to the device during the handshake
    pub client_name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            kind: "seestar".to_string(),
            host: "192.168.1.100".to_string(),
            port: DEFAULT_DEVICE_PORT,
            connect_timeout_secs: 10.0,
            command_timeout_secs: 10.0,
            client_name: "sequencer".to_string(),
        }
    }
}

impl DeviceConfig {
    pub fn connect_timeout(&self) -> Duration {
        secs(self.connect_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        secs(self.command_timeout_secs)
    }
}

/// Retry, timeout, and parking policy for plan execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionConfig {
    /// Retries after the first failed attempt of a phase
    pub phase_retries: u32,
    pub retry_delay_secs: f64,
    pub phase_timeout_secs: f64,
    pub park_on_completion: bool,
    /// Reconnect attempts before a lost connection ends the run in ERROR
    pub reconnect_attempts: u32,
    /// Poll device status until the exposure finishes before moving on
    pub wait_for_exposure: bool,
    pub exposure_poll_secs: f64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            phase_retries: 2,
            retry_delay_secs: 5.0,
            phase_timeout_secs: 300.0,
            park_on_completion: true,
            reconnect_attempts: 1,
            wait_for_exposure: true,
            exposure_poll_secs: 2.0,
        }
    }
}

impl ExecutionConfig {
    pub fn retry_delay(&self) -> Duration {
        secs(self.retry_delay_secs)
    }

    pub fn phase_timeout(&self) -> Duration {
        secs(self.phase_timeout_secs)
    }

    pub fn exposure_poll_interval(&self) -> Duration {
        secs(self.exposure_poll_secs)
    }
}

/// Camera settings applied to every exposure unless a target overrides them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImagingDefaults {
    pub gain: u32,
    pub binning: u32,
    pub filter: Option<String>,
    pub dither: bool,
}

impl Default for ImagingDefaults {
    fn default() -> Self {
        Self {
            gain: 80,
            binning: 1,
            filter: None,
            dither: true,
        }
    }
}

/// Negative or NaN values clamp to zero, oversized ones to `Duration::MAX`.
fn secs(value: f64) -> Duration {
    if value.is_nan() || value <= 0.0 {
        Duration::ZERO
    } else {
        Duration::try_from_secs_f64(value).unwrap_or(Duration::MAX)
    }
}
