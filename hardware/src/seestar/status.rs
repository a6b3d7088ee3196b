//! Device status snapshot and the vendor state mapping.
//!
//! The background reader is the only writer of [`DeviceStatus`]; it applies
//! command acknowledgements and telemetry frames here. Consumers only ever see
//! whole cloned snapshots.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::protocol::{Response, EVENT_MARKER};

/// Generic connection/activity state of a telescope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Slewing,
    Tracking,
    Exposing,
    Error,
    Parked,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "DISCONNECTED",
            ConnectionState::Connecting => "CONNECTING",
            ConnectionState::Connected => "CONNECTED",
            ConnectionState::Slewing => "SLEWING",
            ConnectionState::Tracking => "TRACKING",
            ConnectionState::Exposing => "EXPOSING",
            ConnectionState::Error => "ERROR",
            ConnectionState::Parked => "PARKED",
        };
        f.write_str(name)
    }
}

/// State strings reported by the device firmware.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VendorState {
    Idle,
    Initializing,
    Moving,
    Tracking,
    Working,
    Closed,
    Offline,
    Fault,
    Unknown(String),
}

impl VendorState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "idle" | "ready" | "connected" => VendorState::Idle,
            "initializing" | "connecting" | "starting" => VendorState::Initializing,
            "moving" | "slewing" | "goto" => VendorState::Moving,
            "tracking" => VendorState::Tracking,
            "working" | "exposing" | "capturing" | "stacking" => VendorState::Working,
            "closed" | "parked" | "sleeping" => VendorState::Closed,
            "offline" | "disconnected" => VendorState::Offline,
            "fault" | "error" => VendorState::Fault,
            _ => VendorState::Unknown(raw.to_string()),
        }
    }
}

impl From<VendorState> for ConnectionState {
    fn from(state: VendorState) -> Self {
        match state {
            VendorState::Idle => ConnectionState::Connected,
            VendorState::Initializing => ConnectionState::Connecting,
            VendorState::Moving => ConnectionState::Slewing,
            VendorState::Tracking => ConnectionState::Tracking,
            VendorState::Working => ConnectionState::Exposing,
            VendorState::Closed => ConnectionState::Parked,
            VendorState::Offline => ConnectionState::Disconnected,
            // Unrecognized states must surface as errors, never as a quiet default
            VendorState::Fault | VendorState::Unknown(_) => ConnectionState::Error,
        }
    }
}

/// Most recently observed device information.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct DeviceStatus {
    pub connected: bool,
    pub state: ConnectionState,
    pub firmware_version: Option<String>,
    /// Right ascension in hours
    pub ra: Option<f64>,
    /// Declination in degrees
    pub dec: Option<f64>,
    /// Altitude in degrees
    pub alt: Option<f64>,
    /// Azimuth in degrees
    pub az: Option<f64>,
    pub tracking: bool,
    pub exposing: bool,
    /// Exposure progress in [0, 1]
    pub exposure_progress: f64,
    /// Temperature in degrees Celsius
    pub temperature: Option<f64>,
    pub last_error: Option<String>,
    /// Vendor-specific fields with no generic counterpart
    pub extras: BTreeMap<String, Value>,
}

impl DeviceStatus {
    /// Status while the transport is open but the handshake is pending.
    pub fn connecting() -> Self {
        Self {
            state: ConnectionState::Connecting,
            ..Default::default()
        }
    }

    /// Merge an unsolicited telemetry frame.
    pub fn apply_telemetry(&mut self, frame: &Map<String, Value>) {
        for (key, value) in frame {
            match key.as_str() {
                "state" => {
                    if let Some(raw) = value.as_str() {
                        self.apply_vendor_state(raw);
                    }
                }
                "ra" => self.ra = value.as_f64(),
                "dec" => self.dec = value.as_f64(),
                "alt" => self.alt = value.as_f64(),
                "az" => self.az = value.as_f64(),
                "temperature" | "temp" => self.temperature = value.as_f64(),
                "firmware" | "firmwareVersion" => {
                    self.firmware_version = value.as_str().map(str::to_string)
                }
                "error" => self.last_error = value.as_str().map(str::to_string),
                "progress" => {
                    if let Some(p) = value.as_f64() {
                        self.exposure_progress = p.clamp(0.0, 1.0);
                    }
                }
                // Explicit flags are applied after the state so they win
                "tracking" | "exposing" => {}
                EVENT_MARKER => {
                    self.extras.insert("event".to_string(), value.clone());
                }
                _ => {
                    self.extras.insert(key.clone(), value.clone());
                }
            }
        }

        if let Some(tracking) = frame.get("tracking").and_then(Value::as_bool) {
            self.tracking = tracking;
        }
        if let Some(exposing) = frame.get("exposing").and_then(Value::as_bool) {
            self.exposing = exposing;
        }
    }

    fn apply_vendor_state(&mut self, raw: &str) {
        let vendor = VendorState::parse(raw);
        if let VendorState::Unknown(ref name) = vendor {
            self.last_error = Some(format!("unrecognized device state {name:?}"));
        }
        self.extras
            .insert("vendorState".to_string(), Value::String(raw.to_string()));

        self.state = vendor.into();
        match self.state {
            ConnectionState::Tracking => self.tracking = true,
            ConnectionState::Exposing => self.exposing = true,
            ConnectionState::Slewing | ConnectionState::Parked => {
                self.tracking = false;
                self.exposing = false;
            }
            ConnectionState::Connected => self.exposing = false,
            _ => {}
        }
    }

    /// Apply the acknowledgement of a command this client sent.
    pub fn apply_ack(&mut self, method: &str, response: &Response) {
        if !response.is_success() {
            self.last_error = Some(format!("{method}: {}", response.error_message()));
            return;
        }

        match method {
            "verify" => {
                self.connected = true;
                self.state = ConnectionState::Connected;
                self.last_error = None;
            }
            "goto" => {
                self.state = ConnectionState::Slewing;
                self.tracking = false;
            }
            "startExposure" => {
                self.state = ConnectionState::Exposing;
                self.exposing = true;
                self.exposure_progress = 0.0;
            }
            "stopExposure" => {
                self.exposing = false;
                self.state = if self.tracking {
                    ConnectionState::Tracking
                } else {
                    ConnectionState::Connected
                };
            }
            "park" => {
                self.state = ConnectionState::Parked;
                self.tracking = false;
                self.exposing = false;
            }
            "getSystemInfo" => {
                let firmware = response
                    .result
                    .get("firmwareVersion")
                    .or_else(|| response.result.get("firmware_version"))
                    .and_then(Value::as_str);
                if let Some(fw) = firmware {
                    self.firmware_version = Some(fw.to_string());
                }
            }
            _ => {}
        }
    }
}
