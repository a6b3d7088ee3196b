//! Typed command wrappers over [`ProtocolClient::send`].
//!
//! Each verb is a thin wrapper that builds the params object and turns a
//! non-zero result code into [`ClientError::Command`].

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use super::client::{ClientError, ClientResult, ProtocolClient};
use super::protocol::INVALID_PARAMS_CODE;

/// Equatorial coordinates (J2000).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Coordinates {
    /// Right ascension in hours, [0, 24)
    pub ra_hours: f64,
    /// Declination in degrees, [-90, 90]
    pub dec_degrees: f64,
}

impl Coordinates {
    pub fn new(ra_hours: f64, dec_degrees: f64) -> Self {
        Self {
            ra_hours,
            dec_degrees,
        }
    }

    pub fn is_valid(&self) -> bool {
        (0.0..24.0).contains(&self.ra_hours) && (-90.0..=90.0).contains(&self.dec_degrees)
    }
}

/// Parameters of one imaging run. Immutable once submitted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposureRequest {
    pub target_name: String,
    pub coordinates: Coordinates,
    /// Single sub-exposure length in seconds
    pub exposure_seconds: f64,
    pub gain: u32,
    pub binning: u32,
    pub filter: Option<String>,
    pub frame_count: u32,
    pub dither: bool,
}

impl ExposureRequest {
    /// Nominal wall time for all frames.
    pub fn total_seconds(&self) -> f64 {
        self.exposure_seconds * f64::from(self.frame_count)
    }

    fn to_params(&self) -> Value {
        json!({
            "targetName": self.target_name,
            "ra": self.coordinates.ra_hours,
            "dec": self.coordinates.dec_degrees,
            "exposureSeconds": self.exposure_seconds,
            "gain": self.gain,
            "binning": self.binning,
            "filter": self.filter,
            "frameCount": self.frame_count,
            "dither": self.dither,
        })
    }
}

/// Identification returned by `getSystemInfo`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SystemInfo {
    pub model: Option<String>,
    pub firmware_version: Option<String>,
    pub serial: Option<String>,
}

fn invalid(method: &str, message: String) -> ClientError {
    ClientError::Command {
        method: method.to_string(),
        code: INVALID_PARAMS_CODE,
        message,
    }
}

impl ProtocolClient {
    /// Slew to the given coordinates.
    pub async fn goto(&self, coordinates: Coordinates, target_name: &str) -> ClientResult<()> {
        if !coordinates.is_valid() {
            return Err(invalid(
                "goto",
                format!("coordinates out of range: {coordinates:?}"),
            ));
        }
        let params = json!({
            "ra": coordinates.ra_hours,
            "dec": coordinates.dec_degrees,
            "targetName": target_name,
        });
        self.call("goto", Some(params)).await.map(|_| ())
    }

    /// Start an imaging run.
    pub async fn start_exposure(&self, request: &ExposureRequest) -> ClientResult<()> {
        if request.exposure_seconds <= 0.0 || request.frame_count == 0 {
            return Err(invalid(
                "startExposure",
                format!(
                    "exposure {}s x {} frames is empty",
                    request.exposure_seconds, request.frame_count
                ),
            ));
        }
        self.call("startExposure", Some(request.to_params()))
            .await
            .map(|_| ())
    }

    pub async fn stop_exposure(&self) -> ClientResult<()> {
        self.call("stopExposure", None).await.map(|_| ())
    }

    pub async fn park(&self) -> ClientResult<()> {
        self.call("park", None).await.map(|_| ())
    }

    /// Run the device's autofocus routine.
    pub async fn autofocus(&self) -> ClientResult<()> {
        self.call("autofocus", None).await.map(|_| ())
    }

    /// Switch the dew heater; `power` is a percentage.
    pub async fn set_dew_heater(&self, enabled: bool, power: u8) -> ClientResult<()> {
        let params = json!({ "enabled": enabled, "power": power.min(100) });
        self.call("setDewHeater", Some(params)).await.map(|_| ())
    }

    /// Fetch the current stacked image descriptor as returned by the device.
    pub async fn get_stacked_image(&self) -> ClientResult<Value> {
        self.call("getStackedImage", None).await
    }

    pub async fn get_system_info(&self) -> ClientResult<SystemInfo> {
        let result = self.call("getSystemInfo", None).await?;
        serde_json::from_value(result).map_err(|e| ClientError::Command {
            method: "getSystemInfo".to_string(),
            code: super::protocol::MALFORMED_FRAME_CODE,
            message: format!("unexpected system info shape: {e}"),
        })
    }
}
