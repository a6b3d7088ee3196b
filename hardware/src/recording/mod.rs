//! Capture and replay of real protocol sessions.
//!
//! [`SessionRecorder`] sits between a client and a real device, relaying every
//! frame while writing it down in arrival order. [`PlaybackServer`] loads such
//! a recording and plays the device side back, so the client and sequencer can
//! be exercised without hardware.
//!
//! # File format
//!
//! ```text
//! {
//!   "metadata": {"deviceLabel": "...", "host": "...", "port": 4700,
//!                "description": "...", "durationSeconds": 12.5},
//!   "interactions": [
//!     {"direction": "sent", "payload": {...}, "offsetSeconds": 0.01},
//!     {"direction": "received", "payload": {...}, "offsetSeconds": 0.02}
//!   ]
//! }
//! ```

mod playback;
mod recorder;

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub use playback::{PlaybackServer, RecordedReply, ResponseIndex};
pub use recorder::SessionRecorder;

/// Errors from recording and playback.
#[derive(Error, Debug)]
pub enum RecordingError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid recording: {0}")]
    Format(#[from] serde_json::Error),

    #[error("Already running on {0}")]
    AlreadyRunning(std::net::SocketAddr),
}

/// Which way a frame travelled, seen from the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Client to device
    Sent,
    /// Device to client
    Received,
}

/// One frame as observed on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordedInteraction {
    pub direction: Direction,
    pub payload: Value,
    /// Seconds since the recording started
    pub offset_seconds: f64,
}

/// Describes where and when a recording was made.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingMetadata {
    pub device_label: String,
    pub host: String,
    pub port: u16,
    pub description: String,
    pub duration_seconds: f64,
}

/// A complete recorded session.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionRecording {
    pub metadata: RecordingMetadata,
    pub interactions: Vec<RecordedInteraction>,
}

impl SessionRecording {
    /// Save to JSON file
    pub fn save_to_file(&self, path: &Path) -> Result<(), RecordingError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load from JSON file
    pub fn load_from_file(path: &Path) -> Result<Self, RecordingError> {
        let json = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&json)?)
    }
}

/// Decode a captured line. Non-JSON lines are kept verbatim as strings.
pub(crate) fn decode_frame(line: &str) -> Value {
    serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string()))
}
