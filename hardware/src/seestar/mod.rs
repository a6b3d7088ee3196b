//! Smart-telescope control protocol: wire codec, client, and typed verbs.
mod client;
mod commands;
pub mod protocol;
mod status;

pub use client::{ClientConfig, ClientError, ClientResult, ProtocolClient, DEFAULT_COMMAND_TIMEOUT};
pub use commands::{Coordinates, ExposureRequest, SystemInfo};
pub use status::{ConnectionState, DeviceStatus, VendorState};
