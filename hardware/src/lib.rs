//! Device drivers for smart telescopes.
//!
//! This crate provides the network side of remote telescope operation:
//!
//! - [`seestar`] - TCP protocol client: correlated commands, telemetry, status
//! - [`telescope`] - the generic [`TelescopeAdapter`](telescope::TelescopeAdapter)
//!   contract and the registry of concrete adapters
//! - [`recording`] - capture of real sessions and deterministic playback
//!
//! # Binaries
//!
//! - `session_tool` - record a live session, replay a recording, or probe a device

pub mod recording;
pub mod seestar;
pub mod telescope;
