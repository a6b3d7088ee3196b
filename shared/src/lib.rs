//! Shared configuration for the smart-telescope workspace.
//!
//! - [`config_storage`] - on-disk config root (`~/.seestar_config`) and recordings
//! - [`observatory_config`] - device, execution, and imaging settings
//! - [`context`] - the context object handed to every component

pub mod config_storage;
pub mod context;
pub mod observatory_config;

pub use config_storage::{ConfigError, ConfigStorage};
pub use context::ObservatoryContext;
pub use observatory_config::{
    DeviceConfig, ExecutionConfig, ImagingDefaults, ObservatoryConfig, DEFAULT_DEVICE_PORT,
};
