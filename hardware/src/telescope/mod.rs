//! Generic telescope interface.
//!
//! [`TelescopeAdapter`] is the device contract the sequencer drives. Every
//! mutating call reports a plain `bool`: implementations log and absorb their
//! own errors so nothing escapes past the adapter boundary.
//!
//! Concrete adapters are selected by kind through [`AdapterRegistry`].

mod seestar;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use shared::DeviceConfig;
use thiserror::Error;

use crate::seestar::{Coordinates, DeviceStatus, ExposureRequest};

pub use self::seestar::SeestarAdapter;

/// What an adapter's hardware can do.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Capabilities {
    pub autofocus: bool,
    pub filter_wheel: bool,
    pub plate_solving: bool,
    pub guiding: bool,
    /// Vendor-specific features, readable through [`TelescopeAdapter::query_extra`]
    pub extras: BTreeMap<String, Value>,
}

/// Generic telescope contract.
#[async_trait]
pub trait TelescopeAdapter: Send + Sync {
    /// Registry key of this adapter
    fn kind(&self) -> &str;

    fn capabilities(&self) -> &Capabilities;

    async fn connect(&mut self, host: &str, port: u16) -> bool;

    /// Re-dial the last endpoint passed to [`connect`](Self::connect).
    async fn reconnect(&mut self) -> bool;

    async fn disconnect(&mut self) -> bool;

    /// Latest status snapshot; never blocks.
    fn get_status(&self) -> DeviceStatus;

    async fn goto(&self, coordinates: Coordinates, target_name: &str) -> bool;

    async fn autofocus(&self) -> bool;

    async fn start_exposure(&self, request: &ExposureRequest) -> bool;

    async fn stop_exposure(&self) -> bool;

    async fn park(&self) -> bool;

    /// Side channel into vendor-specific data.
    async fn query_extra(&self, key: &str) -> Option<Value>;
}

/// No adapter registered under the requested kind.
#[derive(Error, Debug)]
#[error("No telescope adapter registered for kind {0:?}")]
pub struct UnknownAdapterKind(pub String);

/// Builds an adapter from device config.
pub type AdapterFactory = Box<dyn Fn(&DeviceConfig) -> Box<dyn TelescopeAdapter> + Send + Sync>;

/// Type-keyed table of adapter factories.
pub struct AdapterRegistry {
    factories: BTreeMap<String, AdapterFactory>,
}

impl AdapterRegistry {
    /// Registry with no adapters.
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry with every built-in adapter.
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(SeestarAdapter::KIND, |config| {
            Box::new(SeestarAdapter::new(config))
        });
        registry
    }

    /// Register (or replace) the factory for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn(&DeviceConfig) -> Box<dyn TelescopeAdapter> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_string(), Box::new(factory));
    }

    pub fn kinds(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Build the adapter named by `config.kind`.
    pub fn create(
        &self,
        config: &DeviceConfig,
    ) -> Result<Box<dyn TelescopeAdapter>, UnknownAdapterKind> {
        self.factories
            .get(&config.kind)
            .map(|factory| factory(config))
            .ok_or_else(|| UnknownAdapterKind(config.kind.clone()))
    }
}

impl Default for AdapterRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}
