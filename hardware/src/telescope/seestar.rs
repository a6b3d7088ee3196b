//! Adapter for the smart-telescope protocol client.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use shared::DeviceConfig;
use tracing::{info, warn};

use super::{Capabilities, TelescopeAdapter};
use crate::seestar::{
    ClientConfig, ClientResult, Coordinates, DeviceStatus, ExposureRequest, ProtocolClient,
};

/// [`TelescopeAdapter`] over a [`ProtocolClient`].
///
/// Vendor states are already normalized by the client's status cell (see
/// [`VendorState`](crate::seestar::VendorState)); unknown states surface as
/// `ERROR`.
pub struct SeestarAdapter {
    client: ProtocolClient,
    capabilities: Capabilities,
    connect_timeout: Duration,
    endpoint: Option<(String, u16)>,
}

impl SeestarAdapter {
    pub const KIND: &'static str = "seestar";

    pub fn new(config: &DeviceConfig) -> Self {
        let client = ProtocolClient::new(ClientConfig {
            command_timeout: config.command_timeout(),
            client_name: config.client_name.clone(),
        });

        let mut extras = BTreeMap::new();
        extras.insert("dewHeater".to_string(), json!(true));
        extras.insert("stackedImage".to_string(), json!(true));
        extras.insert("systemInfo".to_string(), json!(true));

        Self {
            client,
            capabilities: Capabilities {
                autofocus: true,
                filter_wheel: true,
                plate_solving: true,
                guiding: false,
                extras,
            },
            connect_timeout: config.connect_timeout(),
            endpoint: None,
        }
    }

    /// Direct access to the underlying client.
    pub fn client(&self) -> &ProtocolClient {
        &self.client
    }

    /// Log and absorb a client error.
    fn absorb<T>(operation: &str, result: ClientResult<T>) -> bool {
        match result {
            Ok(_) => true,
            Err(e) => {
                warn!("{operation} failed: {e}");
                false
            }
        }
    }
}

#[async_trait]
impl TelescopeAdapter for SeestarAdapter {
    fn kind(&self) -> &str {
        Self::KIND
    }

    fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    async fn connect(&mut self, host: &str, port: u16) -> bool {
        self.endpoint = Some((host.to_string(), port));
        let result = self.client.connect(host, port, self.connect_timeout).await;
        Self::absorb("connect", result)
    }

    async fn reconnect(&mut self) -> bool {
        let Some((host, port)) = self.endpoint.clone() else {
            warn!("reconnect requested before any connect");
            return false;
        };
        info!("Reconnecting to {host}:{port}");
        let result = self.client.connect(&host, port, self.connect_timeout).await;
        Self::absorb("reconnect", result)
    }

    async fn disconnect(&mut self) -> bool {
        self.client.disconnect().await;
        true
    }

    fn get_status(&self) -> DeviceStatus {
        self.client.status()
    }

    async fn goto(&self, coordinates: Coordinates, target_name: &str) -> bool {
        Self::absorb("goto", self.client.goto(coordinates, target_name).await)
    }

    async fn autofocus(&self) -> bool {
        Self::absorb("autofocus", self.client.autofocus().await)
    }

    async fn start_exposure(&self, request: &ExposureRequest) -> bool {
        Self::absorb("startExposure", self.client.start_exposure(request).await)
    }

    async fn stop_exposure(&self) -> bool {
        Self::absorb("stopExposure", self.client.stop_exposure().await)
    }

    async fn park(&self) -> bool {
        Self::absorb("park", self.client.park().await)
    }

    async fn query_extra(&self, key: &str) -> Option<Value> {
        match key {
            "stackedImage" => self.client.get_stacked_image().await.ok(),
            "systemInfo" => self
                .client
                .get_system_info()
                .await
                .ok()
                .and_then(|info| serde_json::to_value(info).ok()),
            _ => self.client.status().extras.get(key).cloned(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failures_become_false() {
        let adapter = SeestarAdapter::new(&DeviceConfig::default());

        assert!(!adapter.goto(Coordinates::new(1.0, 2.0), "M1").await);
        assert!(!adapter.autofocus().await);
        assert!(!adapter.stop_exposure().await);
        assert!(!adapter.park().await);
        assert!(adapter.query_extra("stackedImage").await.is_none());
        assert!(adapter.query_extra("battery").await.is_none());
    }

    #[tokio::test]
    async fn test_reconnect_without_endpoint_fails() {
        let mut adapter = SeestarAdapter::new(&DeviceConfig::default());
        assert!(!adapter.reconnect().await);
        assert!(adapter.disconnect().await);
    }
}
