// BLE platform bridge
//
// Implemented by platform code. Callbacks are registered once by the
// transport and may fire from any thread.

use crate::transport::TransportError;
use async_trait::async_trait;

/// Advertisement seen: (device address, advertising data, rssi)
pub type AdvertisementCallback = Box<dyn Fn(String, Vec<u8>, i32) + Send + Sync>;

/// Data received: (device address, buffer, valid length)
///
/// Some radio stacks hand over a fixed-size buffer with trailing padding;
/// only the first `valid length` bytes are frame data.
pub type DataCallback = Box<dyn Fn(String, Vec<u8>, usize) + Send + Sync>;

/// Connection dropped: (device address)
pub type DisconnectCallback = Box<dyn Fn(String) + Send + Sync>;

/// Platform-specific BLE API abstraction
#[async_trait]
pub trait BlePlatformBridge: Send + Sync {
    /// Whether the adapter is powered on and permitted
    async fn is_powered_on(&self) -> Result<bool, TransportError>;

    /// Start advertising `data` as service data
    async fn start_advertising(&self, data: &[u8]) -> Result<(), TransportError>;

    async fn stop_advertising(&self) -> Result<(), TransportError>;

    async fn start_scanning(&self) -> Result<(), TransportError>;

    async fn stop_scanning(&self) -> Result<(), TransportError>;

    /// Connect to a device (no-op if already connected)
    async fn connect(&self, address: &str) -> Result<(), TransportError>;

    /// Write one frame to a connected device
    async fn write(&self, address: &str, data: &[u8]) -> Result<(), TransportError>;

    /// Negotiated payload size per write
    fn mtu(&self) -> usize;

    fn set_on_advertisement(&self, callback: AdvertisementCallback);

    fn set_on_data_received(&self, callback: DataCallback);

    fn set_on_disconnected(&self, callback: DisconnectCallback);
}
