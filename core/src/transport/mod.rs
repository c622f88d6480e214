// Transport module: radio-specific links behind one contract, and the
// selector that picks between them per send

pub mod abstraction;
pub mod advertisement;
pub mod ble;
pub mod local;
pub mod selector;
pub mod stream;
pub mod wifi_aware;

pub use abstraction::{
    DiscoveryEvent, DiscoveryStream, FrameStream, InboundFrame, LinkTarget, MeshTransport,
    TransportCapabilities, TransportError, TransportType,
};
pub use advertisement::{Advertisement, SERVICE_ID};
pub use ble::{BleConfig, BlePlatformBridge, BleTransport};
pub use local::{LocalMedium, LocalTransport};
pub use selector::{SelectorError, TransportSelector};
pub use wifi_aware::{
    DataPathInfo, DiscoveredPeer, WifiAwareConfig, WifiAwarePlatformBridge, WifiAwareState,
    WifiAwareTransport,
};
