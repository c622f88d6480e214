//! BLE (Bluetooth Low Energy) transport
//!
//! - **bridge**: the platform radio contract (advertise, scan, connect, write)
//! - **transport**: [`BleTransport`], the mesh transport built on top of it
//!
//! The platform side (Swift/Kotlin) owns the actual radio. Everything here
//! is testable without BLE hardware.

pub mod bridge;
pub mod transport;

pub use bridge::BlePlatformBridge;
pub use transport::{BleConfig, BleTransport, DEFAULT_MAX_OUTSTANDING_WRITES};
