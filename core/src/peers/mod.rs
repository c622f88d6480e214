//! Peer registry
//!
//! The table of directly reachable peers, fed by discovery events and read by
//! the routing engine when it picks a forwarding set.

pub mod registry;

pub use registry::{LinkInfo, Peer, PeerEvent, PeerRegistry};
