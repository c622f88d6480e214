//! Routing engine: controlled flooding with gossip subsets
//!
//! Per message in flight:
//! `received -> duplicate? -> ttl expired? -> for us? -> forward decision`
//!
//! - [`DedupCache`]: bounded recency record of `(source_id, sequence)` pairs
//! - [`select_forwarding_set`]: flood small neighbourhoods, gossip to the
//!   best-scored half of dense ones
//! - [`RoutingEngine`]: the state machine tying both together

pub mod dedup;
pub mod engine;
pub mod forwarding;

pub use dedup::DedupCache;
pub use engine::{Forward, RoutingDecision, RoutingEngine};
pub use forwarding::{select_forwarding_set, ForwardingStrategy};
