//! Self-organizing tree-mesh node that fronts a Nix binary cache.
//!
//! One node per device. Whoever can see the upstream router becomes the
//! root and forwards cache requests to the internet; every other node
//! relays its requests to its mesh parent, so a single uplink serves the
//! whole tree. Peer latency is tracked with a tiny ping/pong protocol.

pub mod config;
pub mod packet;
pub mod peers;
pub mod proxy;
pub mod telemetry;
pub mod topology;
pub mod transport;
