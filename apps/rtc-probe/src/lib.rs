//! Two-party WebRTC data-channel probe: perfect negotiation over a broadcast
//! relay, then latency and bandwidth workloads on the resulting channels.

pub mod cli;
pub mod config;
pub mod negotiation;
pub mod peer;
pub mod probe;
pub mod signaling;
pub mod telemetry;
pub mod transport;
