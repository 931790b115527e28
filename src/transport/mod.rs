//! Datagram transport with streaming fallback for oversized payloads

pub mod fallback;
pub mod udp;

pub use udp::{TransportStats, UdpTransport};
