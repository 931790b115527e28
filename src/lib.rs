//! SetuLink - editor messaging endpoint for a creative-tool host
//!
//! Embeds a small datagram endpoint inside a host application so external
//! editor tooling can drive it: play-state control, asset refresh, test
//! discovery and execution, and host-event broadcasts.
//!
//! ## Protocol Architecture
//!
//! - **UDP (port 56000 + pid % 1000)**: all request/reply and broadcast
//!   traffic, one message per datagram (fire-and-forget)
//! - **TCP (ephemeral, localhost)**: one-shot streaming fallback for frames
//!   too large for a datagram; announced via a `Tcp` control message
//!
//! Incoming datagrams are queued by a dedicated receive thread and drained
//! by a single-threaded dispatch loop ticked from the host's update cycle,
//! so host state is only ever touched from one thread.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod host;
pub mod protocol;
pub mod registry;
pub mod transport;

// Re-export commonly used types
pub use config::AppConfig;
pub use dispatch::{DispatchSnapshot, MessageLoop};
pub use error::{Error, Result};
pub use host::{HostControl, LogLevel, TestAdapter, TestEventSink, TestFilter, TestMode};
pub use protocol::{Message, MessageKind};
