//! The single physical connection to the control server.
//!
//! - [`client`]: outbound WebSocket, fixed-interval reconnect, reader and writer
//! - [`outbound`]: bounded FIFO feeding the writer; the only way to send

pub mod client;
pub mod outbound;

pub use client::{ConnectionState, TransportStats, Tunnel, TunnelSettings};
pub use outbound::Outbound;
