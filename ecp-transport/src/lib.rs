//! Transport layer module for the External Control Protocol client
//!
//! This crate provides byte-stream transports for TCP, UDP, and Serial
//! communication with ECP devices.

pub mod serial;
pub mod stream;
pub mod tcp;
pub mod udp;

pub use ecp_core::{EcpError, EcpResult};
pub use serial::{SerialSettings, SerialTransport};
pub use stream::{StreamAccessor, TransportLayer};
pub use tcp::{TcpSettings, TcpTransport};
pub use udp::{MAX_UDP_PAYLOAD_SIZE, UdpSettings, UdpTransport};
