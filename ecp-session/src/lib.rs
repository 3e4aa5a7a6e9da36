//! Session layer module for the External Control Protocol client
//!
//! This crate turns the raw byte stream into protocol messages: line
//! framing, the pluggable command codecs, the connection state machine and
//! the protocol counters.

pub mod codec;
pub mod framer;
pub mod state;
pub mod statistics;

pub use codec::{EcpCodec, LineCodec, ProtocolLine, SymNetCodec};
pub use ecp_core::{EcpError, EcpResult};
pub use framer::{DEFAULT_MAX_LINE_LENGTH, LineFramer, Lines};
pub use state::ConnectionState;
pub use statistics::{ProtocolStatistics, StatisticsSnapshot};
