//! ecp - Rust client for the External Control Protocol
//!
//! Networked audio DSPs expose their parameters (gains, mutes, routing
//! points) through a line-based ASCII protocol. This library keeps one
//! long-lived connection per device, pairs requests with replies while push
//! lines are interleaved, and survives connection loss by reconnecting and
//! restoring subscriptions.
//!
//! # Architecture
//!
//! This library is organized as a workspace with multiple crates:
//!
//! - `ecp-core`: Error handling, parameter addresses, the command model
//! - `ecp-transport`: Transport layer (TCP, UDP, Serial)
//! - `ecp-session`: Line framing, command codecs, state machine, statistics
//! - `ecp-client`: Pending-request table, subscriptions, connection
//!   manager and the protocol engine
//!
//! # Usage
//!
//! ```no_run
//! use ecp::client::EngineBuilder;
//! use ecp::ParameterAddress;
//!
//! # async fn demo() -> ecp::EcpResult<()> {
//! let engine = EngineBuilder::new().tcp("192.168.1.20", 48631).build()?;
//! engine.connect().await?;
//! let value = engine.get_value(ParameterAddress::new(12)).await?;
//! # let _ = value;
//! # Ok(())
//! # }
//! ```

// Re-export core types
pub use ecp_core::{
    Command, CommandKind, CorrelationKey, EcpError, EcpResult, ErrorKind, ParameterAddress,
};

// Re-export the engine API
pub use ecp_client::{EngineBuilder, ProtocolEngine, SubscriptionEvent, SubscriptionHandle};

pub mod client {
    pub use ecp_client::*;
}

pub mod session {
    pub use ecp_session::*;
}

pub mod transport {
    pub use ecp_transport::*;
}
