//! Message codec: protocol lines to typed messages and back
//!
//! The line grammar differs between device families, so the codec is a trait
//! and the engine is generic over it. Two tables ship with the crate:
//! [`EcpCodec`] for the `<verb><address>[=<value>]` grammar and
//! [`SymNetCodec`] for SymNet control units.

pub mod ecp;
pub mod symnet;

pub use ecp::EcpCodec;
pub use symnet::SymNetCodec;

use ecp_core::{Command, CorrelationKey, EcpResult, ParameterAddress};
use std::fmt;

/// Decoded form of one received line
///
/// Produced by [`LineCodec::decode`] and consumed immediately by the engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolLine {
    /// Reply to a request, correlated by kind and address
    Response {
        key: CorrelationKey,
        value: Option<i32>,
    },
    /// Acknowledgement that does not name the request it answers
    Ack,
    /// Unsolicited change of a subscribed parameter
    Push {
        address: ParameterAddress,
        value: i32,
    },
    /// Explicit error reported by the device
    Error { code: u16, message: String },
    /// Anything the codec could not classify
    Unrecognized(String),
}

impl ProtocolLine {
    /// Category name used in logs and statistics
    pub fn category(&self) -> &'static str {
        match self {
            ProtocolLine::Response { .. } => "response",
            ProtocolLine::Ack => "ack",
            ProtocolLine::Push { .. } => "push",
            ProtocolLine::Error { .. } => "error",
            ProtocolLine::Unrecognized(_) => "unrecognized",
        }
    }
}

/// Encoding table for one device family
pub trait LineCodec: Send + Sync + fmt::Debug {
    /// Produce the request line for `command`, without terminator
    ///
    /// # Errors
    /// `EcpError::InvalidData` if the command cannot be expressed by this
    /// table (e.g. a channel on a device without channels)
    fn encode(&self, command: &Command) -> EcpResult<String>;

    /// Classify a received line
    ///
    /// Never fails: malformed input maps to [`ProtocolLine::Unrecognized`].
    fn decode(&self, line: &str) -> ProtocolLine;

    /// Short table name for logs
    fn name(&self) -> &'static str;
}

/// Format a value as plain signed decimal
pub fn format_value(value: i32) -> String {
    value.to_string()
}

/// Format a value as zero-padded signed decimal of `width` characters
///
/// The sign counts towards the width, so `-20` at width 5 is `-0020`.
pub fn format_fixed_width(value: i32, width: usize) -> String {
    format!("{:0width$}", value, width = width)
}

/// Parse a signed decimal value, accepting a leading `+` and zero padding
pub fn parse_value(text: &str) -> Option<i32> {
    let digits = text.strip_prefix(&['+', '-'][..]).unwrap_or(text);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    text.parse::<i32>().ok()
}
