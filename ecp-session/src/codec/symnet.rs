//! SymNet control unit command table
//!
//! SymNet DSPs expose their controls as numbered controllers with raw values
//! in `0..=65535`:
//!
//! - `GS2 <n>` reads a controller, answered by `<n> <value>`
//! - `CS <n> <value>` sets a controller, answered by `ACK`
//! - `PUE <n>` / `PUD <n>` enable/disable pushes, answered by `ACK`
//! - pushes arrive as `#NNNNN=VVVVV` with fixed-width fields
//! - any rejected command is answered by a bare `NAK`
//!
//! `ACK` and `NAK` carry no controller number, so the engine matches them
//! against the oldest outstanding request.

use super::{LineCodec, ProtocolLine, format_fixed_width, parse_value};
use ecp_core::{Command, CommandKind, CorrelationKey, EcpError, EcpResult, ParameterAddress};
use once_cell::sync::Lazy;
use regex::Regex;

/// Width of the controller and value fields in push lines
pub const PUSH_FIELD_WIDTH: usize = 5;

/// Largest raw controller value
pub const MAX_CONTROLLER_VALUE: i32 = 65535;

static PUSH_LINE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^#([0-9]{5})=(-?[0-9]{4,5})$").expect("push pattern is valid")
});

static GET_REPLY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^([0-9]{1,5}) (-?[0-9]{1,5})$").expect("get reply pattern is valid")
});

/// Codec for SymNet control units
#[derive(Debug, Clone, Copy, Default)]
pub struct SymNetCodec;

impl SymNetCodec {
    pub fn new() -> Self {
        Self
    }

    /// Format a push line the way the device sends it
    ///
    /// # Errors
    /// `EcpError::InvalidData` if the controller number or value do not fit
    /// the fixed-width fields
    pub fn encode_push(&self, address: ParameterAddress, value: i32) -> EcpResult<String> {
        let controller = Self::controller(&address)?;
        if controller > 99_999 || !(-9_999..=99_999).contains(&value) {
            return Err(EcpError::InvalidData(format!(
                "push {}={} does not fit the fixed-width fields",
                address, value
            )));
        }
        Ok(format!(
            "#{}={}",
            format_fixed_width(controller as i32, PUSH_FIELD_WIDTH),
            format_fixed_width(value, PUSH_FIELD_WIDTH)
        ))
    }

    fn controller(address: &ParameterAddress) -> EcpResult<u32> {
        if address.channel().is_some() {
            return Err(EcpError::InvalidData(format!(
                "SymNet controllers have no channels: {}",
                address
            )));
        }
        Ok(address.id())
    }

    fn capture_value(captures: &regex::Captures<'_>, index: usize) -> Option<i32> {
        parse_value(captures.get(index)?.as_str())
    }

    fn capture_address(captures: &regex::Captures<'_>, index: usize) -> Option<ParameterAddress> {
        captures
            .get(index)?
            .as_str()
            .parse::<u32>()
            .ok()
            .map(ParameterAddress::new)
    }
}

impl LineCodec for SymNetCodec {
    fn encode(&self, command: &Command) -> EcpResult<String> {
        let controller = Self::controller(&command.address())?;
        match command.kind() {
            CommandKind::Get => Ok(format!("GS2 {}", controller)),
            CommandKind::Set => {
                let value = command.value().ok_or_else(|| {
                    EcpError::InvalidData(format!("set {} without value", controller))
                })?;
                if !(0..=MAX_CONTROLLER_VALUE).contains(&value) {
                    return Err(EcpError::InvalidData(format!(
                        "controller value {} out of range 0..={}",
                        value, MAX_CONTROLLER_VALUE
                    )));
                }
                Ok(format!("CS {} {}", controller, value))
            }
            CommandKind::Subscribe => Ok(format!("PUE {}", controller)),
            CommandKind::Unsubscribe => Ok(format!("PUD {}", controller)),
        }
    }

    fn decode(&self, line: &str) -> ProtocolLine {
        let line = line.trim();
        match line {
            "ACK" => return ProtocolLine::Ack,
            "NAK" => {
                return ProtocolLine::Error {
                    code: 0,
                    message: "NAK".to_string(),
                };
            }
            _ => {}
        }

        if let Some(captures) = PUSH_LINE.captures(line) {
            if let (Some(address), Some(value)) = (
                Self::capture_address(&captures, 1),
                Self::capture_value(&captures, 2),
            ) {
                return ProtocolLine::Push { address, value };
            }
        }

        if let Some(captures) = GET_REPLY.captures(line) {
            if let (Some(address), Some(value)) = (
                Self::capture_address(&captures, 1),
                Self::capture_value(&captures, 2),
            ) {
                return ProtocolLine::Response {
                    key: CorrelationKey::new(CommandKind::Get, address),
                    value: Some(value),
                };
            }
        }

        ProtocolLine::Unrecognized(line.to_string())
    }

    fn name(&self) -> &'static str {
        "symnet"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(id: u32) -> ParameterAddress {
        ParameterAddress::new(id)
    }

    #[test]
    fn test_encode() {
        let codec = SymNetCodec::new();
        assert_eq!(codec.encode(&Command::get(addr(1))).unwrap(), "GS2 1");
        assert_eq!(codec.encode(&Command::set(addr(1), 65535)).unwrap(), "CS 1 65535");
        assert_eq!(codec.encode(&Command::subscribe(addr(1))).unwrap(), "PUE 1");
        assert_eq!(codec.encode(&Command::unsubscribe(addr(1))).unwrap(), "PUD 1");
    }

    #[test]
    fn test_encode_rejects_unrepresentable() {
        let codec = SymNetCodec::new();
        assert!(codec.encode(&Command::get(ParameterAddress::with_channel(1, 2))).is_err());
        assert!(codec.encode(&Command::set(addr(1), 65536)).is_err());
        assert!(codec.encode(&Command::set(addr(1), -1)).is_err());
    }

    #[test]
    fn test_decode() {
        let codec = SymNetCodec::new();
        assert_eq!(
            codec.decode("1 0"),
            ProtocolLine::Response {
                key: CorrelationKey::new(CommandKind::Get, addr(1)),
                value: Some(0),
            }
        );
        assert_eq!(codec.decode("ACK"), ProtocolLine::Ack);
        assert!(matches!(codec.decode("NAK"), ProtocolLine::Error { code: 0, .. }));
        assert_eq!(
            codec.decode("#00001=65535"),
            ProtocolLine::Push { address: addr(1), value: 65535 }
        );
        assert_eq!(
            codec.decode("#00012=-0020"),
            ProtocolLine::Push { address: addr(12), value: -20 }
        );
    }

    #[test]
    fn test_decode_malformed() {
        let codec = SymNetCodec::new();
        for line in ["#1=2", "#00001=12", "#00001=1234567", "1", "1 x", "GS2 1", "ack", ""] {
            assert!(
                matches!(codec.decode(line), ProtocolLine::Unrecognized(_)),
                "{:?} was classified",
                line
            );
        }
    }

    #[test]
    fn test_push_round_trip() {
        let codec = SymNetCodec::new();
        for value in -9_999..=MAX_CONTROLLER_VALUE {
            let line = codec.encode_push(addr(42), value).unwrap();
            assert_eq!(codec.decode(&line), ProtocolLine::Push { address: addr(42), value });
        }
        assert!(codec.encode_push(addr(100_000), 1).is_err());
        assert!(codec.encode_push(addr(1), -10_000).is_err());
    }
}
