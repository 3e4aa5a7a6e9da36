//! Default ECP line grammar
//!
//! | command      | request    | reply                 |
//! |--------------|------------|-----------------------|
//! | get          | `RA12`     | `RA12=-20`            |
//! | set          | `WA12=-20` | `WA12=-20` or `ACK`   |
//! | subscribe    | `SA7`      | `SA7` or `SA7=<value>`|
//! | unsubscribe  | `UA7`      | `UA7` or `ACK`        |
//! | push         |            | `#7=3`                |
//! | error        |            | `NAK`, `ERR <code> <message>` |

use super::{LineCodec, ProtocolLine, format_value, parse_value};
use ecp_core::{Command, CommandKind, CorrelationKey, EcpError, EcpResult, ParameterAddress};

const PUSH_PREFIX: char = '#';

/// Codec for the `<verb><address>[=<value>]` grammar
#[derive(Debug, Clone, Copy, Default)]
pub struct EcpCodec;

impl EcpCodec {
    pub fn new() -> Self {
        Self
    }

    /// Format a push line as the device sends it
    pub fn encode_push(&self, address: ParameterAddress, value: i32) -> String {
        format!("{}{}={}", PUSH_PREFIX, address, format_value(value))
    }

    fn verb(kind: CommandKind) -> &'static str {
        match kind {
            CommandKind::Get => "RA",
            CommandKind::Set => "WA",
            CommandKind::Subscribe => "SA",
            CommandKind::Unsubscribe => "UA",
        }
    }

    fn kind_for_verb(verb: &str) -> Option<CommandKind> {
        match verb {
            "RA" => Some(CommandKind::Get),
            "WA" => Some(CommandKind::Set),
            "SA" => Some(CommandKind::Subscribe),
            "UA" => Some(CommandKind::Unsubscribe),
            _ => None,
        }
    }

    /// Split `addr[=value]`
    fn address_and_value(text: &str) -> Option<(ParameterAddress, Option<i32>)> {
        match text.split_once('=') {
            Some((address, value)) => Some((
                ParameterAddress::from_string(address).ok()?,
                Some(parse_value(value)?),
            )),
            None => Some((ParameterAddress::from_string(text).ok()?, None)),
        }
    }

    fn decode_error(rest: &str) -> Option<ProtocolLine> {
        let rest = rest.strip_prefix(' ')?;
        let (code, message) = rest.split_once(' ').unwrap_or((rest, ""));
        Some(ProtocolLine::Error {
            code: code.parse().ok()?,
            message: message.trim().to_string(),
        })
    }

    fn decode_reply(line: &str) -> Option<ProtocolLine> {
        let kind = Self::kind_for_verb(line.get(..2)?)?;
        let (address, value) = Self::address_and_value(&line[2..])?;
        let valid = match kind {
            CommandKind::Get => value.is_some(),
            CommandKind::Unsubscribe => value.is_none(),
            CommandKind::Set | CommandKind::Subscribe => true,
        };
        valid.then(|| ProtocolLine::Response {
            key: CorrelationKey::new(kind, address),
            value,
        })
    }
}

impl LineCodec for EcpCodec {
    fn encode(&self, command: &Command) -> EcpResult<String> {
        let verb = Self::verb(command.kind());
        match command.kind() {
            CommandKind::Set => {
                let value = command.value().ok_or_else(|| {
                    EcpError::InvalidData(format!("set {} without value", command.address()))
                })?;
                Ok(format!("{}{}={}", verb, command.address(), format_value(value)))
            }
            _ => Ok(format!("{}{}", verb, command.address())),
        }
    }

    fn decode(&self, line: &str) -> ProtocolLine {
        let line = line.trim();
        let decoded = match line {
            "ACK" => Some(ProtocolLine::Ack),
            "NAK" => Some(ProtocolLine::Error {
                code: 0,
                message: "NAK".to_string(),
            }),
            _ => {
                if let Some(rest) = line.strip_prefix("ERR") {
                    Self::decode_error(rest)
                } else if let Some(rest) = line.strip_prefix(PUSH_PREFIX) {
                    match Self::address_and_value(rest) {
                        Some((address, Some(value))) => Some(ProtocolLine::Push { address, value }),
                        _ => None,
                    }
                } else {
                    Self::decode_reply(line)
                }
            }
        };
        decoded.unwrap_or_else(|| ProtocolLine::Unrecognized(line.to_string()))
    }

    fn name(&self) -> &'static str {
        "ecp"
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
        let codec = EcpCodec::new();
        assert_eq!(codec.encode(&Command::get(addr(12))).unwrap(), "RA12");
        assert_eq!(codec.encode(&Command::set(addr(12), -20)).unwrap(), "WA12=-20");
        assert_eq!(codec.encode(&Command::subscribe(addr(7))).unwrap(), "SA7");
        assert_eq!(
            codec
                .encode(&Command::unsubscribe(ParameterAddress::with_channel(7, 2)))
                .unwrap(),
            "UA7.2"
        );
    }

    #[test]
    fn test_decode_replies() {
        let codec = EcpCodec::new();
        assert_eq!(
            codec.decode("RA12=-20"),
            ProtocolLine::Response {
                key: CorrelationKey::new(CommandKind::Get, addr(12)),
                value: Some(-20),
            }
        );
        assert_eq!(
            codec.decode("WA12=+5"),
            ProtocolLine::Response {
                key: CorrelationKey::new(CommandKind::Set, addr(12)),
                value: Some(5),
            }
        );
        assert_eq!(
            codec.decode("SA7"),
            ProtocolLine::Response {
                key: CorrelationKey::new(CommandKind::Subscribe, addr(7)),
                value: None,
            }
        );
        assert_eq!(codec.decode("ACK"), ProtocolLine::Ack);
    }

    #[test]
    fn test_decode_push_and_errors() {
        let codec = EcpCodec::new();
        assert_eq!(codec.decode("#7=3"), ProtocolLine::Push { address: addr(7), value: 3 });
        assert_eq!(
            codec.decode("#7.1=-3"),
            ProtocolLine::Push {
                address: ParameterAddress::with_channel(7, 1),
                value: -3
            }
        );
        assert_eq!(
            codec.decode("ERR 3 unknown parameter"),
            ProtocolLine::Error {
                code: 3,
                message: "unknown parameter".to_string()
            }
        );
        assert_eq!(
            codec.decode("NAK"),
            ProtocolLine::Error {
                code: 0,
                message: "NAK".to_string()
            }
        );
    }

    #[test]
    fn test_decode_malformed_never_panics() {
        let codec = EcpCodec::new();
        for line in [
            "", "R", "RA", "RA12", "RAx=1", "RA12=", "RA12=abc", "UA7=1", "#7", "#=3", "#7=",
            "ERR", "ERRx", "ERR x msg", "XY12", "é", "RA1\u{0}2=1",
        ] {
            assert!(
                matches!(codec.decode(line), ProtocolLine::Unrecognized(_)),
                "{:?} was classified",
                line
            );
        }
    }

    #[test]
    fn test_round_trip() {
        let codec = EcpCodec::new();
        let mut samples = vec![i32::MIN, i32::MAX, 0];
        samples.extend((-100_000..=100_000).step_by(13));
        for value in samples {
            let push = codec.encode_push(addr(7), value);
            assert_eq!(codec.decode(&push), ProtocolLine::Push { address: addr(7), value });

            let set = codec.encode(&Command::set(addr(12), value)).unwrap();
            assert_eq!(
                codec.decode(&set),
                ProtocolLine::Response {
                    key: CorrelationKey::new(CommandKind::Set, addr(12)),
                    value: Some(value),
                }
            );
        }
    }
}
