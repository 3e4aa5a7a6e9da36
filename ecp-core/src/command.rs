//! Command model shared by the codec and the request tables

use crate::address::ParameterAddress;
use crate::error::{EcpError, EcpResult};
use std::fmt;

/// Kind of a request sent to the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum CommandKind {
    /// Read the current value of a parameter
    Get,
    /// Write a new value
    Set,
    /// Ask the device to push changes of a parameter
    Subscribe,
    /// Stop pushes for a parameter
    Unsubscribe,
}

impl CommandKind {
    /// Whether the device acknowledges this kind without returning a value
    ///
    /// Only `Get` replies are required to carry a value; the other kinds may
    /// be answered with a bare acknowledgement.
    pub fn accepts_bare_ack(&self) -> bool {
        !matches!(self, CommandKind::Get)
    }

    /// Get human-readable kind name
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandKind::Get => "get",
            CommandKind::Set => "set",
            CommandKind::Subscribe => "subscribe",
            CommandKind::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Information used to match a device reply to its request
///
/// Replies carry only the command kind and the address, never a unique
/// request id, so two outstanding requests with the same key cannot be told
/// apart. They are resolved oldest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationKey {
    pub kind: CommandKind,
    pub address: ParameterAddress,
}

impl CorrelationKey {
    pub fn new(kind: CommandKind, address: ParameterAddress) -> Self {
        Self { kind, address }
    }
}

impl fmt::Display for CorrelationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.address)
    }
}

/// A request to read, write, subscribe or unsubscribe a parameter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Command {
    kind: CommandKind,
    address: ParameterAddress,
    value: Option<i32>,
}

impl Command {
    /// Build a command, validating that `Set` carries a value and nothing else does
    pub fn new(kind: CommandKind, address: ParameterAddress, value: Option<i32>) -> EcpResult<Self> {
        match (kind, value) {
            (CommandKind::Set, None) => Err(EcpError::InvalidData(format!(
                "set {} requires a value",
                address
            ))),
            (CommandKind::Set, Some(_)) | (_, None) => Ok(Self { kind, address, value }),
            (_, Some(_)) => Err(EcpError::InvalidData(format!(
                "{} {} does not take a value",
                kind, address
            ))),
        }
    }

    pub fn get(address: ParameterAddress) -> Self {
        Self { kind: CommandKind::Get, address, value: None }
    }

    pub fn set(address: ParameterAddress, value: i32) -> Self {
        Self { kind: CommandKind::Set, address, value: Some(value) }
    }

    pub fn subscribe(address: ParameterAddress) -> Self {
        Self { kind: CommandKind::Subscribe, address, value: None }
    }

    pub fn unsubscribe(address: ParameterAddress) -> Self {
        Self { kind: CommandKind::Unsubscribe, address, value: None }
    }

    pub fn kind(&self) -> CommandKind {
        self.kind
    }

    pub fn address(&self) -> ParameterAddress {
        self.address
    }

    pub fn value(&self) -> Option<i32> {
        self.value
    }

    /// Key under which the reply to this command is expected
    pub fn correlation_key(&self) -> CorrelationKey {
        CorrelationKey::new(self.kind, self.address)
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.value {
            Some(value) => write!(f, "{} {}={}", self.kind, self.address, value),
            None => write!(f, "{} {}", self.kind, self.address),
        }
    }
}
