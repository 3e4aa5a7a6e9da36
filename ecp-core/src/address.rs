use crate::error::{EcpError, EcpResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Address of a controllable value on the device
///
/// A parameter is identified by a numeric controller id and, for devices with
/// multi-channel parameters, an optional channel index. The textual form is
/// `12` or `12.3` (id 12, channel 3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParameterAddress {
    id: u32,
    channel: Option<u16>,
}

impl ParameterAddress {
    /// Create an address without a channel
    pub fn new(id: u32) -> Self {
        Self { id, channel: None }
    }

    /// Create an address on a specific channel
    pub fn with_channel(id: u32, channel: u16) -> Self {
        Self {
            id,
            channel: Some(channel),
        }
    }

    /// Parse an address from its textual form
    ///
    /// # Arguments
    ///
    /// * `s` - Address text, `"12"` or `"12.3"`
    pub fn from_string(s: &str) -> EcpResult<Self> {
        let invalid = || EcpError::InvalidData(format!("Invalid parameter address: {:?}", s));
        let (id, channel) = match s.split_once('.') {
            Some((id, channel)) => (id, Some(channel)),
            None => (s, None),
        };
        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let id = id.parse::<u32>().map_err(|_| invalid())?;
        let channel = match channel {
            Some(c) if !c.is_empty() && c.bytes().all(|b| b.is_ascii_digit()) => {
                Some(c.parse::<u16>().map_err(|_| invalid())?)
            }
            Some(_) => return Err(invalid()),
            None => None,
        };
        Ok(Self { id, channel })
    }

    /// Controller id
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Channel index, if any
    pub fn channel(&self) -> Option<u16> {
        self.channel
    }
}

impl From<u32> for ParameterAddress {
    fn from(id: u32) -> Self {
        Self::new(id)
    }
}

impl FromStr for ParameterAddress {
    type Err = EcpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_string(s)
    }
}

impl fmt::Display for ParameterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.channel {
            Some(channel) => write!(f, "{}.{}", self.id, channel),
            None => write!(f, "{}", self.id),
        }
    }
}
