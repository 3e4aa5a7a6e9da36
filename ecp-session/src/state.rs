//! Connection state machine

use ecp_core::{EcpError, EcpResult};
use std::fmt;

/// Connection lifecycle state
///
/// # State Transitions
/// ```text
/// Disconnected -> Connecting (connect() or reconnect attempt)
/// Connecting   -> Connected  (transport open, subscriptions restored)
/// Connecting   -> Disconnected (attempt failed)
/// Connected    -> Closing    (close())
/// Connected    -> Disconnected (read/write error, EOF)
/// Closing      -> Disconnected (IO task finished)
/// ```
///
/// A manual close may also interrupt a reconnect cycle, so `Connecting` may
/// move to `Closing` as well.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    /// No transport connection (initial state)
    #[default]
    Disconnected,
    /// A connection attempt is in progress
    Connecting,
    /// Transport open and ready for requests
    Connected,
    /// Shutting down on caller request
    Closing,
}

impl ConnectionState {
    /// Check if the connection accepts requests
    pub fn is_ready(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// Check if the connection can be closed
    pub fn can_close(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected | ConnectionState::Closing)
    }

    /// Validate state transition
    ///
    /// # Returns
    /// `Ok(())` if transition is valid, `Err` otherwise
    pub fn validate_transition(&self, new_state: ConnectionState) -> EcpResult<()> {
        use ConnectionState::*;

        let valid = matches!(
            (*self, new_state),
            (Disconnected, Connecting)
                | (Connecting, Connected)
                | (Connecting, Disconnected)
                | (Connecting, Closing)
                | (Connected, Closing)
                | (Connected, Disconnected)
                | (Closing, Disconnected)
                | (Disconnected, Disconnected)
                | (Connecting, Connecting)
        );

        if valid {
            Ok(())
        } else {
            Err(EcpError::InvalidData(format!(
                "Invalid state transition: {:?} -> {:?}",
                self, new_state
            )))
        }
    }

    /// Get human-readable state name
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
            ConnectionState::Closing => "Closing",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionState::*;

    #[test]
    fn test_valid_transitions() {
        for (from, to) in [
            (Disconnected, Connecting),
            (Connecting, Connected),
            (Connected, Disconnected),
            (Connected, Closing),
            (Closing, Disconnected),
            (Connecting, Closing),
        ] {
            assert!(from.validate_transition(to).is_ok(), "{} -> {}", from, to);
        }
    }

    #[test]
    fn test_invalid_transitions() {
        for (from, to) in [
            (Disconnected, Connected),
            (Closing, Connected),
            (Closing, Connecting),
            (Connected, Connecting),
        ] {
            assert!(from.validate_transition(to).is_err(), "{} -> {}", from, to);
        }
    }

    #[test]
    fn test_predicates() {
        assert!(Connected.is_ready());
        assert!(!Connecting.is_ready());
        assert!(Connecting.can_close());
        assert!(!Disconnected.can_close());
        assert_eq!(ConnectionState::default(), Disconnected);
    }
}
