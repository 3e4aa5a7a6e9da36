use thiserror::Error;

/// Main error type for ECP operations
#[derive(Error, Debug)]
pub enum EcpError {
    #[error("Connection error: {0}")]
    Connection(#[from] std::io::Error),

    #[error("Timeout")]
    Timeout,

    #[error("Disconnected: {0}")]
    Disconnected(String),

    #[error("Busy: a request for {0} is already outstanding")]
    Busy(String),

    #[error("Protocol error {code}: {message}")]
    Protocol { code: u16, message: String },

    #[error("Framing error: {0}")]
    Framing(String),

    #[error("Malformed line: {0}")]
    Malformed(String),

    #[error("Invalid data: {0}")]
    InvalidData(String),
}

/// Error classification exposed to callers
///
/// Every [`EcpError`] maps onto exactly one kind. Callers that only care about
/// the failure class (retry on `Timeout`, reconnect on `Disconnected`, ...)
/// should match on this instead of the concrete variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No response within the request deadline
    Timeout,
    /// Connection lost before or while a request was outstanding
    Disconnected,
    /// Conflicting outstanding request for the same correlation key
    Busy,
    /// The device answered with an explicit error line
    ProtocolError,
    /// Line exceeded bounds or the stream is corrupted
    FramingError,
    /// Unparseable input or a command the codec cannot express
    Malformed,
}

impl EcpError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            EcpError::Connection(_) | EcpError::Disconnected(_) => ErrorKind::Disconnected,
            EcpError::Timeout => ErrorKind::Timeout,
            EcpError::Busy(_) => ErrorKind::Busy,
            EcpError::Protocol { .. } => ErrorKind::ProtocolError,
            EcpError::Framing(_) => ErrorKind::FramingError,
            EcpError::Malformed(_) | EcpError::InvalidData(_) => ErrorKind::Malformed,
        }
    }

    /// Shorthand for a [`EcpError::Disconnected`] with the given reason
    pub fn disconnected(reason: impl Into<String>) -> Self {
        EcpError::Disconnected(reason.into())
    }

    /// Whether this error invalidates the whole connection rather than a single request
    pub fn is_connection_level(&self) -> bool {
        matches!(self.kind(), ErrorKind::Disconnected | ErrorKind::FramingError)
    }
}

/// `io::Error` is not `Clone`; a cloned `Connection` keeps its kind and text.
impl Clone for EcpError {
    fn clone(&self) -> Self {
        match self {
            EcpError::Connection(e) => EcpError::Connection(std::io::Error::new(e.kind(), e.to_string())),
            EcpError::Timeout => EcpError::Timeout,
            EcpError::Disconnected(reason) => EcpError::Disconnected(reason.clone()),
            EcpError::Busy(key) => EcpError::Busy(key.clone()),
            EcpError::Protocol { code, message } => EcpError::Protocol {
                code: *code,
                message: message.clone(),
            },
            EcpError::Framing(reason) => EcpError::Framing(reason.clone()),
            EcpError::Malformed(line) => EcpError::Malformed(line.clone()),
            EcpError::InvalidData(reason) => EcpError::InvalidData(reason.clone()),
        }
    }
}

/// Result type alias for ECP operations
pub type EcpResult<T> = Result<T, EcpError>;
