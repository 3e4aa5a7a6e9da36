//! Stream accessor trait for transport layer

use async_trait::async_trait;
use ecp_core::{EcpError, EcpResult};
use std::time::Duration;

/// Stream accessor interface to access a physical stream to a remote device
#[async_trait]
pub trait StreamAccessor: Send + Sync {
    /// Set the read timeout
    ///
    /// # Arguments
    ///
    /// * `timeout` - The timeout duration. None means infinite timeout.
    async fn set_timeout(&mut self, timeout: Option<Duration>) -> EcpResult<()>;

    /// Read data from the stream
    ///
    /// # Arguments
    ///
    /// * `buf` - Buffer to read into
    ///
    /// # Returns
    ///
    /// Number of bytes read, or 0 if EOF
    ///
    /// # Cancellation
    ///
    /// Implementations must be cancel safe: if the returned future is dropped
    /// before completion, no data has been consumed from the stream.
    async fn read(&mut self, buf: &mut [u8]) -> EcpResult<usize>;

    /// Write data to the stream
    ///
    /// # Returns
    ///
    /// Number of bytes written
    async fn write(&mut self, buf: &[u8]) -> EcpResult<usize>;

    /// Write all data to the stream
    async fn write_all(&mut self, buf: &[u8]) -> EcpResult<()> {
        let mut written = 0;
        while written < buf.len() {
            let n = self.write(&buf[written..]).await?;
            if n == 0 {
                return Err(EcpError::Connection(std::io::Error::new(
                    std::io::ErrorKind::WriteZero,
                    "Failed to write all data",
                )));
            }
            written += n;
        }
        Ok(())
    }

    /// Flush any buffered data
    async fn flush(&mut self) -> EcpResult<()>;

    /// Check if the stream is closed
    fn is_closed(&self) -> bool;

    /// Whether the last `read` consumed the end of a datagram
    ///
    /// Datagram transports end a protocol line at the datagram boundary even
    /// when the device omits the terminator. Stream transports never report
    /// a boundary.
    fn at_message_boundary(&self) -> bool {
        false
    }

    /// Close the stream
    async fn close(&mut self) -> EcpResult<()>;
}

/// Transport layer trait that extends StreamAccessor
#[async_trait]
pub trait TransportLayer: StreamAccessor {
    /// Open the physical layer connection
    ///
    /// A closed transport can be opened again; the connection manager relies
    /// on this to reconnect without rebuilding the transport.
    async fn open(&mut self) -> EcpResult<()>;

    /// Human readable description of the remote endpoint, used in logs
    fn endpoint(&self) -> String;
}

/// Error returned by transports that are used before `open()`
pub(crate) fn not_connected(what: &str) -> EcpError {
    EcpError::Connection(std::io::Error::new(
        std::io::ErrorKind::NotConnected,
        format!("{} not connected", what),
    ))
}

/// Error returned by `open()` on a transport that is already open
pub(crate) fn already_open() -> EcpError {
    EcpError::Connection(std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        "Connection has already been opened",
    ))
}
