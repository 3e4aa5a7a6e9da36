//! UDP transport implementation
//!
//! Many ECP devices speak the protocol over UDP datagrams. The socket is
//! connected to the device so only its datagrams are received, and each
//! datagram is handed out as a byte chunk through [`StreamAccessor::read`].

use crate::stream::{StreamAccessor, TransportLayer, already_open, not_connected};
use async_trait::async_trait;
use ecp_core::{EcpError, EcpResult};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;

/// Maximum UDP payload size
pub const MAX_UDP_PAYLOAD_SIZE: usize = 65507;

/// UDP transport layer settings
#[derive(Debug, Clone)]
pub struct UdpSettings {
    pub host: String,
    pub port: u16,
    /// Local address to bind, ephemeral port on all interfaces when `None`
    pub local_address: Option<SocketAddr>,
    pub timeout: Option<Duration>,
}

impl UdpSettings {
    /// Create new UDP settings
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            local_address: None,
            timeout: None,
        }
    }

    /// Bind to a fixed local address
    pub fn with_local_address(mut self, local_address: SocketAddr) -> Self {
        self.local_address = Some(local_address);
        self
    }
}

/// UDP transport layer implementation
#[derive(Debug)]
pub struct UdpTransport {
    socket: Option<UdpSocket>,
    settings: UdpSettings,
    closed: bool,
    datagram: Vec<u8>,
    position: usize,
}

impl UdpTransport {
    /// Create a new UDP transport layer
    pub fn new(settings: UdpSettings) -> Self {
        Self {
            socket: None,
            settings,
            closed: true,
            datagram: Vec::new(),
            position: 0,
        }
    }

    /// Local address of the bound socket
    pub fn local_addr(&self) -> EcpResult<SocketAddr> {
        let socket = self.socket.as_ref().ok_or_else(|| not_connected("UDP socket"))?;
        Ok(socket.local_addr()?)
    }

    async fn read_next_datagram(&mut self) -> EcpResult<()> {
        let socket = self.socket.as_ref().ok_or_else(|| not_connected("UDP socket"))?;
        let mut buf = vec![0u8; MAX_UDP_PAYLOAD_SIZE];

        let len = if let Some(timeout) = self.settings.timeout {
            tokio::time::timeout(timeout, socket.recv(&mut buf))
                .await
                .map_err(|_| EcpError::Timeout)??
        } else {
            socket.recv(&mut buf).await?
        };

        buf.truncate(len);
        self.datagram = buf;
        self.position = 0;
        Ok(())
    }
}

#[async_trait]
impl TransportLayer for UdpTransport {
    async fn open(&mut self) -> EcpResult<()> {
        if !self.closed {
            return Err(already_open());
        }

        let local = self
            .settings
            .local_address
            .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));
        let socket = UdpSocket::bind(local).await?;
        socket
            .connect((self.settings.host.as_str(), self.settings.port))
            .await?;

        self.socket = Some(socket);
        self.datagram.clear();
        self.position = 0;
        self.closed = false;
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("udp://{}:{}", self.settings.host, self.settings.port)
    }
}

#[async_trait]
impl StreamAccessor for UdpTransport {
    async fn set_timeout(&mut self, timeout: Option<Duration>) -> EcpResult<()> {
        self.settings.timeout = timeout;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> EcpResult<usize> {
        if self.position >= self.datagram.len() {
            // Empty datagrams carry nothing for the line layer.
            loop {
                self.read_next_datagram().await?;
                if !self.datagram.is_empty() {
                    break;
                }
            }
        }

        let available = self.datagram.len() - self.position;
        let to_read = buf.len().min(available);
        buf[..to_read].copy_from_slice(&self.datagram[self.position..self.position + to_read]);
        self.position += to_read;
        Ok(to_read)
    }

    async fn write(&mut self, buf: &[u8]) -> EcpResult<usize> {
        let socket = self.socket.as_ref().ok_or_else(|| not_connected("UDP socket"))?;

        // One command line per datagram; larger buffers are split.
        let mut written = 0;
        for packet in buf.chunks(MAX_UDP_PAYLOAD_SIZE) {
            let sent = if let Some(timeout) = self.settings.timeout {
                tokio::time::timeout(timeout, socket.send(packet))
                    .await
                    .map_err(|_| EcpError::Timeout)??
            } else {
                socket.send(packet).await?
            };
            written += sent;
        }

        Ok(written)
    }

    async fn flush(&mut self) -> EcpResult<()> {
        // UDP is connectionless, no flush needed
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    fn at_message_boundary(&self) -> bool {
        self.position >= self.datagram.len()
    }

    async fn close(&mut self) -> EcpResult<()> {
        self.socket = None;
        self.datagram.clear();
        self.position = 0;
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_settings() {
        let settings = UdpSettings::new("127.0.0.1", 48631);
        assert_eq!(settings.port, 48631);
        assert!(settings.local_address.is_none());
        assert!(settings.timeout.is_none());
    }

    #[tokio::test]
    async fn test_datagram_boundaries() {
        let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let device_addr = device.local_addr().unwrap();

        let settings = UdpSettings::new("127.0.0.1", device_addr.port())
            .with_local_address("127.0.0.1:0".parse().unwrap());
        let mut transport = UdpTransport::new(settings);
        transport.open().await.unwrap();
        assert_eq!(transport.endpoint(), format!("udp://127.0.0.1:{}", device_addr.port()));

        transport.write_all(b"GS2 1\r").await.unwrap();
        let mut buf = [0u8; 64];
        let (n, client) = device.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"GS2 1\r");

        device.send_to(b"#00001=65535", client).await.unwrap();

        let mut small = [0u8; 4];
        let n = transport.read(&mut small).await.unwrap();
        assert_eq!(&small[..n], b"#000");
        assert!(!transport.at_message_boundary());

        let mut rest = [0u8; 64];
        let n = transport.read(&mut rest).await.unwrap();
        assert_eq!(&rest[..n], b"01=65535");
        assert!(transport.at_message_boundary());

        transport.close().await.unwrap();
        assert!(transport.is_closed());
    }
}
