//! TCP transport implementation

use crate::stream::{StreamAccessor, TransportLayer, already_open, not_connected};
use async_trait::async_trait;
use ecp_core::{EcpError, EcpResult};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Wrapper for TcpStream that implements Debug
struct DebugTcpStream(TcpStream);

impl fmt::Debug for DebugTcpStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpStream").finish()
    }
}

impl Deref for DebugTcpStream {
    type Target = TcpStream;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for DebugTcpStream {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// TCP transport layer settings
#[derive(Debug, Clone)]
pub struct TcpSettings {
    pub host: String,
    pub port: u16,
    /// Bound on connection establishment
    pub connect_timeout: Option<Duration>,
    /// Bound on individual reads and writes
    pub timeout: Option<Duration>,
}

impl TcpSettings {
    /// Create new TCP settings
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout: Some(Duration::from_secs(5)),
            timeout: None,
        }
    }

    /// Create TCP settings with a connect timeout
    pub fn with_connect_timeout(host: impl Into<String>, port: u16, timeout: Duration) -> Self {
        Self {
            connect_timeout: Some(timeout),
            ..Self::new(host, port)
        }
    }
}

/// TCP transport layer implementation
#[derive(Debug)]
pub struct TcpTransport {
    stream: Option<DebugTcpStream>,
    settings: TcpSettings,
    closed: bool,
}

impl TcpTransport {
    /// Create a new TCP transport layer
    pub fn new(settings: TcpSettings) -> Self {
        Self {
            stream: None,
            settings,
            closed: true,
        }
    }

    /// Create TCP transport from a `host:port` string
    pub fn from_address(address: &str) -> EcpResult<Self> {
        let (host, port) = address.rsplit_once(':').ok_or_else(|| {
            EcpError::InvalidData(format!("Invalid TCP address (expected host:port): {}", address))
        })?;
        let port = port
            .parse::<u16>()
            .map_err(|e| EcpError::InvalidData(format!("Invalid TCP port in {}: {}", address, e)))?;
        Ok(Self::new(TcpSettings::new(host, port)))
    }

    /// Access the settings
    pub fn settings(&self) -> &TcpSettings {
        &self.settings
    }
}

#[async_trait]
impl TransportLayer for TcpTransport {
    async fn open(&mut self) -> EcpResult<()> {
        if !self.closed {
            return Err(already_open());
        }

        let target = (self.settings.host.as_str(), self.settings.port);
        let stream = if let Some(timeout) = self.settings.connect_timeout {
            tokio::time::timeout(timeout, TcpStream::connect(target))
                .await
                .map_err(|_| EcpError::Timeout)??
        } else {
            TcpStream::connect(target).await?
        };
        // Command lines are tiny; do not let Nagle hold them back.
        stream.set_nodelay(true)?;

        self.stream = Some(DebugTcpStream(stream));
        self.closed = false;
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("tcp://{}:{}", self.settings.host, self.settings.port)
    }
}

#[async_trait]
impl StreamAccessor for TcpTransport {
    async fn set_timeout(&mut self, timeout: Option<Duration>) -> EcpResult<()> {
        self.settings.timeout = timeout;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> EcpResult<usize> {
        let stream = self.stream.as_mut().ok_or_else(|| not_connected("TCP stream"))?;

        let result = if let Some(timeout) = self.settings.timeout {
            tokio::time::timeout(timeout, stream.read(buf))
                .await
                .map_err(|_| EcpError::Timeout)?
                .map_err(EcpError::Connection)
        } else {
            stream.read(buf).await.map_err(EcpError::Connection)
        };

        match result {
            Ok(0) => {
                self.closed = true;
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => {
                self.closed = true;
                Err(e)
            }
        }
    }

    async fn write(&mut self, buf: &[u8]) -> EcpResult<usize> {
        let stream = self.stream.as_mut().ok_or_else(|| not_connected("TCP stream"))?;

        if let Some(timeout) = self.settings.timeout {
            tokio::time::timeout(timeout, stream.write(buf))
                .await
                .map_err(|_| EcpError::Timeout)?
                .map_err(EcpError::Connection)
        } else {
            stream.write(buf).await.map_err(EcpError::Connection)
        }
    }

    async fn flush(&mut self) -> EcpResult<()> {
        let stream = self.stream.as_mut().ok_or_else(|| not_connected("TCP stream"))?;
        stream.flush().await.map_err(EcpError::Connection)
    }

    fn is_closed(&self) -> bool {
        self.closed
    }

    async fn close(&mut self) -> EcpResult<()> {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.closed = true;
        Ok(())
    }
}
