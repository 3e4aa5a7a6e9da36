//! RS-232 transport for control units wired to a serial port

use crate::stream::{StreamAccessor, TransportLayer, already_open, not_connected};
use async_trait::async_trait;
use ecp_core::{EcpError, EcpResult};
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::{DataBits, FlowControl, Parity, SerialPortBuilderExt, SerialStream, StopBits};

/// Line settings for a serial control port
///
/// ECP devices speak 8N1 without flow control; the other fields exist for
/// adapters that insist on something else.
#[derive(Debug, Clone, PartialEq)]
pub struct SerialSettings {
    pub port_name: String,
    pub baud_rate: u32,
    pub data_bits: DataBits,
    pub stop_bits: StopBits,
    pub parity: Parity,
    pub flow_control: FlowControl,
    /// Per-operation IO deadline. None waits indefinitely.
    pub timeout: Option<Duration>,
}

impl SerialSettings {
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            data_bits: DataBits::Eight,
            stop_bits: StopBits::One,
            parity: Parity::None,
            flow_control: FlowControl::None,
            timeout: None,
        }
    }

    fn open_port(&self) -> EcpResult<SerialStream> {
        tokio_serial::new(&self.port_name, self.baud_rate)
            .data_bits(self.data_bits)
            .stop_bits(self.stop_bits)
            .parity(self.parity)
            .flow_control(self.flow_control)
            .open_native_async()
            .map_err(|e| {
                EcpError::Connection(std::io::Error::other(format!(
                    "cannot open serial port {}: {}",
                    self.port_name, e
                )))
            })
    }
}

/// Serial port carrying ECP lines
pub struct SerialTransport {
    port: Option<SerialStream>,
    settings: SerialSettings,
}

impl fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialTransport")
            .field("settings", &self.settings)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self { port: None, settings }
    }

    /// Serial transport on `port_name` with 8N1 framing
    pub fn with_port(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self::new(SerialSettings::new(port_name, baud_rate))
    }

    pub fn settings(&self) -> &SerialSettings {
        &self.settings
    }

    async fn bounded<T>(
        timeout: Option<Duration>,
        op: impl Future<Output = std::io::Result<T>>,
    ) -> EcpResult<T> {
        match timeout {
            Some(limit) => tokio::time::timeout(limit, op)
                .await
                .map_err(|_| EcpError::Timeout)?
                .map_err(EcpError::Connection),
            None => op.await.map_err(EcpError::Connection),
        }
    }
}

#[async_trait]
impl TransportLayer for SerialTransport {
    async fn open(&mut self) -> EcpResult<()> {
        if self.port.is_some() {
            return Err(already_open());
        }
        let port = self.settings.open_port()?;
        log::debug!("serial port {} open at {} baud", self.settings.port_name, self.settings.baud_rate);
        self.port = Some(port);
        Ok(())
    }

    fn endpoint(&self) -> String {
        format!("serial://{}@{}", self.settings.port_name, self.settings.baud_rate)
    }
}

#[async_trait]
impl StreamAccessor for SerialTransport {
    async fn set_timeout(&mut self, timeout: Option<Duration>) -> EcpResult<()> {
        self.settings.timeout = timeout;
        Ok(())
    }

    async fn read(&mut self, buf: &mut [u8]) -> EcpResult<usize> {
        let timeout = self.settings.timeout;
        let port = self.port.as_mut().ok_or_else(|| not_connected("Serial port"))?;
        let outcome = Self::bounded(timeout, port.read(buf)).await;
        // EOF or a hard error leaves the port unusable until reopened.
        if matches!(outcome, Ok(0) | Err(EcpError::Connection(_))) {
            self.port = None;
        }
        outcome
    }

    async fn write(&mut self, buf: &[u8]) -> EcpResult<usize> {
        let timeout = self.settings.timeout;
        let port = self.port.as_mut().ok_or_else(|| not_connected("Serial port"))?;
        Self::bounded(timeout, port.write(buf)).await
    }

    async fn flush(&mut self) -> EcpResult<()> {
        let port = self.port.as_mut().ok_or_else(|| not_connected("Serial port"))?;
        port.flush().await.map_err(EcpError::Connection)
    }

    fn is_closed(&self) -> bool {
        self.port.is_none()
    }

    async fn close(&mut self) -> EcpResult<()> {
        if let Some(mut port) = self.port.take() {
            if let Err(e) = port.flush().await {
                log::debug!("flush on serial close failed: {}", e);
            }
        }
        Ok(())
    }
}
