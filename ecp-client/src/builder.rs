//! Engine builder
//!
//! Fluent construction of a [`ProtocolEngine`]: pick a transport, optionally
//! a codec, tune the engine, then [`build`](EngineBuilder::build).
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use ecp_client::{BackoffPolicy, EngineBuilder};
//! use std::time::Duration;
//!
//! # fn demo() -> ecp_core::EcpResult<()> {
//! // ECP over TCP with a shorter request timeout
//! let engine = EngineBuilder::new()
//!     .tcp("192.168.1.20", 48631)
//!     .request_timeout(Duration::from_secs(2))
//!     .build()?;
//!
//! // SymNet over UDP with a slow, steady reconnect
//! let symnet = EngineBuilder::new()
//!     .udp("192.168.1.30", 48631)
//!     .symnet()
//!     .backoff(BackoffPolicy::fixed(Duration::from_secs(1), Duration::from_secs(1), 1.0))
//!     .build()?;
//! # Ok(())
//! # }
//! ```

use crate::backoff::BackoffPolicy;
use crate::config::{ClientConfig, CodecKind, EngineConfig, OverlapPolicy, TransportConfig};
use crate::engine::ProtocolEngine;
use ecp_core::{EcpError, EcpResult};
use ecp_session::LineCodec;
use ecp_transport::TransportLayer;
use std::sync::Arc;
use std::time::Duration;

/// Where the transport comes from
enum TransportSource {
    Config(TransportConfig),
    Custom(Box<dyn TransportLayer>),
    None,
}

/// Builder for [`ProtocolEngine`]
///
/// Defaults: ECP codec, [`EngineConfig::default`]. A transport is required.
pub struct EngineBuilder {
    transport: TransportSource,
    codec: Arc<dyn LineCodec>,
    config: EngineConfig,
}

impl Default for EngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EngineBuilder {
    pub fn new() -> Self {
        Self {
            transport: TransportSource::None,
            codec: CodecKind::Ecp.build(),
            config: EngineConfig::default(),
        }
    }

    /// Start from a loaded configuration
    pub fn from_config(config: ClientConfig) -> Self {
        Self {
            transport: TransportSource::Config(config.transport),
            codec: config.codec.build(),
            config: config.engine,
        }
    }

    /// Configure TCP transport
    pub fn tcp(self, host: impl Into<String>, port: u16) -> Self {
        self.transport_config(TransportConfig::tcp(host, port))
    }

    /// Configure UDP transport
    pub fn udp(self, host: impl Into<String>, port: u16) -> Self {
        self.transport_config(TransportConfig::udp(host, port))
    }

    /// Configure Serial transport
    ///
    /// # Arguments
    /// * `port_name` - Serial port name (e.g., "/dev/ttyUSB0" or "COM1")
    /// * `baud_rate` - Baud rate (e.g., 9600, 115200)
    pub fn serial(self, port_name: impl Into<String>, baud_rate: u32) -> Self {
        self.transport_config(TransportConfig::serial(port_name, baud_rate))
    }

    pub fn transport_config(mut self, transport: TransportConfig) -> Self {
        self.transport = TransportSource::Config(transport);
        self
    }

    /// Use an already constructed (closed) transport
    pub fn transport(mut self, transport: Box<dyn TransportLayer>) -> Self {
        self.transport = TransportSource::Custom(transport);
        self
    }

    pub fn codec(mut self, codec: impl LineCodec + 'static) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    /// Speak the SymNet line grammar
    pub fn symnet(mut self) -> Self {
        self.codec = CodecKind::SymNet.build();
        self
    }

    /// Replace the whole engine configuration
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.config.request_timeout = timeout;
        self
    }

    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.config.connect_timeout = timeout;
        self
    }

    pub fn max_line_length(mut self, length: usize) -> Self {
        self.config.max_line_length = length;
        self
    }

    pub fn tick_interval(mut self, interval: Duration) -> Self {
        self.config.tick_interval = interval;
        self
    }

    pub fn backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.config.backoff = backoff;
        self
    }

    pub fn overlap_policy(mut self, policy: OverlapPolicy) -> Self {
        self.config.overlap_policy = policy;
        self
    }

    pub fn line_terminator(mut self, terminator: impl Into<String>) -> Self {
        self.config.line_terminator = terminator.into();
        self
    }

    pub fn notify_stale(mut self, notify: bool) -> Self {
        self.config.notify_stale = notify;
        self
    }

    /// Build the engine
    ///
    /// # Errors
    /// `InvalidData` when no transport is configured or the configuration
    /// fails [`EngineConfig::validate`]
    pub fn build(self) -> EcpResult<ProtocolEngine> {
        let transport = match self.transport {
            TransportSource::Config(transport) => transport.build(self.config.connect_timeout),
            TransportSource::Custom(transport) => transport,
            TransportSource::None => {
                return Err(EcpError::InvalidData("transport not configured".to_string()));
            }
        };
        ProtocolEngine::new(self.config, transport, self.codec)
    }
}
