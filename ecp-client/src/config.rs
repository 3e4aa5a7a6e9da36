//! Engine and transport configuration
//!
//! Everything here derives `serde::Deserialize` with defaults, so an
//! application can load a [`ClientConfig`] from whatever format it prefers
//! and hand it to [`EngineBuilder::from_config`](crate::EngineBuilder::from_config).
//! Durations are expressed in milliseconds (`*_ms` keys).

use crate::backoff::BackoffPolicy;
use ecp_core::{EcpError, EcpResult};
use ecp_session::{DEFAULT_MAX_LINE_LENGTH, EcpCodec, LineCodec, SymNetCodec};
use ecp_transport::{
    SerialTransport, TcpSettings, TcpTransport, TransportLayer, UdpSettings, UdpTransport,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

/// Default per-request timeout
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default bound on a single connection attempt
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default period of the timeout sweep
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);

pub(crate) mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        let millis = u64::try_from(duration.as_millis()).unwrap_or(u64::MAX);
        serializer.serialize_u64(millis)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

/// What to do when a request arrives while another with the same
/// correlation key is still outstanding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverlapPolicy {
    /// Send it anyway; replies resolve same-key requests in FIFO order
    #[default]
    Queue,
    /// Fail the new request with `EcpError::Busy`
    Reject,
}

/// Line grammar spoken by the device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CodecKind {
    #[default]
    Ecp,
    #[serde(rename = "symnet")]
    SymNet,
}

impl CodecKind {
    /// Instantiate the codec
    pub fn build(&self) -> Arc<dyn LineCodec> {
        match self {
            CodecKind::Ecp => Arc::new(EcpCodec::new()),
            CodecKind::SymNet => Arc::new(SymNetCodec::new()),
        }
    }
}

/// How to reach the device
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportConfig {
    Tcp {
        host: String,
        port: u16,
    },
    Udp {
        host: String,
        port: u16,
        #[serde(default)]
        local_address: Option<SocketAddr>,
    },
    Serial {
        port_name: String,
        baud_rate: u32,
    },
}

impl TransportConfig {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        TransportConfig::Tcp {
            host: host.into(),
            port,
        }
    }

    pub fn udp(host: impl Into<String>, port: u16) -> Self {
        TransportConfig::Udp {
            host: host.into(),
            port,
            local_address: None,
        }
    }

    pub fn serial(port_name: impl Into<String>, baud_rate: u32) -> Self {
        TransportConfig::Serial {
            port_name: port_name.into(),
            baud_rate,
        }
    }

    /// Create the (still closed) transport
    ///
    /// `connect_timeout` bounds TCP connection establishment; the engine
    /// applies the same bound around every `open()`.
    pub fn build(&self, connect_timeout: Duration) -> Box<dyn TransportLayer> {
        match self {
            TransportConfig::Tcp { host, port } => Box::new(TcpTransport::new(
                TcpSettings::with_connect_timeout(host.clone(), *port, connect_timeout),
            )),
            TransportConfig::Udp {
                host,
                port,
                local_address,
            } => {
                let mut settings = UdpSettings::new(host.clone(), *port);
                if let Some(local) = local_address {
                    settings = settings.with_local_address(*local);
                }
                Box::new(UdpTransport::new(settings))
            }
            TransportConfig::Serial {
                port_name,
                baud_rate,
            } => Box::new(SerialTransport::with_port(port_name.clone(), *baud_rate)),
        }
    }
}

/// Protocol engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Time a request may stay unanswered
    #[serde(with = "duration_ms", rename = "request_timeout_ms")]
    pub request_timeout: Duration,
    /// Bound on each connection attempt
    #[serde(with = "duration_ms", rename = "connect_timeout_ms")]
    pub connect_timeout: Duration,
    /// Longest accepted line; longer input is a framing error
    pub max_line_length: usize,
    /// Period of the sweep that expires overdue requests
    #[serde(with = "duration_ms", rename = "tick_interval_ms")]
    pub tick_interval: Duration,
    pub backoff: BackoffPolicy,
    pub overlap_policy: OverlapPolicy,
    /// Appended to every outgoing line
    pub line_terminator: String,
    /// Deliver `SubscriptionEvent::Stale` to observers on connection loss
    pub notify_stale: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            max_line_length: DEFAULT_MAX_LINE_LENGTH,
            tick_interval: DEFAULT_TICK_INTERVAL,
            backoff: BackoffPolicy::default(),
            overlap_policy: OverlapPolicy::default(),
            line_terminator: "\r".to_string(),
            notify_stale: true,
        }
    }
}

impl EngineConfig {
    /// Reject values the engine cannot run with
    pub fn validate(&self) -> EcpResult<()> {
        if self.request_timeout.is_zero() {
            return Err(EcpError::InvalidData("request timeout must be positive".to_string()));
        }
        if self.connect_timeout.is_zero() {
            return Err(EcpError::InvalidData("connect timeout must be positive".to_string()));
        }
        if self.tick_interval.is_zero() {
            return Err(EcpError::InvalidData("tick interval must be positive".to_string()));
        }
        if self.max_line_length == 0 {
            return Err(EcpError::InvalidData("max line length must be positive".to_string()));
        }
        if self.line_terminator.is_empty() {
            return Err(EcpError::InvalidData("line terminator must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Everything needed to build an engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClientConfig {
    pub transport: TransportConfig,
    #[serde(default)]
    pub codec: CodecKind,
    #[serde(default)]
    pub engine: EngineConfig,
}

impl ClientConfig {
    pub fn new(transport: TransportConfig) -> Self {
        Self {
            transport,
            codec: CodecKind::default(),
            engine: EngineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.max_line_length, 1024);
        assert_eq!(config.overlap_policy, OverlapPolicy::Queue);
        assert_eq!(config.line_terminator, "\r");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_minimal() {
        let config: ClientConfig =
            serde_json::from_str(r#"{"transport": {"type": "tcp", "host": "10.0.0.5", "port": 48631}}"#)
                .unwrap();
        assert_eq!(config.transport, TransportConfig::tcp("10.0.0.5", 48631));
        assert_eq!(config.codec, CodecKind::Ecp);
        assert_eq!(config.engine, EngineConfig::default());
    }

    #[test]
    fn test_deserialize_full() {
        let json = r#"{
            "transport": {"type": "udp", "host": "dsp.local", "port": 48630, "local_address": "0.0.0.0:48631"},
            "codec": "symnet",
            "engine": {
                "request_timeout_ms": 2500,
                "tick_interval_ms": 50,
                "max_line_length": 256,
                "overlap_policy": "reject",
                "notify_stale": false,
                "backoff": {"initial_ms": 100, "max_ms": 5000, "multiplier": 1.5, "jitter": 0.0}
            }
        }"#;
        let config: ClientConfig = serde_json::from_str(json).unwrap();
        match &config.transport {
            TransportConfig::Udp { host, port, local_address } => {
                assert_eq!(host, "dsp.local");
                assert_eq!(*port, 48630);
                assert_eq!(local_address.map(|a| a.port()), Some(48631));
            }
            other => panic!("unexpected transport {:?}", other),
        }
        assert_eq!(config.codec, CodecKind::SymNet);
        assert_eq!(config.engine.request_timeout, Duration::from_millis(2500));
        assert_eq!(config.engine.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
        assert_eq!(config.engine.tick_interval, Duration::from_millis(50));
        assert_eq!(config.engine.max_line_length, 256);
        assert_eq!(config.engine.overlap_policy, OverlapPolicy::Reject);
        assert!(!config.engine.notify_stale);
        assert_eq!(
            config.engine.backoff,
            BackoffPolicy::fixed(Duration::from_millis(100), Duration::from_secs(5), 1.5)
        );
    }

    #[test]
    fn test_deserialize_serial() {
        let config: TransportConfig =
            serde_json::from_str(r#"{"type": "serial", "port_name": "/dev/ttyUSB0", "baud_rate": 9600}"#)
                .unwrap();
        assert_eq!(config, TransportConfig::serial("/dev/ttyUSB0", 9600));
        assert_eq!(config.build(DEFAULT_CONNECT_TIMEOUT).endpoint(), "serial:///dev/ttyUSB0@9600");
    }

    #[test]
    fn test_serialize_round_trip() {
        let config = ClientConfig::new(TransportConfig::tcp("127.0.0.1", 9000));
        let json = serde_json::to_string(&config).unwrap();
        assert!(json.contains("\"request_timeout_ms\":5000"));
        let back: ClientConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_validate_rejects_zero_tick() {
        let config = EngineConfig {
            tick_interval: Duration::ZERO,
            ..EngineConfig::default()
        };
        assert!(matches!(config.validate(), Err(EcpError::InvalidData(_))));
    }

    #[test]
    fn test_codec_kind_build() {
        assert_eq!(CodecKind::Ecp.build().name(), "ecp");
        assert_eq!(CodecKind::SymNet.build().name(), "symnet");
    }
}
