//! External Control Protocol client
//!
//! This crate provides the protocol engine for ECP devices: request/response
//! correlation over a single connection, parameter subscriptions with push
//! notifications, per-request timeouts, and automatic reconnection with
//! subscription restore.
//!
//! # Architecture
//!
//! - [`pending`]: outstanding requests keyed by command kind and address
//! - [`subscription`]: observers, last known values, restore bookkeeping
//! - `manager`: the IO task owning the transport, reconnect loop
//! - [`engine`]: [`ProtocolEngine`], the cloneable handle callers use
//! - [`config`] / [`builder`]: serde-friendly configuration and a fluent builder

pub mod backoff;
pub mod builder;
pub mod config;
mod dispatch;
pub mod engine;
mod manager;
pub mod pending;
pub mod subscription;

pub use backoff::BackoffPolicy;
pub use builder::EngineBuilder;
pub use config::{
    ClientConfig, CodecKind, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
    DEFAULT_TICK_INTERVAL, EngineConfig, OverlapPolicy, TransportConfig,
};
pub use ecp_core::{EcpError, EcpResult, ErrorKind};
pub use engine::ProtocolEngine;
pub use pending::{CancelPending, PendingTable, Reply, RequestId, ResponseHandle};
pub use subscription::{
    ChannelObserver, Join, Notification, Observer, Removal, SubscriptionEvent, SubscriptionHandle,
    SubscriptionRegistry, SubscriptionState,
};
