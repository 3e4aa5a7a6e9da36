//! Protocol engine: the public face of the client
//!
//! A [`ProtocolEngine`] owns one device connection. It is cheap to clone;
//! all clones share the connection, the pending-request table and the
//! subscription registry, so any number of tasks can issue requests
//! concurrently. Replies are paired with requests by command kind and
//! address; push lines are routed to observers.
//!
//! # Usage Example
//!
//! ```rust,no_run
//! use ecp_client::{EngineBuilder, SubscriptionEvent};
//! use ecp_core::ParameterAddress;
//!
//! # async fn demo() -> ecp_core::EcpResult<()> {
//! let engine = EngineBuilder::new().tcp("192.168.1.20", 48631).build()?;
//! engine.connect().await?;
//!
//! let gain = engine.get_value(ParameterAddress::new(12)).await?;
//! engine.set_value(ParameterAddress::new(12), gain + 1).await?;
//!
//! let handle = engine
//!     .subscribe(ParameterAddress::new(7), |event: &SubscriptionEvent| {
//!         println!("{:?}", event);
//!     })
//!     .await?;
//! engine.unsubscribe(handle).await?;
//! engine.close().await?;
//! # Ok(())
//! # }
//! ```

use crate::builder::EngineBuilder;
use crate::config::EngineConfig;
use crate::dispatch::{Dispatcher, Outbound};
use crate::manager;
use crate::pending::ResponseHandle;
use crate::subscription::{
    ChannelObserver, Join, Observer, Removal, SubscriptionEvent, SubscriptionHandle,
    SubscriptionState,
};
use ecp_core::{Command, EcpError, EcpResult, ErrorKind, ParameterAddress};
use ecp_session::{ConnectionState, LineCodec, StatisticsSnapshot};
use ecp_transport::TransportLayer;
use std::fmt;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

/// Ownership of the transport: parked here while idle, moved into the IO
/// task while connected
struct Control {
    transport: Option<Box<dyn TransportLayer>>,
    task: Option<JoinHandle<Box<dyn TransportLayer>>>,
    shutdown: Option<mpsc::UnboundedSender<Outbound>>,
}

impl Drop for Control {
    fn drop(&mut self) {
        // Last engine handle gone: stop the IO task.
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(Outbound::Shutdown);
        }
    }
}

/// Client for one ECP device
#[derive(Clone)]
pub struct ProtocolEngine {
    dispatcher: Arc<Dispatcher>,
    control: Arc<tokio::sync::Mutex<Control>>,
}

impl fmt::Debug for ProtocolEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProtocolEngine")
            .field("codec", &self.dispatcher.codec.name())
            .field("state", &self.state())
            .finish()
    }
}

impl ProtocolEngine {
    /// Create an engine around a closed transport
    ///
    /// Nothing happens on the wire until [`connect`](Self::connect).
    ///
    /// # Errors
    /// `InvalidData` when `config` fails [`EngineConfig::validate`]
    pub fn new(
        config: EngineConfig,
        transport: Box<dyn TransportLayer>,
        codec: Arc<dyn LineCodec>,
    ) -> EcpResult<Self> {
        config.validate()?;
        Ok(Self {
            dispatcher: Dispatcher::new(config, codec),
            control: Arc::new(tokio::sync::Mutex::new(Control {
                transport: Some(transport),
                task: None,
                shutdown: None,
            })),
        })
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.dispatcher.config
    }

    /// Open the connection and start the IO task
    ///
    /// The first attempt happens inline and its error is returned; once
    /// connected, later failures are handled by automatic reconnection.
    /// Subscriptions registered before are restored before this returns.
    /// Calling `connect` on a running engine is a no-op.
    pub async fn connect(&self) -> EcpResult<()> {
        let mut control = self.control.lock().await;
        if control.task.as_ref().is_some_and(|task| !task.is_finished()) {
            return Ok(());
        }
        if let Some(task) = control.task.take() {
            control.transport = Some(reclaim(task).await?);
        }

        let mut transport = control
            .transport
            .take()
            .ok_or_else(|| EcpError::disconnected("transport unavailable"))?;
        if !self.dispatcher.begin_connecting() {
            control.transport = Some(transport);
            return Err(EcpError::disconnected(format!(
                "cannot connect while {}",
                self.state()
            )));
        }

        let endpoint = transport.endpoint();
        log::info!("connecting to {}", endpoint);
        let opened = match tokio::time::timeout(self.dispatcher.config.connect_timeout, transport.open()).await {
            Ok(result) => result,
            Err(_) => Err(EcpError::Timeout),
        };
        if let Err(e) = opened {
            log::warn!("connecting to {} failed: {}", endpoint, e);
            let _ = transport.close().await;
            control.transport = Some(transport);
            self.dispatcher.connect_failed();
            return Err(e);
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.dispatcher.attach(sender.clone());
        control.shutdown = Some(sender);
        self.dispatcher.establish();
        control.task = Some(tokio::spawn(manager::run(
            Arc::clone(&self.dispatcher),
            transport,
            receiver,
        )));
        log::info!("connected to {}", endpoint);
        Ok(())
    }

    /// Stop the IO task and close the transport
    ///
    /// Outstanding requests fail with `Disconnected`, subscriptions are kept
    /// (stale) and restored by the next [`connect`](Self::connect). A close
    /// during reconnect backoff takes effect immediately.
    pub async fn close(&self) -> EcpResult<()> {
        let mut control = self.control.lock().await;
        let Some(task) = control.task.take() else {
            return Ok(());
        };
        self.dispatcher.begin_closing();
        if let Some(shutdown) = control.shutdown.take() {
            let _ = shutdown.send(Outbound::Shutdown);
        }
        control.transport = Some(reclaim(task).await?);
        Ok(())
    }

    /// Send a command; the handle resolves with the reply
    ///
    /// # Errors
    /// `Disconnected` when not connected, `Busy` under
    /// `OverlapPolicy::Reject`, `InvalidData` when the codec cannot express
    /// the command
    pub fn submit(&self, command: Command) -> EcpResult<ResponseHandle> {
        self.dispatcher.submit(command)
    }

    async fn request(&self, command: Command) -> EcpResult<Option<i32>> {
        self.submit(command)?.await
    }

    /// Read a parameter
    pub async fn get_value(&self, address: ParameterAddress) -> EcpResult<i32> {
        self.request(Command::get(address))
            .await?
            .ok_or_else(|| EcpError::Malformed(format!("reply to get {} carried no value", address)))
    }

    /// Write a parameter
    pub async fn set_value(&self, address: ParameterAddress, value: i32) -> EcpResult<()> {
        self.request(Command::set(address, value)).await.map(|_| ())
    }

    /// Observe pushes for `address`
    ///
    /// The first observer of an address subscribes on the device; further
    /// observers share that subscription. An observer arriving while the
    /// device Subscribe is in flight waits for its outcome. If the device
    /// subscribe fails, every observer that waited on it is left
    /// unregistered and gets the error.
    pub async fn subscribe<O>(&self, address: ParameterAddress, observer: O) -> EcpResult<SubscriptionHandle>
    where
        O: Observer + 'static,
    {
        let (handle, join) = self
            .dispatcher
            .subscriptions
            .lock()
            .add_observer(address, Arc::new(observer));

        match join {
            Join::Shared => Ok(handle),
            Join::Wait(status) => self.await_subscription(handle, status).await,
            Join::Subscribe => match self.request(Command::subscribe(address)).await {
                Ok(value) => {
                    let notification = self.dispatcher.subscriptions.lock().mark_active(address, value);
                    if let Some(notification) = notification {
                        notification.deliver();
                    }
                    Ok(handle)
                }
                Err(e) => {
                    let mut registry = self.dispatcher.subscriptions.lock();
                    if registry.remove_observer(&handle) == Removal::Remaining {
                        registry.mark_failed(address, &e);
                    }
                    Err(e)
                }
            },
        }
    }

    async fn await_subscription(
        &self,
        handle: SubscriptionHandle,
        mut status: watch::Receiver<SubscriptionState>,
    ) -> EcpResult<SubscriptionHandle> {
        let settled = status
            .wait_for(|state| *state != SubscriptionState::Pending)
            .await
            .map(|state| *state);
        if let Ok(SubscriptionState::Active) = settled {
            return Ok(handle);
        }

        let address = handle.address();
        let mut registry = self.dispatcher.subscriptions.lock();
        let error = registry
            .failure(&address)
            .unwrap_or_else(|| EcpError::disconnected(format!("subscribing {} was interrupted", address)));
        registry.remove_observer(&handle);
        Err(error)
    }

    /// Observe pushes for `address` through a channel
    pub async fn subscribe_channel(
        &self,
        address: ParameterAddress,
    ) -> EcpResult<(SubscriptionHandle, mpsc::UnboundedReceiver<SubscriptionEvent>)> {
        let (observer, receiver) = ChannelObserver::new();
        let handle = self.subscribe(address, observer).await?;
        Ok((handle, receiver))
    }

    /// Remove an observer
    ///
    /// Removing the last observer of an address unsubscribes on the device
    /// when connected. While disconnected the device side is already gone,
    /// so only the registration is dropped.
    pub async fn unsubscribe(&self, handle: SubscriptionHandle) -> EcpResult<()> {
        let removal = self.dispatcher.subscriptions.lock().remove_observer(&handle);
        match removal {
            Removal::Unknown => Err(EcpError::InvalidData(format!(
                "no subscription {} for {}",
                handle.id(),
                handle.address()
            ))),
            Removal::Remaining | Removal::Last { device_subscribed: false } => Ok(()),
            Removal::Last { device_subscribed: true } => {
                if !self.state().is_ready() {
                    return Ok(());
                }
                match self.request(Command::unsubscribe(handle.address())).await {
                    Ok(_) => Ok(()),
                    Err(e) if e.kind() == ErrorKind::Disconnected => Ok(()),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// Last value pushed for an observed address
    pub fn last_value(&self, address: ParameterAddress) -> Option<i32> {
        self.dispatcher.last_value(&address)
    }

    pub fn subscription_state(&self, address: ParameterAddress) -> Option<SubscriptionState> {
        self.dispatcher.subscriptions.lock().state(&address)
    }

    pub fn state(&self) -> ConnectionState {
        self.dispatcher.state()
    }

    /// Receiver observing every connection state change
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.dispatcher.state_changes()
    }

    /// Wait until the connection reaches `state`
    pub async fn wait_for_state(&self, state: ConnectionState) {
        let mut changes = self.state_changes();
        // The sender lives as long as the engine, so this cannot fail.
        let _ = changes.wait_for(|current| *current == state).await;
    }

    pub fn statistics(&self) -> StatisticsSnapshot {
        self.dispatcher.statistics.snapshot()
    }

    pub fn pending_requests(&self) -> usize {
        self.dispatcher.pending_requests()
    }
}

async fn reclaim(task: JoinHandle<Box<dyn TransportLayer>>) -> EcpResult<Box<dyn TransportLayer>> {
    task.await
        .map_err(|e| EcpError::disconnected(format!("IO task failed: {}", e)))
}
