//! State shared between the engine handles and the IO task
//!
//! The [`Dispatcher`] owns the connection state, the pending-request table,
//! the subscription registry and the sending side of the outbound queue.
//! Callers register requests through it, the IO task feeds it every
//! received line, and both sides report connection changes to it.
//!
//! Lock discipline: `link` and `subscriptions` are never held at the same
//! time, and observers are only called with no lock held.

use crate::config::EngineConfig;
use crate::pending::{CancelPending, PendingTable, RequestId, ResponseHandle};
use crate::subscription::SubscriptionRegistry;
use ecp_core::{Command, CorrelationKey, EcpError, EcpResult, ErrorKind, ParameterAddress};
use ecp_session::{ConnectionState, LineCodec, ProtocolLine, ProtocolStatistics};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

/// Message for the IO task
#[derive(Debug)]
pub(crate) enum Outbound {
    /// Encoded request line, without terminator
    Line(String),
    /// Stop the IO task and hand the transport back
    Shutdown,
}

pub(crate) struct Link {
    state: ConnectionState,
    pending: PendingTable,
    outbound: Option<mpsc::UnboundedSender<Outbound>>,
}

pub(crate) struct Dispatcher {
    pub(crate) config: EngineConfig,
    pub(crate) codec: Arc<dyn LineCodec>,
    pub(crate) statistics: ProtocolStatistics,
    pub(crate) subscriptions: Mutex<SubscriptionRegistry>,
    link: Mutex<Link>,
    state_tx: watch::Sender<ConnectionState>,
}

impl Dispatcher {
    pub(crate) fn new(config: EngineConfig, codec: Arc<dyn LineCodec>) -> Arc<Self> {
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Arc::new(Self {
            link: Mutex::new(Link {
                state: ConnectionState::Disconnected,
                pending: PendingTable::new(config.overlap_policy),
                outbound: None,
            }),
            config,
            codec,
            statistics: ProtocolStatistics::new(),
            subscriptions: Mutex::new(SubscriptionRegistry::new()),
            state_tx,
        })
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.link.lock().state
    }

    pub(crate) fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub(crate) fn pending_requests(&self) -> usize {
        self.link.lock().pending.len()
    }

    /// Apply a validated state transition; invalid ones are logged and ignored
    fn transition(&self, link: &mut Link, new_state: ConnectionState) -> bool {
        if let Err(e) = link.state.validate_transition(new_state) {
            log::debug!("ignoring state change: {}", e);
            return false;
        }
        if link.state != new_state {
            log::debug!("connection state {} -> {}", link.state, new_state);
            link.state = new_state;
            self.state_tx.send_replace(new_state);
        }
        true
    }

    /// `Disconnected -> Connecting` before a connection attempt
    pub(crate) fn begin_connecting(&self) -> bool {
        let mut link = self.link.lock();
        link.state == ConnectionState::Disconnected
            && self.transition(&mut link, ConnectionState::Connecting)
    }

    /// `Connecting -> Disconnected` after a failed attempt
    pub(crate) fn connect_failed(&self) {
        let mut link = self.link.lock();
        self.transition(&mut link, ConnectionState::Disconnected);
    }

    /// Enter `Closing` unless already idle
    pub(crate) fn begin_closing(&self) {
        let mut link = self.link.lock();
        if link.state.can_close() {
            self.transition(&mut link, ConnectionState::Closing);
        }
    }

    /// Install the queue the IO task reads from
    pub(crate) fn attach(&self, outbound: mpsc::UnboundedSender<Outbound>) {
        self.link.lock().outbound = Some(outbound);
    }

    /// Register a caller request and queue its line
    pub(crate) fn submit(self: &Arc<Self>, command: Command) -> EcpResult<ResponseHandle> {
        let line = self.codec.encode(&command)?;
        let deadline = Instant::now() + self.config.request_timeout;

        let mut guard = self.link.lock();
        if !guard.state.is_ready() {
            return Err(EcpError::disconnected(format!(
                "cannot send {}: connection is {}",
                command, guard.state
            )));
        }
        self.enqueue(&mut guard, command, line, deadline)
    }

    /// Registration and queueing happen under one lock, so lines reach the
    /// wire in the order their entries were created.
    fn enqueue(
        self: &Arc<Self>,
        link: &mut Link,
        command: Command,
        line: String,
        deadline: Instant,
    ) -> EcpResult<ResponseHandle> {
        let outbound = link
            .outbound
            .clone()
            .ok_or_else(|| EcpError::disconnected("IO task not running"))?;
        let key = command.correlation_key();
        let (id, receiver) = link.pending.submit(command, deadline)?;
        if outbound.send(Outbound::Line(line)).is_err() {
            link.pending.cancel(&key, id);
            return Err(EcpError::disconnected("IO task stopped"));
        }

        let owner: Weak<dyn CancelPending> = Arc::downgrade(self) as Weak<dyn CancelPending>;
        Ok(ResponseHandle::new(key, id, receiver, owner))
    }

    /// Route one received line
    pub(crate) fn dispatch_line(&self, line: &str) {
        let decoded = self.codec.decode(line);
        log::trace!("<- {:?} ({})", line, decoded.category());

        match decoded {
            ProtocolLine::Response { key, value } => {
                let matched = self.link.lock().pending.resolve(&key, value);
                self.count_reply(matched, line);
            }
            ProtocolLine::Ack => {
                let matched = self.link.lock().pending.resolve_ack();
                self.count_reply(matched, line);
            }
            ProtocolLine::Push { address, value } => {
                self.statistics.increment_pushes_received();
                let notification = self.subscriptions.lock().on_push(address, value);
                match notification {
                    Some(notification) => notification.deliver(),
                    None => log::debug!("push for unobserved parameter {}", address),
                }
            }
            ProtocolLine::Error { code, message } => {
                self.statistics.increment_protocol_errors();
                let error = EcpError::Protocol {
                    code,
                    message: message.clone(),
                };
                let matched = self.link.lock().pending.reject_oldest(error);
                if !matched {
                    self.statistics.increment_unmatched_responses();
                    log::warn!("device error {} ({}) with no request outstanding", code, message);
                }
            }
            ProtocolLine::Unrecognized(text) => {
                self.statistics.increment_malformed_lines();
                log::warn!("discarding malformed line {:?}", text);
            }
        }
    }

    fn count_reply(&self, matched: bool, line: &str) {
        if matched {
            self.statistics.increment_responses_received();
        } else {
            self.statistics.increment_unmatched_responses();
            log::warn!("unmatched reply {:?}", line);
        }
    }

    /// Time out overdue requests
    pub(crate) fn expire_overdue(&self, now: Instant) {
        let expired = self.link.lock().pending.expire_overdue(now);
        if expired > 0 {
            self.statistics.add_timeouts(expired as u64);
            log::warn!("{} request(s) timed out", expired);
        }
    }

    /// The transport failed: fail every request and mark subscriptions stale
    pub(crate) fn connection_lost(&self, reason: &EcpError) {
        let failed = {
            let mut link = self.link.lock();
            self.transition(&mut link, ConnectionState::Disconnected);
            link.pending.fail_all(&reason.to_string())
        };
        if failed > 0 {
            log::warn!("{} outstanding request(s) failed: {}", failed, reason);
        }
        self.invalidate_subscriptions();
    }

    /// The IO task has stopped for good
    pub(crate) fn closed(&self) {
        let failed = {
            let mut link = self.link.lock();
            self.transition(&mut link, ConnectionState::Disconnected);
            link.outbound = None;
            link.pending.fail_all("connection closed")
        };
        if failed > 0 {
            log::debug!("{} outstanding request(s) failed on close", failed);
        }
        self.invalidate_subscriptions();
    }

    fn invalidate_subscriptions(&self) {
        let notifications = self.subscriptions.lock().mark_all_stale();
        if self.config.notify_stale {
            for notification in notifications {
                notification.deliver();
            }
        }
    }

    /// A transport is open: queue resubscriptions, then accept requests
    ///
    /// The resubscribe lines are queued before the state becomes
    /// `Connected`, so no caller request can overtake them.
    pub(crate) fn establish(self: &Arc<Self>) -> bool {
        let addresses = self.subscriptions.lock().restorable();
        let deadline = Instant::now() + self.config.request_timeout;

        let mut restores = Vec::with_capacity(addresses.len());
        let mut unsent = Vec::new();
        let established = {
            let mut link = self.link.lock();
            if link.state != ConnectionState::Connecting {
                false
            } else {
                for address in &addresses {
                    let command = Command::subscribe(*address);
                    let queued = self
                        .codec
                        .encode(&command)
                        .and_then(|line| self.enqueue(&mut link, command, line, deadline));
                    match queued {
                        Ok(handle) => restores.push((*address, handle)),
                        Err(e) => {
                            log::error!("cannot resubscribe {}: {}", address, e);
                            unsent.push((*address, e));
                        }
                    }
                }
                self.transition(&mut link, ConnectionState::Connected)
            }
        };

        if !established {
            // Dropping the handles cancels their entries.
            let mut registry = self.subscriptions.lock();
            for address in addresses {
                registry.mark_stale(address);
            }
            return false;
        }

        if !unsent.is_empty() {
            let mut registry = self.subscriptions.lock();
            for (address, error) in &unsent {
                registry.mark_failed(*address, error);
            }
        }
        if !restores.is_empty() {
            log::info!("restoring {} subscription(s)", restores.len());
        }
        for (address, handle) in restores {
            let dispatcher = Arc::clone(self);
            tokio::spawn(async move {
                match handle.await {
                    Ok(value) => {
                        let notification =
                            dispatcher.subscriptions.lock().mark_active(address, value);
                        if let Some(notification) = notification {
                            notification.deliver();
                        }
                    }
                    // connection_lost already marked it stale
                    Err(e) if e.kind() == ErrorKind::Disconnected => {
                        log::debug!("resubscribing {} interrupted: {}", address, e);
                    }
                    Err(e) => {
                        log::warn!("resubscribing {} failed: {}", address, e);
                        dispatcher.subscriptions.lock().mark_failed(address, &e);
                    }
                }
            });
        }
        true
    }

    pub(crate) fn last_value(&self, address: &ParameterAddress) -> Option<i32> {
        self.subscriptions.lock().last_value(address)
    }
}

impl CancelPending for Dispatcher {
    fn cancel_pending(&self, key: &CorrelationKey, id: RequestId) {
        if self.link.lock().pending.cancel(key, id) {
            log::debug!("request {} ({}) cancelled by caller", id, key);
        }
    }
}
