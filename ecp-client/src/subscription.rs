//! Subscription registry
//!
//! Tracks which parameters the application observes, the last value the
//! device pushed for each, and whether the device side of the subscription
//! is currently in place. Several observers may share one address; only the
//! first one causes a device Subscribe and only the removal of the last one
//! causes a device Unsubscribe.
//!
//! The registry never calls observers itself. Operations that produce
//! events return a [`Notification`] which the engine delivers after the
//! registry lock has been released, so observers may call back into the
//! engine.

use ecp_core::{EcpError, ParameterAddress};
use std::collections::BTreeMap;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

/// Change reported to observers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionEvent {
    /// The device pushed (or returned on subscribe) a value
    Value {
        address: ParameterAddress,
        old: Option<i32>,
        new: i32,
    },
    /// The connection was lost; the value may be out of date until the
    /// subscription is restored
    Stale { address: ParameterAddress },
}

impl SubscriptionEvent {
    pub fn address(&self) -> ParameterAddress {
        match self {
            SubscriptionEvent::Value { address, .. } | SubscriptionEvent::Stale { address } => {
                *address
            }
        }
    }
}

/// Receiver of subscription events
///
/// Called on the engine's IO task: implementations must return quickly and
/// hand long work off, for instance through a [`ChannelObserver`]. A panic
/// in `notify` is caught and logged; it does not reach the IO task.
pub trait Observer: Send + Sync {
    fn notify(&self, event: &SubscriptionEvent);
}

impl<F> Observer for F
where
    F: Fn(&SubscriptionEvent) + Send + Sync,
{
    fn notify(&self, event: &SubscriptionEvent) {
        self(event)
    }
}

/// Observer forwarding events into an unbounded channel
#[derive(Debug, Clone)]
pub struct ChannelObserver {
    sender: mpsc::UnboundedSender<SubscriptionEvent>,
}

impl ChannelObserver {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<SubscriptionEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl Observer for ChannelObserver {
    fn notify(&self, event: &SubscriptionEvent) {
        if self.sender.send(event.clone()).is_err() {
            log::trace!("observer channel for {} closed", event.address());
        }
    }
}

/// Identifies one observer registration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle {
    address: ParameterAddress,
    id: u64,
}

impl SubscriptionHandle {
    pub fn address(&self) -> ParameterAddress {
        self.address
    }

    pub fn id(&self) -> u64 {
        self.id
    }
}

/// Device-side status of a subscription
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Subscribe sent, reply outstanding
    Pending,
    /// Confirmed by the device on the current connection
    Active,
    /// Connection lost since the last confirmation
    Stale,
}

/// What the caller of [`SubscriptionRegistry::add_observer`] must do next
#[derive(Debug)]
pub enum Join {
    /// No device subscription is in place or in flight: send a Subscribe
    Subscribe,
    /// Another Subscribe for the address is in flight; the receiver leaves
    /// `Pending` once it settles
    Wait(watch::Receiver<SubscriptionState>),
    /// The device subscription is confirmed
    Shared,
}

/// Result of [`SubscriptionRegistry::remove_observer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// The handle was not registered
    Unknown,
    /// Other observers still use the address
    Remaining,
    /// The last observer is gone and the address was dropped
    Last {
        /// Whether the device may still hold the subscription
        device_subscribed: bool,
    },
}

/// Event paired with the observers that must receive it
#[must_use = "notifications do nothing until delivered"]
pub struct Notification {
    observers: Vec<Arc<dyn Observer>>,
    event: SubscriptionEvent,
}

impl Notification {
    pub fn event(&self) -> &SubscriptionEvent {
        &self.event
    }

    /// Call every observer, in registration order
    ///
    /// A panicking observer is logged and skipped; the others still run.
    pub fn deliver(self) {
        for observer in &self.observers {
            let notified = panic::catch_unwind(AssertUnwindSafe(|| observer.notify(&self.event)));
            if notified.is_err() {
                log::error!("observer of {} panicked on {:?}", self.event.address(), self.event);
            }
        }
    }
}

impl fmt::Debug for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Notification")
            .field("observers", &self.observers.len())
            .field("event", &self.event)
            .finish()
    }
}

struct Subscription {
    last_value: Option<i32>,
    state: watch::Sender<SubscriptionState>,
    /// Why the last device Subscribe failed, while stale
    failure: Option<EcpError>,
    observers: Vec<(u64, Arc<dyn Observer>)>,
}

impl Subscription {
    fn new() -> Self {
        Self {
            last_value: None,
            state: watch::channel(SubscriptionState::Pending).0,
            failure: None,
            observers: Vec::new(),
        }
    }

    fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    fn set_state(&mut self, state: SubscriptionState) {
        if state != SubscriptionState::Stale {
            self.failure = None;
        }
        self.state.send_replace(state);
    }

    fn notification(&self, event: SubscriptionEvent) -> Notification {
        Notification {
            observers: self.observers.iter().map(|(_, o)| Arc::clone(o)).collect(),
            event,
        }
    }
}

/// Subscriptions of one engine
#[derive(Default)]
pub struct SubscriptionRegistry {
    entries: BTreeMap<ParameterAddress, Subscription>,
    next_observer_id: u64,
}

impl fmt::Debug for SubscriptionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.entries
                    .iter()
                    .map(|(address, entry)| (address, (entry.state(), entry.last_value, entry.observers.len()))),
            )
            .finish()
    }
}

impl SubscriptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `observer` for `address`
    ///
    /// The first observer of an address, and any observer of a stale one,
    /// gets [`Join::Subscribe`] and moves the entry to `Pending`. Observers
    /// arriving while that Subscribe is in flight get [`Join::Wait`].
    pub fn add_observer(
        &mut self,
        address: ParameterAddress,
        observer: Arc<dyn Observer>,
    ) -> (SubscriptionHandle, Join) {
        self.next_observer_id += 1;
        let id = self.next_observer_id;
        let entry = self.entries.entry(address).or_insert_with(Subscription::new);
        entry.observers.push((id, observer));

        let join = match entry.state() {
            SubscriptionState::Active => Join::Shared,
            SubscriptionState::Pending if entry.observers.len() > 1 => Join::Wait(entry.state.subscribe()),
            SubscriptionState::Pending | SubscriptionState::Stale => {
                entry.set_state(SubscriptionState::Pending);
                Join::Subscribe
            }
        };
        (SubscriptionHandle { address, id }, join)
    }

    /// Unregister the observer behind `handle`
    pub fn remove_observer(&mut self, handle: &SubscriptionHandle) -> Removal {
        let Some(entry) = self.entries.get_mut(&handle.address) else {
            return Removal::Unknown;
        };
        let Some(index) = entry.observers.iter().position(|(id, _)| *id == handle.id) else {
            return Removal::Unknown;
        };
        entry.observers.remove(index);
        if !entry.observers.is_empty() {
            return Removal::Remaining;
        }

        let device_subscribed = entry.state() != SubscriptionState::Stale;
        self.entries.remove(&handle.address);
        Removal::Last { device_subscribed }
    }

    /// Record that the device confirmed the subscription
    ///
    /// A value carried by the confirmation is stored and reported.
    pub fn mark_active(&mut self, address: ParameterAddress, value: Option<i32>) -> Option<Notification> {
        let entry = self.entries.get_mut(&address)?;
        entry.set_state(SubscriptionState::Active);
        let new = value?;
        let old = entry.last_value.replace(new);
        Some(entry.notification(SubscriptionEvent::Value { address, old, new }))
    }

    /// Record that the device side of `address` is not in place
    pub fn mark_stale(&mut self, address: ParameterAddress) {
        if let Some(entry) = self.entries.get_mut(&address) {
            entry.set_state(SubscriptionState::Stale);
        }
    }

    /// Record that the device refused or never answered a Subscribe
    ///
    /// Observers waiting on the Subscribe see the entry turn stale and can
    /// fetch `error` through [`failure`](Self::failure).
    pub fn mark_failed(&mut self, address: ParameterAddress, error: &EcpError) {
        if let Some(entry) = self.entries.get_mut(&address) {
            entry.failure = Some(error.clone());
            entry.set_state(SubscriptionState::Stale);
        }
    }

    pub fn failure(&self, address: &ParameterAddress) -> Option<EcpError> {
        self.entries.get(address).and_then(|entry| entry.failure.clone())
    }

    /// Store a pushed value
    ///
    /// Returns `None` for addresses nobody observes.
    pub fn on_push(&mut self, address: ParameterAddress, value: i32) -> Option<Notification> {
        let entry = self.entries.get_mut(&address)?;
        let old = entry.last_value.replace(value);
        Some(entry.notification(SubscriptionEvent::Value {
            address,
            old,
            new: value,
        }))
    }

    /// Mark every subscription stale after a connection loss
    pub fn mark_all_stale(&mut self) -> Vec<Notification> {
        self.entries
            .iter_mut()
            .map(|(address, entry)| {
                entry.set_state(SubscriptionState::Stale);
                entry.notification(SubscriptionEvent::Stale { address: *address })
            })
            .collect()
    }

    /// Addresses to resubscribe on a fresh connection
    ///
    /// Every returned address moves to `Pending`, so a second call before
    /// the next connection loss returns nothing.
    pub fn restorable(&mut self) -> Vec<ParameterAddress> {
        self.entries
            .iter_mut()
            .filter(|(_, entry)| entry.state() == SubscriptionState::Stale)
            .map(|(address, entry)| {
                entry.set_state(SubscriptionState::Pending);
                *address
            })
            .collect()
    }

    pub fn last_value(&self, address: &ParameterAddress) -> Option<i32> {
        self.entries.get(address).and_then(|entry| entry.last_value)
    }

    pub fn state(&self, address: &ParameterAddress) -> Option<SubscriptionState> {
        self.entries.get(address).map(Subscription::state)
    }

    pub fn observer_count(&self, address: &ParameterAddress) -> usize {
        self.entries.get(address).map_or(0, |entry| entry.observers.len())
    }

    pub fn addresses(&self) -> Vec<ParameterAddress> {
        self.entries.keys().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    fn recorder() -> (Arc<dyn Observer>, Arc<Mutex<Vec<SubscriptionEvent>>>) {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let observer: Arc<dyn Observer> =
            Arc::new(move |event: &SubscriptionEvent| sink.lock().push(event.clone()));
        (observer, events)
    }

    #[test]
    fn test_first_observer_needs_device() {
        let mut registry = SubscriptionRegistry::new();
        let address = ParameterAddress::new(7);
        let (a, _) = recorder();
        let (b, _) = recorder();

        let (first, join_first) = registry.add_observer(address, a);
        let (second, join_second) = registry.add_observer(address, b);
        assert!(matches!(join_first, Join::Subscribe));
        assert!(matches!(join_second, Join::Wait(_)));
        assert_ne!(first, second);
        assert_eq!(registry.observer_count(&address), 2);

        assert_eq!(registry.remove_observer(&first), Removal::Remaining);
        assert_eq!(registry.remove_observer(&first), Removal::Unknown);
        assert_eq!(
            registry.remove_observer(&second),
            Removal::Last {
                device_subscribed: true
            }
        );
        assert!(registry.is_empty());
    }

    #[test]
    fn test_push_notifies_in_order() {
        let mut registry = SubscriptionRegistry::new();
        let address = ParameterAddress::new(7);
        let order = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let order = Arc::clone(&order);
            let observer: Arc<dyn Observer> =
                Arc::new(move |_: &SubscriptionEvent| order.lock().push(tag));
            registry.add_observer(address, observer);
        }

        assert!(registry.on_push(ParameterAddress::new(8), 1).is_none());

        let notification = registry.on_push(address, 3).unwrap();
        assert_eq!(
            notification.event(),
            &SubscriptionEvent::Value {
                address,
                old: None,
                new: 3
            }
        );
        notification.deliver();
        assert_eq!(*order.lock(), vec!["first", "second"]);

        let notification = registry.on_push(address, 4).unwrap();
        assert_eq!(
            notification.event(),
            &SubscriptionEvent::Value {
                address,
                old: Some(3),
                new: 4
            }
        );
        assert_eq!(registry.last_value(&address), Some(4));
    }

    #[test]
    fn test_stale_and_restore() {
        let mut registry = SubscriptionRegistry::new();
        let (observer, events) = recorder();
        let a = ParameterAddress::new(1);
        let b = ParameterAddress::new(2);
        registry.add_observer(b, Arc::clone(&observer));
        registry.add_observer(a, observer);
        assert!(registry.mark_active(a, Some(10)).is_some());
        assert!(registry.mark_active(b, None).is_none());

        for notification in registry.mark_all_stale() {
            notification.deliver();
        }
        assert_eq!(registry.state(&a), Some(SubscriptionState::Stale));
        assert!(events.lock().contains(&SubscriptionEvent::Stale { address: b }));
        // the last value survives the connection loss
        assert_eq!(registry.last_value(&a), Some(10));

        assert_eq!(registry.restorable(), vec![a, b]);
        assert!(registry.restorable().is_empty());
        assert_eq!(registry.state(&b), Some(SubscriptionState::Pending));
    }

    #[test]
    fn test_last_stale_removal_skips_device() {
        let mut registry = SubscriptionRegistry::new();
        let (observer, _) = recorder();
        let address = ParameterAddress::new(3);
        let (handle, _) = registry.add_observer(address, observer);
        registry.mark_stale(address);
        assert_eq!(
            registry.remove_observer(&handle),
            Removal::Last {
                device_subscribed: false
            }
        );
    }

    #[test]
    fn test_channel_observer() {
        let (observer, mut receiver) = ChannelObserver::new();
        let event = SubscriptionEvent::Stale {
            address: ParameterAddress::with_channel(4, 2),
        };
        observer.notify(&event);
        assert_eq!(receiver.try_recv().unwrap(), event);
        drop(receiver);
        // a closed channel is not an error
        observer.notify(&event);
    }

    #[test]
    fn test_waiter_sees_failure() {
        let mut registry = SubscriptionRegistry::new();
        let address = ParameterAddress::new(7);
        let (a, _) = recorder();
        let (b, _) = recorder();
        let (first, _) = registry.add_observer(address, a);
        let (_, join) = registry.add_observer(address, b);
        let mut status = match join {
            Join::Wait(status) => status,
            other => panic!("second observer should wait, got {:?}", other),
        };
        assert!(!status.has_changed().unwrap());

        let error = EcpError::Protocol { code: 5, message: "no such parameter".into() };
        assert_eq!(registry.remove_observer(&first), Removal::Remaining);
        registry.mark_failed(address, &error);

        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), SubscriptionState::Stale);
        let failure = registry.failure(&address).unwrap();
        assert_eq!(failure.to_string(), error.to_string());
    }

    #[test]
    fn test_join_follows_device_state() {
        let mut registry = SubscriptionRegistry::new();
        let address = ParameterAddress::new(9);
        let (observer, _) = recorder();
        registry.add_observer(address, Arc::clone(&observer));
        registry.mark_active(address, None);

        let (_, join) = registry.add_observer(address, Arc::clone(&observer));
        assert!(matches!(join, Join::Shared));

        registry.mark_failed(address, &EcpError::Timeout);
        let (_, join) = registry.add_observer(address, observer);
        assert!(matches!(join, Join::Subscribe));
        assert_eq!(registry.state(&address), Some(SubscriptionState::Pending));
        // a fresh attempt forgets the old failure
        assert!(registry.failure(&address).is_none());
    }

    #[test]
    fn test_panicking_observer_is_isolated() {
        let mut registry = SubscriptionRegistry::new();
        let address = ParameterAddress::new(7);
        fn faulty(_: &SubscriptionEvent) {
            panic!("observer bug");
        }
        let faulty: Arc<dyn Observer> = Arc::new(faulty);
        let (observer, events) = recorder();
        registry.add_observer(address, faulty);
        registry.add_observer(address, observer);

        registry.on_push(address, 1).unwrap().deliver();
        registry.on_push(address, 2).unwrap().deliver();
        assert_eq!(events.lock().len(), 2);
        assert_eq!(registry.last_value(&address), Some(2));
    }
}
