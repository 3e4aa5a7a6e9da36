//! Pending-request table
//!
//! Every request written to the device has an entry here until it is
//! resolved by a reply, rejected by a device error, expired by the timeout
//! sweep, failed by a connection loss or cancelled by its caller. Replies
//! only name the command kind and the address, so entries are grouped by
//! [`CorrelationKey`] and each group is resolved oldest first.

use crate::config::OverlapPolicy;
use ecp_core::{Command, CorrelationKey, EcpError, EcpResult};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Weak;
use std::task::{Context, Poll};
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Identifier of a pending request, unique per table
pub type RequestId = u64;

/// Outcome delivered to the caller: the value carried by the reply, if any
pub type Reply = EcpResult<Option<i32>>;

#[derive(Debug)]
struct PendingRequest {
    id: RequestId,
    command: Command,
    deadline: Instant,
    completion: oneshot::Sender<Reply>,
}

impl PendingRequest {
    fn complete(self, reply: Reply) {
        // The caller may have stopped waiting; nothing to do then.
        let _ = self.completion.send(reply);
    }
}

/// Outstanding requests keyed by correlation key
#[derive(Debug)]
pub struct PendingTable {
    entries: HashMap<CorrelationKey, VecDeque<PendingRequest>>,
    policy: OverlapPolicy,
    next_id: RequestId,
    len: usize,
}

impl Default for PendingTable {
    fn default() -> Self {
        Self::new(OverlapPolicy::default())
    }
}

impl PendingTable {
    pub fn new(policy: OverlapPolicy) -> Self {
        Self {
            entries: HashMap::new(),
            policy,
            next_id: 1,
            len: 0,
        }
    }

    /// Register a request
    ///
    /// # Errors
    /// `EcpError::Busy` under [`OverlapPolicy::Reject`] when a request with
    /// the same correlation key is outstanding
    pub fn submit(
        &mut self,
        command: Command,
        deadline: Instant,
    ) -> EcpResult<(RequestId, oneshot::Receiver<Reply>)> {
        let key = command.correlation_key();
        if self.policy == OverlapPolicy::Reject && self.contains(&key) {
            return Err(EcpError::Busy(key.to_string()));
        }

        let id = self.next_id;
        self.next_id += 1;
        let (completion, receiver) = oneshot::channel();
        self.entries.entry(key).or_default().push_back(PendingRequest {
            id,
            command,
            deadline,
            completion,
        });
        self.len += 1;
        Ok((id, receiver))
    }

    /// Complete the oldest request for `key` with `value`
    ///
    /// Returns `false` when nothing is waiting for this key.
    pub fn resolve(&mut self, key: &CorrelationKey, value: Option<i32>) -> bool {
        match self.pop_front(key) {
            Some(request) => {
                request.complete(Ok(value));
                true
            }
            None => false,
        }
    }

    /// Complete the oldest request that may be answered by a bare `ACK`
    pub fn resolve_ack(&mut self) -> bool {
        match self.oldest_key(|key| key.kind.accepts_bare_ack()) {
            Some(key) => self.resolve(&key, None),
            None => false,
        }
    }

    /// Fail the oldest request of any kind with `error`
    ///
    /// Used for device errors that do not say which request they answer.
    pub fn reject_oldest(&mut self, error: EcpError) -> bool {
        let Some(key) = self.oldest_key(|_| true) else {
            return false;
        };
        match self.pop_front(&key) {
            Some(request) => {
                request.complete(Err(error));
                true
            }
            None => false,
        }
    }

    /// Fail every request whose deadline has passed with `EcpError::Timeout`
    ///
    /// Returns the number of expired requests.
    pub fn expire_overdue(&mut self, now: Instant) -> usize {
        let mut expired = Vec::new();
        self.entries.retain(|_, queue| {
            let mut index = 0;
            while index < queue.len() {
                if queue[index].deadline <= now {
                    if let Some(request) = queue.remove(index) {
                        expired.push(request);
                    }
                } else {
                    index += 1;
                }
            }
            !queue.is_empty()
        });

        self.len -= expired.len();
        let count = expired.len();
        for request in expired {
            log::debug!("request {} ({}) timed out", request.id, request.command);
            request.complete(Err(EcpError::Timeout));
        }
        count
    }

    /// Fail every request with `EcpError::Disconnected`
    ///
    /// Returns the number of failed requests.
    pub fn fail_all(&mut self, reason: &str) -> usize {
        let count = self.len;
        for (_, queue) in self.entries.drain() {
            for request in queue {
                request.complete(Err(EcpError::disconnected(reason)));
            }
        }
        self.len = 0;
        count
    }

    /// Remove request `id` without completing it
    pub fn cancel(&mut self, key: &CorrelationKey, id: RequestId) -> bool {
        let Some(queue) = self.entries.get_mut(key) else {
            return false;
        };
        let Some(index) = queue.iter().position(|request| request.id == id) else {
            return false;
        };
        queue.remove(index);
        if queue.is_empty() {
            self.entries.remove(key);
        }
        self.len -= 1;
        true
    }

    /// Whether a request with `key` is outstanding
    pub fn contains(&self, key: &CorrelationKey) -> bool {
        self.entries.get(key).is_some_and(|queue| !queue.is_empty())
    }

    /// Earliest deadline among outstanding requests
    pub fn next_deadline(&self) -> Option<Instant> {
        self.entries
            .values()
            .flat_map(|queue| queue.iter().map(|request| request.deadline))
            .min()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn policy(&self) -> OverlapPolicy {
        self.policy
    }

    fn pop_front(&mut self, key: &CorrelationKey) -> Option<PendingRequest> {
        let queue = self.entries.get_mut(key)?;
        let request = queue.pop_front();
        if queue.is_empty() {
            self.entries.remove(key);
        }
        if request.is_some() {
            self.len -= 1;
        }
        request
    }

    /// Key of the oldest front entry among keys accepted by `filter`
    fn oldest_key(&self, filter: impl Fn(&CorrelationKey) -> bool) -> Option<CorrelationKey> {
        self.entries
            .iter()
            .filter(|(key, _)| filter(key))
            .filter_map(|(key, queue)| queue.front().map(|request| (request.id, *key)))
            .min_by_key(|(id, _)| *id)
            .map(|(_, key)| key)
    }
}

/// Something that can drop a pending entry on behalf of a [`ResponseHandle`]
pub trait CancelPending: Send + Sync {
    fn cancel_pending(&self, key: &CorrelationKey, id: RequestId);
}

impl CancelPending for Mutex<PendingTable> {
    fn cancel_pending(&self, key: &CorrelationKey, id: RequestId) {
        self.lock().cancel(key, id);
    }
}

/// Future resolving to the reply of one request
///
/// Dropping the handle before it resolves removes the request from the
/// table; the connection is left alone and a late reply is simply counted
/// as unmatched.
pub struct ResponseHandle {
    key: CorrelationKey,
    id: RequestId,
    receiver: oneshot::Receiver<Reply>,
    owner: Weak<dyn CancelPending>,
    finished: bool,
}

impl ResponseHandle {
    pub(crate) fn new(
        key: CorrelationKey,
        id: RequestId,
        receiver: oneshot::Receiver<Reply>,
        owner: Weak<dyn CancelPending>,
    ) -> Self {
        Self {
            key,
            id,
            receiver,
            owner,
            finished: false,
        }
    }

    pub fn id(&self) -> RequestId {
        self.id
    }

    pub fn key(&self) -> CorrelationKey {
        self.key
    }
}

impl fmt::Debug for ResponseHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseHandle")
            .field("key", &self.key)
            .field("id", &self.id)
            .field("finished", &self.finished)
            .finish()
    }
}

impl Future for ResponseHandle {
    type Output = Reply;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let polled = Pin::new(&mut self.receiver).poll(cx);
        match polled {
            Poll::Ready(result) => {
                self.finished = true;
                Poll::Ready(result.unwrap_or_else(|_| {
                    Err(EcpError::disconnected("request dropped by the engine"))
                }))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for ResponseHandle {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(owner) = self.owner.upgrade() {
            owner.cancel_pending(&self.key, self.id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ecp_core::{ErrorKind, ParameterAddress};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio_test::{assert_pending, assert_ready, task};

    fn address(id: u32) -> ParameterAddress {
        ParameterAddress::new(id)
    }

    fn later() -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    fn handle(table: &Arc<Mutex<PendingTable>>, command: Command) -> ResponseHandle {
        let (id, receiver) = table.lock().submit(command, later()).unwrap();
        let owner: Weak<dyn CancelPending> = Arc::downgrade(table) as Weak<dyn CancelPending>;
        ResponseHandle::new(command.correlation_key(), id, receiver, owner)
    }

    #[test]
    fn test_resolve_matches_key() {
        let table = Arc::new(Mutex::new(PendingTable::default()));
        let mut response = task::spawn(handle(&table, Command::get(address(12))));
        assert_pending!(response.poll());

        let other = Command::get(address(13)).correlation_key();
        assert!(!table.lock().resolve(&other, Some(1)));
        assert_pending!(response.poll());

        let key = Command::get(address(12)).correlation_key();
        assert!(table.lock().resolve(&key, Some(-20)));
        assert!(response.is_woken());
        match assert_ready!(response.poll()) {
            Ok(Some(value)) => assert_eq!(value, -20),
            other => panic!("unexpected reply {:?}", other),
        }
        assert!(table.lock().is_empty());
    }

    #[test]
    fn test_same_key_resolves_fifo() {
        let mut table = PendingTable::default();
        let (_, mut first) = table.submit(Command::get(address(1)), later()).unwrap();
        let (_, mut second) = table.submit(Command::get(address(1)), later()).unwrap();
        let key = Command::get(address(1)).correlation_key();

        assert!(table.resolve(&key, Some(10)));
        assert_eq!(first.try_recv().unwrap().unwrap(), Some(10));
        assert!(second.try_recv().is_err());

        assert!(table.resolve(&key, Some(11)));
        assert_eq!(second.try_recv().unwrap().unwrap(), Some(11));
        assert!(!table.resolve(&key, Some(12)));
    }

    #[test]
    fn test_reject_policy_reports_busy() {
        let mut table = PendingTable::new(OverlapPolicy::Reject);
        table.submit(Command::set(address(4), 1), later()).unwrap();
        let err = table.submit(Command::set(address(4), 2), later()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Busy);
        // a different key is still accepted
        assert!(table.submit(Command::get(address(4)), later()).is_ok());
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_ack_skips_gets() {
        let mut table = PendingTable::default();
        let (_, mut get) = table.submit(Command::get(address(1)), later()).unwrap();
        let (_, mut set) = table.submit(Command::set(address(2), 5), later()).unwrap();
        let (_, mut subscribe) = table.submit(Command::subscribe(address(3)), later()).unwrap();

        assert!(table.resolve_ack());
        assert_eq!(set.try_recv().unwrap().unwrap(), None);
        assert!(get.try_recv().is_err());
        assert!(subscribe.try_recv().is_err());

        assert!(table.resolve_ack());
        assert_eq!(subscribe.try_recv().unwrap().unwrap(), None);
        assert!(!table.resolve_ack());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_reject_oldest() {
        let mut table = PendingTable::default();
        let (_, mut first) = table.submit(Command::get(address(9)), later()).unwrap();
        let (_, mut second) = table.submit(Command::set(address(1), 0), later()).unwrap();

        assert!(table.reject_oldest(EcpError::Protocol {
            code: 0,
            message: "NAK".to_string()
        }));
        let err = first.try_recv().unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ProtocolError);
        assert!(second.try_recv().is_err());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_expire_overdue() {
        let mut table = PendingTable::default();
        let now = Instant::now();
        let (_, mut overdue) = table.submit(Command::get(address(1)), now).unwrap();
        let (_, mut fresh) = table.submit(Command::get(address(1)), now + Duration::from_secs(5)).unwrap();
        let (_, mut other) = table.submit(Command::get(address(2)), now).unwrap();

        assert_eq!(table.expire_overdue(now), 2);
        assert_eq!(overdue.try_recv().unwrap().unwrap_err().kind(), ErrorKind::Timeout);
        assert_eq!(other.try_recv().unwrap().unwrap_err().kind(), ErrorKind::Timeout);
        assert!(fresh.try_recv().is_err());
        assert_eq!(table.len(), 1);
        assert_eq!(table.next_deadline(), Some(now + Duration::from_secs(5)));

        // a late reply now resolves the remaining request, not the expired one
        let key = Command::get(address(1)).correlation_key();
        assert!(table.resolve(&key, Some(3)));
        assert_eq!(fresh.try_recv().unwrap().unwrap(), Some(3));
        assert!(!table.resolve(&Command::get(address(2)).correlation_key(), Some(3)));
    }

    #[test]
    fn test_fail_all() {
        let mut table = PendingTable::default();
        let mut receivers: Vec<_> = (0..5)
            .map(|i| table.submit(Command::get(address(i)), later()).unwrap().1)
            .collect();
        assert_eq!(table.fail_all("link down"), 5);
        assert!(table.is_empty());
        for receiver in receivers.iter_mut() {
            let err = receiver.try_recv().unwrap().unwrap_err();
            assert_eq!(err.kind(), ErrorKind::Disconnected);
        }
    }

    #[test]
    fn test_drop_cancels_entry() {
        let table = Arc::new(Mutex::new(PendingTable::default()));
        let response = handle(&table, Command::subscribe(address(7)));
        assert_eq!(table.lock().len(), 1);
        drop(response);
        assert!(table.lock().is_empty());

        let key = Command::subscribe(address(7)).correlation_key();
        assert!(!table.lock().resolve(&key, None));
    }

    #[test]
    fn test_drop_after_resolution_keeps_others() {
        let table = Arc::new(Mutex::new(PendingTable::default()));
        let mut first = task::spawn(handle(&table, Command::get(address(1))));
        let second = handle(&table, Command::get(address(1)));

        let key = Command::get(address(1)).correlation_key();
        table.lock().resolve(&key, Some(1));
        assert!(assert_ready!(first.poll()).is_ok());
        drop(first);
        assert_eq!(table.lock().len(), 1);
        drop(second);
        assert!(table.lock().is_empty());
    }

    #[test]
    fn test_cancel_unknown() {
        let mut table = PendingTable::default();
        let (id, _receiver) = table.submit(Command::get(address(1)), later()).unwrap();
        let key = Command::get(address(1)).correlation_key();
        assert!(!table.cancel(&key, id + 1));
        assert!(!table.cancel(&Command::get(address(2)).correlation_key(), id));
        assert!(table.cancel(&key, id));
        assert!(!table.cancel(&key, id));
    }
}
