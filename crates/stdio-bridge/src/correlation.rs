//! Correlation engine - pairs subprocess replies with pending requests.
//!
//! Waiters queue in dispatch order. Every decoded output message resolves at
//! most one waiter:
//! - **FIFO**: the head of the queue, regardless of content
//! - **Identifier**: the waiter whose JSON-RPC `id` matches the reply; a
//!   message without a matching id falls back to the head of the queue
//!
//! Each waiter is taken out of the queue by exactly one of resolve, expire,
//! cancel or fail_all. Removal happens under the queue mutex and moves the
//! completion sender out, so the losing path finds nothing and is a no-op.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::RelayError;
use crate::stats::RelayStats;

/// Outcome delivered to a waiter.
pub type Completion = Result<Value, RelayError>;

/// How replies are matched to requests.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum CorrelationMode {
    /// Nth reply resolves the Nth outstanding request.
    Fifo,
    /// Match on JSON-RPC `id`, FIFO for anything that does not match.
    #[default]
    #[value(name = "id")]
    #[serde(rename = "id")]
    Identifier,
}

/// JSON-RPC identifier used to match a response to its request.
#[derive(Debug, Clone, PartialEq)]
pub struct RequestKey(Value);

impl RequestKey {
    /// Key of an outbound request: an object with a `method` and a non-null `id`.
    pub fn for_request(message: &Value) -> Option<Self> {
        let object = message.as_object()?;
        if !object.contains_key("method") {
            return None;
        }
        Self::from_id(object.get("id")?)
    }

    /// Key of an inbound response: an object with a non-null `id` and no `method`.
    ///
    /// Requests initiated by the subprocess carry their own id space and never
    /// produce a key.
    pub fn for_response(message: &Value) -> Option<Self> {
        let object = message.as_object()?;
        if object.contains_key("method") {
            return None;
        }
        Self::from_id(object.get("id")?)
    }

    fn from_id(id: &Value) -> Option<Self> {
        match id {
            Value::String(_) | Value::Number(_) => Some(Self(id.clone())),
            _ => None,
        }
    }
}

struct Pending {
    ticket: u64,
    key: Option<RequestKey>,
    slot: oneshot::Sender<Completion>,
}

#[derive(Default)]
struct Queue {
    next_ticket: u64,
    pending: VecDeque<Pending>,
}

impl Queue {
    fn take(&mut self, ticket: u64) -> Option<Pending> {
        let index = self.pending.iter().position(|p| p.ticket == ticket)?;
        self.pending.remove(index)
    }
}

/// A request awaiting its reply.
///
/// Dropping a waiter does not remove it from the queue: the request was
/// already written, so its reply must still be consumed by this entry. The
/// deadline timer removes it eventually.
pub struct Waiter {
    ticket: u64,
    rx: oneshot::Receiver<Completion>,
    deadline: JoinHandle<()>,
}

impl Waiter {
    pub fn ticket(&self) -> u64 {
        self.ticket
    }

    /// Wait for the reply, the deadline, or shutdown.
    pub async fn wait(self) -> Completion {
        let result = self.rx.await.unwrap_or(Err(RelayError::ShuttingDown));
        self.deadline.abort();
        result
    }
}

pub struct Correlator {
    mode: CorrelationMode,
    queue: StdMutex<Queue>,
    stats: Arc<RelayStats>,
}

impl Correlator {
    pub fn new(mode: CorrelationMode, stats: Arc<RelayStats>) -> Self {
        Self {
            mode,
            queue: StdMutex::new(Queue::default()),
            stats,
        }
    }

    pub fn mode(&self) -> CorrelationMode {
        self.mode
    }

    /// Lock the queue. On poison, recover the inner state: every operation
    /// leaves the queue consistent before it can panic.
    fn lock(&self) -> MutexGuard<'_, Queue> {
        match self.queue.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Correlation queue mutex poisoned - recovering");
                poisoned.into_inner()
            }
        }
    }

    /// Append a waiter for `request` and arm its deadline.
    ///
    /// Must run inside a tokio runtime. Callers serialize enqueue with the
    /// write to the subprocess so queue order equals wire order.
    pub fn enqueue(self: &Arc<Self>, request: &Value, timeout: Duration) -> Waiter {
        let key = match self.mode {
            CorrelationMode::Fifo => None,
            CorrelationMode::Identifier => RequestKey::for_request(request),
        };
        let (tx, rx) = oneshot::channel();

        let (ticket, pending) = {
            let mut queue = self.lock();
            let ticket = queue.next_ticket;
            queue.next_ticket += 1;
            queue.pending.push_back(Pending {
                ticket,
                key,
                slot: tx,
            });
            (ticket, queue.pending.len())
        };
        tracing::debug!(ticket, pending, "Enqueued waiter");

        let correlator = Arc::clone(self);
        let deadline = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            correlator.expire(ticket, timeout);
        });

        Waiter {
            ticket,
            rx,
            deadline,
        }
    }

    /// Deliver a decoded subprocess message. Returns false if no waiter claimed it.
    pub fn resolve(&self, message: Value) -> bool {
        let claimed = {
            let mut queue = self.lock();
            let index = match self.mode {
                CorrelationMode::Fifo => (!queue.pending.is_empty()).then_some(0),
                CorrelationMode::Identifier => RequestKey::for_response(&message)
                    .and_then(|key| {
                        queue
                            .pending
                            .iter()
                            .position(|p| p.key.as_ref() == Some(&key))
                    })
                    .or_else(|| (!queue.pending.is_empty()).then_some(0)),
            };
            index.and_then(|i| queue.pending.remove(i))
        };

        match claimed {
            Some(pending) => {
                tracing::debug!(ticket = pending.ticket, "Resolved waiter");
                if pending.slot.send(Ok(message)).is_err() {
                    tracing::debug!(
                        ticket = pending.ticket,
                        "Waiter receiver dropped before reply arrived"
                    );
                }
                true
            }
            None => {
                self.stats.record_unclaimed_output();
                tracing::warn!(
                    message_id = ?message.get("id"),
                    "Dropping subprocess message with no pending request"
                );
                false
            }
        }
    }

    /// Fail a waiter with `Timeout` if it is still pending, wherever it sits.
    pub fn expire(&self, ticket: u64, after: Duration) -> bool {
        let Some(pending) = self.lock().take(ticket) else {
            return false;
        };
        self.stats.record_timeout();
        tracing::warn!(ticket, timeout_ms = after.as_millis() as u64, "Request timed out");
        let _ = pending.slot.send(Err(RelayError::Timeout(after)));
        true
    }

    /// Remove a waiter without completing it (its request was never written)
    /// and stop its deadline timer.
    pub fn cancel(&self, waiter: Waiter) -> bool {
        waiter.deadline.abort();
        let ticket = waiter.ticket;
        let removed = self.lock().take(ticket).is_some();
        if removed {
            tracing::debug!(ticket, "Cancelled waiter");
        }
        removed
    }

    /// Fail every pending waiter with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: RelayError) -> usize {
        let drained: Vec<Pending> = self.lock().pending.drain(..).collect();
        let count = drained.len();
        for pending in drained {
            let _ = pending.slot.send(Err(error.clone()));
        }
        if count > 0 {
            tracing::info!(count, %error, "Failed pending requests");
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.lock().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const LONG: Duration = Duration::from_secs(60);

    fn correlator(mode: CorrelationMode) -> (Arc<Correlator>, Arc<RelayStats>) {
        let stats = Arc::new(RelayStats::new());
        (Arc::new(Correlator::new(mode, Arc::clone(&stats))), stats)
    }

    fn request(id: i64) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "method": "echo"})
    }

    fn reply(id: i64) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "result": id})
    }

    #[test]
    fn request_key_rules() {
        assert!(RequestKey::for_request(&request(1)).is_some());
        assert!(RequestKey::for_request(&json!({"method": "x", "id": "abc"})).is_some());
        // notifications and null ids have no key
        assert!(RequestKey::for_request(&json!({"method": "x"})).is_none());
        assert!(RequestKey::for_request(&json!({"method": "x", "id": null})).is_none());
        assert!(RequestKey::for_request(&json!([request(1)])).is_none());
        // a response is not a request
        assert!(RequestKey::for_request(&reply(1)).is_none());

        assert_eq!(
            RequestKey::for_response(&reply(1)),
            RequestKey::for_request(&request(1))
        );
        assert!(RequestKey::for_response(&json!({"id": 1, "method": "sampling"})).is_none());
        assert!(RequestKey::for_response(&json!({"id": null, "error": {}})).is_none());
        assert_ne!(
            RequestKey::for_response(&json!({"id": "1"})),
            RequestKey::for_response(&json!({"id": 1}))
        );
    }

    #[tokio::test]
    async fn fifo_resolves_in_queue_order() {
        let (correlator, _) = correlator(CorrelationMode::Fifo);
        let first = correlator.enqueue(&request(1), LONG);
        let second = correlator.enqueue(&request(2), LONG);

        // FIFO ignores ids entirely
        assert!(correlator.resolve(reply(2)));
        assert!(correlator.resolve(reply(1)));

        assert_eq!(first.wait().await, Ok(reply(2)));
        assert_eq!(second.wait().await, Ok(reply(1)));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn unclaimed_message_is_dropped_and_counted() {
        let (correlator, stats) = correlator(CorrelationMode::Fifo);

        assert!(!correlator.resolve(reply(1)));
        assert_eq!(stats.snapshot().unclaimed_outputs, 1);

        // a later waiter does not receive the earlier message
        let waiter = correlator.enqueue(&request(2), LONG);
        assert!(correlator.resolve(reply(2)));
        assert_eq!(waiter.wait().await, Ok(reply(2)));
    }

    #[tokio::test]
    async fn identifier_mode_matches_out_of_order_replies() {
        let (correlator, _) = correlator(CorrelationMode::Identifier);
        let waiters: Vec<_> = (1..=3)
            .map(|id| correlator.enqueue(&request(id), LONG))
            .collect();

        for id in [3, 1, 2] {
            assert!(correlator.resolve(reply(id)));
        }

        for (waiter, id) in waiters.into_iter().zip(1..=3) {
            assert_eq!(waiter.wait().await, Ok(reply(id)));
        }
    }

    #[tokio::test]
    async fn identifier_mode_falls_back_to_queue_head() {
        let (correlator, stats) = correlator(CorrelationMode::Identifier);
        let first = correlator.enqueue(&request(10), LONG);
        let second = correlator.enqueue(&request(11), LONG);
        let third = correlator.enqueue(&request(12), LONG);

        // a reply with a known id still goes to its own waiter
        assert!(correlator.resolve(reply(11)));
        assert_eq!(second.wait().await, Ok(reply(11)));

        // null id (JSON-RPC parse / invalid request errors) takes the head
        let error = json!({"jsonrpc": "2.0", "id": null, "error": {"code": -32600, "message": "Invalid Request"}});
        assert!(correlator.resolve(error.clone()));
        assert_eq!(first.wait().await, Ok(error));

        // unknown id also takes the head
        assert!(correlator.resolve(reply(99)));
        assert_eq!(third.wait().await, Ok(reply(99)));
        assert_eq!(stats.snapshot().unclaimed_outputs, 0);

        assert!(!correlator.resolve(reply(12)));
        assert_eq!(stats.snapshot().unclaimed_outputs, 1);
    }

    #[tokio::test]
    async fn identifier_mode_echo_resolves_in_order() {
        let (correlator, _) = correlator(CorrelationMode::Identifier);
        let waiters: Vec<_> = (1..=3)
            .map(|id| correlator.enqueue(&request(id), LONG))
            .collect();

        // an echoed request carries `method`, so it never matches by key
        for id in 1..=3 {
            assert!(correlator.resolve(request(id)));
        }

        for (waiter, id) in waiters.into_iter().zip(1..=3) {
            assert_eq!(waiter.wait().await, Ok(request(id)));
        }
    }

    #[tokio::test]
    async fn duplicate_ids_resolve_oldest_first() {
        let (correlator, _) = correlator(CorrelationMode::Identifier);
        let first = correlator.enqueue(&request(1), LONG);
        let second = correlator.enqueue(&request(1), LONG);

        assert!(correlator.resolve(json!({"id": 1, "result": "a"})));
        assert!(correlator.resolve(json!({"id": 1, "result": "b"})));

        assert_eq!(first.wait().await, Ok(json!({"id": 1, "result": "a"})));
        assert_eq!(second.wait().await, Ok(json!({"id": 1, "result": "b"})));
    }

    #[tokio::test(start_paused = true)]
    async fn deadline_expires_waiter() {
        let (correlator, stats) = correlator(CorrelationMode::Fifo);
        let timeout = Duration::from_secs(8);
        let started = tokio::time::Instant::now();

        let waiter = correlator.enqueue(&request(1), timeout);
        let result = waiter.wait().await;

        assert_eq!(result, Err(RelayError::Timeout(timeout)));
        let elapsed = started.elapsed();
        assert!(elapsed >= timeout, "expired early: {elapsed:?}");
        assert!(elapsed < timeout + Duration::from_millis(10), "expired late: {elapsed:?}");
        assert_eq!(correlator.pending(), 0);
        assert_eq!(stats.snapshot().timed_out, 1);

        // a late reply finds nobody waiting
        assert!(!correlator.resolve(reply(1)));
        assert_eq!(stats.snapshot().unclaimed_outputs, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn later_waiter_can_expire_before_head() {
        let (correlator, _) = correlator(CorrelationMode::Fifo);
        let slow = correlator.enqueue(&request(1), Duration::from_secs(30));
        let fast = correlator.enqueue(&request(2), Duration::from_secs(1));

        assert_eq!(
            fast.wait().await,
            Err(RelayError::Timeout(Duration::from_secs(1)))
        );
        assert_eq!(correlator.pending(), 1);

        // the head is still resolvable after a non-head expiry
        assert!(correlator.resolve(reply(1)));
        assert_eq!(slow.wait().await, Ok(reply(1)));
    }

    #[tokio::test]
    async fn expire_after_resolve_is_noop() {
        let (correlator, stats) = correlator(CorrelationMode::Fifo);
        let waiter = correlator.enqueue(&request(1), LONG);
        let ticket = waiter.ticket();

        assert!(correlator.resolve(reply(1)));
        assert!(!correlator.expire(ticket, LONG));
        assert_eq!(waiter.wait().await, Ok(reply(1)));
        assert_eq!(stats.snapshot().timed_out, 0);
    }

    #[tokio::test]
    async fn cancel_removes_without_completing() {
        let (correlator, stats) = correlator(CorrelationMode::Fifo);
        let cancelled = correlator.enqueue(&request(1), LONG);
        let next = correlator.enqueue(&request(2), LONG);
        let ticket = cancelled.ticket();

        assert!(correlator.cancel(cancelled));
        assert!(!correlator.expire(ticket, LONG));

        // the next reply goes to the remaining waiter
        assert!(correlator.resolve(reply(2)));
        assert_eq!(next.wait().await, Ok(reply(2)));

        // the aborted deadline task released its handle on the correlator
        for _ in 0..100 {
            if Arc::strong_count(&correlator) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(Arc::strong_count(&correlator), 1);
        assert_eq!(stats.snapshot().timed_out, 0);
    }

    #[tokio::test]
    async fn fail_all_drains_queue() {
        let (correlator, _) = correlator(CorrelationMode::Identifier);
        let a = correlator.enqueue(&request(1), LONG);
        let b = correlator.enqueue(&json!({"x": 1}), LONG);

        assert_eq!(correlator.fail_all(RelayError::ShuttingDown), 2);
        assert_eq!(correlator.pending(), 0);
        assert_eq!(a.wait().await, Err(RelayError::ShuttingDown));
        assert_eq!(b.wait().await, Err(RelayError::ShuttingDown));
    }

    #[tokio::test]
    async fn dropped_waiter_still_consumes_its_reply() {
        let (correlator, _) = correlator(CorrelationMode::Fifo);
        let abandoned = correlator.enqueue(&request(1), LONG);
        let next = correlator.enqueue(&request(2), LONG);
        drop(abandoned);

        assert!(correlator.resolve(reply(1)));
        assert!(correlator.resolve(reply(2)));
        assert_eq!(next.wait().await, Ok(reply(2)));
    }

    #[test]
    fn correlation_mode_serializes_lowercase() {
        insta::assert_json_snapshot!(
            [CorrelationMode::Fifo, CorrelationMode::Identifier],
            @r###"
        [
          "fifo",
          "id"
        ]
        "###
        );
    }
}
