//! Scatter/gather request state.
//!
//! One [`PendingRequest`] per in-flight request, keyed by the transport
//! correlation id. The table is owned by the dispatch loop, which
//! serializes registration, replies, and deadline signals; completion
//! evicts the entry, and that eviction is the at-most-once delivery
//! guard. Anything arriving for an evicted correlation is a late signal
//! and is dropped with a trace log.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;
use tracing::{debug, trace};

use partyline_core::{Payload, ReplyEvent, ReplyHandler};

use crate::transport::SubscriptionId;

/// How a request delivers its replies.
pub(crate) enum DeliveryMode {
    /// Accumulate replies in arrival order and hand the whole vector to a
    /// waiting caller.
    Collect {
        results: Vec<Payload>,
        tx: oneshot::Sender<Vec<Payload>>,
    },
    /// Drive a continuation with one event per reply.
    Stream { handler: Arc<dyn ReplyHandler> },
}

impl DeliveryMode {
    pub(crate) fn collect(tx: oneshot::Sender<Vec<Payload>>) -> Self {
        Self::Collect {
            results: Vec::new(),
            tx,
        }
    }

    pub(crate) fn stream(handler: Arc<dyn ReplyHandler>) -> Self {
        Self::Stream { handler }
    }
}

struct PendingRequest {
    expected: usize,
    received: usize,
    mode: DeliveryMode,
}

impl PendingRequest {
    /// Complete a collecting request with whatever has arrived.
    fn deliver_collected(self) {
        if let DeliveryMode::Collect { results, tx } = self.mode {
            // The caller may have given up waiting; that is fine.
            let _ = tx.send(results);
        }
    }
}

/// Table of in-flight requests, owned by the dispatch loop.
#[derive(Default)]
pub(crate) struct PendingRequests {
    inner: HashMap<SubscriptionId, PendingRequest>,
}

impl PendingRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Register an issued request under its correlation id.
    pub(crate) fn insert(&mut self, sid: SubscriptionId, expected: usize, mode: DeliveryMode) {
        let _ = self.inner.insert(
            sid,
            PendingRequest {
                expected,
                received: 0,
                mode,
            },
        );
    }

    /// Whether `sid` is an in-flight correlation.
    pub(crate) fn contains(&self, sid: SubscriptionId) -> bool {
        self.inner.contains_key(&sid)
    }

    /// Number of in-flight requests.
    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.inner.len()
    }

    /// Route one decoded reply.
    ///
    /// Returns the continuation to drive for streaming requests; the
    /// collecting variant delivers through its channel when the expected
    /// count is reached.
    pub(crate) fn on_reply(
        &mut self,
        sid: SubscriptionId,
        payload: Payload,
    ) -> Option<(Arc<dyn ReplyHandler>, ReplyEvent)> {
        let Some(pending) = self.inner.get_mut(&sid) else {
            trace!(sid = %sid, "dropping reply for completed or unknown correlation");
            return None;
        };
        pending.received += 1;
        let complete = pending.received >= pending.expected;
        let notification = match &mut pending.mode {
            DeliveryMode::Collect { results, .. } => {
                results.push(payload);
                None
            }
            DeliveryMode::Stream { handler } => {
                Some((Arc::clone(handler), ReplyEvent::Reply(payload)))
            }
        };
        if complete {
            if let Some(finished) = self.inner.remove(&sid) {
                finished.deliver_collected();
            }
        }
        notification
    }

    /// Route a deadline signal: deliver partial results, or hand back the
    /// continuation to receive the timeout notification. Signals for
    /// completed correlations are no-ops.
    pub(crate) fn on_timeout(&mut self, sid: SubscriptionId) -> Option<Arc<dyn ReplyHandler>> {
        let Some(pending) = self.inner.remove(&sid) else {
            trace!(sid = %sid, "ignoring deadline for completed or unknown correlation");
            return None;
        };
        debug!(
            sid = %sid,
            received = pending.received,
            expected = pending.expected,
            "request deadline reached, delivering partial results"
        );
        match pending.mode {
            DeliveryMode::Collect { results, tx } => {
                let _ = tx.send(results);
                None
            }
            DeliveryMode::Stream { handler } => Some(handler),
        }
    }

    /// Complete everything still in flight, so no caller waits on a dead
    /// transport. Returns the streaming continuations that should receive
    /// the timeout notification.
    pub(crate) fn drain(&mut self) -> Vec<Arc<dyn ReplyHandler>> {
        let mut handlers = Vec::new();
        for (_, pending) in self.inner.drain() {
            match pending.mode {
                DeliveryMode::Collect { results, tx } => {
                    let _ = tx.send(results);
                }
                DeliveryMode::Stream { handler } => handlers.push(handler),
            }
        }
        handlers
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde_json::json;

    fn recording_handler() -> (Arc<dyn ReplyHandler>, Arc<Mutex<Vec<ReplyEvent>>>) {
        let events: Arc<Mutex<Vec<ReplyEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handler: Arc<dyn ReplyHandler> = Arc::new(move |event: ReplyEvent| {
            sink.lock().push(event);
        });
        (handler, events)
    }

    // ── collect mode ──

    #[test]
    fn collect_delivers_once_expected_count_arrives() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(SubscriptionId(1), 2, DeliveryMode::collect(tx));

        assert!(pending.on_reply(SubscriptionId(1), json!("first")).is_none());
        assert!(rx.try_recv().is_err(), "not delivered before the count");
        assert!(pending.on_reply(SubscriptionId(1), json!("second")).is_none());

        let results = rx.try_recv().expect("delivered at the count");
        assert_eq!(results, vec![json!("first"), json!("second")]);
        assert!(!pending.contains(SubscriptionId(1)), "entry evicted");
    }

    #[test]
    fn collect_preserves_arrival_order() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(SubscriptionId(1), 3, DeliveryMode::collect(tx));

        for n in 0..3 {
            let _ = pending.on_reply(SubscriptionId(1), json!(n));
        }
        let results = rx.try_recv().expect("delivered");
        assert_eq!(results, vec![json!(0), json!(1), json!(2)]);
    }

    #[test]
    fn deadline_delivers_partial_results() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(SubscriptionId(9), 5, DeliveryMode::collect(tx));

        let _ = pending.on_reply(SubscriptionId(9), json!(1));
        let _ = pending.on_reply(SubscriptionId(9), json!(2));
        assert!(pending.on_timeout(SubscriptionId(9)).is_none());

        let results = rx.try_recv().expect("partial delivery at the deadline");
        assert_eq!(results, vec![json!(1), json!(2)]);
    }

    #[test]
    fn deadline_after_completion_is_a_no_op() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(SubscriptionId(4), 1, DeliveryMode::collect(tx));

        let _ = pending.on_reply(SubscriptionId(4), json!("only"));
        assert_eq!(rx.try_recv().expect("delivered"), vec![json!("only")]);

        assert!(pending.on_timeout(SubscriptionId(4)).is_none());
    }

    #[test]
    fn late_reply_after_completion_is_dropped() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(SubscriptionId(4), 1, DeliveryMode::collect(tx));

        let _ = pending.on_reply(SubscriptionId(4), json!("first"));
        assert!(pending.on_reply(SubscriptionId(4), json!("late")).is_none());
        assert_eq!(rx.try_recv().expect("delivered"), vec![json!("first")]);
    }

    #[test]
    fn reply_for_unknown_correlation_is_dropped() {
        let mut pending = PendingRequests::new();
        assert!(pending.on_reply(SubscriptionId(99), json!("stray")).is_none());
        assert!(pending.on_timeout(SubscriptionId(99)).is_none());
    }

    // ── stream mode ──

    #[test]
    fn stream_hands_back_one_notification_per_reply() {
        let mut pending = PendingRequests::new();
        let (handler, _events) = recording_handler();
        pending.insert(SubscriptionId(2), 2, DeliveryMode::stream(handler));

        let (_, first) = pending
            .on_reply(SubscriptionId(2), json!("a"))
            .expect("notification for the first reply");
        assert_eq!(first, ReplyEvent::Reply(json!("a")));

        let (_, second) = pending
            .on_reply(SubscriptionId(2), json!("b"))
            .expect("notification for the final reply");
        assert_eq!(second, ReplyEvent::Reply(json!("b")));

        assert!(!pending.contains(SubscriptionId(2)), "evicted at the count");
        assert!(pending.on_reply(SubscriptionId(2), json!("late")).is_none());
    }

    #[test]
    fn stream_deadline_hands_back_the_continuation() {
        let mut pending = PendingRequests::new();
        let (handler, _events) = recording_handler();
        pending.insert(SubscriptionId(3), 2, DeliveryMode::stream(handler));

        let _ = pending.on_reply(SubscriptionId(3), json!("only"));
        assert!(pending.on_timeout(SubscriptionId(3)).is_some());
        assert!(pending.on_timeout(SubscriptionId(3)).is_none(), "second signal ignored");
    }

    // ── drain ──

    #[test]
    fn drain_completes_collectors_and_returns_stream_handlers() {
        let mut pending = PendingRequests::new();
        let (tx, mut rx) = oneshot::channel();
        pending.insert(SubscriptionId(1), 3, DeliveryMode::collect(tx));
        let (handler, _events) = recording_handler();
        pending.insert(SubscriptionId(2), 1, DeliveryMode::stream(handler));
        let _ = pending.on_reply(SubscriptionId(1), json!("partial"));

        let handlers = pending.drain();
        assert_eq!(handlers.len(), 1);
        assert_eq!(rx.try_recv().expect("partial delivered"), vec![json!("partial")]);
        assert_eq!(pending.len(), 0);
    }
}
