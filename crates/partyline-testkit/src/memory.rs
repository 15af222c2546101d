//! The in-memory bus double.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use partyline_core::{
    BusError, Delivery, MessageBus, MessageHandler, NoopRecovery, Payload, RecoveryHandler,
    ReplyEvent, ReplyHandler, RequestOptions, SubscribeOptions, codec,
};

/// One ledger entry: a message as it was handed to the bus, before codec
/// normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    /// Subject the message was published to.
    pub subject: String,
    /// Message exactly as given, `None` for an absent body.
    pub message: Option<Payload>,
    /// Reply inbox attached to the message, when there was one.
    pub inbox: Option<String>,
}

struct ActiveRequest {
    inbox: String,
    handler: Arc<dyn ReplyHandler>,
}

/// Loopback [`MessageBus`] with a ledger and a scripting surface.
///
/// Differences from the production client, all deliberate:
///
/// - `subscribe` appends, so every handler ever registered for a subject
///   receives its traffic. Tests often layer expectations on one subject.
/// - Dispatch is synchronous: when `publish` returns, every handler has
///   already run, and a handler panic propagates straight into the test.
/// - Delivered payloads pass through the real codec round trip, so they
///   look exactly like production decode output.
pub struct InMemoryBus {
    handlers: Mutex<HashMap<String, Vec<Arc<dyn MessageHandler>>>>,
    requests: Mutex<HashMap<String, ActiveRequest>>,
    scripted: Mutex<HashMap<String, Vec<Payload>>>,
    published: Mutex<Vec<PublishedMessage>>,
    published_synchronous: Mutex<Vec<PublishedMessage>>,
    recovery: Mutex<Arc<dyn RecoveryHandler>>,
}

impl Default for InMemoryBus {
    fn default() -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            requests: Mutex::new(HashMap::new()),
            scripted: Mutex::new(HashMap::new()),
            published: Mutex::new(Vec::new()),
            published_synchronous: Mutex::new(Vec::new()),
            recovery: Mutex::new(Arc::new(NoopRecovery)),
        }
    }
}

impl InMemoryBus {
    /// A fresh bus with nothing subscribed, scripted, or recorded.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drive the continuation of the in-flight request on `subject` with
    /// one normalized reply. Callable repeatedly to stream several.
    ///
    /// # Panics
    ///
    /// Panics when no request is in flight on `subject`, which in a test
    /// means the code under test never asked.
    pub async fn respond_to_request(&self, subject: &str, reply: Payload) {
        let handler = {
            let requests = self.requests.lock();
            match requests.get(subject) {
                Some(active) => Arc::clone(&active.handler),
                None => panic!("no request in flight on {subject:?}"),
            }
        };
        let normalized = codec::normalize(Some(&reply));
        handler.on_reply(ReplyEvent::Reply(normalized)).await;
    }

    /// Script the replies every later `synchronous_request` on `subject`
    /// returns. Replies are normalized up front.
    pub fn respond_to_synchronous_request(&self, subject: &str, replies: Vec<Payload>) {
        let normalized = replies
            .iter()
            .map(|reply| codec::normalize(Some(reply)))
            .collect();
        let _ = self.scripted.lock().insert(subject.to_owned(), normalized);
    }

    /// Invoke the stored recovery callback, as a reconnect would.
    pub async fn do_recovery(&self) {
        let callback = Arc::clone(&*self.recovery.lock());
        callback.on_recovery().await;
    }

    /// Everything published so far, oldest first.
    #[must_use]
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().clone()
    }

    /// Whether anything was published to `subject`.
    #[must_use]
    pub fn has_published(&self, subject: &str) -> bool {
        self.published
            .lock()
            .iter()
            .any(|entry| entry.subject == subject)
    }

    /// Whether exactly `message` was published to `subject`.
    #[must_use]
    pub fn has_published_with_message(&self, subject: &str, message: &Payload) -> bool {
        self.published
            .lock()
            .iter()
            .any(|entry| entry.subject == subject && entry.message.as_ref() == Some(message))
    }

    /// Every synchronous request issued so far, oldest first.
    #[must_use]
    pub fn published_synchronous(&self) -> Vec<PublishedMessage> {
        self.published_synchronous.lock().clone()
    }

    /// Whether a synchronous request was issued on `subject`.
    #[must_use]
    pub fn has_requested_synchronously(&self, subject: &str) -> bool {
        self.published_synchronous
            .lock()
            .iter()
            .any(|entry| entry.subject == subject)
    }

    /// Forget both ledgers. Subscriptions, scripts, and in-flight
    /// requests survive.
    pub fn clear_published(&self) {
        self.published.lock().clear();
        self.published_synchronous.lock().clear();
    }

    /// Deliver to every handler on `subject`, in registration order, then
    /// to the continuation of any request whose inbox is `subject`.
    async fn deliver(&self, subject: &str, message: Option<Payload>, inbox: Option<String>) {
        let normalized = codec::normalize(message.as_ref());
        self.published.lock().push(PublishedMessage {
            subject: subject.to_owned(),
            message,
            inbox: inbox.clone(),
        });

        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .handlers
            .lock()
            .get(subject)
            .cloned()
            .unwrap_or_default();
        for handler in handlers {
            handler
                .handle(Delivery {
                    subject: subject.to_owned(),
                    payload: normalized.clone(),
                    reply_inbox: inbox.clone(),
                })
                .await;
        }

        let continuation = self
            .requests
            .lock()
            .values()
            .find(|active| active.inbox == subject)
            .map(|active| Arc::clone(&active.handler));
        if let Some(handler) = continuation {
            handler.on_reply(ReplyEvent::Reply(normalized)).await;
        }
    }
}

#[async_trait]
impl MessageBus for InMemoryBus {
    async fn subscribe(
        &self,
        subject: &str,
        _options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        self.handlers
            .lock()
            .entry(subject.to_owned())
            .or_default()
            .push(handler);
        Ok(())
    }

    async fn publish(&self, subject: &str, message: Option<Payload>) -> Result<(), BusError> {
        self.deliver(subject, message, None).await;
        Ok(())
    }

    async fn publish_with_inbox(
        &self,
        subject: &str,
        message: Option<Payload>,
        inbox: &str,
    ) -> Result<(), BusError> {
        self.deliver(subject, message, Some(inbox.to_owned())).await;
        Ok(())
    }

    async fn request(
        &self,
        subject: &str,
        message: Option<Payload>,
        options: RequestOptions,
        handler: Arc<dyn ReplyHandler>,
    ) -> Result<(), BusError> {
        if options.expected == 0 {
            return Ok(());
        }
        let inbox = format!("_INBOX.{}", Uuid::now_v7().simple());
        let _ = self.requests.lock().insert(
            subject.to_owned(),
            ActiveRequest {
                inbox: inbox.clone(),
                handler,
            },
        );
        self.deliver(subject, message, Some(inbox)).await;
        Ok(())
    }

    async fn synchronous_request(
        &self,
        subject: &str,
        message: Option<Payload>,
        options: RequestOptions,
    ) -> Result<Vec<Payload>, BusError> {
        if options.expected == 0 {
            return Ok(Vec::new());
        }
        self.published_synchronous.lock().push(PublishedMessage {
            subject: subject.to_owned(),
            message,
            inbox: None,
        });
        let replies = self
            .scripted
            .lock()
            .get(subject)
            .cloned()
            .unwrap_or_default();
        Ok(replies)
    }

    async fn unsubscribe(&self, subject: &str) -> Result<(), BusError> {
        let _ = self.handlers.lock().remove(subject);
        let _ = self.requests.lock().remove(subject);
        Ok(())
    }

    fn recover(&self, callback: Arc<dyn RecoveryHandler>) {
        *self.recovery.lock() = callback;
    }

    fn is_connected(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn capturing_handler() -> (Arc<dyn MessageHandler>, Arc<Mutex<Vec<Delivery>>>) {
        let seen: Arc<Mutex<Vec<Delivery>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let handler: Arc<dyn MessageHandler> = Arc::new(move |delivery: Delivery| {
            sink.lock().push(delivery);
        });
        (handler, seen)
    }

    fn capturing_reply_handler() -> (Arc<dyn ReplyHandler>, Arc<Mutex<Vec<ReplyEvent>>>) {
        let events: Arc<Mutex<Vec<ReplyEvent>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&events);
        let handler: Arc<dyn ReplyHandler> = Arc::new(move |event: ReplyEvent| {
            sink.lock().push(event);
        });
        (handler, events)
    }

    // ── publish / subscribe ──

    #[tokio::test]
    async fn every_registered_handler_receives_in_registration_order() {
        let bus: Arc<dyn MessageBus> = Arc::new(InMemoryBus::new());
        let order: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&order);
        bus.subscribe(
            "orders.created",
            SubscribeOptions::default(),
            Arc::new(move |_: Delivery| first.lock().push("first")),
        )
        .await
        .expect("subscribes");
        let second = Arc::clone(&order);
        bus.subscribe(
            "orders.created",
            SubscribeOptions::default(),
            Arc::new(move |_: Delivery| second.lock().push("second")),
        )
        .await
        .expect("subscribes");

        bus.publish("orders.created", Some(json!({"id": 1})))
            .await
            .expect("publishes");

        assert_eq!(*order.lock(), vec!["first", "second"]);
    }

    #[tokio::test]
    async fn delivery_is_synchronous() {
        let bus = InMemoryBus::new();
        let (handler, seen) = capturing_handler();
        bus.subscribe("orders.created", SubscribeOptions::default(), handler)
            .await
            .expect("subscribes");

        bus.publish("orders.created", Some(json!({"id": 1})))
            .await
            .expect("publishes");

        assert_eq!(seen.lock().len(), 1, "handler ran before publish returned");
    }

    #[tokio::test]
    async fn payloads_match_production_decode_output() {
        let bus = InMemoryBus::new();
        let (handler, seen) = capturing_handler();
        bus.subscribe("orders.created", SubscribeOptions::default(), handler)
            .await
            .expect("subscribes");

        // A raw string holding JSON arrives parsed, as off a real wire.
        bus.publish("orders.created", Some(json!(r#"{"id": 7}"#)))
            .await
            .expect("publishes");
        // An absent body arrives as explicit null.
        bus.publish("orders.created", None).await.expect("publishes");
        // An unparseable raw string arrives error-shaped.
        bus.publish("orders.created", Some(json!("{broken")))
            .await
            .expect("publishes");

        let seen = seen.lock();
        assert_eq!(seen[0].payload, json!({"id": 7}));
        assert_eq!(seen[1].payload, Payload::Null);
        assert!(seen[2].payload.get("error").is_some());
    }

    #[tokio::test]
    async fn unsubscribe_drops_all_handlers_for_the_subject() {
        let bus = InMemoryBus::new();
        let (handler, seen) = capturing_handler();
        bus.subscribe("orders.created", SubscribeOptions::default(), handler)
            .await
            .expect("subscribes");
        bus.unsubscribe("orders.created").await.expect("unsubscribes");

        bus.publish("orders.created", Some(json!(1)))
            .await
            .expect("publishes");

        assert!(seen.lock().is_empty());
    }

    // ── ledger ──

    #[tokio::test]
    async fn ledger_records_messages_as_given() {
        let bus = InMemoryBus::new();
        bus.publish("orders.created", Some(json!({"id": 7})))
            .await
            .expect("publishes");
        bus.publish("workers.heartbeat", None).await.expect("publishes");
        bus.publish_with_inbox("orders.created", Some(json!(2)), "_INBOX.fixed")
            .await
            .expect("publishes");

        assert!(bus.has_published("orders.created"));
        assert!(!bus.has_published("orders.deleted"));
        assert!(bus.has_published_with_message("orders.created", &json!({"id": 7})));
        assert!(!bus.has_published_with_message("orders.created", &json!({"id": 8})));

        let published = bus.published();
        assert_eq!(published[1].message, None);
        assert_eq!(published[2].inbox.as_deref(), Some("_INBOX.fixed"));
    }

    #[tokio::test]
    async fn clear_published_empties_both_ledgers() {
        let bus = InMemoryBus::new();
        bus.publish("orders.created", None).await.expect("publishes");
        let _ = bus
            .synchronous_request("services.discover", None, RequestOptions::default())
            .await
            .expect("requests");

        bus.clear_published();

        assert!(bus.published().is_empty());
        assert!(bus.published_synchronous().is_empty());
    }

    // ── requests ──

    #[tokio::test]
    async fn request_delivers_with_a_minted_inbox() {
        let bus = InMemoryBus::new();
        let (handler, seen) = capturing_handler();
        bus.subscribe("services.discover", SubscribeOptions::default(), handler)
            .await
            .expect("subscribes");
        let (reply_handler, _events) = capturing_reply_handler();

        bus.request(
            "services.discover",
            Some(json!({"name": "router"})),
            RequestOptions::default(),
            reply_handler,
        )
        .await
        .expect("requests");

        let seen = seen.lock();
        let inbox = seen[0].reply_inbox.as_deref().expect("inbox attached");
        assert!(inbox.starts_with("_INBOX."), "got: {inbox}");
        assert_eq!(bus.published()[0].inbox.as_deref(), Some(inbox));
    }

    #[tokio::test]
    async fn publishing_to_the_inbox_reaches_the_requester() {
        let bus = InMemoryBus::new();
        let (handler, seen) = capturing_handler();
        bus.subscribe("services.discover", SubscribeOptions::default(), handler)
            .await
            .expect("subscribes");
        let (reply_handler, events) = capturing_reply_handler();
        bus.request("services.discover", None, RequestOptions::default(), reply_handler)
            .await
            .expect("requests");

        let inbox = seen.lock()[0].reply_inbox.clone().expect("inbox attached");
        bus.publish(&inbox, Some(json!({"node": "a"})))
            .await
            .expect("publishes");

        assert_eq!(
            *events.lock(),
            vec![ReplyEvent::Reply(json!({"node": "a"}))]
        );
    }

    #[tokio::test]
    async fn respond_to_request_streams_normalized_replies() {
        let bus = InMemoryBus::new();
        let (reply_handler, events) = capturing_reply_handler();
        bus.request("services.discover", None, RequestOptions::default(), reply_handler)
            .await
            .expect("requests");

        bus.respond_to_request("services.discover", json!(r#"{"node": "a"}"#))
            .await;
        bus.respond_to_request("services.discover", json!({"node": "b"}))
            .await;

        assert_eq!(
            *events.lock(),
            vec![
                ReplyEvent::Reply(json!({"node": "a"})),
                ReplyEvent::Reply(json!({"node": "b"})),
            ]
        );
    }

    #[tokio::test]
    #[should_panic(expected = "no request in flight")]
    async fn responding_without_a_request_panics() {
        let bus = InMemoryBus::new();
        bus.respond_to_request("services.discover", json!(1)).await;
    }

    #[tokio::test]
    async fn zero_expected_request_is_inert() {
        let bus = InMemoryBus::new();
        let (reply_handler, events) = capturing_reply_handler();
        bus.request(
            "services.discover",
            Some(json!(1)),
            RequestOptions::expecting(0),
            reply_handler,
        )
        .await
        .expect("requests");

        assert!(bus.published().is_empty());
        assert!(events.lock().is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_drops_the_stored_continuation() {
        let bus = InMemoryBus::new();
        let (handler, seen) = capturing_handler();
        bus.subscribe("services.discover", SubscribeOptions::default(), handler)
            .await
            .expect("subscribes");
        let (reply_handler, events) = capturing_reply_handler();
        bus.request("services.discover", None, RequestOptions::default(), reply_handler)
            .await
            .expect("requests");
        let inbox = seen.lock()[0].reply_inbox.clone().expect("inbox attached");

        bus.unsubscribe("services.discover").await.expect("unsubscribes");
        bus.publish(&inbox, Some(json!("late"))).await.expect("publishes");

        assert!(events.lock().is_empty());
    }

    // ── synchronous requests ──

    #[tokio::test]
    async fn synchronous_request_returns_scripted_replies() {
        let bus = InMemoryBus::new();
        bus.respond_to_synchronous_request(
            "services.discover",
            vec![json!({"node": "a"}), json!({"node": "b"})],
        );

        let replies = bus
            .synchronous_request(
                "services.discover",
                Some(json!({"name": "router"})),
                RequestOptions::expecting(2),
            )
            .await
            .expect("requests");

        assert_eq!(replies, vec![json!({"node": "a"}), json!({"node": "b"})]);
        assert!(bus.has_requested_synchronously("services.discover"));
        assert_eq!(
            bus.published_synchronous()[0].message,
            Some(json!({"name": "router"}))
        );
    }

    #[tokio::test]
    async fn scripted_replies_are_normalized_and_repeatable() {
        let bus = InMemoryBus::new();
        bus.respond_to_synchronous_request("services.discover", vec![json!(r#"{"node": "a"}"#)]);

        for _ in 0..2 {
            let replies = bus
                .synchronous_request("services.discover", None, RequestOptions::default())
                .await
                .expect("requests");
            assert_eq!(replies, vec![json!({"node": "a"})]);
        }
    }

    #[tokio::test]
    async fn unscripted_synchronous_request_returns_nothing() {
        let bus = InMemoryBus::new();
        let replies = bus
            .synchronous_request("services.discover", None, RequestOptions::default())
            .await
            .expect("requests");

        assert!(replies.is_empty());
        assert!(bus.has_requested_synchronously("services.discover"));
    }

    #[tokio::test]
    async fn zero_expected_synchronous_request_skips_the_ledger() {
        let bus = InMemoryBus::new();
        let replies = bus
            .synchronous_request("services.discover", None, RequestOptions::expecting(0))
            .await
            .expect("requests");

        assert!(replies.is_empty());
        assert!(!bus.has_requested_synchronously("services.discover"));
    }

    // ── recovery ──

    #[tokio::test]
    async fn do_recovery_runs_the_latest_callback() {
        let bus = InMemoryBus::new();
        let runs: Arc<Mutex<Vec<&'static str>>> = Arc::new(Mutex::new(Vec::new()));

        let first = Arc::clone(&runs);
        bus.recover(Arc::new(move || first.lock().push("first")));
        let second = Arc::clone(&runs);
        bus.recover(Arc::new(move || second.lock().push("second")));

        bus.do_recovery().await;
        bus.do_recovery().await;

        assert_eq!(*runs.lock(), vec!["second", "second"]);
    }

    #[tokio::test]
    async fn the_double_reports_connected() {
        let bus = InMemoryBus::new();
        assert!(bus.is_connected());
        bus.do_recovery().await;
    }
}
