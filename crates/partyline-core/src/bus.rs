//! The façade contract shared by the production client and the in-memory
//! test double.
//!
//! Code that talks to the bus should depend on [`MessageBus`] rather than
//! a concrete client, so tests can swap in the loopback double without
//! touching the code under test.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::codec::Payload;
use crate::errors::BusError;
use crate::message::{MessageHandler, RecoveryHandler, ReplyHandler};

/// Number of replies a request waits for when none is given.
pub const DEFAULT_EXPECTED_REPLIES: usize = 1;

/// Options forwarded to the transport when subscribing, and replayed
/// verbatim on recovery.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscribeOptions {
    /// Distribution-group name. Subscribers sharing a queue split the
    /// subject's traffic instead of each receiving every message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl SubscribeOptions {
    /// Options with a queue group set.
    #[must_use]
    pub fn with_queue(queue: impl Into<String>) -> Self {
        Self {
            queue: Some(queue.into()),
        }
    }
}

/// Options controlling a scatter/gather request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestOptions {
    /// Replies to wait for before delivering. `0` completes immediately
    /// with an empty result and no transport traffic.
    #[serde(default = "default_expected")]
    pub expected: usize,
    /// Deadline after which whatever has arrived is delivered. `None`
    /// waits indefinitely.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
}

fn default_expected() -> usize {
    DEFAULT_EXPECTED_REPLIES
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            expected: DEFAULT_EXPECTED_REPLIES,
            timeout: None,
        }
    }
}

impl RequestOptions {
    /// Wait for `expected` replies.
    #[must_use]
    pub fn expecting(expected: usize) -> Self {
        Self {
            expected,
            timeout: None,
        }
    }

    /// Set the delivery deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// Client-side façade over a pub/sub broker.
///
/// Implementations contain failure: a bad message, an undecodable body, or
/// a panicking handler is logged and isolated, never propagated into
/// unrelated subscriptions.
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Register `handler` for `subject` and ask the broker to deliver
    /// matching traffic.
    ///
    /// Registering the same subject again replaces the previous handler.
    /// The intent outlives the connection: it is replayed after every
    /// reconnect.
    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError>;

    /// Publish `message` to `subject`. `None` publishes an absent body.
    async fn publish(&self, subject: &str, message: Option<Payload>) -> Result<(), BusError>;

    /// Publish with a reply inbox attached, so receivers can respond
    /// directly.
    async fn publish_with_inbox(
        &self,
        subject: &str,
        message: Option<Payload>,
        inbox: &str,
    ) -> Result<(), BusError>;

    /// Issue a scatter/gather request, driving `handler` with one event
    /// per reply plus at most one timeout notification.
    async fn request(
        &self,
        subject: &str,
        message: Option<Payload>,
        options: RequestOptions,
        handler: Arc<dyn ReplyHandler>,
    ) -> Result<(), BusError>;

    /// Issue a request and wait for the aggregated replies: the full set
    /// once `expected` arrive, or a partial set at the deadline.
    async fn synchronous_request(
        &self,
        subject: &str,
        message: Option<Payload>,
        options: RequestOptions,
    ) -> Result<Vec<Payload>, BusError>;

    /// Drop the subscription for `subject`, locally and at the broker.
    async fn unsubscribe(&self, subject: &str) -> Result<(), BusError>;

    /// Replace the recovery callback run after each reconnect.
    fn recover(&self, callback: Arc<dyn RecoveryHandler>);

    /// Whether the underlying connection is currently live.
    fn is_connected(&self) -> bool;
}
