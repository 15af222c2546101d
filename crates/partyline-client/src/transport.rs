//! The broker capability consumed by the client.
//!
//! partyline speaks no wire protocol itself. An injected [`Transport`]
//! owns the socket, reconnect pacing, and server selection; the client
//! sees inbound traffic as a single [`TransportIncoming`] stream and the
//! connection lifecycle as broadcast [`ConnectionEvent`]s.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use partyline_core::{BusConfig, SubscribeOptions};

/// Opaque transport-assigned subscription handle. Request correlations
/// share the same id space, since a request is a short-lived subscription
/// on a reply inbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl std::fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Inbound traffic delivered by the transport.
#[derive(Debug, Clone)]
pub enum TransportIncoming {
    /// A message for a subscription, or a reply for a request correlation.
    Message {
        /// Subscription or correlation the message belongs to.
        sid: SubscriptionId,
        /// Subject the message arrived on.
        subject: String,
        /// Raw body. `None` when the publisher sent no body at all.
        payload: Option<Bytes>,
        /// Reply inbox, when the publisher attached one.
        reply_inbox: Option<String>,
    },
    /// A broker-side request deadline fired before the expected reply
    /// count was reached.
    RequestTimeout {
        /// Correlation whose deadline fired.
        sid: SubscriptionId,
    },
}

/// Connection lifecycle notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// The connection dropped; the transport is retrying on its own.
    Disconnected,
    /// The transport re-established a connection.
    Reconnected,
}

/// Failures reported by transport implementations.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Establishing the initial connection failed.
    #[error("failed to connect to the broker: {reason}")]
    ConnectFailed {
        /// Transport-specific description.
        reason: String,
    },
    /// An operation was attempted while the connection is down.
    #[error("not connected to the broker")]
    NotConnected,
    /// A subject-scoped operation failed.
    #[error("{operation} failed for subject '{subject}': {reason}")]
    Operation {
        /// Operation that failed (`"subscribe"`, `"publish"`, ...).
        operation: &'static str,
        /// Subject the operation targeted.
        subject: String,
        /// Transport-specific description.
        reason: String,
    },
}

/// Broker client capability injected into the façade.
///
/// Implementations own every wire concern, including the retry policy and
/// server-list handling described by [`BusConfig`]. Two contract points
/// the client depends on:
///
/// - replies for a correlation must not appear on the inbound stream
///   before the [`request`](Transport::request) call that created it
///   returns;
/// - [`timeout`](Transport::timeout) fires at most once per correlation,
///   and only when fewer than `expected` replies have been delivered.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Establish the connection and hand over the inbound stream.
    ///
    /// Called at most once per transport instance.
    async fn connect(
        &self,
        config: &BusConfig,
    ) -> Result<mpsc::Receiver<TransportIncoming>, TransportError>;

    /// Publish a raw body to `subject`, optionally carrying a reply inbox.
    async fn publish(
        &self,
        subject: &str,
        payload: Option<Bytes>,
        reply_inbox: Option<&str>,
    ) -> Result<(), TransportError>;

    /// Start delivering `subject` traffic on the inbound stream.
    async fn subscribe(
        &self,
        subject: &str,
        options: &SubscribeOptions,
    ) -> Result<SubscriptionId, TransportError>;

    /// Stop delivering traffic for `sid`.
    async fn unsubscribe(&self, sid: SubscriptionId) -> Result<(), TransportError>;

    /// Publish a request and return its reply correlation.
    async fn request(
        &self,
        subject: &str,
        payload: Option<Bytes>,
        expected: usize,
    ) -> Result<SubscriptionId, TransportError>;

    /// Arm the broker-side deadline for a correlation: deliver a
    /// [`TransportIncoming::RequestTimeout`] if fewer than `expected`
    /// replies arrive within `after`.
    async fn timeout(
        &self,
        sid: SubscriptionId,
        after: Duration,
        expected: usize,
    ) -> Result<(), TransportError>;

    /// Subscribe to connection lifecycle notifications.
    fn lifecycle(&self) -> broadcast::Receiver<ConnectionEvent>;

    /// Whether the transport currently holds a live connection.
    fn is_connected(&self) -> bool;
}
