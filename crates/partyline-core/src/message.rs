//! Handler traits and the values they receive.
//!
//! All three callback seams are async traits with blanket impls for plain
//! closures, so simple handlers stay one-liners while anything that needs
//! to await can implement the trait directly.

use async_trait::async_trait;

use crate::codec::Payload;

/// A decoded message handed to a subscription handler.
#[derive(Debug, Clone, PartialEq)]
pub struct Delivery {
    /// Subject the message arrived on.
    pub subject: String,
    /// Decoded body. [`Payload::Null`] for absent bodies, error-shaped for
    /// bodies that failed to decode.
    pub payload: Payload,
    /// Inbox subject for direct replies, when the publisher attached one.
    pub reply_inbox: Option<String>,
}

/// Subscription callback invoked once per delivered message.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one delivered message.
    async fn handle(&self, delivery: Delivery);
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Delivery) + Send + Sync,
{
    async fn handle(&self, delivery: Delivery) {
        self(delivery);
    }
}

/// One notification on a request's reply stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplyEvent {
    /// A decoded reply, error-shaped when the body failed to decode.
    Reply(Payload),
    /// The deadline elapsed before the expected reply count was reached.
    TimedOut,
}

/// Continuation for the streaming request variant: one call per reply,
/// plus at most one [`ReplyEvent::TimedOut`].
#[async_trait]
pub trait ReplyHandler: Send + Sync {
    /// Handle one reply-stream event.
    async fn on_reply(&self, event: ReplyEvent);
}

#[async_trait]
impl<F> ReplyHandler for F
where
    F: Fn(ReplyEvent) + Send + Sync,
{
    async fn on_reply(&self, event: ReplyEvent) {
        self(event);
    }
}

/// Callback run once per recovery cycle, after the transport reconnects
/// and before subscriptions are replayed.
#[async_trait]
pub trait RecoveryHandler: Send + Sync {
    /// React to a completed reconnect.
    async fn on_recovery(&self);
}

#[async_trait]
impl<F> RecoveryHandler for F
where
    F: Fn() + Send + Sync,
{
    async fn on_recovery(&self) {
        self();
    }
}

/// The default recovery callback: does nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopRecovery;

#[async_trait]
impl RecoveryHandler for NoopRecovery {
    async fn on_recovery(&self) {}
}
