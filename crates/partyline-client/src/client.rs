//! The production bus façade.
//!
//! [`BusClient`] ties the pieces together: the subscription registry, the
//! in-flight request table, and two background tasks. The dispatch loop is
//! the single owner of all inbound transport traffic and of the pending
//! request table; request issuance flows through it on a command channel,
//! so registering a correlation and routing its replies can never race.
//! Handler work always runs on spawned tasks, panic-isolated, never on
//! the loop itself.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::FutureExt;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use partyline_core::{
    BusConfig, BusError, Delivery, MessageBus, MessageHandler, Payload, RecoveryHandler,
    ReplyEvent, ReplyHandler, RequestOptions, SubscribeOptions, codec,
};

use crate::aggregator::{DeliveryMode, PendingRequests};
use crate::recovery::{RecoveryCoordinator, RecoveryState};
use crate::registry::SubscriptionRegistry;
use crate::transport::{Transport, TransportIncoming};

const COMMAND_BUFFER: usize = 64;

/// Request issuance handed to the dispatch loop.
struct IssueRequest {
    subject: String,
    body: Option<Bytes>,
    expected: usize,
    timeout: Option<Duration>,
    mode: DeliveryMode,
    issued: oneshot::Sender<Result<(), BusError>>,
}

/// Client-side façade over an injected broker [`Transport`].
///
/// Cheap to share behind an [`Arc`]; all methods take `&self`. Dropping
/// the client detaches the background tasks, which end once the transport
/// closes its inbound stream.
pub struct BusClient {
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    recovery: Arc<RecoveryState>,
    commands: mpsc::Sender<IssueRequest>,
    _dispatch: JoinHandle<()>,
    _recovery: JoinHandle<()>,
}

impl BusClient {
    /// Connect the transport and start the dispatch loop and recovery
    /// coordinator.
    pub async fn connect(
        transport: Arc<dyn Transport>,
        config: &BusConfig,
    ) -> Result<Self, BusError> {
        let incoming = transport
            .connect(config)
            .await
            .map_err(|error| BusError::transport("connect", error))?;
        // Subscribe to the lifecycle before anything is spawned so an
        // immediate disconnect is still observed.
        let lifecycle = transport.lifecycle();

        let registry = Arc::new(SubscriptionRegistry::new());
        let recovery = Arc::new(RecoveryState::new());
        let (commands, command_rx) = mpsc::channel(COMMAND_BUFFER);

        let dispatch = tokio::spawn(dispatch_loop(
            Arc::clone(&transport),
            incoming,
            command_rx,
            Arc::clone(&registry),
        ));
        let coordinator = RecoveryCoordinator::new(
            Arc::clone(&transport),
            Arc::clone(&registry),
            Arc::clone(&recovery),
        );
        let recovery_task = tokio::spawn(coordinator.run(lifecycle));

        Ok(Self {
            transport,
            registry,
            recovery,
            commands,
            _dispatch: dispatch,
            _recovery: recovery_task,
        })
    }

    /// Whether a recovery cycle is currently in flight.
    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.recovery.is_recovering()
    }

    /// Number of subjects currently registered.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.registry.len()
    }

    async fn issue(
        &self,
        subject: &str,
        message: Option<Payload>,
        options: &RequestOptions,
        mode: DeliveryMode,
    ) -> Result<(), BusError> {
        let (issued_tx, issued_rx) = oneshot::channel();
        let command = IssueRequest {
            subject: subject.to_owned(),
            body: codec::encode(message.as_ref()),
            expected: options.expected,
            timeout: options.timeout,
            mode,
            issued: issued_tx,
        };
        self.commands
            .send(command)
            .await
            .map_err(|_| BusError::Closed)?;
        issued_rx.await.map_err(|_| BusError::Closed)?
    }
}

#[async_trait]
impl MessageBus for BusClient {
    async fn subscribe(
        &self,
        subject: &str,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), BusError> {
        let previous = self.registry.insert(subject, options.clone(), handler);
        if let Some(old_sid) = previous.and_then(|record| record.sid) {
            if let Err(error) = self.transport.unsubscribe(old_sid).await {
                debug!(subject = %subject, sid = %old_sid, error = %error,
                    "failed to release replaced subscription");
            }
        }
        match self.transport.subscribe(subject, &options).await {
            Ok(sid) => {
                if !self.registry.set_sid(subject, sid) {
                    // Unsubscribed while the transport call was in flight;
                    // the fresh handle has no record and must be released.
                    if let Err(error) = self.transport.unsubscribe(sid).await {
                        debug!(subject = %subject, sid = %sid, error = %error,
                            "failed to release subscription removed mid-subscribe");
                    }
                }
            }
            Err(error) => {
                // The intent is durably recorded; the next recovery cycle
                // replays it.
                warn!(subject = %subject, error = %error,
                    "transport subscribe failed, deferring to recovery replay");
            }
        }
        Ok(())
    }

    async fn publish(&self, subject: &str, message: Option<Payload>) -> Result<(), BusError> {
        let body = codec::encode(message.as_ref());
        self.transport
            .publish(subject, body, None)
            .await
            .map_err(|error| BusError::transport("publish", error))
    }

    async fn publish_with_inbox(
        &self,
        subject: &str,
        message: Option<Payload>,
        inbox: &str,
    ) -> Result<(), BusError> {
        let body = codec::encode(message.as_ref());
        self.transport
            .publish(subject, body, Some(inbox))
            .await
            .map_err(|error| BusError::transport("publish", error))
    }

    async fn request(
        &self,
        subject: &str,
        message: Option<Payload>,
        options: RequestOptions,
        handler: Arc<dyn ReplyHandler>,
    ) -> Result<(), BusError> {
        if options.expected == 0 {
            // Nothing awaited, so nothing reaches the transport.
            return Ok(());
        }
        self.issue(subject, message, &options, DeliveryMode::stream(handler))
            .await
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
        let (tx, rx) = oneshot::channel();
        self.issue(subject, message, &options, DeliveryMode::collect(tx))
            .await?;
        rx.await.map_err(|_| BusError::Closed)
    }

    async fn unsubscribe(&self, subject: &str) -> Result<(), BusError> {
        if let Some(record) = self.registry.remove(subject) {
            if let Some(sid) = record.sid {
                if let Err(error) = self.transport.unsubscribe(sid).await {
                    debug!(subject = %subject, sid = %sid, error = %error,
                        "transport unsubscribe failed for removed subscription");
                }
            }
        }
        Ok(())
    }

    fn recover(&self, callback: Arc<dyn RecoveryHandler>) {
        self.recovery.set_callback(callback);
    }

    fn is_connected(&self) -> bool {
        self.transport.is_connected()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Dispatch loop
// ─────────────────────────────────────────────────────────────────────────────

/// Single owner of all inbound transport traffic and the pending table.
async fn dispatch_loop(
    transport: Arc<dyn Transport>,
    mut incoming: mpsc::Receiver<TransportIncoming>,
    mut commands: mpsc::Receiver<IssueRequest>,
    registry: Arc<SubscriptionRegistry>,
) {
    let mut pending = PendingRequests::new();
    loop {
        tokio::select! {
            Some(command) = commands.recv() => {
                handle_command(transport.as_ref(), &mut pending, command).await;
            }
            event = incoming.recv() => match event {
                Some(event) => handle_incoming(&registry, &mut pending, event),
                None => break,
            },
        }
    }
    // Transport gone: release anyone still waiting on aggregated replies.
    for handler in pending.drain() {
        spawn_reply(handler, ReplyEvent::TimedOut);
    }
    debug!("dispatch loop stopped");
}

/// Issue a request: obtain the correlation, register it, arm the deadline.
///
/// Runs on the dispatch loop so a reply can never arrive ahead of the
/// pending-table insert.
async fn handle_command(transport: &dyn Transport, pending: &mut PendingRequests, command: IssueRequest) {
    let IssueRequest {
        subject,
        body,
        expected,
        timeout,
        mode,
        issued,
    } = command;
    match transport.request(&subject, body, expected).await {
        Ok(sid) => {
            pending.insert(sid, expected, mode);
            if let Some(after) = timeout {
                if let Err(error) = transport.timeout(sid, after, expected).await {
                    warn!(subject = %subject, sid = %sid, error = %error,
                        "failed to arm request deadline, waiting without one");
                }
            }
            let _ = issued.send(Ok(()));
        }
        Err(error) => {
            let _ = issued.send(Err(BusError::transport("request", error)));
        }
    }
}

/// Route one inbound event: pending correlations first, then the registry
/// by subject.
fn handle_incoming(
    registry: &SubscriptionRegistry,
    pending: &mut PendingRequests,
    event: TransportIncoming,
) {
    match event {
        TransportIncoming::Message {
            sid,
            subject,
            payload,
            reply_inbox,
        } => {
            let decoded = decode_body(&subject, payload.as_deref());
            if pending.contains(sid) {
                if let Some((handler, reply)) = pending.on_reply(sid, decoded) {
                    spawn_reply(handler, reply);
                }
            } else if let Some(handler) = registry.dispatch(&subject) {
                spawn_delivery(
                    handler,
                    Delivery {
                        subject,
                        payload: decoded,
                        reply_inbox,
                    },
                );
            } else {
                debug!(subject = %subject, sid = %sid, "dropping message with no registered handler");
            }
        }
        TransportIncoming::RequestTimeout { sid } => {
            if let Some(handler) = pending.on_timeout(sid) {
                spawn_reply(handler, ReplyEvent::TimedOut);
            }
        }
    }
}

/// Decode an inbound body, substituting the error-shaped payload on
/// failure so the handler still gets its one notification.
fn decode_body(subject: &str, body: Option<&[u8]>) -> Payload {
    match body {
        None => Payload::Null,
        Some(bytes) => codec::decode(bytes).unwrap_or_else(|err| {
            warn!(subject = %subject, body = %err.snippet, error = %err.source,
                "failed to decode inbound message");
            codec::error_payload(&err)
        }),
    }
}

/// Run a subscription handler off the dispatch path, containing panics.
fn spawn_delivery(handler: Arc<dyn MessageHandler>, delivery: Delivery) {
    let _ = tokio::spawn(async move {
        let subject = delivery.subject.clone();
        if AssertUnwindSafe(handler.handle(delivery))
            .catch_unwind()
            .await
            .is_err()
        {
            warn!(subject = %subject, "subscription handler panicked");
        }
    });
}

/// Drive a request continuation off the dispatch path, containing panics.
fn spawn_reply(handler: Arc<dyn ReplyHandler>, event: ReplyEvent) {
    let _ = tokio::spawn(async move {
        if AssertUnwindSafe(handler.on_reply(event))
            .catch_unwind()
            .await
            .is_err()
        {
            warn!("request reply handler panicked");
        }
    });
}
