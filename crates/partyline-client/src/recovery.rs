//! Reconnection recovery.
//!
//! The transport owns reconnect pacing; this module owns what happens
//! around it. One coordinator task watches the lifecycle channel, and a
//! disconnect starts a single-flight cycle: wait out the outage, run the
//! recovery callback once, then replay every registered subscription in
//! first-registration order. Per-subject replay failures are logged and
//! skipped so one bad subject cannot strand the rest.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::FutureExt;
use parking_lot::RwLock;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use partyline_core::{NoopRecovery, RecoveryHandler};

use crate::registry::SubscriptionRegistry;
use crate::transport::{ConnectionEvent, Transport};

/// Single-flight flag plus the current recovery callback.
pub struct RecoveryState {
    recovering: AtomicBool,
    callback: RwLock<Arc<dyn RecoveryHandler>>,
}

impl Default for RecoveryState {
    fn default() -> Self {
        Self {
            recovering: AtomicBool::new(false),
            callback: RwLock::new(Arc::new(NoopRecovery)),
        }
    }
}

impl RecoveryState {
    /// Fresh state with the no-op callback installed.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the recovery callback. The previous one is dropped, not
    /// chained.
    pub fn set_callback(&self, callback: Arc<dyn RecoveryHandler>) {
        *self.callback.write() = callback;
    }

    /// Current recovery callback.
    #[must_use]
    pub fn callback(&self) -> Arc<dyn RecoveryHandler> {
        Arc::clone(&self.callback.read())
    }

    /// Whether a recovery cycle is in flight.
    #[must_use]
    pub fn is_recovering(&self) -> bool {
        self.recovering.load(Ordering::SeqCst)
    }

    /// Mark a cycle started; `false` when one is already in flight.
    fn begin(&self) -> bool {
        !self.recovering.swap(true, Ordering::SeqCst)
    }

    /// Mark the in-flight cycle finished.
    fn finish(&self) {
        self.recovering.store(false, Ordering::SeqCst);
    }
}

/// Task that watches the transport lifecycle and runs recovery cycles.
pub struct RecoveryCoordinator {
    transport: Arc<dyn Transport>,
    registry: Arc<SubscriptionRegistry>,
    state: Arc<RecoveryState>,
}

impl RecoveryCoordinator {
    /// Build a coordinator over the shared client state.
    #[must_use]
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<SubscriptionRegistry>,
        state: Arc<RecoveryState>,
    ) -> Self {
        Self {
            transport,
            registry,
            state,
        }
    }

    /// Consume lifecycle events until the transport goes away.
    ///
    /// Callers obtain `events` before spawning this future, so nothing can
    /// slip between connect and the first poll.
    pub async fn run(self, mut events: broadcast::Receiver<ConnectionEvent>) {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Disconnected) => {
                    if !self.state.begin() {
                        continue;
                    }
                    self.run_cycle(&mut events).await;
                    self.state.finish();
                }
                Ok(ConnectionEvent::Reconnected) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "lagged behind connection lifecycle events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("recovery coordinator stopped");
    }

    /// One full cycle: wait for the connection to come back, run the
    /// callback, replay subscriptions in registration order.
    async fn run_cycle(&self, events: &mut broadcast::Receiver<ConnectionEvent>) {
        info!("connection lost, waiting for the transport to reconnect");
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Reconnected) => break,
                Ok(ConnectionEvent::Disconnected) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "lagged behind connection lifecycle events");
                    if self.transport.is_connected() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Closed) => return,
            }
        }
        info!("reconnected, running recovery");
        self.invoke_callback().await;
        self.replay_subscriptions().await;
        info!(subjects = self.registry.len(), "recovery complete");
    }

    /// Run the recovery callback, isolating panics from the cycle.
    async fn invoke_callback(&self) {
        let callback = self.state.callback();
        if AssertUnwindSafe(callback.on_recovery())
            .catch_unwind()
            .await
            .is_err()
        {
            warn!("recovery callback panicked");
        }
    }

    /// Resubscribe every registered subject, oldest first.
    async fn replay_subscriptions(&self) {
        for (subject, options) in self.registry.snapshot() {
            match self.transport.subscribe(&subject, &options).await {
                Ok(sid) => {
                    if self.registry.set_sid(&subject, sid) {
                        debug!(subject = %subject, sid = %sid, "resubscribed");
                    } else {
                        // Unsubscribed while the replay was in flight; the
                        // fresh handle has no record and must be released.
                        if let Err(error) = self.transport.unsubscribe(sid).await {
                            debug!(subject = %subject, sid = %sid, error = %error,
                                "failed to release subscription dropped mid-replay");
                        }
                    }
                }
                Err(error) => {
                    warn!(subject = %subject, error = %error, "failed to resubscribe during recovery");
                }
            }
        }
    }
}
