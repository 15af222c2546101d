//! Durable, insertion-ordered record of subscription intent.
//!
//! The registry, not the transport, is the source of truth for what the
//! client wants subscribed. Broker-side state is reconstructed from it
//! after every reconnect, in first-registration order.

use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::RwLock;

use partyline_core::{MessageHandler, SubscribeOptions};

use crate::transport::SubscriptionId;

/// A registered subscription: what to resubscribe and whom to call.
#[derive(Clone)]
pub struct SubscriptionRecord {
    /// Options replayed to the transport on every (re)subscribe.
    pub options: SubscribeOptions,
    /// Handler invoked per delivered message.
    pub handler: Arc<dyn MessageHandler>,
    /// Live transport handle from the most recent subscribe, if any.
    pub sid: Option<SubscriptionId>,
}

/// Subject-keyed registry, iterated in first-registration order.
#[derive(Default)]
pub struct SubscriptionRegistry {
    records: RwLock<IndexMap<String, SubscriptionRecord>>,
}

impl SubscriptionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record intent for `subject`, replacing any previous record.
    ///
    /// Returns the replaced record so its live handle can be released.
    /// A replaced subject keeps its original position in replay order.
    pub fn insert(
        &self,
        subject: impl Into<String>,
        options: SubscribeOptions,
        handler: Arc<dyn MessageHandler>,
    ) -> Option<SubscriptionRecord> {
        self.records.write().insert(
            subject.into(),
            SubscriptionRecord {
                options,
                handler,
                sid: None,
            },
        )
    }

    /// Attach the live transport handle for `subject`.
    ///
    /// Returns `false` when the subject is no longer registered; the caller
    /// still owns `sid` and must release it.
    pub fn set_sid(&self, subject: &str, sid: SubscriptionId) -> bool {
        if let Some(record) = self.records.write().get_mut(subject) {
            record.sid = Some(sid);
            true
        } else {
            false
        }
    }

    /// Remove `subject`, returning its record.
    pub fn remove(&self, subject: &str) -> Option<SubscriptionRecord> {
        self.records.write().shift_remove(subject)
    }

    /// Handler for an inbound message on `subject`.
    #[must_use]
    pub fn dispatch(&self, subject: &str) -> Option<Arc<dyn MessageHandler>> {
        self.records
            .read()
            .get(subject)
            .map(|record| Arc::clone(&record.handler))
    }

    /// Registration-ordered snapshot of subjects and their options, used
    /// by recovery replay.
    #[must_use]
    pub fn snapshot(&self) -> Vec<(String, SubscribeOptions)> {
        self.records
            .read()
            .iter()
            .map(|(subject, record)| (subject.clone(), record.options.clone()))
            .collect()
    }

    /// Number of registered subjects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.read().len()
    }

    /// Whether nothing is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.read().is_empty()
    }
}
