//! Production client for the partyline message bus façade.
//!
//! The crate wires four pieces over an injected broker [`Transport`]:
//!
//! - [`registry::SubscriptionRegistry`]: durable, insertion-ordered
//!   subscription intent, replayed after every reconnect;
//! - the request aggregator: scatter/gather state with at-most-once
//!   delivery by count, deadline, or shutdown;
//! - [`recovery::RecoveryCoordinator`]: single-flight reconnect recovery;
//! - [`BusClient`]: the façade implementing
//!   [`MessageBus`](partyline_core::MessageBus).
//!
//! The broker protocol itself is out of scope; implement [`Transport`]
//! over your client of choice and hand it to [`BusClient::connect`].

pub mod client;
pub mod recovery;
pub mod registry;
pub mod transport;

mod aggregator;

pub use client::BusClient;
pub use recovery::{RecoveryCoordinator, RecoveryState};
pub use registry::{SubscriptionRecord, SubscriptionRegistry};
pub use transport::{
    ConnectionEvent, SubscriptionId, Transport, TransportError, TransportIncoming,
};
