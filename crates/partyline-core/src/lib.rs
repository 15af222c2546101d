//! Core types for the partyline message bus façade.
//!
//! partyline wraps an external pub/sub broker behind a small client-side
//! façade. This crate holds everything both sides of that façade agree on:
//! the wire codec, the [`MessageBus`] contract implemented by the
//! production client and the in-memory test double, the handler traits,
//! connection configuration, and error types.
//!
//! The production client lives in `partyline-client`; the loopback double
//! for tests lives in `partyline-testkit`.

pub mod bus;
pub mod codec;
pub mod config;
pub mod errors;
pub mod logging;
pub mod message;

pub use bus::{DEFAULT_EXPECTED_REPLIES, MessageBus, RequestOptions, SubscribeOptions};
pub use codec::Payload;
pub use config::BusConfig;
pub use errors::{BusError, DecodeError};
pub use message::{
    Delivery, MessageHandler, NoopRecovery, RecoveryHandler, ReplyEvent, ReplyHandler,
};
