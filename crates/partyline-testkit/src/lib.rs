//! In-process [`MessageBus`](partyline_core::MessageBus) double.
//!
//! [`InMemoryBus`] implements the full bus contract with no broker and no
//! transport: delivery is synchronous, messages pass through the real
//! codec, and a ledger plus scripting surface let tests assert on traffic
//! and stage replies. Swap it in anywhere code under test takes an
//! `Arc<dyn MessageBus>`.

pub mod memory;

pub use memory::{InMemoryBus, PublishedMessage};
