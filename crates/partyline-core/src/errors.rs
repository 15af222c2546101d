//! Error types shared across the façade and its implementations.

use thiserror::Error;

/// Inbound bytes that could not be parsed into a payload.
///
/// Decode failures are values, never panics: dispatch logs them and hands
/// the handler an error-shaped payload in place of the message, so one bad
/// message cannot poison the dispatch path.
#[derive(Debug, Error)]
#[error("failed to decode message body {snippet:?}: {source}")]
pub struct DecodeError {
    /// Underlying parser error.
    #[source]
    pub source: serde_json::Error,
    /// Truncated raw body, kept for log context.
    pub snippet: String,
}

/// Failures surfaced by [`MessageBus`](crate::bus::MessageBus) operations.
#[derive(Debug, Error)]
pub enum BusError {
    /// The transport rejected or failed an operation.
    #[error("transport failure during {operation}")]
    Transport {
        /// Operation that failed (`"connect"`, `"publish"`, `"request"`).
        operation: &'static str,
        /// Underlying transport error.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// The bus has shut down and can no longer deliver.
    #[error("message bus is shut down")]
    Closed,
}

impl BusError {
    /// Wrap a transport-level failure with operation context.
    pub fn transport<E>(operation: &'static str, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::Transport {
            operation,
            source: Box::new(source),
        }
    }
}
