//! Tracing subscriber setup for binaries and integration tests.
//!
//! Library code only emits `tracing` events; installing a subscriber is
//! the embedding application's job. This helper wires the conventional
//! env-filtered stderr subscriber for applications that do not bring
//! their own.

/// Initialize the global tracing subscriber with stderr output.
///
/// Respects `RUST_LOG` when set, falling back to `level` otherwise.
/// Call once at application startup. Subsequent calls are no-ops, so
/// tests can call this freely.
pub fn init_subscriber(level: &str) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .compact();

    // try_init is a no-op if a subscriber is already set
    let _ = subscriber.try_init();
}
