//! NoChat - Session layer
//!
//! End-to-end encrypted sessions for the NoChat messenger: asynchronous
//! key exchange, per-conversation ratchets and sender chains, per-recipient
//! message key wrapping, and reconciliation against the real-time feed.
//! All secrets stay in the local vault; the server only ever stores sealed
//! blobs and wrapped keys.

pub mod api;
pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod messaging;
pub mod models;
pub mod service;
pub mod testing;

/// Install the global tracing subscriber
///
/// `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    // A second call (tests, embedding apps) keeps the existing subscriber
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "nochat_session=info".into()),
        )
        .try_init();
}
