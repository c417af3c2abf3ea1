//! Error types for the NoChat session layer
//!
//! Cryptographic verification failures (`HandshakeError`,
//! `MessageError::TamperedOrUnverifiable`) are kept distinct from
//! "not yet available" states (`SessionUnavailable`, `KeyUnavailable`) so
//! callers can never fold one into the other.

use thiserror::Error;

use crate::crypto::CryptoError;

/// Failures while establishing a session with a peer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("Signed prekey signature is invalid for peer {0}")]
    InvalidSignature(String),

    #[error("Malformed key bundle: {0}")]
    MalformedBundle(String),

    /// The peer presented an identity key that differs from the one pinned
    /// for them. Never resolved automatically.
    #[error("Identity key for {peer_id} changed (pinned {pinned}, presented {presented})")]
    IdentityMismatch {
        peer_id: String,
        pinned: String,
        presented: String,
    },

    #[error("One-time prekey {0} is unknown or already consumed")]
    UnknownPrekey(u32),
}

/// Failures on the message send/receive path
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MessageError {
    #[error("Message {0} is tampered or unverifiable")]
    TamperedOrUnverifiable(String),

    #[error("No wrapped key available for message {0}")]
    KeyUnavailable(String),

    #[error("Could not wrap message key: {0}")]
    WrapFailed(String),

    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Handshake error: {0}")]
    Handshake(#[from] HandshakeError),

    #[error("No session with {peer_id} in conversation {conversation_id} and handshake not possible")]
    SessionUnavailable {
        conversation_id: String,
        peer_id: String,
    },

    #[error("Message error: {0}")]
    Message(#[from] MessageError),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Network error: {0}")]
    Network(String),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Not authenticated")]
    NotAuthenticated,

    #[error("Session expired")]
    SessionExpired,

    #[error("Conversation not found: {0}")]
    ConversationNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    /// Whether this error is a failed authenticity check that must be
    /// surfaced to the user rather than retried.
    pub fn is_security_event(&self) -> bool {
        matches!(
            self,
            AppError::Handshake(HandshakeError::InvalidSignature(_))
                | AppError::Handshake(HandshakeError::IdentityMismatch { .. })
                | AppError::Message(MessageError::TamperedOrUnverifiable(_))
        )
    }

    /// Whether the failure came from the transport and may succeed on retry.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::Network(_) | AppError::Http(_) => true,
            AppError::Api { status, .. } => *status >= 500,
            _ => false,
        }
    }
}

/// Result type alias for application operations
pub type AppResult<T> = Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_events_are_distinguishable() {
        let tampered: AppError = MessageError::TamperedOrUnverifiable("m1".into()).into();
        let missing: AppError = MessageError::KeyUnavailable("m1".into()).into();
        let unavailable = AppError::SessionUnavailable {
            conversation_id: "c".into(),
            peer_id: "p".into(),
        };

        assert!(tampered.is_security_event());
        assert!(!missing.is_security_event());
        assert!(!unavailable.is_security_event());
        assert!(AppError::from(HandshakeError::InvalidSignature("bob".into())).is_security_event());
    }

    #[test]
    fn test_transient_errors() {
        assert!(AppError::Network("offline".into()).is_transient());
        assert!(AppError::Api { status: 503, body: String::new() }.is_transient());
        assert!(!AppError::Api { status: 400, body: String::new() }.is_transient());
        assert!(!AppError::NotAuthenticated.is_transient());
    }
}
