//! Cryptographic error types
//!
//! Errors raised by the primitive layer: key parsing, key agreement,
//! ratchet steps, sender chains and key wrapping.

use thiserror::Error;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    /// Failed to parse or decode a key
    #[error("Invalid key format: {0}")]
    InvalidKey(String),

    /// Failed to derive a shared secret
    #[error("Key exchange failed: {0}")]
    KeyExchangeFailed(String),

    /// Double Ratchet protocol error
    #[error("Ratchet error: {0}")]
    RatchetError(String),

    /// Sender chain (group) error
    #[error("Sender chain error: {0}")]
    SenderChainError(String),

    /// Signature verification failed
    #[error("Signature verification failed: {0}")]
    SignatureError(String),

    /// Encryption failed
    #[error("Encryption failed: {0}")]
    EncryptionError(String),

    /// Decryption failed
    #[error("Decryption failed: {0}")]
    DecryptionError(String),

    /// Session corrupted or invalid
    #[error("Session corrupted: {0}")]
    SessionCorrupted(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl From<vodozemac::KeyError> for CryptoError {
    fn from(e: vodozemac::KeyError) -> Self {
        CryptoError::InvalidKey(e.to_string())
    }
}

impl From<aes_gcm::Error> for CryptoError {
    fn from(_: aes_gcm::Error) -> Self {
        CryptoError::DecryptionError("AES-GCM operation failed".to_string())
    }
}

impl From<serde_json::Error> for CryptoError {
    fn from(e: serde_json::Error) -> Self {
        CryptoError::SerializationError(e.to_string())
    }
}

impl From<base64::DecodeError> for CryptoError {
    fn from(e: base64::DecodeError) -> Self {
        CryptoError::SerializationError(format!("Invalid base64: {}", e))
    }
}

/// Result type for cryptographic operations
pub type CryptoResult<T> = Result<T, CryptoError>;
