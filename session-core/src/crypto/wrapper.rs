//! Per-recipient wrapping of message keys and sender-chain snapshots

use std::sync::Arc;

use zeroize::Zeroizing;

use crate::crypto::exchange::IdentityDirectory;
use crate::crypto::keys::IdentityKeyPair;
use crate::crypto::primitives::RatchetPrimitives;
use crate::error::{AppResult, MessageError};
use crate::models::{decode_b64, encode_b64, MessageKeyEnvelope, WrappedKeyEntry};

/// Wraps key material for every recipient of a message
pub struct MessageKeyWrapper {
    user_id: String,
    identity: Arc<IdentityKeyPair>,
    primitives: Arc<dyn RatchetPrimitives>,
    directory: Arc<IdentityDirectory>,
}

impl MessageKeyWrapper {
    pub fn new(
        user_id: &str,
        identity: Arc<IdentityKeyPair>,
        primitives: Arc<dyn RatchetPrimitives>,
        directory: Arc<IdentityDirectory>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            identity,
            primitives,
            directory,
        }
    }

    /// Produce one envelope entry per recipient
    ///
    /// A recipient whose key cannot be found or used is skipped with a
    /// warning. The sender's own entry and at least one other entry are
    /// required, otherwise the send fails with `WrapFailed`.
    pub async fn wrap(&self, material: &[u8], recipients: &[String]) -> AppResult<MessageKeyEnvelope> {
        let mut envelope = MessageKeyEnvelope::default();
        let mut others_expected = 0usize;

        for recipient in recipients {
            let is_self = recipient == &self.user_id;
            if !is_self {
                others_expected += 1;
            }

            let public = if is_self {
                Some(self.identity.public())
            } else {
                match self.directory.get(recipient).await {
                    Ok(key) => key,
                    Err(e) => {
                        tracing::warn!("Identity lookup for {} failed: {}", recipient, e);
                        None
                    }
                }
            };

            let Some(public) = public else {
                tracing::warn!("No published identity for {}, they will not be able to read this message", recipient);
                continue;
            };

            match self.primitives.encrypt_for_recipient(&public, material) {
                Ok(wrapped) => envelope.entries.push(WrappedKeyEntry {
                    recipient_id: recipient.clone(),
                    wrapped_key: encode_b64(&wrapped),
                }),
                Err(e) => tracing::warn!("Wrapping key for {} failed: {}", recipient, e),
            }
        }

        if envelope.for_recipient(&self.user_id).is_none() {
            return Err(MessageError::WrapFailed("sender entry missing".to_string()).into());
        }
        if others_expected > 0 && envelope.len() < 2 {
            return Err(MessageError::WrapFailed("no recipient could be wrapped for".to_string()).into());
        }

        tracing::debug!("Wrapped key for {}/{} recipients", envelope.len(), recipients.len());
        Ok(envelope)
    }

    /// Unwrap the local user's entry
    ///
    /// An entry that cannot be opened was made for a different key; it is
    /// reported as `KeyUnavailable` for `message_id`.
    pub fn unwrap(&self, message_id: &str, entry: &WrappedKeyEntry) -> AppResult<Zeroizing<Vec<u8>>> {
        let wrapped = decode_b64(&entry.wrapped_key)
            .map_err(|e| MessageError::Malformed(format!("wrapped key: {}", e)))?;

        self.primitives
            .decrypt_from_sender(&self.identity, &wrapped)
            .map(Zeroizing::new)
            .map_err(|e| {
                tracing::warn!("Cannot unwrap key for message {}: {}", message_id, e);
                MessageError::KeyUnavailable(message_id.to_string()).into()
            })
    }
}
