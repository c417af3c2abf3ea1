//! Server endpoints consumed by the session layer
//!
//! `ServerApi` is the seam between the session layer and the NoChat
//! backend. `ApiClient` is the HTTP implementation; tests substitute an
//! in-memory server.

mod client;

pub use client::ApiClient;

use async_trait::async_trait;

use crate::crypto::keys::IdentityPublicKey;
use crate::crypto::x3dh::PreKeyBundle;
use crate::error::AppResult;
use crate::models::{KeyExchangeRecord, OutboundMessage, PrekeyUpload, WrappedKeyEntry};

/// Endpoints of the NoChat backend, on behalf of the authenticated user
#[async_trait]
pub trait ServerApi: Send + Sync {
    // Session blobs

    async fn get_session_blob(&self, conversation_id: &str, peer_id: &str) -> AppResult<Option<String>>;

    async fn save_session_blob(&self, conversation_id: &str, peer_id: &str, blob: &str) -> AppResult<()>;

    async fn delete_session_blob(&self, conversation_id: &str, peer_id: &str) -> AppResult<()>;

    // Identity directory and prekeys

    /// Fetch a user's bundle; the server hands out (and removes) one one-time prekey
    async fn get_prekey_bundle(&self, user_id: &str) -> AppResult<Option<PreKeyBundle>>;

    async fn get_identity_key(&self, user_id: &str) -> AppResult<Option<IdentityPublicKey>>;

    async fn publish_identity(&self, identity: &IdentityPublicKey) -> AppResult<()>;

    /// Number of the user's one-time prekeys the server still holds
    async fn get_prekey_count(&self) -> AppResult<usize>;

    async fn upload_prekeys(&self, upload: &PrekeyUpload) -> AppResult<()>;

    // Key exchange

    async fn initiate_key_exchange(&self, record: &KeyExchangeRecord) -> AppResult<()>;

    /// Exchanges addressed to the user that were not yet accepted
    async fn get_pending_key_exchanges(&self) -> AppResult<Vec<KeyExchangeRecord>>;

    async fn accept_key_exchange(&self, exchange_id: &str) -> AppResult<()>;

    // Message transport

    async fn send_message(&self, message: &OutboundMessage) -> AppResult<()>;

    /// The user's wrapped key for one revision of a message
    async fn fetch_wrapped_key(&self, message_id: &str, revision: u32) -> AppResult<Option<WrappedKeyEntry>>;

    async fn edit_message(&self, message: &OutboundMessage) -> AppResult<()>;

    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> AppResult<()>;

    async fn add_reaction(&self, conversation_id: &str, message_id: &str, emoji: &str) -> AppResult<()>;

    async fn remove_reaction(&self, conversation_id: &str, message_id: &str, emoji: &str) -> AppResult<()>;
}
