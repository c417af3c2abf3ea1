//! Session Storage
//!
//! Maps (conversation, peer) to ratchet state. Session state is sealed with
//! the vault key before it leaves memory: the same sealed blob is cached in
//! the local SQLite database and uploaded to the network session store, so
//! the server never sees plaintext ratchet state.
//!
//! Local writes are awaited. Network writes go through the background
//! [`PersistQueue`] and never block a send or receive.

use std::collections::HashMap;
use std::sync::Arc;

use base64::Engine;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::sync::RwLock;
use zeroize::Zeroizing;

use crate::api::ServerApi;
use crate::crypto::group::SenderChainState;
use crate::crypto::keys::IdentityPublicKey;
use crate::crypto::persist_queue::PersistQueue;
use crate::crypto::ratchet::RatchetState;
use crate::crypto::vault::SecretKeyVault;
use crate::db;
use crate::error::{AppError, AppResult};
use crate::models::KeyExchangeRecord;

/// Ratchet material owned by one session
#[derive(Clone, Serialize, Deserialize)]
#[serde(tag = "kind", content = "state", rename_all = "snake_case")]
pub enum SessionState {
    /// Two-party ratchet with a peer
    Pairwise(RatchetState),
    /// The local user's sender chain in a group; keyed by the local user id
    SenderChain(SenderChainState),
}

/// A session keyed by (conversation, peer)
#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub conversation_id: String,
    pub peer_id: String,
    pub state: SessionState,
    /// Peer identity captured when the session was created
    pub peer_identity: Option<IdentityPublicKey>,
    /// Exchange that created this session, if any
    pub exchange_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub messages_sent: u64,
    pub messages_received: u64,
    /// Group members the sender chain was last distributed to
    #[serde(default)]
    pub members: Vec<String>,
    /// Key-exchange record not yet delivered to the peer
    #[serde(default)]
    pub pending_outbound_exchange: Option<KeyExchangeRecord>,
}

impl Session {
    pub fn pairwise(
        conversation_id: &str,
        peer_id: &str,
        state: RatchetState,
        peer_identity: IdentityPublicKey,
        exchange_id: &str,
    ) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            peer_id: peer_id.to_string(),
            state: SessionState::Pairwise(state),
            peer_identity: Some(peer_identity),
            exchange_id: Some(exchange_id.to_string()),
            created_at: Utc::now(),
            messages_sent: 0,
            messages_received: 0,
            members: Vec::new(),
            pending_outbound_exchange: None,
        }
    }

    pub fn sender_chain(conversation_id: &str, owner_id: &str, members: Vec<String>) -> Self {
        Self {
            conversation_id: conversation_id.to_string(),
            peer_id: owner_id.to_string(),
            state: SessionState::SenderChain(SenderChainState::generate()),
            peer_identity: None,
            exchange_id: None,
            created_at: Utc::now(),
            messages_sent: 0,
            messages_received: 0,
            members,
            pending_outbound_exchange: None,
        }
    }

    pub fn stats(&self) -> SessionStats {
        let (session_id, chain_position) = match &self.state {
            SessionState::Pairwise(state) => (state.session_id().to_string(), state.sending_index()),
            SessionState::SenderChain(chain) => (chain.chain_id().to_string(), chain.iteration()),
        };

        SessionStats {
            conversation_id: self.conversation_id.clone(),
            peer_id: self.peer_id.clone(),
            session_id,
            chain_position,
            messages_sent: self.messages_sent,
            messages_received: self.messages_received,
            created_at: self.created_at,
            awaiting_exchange_delivery: self.pending_outbound_exchange.is_some(),
        }
    }
}

/// Session statistics for display
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub conversation_id: String,
    pub peer_id: String,
    pub session_id: String,
    pub chain_position: u32,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub created_at: DateTime<Utc>,
    pub awaiting_exchange_delivery: bool,
}

fn blob_aad(conversation_id: &str, peer_id: &str) -> Vec<u8> {
    format!("nochat-session:{}:{}", conversation_id, peer_id).into_bytes()
}

/// Manages storage and retrieval of sessions
pub struct SessionStore {
    db: SqlitePool,
    vault: Arc<SecretKeyVault>,
    api: Arc<dyn ServerApi>,
    queue: PersistQueue,
    /// Active sessions cache ((conversation, peer) -> session)
    cache: RwLock<HashMap<(String, String), Session>>,
}

impl SessionStore {
    pub fn new(
        db: SqlitePool,
        vault: Arc<SecretKeyVault>,
        api: Arc<dyn ServerApi>,
        queue: PersistQueue,
    ) -> Self {
        Self {
            db,
            vault,
            api,
            queue,
            cache: RwLock::new(HashMap::new()),
        }
    }

    fn seal(&self, session: &Session) -> AppResult<String> {
        let json = Zeroizing::new(serde_json::to_vec(session)?);
        let sealed = self
            .vault
            .seal(&json, &blob_aad(&session.conversation_id, &session.peer_id))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    fn unseal(&self, conversation_id: &str, peer_id: &str, blob: &str) -> Option<Session> {
        let opened = base64::engine::general_purpose::STANDARD
            .decode(blob)
            .map_err(|e| e.to_string())
            .and_then(|sealed| {
                self.vault
                    .open(&sealed, &blob_aad(conversation_id, peer_id))
                    .map_err(|e| e.to_string())
            })
            .map(Zeroizing::new)
            .and_then(|json| serde_json::from_slice::<Session>(&json).map_err(|e| e.to_string()));

        match opened {
            Ok(session) => Some(session),
            Err(e) => {
                tracing::error!(
                    "Discarding corrupt session {}/{}: {}. Message history with this peer is unrecoverable; a new handshake will be required",
                    conversation_id,
                    peer_id,
                    e
                );
                None
            }
        }
    }

    /// Load a session: memory, then local database, then network store
    ///
    /// A blob that cannot be opened is discarded and reported as absent so
    /// callers fall back to a fresh handshake.
    pub async fn load(&self, conversation_id: &str, peer_id: &str) -> AppResult<Option<Session>> {
        let key = (conversation_id.to_string(), peer_id.to_string());
        if let Some(session) = self.cache.read().await.get(&key) {
            return Ok(Some(session.clone()));
        }

        if let Some(blob) = db::get_session(&self.db, conversation_id, peer_id).await? {
            match self.unseal(conversation_id, peer_id, &blob) {
                Some(session) => {
                    self.cache.write().await.insert(key, session.clone());
                    return Ok(Some(session));
                }
                None => db::delete_session(&self.db, conversation_id, peer_id).await?,
            }
        }

        if let Some(blob) = self.api.get_session_blob(conversation_id, peer_id).await? {
            match self.unseal(conversation_id, peer_id, &blob) {
                Some(session) => {
                    db::upsert_session(&self.db, conversation_id, peer_id, &blob).await?;
                    self.cache.write().await.insert(key, session.clone());
                    return Ok(Some(session));
                }
                None => self.queue.delete(conversation_id, peer_id),
            }
        }

        Ok(None)
    }

    pub async fn exists(&self, conversation_id: &str, peer_id: &str) -> AppResult<bool> {
        Ok(self.load(conversation_id, peer_id).await?.is_some())
    }

    /// Save or update a session
    ///
    /// The in-memory copy is always updated. A failed local write is
    /// returned as `Persistence`; the network copy is saved in the background.
    pub async fn save(&self, session: &Session) -> AppResult<()> {
        let (conversation_id, peer_id) = (&session.conversation_id, &session.peer_id);
        self.cache
            .write()
            .await
            .insert((conversation_id.clone(), peer_id.clone()), session.clone());

        let blob = self.seal(session)?;
        let local = db::upsert_session(&self.db, conversation_id, peer_id, &blob)
            .await
            .map_err(|e| AppError::Persistence(format!("Local session save failed: {}", e)));

        self.queue.save(conversation_id, peer_id, blob);
        local
    }

    pub async fn delete(&self, conversation_id: &str, peer_id: &str) -> AppResult<()> {
        self.cache
            .write()
            .await
            .remove(&(conversation_id.to_string(), peer_id.to_string()));
        db::delete_session(&self.db, conversation_id, peer_id).await?;
        self.queue.delete(conversation_id, peer_id);
        Ok(())
    }

    /// Remove every session of a conversation, locally and remotely
    pub async fn delete_conversation(&self, conversation_id: &str, known_peers: &[String]) -> AppResult<()> {
        let mut peers: Vec<String> = {
            let mut cache = self.cache.write().await;
            let cached: Vec<String> = cache
                .keys()
                .filter(|(conv, _)| conv == conversation_id)
                .map(|(_, peer)| peer.clone())
                .collect();
            for peer in &cached {
                cache.remove(&(conversation_id.to_string(), peer.clone()));
            }
            cached
        };
        peers.extend(db::delete_conversation_sessions(&self.db, conversation_id).await?);
        peers.extend(known_peers.iter().cloned());
        peers.sort();
        peers.dedup();

        for peer in &peers {
            self.queue.delete(conversation_id, peer);
        }
        tracing::info!(
            "Deleted {} sessions for conversation {}",
            peers.len(),
            conversation_id
        );
        Ok(())
    }

    /// Every locally known session
    pub async fn list(&self) -> AppResult<Vec<Session>> {
        let mut sessions = Vec::new();
        for (conversation_id, peer_id) in db::list_sessions(&self.db).await? {
            if let Some(session) = self.load(&conversation_id, &peer_id).await? {
                sessions.push(session);
            }
        }
        Ok(sessions)
    }

    /// Drop all local session state (logout)
    pub async fn clear_local(&self) -> AppResult<()> {
        self.cache.write().await.clear();
        db::clear_sessions(&self.db).await
    }

    /// Push pending network saves now; returns how many are still pending
    pub async fn flush(&self) -> usize {
        self.queue.flush().await
    }
}
