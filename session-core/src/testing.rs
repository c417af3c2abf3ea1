//! In-memory server for exercising the session layer without a backend.
//!
//! One `InMemoryServer` is shared by any number of simulated users; each
//! user talks to it through the `ServerApi` handle returned by
//! [`InMemoryServer::client`]. Feed events are collected per user and
//! drained by the test.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;

use crate::api::ServerApi;
use crate::crypto::keys::{IdentityPublicKey, OneTimePreKey, SignedPreKey};
use crate::crypto::x3dh::PreKeyBundle;
use crate::error::{AppError, AppResult};
use crate::models::{KeyExchangeRecord, OutboundMessage, PrekeyUpload, SyncEvent, WrappedKeyEntry};

#[derive(Default)]
struct ServerState {
    identities: HashMap<String, IdentityPublicKey>,
    signed_prekeys: HashMap<String, SignedPreKey>,
    one_time_prekeys: HashMap<String, VecDeque<OneTimePreKey>>,
    /// (owner, conversation, peer) -> sealed blob
    session_blobs: HashMap<(String, String, String), String>,
    exchanges: HashMap<String, KeyExchangeRecord>,
    /// (message id, revision) -> stored message
    messages: HashMap<(String, u32), OutboundMessage>,
    inboxes: HashMap<String, Vec<SyncEvent>>,
}

impl ServerState {
    fn deliver(&mut self, user_id: &str, event: SyncEvent) {
        self.inboxes.entry(user_id.to_string()).or_default().push(event);
    }

    /// Everyone who received revision 0 of a message
    fn audience(&self, message_id: &str) -> Vec<String> {
        self.messages
            .get(&(message_id.to_string(), 0))
            .map(|m| m.envelope.recipients().into_iter().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// Shared fake backend
#[derive(Clone, Default)]
pub struct InMemoryServer {
    state: Arc<Mutex<ServerState>>,
    sends_offline: Arc<AtomicBool>,
    failing_session_saves: Arc<AtomicUsize>,
    session_save_attempts: Arc<AtomicUsize>,
}

impl InMemoryServer {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, ServerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Endpoint handle authenticated as `user_id`
    pub fn client(&self, user_id: &str) -> Arc<InMemoryClient> {
        Arc::new(InMemoryClient {
            user_id: user_id.to_string(),
            server: self.clone(),
        })
    }

    /// Take every feed event queued for `user_id`
    pub fn drain_events(&self, user_id: &str) -> Vec<SyncEvent> {
        self.lock().inboxes.remove(user_id).unwrap_or_default()
    }

    /// Replace a user's published identity, as a reinstall would
    pub fn set_identity(&self, user_id: &str, identity: IdentityPublicKey) {
        self.lock().identities.insert(user_id.to_string(), identity);
    }

    /// Make message sends and edits fail with a network error
    pub fn set_sends_offline(&self, offline: bool) {
        self.sends_offline.store(offline, Ordering::SeqCst);
    }

    /// Fail the next `count` session blob saves
    pub fn fail_next_session_saves(&self, count: usize) {
        self.failing_session_saves.store(count, Ordering::SeqCst);
    }

    pub fn session_save_attempts(&self) -> usize {
        self.session_save_attempts.load(Ordering::SeqCst)
    }

    pub fn session_blob(&self, owner_id: &str, conversation_id: &str, peer_id: &str) -> Option<String> {
        self.lock()
            .session_blobs
            .get(&(owner_id.to_string(), conversation_id.to_string(), peer_id.to_string()))
            .cloned()
    }

    pub fn prekey_count(&self, user_id: &str) -> usize {
        self.lock().one_time_prekeys.get(user_id).map_or(0, VecDeque::len)
    }

    /// Drop one-time prekeys from the server pool, as peers' handshakes would
    pub fn drain_prekeys(&self, user_id: &str, count: usize) {
        if let Some(pool) = self.lock().one_time_prekeys.get_mut(user_id) {
            let count = count.min(pool.len());
            pool.drain(..count);
        }
    }

    pub fn one_time_prekey_ids(&self, user_id: &str) -> Vec<u32> {
        self.lock()
            .one_time_prekeys
            .get(user_id)
            .map(|pool| pool.iter().map(|k| k.key_id).collect())
            .unwrap_or_default()
    }

    /// Corrupt the signature of a user's published signed prekey
    pub fn tamper_signed_prekey(&self, user_id: &str) {
        if let Some(signed) = self.lock().signed_prekeys.get_mut(user_id) {
            if let Some(byte) = signed.signature.first_mut() {
                *byte ^= 0xff;
            }
        }
    }

    pub fn pending_exchange_count(&self, user_id: &str) -> usize {
        self.lock()
            .exchanges
            .values()
            .filter(|r| r.to_user_id == user_id)
            .count()
    }

    pub fn stored_message(&self, message_id: &str, revision: u32) -> Option<OutboundMessage> {
        self.lock()
            .messages
            .get(&(message_id.to_string(), revision))
            .cloned()
    }
}

/// One user's view of the in-memory server
pub struct InMemoryClient {
    user_id: String,
    server: InMemoryServer,
}

impl InMemoryClient {
    fn blob_key(&self, conversation_id: &str, peer_id: &str) -> (String, String, String) {
        (self.user_id.clone(), conversation_id.to_string(), peer_id.to_string())
    }

    fn check_online(&self) -> AppResult<()> {
        if self.server.sends_offline.load(Ordering::SeqCst) {
            return Err(AppError::Network("connection refused".to_string()));
        }
        Ok(())
    }

    fn store_message(&self, message: &OutboundMessage, event: fn(OutboundMessage) -> SyncEvent) {
        let mut state = self.server.lock();
        let key = (message.payload.message_id.clone(), message.payload.revision);
        state.messages.insert(key, message.clone());

        for recipient in message.envelope.recipients() {
            if recipient != self.user_id {
                state.deliver(recipient, event(message.clone()));
            }
        }
    }

    fn broadcast(&self, message_id: &str, event: SyncEvent) {
        let mut state = self.server.lock();
        for recipient in state.audience(message_id) {
            if recipient != self.user_id {
                state.deliver(&recipient, event.clone());
            }
        }
    }
}

#[async_trait]
impl ServerApi for InMemoryClient {
    async fn get_session_blob(&self, conversation_id: &str, peer_id: &str) -> AppResult<Option<String>> {
        Ok(self
            .server
            .lock()
            .session_blobs
            .get(&self.blob_key(conversation_id, peer_id))
            .cloned())
    }

    async fn save_session_blob(&self, conversation_id: &str, peer_id: &str, blob: &str) -> AppResult<()> {
        self.server.session_save_attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .server
            .failing_session_saves
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(AppError::Network("session store unavailable".to_string()));
        }

        self.server
            .lock()
            .session_blobs
            .insert(self.blob_key(conversation_id, peer_id), blob.to_string());
        Ok(())
    }

    async fn delete_session_blob(&self, conversation_id: &str, peer_id: &str) -> AppResult<()> {
        self.server
            .lock()
            .session_blobs
            .remove(&self.blob_key(conversation_id, peer_id));
        Ok(())
    }

    async fn get_prekey_bundle(&self, user_id: &str) -> AppResult<Option<PreKeyBundle>> {
        let mut state = self.server.lock();
        let (Some(identity_key), Some(signed_prekey)) = (
            state.identities.get(user_id).cloned(),
            state.signed_prekeys.get(user_id).cloned(),
        ) else {
            return Ok(None);
        };
        let one_time_prekey = state
            .one_time_prekeys
            .get_mut(user_id)
            .and_then(VecDeque::pop_front);

        Ok(Some(PreKeyBundle {
            identity_key,
            signed_prekey,
            one_time_prekey,
        }))
    }

    async fn get_identity_key(&self, user_id: &str) -> AppResult<Option<IdentityPublicKey>> {
        Ok(self.server.lock().identities.get(user_id).cloned())
    }

    async fn publish_identity(&self, identity: &IdentityPublicKey) -> AppResult<()> {
        self.server
            .lock()
            .identities
            .insert(self.user_id.clone(), identity.clone());
        Ok(())
    }

    async fn get_prekey_count(&self) -> AppResult<usize> {
        Ok(self.server.prekey_count(&self.user_id))
    }

    async fn upload_prekeys(&self, upload: &PrekeyUpload) -> AppResult<()> {
        let mut state = self.server.lock();
        if let Some(signed) = &upload.signed_prekey {
            state.signed_prekeys.insert(self.user_id.clone(), signed.clone());
        }
        let pool = state.one_time_prekeys.entry(self.user_id.clone()).or_default();
        if upload.replace {
            pool.clear();
        }
        pool.extend(upload.one_time_prekeys.iter().cloned());
        Ok(())
    }

    async fn initiate_key_exchange(&self, record: &KeyExchangeRecord) -> AppResult<()> {
        let mut state = self.server.lock();
        state.exchanges.insert(record.exchange_id.clone(), record.clone());
        state.deliver(
            &record.to_user_id,
            SyncEvent::KeyExchange {
                exchange: record.clone(),
            },
        );
        Ok(())
    }

    async fn get_pending_key_exchanges(&self) -> AppResult<Vec<KeyExchangeRecord>> {
        let mut pending: Vec<KeyExchangeRecord> = self
            .server
            .lock()
            .exchanges
            .values()
            .filter(|r| r.to_user_id == self.user_id)
            .cloned()
            .collect();
        pending.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        Ok(pending)
    }

    async fn accept_key_exchange(&self, exchange_id: &str) -> AppResult<()> {
        self.server.lock().exchanges.remove(exchange_id);
        Ok(())
    }

    async fn send_message(&self, message: &OutboundMessage) -> AppResult<()> {
        self.check_online()?;
        self.store_message(message, |message| SyncEvent::NewMessage {
            message: message.payload,
        });
        Ok(())
    }

    async fn fetch_wrapped_key(&self, message_id: &str, revision: u32) -> AppResult<Option<WrappedKeyEntry>> {
        Ok(self
            .server
            .lock()
            .messages
            .get(&(message_id.to_string(), revision))
            .and_then(|m| m.envelope.for_recipient(&self.user_id).cloned()))
    }

    async fn edit_message(&self, message: &OutboundMessage) -> AppResult<()> {
        self.check_online()?;
        self.store_message(message, |message| SyncEvent::MessageEdited {
            message: message.payload,
        });
        Ok(())
    }

    async fn delete_message(&self, conversation_id: &str, message_id: &str) -> AppResult<()> {
        self.broadcast(
            message_id,
            SyncEvent::MessageDeleted {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
            },
        );
        self.server
            .lock()
            .messages
            .retain(|(id, _), _| id != message_id);
        Ok(())
    }

    async fn add_reaction(&self, conversation_id: &str, message_id: &str, emoji: &str) -> AppResult<()> {
        self.broadcast(
            message_id,
            SyncEvent::ReactionAdded {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                user_id: self.user_id.clone(),
                emoji: emoji.to_string(),
            },
        );
        Ok(())
    }

    async fn remove_reaction(&self, conversation_id: &str, message_id: &str, emoji: &str) -> AppResult<()> {
        self.broadcast(
            message_id,
            SyncEvent::ReactionRemoved {
                conversation_id: conversation_id.to_string(),
                message_id: message_id.to_string(),
                user_id: self.user_id.clone(),
                emoji: emoji.to_string(),
            },
        );
        Ok(())
    }
}
