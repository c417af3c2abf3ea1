//! Asynchronous session establishment
//!
//! The initiator fetches the peer's prekey bundle, verifies it, derives a
//! session and transmits a key-exchange record. The responder accepts the
//! record whenever it comes online. At most one session exists per
//! (conversation, peer): the first one persisted wins and later handshakes
//! for the same pair are no-ops.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, RwLock};

use crate::api::ServerApi;
use crate::crypto::keys::{IdentityKeyPair, IdentityPublicKey};
use crate::crypto::prekeys::PrekeyLifecycleManager;
use crate::crypto::primitives::RatchetPrimitives;
use crate::crypto::sessions::{Session, SessionStore};
use crate::crypto::vault::SecretKeyVault;
use crate::db;
use crate::error::{AppError, AppResult, HandshakeError};
use crate::models::{KeyExchangeRecord, PendingExchange};

// ============================================================================
// Identity directory
// ============================================================================

/// Cached view of users' published identity keys
pub struct IdentityDirectory {
    api: Arc<dyn ServerApi>,
    cache: RwLock<HashMap<String, IdentityPublicKey>>,
}

impl IdentityDirectory {
    pub fn new(api: Arc<dyn ServerApi>) -> Self {
        Self {
            api,
            cache: RwLock::new(HashMap::new()),
        }
    }

    /// Published identity for `user_id`, from cache when possible
    pub async fn get(&self, user_id: &str) -> AppResult<Option<IdentityPublicKey>> {
        if let Some(key) = self.cache.read().await.get(user_id) {
            return Ok(Some(key.clone()));
        }
        self.refresh(user_id).await
    }

    /// Fetch the currently published identity, bypassing the cache
    pub async fn refresh(&self, user_id: &str) -> AppResult<Option<IdentityPublicKey>> {
        let fetched = self.api.get_identity_key(user_id).await?;
        let mut cache = self.cache.write().await;
        match &fetched {
            Some(key) => {
                if cache.get(user_id).is_some_and(|old| old != key) {
                    tracing::warn!("Published identity key for {} changed", user_id);
                }
                cache.insert(user_id.to_string(), key.clone());
            }
            None => {
                cache.remove(user_id);
            }
        }
        Ok(fetched)
    }

    pub async fn remember(&self, user_id: &str, key: &IdentityPublicKey) {
        self.cache
            .write()
            .await
            .insert(user_id.to_string(), key.clone());
    }

    pub async fn forget(&self, user_id: &str) {
        self.cache.write().await.remove(user_id);
    }
}

// ============================================================================
// Safety numbers
// ============================================================================

/// Identity verification state of a session's peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "camelCase")]
pub enum SafetyStatus {
    /// No session or no captured identity to compare against
    Unverified,
    /// The peer's published identity matches the one captured at session creation
    #[serde(rename_all = "camelCase")]
    Verified { safety_number: String },
    /// The published identity differs from the captured one
    #[serde(rename_all = "camelCase")]
    Mismatch {
        captured_fingerprint: String,
        current_fingerprint: String,
    },
}

/// Displayable safety number for a pair of identities
///
/// Symmetric: both parties compute the same digits. Twelve groups of five.
pub fn safety_number(a: &IdentityPublicKey, b: &IdentityPublicKey) -> String {
    let mut parts = [
        [a.kem_key.as_slice(), a.signing_key.as_slice()].concat(),
        [b.kem_key.as_slice(), b.signing_key.as_slice()].concat(),
    ];
    parts.sort();

    let mut digits = String::with_capacity(71);
    for round in 0u8..2 {
        let mut hasher = Sha256::new();
        hasher.update(b"NoChat Safety Number v1");
        hasher.update([round]);
        hasher.update(&parts[0]);
        hasher.update(&parts[1]);
        let digest = hasher.finalize();

        for chunk in digest.chunks(5).take(6) {
            let mut value = 0u64;
            for byte in chunk {
                value = (value << 8) | u64::from(*byte);
            }
            if !digits.is_empty() {
                digits.push(' ');
            }
            digits.push_str(&format!("{:05}", value % 100_000));
        }
    }
    digits
}

// ============================================================================
// Coordinator
// ============================================================================

/// Drives X3DH-style handshakes between the local user and peers
pub struct KeyExchangeCoordinator {
    user_id: String,
    identity: Arc<IdentityKeyPair>,
    primitives: Arc<dyn RatchetPrimitives>,
    api: Arc<dyn ServerApi>,
    db: SqlitePool,
    vault: Arc<SecretKeyVault>,
    sessions: Arc<SessionStore>,
    prekeys: Arc<PrekeyLifecycleManager>,
    directory: Arc<IdentityDirectory>,
    /// Serializes session creation, both as initiator and as responder, so
    /// only one session ever exists per (conversation, peer)
    handshake_lock: Mutex<()>,
}

impl KeyExchangeCoordinator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_id: &str,
        identity: Arc<IdentityKeyPair>,
        primitives: Arc<dyn RatchetPrimitives>,
        api: Arc<dyn ServerApi>,
        db: SqlitePool,
        vault: Arc<SecretKeyVault>,
        sessions: Arc<SessionStore>,
        prekeys: Arc<PrekeyLifecycleManager>,
        directory: Arc<IdentityDirectory>,
    ) -> Self {
        Self {
            user_id: user_id.to_string(),
            identity,
            primitives,
            api,
            db,
            vault,
            sessions,
            prekeys,
            directory,
            handshake_lock: Mutex::new(()),
        }
    }

    /// Reject an identity that differs from the one pinned for `peer_id`;
    /// pin on first use.
    async fn check_pin(&self, peer_id: &str, presented: &IdentityPublicKey) -> AppResult<()> {
        match self.vault.pinned_identity(peer_id).await? {
            Some(pinned) if &pinned != presented => {
                tracing::warn!("Identity key mismatch for {}: pinned {}, presented {}", peer_id, pinned.fingerprint(), presented.fingerprint());
                Err(HandshakeError::IdentityMismatch {
                    peer_id: peer_id.to_string(),
                    pinned: pinned.fingerprint(),
                    presented: presented.fingerprint(),
                }
                .into())
            }
            Some(_) => Ok(()),
            None => self.vault.pin_identity(peer_id, presented).await,
        }
    }

    /// Establish a session with `peer_id` for `conversation_id` as initiator
    ///
    /// Returns the existing session if there is one, retransmitting its
    /// key-exchange record if that was never delivered. The existence check
    /// and the save happen under the handshake lock, so an exchange accepted
    /// concurrently from the feed either wins or is discarded.
    pub async fn initiate(&self, peer_id: &str, conversation_id: &str) -> AppResult<Session> {
        let session = {
            let _guard = self.handshake_lock.lock().await;
            match self.sessions.load(conversation_id, peer_id).await? {
                Some(existing) => existing,
                None => self.initiate_locked(peer_id, conversation_id).await?,
            }
        };
        self.retransmit(session).await
    }

    async fn initiate_locked(&self, peer_id: &str, conversation_id: &str) -> AppResult<Session> {
        let unavailable = || AppError::SessionUnavailable {
            conversation_id: conversation_id.to_string(),
            peer_id: peer_id.to_string(),
        };

        let bundle = match self.api.get_prekey_bundle(peer_id).await {
            Ok(Some(bundle)) => bundle,
            Ok(None) => {
                tracing::warn!("No prekey bundle published for {}", peer_id);
                return Err(unavailable());
            }
            Err(e) if e.is_transient() => {
                tracing::warn!("Could not fetch prekey bundle for {}: {}", peer_id, e);
                return Err(unavailable());
            }
            Err(e) => return Err(e),
        };

        bundle
            .validate_keys()
            .map_err(|e| HandshakeError::MalformedBundle(e.to_string()))?;
        // The only authenticity check before first use
        bundle
            .verify()
            .map_err(|_| HandshakeError::InvalidSignature(peer_id.to_string()))?;
        self.check_pin(peer_id, &bundle.identity_key).await?;
        self.directory.remember(peer_id, &bundle.identity_key).await;

        let initial = self
            .primitives
            .create_initial_ratchet_session(&self.identity, &bundle)
            .map_err(|e| HandshakeError::MalformedBundle(e.to_string()))?;

        let record = KeyExchangeRecord {
            exchange_id: uuid::Uuid::new_v4().to_string(),
            from_user_id: self.user_id.clone(),
            to_user_id: peer_id.to_string(),
            conversation_id: conversation_id.to_string(),
            bundle: initial.bundle,
            created_at: chrono::Utc::now(),
        };

        let mut session = Session::pairwise(
            conversation_id,
            peer_id,
            initial.state,
            bundle.identity_key.clone(),
            &record.exchange_id,
        );
        session.pending_outbound_exchange = Some(record);
        self.sessions.save(&session).await?;

        tracing::info!(
            "Initiated session with {} in {} (signed prekey {}, one-time prekey {:?})",
            peer_id,
            conversation_id,
            bundle.signed_prekey.key_id,
            bundle.one_time_prekey.as_ref().map(|k| k.key_id)
        );
        Ok(session)
    }

    /// Deliver a session's undelivered key-exchange record, if any
    async fn retransmit(&self, mut session: Session) -> AppResult<Session> {
        let Some(record) = session.pending_outbound_exchange.clone() else {
            return Ok(session);
        };

        match self.api.initiate_key_exchange(&record).await {
            Ok(()) => {
                session.pending_outbound_exchange = None;
                if let Err(e) = self.sessions.save(&session).await {
                    tracing::warn!("Failed to record delivered exchange {}: {}", record.exchange_id, e);
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Key exchange {} to {} not delivered, will retry: {}",
                    record.exchange_id,
                    record.to_user_id,
                    e
                );
            }
        }
        Ok(session)
    }

    /// Record an inbound handshake and accept it
    ///
    /// Returns `None` when the record is not addressed to us or a session
    /// already exists for the pair.
    pub async fn receive_exchange(&self, record: KeyExchangeRecord) -> AppResult<Option<Session>> {
        if record.to_user_id != self.user_id {
            tracing::debug!("Ignoring key exchange {} addressed to {}", record.exchange_id, record.to_user_id);
            return Ok(None);
        }

        let json = serde_json::to_string(&PendingExchange {
            record: record.clone(),
            received_at: chrono::Utc::now(),
        })?;
        let inserted = db::insert_pending_exchange(
            &self.db,
            &record.from_user_id,
            &record.conversation_id,
            &record.exchange_id,
            &json,
        )
        .await?;
        if !inserted {
            tracing::debug!(
                "Exchange already pending from {} in {}, keeping the first",
                record.from_user_id,
                record.conversation_id
            );
        }

        self.accept_pending_for(&record.from_user_id, &record.conversation_id)
            .await
    }

    /// Accept the pending exchange from `peer_id` in `conversation_id`, if any
    pub async fn accept_pending_for(&self, peer_id: &str, conversation_id: &str) -> AppResult<Option<Session>> {
        match db::get_pending_exchange(&self.db, peer_id, conversation_id).await? {
            Some(json) => {
                let pending: PendingExchange = serde_json::from_str(&json)?;
                self.accept(&pending).await.map(Some)
            }
            None => Ok(None),
        }
    }

    /// Convert a pending exchange into a session
    ///
    /// Idempotent: if a session already exists for the pair it is returned
    /// unchanged and no prekey is consumed.
    pub async fn accept(&self, pending: &PendingExchange) -> AppResult<Session> {
        let result = self.accept_locked(pending).await;
        if let Err(AppError::Handshake(
            e @ (HandshakeError::UnknownPrekey(_) | HandshakeError::MalformedBundle(_)),
        )) = &result
        {
            // Can never succeed; drop it so the peer's next handshake is not shadowed
            tracing::warn!("Discarding exchange from {}: {}", pending.from_user_id(), e);
            db::delete_pending_exchange(&self.db, pending.from_user_id(), pending.conversation_id()).await?;
        }
        result
    }

    async fn accept_locked(&self, pending: &PendingExchange) -> AppResult<Session> {
        let _guard = self.handshake_lock.lock().await;
        let record = &pending.record;
        let (peer_id, conversation_id) = (record.from_user_id.as_str(), record.conversation_id.as_str());

        if let Some(existing) = self.sessions.load(conversation_id, peer_id).await? {
            if existing.exchange_id.as_deref() != Some(record.exchange_id.as_str()) {
                tracing::info!(
                    "Session with {} in {} already exists, discarding exchange {}",
                    peer_id,
                    conversation_id,
                    record.exchange_id
                );
            }
            db::delete_pending_exchange(&self.db, peer_id, conversation_id).await?;
            return Ok(existing);
        }

        let bundle = &record.bundle;
        self.check_pin(peer_id, &bundle.identity_key).await?;

        let signed_prekey = self.prekeys.signed_prekey_pair(bundle.signed_prekey_id).await?;
        let one_time_prekey = match bundle.one_time_prekey_id {
            Some(key_id) => Some(self.prekeys.one_time_prekey_pair(key_id).await?),
            None => None,
        };

        let state = self
            .primitives
            .accept_ratchet_session(&self.identity, &signed_prekey, one_time_prekey.as_ref(), bundle)
            .map_err(|e| HandshakeError::MalformedBundle(e.to_string()))?;

        let session = Session::pairwise(
            conversation_id,
            peer_id,
            state,
            bundle.identity_key.clone(),
            &record.exchange_id,
        );
        // The prekey secret is only dropped once the session is durable
        self.sessions.save(&session).await?;
        if let Some(key_id) = bundle.one_time_prekey_id {
            self.prekeys.consume_one_time_prekey(key_id).await?;
        }
        db::delete_pending_exchange(&self.db, peer_id, conversation_id).await?;
        self.directory.remember(peer_id, &bundle.identity_key).await;

        if let Err(e) = self.api.accept_key_exchange(&record.exchange_id).await {
            tracing::warn!("Failed to acknowledge exchange {}: {}", record.exchange_id, e);
        }

        tracing::info!("Accepted session from {} in {}", peer_id, conversation_id);
        Ok(session)
    }

    /// Accept every pending exchange, local and server-side
    ///
    /// Failures are logged per exchange and do not stop the others.
    pub async fn sync_pending_exchanges(&self) -> AppResult<Vec<Session>> {
        match self.api.get_pending_key_exchanges().await {
            Ok(records) => {
                for record in records {
                    if record.to_user_id != self.user_id {
                        continue;
                    }
                    let json = serde_json::to_string(&PendingExchange {
                        record: record.clone(),
                        received_at: chrono::Utc::now(),
                    })?;
                    db::insert_pending_exchange(
                        &self.db,
                        &record.from_user_id,
                        &record.conversation_id,
                        &record.exchange_id,
                        &json,
                    )
                    .await?;
                }
            }
            Err(e) => tracing::warn!("Could not fetch pending key exchanges: {}", e),
        }

        let mut accepted = Vec::new();
        for json in db::list_pending_exchanges(&self.db).await? {
            let pending: PendingExchange = match serde_json::from_str(&json) {
                Ok(pending) => pending,
                Err(e) => {
                    tracing::error!("Dropping unreadable pending exchange: {}", e);
                    continue;
                }
            };
            match self.accept(&pending).await {
                Ok(session) => accepted.push(session),
                Err(e) if e.is_security_event() => {
                    tracing::warn!("Security event accepting exchange from {}: {}", pending.from_user_id(), e)
                }
                Err(e) => tracing::warn!("Could not accept exchange from {}: {}", pending.from_user_id(), e),
            }
        }
        Ok(accepted)
    }

    /// Reconnect resync: accept pending exchanges and redeliver undelivered ones
    pub async fn resync(&self) -> AppResult<usize> {
        let accepted = self.sync_pending_exchanges().await?.len();
        for session in self.sessions.list().await? {
            if session.pending_outbound_exchange.is_some() {
                self.retransmit(session).await?;
            }
        }
        Ok(accepted)
    }

    /// Compare the identity captured in a session with the published one
    pub async fn safety_status(&self, conversation_id: &str, peer_id: &str) -> AppResult<SafetyStatus> {
        let Some(captured) = self
            .sessions
            .load(conversation_id, peer_id)
            .await?
            .and_then(|s| s.peer_identity)
        else {
            return Ok(SafetyStatus::Unverified);
        };

        let Some(current) = self.directory.refresh(peer_id).await? else {
            return Ok(SafetyStatus::Unverified);
        };

        if captured == current {
            Ok(SafetyStatus::Verified {
                safety_number: safety_number(&self.identity.public(), &current),
            })
        } else {
            Ok(SafetyStatus::Mismatch {
                captured_fingerprint: captured.fingerprint(),
                current_fingerprint: current.fingerprint(),
            })
        }
    }

    /// Explicitly trust the peer's currently published identity
    ///
    /// Re-pins the peer and updates the identity captured in the session.
    pub async fn trust_identity(&self, conversation_id: &str, peer_id: &str) -> AppResult<SafetyStatus> {
        let current = self.directory.refresh(peer_id).await?.ok_or_else(|| AppError::SessionUnavailable {
            conversation_id: conversation_id.to_string(),
            peer_id: peer_id.to_string(),
        })?;

        self.vault.pin_identity(peer_id, &current).await?;
        if let Some(mut session) = self.sessions.load(conversation_id, peer_id).await? {
            session.peer_identity = Some(current.clone());
            self.sessions.save(&session).await?;
        }
        tracing::info!("Trusted identity {} for {}", current.fingerprint(), peer_id);

        self.safety_status(conversation_id, peer_id).await
    }
}
