//! SessionService - wiring for one logged-in user
//!
//! Builds the vault, prekey manager, session store, key-exchange
//! coordinator, message pipeline and feed processor around a single
//! identity, and runs prekey maintenance on startup.
//!
//! ## Example
//!
//! ```rust,ignore
//! use nochat_session::service::SessionService;
//!
//! let (service, mut notifications) =
//!     SessionService::start(config, api, db, vault_key, "alice").await?;
//!
//! let conversation = Conversation::direct("c1", "bob");
//! service.pipeline().send(&conversation, "hi", SendOptions::default()).await?;
//! ```

use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::mpsc;

use crate::api::ServerApi;
use crate::config::Config;
use crate::crypto::exchange::{IdentityDirectory, KeyExchangeCoordinator, SafetyStatus};
use crate::crypto::keys::{IdentityKeyPair, IdentityPublicKey};
use crate::crypto::persist_queue::PersistQueue;
use crate::crypto::prekeys::{PreKeyStatus, PrekeyLifecycleManager, PrekeyReport};
use crate::crypto::primitives::{RatchetPrimitives, StandardPrimitives};
use crate::crypto::sessions::{SessionStats, SessionStore};
use crate::crypto::vault::{SecretKeyVault, VaultKey};
use crate::db;
use crate::error::AppResult;
use crate::messaging::{MessagePipeline, Notification, SyncEventProcessor};

/// The session layer for one authenticated user
pub struct SessionService {
    user_id: String,
    identity: Arc<IdentityKeyPair>,
    db: SqlitePool,
    vault: Arc<SecretKeyVault>,
    sessions: Arc<SessionStore>,
    prekeys: Arc<PrekeyLifecycleManager>,
    exchange: Arc<KeyExchangeCoordinator>,
    pipeline: Arc<MessagePipeline>,
    sync: Arc<SyncEventProcessor>,
    startup_report: PrekeyReport,
}

impl SessionService {
    /// Start the session layer for `user_id`
    ///
    /// Loads the identity from the vault, or creates and registers one.
    /// Prekey maintenance that fails on the network is logged and retried
    /// at the next start; anything else is an error.
    pub async fn start(
        config: Config,
        api: Arc<dyn ServerApi>,
        db: SqlitePool,
        vault_key: VaultKey,
        user_id: &str,
    ) -> AppResult<(Self, mpsc::UnboundedReceiver<Notification>)> {
        config.validate()?;

        let vault = Arc::new(SecretKeyVault::new(db.clone(), vault_key));
        let prekeys = Arc::new(PrekeyLifecycleManager::new(
            vault.clone(),
            api.clone(),
            config.prekeys.clone(),
        ));

        let (identity, maintenance) = match vault.load_identity().await? {
            Some(identity) => {
                tracing::info!("Loaded identity {} for {}", identity.fingerprint(), user_id);
                let report = prekeys.on_login(&identity).await;
                (identity, report)
            }
            None => {
                let identity = IdentityKeyPair::generate();
                vault.save_identity(&identity).await?;
                tracing::info!("Created identity {} for {}", identity.fingerprint(), user_id);
                let report = prekeys.register(&identity).await;
                (identity, report)
            }
        };
        let startup_report = match maintenance {
            Ok(report) => report,
            Err(e) if e.is_transient() => {
                tracing::warn!("Prekey maintenance deferred: {}", e);
                PrekeyReport::default()
            }
            Err(e) => return Err(e),
        };

        let identity = Arc::new(identity);
        let primitives: Arc<dyn RatchetPrimitives> = Arc::new(StandardPrimitives);
        let queue = PersistQueue::spawn(api.clone(), config.persist_retry.clone());
        let sessions = Arc::new(SessionStore::new(db.clone(), vault.clone(), api.clone(), queue));
        let directory = Arc::new(IdentityDirectory::new(api.clone()));

        let exchange = Arc::new(KeyExchangeCoordinator::new(
            user_id,
            identity.clone(),
            primitives.clone(),
            api.clone(),
            db.clone(),
            vault.clone(),
            sessions.clone(),
            prekeys.clone(),
            directory.clone(),
        ));
        let pipeline = Arc::new(MessagePipeline::new(
            user_id,
            identity.clone(),
            primitives,
            api,
            sessions.clone(),
            exchange.clone(),
            directory,
            vault.clone(),
        ));
        let (sync, notifications) = SyncEventProcessor::new(&config, pipeline.clone(), exchange.clone());

        // Handshakes that arrived while we were offline
        match exchange.sync_pending_exchanges().await {
            Ok(accepted) if !accepted.is_empty() => {
                tracing::info!("Accepted {} key exchanges received while offline", accepted.len())
            }
            Ok(_) => {}
            Err(e) => tracing::warn!("Pending key exchange sync failed: {}", e),
        }

        let service = Self {
            user_id: user_id.to_string(),
            identity,
            db,
            vault,
            sessions,
            prekeys,
            exchange,
            pipeline,
            sync: Arc::new(sync),
            startup_report,
        };
        Ok((service, notifications))
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn identity(&self) -> IdentityPublicKey {
        self.identity.public()
    }

    /// Fingerprint of our identity key, for display
    pub fn fingerprint(&self) -> String {
        self.identity.fingerprint()
    }

    pub fn pipeline(&self) -> &Arc<MessagePipeline> {
        &self.pipeline
    }

    pub fn exchange(&self) -> &Arc<KeyExchangeCoordinator> {
        &self.exchange
    }

    pub fn sync(&self) -> &Arc<SyncEventProcessor> {
        &self.sync
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.sessions
    }

    /// What prekey maintenance did when the service started
    pub fn startup_report(&self) -> &PrekeyReport {
        &self.startup_report
    }

    pub async fn prekey_status(&self) -> AppResult<PreKeyStatus> {
        self.prekeys.status().await
    }

    /// Re-run login maintenance, e.g. after a long-running session
    pub async fn replenish_prekeys(&self) -> AppResult<PrekeyReport> {
        self.prekeys.on_login(&self.identity).await
    }

    pub async fn session_stats(&self, conversation_id: &str, peer_id: &str) -> AppResult<Option<SessionStats>> {
        Ok(self
            .sessions
            .load(conversation_id, peer_id)
            .await?
            .map(|s| s.stats()))
    }

    pub async fn all_session_stats(&self) -> AppResult<Vec<SessionStats>> {
        Ok(self.sessions.list().await?.iter().map(|s| s.stats()).collect())
    }

    pub async fn safety_status(&self, conversation_id: &str, peer_id: &str) -> AppResult<SafetyStatus> {
        self.exchange.safety_status(conversation_id, peer_id).await
    }

    /// Push pending session saves to the network; returns how many remain
    pub async fn flush(&self) -> usize {
        self.sessions.flush().await
    }

    /// Wipe every local secret and session
    ///
    /// Session blobs already on the network stay there; they are sealed
    /// under the vault key and useless without it.
    pub async fn logout(self) -> AppResult<()> {
        let remaining = self.flush().await;
        if remaining > 0 {
            tracing::warn!("Logging out with {} session saves not persisted to the network", remaining);
        }

        self.sessions.clear_local().await?;
        db::clear_pending_exchanges(&self.db).await?;
        self.vault.clear().await?;
        tracing::info!("Logged out {}", self.user_id);
        Ok(())
    }
}
