//! Simulated users sharing one in-memory server

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio::sync::mpsc;

use nochat_session::api::ServerApi;
use nochat_session::config::{Config, PreKeyConfig, RetryPolicy};
use nochat_session::crypto::{SecretKeyVault, VaultKey};
use nochat_session::db;
use nochat_session::error::AppResult;
use nochat_session::messaging::Notification;
use nochat_session::models::SyncEvent;
use nochat_session::service::SessionService;
use nochat_session::testing::InMemoryServer;

pub fn test_config() -> Config {
    Config {
        prekeys: PreKeyConfig {
            low_water_mark: 5,
            target_pool_size: 10,
            signed_prekey_max_age_days: 7,
        },
        persist_retry: RetryPolicy {
            max_attempts: 5,
            base_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
        },
        ..Config::default()
    }
}

pub struct TestUser {
    pub user_id: String,
    pub service: SessionService,
    pub notifications: mpsc::UnboundedReceiver<Notification>,
    pub db: SqlitePool,
    pub vault_key: [u8; 32],
}

impl TestUser {
    pub async fn start(server: &InMemoryServer, user_id: &str) -> Self {
        let db = db::connect_in_memory().await.unwrap();
        let vault_key = rand::random::<[u8; 32]>();
        Self::start_with(server, user_id, db, vault_key).await
    }

    /// Start (or restart) on an existing database
    pub async fn start_with(server: &InMemoryServer, user_id: &str, db: SqlitePool, vault_key: [u8; 32]) -> Self {
        Self::start_configured(server, user_id, db, vault_key, test_config()).await
    }

    pub async fn start_configured(
        server: &InMemoryServer,
        user_id: &str,
        db: SqlitePool,
        vault_key: [u8; 32],
        config: Config,
    ) -> Self {
        let api: Arc<dyn ServerApi> = server.client(user_id);
        let (service, notifications) = SessionService::start(
            config,
            api,
            db.clone(),
            VaultKey::from_bytes(vault_key),
            user_id,
        )
        .await
        .unwrap();

        Self {
            user_id: user_id.to_string(),
            service,
            notifications,
            db,
            vault_key,
        }
    }

    /// Stop this instance and start again on the same database
    pub async fn restart(self, server: &InMemoryServer) -> Self {
        let (user_id, db, vault_key) = (self.user_id.clone(), self.db.clone(), self.vault_key);
        drop(self.service);
        Self::start_with(server, &user_id, db, vault_key).await
    }

    /// A second handle onto this user's vault
    pub fn vault(&self) -> SecretKeyVault {
        SecretKeyVault::new(self.db.clone(), VaultKey::from_bytes(self.vault_key))
    }

    /// Apply every queued feed event; returns each event's result
    pub async fn deliver(&self, server: &InMemoryServer) -> Vec<AppResult<()>> {
        let mut results = Vec::new();
        for event in server.drain_events(&self.user_id) {
            results.push(self.service.sync().handle(event).await);
        }
        results
    }

    pub fn drain_notifications(&mut self) -> Vec<Notification> {
        let mut out = Vec::new();
        while let Ok(notification) = self.notifications.try_recv() {
            out.push(notification);
        }
        out
    }
}

pub fn new_message_events(events: &[SyncEvent]) -> Vec<SyncEvent> {
    events
        .iter()
        .filter(|e| matches!(e, SyncEvent::NewMessage { .. }))
        .cloned()
        .collect()
}

/// Alice and Bob with an established DM "dm-1"; Bob has the conversation
/// open and has read Alice's first message. Returns that message's id.
pub async fn connected_pair(server: &InMemoryServer) -> (TestUser, TestUser, String) {
    use nochat_session::models::{Conversation, SendOptions};

    let alice = TestUser::start(server, "alice").await;
    let bob = TestUser::start(server, "bob").await;

    let outcome = alice
        .service
        .pipeline()
        .send(&Conversation::direct("dm-1", "bob"), "hi", SendOptions::default())
        .await
        .unwrap();

    bob.service
        .sync()
        .register_conversation(Conversation::direct("dm-1", "alice"))
        .await;
    bob.service.sync().open_conversation("dm-1").await.unwrap();
    for result in bob.deliver(server).await {
        result.unwrap();
    }

    (alice, bob, outcome.message_id().to_string())
}
