mod common;

use std::sync::Arc;

use base64::Engine;

use common::TestUser;
use nochat_session::api::ServerApi;
use nochat_session::config::RetryPolicy;
use nochat_session::crypto::{PersistQueue, SecretKeyVault, SessionStore, VaultKey};
use nochat_session::db;
use nochat_session::models::{Conversation, SendOptions};
use nochat_session::testing::InMemoryServer;

/// A session store on a fresh local database, sharing the user's vault key
async fn fresh_store(server: &InMemoryServer, user: &TestUser) -> (SessionStore, sqlx::SqlitePool) {
    let pool = db::connect_in_memory().await.unwrap();
    let api: Arc<dyn ServerApi> = server.client(&user.user_id);
    let vault = Arc::new(SecretKeyVault::new(pool.clone(), VaultKey::from_bytes(user.vault_key)));
    let queue = PersistQueue::spawn(api.clone(), RetryPolicy::default());
    (SessionStore::new(pool.clone(), vault, api, queue), pool)
}

async fn flush_until_idle(user: &TestUser) -> usize {
    let mut remaining = usize::MAX;
    for _ in 0..10 {
        remaining = user.service.flush().await;
        if remaining == 0 {
            break;
        }
    }
    remaining
}

#[tokio::test]
async fn test_failed_network_save_is_retried() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let _bob = TestUser::start(&server, "bob").await;

    server.fail_next_session_saves(1);
    alice
        .service
        .pipeline()
        .send(&Conversation::direct("dm-1", "bob"), "hi", SendOptions::default())
        .await
        .unwrap();

    assert_eq!(flush_until_idle(&alice).await, 0);
    assert!(server.session_save_attempts() >= 2);
    assert!(server.session_blob("alice", "dm-1", "bob").is_some());

    // The network copy restores the advanced state on a new device database
    let (store, _pool) = fresh_store(&server, &alice).await;
    let restored = store.load("dm-1", "bob").await.unwrap().unwrap();
    assert_eq!(restored.messages_sent, 1);
    assert_eq!(
        restored.stats().session_id,
        alice.service.session_stats("dm-1", "bob").await.unwrap().unwrap().session_id
    );
}

#[tokio::test]
async fn test_persistent_failure_gives_up_without_blocking() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let _bob = TestUser::start(&server, "bob").await;

    server.fail_next_session_saves(usize::MAX);
    let outcome = alice
        .service
        .pipeline()
        .send(&Conversation::direct("dm-1", "bob"), "hi", SendOptions::default())
        .await;
    assert!(outcome.is_ok());

    assert_eq!(flush_until_idle(&alice).await, 0);
    assert!(server.session_blob("alice", "dm-1", "bob").is_none());
    // The local copy is unaffected
    assert!(alice.service.session_stats("dm-1", "bob").await.unwrap().is_some());
}

#[tokio::test]
async fn test_blob_on_server_is_sealed() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let _bob = TestUser::start(&server, "bob").await;

    alice.service.exchange().initiate("bob", "dm-1").await.unwrap();
    alice.service.flush().await;

    let blob = server.session_blob("alice", "dm-1", "bob").unwrap();
    let sealed = base64::engine::general_purpose::STANDARD.decode(&blob).unwrap();
    assert!(serde_json::from_slice::<serde_json::Value>(&sealed).is_err());
    assert!(!String::from_utf8_lossy(&sealed).contains("\"peer_id\""));
}

#[tokio::test]
async fn test_corrupt_session_is_discarded() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;

    let (store, pool) = fresh_store(&server, &alice).await;
    db::upsert_session(&pool, "dm-9", "mallory", "bm90IGEgc2Vzc2lvbg==")
        .await
        .unwrap();

    assert!(store.load("dm-9", "mallory").await.unwrap().is_none());
    assert!(db::get_session(&pool, "dm-9", "mallory").await.unwrap().is_none());
}

#[tokio::test]
async fn test_logout_wipes_local_state() {
    let server = InMemoryServer::new();
    let (alice, _bob, _) = common::connected_pair(&server).await;
    let (pool, vault_key) = (alice.db.clone(), alice.vault_key);

    alice.service.logout().await.unwrap();

    let vault = SecretKeyVault::new(pool.clone(), VaultKey::from_bytes(vault_key));
    assert!(vault.load_identity().await.unwrap().is_none());
    assert_eq!(vault.count_one_time_prekeys().await.unwrap(), 0);
    assert!(db::list_sessions(&pool).await.unwrap().is_empty());
}
