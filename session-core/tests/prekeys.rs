mod common;

use common::TestUser;
use nochat_session::models::SyncEvent;
use nochat_session::testing::InMemoryServer;

/// Every prekey the server hands out must have its secret stored locally
async fn assert_published_prekeys_are_held(user: &TestUser, server: &InMemoryServer) {
    let vault = user.vault();
    for key_id in server.one_time_prekey_ids(&user.user_id) {
        assert!(
            vault.load_one_time_prekey(key_id).await.unwrap().is_some(),
            "prekey {} published without a local secret",
            key_id
        );
    }
}

#[tokio::test]
async fn test_registration_publishes_full_pool() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;

    let report = alice.service.startup_report();
    assert!(report.replaced);
    assert!(report.rotated_signed_prekey);
    assert_eq!(report.generated, 10);

    assert_eq!(server.prekey_count("alice"), 10);
    let status = alice.service.prekey_status().await.unwrap();
    assert_eq!(status.one_time_prekey_count, 10);
    assert_eq!(status.signed_prekey_id, Some(1));
    assert!(!status.needs_rotation);
    assert_published_prekeys_are_held(&alice, &server).await;
}

#[tokio::test]
async fn test_login_replenishes_below_low_water() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;

    // Peers consumed seven of ten
    server.drain_prekeys("alice", 7);
    let report = alice.service.replenish_prekeys().await.unwrap();

    assert_eq!(report.server_count, 3);
    assert_eq!(report.generated, 7);
    assert!(!report.replaced);
    assert!(!report.rotated_signed_prekey);
    assert_eq!(server.prekey_count("alice"), 10);
    // Unused secrets stay until a peer's handshake consumes them
    assert_eq!(alice.service.prekey_status().await.unwrap().one_time_prekey_count, 17);
    assert_published_prekeys_are_held(&alice, &server).await;

    let healthy = alice.service.replenish_prekeys().await.unwrap();
    assert_eq!(healthy.generated, 0);
    assert_eq!(server.prekey_count("alice"), 10);
}

#[tokio::test]
async fn test_missing_local_secrets_replace_server_pool() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;

    let vault = alice.vault();
    for key_id in vault.one_time_prekey_ids().await.unwrap() {
        vault.delete_one_time_prekey(key_id).await.unwrap();
    }

    let report = alice.service.replenish_prekeys().await.unwrap();
    assert!(report.replaced);
    assert_eq!(report.generated, 10);
    assert_eq!(server.prekey_count("alice"), 10);
    assert_eq!(alice.service.prekey_status().await.unwrap().one_time_prekey_count, 10);
    assert_published_prekeys_are_held(&alice, &server).await;
}

#[tokio::test]
async fn test_restart_keeps_identity_and_pool() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let fingerprint = alice.service.fingerprint();

    let alice = alice.restart(&server).await;
    assert_eq!(alice.service.fingerprint(), fingerprint);

    let report = alice.service.startup_report();
    assert_eq!(report.server_count, 10);
    assert_eq!(report.generated, 0);
    assert!(!report.rotated_signed_prekey);
    assert_eq!(server.prekey_count("alice"), 10);
}

#[tokio::test]
async fn test_handshake_consumes_exactly_one_prekey() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let bob = TestUser::start(&server, "bob").await;

    alice.service.exchange().initiate("bob", "dm-1").await.unwrap();
    assert_eq!(server.prekey_count("bob"), 9);

    bob.deliver(&server).await;
    assert_eq!(bob.service.prekey_status().await.unwrap().one_time_prekey_count, 9);
    assert_published_prekeys_are_held(&bob, &server).await;
}

#[tokio::test]
async fn test_pool_replacement_keeps_secrets_for_in_flight_handshakes() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let bob = TestUser::start(&server, "bob").await;

    // Alice fetched Bob's bundle before the pool is replaced
    alice.service.exchange().initiate("bob", "dm-1").await.unwrap();
    let record = server
        .drain_events("bob")
        .into_iter()
        .find_map(|e| match e {
            SyncEvent::KeyExchange { exchange } => Some(exchange),
            _ => None,
        })
        .unwrap();
    let referenced = record.bundle.one_time_prekey_id.unwrap();

    // Bob loses a few secrets the server still advertises
    let vault = bob.vault();
    let mut held = vault.one_time_prekey_ids().await.unwrap();
    held.retain(|id| *id != referenced);
    held.sort();
    for key_id in held.iter().rev().take(4) {
        vault.delete_one_time_prekey(*key_id).await.unwrap();
    }

    let report = bob.service.replenish_prekeys().await.unwrap();
    assert!(report.replaced);
    assert_eq!(report.generated, 10);
    assert_eq!(server.prekey_count("bob"), 10);
    assert_eq!(bob.service.prekey_status().await.unwrap().one_time_prekey_count, 16);
    assert!(vault.load_one_time_prekey(referenced).await.unwrap().is_some());

    // The exchange that referenced an old prekey still completes
    let accepted = bob.service.exchange().receive_exchange(record).await.unwrap();
    assert!(accepted.is_some());
    assert!(bob.service.session_stats("dm-1", "alice").await.unwrap().is_some());
    assert!(vault.load_one_time_prekey(referenced).await.unwrap().is_none());
}
