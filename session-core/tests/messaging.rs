mod common;

use std::time::Duration;

use common::{connected_pair, new_message_events, test_config, TestUser};
use nochat_session::db;
use nochat_session::error::{AppError, MessageError};
use nochat_session::messaging::Notification;
use nochat_session::models::{Conversation, MessageContent, SendOptions, SendOutcome, SyncEvent};
use nochat_session::testing::InMemoryServer;

#[tokio::test]
async fn test_duplicate_delivery_shows_one_message() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let bob = TestUser::start(&server, "bob").await;

    alice
        .service
        .pipeline()
        .send(&Conversation::direct("dm-1", "bob"), "once", SendOptions::default())
        .await
        .unwrap();

    bob.service.sync().open_conversation("dm-1").await.unwrap();
    let events = server.drain_events("bob");
    for event in events.iter().chain(events.iter()) {
        bob.service.sync().handle(event.clone()).await.unwrap();
    }

    let messages = bob.service.sync().messages("dm-1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text(), Some("once"));

    let stats = bob.service.session_stats("dm-1", "alice").await.unwrap().unwrap();
    assert_eq!(stats.messages_received, 1);
}

#[tokio::test]
async fn test_closed_conversation_counts_unread_and_decrypts_lazily() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let mut bob = TestUser::start(&server, "bob").await;

    let to_bob = Conversation::direct("dm-1", "bob");
    alice.service.pipeline().send(&to_bob, "one", SendOptions::default()).await.unwrap();
    alice.service.pipeline().send(&to_bob, "two", SendOptions::default()).await.unwrap();

    let events = server.drain_events("bob");
    for event in events.iter().chain(new_message_events(&events).iter()) {
        bob.service.sync().handle(event.clone()).await.unwrap();
    }

    // The handshake is accepted right away; messages wait for the UI
    assert!(bob.service.session_stats("dm-1", "alice").await.unwrap().is_some());
    assert_eq!(bob.service.sync().unread_count("dm-1").await, 2);
    assert!(bob.service.sync().messages("dm-1").await.is_empty());
    assert_eq!(
        bob.drain_notifications(),
        vec![
            Notification::NewMessage {
                conversation_id: "dm-1".to_string(),
                sender_id: "alice".to_string(),
            };
            2
        ]
    );

    let opened = bob.service.sync().open_conversation("dm-1").await.unwrap();
    let mut texts: Vec<&str> = opened.iter().filter_map(|m| m.text()).collect();
    texts.sort();
    assert_eq!(texts, vec!["one", "two"]);
    assert_eq!(bob.service.sync().unread_count("dm-1").await, 0);
}

#[tokio::test]
async fn test_tampered_message_is_rejected_and_reported() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let mut bob = TestUser::start(&server, "bob").await;

    alice
        .service
        .pipeline()
        .send(&Conversation::direct("dm-1", "bob"), "genuine", SendOptions::default())
        .await
        .unwrap();
    bob.service.sync().open_conversation("dm-1").await.unwrap();

    let events = server.drain_events("bob");
    let genuine = new_message_events(&events).remove(0);
    let SyncEvent::NewMessage { message } = &genuine else {
        unreachable!()
    };
    let mut forged = message.clone();
    forged.reply_to = Some("forged".to_string());

    bob.service.sync().handle(events[0].clone()).await.unwrap();
    let err = bob
        .service
        .sync()
        .handle(SyncEvent::NewMessage { message: forged })
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        AppError::Message(MessageError::TamperedOrUnverifiable(_))
    ));
    assert!(bob.service.sync().messages("dm-1").await.is_empty());
    assert!(matches!(
        bob.drain_notifications().as_slice(),
        [Notification::SecurityEvent { .. }]
    ));

    // The forgery does not suppress the real message
    bob.service.sync().handle(genuine).await.unwrap();
    let messages = bob.service.sync().messages("dm-1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text(), Some("genuine"));
    assert_eq!(messages[0].reply_to, None);
}

#[tokio::test]
async fn test_message_for_previous_device_is_undecryptable() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let bob = TestUser::start(&server, "bob").await;

    alice
        .service
        .pipeline()
        .send(&Conversation::direct("dm-1", "bob"), "before reinstall", SendOptions::default())
        .await
        .unwrap();
    let events = server.drain_events("bob");
    drop(bob);

    // Bob reinstalls: fresh database, fresh identity
    let bob = TestUser::start(&server, "bob").await;
    bob.service.sync().open_conversation("dm-1").await.unwrap();
    for event in new_message_events(&events) {
        bob.service.sync().handle(event).await.unwrap();
    }

    let messages = bob.service.sync().messages("dm-1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].content, MessageContent::Undecryptable);
    assert_eq!(messages[0].sender_id, "alice");
}

#[tokio::test]
async fn test_offline_sends_queue_and_retry_in_order() {
    let server = InMemoryServer::new();
    let (alice, bob, _) = connected_pair(&server).await;
    let to_bob = Conversation::direct("dm-1", "bob");

    server.set_sends_offline(true);
    let first = alice.service.pipeline().send(&to_bob, "one", SendOptions::default()).await.unwrap();
    let second = alice.service.pipeline().send(&to_bob, "two", SendOptions::default()).await.unwrap();
    assert!(matches!(first, SendOutcome::Queued { .. }));
    assert!(matches!(second, SendOutcome::Queued { .. }));
    assert_eq!(alice.service.pipeline().outbox_len("dm-1").await, 2);

    // Ratchet steps were taken once, at send time
    let stats = alice.service.session_stats("dm-1", "bob").await.unwrap().unwrap();
    assert_eq!(stats.messages_sent, 3);
    assert!(server.drain_events("bob").is_empty());

    server.set_sends_offline(false);
    assert_eq!(alice.service.pipeline().retry_outbox("dm-1").await, 0);

    let stats = alice.service.session_stats("dm-1", "bob").await.unwrap().unwrap();
    assert_eq!(stats.messages_sent, 3);

    let events = server.drain_events("bob");
    let delivered: Vec<String> = events
        .iter()
        .filter_map(|e| match e {
            SyncEvent::NewMessage { message } => Some(message.message_id.clone()),
            _ => None,
        })
        .collect();
    assert_eq!(delivered, vec![first.message_id(), second.message_id()]);

    for event in events {
        bob.service.sync().handle(event).await.unwrap();
    }
    let texts: Vec<String> = bob
        .service
        .sync()
        .messages("dm-1")
        .await
        .iter()
        .filter_map(|m| m.text().map(str::to_string))
        .collect();
    assert_eq!(texts.len(), 3);
    assert!(texts.contains(&"one".to_string()));
    assert!(texts.contains(&"two".to_string()));
}

#[tokio::test]
async fn test_edit_react_delete() {
    let server = InMemoryServer::new();
    let (alice, bob, message_id) = connected_pair(&server).await;
    let to_bob = Conversation::direct("dm-1", "bob");

    alice
        .service
        .pipeline()
        .edit(&to_bob, &message_id, "hi, edited")
        .await
        .unwrap();
    alice
        .service
        .pipeline()
        .react("dm-1", &message_id, "👍")
        .await
        .unwrap();
    for result in bob.deliver(&server).await {
        result.unwrap();
    }

    let messages = bob.service.sync().messages("dm-1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text(), Some("hi, edited"));
    assert!(messages[0].edited);
    assert!(messages[0].reactions["👍"].contains("alice"));

    alice.service.pipeline().unreact("dm-1", &message_id, "👍").await.unwrap();
    bob.deliver(&server).await;
    assert!(bob.service.sync().messages("dm-1").await[0].reactions.is_empty());

    alice.service.pipeline().delete_message("dm-1", &message_id).await.unwrap();
    bob.deliver(&server).await;
    assert!(bob.service.sync().messages("dm-1").await.is_empty());
}

#[tokio::test]
async fn test_stale_edit_does_not_override() {
    let server = InMemoryServer::new();
    let (alice, bob, message_id) = connected_pair(&server).await;
    let to_bob = Conversation::direct("dm-1", "bob");

    alice.service.pipeline().edit(&to_bob, &message_id, "v1").await.unwrap();
    alice.service.pipeline().edit(&to_bob, &message_id, "v2").await.unwrap();

    let mut events = server.drain_events("bob");
    events.reverse();
    for event in events {
        bob.service.sync().handle(event).await.unwrap();
    }

    assert_eq!(bob.service.sync().messages("dm-1").await[0].text(), Some("v2"));
}

#[tokio::test]
async fn test_expired_messages_are_hidden() {
    let server = InMemoryServer::new();
    let (alice, bob, _) = connected_pair(&server).await;

    alice
        .service
        .pipeline()
        .send(
            &Conversation::direct("dm-1", "bob"),
            "self-destruct",
            SendOptions {
                reply_to: None,
                expires_in: Some(chrono::Duration::milliseconds(200)),
            },
        )
        .await
        .unwrap();
    bob.deliver(&server).await;
    assert_eq!(bob.service.sync().messages("dm-1").await.len(), 2);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let messages = bob.service.sync().messages("dm-1").await;
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].text(), Some("hi"));
}

#[tokio::test]
async fn test_typing_indicator_ignores_self() {
    let server = InMemoryServer::new();
    let bob = TestUser::start(&server, "bob").await;

    for user_id in ["alice", "bob"] {
        bob.service
            .sync()
            .handle(SyncEvent::Typing {
                conversation_id: "dm-1".to_string(),
                user_id: user_id.to_string(),
            })
            .await
            .unwrap();
    }

    assert_eq!(bob.service.sync().typing_users("dm-1"), vec!["alice"]);
    assert!(bob.service.sync().typing_users("dm-2").is_empty());
}

#[tokio::test]
async fn test_conversation_deleted_removes_sessions() {
    let server = InMemoryServer::new();
    let (_alice, bob, _) = connected_pair(&server).await;
    bob.service.flush().await;
    assert!(server.session_blob("bob", "dm-1", "alice").is_some());

    bob.service
        .sync()
        .handle(SyncEvent::ConversationDeleted {
            conversation_id: "dm-1".to_string(),
        })
        .await
        .unwrap();
    assert_eq!(bob.service.flush().await, 0);

    assert!(server.session_blob("bob", "dm-1", "alice").is_none());
    assert!(bob.service.session_stats("dm-1", "alice").await.unwrap().is_none());
    assert!(bob.service.sync().messages("dm-1").await.is_empty());
}

#[tokio::test]
async fn test_feed_frames_parse_and_skip_garbage() {
    let server = InMemoryServer::new();
    let bob = TestUser::start(&server, "bob").await;

    bob.service.sync().handle_frame("not json").await.unwrap();
    bob.service
        .sync()
        .handle_frame(r#"{"type":"typing","conversationId":"dm-1","userId":"alice"}"#)
        .await
        .unwrap();

    assert_eq!(bob.service.sync().typing_users("dm-1"), vec!["alice"]);
}

#[tokio::test]
async fn test_forged_copy_does_not_hide_message_in_closed_conversation() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let mut bob = TestUser::start(&server, "bob").await;

    alice
        .service
        .pipeline()
        .send(&Conversation::direct("dm-1", "bob"), "genuine", SendOptions::default())
        .await
        .unwrap();

    let events = server.drain_events("bob");
    let genuine = new_message_events(&events).remove(0);
    let SyncEvent::NewMessage { message } = &genuine else {
        unreachable!()
    };
    let mut forged = message.clone();
    forged.reply_to = Some("forged".to_string());

    // Both copies arrive before Bob opens the conversation, the forgery first
    bob.service.sync().handle(events[0].clone()).await.unwrap();
    bob.service
        .sync()
        .handle(SyncEvent::NewMessage { message: forged })
        .await
        .unwrap();
    bob.service.sync().handle(genuine.clone()).await.unwrap();
    assert_eq!(bob.service.sync().unread_count("dm-1").await, 1);

    let opened = bob.service.sync().open_conversation("dm-1").await.unwrap();
    assert_eq!(opened.len(), 1);
    assert_eq!(opened[0].text(), Some("genuine"));
    assert_eq!(opened[0].reply_to, None);

    let notifications = bob.drain_notifications();
    assert_eq!(notifications.len(), 2);
    assert!(matches!(notifications[0], Notification::NewMessage { .. }));
    assert!(matches!(notifications[1], Notification::SecurityEvent { .. }));

    // Now applied, later copies are duplicates
    bob.service.sync().handle(genuine).await.unwrap();
    assert_eq!(bob.service.sync().messages("dm-1").await.len(), 1);
}

#[tokio::test]
async fn test_closed_conversation_queue_is_bounded() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;

    let mut config = test_config();
    config.dedup.closed_queue_capacity = 2;
    let bob = TestUser::start_configured(
        &server,
        "bob",
        db::connect_in_memory().await.unwrap(),
        rand::random::<[u8; 32]>(),
        config,
    )
    .await;

    let to_bob = Conversation::direct("dm-1", "bob");
    for text in ["one", "two", "three"] {
        alice.service.pipeline().send(&to_bob, text, SendOptions::default()).await.unwrap();
    }
    for result in bob.deliver(&server).await {
        result.unwrap();
    }
    assert_eq!(bob.service.sync().unread_count("dm-1").await, 3);

    // The oldest queued message was dropped
    let opened = bob.service.sync().open_conversation("dm-1").await.unwrap();
    let mut texts: Vec<&str> = opened.iter().filter_map(|m| m.text()).collect();
    texts.sort();
    assert_eq!(texts, vec!["three", "two"]);
}

#[tokio::test]
async fn test_concurrent_sends_on_one_conversation() {
    let server = InMemoryServer::new();
    let (alice, bob, _) = connected_pair(&server).await;
    let to_bob = Conversation::direct("dm-1", "bob");

    let pipeline = alice.service.pipeline();
    let (first, second) = tokio::join!(
        pipeline.send(&to_bob, "left", SendOptions::default()),
        pipeline.send(&to_bob, "right", SendOptions::default())
    );
    assert!(matches!(first.unwrap(), SendOutcome::Sent { .. }));
    assert!(matches!(second.unwrap(), SendOutcome::Sent { .. }));

    // Each send took its own ratchet step
    let stats = alice.service.session_stats("dm-1", "bob").await.unwrap().unwrap();
    assert_eq!(stats.messages_sent, 3);

    for result in bob.deliver(&server).await {
        result.unwrap();
    }
    let mut texts: Vec<String> = bob
        .service
        .sync()
        .messages("dm-1")
        .await
        .iter()
        .filter_map(|m| m.text().map(str::to_string))
        .collect();
    texts.sort();
    assert_eq!(texts, vec!["hi", "left", "right"]);
    let received = bob.service.session_stats("dm-1", "alice").await.unwrap().unwrap();
    assert_eq!(received.messages_received, 3);
}
