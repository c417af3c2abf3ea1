mod common;

use common::TestUser;
use nochat_session::models::{
    Conversation, EncryptedBody, MessageContent, OutboundMessage, SendOptions, SyncEvent,
};
use nochat_session::testing::InMemoryServer;

fn chain_id(message: &OutboundMessage) -> String {
    match &message.payload.body {
        EncryptedBody::Group { chain_id, .. } => chain_id.clone(),
        EncryptedBody::Pairwise { .. } => panic!("expected a group body"),
    }
}

fn sorted(mut ids: Vec<&str>) -> Vec<&str> {
    ids.sort();
    ids
}

async fn read(user: &TestUser, server: &InMemoryServer, conversation_id: &str) -> Vec<String> {
    user.service.sync().open_conversation(conversation_id).await.unwrap();
    for result in user.deliver(server).await {
        result.unwrap();
    }
    user.service
        .sync()
        .messages(conversation_id)
        .await
        .iter()
        .map(|m| m.text().unwrap_or("<undecryptable>").to_string())
        .collect()
}

#[tokio::test]
async fn test_group_fan_out_and_membership_changes() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let bob = TestUser::start(&server, "bob").await;
    let carol = TestUser::start(&server, "carol").await;

    let group = Conversation::group("g1", vec!["alice".into(), "bob".into(), "carol".into()]);
    alice.service.sync().register_conversation(group.clone()).await;

    let first = alice
        .service
        .pipeline()
        .send(&group, "hello group", SendOptions::default())
        .await
        .unwrap();
    let first = server.stored_message(first.message_id(), 0).unwrap();
    assert_eq!(first.envelope.len(), 3);
    assert_eq!(sorted(first.envelope.recipients()), vec!["alice", "bob", "carol"]);

    assert_eq!(read(&bob, &server, "g1").await, vec!["hello group"]);
    assert_eq!(read(&carol, &server, "g1").await, vec!["hello group"]);

    // Carol leaves before the next message
    alice
        .service
        .sync()
        .handle(SyncEvent::MemberRemoved {
            conversation_id: "g1".into(),
            user_id: "carol".into(),
        })
        .await
        .unwrap();
    let group = alice.service.sync().conversation("g1").await.unwrap();

    let second = alice
        .service
        .pipeline()
        .send(&group, "without carol", SendOptions::default())
        .await
        .unwrap();
    let second = server.stored_message(second.message_id(), 0).unwrap();
    assert_eq!(sorted(second.envelope.recipients()), vec!["alice", "bob"]);
    assert!(second.envelope.for_recipient("carol").is_none());
    // Removal rotates the sender chain
    assert_ne!(chain_id(&first), chain_id(&second));

    assert!(server.drain_events("carol").is_empty());
    assert_eq!(
        read(&bob, &server, "g1").await,
        vec!["hello group", "without carol"]
    );

    // Dave joins afterwards and gets nothing retroactively
    let dave = TestUser::start(&server, "dave").await;
    alice
        .service
        .sync()
        .handle(SyncEvent::MemberAdded {
            conversation_id: "g1".into(),
            user_id: "dave".into(),
        })
        .await
        .unwrap();
    let group = alice.service.sync().conversation("g1").await.unwrap();

    dave.service.sync().open_conversation("g1").await.unwrap();
    dave.service
        .sync()
        .handle(SyncEvent::NewMessage {
            message: second.payload.clone(),
        })
        .await
        .unwrap();
    let early = dave.service.sync().messages("g1").await;
    assert_eq!(early.len(), 1);
    assert_eq!(early[0].content, MessageContent::Undecryptable);

    let third = alice
        .service
        .pipeline()
        .send(&group, "welcome dave", SendOptions::default())
        .await
        .unwrap();
    let third = server.stored_message(third.message_id(), 0).unwrap();
    assert_eq!(third.envelope.len(), 3);
    assert_eq!(chain_id(&second), chain_id(&third));

    let texts = read(&dave, &server, "g1").await;
    assert!(texts.contains(&"welcome dave".to_string()));
    assert!(texts.contains(&"<undecryptable>".to_string()));
}

#[tokio::test]
async fn test_each_member_authors_own_chain() {
    let server = InMemoryServer::new();
    let alice = TestUser::start(&server, "alice").await;
    let bob = TestUser::start(&server, "bob").await;

    let group = Conversation::group("g2", vec!["alice".into(), "bob".into()]);
    alice
        .service
        .pipeline()
        .send(&group, "from alice", SendOptions::default())
        .await
        .unwrap();
    bob.service
        .pipeline()
        .send(&group, "from bob", SendOptions::default())
        .await
        .unwrap();

    let mut bob_view = read(&bob, &server, "g2").await;
    bob_view.sort();
    assert_eq!(bob_view, vec!["from alice"]);
    let alice_view = read(&alice, &server, "g2").await;
    assert_eq!(alice_view, vec!["from bob"]);

    let alice_chain = alice.service.session_stats("g2", "alice").await.unwrap().unwrap();
    let bob_chain = bob.service.session_stats("g2", "bob").await.unwrap().unwrap();
    assert_ne!(alice_chain.session_id, bob_chain.session_id);
    assert_eq!(alice_chain.chain_position, 1);
    assert_eq!(alice_chain.messages_sent, 1);
}
