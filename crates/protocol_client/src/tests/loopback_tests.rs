use super::*;

async fn connect(network: &LoopbackNetwork, address: &str) -> Arc<dyn ProtocolClient> {
    let signer = Arc::new(LoopbackSigner::new(Identifier::ethereum(address)));
    network
        .factory()
        .create(signer, ClientOptions::default())
        .await
        .expect("create client")
}

#[tokio::test]
async fn offline_network_rejects_client_creation() {
    let network = LoopbackNetwork::new();
    network.set_offline(true).await;
    let signer = Arc::new(LoopbackSigner::new(Identifier::ethereum("0xa11ce")));
    let err = network
        .factory()
        .create(signer, ClientOptions::default())
        .await
        .err()
        .expect("offline");
    assert!(matches!(err, ProtocolError::Unreachable(_)));
}

#[tokio::test]
async fn rejecting_signer_fails_creation() {
    let network = LoopbackNetwork::new();
    let signer = Arc::new(LoopbackSigner::rejecting(Identifier::ethereum("0xa11ce")));
    let err = network
        .factory()
        .create(signer, ClientOptions::default())
        .await
        .err()
        .expect("rejected");
    assert!(matches!(err, ProtocolError::SignerRejected(_)));
}

#[tokio::test]
async fn recipient_sees_group_only_after_sync() {
    let network = LoopbackNetwork::new();
    let alice = connect(&network, "0xa11ce").await;
    let bob = connect(&network, "0xb0b").await;

    let group = alice
        .new_group(
            &[bob.inbox_id()],
            &CreateGroupOptions {
                name: Some("ops".to_string()),
                ..CreateGroupOptions::default()
            },
        )
        .await
        .expect("group");

    let options = ListConversationsOptions::default();
    assert_eq!(alice.list_conversations(&options).await.expect("list").len(), 1);
    assert!(bob.list_conversations(&options).await.expect("list").is_empty());

    bob.sync_conversations().await.expect("sync");
    let listed = bob.list_conversations(&options).await.expect("list");
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, group.id);
    assert_eq!(listed[0].consent_state, ConsentState::Unknown);
}

#[tokio::test]
async fn dm_is_reused_and_peer_is_relative_to_viewer() {
    let network = LoopbackNetwork::new();
    let alice = connect(&network, "0xa11ce").await;
    let bob = connect(&network, "0xb0b").await;

    let first = alice.new_dm(&bob.inbox_id()).await.expect("dm");
    let second = bob
        .new_dm_with_identifier(&Identifier::ethereum("0xA11CE"))
        .await
        .expect("dm back");
    assert_eq!(first.id, second.id);
    assert_eq!(first.peer_inbox_id, Some(bob.inbox_id()));
    assert_eq!(second.peer_inbox_id, Some(alice.inbox_id()));

    let err = alice.new_dm(&alice.inbox_id()).await.expect_err("self dm");
    assert!(matches!(err, ProtocolError::InvalidIdentifier(_)));
}

#[tokio::test]
async fn unknown_identifier_is_rejected() {
    let network = LoopbackNetwork::new();
    let alice = connect(&network, "0xa11ce").await;
    let err = alice
        .new_group_with_identifiers(
            &[Identifier::ethereum("0xdead")],
            &CreateGroupOptions::default(),
        )
        .await
        .expect_err("unknown");
    assert!(matches!(err, ProtocolError::InvalidIdentifier(_)));
}

#[tokio::test]
async fn message_history_requires_conversation_sync() {
    let network = LoopbackNetwork::new();
    let alice = connect(&network, "0xa11ce").await;
    let bob = connect(&network, "0xb0b").await;
    let dm = alice.new_dm(&bob.inbox_id()).await.expect("dm");

    network
        .publish_text(&dm.id, &alice.inbox_id(), "first")
        .await
        .expect("publish");
    network
        .publish_text(&dm.id, &alice.inbox_id(), "second")
        .await
        .expect("publish");

    let options = MessageListOptions::default();
    assert!(bob
        .conversation_messages(&dm.id, &options)
        .await
        .expect("messages")
        .is_empty());

    bob.sync_conversation(&dm.id).await.expect("sync");
    let history = bob
        .conversation_messages(&dm.id, &options)
        .await
        .expect("messages");
    let texts: Vec<String> = history.iter().filter_map(|m| m.text()).collect();
    assert_eq!(texts, vec!["first".to_string(), "second".to_string()]);

    let newest = bob
        .conversation_messages(
            &dm.id,
            &MessageListOptions {
                limit: Some(1),
                direction: SortDirection::Descending,
                ..MessageListOptions::default()
            },
        )
        .await
        .expect("messages");
    assert_eq!(newest[0].text().as_deref(), Some("second"));

    let found = bob
        .get_message_by_id(&history[0].id)
        .await
        .expect("lookup");
    assert_eq!(found.map(|m| m.id), Some(history[0].id.clone()));
}

#[tokio::test]
async fn streams_deliver_and_prune_closed_consumers() {
    let network = LoopbackNetwork::new();
    let alice = connect(&network, "0xa11ce").await;
    let bob = connect(&network, "0xb0b").await;

    let mut conversations = bob.stream_conversations().await.expect("stream");
    let dm = alice.new_dm(&bob.inbox_id()).await.expect("dm");
    let pushed = conversations.next().await.expect("item").expect("ok");
    assert_eq!(pushed.id, dm.id);

    let mut messages = bob.stream_messages(&dm.id).await.expect("stream");
    network
        .publish_text(&dm.id, &alice.inbox_id(), "hi")
        .await
        .expect("publish");
    let message = messages.next().await.expect("item").expect("ok");
    assert_eq!(message.text().as_deref(), Some("hi"));

    assert_eq!(network.live_subscriptions().await, (1, 1));
    drop(messages);
    conversations.close();
    assert_eq!(network.live_subscriptions().await, (0, 0));
}

#[tokio::test]
async fn fail_streams_sends_terminal_error() {
    let network = LoopbackNetwork::new();
    let alice = connect(&network, "0xa11ce").await;
    let mut conversations = alice.stream_conversations().await.expect("stream");

    network
        .fail_streams(ProtocolError::Stream("connection reset".to_string()))
        .await;

    assert!(matches!(
        conversations.next().await,
        Some(Err(ProtocolError::Stream(_)))
    ));
    assert!(conversations.next().await.is_none());
}

#[tokio::test]
async fn closed_client_rejects_operations_and_drops_streams() {
    let network = LoopbackNetwork::new();
    let alice = connect(&network, "0xa11ce").await;
    let _stream = alice.stream_conversations().await.expect("stream");

    alice.close().await;

    assert_eq!(network.live_subscriptions().await, (0, 0));
    let err = alice
        .list_conversations(&ListConversationsOptions::default())
        .await
        .expect_err("closed");
    assert_eq!(err, ProtocolError::Closed);
}

#[tokio::test]
async fn list_options_filter_by_type_and_limit() {
    let network = LoopbackNetwork::new();
    let alice = connect(&network, "0xa11ce").await;
    let bob = connect(&network, "0xb0b").await;
    let carol = connect(&network, "0xca201").await;

    alice.new_dm(&bob.inbox_id()).await.expect("dm");
    alice.new_dm(&carol.inbox_id()).await.expect("dm");
    alice
        .new_group(&[bob.inbox_id(), carol.inbox_id()], &CreateGroupOptions::default())
        .await
        .expect("group");

    let dms = alice
        .list_conversations(&ListConversationsOptions {
            conversation_type: Some(ConversationType::Dm),
            ..ListConversationsOptions::default()
        })
        .await
        .expect("list");
    assert_eq!(dms.len(), 2);

    let limited = alice
        .list_conversations(&ListConversationsOptions {
            limit: Some(1),
            ..ListConversationsOptions::default()
        })
        .await
        .expect("list");
    assert_eq!(limited.len(), 1);
}
