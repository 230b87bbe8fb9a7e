// Tests for the conversation list and unread accounting

use bazaar_sync::{
    Backend, ConversationId, ItemId, MemoryBackend, MemoryClient, MessageKind, NewMessage,
    Operation, PeerDisplay, SidebarAggregator, SyncConfig, UserId,
};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn test_load_orders_by_recent_activity() {
    let server = MemoryBackend::new(SyncConfig::default());
    server.register_profile(&seller(), "Seller Kim", None);
    let bike = server.open_conversation(&ItemId::from("bike"), &buyer(), &seller());
    let lamp = server.open_conversation(&ItemId::from("lamp"), &buyer(), &neighbour());
    send(&client(&server, seller()), &bike.id, &seller(), "still available").await;

    let sidebar = SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());
    assert_eq!(sidebar.load().await.expect("Failed to load sidebar"), 2);

    let entries = sidebar.entries();
    assert_eq!(entries[0].conversation_id, bike.id);
    assert_eq!(entries[0].unread_count, 1);
    assert_eq!(
        entries[0].peer,
        PeerDisplay::Resolved {
            name: Some("Seller Kim".to_string()),
            avatar_url: None,
        }
    );
    assert_eq!(
        entries[0].last_message.as_ref().and_then(|p| p.body.as_deref()),
        Some("still available")
    );
    assert_eq!(entries[1].conversation_id, lamp.id);
    assert_eq!(entries[1].unread_count, 0);
    assert!(entries[1].last_message.is_none());
}

#[tokio::test]
async fn test_load_page_appends_without_duplicates() {
    let server = MemoryBackend::new(SyncConfig::default());
    for n in 0..5 {
        server.open_conversation(&ItemId::new(format!("item-{}", n)), &buyer(), &seller());
    }
    let sidebar = SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());

    assert_eq!(sidebar.load_page(3, 0).await.unwrap(), 3);
    assert_eq!(sidebar.load_page(3, 3).await.unwrap(), 2);
    assert_eq!(sidebar.entries().len(), 5);

    // Overlapping page adds nothing new
    sidebar.load_page(3, 2).await.unwrap();
    assert_eq!(sidebar.entries().len(), 5);
}

#[tokio::test]
async fn test_peer_message_bumps_unread_and_moves_row() {
    let server = MemoryBackend::new(SyncConfig::default());
    let bike = server.open_conversation(&ItemId::from("bike"), &buyer(), &seller());
    let lamp = server.open_conversation(&ItemId::from("lamp"), &buyer(), &neighbour());
    let mut sidebar =
        SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());
    sidebar.load().await.unwrap();
    assert_eq!(sidebar.entries()[0].conversation_id, lamp.id);

    sidebar.subscribe().unwrap();
    wait_for_subscribers(&server, 1).await;

    send(&client(&server, seller()), &bike.id, &seller(), "price drop").await;
    assert!(eventually(|| sidebar.get(&bike.id).is_some_and(|e| e.unread_count == 1)).await);
    assert_eq!(sidebar.entries()[0].conversation_id, bike.id);

    sidebar.mark_read(&bike.id).await.expect("Failed to mark read");
    assert_eq!(sidebar.get(&bike.id).unwrap().unread_count, 0);
    assert_eq!(sidebar.entries()[0].conversation_id, bike.id);
}

#[tokio::test]
async fn test_own_message_does_not_count_as_unread() {
    let server = MemoryBackend::new(SyncConfig::default());
    let bike = server.open_conversation(&ItemId::from("bike"), &buyer(), &seller());
    let mut sidebar =
        SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());
    sidebar.load().await.unwrap();
    sidebar.subscribe().unwrap();
    wait_for_subscribers(&server, 1).await;

    send(&client(&server, buyer()), &bike.id, &buyer(), "is it available?").await;
    assert!(eventually(|| sidebar.get(&bike.id).is_some_and(|e| e.last_message.is_some())).await);
    assert_eq!(sidebar.get(&bike.id).unwrap().unread_count, 0);
}

#[tokio::test]
async fn test_open_conversation_does_not_count_as_unread() {
    let server = MemoryBackend::new(SyncConfig::default());
    let bike = server.open_conversation(&ItemId::from("bike"), &buyer(), &seller());
    let mut sidebar =
        SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());
    sidebar.load().await.unwrap();
    sidebar.set_open_conversation(Some(bike.id.clone()));
    sidebar.subscribe().unwrap();
    wait_for_subscribers(&server, 1).await;

    send(&client(&server, seller()), &bike.id, &seller(), "hello").await;
    assert!(eventually(|| sidebar.get(&bike.id).is_some_and(|e| e.last_message.is_some())).await);
    assert_eq!(sidebar.get(&bike.id).unwrap().unread_count, 0);

    // Closing it makes the next peer message count again
    sidebar.set_open_conversation(None);
    send(&client(&server, seller()), &bike.id, &seller(), "still there?").await;
    assert!(eventually(|| sidebar.get(&bike.id).is_some_and(|e| e.unread_count == 1)).await);
}

#[tokio::test]
async fn test_redelivered_message_counts_once() {
    let server = MemoryBackend::new(SyncConfig::default());
    let bike = server.open_conversation(&ItemId::from("bike"), &buyer(), &seller());
    let mut sidebar =
        SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());
    sidebar.load().await.unwrap();
    sidebar.subscribe().unwrap();
    wait_for_subscribers(&server, 1).await;

    let message = send(&client(&server, seller()), &bike.id, &seller(), "hello").await;
    assert!(eventually(|| sidebar.get(&bike.id).is_some_and(|e| e.unread_count == 1)).await);

    let durable = message.id.confirmed().cloned().unwrap();
    assert!(server.redeliver_message(&durable));
    settle().await;
    assert_eq!(sidebar.get(&bike.id).unwrap().unread_count, 1);
}

#[tokio::test]
async fn test_redelivered_older_message_is_not_counted_again() {
    let server = MemoryBackend::new(SyncConfig::default());
    let bike = server.open_conversation(&ItemId::from("bike"), &buyer(), &seller());
    let mut sidebar =
        SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());
    sidebar.load().await.unwrap();
    sidebar.subscribe().unwrap();
    wait_for_subscribers(&server, 1).await;

    let seller_client = client(&server, seller());
    let first = send(&seller_client, &bike.id, &seller(), "one").await;
    send(&seller_client, &bike.id, &seller(), "two").await;
    assert!(eventually(|| sidebar.get(&bike.id).is_some_and(|e| e.unread_count == 2)).await);

    assert!(server.redeliver_message(first.id.confirmed().unwrap()));
    settle().await;

    let entry = sidebar.get(&bike.id).unwrap();
    assert_eq!(entry.unread_count, 2);
    assert_eq!(
        entry.last_message.as_ref().and_then(|p| p.body.as_deref()),
        Some("two")
    );
}

#[tokio::test]
async fn test_new_conversation_placeholder_is_resolved() {
    let server = MemoryBackend::new(SyncConfig::default());
    server.register_profile(&neighbour(), "Neighbour Lee", Some("https://img/lee.png"));
    let mut sidebar =
        SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());
    sidebar.load().await.unwrap();
    sidebar.subscribe().unwrap();
    wait_for_subscribers(&server, 1).await;

    let lamp = server.open_conversation(&ItemId::from("lamp"), &neighbour(), &buyer());
    assert!(eventually(|| sidebar.get(&lamp.id).is_some_and(|e| e.peer.is_resolved())).await);

    let entry = sidebar.get(&lamp.id).unwrap();
    assert_eq!(entry.peer_id, neighbour());
    assert_eq!(
        entry.peer,
        PeerDisplay::Resolved {
            name: Some("Neighbour Lee".to_string()),
            avatar_url: Some("https://img/lee.png".to_string()),
        }
    );
    assert_eq!(sidebar.entries()[0].conversation_id, lamp.id);
}

#[tokio::test]
async fn test_failed_resolution_leaves_placeholder() {
    let server = MemoryBackend::new(SyncConfig::default());
    let mut sidebar =
        SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());
    sidebar.load().await.unwrap();
    sidebar.subscribe().unwrap();
    wait_for_subscribers(&server, 1).await;
    server.fail_next(Operation::GetSummary);

    let lamp = server.open_conversation(&ItemId::from("lamp"), &neighbour(), &buyer());
    assert!(eventually(|| sidebar.get(&lamp.id).is_some()).await);
    settle().await;
    assert_eq!(sidebar.get(&lamp.id).unwrap().peer, PeerDisplay::Unresolved);

    assert_eq!(sidebar.resolve_unresolved().await, 1);
    assert!(sidebar.get(&lamp.id).unwrap().peer.is_resolved());
    assert_eq!(sidebar.resolve_unresolved().await, 0);
}

#[tokio::test]
async fn test_foreign_conversation_is_ignored() {
    let server = MemoryBackend::new(SyncConfig::default());
    let mut sidebar =
        SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());
    sidebar.load().await.unwrap();
    sidebar.subscribe().unwrap();
    wait_for_subscribers(&server, 1).await;

    let other = server.open_conversation(&ItemId::from("lamp"), &neighbour(), &seller());
    send(&client(&server, seller()), &other.id, &seller(), "not for buyer").await;
    settle().await;

    assert!(sidebar.entries().is_empty());
}

#[tokio::test]
async fn test_unsubscribed_sidebar_stops_updating() {
    let server = MemoryBackend::new(SyncConfig::default());
    let bike = server.open_conversation(&ItemId::from("bike"), &buyer(), &seller());
    let mut sidebar =
        SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());
    sidebar.load().await.unwrap();
    sidebar.subscribe().unwrap();
    wait_for_subscribers(&server, 1).await;

    sidebar.unsubscribe();
    sidebar.unsubscribe();
    assert!(!sidebar.is_subscribed());

    send(&client(&server, seller()), &bike.id, &seller(), "hello?").await;
    settle().await;
    assert_eq!(sidebar.get(&bike.id).unwrap().unread_count, 0);
    assert!(sidebar.get(&bike.id).unwrap().last_message.is_none());
}

#[tokio::test]
async fn test_mark_read_failure_keeps_unread() {
    let server = MemoryBackend::new(SyncConfig::default());
    let bike = server.open_conversation(&ItemId::from("bike"), &buyer(), &seller());
    send(&client(&server, seller()), &bike.id, &seller(), "hello").await;
    let sidebar = SidebarAggregator::new(Arc::new(client(&server, buyer())), SyncConfig::default());
    sidebar.load().await.unwrap();

    server.fail_next(Operation::MarkRead);
    assert!(sidebar.mark_read(&bike.id).await.is_err());
    assert_eq!(sidebar.get(&bike.id).unwrap().unread_count, 1);

    sidebar.mark_read(&bike.id).await.unwrap();
    assert_eq!(sidebar.get(&bike.id).unwrap().unread_count, 0);

    // The backend agrees on reload
    sidebar.load().await.unwrap();
    assert_eq!(sidebar.get(&bike.id).unwrap().unread_count, 0);
}

fn buyer() -> UserId {
    UserId::from("buyer")
}

fn seller() -> UserId {
    UserId::from("seller")
}

fn neighbour() -> UserId {
    UserId::from("neighbour")
}

fn client(server: &MemoryBackend, user: UserId) -> MemoryClient {
    server.client(Some(user))
}

async fn send(
    client: &MemoryClient,
    conversation: &ConversationId,
    sender: &UserId,
    body: &str,
) -> bazaar_sync::Message {
    client
        .create_message(NewMessage {
            conversation_id: conversation.clone(),
            sender_id: sender.clone(),
            kind: MessageKind::Text,
            body: Some(body.to_string()),
            offer_id: None,
        })
        .await
        .expect("Failed to create message")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

async fn wait_for_subscribers(server: &MemoryBackend, count: usize) {
    assert!(
        eventually(|| server.subscriber_count() >= count).await,
        "subscribers never reached {}",
        count
    );
}
