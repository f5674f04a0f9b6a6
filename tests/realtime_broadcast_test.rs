//! Realtime fan-out: room commands, typing relay, committed-change broadcast
//! and presence, driven through channel-backed connections
//!
//! Run: cargo test --test realtime_broadcast_test

mod common;

use clinic_messaging_service::models::{ConversationOptions, MetadataUpdate, SendMessageOptions};
use clinic_messaging_service::websocket::{conversation_room, user_room};
use common::{app_state, TestClient};
use serde_json::json;
use std::time::Duration;
use uuid::Uuid;

fn join(conversation_id: Uuid) -> String {
    json!({"type": "join-conversation", "conversationId": conversation_id}).to_string()
}

fn typing(kind: &str, conversation_id: Uuid) -> String {
    json!({"type": kind, "conversationId": conversation_id}).to_string()
}

#[tokio::test]
async fn test_join_acknowledges_and_leaves_previous_room() {
    let (state, repo, _rx) = app_state();
    let users = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    repo.register_users(&users).await;
    let (therapist, a, b) = (users[0], users[1], users[2]);
    let with_a = state
        .service
        .create_individual_conversation(a, therapist, ConversationOptions::default())
        .await
        .unwrap();
    let with_b = state
        .service
        .create_individual_conversation(b, therapist, ConversationOptions::default())
        .await
        .unwrap();

    let mut client = TestClient::connect(&state, therapist).await;
    client.send(&state, &join(with_a.id)).await;
    let joined = client.take("conversation:joined");
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0]["data"]["conversationId"], with_a.id.to_string());

    client.send(&state, &join(with_b.id)).await;
    let mut rooms = state.registry.rooms_of(client.connection_id).await;
    rooms.sort();
    let mut expected = vec![conversation_room(with_b.id), user_room(therapist)];
    expected.sort();
    assert_eq!(rooms, expected);
    assert_eq!(state.registry.room_size(&conversation_room(with_a.id)).await, 0);
}

#[tokio::test]
async fn test_join_refused_without_access() {
    let (state, repo, _rx) = app_state();
    let users = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    repo.register_users(&users).await;
    let conversation = state
        .service
        .create_individual_conversation(users[0], users[1], ConversationOptions::default())
        .await
        .unwrap();

    let mut outsider = TestClient::connect(&state, users[2]).await;
    outsider.frames();
    outsider.send(&state, &join(conversation.id)).await;

    let frames = outsider.frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["event"], "error");
    assert_eq!(
        state.registry.room_size(&conversation_room(conversation.id)).await,
        0
    );
}

#[tokio::test]
async fn test_leave_conversation_acknowledges() {
    let (state, repo, _rx) = app_state();
    let users = [Uuid::new_v4(), Uuid::new_v4()];
    repo.register_users(&users).await;
    let conversation = state
        .service
        .create_individual_conversation(users[0], users[1], ConversationOptions::default())
        .await
        .unwrap();

    let mut client = TestClient::connect(&state, users[0]).await;
    client.send(&state, &join(conversation.id)).await;
    client
        .send(&state, &typing("leave-conversation", conversation.id))
        .await;

    assert_eq!(client.take("conversation:left").len(), 1);
    assert_eq!(
        state.registry.room_size(&conversation_room(conversation.id)).await,
        0
    );
}

#[tokio::test]
async fn test_typing_reaches_others_but_not_sender() {
    let (state, repo, _rx) = app_state();
    let users = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    repo.register_users(&users).await;
    let group = state
        .service
        .create_group_conversation("Care Team", &users[1..], users[0], ConversationOptions::default())
        .await
        .unwrap();

    let mut clients = Vec::new();
    for user in users {
        let client = TestClient::connect(&state, user).await;
        client.send(&state, &join(group.id)).await;
        clients.push(client);
    }
    for client in clients.iter_mut() {
        client.frames();
    }

    clients[0]
        .send(&state, &typing("typing-start", group.id))
        .await;

    assert!(clients[0].frames().is_empty());
    for client in clients.iter_mut().skip(1) {
        let frames = client.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["event"], "typing:start");
        assert_eq!(frames[0]["data"]["userId"], users[0].to_string());
    }

    clients[1]
        .send(&state, &typing("typing-stop", group.id))
        .await;
    assert_eq!(clients[0].take("typing:stop").len(), 1);
    assert!(clients[1].frames().is_empty());
}

#[tokio::test]
async fn test_malformed_frame_gets_error_event() {
    let (state, _repo, _rx) = app_state();
    let mut client = TestClient::connect(&state, Uuid::new_v4()).await;
    client.frames();

    client.send(&state, "{not json").await;
    client
        .send(&state, &json!({"type": "shout", "conversationId": Uuid::new_v4()}).to_string())
        .await;

    let frames = client.frames();
    assert_eq!(frames.len(), 2);
    assert!(frames.iter().all(|f| f["event"] == "error"));
}

#[tokio::test]
async fn test_sent_message_reaches_room_members() {
    let (state, repo, mut rx) = app_state();
    let users = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    repo.register_users(&users).await;
    let (client_user, therapist, bystander) = (users[0], users[1], users[2]);
    let conversation = state
        .service
        .create_individual_conversation(client_user, therapist, ConversationOptions::default())
        .await
        .unwrap();

    let mut sender = TestClient::connect(&state, client_user).await;
    let mut receiver = TestClient::connect(&state, therapist).await;
    let mut other = TestClient::connect(&state, bystander).await;
    sender.send(&state, &join(conversation.id)).await;
    receiver.send(&state, &join(conversation.id)).await;
    sender.frames();
    receiver.frames();
    other.frames();

    let message = state
        .service
        .send_message(conversation.id, client_user, "hello", SendMessageOptions::default())
        .await
        .unwrap();
    let event = rx.recv().await.unwrap();
    let delivered = state.dispatcher.relay(event).await;

    // The sender is in the room too and gets its own message
    assert_eq!(delivered, 2);
    for client in [&mut sender, &mut receiver] {
        let frames = client.take("message:new");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0]["data"]["message"]["id"], message.id.to_string());
        assert_eq!(frames[0]["data"]["message"]["content"], "hello");
    }
    assert!(other.frames().is_empty());
}

#[tokio::test]
async fn test_spawned_relay_delivers_metadata_update() {
    let (state, repo, rx) = app_state();
    let users = [Uuid::new_v4(), Uuid::new_v4()];
    repo.register_users(&users).await;
    let group = state
        .service
        .create_group_conversation("Care Team", &[users[1]], users[0], ConversationOptions::default())
        .await
        .unwrap();
    let relay = state.dispatcher.clone().spawn_relay(rx);

    let mut member = TestClient::connect(&state, users[1]).await;
    member.send(&state, &join(group.id)).await;
    member.frames();

    state
        .service
        .update_conversation_metadata(
            group.id,
            users[0],
            MetadataUpdate {
                title: Some("Intake Team".into()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let frame = tokio::time::timeout(Duration::from_secs(1), member.rx.recv())
        .await
        .unwrap()
        .unwrap();
    let frame: serde_json::Value = serde_json::from_str(&frame).unwrap();
    assert_eq!(frame["event"], "conversation:updated");
    assert_eq!(frame["data"]["conversation"]["title"], "Intake Team");
    assert_eq!(frame["data"]["changedFields"], json!(["title"]));

    relay.abort();
}

#[tokio::test]
async fn test_removed_participant_still_in_room_receives_broadcasts() {
    let (state, repo, mut rx) = app_state();
    let users = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    repo.register_users(&users).await;
    let (admin, kept, removed) = (users[0], users[1], users[2]);
    let group = state
        .service
        .create_group_conversation("Care Team", &[kept, removed], admin, ConversationOptions::default())
        .await
        .unwrap();

    let mut removed_client = TestClient::connect(&state, removed).await;
    removed_client.send(&state, &join(group.id)).await;

    state
        .service
        .replace_group_participants(group.id, admin, &[kept])
        .await
        .unwrap();
    state.dispatcher.relay(rx.recv().await.unwrap()).await;
    let changed = removed_client.take("participant:changed");
    assert_eq!(changed.len(), 1);
    assert_eq!(changed[0]["data"]["participants"].as_array().unwrap().len(), 2);

    // Delivery is gated by room membership, not by current participation
    state
        .service
        .send_message(group.id, admin, "after removal", SendMessageOptions::default())
        .await
        .unwrap();
    state.dispatcher.relay(rx.recv().await.unwrap()).await;
    assert_eq!(removed_client.take("message:new").len(), 1);

    // A fresh join is refused now that access is gone
    state
        .dispatcher
        .registry()
        .leave_room(removed_client.connection_id, &conversation_room(group.id))
        .await;
    removed_client.send(&state, &join(group.id)).await;
    assert_eq!(removed_client.take("error").len(), 1);
}

#[tokio::test]
async fn test_presence_announcements() {
    let (state, _repo, _rx) = app_state();
    let watcher_id = Uuid::new_v4();
    let user = Uuid::new_v4();
    let mut watcher = TestClient::connect(&state, watcher_id).await;
    watcher.frames();

    let client = TestClient::connect(&state, user).await;
    let online = watcher.take("user:online");
    assert_eq!(online.len(), 1);
    assert_eq!(online[0]["data"]["userId"], user.to_string());
    assert!(state.presence.is_online(user).await);
    assert_eq!(
        state.presence.online_among(&[user, Uuid::new_v4()]).await,
        vec![user]
    );

    assert!(state.registry.disconnect(client.connection_id).await);
    let offline = watcher.take("user:offline");
    assert_eq!(offline.len(), 1);
    assert_eq!(offline[0]["data"]["userId"], user.to_string());
    assert!(!state.presence.is_online(user).await);
}

#[tokio::test]
async fn test_stale_disconnect_after_reconnect_keeps_user_online() {
    let (state, _repo, _rx) = app_state();
    let mut watcher = TestClient::connect(&state, Uuid::new_v4()).await;
    let user = Uuid::new_v4();

    let first = TestClient::connect(&state, user).await;
    let second = TestClient::connect(&state, user).await;
    watcher.frames();

    assert!(!state.registry.disconnect(first.connection_id).await);
    assert!(watcher.take("user:offline").is_empty());
    assert!(state.presence.is_online(user).await);
    assert_eq!(
        state.registry.lookup_connection(user).await,
        Some(second.connection_id)
    );
    assert!(state.registry.rooms_of(first.connection_id).await.is_empty());

    assert!(state.registry.disconnect(second.connection_id).await);
    assert_eq!(watcher.take("user:offline").len(), 1);
}
