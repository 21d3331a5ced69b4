use std::sync::Arc;
use std::time::Duration;

use application::{
    BrokerSettings, FanoutEvent, MessageBus, PresenceStore, RedisPresenceStore,
    RedisSequenceAllocator, RedisSubscriptionRegistry, RoomFanoutBroker, SequenceAllocator,
    SubscriptionRegistry,
};
use chrono::Utc;
use config::RedisConfig;
use domain::{
    ChatMessage, MessageId, MessageType, OnlineUser, RoomId, SenderProfile, ServerId, UserId,
};
use infrastructure::RedisMessageBus;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use testcontainers::runners::AsyncRunner;
use testcontainers::ContainerAsync;
use testcontainers_modules::redis::{Redis, REDIS_PORT};
use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

async fn start_redis() -> (ContainerAsync<Redis>, RedisConfig) {
    let node = Redis::default().start().await.expect("start redis");
    let port = node.get_host_port_ipv4(REDIS_PORT).await.expect("port");
    let config = RedisConfig {
        url: format!("redis://127.0.0.1:{port}"),
        ..RedisConfig::default()
    };
    (node, config)
}

async fn manager(config: &RedisConfig) -> ConnectionManager {
    let client = redis::Client::open(config.url.as_str()).expect("client");
    ConnectionManager::new(client).await.expect("connection manager")
}

fn chat_message(room_id: RoomId, sequence_number: i64) -> ChatMessage {
    ChatMessage {
        id: MessageId::from(Uuid::new_v4()),
        room_id,
        sender: SenderProfile {
            id: UserId::from(Uuid::new_v4()),
            nickname: "alice".to_string(),
            profile_image: None,
        },
        message_type: MessageType::Text,
        content: Some("hello over redis".to_string()),
        sequence_number,
        created_at: Utc::now(),
        is_edited: false,
        is_deleted: false,
        edited_at: None,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires local docker daemon"]
async fn redis_bus_delivers_between_connections() {
    let (_node, config) = start_redis().await;
    let publisher = RedisMessageBus::connect(&config).await.expect("publisher bus");
    let listener = RedisMessageBus::connect(&config).await.expect("listener bus");
    let mut inbound = listener.take_inbound().expect("inbound stream");
    assert!(listener.take_inbound().is_none());

    listener.subscribe("chat.room.test").await.expect("subscribe");
    assert_eq!(listener.subscriber().subscriptions(), vec!["chat.room.test"]);

    publisher
        .publish("chat.room.test", "payload-1".to_string())
        .await
        .expect("publish");
    let received = timeout(Duration::from_secs(5), inbound.recv())
        .await
        .expect("message in time")
        .expect("stream open");
    assert_eq!(received.channel, "chat.room.test");
    assert_eq!(received.payload, "payload-1");

    listener.unsubscribe("chat.room.test").await.expect("unsubscribe");
    publisher
        .publish("chat.room.test", "payload-2".to_string())
        .await
        .expect("publish");
    assert!(timeout(Duration::from_millis(500), inbound.recv())
        .await
        .is_err());

    listener.close().await.expect("close");
    assert!(listener.subscribe("chat.room.test").await.is_err());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires local docker daemon"]
async fn brokers_fan_out_across_redis() {
    let (_node, config) = start_redis().await;
    let conn = manager(&config).await;
    let registry: Arc<dyn SubscriptionRegistry> = Arc::new(RedisSubscriptionRegistry::new(
        conn.clone(),
        "chat:server:rooms:",
    ));

    let (tx_a, mut events_a) = mpsc::channel(16);
    let (tx_b, mut events_b) = mpsc::channel(16);
    let broker_a = Arc::new(RoomFanoutBroker::new(
        ServerId::new("node-a"),
        Arc::new(RedisMessageBus::connect(&config).await.expect("bus a")),
        registry.clone(),
        BrokerSettings::default(),
        tx_a,
    ));
    let broker_b = Arc::new(RoomFanoutBroker::new(
        ServerId::new("node-b"),
        Arc::new(RedisMessageBus::connect(&config).await.expect("bus b")),
        registry.clone(),
        BrokerSettings::default(),
        tx_b,
    ));
    broker_a.start().await.expect("start a");
    broker_b.start().await.expect("start b");

    let room_id = RoomId::from(Uuid::new_v4());
    assert!(broker_a.subscribe(room_id).await.expect("subscribe a"));
    assert!(broker_b.subscribe(room_id).await.expect("subscribe b"));
    assert_eq!(
        registry
            .rooms(&ServerId::new("node-b"))
            .await
            .expect("rooms"),
        vec![room_id]
    );

    let message = chat_message(room_id, 1);
    assert!(
        broker_a
            .publish(room_id, &message, Some(broker_a.server_id()))
            .await
    );

    let event = timeout(Duration::from_secs(5), events_b.recv())
        .await
        .expect("event in time")
        .expect("events open");
    match event {
        FanoutEvent::Room(delivery) => {
            assert_eq!(delivery.room_id, room_id);
            assert_eq!(delivery.message, message);
        }
        other => panic!("unexpected event: {other:?}"),
    }
    // 发送方排除了自己
    assert!(timeout(Duration::from_millis(500), events_a.recv())
        .await
        .is_err());

    broker_a.stop().await;
    broker_b.stop().await;
    assert!(registry
        .rooms(&ServerId::new("node-a"))
        .await
        .expect("rooms")
        .is_empty());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[ignore = "requires local docker daemon"]
async fn redis_sequences_are_unique_under_concurrency() {
    let (_node, config) = start_redis().await;
    let allocator = Arc::new(RedisSequenceAllocator::new(
        manager(&config).await,
        "chat:sequence:",
    ));
    let room_id = RoomId::from(Uuid::new_v4());
    assert_eq!(allocator.current(room_id).await.expect("current"), 0);

    let mut handles = Vec::new();
    for _ in 0..32 {
        let allocator = allocator.clone();
        handles.push(tokio::spawn(async move { allocator.next(room_id).await }));
    }
    let mut sequences = Vec::new();
    for handle in handles {
        sequences.push(handle.await.expect("join").expect("next"));
    }
    sequences.sort_unstable();
    assert_eq!(sequences, (1..=32).collect::<Vec<i64>>());
    assert_eq!(allocator.current(room_id).await.expect("current"), 32);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
#[ignore = "requires local docker daemon"]
async fn redis_presence_store_round_trip() {
    let (_node, config) = start_redis().await;
    let conn = manager(&config).await;
    let store = RedisPresenceStore::new(conn.clone(), "online.users");

    let alice = OnlineUser::new(UserId::from(Uuid::new_v4()), "alice", None);
    let bob = OnlineUser::new(
        UserId::from(Uuid::new_v4()),
        "bob",
        Some("https://cdn.example.com/bob.png".to_string()),
    );
    let (node_a, node_b) = (ServerId::new("node-a"), ServerId::new("node-b"));
    store.put(&node_a, &alice).await.expect("put alice");
    store.put(&node_a, &bob).await.expect("put bob");
    store.put(&node_b, &alice).await.expect("put alice on node b");

    let mut listed = store.list().await.expect("list");
    listed.sort_by(|a, b| a.nickname.cmp(&b.nickname));
    assert_eq!(listed, vec![alice.clone(), bob.clone()]);

    // 无法解析的记录被跳过
    let mut raw = conn.clone();
    let _: () = raw
        .hset("online.users", "garbage", "{not json")
        .await
        .expect("hset garbage");

    // node-b 仍持有 alice
    assert!(!store.remove(&node_a, alice.id).await.expect("remove"));
    assert_eq!(store.list().await.expect("list").len(), 2);

    let offline = store.release_server(&node_a).await.expect("release node a");
    assert_eq!(offline, vec![bob.id]);
    assert_eq!(store.list().await.expect("list"), vec![alice.clone()]);

    let offline = store.release_server(&node_b).await.expect("release node b");
    assert_eq!(offline, vec![alice.id]);
    assert!(store.list().await.expect("list").is_empty());
}
