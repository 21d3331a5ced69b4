use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use application::memory::{
    InMemoryBusHub, MemoryMembership, MemoryMessageStore, MemoryPresenceStore,
    MemorySequenceAllocator, MemorySubscriptionRegistry,
};
use application::{
    BrokerSettings, ChatGateway, ChatGatewayDependencies, CursorPaginator, PresenceRegistry,
    PresenceWatchers, RoomFanoutBroker, SessionRegistry,
};
use config::AppConfig;
use domain::{RoomId, SenderProfile, ServerId, UserId};
use futures_util::StreamExt;
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{sleep, timeout, Instant};
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use uuid::Uuid;
use web_api::{router, AppState};

pub type WsClient = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 单进程的完整服务，共享状态全部为内存实现
pub struct TestApp {
    pub addr: SocketAddr,
    pub gateway: Arc<ChatGateway>,
    pub store: Arc<MemoryMessageStore>,
    pub membership: Arc<MemoryMembership>,
    _shutdown: oneshot::Sender<()>,
}

impl TestApp {
    pub async fn spawn() -> Self {
        let config = AppConfig::default();
        let hub = InMemoryBusHub::new();
        let (events_tx, events_rx) = mpsc::channel(config.fanout.event_buffer);
        let broker = Arc::new(RoomFanoutBroker::new(
            ServerId::new("web-test"),
            Arc::new(hub.connect()),
            Arc::new(MemorySubscriptionRegistry::new()),
            BrokerSettings::from_config(&config),
            events_tx,
        ));
        broker.start().await.expect("start broker");

        let store = Arc::new(MemoryMessageStore::default());
        let membership = Arc::new(MemoryMembership::new());
        let presence = Arc::new(PresenceRegistry::new(
            Arc::new(MemoryPresenceStore::new()),
            broker.clone(),
        ));
        let paginator = Arc::new(CursorPaginator::new(
            store.clone(),
            membership.clone(),
            &config.pagination,
        ));
        let gateway = Arc::new(ChatGateway::new(ChatGatewayDependencies {
            registry: Arc::new(SessionRegistry::new()),
            broker,
            presence,
            watchers: Arc::new(PresenceWatchers::new()),
            sequencer: Arc::new(MemorySequenceAllocator::new()),
            store: store.clone(),
            membership: membership.clone(),
            paginator,
        }));
        gateway.spawn_dispatcher(events_rx);

        let state = AppState::new(
            gateway.clone(),
            membership.clone(),
            membership.clone(),
            config.fanout.outbound_buffer,
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = router(state);

        tokio::spawn(async move {
            axum::serve(listener, app.into_make_service())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await
                .ok();
        });

        Self {
            addr,
            gateway,
            store,
            membership,
            _shutdown: shutdown_tx,
        }
    }

    pub fn http(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// 创建用户并登记显示资料
    pub fn user(&self, nickname: &str) -> UserId {
        let user_id = UserId::from(Uuid::new_v4());
        self.store.register_profile(SenderProfile {
            id: user_id,
            nickname: nickname.to_string(),
            profile_image: None,
        });
        user_id
    }

    pub fn room_with(&self, members: &[UserId]) -> RoomId {
        let room_id = RoomId::from(Uuid::new_v4());
        for &member in members {
            self.membership.add_member(room_id, member);
        }
        room_id
    }

    pub async fn connect_chat(&self, user_id: UserId, nickname: &str) -> WsClient {
        let before = self.gateway.registry().user_connection_count(user_id);
        let url = format!(
            "ws://{}/ws/chat?user_id={}&nickname={}",
            self.addr, user_id, nickname
        );
        let (socket, _) = connect_async(url.as_str()).await.expect("connect chat");
        let registry = self.gateway.registry().clone();
        wait_until(move || registry.user_connection_count(user_id) > before).await;
        socket
    }

    pub async fn connect_watcher(&self, user_id: UserId) -> WsClient {
        let url = format!("ws://{}/ws/online-users?user_id={}", self.addr, user_id);
        let (socket, _) = connect_async(url.as_str()).await.expect("connect watcher");
        socket
    }
}

/// 等待条件成立，超时则失败
pub async fn wait_until<F>(condition: F)
where
    F: Fn() -> bool,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        sleep(Duration::from_millis(10)).await;
    }
}

/// 读取下一个文本帧并解析为 JSON
pub async fn next_json(socket: &mut WsClient) -> Value {
    loop {
        let frame = timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("frame in time")
            .expect("socket open")
            .expect("valid frame");
        if frame.is_text() {
            let text = frame.to_text().expect("utf8 text");
            return serde_json::from_str(text).expect("json frame");
        }
    }
}

/// 断言短时间内没有新的文本帧
pub async fn assert_no_frame(socket: &mut WsClient) {
    if let Ok(Some(Ok(frame))) = timeout(Duration::from_millis(300), socket.next()).await {
        assert!(!frame.is_text(), "unexpected frame: {frame:?}");
    }
}
