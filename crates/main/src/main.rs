//! 主应用程序入口
//!
//! 加载配置，连接 Redis，组装实时分发核心并启动 Axum Web 服务。

use std::sync::Arc;

use anyhow::Context;
use application::memory::{MemoryMembership, MemoryMessageStore};
use application::{
    BrokerSettings, ChatGateway, ChatGatewayDependencies, CursorPaginator, PresenceRegistry,
    PresenceWatchers, RedisPresenceStore, RedisSequenceAllocator, RedisSubscriptionRegistry,
    RoomFanoutBroker, SessionRegistry,
};
use config::AppConfig;
use domain::ServerId;
use infrastructure::RedisMessageBus;
use redis::aio::ConnectionManager;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;
use web_api::{router, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 初始化日志
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AppConfig::load().context("加载配置失败")?;
    let server_id = config
        .server
        .server_id
        .clone()
        .map(ServerId::new)
        .unwrap_or_else(ServerId::from_env_or_generate);
    tracing::info!(server_id = %server_id, "服务实例启动");

    // 共享状态与发布共用一个连接管理器，订阅另开连接
    let client = redis::Client::open(config.redis.url.as_str()).context("Redis 地址无效")?;
    let conn = ConnectionManager::new(client.clone())
        .await
        .context("连接 Redis 失败")?;
    let bus = RedisMessageBus::with_connection(client, conn.clone(), &config.redis).await?;

    let (events_tx, events_rx) = mpsc::channel(config.fanout.event_buffer);
    let broker = Arc::new(RoomFanoutBroker::new(
        server_id,
        Arc::new(bus),
        Arc::new(RedisSubscriptionRegistry::new(
            conn.clone(),
            config.fanout.server_rooms_key_prefix.clone(),
        )),
        BrokerSettings::from_config(&config),
        events_tx,
    ));
    broker.start().await?;

    // 消息存储与成员关系由外部服务提供
    tracing::warn!("未接入外部消息存储，使用内存实现，仅适用于单机开发");
    let store = Arc::new(MemoryMessageStore::default());
    let membership = Arc::new(MemoryMembership::new());

    let presence = Arc::new(PresenceRegistry::new(
        Arc::new(RedisPresenceStore::new(
            conn.clone(),
            config.fanout.presence_key.clone(),
        )),
        broker.clone(),
    ));
    // 同一 server_id 上次运行未正常退出时遗留的在线记录
    presence
        .release_local()
        .await
        .context("清理遗留在线用户失败")?;
    let paginator = Arc::new(CursorPaginator::new(
        store.clone(),
        membership.clone(),
        &config.pagination,
    ));
    let gateway = Arc::new(ChatGateway::new(ChatGatewayDependencies {
        registry: Arc::new(SessionRegistry::new()),
        broker: broker.clone(),
        presence,
        watchers: Arc::new(PresenceWatchers::new()),
        sequencer: Arc::new(RedisSequenceAllocator::new(
            conn,
            config.fanout.sequence_key_prefix.clone(),
        )),
        store,
        membership: membership.clone(),
        paginator,
    }));
    let dispatcher = gateway.spawn_dispatcher(events_rx);

    // 启动 Web 服务器
    let state = AppState::new(
        gateway.clone(),
        membership.clone(),
        membership,
        config.fanout.outbound_buffer,
    );
    let listener = tokio::net::TcpListener::bind(config.bind_addr()).await?;
    tracing::info!("聊天分发服务启动在 http://{}", config.bind_addr());
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // WebSocket 任务不受 HTTP 优雅关闭管理，需主动断开本进程的连接
    gateway.shutdown().await;
    broker.stop().await;
    dispatcher.abort();
    tracing::info!("服务已停止");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "监听退出信号失败");
        std::future::pending::<()>().await;
    }
    tracing::info!("收到退出信号，开始优雅关闭");
}
