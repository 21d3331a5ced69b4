//! 房间消息跨进程分发
//!
//! 每个进程只订阅本地有连接的房间频道。发布时附带发送进程 id，
//! 接收侧据此丢弃自己发出的回声，并用有界窗口去重。

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use chrono::Utc;
use config::AppConfig;
use domain::{ChatMessage, OnlineUser, RoomId, ServerId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::bus::{BusError, BusMessage, MessageBus};
use crate::dedup::DedupCache;
use crate::error::ApplicationError;
use crate::server_rooms::SubscriptionRegistry;

/// 房间频道上传输的信封
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DistributedEnvelope {
    pub id: String,
    pub server_id: ServerId,
    pub room_id: RoomId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exclude_server_id: Option<ServerId>,
    /// 发布时间（毫秒）
    pub timestamp: i64,
    pub payload: ChatMessage,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomDelivery {
    pub room_id: RoomId,
    pub message: ChatMessage,
}

/// 从总线收到、需要在本进程投递的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FanoutEvent {
    Room(RoomDelivery),
    Presence(Vec<OnlineUser>),
}

/// 单条入站消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundOutcome {
    Delivered,
    /// 本进程发出且要求排除本进程
    Echo,
    Duplicate,
    Ignored,
}

#[derive(Debug, Clone)]
pub struct BrokerSettings {
    pub room_channel_prefix: String,
    pub presence_channel: String,
    pub publish_timeout: Duration,
    pub dedup_capacity: usize,
    pub dedup_ttl: Duration,
    pub sweep_interval: Duration,
}

impl BrokerSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            room_channel_prefix: config.fanout.room_channel_prefix.clone(),
            presence_channel: config.fanout.presence_channel.clone(),
            publish_timeout: Duration::from_millis(config.redis.publish_timeout_ms),
            dedup_capacity: config.fanout.dedup_capacity,
            dedup_ttl: Duration::from_secs(config.fanout.dedup_ttl_secs),
            sweep_interval: Duration::from_secs(config.fanout.dedup_sweep_interval_secs),
        }
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

pub struct RoomFanoutBroker {
    server_id: ServerId,
    boot_millis: i64,
    bus: Arc<dyn MessageBus>,
    registry: Arc<dyn SubscriptionRegistry>,
    settings: BrokerSettings,
    // 订阅与取消订阅需要跨越总线调用保持互斥
    subscribed: tokio::sync::Mutex<HashSet<RoomId>>,
    dedup: Mutex<DedupCache>,
    counter: AtomicU64,
    events: mpsc::Sender<FanoutEvent>,
    shutdown: CancellationToken,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl RoomFanoutBroker {
    pub fn new(
        server_id: ServerId,
        bus: Arc<dyn MessageBus>,
        registry: Arc<dyn SubscriptionRegistry>,
        settings: BrokerSettings,
        events: mpsc::Sender<FanoutEvent>,
    ) -> Self {
        let dedup = DedupCache::new(settings.dedup_capacity, settings.dedup_ttl);
        Self {
            server_id,
            boot_millis: Utc::now().timestamp_millis(),
            bus,
            registry,
            settings,
            subscribed: tokio::sync::Mutex::new(HashSet::new()),
            dedup: Mutex::new(dedup),
            counter: AtomicU64::new(0),
            events,
            shutdown: CancellationToken::new(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    pub fn room_channel(&self, room_id: RoomId) -> String {
        format!("{}{}", self.settings.room_channel_prefix, room_id)
    }

    fn next_envelope_id(&self) -> String {
        let counter = self.counter.fetch_add(1, Ordering::Relaxed);
        format!("{}-{}-{}", self.server_id, self.boot_millis, counter)
    }

    /// 订阅房间频道，首次订阅时返回 `true`
    pub async fn subscribe(&self, room_id: RoomId) -> Result<bool, BusError> {
        let mut subscribed = self.subscribed.lock().await;
        if subscribed.contains(&room_id) {
            return Ok(false);
        }

        self.bus.subscribe(&self.room_channel(room_id)).await?;
        subscribed.insert(room_id);

        if let Err(e) = self.registry.record(&self.server_id, room_id).await {
            warn!(room_id = %room_id, error = %e, "写入房间订阅登记失败");
        }
        info!(room_id = %room_id, server_id = %self.server_id, "已订阅房间频道");
        Ok(true)
    }

    /// 在持有订阅锁的情况下检查 `in_use`，仍被使用时不取消订阅。
    ///
    /// 返回是否真的取消了订阅。
    pub async fn unsubscribe_unless<F>(&self, room_id: RoomId, in_use: F) -> Result<bool, BusError>
    where
        F: FnOnce() -> bool,
    {
        let mut subscribed = self.subscribed.lock().await;
        if !subscribed.contains(&room_id) || in_use() {
            return Ok(false);
        }

        self.bus.unsubscribe(&self.room_channel(room_id)).await?;
        subscribed.remove(&room_id);

        if let Err(e) = self.registry.forget(&self.server_id, room_id).await {
            warn!(room_id = %room_id, error = %e, "删除房间订阅登记失败");
        }
        info!(room_id = %room_id, server_id = %self.server_id, "已取消订阅房间频道");
        Ok(true)
    }

    pub async fn unsubscribe(&self, room_id: RoomId) -> Result<bool, BusError> {
        self.unsubscribe_unless(room_id, || false).await
    }

    pub async fn is_subscribed(&self, room_id: RoomId) -> bool {
        self.subscribed.lock().await.contains(&room_id)
    }

    pub async fn subscribed_rooms(&self) -> Vec<RoomId> {
        self.subscribed.lock().await.iter().copied().collect()
    }

    /// 向房间频道发布消息。
    ///
    /// 失败或超时只记录日志，返回 `false`。
    pub async fn publish(
        &self,
        room_id: RoomId,
        message: &ChatMessage,
        exclude_server: Option<&ServerId>,
    ) -> bool {
        let envelope = DistributedEnvelope {
            id: self.next_envelope_id(),
            server_id: self.server_id.clone(),
            room_id,
            exclude_server_id: exclude_server.cloned(),
            timestamp: Utc::now().timestamp_millis(),
            payload: message.clone(),
        };
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(room_id = %room_id, error = %e, "信封序列化失败");
                return false;
            }
        };

        let channel = self.room_channel(room_id);
        if self.publish_bounded(&channel, payload).await {
            debug!(room_id = %room_id, envelope_id = %envelope.id, "房间消息已发布");
            true
        } else {
            false
        }
    }

    /// 发布在线用户快照
    pub async fn publish_presence(&self, users: &[OnlineUser]) -> bool {
        match serde_json::to_string(users) {
            Ok(payload) => {
                let channel = self.settings.presence_channel.clone();
                self.publish_bounded(&channel, payload).await
            }
            Err(e) => {
                error!(error = %e, "在线用户快照序列化失败");
                false
            }
        }
    }

    async fn publish_bounded(&self, channel: &str, payload: String) -> bool {
        match tokio::time::timeout(
            self.settings.publish_timeout,
            self.bus.publish(channel, payload),
        )
        .await
        {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                warn!(channel = %channel, error = %e, "消息发布失败");
                false
            }
            Err(_) => {
                warn!(
                    channel = %channel,
                    timeout_ms = self.settings.publish_timeout.as_millis() as u64,
                    "消息发布超时"
                );
                false
            }
        }
    }

    /// 处理一条总线入站消息，解码失败只记录日志
    pub async fn handle_bus_message(&self, message: BusMessage) -> InboundOutcome {
        if message.channel == self.settings.presence_channel {
            return match serde_json::from_str::<Vec<OnlineUser>>(&message.payload) {
                Ok(users) => {
                    self.emit(FanoutEvent::Presence(users)).await;
                    InboundOutcome::Delivered
                }
                Err(e) => {
                    warn!(channel = %message.channel, error = %e, "在线用户快照解析失败");
                    InboundOutcome::Ignored
                }
            };
        }

        if !message
            .channel
            .starts_with(&self.settings.room_channel_prefix)
        {
            debug!(channel = %message.channel, "忽略未知频道的消息");
            return InboundOutcome::Ignored;
        }

        let envelope: DistributedEnvelope = match serde_json::from_str(&message.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(channel = %message.channel, error = %e, "房间消息信封解析失败");
                return InboundOutcome::Ignored;
            }
        };

        if envelope.exclude_server_id.as_ref() == Some(&self.server_id) {
            debug!(envelope_id = %envelope.id, "丢弃本进程发出的消息");
            return InboundOutcome::Echo;
        }

        let fresh = self
            .dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .check_and_record(&envelope.id, Instant::now());
        if !fresh {
            debug!(envelope_id = %envelope.id, "丢弃重复消息");
            return InboundOutcome::Duplicate;
        }

        self.emit(FanoutEvent::Room(RoomDelivery {
            room_id: envelope.room_id,
            message: envelope.payload,
        }))
        .await;
        InboundOutcome::Delivered
    }

    async fn emit(&self, event: FanoutEvent) {
        if self.events.send(event).await.is_err() {
            warn!("事件接收端已关闭，丢弃事件");
        }
    }

    /// 清理过期的去重记录
    pub fn sweep_dedup(&self) -> usize {
        self.dedup
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .sweep(Instant::now())
    }

    /// 启动监听与清理任务
    pub async fn start(self: &Arc<Self>) -> Result<(), ApplicationError> {
        match self.registry.clear(&self.server_id).await {
            Ok(0) => {}
            Ok(stale) => info!(
                server_id = %self.server_id,
                stale_rooms = stale,
                "已清理上次运行遗留的订阅登记"
            ),
            Err(e) => warn!(server_id = %self.server_id, error = %e, "清理订阅登记失败"),
        }

        self.bus.subscribe(&self.settings.presence_channel).await?;
        let mut inbound = self.bus.take_inbound().ok_or_else(|| {
            ApplicationError::infrastructure("bus inbound stream has already been taken")
        })?;

        let listener = {
            let broker = Arc::clone(self);
            let token = self.shutdown.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        received = inbound.recv() => match received {
                            Some(message) => {
                                broker.handle_bus_message(message).await;
                            }
                            None => {
                                warn!("总线入站流已关闭，监听任务退出");
                                break;
                            }
                        },
                    }
                }
            })
        };

        let sweeper = {
            let broker = Arc::clone(self);
            let token = self.shutdown.clone();
            let period = self.settings.sweep_interval;
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        _ = ticker.tick() => {
                            let removed = broker.sweep_dedup();
                            if removed > 0 {
                                debug!(removed, "已清理过期去重记录");
                            }
                        }
                    }
                }
            })
        };

        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([listener, sweeper]);
        info!(server_id = %self.server_id, "房间分发器已启动");
        Ok(())
    }

    /// 停止后台任务，取消全部订阅并关闭总线
    pub async fn stop(&self) {
        self.shutdown.cancel();
        let tasks: Vec<JoinHandle<()>> = self
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "后台任务异常退出");
            }
        }

        let rooms: Vec<RoomId> = self.subscribed.lock().await.drain().collect();
        for room_id in &rooms {
            if let Err(e) = self.bus.unsubscribe(&self.room_channel(*room_id)).await {
                warn!(room_id = %room_id, error = %e, "取消订阅失败");
            }
        }
        if let Err(e) = self.bus.unsubscribe(&self.settings.presence_channel).await {
            warn!(error = %e, "取消订阅在线用户频道失败");
        }
        if let Err(e) = self.registry.clear(&self.server_id).await {
            warn!(server_id = %self.server_id, error = %e, "清理订阅登记失败");
        }
        if let Err(e) = self.bus.close().await {
            warn!(error = %e, "关闭总线失败");
        }
        info!(server_id = %self.server_id, rooms = rooms.len(), "房间分发器已停止");
    }
}
