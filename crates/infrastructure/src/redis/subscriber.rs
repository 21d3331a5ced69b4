//! Redis 消息订阅者
//!
//! 支持动态订阅频道，订阅连接断开后按指数退避重连并恢复已订阅的频道。

use std::collections::HashSet;
use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use ::redis::aio::{PubSubSink, PubSubStream};
use ::redis::Client;
use application::BusMessage;
use config::RedisConfig;
use futures_util::StreamExt;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::error::{RedisBusError, RedisBusResult};

/// 订阅连接重连策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_attempts: u32,
}

impl ReconnectPolicy {
    pub fn from_config(config: &RedisConfig) -> Self {
        Self {
            initial_delay: Duration::from_millis(config.reconnect_interval_ms),
            max_attempts: config.max_reconnect_attempts,
        }
    }

    /// 第 `attempt` 次重连前的等待时间，从 1 开始计数
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(6);
        self.initial_delay.saturating_mul(1 << exponent)
    }
}

struct Shared {
    client: Client,
    // 重连期间为 None
    sink: Mutex<Option<PubSubSink>>,
    channels: StdMutex<HashSet<String>>,
    policy: ReconnectPolicy,
    shutdown: CancellationToken,
}

impl Shared {
    fn channels(&self) -> MutexGuard<'_, HashSet<String>> {
        self.channels.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Redis 消息订阅者
///
/// 所有频道的消息汇入同一个入站通道，通过 [`RedisSubscriber::take_inbound`] 取出。
pub struct RedisSubscriber {
    shared: Arc<Shared>,
    inbound: StdMutex<Option<mpsc::UnboundedReceiver<BusMessage>>>,
    forward: StdMutex<Option<JoinHandle<()>>>,
}

impl RedisSubscriber {
    /// 建立 Pub/Sub 连接并启动转发任务
    pub async fn connect(client: Client, policy: ReconnectPolicy) -> RedisBusResult<Self> {
        let pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| RedisBusError::Connection {
                message: format!("获取 PubSub 连接失败: {e}"),
            })?;
        let (sink, stream) = pubsub.split();

        let shared = Arc::new(Shared {
            client,
            sink: Mutex::new(Some(sink)),
            channels: StdMutex::new(HashSet::new()),
            policy,
            shutdown: CancellationToken::new(),
        });
        let (sender, receiver) = mpsc::unbounded_channel();
        let forward = tokio::spawn(forward_loop(Arc::clone(&shared), stream, sender));

        info!("Redis 订阅连接已建立");
        Ok(Self {
            shared,
            inbound: StdMutex::new(Some(receiver)),
            forward: StdMutex::new(Some(forward)),
        })
    }

    pub async fn subscribe(&self, channel: &str) -> RedisBusResult<()> {
        if self.shared.shutdown.is_cancelled() {
            return Err(RedisBusError::Closed);
        }

        let mut sink = self.shared.sink.lock().await;
        if !self.shared.channels().insert(channel.to_string()) {
            debug!(channel, "频道已订阅");
            return Ok(());
        }

        match sink.as_mut() {
            Some(sink) => {
                if let Err(e) = sink.subscribe(channel).await {
                    self.shared.channels().remove(channel);
                    return Err(RedisBusError::Subscribe {
                        message: format!("订阅频道 {channel} 失败: {e}"),
                    });
                }
                info!(channel, "添加订阅频道");
            }
            None => debug!(channel, "订阅连接重连中，恢复后订阅"),
        }
        Ok(())
    }

    pub async fn unsubscribe(&self, channel: &str) -> RedisBusResult<()> {
        let mut sink = self.shared.sink.lock().await;
        if !self.shared.channels().remove(channel) {
            return Ok(());
        }

        if let Some(sink) = sink.as_mut() {
            sink.unsubscribe(channel)
                .await
                .map_err(|e| RedisBusError::Subscribe {
                    message: format!("取消订阅频道 {channel} 失败: {e}"),
                })?;
        }
        info!(channel, "移除订阅频道");
        Ok(())
    }

    /// 当前订阅的频道
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.channels().iter().cloned().collect()
    }

    pub fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<BusMessage>> {
        self.inbound
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// 停止转发并断开订阅连接
    pub async fn shutdown(&self) {
        info!("开始关闭 Redis 订阅者");
        self.shared.shutdown.cancel();
        self.shared.sink.lock().await.take();
        self.shared.channels().clear();

        let forward = self
            .forward
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = forward {
            if let Err(e) = handle.await {
                warn!(error = %e, "Redis 订阅转发任务异常退出");
            }
        }
        info!("Redis 订阅者已关闭");
    }
}

async fn forward_loop(
    shared: Arc<Shared>,
    mut stream: PubSubStream,
    sender: mpsc::UnboundedSender<BusMessage>,
) {
    loop {
        loop {
            let next = tokio::select! {
                _ = shared.shutdown.cancelled() => return,
                next = stream.next() => next,
            };
            let Some(msg) = next else { break };

            let channel = msg.get_channel_name().to_string();
            match msg.get_payload::<String>() {
                Ok(payload) => {
                    if sender.send(BusMessage::new(channel, payload)).is_err() {
                        debug!("入站接收端已关闭，停止转发");
                        return;
                    }
                }
                Err(e) => warn!(channel, error = %e, "获取消息负载失败"),
            }
        }

        warn!("Redis 订阅连接断开，准备重连");
        shared.sink.lock().await.take();
        match reconnect(&shared).await {
            Some(next) => stream = next,
            None => {
                shared.shutdown.cancel();
                return;
            }
        }
    }
}

async fn reconnect(shared: &Shared) -> Option<PubSubStream> {
    for attempt in 1..=shared.policy.max_attempts {
        let delay = shared.policy.delay(attempt);
        tokio::select! {
            _ = shared.shutdown.cancelled() => return None,
            _ = tokio::time::sleep(delay) => {}
        }

        match resubscribe(shared).await {
            Ok(stream) => {
                info!(attempt, "Redis 订阅连接已恢复");
                return Some(stream);
            }
            Err(e) => warn!(attempt, error = %e, "Redis 订阅重连失败"),
        }
    }

    error!(
        attempts = shared.policy.max_attempts,
        "Redis 订阅重连次数用尽，停止订阅"
    );
    None
}

async fn resubscribe(shared: &Shared) -> RedisBusResult<PubSubStream> {
    let pubsub = shared.client.get_async_pubsub().await?;
    let (mut sink, stream) = pubsub.split();

    // 持有 sink 锁期间恢复订阅，避免与并发的订阅操作交错
    let mut guard = shared.sink.lock().await;
    let channels: Vec<String> = shared.channels().iter().cloned().collect();
    for channel in &channels {
        sink.subscribe(channel).await?;
    }
    *guard = Some(sink);
    debug!(channels = channels.len(), "已恢复频道订阅");
    Ok(stream)
}
