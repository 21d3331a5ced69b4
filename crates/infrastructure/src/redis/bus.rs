//! 基于 Redis Pub/Sub 的 [`MessageBus`] 实现

use ::redis::aio::ConnectionManager;
use ::redis::Client;
use application::{BusError, BusMessage, MessageBus};
use async_trait::async_trait;
use config::RedisConfig;
use tokio::sync::mpsc;
use tracing::info;

use super::error::RedisBusResult;
use super::publisher::RedisPublisher;
use super::subscriber::{ReconnectPolicy, RedisSubscriber};

pub struct RedisMessageBus {
    publisher: RedisPublisher,
    subscriber: RedisSubscriber,
}

impl RedisMessageBus {
    /// 按配置建立发布与订阅两条连接
    pub async fn connect(config: &RedisConfig) -> RedisBusResult<Self> {
        let client = Client::open(config.url.as_str())?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Self::with_connection(client, conn, config).await
    }

    /// 复用已有的 [`ConnectionManager`] 发布，另开一条订阅连接
    pub async fn with_connection(
        client: Client,
        conn: ConnectionManager,
        config: &RedisConfig,
    ) -> RedisBusResult<Self> {
        let subscriber = RedisSubscriber::connect(client, ReconnectPolicy::from_config(config)).await?;
        info!(url = %config.url, "Redis 消息总线已就绪");
        Ok(Self {
            publisher: RedisPublisher::new(conn),
            subscriber,
        })
    }

    pub fn subscriber(&self) -> &RedisSubscriber {
        &self.subscriber
    }
}

#[async_trait]
impl MessageBus for RedisMessageBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
        self.publisher.publish(channel, &payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
        Ok(self.subscriber.subscribe(channel).await?)
    }

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
        Ok(self.subscriber.unsubscribe(channel).await?)
    }

    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<BusMessage>> {
        self.subscriber.take_inbound()
    }

    async fn close(&self) -> Result<(), BusError> {
        self.subscriber.shutdown().await;
        Ok(())
    }
}
