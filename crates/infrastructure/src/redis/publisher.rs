//! Redis 消息发布者

use ::redis::aio::ConnectionManager;
use ::redis::AsyncCommands;
use tracing::debug;

use super::error::{RedisBusError, RedisBusResult};

/// 基于 [`ConnectionManager`] 的发布者，连接断开时由管理器自动重连
#[derive(Clone)]
pub struct RedisPublisher {
    conn: ConnectionManager,
}

impl RedisPublisher {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// 发布到频道，返回收到消息的订阅者数量
    pub async fn publish(&self, channel: &str, payload: &str) -> RedisBusResult<u32> {
        let mut conn = self.conn.clone();
        let receivers: u32 =
            conn.publish(channel, payload)
                .await
                .map_err(|e| RedisBusError::Publish {
                    message: format!("发布到频道 {channel} 失败: {e}"),
                })?;
        debug!(channel, receivers, "消息已发布");
        Ok(receivers)
    }
}
