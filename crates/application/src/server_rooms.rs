//! 进程房间订阅登记表
//!
//! 记录每个进程当前订阅了哪些房间频道。进程重启后会先清理自己遗留的记录。

use async_trait::async_trait;
use domain::{RoomId, ServerId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::warn;

use crate::error::ApplicationError;

#[async_trait]
pub trait SubscriptionRegistry: Send + Sync {
    async fn record(&self, server_id: &ServerId, room_id: RoomId) -> Result<(), ApplicationError>;

    async fn forget(&self, server_id: &ServerId, room_id: RoomId) -> Result<(), ApplicationError>;

    async fn rooms(&self, server_id: &ServerId) -> Result<Vec<RoomId>, ApplicationError>;

    /// 删除该进程的全部记录，返回删除的房间数
    async fn clear(&self, server_id: &ServerId) -> Result<usize, ApplicationError>;
}

/// 使用 Redis Set `<prefix><serverId>` 保存记录
pub struct RedisSubscriptionRegistry {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisSubscriptionRegistry {
    pub fn new(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
        }
    }

    fn server_rooms_key(&self, server_id: &ServerId) -> String {
        format!("{}{}", self.key_prefix, server_id)
    }
}

fn redis_failure(op: &str, e: redis::RedisError) -> ApplicationError {
    let message = format!("Redis {op} failed: {e}");
    ApplicationError::infrastructure_with_source(message, e)
}

#[async_trait]
impl SubscriptionRegistry for RedisSubscriptionRegistry {
    async fn record(&self, server_id: &ServerId, room_id: RoomId) -> Result<(), ApplicationError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .sadd(self.server_rooms_key(server_id), room_id.to_string())
            .await
            .map_err(|e| redis_failure("SADD", e))?;
        Ok(())
    }

    async fn forget(&self, server_id: &ServerId, room_id: RoomId) -> Result<(), ApplicationError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .srem(self.server_rooms_key(server_id), room_id.to_string())
            .await
            .map_err(|e| redis_failure("SREM", e))?;
        Ok(())
    }

    async fn rooms(&self, server_id: &ServerId) -> Result<Vec<RoomId>, ApplicationError> {
        let mut conn = self.conn.clone();
        let members: Vec<String> = conn
            .smembers(self.server_rooms_key(server_id))
            .await
            .map_err(|e| redis_failure("SMEMBERS", e))?;

        // 跳过无法解析的成员
        Ok(members
            .into_iter()
            .filter_map(|raw| match raw.parse::<RoomId>() {
                Ok(room_id) => Some(room_id),
                Err(e) => {
                    warn!(server_id = %server_id, value = %raw, error = %e, "订阅登记表中的房间 id 无效");
                    None
                }
            })
            .collect())
    }

    async fn clear(&self, server_id: &ServerId) -> Result<usize, ApplicationError> {
        let key = self.server_rooms_key(server_id);
        let mut conn = self.conn.clone();
        let (count, _deleted): (usize, usize) = redis::pipe()
            .atomic()
            .scard(&key)
            .del(&key)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_failure("SCARD/DEL", e))?;
        Ok(count)
    }
}

pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Mutex, PoisonError};

    #[derive(Default)]
    pub struct MemorySubscriptionRegistry {
        records: Mutex<HashMap<ServerId, HashSet<RoomId>>>,
    }

    impl MemorySubscriptionRegistry {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl SubscriptionRegistry for MemorySubscriptionRegistry {
        async fn record(
            &self,
            server_id: &ServerId,
            room_id: RoomId,
        ) -> Result<(), ApplicationError> {
            self.records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(server_id.clone())
                .or_default()
                .insert(room_id);
            Ok(())
        }

        async fn forget(
            &self,
            server_id: &ServerId,
            room_id: RoomId,
        ) -> Result<(), ApplicationError> {
            let mut records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(rooms) = records.get_mut(server_id) {
                rooms.remove(&room_id);
                if rooms.is_empty() {
                    records.remove(server_id);
                }
            }
            Ok(())
        }

        async fn rooms(&self, server_id: &ServerId) -> Result<Vec<RoomId>, ApplicationError> {
            Ok(self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(server_id)
                .map(|rooms| rooms.iter().copied().collect())
                .unwrap_or_default())
        }

        async fn clear(&self, server_id: &ServerId) -> Result<usize, ApplicationError> {
            Ok(self
                .records
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(server_id)
                .map_or(0, |rooms| rooms.len()))
        }
    }
}
