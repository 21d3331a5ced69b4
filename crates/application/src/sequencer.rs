use async_trait::async_trait;
use domain::{RoomId, SequenceNumber};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use crate::error::ApplicationError;

/// 房间序列号分配器。
///
/// 同一房间的序列号在所有进程间严格递增，允许出现空洞。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait SequenceAllocator: Send + Sync {
    async fn next(&self, room_id: RoomId) -> Result<SequenceNumber, ApplicationError>;

    /// 当前已分配的最大序列号，从未分配时为 0
    async fn current(&self, room_id: RoomId) -> Result<SequenceNumber, ApplicationError>;
}

/// 基于 Redis `INCR` 的分布式序列号分配器
pub struct RedisSequenceAllocator {
    conn: ConnectionManager,
    key_prefix: String,
}

impl RedisSequenceAllocator {
    pub fn new(conn: ConnectionManager, key_prefix: impl Into<String>) -> Self {
        Self {
            conn,
            key_prefix: key_prefix.into(),
        }
    }

    /// 生成房间序列号键
    fn room_sequence_key(&self, room_id: RoomId) -> String {
        format!("{}{}", self.key_prefix, room_id)
    }
}

#[async_trait]
impl SequenceAllocator for RedisSequenceAllocator {
    async fn next(&self, room_id: RoomId) -> Result<SequenceNumber, ApplicationError> {
        let mut conn = self.conn.clone();
        let sequence: i64 = conn
            .incr(self.room_sequence_key(room_id), 1)
            .await
            .map_err(|e| {
                let message = format!("Redis INCR failed: {e}");
                ApplicationError::infrastructure_with_source(message, e)
            })?;
        Ok(sequence)
    }

    async fn current(&self, room_id: RoomId) -> Result<SequenceNumber, ApplicationError> {
        let mut conn = self.conn.clone();
        let sequence: Option<i64> = conn
            .get(self.room_sequence_key(room_id))
            .await
            .map_err(|e| {
                let message = format!("Redis GET failed: {e}");
                ApplicationError::infrastructure_with_source(message, e)
            })?;
        Ok(sequence.unwrap_or(0))
    }
}

pub mod memory {
    use super::*;
    use std::collections::HashMap;
    use std::sync::{Mutex, PoisonError};

    #[derive(Default)]
    pub struct MemorySequenceAllocator {
        counters: Mutex<HashMap<RoomId, SequenceNumber>>,
    }

    impl MemorySequenceAllocator {
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl SequenceAllocator for MemorySequenceAllocator {
        async fn next(&self, room_id: RoomId) -> Result<SequenceNumber, ApplicationError> {
            let mut counters = self.counters.lock().unwrap_or_else(PoisonError::into_inner);
            let counter = counters.entry(room_id).or_insert(0);
            *counter += 1;
            Ok(*counter)
        }

        async fn current(&self, room_id: RoomId) -> Result<SequenceNumber, ApplicationError> {
            Ok(self
                .counters
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&room_id)
                .copied()
                .unwrap_or(0))
        }
    }

}
