//! 基础设施层实现。
//!
//! 提供基于 Redis Pub/Sub 的跨进程消息总线，实现应用层的 [`application::MessageBus`]。

pub mod redis;

pub use self::redis::{
    ReconnectPolicy, RedisBusError, RedisBusResult, RedisMessageBus, RedisPublisher,
    RedisSubscriber,
};
