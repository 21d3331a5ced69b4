//! Redis Pub/Sub 模块
//!
//! 发布走共享的 [`::redis::aio::ConnectionManager`]，订阅使用独立的 Pub/Sub 连接，
//! 断线后按退避策略重连并恢复全部已订阅频道。

pub mod bus;
pub mod error;
pub mod publisher;
pub mod subscriber;

pub use bus::RedisMessageBus;
pub use error::{RedisBusError, RedisBusResult};
pub use publisher::RedisPublisher;
pub use subscriber::{ReconnectPolicy, RedisSubscriber};
