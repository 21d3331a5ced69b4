//! Redis 错误类型定义

use application::BusError;
use thiserror::Error;

/// Redis 总线操作错误
#[derive(Error, Debug)]
pub enum RedisBusError {
    /// 配置错误
    #[error("Redis 配置错误: {message}")]
    Config { message: String },

    /// 连接错误
    #[error("Redis 连接错误: {message}")]
    Connection { message: String },

    /// 发布错误
    #[error("Redis 发布错误: {message}")]
    Publish { message: String },

    /// 订阅错误
    #[error("Redis 订阅错误: {message}")]
    Subscribe { message: String },

    /// 订阅连接已关闭
    #[error("Redis 订阅连接已关闭")]
    Closed,
}

/// Redis 结果类型
pub type RedisBusResult<T> = Result<T, RedisBusError>;

impl From<::redis::RedisError> for RedisBusError {
    fn from(err: ::redis::RedisError) -> Self {
        match err.kind() {
            ::redis::ErrorKind::InvalidClientConfig => RedisBusError::Config {
                message: err.to_string(),
            },
            _ => RedisBusError::Connection {
                message: err.to_string(),
            },
        }
    }
}

impl From<RedisBusError> for BusError {
    fn from(err: RedisBusError) -> Self {
        match err {
            RedisBusError::Config { message } | RedisBusError::Connection { message } => {
                BusError::Connection(message)
            }
            RedisBusError::Publish { message } => BusError::Publish(message),
            RedisBusError::Subscribe { message } => BusError::Subscribe(message),
            RedisBusError::Closed => BusError::Closed,
        }
    }
}
