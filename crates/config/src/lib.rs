//! 统一配置中心
//!
//! 配置按以下顺序叠加，后者覆盖前者：
//! - 内置默认值
//! - YAML 配置文件（`CHATROOM_CONFIG`，默认 `config/chatroom.yaml`，不存在时跳过）
//! - `CHATROOM_` 前缀的环境变量，嵌套字段用 `__` 分隔，例如 `CHATROOM_REDIS__URL`

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// 配置文件路径的环境变量
pub const CONFIG_PATH_ENV: &str = "CHATROOM_CONFIG";
/// 默认配置文件路径
pub const DEFAULT_CONFIG_PATH: &str = "config/chatroom.yaml";
/// 环境变量前缀
pub const ENV_PREFIX: &str = "CHATROOM_";
/// 单页消息数上限
pub const MAX_PAGE_LIMIT: u32 = 1000;

/// 全局应用配置
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// 服务配置
    pub server: ServerConfig,
    /// Redis配置
    pub redis: RedisConfig,
    /// 跨进程分发配置
    pub fanout: FanoutConfig,
    /// 历史消息分页配置
    pub pagination: PaginationConfig,
}

/// 服务器配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// 进程标识，未配置时取 `HOSTNAME`
    pub server_id: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            server_id: None,
        }
    }
}

/// Redis配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    pub url: String,
    /// 单次发布的超时时间
    pub publish_timeout_ms: u64,
    /// 订阅连接断开后首次重连的等待时间，之后逐次翻倍
    pub reconnect_interval_ms: u64,
    pub max_reconnect_attempts: u32,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            publish_timeout_ms: 2000,
            reconnect_interval_ms: 500,
            max_reconnect_attempts: 5,
        }
    }
}

/// 房间消息分发与在线状态相关配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// 房间频道前缀，完整频道为 `<prefix><roomId>`
    pub room_channel_prefix: String,
    /// 在线用户快照频道
    pub presence_channel: String,
    /// 进程订阅登记表的键前缀，完整键为 `<prefix><serverId>`
    pub server_rooms_key_prefix: String,
    /// 房间序列号计数器的键前缀
    pub sequence_key_prefix: String,
    /// 在线用户哈希表的键
    pub presence_key: String,
    /// 去重窗口最多保留的消息 id 数
    pub dedup_capacity: usize,
    /// 去重记录的存活时间
    pub dedup_ttl_secs: u64,
    /// 去重记录清理间隔
    pub dedup_sweep_interval_secs: u64,
    /// 总线事件队列容量
    pub event_buffer: usize,
    /// 每个 WebSocket 连接的发送队列容量
    pub outbound_buffer: usize,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            room_channel_prefix: "chat.room.".to_string(),
            presence_channel: "online.users".to_string(),
            server_rooms_key_prefix: "chat:server:rooms:".to_string(),
            sequence_key_prefix: "chat:sequence:".to_string(),
            presence_key: "online.users".to_string(),
            dedup_capacity: 10_000,
            dedup_ttl_secs: 60,
            dedup_sweep_interval_secs: 10,
            event_buffer: 1024,
            outbound_buffer: 256,
        }
    }
}

/// 分页配置
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PaginationConfig {
    pub default_limit: u32,
    pub max_limit: u32,
}

impl Default for PaginationConfig {
    fn default() -> Self {
        Self {
            default_limit: 50,
            max_limit: 100,
        }
    }
}

impl AppConfig {
    /// 从默认位置加载配置并校验
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(path)
    }

    /// 从指定 YAML 文件加载配置，文件不存在时只使用默认值和环境变量
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let config: AppConfig = Self::figment(path.as_ref()).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::from(Serialized::defaults(AppConfig::default()))
            .merge(Yaml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// 服务绑定地址
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// 验证配置有效性
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis.url.trim().is_empty() {
            return Err(ConfigError::InvalidRedisConfig(
                "Redis URL cannot be empty".to_string(),
            ));
        }
        if self.redis.publish_timeout_ms == 0 {
            return Err(ConfigError::InvalidRedisConfig(
                "publish timeout must be greater than 0".to_string(),
            ));
        }
        if self.redis.reconnect_interval_ms == 0 {
            return Err(ConfigError::InvalidRedisConfig(
                "reconnect interval must be greater than 0".to_string(),
            ));
        }

        let fanout = &self.fanout;
        for (name, value) in [
            ("room_channel_prefix", &fanout.room_channel_prefix),
            ("presence_channel", &fanout.presence_channel),
            ("server_rooms_key_prefix", &fanout.server_rooms_key_prefix),
            ("sequence_key_prefix", &fanout.sequence_key_prefix),
            ("presence_key", &fanout.presence_key),
        ] {
            if value.trim().is_empty() {
                return Err(ConfigError::InvalidFanoutConfig(format!(
                    "{name} cannot be empty"
                )));
            }
        }
        if fanout.presence_channel.starts_with(&fanout.room_channel_prefix) {
            return Err(ConfigError::InvalidFanoutConfig(
                "presence_channel must not share the room channel prefix".to_string(),
            ));
        }
        if fanout.dedup_capacity == 0
            || fanout.dedup_ttl_secs == 0
            || fanout.dedup_sweep_interval_secs == 0
        {
            return Err(ConfigError::InvalidFanoutConfig(
                "dedup settings must be greater than 0".to_string(),
            ));
        }
        if fanout.event_buffer == 0 || fanout.outbound_buffer == 0 {
            return Err(ConfigError::InvalidFanoutConfig(
                "buffer sizes must be greater than 0".to_string(),
            ));
        }

        let pagination = &self.pagination;
        if pagination.max_limit == 0 || pagination.max_limit > MAX_PAGE_LIMIT {
            return Err(ConfigError::InvalidPaginationConfig(format!(
                "max_limit must be between 1 and {MAX_PAGE_LIMIT}"
            )));
        }
        if pagination.default_limit == 0 || pagination.default_limit > pagination.max_limit {
            return Err(ConfigError::InvalidPaginationConfig(
                "default_limit must be between 1 and max_limit".to_string(),
            ));
        }

        if let Some(id) = &self.server.server_id {
            if id.trim().is_empty() {
                return Err(ConfigError::InvalidServerConfig(
                    "server_id cannot be blank".to_string(),
                ));
            }
        }

        Ok(())
    }
}

/// 配置错误类型
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load configuration: {0}")]
    Load(#[from] figment::Error),
    #[error("Invalid Redis configuration: {0}")]
    InvalidRedisConfig(String),
    #[error("Invalid fanout configuration: {0}")]
    InvalidFanoutConfig(String),
    #[error("Invalid pagination configuration: {0}")]
    InvalidPaginationConfig(String),
    #[error("Invalid server configuration: {0}")]
    InvalidServerConfig(String),
}
