//! 聊天消息分发核心的领域模型
//!
//! 包含标识类型、聊天消息、在线用户等值对象，以及领域错误。

pub mod errors;
pub mod message;
pub mod user;
pub mod value_objects;

pub use errors::*;
pub use message::*;
pub use user::*;
pub use value_objects::*;
