//! Web API 层。
//!
//! 提供 Axum 路由：聊天与在线列表两个 WebSocket 端点、历史消息查询，
//! 全部委托给应用层的 [`application::ChatGateway`]。

mod error;
mod routes;
mod state;
mod ws_connection;

pub use error::{ApiError, ErrorBody};
pub use routes::router;
pub use state::AppState;
pub use ws_connection::{ConnectionKind, WebSocketConnection};
