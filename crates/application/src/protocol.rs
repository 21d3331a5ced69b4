//! WebSocket 帧格式
//!
//! 入站与出站帧都是带 `type` 标签的 JSON 对象。

use domain::{ChatMessage, MessageType, RoomId};
use serde::{Deserialize, Serialize};

/// 客户端发来的帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncomingPayload {
    #[serde(rename_all = "camelCase")]
    SendMessage {
        #[serde(rename = "chatRoomId")]
        room_id: RoomId,
        #[serde(default)]
        message_type: MessageType,
        #[serde(default)]
        content: Option<String>,
    },
}

/// 下发给客户端的帧
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutgoingMessage {
    ChatMessage(ChatMessage),
    Error(ErrorFrame),
}

impl OutgoingMessage {
    pub fn error(room_id: Option<RoomId>, code: ErrorCode, message: impl Into<String>) -> Self {
        OutgoingMessage::Error(ErrorFrame {
            room_id,
            message: message.into(),
            code,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorFrame {
    #[serde(
        rename = "chatRoomId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub room_id: Option<RoomId>,
    pub message: String,
    pub code: ErrorCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessageFormat,
    InvalidArgument,
    NotRoomMember,
    InternalError,
}
