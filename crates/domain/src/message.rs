use serde::{Deserialize, Serialize};

use crate::errors::DomainError;
use crate::value_objects::{MessageId, RoomId, SequenceNumber, Timestamp, UserId};

/// 消息内容最大长度（字符数）
pub const MAX_CONTENT_CHARS: usize = 4000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    #[default]
    Text,
    System,
}

/// 发送者的冗余展示信息，随消息一起持久化和下发
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SenderProfile {
    pub id: UserId,
    pub nickname: String,
    #[serde(default)]
    pub profile_image: Option<String>,
}

/// 已持久化的聊天消息。
///
/// 由持久化协作方创建并分配 `id` 与 `created_at`；编辑、软删除标记也只由协作方修改。
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub id: MessageId,
    #[serde(rename = "chatRoomId")]
    pub room_id: RoomId,
    pub sender: SenderProfile,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub sequence_number: SequenceNumber,
    pub created_at: Timestamp,
    pub is_edited: bool,
    pub is_deleted: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub edited_at: Option<Timestamp>,
}

/// 尚未持久化的消息，序列号已经分配
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub room_id: RoomId,
    pub sender_id: UserId,
    pub message_type: MessageType,
    pub content: Option<String>,
    pub sequence_number: SequenceNumber,
}

impl NewMessage {
    pub fn new(
        room_id: RoomId,
        sender_id: UserId,
        message_type: MessageType,
        content: Option<String>,
        sequence_number: SequenceNumber,
    ) -> Self {
        Self {
            room_id,
            sender_id,
            message_type,
            content,
            sequence_number,
        }
    }
}

/// 校验客户端提交的消息内容。
///
/// 文本消息必须有非空内容；系统消息允许为空。
pub fn validate_content(
    message_type: MessageType,
    content: Option<&str>,
) -> Result<Option<String>, DomainError> {
    let trimmed = content.map(str::trim).filter(|c| !c.is_empty());
    match (message_type, trimmed) {
        (MessageType::Text, None) => Err(DomainError::invalid_argument(
            "content",
            "cannot be empty",
        )),
        (_, Some(c)) if c.chars().count() > MAX_CONTENT_CHARS => {
            Err(DomainError::invalid_argument("content", "too long"))
        }
        (_, c) => Ok(c.map(str::to_owned)),
    }
}
