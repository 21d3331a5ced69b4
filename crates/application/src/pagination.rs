//! 基于序列号游标的历史消息分页

use std::sync::Arc;

use config::PaginationConfig;
use domain::{ChatMessage, RoomId, SequenceNumber, UserId};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::ApplicationError;
use crate::repository::{MembershipChecker, MessageStore};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    /// 比游标更早的消息
    #[default]
    Before,
    /// 比游标更新的消息
    After,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePageRequest {
    #[serde(rename = "chatRoomId")]
    pub room_id: RoomId,
    #[serde(default)]
    pub cursor: Option<SequenceNumber>,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub direction: Direction,
}

impl MessagePageRequest {
    pub fn latest(room_id: RoomId) -> Self {
        Self {
            room_id,
            cursor: None,
            limit: None,
            direction: Direction::Before,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePage {
    pub messages: Vec<ChatMessage>,
    pub next_cursor: Option<SequenceNumber>,
    pub prev_cursor: Option<SequenceNumber>,
    /// 游标方向上还有更多消息
    pub has_next: bool,
    pub has_prev: bool,
}

pub struct CursorPaginator {
    store: Arc<dyn MessageStore>,
    membership: Arc<dyn MembershipChecker>,
    default_limit: u32,
    max_limit: u32,
}

impl CursorPaginator {
    pub fn new(
        store: Arc<dyn MessageStore>,
        membership: Arc<dyn MembershipChecker>,
        config: &PaginationConfig,
    ) -> Self {
        Self {
            store,
            membership,
            default_limit: config.default_limit,
            max_limit: config.max_limit.max(1),
        }
    }

    pub fn effective_limit(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_limit)
            .clamp(1, self.max_limit)
    }

    pub async fn page(&self, request: &MessagePageRequest) -> Result<MessagePage, ApplicationError> {
        let limit = self.effective_limit(request.limit);
        let room_id = request.room_id;

        // 多取一条判断是否还有下一页
        let fetch = limit.saturating_add(1);
        let mut messages = match (request.cursor, request.direction) {
            (None, _) => self.store.find_latest(room_id, fetch).await?,
            (Some(cursor), Direction::Before) => {
                self.store.find_before(room_id, cursor, fetch).await?
            }
            (Some(cursor), Direction::After) => {
                self.store.find_after(room_id, cursor, fetch).await?
            }
        };
        let has_next = messages.len() > limit as usize;
        messages.truncate(limit as usize);

        debug!(
            room_id = %room_id,
            cursor = ?request.cursor,
            direction = ?request.direction,
            limit,
            returned = messages.len(),
            "历史消息分页"
        );

        Ok(MessagePage {
            next_cursor: messages.last().map(|m| m.sequence_number),
            prev_cursor: messages.first().map(|m| m.sequence_number),
            has_next,
            has_prev: request.cursor.is_some(),
            messages,
        })
    }

    /// 先校验读取者是房间成员
    pub async fn page_for(
        &self,
        reader: UserId,
        request: &MessagePageRequest,
    ) -> Result<MessagePage, ApplicationError> {
        if !self.membership.is_member(request.room_id, reader).await? {
            return Err(ApplicationError::not_room_member(request.room_id, reader));
        }
        self.page(request).await
    }
}
