use async_trait::async_trait;
use domain::{ChatMessage, NewMessage, RepositoryError, RoomId, SequenceNumber, UserId};

/// 消息持久化协作方。
///
/// 所有读取只返回未删除的消息。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageStore: Send + Sync {
    // 保存消息，由存储方分配 id 与创建时间，并填充发送者资料
    async fn save(&self, message: NewMessage) -> Result<ChatMessage, RepositoryError>;

    // 最新的若干条，按序列号降序
    async fn find_latest(
        &self,
        room_id: RoomId,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, RepositoryError>;

    // 序列号小于 cursor 的若干条，按序列号降序
    async fn find_before(
        &self,
        room_id: RoomId,
        cursor: SequenceNumber,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, RepositoryError>;

    // 序列号大于 cursor 的若干条，按序列号升序
    async fn find_after(
        &self,
        room_id: RoomId,
        cursor: SequenceNumber,
        limit: u32,
    ) -> Result<Vec<ChatMessage>, RepositoryError>;
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MembershipChecker: Send + Sync {
    async fn is_member(&self, room_id: RoomId, user_id: UserId) -> Result<bool, RepositoryError>;
}

/// 房间成员关系的写入方，加入或离开房间时调用
#[async_trait]
pub trait MembershipEditor: Send + Sync {
    /// 返回用户此前是否不在房间内
    async fn insert_member(&self, room_id: RoomId, user_id: UserId)
        -> Result<bool, RepositoryError>;

    /// 返回用户此前是否在房间内
    async fn delete_member(&self, room_id: RoomId, user_id: UserId)
        -> Result<bool, RepositoryError>;
}

/// 用户所属房间列表，连接建立时用于恢复房间订阅
#[async_trait]
pub trait RoomDirectory: Send + Sync {
    async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>, RepositoryError>;
}

pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, PoisonError, RwLock};

    use domain::{MessageId, SenderProfile};

    use crate::clock::{Clock, SystemClock};

    /// 内存消息存储，开发与测试用
    pub struct MemoryMessageStore {
        messages: RwLock<HashMap<RoomId, Vec<ChatMessage>>>,
        profiles: RwLock<HashMap<UserId, SenderProfile>>,
        clock: Arc<dyn Clock>,
    }

    impl Default for MemoryMessageStore {
        fn default() -> Self {
            Self::new(Arc::new(SystemClock))
        }
    }

    impl MemoryMessageStore {
        pub fn new(clock: Arc<dyn Clock>) -> Self {
            Self {
                messages: RwLock::new(HashMap::new()),
                profiles: RwLock::new(HashMap::new()),
                clock,
            }
        }

        pub fn register_profile(&self, profile: SenderProfile) {
            self.profiles
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(profile.id, profile);
        }

        fn profile_of(&self, user_id: UserId) -> SenderProfile {
            self.profiles
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&user_id)
                .cloned()
                .unwrap_or_else(|| SenderProfile {
                    id: user_id,
                    nickname: user_id.to_string(),
                    profile_image: None,
                })
        }

        /// 软删除一条消息
        pub fn mark_deleted(&self, room_id: RoomId, message_id: MessageId) -> bool {
            let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
            let Some(found) = messages
                .get_mut(&room_id)
                .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
            else {
                return false;
            };
            found.is_deleted = true;
            true
        }

        fn query<F>(&self, room_id: RoomId, filter: F) -> Vec<ChatMessage>
        where
            F: Fn(&ChatMessage) -> bool,
        {
            self.messages
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&room_id)
                .into_iter()
                .flatten()
                .filter(|m| !m.is_deleted && filter(m))
                .cloned()
                .collect()
        }

        fn descending(mut list: Vec<ChatMessage>, limit: u32) -> Vec<ChatMessage> {
            list.sort_by(|a, b| b.sequence_number.cmp(&a.sequence_number));
            list.truncate(limit as usize);
            list
        }
    }

    #[async_trait]
    impl MessageStore for MemoryMessageStore {
        async fn save(&self, message: NewMessage) -> Result<ChatMessage, RepositoryError> {
            let saved = ChatMessage {
                id: MessageId::generate(),
                room_id: message.room_id,
                sender: self.profile_of(message.sender_id),
                message_type: message.message_type,
                content: message.content,
                sequence_number: message.sequence_number,
                created_at: self.clock.now(),
                is_edited: false,
                is_deleted: false,
                edited_at: None,
            };

            let mut messages = self.messages.write().unwrap_or_else(PoisonError::into_inner);
            let room = messages.entry(saved.room_id).or_default();
            if room
                .iter()
                .any(|m| m.sequence_number == saved.sequence_number)
            {
                return Err(RepositoryError::Conflict);
            }
            room.push(saved.clone());
            Ok(saved)
        }

        async fn find_latest(
            &self,
            room_id: RoomId,
            limit: u32,
        ) -> Result<Vec<ChatMessage>, RepositoryError> {
            Ok(Self::descending(self.query(room_id, |_| true), limit))
        }

        async fn find_before(
            &self,
            room_id: RoomId,
            cursor: SequenceNumber,
            limit: u32,
        ) -> Result<Vec<ChatMessage>, RepositoryError> {
            Ok(Self::descending(
                self.query(room_id, |m| m.sequence_number < cursor),
                limit,
            ))
        }

        async fn find_after(
            &self,
            room_id: RoomId,
            cursor: SequenceNumber,
            limit: u32,
        ) -> Result<Vec<ChatMessage>, RepositoryError> {
            let mut list = self.query(room_id, |m| m.sequence_number > cursor);
            list.sort_by_key(|m| m.sequence_number);
            list.truncate(limit as usize);
            Ok(list)
        }
    }

    /// 内存房间成员表，同时充当成员校验和房间目录
    #[derive(Default)]
    pub struct MemoryMembership {
        members: RwLock<HashMap<RoomId, HashSet<UserId>>>,
    }

    impl MemoryMembership {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn add_member(&self, room_id: RoomId, user_id: UserId) {
            self.members
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(room_id)
                .or_default()
                .insert(user_id);
        }

        pub fn remove_member(&self, room_id: RoomId, user_id: UserId) -> bool {
            self.members
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .get_mut(&room_id)
                .is_some_and(|set| set.remove(&user_id))
        }
    }

    #[async_trait]
    impl MembershipChecker for MemoryMembership {
        async fn is_member(
            &self,
            room_id: RoomId,
            user_id: UserId,
        ) -> Result<bool, RepositoryError> {
            Ok(self
                .members
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&room_id)
                .is_some_and(|set| set.contains(&user_id)))
        }
    }

    #[async_trait]
    impl MembershipEditor for MemoryMembership {
        async fn insert_member(
            &self,
            room_id: RoomId,
            user_id: UserId,
        ) -> Result<bool, RepositoryError> {
            Ok(self
                .members
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .entry(room_id)
                .or_default()
                .insert(user_id))
        }

        async fn delete_member(
            &self,
            room_id: RoomId,
            user_id: UserId,
        ) -> Result<bool, RepositoryError> {
            Ok(self.remove_member(room_id, user_id))
        }
    }

    #[async_trait]
    impl RoomDirectory for MemoryMembership {
        async fn rooms_for_user(&self, user_id: UserId) -> Result<Vec<RoomId>, RepositoryError> {
            Ok(self
                .members
                .read()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .filter(|(_, users)| users.contains(&user_id))
                .map(|(room, _)| *room)
                .collect())
        }
    }

}
