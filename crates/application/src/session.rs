//! 本进程的连接登记表
//!
//! 维护 用户 → 连接 和 房间 → 连接 两个索引，二者在同一把锁下一起修改。

use std::collections::{HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use domain::{ConnectionId, RoomId, UserId};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::protocol::OutgoingMessage;

/// 单个 WebSocket 连接的发送端。
///
/// 接收端由该 socket 的写任务持有；写任务退出后连接即视为关闭。
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    user_id: UserId,
    outbound: mpsc::Sender<String>,
}

/// 非阻塞发送的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// 发送队列已满，本帧被丢弃
    Full,
    Closed,
}

impl ConnectionHandle {
    pub fn new(user_id: UserId, outbound: mpsc::Sender<String>) -> Self {
        Self {
            id: ConnectionId::generate(),
            user_id,
            outbound,
        }
    }

    /// 创建连接句柄及其写端队列
    pub fn channel(user_id: UserId, buffer: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self::new(user_id, tx), rx)
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn is_open(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn try_send(&self, frame: String) -> SendOutcome {
        match self.outbound.try_send(frame) {
            Ok(()) => SendOutcome::Sent,
            Err(mpsc::error::TrySendError::Full(_)) => SendOutcome::Full,
            Err(mpsc::error::TrySendError::Closed(_)) => SendOutcome::Closed,
        }
    }
}

/// 移除一个连接后的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRemoval {
    pub connection_id: ConnectionId,
    pub user_id: UserId,
    /// 该用户在本进程已没有任何连接
    pub user_went_offline: bool,
    /// 因此变为空的房间，调用方应据此取消订阅
    pub emptied_rooms: Vec<RoomId>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryReport {
    pub delivered: usize,
    pub dropped: usize,
    pub removals: Vec<ConnectionRemoval>,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OnlineCheck {
    pub online: bool,
    pub reaped: Vec<ConnectionRemoval>,
}

#[derive(Debug, Default)]
struct SessionState {
    connections: HashMap<ConnectionId, ConnectionHandle>,
    by_user: HashMap<UserId, HashSet<ConnectionId>>,
    by_room: HashMap<RoomId, HashSet<ConnectionId>>,
    rooms_of_conn: HashMap<ConnectionId, HashSet<RoomId>>,
}

impl SessionState {
    fn remove(&mut self, connection_id: ConnectionId) -> Option<ConnectionRemoval> {
        let handle = self.connections.remove(&connection_id)?;
        let user_id = handle.user_id();

        let mut emptied_rooms = Vec::new();
        for room_id in self.rooms_of_conn.remove(&connection_id).unwrap_or_default() {
            if let Some(members) = self.by_room.get_mut(&room_id) {
                members.remove(&connection_id);
                if members.is_empty() {
                    self.by_room.remove(&room_id);
                    emptied_rooms.push(room_id);
                }
            }
        }

        let mut user_went_offline = false;
        if let Some(conns) = self.by_user.get_mut(&user_id) {
            conns.remove(&connection_id);
            if conns.is_empty() {
                self.by_user.remove(&user_id);
                user_went_offline = true;
            }
        }

        Some(ConnectionRemoval {
            connection_id,
            user_id,
            user_went_offline,
            emptied_rooms,
        })
    }

    fn user_handles(&self, user_id: UserId) -> Vec<ConnectionHandle> {
        self.by_user
            .get(&user_id)
            .into_iter()
            .flatten()
            .filter_map(|id| self.connections.get(id).cloned())
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct SessionRegistry {
    state: RwLock<SessionState>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, SessionState> {
        self.state.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, SessionState> {
        self.state.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// 登记连接，重复登记无副作用
    pub fn add_connection(&self, handle: ConnectionHandle) {
        let mut state = self.write();
        let id = handle.id();
        let user_id = handle.user_id();
        if state.connections.contains_key(&id) {
            return;
        }
        state.connections.insert(id, handle);
        state.by_user.entry(user_id).or_default().insert(id);
        debug!(connection_id = %id, user_id = %user_id, "连接已登记");
    }

    /// 移除连接，连接不存在时返回 `None`
    pub fn remove_connection(&self, connection_id: ConnectionId) -> Option<ConnectionRemoval> {
        let removal = self.write().remove(connection_id)?;
        debug!(
            connection_id = %connection_id,
            user_id = %removal.user_id,
            user_went_offline = removal.user_went_offline,
            emptied_rooms = removal.emptied_rooms.len(),
            "连接已移除"
        );
        Some(removal)
    }

    /// 把用户所有打开的连接加入房间。
    ///
    /// 当房间此前在本进程没有任何连接时返回 `true`。
    pub fn join_room(&self, user_id: UserId, room_id: RoomId) -> bool {
        let mut state = self.write();
        let open: Vec<ConnectionId> = state
            .user_handles(user_id)
            .into_iter()
            .filter(ConnectionHandle::is_open)
            .map(|handle| handle.id())
            .collect();
        if open.is_empty() {
            return false;
        }

        let was_empty = state.by_room.get(&room_id).map_or(true, HashSet::is_empty);
        let members = state.by_room.entry(room_id).or_default();
        members.extend(open.iter().copied());
        for id in open {
            state.rooms_of_conn.entry(id).or_default().insert(room_id);
        }
        was_empty
    }

    /// 把用户的连接移出房间，返回房间是否已空
    pub fn leave_room(&self, user_id: UserId, room_id: RoomId) -> bool {
        let mut state = self.write();
        let conns: Vec<ConnectionId> = state
            .by_user
            .get(&user_id)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default();

        for id in &conns {
            if let Some(rooms) = state.rooms_of_conn.get_mut(id) {
                rooms.remove(&room_id);
                if rooms.is_empty() {
                    state.rooms_of_conn.remove(id);
                }
            }
        }

        let Some(members) = state.by_room.get_mut(&room_id) else {
            return true;
        };
        for id in &conns {
            members.remove(id);
        }
        if members.is_empty() {
            state.by_room.remove(&room_id);
            true
        } else {
            false
        }
    }

    /// 向房间内本进程的所有连接投递一帧。
    ///
    /// 只序列化一次；已关闭的连接在遍历结束后统一移除并记入报告。
    pub fn deliver_local(
        &self,
        room_id: RoomId,
        message: &OutgoingMessage,
        exclude_user: Option<UserId>,
    ) -> DeliveryReport {
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                error!(room_id = %room_id, error = %e, "消息序列化失败");
                return DeliveryReport::default();
            }
        };

        let targets: Vec<ConnectionHandle> = {
            let state = self.read();
            state
                .by_room
                .get(&room_id)
                .into_iter()
                .flatten()
                .filter_map(|id| state.connections.get(id))
                .filter(|handle| Some(handle.user_id()) != exclude_user)
                .cloned()
                .collect()
        };

        let mut report = DeliveryReport::default();
        let mut closed = Vec::new();
        for handle in targets {
            match handle.try_send(frame.clone()) {
                SendOutcome::Sent => report.delivered += 1,
                SendOutcome::Full => {
                    report.dropped += 1;
                    warn!(
                        room_id = %room_id,
                        connection_id = %handle.id(),
                        "发送队列已满，丢弃消息"
                    );
                }
                SendOutcome::Closed => closed.push(handle.id()),
            }
        }

        report.removals = closed
            .into_iter()
            .filter_map(|id| self.remove_connection(id))
            .collect();
        report
    }

    /// 判断用户在本进程是否在线，顺带清理已关闭的连接
    pub fn is_online(&self, user_id: UserId) -> OnlineCheck {
        let handles = self.read().user_handles(user_id);
        let mut check = OnlineCheck::default();
        for handle in handles {
            if handle.is_open() {
                check.online = true;
            } else if let Some(removal) = self.remove_connection(handle.id()) {
                check.reaped.push(removal);
            }
        }
        check
    }

    /// 直接向单个连接发送一帧
    pub fn send_to_connection(
        &self,
        connection_id: ConnectionId,
        message: &OutgoingMessage,
    ) -> SendOutcome {
        let Some(handle) = self.read().connections.get(&connection_id).cloned() else {
            return SendOutcome::Closed;
        };
        match serde_json::to_string(message) {
            Ok(frame) => handle.try_send(frame),
            Err(e) => {
                error!(connection_id = %connection_id, error = %e, "消息序列化失败");
                SendOutcome::Full
            }
        }
    }

    pub fn has_local_connections(&self, room_id: RoomId) -> bool {
        self.read()
            .by_room
            .get(&room_id)
            .is_some_and(|members| !members.is_empty())
    }

    pub fn is_in_room(&self, room_id: RoomId, user_id: UserId) -> bool {
        let state = self.read();
        let Some(members) = state.by_room.get(&room_id) else {
            return false;
        };
        state
            .by_user
            .get(&user_id)
            .is_some_and(|conns| conns.iter().any(|id| members.contains(id)))
    }

    pub fn rooms_of(&self, user_id: UserId) -> Vec<RoomId> {
        let state = self.read();
        let mut rooms: HashSet<RoomId> = HashSet::new();
        for id in state.by_user.get(&user_id).into_iter().flatten() {
            if let Some(joined) = state.rooms_of_conn.get(id) {
                rooms.extend(joined.iter().copied());
            }
        }
        rooms.into_iter().collect()
    }

    pub fn local_rooms(&self) -> Vec<RoomId> {
        self.read().by_room.keys().copied().collect()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.read().connections.keys().copied().collect()
    }

    pub fn connection_count(&self) -> usize {
        self.read().connections.len()
    }

    pub fn user_connection_count(&self, user_id: UserId) -> usize {
        self.read().by_user.get(&user_id).map_or(0, HashSet::len)
    }
}
