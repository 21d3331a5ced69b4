//! 连接生命周期与消息发送的编排入口
//!
//! WebSocket 层只和 [`ChatGateway`] 打交道：连接建立、断开、收到文本帧、查询历史。

use std::sync::Arc;

use domain::{ChatMessage, ConnectionId, MessageType, NewMessage, OnlineUser, RoomId, UserId};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{FanoutEvent, RoomFanoutBroker};
use crate::error::ApplicationError;
use crate::pagination::{CursorPaginator, MessagePage, MessagePageRequest};
use crate::presence::{PresenceRegistry, PresenceWatchers};
use crate::protocol::{ErrorCode, IncomingPayload, OutgoingMessage};
use crate::repository::{MembershipChecker, MessageStore};
use crate::sequencer::SequenceAllocator;
use crate::session::{ConnectionHandle, ConnectionRemoval, SendOutcome, SessionRegistry};

#[derive(Debug, Clone)]
pub struct SendMessageCommand {
    pub room_id: RoomId,
    pub message_type: MessageType,
    pub content: Option<String>,
}

pub struct ChatGatewayDependencies {
    pub registry: Arc<SessionRegistry>,
    pub broker: Arc<RoomFanoutBroker>,
    pub presence: Arc<PresenceRegistry>,
    pub watchers: Arc<PresenceWatchers>,
    pub sequencer: Arc<dyn SequenceAllocator>,
    pub store: Arc<dyn MessageStore>,
    pub membership: Arc<dyn MembershipChecker>,
    pub paginator: Arc<CursorPaginator>,
}

pub struct ChatGateway {
    deps: ChatGatewayDependencies,
}

impl ChatGateway {
    pub fn new(deps: ChatGatewayDependencies) -> Self {
        Self { deps }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.deps.registry
    }

    pub fn broker(&self) -> &Arc<RoomFanoutBroker> {
        &self.deps.broker
    }

    pub fn watchers(&self) -> &Arc<PresenceWatchers> {
        &self.deps.watchers
    }

    /// 登记新连接，加入其所属房间并标记用户在线
    pub async fn connect(&self, handle: ConnectionHandle, profile: OnlineUser, rooms: &[RoomId]) {
        let user_id = handle.user_id();
        let connection_id = handle.id();
        self.deps.registry.add_connection(handle);

        for &room_id in rooms {
            self.join_local(user_id, room_id).await;
        }

        if let Err(e) = self.deps.presence.mark_online(profile).await {
            warn!(user_id = %user_id, error = %e, "更新在线状态失败");
        }
        info!(
            connection_id = %connection_id,
            user_id = %user_id,
            rooms = rooms.len(),
            "聊天连接已建立"
        );
    }

    /// 断开连接，重复调用无副作用
    pub async fn disconnect(&self, connection_id: ConnectionId) -> bool {
        let Some(removal) = self.deps.registry.remove_connection(connection_id) else {
            return false;
        };
        info!(
            connection_id = %connection_id,
            user_id = %removal.user_id,
            "聊天连接已断开"
        );
        self.settle(vec![removal]).await;
        true
    }

    /// 关闭本进程持有的全部连接，并释放本进程登记的在线用户。
    ///
    /// 必须在停止 broker 之前调用，下线快照才能广播出去。
    pub async fn shutdown(&self) {
        let connections = self.deps.registry.connection_ids();
        for &connection_id in &connections {
            self.disconnect(connection_id).await;
        }
        self.deps.watchers.clear();
        if let Err(e) = self.deps.presence.release_local().await {
            warn!(error = %e, "释放本进程在线用户失败");
        }
        info!(connections = connections.len(), "网关已关闭");
    }

    /// 用户加入房间后调用，返回是否是本进程的第一个连接
    pub async fn join_room(&self, user_id: UserId, room_id: RoomId) -> bool {
        self.join_local(user_id, room_id).await
    }

    /// 用户离开房间后调用
    pub async fn leave_room(&self, user_id: UserId, room_id: RoomId) {
        if self.deps.registry.leave_room(user_id, room_id) {
            self.release_room(room_id).await;
        }
    }

    async fn join_local(&self, user_id: UserId, room_id: RoomId) -> bool {
        let first = self.deps.registry.join_room(user_id, room_id);
        // 不只在首个连接时订阅：之前失败的订阅由后来的加入者补上
        if self.deps.registry.is_in_room(room_id, user_id) {
            if let Err(e) = self.deps.broker.subscribe(room_id).await {
                warn!(room_id = %room_id, error = %e, "订阅房间频道失败");
            }
        }
        first
    }

    async fn release_room(&self, room_id: RoomId) {
        let registry = Arc::clone(&self.deps.registry);
        let released = self
            .deps
            .broker
            .unsubscribe_unless(room_id, move || registry.has_local_connections(room_id))
            .await;
        if let Err(e) = released {
            warn!(room_id = %room_id, error = %e, "取消订阅房间频道失败");
        }
    }

    /// 处理连接移除后的善后：释放空房间，用户完全离线时更新在线状态
    async fn settle(&self, removals: Vec<ConnectionRemoval>) {
        let mut pending = removals;
        while let Some(removal) = pending.pop() {
            for room_id in removal.emptied_rooms {
                self.release_room(room_id).await;
            }

            if !removal.user_went_offline {
                continue;
            }
            // 期间可能又建立了新连接
            let check = self.deps.registry.is_online(removal.user_id);
            pending.extend(check.reaped);
            if check.online {
                continue;
            }
            if let Err(e) = self.deps.presence.mark_offline(removal.user_id).await {
                warn!(user_id = %removal.user_id, error = %e, "更新离线状态失败");
            }
        }
    }

    /// 发送一条聊天消息。
    ///
    /// 本地投递在发布到总线之前完成，总线失败不影响已投递的本地连接。
    pub async fn send_message(
        &self,
        sender_id: UserId,
        command: SendMessageCommand,
    ) -> Result<ChatMessage, ApplicationError> {
        let room_id = command.room_id;
        if !self.deps.membership.is_member(room_id, sender_id).await? {
            return Err(ApplicationError::not_room_member(room_id, sender_id));
        }

        let content = domain::validate_content(command.message_type, command.content.as_deref())?;
        let sequence_number = self.deps.sequencer.next(room_id).await?;
        let saved = self
            .deps
            .store
            .save(NewMessage::new(
                room_id,
                sender_id,
                command.message_type,
                content,
                sequence_number,
            ))
            .await?;

        let frame = OutgoingMessage::ChatMessage(saved.clone());
        let report = self.deps.registry.deliver_local(room_id, &frame, None);
        debug!(
            room_id = %room_id,
            sequence_number,
            delivered = report.delivered,
            "消息已在本地投递"
        );
        self.settle(report.removals).await;

        let broker = &self.deps.broker;
        broker
            .publish(room_id, &saved, Some(broker.server_id()))
            .await;
        Ok(saved)
    }

    /// 处理客户端发来的一个文本帧，错误只回给该连接
    pub async fn handle_text_frame(
        &self,
        connection_id: ConnectionId,
        user_id: UserId,
        text: &str,
    ) {
        let payload = match serde_json::from_str::<IncomingPayload>(text) {
            Ok(payload) => payload,
            Err(e) => {
                debug!(connection_id = %connection_id, error = %e, "无法解析客户端消息");
                self.reply_error(
                    connection_id,
                    None,
                    ErrorCode::InvalidMessageFormat,
                    "Invalid message format".to_string(),
                )
                .await;
                return;
            }
        };

        match payload {
            IncomingPayload::SendMessage {
                room_id,
                message_type,
                content,
            } => {
                let command = SendMessageCommand {
                    room_id,
                    message_type,
                    content,
                };
                if let Err(err) = self.send_message(user_id, command).await {
                    let code = err.error_code();
                    let message = if code == ErrorCode::InternalError {
                        error!(room_id = %room_id, user_id = %user_id, error = %err, "发送消息失败");
                        "Internal server error".to_string()
                    } else {
                        debug!(room_id = %room_id, user_id = %user_id, error = %err, "拒绝发送消息");
                        err.to_string()
                    };
                    self.reply_error(connection_id, Some(room_id), code, message)
                        .await;
                }
            }
        }
    }

    async fn reply_error(
        &self,
        connection_id: ConnectionId,
        room_id: Option<RoomId>,
        code: ErrorCode,
        message: String,
    ) {
        let frame = OutgoingMessage::error(room_id, code, message);
        if self.deps.registry.send_to_connection(connection_id, &frame) == SendOutcome::Closed {
            self.disconnect(connection_id).await;
        }
    }

    pub async fn history(
        &self,
        reader: UserId,
        request: &MessagePageRequest,
    ) -> Result<MessagePage, ApplicationError> {
        self.deps.paginator.page_for(reader, request).await
    }

    /// 订阅在线用户列表，并立即推送一次当前快照
    pub async fn watch_presence(&self, handle: ConnectionHandle) {
        match self.deps.presence.snapshot().await {
            Ok(users) => {
                self.deps.watchers.send_snapshot(&handle, &users);
            }
            Err(e) => warn!(error = %e, "读取在线用户快照失败"),
        }
        self.deps.watchers.add(handle);
    }

    pub fn unwatch_presence(&self, connection_id: ConnectionId) -> bool {
        self.deps.watchers.remove(connection_id)
    }

    /// 启动事件分发循环，把总线事件投递到本进程的连接
    pub fn spawn_dispatcher(
        self: &Arc<Self>,
        mut events: mpsc::Receiver<FanoutEvent>,
    ) -> JoinHandle<()> {
        let gateway = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                gateway.dispatch(event).await;
            }
            debug!("事件分发循环结束");
        })
    }

    pub async fn dispatch(&self, event: FanoutEvent) {
        match event {
            FanoutEvent::Room(delivery) => {
                let room_id = delivery.room_id;
                let frame = OutgoingMessage::ChatMessage(delivery.message);
                let report = self.deps.registry.deliver_local(room_id, &frame, None);
                debug!(room_id = %room_id, delivered = report.delivered, "远端消息已投递");
                self.settle(report.removals).await;
            }
            FanoutEvent::Presence(users) => {
                let delivered = self.deps.watchers.broadcast(&users);
                debug!(online = users.len(), delivered, "在线用户快照已推送");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerSettings;
    use crate::bus::memory::InMemoryBusHub;
    use crate::presence::memory::MemoryPresenceStore;
    use crate::presence::PresenceStore;
    use crate::repository::memory::{MemoryMembership, MemoryMessageStore};
    use crate::repository::MockMembershipChecker;
    use crate::sequencer::memory::MemorySequenceAllocator;
    use crate::server_rooms::memory::MemorySubscriptionRegistry;
    use config::PaginationConfig;
    use domain::{RepositoryError, ServerId};
    use serde_json::Value;
    use uuid::Uuid;

    struct Fixture {
        gateway: Arc<ChatGateway>,
        membership: Arc<MemoryMembership>,
        presence_store: Arc<MemoryPresenceStore>,
        hub: Arc<InMemoryBusHub>,
        _events: mpsc::Receiver<FanoutEvent>,
    }

    fn fixture_with(membership_checker: Option<Arc<dyn MembershipChecker>>) -> Fixture {
        let hub = InMemoryBusHub::new();
        let (tx, rx) = mpsc::channel(16);
        let broker = Arc::new(RoomFanoutBroker::new(
            ServerId::new("node-a"),
            Arc::new(hub.connect()),
            Arc::new(MemorySubscriptionRegistry::new()),
            BrokerSettings::default(),
            tx,
        ));
        let store: Arc<dyn MessageStore> = Arc::new(MemoryMessageStore::default());
        let membership = Arc::new(MemoryMembership::new());
        let presence_store = Arc::new(MemoryPresenceStore::new());
        let checker: Arc<dyn MembershipChecker> = match membership_checker {
            Some(checker) => checker,
            None => membership.clone(),
        };
        let paginator = Arc::new(CursorPaginator::new(
            store.clone(),
            checker.clone(),
            &PaginationConfig::default(),
        ));
        let gateway = Arc::new(ChatGateway::new(ChatGatewayDependencies {
            registry: Arc::new(SessionRegistry::new()),
            presence: Arc::new(PresenceRegistry::new(
                presence_store.clone(),
                broker.clone(),
            )),
            broker,
            watchers: Arc::new(PresenceWatchers::new()),
            sequencer: Arc::new(MemorySequenceAllocator::new()),
            store,
            membership: checker,
            paginator,
        }));
        Fixture {
            gateway,
            membership,
            presence_store,
            hub,
            _events: rx,
        }
    }

    fn fixture() -> Fixture {
        fixture_with(None)
    }

    fn profile(user_id: UserId) -> OnlineUser {
        OnlineUser::new(user_id, "tester", None)
    }

    #[tokio::test]
    async fn connect_subscribes_and_last_disconnect_releases() {
        let fx = fixture();
        let user = UserId::from(Uuid::new_v4());
        let room = RoomId::from(Uuid::new_v4());
        let channel = fx.gateway.broker().room_channel(room);

        let (first, _rx1) = ConnectionHandle::channel(user, 8);
        let (second, _rx2) = ConnectionHandle::channel(user, 8);
        let (first_id, second_id) = (first.id(), second.id());
        fx.gateway.connect(first, profile(user), &[room]).await;
        fx.gateway.connect(second, profile(user), &[room]).await;
        assert_eq!(fx.hub.subscriber_count(&channel), 1);

        assert!(fx.gateway.disconnect(first_id).await);
        assert_eq!(fx.hub.subscriber_count(&channel), 1);

        assert!(fx.gateway.disconnect(second_id).await);
        assert!(!fx.gateway.disconnect(second_id).await);
        assert_eq!(fx.hub.subscriber_count(&channel), 0);
        assert!(!fx.gateway.broker().is_subscribed(room).await);
    }

    #[tokio::test]
    async fn failed_subscribe_is_retried_by_the_next_joiner() {
        let fx = fixture();
        let (alice, bob) = (UserId::from(Uuid::new_v4()), UserId::from(Uuid::new_v4()));
        let room = RoomId::from(Uuid::new_v4());
        let channel = fx.gateway.broker().room_channel(room);

        fx.hub.set_subscribe_failure(true);
        let (a, _a_rx) = ConnectionHandle::channel(alice, 8);
        fx.gateway.connect(a, profile(alice), &[room]).await;
        assert!(fx.gateway.registry().has_local_connections(room));
        assert!(!fx.gateway.broker().is_subscribed(room).await);

        fx.hub.set_subscribe_failure(false);
        let (b, _b_rx) = ConnectionHandle::channel(bob, 8);
        fx.gateway.connect(b, profile(bob), &[room]).await;
        assert!(fx.gateway.broker().is_subscribed(room).await);
        assert_eq!(fx.hub.subscriber_count(&channel), 1);
    }

    #[tokio::test]
    async fn join_and_leave_drive_room_subscription() {
        let fx = fixture();
        let (alice, bob) = (UserId::from(Uuid::new_v4()), UserId::from(Uuid::new_v4()));
        let room = RoomId::from(Uuid::new_v4());
        let channel = fx.gateway.broker().room_channel(room);

        let (a, _a_rx) = ConnectionHandle::channel(alice, 8);
        let (b, _b_rx) = ConnectionHandle::channel(bob, 8);
        fx.gateway.connect(a, profile(alice), &[]).await;
        fx.gateway.connect(b, profile(bob), &[]).await;
        assert_eq!(fx.hub.subscriber_count(&channel), 0);

        assert!(fx.gateway.join_room(alice, room).await);
        assert!(!fx.gateway.join_room(bob, room).await);
        assert!(fx.gateway.broker().is_subscribed(room).await);
        assert!(fx.gateway.registry().is_in_room(room, bob));

        fx.gateway.leave_room(alice, room).await;
        assert!(fx.gateway.broker().is_subscribed(room).await);
        assert!(!fx.gateway.registry().is_in_room(room, alice));

        fx.gateway.leave_room(bob, room).await;
        assert!(!fx.gateway.broker().is_subscribed(room).await);
        assert_eq!(fx.hub.subscriber_count(&channel), 0);
    }

    #[tokio::test]
    async fn join_without_local_connection_does_not_subscribe() {
        let fx = fixture();
        let room = RoomId::from(Uuid::new_v4());
        assert!(!fx.gateway.join_room(UserId::from(Uuid::new_v4()), room).await);
        assert!(!fx.gateway.broker().is_subscribed(room).await);
    }

    #[tokio::test]
    async fn shutdown_releases_connections_rooms_and_presence() {
        let fx = fixture();
        let (alice, bob) = (UserId::from(Uuid::new_v4()), UserId::from(Uuid::new_v4()));
        let room = RoomId::from(Uuid::new_v4());
        let (a, _a_rx) = ConnectionHandle::channel(alice, 8);
        let (b, _b_rx) = ConnectionHandle::channel(bob, 8);
        fx.gateway.connect(a, profile(alice), &[room]).await;
        fx.gateway.connect(b, profile(bob), &[room]).await;
        let (watcher, _w_rx) = ConnectionHandle::channel(UserId::from(Uuid::new_v4()), 8);
        fx.gateway.watch_presence(watcher).await;
        assert_eq!(fx.presence_store.list().await.unwrap().len(), 2);

        fx.gateway.shutdown().await;
        assert_eq!(fx.gateway.registry().connection_count(), 0);
        assert!(fx.gateway.watchers().is_empty());
        assert!(!fx.gateway.broker().is_subscribed(room).await);
        assert!(fx.presence_store.list().await.unwrap().is_empty());
        assert_eq!(fx.presence_store.holder_count(alice), 0);
    }

    #[tokio::test]
    async fn send_message_assigns_sequence_and_delivers_locally() {
        let fx = fixture();
        let (alice, bob) = (UserId::from(Uuid::new_v4()), UserId::from(Uuid::new_v4()));
        let room = RoomId::from(Uuid::new_v4());
        fx.membership.add_member(room, alice);
        fx.membership.add_member(room, bob);

        let (a, mut a_rx) = ConnectionHandle::channel(alice, 8);
        let (b, mut b_rx) = ConnectionHandle::channel(bob, 8);
        fx.gateway.connect(a, profile(alice), &[room]).await;
        fx.gateway.connect(b, profile(bob), &[room]).await;

        for expected in 1..=2 {
            let saved = fx
                .gateway
                .send_message(
                    alice,
                    SendMessageCommand {
                        room_id: room,
                        message_type: MessageType::Text,
                        content: Some(format!("hello {expected}")),
                    },
                )
                .await
                .unwrap();
            assert_eq!(saved.sequence_number, expected);
        }

        for rx in [&mut a_rx, &mut b_rx] {
            let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
            assert_eq!(frame["type"], "CHAT_MESSAGE");
            assert_eq!(frame["sequenceNumber"], 1);
        }
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let fx = fixture();
        let user = UserId::from(Uuid::new_v4());
        let (conn, mut rx) = ConnectionHandle::channel(user, 8);
        let conn_id = conn.id();
        fx.gateway.connect(conn, profile(user), &[]).await;

        fx.gateway.handle_text_frame(conn_id, user, "{oops").await;
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["type"], "ERROR");
        assert_eq!(frame["code"], "INVALID_MESSAGE_FORMAT");
    }

    #[tokio::test]
    async fn non_member_send_is_rejected_with_code() {
        let fx = fixture();
        let user = UserId::from(Uuid::new_v4());
        let room = RoomId::from(Uuid::new_v4());
        let (conn, mut rx) = ConnectionHandle::channel(user, 8);
        let conn_id = conn.id();
        fx.gateway.connect(conn, profile(user), &[]).await;

        let text = serde_json::json!({
            "type": "SEND_MESSAGE",
            "chatRoomId": room,
            "content": "hi",
        })
        .to_string();
        fx.gateway.handle_text_frame(conn_id, user, &text).await;

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["code"], "NOT_ROOM_MEMBER");
        assert_eq!(frame["chatRoomId"], room.to_string());
    }

    #[tokio::test]
    async fn blank_content_is_invalid_argument() {
        let fx = fixture();
        let user = UserId::from(Uuid::new_v4());
        let room = RoomId::from(Uuid::new_v4());
        fx.membership.add_member(room, user);

        let err = fx
            .gateway
            .send_message(
                user,
                SendMessageCommand {
                    room_id: room,
                    message_type: MessageType::Text,
                    content: Some("   ".into()),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.error_code(), ErrorCode::InvalidArgument);
    }

    #[tokio::test]
    async fn membership_store_failure_maps_to_internal_error() {
        let mut checker = MockMembershipChecker::new();
        checker
            .expect_is_member()
            .returning(|_, _| Err(RepositoryError::storage("db down")));
        let fx = fixture_with(Some(Arc::new(checker)));
        let user = UserId::from(Uuid::new_v4());
        let (conn, mut rx) = ConnectionHandle::channel(user, 8);
        let conn_id = conn.id();
        fx.gateway.connect(conn, profile(user), &[]).await;

        let text = serde_json::json!({
            "type": "SEND_MESSAGE",
            "chatRoomId": Uuid::new_v4(),
            "content": "hi",
        })
        .to_string();
        fx.gateway.handle_text_frame(conn_id, user, &text).await;

        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["code"], "INTERNAL_ERROR");
    }

    #[tokio::test]
    async fn bus_failure_does_not_undo_local_delivery() {
        let fx = fixture();
        let user = UserId::from(Uuid::new_v4());
        let room = RoomId::from(Uuid::new_v4());
        fx.membership.add_member(room, user);
        let (conn, mut rx) = ConnectionHandle::channel(user, 8);
        fx.gateway.connect(conn, profile(user), &[room]).await;
        fx.hub.set_publish_failure(true);

        let saved = fx
            .gateway
            .send_message(
                user,
                SendMessageCommand {
                    room_id: room,
                    message_type: MessageType::Text,
                    content: Some("still here".into()),
                },
            )
            .await
            .unwrap();
        let frame: Value = serde_json::from_str(&rx.recv().await.unwrap()).unwrap();
        assert_eq!(frame["id"], saved.id.to_string());
    }
}
