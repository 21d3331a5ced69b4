use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use domain::{ConnectionId, OnlineUser, ServerId, UserId};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Script};
use tracing::{debug, error, info, warn};

use crate::broker::RoomFanoutBroker;
use crate::error::ApplicationError;
use crate::session::{ConnectionHandle, SendOutcome};

/// 全局在线用户表。
///
/// 每个用户记录有哪些进程仍持有其连接，只有最后一个进程释放时才真正下线。
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceStore: Send + Sync {
    /// 登记用户在 `server_id` 上在线
    async fn put(&self, server_id: &ServerId, user: &OnlineUser) -> Result<(), ApplicationError>;

    /// 释放 `server_id` 对用户的持有，返回用户是否已从在线表移除
    async fn remove(&self, server_id: &ServerId, user_id: UserId)
        -> Result<bool, ApplicationError>;

    async fn list(&self) -> Result<Vec<OnlineUser>, ApplicationError>;

    /// 释放 `server_id` 持有的全部用户，返回因此下线的用户
    async fn release_server(&self, server_id: &ServerId) -> Result<Vec<UserId>, ApplicationError>;
}

// KEYS: 持有者集合, 进程用户集合, 在线哈希；ARGV: serverId, userId
const RELEASE_SCRIPT: &str = r"
redis.call('SREM', KEYS[1], ARGV[1])
redis.call('SREM', KEYS[2], ARGV[2])
if redis.call('SCARD', KEYS[1]) == 0 then
  redis.call('HDEL', KEYS[3], ARGV[2])
  return 1
end
return 0
";

/// Redis 实现。
///
/// - `<key>`：哈希，字段为用户 id，值为用户资料 JSON
/// - `<key>:holders:<userId>`：持有该用户连接的进程集合
/// - `<key>:server:<serverId>`：该进程持有的用户集合
pub struct RedisPresenceStore {
    conn: ConnectionManager,
    key: String,
    release: Script,
}

impl RedisPresenceStore {
    pub fn new(conn: ConnectionManager, key: impl Into<String>) -> Self {
        Self {
            conn,
            key: key.into(),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn holders_key(&self, user_id: UserId) -> String {
        format!("{}:holders:{}", self.key, user_id)
    }

    fn server_key(&self, server_id: &ServerId) -> String {
        format!("{}:server:{}", self.key, server_id)
    }
}

fn redis_failure(op: &str, e: redis::RedisError) -> ApplicationError {
    let message = format!("Redis {op} failed: {e}");
    ApplicationError::infrastructure_with_source(message, e)
}

#[async_trait]
impl PresenceStore for RedisPresenceStore {
    async fn put(&self, server_id: &ServerId, user: &OnlineUser) -> Result<(), ApplicationError> {
        let value = serde_json::to_string(user).map_err(|e| {
            ApplicationError::infrastructure_with_source("encode online user failed", e)
        })?;
        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .hset(&self.key, user.id.to_string(), value)
            .ignore()
            .sadd(self.holders_key(user.id), server_id.as_str())
            .ignore()
            .sadd(self.server_key(server_id), user.id.to_string())
            .ignore()
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_failure("HSET/SADD", e))?;
        Ok(())
    }

    async fn remove(
        &self,
        server_id: &ServerId,
        user_id: UserId,
    ) -> Result<bool, ApplicationError> {
        let mut conn = self.conn.clone();
        let removed: i64 = self
            .release
            .key(self.holders_key(user_id))
            .key(self.server_key(server_id))
            .key(&self.key)
            .arg(server_id.as_str())
            .arg(user_id.to_string())
            .invoke_async(&mut conn)
            .await
            .map_err(|e| redis_failure("EVALSHA", e))?;
        Ok(removed == 1)
    }

    async fn list(&self) -> Result<Vec<OnlineUser>, ApplicationError> {
        let mut conn = self.conn.clone();
        let values: Vec<String> = conn
            .hvals(&self.key)
            .await
            .map_err(|e| redis_failure("HVALS", e))?;

        Ok(values
            .iter()
            .filter_map(|raw| match serde_json::from_str::<OnlineUser>(raw) {
                Ok(user) => Some(user),
                Err(e) => {
                    warn!(error = %e, "在线用户表中存在无法解析的记录");
                    None
                }
            })
            .collect())
    }

    async fn release_server(&self, server_id: &ServerId) -> Result<Vec<UserId>, ApplicationError> {
        let mut conn = self.conn.clone();
        let held: Vec<String> = conn
            .smembers(self.server_key(server_id))
            .await
            .map_err(|e| redis_failure("SMEMBERS", e))?;

        let mut offline = Vec::new();
        for raw in held {
            let user_id = match raw.parse::<UserId>() {
                Ok(user_id) => user_id,
                Err(e) => {
                    warn!(server_id = %server_id, value = %raw, error = %e, "进程用户集合中的用户 id 无效");
                    continue;
                }
            };
            if self.remove(server_id, user_id).await? {
                offline.push(user_id);
            }
        }

        let _: () = conn
            .del(self.server_key(server_id))
            .await
            .map_err(|e| redis_failure("DEL", e))?;
        Ok(offline)
    }
}

/// 在线状态登记，每次变化后向所有进程广播完整快照
pub struct PresenceRegistry {
    store: Arc<dyn PresenceStore>,
    broker: Arc<RoomFanoutBroker>,
}

impl PresenceRegistry {
    pub fn new(store: Arc<dyn PresenceStore>, broker: Arc<RoomFanoutBroker>) -> Self {
        Self { store, broker }
    }

    pub async fn mark_online(&self, user: OnlineUser) -> Result<(), ApplicationError> {
        self.store.put(self.broker.server_id(), &user).await?;
        info!(user_id = %user.id, "用户上线");
        self.broadcast_snapshot().await?;
        Ok(())
    }

    /// 本进程不再持有该用户的连接。
    ///
    /// 其他进程仍持有时返回 `false`，不广播。
    pub async fn mark_offline(&self, user_id: UserId) -> Result<bool, ApplicationError> {
        if !self.store.remove(self.broker.server_id(), user_id).await? {
            debug!(user_id = %user_id, "用户仍在其他进程在线");
            return Ok(false);
        }
        info!(user_id = %user_id, "用户下线");
        self.broadcast_snapshot().await?;
        Ok(true)
    }

    /// 释放本进程登记的全部在线用户，返回因此下线的人数。
    ///
    /// 启动时清理上次运行遗留的记录，关闭时兜底。
    pub async fn release_local(&self) -> Result<usize, ApplicationError> {
        let server_id = self.broker.server_id();
        let offline = self.store.release_server(server_id).await?;
        if !offline.is_empty() {
            info!(server_id = %server_id, offline = offline.len(), "已释放本进程登记的在线用户");
            self.broadcast_snapshot().await?;
        }
        Ok(offline.len())
    }

    /// 读取并广播当前快照，返回快照中的用户数
    pub async fn broadcast_snapshot(&self) -> Result<usize, ApplicationError> {
        let users = self.store.list().await?;
        if !self.broker.publish_presence(&users).await {
            warn!(online = users.len(), "在线用户快照广播失败");
        }
        Ok(users.len())
    }

    pub async fn snapshot(&self) -> Result<Vec<OnlineUser>, ApplicationError> {
        self.store.list().await
    }
}

/// 本进程订阅在线用户列表的连接
#[derive(Debug, Default)]
pub struct PresenceWatchers {
    watchers: RwLock<HashMap<ConnectionId, ConnectionHandle>>,
}

impl PresenceWatchers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, handle: ConnectionHandle) {
        self.watchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(handle.id(), handle);
    }

    pub fn remove(&self, connection_id: ConnectionId) -> bool {
        self.watchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&connection_id)
            .is_some()
    }

    pub fn clear(&self) {
        self.watchers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    pub fn len(&self) -> usize {
        self.watchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 向所有订阅者推送快照，清理已关闭的连接，返回送达数
    pub fn broadcast(&self, users: &[OnlineUser]) -> usize {
        let frame = match serde_json::to_string(users) {
            Ok(frame) => frame,
            Err(e) => {
                error!(error = %e, "在线用户快照序列化失败");
                return 0;
            }
        };

        let targets: Vec<ConnectionHandle> = self
            .watchers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let mut delivered = 0;
        for handle in targets {
            match handle.try_send(frame.clone()) {
                SendOutcome::Sent => delivered += 1,
                SendOutcome::Full => {
                    warn!(connection_id = %handle.id(), "在线列表连接发送队列已满")
                }
                SendOutcome::Closed => {
                    self.remove(handle.id());
                    debug!(connection_id = %handle.id(), "清理已关闭的在线列表连接");
                }
            }
        }
        delivered
    }

    /// 向单个连接发送快照
    pub fn send_snapshot(&self, handle: &ConnectionHandle, users: &[OnlineUser]) -> bool {
        match serde_json::to_string(users) {
            Ok(frame) => handle.try_send(frame) == SendOutcome::Sent,
            Err(e) => {
                error!(error = %e, "在线用户快照序列化失败");
                false
            }
        }
    }
}

pub mod memory {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    #[derive(Default)]
    struct PresenceState {
        users: Vec<OnlineUser>,
        holders: HashMap<UserId, HashSet<ServerId>>,
    }

    impl PresenceState {
        fn release(&mut self, server_id: &ServerId, user_id: UserId) -> bool {
            let Some(holders) = self.holders.get_mut(&user_id) else {
                return false;
            };
            holders.remove(server_id);
            if !holders.is_empty() {
                return false;
            }
            self.holders.remove(&user_id);
            self.users.retain(|u| u.id != user_id);
            true
        }
    }

    /// 按插入顺序返回用户，便于断言
    #[derive(Default)]
    pub struct MemoryPresenceStore {
        state: Mutex<PresenceState>,
    }

    impl MemoryPresenceStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// 当前持有该用户连接的进程数
        pub fn holder_count(&self, user_id: UserId) -> usize {
            self.state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .holders
                .get(&user_id)
                .map_or(0, HashSet::len)
        }
    }

    #[async_trait]
    impl PresenceStore for MemoryPresenceStore {
        async fn put(
            &self,
            server_id: &ServerId,
            user: &OnlineUser,
        ) -> Result<(), ApplicationError> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            match state.users.iter_mut().find(|u| u.id == user.id) {
                Some(existing) => *existing = user.clone(),
                None => state.users.push(user.clone()),
            }
            state
                .holders
                .entry(user.id)
                .or_default()
                .insert(server_id.clone());
            Ok(())
        }

        async fn remove(
            &self,
            server_id: &ServerId,
            user_id: UserId,
        ) -> Result<bool, ApplicationError> {
            Ok(self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .release(server_id, user_id))
        }

        async fn list(&self) -> Result<Vec<OnlineUser>, ApplicationError> {
            Ok(self
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .users
                .clone())
        }

        async fn release_server(
            &self,
            server_id: &ServerId,
        ) -> Result<Vec<UserId>, ApplicationError> {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let held: Vec<UserId> = state
                .holders
                .iter()
                .filter(|(_, servers)| servers.contains(server_id))
                .map(|(user_id, _)| *user_id)
                .collect();
            Ok(held
                .into_iter()
                .filter(|user_id| state.release(server_id, *user_id))
                .collect())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryPresenceStore;
    use super::*;
    use crate::broker::{BrokerSettings, FanoutEvent};
    use crate::bus::memory::InMemoryBusHub;
    use crate::bus::MessageBus;
    use crate::server_rooms::memory::MemorySubscriptionRegistry;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use uuid::Uuid;

    fn online(name: &str) -> OnlineUser {
        OnlineUser::new(UserId::from(Uuid::new_v4()), name, None)
    }

    #[tokio::test]
    async fn snapshot_is_published_on_every_change() {
        let hub = InMemoryBusHub::new();
        let local: Arc<dyn MessageBus> = Arc::new(hub.connect());
        let (tx, mut events) = mpsc::channel(8);
        let broker = Arc::new(RoomFanoutBroker::new(
            ServerId::new("node-a"),
            local,
            Arc::new(MemorySubscriptionRegistry::new()),
            BrokerSettings::default(),
            tx,
        ));
        broker.start().await.unwrap();
        let presence = PresenceRegistry::new(Arc::new(MemoryPresenceStore::new()), broker.clone());

        let alice = online("alice");
        presence.mark_online(alice.clone()).await.unwrap();
        assert_eq!(
            events.recv().await.unwrap(),
            FanoutEvent::Presence(vec![alice.clone()])
        );

        assert!(presence.mark_offline(alice.id).await.unwrap());
        assert_eq!(events.recv().await.unwrap(), FanoutEvent::Presence(vec![]));
        assert!(presence.snapshot().await.unwrap().is_empty());
        broker.stop().await;
    }

    #[tokio::test]
    async fn user_stays_online_while_another_server_holds_it() {
        let store = MemoryPresenceStore::new();
        let (node_a, node_b) = (ServerId::new("node-a"), ServerId::new("node-b"));
        let alice = online("alice");
        store.put(&node_a, &alice).await.unwrap();
        store.put(&node_b, &alice).await.unwrap();
        assert_eq!(store.holder_count(alice.id), 2);

        assert!(!store.remove(&node_a, alice.id).await.unwrap());
        assert_eq!(store.list().await.unwrap(), vec![alice.clone()]);

        assert!(store.remove(&node_b, alice.id).await.unwrap());
        assert!(store.list().await.unwrap().is_empty());
        assert!(!store.remove(&node_b, alice.id).await.unwrap());
    }

    #[tokio::test]
    async fn release_server_only_drops_users_held_nowhere_else() {
        let store = MemoryPresenceStore::new();
        let (node_a, node_b) = (ServerId::new("node-a"), ServerId::new("node-b"));
        let (alice, bob) = (online("alice"), online("bob"));
        store.put(&node_a, &alice).await.unwrap();
        store.put(&node_b, &alice).await.unwrap();
        store.put(&node_a, &bob).await.unwrap();

        let offline = store.release_server(&node_a).await.unwrap();
        assert_eq!(offline, vec![bob.id]);
        assert_eq!(store.list().await.unwrap(), vec![alice.clone()]);
        assert_eq!(store.holder_count(alice.id), 1);
    }

    #[tokio::test]
    async fn mark_offline_is_silent_while_held_elsewhere() {
        let hub = InMemoryBusHub::new();
        let (tx, mut events) = mpsc::channel(8);
        let broker = Arc::new(RoomFanoutBroker::new(
            ServerId::new("node-a"),
            Arc::new(hub.connect()),
            Arc::new(MemorySubscriptionRegistry::new()),
            BrokerSettings::default(),
            tx,
        ));
        broker.start().await.unwrap();
        let store = Arc::new(MemoryPresenceStore::new());
        let presence = PresenceRegistry::new(store.clone(), broker.clone());

        let alice = online("alice");
        store.put(&ServerId::new("node-b"), &alice).await.unwrap();
        presence.mark_online(alice.clone()).await.unwrap();
        assert!(matches!(events.recv().await, Some(FanoutEvent::Presence(_))));

        assert!(!presence.mark_offline(alice.id).await.unwrap());
        let quiet = tokio::time::timeout(Duration::from_millis(100), events.recv()).await;
        assert!(quiet.is_err(), "no snapshot while another server holds the user");
        assert_eq!(presence.snapshot().await.unwrap(), vec![alice]);

        assert_eq!(presence.release_local().await.unwrap(), 0);
        broker.stop().await;
    }

    #[tokio::test]
    async fn store_failure_is_propagated() {
        let mut store = MockPresenceStore::new();
        store
            .expect_put()
            .returning(|_, _| Err(ApplicationError::infrastructure("redis down")));
        let hub = InMemoryBusHub::new();
        let (tx, _rx) = mpsc::channel(8);
        let broker = Arc::new(RoomFanoutBroker::new(
            ServerId::new("node-a"),
            Arc::new(hub.connect()),
            Arc::new(MemorySubscriptionRegistry::new()),
            BrokerSettings::default(),
            tx,
        ));
        let presence = PresenceRegistry::new(Arc::new(store), broker);

        assert!(presence.mark_online(online("alice")).await.is_err());
    }

    #[tokio::test]
    async fn watchers_receive_snapshots_and_closed_ones_are_reaped() {
        let watchers = PresenceWatchers::new();
        let (open, mut open_rx) = ConnectionHandle::channel(UserId::from(Uuid::new_v4()), 4);
        let (closed, closed_rx) = ConnectionHandle::channel(UserId::from(Uuid::new_v4()), 4);
        watchers.add(open.clone());
        watchers.add(closed);
        drop(closed_rx);

        let users = vec![online("bob")];
        assert_eq!(watchers.broadcast(&users), 1);
        assert_eq!(watchers.len(), 1);

        let frame = open_rx.recv().await.unwrap();
        let decoded: Vec<OnlineUser> = serde_json::from_str(&frame).unwrap();
        assert_eq!(decoded, users);

        assert!(watchers.send_snapshot(&open, &users));
        assert!(watchers.remove(open.id()));
        assert!(watchers.is_empty());
    }
}
