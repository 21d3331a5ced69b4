//! 应用层实现。
//!
//! 这里是多实例聊天服务的实时分发核心：本进程连接登记、跨进程房间分发、
//! 房间序列号、游标分页、在线状态，以及把它们组合起来的 [`ChatGateway`]。
//! 持久化与成员校验通过窄接口交给外部协作方。

pub mod broker;
pub mod bus;
pub mod clock;
pub mod dedup;
pub mod error;
pub mod gateway;
pub mod pagination;
pub mod presence;
pub mod protocol;
pub mod repository;
pub mod sequencer;
pub mod server_rooms;
pub mod session;

/// 所有共享状态接口的内存实现，测试和单机开发用
pub mod memory {
    pub use crate::bus::memory::{InMemoryBusHub, InMemoryMessageBus};
    pub use crate::presence::memory::MemoryPresenceStore;
    pub use crate::repository::memory::{MemoryMembership, MemoryMessageStore};
    pub use crate::sequencer::memory::MemorySequenceAllocator;
    pub use crate::server_rooms::memory::MemorySubscriptionRegistry;
}

pub use broker::{
    BrokerSettings, DistributedEnvelope, FanoutEvent, InboundOutcome, RoomDelivery,
    RoomFanoutBroker,
};
pub use bus::{BusError, BusMessage, MessageBus};
pub use clock::{Clock, SystemClock};
pub use dedup::DedupCache;
pub use error::ApplicationError;
pub use gateway::{ChatGateway, ChatGatewayDependencies, SendMessageCommand};
pub use pagination::{CursorPaginator, Direction, MessagePage, MessagePageRequest};
pub use presence::{PresenceRegistry, PresenceStore, PresenceWatchers, RedisPresenceStore};
pub use protocol::{ErrorCode, ErrorFrame, IncomingPayload, OutgoingMessage};
pub use repository::{MembershipChecker, MembershipEditor, MessageStore, RoomDirectory};
pub use sequencer::{RedisSequenceAllocator, SequenceAllocator};
pub use server_rooms::{RedisSubscriptionRegistry, SubscriptionRegistry};
pub use session::{
    ConnectionHandle, ConnectionRemoval, DeliveryReport, OnlineCheck, SendOutcome,
    SessionRegistry,
};
