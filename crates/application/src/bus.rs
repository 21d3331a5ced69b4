//! 跨进程消息总线抽象
//!
//! 总线只负责按频道发布和订阅字符串负载；所有订阅频道上的入站消息
//! 汇入同一个接收端，由 [`crate::broker::RoomFanoutBroker`] 统一消费。

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// 总线上收到的一条消息
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusMessage {
    pub channel: String,
    pub payload: String,
}

impl BusMessage {
    pub fn new(channel: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            payload: payload.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum BusError {
    #[error("bus connection error: {0}")]
    Connection(String),
    #[error("publish failed: {0}")]
    Publish(String),
    #[error("subscribe failed: {0}")]
    Subscribe(String),
    #[error("bus closed")]
    Closed,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageBus: Send + Sync {
    async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError>;

    async fn subscribe(&self, channel: &str) -> Result<(), BusError>;

    async fn unsubscribe(&self, channel: &str) -> Result<(), BusError>;

    /// 取出入站消息流，只能取一次
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<BusMessage>>;

    async fn close(&self) -> Result<(), BusError>;
}

/// 进程内总线，用于测试和单机开发。
///
/// 一个 [`memory::InMemoryBusHub`] 模拟一个共享的 Redis，每次
/// [`memory::InMemoryBusHub::connect`] 得到一个独立进程视角的总线连接。
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

    #[derive(Default)]
    struct HubState {
        next_node: u64,
        nodes: HashMap<u64, NodeState>,
        fail_publish: bool,
        fail_subscribe: bool,
    }

    struct NodeState {
        channels: HashSet<String>,
        sender: mpsc::UnboundedSender<BusMessage>,
    }

    #[derive(Default)]
    pub struct InMemoryBusHub {
        state: Mutex<HubState>,
    }

    impl InMemoryBusHub {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        fn state(&self) -> MutexGuard<'_, HubState> {
            self.state.lock().unwrap_or_else(PoisonError::into_inner)
        }

        pub fn connect(self: &Arc<Self>) -> InMemoryMessageBus {
            let (sender, receiver) = mpsc::unbounded_channel();
            let mut state = self.state();
            let node = state.next_node;
            state.next_node += 1;
            state.nodes.insert(
                node,
                NodeState {
                    channels: HashSet::new(),
                    sender,
                },
            );
            InMemoryMessageBus {
                hub: Arc::clone(self),
                node,
                inbound: Mutex::new(Some(receiver)),
            }
        }

        /// 订阅了该频道的连接数
        pub fn subscriber_count(&self, channel: &str) -> usize {
            self.state()
                .nodes
                .values()
                .filter(|node| node.channels.contains(channel))
                .count()
        }

        /// 打开后所有发布都返回错误，用于模拟总线故障
        pub fn set_publish_failure(&self, fail: bool) {
            self.state().fail_publish = fail;
        }

        /// 打开后所有订阅都返回错误
        pub fn set_subscribe_failure(&self, fail: bool) {
            self.state().fail_subscribe = fail;
        }

        /// 绕过发布者直接投递，模拟总线重复投递
        pub fn inject(&self, channel: &str, payload: &str) -> usize {
            self.deliver(channel, payload)
        }

        fn deliver(&self, channel: &str, payload: &str) -> usize {
            let state = self.state();
            let mut delivered = 0;
            for node in state.nodes.values() {
                if node.channels.contains(channel)
                    && node.sender.send(BusMessage::new(channel, payload)).is_ok()
                {
                    delivered += 1;
                }
            }
            delivered
        }
    }

    pub struct InMemoryMessageBus {
        hub: Arc<InMemoryBusHub>,
        node: u64,
        inbound: Mutex<Option<mpsc::UnboundedReceiver<BusMessage>>>,
    }

    #[async_trait]
    impl MessageBus for InMemoryMessageBus {
        async fn publish(&self, channel: &str, payload: String) -> Result<(), BusError> {
            if self.hub.state().fail_publish {
                return Err(BusError::Publish("simulated bus failure".to_string()));
            }
            self.hub.deliver(channel, &payload);
            Ok(())
        }

        async fn subscribe(&self, channel: &str) -> Result<(), BusError> {
            let mut state = self.hub.state();
            if state.fail_subscribe {
                return Err(BusError::Subscribe("simulated bus failure".to_string()));
            }
            let node = state.nodes.get_mut(&self.node).ok_or(BusError::Closed)?;
            node.channels.insert(channel.to_string());
            Ok(())
        }

        async fn unsubscribe(&self, channel: &str) -> Result<(), BusError> {
            let mut state = self.hub.state();
            if let Some(node) = state.nodes.get_mut(&self.node) {
                node.channels.remove(channel);
            }
            Ok(())
        }

        fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<BusMessage>> {
            self.inbound
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take()
        }

        async fn close(&self) -> Result<(), BusError> {
            self.hub.state().nodes.remove(&self.node);
            Ok(())
        }
    }

}
