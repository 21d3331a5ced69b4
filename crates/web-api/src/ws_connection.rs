use std::ops::ControlFlow;
use std::sync::Arc;

use application::{ChatGateway, ConnectionHandle};
use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use domain::{ConnectionId, OnlineUser, RoomId, UserId};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

/// 连接用途
#[derive(Debug, Clone)]
pub enum ConnectionKind {
    /// 聊天连接，建立时加入用户所属的全部房间
    Chat {
        profile: OnlineUser,
        rooms: Vec<RoomId>,
    },
    /// 只接收在线用户快照
    PresenceWatcher,
}

/// WebSocket 连接管理器
///
/// 封装单个 WebSocket 连接的生命周期：
/// - 向网关登记连接
/// - 读循环按顺序把文本帧交给网关处理
/// - 写循环把发送队列中的帧写回客户端
/// - 任一循环结束后注销连接
pub struct WebSocketConnection {
    gateway: Arc<ChatGateway>,
    user_id: UserId,
    kind: ConnectionKind,
    outbound_buffer: usize,
}

impl WebSocketConnection {
    pub fn chat(
        gateway: Arc<ChatGateway>,
        profile: OnlineUser,
        rooms: Vec<RoomId>,
        outbound_buffer: usize,
    ) -> Self {
        Self {
            gateway,
            user_id: profile.id,
            kind: ConnectionKind::Chat { profile, rooms },
            outbound_buffer,
        }
    }

    pub fn presence_watcher(
        gateway: Arc<ChatGateway>,
        user_id: UserId,
        outbound_buffer: usize,
    ) -> Self {
        Self {
            gateway,
            user_id,
            kind: ConnectionKind::PresenceWatcher,
            outbound_buffer,
        }
    }

    /// 运行连接主循环，直到客户端关闭或传输出错
    pub async fn run(self, socket: WebSocket) {
        let (handle, mut outbound) = ConnectionHandle::channel(self.user_id, self.outbound_buffer);
        let connection_id = handle.id();

        let frames_gateway = match &self.kind {
            ConnectionKind::Chat { profile, rooms } => {
                self.gateway.connect(handle, profile.clone(), rooms).await;
                Some(Arc::clone(&self.gateway))
            }
            ConnectionKind::PresenceWatcher => {
                self.gateway.watch_presence(handle).await;
                None
            }
        };
        tracing::info!(
            connection_id = %connection_id,
            user_id = %self.user_id,
            kind = self.kind_name(),
            "WebSocket 连接已建立"
        );

        let (mut sender, mut incoming) = socket.split();
        let (cmd_tx, mut cmd_rx) = mpsc::channel::<WsCommand>(8);

        // 发送任务：统一处理所有对 WebSocket sender 的写操作
        let mut send_task = tokio::spawn(async move {
            loop {
                let command = tokio::select! {
                    Some(frame) = outbound.recv() => WsCommand::SendText(frame),
                    Some(command) = cmd_rx.recv() => command,
                    else => break,
                };
                let message = match command {
                    WsCommand::SendText(text) => WsMessage::Text(text.into()),
                    WsCommand::SendPong(data) => WsMessage::Pong(data),
                };
                if let Err(err) = sender.send(message).await {
                    tracing::debug!(connection_id = %connection_id, error = %err, "WebSocket 写入失败");
                    break;
                }
            }
        });

        // 接收任务：同一连接的帧按到达顺序处理
        let user_id = self.user_id;
        let mut recv_task = tokio::spawn(async move {
            while let Some(frame) = incoming.next().await {
                let message = match frame {
                    Ok(message) => message,
                    Err(err) => {
                        tracing::debug!(connection_id = %connection_id, error = %err, "WebSocket 读取失败");
                        break;
                    }
                };
                let flow = handle_incoming(
                    message,
                    connection_id,
                    user_id,
                    frames_gateway.as_deref(),
                    &cmd_tx,
                )
                .await;
                if flow.is_break() {
                    break;
                }
            }
        });

        tokio::select! {
            _ = &mut send_task => recv_task.abort(),
            _ = &mut recv_task => send_task.abort(),
        }

        match self.kind {
            ConnectionKind::Chat { .. } => {
                self.gateway.disconnect(connection_id).await;
            }
            ConnectionKind::PresenceWatcher => {
                self.gateway.unwatch_presence(connection_id);
            }
        }
        tracing::info!(connection_id = %connection_id, user_id = %self.user_id, "WebSocket 连接已断开");
    }

    fn kind_name(&self) -> &'static str {
        match self.kind {
            ConnectionKind::Chat { .. } => "chat",
            ConnectionKind::PresenceWatcher => "presence",
        }
    }
}

/// 处理来自客户端的消息
async fn handle_incoming(
    message: WsMessage,
    connection_id: ConnectionId,
    user_id: UserId,
    gateway: Option<&ChatGateway>,
    cmd_tx: &mpsc::Sender<WsCommand>,
) -> ControlFlow<()> {
    match message {
        WsMessage::Close(_) => {
            tracing::debug!(connection_id = %connection_id, "WebSocket收到关闭消息");
            return ControlFlow::Break(());
        }
        WsMessage::Ping(data) => {
            if cmd_tx.send(WsCommand::SendPong(data)).await.is_err() {
                return ControlFlow::Break(());
            }
        }
        WsMessage::Pong(_) => {}
        WsMessage::Text(text) => match gateway {
            Some(gateway) => {
                gateway
                    .handle_text_frame(connection_id, user_id, text.as_str())
                    .await
            }
            None => tracing::debug!(connection_id = %connection_id, "在线列表连接忽略客户端消息"),
        },
        WsMessage::Binary(_) => {
            tracing::debug!(connection_id = %connection_id, "忽略二进制帧");
        }
    }
    ControlFlow::Continue(())
}

/// WebSocket 写操作命令
#[derive(Debug)]
enum WsCommand {
    SendText(String),
    SendPong(Bytes),
}
