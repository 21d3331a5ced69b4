use std::sync::Arc;

use application::{ChatGateway, MembershipEditor, RoomDirectory};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<ChatGateway>,
    /// 连接建立时查询用户所属房间
    pub rooms: Arc<dyn RoomDirectory>,
    pub members: Arc<dyn MembershipEditor>,
    /// 每个连接的发送队列长度
    pub outbound_buffer: usize,
}

impl AppState {
    pub fn new(
        gateway: Arc<ChatGateway>,
        rooms: Arc<dyn RoomDirectory>,
        members: Arc<dyn MembershipEditor>,
        outbound_buffer: usize,
    ) -> Self {
        Self {
            gateway,
            rooms,
            members,
            outbound_buffer,
        }
    }
}
