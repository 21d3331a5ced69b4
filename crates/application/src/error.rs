use domain::{DomainError, RepositoryError, RoomId, UserId};
use thiserror::Error;

use crate::bus::BusError;
use crate::protocol::ErrorCode;

type BoxedSource = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("bus error: {0}")]
    Bus(#[from] BusError),
    #[error("user {user_id} is not a member of room {room_id}")]
    NotRoomMember { room_id: RoomId, user_id: UserId },
    #[error("infrastructure error: {message}")]
    Infrastructure {
        message: String,
        #[source]
        source: Option<BoxedSource>,
    },
}

impl ApplicationError {
    /// 创建基础设施错误
    pub fn infrastructure(message: impl Into<String>) -> Self {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: None,
        }
    }

    pub fn infrastructure_with_source<E>(message: impl Into<String>, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        ApplicationError::Infrastructure {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    pub fn not_room_member(room_id: RoomId, user_id: UserId) -> Self {
        ApplicationError::NotRoomMember { room_id, user_id }
    }

    /// 映射为下发给客户端的错误码
    pub fn error_code(&self) -> ErrorCode {
        match self {
            ApplicationError::Domain(DomainError::InvalidArgument { .. }) => {
                ErrorCode::InvalidArgument
            }
            ApplicationError::NotRoomMember { .. } => ErrorCode::NotRoomMember,
            _ => ErrorCode::InternalError,
        }
    }
}
