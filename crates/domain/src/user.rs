use serde::{Deserialize, Serialize};

use crate::message::SenderProfile;
use crate::value_objects::UserId;

/// 在线用户快照条目，存放于共享的在线用户表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OnlineUser {
    pub id: UserId,
    pub nickname: String,
    #[serde(default)]
    pub profile_image: Option<String>,
}

impl OnlineUser {
    pub fn new(id: UserId, nickname: impl Into<String>, profile_image: Option<String>) -> Self {
        Self {
            id,
            nickname: nickname.into(),
            profile_image,
        }
    }
}

impl From<SenderProfile> for OnlineUser {
    fn from(value: SenderProfile) -> Self {
        Self {
            id: value.id,
            nickname: value.nickname,
            profile_image: value.profile_image,
        }
    }
}

impl From<OnlineUser> for SenderProfile {
    fn from(value: OnlineUser) -> Self {
        Self {
            id: value.id,
            nickname: value.nickname,
            profile_image: value.profile_image,
        }
    }
}
