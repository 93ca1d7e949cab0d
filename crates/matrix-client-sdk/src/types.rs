//! 协议数据结构 - Matrix client-server API (r0) 的 JSON 载荷
//!
//! 包括：
//! - 登录 / 资料 / 房间管理等 REST 接口的请求与响应
//! - `/sync` 响应的信封结构（事件体保留 raw JSON，由注册表二次解码）
//! - 解码后的房间事件与消息内容类型

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

use crate::error::{MatrixSdkError, Result};

/// 登录请求（密码方式）
#[derive(Debug, Clone, Serialize)]
pub struct LoginRequest {
    #[serde(rename = "type")]
    pub login_type: String,
    pub user: String,
    pub password: String,
}

impl LoginRequest {
    pub fn password(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            login_type: "m.login.password".to_string(),
            user: user.into(),
            password: password.into(),
        }
    }
}

/// 登录响应
#[derive(Debug, Clone, Deserialize)]
pub struct LoginResponse {
    pub user_id: String,
    pub access_token: String,
    #[serde(default)]
    pub device_id: Option<String>,
    #[serde(default)]
    pub home_server: Option<String>,
}

/// 用户资料
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Profile {
    #[serde(default)]
    pub displayname: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// 建房请求
///
/// 所有字段可选；`Default` 即一个空请求（服务端取默认房间配置）。
#[derive(Debug, Clone, Default, Serialize)]
pub struct CreateRoomRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room_alias_name: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub invite: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_direct: Option<bool>,
}

/// 公开房间列表
#[derive(Debug, Clone, Deserialize)]
pub struct PublicRooms {
    #[serde(default)]
    pub chunk: Vec<PublicRoomEntry>,
    #[serde(default)]
    pub next_batch: Option<String>,
    #[serde(default)]
    pub total_room_count_estimate: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublicRoomEntry {
    pub room_id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub topic: Option<String>,
    #[serde(default)]
    pub canonical_alias: Option<String>,
    #[serde(default)]
    pub num_joined_members: u64,
    #[serde(default)]
    pub world_readable: bool,
    #[serde(default)]
    pub guest_can_join: bool,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

/// 房间标签
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RoomTags {
    #[serde(default)]
    pub tags: HashMap<String, TagContent>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TagContent {
    #[serde(default)]
    pub order: Option<f64>,
}

/// 媒体上传响应
#[derive(Debug, Clone, Deserialize)]
pub struct MediaUploadResponse {
    pub content_uri: String,
}

/// `/versions` 响应
#[derive(Debug, Clone, Deserialize)]
pub struct VersionsResponse {
    pub versions: Vec<String>,
}

// ---------------------------------------------------------------------------
// /sync 信封
// ---------------------------------------------------------------------------

/// `/sync` 响应信封
///
/// 事件体保留为 raw `Value`，由 [`EventTypeRegistry`](crate::registry::EventTypeRegistry)
/// 按注册的类型标签二次解码。
#[derive(Debug, Clone, Deserialize)]
pub struct SyncResponse {
    pub next_batch: String,
    #[serde(default)]
    pub rooms: SyncRooms,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SyncRooms {
    #[serde(default)]
    pub join: HashMap<String, JoinedRoomWire>,
    #[serde(default)]
    pub invite: HashMap<String, InvitedRoomWire>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JoinedRoomWire {
    #[serde(default)]
    pub timeline: TimelineWire,
    #[serde(default)]
    pub state: StateWire,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TimelineWire {
    #[serde(default)]
    pub events: Vec<Value>,
    #[serde(default)]
    pub limited: bool,
    #[serde(default)]
    pub prev_batch: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StateWire {
    #[serde(default)]
    pub events: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InvitedRoomWire {
    #[serde(default)]
    pub invite_state: StateWire,
}

// ---------------------------------------------------------------------------
// 解码后的事件
// ---------------------------------------------------------------------------

/// 解码后的房间事件
#[derive(Debug, Clone)]
pub struct RoomEvent {
    pub event_type: String,
    pub sender: Option<String>,
    pub event_id: Option<String>,
    pub origin_server_ts: Option<u64>,
    pub state_key: Option<String>,
    pub content: EventContent,
}

/// 事件内容（tagged variant）
///
/// 未注册的事件类型落入 `Raw`，保留原始字段，解码永不因未知类型失败。
#[derive(Debug, Clone)]
pub enum EventContent {
    Message(MessageContent),
    Member(MemberContent),
    RoomName(RoomNameContent),
    RoomTopic(RoomTopicContent),
    Raw(Value),
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemberContent {
    pub membership: String,
    #[serde(default)]
    pub displayname: Option<String>,
    #[serde(default)]
    pub avatar_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomNameContent {
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomTopicContent {
    #[serde(default)]
    pub topic: String,
}

/// 消息内容（`m.room.message` 的 msgtype 命名空间）
#[derive(Debug, Clone)]
pub enum MessageContent {
    Text(TextMessage),
    Emote(TextMessage),
    Notice(TextMessage),
    Image(FileMessage),
    File(FileMessage),
    /// 未注册 msgtype 的兜底
    Raw(Value),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TextMessage {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formatted_body: Option<String>,
}

impl TextMessage {
    pub fn plain(body: impl Into<String>) -> Self {
        Self {
            body: body.into(),
            format: None,
            formatted_body: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileMessage {
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub info: Option<Value>,
}

impl MessageContent {
    pub fn text(body: impl Into<String>) -> Self {
        MessageContent::Text(TextMessage::plain(body))
    }

    pub fn msgtype(&self) -> Option<&str> {
        match self {
            MessageContent::Text(_) => Some("m.text"),
            MessageContent::Emote(_) => Some("m.emote"),
            MessageContent::Notice(_) => Some("m.notice"),
            MessageContent::Image(_) => Some("m.image"),
            MessageContent::File(_) => Some("m.file"),
            MessageContent::Raw(v) => v.get("msgtype").and_then(Value::as_str),
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            MessageContent::Text(m) | MessageContent::Emote(m) | MessageContent::Notice(m) => {
                Some(m.body.as_str())
            }
            MessageContent::Image(m) | MessageContent::File(m) => Some(m.body.as_str()),
            MessageContent::Raw(v) => v.get("body").and_then(Value::as_str),
        }
    }

    /// 序列化成线上格式（注入 msgtype 标签）
    pub fn to_wire(&self) -> Result<Value> {
        let mut value = match self {
            MessageContent::Text(m) | MessageContent::Emote(m) | MessageContent::Notice(m) => {
                serde_json::to_value(m)?
            }
            MessageContent::Image(m) | MessageContent::File(m) => serde_json::to_value(m)?,
            MessageContent::Raw(v) => return Ok(v.clone()),
        };
        let msgtype = self
            .msgtype()
            .ok_or_else(|| MatrixSdkError::Validation("missing msgtype".to_string()))?;
        value
            .as_object_mut()
            .ok_or_else(|| MatrixSdkError::Validation("message content must be an object".to_string()))?
            .insert("msgtype".to_string(), Value::String(msgtype.to_string()));
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// 房间增量
// ---------------------------------------------------------------------------

/// 一次 sync 中某个房间的增量，派发给订阅者后即丢弃
#[derive(Debug, Clone)]
pub struct RoomDelta {
    pub room_id: String,
    pub kind: RoomDeltaKind,
}

#[derive(Debug, Clone)]
pub enum RoomDeltaKind {
    Joined(JoinedRoom),
    Invited(InvitedRoom),
}

#[derive(Debug, Clone)]
pub struct JoinedRoom {
    pub timeline_events: Vec<RoomEvent>,
    pub state_events: Vec<RoomEvent>,
}

#[derive(Debug, Clone)]
pub struct InvitedRoom {
    pub invite_state_events: Vec<RoomEvent>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_to_wire_injects_msgtype() {
        let msg = MessageContent::text("hello");
        let wire = msg.to_wire().unwrap();
        assert_eq!(wire["msgtype"], "m.text");
        assert_eq!(wire["body"], "hello");
    }

    #[test]
    fn test_sync_envelope_defaults() {
        let sync: SyncResponse = serde_json::from_str(r#"{"next_batch":"s1"}"#).unwrap();
        assert_eq!(sync.next_batch, "s1");
        assert!(sync.rooms.join.is_empty());
        assert!(sync.rooms.invite.is_empty());
    }
}
