//! 事件类型注册表 - 动态类型标签到解码器的映射
//!
//! Matrix 事件是字符串标签多态的：时间线/状态事件按 `type` 区分，
//! `m.room.message` 的内容再按 `msgtype` 区分。注册表为这两个命名空间
//! 分别维护 标签 -> 解码器 映射：
//! - 查不到或解码失败一律回退到 `Raw` 变体并保留原始字段，绝不让
//!   单个未知事件拖垮整次 sync 解码
//! - 重复注册覆盖旧解码器（last-write-wins）

use parking_lot::RwLock;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use crate::types::{EventContent, MessageContent, RoomEvent};

/// 时间线/状态事件内容解码器
pub type EventDecoder = Arc<dyn Fn(&Value) -> serde_json::Result<EventContent> + Send + Sync>;

/// 消息内容解码器（msgtype 命名空间）
pub type MessageDecoder = Arc<dyn Fn(&Value) -> serde_json::Result<MessageContent> + Send + Sync>;

pub struct EventTypeRegistry {
    event_types: RwLock<HashMap<String, EventDecoder>>,
    message_types: RwLock<HashMap<String, MessageDecoder>>,
}

impl EventTypeRegistry {
    /// 创建注册表并注册内置类型
    pub fn new() -> Self {
        let registry = Self {
            event_types: RwLock::new(HashMap::new()),
            message_types: RwLock::new(HashMap::new()),
        };
        registry.register_builtin_types();
        registry
    }

    fn register_builtin_types(&self) {
        self.register_event_type("m.room.member", |v| {
            Ok(EventContent::Member(serde_json::from_value(v.clone())?))
        });
        self.register_event_type("m.room.name", |v| {
            Ok(EventContent::RoomName(serde_json::from_value(v.clone())?))
        });
        self.register_event_type("m.room.topic", |v| {
            Ok(EventContent::RoomTopic(serde_json::from_value(v.clone())?))
        });

        self.register_message_type("m.text", |v| {
            Ok(MessageContent::Text(serde_json::from_value(v.clone())?))
        });
        self.register_message_type("m.emote", |v| {
            Ok(MessageContent::Emote(serde_json::from_value(v.clone())?))
        });
        self.register_message_type("m.notice", |v| {
            Ok(MessageContent::Notice(serde_json::from_value(v.clone())?))
        });
        self.register_message_type("m.image", |v| {
            Ok(MessageContent::Image(serde_json::from_value(v.clone())?))
        });
        self.register_message_type("m.file", |v| {
            Ok(MessageContent::File(serde_json::from_value(v.clone())?))
        });
    }

    /// 注册时间线/状态事件类型，重复注册覆盖
    pub fn register_event_type<F>(&self, tag: &str, decoder: F)
    where
        F: Fn(&Value) -> serde_json::Result<EventContent> + Send + Sync + 'static,
    {
        self.event_types
            .write()
            .insert(tag.to_string(), Arc::new(decoder));
    }

    /// 注册消息内容类型（msgtype），重复注册覆盖
    pub fn register_message_type<F>(&self, tag: &str, decoder: F)
    where
        F: Fn(&Value) -> serde_json::Result<MessageContent> + Send + Sync + 'static,
    {
        self.message_types
            .write()
            .insert(tag.to_string(), Arc::new(decoder));
    }

    /// 解码单个原始事件
    ///
    /// `m.room.message` 的内容走 msgtype 命名空间，其余走事件命名空间。
    /// 任何一层查不到或解码失败都回退到 `Raw`。
    pub fn decode_event(&self, raw: &Value) -> RoomEvent {
        let event_type = raw
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let content = raw.get("content").cloned().unwrap_or(Value::Null);

        let decoded = if event_type == "m.room.message" {
            EventContent::Message(self.decode_message(&content))
        } else {
            self.decode_content(&event_type, &content)
        };

        RoomEvent {
            event_type,
            sender: raw.get("sender").and_then(Value::as_str).map(String::from),
            event_id: raw.get("event_id").and_then(Value::as_str).map(String::from),
            origin_server_ts: raw.get("origin_server_ts").and_then(Value::as_u64),
            state_key: raw
                .get("state_key")
                .and_then(Value::as_str)
                .map(String::from),
            content: decoded,
        }
    }

    fn decode_content(&self, tag: &str, content: &Value) -> EventContent {
        let decoder = self.event_types.read().get(tag).cloned();
        match decoder {
            Some(decode) => match decode(content) {
                Ok(decoded) => decoded,
                Err(e) => {
                    debug!("事件内容解码失败，回退 Raw: type={} err={}", tag, e);
                    EventContent::Raw(content.clone())
                }
            },
            None => EventContent::Raw(content.clone()),
        }
    }

    /// 按 msgtype 解码消息内容
    pub fn decode_message(&self, content: &Value) -> MessageContent {
        let msgtype = match content.get("msgtype").and_then(Value::as_str) {
            Some(t) => t.to_string(),
            None => return MessageContent::Raw(content.clone()),
        };
        let decoder = self.message_types.read().get(&msgtype).cloned();
        match decoder {
            Some(decode) => match decode(content) {
                Ok(decoded) => decoded,
                Err(e) => {
                    debug!("消息内容解码失败，回退 Raw: msgtype={} err={}", msgtype, e);
                    MessageContent::Raw(content.clone())
                }
            },
            None => MessageContent::Raw(content.clone()),
        }
    }
}

impl Default for EventTypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builtin_text_message() {
        let registry = EventTypeRegistry::new();
        let raw = json!({
            "type": "m.room.message",
            "sender": "@alice:example.org",
            "event_id": "$1:example.org",
            "origin_server_ts": 1_000_000u64,
            "content": {"msgtype": "m.text", "body": "hi"}
        });
        let event = registry.decode_event(&raw);
        assert_eq!(event.event_type, "m.room.message");
        match event.content {
            EventContent::Message(MessageContent::Text(m)) => assert_eq!(m.body, "hi"),
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_event_type_falls_back_to_raw() {
        let registry = EventTypeRegistry::new();
        let raw = json!({
            "type": "com.example.custom",
            "content": {"answer": 42}
        });
        let event = registry.decode_event(&raw);
        match event.content {
            EventContent::Raw(v) => assert_eq!(v["answer"], 42),
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_msgtype_falls_back_to_raw() {
        let registry = EventTypeRegistry::new();
        let content = json!({"msgtype": "m.location", "body": "here", "geo_uri": "geo:1,2"});
        match registry.decode_message(&content) {
            MessageContent::Raw(v) => assert_eq!(v["geo_uri"], "geo:1,2"),
            other => panic!("unexpected content: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_content_falls_back_to_raw() {
        let registry = EventTypeRegistry::new();
        // membership 字段缺失，内置解码器会失败
        let raw = json!({
            "type": "m.room.member",
            "state_key": "@bob:example.org",
            "content": {"displayname": "Bob"}
        });
        let event = registry.decode_event(&raw);
        assert!(matches!(event.content, EventContent::Raw(_)));
    }

    #[test]
    fn test_reregistration_overwrites() {
        let registry = EventTypeRegistry::new();
        registry.register_message_type("m.text", |v| {
            Ok(MessageContent::Notice(serde_json::from_value(v.clone())?))
        });
        let content = json!({"msgtype": "m.text", "body": "now a notice"});
        assert!(matches!(
            registry.decode_message(&content),
            MessageContent::Notice(_)
        ));
    }

    #[test]
    fn test_custom_event_registration() {
        let registry = EventTypeRegistry::new();
        registry.register_event_type("org.example.ping", |v| {
            Ok(EventContent::Raw(json!({"ping": v.clone()})))
        });
        let raw = json!({"type": "org.example.ping", "content": {"seq": 7}});
        let event = registry.decode_event(&raw);
        match event.content {
            EventContent::Raw(v) => assert_eq!(v["ping"]["seq"], 7),
            other => panic!("unexpected content: {:?}", other),
        }
    }
}
