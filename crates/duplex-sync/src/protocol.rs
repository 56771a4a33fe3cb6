//! WebSocket 线协议
//!
//! 帧格式为 JSON：`{type, payload, timestamp, seq}`。
//! `seq` 是服务端按连接递增的游标（可选字段，老服务端不下发），
//! 去重过滤器用它做重复与缺口检测。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::entities::{Call, FriendRequest, Friendship, Message, PresenceStatus};

/// 已识别的事件类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    Message,
    TypingStart,
    TypingStop,
    PresenceUpdate,
    CallRequest,
    CallResponse,
    CallEnd,
    MessageRead,
    UserBlocked,
    ConversationDeleted,
    FriendRequest,
    FriendRequestAccepted,
    FriendRequestDeclined,
    FriendRemoved,
    Ping,
    Pong,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::Message => "message",
            EventKind::TypingStart => "typing_start",
            EventKind::TypingStop => "typing_stop",
            EventKind::PresenceUpdate => "presence_update",
            EventKind::CallRequest => "call_request",
            EventKind::CallResponse => "call_response",
            EventKind::CallEnd => "call_end",
            EventKind::MessageRead => "message_read",
            EventKind::UserBlocked => "user_blocked",
            EventKind::ConversationDeleted => "conversation_deleted",
            EventKind::FriendRequest => "friend_request",
            EventKind::FriendRequestAccepted => "friend_request_accepted",
            EventKind::FriendRequestDeclined => "friend_request_declined",
            EventKind::FriendRemoved => "friend_removed",
            EventKind::Ping => "ping",
            EventKind::Pong => "pong",
        }
    }

    /// 解析事件类型字符串；未识别的类型返回 None（调用方记 warn 后丢弃）
    pub fn parse(s: &str) -> Option<EventKind> {
        let kind = match s {
            "message" => EventKind::Message,
            "typing_start" => EventKind::TypingStart,
            "typing_stop" => EventKind::TypingStop,
            "presence_update" => EventKind::PresenceUpdate,
            "call_request" => EventKind::CallRequest,
            "call_response" => EventKind::CallResponse,
            "call_end" => EventKind::CallEnd,
            "message_read" => EventKind::MessageRead,
            "user_blocked" => EventKind::UserBlocked,
            "conversation_deleted" => EventKind::ConversationDeleted,
            "friend_request" => EventKind::FriendRequest,
            "friend_request_accepted" => EventKind::FriendRequestAccepted,
            "friend_request_declined" => EventKind::FriendRequestDeclined,
            "friend_removed" => EventKind::FriendRemoved,
            "ping" => EventKind::Ping,
            "pong" => EventKind::Pong,
            _ => return None,
        };
        Some(kind)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 线上帧
///
/// `kind` 保留原始字符串，未识别的类型才能原样进日志。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WsFrame {
    #[serde(rename = "type")]
    pub kind: String,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl WsFrame {
    /// 构造出站帧，时间戳取构造时刻
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self {
            kind: kind.as_str().to_string(),
            payload,
            timestamp: Utc::now(),
            seq: None,
        }
    }

    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.kind)
    }

    /// 反序列化类型化 payload；结构不匹配返回 None（调用方丢弃该帧）
    pub fn payload_as<T: for<'de> Deserialize<'de>>(&self) -> Option<T> {
        serde_json::from_value(self.payload.clone()).ok()
    }

    // ---- 出站帧构造（对应原生 createWSMessage 系列） ----

    pub fn ping() -> Self {
        Self::new(EventKind::Ping, Value::Object(Default::default()))
    }

    pub fn pong() -> Self {
        Self::new(EventKind::Pong, Value::Object(Default::default()))
    }

    pub fn typing_start(conversation_id: &str, user_id: &str) -> Self {
        Self::new(
            EventKind::TypingStart,
            serde_json::json!({ "conversation_id": conversation_id, "user_id": user_id }),
        )
    }

    pub fn typing_stop(conversation_id: &str, user_id: &str) -> Self {
        Self::new(
            EventKind::TypingStop,
            serde_json::json!({ "conversation_id": conversation_id, "user_id": user_id }),
        )
    }

    pub fn presence_update(user_id: &str, status: PresenceStatus) -> Self {
        Self::new(
            EventKind::PresenceUpdate,
            serde_json::json!({ "user_id": user_id, "status": status }),
        )
    }

    pub fn message_read(conversation_id: &str, user_id: &str, message_ids: &[String]) -> Self {
        Self::new(
            EventKind::MessageRead,
            serde_json::json!({
                "conversation_id": conversation_id,
                "user_id": user_id,
                "message_ids": message_ids,
                "read_at": Utc::now(),
            }),
        )
    }
}

// ---- 类型化入站 payload ----

#[derive(Debug, Clone, Deserialize)]
pub struct MessagePayload {
    pub message: Message,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TypingPayload {
    pub conversation_id: String,
    pub user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PresencePayload {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MessageReadPayload {
    pub conversation_id: String,
    pub user_id: String,
    pub read_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallRequestPayload {
    pub call: Call,
}

/// 通话应答
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CallResponseKind {
    Accepted,
    Declined,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallResponsePayload {
    pub call_id: String,
    pub response: CallResponseKind,
    pub caller_id: String,
    pub callee_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallEndPayload {
    pub call_id: String,
    pub duration: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FriendRequestPayload {
    pub friend_request: FriendRequest,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FriendResponsePayload {
    pub friend_request_id: String,
    pub requester_id: String,
    pub recipient_id: String,
    /// accepted 时服务端随帧下发新建的好友关系
    pub friendship: Option<Friendship>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct FriendRemovedPayload {
    pub friendship_id: String,
    pub removed_by_id: String,
    pub removed_user_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserBlockedPayload {
    pub blocked_user_id: String,
    pub blocker_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConversationDeletedPayload {
    pub conversation_id: String,
    pub deleted_by_id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = WsFrame::typing_start("c1", "u2");
        let json = serde_json::to_string(&frame).unwrap();
        let parsed: WsFrame = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.event_kind(), Some(EventKind::TypingStart));
        let payload: TypingPayload = parsed.payload_as().unwrap();
        assert_eq!(payload.conversation_id, "c1");
        assert_eq!(payload.user_id, "u2");
    }

    #[test]
    fn test_unknown_kind_preserved() {
        let json = r#"{"type":"mystery_event","payload":{},"timestamp":"2024-01-01T00:00:00Z"}"#;
        let frame: WsFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.event_kind(), None);
        assert_eq!(frame.kind, "mystery_event");
        assert_eq!(frame.seq, None);
    }

    #[test]
    fn test_seq_roundtrip() {
        let json = r#"{"type":"ping","payload":{},"timestamp":"2024-01-01T00:00:00Z","seq":7}"#;
        let frame: WsFrame = serde_json::from_str(json).unwrap();
        assert_eq!(frame.seq, Some(7));

        // 出站帧不带 seq 字段
        let out = serde_json::to_string(&WsFrame::pong()).unwrap();
        assert!(!out.contains("seq"));
    }

    #[test]
    fn test_message_read_matches_inbound_schema() {
        // 出站已读回执必须能按入站 schema 解出 user_id 和 read_at
        let frame = WsFrame::message_read("c1", "u1", &["m1".to_string(), "m2".to_string()]);
        let payload: MessageReadPayload = frame.payload_as().unwrap();
        assert_eq!(payload.conversation_id, "c1");
        assert_eq!(payload.user_id, "u1");
        assert!(payload.read_at.is_some());
    }

    #[test]
    fn test_event_kind_parse_all() {
        for kind in [
            "message",
            "typing_start",
            "typing_stop",
            "presence_update",
            "call_request",
            "call_response",
            "call_end",
            "message_read",
            "user_blocked",
            "conversation_deleted",
            "friend_request",
            "friend_request_accepted",
            "friend_request_declined",
            "friend_removed",
            "ping",
            "pong",
        ] {
            let parsed = EventKind::parse(kind).unwrap();
            assert_eq!(parsed.as_str(), kind);
        }
        assert!(EventKind::parse("nope").is_none());
    }
}
