//! 领域实体定义
//!
//! 客户端内存缓存中的全部实体：会话、消息、好友关系、好友请求、
//! 拉黑记录、在线状态、通话、通知。所有集合由 [`crate::store::MessagingStore`]
//! 独占持有，外部只能通过 store 的 action 方法修改。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 用户引用（实体里内嵌的参与者信息）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRef {
    pub id: String,
    pub name: String,
    pub username: String,
}

impl UserRef {
    pub fn new(id: impl Into<String>, name: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            username: username.into(),
        }
    }
}

/// 消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    CallStart,
    CallEnd,
    System,
}

/// 消息投递状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    /// 发送中（乐观写入，尚未得到服务端确认）
    Sending,
    /// 已发送（服务端已确认并分配 ID）
    Sent,
    /// 已送达对端
    Delivered,
    /// 对端已读
    Read,
    /// 发送失败（可重试）
    Failed,
}

impl MessageStatus {
    /// 检查是否可以从当前状态转换到目标状态
    pub fn can_transition_to(&self, target: MessageStatus) -> bool {
        matches!(
            (self, target),
            (MessageStatus::Sending, MessageStatus::Sent)
                | (MessageStatus::Sent, MessageStatus::Delivered)
                | (MessageStatus::Delivered, MessageStatus::Read)
                | (MessageStatus::Sent, MessageStatus::Read)
                | (MessageStatus::Sending, MessageStatus::Failed)
                | (MessageStatus::Failed, MessageStatus::Sending)
        )
    }

    pub fn is_send_failed(&self) -> bool {
        matches!(self, MessageStatus::Failed)
    }
}

/// 消息
///
/// `id` 在服务端确认前是客户端临时 ID（uuid v4），确认时被服务端 ID
/// 原子替换，绝不产生重复记录。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub sender: UserRef,
    pub content: String,
    pub message_type: MessageType,
    pub status: MessageStatus,
    pub delivered_at: Option<DateTime<Utc>>,
    pub read_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 会话（严格两个不同参与者）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub participant1: UserRef,
    pub participant2: UserRef,
    pub last_message: Option<Message>,
    pub last_message_at: DateTime<Utc>,
    pub unread_count: u32,
    pub is_archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    /// 取会话中非 current_user 的另一方
    pub fn other_participant(&self, current_user_id: &str) -> &UserRef {
        if self.participant1.id == current_user_id {
            &self.participant2
        } else {
            &self.participant1
        }
    }

    /// 用户是否是会话参与者
    pub fn involves(&self, user_id: &str) -> bool {
        self.participant1.id == user_id || self.participant2.id == user_id
    }
}

/// 好友请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FriendRequestStatus {
    Pending,
    Accepted,
    Declined,
}

/// 好友请求
///
/// 不变式：同一有序对 (requester, recipient) 同时至多一条 pending 记录。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FriendRequest {
    pub id: String,
    pub requester: UserRef,
    pub recipient: UserRef,
    pub status: FriendRequestStatus,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// 好友关系（只表示 accepted；pending 状态在 FriendRequest 里）
///
/// 对称关系：user1/user2 的顺序没有语义。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Friendship {
    pub id: String,
    pub user1: UserRef,
    pub user2: UserRef,
    pub created_at: DateTime<Utc>,
}

impl Friendship {
    pub fn involves(&self, user_id: &str) -> bool {
        self.user1.id == user_id || self.user2.id == user_id
    }

    /// 是否连接这两个用户（顺序无关）
    pub fn connects(&self, a: &str, b: &str) -> bool {
        (self.user1.id == a && self.user2.id == b) || (self.user1.id == b && self.user2.id == a)
    }
}

/// 拉黑记录
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BlockedUser {
    pub id: String,
    pub blocked_user: UserRef,
    pub blocked_at: DateTime<Utc>,
}

/// 用户在线状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    InCall,
    Offline,
}

/// 在线状态记录（按 user_id 键控，last-write-wins）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserPresence {
    pub user_id: String,
    pub status: PresenceStatus,
    pub last_seen_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// 通话类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallType {
    Voice,
    Video,
}

/// 通话状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    Pending,
    Ringing,
    Accepted,
    Declined,
    Ended,
    Failed,
}

impl CallStatus {
    /// 终态（进入后通话记录只会被归档，不再变化）
    pub fn is_terminal(&self) -> bool {
        matches!(self, CallStatus::Declined | CallStatus::Ended | CallStatus::Failed)
    }
}

/// 通话
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Call {
    pub id: String,
    pub caller: UserRef,
    pub callee: UserRef,
    pub call_type: CallType,
    pub status: CallStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
    /// 通话时长（整秒）
    pub duration_secs: Option<u64>,
    pub created_at: DateTime<Utc>,
}

impl Call {
    /// 以 started_at 为起点计算到 now 的时长（整秒）
    pub fn duration_until(&self, now: DateTime<Utc>) -> u64 {
        match self.started_at {
            Some(started) => (now - started).num_seconds().max(0) as u64,
            None => 0,
        }
    }
}

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Message,
    FriendRequest,
    Call,
    System,
}

/// 应用内通知
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Notification {
    pub id: String,
    pub user_id: String,
    pub kind: NotificationKind,
    pub title: String,
    pub content: String,
    /// 关联实体 ID（会话/请求/通话）
    pub related_id: Option<String>,
    pub is_read: bool,
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_message_status_transitions() {
        // 有效转换
        assert!(MessageStatus::Sending.can_transition_to(MessageStatus::Sent));
        assert!(MessageStatus::Sent.can_transition_to(MessageStatus::Delivered));
        assert!(MessageStatus::Delivered.can_transition_to(MessageStatus::Read));
        assert!(MessageStatus::Sending.can_transition_to(MessageStatus::Failed));
        assert!(MessageStatus::Failed.can_transition_to(MessageStatus::Sending));

        // 无效转换
        assert!(!MessageStatus::Read.can_transition_to(MessageStatus::Sending));
        assert!(!MessageStatus::Sent.can_transition_to(MessageStatus::Sending));
        assert!(!MessageStatus::Failed.can_transition_to(MessageStatus::Read));
    }

    #[test]
    fn test_call_terminal_states() {
        assert!(CallStatus::Ended.is_terminal());
        assert!(CallStatus::Declined.is_terminal());
        assert!(CallStatus::Failed.is_terminal());
        assert!(!CallStatus::Pending.is_terminal());
        assert!(!CallStatus::Ringing.is_terminal());
        assert!(!CallStatus::Accepted.is_terminal());
    }

    #[test]
    fn test_conversation_other_participant() {
        let conv = Conversation {
            id: "c1".into(),
            participant1: UserRef::new("u1", "Alice", "alice"),
            participant2: UserRef::new("u2", "Bob", "bob"),
            last_message: None,
            last_message_at: Utc::now(),
            unread_count: 0,
            is_archived: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };

        assert_eq!(conv.other_participant("u1").id, "u2");
        assert_eq!(conv.other_participant("u2").id, "u1");
        assert!(conv.involves("u1"));
        assert!(!conv.involves("u3"));
    }
}
