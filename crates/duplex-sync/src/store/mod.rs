//! 领域存储层
//!
//! 客户端全部会话态的唯一权威副本。所有变更方法都是同步的、
//! 运行到完成：拿写锁、改状态、放锁、发事件，中间不做 IO、
//! 不 await。UI 层读快照，订阅 [`crate::events::EventBus`] 做增量刷新。
//!
//! 存储实例由引擎构造后注入各处（Arc 共享），不提供全局单例。

mod calls;
mod conversations;
mod friends;
mod notifications;
mod outbox;
mod presence;

pub use calls::CallOutcome;
pub use friends::{FriendshipStatus, Permission};
pub use outbox::{LocalMutation, MutationState};

use std::collections::{HashMap, HashSet, VecDeque};
use std::time::Duration;

use parking_lot::RwLock;

use crate::entities::{
    BlockedUser, Call, Conversation, FriendRequest, Friendship, Message, Notification,
    UserPresence,
};
use crate::events::EventBus;
use outbox::Outbox;

/// 存储配置
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// 最近通话保留条数
    pub recent_calls_capacity: usize,
    /// 通知去重时间窗
    pub notification_dedup_window: Duration,
    /// 事件总线容量
    pub event_capacity: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            recent_calls_capacity: 10,
            notification_dedup_window: Duration::from_secs(30),
            event_capacity: 256,
        }
    }
}

/// 内部状态（统一放在一把写锁下，保证跨集合变更的原子性）
#[derive(Default)]
pub(crate) struct StoreState {
    /// 会话 (conversation_id -> Conversation)
    pub(crate) conversations: HashMap<String, Conversation>,
    /// 每会话消息列表，按 created_at 升序
    pub(crate) messages: HashMap<String, Vec<Message>>,
    /// 每会话正在输入的用户
    pub(crate) typing: HashMap<String, HashSet<String>>,
    /// 当前打开的会话
    pub(crate) active_conversation: Option<String>,
    /// 好友请求（含 pending 与已处理）
    pub(crate) friend_requests: Vec<FriendRequest>,
    /// 好友关系
    pub(crate) friendships: Vec<Friendship>,
    /// 自己拉黑的用户
    pub(crate) blocked: Vec<BlockedUser>,
    /// 拉黑了自己的用户
    pub(crate) blocked_by: HashSet<String>,
    /// 在线状态 (user_id -> UserPresence)
    pub(crate) presence: HashMap<String, UserPresence>,
    /// 当前通话（至多一个）
    pub(crate) active_call: Option<Call>,
    /// 最近通话，新的在前
    pub(crate) recent_calls: VecDeque<Call>,
    /// 通知列表，新的在前
    pub(crate) notifications: VecDeque<Notification>,
    /// 乐观变更账本
    pub(crate) outbox: Outbox,
}

/// 消息领域存储
pub struct MessagingStore {
    pub(crate) state: RwLock<StoreState>,
    bus: EventBus,
    current_user_id: String,
    pub(crate) config: StoreConfig,
}

impl MessagingStore {
    /// 创建存储实例
    ///
    /// `current_user_id` 是已鉴权用户的 ID，消息归属、未读计数、
    /// 权限判断全部以它为准。
    pub fn new(current_user_id: impl Into<String>, config: StoreConfig) -> Self {
        Self {
            state: RwLock::new(StoreState::default()),
            bus: EventBus::new(config.event_capacity),
            current_user_id: current_user_id.into(),
            config,
        }
    }

    /// 事件总线
    pub fn events(&self) -> &EventBus {
        &self.bus
    }

    /// 已鉴权用户 ID
    pub fn current_user_id(&self) -> &str {
        &self.current_user_id
    }

    pub(crate) fn emit(&self, event: crate::events::StoreEvent) {
        self.bus.emit(event);
    }

    /// 清空全部会话态（登出时调用）
    pub fn reset(&self) {
        let mut state = self.state.write();
        *state = StoreState::default();
    }

    /// 清空易失状态（重连后调用：输入指示是瞬时的，断线期间的
    /// typing_stop 可能已丢失）
    pub fn reset_volatile(&self) {
        let mut state = self.state.write();
        state.typing.clear();
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use crate::entities::*;
    use chrono::{TimeZone, Utc};

    pub fn store() -> MessagingStore {
        MessagingStore::new("me", StoreConfig::default())
    }

    pub fn user(id: &str) -> UserRef {
        UserRef::new(id, format!("User {}", id), format!("user_{}", id))
    }

    pub fn conversation(id: &str, a: &str, b: &str) -> Conversation {
        let at = Utc.timestamp_opt(1_700_000_000, 0).single().unwrap();
        Conversation {
            id: id.to_string(),
            participant1: user(a),
            participant2: user(b),
            last_message: None,
            last_message_at: at,
            unread_count: 0,
            is_archived: false,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn message(id: &str, conversation_id: &str, sender: &str, at_secs: i64) -> Message {
        let at = Utc.timestamp_opt(at_secs, 0).single().unwrap();
        Message {
            id: id.to_string(),
            conversation_id: conversation_id.to_string(),
            sender: user(sender),
            content: format!("msg {}", id),
            message_type: MessageType::Text,
            status: MessageStatus::Sent,
            delivered_at: None,
            read_at: None,
            created_at: at,
            updated_at: at,
        }
    }

    pub fn call(id: &str, caller: &str, callee: &str, status: CallStatus) -> Call {
        Call {
            id: id.to_string(),
            caller: user(caller),
            callee: user(callee),
            call_type: CallType::Voice,
            status,
            started_at: None,
            ended_at: None,
            duration_secs: None,
            created_at: Utc::now(),
        }
    }
}
