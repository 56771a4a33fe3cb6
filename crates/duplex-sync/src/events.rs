//! 领域事件总线
//!
//! 存储层的每次变更都会发出一个 [`StoreEvent`]，UI 层通过
//! broadcast 订阅增量刷新。事件只描述"发生了什么"，不携带
//! 完整状态快照；订阅方需要全量时直接读存储层。

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

use crate::entities::{
    Call, CallStatus, Conversation, FriendRequest, Friendship, Message, MessageStatus,
    Notification, PresenceStatus,
};
use crate::transport::ConnectionStatus;

/// 存储层事件
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StoreEvent {
    /// 新消息入库（本地乐观插入或远端推送）
    MessageAdded {
        conversation_id: String,
        message: Message,
    },
    /// 消息状态变更
    MessageStatusChanged {
        conversation_id: String,
        message_id: String,
        old_status: MessageStatus,
        new_status: MessageStatus,
    },
    /// 乐观消息被服务端确认，临时 ID 替换为服务端 ID
    MessageConfirmed {
        conversation_id: String,
        local_id: String,
        server_id: String,
    },
    /// 会话新增或元数据更新
    ConversationUpserted { conversation: Conversation },
    /// 会话被删除
    ConversationRemoved { conversation_id: String },
    /// 未读数变更
    UnreadCountChanged {
        conversation_id: String,
        unread_count: u32,
    },
    /// 输入状态变更
    TypingChanged {
        conversation_id: String,
        user_id: String,
        is_typing: bool,
    },
    /// 在线状态变更
    PresenceChanged {
        user_id: String,
        status: PresenceStatus,
    },
    /// 收到好友请求
    FriendRequestReceived { request: FriendRequest },
    /// 好友请求被处理（接受/拒绝）
    FriendRequestResolved {
        request_id: String,
        accepted: bool,
    },
    /// 好友关系建立
    FriendshipAdded { friendship: Friendship },
    /// 好友关系解除
    FriendshipRemoved { friendship_id: String },
    /// 拉黑（双向：自己拉黑别人 / 被别人拉黑）
    UserBlocked {
        blocker_id: String,
        blocked_id: String,
    },
    /// 通话状态变更
    CallStateChanged {
        call_id: String,
        old_status: Option<CallStatus>,
        new_status: CallStatus,
        call: Call,
    },
    /// 新通知入列
    NotificationAdded { notification: Notification },
    /// 连接状态变更
    ConnectionChanged {
        old_status: ConnectionStatus,
        new_status: ConnectionStatus,
    },
    /// 事件流出现 seq 缺口，缺失区间为 [missing_start, missing_end)，
    /// 订阅方应据此触发补拉
    SeqGapDetected {
        missing_start: u64,
        missing_end: u64,
    },
}

impl StoreEvent {
    /// 获取事件类型字符串
    pub fn event_type(&self) -> &'static str {
        match self {
            StoreEvent::MessageAdded { .. } => "message_added",
            StoreEvent::MessageStatusChanged { .. } => "message_status_changed",
            StoreEvent::MessageConfirmed { .. } => "message_confirmed",
            StoreEvent::ConversationUpserted { .. } => "conversation_upserted",
            StoreEvent::ConversationRemoved { .. } => "conversation_removed",
            StoreEvent::UnreadCountChanged { .. } => "unread_count_changed",
            StoreEvent::TypingChanged { .. } => "typing_changed",
            StoreEvent::PresenceChanged { .. } => "presence_changed",
            StoreEvent::FriendRequestReceived { .. } => "friend_request_received",
            StoreEvent::FriendRequestResolved { .. } => "friend_request_resolved",
            StoreEvent::FriendshipAdded { .. } => "friendship_added",
            StoreEvent::FriendshipRemoved { .. } => "friendship_removed",
            StoreEvent::UserBlocked { .. } => "user_blocked",
            StoreEvent::CallStateChanged { .. } => "call_state_changed",
            StoreEvent::NotificationAdded { .. } => "notification_added",
            StoreEvent::ConnectionChanged { .. } => "connection_changed",
            StoreEvent::SeqGapDetected { .. } => "seq_gap_detected",
        }
    }

    /// 获取事件关联的会话ID（与会话无关的事件返回 None）
    pub fn conversation_id(&self) -> Option<&str> {
        match self {
            StoreEvent::MessageAdded {
                conversation_id, ..
            }
            | StoreEvent::MessageStatusChanged {
                conversation_id, ..
            }
            | StoreEvent::MessageConfirmed {
                conversation_id, ..
            }
            | StoreEvent::ConversationRemoved { conversation_id }
            | StoreEvent::UnreadCountChanged {
                conversation_id, ..
            }
            | StoreEvent::TypingChanged {
                conversation_id, ..
            } => Some(conversation_id),
            StoreEvent::ConversationUpserted { conversation } => Some(&conversation.id),
            _ => None,
        }
    }
}

/// 事件过滤器
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    /// 事件类型过滤器
    pub event_types: Option<Vec<String>>,
    /// 会话ID过滤器
    pub conversation_ids: Option<Vec<String>>,
}

impl EventFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_event_types(mut self, event_types: Vec<String>) -> Self {
        self.event_types = Some(event_types);
        self
    }

    pub fn with_conversation_ids(mut self, conversation_ids: Vec<String>) -> Self {
        self.conversation_ids = Some(conversation_ids);
        self
    }

    /// 检查事件是否匹配过滤器
    pub fn matches(&self, event: &StoreEvent) -> bool {
        if let Some(ref types) = self.event_types {
            if !types.iter().any(|t| t == event.event_type()) {
                return false;
            }
        }

        if let Some(ref ids) = self.conversation_ids {
            match event.conversation_id() {
                Some(id) if ids.iter().any(|c| c == id) => {}
                // 事件没有会话ID但过滤器要求有
                _ => return false,
            }
        }

        true
    }
}

/// 事件统计信息
#[derive(Debug, Clone, Default)]
pub struct EventStats {
    /// 总事件数
    pub total_events: u64,
    /// 按类型分组的事件数
    pub events_by_type: HashMap<String, u64>,
}

/// 事件总线
///
/// 存储层持有一个 `EventBus`，所有变更通过 [`EventBus::emit`] 广播。
/// emit 是同步的，保证与存储变更在同一临界区外立即可见。
pub struct EventBus {
    sender: broadcast::Sender<StoreEvent>,
    stats: Arc<parking_lot::RwLock<EventStats>>,
}

impl EventBus {
    /// 创建新的事件总线
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender,
            stats: Arc::new(parking_lot::RwLock::new(EventStats::default())),
        }
    }

    /// 发布事件
    pub fn emit(&self, event: StoreEvent) {
        debug!("Emitting store event: {}", event.event_type());

        {
            let mut stats = self.stats.write();
            stats.total_events += 1;
            *stats
                .events_by_type
                .entry(event.event_type().to_string())
                .or_insert(0) += 1;
        }

        // 无订阅者时 send 失败属正常场景（如 headless 测试），仅打 debug
        if let Err(e) = self.sender.send(event) {
            debug!("No active receivers for store event: {}", e);
        }
    }

    /// 订阅全部事件
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.sender.subscribe()
    }

    /// 订阅过滤后的事件
    pub fn subscribe_filtered(&self, filter: EventFilter) -> FilteredEventReceiver {
        FilteredEventReceiver {
            receiver: self.sender.subscribe(),
            filter,
        }
    }

    /// 获取事件统计
    pub fn stats(&self) -> EventStats {
        self.stats.read().clone()
    }

    /// 获取活跃订阅者数量
    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// 过滤事件接收器
pub struct FilteredEventReceiver {
    receiver: broadcast::Receiver<StoreEvent>,
    filter: EventFilter,
}

impl FilteredEventReceiver {
    /// 接收下一个匹配的事件
    pub async fn recv(&mut self) -> Result<StoreEvent, broadcast::error::RecvError> {
        loop {
            let event = self.receiver.recv().await?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }

    /// 尝试接收事件（非阻塞）
    pub fn try_recv(&mut self) -> Result<StoreEvent, broadcast::error::TryRecvError> {
        loop {
            let event = self.receiver.try_recv()?;
            if self.filter.matches(&event) {
                return Ok(event);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn typing_event(conversation_id: &str) -> StoreEvent {
        StoreEvent::TypingChanged {
            conversation_id: conversation_id.to_string(),
            user_id: "u1".to_string(),
            is_typing: true,
        }
    }

    #[tokio::test]
    async fn test_event_bus_basic_functionality() {
        let bus = EventBus::new(100);
        let mut receiver = bus.subscribe();

        bus.emit(typing_event("c1"));

        let received = receiver.recv().await.unwrap();
        assert_eq!(received.event_type(), "typing_changed");
        assert_eq!(received.conversation_id(), Some("c1"));

        let stats = bus.stats();
        assert_eq!(stats.total_events, 1);
        assert_eq!(stats.events_by_type.get("typing_changed"), Some(&1));
    }

    #[tokio::test]
    async fn test_event_filter() {
        let bus = EventBus::new(100);

        let filter = EventFilter::new()
            .with_event_types(vec!["typing_changed".to_string()])
            .with_conversation_ids(vec!["c1".to_string()]);
        let mut filtered = bus.subscribe_filtered(filter);

        bus.emit(typing_event("c2")); // 会话不匹配
        bus.emit(typing_event("c1")); // 匹配

        let received = filtered.recv().await.unwrap();
        assert_eq!(received.conversation_id(), Some("c1"));
    }

    #[tokio::test]
    async fn test_multiple_subscribers() {
        let bus = EventBus::new(100);
        let mut r1 = bus.subscribe();
        let mut r2 = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(typing_event("c1"));

        assert_eq!(r1.recv().await.unwrap().event_type(), "typing_changed");
        assert_eq!(r2.recv().await.unwrap().event_type(), "typing_changed");
    }

    #[test]
    fn test_filter_requires_conversation_id() {
        let filter = EventFilter::new().with_conversation_ids(vec!["c1".to_string()]);
        let event = StoreEvent::PresenceChanged {
            user_id: "u1".to_string(),
            status: crate::entities::PresenceStatus::Online,
        };
        // 事件没有会话维度，要求会话过滤时不匹配
        assert!(!filter.matches(&event));
    }
}
