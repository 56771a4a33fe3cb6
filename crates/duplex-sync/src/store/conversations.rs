//! 会话与消息
//!
//! 维护两大不变式：
//! - 消息列表按 created_at 升序（同时刻按 id 定序），会话列表按
//!   last_message_at 降序；
//! - unread_count 只统计对方发来且自己未读的消息，自己发的消息
//!   永不计入未读。
//!
//! 乐观发送：本地先以临时 uuid 入列（Sending），服务端确认时
//! 原子替换为服务端 ID，绝不产生第二条记录。

use chrono::Utc;
use tracing::{debug, warn};
use uuid::Uuid;

use super::MessagingStore;
use crate::entities::{Conversation, Message, MessageStatus, MessageType, UserRef};
use crate::events::StoreEvent;

impl MessagingStore {
    // ---- 会话 ----

    /// 初始加载会话列表（覆盖式）
    pub fn set_conversations(&self, conversations: Vec<Conversation>) {
        let mut state = self.state.write();
        state.conversations = conversations
            .into_iter()
            .map(|c| (c.id.clone(), c))
            .collect();
    }

    /// 会话快照，按 last_message_at 降序
    pub fn conversations(&self) -> Vec<Conversation> {
        let state = self.state.read();
        let mut list: Vec<Conversation> = state.conversations.values().cloned().collect();
        list.sort_by(|a, b| {
            b.last_message_at
                .cmp(&a.last_message_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        list
    }

    pub fn conversation(&self, conversation_id: &str) -> Option<Conversation> {
        self.state.read().conversations.get(conversation_id).cloned()
    }

    /// 当前打开的会话（打开即自动清未读由调用方决定）
    pub fn active_conversation(&self) -> Option<String> {
        self.state.read().active_conversation.clone()
    }

    pub fn set_active_conversation(&self, conversation_id: Option<String>) {
        self.state.write().active_conversation = conversation_id;
    }

    /// 归档/取消归档
    pub fn set_archived(&self, conversation_id: &str, archived: bool) -> bool {
        let mut state = self.state.write();
        match state.conversations.get_mut(conversation_id) {
            Some(conversation) => {
                conversation.is_archived = archived;
                conversation.updated_at = Utc::now();
                true
            }
            None => false,
        }
    }

    /// 会话列表视图：归档开关 + 按对方名字/用户名/最后消息全文过滤
    pub fn filtered_conversations(&self, query: Option<&str>, archived: bool) -> Vec<Conversation> {
        let query = query.map(str::to_lowercase);
        self.conversations()
            .into_iter()
            .filter(|c| c.is_archived == archived)
            .filter(|c| match &query {
                None => true,
                Some(q) if q.is_empty() => true,
                Some(q) => {
                    let other = c.other_participant(self.current_user_id());
                    other.name.to_lowercase().contains(q)
                        || other.username.to_lowercase().contains(q)
                        || c.last_message
                            .as_ref()
                            .map(|m| m.content.to_lowercase().contains(q))
                            .unwrap_or(false)
                }
            })
            .collect()
    }

    /// 全部会话未读数总和
    pub fn total_unread_count(&self) -> u32 {
        self.state
            .read()
            .conversations
            .values()
            .map(|c| c.unread_count)
            .sum()
    }

    /// 新增或更新会话元数据
    pub fn upsert_conversation(&self, conversation: Conversation) {
        {
            let mut state = self.state.write();
            state
                .conversations
                .insert(conversation.id.clone(), conversation.clone());
        }
        self.emit(StoreEvent::ConversationUpserted { conversation });
    }

    /// 删除会话，连带消息、输入指示与账本条目（单次写锁内完成）
    pub fn remove_conversation(&self, conversation_id: &str) -> bool {
        let removed = {
            let mut state = self.state.write();
            let removed = state.conversations.remove(conversation_id).is_some();
            if removed {
                state.messages.remove(conversation_id);
                state.typing.remove(conversation_id);
                state.outbox.remove_conversation(conversation_id);
                if state.active_conversation.as_deref() == Some(conversation_id) {
                    state.active_conversation = None;
                }
            }
            removed
        };
        if removed {
            self.emit(StoreEvent::ConversationRemoved {
                conversation_id: conversation_id.to_string(),
            });
        }
        removed
    }

    // ---- 消息 ----

    /// 初始加载某会话的消息（覆盖式，入库前排序）
    pub fn set_messages(&self, conversation_id: &str, mut messages: Vec<Message>) {
        sort_messages(&mut messages);
        let mut state = self.state.write();
        state
            .messages
            .insert(conversation_id.to_string(), messages);
    }

    /// 消息快照，按 created_at 升序
    pub fn messages(&self, conversation_id: &str) -> Vec<Message> {
        self.state
            .read()
            .messages
            .get(conversation_id)
            .cloned()
            .unwrap_or_default()
    }

    /// 乐观发送：本地立刻入列，返回待上行的消息
    ///
    /// 消息以临时 uuid 入列、状态 Sending，并在账本登记 Pending。
    /// 自己发的消息不计未读。
    pub fn send_message(
        &self,
        conversation_id: &str,
        content: impl Into<String>,
        message_type: MessageType,
    ) -> Option<Message> {
        let now = Utc::now();
        let message = {
            let mut state = self.state.write();
            let Some(conversation) = state.conversations.get(conversation_id) else {
                warn!("向未知会话发送消息被忽略: {}", conversation_id);
                return None;
            };
            let sender = own_ref(conversation, self.current_user_id());

            let message = Message {
                id: Uuid::new_v4().to_string(),
                conversation_id: conversation_id.to_string(),
                sender,
                content: content.into(),
                message_type,
                status: MessageStatus::Sending,
                delivered_at: None,
                read_at: None,
                created_at: now,
                updated_at: now,
            };

            state.outbox.register(&message.id, conversation_id);
            insert_sorted(
                state.messages.entry(conversation_id.to_string()).or_default(),
                message.clone(),
            );
            if let Some(conversation) = state.conversations.get_mut(conversation_id) {
                conversation.last_message = Some(message.clone());
                conversation.last_message_at = now;
                conversation.updated_at = now;
            }
            message
        };

        self.emit(StoreEvent::MessageAdded {
            conversation_id: conversation_id.to_string(),
            message: message.clone(),
        });
        Some(message)
    }

    /// 服务端确认乐观消息：临时 ID 原子替换为服务端 ID
    pub fn confirm_message(&self, local_id: &str, server_id: &str) -> bool {
        let event = {
            let mut state = self.state.write();
            let Some(conversation_id) = state
                .outbox
                .get(local_id)
                .map(|m| m.conversation_id.clone())
            else {
                debug!("确认了账本外的消息: {}", local_id);
                return false;
            };

            if !state.outbox.confirm(local_id, server_id) {
                return false;
            }

            let now = Utc::now();
            if let Some(messages) = state.messages.get_mut(&conversation_id) {
                if let Some(message) = messages.iter_mut().find(|m| m.id == local_id) {
                    message.id = server_id.to_string();
                    if message.status.can_transition_to(MessageStatus::Sent) {
                        message.status = MessageStatus::Sent;
                    }
                    message.updated_at = now;
                }
            }
            if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
                if let Some(last) = conversation.last_message.as_mut() {
                    if last.id == local_id {
                        last.id = server_id.to_string();
                        last.status = MessageStatus::Sent;
                    }
                }
            }

            StoreEvent::MessageConfirmed {
                conversation_id,
                local_id: local_id.to_string(),
                server_id: server_id.to_string(),
            }
        };
        self.emit(event);
        true
    }

    /// 乐观消息发送失败，保留在列表里供重试
    pub fn fail_message(&self, local_id: &str, error: &str) -> bool {
        let event = {
            let mut state = self.state.write();
            let Some(conversation_id) = state
                .outbox
                .get(local_id)
                .map(|m| m.conversation_id.clone())
            else {
                return false;
            };
            state.outbox.fail(local_id, error);

            let mut old_status = None;
            if let Some(messages) = state.messages.get_mut(&conversation_id) {
                if let Some(message) = messages.iter_mut().find(|m| m.id == local_id) {
                    if message.status.can_transition_to(MessageStatus::Failed) {
                        old_status = Some(message.status);
                        message.status = MessageStatus::Failed;
                        message.updated_at = Utc::now();
                    }
                }
            }
            let Some(old_status) = old_status else {
                return false;
            };
            StoreEvent::MessageStatusChanged {
                conversation_id,
                message_id: local_id.to_string(),
                old_status,
                new_status: MessageStatus::Failed,
            }
        };
        warn!("消息发送失败: id={} err={}", local_id, error);
        self.emit(event);
        true
    }

    /// 重试失败消息：Failed 回到 Sending，返回待重发的消息
    pub fn retry_message(&self, local_id: &str) -> Option<Message> {
        let (message, event) = {
            let mut state = self.state.write();
            let conversation_id = state.outbox.get(local_id)?.conversation_id.clone();
            if !state.outbox.retry(local_id) {
                return None;
            }
            let messages = state.messages.get_mut(&conversation_id)?;
            let message = messages.iter_mut().find(|m| m.id == local_id)?;
            if !message.status.can_transition_to(MessageStatus::Sending) {
                return None;
            }
            message.status = MessageStatus::Sending;
            message.updated_at = Utc::now();
            let message = message.clone();
            (
                message.clone(),
                StoreEvent::MessageStatusChanged {
                    conversation_id,
                    message_id: local_id.to_string(),
                    old_status: MessageStatus::Failed,
                    new_status: MessageStatus::Sending,
                },
            )
        };
        self.emit(event);
        Some(message)
    }

    /// 远端推送的消息入库（幂等）
    ///
    /// 同 ID 消息重复推送只生效一次；自己乐观发送后服务端回推的
    /// 同一条消息（server_id 已在账本确认）也不会二次入库。
    /// 对方发来的消息未读数 +1，自己的回显不计。
    pub fn apply_incoming_message(&self, message: Message) -> bool {
        let conversation_id = message.conversation_id.clone();
        let mut events = Vec::new();

        let applied = {
            let mut state = self.state.write();

            let already_known = state
                .messages
                .get(&conversation_id)
                .map(|msgs| msgs.iter().any(|m| m.id == message.id))
                .unwrap_or(false)
                || state.outbox.is_confirmed_server_id(&message.id);
            if already_known {
                debug!("忽略已入库的消息: {}", message.id);
                return false;
            }

            if !state.conversations.contains_key(&conversation_id) {
                // 消息先于会话列表到达：据消息内容建骨架会话
                let skeleton = skeleton_conversation(&message, self.current_user_id());
                warn!("收到未知会话的消息，创建骨架会话: {}", conversation_id);
                state
                    .conversations
                    .insert(conversation_id.clone(), skeleton.clone());
                events.push(StoreEvent::ConversationUpserted {
                    conversation: skeleton,
                });
            }

            let from_other = message.sender.id != self.current_user_id();
            insert_sorted(
                state.messages.entry(conversation_id.clone()).or_default(),
                message.clone(),
            );

            if let Some(conversation) = state.conversations.get_mut(&conversation_id) {
                if message.created_at >= conversation.last_message_at {
                    conversation.last_message = Some(message.clone());
                    conversation.last_message_at = message.created_at;
                }
                conversation.updated_at = Utc::now();
                if from_other {
                    conversation.unread_count += 1;
                    events.push(StoreEvent::UnreadCountChanged {
                        conversation_id: conversation_id.clone(),
                        unread_count: conversation.unread_count,
                    });
                }
            }
            events.push(StoreEvent::MessageAdded {
                conversation_id: conversation_id.clone(),
                message,
            });
            true
        };

        for event in events {
            self.emit(event);
        }
        applied
    }

    /// 本地已读：对方消息置为已读，未读数按剩余未读重算
    ///
    /// message_ids 为 None 时作用于会话内全部对方消息。
    /// 上行 message_read 帧由引擎负责，这里只改本地状态。
    pub fn mark_conversation_read(
        &self,
        conversation_id: &str,
        message_ids: Option<&[String]>,
    ) -> Vec<String> {
        let (read_ids, events) = {
            let mut state = self.state.write();
            let now = Utc::now();
            let mut read_ids = Vec::new();
            let mut events = Vec::new();

            if let Some(messages) = state.messages.get_mut(conversation_id) {
                for message in messages.iter_mut() {
                    if message.sender.id == self.current_user_id() || message.read_at.is_some() {
                        continue;
                    }
                    if let Some(ids) = message_ids {
                        if !ids.contains(&message.id) {
                            continue;
                        }
                    }
                    if message.status.can_transition_to(MessageStatus::Read) {
                        let old_status = message.status;
                        message.status = MessageStatus::Read;
                        events.push(StoreEvent::MessageStatusChanged {
                            conversation_id: conversation_id.to_string(),
                            message_id: message.id.clone(),
                            old_status,
                            new_status: MessageStatus::Read,
                        });
                    }
                    message.read_at = Some(now);
                    read_ids.push(message.id.clone());
                }
            }

            let remaining = state
                .messages
                .get(conversation_id)
                .map(|messages| {
                    messages
                        .iter()
                        .filter(|m| m.sender.id != self.current_user_id() && m.read_at.is_none())
                        .count() as u32
                })
                .unwrap_or(0);
            if let Some(conversation) = state.conversations.get_mut(conversation_id) {
                if conversation.unread_count != remaining {
                    conversation.unread_count = remaining;
                    events.push(StoreEvent::UnreadCountChanged {
                        conversation_id: conversation_id.to_string(),
                        unread_count: remaining,
                    });
                }
            }
            (read_ids, events)
        };
        for event in events {
            self.emit(event);
        }
        read_ids
    }

    /// 远端已读回执：对方读了，把自己发出的消息标记为已读
    ///
    /// reader 是自己（其他设备的回显）时只清未读。
    pub fn apply_message_read(
        &self,
        conversation_id: &str,
        reader_id: &str,
        read_at: Option<chrono::DateTime<Utc>>,
    ) {
        let events = {
            let mut state = self.state.write();
            let mut events = Vec::new();
            let read_at = read_at.unwrap_or_else(Utc::now);

            if reader_id == self.current_user_id() {
                if let Some(conversation) = state.conversations.get_mut(conversation_id) {
                    if conversation.unread_count != 0 {
                        conversation.unread_count = 0;
                        events.push(StoreEvent::UnreadCountChanged {
                            conversation_id: conversation_id.to_string(),
                            unread_count: 0,
                        });
                    }
                }
            } else if let Some(messages) = state.messages.get_mut(conversation_id) {
                for message in messages.iter_mut() {
                    if message.sender.id == self.current_user_id()
                        && message.status.can_transition_to(crate::entities::MessageStatus::Read)
                    {
                        let old_status = message.status;
                        message.status = crate::entities::MessageStatus::Read;
                        message.read_at = Some(read_at);
                        message.updated_at = Utc::now();
                        events.push(StoreEvent::MessageStatusChanged {
                            conversation_id: conversation_id.to_string(),
                            message_id: message.id.clone(),
                            old_status,
                            new_status: crate::entities::MessageStatus::Read,
                        });
                    }
                }
            }
            events
        };
        for event in events {
            self.emit(event);
        }
    }

    /// 某条乐观变更当前状态（UI 渲染重试按钮用）
    pub fn mutation(&self, local_id: &str) -> Option<super::LocalMutation> {
        self.state.read().outbox.get(local_id).cloned()
    }

    /// 整条替换已有消息（编辑等场景）；未知 ID 是无操作
    pub fn update_message(&self, updated: Message) -> bool {
        let event = {
            let mut state = self.state.write();
            let Some(messages) = state.messages.get_mut(&updated.conversation_id) else {
                return false;
            };
            let Some(slot) = messages.iter_mut().find(|m| m.id == updated.id) else {
                return false;
            };
            *slot = updated.clone();
            if let Some(conversation) = state.conversations.get_mut(&updated.conversation_id) {
                if let Some(last) = conversation.last_message.as_mut() {
                    if last.id == updated.id {
                        *last = updated.clone();
                    }
                }
            }
            StoreEvent::MessageAdded {
                conversation_id: updated.conversation_id.clone(),
                message: updated,
            }
        };
        self.emit(event);
        true
    }

    /// 删除单条消息；未读的对方消息被删时同步回退未读数
    pub fn remove_message(&self, conversation_id: &str, message_id: &str) -> bool {
        let events = {
            let mut state = self.state.write();
            let Some(messages) = state.messages.get_mut(conversation_id) else {
                return false;
            };
            let Some(pos) = messages.iter().position(|m| m.id == message_id) else {
                return false;
            };
            let removed = messages.remove(pos);
            let new_last = messages.last().cloned();

            let mut events = Vec::new();
            if let Some(conversation) = state.conversations.get_mut(conversation_id) {
                if removed.sender.id != self.current_user_id()
                    && removed.read_at.is_none()
                    && conversation.unread_count > 0
                {
                    conversation.unread_count -= 1;
                    events.push(StoreEvent::UnreadCountChanged {
                        conversation_id: conversation_id.to_string(),
                        unread_count: conversation.unread_count,
                    });
                }
                if conversation
                    .last_message
                    .as_ref()
                    .map(|m| m.id == message_id)
                    .unwrap_or(false)
                {
                    conversation.last_message = new_last;
                }
            }
            events
        };
        for event in events {
            self.emit(event);
        }
        true
    }
}

/// 从会话参与者里取自己的 UserRef
fn own_ref(conversation: &Conversation, current_user_id: &str) -> UserRef {
    if conversation.participant1.id == current_user_id {
        conversation.participant1.clone()
    } else {
        conversation.participant2.clone()
    }
}

/// 插入并保持 (created_at, id) 升序
fn insert_sorted(messages: &mut Vec<Message>, message: Message) {
    let key = (message.created_at, message.id.clone());
    let pos = messages
        .partition_point(|m| (m.created_at, m.id.clone()) <= key);
    messages.insert(pos, message);
}

fn sort_messages(messages: &mut [Message]) {
    messages.sort_by(|a, b| {
        a.created_at
            .cmp(&b.created_at)
            .then_with(|| a.id.cmp(&b.id))
    });
}

/// 消息先于会话到达时的骨架会话
fn skeleton_conversation(message: &Message, current_user_id: &str) -> Conversation {
    let me = UserRef::new(current_user_id, "", "");
    Conversation {
        id: message.conversation_id.clone(),
        participant1: message.sender.clone(),
        participant2: me,
        last_message: Some(message.clone()),
        last_message_at: message.created_at,
        unread_count: 0,
        is_archived: false,
        created_at: message.created_at,
        updated_at: message.created_at,
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::entities::{MessageStatus, MessageType};

    #[test]
    fn test_incoming_message_idempotent() {
        let store = store();
        store.set_conversations(vec![conversation("c1", "me", "u2")]);

        let msg = message("m1", "c1", "u2", 1_700_000_100);
        assert!(store.apply_incoming_message(msg.clone()));
        // 同一帧重复投递只生效一次
        assert!(!store.apply_incoming_message(msg));

        assert_eq!(store.messages("c1").len(), 1);
        assert_eq!(store.conversation("c1").unwrap().unread_count, 1);
    }

    #[test]
    fn test_own_message_does_not_bump_unread() {
        let store = store();
        store.set_conversations(vec![conversation("c1", "me", "u2")]);

        store.apply_incoming_message(message("m1", "c1", "me", 1_700_000_100));
        assert_eq!(store.conversation("c1").unwrap().unread_count, 0);
    }

    #[test]
    fn test_messages_sorted_ascending() {
        let store = store();
        store.set_conversations(vec![conversation("c1", "me", "u2")]);

        store.apply_incoming_message(message("m3", "c1", "u2", 1_700_000_300));
        store.apply_incoming_message(message("m1", "c1", "u2", 1_700_000_100));
        store.apply_incoming_message(message("m2", "c1", "u2", 1_700_000_200));

        let ids: Vec<String> = store.messages("c1").into_iter().map(|m| m.id).collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }

    #[test]
    fn test_conversations_sorted_by_recency() {
        let store = store();
        store.set_conversations(vec![
            conversation("c1", "me", "u2"),
            conversation("c2", "me", "u3"),
        ]);

        store.apply_incoming_message(message("m1", "c2", "u3", 1_700_000_500));
        let list = store.conversations();
        assert_eq!(list[0].id, "c2");
        assert_eq!(list[1].id, "c1");
    }

    #[test]
    fn test_optimistic_send_confirm() {
        let store = store();
        store.set_conversations(vec![conversation("c1", "me", "u2")]);

        let sent = store
            .send_message("c1", "hello", MessageType::Text)
            .unwrap();
        assert_eq!(sent.status, MessageStatus::Sending);
        assert_eq!(store.messages("c1").len(), 1);

        assert!(store.confirm_message(&sent.id, "srv-1"));
        let messages = store.messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].id, "srv-1");
        assert_eq!(messages[0].status, MessageStatus::Sent);

        // 服务端把同一条消息回推，不会二次入库
        let mut echo = message("srv-1", "c1", "me", 1_700_000_400);
        echo.content = "hello".into();
        assert!(!store.apply_incoming_message(echo));
        assert_eq!(store.messages("c1").len(), 1);
    }

    #[test]
    fn test_failed_send_retry() {
        let store = store();
        store.set_conversations(vec![conversation("c1", "me", "u2")]);

        let sent = store.send_message("c1", "hi", MessageType::Text).unwrap();
        assert!(store.fail_message(&sent.id, "timeout"));
        assert_eq!(store.messages("c1")[0].status, MessageStatus::Failed);

        let retried = store.retry_message(&sent.id).unwrap();
        assert_eq!(retried.status, MessageStatus::Sending);
    }

    #[test]
    fn test_mark_read_clears_unread() {
        let store = store();
        store.set_conversations(vec![conversation("c1", "me", "u2")]);
        store.apply_incoming_message(message("m1", "c1", "u2", 1_700_000_100));
        store.apply_incoming_message(message("m2", "c1", "u2", 1_700_000_200));
        assert_eq!(store.conversation("c1").unwrap().unread_count, 2);

        let read_ids = store.mark_conversation_read("c1", None);
        assert_eq!(read_ids.len(), 2);
        assert_eq!(store.conversation("c1").unwrap().unread_count, 0);

        // 本地已读同时落在消息状态上
        for message in store.messages("c1") {
            assert_eq!(message.status, MessageStatus::Read);
            assert!(message.read_at.is_some());
        }
    }

    #[test]
    fn test_mark_read_subset_only_touches_named_messages() {
        let store = store();
        store.set_conversations(vec![conversation("c1", "me", "u2")]);
        store.apply_incoming_message(message("m1", "c1", "u2", 1_700_000_100));
        store.apply_incoming_message(message("m2", "c1", "u2", 1_700_000_200));

        let read_ids = store.mark_conversation_read("c1", Some(&["m1".to_string()]));
        assert_eq!(read_ids, vec!["m1".to_string()]);

        let messages = store.messages("c1");
        assert_eq!(messages[0].status, MessageStatus::Read);
        assert_eq!(messages[1].status, MessageStatus::Sent);
        assert!(messages[1].read_at.is_none());
        // 未读数按剩余未读重算
        assert_eq!(store.conversation("c1").unwrap().unread_count, 1);
    }

    #[test]
    fn test_remote_read_receipt_marks_own_messages() {
        let store = store();
        store.set_conversations(vec![conversation("c1", "me", "u2")]);
        let sent = store.send_message("c1", "hi", MessageType::Text).unwrap();
        store.confirm_message(&sent.id, "srv-1");

        store.apply_message_read("c1", "u2", None);
        let messages = store.messages("c1");
        assert_eq!(messages[0].status, MessageStatus::Read);
        assert!(messages[0].read_at.is_some());
    }

    #[test]
    fn test_message_before_conversation_creates_skeleton() {
        let store = store();
        assert!(store.apply_incoming_message(message("m1", "c9", "u7", 1_700_000_100)));
        let conv = store.conversation("c9").unwrap();
        assert!(conv.involves("u7"));
        assert!(conv.involves("me"));
        assert_eq!(conv.unread_count, 1);
    }

    #[test]
    fn test_filtered_conversations() {
        let store = store();
        store.set_conversations(vec![
            conversation("c1", "me", "u2"),
            conversation("c2", "me", "u3"),
        ]);
        store.set_archived("c2", true);

        let visible = store.filtered_conversations(None, false);
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].id, "c1");

        let archived = store.filtered_conversations(None, true);
        assert_eq!(archived[0].id, "c2");

        // 按对方用户名过滤
        let hits = store.filtered_conversations(Some("user_u2"), false);
        assert_eq!(hits.len(), 1);
        assert!(store.filtered_conversations(Some("nobody"), false).is_empty());
    }

    #[test]
    fn test_total_unread() {
        let store = store();
        store.set_conversations(vec![
            conversation("c1", "me", "u2"),
            conversation("c2", "me", "u3"),
        ]);
        store.apply_incoming_message(message("m1", "c1", "u2", 1_700_000_100));
        store.apply_incoming_message(message("m2", "c2", "u3", 1_700_000_100));
        store.apply_incoming_message(message("m3", "c2", "u3", 1_700_000_200));
        assert_eq!(store.total_unread_count(), 3);
    }

    #[test]
    fn test_remove_message_rolls_back_unread() {
        let store = store();
        store.set_conversations(vec![conversation("c1", "me", "u2")]);
        store.apply_incoming_message(message("m1", "c1", "u2", 1_700_000_100));
        assert_eq!(store.conversation("c1").unwrap().unread_count, 1);

        assert!(store.remove_message("c1", "m1"));
        assert_eq!(store.conversation("c1").unwrap().unread_count, 0);
        assert!(store.messages("c1").is_empty());
        // 未知 ID 是无操作
        assert!(!store.remove_message("c1", "m1"));
    }

    #[test]
    fn test_active_conversation_cleared_on_remove() {
        let store = store();
        store.set_conversations(vec![conversation("c1", "me", "u2")]);
        store.set_active_conversation(Some("c1".to_string()));
        assert_eq!(store.active_conversation().as_deref(), Some("c1"));

        store.remove_conversation("c1");
        assert!(store.active_conversation().is_none());
    }

    #[test]
    fn test_remove_conversation_clears_messages() {
        let store = store();
        store.set_conversations(vec![conversation("c1", "me", "u2")]);
        store.apply_incoming_message(message("m1", "c1", "u2", 1_700_000_100));

        assert!(store.remove_conversation("c1"));
        assert!(store.conversation("c1").is_none());
        assert!(store.messages("c1").is_empty());
    }
}
