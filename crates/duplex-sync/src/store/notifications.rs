//! 应用内通知
//!
//! 两层去重：同 ID 只入列一次；同类型 + 同关联实体在时间窗内
//! （默认 30 秒）也只保留最早一条，避免连发消息刷屏。

use chrono::Utc;
use tracing::debug;

use super::MessagingStore;
use crate::entities::{Call, FriendRequest, Friendship, Message, Notification, NotificationKind};
use crate::events::StoreEvent;

impl Notification {
    /// 新消息通知（ID 派生自消息 ID，天然幂等）
    pub fn for_message(message: &Message, recipient_id: &str) -> Self {
        Self {
            id: format!("msg_{}", message.id),
            user_id: recipient_id.to_string(),
            kind: NotificationKind::Message,
            title: message.sender.name.clone(),
            content: message.content.clone(),
            related_id: Some(message.conversation_id.clone()),
            is_read: false,
            created_at: Utc::now(),
        }
    }

    /// 来电通知
    pub fn for_call(call: &Call, recipient_id: &str) -> Self {
        Self {
            id: format!("call_{}", call.id),
            user_id: recipient_id.to_string(),
            kind: NotificationKind::Call,
            title: call.caller.name.clone(),
            content: "来电".to_string(),
            related_id: Some(call.id.clone()),
            is_read: false,
            created_at: Utc::now(),
        }
    }

    /// 对方接受了我的好友请求
    pub fn for_request_accepted(friendship: &Friendship, current_user_id: &str) -> Self {
        let other = if friendship.user1.id == current_user_id {
            &friendship.user2
        } else {
            &friendship.user1
        };
        Self {
            id: format!("friend_accepted_{}", friendship.id),
            user_id: current_user_id.to_string(),
            kind: NotificationKind::FriendRequest,
            title: other.name.clone(),
            content: "接受了你的好友请求".to_string(),
            related_id: Some(friendship.id.clone()),
            is_read: false,
            created_at: Utc::now(),
        }
    }

    /// 通话结束（带时长）
    pub fn for_call_ended(call: &Call, current_user_id: &str) -> Self {
        let other = if call.caller.id == current_user_id {
            &call.callee
        } else {
            &call.caller
        };
        let content = match call.duration_secs {
            Some(secs) => format!("通话结束，时长 {} 秒", secs),
            None => "通话结束".to_string(),
        };
        Self {
            id: format!("call_end_{}", call.id),
            user_id: current_user_id.to_string(),
            kind: NotificationKind::Call,
            title: other.name.clone(),
            content,
            related_id: Some(call.id.clone()),
            is_read: false,
            created_at: Utc::now(),
        }
    }

    /// 好友请求通知
    pub fn for_friend_request(request: &FriendRequest) -> Self {
        Self {
            id: format!("friend_req_{}", request.id),
            user_id: request.recipient.id.clone(),
            kind: NotificationKind::FriendRequest,
            title: request.requester.name.clone(),
            content: "发来好友请求".to_string(),
            related_id: Some(request.id.clone()),
            is_read: false,
            created_at: Utc::now(),
        }
    }
}

impl MessagingStore {
    /// 通知入列（去重后），新的在前
    pub fn push_notification(&self, notification: Notification) -> bool {
        let window = chrono::Duration::from_std(self.config.notification_dedup_window)
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let applied = {
            let mut state = self.state.write();
            let duplicate = state.notifications.iter().any(|n| {
                n.id == notification.id
                    || (n.kind == notification.kind
                        && n.related_id.is_some()
                        && n.related_id == notification.related_id
                        && notification.created_at - n.created_at <= window)
            });
            if duplicate {
                debug!("忽略重复通知: {}", notification.id);
                false
            } else {
                state.notifications.push_front(notification.clone());
                true
            }
        };
        if applied {
            self.emit(StoreEvent::NotificationAdded { notification });
        }
        applied
    }

    /// 通知快照，新的在前
    pub fn notifications(&self) -> Vec<Notification> {
        self.state.read().notifications.iter().cloned().collect()
    }

    pub fn unread_notification_count(&self) -> usize {
        self.state
            .read()
            .notifications
            .iter()
            .filter(|n| !n.is_read)
            .count()
    }

    pub fn mark_notification_read(&self, notification_id: &str) -> bool {
        let mut state = self.state.write();
        match state
            .notifications
            .iter_mut()
            .find(|n| n.id == notification_id)
        {
            Some(n) => {
                n.is_read = true;
                true
            }
            None => false,
        }
    }

    pub fn remove_notification(&self, notification_id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.notifications.len();
        state.notifications.retain(|n| n.id != notification_id);
        state.notifications.len() < before
    }

    pub fn mark_all_notifications_read(&self) {
        let mut state = self.state.write();
        for n in state.notifications.iter_mut() {
            n.is_read = true;
        }
    }

    pub fn clear_notifications(&self) {
        self.state.write().notifications.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use crate::entities::{Notification, NotificationKind};
    use chrono::Utc;

    fn notification(id: &str, kind: NotificationKind, related: &str) -> Notification {
        Notification {
            id: id.to_string(),
            user_id: "me".to_string(),
            kind,
            title: "t".to_string(),
            content: "c".to_string(),
            related_id: Some(related.to_string()),
            is_read: false,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_dedup_by_id() {
        let store = store();
        assert!(store.push_notification(notification("n1", NotificationKind::Message, "c1")));
        assert!(!store.push_notification(notification("n1", NotificationKind::Message, "c9")));
        assert_eq!(store.notifications().len(), 1);
    }

    #[test]
    fn test_dedup_by_kind_and_related_within_window() {
        let store = store();
        assert!(store.push_notification(notification("n1", NotificationKind::Message, "c1")));
        // 同类型同关联实体，窗口内去重
        assert!(!store.push_notification(notification("n2", NotificationKind::Message, "c1")));
        // 不同关联实体不受影响
        assert!(store.push_notification(notification("n3", NotificationKind::Message, "c2")));
        // 不同类型不受影响
        assert!(store.push_notification(notification("n4", NotificationKind::Call, "c1")));
    }

    #[test]
    fn test_same_related_outside_window() {
        let store = store();
        let mut old = notification("n1", NotificationKind::Message, "c1");
        old.created_at = Utc::now() - chrono::Duration::seconds(120);
        assert!(store.push_notification(old));
        // 窗口已过，允许再次通知
        assert!(store.push_notification(notification("n2", NotificationKind::Message, "c1")));
    }

    #[test]
    fn test_read_tracking() {
        let store = store();
        store.push_notification(notification("n1", NotificationKind::Message, "c1"));
        store.push_notification(notification("n2", NotificationKind::Call, "k1"));
        assert_eq!(store.unread_notification_count(), 2);

        assert!(store.mark_notification_read("n1"));
        assert_eq!(store.unread_notification_count(), 1);

        store.mark_all_notifications_read();
        assert_eq!(store.unread_notification_count(), 0);

        assert!(store.remove_notification("n1"));
        assert!(!store.remove_notification("n1"));
        assert_eq!(store.notifications().len(), 1);
    }

    #[test]
    fn test_newest_first() {
        let store = store();
        store.push_notification(notification("n1", NotificationKind::Message, "c1"));
        store.push_notification(notification("n2", NotificationKind::Call, "k1"));
        let list = store.notifications();
        assert_eq!(list[0].id, "n2");
    }
}
