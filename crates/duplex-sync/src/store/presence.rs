//! 在线状态与输入指示
//!
//! 在线状态按 user_id 键控，last-write-wins；没有记录的用户
//! 视为 Offline。输入指示是瞬时状态，重连后由
//! [`MessagingStore::reset_volatile`] 整体清空。

use chrono::{DateTime, Utc};
use tracing::debug;

use super::MessagingStore;
use crate::entities::{PresenceStatus, UserPresence};
use crate::events::StoreEvent;

impl MessagingStore {
    /// 在线状态更新（LWW，无条件覆盖）
    pub fn apply_presence(
        &self,
        user_id: &str,
        status: PresenceStatus,
        last_seen_at: Option<DateTime<Utc>>,
    ) {
        let changed = {
            let mut state = self.state.write();
            let now = Utc::now();
            let previous = state.presence.insert(
                user_id.to_string(),
                UserPresence {
                    user_id: user_id.to_string(),
                    status,
                    last_seen_at: last_seen_at.unwrap_or(now),
                    updated_at: now,
                },
            );
            previous.map(|p| p.status) != Some(status)
        };
        if changed {
            self.emit(StoreEvent::PresenceChanged {
                user_id: user_id.to_string(),
                status,
            });
        }
    }

    /// 查询在线状态，未知用户视为 Offline
    pub fn presence_of(&self, user_id: &str) -> PresenceStatus {
        self.state
            .read()
            .presence
            .get(user_id)
            .map(|p| p.status)
            .unwrap_or(PresenceStatus::Offline)
    }

    pub fn presence_record(&self, user_id: &str) -> Option<UserPresence> {
        self.state.read().presence.get(user_id).cloned()
    }

    /// Offline 以外都算在线
    pub fn is_user_online(&self, user_id: &str) -> bool {
        self.presence_of(user_id) != PresenceStatus::Offline
    }

    /// 当前在线用户集合
    pub fn online_users(&self) -> Vec<String> {
        let state = self.state.read();
        let mut users: Vec<String> = state
            .presence
            .values()
            .filter(|p| p.status != PresenceStatus::Offline)
            .map(|p| p.user_id.clone())
            .collect();
        users.sort();
        users
    }

    /// 输入指示变更；自己的回显忽略
    pub fn set_typing(&self, conversation_id: &str, user_id: &str, is_typing: bool) {
        if user_id == self.current_user_id() {
            debug!("忽略自己的输入指示回显");
            return;
        }
        let changed = {
            let mut state = self.state.write();
            let typists = state
                .typing
                .entry(conversation_id.to_string())
                .or_default();
            if is_typing {
                typists.insert(user_id.to_string())
            } else {
                typists.remove(user_id)
            }
        };
        if changed {
            self.emit(StoreEvent::TypingChanged {
                conversation_id: conversation_id.to_string(),
                user_id: user_id.to_string(),
                is_typing,
            });
        }
    }

    /// 某会话当前正在输入的用户
    pub fn typing_users(&self, conversation_id: &str) -> Vec<String> {
        self.state
            .read()
            .typing
            .get(conversation_id)
            .map(|set| {
                let mut users: Vec<String> = set.iter().cloned().collect();
                users.sort();
                users
            })
            .unwrap_or_default()
    }
}
