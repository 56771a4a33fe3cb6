//! 乐观变更账本
//!
//! 每条乐观写入（本地先插、服务端后确认）在这里登记一条
//! [`LocalMutation`]，状态是带标签的联合：Pending / Confirmed /
//! Failed，UI 据此渲染发送中、已发、失败重试。

use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// 乐观变更状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MutationState {
    /// 等待服务端确认
    Pending,
    /// 已确认，临时 ID 被 server_id 替换
    Confirmed { server_id: String },
    /// 发送失败（可重试）
    Failed { error: String },
}

/// 一条乐观变更记录
#[derive(Debug, Clone)]
pub struct LocalMutation {
    /// 客户端临时 ID（uuid v4）
    pub local_id: String,
    pub conversation_id: String,
    pub state: MutationState,
    pub created_at: DateTime<Utc>,
}

/// 乐观变更账本（按 local_id 键控）
#[derive(Default)]
pub(crate) struct Outbox {
    entries: HashMap<String, LocalMutation>,
}

impl Outbox {
    pub(crate) fn register(&mut self, local_id: &str, conversation_id: &str) {
        self.entries.insert(
            local_id.to_string(),
            LocalMutation {
                local_id: local_id.to_string(),
                conversation_id: conversation_id.to_string(),
                state: MutationState::Pending,
                created_at: Utc::now(),
            },
        );
    }

    /// 确认后账本条目保留，供"按 server_id 反查本地发送"去重用
    pub(crate) fn confirm(&mut self, local_id: &str, server_id: &str) -> bool {
        match self.entries.get_mut(local_id) {
            Some(entry) => {
                entry.state = MutationState::Confirmed {
                    server_id: server_id.to_string(),
                };
                true
            }
            None => false,
        }
    }

    pub(crate) fn fail(&mut self, local_id: &str, error: &str) -> bool {
        match self.entries.get_mut(local_id) {
            Some(entry) => {
                entry.state = MutationState::Failed {
                    error: error.to_string(),
                };
                true
            }
            None => false,
        }
    }

    /// 重试：Failed 回到 Pending，其他状态不动
    pub(crate) fn retry(&mut self, local_id: &str) -> bool {
        match self.entries.get_mut(local_id) {
            Some(entry) if matches!(entry.state, MutationState::Failed { .. }) => {
                entry.state = MutationState::Pending;
                true
            }
            _ => false,
        }
    }

    pub(crate) fn get(&self, local_id: &str) -> Option<&LocalMutation> {
        self.entries.get(local_id)
    }

    /// server_id 是否对应一条本地已确认的发送
    pub(crate) fn is_confirmed_server_id(&self, server_id: &str) -> bool {
        self.entries.values().any(|m| {
            matches!(&m.state, MutationState::Confirmed { server_id: sid } if sid == server_id)
        })
    }

    pub(crate) fn remove_conversation(&mut self, conversation_id: &str) {
        self.entries
            .retain(|_, m| m.conversation_id != conversation_id);
    }
}
