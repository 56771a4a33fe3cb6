//! 好友关系与拉黑
//!
//! 拉黑是事务性的：加入黑名单、解除好友、清掉双向 pending 请求、
//! 删除与对方的会话、挂断与对方的通话，全部在一次写锁内完成，
//! 读方看不到中间态。
//!
//! 权限判断返回 [`Permission`] 而不是错误：被拒绝是正常业务结果。

use chrono::Utc;
use tracing::{debug, info};
use uuid::Uuid;

use super::MessagingStore;
use crate::entities::{BlockedUser, CallStatus, FriendRequest, FriendRequestStatus, Friendship, UserRef};
use crate::events::StoreEvent;

/// 操作许可
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Permission {
    pub allowed: bool,
    /// 拒绝原因（allowed 为 true 时为 None）
    pub reason: Option<String>,
}

/// 与某用户的关系概览
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FriendshipStatus {
    Friends,
    /// 自己发出的请求还在等对方
    PendingOutgoing,
    /// 对方的请求在等自己处理
    PendingIncoming,
    /// 任一方向存在拉黑
    Blocked,
    None,
}

impl Permission {
    pub fn allow() -> Self {
        Self {
            allowed: true,
            reason: None,
        }
    }

    pub fn deny(reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
        }
    }
}

impl MessagingStore {
    // ---- 初始加载 ----

    pub fn set_friendships(&self, friendships: Vec<Friendship>) {
        self.state.write().friendships = friendships;
    }

    pub fn set_friend_requests(&self, requests: Vec<FriendRequest>) {
        self.state.write().friend_requests = requests;
    }

    pub fn set_blocked_users(&self, blocked: Vec<BlockedUser>) {
        self.state.write().blocked = blocked;
    }

    // ---- 快照 ----

    pub fn friendships(&self) -> Vec<Friendship> {
        self.state.read().friendships.clone()
    }

    pub fn pending_friend_requests(&self) -> Vec<FriendRequest> {
        self.state
            .read()
            .friend_requests
            .iter()
            .filter(|r| r.status == FriendRequestStatus::Pending)
            .cloned()
            .collect()
    }

    pub fn blocked_users(&self) -> Vec<BlockedUser> {
        self.state.read().blocked.clone()
    }

    /// 别人发给自己的 pending 请求
    pub fn incoming_friend_requests(&self) -> Vec<FriendRequest> {
        self.state
            .read()
            .friend_requests
            .iter()
            .filter(|r| {
                r.status == FriendRequestStatus::Pending
                    && r.recipient.id == self.current_user_id()
            })
            .cloned()
            .collect()
    }

    /// 自己发出的 pending 请求
    pub fn sent_friend_requests(&self) -> Vec<FriendRequest> {
        self.state
            .read()
            .friend_requests
            .iter()
            .filter(|r| {
                r.status == FriendRequestStatus::Pending
                    && r.requester.id == self.current_user_id()
            })
            .cloned()
            .collect()
    }

    /// 与某用户的关系概览
    pub fn friendship_status_with(&self, user_id: &str) -> FriendshipStatus {
        if self.is_blocked(user_id) || self.is_blocked_by(user_id) {
            return FriendshipStatus::Blocked;
        }
        if self.is_friend(user_id) {
            return FriendshipStatus::Friends;
        }
        let state = self.state.read();
        let me = self.current_user_id();
        for request in state
            .friend_requests
            .iter()
            .filter(|r| r.status == FriendRequestStatus::Pending)
        {
            if request.requester.id == me && request.recipient.id == user_id {
                return FriendshipStatus::PendingOutgoing;
            }
            if request.requester.id == user_id && request.recipient.id == me {
                return FriendshipStatus::PendingIncoming;
            }
        }
        FriendshipStatus::None
    }

    pub fn is_friend(&self, user_id: &str) -> bool {
        self.state
            .read()
            .friendships
            .iter()
            .any(|f| f.connects(self.current_user_id(), user_id))
    }

    pub fn is_blocked(&self, user_id: &str) -> bool {
        self.state
            .read()
            .blocked
            .iter()
            .any(|b| b.blocked_user.id == user_id)
    }

    pub fn is_blocked_by(&self, user_id: &str) -> bool {
        self.state.read().blocked_by.contains(user_id)
    }

    // ---- 好友请求 ----

    /// 收到好友请求（幂等：同 ID 或同向 pending 只保留一条）
    pub fn apply_friend_request(&self, request: FriendRequest) -> bool {
        let applied = {
            let mut state = self.state.write();
            let duplicate = state.friend_requests.iter().any(|r| {
                r.id == request.id
                    || (r.status == FriendRequestStatus::Pending
                        && r.requester.id == request.requester.id
                        && r.recipient.id == request.recipient.id)
            });
            if duplicate {
                debug!("忽略重复好友请求: {}", request.id);
                false
            } else {
                state.friend_requests.push(request.clone());
                true
            }
        };
        if applied {
            self.emit(StoreEvent::FriendRequestReceived { request });
        }
        applied
    }

    /// 好友请求被处理（本地动作或远端回执，语义一致）
    ///
    /// accepted 时写入好友关系；friendship 缺省则由请求双方就地构造。
    pub fn resolve_friend_request(
        &self,
        request_id: &str,
        accepted: bool,
        friendship: Option<Friendship>,
    ) -> bool {
        let mut events = Vec::new();
        let resolved = {
            let mut state = self.state.write();
            let Some(request) = state
                .friend_requests
                .iter_mut()
                .find(|r| r.id == request_id && r.status == FriendRequestStatus::Pending)
            else {
                debug!("忽略对非 pending 请求的处理: {}", request_id);
                return false;
            };

            request.status = if accepted {
                FriendRequestStatus::Accepted
            } else {
                FriendRequestStatus::Declined
            };
            request.responded_at = Some(Utc::now());
            let (requester, recipient) = (request.requester.clone(), request.recipient.clone());

            if accepted {
                let friendship = friendship.unwrap_or_else(|| Friendship {
                    id: Uuid::new_v4().to_string(),
                    user1: requester.clone(),
                    user2: recipient.clone(),
                    created_at: Utc::now(),
                });
                let exists = state
                    .friendships
                    .iter()
                    .any(|f| f.connects(&requester.id, &recipient.id));
                if !exists {
                    state.friendships.push(friendship.clone());
                    events.push(StoreEvent::FriendshipAdded { friendship });
                }
            }
            events.push(StoreEvent::FriendRequestResolved {
                request_id: request_id.to_string(),
                accepted,
            });
            true
        };
        for event in events {
            self.emit(event);
        }
        resolved
    }

    /// 好友关系被解除（本地或远端）
    pub fn remove_friendship(&self, friendship_id: &str) -> bool {
        let removed = {
            let mut state = self.state.write();
            let before = state.friendships.len();
            state.friendships.retain(|f| f.id != friendship_id);
            state.friendships.len() < before
        };
        if removed {
            self.emit(StoreEvent::FriendshipRemoved {
                friendship_id: friendship_id.to_string(),
            });
        }
        removed
    }

    // ---- 拉黑 ----

    /// 拉黑用户（事务性：黑名单、好友、请求、会话、通话一次清完）
    pub fn block_user(&self, user: UserRef) -> bool {
        let user_id = user.id.clone();
        let events = {
            let mut state = self.state.write();
            if state.blocked.iter().any(|b| b.blocked_user.id == user_id) {
                return false;
            }
            let mut events = Vec::new();

            state.blocked.push(BlockedUser {
                id: Uuid::new_v4().to_string(),
                blocked_user: user,
                blocked_at: Utc::now(),
            });
            events.push(StoreEvent::UserBlocked {
                blocker_id: self.current_user_id().to_string(),
                blocked_id: user_id.clone(),
            });

            let capacity = self.config.recent_calls_capacity;
            Self::purge_user_locked(&mut state, self.current_user_id(), &user_id, capacity, &mut events);
            events
        };
        info!("已拉黑用户: {}", user_id);
        for event in events {
            self.emit(event);
        }
        true
    }

    /// 远端 user_blocked 事件
    ///
    /// 自己被对方拉黑：记入 blocked_by 并做同样的清理。
    /// 自己拉黑的回显：只补清理，幂等。
    pub fn apply_user_blocked(&self, blocker_id: &str, blocked_id: &str) {
        let me = self.current_user_id().to_string();
        let other = if blocked_id == me { blocker_id } else { blocked_id };
        let events = {
            let mut state = self.state.write();
            let mut events = Vec::new();
            if blocked_id == me {
                state.blocked_by.insert(blocker_id.to_string());
                events.push(StoreEvent::UserBlocked {
                    blocker_id: blocker_id.to_string(),
                    blocked_id: me.clone(),
                });
            }
            let capacity = self.config.recent_calls_capacity;
            Self::purge_user_locked(&mut state, &me, other, capacity, &mut events);
            events
        };
        for event in events {
            self.emit(event);
        }
    }

    /// 解除拉黑（好友关系不自动恢复，需重新发请求）
    pub fn unblock_user(&self, user_id: &str) -> bool {
        let mut state = self.state.write();
        let before = state.blocked.len();
        state.blocked.retain(|b| b.blocked_user.id != user_id);
        state.blocked.len() < before
    }

    /// 拉黑后的连带清理（调用方持有写锁）
    fn purge_user_locked(
        state: &mut super::StoreState,
        me: &str,
        other: &str,
        recent_calls_capacity: usize,
        events: &mut Vec<StoreEvent>,
    ) {
        // 好友关系
        let removed_friendships: Vec<String> = state
            .friendships
            .iter()
            .filter(|f| f.connects(me, other))
            .map(|f| f.id.clone())
            .collect();
        state.friendships.retain(|f| !f.connects(me, other));
        for friendship_id in removed_friendships {
            events.push(StoreEvent::FriendshipRemoved { friendship_id });
        }

        // 双向 pending 请求
        state.friend_requests.retain(|r| {
            !(r.status == FriendRequestStatus::Pending
                && ((r.requester.id == me && r.recipient.id == other)
                    || (r.requester.id == other && r.recipient.id == me)))
        });

        // 与对方的会话
        let conversation_ids: Vec<String> = state
            .conversations
            .values()
            .filter(|c| c.involves(other))
            .map(|c| c.id.clone())
            .collect();
        for conversation_id in conversation_ids {
            state.conversations.remove(&conversation_id);
            state.messages.remove(&conversation_id);
            state.typing.remove(&conversation_id);
            state.outbox.remove_conversation(&conversation_id);
            events.push(StoreEvent::ConversationRemoved { conversation_id });
        }

        // 进行中的通话
        if let Some(call) = state.active_call.take() {
            if call.caller.id == other || call.callee.id == other {
                let mut ended = call;
                let old_status = ended.status;
                ended.status = CallStatus::Ended;
                ended.ended_at = Some(Utc::now());
                Self::archive_call_locked(state, ended.clone(), recent_calls_capacity);
                events.push(StoreEvent::CallStateChanged {
                    call_id: ended.id.clone(),
                    old_status: Some(old_status),
                    new_status: CallStatus::Ended,
                    call: ended,
                });
            } else {
                state.active_call = Some(call);
            }
        }
    }

    // ---- 权限 ----

    /// 能否给该用户发消息
    pub fn can_message(&self, user_id: &str) -> Permission {
        if user_id == self.current_user_id() {
            return Permission::deny("不能给自己发消息");
        }
        if self.is_blocked(user_id) {
            return Permission::deny("你已拉黑对方");
        }
        if self.is_blocked_by(user_id) {
            return Permission::deny("对方已拉黑你");
        }
        if !self.is_friend(user_id) {
            return Permission::deny("你们还不是好友");
        }
        Permission::allow()
    }

    /// 能否向该用户发起通话
    pub fn can_call(&self, user_id: &str) -> Permission {
        let base = self.can_message(user_id);
        if !base.allowed {
            return base;
        }
        if self.state.read().active_call.is_some() {
            return Permission::deny("当前已在通话中");
        }
        Permission::allow()
    }
}
