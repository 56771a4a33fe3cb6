//! 事件路由器
//!
//! 传输层与存储层之间唯一的桥：逐帧消费 [`TransportEvent`]，
//! 过去重、解 payload、调用对应的存储 action，必要时生成应用内
//! 通知。路由是单任务顺序处理，天然保证事件按到达序生效。
//!
//! 单帧的解析失败只丢弃该帧，不影响后续事件流。

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::dedup::{DedupFilter, FrameDisposition};
use crate::entities::Notification;
use crate::events::StoreEvent;
use crate::protocol::{
    CallEndPayload, CallRequestPayload, CallResponseKind, CallResponsePayload,
    ConversationDeletedPayload, EventKind, FriendRemovedPayload, FriendRequestPayload,
    FriendResponsePayload, MessagePayload, MessageReadPayload, PresencePayload, TypingPayload,
    UserBlockedPayload, WsFrame,
};
use crate::store::{CallOutcome, MessagingStore};
use crate::transport::{ConnectionStatus, FrameSender, TransportEvent};

/// 事件路由器
pub struct EventRouter {
    store: Arc<MessagingStore>,
    dedup: Arc<DedupFilter>,
    sender: FrameSender,
}

impl EventRouter {
    pub fn new(store: Arc<MessagingStore>, dedup: Arc<DedupFilter>, sender: FrameSender) -> Self {
        Self {
            store,
            dedup,
            sender,
        }
    }

    /// 路由主循环，传输层关闭后返回
    pub async fn run(self, mut rx: mpsc::Receiver<TransportEvent>) {
        info!("事件路由器启动");
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
        info!("事件路由器退出");
    }

    pub fn handle(&self, event: TransportEvent) {
        match event {
            TransportEvent::Frame(frame) => self.route_frame(frame),
            TransportEvent::StatusChanged { old, new } => {
                self.on_status_changed(old, new);
            }
            TransportEvent::Error(message) => {
                warn!("传输层错误: {}", message);
            }
            TransportEvent::ReconnectAttempt { attempt, delay } => {
                info!("重连中: 第 {} 次，退避 {:?}", attempt, delay);
            }
        }
    }

    fn on_status_changed(&self, old: ConnectionStatus, new: ConnectionStatus) {
        if new == ConnectionStatus::Connected && old != ConnectionStatus::Connected {
            // 新连接 seq 从头计数；断线期间的输入指示已不可信
            self.dedup.reset_epoch();
            self.store.reset_volatile();
        }
        self.store
            .events()
            .emit(StoreEvent::ConnectionChanged {
                old_status: old,
                new_status: new,
            });
    }

    fn route_frame(&self, frame: WsFrame) {
        match self.dedup.check_and_record(&frame) {
            FrameDisposition::Duplicate => return,
            FrameDisposition::FreshWithGap { missing } => {
                warn!(
                    "⚠️ 检测到事件缺口: type={} 缺失 seq {}..{}",
                    frame.kind, missing.start, missing.end
                );
                self.store.events().emit(StoreEvent::SeqGapDetected {
                    missing_start: missing.start,
                    missing_end: missing.end,
                });
            }
            FrameDisposition::Fresh => {}
        }

        let Some(kind) = frame.event_kind() else {
            warn!("丢弃未识别的事件类型: {}", frame.kind);
            return;
        };

        match kind {
            EventKind::Message => {
                let Some(MessagePayload { message }) = frame.payload_as() else {
                    return self.bad_payload(kind);
                };
                let from_other = message.sender.id != self.store.current_user_id();
                let notification =
                    Notification::for_message(&message, self.store.current_user_id());
                if self.store.apply_incoming_message(message) && from_other {
                    self.store.push_notification(notification);
                }
            }
            EventKind::TypingStart | EventKind::TypingStop => {
                let Some(TypingPayload {
                    conversation_id,
                    user_id,
                }) = frame.payload_as()
                else {
                    return self.bad_payload(kind);
                };
                self.store
                    .set_typing(&conversation_id, &user_id, kind == EventKind::TypingStart);
            }
            EventKind::PresenceUpdate => {
                let Some(PresencePayload {
                    user_id,
                    status,
                    last_seen_at,
                }) = frame.payload_as()
                else {
                    return self.bad_payload(kind);
                };
                self.store.apply_presence(&user_id, status, last_seen_at);
            }
            EventKind::MessageRead => {
                let Some(MessageReadPayload {
                    conversation_id,
                    user_id,
                    read_at,
                }) = frame.payload_as()
                else {
                    return self.bad_payload(kind);
                };
                self.store
                    .apply_message_read(&conversation_id, &user_id, read_at);
            }
            EventKind::CallRequest => {
                let Some(CallRequestPayload { call }) = frame.payload_as() else {
                    return self.bad_payload(kind);
                };
                match self.store.apply_incoming_call(call) {
                    CallOutcome::Ringing(call) => {
                        let notification =
                            Notification::for_call(&call, self.store.current_user_id());
                        self.store.push_notification(notification);
                    }
                    CallOutcome::Busy(call) => self.decline_busy(&call),
                    CallOutcome::Ignored => {}
                }
            }
            EventKind::CallResponse => {
                let Some(CallResponsePayload {
                    call_id, response, ..
                }) = frame.payload_as()
                else {
                    return self.bad_payload(kind);
                };
                self.store
                    .apply_call_response(&call_id, response == CallResponseKind::Accepted);
            }
            EventKind::CallEnd => {
                let Some(CallEndPayload { call_id, duration }) = frame.payload_as() else {
                    return self.bad_payload(kind);
                };
                if let Some(ended) = self.store.end_call(&call_id, duration) {
                    self.store.push_notification(Notification::for_call_ended(
                        &ended,
                        self.store.current_user_id(),
                    ));
                }
            }
            EventKind::FriendRequest => {
                let Some(FriendRequestPayload { friend_request }) = frame.payload_as() else {
                    return self.bad_payload(kind);
                };
                let notification = Notification::for_friend_request(&friend_request);
                if self.store.apply_friend_request(friend_request) {
                    self.store.push_notification(notification);
                }
            }
            EventKind::FriendRequestAccepted => {
                let Some(FriendResponsePayload {
                    friend_request_id,
                    friendship,
                    ..
                }) = frame.payload_as()
                else {
                    return self.bad_payload(kind);
                };
                let resolved = self.store.resolve_friend_request(
                    &friend_request_id,
                    true,
                    friendship.clone(),
                );
                if resolved {
                    if let Some(friendship) = friendship {
                        self.store.push_notification(Notification::for_request_accepted(
                            &friendship,
                            self.store.current_user_id(),
                        ));
                    }
                }
            }
            EventKind::FriendRequestDeclined => {
                let Some(FriendResponsePayload {
                    friend_request_id, ..
                }) = frame.payload_as()
                else {
                    return self.bad_payload(kind);
                };
                self.store
                    .resolve_friend_request(&friend_request_id, false, None);
            }
            EventKind::FriendRemoved => {
                let Some(FriendRemovedPayload { friendship_id, .. }) = frame.payload_as() else {
                    return self.bad_payload(kind);
                };
                self.store.remove_friendship(&friendship_id);
            }
            EventKind::UserBlocked => {
                let Some(UserBlockedPayload {
                    blocked_user_id,
                    blocker_id,
                }) = frame.payload_as()
                else {
                    return self.bad_payload(kind);
                };
                self.store.apply_user_blocked(&blocker_id, &blocked_user_id);
            }
            EventKind::ConversationDeleted => {
                let Some(ConversationDeletedPayload {
                    conversation_id, ..
                }) = frame.payload_as()
                else {
                    return self.bad_payload(kind);
                };
                // 自己删除的回显下，会话早已不在，remove 幂等
                self.store.remove_conversation(&conversation_id);
            }
            // 心跳帧在传输层已消化，这里兜底忽略
            EventKind::Ping | EventKind::Pong => {}
        }
    }

    /// 忙线拒接：代用户回一帧 declined
    fn decline_busy(&self, call: &crate::entities::Call) {
        let frame = WsFrame::new(
            EventKind::CallResponse,
            serde_json::json!({
                "call_id": call.id,
                "response": "declined",
                "caller_id": call.caller.id,
                "callee_id": call.callee.id,
            }),
        );
        if let Err(e) = self.sender.send(frame) {
            warn!("忙线拒接发送失败: {}", e);
        }
        debug!("忙线，已拒接来电: {}", call.id);
    }

    fn bad_payload(&self, kind: EventKind) {
        warn!("丢弃 payload 结构不符的帧: type={}", kind);
    }
}
