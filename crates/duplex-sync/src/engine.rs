//! 同步引擎
//!
//! 组装传输层、路由器、存储层与本地 KV，对外提供一组高层操作：
//! 连接管理、发消息、已读、输入指示、在线状态、通话控制。
//! 每个高层操作 = 一次同步的存储变更 + 一帧上行（尽力而为）。
//!
//! 引擎自身不持全局状态，实例化多个引擎互不影响。

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::SyncConfig;
use crate::dedup::DedupFilter;
use crate::entities::{Call, CallType, Message, MessageType, PresenceStatus, UserRef};
use crate::error::{DuplexError, Result};
use crate::events::EventBus;
use crate::kv::KvStore;
use crate::protocol::{EventKind, WsFrame};
use crate::router::EventRouter;
use crate::store::{MessagingStore, StoreConfig};
use crate::transport::{ConnectionStatus, FrameSender, WsTransport};

/// 实时同步引擎
pub struct SyncEngine {
    config: SyncConfig,
    store: Arc<MessagingStore>,
    dedup: Arc<DedupFilter>,
    kv: KvStore,
    transport: parking_lot::Mutex<WsTransport>,
    sender: FrameSender,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl SyncEngine {
    /// 构造引擎
    ///
    /// `current_user_id` 是已鉴权用户的 ID，由登录流程取得后传入。
    pub fn new(current_user_id: impl Into<String>, config: SyncConfig) -> Result<Self> {
        let kv = KvStore::open(&config.data_dir)?;
        let store = Arc::new(MessagingStore::new(
            current_user_id,
            StoreConfig {
                recent_calls_capacity: config.recent_calls_capacity,
                notification_dedup_window: config.notification_dedup_window,
                event_capacity: config.event_capacity,
            },
        ));
        let dedup = Arc::new(DedupFilter::new(config.dedup.clone()));

        let transport = WsTransport::new(
            config.server_url.clone(),
            config.reconnect.clone(),
            config.heartbeat.clone(),
        );
        let sender = transport.sender();

        Ok(Self {
            config,
            store,
            dedup,
            kv,
            transport: parking_lot::Mutex::new(transport),
            sender,
            tasks: parking_lot::Mutex::new(Vec::new()),
        })
    }

    // ---- 连接管理 ----

    /// 建立连接
    ///
    /// token 为 None 时取 KV 里保存的；显式传入时顺手落盘，
    /// 下次启动免登录。shutdown 之后可再次调用，
    /// 连接任务仍在运行时重复调用返回错误。
    pub fn connect(&self, token: Option<&str>) -> Result<()> {
        let token = match token {
            Some(t) => {
                self.kv.save_token(t)?;
                t.to_string()
            }
            None => self
                .kv
                .load_token()?
                .ok_or_else(|| DuplexError::Config("没有可用的鉴权 token".to_string()))?,
        };

        let mut transport = self.transport.lock();
        let (event_tx, event_rx) = mpsc::channel(256);
        let transport_handle = transport.connect(&token, event_tx)?;

        let router = EventRouter::new(self.store.clone(), self.dedup.clone(), self.sender.clone());
        let router_handle = tokio::spawn(router.run(event_rx));

        let mut tasks = self.tasks.lock();
        tasks.push(router_handle);
        tasks.push(transport_handle);
        info!("同步引擎已启动: {}", self.config.server_url);
        Ok(())
    }

    /// 断开连接并落盘
    pub fn shutdown(&self) -> Result<()> {
        self.transport.lock().disconnect();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.kv.flush()?;
        info!("同步引擎已停止");
        Ok(())
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.sender.status()
    }

    // ---- 访问器 ----

    pub fn store(&self) -> &Arc<MessagingStore> {
        &self.store
    }

    pub fn events(&self) -> &EventBus {
        self.store.events()
    }

    pub fn kv(&self) -> &KvStore {
        &self.kv
    }

    // ---- 消息 ----

    /// 发消息：权限检查、乐观入库、上行
    ///
    /// 上行失败（含未连接）时消息标记 Failed，留在列表里供重试。
    pub fn send_message(
        &self,
        conversation_id: &str,
        content: impl Into<String>,
    ) -> Result<Message> {
        let conversation = self
            .store
            .conversation(conversation_id)
            .ok_or_else(|| DuplexError::InvalidOperation(format!("未知会话: {}", conversation_id)))?;
        let other = conversation.other_participant(self.store.current_user_id());
        let permission = self.store.can_message(&other.id);
        if !permission.allowed {
            return Err(DuplexError::InvalidOperation(
                permission.reason.unwrap_or_else(|| "不允许发送".to_string()),
            ));
        }

        let message = self
            .store
            .send_message(conversation_id, content, MessageType::Text)
            .ok_or_else(|| DuplexError::InvalidOperation(format!("未知会话: {}", conversation_id)))?;

        self.put_message_on_wire(&message);
        // 发出的草稿不再需要
        if let Err(e) = self.kv.clear_draft(conversation_id) {
            warn!("清理草稿失败: {}", e);
        }
        Ok(message)
    }

    /// 重发失败消息
    pub fn retry_message(&self, local_id: &str) -> Result<Message> {
        let message = self
            .store
            .retry_message(local_id)
            .ok_or_else(|| DuplexError::InvalidOperation(format!("不可重试: {}", local_id)))?;
        self.put_message_on_wire(&message);
        Ok(message)
    }

    fn put_message_on_wire(&self, message: &Message) {
        let frame = WsFrame::new(
            EventKind::Message,
            serde_json::json!({ "message": message }),
        );
        if let Err(e) = self.sender.send(frame) {
            self.store.fail_message(&message.id, &e.to_string());
        }
    }

    /// 标记会话已读：本地置已读，并上行已读回执
    ///
    /// `message_ids` 为 None 时作用于会话内全部对方消息。
    pub fn mark_conversation_read(&self, conversation_id: &str, message_ids: Option<&[String]>) {
        let read_ids = self
            .store
            .mark_conversation_read(conversation_id, message_ids);
        if read_ids.is_empty() {
            return;
        }
        let frame =
            WsFrame::message_read(conversation_id, self.store.current_user_id(), &read_ids);
        if let Err(e) = self.sender.send(frame) {
            // 本地已读已生效，回执丢了下次重连后服务端会补
            warn!("已读回执上行失败: {}", e);
        }
    }

    /// 上行输入指示（纯瞬时，失败静默丢弃）
    pub fn send_typing(&self, conversation_id: &str, is_typing: bool) {
        let frame = if is_typing {
            WsFrame::typing_start(conversation_id, self.store.current_user_id())
        } else {
            WsFrame::typing_stop(conversation_id, self.store.current_user_id())
        };
        let _ = self.sender.send(frame);
    }

    /// 上行自己的在线状态
    pub fn set_presence(&self, status: PresenceStatus) -> Result<()> {
        self.store
            .apply_presence(self.store.current_user_id(), status, None);
        self.sender
            .send(WsFrame::presence_update(self.store.current_user_id(), status))
    }

    // ---- 通话 ----

    /// 发起通话
    pub fn start_call(&self, callee: UserRef, call_type: CallType) -> Result<Call> {
        let call = self
            .store
            .start_call(callee, call_type)
            .map_err(|perm| {
                DuplexError::InvalidOperation(
                    perm.reason.unwrap_or_else(|| "不允许呼叫".to_string()),
                )
            })?;
        let frame = WsFrame::new(EventKind::CallRequest, serde_json::json!({ "call": call }));
        if let Err(e) = self.sender.send(frame) {
            self.store.fail_call(&call.id, &e.to_string());
            return Err(e);
        }
        Ok(call)
    }

    /// 接听来电
    pub fn accept_call(&self, call_id: &str) -> Result<Call> {
        let call = self
            .store
            .accept_call(call_id)
            .ok_or_else(|| DuplexError::InvalidOperation(format!("无法接听: {}", call_id)))?;
        self.send_call_response(&call, true)?;
        Ok(call)
    }

    /// 拒接来电
    pub fn decline_call(&self, call_id: &str) -> Result<Call> {
        let call = self
            .store
            .decline_call(call_id)
            .ok_or_else(|| DuplexError::InvalidOperation(format!("无法拒接: {}", call_id)))?;
        self.send_call_response(&call, false)?;
        Ok(call)
    }

    /// 挂断
    pub fn hang_up(&self, call_id: &str) -> Result<Call> {
        let call = self
            .store
            .end_call(call_id, None)
            .ok_or_else(|| DuplexError::InvalidOperation(format!("无法挂断: {}", call_id)))?;
        let frame = WsFrame::new(
            EventKind::CallEnd,
            serde_json::json!({ "call_id": call.id, "duration": call.duration_secs }),
        );
        if let Err(e) = self.sender.send(frame) {
            warn!("挂断信令上行失败: {}", e);
        }
        Ok(call)
    }

    fn send_call_response(&self, call: &Call, accepted: bool) -> Result<()> {
        let response = if accepted { "accepted" } else { "declined" };
        let frame = WsFrame::new(
            EventKind::CallResponse,
            serde_json::json!({
                "call_id": call.id,
                "response": response,
                "caller_id": call.caller.id,
                "callee_id": call.callee.id,
            }),
        );
        self.sender.send(frame)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Friendship, MessageStatus};
    use crate::store::test_support;
    use crate::store::MutationState;
    use tempfile::TempDir;

    fn engine() -> (SyncEngine, TempDir) {
        let dir = TempDir::new().unwrap();
        let config = SyncConfig::new("ws://localhost:9/ws").with_data_dir(dir.path());
        let engine = SyncEngine::new("me", config).unwrap();
        (engine, dir)
    }

    fn befriend(engine: &SyncEngine, other: &str) {
        engine.store().set_friendships(vec![Friendship {
            id: "f1".into(),
            user1: test_support::user("me"),
            user2: test_support::user(other),
            created_at: chrono::Utc::now(),
        }]);
        engine
            .store()
            .set_conversations(vec![test_support::conversation("c1", "me", other)]);
    }

    #[tokio::test]
    async fn test_offline_send_marks_failed_and_is_retryable() {
        let (engine, _dir) = engine();
        befriend(&engine, "u2");

        // 未连接：乐观入列成功，上行失败后标记 Failed
        let message = engine.send_message("c1", "hello").unwrap();
        let stored = &engine.store().messages("c1")[0];
        assert_eq!(stored.id, message.id);
        assert_eq!(stored.status, MessageStatus::Failed);
        assert!(matches!(
            engine.store().mutation(&message.id).unwrap().state,
            MutationState::Failed { .. }
        ));

        // 重试仍离线：回到 Failed，消息不丢、不重复
        let _ = engine.retry_message(&message.id).unwrap();
        let messages = engine.store().messages("c1");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn test_send_denied_without_friendship() {
        let (engine, _dir) = engine();
        engine
            .store()
            .set_conversations(vec![test_support::conversation("c1", "me", "u2")]);

        assert!(engine.send_message("c1", "hi").is_err());
        assert!(engine.store().messages("c1").is_empty());
    }

    #[tokio::test]
    async fn test_send_denied_after_block() {
        let (engine, _dir) = engine();
        befriend(&engine, "u2");
        engine.store().block_user(test_support::user("u2"));

        // 拉黑事务把会话也删了
        assert!(engine.send_message("c1", "hi").is_err());
    }

    #[tokio::test]
    async fn test_token_persisted_for_next_start() {
        let dir = TempDir::new().unwrap();
        {
            let config = SyncConfig::new("ws://localhost:9/ws").with_data_dir(dir.path());
            let engine = SyncEngine::new("me", config).unwrap();
            engine.kv().save_token("persisted-token").unwrap();
            engine.kv().flush().unwrap();
        }
        let config = SyncConfig::new("ws://localhost:9/ws").with_data_dir(dir.path());
        let engine = SyncEngine::new("me", config).unwrap();
        assert_eq!(
            engine.kv().load_token().unwrap().as_deref(),
            Some("persisted-token")
        );
    }

    #[tokio::test]
    async fn test_connect_without_token_fails() {
        let (engine, _dir) = engine();
        assert!(matches!(
            engine.connect(None),
            Err(DuplexError::Config(_))
        ));
    }

    #[tokio::test]
    async fn test_reconnect_after_shutdown() {
        let (engine, _dir) = engine();
        engine.connect(Some("t")).unwrap();
        engine.shutdown().unwrap();

        // 停机后允许再次连接，token 走 KV 里保存的那份
        engine.connect(None).unwrap();
        engine.shutdown().unwrap();
    }

    #[tokio::test]
    async fn test_wire_frames_drive_store_end_to_end() {
        use crate::router::EventRouter;
        use crate::transport::TransportEvent;

        let (engine, _dir) = engine();
        befriend(&engine, "u2");
        let router = EventRouter::new(
            engine.store.clone(),
            engine.dedup.clone(),
            engine.sender.clone(),
        );

        // 服务端推两条消息，第一条在已读后到达第二条
        let raw = r#"{"type":"message","payload":{"message":{
            "id":"m1","conversation_id":"c1",
            "sender":{"id":"u2","name":"User u2","username":"user_u2"},
            "content":"first","message_type":"text","status":"sent",
            "delivered_at":null,"read_at":null,
            "created_at":"2024-01-01T00:00:01Z","updated_at":"2024-01-01T00:00:01Z"
        }},"timestamp":"2024-01-01T00:00:01Z","seq":1}"#;
        let frame: WsFrame = serde_json::from_str(raw).unwrap();
        router.handle(TransportEvent::Frame(frame));
        assert_eq!(engine.store().conversation("c1").unwrap().unread_count, 1);

        engine.mark_conversation_read("c1", None);
        assert_eq!(engine.store().conversation("c1").unwrap().unread_count, 0);
        assert_eq!(
            engine.store().messages("c1")[0].status,
            MessageStatus::Read
        );

        let raw2 = raw
            .replace("\"m1\"", "\"m2\"")
            .replace("00:00:01Z", "00:00:02Z")
            .replace("\"seq\":1", "\"seq\":2");
        let frame: WsFrame = serde_json::from_str(&raw2).unwrap();
        router.handle(TransportEvent::Frame(frame));

        let conversation = engine.store().conversation("c1").unwrap();
        assert_eq!(conversation.unread_count, 1);
        let ids: Vec<String> = engine
            .store()
            .messages("c1")
            .into_iter()
            .map(|m| m.id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2"]);
    }
}
