//! Duplex Sync - 聊天客户端实时状态同步引擎
//!
//! 本引擎维护客户端会话态与服务端的实时一致，包括：
//! - 🔗 WebSocket 传输：鉴权连接、指数退避重连、心跳保活
//! - 🔀 事件路由：16 类线上事件分发到领域存储
//! - 🔄 去重过滤：时间窗去重 + 连接内 seq 游标缺口检测
//! - 💬 领域存储：会话、消息、好友、拉黑、在线状态、通话、通知
//! - ✍️ 乐观发送：本地先入列，服务端确认后原子替换 ID
//! - 💾 本地 KV：鉴权 token、会话草稿、搜索历史
//!
//! # 快速开始
//!
//! ```rust,no_run
//! use duplex_sync::{SyncConfig, SyncEngine};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = SyncConfig::new("wss://chat.example.com/ws")
//!         .with_data_dir("/path/to/data");
//!
//!     let engine = SyncEngine::new("user123", config)?;
//!     engine.connect(Some("auth-token"))?;
//!
//!     // 订阅存储层事件做 UI 增量刷新
//!     let mut events = engine.events().subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("store event: {}", event.event_type());
//!         }
//!     });
//!
//!     // 发消息（乐观入列 + 上行）
//!     let message = engine.send_message("conversation-1", "Hello!")?;
//!     println!("本地临时 ID: {}", message.id);
//!
//!     engine.shutdown()?;
//!     Ok(())
//! }
//! ```

// 导出核心模块
pub mod config;
pub mod dedup;
pub mod engine;
pub mod entities;
pub mod error;
pub mod events;
pub mod kv;
pub mod protocol;
pub mod router;
pub mod store;
pub mod transport;

// 重新导出核心类型，方便使用
pub use config::{HeartbeatConfig, ReconnectConfig, SyncConfig};
pub use dedup::{DedupConfig, DedupFilter, FrameDisposition, SeqCheck};
pub use engine::SyncEngine;
pub use entities::{
    BlockedUser, Call, CallStatus, CallType, Conversation, FriendRequest, FriendRequestStatus,
    Friendship, Message, MessageStatus, MessageType, Notification, NotificationKind,
    PresenceStatus, UserPresence, UserRef,
};
pub use error::{DuplexError, Result};
pub use events::{EventBus, EventFilter, StoreEvent};
pub use kv::KvStore;
pub use router::EventRouter;
pub use store::{
    CallOutcome, FriendshipStatus, LocalMutation, MessagingStore, MutationState, Permission,
    StoreConfig,
};
pub use transport::{ConnectionStatus, FrameSender, TransportEvent, WsTransport};
