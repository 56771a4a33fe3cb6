//! 事件去重过滤器
//!
//! 服务端在重连窗口内可能重推事件，同一事件也可能经多条路径
//! 到达。过滤器做两层防护：
//! - 时间窗去重：按事件类型派生去重键，窗口内同键即重复；
//! - seq 游标：服务端按连接递增下发 seq，倒退即重复、跳跃即缺口。
//!
//! seq 判定优先于时间窗：带 seq 的帧以游标为准。

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::protocol::{EventKind, WsFrame};

/// 帧级检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameDisposition {
    /// 新帧，正常处理
    Fresh,
    /// 新帧，但 seq 跳跃，missing 为缺失的序号区间。
    /// 帧本身照常处理，缺口由调用方上报
    FreshWithGap { missing: std::ops::Range<u64> },
    /// 重复帧，调用方丢弃
    Duplicate,
}

/// seq 游标检查结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SeqCheck {
    /// 正常递进
    Ok,
    /// seq 不大于已见游标，重复帧
    Duplicate,
    /// seq 跳跃，missing 为缺失的序号区间
    Gap { missing: std::ops::Range<u64> },
}

/// 去重过滤器配置
#[derive(Debug, Clone)]
pub struct DedupConfig {
    /// 去重时间窗
    pub window: Duration,
    /// 记录保留时间
    pub retention: Duration,
    /// 最大缓存条数
    pub max_entries: usize,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            retention: Duration::from_secs(300),
            max_entries: 1000,
        }
    }
}

/// 事件去重过滤器
pub struct DedupFilter {
    /// 已见去重键 (key -> 最后出现时刻)
    seen: Mutex<HashMap<String, Instant>>,
    /// 连接内最后见到的 seq（重连后清零）
    last_seq: Mutex<Option<u64>>,
    config: DedupConfig,
    /// 清理阈值（超过即触发清理）
    cleanup_threshold: usize,
}

impl DedupFilter {
    pub fn new(config: DedupConfig) -> Self {
        let cleanup_threshold = config.max_entries * 4 / 5;
        Self {
            seen: Mutex::new(HashMap::new()),
            last_seq: Mutex::new(None),
            config,
            cleanup_threshold,
        }
    }

    /// 按事件类型派生去重键
    ///
    /// ping/pong 不参与去重，返回 None。未识别类型按
    /// 类型 + payload 全文兜底。
    pub fn dedup_key(frame: &WsFrame) -> Option<String> {
        let kind = frame.event_kind();
        match kind {
            Some(EventKind::Ping) | Some(EventKind::Pong) => None,
            Some(EventKind::Message) => {
                let id = frame.payload.get("message").and_then(|m| m.get("id"));
                id.and_then(|v| v.as_str())
                    .map(|id| format!("message:{}", id))
                    .or_else(|| Some(format!("message:{}", frame.payload)))
            }
            Some(EventKind::TypingStart) | Some(EventKind::TypingStop) => {
                let conv = field(frame, "conversation_id");
                let user = field(frame, "user_id");
                Some(format!("{}:{}:{}", frame.kind, conv, user))
            }
            Some(EventKind::PresenceUpdate) => {
                Some(format!("presence_update:{}", field(frame, "user_id")))
            }
            Some(EventKind::MessageRead) => Some(format!(
                "message_read:{}:{}",
                field(frame, "conversation_id"),
                field(frame, "user_id")
            )),
            Some(EventKind::CallRequest) | Some(EventKind::CallResponse)
            | Some(EventKind::CallEnd) => {
                let call_id = frame
                    .payload
                    .get("call")
                    .and_then(|c| c.get("id"))
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| field(frame, "call_id"));
                Some(format!("{}:{}", frame.kind, call_id))
            }
            Some(EventKind::FriendRequest) => {
                let id = frame
                    .payload
                    .get("friend_request")
                    .and_then(|r| r.get("id"))
                    .and_then(|v| v.as_str())
                    .unwrap_or_default();
                Some(format!("friend_request:{}", id))
            }
            Some(EventKind::FriendRequestAccepted) | Some(EventKind::FriendRequestDeclined) => {
                Some(format!(
                    "{}:{}",
                    frame.kind,
                    field(frame, "friend_request_id")
                ))
            }
            Some(EventKind::FriendRemoved) => {
                Some(format!("friend_removed:{}", field(frame, "friendship_id")))
            }
            Some(EventKind::UserBlocked) => Some(format!(
                "user_blocked:{}:{}",
                field(frame, "blocker_id"),
                field(frame, "blocked_user_id")
            )),
            Some(EventKind::ConversationDeleted) => Some(format!(
                "conversation_deleted:{}",
                field(frame, "conversation_id")
            )),
            None => Some(format!("{}:{}", frame.kind, frame.payload)),
        }
    }

    /// 检查一帧是否重复，并记录它
    ///
    /// seq 游标优先：帧带 seq 时以 [`observe_seq`](Self::observe_seq)
    /// 的判定为准。缺口不丢帧，以 [`FrameDisposition::FreshWithGap`]
    /// 返回缺失区间，由调用方上报触发补拉。
    pub fn check_and_record(&self, frame: &WsFrame) -> FrameDisposition {
        if let Some(seq) = frame.seq {
            let gap = match self.observe_seq(seq) {
                SeqCheck::Duplicate => {
                    debug!("🔄 seq 游标倒退，丢弃重复帧: type={} seq={}", frame.kind, seq);
                    return FrameDisposition::Duplicate;
                }
                SeqCheck::Gap { missing } => Some(missing),
                SeqCheck::Ok => None,
            };
            // seq 判定通过后仍记录时间窗键，供不带 seq 的后续帧比对
            if let Some(key) = Self::dedup_key(frame) {
                self.record(key);
            }
            return match gap {
                Some(missing) => FrameDisposition::FreshWithGap { missing },
                None => FrameDisposition::Fresh,
            };
        }

        let Some(key) = Self::dedup_key(frame) else {
            return FrameDisposition::Fresh;
        };

        let now = Instant::now();
        let mut seen = self.seen.lock();
        if let Some(last) = seen.get(&key) {
            if now.duration_since(*last) <= self.config.window {
                debug!("🔄 检测到重复事件: key={}", key);
                return FrameDisposition::Duplicate;
            }
        }
        seen.insert(key, now);
        if seen.len() > self.cleanup_threshold {
            self.cleanup_internal(&mut seen);
        }
        FrameDisposition::Fresh
    }

    fn record(&self, key: String) {
        let mut seen = self.seen.lock();
        seen.insert(key, Instant::now());
        if seen.len() > self.cleanup_threshold {
            self.cleanup_internal(&mut seen);
        }
    }

    /// 推进 seq 游标
    pub fn observe_seq(&self, seq: u64) -> SeqCheck {
        let mut last = self.last_seq.lock();
        let check = match *last {
            None => SeqCheck::Ok,
            Some(prev) if seq <= prev => return SeqCheck::Duplicate,
            Some(prev) if seq == prev + 1 => SeqCheck::Ok,
            Some(prev) => SeqCheck::Gap {
                missing: (prev + 1)..seq,
            },
        };
        *last = Some(seq);
        check
    }

    /// 重连后重置 seq 纪元
    ///
    /// 服务端 seq 按连接分配，新连接从头计数，旧游标失效。
    /// 时间窗缓存保留，跨连接的重推仍由它兜住。
    pub fn reset_epoch(&self) {
        let mut last = self.last_seq.lock();
        *last = None;
        debug!("seq 纪元已重置");
    }

    /// 内部清理方法（需要已持有锁）
    fn cleanup_internal(&self, seen: &mut HashMap<String, Instant>) {
        let now = Instant::now();
        let initial_count = seen.len();

        seen.retain(|_, at| now.duration_since(*at) <= self.config.retention);

        // 保留期内仍超上限时按最旧淘汰
        if seen.len() > self.config.max_entries {
            let mut by_age: Vec<(String, Instant)> =
                seen.iter().map(|(k, v)| (k.clone(), *v)).collect();
            by_age.sort_by_key(|(_, at)| *at);
            let excess = seen.len() - self.config.max_entries;
            for (key, _) in by_age.into_iter().take(excess) {
                seen.remove(&key);
            }
        }

        let removed = initial_count - seen.len();
        if removed > 0 {
            info!("🧹 清理去重缓存: 移除 {} 条，剩余 {} 条", removed, seen.len());
        }
    }

    /// 清理过期记录（外部调用）
    pub fn cleanup_expired(&self) {
        let mut seen = self.seen.lock();
        self.cleanup_internal(&mut seen);
    }

    /// 获取统计信息 (当前条数, 最大条数)
    pub fn stats(&self) -> (usize, usize) {
        let seen = self.seen.lock();
        (seen.len(), self.config.max_entries)
    }

    /// 清空全部记录与游标
    pub fn clear(&self) {
        self.seen.lock().clear();
        *self.last_seq.lock() = None;
        info!("去重缓存已清空");
    }
}

impl Default for DedupFilter {
    fn default() -> Self {
        Self::new(DedupConfig::default())
    }
}

fn field(frame: &WsFrame, name: &str) -> String {
    frame
        .payload
        .get(name)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
