//! 引擎配置
//!
//! 所有参数都有可用的默认值，按需用 builder 方法覆盖。

use std::path::PathBuf;
use std::time::Duration;

use crate::dedup::DedupConfig;

/// 重连配置
#[derive(Debug, Clone)]
pub struct ReconnectConfig {
    /// 初始退避间隔
    pub base_delay: Duration,
    /// 退避上限
    pub max_delay: Duration,
    /// 最大重连次数（超过后停止并进入 Error 状态）
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            max_attempts: 5,
        }
    }
}

impl ReconnectConfig {
    /// 第 attempt 次重连的退避时长（attempt 从 1 开始）
    ///
    /// base * 2^(attempt-1)，封顶 max_delay。
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(31);
        let delay = self.base_delay.saturating_mul(1u32 << shift);
        delay.min(self.max_delay)
    }
}

/// 心跳配置
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// ping 发送间隔
    pub interval: Duration,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
        }
    }
}

/// 同步引擎配置
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket 服务端地址（ws:// 或 wss://）
    pub server_url: String,
    /// 本地数据目录（KV 存储落盘位置）
    pub data_dir: PathBuf,
    /// 重连配置
    pub reconnect: ReconnectConfig,
    /// 心跳配置
    pub heartbeat: HeartbeatConfig,
    /// 去重配置
    pub dedup: DedupConfig,
    /// 事件总线容量
    pub event_capacity: usize,
    /// 最近通话保留条数
    pub recent_calls_capacity: usize,
    /// 通知去重时间窗
    pub notification_dedup_window: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "ws://localhost:8080/ws".to_string(),
            data_dir: default_data_dir(),
            reconnect: ReconnectConfig::default(),
            heartbeat: HeartbeatConfig::default(),
            dedup: DedupConfig::default(),
            event_capacity: 256,
            recent_calls_capacity: 10,
            notification_dedup_window: Duration::from_secs(30),
        }
    }
}

impl SyncConfig {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            server_url: server_url.into(),
            ..Default::default()
        }
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat.interval = interval;
        self
    }

    pub fn with_dedup(mut self, dedup: DedupConfig) -> Self {
        self.dedup = dedup;
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity;
        self
    }
}

/// 默认数据目录：~/.duplex-sync，取不到 HOME 时退回当前目录
fn default_data_dir() -> PathBuf {
    dirs_home()
        .map(|home| home.join(".duplex-sync"))
        .unwrap_or_else(|| PathBuf::from("./.duplex-sync"))
}

fn dirs_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_sequence() {
        let config = ReconnectConfig::default();

        assert_eq!(config.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(config.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(config.backoff_delay(3), Duration::from_secs(4));
        assert_eq!(config.backoff_delay(4), Duration::from_secs(8));
        assert_eq!(config.backoff_delay(5), Duration::from_secs(16));
        // 封顶
        assert_eq!(config.backoff_delay(6), Duration::from_secs(30));
        assert_eq!(config.backoff_delay(60), Duration::from_secs(30));
    }

    #[test]
    fn test_builder() {
        let config = SyncConfig::new("wss://example.com/ws")
            .with_heartbeat_interval(Duration::from_secs(15))
            .with_event_capacity(64);

        assert_eq!(config.server_url, "wss://example.com/ws");
        assert_eq!(config.heartbeat.interval, Duration::from_secs(15));
        assert_eq!(config.event_capacity, 64);
        assert_eq!(config.recent_calls_capacity, 10);
    }
}
