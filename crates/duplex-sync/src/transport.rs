//! WebSocket 传输层
//!
//! 负责连接生命周期：鉴权连接、指数退避重连、心跳保活、
//! 帧的收发。收到的帧原样上抛给路由器，传输层不做业务解析。
//!
//! 并发模型：一个连接任务独占 WebSocket 流，出站帧经 mpsc
//! 排队，手动断开通过 CancellationToken 通知。

use futures_util::{Sink, SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{HeartbeatConfig, ReconnectConfig};
use crate::error::{DuplexError, Result};
use crate::protocol::{EventKind, WsFrame};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// 连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// 重连次数耗尽，不再自动重试
    Error,
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Error => "error",
        };
        f.write_str(s)
    }
}

/// 传输层事件，经 mpsc 上抛给路由器
#[derive(Debug)]
pub enum TransportEvent {
    /// 收到一帧（ping/pong 已在传输层消化，不会出现在这里）
    Frame(WsFrame),
    /// 连接状态变更
    StatusChanged {
        old: ConnectionStatus,
        new: ConnectionStatus,
    },
    /// 传输层错误（已在内部处理，仅供观测）
    Error(String),
    /// 即将发起第 attempt 次重连
    ReconnectAttempt { attempt: u32, delay: Duration },
}

/// 出站帧发送句柄
///
/// 内部持有共享的出站队列槽位，重连换新队列后旧句柄依然有效。
#[derive(Clone)]
pub struct FrameSender {
    tx: Arc<parking_lot::RwLock<mpsc::Sender<WsFrame>>>,
    status: Arc<parking_lot::RwLock<ConnectionStatus>>,
}

impl FrameSender {
    /// 发送一帧；未连接时立刻报错，不做排队
    pub fn send(&self, frame: WsFrame) -> Result<()> {
        if *self.status.read() != ConnectionStatus::Connected {
            return Err(DuplexError::NotConnected);
        }
        self.tx
            .read()
            .try_send(frame)
            .map_err(|e| DuplexError::Transport(format!("出站队列不可用: {}", e)))
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }
}

/// WebSocket 传输客户端
pub struct WsTransport {
    server_url: String,
    reconnect: ReconnectConfig,
    heartbeat: HeartbeatConfig,
    status: Arc<parking_lot::RwLock<ConnectionStatus>>,
    outbound_tx: Arc<parking_lot::RwLock<mpsc::Sender<WsFrame>>>,
    cancel: CancellationToken,
}

impl WsTransport {
    pub fn new(
        server_url: String,
        reconnect: ReconnectConfig,
        heartbeat: HeartbeatConfig,
    ) -> Self {
        // 占位队列，首次 connect 前发送先被状态检查挡下
        let (outbound_tx, _) = mpsc::channel(1);
        Self {
            server_url,
            reconnect,
            heartbeat,
            status: Arc::new(parking_lot::RwLock::new(ConnectionStatus::Disconnected)),
            outbound_tx: Arc::new(parking_lot::RwLock::new(outbound_tx)),
            cancel: CancellationToken::new(),
        }
    }

    /// 当前连接状态
    pub fn status(&self) -> ConnectionStatus {
        *self.status.read()
    }

    /// 出站帧发送句柄（可克隆，随处分发，跨重连有效）
    pub fn sender(&self) -> FrameSender {
        FrameSender {
            tx: self.outbound_tx.clone(),
            status: self.status.clone(),
        }
    }

    /// 带鉴权发起连接，启动连接任务
    ///
    /// token 以查询参数挂到连接地址上。每次调用换新的出站队列
    /// 与取消令牌，手动断开或重连耗尽后可再次发起。连接任务仍在
    /// 运行时重复调用返回错误。
    pub fn connect(
        &mut self,
        token: &str,
        event_tx: mpsc::Sender<TransportEvent>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let url = build_url(&self.server_url, token)?;

        {
            let mut status = self.status.write();
            let busy = matches!(
                *status,
                ConnectionStatus::Connecting
                    | ConnectionStatus::Connected
                    | ConnectionStatus::Reconnecting
            );
            // cancel 已触发说明旧任务在收尾，不算占用
            if busy && !self.cancel.is_cancelled() {
                return Err(DuplexError::InvalidOperation("连接任务仍在运行".to_string()));
            }
            let old = *status;
            *status = ConnectionStatus::Connecting;
            if old != ConnectionStatus::Connecting {
                let _ = event_tx.try_send(TransportEvent::StatusChanged {
                    old,
                    new: ConnectionStatus::Connecting,
                });
            }
        }

        let (outbound_tx, outbound_rx) = mpsc::channel(128);
        *self.outbound_tx.write() = outbound_tx;
        self.cancel = CancellationToken::new();

        let worker = ConnectionWorker {
            url,
            reconnect: self.reconnect.clone(),
            heartbeat: self.heartbeat.clone(),
            status: self.status.clone(),
            event_tx,
            cancel: self.cancel.clone(),
        };
        Ok(tokio::spawn(worker.run(outbound_rx)))
    }

    /// 手动断开，取消重连；之后可再次 [`connect`](Self::connect)
    pub fn disconnect(&self) {
        info!("手动断开连接");
        self.cancel.cancel();
    }
}

/// token 挂到 URL 查询参数
fn build_url(server_url: &str, token: &str) -> Result<String> {
    if !server_url.starts_with("ws://") && !server_url.starts_with("wss://") {
        return Err(DuplexError::Config(format!(
            "服务端地址必须是 ws:// 或 wss://: {}",
            server_url
        )));
    }
    let sep = if server_url.contains('?') { '&' } else { '?' };
    Ok(format!("{}{}token={}", server_url, sep, token))
}

struct ConnectionWorker {
    url: String,
    reconnect: ReconnectConfig,
    heartbeat: HeartbeatConfig,
    status: Arc<parking_lot::RwLock<ConnectionStatus>>,
    event_tx: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
}

/// 单次连接会话的退出原因
enum SessionEnd {
    /// 流正常/异常关闭，进入重连
    Dropped,
    /// 手动取消
    Cancelled,
}

impl ConnectionWorker {
    async fn run(self, mut outbound_rx: mpsc::Receiver<WsFrame>) {
        let mut attempt: u32 = 0;

        loop {
            let connecting_status = if attempt == 0 {
                ConnectionStatus::Connecting
            } else {
                ConnectionStatus::Reconnecting
            };
            self.set_status(connecting_status).await;

            match connect_async(&self.url).await {
                Ok((stream, _resp)) => {
                    info!("✅ WebSocket 已连接");
                    attempt = 0;
                    self.set_status(ConnectionStatus::Connected).await;

                    match self.session(stream, &mut outbound_rx).await {
                        SessionEnd::Cancelled => {
                            self.set_status(ConnectionStatus::Disconnected).await;
                            return;
                        }
                        SessionEnd::Dropped => {
                            warn!("连接断开，准备重连");
                        }
                    }
                }
                Err(e) => {
                    error!("连接失败: {}", e);
                    self.emit(TransportEvent::Error(e.to_string())).await;
                }
            }

            if self.cancel.is_cancelled() {
                self.set_status(ConnectionStatus::Disconnected).await;
                return;
            }

            attempt += 1;
            if attempt > self.reconnect.max_attempts {
                error!("重连次数耗尽（{} 次），停止重试", self.reconnect.max_attempts);
                self.set_status(ConnectionStatus::Error).await;
                return;
            }

            let delay = self.reconnect.backoff_delay(attempt);
            info!("🔄 第 {} 次重连，退避 {:?}", attempt, delay);
            self.emit(TransportEvent::ReconnectAttempt { attempt, delay })
                .await;

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = self.cancel.cancelled() => {
                    self.set_status(ConnectionStatus::Disconnected).await;
                    return;
                }
            }
        }
    }

    /// 单次连接会话：收帧、发帧、心跳，直到流断开或取消
    async fn session(
        &self,
        stream: WsStream,
        outbound_rx: &mut mpsc::Receiver<WsFrame>,
    ) -> SessionEnd {
        let (mut sink, mut source) = stream.split();
        let mut heartbeat = tokio::time::interval(self.heartbeat.interval);
        // 第一个 tick 立即返回，跳过它避免连上就发 ping
        heartbeat.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    let _ = sink.send(Message::Close(None)).await;
                    return SessionEnd::Cancelled;
                }
                _ = heartbeat.tick() => {
                    if let Err(e) = send_frame(&mut sink, &WsFrame::ping()).await {
                        warn!("心跳发送失败: {}", e);
                        return SessionEnd::Dropped;
                    }
                    debug!("💓 心跳 ping 已发送");
                }
                frame = outbound_rx.recv() => {
                    let Some(frame) = frame else { return SessionEnd::Cancelled };
                    if let Err(e) = send_frame(&mut sink, &frame).await {
                        warn!("发送失败: type={} err={}", frame.kind, e);
                        self.emit(TransportEvent::Error(e.to_string())).await;
                        return SessionEnd::Dropped;
                    }
                }
                msg = source.next() => {
                    match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.on_text(&text, &mut sink).await;
                        }
                        Some(Ok(Message::Ping(data))) => {
                            // 协议层 ping 由底层库自动回 pong，这里只记录
                            debug!("收到协议层 ping ({} 字节)", data.len());
                        }
                        Some(Ok(Message::Pong(_))) | Some(Ok(Message::Binary(_))) | Some(Ok(Message::Frame(_))) => {}
                        Some(Ok(Message::Close(_))) => {
                            info!("服务端关闭连接");
                            return SessionEnd::Dropped;
                        }
                        Some(Err(e)) => {
                            warn!("读取失败: {}", e);
                            self.emit(TransportEvent::Error(e.to_string())).await;
                            return SessionEnd::Dropped;
                        }
                        None => return SessionEnd::Dropped,
                    }
                }
            }
        }
    }

    /// 处理一条文本帧：解析失败只告警，ping/pong 就地消化
    async fn on_text(
        &self,
        text: &str,
        sink: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    ) {
        let frame: WsFrame = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("丢弃无法解析的帧: {}", e);
                self.emit(TransportEvent::Error(format!("帧解析失败: {}", e)))
                    .await;
                return;
            }
        };

        match frame.event_kind() {
            Some(EventKind::Ping) => {
                debug!("收到服务端 ping，回复 pong");
                if let Err(e) = send_frame(sink, &WsFrame::pong()).await {
                    warn!("pong 回复失败: {}", e);
                }
            }
            Some(EventKind::Pong) => {
                debug!("💓 收到 pong");
            }
            _ => {
                if self.event_tx.send(TransportEvent::Frame(frame)).await.is_err() {
                    warn!("路由器已关闭，丢弃入站帧");
                }
            }
        }
    }

    async fn set_status(&self, new: ConnectionStatus) {
        let old = {
            let mut status = self.status.write();
            let old = *status;
            *status = new;
            old
        };
        if old != new {
            debug!("连接状态: {} -> {}", old, new);
            self.emit(TransportEvent::StatusChanged { old, new }).await;
        }
    }

    async fn emit(&self, event: TransportEvent) {
        if self.event_tx.send(event).await.is_err() {
            debug!("传输事件无人接收");
        }
    }
}

async fn send_frame(
    sink: &mut (impl Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin),
    frame: &WsFrame,
) -> Result<()> {
    let text = serde_json::to_string(frame)?;
    sink.send(Message::Text(text))
        .await
        .map_err(|e| DuplexError::Transport(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_url_appends_token() {
        assert_eq!(
            build_url("ws://host/ws", "t0k3n").unwrap(),
            "ws://host/ws?token=t0k3n"
        );
        assert_eq!(
            build_url("wss://host/ws?v=2", "t").unwrap(),
            "wss://host/ws?v=2&token=t"
        );
    }

    #[test]
    fn test_build_url_rejects_http() {
        assert!(build_url("http://host/ws", "t").is_err());
    }

    #[tokio::test]
    async fn test_sender_rejects_when_disconnected() {
        let transport = WsTransport::new(
            "ws://localhost:9/ws".to_string(),
            ReconnectConfig::default(),
            HeartbeatConfig::default(),
        );

        let sender = transport.sender();
        let err = sender.send(WsFrame::ping()).unwrap_err();
        assert!(matches!(err, DuplexError::NotConnected));
    }

    #[tokio::test]
    async fn test_connect_twice_fails() {
        let (event_tx, mut event_rx) = mpsc::channel(64);
        let mut transport = WsTransport::new(
            "ws://127.0.0.1:1/ws".to_string(),
            ReconnectConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                max_attempts: 1,
            },
            HeartbeatConfig::default(),
        );

        let handle = transport.connect("t", event_tx).unwrap();
        let (second_tx, _second_rx) = mpsc::channel(64);
        assert!(transport.connect("t", second_tx).is_err());

        // 无法连通的地址最终进入 Error 状态
        handle.await.unwrap();
        let mut saw_error_status = false;
        while let Ok(event) = event_rx.try_recv() {
            if let TransportEvent::StatusChanged { new, .. } = event {
                if new == ConnectionStatus::Error {
                    saw_error_status = true;
                }
            }
        }
        assert!(saw_error_status);
        assert_eq!(transport.status(), ConnectionStatus::Error);
    }

    #[tokio::test]
    async fn test_reconnect_after_manual_disconnect() {
        let mut transport = WsTransport::new(
            "ws://127.0.0.1:1/ws".to_string(),
            ReconnectConfig::default(),
            HeartbeatConfig::default(),
        );

        let (event_tx, _event_rx) = mpsc::channel(64);
        let handle = transport.connect("t", event_tx).unwrap();
        transport.disconnect();
        handle.await.unwrap();
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);

        // 手动断开后允许再次发起连接
        let (event_tx, _event_rx) = mpsc::channel(64);
        let handle = transport.connect("t", event_tx).unwrap();
        assert_eq!(transport.status(), ConnectionStatus::Connecting);
        transport.disconnect();
        handle.await.unwrap();
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_reconnect_after_attempts_exhausted() {
        let (event_tx, _event_rx) = mpsc::channel(64);
        let mut transport = WsTransport::new(
            "ws://127.0.0.1:1/ws".to_string(),
            ReconnectConfig {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
                max_attempts: 1,
            },
            HeartbeatConfig::default(),
        );

        let handle = transport.connect("t", event_tx).unwrap();
        handle.await.unwrap();
        assert_eq!(transport.status(), ConnectionStatus::Error);

        // 重连耗尽后也允许重新发起
        let (event_tx, _event_rx) = mpsc::channel(64);
        let handle = transport.connect("t", event_tx).unwrap();
        transport.disconnect();
        handle.await.unwrap();
    }
}
