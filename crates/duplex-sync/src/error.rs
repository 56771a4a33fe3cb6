//! 错误类型定义
//!
//! 分层原则：
//! - 传输层/解析错误在本层吞掉，通过事件上报，不 panic
//! - 领域层"拒绝"（权限不足、未知 ID）是正常结果，不走错误通道

use thiserror::Error;

#[derive(Debug, Error)]
pub enum DuplexError {
    /// 传输层错误（连接失败、发送失败等）
    #[error("Transport error: {0}")]
    Transport(String),

    /// 序列化/反序列化错误
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// KV 存储错误
    #[error("KV store error: {0}")]
    KvStore(String),

    /// IO 错误
    #[error("IO error: {0}")]
    Io(String),

    /// 当前未连接
    #[error("Not connected")]
    NotConnected,

    /// 配置错误
    #[error("Config error: {0}")]
    Config(String),

    /// 无效操作（例如对不存在的乐观写做确认）
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl From<serde_json::Error> for DuplexError {
    fn from(error: serde_json::Error) -> Self {
        DuplexError::Serialization(error.to_string())
    }
}

impl From<std::io::Error> for DuplexError {
    fn from(error: std::io::Error) -> Self {
        DuplexError::Io(error.to_string())
    }
}

impl From<sled::Error> for DuplexError {
    fn from(error: sled::Error) -> Self {
        DuplexError::KvStore(error.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DuplexError>;
