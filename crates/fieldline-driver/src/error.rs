//! 驱动层错误类型定义

use fieldline_net::TransportError;
use fieldline_protocol::ProtocolError;
use thiserror::Error;

/// 环形缓冲区错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// 剩余空间不足（生产者应停止数据流，而不是阻塞）
    #[error("Ring buffer full: {requested} bytes requested, {available} available")]
    Full { requested: usize, available: usize },

    /// 缓冲区分配失败
    #[error("Failed to allocate ring buffer of {0} bytes")]
    Allocation(usize),
}

/// 驱动层错误类型
#[derive(Error, Debug)]
pub enum DriverError {
    /// 传输层错误
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// 协议解析错误
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// 环形缓冲区错误
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// 命令通道已关闭（连接已关闭）
    #[error("Command channel closed")]
    ChannelClosed,

    /// 命令通道已满
    #[error("Command channel full (buffer size: {0})")]
    ChannelFull(usize),

    /// IO 线程错误
    #[error("IO thread error: {0}")]
    IoThread(String),

    /// 操作超时
    #[error("Operation timeout")]
    Timeout,
}
