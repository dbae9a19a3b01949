//! 会话性能指标
//!
//! 原子计数器，由 IO 线程递增，外部随时读取快照。

use std::sync::atomic::{AtomicU64, Ordering};

/// 会话计数器
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    /// 收到的完整帧数（任意类型）
    pub frames_received: AtomicU64,
    /// 写入环形缓冲区的数据包数
    pub data_queued: AtomicU64,
    /// 未开启数据流时读到并丢弃的数据包数
    pub data_ignored: AtomicU64,
    /// 因缓冲区满而丢弃的数据包数
    pub data_overflows: AtomicU64,
    /// 收到的状态记录数
    pub status_received: AtomicU64,
    /// 成功发送的命令数
    pub commands_sent: AtomicU64,
    /// 发送失败的命令数（重试耗尽）
    pub command_failures: AtomicU64,
    /// 成功建立的会话数
    pub sessions: AtomicU64,
    /// 连接失败次数
    pub connect_failures: AtomicU64,
    /// 心跳超时次数
    pub heartbeat_expirations: AtomicU64,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            frames_received: self.frames_received.load(Ordering::Relaxed),
            data_queued: self.data_queued.load(Ordering::Relaxed),
            data_ignored: self.data_ignored.load(Ordering::Relaxed),
            data_overflows: self.data_overflows.load(Ordering::Relaxed),
            status_received: self.status_received.load(Ordering::Relaxed),
            commands_sent: self.commands_sent.load(Ordering::Relaxed),
            command_failures: self.command_failures.load(Ordering::Relaxed),
            sessions: self.sessions.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            heartbeat_expirations: self.heartbeat_expirations.load(Ordering::Relaxed),
        }
    }
}

/// 指标快照
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MetricsSnapshot {
    pub frames_received: u64,
    pub data_queued: u64,
    pub data_ignored: u64,
    pub data_overflows: u64,
    pub status_received: u64,
    pub commands_sent: u64,
    pub command_failures: u64,
    pub sessions: u64,
    pub connect_failures: u64,
    pub heartbeat_expirations: u64,
}
