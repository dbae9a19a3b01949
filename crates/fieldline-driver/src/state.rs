//! 连接状态定义
//!
//! `Disconnected → Connecting → Connected → Closing → Disconnected`，
//! 心跳超时时经由 `HeartbeatExpired` 回到 `Closing`。

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// 单个机箱会话的连接状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConnectionState {
    /// 未连接（初始状态，或等待重连延时）
    #[default]
    Disconnected = 0,
    /// 正在建立 TCP + TLS 会话
    Connecting = 1,
    /// 会话已建立
    Connected = 2,
    /// 连续心跳丢失，即将关闭会话并重连
    HeartbeatExpired = 3,
    /// 正在关闭会话
    Closing = 4,
}

impl ConnectionState {
    /// 从 u8 转换
    ///
    /// 如果值无效，返回 Disconnected。
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            3 => Self::HeartbeatExpired,
            4 => Self::Closing,
            _ => Self::Disconnected,
        }
    }

    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::HeartbeatExpired => "heartbeat expired",
            Self::Closing => "closing",
        };
        f.write_str(s)
    }
}

/// 连接状态（原子版本，用于线程间共享）
#[derive(Debug)]
pub struct AtomicConnectionState {
    inner: AtomicU8,
}

impl AtomicConnectionState {
    pub fn new(state: ConnectionState) -> Self {
        Self {
            inner: AtomicU8::new(state.as_u8()),
        }
    }

    pub fn get(&self, ordering: Ordering) -> ConnectionState {
        ConnectionState::from_u8(self.inner.load(ordering))
    }

    /// 设置新状态，返回旧状态
    pub fn swap(&self, state: ConnectionState, ordering: Ordering) -> ConnectionState {
        ConnectionState::from_u8(self.inner.swap(state.as_u8(), ordering))
    }

    /// 比较并交换（Compare-and-Swap）
    pub fn compare_exchange(
        &self,
        current: ConnectionState,
        new: ConnectionState,
        success: Ordering,
        failure: Ordering,
    ) -> Result<ConnectionState, ConnectionState> {
        self.inner
            .compare_exchange(current.as_u8(), new.as_u8(), success, failure)
            .map(ConnectionState::from_u8)
            .map_err(ConnectionState::from_u8)
    }
}

impl Default for AtomicConnectionState {
    fn default() -> Self {
        Self::new(ConnectionState::Disconnected)
    }
}
