//! 连接配置

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::ring_queue::DEFAULT_QUEUE_CAPACITY;

/// 单个机箱会话的配置
///
/// 所有字段在 TOML 中均可省略，省略时取默认值。
///
/// # Example
///
/// ```
/// use fieldline_driver::ConnectionConfig;
///
/// // 默认：1s 心跳，连续 4 次丢失判定超时
/// let config = ConnectionConfig::default();
/// assert_eq!(config.max_missed_heartbeats, 4);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// 心跳检查周期（毫秒）
    pub heartbeat_interval_ms: u64,
    /// 连续丢失多少次心跳后判定会话失效
    pub max_missed_heartbeats: u32,
    /// 套接字读超时（毫秒），决定接收循环观察关闭信号的频率
    ///
    /// 收发共用一个传输对象，链路空闲时命令最多等待一个读超时才能发出。
    pub read_timeout_ms: u64,
    /// TCP 连接 + TLS 握手超时（毫秒）
    pub connect_timeout_ms: u64,
    /// 一次性命令等待应答的超时（毫秒）
    pub one_shot_timeout_ms: u64,
    /// 重连短延时（毫秒）
    pub reconnect_delay_ms: u64,
    /// 重连长延时（毫秒）
    pub reconnect_long_delay_ms: u64,
    /// 使用短延时的连续失败次数
    pub reconnect_short_attempts: u32,
    /// 单条命令发送失败时的最大尝试次数
    pub send_retries: u32,
    /// 命令队列容量
    pub command_queue_capacity: usize,
    /// 数据环形缓冲区容量（字节）
    pub queue_capacity: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 1000,
            max_missed_heartbeats: 4,
            read_timeout_ms: 100,
            connect_timeout_ms: 3000,
            one_shot_timeout_ms: 5000,
            reconnect_delay_ms: 1000,
            reconnect_long_delay_ms: 5000,
            reconnect_short_attempts: 30,
            send_retries: 3,
            command_queue_capacity: 64,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl ConnectionConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn one_shot_timeout(&self) -> Duration {
        Duration::from_millis(self.one_shot_timeout_ms)
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms)
    }

    pub fn reconnect_long_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_long_delay_ms)
    }
}
