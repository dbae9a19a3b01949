//! 驱动层模块
//!
//! 本模块提供单个 FieldLine 机箱的会话管理，包括：
//! - TLS 会话的建立、心跳监督与自动重连
//! - 命令队列与发送重试
//! - 接收帧解析与分发（DATA 进入环形缓冲区，STATUS/应答交给处理器）
//! - 数据环形缓冲区（单生产者/单消费者，支持带握手的清空）
//! - 一次性命令（发现阶段探测、识别灯）
//!
//! 多机箱的发现、传感器状态机和帧同步由 `fieldline-client` 负责。

mod builder;
mod config;
mod connection;
mod error;
pub mod heartbeat;
mod metrics;
pub mod oneshot;
pub mod pipeline;
pub mod ring_queue;
pub mod signal;
pub mod state;

pub use builder::ConnectionBuilder;
pub use config::ConnectionConfig;
pub use connection::{ConnectionHandler, NoopHandler, ProtocolConnection};
pub use error::{DriverError, QueueError};
pub use heartbeat::{HeartbeatMonitor, HeartbeatVerdict, ReconnectBackoff};
pub use metrics::{ConnectionMetrics, MetricsSnapshot};
pub use oneshot::{one_shot_command, one_shot_status, probe_system_status};
pub use pipeline::SessionEvent;
pub use ring_queue::{QueueProducer, RingBufferQueue};
pub use signal::{Event, JoinTimeout};
pub use state::{AtomicConnectionState, ConnectionState};
