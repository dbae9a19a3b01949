//! FieldLine SDK - FieldLine OPM 机箱 Rust SDK
//!
//! # 架构设计
//!
//! 本 SDK 采用分层架构，从底层到高层：
//!
//! - **协议层** (`protocol`): 帧格式与负载编解码
//! - **传输层** (`net`): TLS 连接与内存模拟机箱
//! - **驱动层** (`driver`): 单机箱会话、心跳监督、自动重连与数据环形缓冲区
//! - **客户端层** (`client`): 机群管理、传感器状态机与多机箱帧同步
//!
//! # 快速开始
//!
//! ```no_run
//! use fieldline_sdk::prelude::*;
//!
//! fieldline_sdk::init_logging();
//! let fleet = FleetManager::builder().build()?;
//! if !fleet.startup()? {
//!     let mut chassis = ChassisIdentityMap::new();
//!     chassis.insert("192.168.2.43:7777".to_string(), 0);
//!     fleet.connect_chassis_list(chassis)?;
//! }
//! # Ok::<(), FleetError>(())
//! ```

pub use fieldline_client as client;
pub use fieldline_driver as driver;
pub use fieldline_net as net;
pub use fieldline_protocol as protocol;

pub mod prelude;

pub use fieldline_client::{
    FleetBuilder, FleetCallbacks, FleetConfig, FleetError, FleetManager, NoopCallbacks,
    SyncedBatch,
};
pub use fieldline_driver::{DriverError, ProtocolConnection};
pub use fieldline_net::{Endpoint, TransportError};
pub use fieldline_protocol::ProtocolError;

use tracing_subscriber::EnvFilter;

/// 默认日志级别
pub const DEFAULT_LOG_FILTER: &str = "info";

/// 初始化日志（`RUST_LOG` 优先，否则为 `info`）
///
/// 同时把 `log` 记录转发到 tracing。重复调用不会报错。
pub fn init_logging() {
    init_logging_with(DEFAULT_LOG_FILTER);
}

/// 以给定的默认过滤规则初始化日志
pub fn init_logging_with(default_filter: &str) {
    let _ = tracing_log::LogTracer::init();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
