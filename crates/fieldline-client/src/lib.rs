//! 机群客户端模块
//!
//! 本模块在单机箱会话（`fieldline-driver`）之上管理整个机群，包括：
//! - 发现事件的校验与机箱在线确认
//! - 机箱身份表（地址 → 逻辑 ID）的持久化
//! - 传感器硬件状态、通道配置与生命周期状态机
//! - 多机箱帧同步（按采样 tick 对齐，重启标记触发重同步）
//! - 连接监视、闭环一致性检查与固件更新流程
//!
//! 大多数用户只需要 [`FleetManager`] 与 [`FleetCallbacks`]。

mod builder;
pub mod callback;
pub mod config;
pub mod discovery;
mod error;
mod fleet;
pub mod hardware_state;
pub mod identity;
pub mod sensor_state;
pub mod synchronizer;

pub use builder::FleetBuilder;
pub use callback::{FleetCallbacks, NoopCallbacks, SensorErrorKind};
pub use config::FleetConfig;
pub use discovery::{DiscoveredChassis, ServiceEvent, ServiceInfo, ServiceProperties};
pub use error::FleetError;
pub use fleet::{ChassisInfo, DEFAULT_SAMPLE_FREQ, FleetManager, SensorConfigTable, is_datatype_valid};
pub use hardware_state::{
    ActiveChannels, ChannelInfo, HardwareState, LocationTable, SensorInfo, SensorLocation,
    channel_key, default_location,
};
pub use identity::{ChassisIdentityMap, ChassisIdentityStore, MemoryIdentityStore, TomlIdentityStore};
pub use sensor_state::{LifecycleEvent, SensorLifecycle, SensorTracker};
pub use synchronizer::{FrameSynchronizer, SampleRecord, SyncState, SyncStats, SyncedBatch};
