//! Prelude - 常用类型的便捷导入
//!
//! ```rust
//! use fieldline_sdk::prelude::*;
//! ```

// 客户端层（推荐使用）
pub use fieldline_client::{
    ChannelInfo, ChassisIdentityMap, ChassisIdentityStore, ChassisInfo, FleetBuilder,
    FleetCallbacks, FleetConfig, FleetManager, MemoryIdentityStore, NoopCallbacks, SampleRecord,
    SensorErrorKind, SensorInfo, SensorLifecycle, ServiceEvent, SyncStats, SyncedBatch,
    TomlIdentityStore,
};

// 协议层常用类型
pub use fieldline_protocol::{
    ChannelConfig, DATATYPE_ANALOG_IN, DATATYPE_BZ_CLOSED, DATATYPE_BZ_OPEN, RawRegister,
    WaveKind, WaveRequest,
};

// 驱动层（高级用户使用）
pub use fieldline_driver::{ConnectionConfig, ConnectionState, ProtocolConnection};

// 错误类型
pub use fieldline_client::FleetError;
pub use fieldline_driver::DriverError;
pub use fieldline_net::TransportError;
pub use fieldline_protocol::ProtocolError;
