//! 控制命令记录
//!
//! 客户端发往机箱的所有命令都表示为 [`Command`]，由 [`MessageCodec`](crate::MessageCodec)
//! 负责序列化为 CMD 帧负载。

use crate::ids::{CommandCode, LogicKind, WaveKind};

/// 通道配置项（传感器 + 数据类型 + 采样频率）
///
/// 频率为 0 表示关闭该通道。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ChannelConfig {
    pub sensor_id: u8,
    pub datatype: i32,
    pub freq: u32,
}

/// 原始寄存器访问
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawRegister {
    pub all_sensors: bool,
    pub sensor_num: u8,
    pub register_address: u32,
    pub data: u32,
}

/// 单个传感器的逻辑命令（重启/粗调零/细调零/关闭）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LogicRequest {
    pub sensor_id: u8,
    pub kind: LogicKind,
}

/// 单个传感器的波形命令
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveRequest {
    pub sensor_id: u8,
    pub kind: WaveKind,
    /// 幅值（nT）
    pub amplitude: f64,
    /// 频率（Hz）
    pub freq: f64,
}

impl WaveRequest {
    /// 关闭波形
    pub fn off(sensor_id: u8) -> Self {
        Self {
            sensor_id,
            kind: WaveKind::Off,
            amplitude: 0.0,
            freq: 0.0,
        }
    }
}

/// 客户端 → 机箱命令
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    StatusRequest,
    SystemStatusRequest,
    ResetFpga,
    SensorConfigRequest,
    ConfigList(Vec<ChannelConfig>),
    RawWrite(RawRegister),
    OneTimeRead(RawRegister),
    Logic(Vec<LogicRequest>),
    Wave(Vec<WaveRequest>),
    ClosedLoop(bool),
    /// 开发者模式：`enable = true` 时携带口令
    DeveloperMode {
        enable: bool,
        password: Option<String>,
    },
    Update {
        uri: String,
    },
    UpdateCommit,
    Reboot,
    Identify(bool),
}

impl Command {
    /// 命令码
    pub fn code(&self) -> CommandCode {
        match self {
            Command::StatusRequest => CommandCode::StatusRequest,
            Command::SystemStatusRequest => CommandCode::SystemStatusRequest,
            Command::ResetFpga => CommandCode::ResetFpga,
            Command::SensorConfigRequest => CommandCode::SensorConfigRequest,
            Command::ConfigList(_) => CommandCode::ConfigList,
            Command::RawWrite(_) => CommandCode::RawWrite,
            Command::OneTimeRead(_) => CommandCode::OneTimeRead,
            Command::Logic(_) => CommandCode::Logic,
            Command::Wave(_) => CommandCode::Wave,
            Command::ClosedLoop(_) => CommandCode::ClosedLoop,
            Command::DeveloperMode { .. } => CommandCode::DeveloperMode,
            Command::Update { .. } => CommandCode::Update,
            Command::UpdateCommit => CommandCode::UpdateCommit,
            Command::Reboot => CommandCode::Reboot,
            Command::Identify(_) => CommandCode::Identify,
        }
    }

    /// 原始寄存器写（单个传感器）
    pub fn raw_write(sensor_num: u8, register_address: u32, data: u32) -> Self {
        Command::RawWrite(RawRegister {
            all_sensors: false,
            sensor_num,
            register_address,
            data,
        })
    }

    /// 一次性寄存器读（数据字段不使用但必须存在）
    pub fn one_time_read(sensor_num: u8, register_address: u32) -> Self {
        Command::OneTimeRead(RawRegister {
            all_sensors: false,
            sensor_num,
            register_address,
            data: 0,
        })
    }
}
