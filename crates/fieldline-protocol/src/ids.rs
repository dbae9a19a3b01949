//! 消息编号定义
//!
//! 所有枚举都通过 `num_enum` 与线上的整数编码互转。

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// 帧头中的消息类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u16)]
pub enum MessageType {
    /// 命令（客户端 → 机箱），以及机箱对原始读/开发者模式的应答
    Cmd = 1,
    /// 状态遥测（机箱 → 客户端）
    Status = 2,
    /// 采样数据（机箱 → 客户端）
    Data = 3,
}

/// 命令码
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum CommandCode {
    StatusRequest = 1,
    SystemStatusRequest = 2,
    ResetFpga = 3,
    SensorConfigRequest = 4,
    ConfigList = 5,
    RawWrite = 6,
    OneTimeRead = 7,
    Logic = 8,
    Wave = 9,
    ClosedLoop = 10,
    DeveloperMode = 11,
    Update = 12,
    UpdateCommit = 13,
    Reboot = 14,
    Identify = 15,
}

/// 状态记录类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum StatusKind {
    /// 普通状态（心跳应答）
    Status = 0,
    /// 系统状态：机箱编号、机箱总数、固件版本、序列号
    SystemStatus = 1,
    /// 传感器 LED 颜色/闪烁
    SensorLed = 2,
    /// 传感器通道配置
    SensorConfig = 3,
    /// 传感器在位/序列号
    SensorStatus = 4,
    /// 传感器生命周期事件
    SensorState = 5,
    /// 传感器三轴场强
    SensorField = 6,
    /// 固件更新进度
    Progress = 7,
}

/// 传感器生命周期事件码（STATUS 子消息）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SensorStateCode {
    Restart = 1,
    RestartComplete = 2,
    CoarseZero = 3,
    CoarseZeroComplete = 4,
    FineZero = 5,
    FineZeroComplete = 6,
    Ready = 7,
    Error = 8,
    SoftError = 9,
}

/// 逻辑命令类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum LogicKind {
    SensorOff = 0,
    SensorRestart = 1,
    SensorCoarseZero = 2,
    SensorFineZero = 3,
}

/// 波形类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum WaveKind {
    Off = 0,
    Ramp = 1,
    Sine = 2,
}
