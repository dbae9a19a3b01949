//! 机箱反馈记录
//!
//! 包括 STATUS 遥测记录与 CMD 应答（原始读、开发者模式口令校验）。

use crate::control::RawRegister;
use crate::ids::{CommandCode, SensorStateCode, StatusKind};

/// 系统状态（多机箱固件）
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SystemStatus {
    /// 本机箱在机群中的编号
    pub num: u32,
    /// 机箱上报的机群机箱总数
    pub total: u32,
    pub version: String,
    pub master: String,
    pub serial: String,
}

/// 传感器 LED 状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorLed {
    pub sensor_id: u8,
    pub color: u32,
    pub blink_state: u32,
}

/// 机箱上报的通道配置
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorConfigEntry {
    pub sensor_id: u8,
    pub datatype: i32,
    pub freq: u32,
    pub calibration: Option<f64>,
}

/// 传感器在位信息
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorPresence {
    pub sensor_id: u8,
    pub connected: bool,
    pub card_serial: u32,
    pub sensor_serial: Option<u32>,
}

/// 传感器生命周期事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorStateReport {
    pub sensor_id: u8,
    pub state: SensorStateCode,
}

/// 传感器三轴场强
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SensorField {
    pub sensor_id: u8,
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

/// 状态记录主体
#[derive(Debug, Clone, PartialEq)]
pub enum StatusBody {
    Status,
    SystemStatus(SystemStatus),
    SensorLed(Vec<SensorLed>),
    SensorConfig(Vec<SensorConfigEntry>),
    SensorStatus(Vec<SensorPresence>),
    SensorState(Vec<SensorStateReport>),
    SensorField(Vec<SensorField>),
    Progress { progress: u32, message: String },
}

/// 机箱 → 客户端状态记录
#[derive(Debug, Clone, PartialEq)]
pub struct StatusPacket {
    /// 机箱自报名称（`address:port`）
    pub chassis_name: String,
    pub version: String,
    /// 人类可读的状态文本
    pub status: String,
    /// 机箱闭环状态（未携带时为 `None`）
    pub closed_loop: Option<bool>,
    pub body: StatusBody,
}

impl StatusPacket {
    /// 创建不携带附加字段的状态记录
    pub fn new(chassis_name: impl Into<String>, body: StatusBody) -> Self {
        Self {
            chassis_name: chassis_name.into(),
            version: String::new(),
            status: String::new(),
            closed_loop: None,
            body,
        }
    }

    pub fn kind(&self) -> StatusKind {
        match &self.body {
            StatusBody::Status => StatusKind::Status,
            StatusBody::SystemStatus(_) => StatusKind::SystemStatus,
            StatusBody::SensorLed(_) => StatusKind::SensorLed,
            StatusBody::SensorConfig(_) => StatusKind::SensorConfig,
            StatusBody::SensorStatus(_) => StatusKind::SensorStatus,
            StatusBody::SensorState(_) => StatusKind::SensorState,
            StatusBody::SensorField(_) => StatusKind::SensorField,
            StatusBody::Progress { .. } => StatusKind::Progress,
        }
    }
}

/// 机箱 → 客户端 CMD 应答
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandResponse {
    /// 原始寄存器读结果
    RawRead(RawRegister),
    /// 开发者模式口令校验结果
    DeveloperMode { enable: bool, valid: bool },
    /// 不带原始读/开发者模式字段的应答（忽略）
    Other(CommandCode),
}
