//! 客户端层错误类型定义

use fieldline_driver::DriverError;
use thiserror::Error;

/// 机群管理错误
#[derive(Error, Debug)]
pub enum FleetError {
    /// 驱动层错误
    #[error("Driver error: {0}")]
    Driver(#[from] DriverError),

    /// 未知机箱（名称）
    #[error("Unknown chassis: {0}")]
    UnknownChassis(String),

    /// 未知机箱（ID）
    #[error("Unknown chassis id: {0}")]
    UnknownChassisId(u32),

    /// 机箱未连接
    #[error("Chassis {0} is not connected")]
    NotConnected(String),

    /// 传感器不存在
    #[error("Sensor {chassis}:{sensor} does not exist")]
    UnknownSensor { chassis: u32, sensor: u8 },

    /// 当前模式下不允许的数据类型
    #[error("Datatype {datatype} is not valid for sensor {sensor}")]
    InvalidDatatype { sensor: u8, datatype: i32 },

    /// 发现服务信息不合法
    #[error("Invalid service {name}: {reason}")]
    InvalidService { name: String, reason: String },

    /// 配置错误
    #[error("Configuration error: {0}")]
    Config(String),

    /// 文件读写错误
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON 解析错误
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// 服务已停止
    #[error("Fleet manager is shut down")]
    ShutDown,
}

impl From<toml::de::Error> for FleetError {
    fn from(e: toml::de::Error) -> Self {
        FleetError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for FleetError {
    fn from(e: toml::ser::Error) -> Self {
        FleetError::Config(e.to_string())
    }
}
