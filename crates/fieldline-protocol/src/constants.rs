//! 协议常量定义

/// 帧头长度（2 字节消息类型 + 2 字节负载长度）
pub const HEADER_LENGTH: usize = 4;

/// 机箱服务端口
pub const DEFAULT_PORT: u16 = 7777;

/// 每个机箱最多挂载的传感器数量
pub const MAX_SENSORS_PER_CHASSIS: usize = 16;

/// 每个机箱的传感器槽位数量（索引 0 为机箱自身的 ADC 通道）
pub const SENSOR_SLOTS: usize = MAX_SENSORS_PER_CHASSIS + 1;

/// 机箱自身 ADC 通道的传感器索引
pub const CHASSIS_SENSOR_ID: u8 = 0;

/// 保留时间戳：数据流刚刚（重新）开始
pub const STREAM_RESTART_TICK: u32 = 1;

/// 每秒设备 tick 数
pub const TICKS_PER_SECOND: u32 = 25_000;

/// 数据类型：机箱模拟输入
pub const DATATYPE_ANALOG_IN: i32 = 0;

/// 数据类型：开环 Bz
pub const DATATYPE_BZ_OPEN: i32 = 28;

/// 数据类型：By
pub const DATATYPE_BY: i32 = 35;

/// 数据类型：Bx
pub const DATATYPE_BX: i32 = 37;

/// 数据类型：闭环 Bz
pub const DATATYPE_BZ_CLOSED: i32 = 50;

/// 非开发者模式下传感器（1..=16）允许配置的数据类型
pub const SENSOR_ACTIVE_DATATYPES: [i32; 2] = [DATATYPE_BZ_OPEN, DATATYPE_BZ_CLOSED];

/// 非开发者模式下机箱通道（索引 0）允许配置的数据类型
pub const CHASSIS_ACTIVE_DATATYPES: [i32; 1] = [DATATYPE_ANALOG_IN];

/// 机箱 ADC 通道默认标定系数（5 V 参考电压，24 位分辨率）
pub const ADC_CALIBRATION: f64 = 5.0 / (1u32 << 24) as f64;

/// 多机箱固件的 serial/master 合法后缀
pub const VALID_SERIAL_SUFFIX: &str = "17";

/// 逻辑模块命令寄存器地址
pub const LOGIC_MODULE_REGISTER: u32 = 260;

/// LED 颜色编码
pub mod led {
    /// 重启完成
    pub const COLOR_RESTARTED: u32 = 4;
    /// 粗调零阶段
    pub const COLOR_COARSE_ZERO: u32 = 5;
    /// 细调零阶段
    pub const COLOR_FINE_ZERO: u32 = 6;
    /// 就绪
    pub const COLOR_READY: u32 = 9;

    /// 常亮
    pub const BLINK_SOLID: u32 = 1;
    /// 闪烁（阶段进行中）
    pub const BLINK_ACTIVE: u32 = 2;
    /// 错误闪烁
    pub const BLINK_ERROR: u32 = 4;
}
