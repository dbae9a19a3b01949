//! 采样数据包

use crate::constants::STREAM_RESTART_TICK;

/// 单个采样记录（传感器索引、数据类型、原始整数值）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Sample {
    pub sensor: i32,
    pub datatype: i32,
    pub value: i32,
}

impl Sample {
    /// 序列化后的字节数（3 × i32）
    pub const ENCODED_LEN: usize = 12;

    pub const fn new(sensor: i32, datatype: i32, value: i32) -> Self {
        Self {
            sensor,
            datatype,
            value,
        }
    }
}

/// 一个机箱的一帧数据：设备 tick + 采样列表
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct DataPacket {
    pub timestamp: u32,
    pub samples: Vec<Sample>,
}

impl DataPacket {
    /// 包头字节数（u32 时间戳 + i32 采样数）
    pub const HEADER_LEN: usize = 8;

    pub fn new(timestamp: u32, samples: Vec<Sample>) -> Self {
        Self { timestamp, samples }
    }

    /// 是否为“数据流刚刚（重新）开始”标记帧
    pub fn is_stream_restart(&self) -> bool {
        self.timestamp == STREAM_RESTART_TICK
    }

    /// 在环形缓冲区中占用的字节数
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_LEN + self.samples.len() * Sample::ENCODED_LEN
    }
}
