//! # FieldLine Protocol
//!
//! 磁力计机箱网络协议定义（无 I/O 依赖）
//!
//! ## 模块
//!
//! - `ids`: 消息类型、状态类型、命令码等编号
//! - `constants`: 协议常量（端口、头长度、寄存器编号）
//! - `control`: 客户端 → 机箱的命令记录
//! - `feedback`: 机箱 → 客户端的状态与命令应答记录
//! - `data`: 采样数据包
//! - `framing`: 4 字节帧头与增量帧解码器
//! - `codec`: 记录序列化边界（`MessageCodec`）与参考实现
//!
//! ## 字节序
//!
//! 帧头使用大端字节序：`[2 字节消息类型][2 字节负载长度][负载]`。

pub mod codec;
pub mod constants;
pub mod control;
pub mod data;
pub mod feedback;
pub mod framing;
pub mod ids;

// 重新导出常用类型
pub use codec::{BinaryCodec, MessageCodec};
pub use constants::*;
pub use control::*;
pub use data::*;
pub use feedback::*;
pub use framing::{FrameDecoder, FrameHeader, RawFrame, encode_frame};
pub use ids::*;

use thiserror::Error;

/// 协议解析错误类型
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Unknown message type: {0}")]
    UnknownMessageType(u16),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Truncated record: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Invalid value for field {field}: {value}")]
    InvalidValue { field: &'static str, value: u32 },

    #[error("Invalid UTF-8 in field {0}")]
    InvalidUtf8(&'static str),
}
