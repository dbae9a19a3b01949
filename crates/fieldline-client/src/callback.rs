//! 消费者回调接口
//!
//! [`FleetManager`](crate::FleetManager) 通过 [`FleetCallbacks`] 向上层报告所有事件。
//! 每个方法都有空的默认实现，消费者只需覆盖关心的事件。
//!
//! 回调可能在不同线程中调用（会话分发线程、帧同步线程、监视线程），
//! 实现者不应在回调中长时间阻塞。

use fieldline_protocol::RawRegister;

use crate::synchronizer::SyncedBatch;

/// 传感器错误级别
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorErrorKind {
    /// 硬错误：传感器在本次会话中移出有效集合
    Hard,
    /// 软错误：仅报告
    Soft,
}

impl std::fmt::Display for SensorErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SensorErrorKind::Hard => write!(f, "error"),
            SensorErrorKind::Soft => write!(f, "soft error"),
        }
    }
}

#[allow(unused_variables)]
pub trait FleetCallbacks: Send + Sync {
    // ==================== 机箱 ====================

    /// 机箱会话已建立（每次重连都会调用）
    fn on_chassis_connected(&self, chassis_name: &str, chassis_id: u32) {}

    /// 机箱被移出机群
    fn on_chassis_disconnected(&self, chassis_id: u32) {}

    /// 已连接且在预期列表中的机箱数变化（或预期数变化）
    fn on_connections_changed(&self, connected: usize, expected: usize) {}

    /// 机箱报告的机群规模与预期不一致（`mismatch = false` 表示恢复一致）
    fn on_config_mismatch(&self, mismatch: bool) {}

    /// 设备级错误（例如运行中的机箱断开）
    fn on_device_error(&self, message: &str) {}

    /// 机箱状态文本
    fn on_chassis_status(&self, chassis_name: &str, status: &str) {}

    /// 固件更新进度
    fn on_update_progress(&self, chassis_name: &str, progress: u32, message: &str) {}

    /// 机群闭环状态（所有机箱一致时报告）
    fn on_closed_loop(&self, closed: bool) {}

    // ==================== 传感器 ====================

    /// 连接后第一次收到传感器在位信息
    fn on_sensors_available(&self, chassis_id: u32, sensors: &[u8]) {}

    fn on_restart_begin(&self, chassis_id: u32, sensor_id: u8) {}
    fn on_restart_complete(&self, chassis_id: u32, sensor_id: u8) {}
    fn on_coarse_zero_begin(&self, chassis_id: u32, sensor_id: u8) {}
    fn on_coarse_zero_complete(&self, chassis_id: u32, sensor_id: u8) {}
    fn on_fine_zero_begin(&self, chassis_id: u32, sensor_id: u8) {}
    fn on_fine_zero_complete(&self, chassis_id: u32, sensor_id: u8) {}
    fn on_sensor_ready(&self, chassis_id: u32, sensor_id: u8) {}

    fn on_sensor_error(&self, chassis_id: u32, sensor_id: u8, kind: SensorErrorKind) {}

    /// LED 颜色或闪烁状态变化
    fn on_led_changed(&self, chassis_id: u32, sensor_id: u8, color: u32, blink_state: u32) {}

    /// 在位、场强等传感器信息更新
    fn on_sensor_status_changed(&self) {}

    // ==================== 数据 ====================

    /// 一组同步批次（默认 10 个）
    fn on_data_available(&self, batches: &[SyncedBatch]) {}

    /// 监视器周期报告：每个数据流机箱平均积压包数、最小剩余缓冲字节
    fn on_data_underrun(&self, avg_queued_packets: usize, min_free_bytes: usize) {}

    /// 机箱缓冲区已满，数据流已对该机箱关闭
    fn on_buffer_full(&self, chassis_id: u32) {}

    // ==================== 命令应答 ====================

    fn on_raw_response(&self, chassis_id: u32, register: RawRegister) {}

    fn on_password_response(&self, chassis_name: &str, valid: bool) {}
}

/// 忽略全部事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCallbacks;

impl FleetCallbacks for NoopCallbacks {}
