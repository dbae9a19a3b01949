//! 传感器生命周期状态机
//!
//! ```text
//! Off → Restarting → Restarted → CoarseZeroing → CoarseZeroed → FineZeroing → FineZeroed → Ready
//!   \______________________________ 任意非终止状态 ______________________________/ → Error
//! ```
//!
//! 状态由机箱上报的 SENSOR_STATE 事件逐一驱动。乱序事件（例如在 Restarting 之前收到
//! RestartComplete）被拒绝，保证同一会话内观察到的状态单调前进。
//! 硬错误把传感器移出本会话的有效集合，重复的错误事件只移除一次；
//! 软错误只报告，不改变状态。何时推进到下一阶段由上层控制器决定。

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use fieldline_protocol::{SensorStateCode, led};
use tracing::{debug, warn};

use crate::callback::SensorErrorKind;

/// 传感器生命周期状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum SensorLifecycle {
    #[default]
    Off,
    Restarting,
    Restarted,
    CoarseZeroing,
    CoarseZeroed,
    FineZeroing,
    FineZeroed,
    Ready,
    Error,
}

impl SensorLifecycle {
    /// 由 LED 颜色与闪烁状态推断（无法识别时返回 `None`）
    pub fn from_led(color: u32, blink_state: u32) -> Option<Self> {
        use led::*;
        match (color, blink_state) {
            (COLOR_READY, BLINK_SOLID) => Some(Self::Ready),
            (COLOR_FINE_ZERO, BLINK_SOLID) => Some(Self::FineZeroed),
            (COLOR_FINE_ZERO, BLINK_ACTIVE) => Some(Self::FineZeroing),
            (COLOR_COARSE_ZERO, BLINK_SOLID) => Some(Self::CoarseZeroed),
            (COLOR_COARSE_ZERO, BLINK_ACTIVE) => Some(Self::CoarseZeroing),
            (_, BLINK_ACTIVE) => Some(Self::Restarting),
            (COLOR_RESTARTED, BLINK_SOLID) => Some(Self::Restarted),
            (_, BLINK_ERROR) => Some(Self::Error),
            _ => None,
        }
    }

    /// 细调零完成（LED 为细调零颜色且常亮）
    pub fn is_zeroed_led(color: u32, blink_state: u32) -> bool {
        color == led::COLOR_FINE_ZERO && blink_state == led::BLINK_SOLID
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Error
    }

    /// 应用一个状态事件，返回新状态；事件与当前状态不匹配时返回 `None`
    fn next(self, code: SensorStateCode) -> Option<Self> {
        use SensorLifecycle::*;
        if self.is_terminal() {
            // 错误后只允许重新开始
            return (code == SensorStateCode::Restart).then_some(Restarting);
        }
        match code {
            SensorStateCode::Restart => Some(Restarting),
            SensorStateCode::RestartComplete => (self == Restarting).then_some(Restarted),
            SensorStateCode::CoarseZero => {
                matches!(self, Restarted | CoarseZeroed | FineZeroed | Ready).then_some(CoarseZeroing)
            },
            SensorStateCode::CoarseZeroComplete => (self == CoarseZeroing).then_some(CoarseZeroed),
            SensorStateCode::FineZero => {
                matches!(self, CoarseZeroed | FineZeroed | Ready).then_some(FineZeroing)
            },
            SensorStateCode::FineZeroComplete => (self == FineZeroing).then_some(FineZeroed),
            SensorStateCode::Ready => matches!(self, FineZeroing | FineZeroed).then_some(Ready),
            SensorStateCode::Error => Some(Error),
            SensorStateCode::SoftError => Some(self),
        }
    }
}

impl fmt::Display for SensorLifecycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SensorLifecycle::Off => "OFF",
            SensorLifecycle::Restarting => "RESTARTING",
            SensorLifecycle::Restarted => "RESTARTED",
            SensorLifecycle::CoarseZeroing => "COARSE_ZEROING",
            SensorLifecycle::CoarseZeroed => "COARSE_ZEROED",
            SensorLifecycle::FineZeroing => "FINE_ZEROING",
            SensorLifecycle::FineZeroed => "FINE_ZEROED",
            SensorLifecycle::Ready => "READY",
            SensorLifecycle::Error => "ERROR",
        };
        f.write_str(name)
    }
}

/// 需要向上层报告的生命周期事件
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    RestartBegin,
    RestartComplete,
    CoarseZeroBegin,
    CoarseZeroComplete,
    FineZeroBegin,
    FineZeroComplete,
    Ready,
    Error(SensorErrorKind),
}

impl From<SensorStateCode> for LifecycleEvent {
    fn from(code: SensorStateCode) -> Self {
        match code {
            SensorStateCode::Restart => LifecycleEvent::RestartBegin,
            SensorStateCode::RestartComplete => LifecycleEvent::RestartComplete,
            SensorStateCode::CoarseZero => LifecycleEvent::CoarseZeroBegin,
            SensorStateCode::CoarseZeroComplete => LifecycleEvent::CoarseZeroComplete,
            SensorStateCode::FineZero => LifecycleEvent::FineZeroBegin,
            SensorStateCode::FineZeroComplete => LifecycleEvent::FineZeroComplete,
            SensorStateCode::Ready => LifecycleEvent::Ready,
            SensorStateCode::Error => LifecycleEvent::Error(SensorErrorKind::Hard),
            SensorStateCode::SoftError => LifecycleEvent::Error(SensorErrorKind::Soft),
        }
    }
}

type SensorKey = (u32, u8);

/// 一次会话内所有传感器的生命周期与有效集合
#[derive(Debug, Default)]
pub struct SensorTracker {
    states: BTreeMap<SensorKey, SensorLifecycle>,
    /// 发生过硬错误的传感器（本会话内不再有效）
    failed: BTreeSet<SensorKey>,
}

impl SensorTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// 开始新会话：所有状态回到 Off，有效集合复位
    pub fn reset(&mut self) {
        self.states.clear();
        self.failed.clear();
    }

    /// 机箱移除时丢弃其全部传感器
    pub fn remove_chassis(&mut self, chassis_id: u32) {
        self.states.retain(|(c, _), _| *c != chassis_id);
        self.failed.retain(|(c, _)| *c != chassis_id);
    }

    pub fn state(&self, chassis_id: u32, sensor_id: u8) -> SensorLifecycle {
        self.states
            .get(&(chassis_id, sensor_id))
            .copied()
            .unwrap_or_default()
    }

    /// 传感器在本会话内是否仍然有效（未发生硬错误）
    pub fn is_valid(&self, chassis_id: u32, sensor_id: u8) -> bool {
        !self.failed.contains(&(chassis_id, sensor_id))
    }

    /// 发生过硬错误的传感器
    pub fn failed_sensors(&self) -> impl Iterator<Item = (u32, u8)> + '_ {
        self.failed.iter().copied()
    }

    /// 处理一个状态事件
    ///
    /// 返回需要报告的事件；乱序或重复的硬错误返回 `None`。
    pub fn apply(
        &mut self,
        chassis_id: u32,
        sensor_id: u8,
        code: SensorStateCode,
    ) -> Option<LifecycleEvent> {
        let key = (chassis_id, sensor_id);
        let current = self.states.get(&key).copied().unwrap_or_default();

        if code == SensorStateCode::Error && current == SensorLifecycle::Error {
            debug!("Sensor {}:{} repeated error ignored", chassis_id, sensor_id);
            return None;
        }

        let Some(next) = current.next(code) else {
            warn!(
                "Sensor {}:{} ignoring out-of-order {:?} in state {}",
                chassis_id, sensor_id, code, current
            );
            return None;
        };

        if next != current {
            debug!("Sensor {}:{} {} -> {}", chassis_id, sensor_id, current, next);
        }
        self.states.insert(key, next);

        if code == SensorStateCode::Error && self.failed.insert(key) {
            warn!(
                "Sensor {}:{} removed from the valid set after a hard error",
                chassis_id, sensor_id
            );
        }
        Some(code.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use SensorStateCode::*;

    #[test]
    fn test_full_lifecycle() {
        let mut tracker = SensorTracker::new();
        let sequence = [
            (Restart, SensorLifecycle::Restarting),
            (RestartComplete, SensorLifecycle::Restarted),
            (CoarseZero, SensorLifecycle::CoarseZeroing),
            (CoarseZeroComplete, SensorLifecycle::CoarseZeroed),
            (FineZero, SensorLifecycle::FineZeroing),
            (FineZeroComplete, SensorLifecycle::FineZeroed),
            (SensorStateCode::Ready, SensorLifecycle::Ready),
        ];
        for (code, expected) in sequence {
            assert!(tracker.apply(0, 3, code).is_some());
            assert_eq!(tracker.state(0, 3), expected);
        }
    }

    #[test]
    fn test_completion_before_begin_is_rejected() {
        let mut tracker = SensorTracker::new();
        assert_eq!(tracker.apply(1, 2, RestartComplete), None);
        assert_eq!(tracker.state(1, 2), SensorLifecycle::Off);

        tracker.apply(1, 2, Restart);
        assert_eq!(tracker.apply(1, 2, FineZero), None);
        assert_eq!(tracker.state(1, 2), SensorLifecycle::Restarting);
    }

    #[test]
    fn test_hard_error_removes_from_valid_set_once() {
        let mut tracker = SensorTracker::new();
        tracker.apply(0, 5, Restart);
        assert!(tracker.is_valid(0, 5));

        assert_eq!(
            tracker.apply(0, 5, SensorStateCode::Error),
            Some(LifecycleEvent::Error(SensorErrorKind::Hard))
        );
        assert!(!tracker.is_valid(0, 5));
        assert_eq!(tracker.apply(0, 5, SensorStateCode::Error), None);
        assert_eq!(tracker.failed_sensors().count(), 1);
    }

    #[test]
    fn test_error_reachable_from_any_state() {
        for steps in 0..=7 {
            let mut tracker = SensorTracker::new();
            let codes = [
                Restart,
                RestartComplete,
                CoarseZero,
                CoarseZeroComplete,
                FineZero,
                FineZeroComplete,
                SensorStateCode::Ready,
            ];
            for code in codes.iter().take(steps) {
                tracker.apply(2, 1, *code);
            }
            assert!(tracker.apply(2, 1, SensorStateCode::Error).is_some());
            assert_eq!(tracker.state(2, 1), SensorLifecycle::Error);
        }
    }

    #[test]
    fn test_soft_error_keeps_state_and_validity() {
        let mut tracker = SensorTracker::new();
        tracker.apply(0, 1, Restart);
        tracker.apply(0, 1, RestartComplete);
        assert_eq!(
            tracker.apply(0, 1, SoftError),
            Some(LifecycleEvent::Error(SensorErrorKind::Soft))
        );
        assert_eq!(tracker.state(0, 1), SensorLifecycle::Restarted);
        assert!(tracker.is_valid(0, 1));
    }

    #[test]
    fn test_restart_after_error_keeps_sensor_invalid() {
        let mut tracker = SensorTracker::new();
        tracker.apply(0, 4, SensorStateCode::Error);
        assert_eq!(tracker.apply(0, 4, CoarseZero), None);
        assert_eq!(
            tracker.apply(0, 4, Restart),
            Some(LifecycleEvent::RestartBegin)
        );
        assert!(!tracker.is_valid(0, 4));

        tracker.reset();
        assert!(tracker.is_valid(0, 4));
    }

    #[test]
    fn test_from_led() {
        use led::*;
        assert_eq!(
            SensorLifecycle::from_led(COLOR_READY, BLINK_SOLID),
            Some(SensorLifecycle::Ready)
        );
        assert_eq!(
            SensorLifecycle::from_led(COLOR_FINE_ZERO, BLINK_ACTIVE),
            Some(SensorLifecycle::FineZeroing)
        );
        assert_eq!(
            SensorLifecycle::from_led(COLOR_COARSE_ZERO, BLINK_SOLID),
            Some(SensorLifecycle::CoarseZeroed)
        );
        assert_eq!(
            SensorLifecycle::from_led(1, BLINK_ACTIVE),
            Some(SensorLifecycle::Restarting)
        );
        assert_eq!(
            SensorLifecycle::from_led(COLOR_RESTARTED, BLINK_SOLID),
            Some(SensorLifecycle::Restarted)
        );
        assert_eq!(
            SensorLifecycle::from_led(2, BLINK_ERROR),
            Some(SensorLifecycle::Error)
        );
        assert_eq!(SensorLifecycle::from_led(0, 0), None);
        assert!(SensorLifecycle::is_zeroed_led(COLOR_FINE_ZERO, BLINK_SOLID));
    }
}
