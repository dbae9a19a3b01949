//! 多机箱帧同步
//!
//! 每个机箱独立产生带 tick 的数据帧。同步器为每个机箱保留最多一个待合并帧，
//! 在所有数据流机箱都有帧时产生一轮 [`SyncRound`]。
//!
//! ```text
//!            ≥2 个源                ticks 全部相等
//! Unsynced ──────────→ Aligning ─────────────────→ Synced
//!    ↑ (≤1 个源)                                     │ tick 1 / 新机箱加入
//!    └──────────────── Resyncing(机箱集合) ←──────────┘
//!                          │ 集合内机箱 tick 与其余机箱一致
//!                          └──────────────────────→ Synced
//! ```
//!
//! - `Unsynced`：至多一个源，每帧立即输出。
//! - `Aligning`：丢弃 tick 最小的帧，直到所有源 tick 相同，建立共同起点。
//! - `Synced`：每个源都有帧即输出，不再比较 tick。
//! - `Resyncing`：集合内的机箱重新对齐，其余机箱照常输出。
//!   集合内落后于参考 tick 的帧被丢弃，超前的帧（以及 tick 1 标记帧）保留等待。

use std::collections::{BTreeMap, BTreeSet};

use fieldline_protocol::{DataPacket, STREAM_RESTART_TICK};
use tracing::{debug, info, trace, warn};

use crate::hardware_state::{ActiveChannels, channel_key};

/// 一个通道在某一轮中的采样
#[derive(Debug, Clone, PartialEq)]
pub struct SampleRecord {
    /// 原始整数值（未乘标定系数）
    pub value: i32,
    pub calibration: f64,
    pub chassis_id: u32,
    pub sensor_id: u8,
    /// `"cc:ss"` 形式的传感器名
    pub sensor_name: String,
    pub data_type: i32,
    /// 该机箱本帧的设备 tick
    pub timestamp: u32,
    /// 通道在激活通道表中的序号
    pub index: usize,
}

/// 一轮同步结果：通道键（`"cc:ss:datatype"`）→ 采样
pub type SyncedBatch = BTreeMap<String, SampleRecord>;

/// 同步状态
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Unsynced,
    Aligning,
    Synced,
    Resyncing(BTreeSet<u32>),
}

/// 同步统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStats {
    pub rounds: u64,
    /// 对齐过程中丢弃的帧
    pub frames_discarded: u64,
    pub resyncs: u64,
    pub tick_regressions: u64,
}

/// 一轮输出：每个参与机箱各一帧
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncRound {
    pub frames: BTreeMap<u32, DataPacket>,
}

impl SyncRound {
    /// 参与本轮的机箱
    pub fn chassis(&self) -> impl Iterator<Item = u32> + '_ {
        self.frames.keys().copied()
    }

    /// 本轮 tick（取第一个机箱的帧）
    pub fn tick(&self) -> Option<u32> {
        self.frames.values().next().map(|p| p.timestamp)
    }

    pub fn tick_of(&self, chassis_id: u32) -> Option<u32> {
        self.frames.get(&chassis_id).map(|p| p.timestamp)
    }

    /// 按激活通道表合并为一个批次
    ///
    /// 不在通道表中的采样被忽略；值保持原始整数，标定由消费者应用。
    pub fn assemble(&self, channels: &ActiveChannels) -> SyncedBatch {
        let mut batch = SyncedBatch::new();
        for (&chassis_id, packet) in &self.frames {
            for sample in &packet.samples {
                let Ok(sensor_id) = u8::try_from(sample.sensor) else {
                    trace!("Chassis {} sample with sensor {} skipped", chassis_id, sample.sensor);
                    continue;
                };
                let key = channel_key(chassis_id, sensor_id, sample.datatype);
                let Some(channel) = channels.get(&key) else {
                    continue;
                };
                batch.insert(
                    key,
                    SampleRecord {
                        value: sample.value,
                        calibration: channel.calibration,
                        chassis_id,
                        sensor_id,
                        sensor_name: channel.sensor_name.clone(),
                        data_type: sample.datatype,
                        timestamp: packet.timestamp,
                        index: channel.index,
                    },
                );
            }
        }
        batch
    }
}

/// 帧同步器（纯逻辑，不做 I/O）
#[derive(Debug, Default)]
pub struct FrameSynchronizer {
    slots: BTreeMap<u32, Option<DataPacket>>,
    last_tick: BTreeMap<u32, u32>,
    state: SyncState,
    stats: SyncStats,
}

impl FrameSynchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    pub fn stats(&self) -> SyncStats {
        self.stats
    }

    pub fn sources(&self) -> impl Iterator<Item = u32> + '_ {
        self.slots.keys().copied()
    }

    pub fn source_count(&self) -> usize {
        self.slots.len()
    }

    pub fn contains(&self, chassis_id: u32) -> bool {
        self.slots.contains_key(&chassis_id)
    }

    /// 该源的待合并槽位是否为空
    pub fn needs_frame(&self, chassis_id: u32) -> bool {
        matches!(self.slots.get(&chassis_id), Some(None))
    }

    /// 丢弃全部源与统计，回到初始状态
    pub fn reset(&mut self) {
        self.slots.clear();
        self.last_tick.clear();
        self.state = SyncState::Unsynced;
        self.stats = SyncStats::default();
    }

    /// 加入一个数据流机箱（新机箱总是先经过对齐）
    pub fn add_source(&mut self, chassis_id: u32) {
        if self.slots.contains_key(&chassis_id) {
            return;
        }
        self.slots.insert(chassis_id, None);
        debug!("Synchronizer: chassis {} joined", chassis_id);

        match &mut self.state {
            SyncState::Unsynced => {
                if self.slots.len() >= 2 {
                    self.state = SyncState::Aligning;
                }
            },
            SyncState::Aligning => {},
            SyncState::Synced => {
                self.stats.resyncs += 1;
                self.state = SyncState::Resyncing(BTreeSet::from([chassis_id]));
            },
            SyncState::Resyncing(set) => {
                set.insert(chassis_id);
            },
        }
    }

    /// 移除一个机箱（连同其待合并帧）
    pub fn remove_source(&mut self, chassis_id: u32) {
        if self.slots.remove(&chassis_id).is_none() {
            return;
        }
        self.last_tick.remove(&chassis_id);
        debug!("Synchronizer: chassis {} left", chassis_id);

        if let SyncState::Resyncing(set) = &mut self.state {
            set.remove(&chassis_id);
            if set.is_empty() {
                self.state = SyncState::Synced;
            }
        }
        if (self.slots.len() <= 1 && self.state != SyncState::Synced) || self.slots.is_empty() {
            self.state = SyncState::Unsynced;
        }
    }

    /// 提交一帧
    ///
    /// 槽位已满、源未知或 tick 回退时返回 `false`（帧被丢弃）。
    pub fn offer(&mut self, chassis_id: u32, packet: DataPacket) -> bool {
        match self.slots.get(&chassis_id) {
            None => {
                trace!("Synchronizer: frame from unknown chassis {}", chassis_id);
                return false;
            },
            Some(Some(_)) => {
                trace!("Synchronizer: chassis {} slot already filled", chassis_id);
                return false;
            },
            Some(None) => {},
        }

        let tick = packet.timestamp;
        if tick == STREAM_RESTART_TICK {
            self.on_restart_marker(chassis_id);
        } else if let Some(&last) = self.last_tick.get(&chassis_id)
            && tick <= last
        {
            warn!(
                "Chassis {} tick regressed from {} to {}, frame dropped",
                chassis_id, last, tick
            );
            self.stats.tick_regressions += 1;
            return false;
        }

        self.last_tick.insert(chassis_id, tick);
        self.slots.insert(chassis_id, Some(packet));
        true
    }

    fn on_restart_marker(&mut self, chassis_id: u32) {
        match &mut self.state {
            SyncState::Synced if self.slots.len() >= 2 => {
                info!("Chassis {} restarted its stream, resyncing", chassis_id);
                self.stats.resyncs += 1;
                self.state = SyncState::Resyncing(BTreeSet::from([chassis_id]));
            },
            SyncState::Resyncing(set) => {
                if set.insert(chassis_id) {
                    info!("Chassis {} restarted its stream, resyncing", chassis_id);
                } else {
                    debug!("Chassis {} sync detected while already resyncing", chassis_id);
                }
            },
            _ => {},
        }
    }

    /// 尝试产生一轮
    pub fn poll(&mut self) -> Option<SyncRound> {
        if self.slots.is_empty() {
            return None;
        }

        match self.state.clone() {
            SyncState::Unsynced => {
                if self.slots.len() >= 2 {
                    self.state = SyncState::Aligning;
                    return self.poll_aligning();
                }
                self.take_round(|_| true)
            },
            SyncState::Aligning => self.poll_aligning(),
            SyncState::Synced => self.take_round(|_| true),
            SyncState::Resyncing(set) => {
                if self.slots.keys().all(|id| set.contains(id)) {
                    self.poll_aligning()
                } else {
                    self.poll_resyncing(set)
                }
            },
        }
    }

    fn all_filled(&self) -> bool {
        self.slots.values().all(Option::is_some)
    }

    fn tick(&self, chassis_id: u32) -> Option<u32> {
        self.slots
            .get(&chassis_id)
            .and_then(|slot| slot.as_ref())
            .map(|p| p.timestamp)
    }

    fn discard(&mut self, chassis_id: u32) {
        if let Some(slot) = self.slots.get_mut(&chassis_id)
            && let Some(packet) = slot.take()
        {
            debug!(
                "Discarding frame with tick {} from chassis {} while aligning",
                packet.timestamp, chassis_id
            );
            self.stats.frames_discarded += 1;
        }
    }

    fn poll_aligning(&mut self) -> Option<SyncRound> {
        if !self.all_filled() {
            return None;
        }
        let ticks: Vec<(u32, u32)> = self
            .slots
            .iter()
            .filter_map(|(&id, slot)| slot.as_ref().map(|p| (id, p.timestamp)))
            .collect();
        let min = ticks.iter().map(|&(_, t)| t).min()?;
        let max = ticks.iter().map(|&(_, t)| t).max()?;

        if min == max {
            info!("Frames aligned at tick {} across {} chassis", min, ticks.len());
            self.state = SyncState::Synced;
            return self.take_round(|_| true);
        }

        for (id, tick) in ticks {
            if tick == min {
                self.discard(id);
            }
        }
        None
    }

    fn poll_resyncing(&mut self, mut set: BTreeSet<u32>) -> Option<SyncRound> {
        let steady: Vec<u32> = self.slots.keys().copied().filter(|id| !set.contains(id)).collect();
        if steady.iter().any(|&id| self.tick(id).is_none()) {
            return None;
        }
        let reference = steady.iter().filter_map(|&id| self.tick(id)).max()?;

        let mut joined = Vec::new();
        for &id in &set {
            match self.tick(id) {
                Some(t) if t == reference => joined.push(id),
                Some(t) if t < reference && t != STREAM_RESTART_TICK => self.discard(id),
                _ => {},
            }
        }
        for id in &joined {
            set.remove(id);
            info!("Chassis {} realigned at tick {}", id, reference);
        }

        self.state = if set.is_empty() {
            SyncState::Synced
        } else {
            SyncState::Resyncing(set.clone())
        };
        self.take_round(|id| !set.contains(&id))
    }

    fn take_round(&mut self, include: impl Fn(u32) -> bool) -> Option<SyncRound> {
        let ready = self
            .slots
            .iter()
            .filter(|(id, _)| include(**id))
            .all(|(_, slot)| slot.is_some());
        if !ready {
            return None;
        }

        let mut round = SyncRound::default();
        for (&id, slot) in self.slots.iter_mut() {
            if include(id)
                && let Some(packet) = slot.take()
            {
                round.frames.insert(id, packet);
            }
        }
        if round.frames.is_empty() {
            return None;
        }
        self.stats.rounds += 1;
        Some(round)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware_state::ChannelInfo;
    use fieldline_protocol::Sample;

    fn frame(tick: u32) -> DataPacket {
        DataPacket::new(tick, vec![Sample::new(1, 28, tick as i32 * 10)])
    }

    fn two_sources() -> FrameSynchronizer {
        let mut sync = FrameSynchronizer::new();
        sync.add_source(0);
        sync.add_source(1);
        sync
    }

    /// 按序号交替提交两个机箱的帧，收集全部输出
    fn drive(sync: &mut FrameSynchronizer, a: &[u32], b: &[u32]) -> Vec<SyncRound> {
        let mut a = a.iter().copied();
        let mut b = b.iter().copied();
        let mut rounds = Vec::new();
        loop {
            let mut progressed = false;
            if sync.needs_frame(0)
                && let Some(t) = a.next()
            {
                sync.offer(0, frame(t));
                progressed = true;
            }
            if sync.needs_frame(1)
                && let Some(t) = b.next()
            {
                sync.offer(1, frame(t));
                progressed = true;
            }
            if let Some(round) = sync.poll() {
                rounds.push(round);
                continue;
            }
            if !progressed {
                break;
            }
        }
        rounds
    }

    #[test]
    fn test_single_source_emits_immediately() {
        let mut sync = FrameSynchronizer::new();
        sync.add_source(3);
        assert!(sync.poll().is_none());
        assert!(sync.offer(3, frame(42)));
        let round = sync.poll().unwrap();
        assert_eq!(round.tick_of(3), Some(42));
        assert_eq!(sync.state(), &SyncState::Unsynced);
    }

    #[test]
    fn test_equal_ticks_align_on_first_frame() {
        let mut sync = two_sources();
        let rounds = drive(&mut sync, &[5, 6, 7, 8], &[5, 6, 7, 8]);
        assert_eq!(rounds.len(), 4);
        assert_eq!(rounds[0].tick_of(0), Some(5));
        assert_eq!(rounds[0].tick_of(1), Some(5));
        assert_eq!(sync.state(), &SyncState::Synced);
        assert_eq!(sync.stats().frames_discarded, 0);
    }

    #[test]
    fn test_lagging_chassis_frames_are_discarded() {
        let mut sync = two_sources();
        let rounds = drive(&mut sync, &[5, 6, 7], &[7, 8, 9]);
        assert_eq!(rounds.len(), 1);
        assert_eq!(rounds[0].tick_of(0), Some(7));
        assert_eq!(rounds[0].tick_of(1), Some(7));
        assert_eq!(sync.stats().frames_discarded, 2);
    }

    #[test]
    fn test_synced_emits_without_comparing_ticks() {
        let mut sync = two_sources();
        drive(&mut sync, &[5], &[5]);
        sync.offer(0, frame(6));
        sync.offer(1, frame(9));
        let round = sync.poll().unwrap();
        assert_eq!(round.tick_of(0), Some(6));
        assert_eq!(round.tick_of(1), Some(9));
    }

    #[test]
    fn test_restart_marker_resyncs_only_that_chassis() {
        let mut sync = two_sources();
        drive(&mut sync, &[7], &[7]);
        assert_eq!(sync.state(), &SyncState::Synced);

        // A 重新开始数据流，B 继续单独输出
        sync.offer(0, frame(1));
        assert_eq!(sync.state(), &SyncState::Resyncing(BTreeSet::from([0])));
        sync.offer(1, frame(8));
        let round = sync.poll().unwrap();
        assert_eq!(round.chassis().collect::<Vec<_>>(), vec![1]);
        assert_eq!(round.tick_of(1), Some(8));

        sync.offer(1, frame(9));
        let round = sync.poll().unwrap();
        assert_eq!(round.chassis().collect::<Vec<_>>(), vec![1]);

        // B 也重新开始，两者在 tick 1 对齐
        sync.offer(1, frame(1));
        let round = sync.poll().unwrap();
        assert_eq!(round.tick_of(0), Some(1));
        assert_eq!(round.tick_of(1), Some(1));
        assert_eq!(sync.state(), &SyncState::Synced);

        sync.offer(0, frame(2));
        sync.offer(1, frame(2));
        assert_eq!(sync.poll().unwrap().frames.len(), 2);
    }

    #[test]
    fn test_resyncing_chassis_rejoins_when_ticks_match() {
        let mut sync = two_sources();
        drive(&mut sync, &[7], &[7]);

        // 新加入的机箱超前，帧保留到其余机箱追上
        sync.add_source(2);
        sync.offer(2, frame(12));
        sync.offer(0, frame(8));
        sync.offer(1, frame(8));
        let round = sync.poll().unwrap();
        assert_eq!(round.chassis().collect::<Vec<_>>(), vec![0, 1]);
        assert!(!sync.needs_frame(2));

        for t in 9..=12 {
            sync.offer(0, frame(t));
            sync.offer(1, frame(t));
            let round = sync.poll().unwrap();
            if t == 12 {
                assert_eq!(round.frames.len(), 3);
            } else {
                assert_eq!(round.frames.len(), 2);
            }
        }
        assert_eq!(sync.state(), &SyncState::Synced);
    }

    #[test]
    fn test_resyncing_chassis_behind_is_drained() {
        let mut sync = two_sources();
        drive(&mut sync, &[7], &[7]);
        sync.add_source(2);
        sync.offer(2, frame(3));
        sync.offer(0, frame(8));
        sync.offer(1, frame(8));
        sync.poll().unwrap();
        assert!(sync.needs_frame(2));
        assert_eq!(sync.stats().frames_discarded, 1);
    }

    #[test]
    fn test_newly_joined_chassis_is_aligned_from_unsynced() {
        let mut sync = FrameSynchronizer::new();
        sync.add_source(0);
        sync.offer(0, frame(3));
        sync.poll().unwrap();

        sync.add_source(1);
        assert_eq!(sync.state(), &SyncState::Aligning);
        let rounds = drive(&mut sync, &[4, 5, 6], &[6, 7]);
        assert_eq!(rounds[0].tick_of(0), Some(6));
        assert_eq!(rounds[0].tick_of(1), Some(6));
    }

    #[test]
    fn test_tick_regression_drops_frame() {
        let mut sync = FrameSynchronizer::new();
        sync.add_source(0);
        sync.offer(0, frame(10));
        sync.poll().unwrap();
        assert!(!sync.offer(0, frame(9)));
        assert_eq!(sync.stats().tick_regressions, 1);
        assert!(sync.needs_frame(0));
        // 重新开始标记不算回退
        assert!(sync.offer(0, frame(1)));
    }

    #[test]
    fn test_remove_source_unblocks_rounds() {
        let mut sync = two_sources();
        drive(&mut sync, &[5], &[5]);
        sync.offer(0, frame(6));
        assert!(sync.poll().is_none());
        sync.remove_source(1);
        assert_eq!(sync.poll().unwrap().tick_of(0), Some(6));

        sync.remove_source(0);
        assert_eq!(sync.state(), &SyncState::Unsynced);
        assert!(sync.poll().is_none());
    }

    #[test]
    fn test_remove_last_resyncing_source_returns_to_synced() {
        let mut sync = FrameSynchronizer::new();
        for id in 0..3 {
            sync.add_source(id);
        }
        for id in 0..3 {
            sync.offer(id, frame(5));
        }
        sync.poll().unwrap();
        sync.offer(2, frame(1));
        sync.remove_source(2);
        assert_eq!(sync.state(), &SyncState::Synced);
    }

    #[test]
    fn test_assemble_uses_active_channels_only() {
        let mut channels = ActiveChannels::new();
        channels.insert(
            channel_key(0, 1, 28),
            ChannelInfo {
                chassis_id: 0,
                sensor_id: 1,
                datatype: 28,
                freq: 1000,
                calibration: 2.5e-15,
                sensor_name: "00:01".into(),
                index: 0,
            },
        );

        let mut round = SyncRound::default();
        round.frames.insert(
            0,
            DataPacket::new(77, vec![Sample::new(1, 28, -12), Sample::new(2, 28, 4)]),
        );
        let batch = round.assemble(&channels);
        assert_eq!(batch.len(), 1);
        let record = &batch["00:01:28"];
        assert_eq!(record.value, -12);
        assert_eq!(record.timestamp, 77);
        assert_eq!(record.sensor_name, "00:01");
        assert_eq!(record.calibration, 2.5e-15);
    }
}
