//! 机箱/传感器/通道状态
//!
//! - 每个机箱预分配 17 个传感器槽位（0 号为机箱自身 ADC）
//! - 通道按 (机箱, 传感器, 数据类型) 标识；频率为 0 的通道不出现在激活通道表中，但保留标定系数
//! - 激活通道表通过 [`ArcSwap`] 发布，帧同步线程无锁读取
//!
//! 状态记录由各机箱的会话分发线程写入，写操作由内部读写锁串行化。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use fieldline_protocol::{
    ADC_CALIBRATION, CHASSIS_SENSOR_ID, DATATYPE_ANALOG_IN, SENSOR_SLOTS, SensorConfigEntry,
    SensorField, SensorLed, SensorPresence,
};
use parking_lot::RwLock;
use tracing::{debug, trace};

use crate::sensor_state::SensorLifecycle;

/// 传感器空间位置：位置 (x, y, z) + 三个参考线圈基向量
pub type SensorLocation = [f64; 12];

/// (机箱, 传感器) → 位置
pub type LocationTable = BTreeMap<(u32, u8), SensorLocation>;

/// 激活通道表：通道键 → 通道信息
pub type ActiveChannels = BTreeMap<String, ChannelInfo>;

/// 通道键 `"cc:ss:datatype"`
pub fn channel_key(chassis_id: u32, sensor_id: u8, datatype: i32) -> String {
    format!("{:02}:{:02}:{}", chassis_id, sensor_id, datatype)
}

/// 传感器名 `"cc:ss"`
pub fn sensor_name(chassis_id: u32, sensor_id: u8) -> String {
    format!("{:02}:{:02}", chassis_id, sensor_id)
}

/// 没有标定表时的几何默认位置
///
/// 传感器 1..16 在每个机箱内按 4×4 网格排列，机箱沿 z 轴叠放；0 号（ADC）在原点。
pub fn default_location(chassis_id: u32, sensor_id: u8) -> SensorLocation {
    let mut location = [0.0; 12];
    if sensor_id == CHASSIS_SENSOR_ID || usize::from(sensor_id) >= SENSOR_SLOTS {
        return location;
    }
    let s = f64::from(sensor_id);
    location[0] = 2.0 * ((s - 1.0) % 4.0) - 3.0;
    location[1] = 2.0 * ((16.0 - s) / 4.0).floor() - 3.0;
    location[2] = 4.0 - 2.0 * f64::from(chassis_id);
    location
}

/// 新通道的默认标定系数
fn default_calibration(sensor_id: u8, datatype: i32) -> f64 {
    if sensor_id == CHASSIS_SENSOR_ID && datatype == DATATYPE_ANALOG_IN {
        ADC_CALIBRATION
    } else {
        1.0
    }
}

/// 激活通道
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    pub chassis_id: u32,
    pub sensor_id: u8,
    pub datatype: i32,
    pub freq: u32,
    pub calibration: f64,
    pub sensor_name: String,
    /// 在激活通道表中的序号
    pub index: usize,
}

/// 传感器上的一个通道（频率为 0 表示关闭）
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChannelSetting {
    pub freq: u32,
    pub calibration: f64,
}

/// 通道配置结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelChange {
    Added,
    Removed,
    Updated,
    Unchanged,
}

/// 单个传感器
#[derive(Debug, Clone, PartialEq)]
pub struct SensorInfo {
    pub chassis_id: u32,
    pub sensor_id: u8,
    pub name: String,
    pub present: bool,
    pub card_serial: Option<u32>,
    pub sensor_serial: Option<u32>,
    pub led_color: u32,
    pub led_blink: u32,
    /// 三轴场强
    pub fields: Option<[f64; 3]>,
    pub location: SensorLocation,
    pub last_data: Option<Instant>,
    /// 数据类型 → 通道设置
    pub channels: BTreeMap<i32, ChannelSetting>,
}

impl SensorInfo {
    fn new(chassis_id: u32, sensor_id: u8, location: SensorLocation) -> Self {
        Self {
            chassis_id,
            sensor_id,
            name: sensor_name(chassis_id, sensor_id),
            present: false,
            card_serial: None,
            sensor_serial: None,
            led_color: 0,
            led_blink: 0,
            fields: None,
            location,
            last_data: None,
            channels: BTreeMap::new(),
        }
    }

    /// 由 LED 推断的生命周期状态
    pub fn led_state(&self) -> Option<SensorLifecycle> {
        SensorLifecycle::from_led(self.led_color, self.led_blink)
    }

    pub fn is_zeroed(&self) -> bool {
        SensorLifecycle::is_zeroed_led(self.led_color, self.led_blink)
    }

    pub fn active_datatypes(&self) -> impl Iterator<Item = i32> + '_ {
        self.channels
            .iter()
            .filter(|(_, c)| c.freq > 0)
            .map(|(&datatype, _)| datatype)
    }
}

#[derive(Debug)]
struct ChassisSensors {
    name: String,
    sensors: Vec<SensorInfo>,
}

/// 机群硬件状态
pub struct HardwareState {
    chassis: RwLock<BTreeMap<u32, ChassisSensors>>,
    locations: RwLock<LocationTable>,
    active: ArcSwap<ActiveChannels>,
}

impl Default for HardwareState {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for HardwareState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HardwareState")
            .field("chassis", &self.chassis.read().keys().collect::<Vec<_>>())
            .field("active_channels", &self.active.load().len())
            .finish()
    }
}

impl HardwareState {
    pub fn new() -> Self {
        Self {
            chassis: RwLock::new(BTreeMap::new()),
            locations: RwLock::new(LocationTable::new()),
            active: ArcSwap::from_pointee(ActiveChannels::new()),
        }
    }

    /// 设置标定位置表（之后加入的机箱使用表中的位置）
    pub fn set_location_table(&self, table: LocationTable) {
        *self.locations.write() = table;
    }

    fn location_for(&self, chassis_id: u32, sensor_id: u8) -> SensorLocation {
        self.locations
            .read()
            .get(&(chassis_id, sensor_id))
            .copied()
            .unwrap_or_else(|| default_location(chassis_id, sensor_id))
    }

    // ==================== 机箱 ====================

    /// 加入机箱并预分配全部传感器槽位（已存在时只更新名称）
    pub fn add_chassis(&self, chassis_id: u32, name: &str) {
        let mut chassis = self.chassis.write();
        if let Some(existing) = chassis.get_mut(&chassis_id) {
            existing.name = name.to_string();
            return;
        }
        let sensors = (0..SENSOR_SLOTS as u8)
            .map(|s| SensorInfo::new(chassis_id, s, self.location_for(chassis_id, s)))
            .collect();
        chassis.insert(
            chassis_id,
            ChassisSensors {
                name: name.to_string(),
                sensors,
            },
        );
        debug!("Hardware state: added chassis {} ({})", chassis_id, name);
    }

    pub fn remove_chassis(&self, chassis_id: u32) {
        if self.chassis.write().remove(&chassis_id).is_some() {
            self.publish_active();
        }
    }

    pub fn clear(&self) {
        self.chassis.write().clear();
        self.publish_active();
    }

    pub fn has_chassis(&self, chassis_id: u32) -> bool {
        self.chassis.read().contains_key(&chassis_id)
    }

    pub fn chassis_ids(&self) -> Vec<u32> {
        self.chassis.read().keys().copied().collect()
    }

    pub fn chassis_name(&self, chassis_id: u32) -> Option<String> {
        self.chassis.read().get(&chassis_id).map(|c| c.name.clone())
    }

    // ==================== 传感器 ====================

    fn with_sensor_mut<R>(
        &self,
        chassis_id: u32,
        sensor_id: u8,
        f: impl FnOnce(&mut SensorInfo) -> R,
    ) -> Option<R> {
        let mut chassis = self.chassis.write();
        let sensor = chassis
            .get_mut(&chassis_id)?
            .sensors
            .get_mut(usize::from(sensor_id))?;
        Some(f(sensor))
    }

    pub fn sensor(&self, chassis_id: u32, sensor_id: u8) -> Option<SensorInfo> {
        self.chassis
            .read()
            .get(&chassis_id)?
            .sensors
            .get(usize::from(sensor_id))
            .cloned()
    }

    pub fn sensors(&self, chassis_id: u32) -> Vec<SensorInfo> {
        self.chassis
            .read()
            .get(&chassis_id)
            .map(|c| c.sensors.clone())
            .unwrap_or_default()
    }

    /// 在位的传感器（不含 0 号 ADC）
    pub fn present_sensors(&self, chassis_id: u32) -> Vec<u8> {
        self.chassis
            .read()
            .get(&chassis_id)
            .map(|c| {
                c.sensors
                    .iter()
                    .filter(|s| s.present && s.sensor_id != CHASSIS_SENSOR_ID)
                    .map(|s| s.sensor_id)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// 更新 LED，返回是否变化
    pub fn update_led(&self, chassis_id: u32, led: &SensorLed) -> bool {
        self.with_sensor_mut(chassis_id, led.sensor_id, |s| {
            let changed = s.led_color != led.color || s.led_blink != led.blink_state;
            s.led_color = led.color;
            s.led_blink = led.blink_state;
            changed
        })
        .unwrap_or(false)
    }

    pub fn update_presence(&self, chassis_id: u32, presence: &SensorPresence) {
        self.with_sensor_mut(chassis_id, presence.sensor_id, |s| {
            s.present = presence.connected;
            s.card_serial = Some(presence.card_serial);
            s.sensor_serial = presence.sensor_serial;
        });
    }

    pub fn update_field(&self, chassis_id: u32, field: &SensorField) {
        self.with_sensor_mut(chassis_id, field.sensor_id, |s| {
            s.fields = Some([field.x, field.y, field.z]);
        });
    }

    /// 记录收到数据的时间（该机箱所有有激活通道的传感器）
    pub fn mark_data(&self, chassis_id: u32, at: Instant) {
        if let Some(chassis) = self.chassis.write().get_mut(&chassis_id) {
            for sensor in chassis
                .sensors
                .iter_mut()
                .filter(|s| s.channels.values().any(|c| c.freq > 0))
            {
                sensor.last_data = Some(at);
            }
        }
    }

    // ==================== 通道 ====================

    /// 设置单个通道
    ///
    /// `freq == 0` 关闭通道但保留标定；`calibration` 为 `None` 时沿用已有值或默认值。
    pub fn configure_channel(
        &self,
        chassis_id: u32,
        sensor_id: u8,
        datatype: i32,
        freq: u32,
        calibration: Option<f64>,
    ) -> Option<ChannelChange> {
        let change = self.with_sensor_mut(chassis_id, sensor_id, |s| {
            apply_channel(s, datatype, freq, calibration)
        })?;
        if change != ChannelChange::Unchanged {
            trace!(
                "Channel {} {:?} (freq {})",
                channel_key(chassis_id, sensor_id, datatype),
                change,
                freq
            );
            self.publish_active();
        }
        Some(change)
    }

    /// 用机箱上报的通道配置替换该机箱的通道表
    ///
    /// 表中没有的通道被关闭，新通道被加入，已有通道更新频率与标定。
    pub fn configure_channel_list(&self, chassis_id: u32, entries: &[SensorConfigEntry]) -> bool {
        let mut changed = false;
        {
            let mut chassis = self.chassis.write();
            let Some(entry) = chassis.get_mut(&chassis_id) else {
                return false;
            };
            for sensor in entry.sensors.iter_mut() {
                let listed: BTreeMap<i32, &SensorConfigEntry> = entries
                    .iter()
                    .filter(|e| e.sensor_id == sensor.sensor_id)
                    .map(|e| (e.datatype, e))
                    .collect();

                let missing: Vec<i32> = sensor
                    .active_datatypes()
                    .filter(|d| !listed.contains_key(d))
                    .collect();
                for datatype in missing {
                    changed |= apply_channel(sensor, datatype, 0, None) != ChannelChange::Unchanged;
                }
                for (datatype, e) in listed {
                    let calibration = e
                        .calibration
                        .unwrap_or_else(|| default_calibration(sensor.sensor_id, datatype));
                    changed |= apply_channel(sensor, datatype, e.freq, Some(calibration))
                        != ChannelChange::Unchanged;
                }
            }
        }
        if changed {
            self.publish_active();
        }
        changed
    }

    /// 机箱激活通道数
    pub fn channel_count(&self, chassis_id: u32) -> usize {
        self.chassis
            .read()
            .get(&chassis_id)
            .map(|c| c.sensors.iter().map(|s| s.active_datatypes().count()).sum())
            .unwrap_or(0)
    }

    pub fn active_channels(&self) -> Arc<ActiveChannels> {
        self.active.load_full()
    }

    fn publish_active(&self) {
        let chassis = self.chassis.read();
        let mut table = ActiveChannels::new();
        for (&chassis_id, entry) in chassis.iter() {
            for sensor in &entry.sensors {
                for (&datatype, setting) in sensor.channels.iter().filter(|(_, c)| c.freq > 0) {
                    table.insert(
                        channel_key(chassis_id, sensor.sensor_id, datatype),
                        ChannelInfo {
                            chassis_id,
                            sensor_id: sensor.sensor_id,
                            datatype,
                            freq: setting.freq,
                            calibration: setting.calibration,
                            sensor_name: sensor.name.clone(),
                            index: 0,
                        },
                    );
                }
            }
        }
        for (index, channel) in table.values_mut().enumerate() {
            channel.index = index;
        }
        self.active.store(Arc::new(table));
    }
}

fn apply_channel(
    sensor: &mut SensorInfo,
    datatype: i32,
    freq: u32,
    calibration: Option<f64>,
) -> ChannelChange {
    match sensor.channels.get_mut(&datatype) {
        Some(setting) => {
            let was_active = setting.freq > 0;
            let calibration = calibration.unwrap_or(setting.calibration);
            let unchanged = setting.freq == freq && setting.calibration == calibration;
            setting.freq = freq;
            setting.calibration = calibration;
            match (was_active, freq > 0) {
                _ if unchanged => ChannelChange::Unchanged,
                (false, true) => ChannelChange::Added,
                (true, false) => ChannelChange::Removed,
                (false, false) => ChannelChange::Unchanged,
                (true, true) => ChannelChange::Updated,
            }
        },
        None if freq == 0 => ChannelChange::Unchanged,
        None => {
            let calibration =
                calibration.unwrap_or_else(|| default_calibration(sensor.sensor_id, datatype));
            sensor
                .channels
                .insert(datatype, ChannelSetting { freq, calibration });
            ChannelChange::Added
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldline_protocol::led;

    fn state_with(chassis: &[u32]) -> HardwareState {
        let state = HardwareState::new();
        for &id in chassis {
            state.add_chassis(id, &format!("10.0.0.{}:7777", id));
        }
        state
    }

    #[test]
    fn test_seventeen_slots_per_chassis() {
        let state = state_with(&[0, 1]);
        assert_eq!(state.sensors(0).len(), 17);
        assert_eq!(state.sensor(1, 16).unwrap().name, "01:16");
        assert!(state.sensor(1, 17).is_none());
        assert!(state.sensor(2, 1).is_none());
    }

    #[test]
    fn test_default_location() {
        assert_eq!(default_location(0, 0), [0.0; 12]);
        let l = default_location(0, 1);
        assert_eq!(&l[..3], &[-3.0, 3.0, 4.0]);
        let l = default_location(1, 16);
        assert_eq!(&l[..3], &[3.0, -3.0, 2.0]);
        assert!(l[3..].iter().all(|v| *v == 0.0));
    }

    #[test]
    fn test_location_table_overrides_default() {
        let state = HardwareState::new();
        let mut table = LocationTable::new();
        let mut location = [0.0; 12];
        location[0] = 0.25;
        table.insert((0, 3), location);
        state.set_location_table(table);
        state.add_chassis(0, "a:1");
        assert_eq!(state.sensor(0, 3).unwrap().location[0], 0.25);
        assert_eq!(state.sensor(0, 4).unwrap().location, default_location(0, 4));
    }

    #[test]
    fn test_zero_freq_removes_channel_but_keeps_calibration() {
        let state = state_with(&[0]);
        assert_eq!(
            state.configure_channel(0, 2, 28, 1000, Some(3.0)),
            Some(ChannelChange::Added)
        );
        assert!(state.active_channels().contains_key("00:02:28"));

        assert_eq!(
            state.configure_channel(0, 2, 28, 0, None),
            Some(ChannelChange::Removed)
        );
        assert!(state.active_channels().is_empty());
        assert_eq!(state.channel_count(0), 0);

        state.configure_channel(0, 2, 28, 1000, None);
        assert_eq!(state.active_channels()["00:02:28"].calibration, 3.0);
    }

    #[test]
    fn test_adc_channel_default_calibration() {
        let state = state_with(&[0]);
        state.configure_channel(0, 0, 0, 1000, None);
        assert_eq!(state.active_channels()["00:00:0"].calibration, ADC_CALIBRATION);
    }

    #[test]
    fn test_configure_channel_list_replaces_table() {
        let state = state_with(&[0, 1]);
        state.configure_channel(0, 1, 28, 1000, None);
        state.configure_channel(0, 2, 28, 1000, None);
        state.configure_channel(1, 1, 28, 1000, None);

        let changed = state.configure_channel_list(
            0,
            &[
                SensorConfigEntry {
                    sensor_id: 2,
                    datatype: 28,
                    freq: 1000,
                    calibration: Some(0.5),
                },
                SensorConfigEntry {
                    sensor_id: 3,
                    datatype: 50,
                    freq: 1000,
                    calibration: None,
                },
            ],
        );
        assert!(changed);
        let active = state.active_channels();
        let keys: Vec<&str> = active.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["00:02:28", "00:03:50", "01:01:28"]);
        assert_eq!(active["00:02:28"].calibration, 0.5);
        assert_eq!(active["00:03:50"].calibration, 1.0);
        assert_eq!(active["01:01:28"].index, 2);

        assert!(!state.configure_channel_list(
            0,
            &[
                SensorConfigEntry {
                    sensor_id: 2,
                    datatype: 28,
                    freq: 1000,
                    calibration: Some(0.5),
                },
                SensorConfigEntry {
                    sensor_id: 3,
                    datatype: 50,
                    freq: 1000,
                    calibration: None,
                },
            ],
        ));
    }

    #[test]
    fn test_led_change_detection_and_state() {
        let state = state_with(&[0]);
        let led = SensorLed {
            sensor_id: 4,
            color: led::COLOR_FINE_ZERO,
            blink_state: led::BLINK_SOLID,
        };
        assert!(state.update_led(0, &led));
        assert!(!state.update_led(0, &led));
        let sensor = state.sensor(0, 4).unwrap();
        assert!(sensor.is_zeroed());
        assert_eq!(sensor.led_state(), Some(SensorLifecycle::FineZeroed));
    }

    #[test]
    fn test_presence_and_fields() {
        let state = state_with(&[0]);
        state.update_presence(
            0,
            &SensorPresence {
                sensor_id: 5,
                connected: true,
                card_serial: 1201,
                sensor_serial: Some(88),
            },
        );
        state.update_presence(
            0,
            &SensorPresence {
                sensor_id: 0,
                connected: true,
                card_serial: 1,
                sensor_serial: None,
            },
        );
        state.update_field(
            0,
            &SensorField {
                sensor_id: 5,
                x: 1.0,
                y: 2.0,
                z: 3.0,
            },
        );
        assert_eq!(state.present_sensors(0), vec![5]);
        let sensor = state.sensor(0, 5).unwrap();
        assert_eq!(sensor.card_serial, Some(1201));
        assert_eq!(sensor.sensor_serial, Some(88));
        assert_eq!(sensor.fields, Some([1.0, 2.0, 3.0]));
    }

    #[test]
    fn test_remove_chassis_drops_its_channels() {
        let state = state_with(&[0, 1]);
        state.configure_channel(0, 1, 28, 1000, None);
        state.configure_channel(1, 1, 28, 1000, None);
        state.remove_chassis(0);
        assert_eq!(state.active_channels().len(), 1);
        assert_eq!(state.chassis_ids(), vec![1]);
    }

    #[test]
    fn test_mark_data_only_touches_active_sensors() {
        let state = state_with(&[0]);
        state.configure_channel(0, 1, 28, 1000, None);
        state.mark_data(0, Instant::now());
        assert!(state.sensor(0, 1).unwrap().last_data.is_some());
        assert!(state.sensor(0, 2).unwrap().last_data.is_none());
    }
}
