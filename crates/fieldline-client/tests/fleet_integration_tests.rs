//! 机群端到端集成测试
//!
//! 使用 MockConnector/MockChassis 模拟多台机箱，验证连接统计、传感器事件、
//! 通道配置与多机箱同步数据流。

use std::collections::BTreeMap;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use fieldline_client::{
    ChassisIdentityMap, FleetCallbacks, FleetConfig, FleetManager, SensorErrorKind,
    SensorLifecycle, ServiceEvent, SyncedBatch, TomlIdentityStore,
};
use fieldline_driver::ConnectionConfig;
use fieldline_net::{Endpoint, MockChassis, MockConnector};
use fieldline_protocol::{
    Command, DataPacket, RawRegister, Sample, SensorPresence, SensorStateCode, SensorStateReport,
    StatusBody, SystemStatus,
};
use parking_lot::Mutex;

#[derive(Default)]
struct RecordingCallbacks {
    connections: Mutex<Vec<(usize, usize)>>,
    mismatch: Mutex<Vec<bool>>,
    device_errors: Mutex<Vec<String>>,
    sensors_available: Mutex<Vec<(u32, Vec<u8>)>>,
    lifecycle: Mutex<Vec<(u32, u8, &'static str)>>,
    batches: Mutex<Vec<SyncedBatch>>,
    bursts: Mutex<usize>,
    raw: Mutex<Vec<(u32, RawRegister)>>,
    passwords: Mutex<Vec<bool>>,
}

impl FleetCallbacks for RecordingCallbacks {
    fn on_connections_changed(&self, connected: usize, expected: usize) {
        self.connections.lock().push((connected, expected));
    }

    fn on_config_mismatch(&self, mismatch: bool) {
        self.mismatch.lock().push(mismatch);
    }

    fn on_device_error(&self, message: &str) {
        self.device_errors.lock().push(message.to_string());
    }

    fn on_sensors_available(&self, chassis_id: u32, sensors: &[u8]) {
        self.sensors_available
            .lock()
            .push((chassis_id, sensors.to_vec()));
    }

    fn on_restart_begin(&self, chassis_id: u32, sensor_id: u8) {
        self.lifecycle.lock().push((chassis_id, sensor_id, "restart"));
    }

    fn on_restart_complete(&self, chassis_id: u32, sensor_id: u8) {
        self.lifecycle
            .lock()
            .push((chassis_id, sensor_id, "restarted"));
    }

    fn on_coarse_zero_begin(&self, chassis_id: u32, sensor_id: u8) {
        self.lifecycle.lock().push((chassis_id, sensor_id, "coarse"));
    }

    fn on_sensor_error(&self, chassis_id: u32, sensor_id: u8, kind: SensorErrorKind) {
        let tag = match kind {
            SensorErrorKind::Hard => "error",
            SensorErrorKind::Soft => "soft",
        };
        self.lifecycle.lock().push((chassis_id, sensor_id, tag));
    }

    fn on_data_available(&self, batches: &[SyncedBatch]) {
        *self.bursts.lock() += 1;
        self.batches.lock().extend_from_slice(batches);
    }

    fn on_raw_response(&self, chassis_id: u32, register: RawRegister) {
        self.raw.lock().push((chassis_id, register));
    }

    fn on_password_response(&self, _chassis_name: &str, valid: bool) {
        self.passwords.lock().push(valid);
    }
}

fn fast_config() -> FleetConfig {
    FleetConfig {
        monitor_period_ms: 20,
        burst_size: 2,
        connection: ConnectionConfig {
            heartbeat_interval_ms: 50,
            max_missed_heartbeats: 4,
            read_timeout_ms: 10,
            connect_timeout_ms: 200,
            one_shot_timeout_ms: 500,
            reconnect_delay_ms: 20,
            reconnect_long_delay_ms: 100,
            queue_capacity: 64 * 1024,
            ..ConnectionConfig::default()
        },
        ..FleetConfig::default()
    }
}

fn system_status(num: u32, total: u32) -> SystemStatus {
    SystemStatus {
        num,
        total,
        version: "4.1".into(),
        master: "FLM0117".into(),
        serial: format!("FLC0{}17", num),
    }
}

fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

struct Fixture {
    chassis: Vec<MockChassis>,
    callbacks: Arc<RecordingCallbacks>,
    fleet: FleetManager,
}

/// 启动 `hosts.len()` 台模拟机箱（机群规模 `total`），按顺序分配 ID 并连接
fn start(hosts: &[&str], total: u32) -> Fixture {
    let connector = Arc::new(MockConnector::new());
    let chassis: Vec<MockChassis> = hosts
        .iter()
        .enumerate()
        .map(|(i, host)| {
            MockChassis::spawn(
                &connector,
                Endpoint::new(*host, 7777),
                system_status(i as u32 + 1, total),
            )
        })
        .collect();

    let callbacks = Arc::new(RecordingCallbacks::default());
    let fleet = FleetManager::builder()
        .config(fast_config())
        .connector(connector)
        .callbacks(callbacks.clone())
        .build()
        .unwrap();

    let map: ChassisIdentityMap = hosts
        .iter()
        .enumerate()
        .map(|(i, host)| (format!("{}:7777", host), i as u32))
        .collect();
    fleet.connect_chassis_list(map).unwrap();
    assert!(wait_until(Duration::from_secs(3), || {
        fleet.connected_count() == hosts.len()
    }));
    // 等监视线程处理完首次连接
    let n = hosts.len();
    assert!(wait_until(Duration::from_secs(2), || {
        callbacks.connections.lock().last() == Some(&(n, n))
    }));

    Fixture {
        chassis,
        callbacks,
        fleet,
    }
}

fn presence(sensor_id: u8) -> SensorPresence {
    SensorPresence {
        sensor_id,
        connected: true,
        card_serial: 1000 + u32::from(sensor_id),
        sensor_serial: Some(2000 + u32::from(sensor_id)),
    }
}

#[test]
fn test_connections_reported_to_consumer() {
    let f = start(&["fleet-count-a", "fleet-count-b"], 2);

    assert!(wait_until(Duration::from_secs(2), || {
        f.callbacks.connections.lock().last() == Some(&(2, 2))
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        f.callbacks.mismatch.lock().last() == Some(&false)
    }));
    assert!(!f.fleet.is_config_mismatch());
    assert_eq!(f.fleet.expected_count(), 2);

    let chassis = f.fleet.connected_chassis();
    assert_eq!(chassis.len(), 2);
    assert!(wait_until(Duration::from_secs(2), || {
        f.fleet
            .connected_chassis()
            .iter()
            .all(|c| c.version.as_deref() == Some("4.1"))
    }));
    assert!(f.fleet.all_versions_equal());
}

#[test]
fn test_fleet_size_mismatch() {
    // 机箱认为机群有 3 台，实际只配置了 2 台
    let f = start(&["fleet-mismatch-a", "fleet-mismatch-b"], 3);

    assert!(wait_until(Duration::from_secs(2), || {
        f.callbacks.mismatch.lock().contains(&true)
    }));
    assert!(f.fleet.is_config_mismatch());
}

#[test]
fn test_legacy_chassis_counts_toward_fleet_size() {
    let connector = Arc::new(MockConnector::new());
    let _chassis = MockChassis::spawn(
        &connector,
        Endpoint::new("fleet-legacy", 7777),
        system_status(1, 1),
    );
    let callbacks = Arc::new(RecordingCallbacks::default());
    let fleet = FleetManager::builder()
        .config(fast_config())
        .connector(connector)
        .callbacks(callbacks.clone())
        .build()
        .unwrap();

    // 旧固件：服务属性里没有 master
    let properties: BTreeMap<String, String> = [("num", "1"), ("total", "1")]
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    fleet
        .handle_service_event(ServiceEvent::Added {
            name: "Fieldline-legacy".into(),
            address: "fleet-legacy".into(),
            port: 7777,
            properties,
        })
        .unwrap();
    let discovered = fleet.discovered_chassis();
    assert_eq!(discovered.len(), 1);
    assert!(discovered[0].info.legacy);
    assert_eq!(discovered[0].total(), Some(1));

    let mut map = ChassisIdentityMap::new();
    map.insert("fleet-legacy:7777".into(), 0);
    fleet.connect_chassis_list(map).unwrap();

    assert!(wait_until(Duration::from_secs(3), || fleet.connected_count() == 1));
    assert!(wait_until(Duration::from_secs(2), || {
        !callbacks.mismatch.lock().is_empty()
    }));
    assert!(!fleet.is_config_mismatch());
    assert!(!callbacks.mismatch.lock().contains(&true));
    fleet.shutdown();
}

#[test]
fn test_sensors_available_once_per_connection() {
    let f = start(&["fleet-sensors"], 1);

    let list = vec![presence(1), presence(2)];
    assert!(f.chassis[0].send_status(StatusBody::SensorStatus(list.clone())));
    assert!(wait_until(Duration::from_secs(2), || {
        !f.callbacks.sensors_available.lock().is_empty()
    }));

    assert!(f.chassis[0].send_status(StatusBody::SensorStatus(list)));
    thread::sleep(Duration::from_millis(100));

    let reports = f.callbacks.sensors_available.lock().clone();
    assert_eq!(reports, vec![(0, vec![1, 2])]);
    let (card, sensor) = f.fleet.sensor_serials(0, 2).unwrap();
    assert_eq!((card, sensor), (Some(1002), Some(2002)));
}

#[test]
fn test_sensor_lifecycle_events() {
    let f = start(&["fleet-lifecycle"], 1);

    let report = |state| SensorStateReport {
        sensor_id: 3,
        state,
    };
    f.chassis[0].send_status(StatusBody::SensorState(vec![
        report(SensorStateCode::Restart),
        report(SensorStateCode::RestartComplete),
        // 乱序：尚未开始粗调零
        report(SensorStateCode::FineZeroComplete),
        report(SensorStateCode::CoarseZero),
        report(SensorStateCode::Error),
        report(SensorStateCode::Error),
    ]));

    assert!(wait_until(Duration::from_secs(2), || {
        f.callbacks.lifecycle.lock().len() >= 4
    }));
    thread::sleep(Duration::from_millis(50));
    assert_eq!(
        f.callbacks.lifecycle.lock().clone(),
        vec![
            (0, 3, "restart"),
            (0, 3, "restarted"),
            (0, 3, "coarse"),
            (0, 3, "error"),
        ]
    );
    assert_eq!(f.fleet.sensor_lifecycle(0, 3), SensorLifecycle::Error);
    assert!(!f.fleet.is_sensor_valid(0, 3));

    f.fleet.reset_sensor_states();
    assert!(f.fleet.is_sensor_valid(0, 3));
}

#[test]
fn test_configure_sensor_sends_config_list() {
    let f = start(&["fleet-config"], 1);

    f.fleet.configure_sensor(0, 1, 28, 1000).unwrap();
    let command = f.chassis[0].wait_for_command(Duration::from_secs(2), |c| {
        matches!(c, Command::ConfigList(_))
    });
    let Some(Command::ConfigList(list)) = command else {
        panic!("no config list received");
    };
    assert_eq!(list.len(), 1);
    assert_eq!((list[0].sensor_id, list[0].datatype, list[0].freq), (1, 28, 1000));

    assert!(wait_until(Duration::from_secs(2), || {
        f.fleet.hardware().active_channels().contains_key("00:01:28")
    }));

    // 非开发者模式下不允许的数据类型
    assert!(f.fleet.configure_sensor(0, 1, 35, 1000).is_err());
    assert!(f.fleet.configure_sensor(0, 0, 28, 1000).is_err());

    let table = f.fleet.sensor_config();
    assert_eq!(table[&0][&1][&28], 1000);
}

#[test]
fn test_sensor_config_save_and_load() {
    let f = start(&["fleet-config-file"], 1);
    f.fleet.configure_sensor(0, 2, 50, 500).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("sensors.json");
    f.fleet.save_sensor_config(&path).unwrap();

    f.fleet.configure_sensor(0, 2, 50, 0).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        f.chassis[0].channels().is_empty()
    }));

    f.fleet.load_sensor_config(&path).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        f.chassis[0]
            .channels()
            .iter()
            .any(|c| c.sensor_id == 2 && c.datatype == 50 && c.freq == 500)
    }));
}

#[test]
fn test_streaming_produces_synchronized_batches() {
    let f = start(&["fleet-stream-a", "fleet-stream-b"], 2);
    f.fleet.configure_sensor(0, 1, 28, 1000).unwrap();
    f.fleet.configure_sensor(1, 1, 28, 1000).unwrap();
    f.fleet.start().unwrap();
    assert!(f.fleet.is_streaming());

    // 第二台机箱晚开始一个 tick，首轮应在 tick 6 对齐
    for tick in 5..=9u32 {
        let packet = DataPacket::new(tick, vec![Sample::new(1, 28, tick as i32 * 10)]);
        assert!(f.chassis[0].send_data(&packet));
    }
    for tick in 6..=9u32 {
        let packet = DataPacket::new(tick, vec![Sample::new(1, 28, -(tick as i32))]);
        assert!(f.chassis[1].send_data(&packet));
    }

    assert!(wait_until(Duration::from_secs(3), || {
        f.callbacks.batches.lock().len() >= 4
    }));
    f.fleet.stop();
    assert!(!f.fleet.is_streaming());

    let batches = f.callbacks.batches.lock().clone();
    let first = &batches[0];
    assert_eq!(first.len(), 2);
    assert_eq!(first["00:01:28"].timestamp, 6);
    assert_eq!(first["00:01:28"].value, 60);
    assert_eq!(first["01:01:28"].timestamp, 6);
    assert_eq!(first["01:01:28"].value, -6);

    for (batch, tick) in batches.iter().zip(6u32..) {
        assert!(batch.values().all(|r| r.timestamp == tick));
    }
    assert_eq!(*f.callbacks.bursts.lock(), 2);
    assert_eq!(f.fleet.sync_stats().frames_discarded, 1);
    assert!(f.fleet.sensor(0, 1).unwrap().last_data.is_some());
}

#[test]
fn test_one_time_read_and_password() {
    let f = start(&["fleet-raw"], 1);

    f.fleet.one_time_read(0, 4, 0x21).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        !f.callbacks.raw.lock().is_empty()
    }));
    let (chassis, register) = f.callbacks.raw.lock()[0];
    assert_eq!(chassis, 0);
    assert_eq!(register.data, 0x42);

    f.fleet.send_password("wrong");
    f.fleet.send_password("fieldline");
    assert!(wait_until(Duration::from_secs(2), || {
        f.callbacks.passwords.lock().len() == 2
    }));
    assert_eq!(f.callbacks.passwords.lock().clone(), vec![false, true]);
}

#[test]
fn test_unexpected_disconnect_reported() {
    let f = start(&["fleet-drop"], 1);
    assert!(wait_until(Duration::from_secs(2), || {
        f.callbacks.connections.lock().last() == Some(&(1, 1))
    }));

    f.chassis[0].set_accepting(false);
    f.chassis[0].drop_connection();

    assert!(wait_until(Duration::from_secs(3), || {
        !f.callbacks.device_errors.lock().is_empty()
    }));
    assert!(f.callbacks.device_errors.lock()[0].contains("fleet-drop:7777"));
    assert!(wait_until(Duration::from_secs(2), || {
        f.callbacks.connections.lock().last() == Some(&(0, 1))
    }));
}

#[test]
fn test_identity_store_restores_fleet() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("chassis.toml");
    let connector = Arc::new(MockConnector::new());
    let _chassis = MockChassis::spawn(
        &connector,
        Endpoint::new("fleet-identity", 7777),
        system_status(1, 1),
    );

    {
        let fleet = FleetManager::builder()
            .config(fast_config())
            .connector(connector.clone())
            .identity_store(Arc::new(TomlIdentityStore::new(&path)))
            .build()
            .unwrap();
        let mut map = BTreeMap::new();
        map.insert("fleet-identity:7777".to_string(), 4);
        fleet.connect_chassis_list(map).unwrap();
    }

    let fleet = FleetManager::builder()
        .config(fast_config())
        .connector(connector.clone())
        .identity_store(Arc::new(TomlIdentityStore::new(&path)))
        .build()
        .unwrap();
    assert!(fleet.startup().unwrap());
    assert_eq!(fleet.chassis_list()[&4], "fleet-identity:7777");
    assert!(wait_until(Duration::from_secs(3), || fleet.connected_count() == 1));
}

#[test]
fn test_startup_without_remembered_chassis() {
    let fleet = FleetManager::builder()
        .config(fast_config())
        .connector(Arc::new(MockConnector::new()))
        .build()
        .unwrap();
    assert!(!fleet.startup().unwrap());
    assert_eq!(fleet.expected_count(), 0);
}
