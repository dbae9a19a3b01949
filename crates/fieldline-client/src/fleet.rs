//! 机群管理
//!
//! [`FleetManager`] 拥有预期机箱到 [`ProtocolConnection`] 的映射，
//! 维护传感器/通道状态，并把各机箱的数据帧合并为同步批次。
//!
//! # 线程
//!
//! - 每个机箱会话自带的 IO 线程（见 `fieldline-driver`），状态记录在会话分发线程中处理
//! - 连接监视线程（默认 1 Hz）：统计在线机箱数、报告断开与缓冲区积压
//! - 帧同步线程（仅数据流期间）：从各机箱环形缓冲区取帧，对齐后按批次回调
//! - 发现线程（可选）：消费外部发现事件
//!
//! # 锁
//!
//! 服务表由一把锁保护；同步器有自己的锁，获取顺序为 服务表 → 同步器。
//! 回调总是在释放锁之后调用。

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError};
use fieldline_driver::{
    ConnectionHandler, ConnectionState, Event, JoinTimeout, MetricsSnapshot, ProtocolConnection,
    one_shot_command, probe_system_status,
};
use fieldline_net::{Connector, Endpoint};
use fieldline_protocol::{
    CHASSIS_ACTIVE_DATATYPES, CHASSIS_SENSOR_ID, ChannelConfig, Command, DATATYPE_ANALOG_IN,
    DATATYPE_BZ_OPEN, LogicKind, LogicRequest, MessageCodec, RawRegister, SENSOR_ACTIVE_DATATYPES,
    SENSOR_SLOTS, StatusBody, StatusPacket, SystemStatus, WaveRequest,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::builder::FleetBuilder;
use crate::callback::FleetCallbacks;
use crate::config::FleetConfig;
use crate::discovery::{DiscoveredChassis, ServiceEvent, ServiceInfo};
use crate::error::FleetError;
use crate::hardware_state::{HardwareState, SensorInfo};
use crate::identity::{ChassisIdentityMap, ChassisIdentityStore};
use crate::sensor_state::{LifecycleEvent, SensorLifecycle, SensorTracker};
use crate::synchronizer::{FrameSynchronizer, SyncStats, SyncedBatch};

/// 快捷配置使用的默认采样频率（Hz）
pub const DEFAULT_SAMPLE_FREQ: u32 = 1000;

/// 停止数据流时等待同步线程退出的时间
const SYNC_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

const THREAD_JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 请求的通道配置：机箱 → 传感器 → 数据类型 → 频率
pub type SensorConfigTable = BTreeMap<u32, BTreeMap<u8, BTreeMap<i32, u32>>>;

/// 非开发者模式下允许配置的数据类型
pub fn is_datatype_valid(sensor_id: u8, datatype: i32, developer_mode: bool) -> bool {
    if developer_mode {
        return true;
    }
    if sensor_id == CHASSIS_SENSOR_ID {
        CHASSIS_ACTIVE_DATATYPES.contains(&datatype)
    } else {
        SENSOR_ACTIVE_DATATYPES.contains(&datatype)
    }
}

/// 连接中的机箱概况
#[derive(Debug, Clone, PartialEq)]
pub struct ChassisInfo {
    pub id: u32,
    pub name: String,
    pub state: ConnectionState,
    pub streaming: bool,
    pub version: Option<String>,
    pub closed_loop: Option<bool>,
    pub metrics: MetricsSnapshot,
}

struct ChassisSession {
    name: String,
    connection: Arc<ProtocolConnection>,
    /// 监视线程上次观察到的连接状态
    was_connected: bool,
}

#[derive(Default)]
struct ServiceTable {
    discovered: BTreeMap<String, DiscoveredChassis>,
    sessions: BTreeMap<u32, ChassisSession>,
    /// 连接后尚未收到第一条 SENSOR_STATUS 的机箱
    awaiting_sensors: BTreeSet<u32>,
}

impl ServiceTable {
    fn connection(&self, chassis_id: u32) -> Option<Arc<ProtocolConnection>> {
        self.sessions.get(&chassis_id).map(|s| s.connection.clone())
    }

    fn connected(&self) -> impl Iterator<Item = (u32, &ChassisSession)> + '_ {
        self.sessions
            .iter()
            .filter(|(_, s)| s.connection.is_connected())
            .map(|(&id, s)| (id, s))
    }

    fn id_of(&self, name: &str) -> Option<u32> {
        self.sessions
            .iter()
            .find(|(_, s)| s.name == name)
            .map(|(&id, _)| id)
    }
}

pub(crate) struct FleetInner {
    config: FleetConfig,
    connector: Arc<dyn Connector>,
    codec: Arc<dyn MessageCodec>,
    callbacks: Arc<dyn FleetCallbacks>,
    identity_store: Arc<dyn ChassisIdentityStore>,
    hardware: HardwareState,
    services: Mutex<ServiceTable>,
    sensors: Mutex<SensorTracker>,
    synchronizer: Mutex<FrameSynchronizer>,
    sensor_config: Mutex<SensorConfigTable>,
    /// 固件更新/重启期间记录的系统信息（名称 → 重启前状态）
    expect_reboot: Mutex<BTreeMap<String, SystemStatus>>,
    last_closed_loop: Mutex<Option<bool>>,
    password: Mutex<Option<String>>,
    expected: AtomicUsize,
    streaming: AtomicBool,
    sync_running: AtomicBool,
    developer_mode: AtomicBool,
    update_connections: AtomicBool,
    is_running: AtomicBool,
    shutdown_signal: Event,
}

/// 机箱会话事件 → 机群
struct FleetHandler {
    inner: Weak<FleetInner>,
    chassis_id: u32,
}

impl ConnectionHandler for FleetHandler {
    fn on_state_changed(&self, endpoint: &Endpoint, state: ConnectionState) {
        if let Some(inner) = self.inner.upgrade() {
            inner.on_session_state(self.chassis_id, endpoint, state);
        }
    }

    fn on_status(&self, _endpoint: &Endpoint, status: StatusPacket) {
        if let Some(inner) = self.inner.upgrade() {
            inner.handle_status(self.chassis_id, status);
        }
    }

    fn on_raw_response(&self, _endpoint: &Endpoint, register: RawRegister) {
        if let Some(inner) = self.inner.upgrade() {
            inner.callbacks.on_raw_response(self.chassis_id, register);
        }
    }

    fn on_password_response(&self, endpoint: &Endpoint, enable: bool, valid: bool) {
        if let Some(inner) = self.inner.upgrade() {
            debug!(
                "Developer mode {} on {}: valid={}",
                if enable { "enable" } else { "disable" },
                endpoint,
                valid
            );
            inner
                .callbacks
                .on_password_response(&endpoint.to_string(), valid);
        }
    }

    fn on_buffer_full(&self, endpoint: &Endpoint) {
        if let Some(inner) = self.inner.upgrade() {
            warn!("Chassis {} ({}) buffer full", self.chassis_id, endpoint);
            inner.callbacks.on_buffer_full(self.chassis_id);
        }
    }
}

impl FleetInner {
    pub(crate) fn new(
        config: FleetConfig,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn MessageCodec>,
        callbacks: Arc<dyn FleetCallbacks>,
        identity_store: Arc<dyn ChassisIdentityStore>,
        hardware: HardwareState,
    ) -> Self {
        let developer_mode = config.developer_mode;
        Self {
            config,
            connector,
            codec,
            callbacks,
            identity_store,
            hardware,
            services: Mutex::new(ServiceTable::default()),
            sensors: Mutex::new(SensorTracker::new()),
            synchronizer: Mutex::new(FrameSynchronizer::new()),
            sensor_config: Mutex::new(SensorConfigTable::new()),
            expect_reboot: Mutex::new(BTreeMap::new()),
            last_closed_loop: Mutex::new(None),
            password: Mutex::new(None),
            expected: AtomicUsize::new(0),
            streaming: AtomicBool::new(false),
            sync_running: AtomicBool::new(false),
            developer_mode: AtomicBool::new(developer_mode),
            update_connections: AtomicBool::new(false),
            is_running: AtomicBool::new(true),
            shutdown_signal: Event::new(),
        }
    }

    fn connection(&self, chassis_id: u32) -> Result<Arc<ProtocolConnection>, FleetError> {
        self.services
            .lock()
            .connection(chassis_id)
            .ok_or(FleetError::UnknownChassisId(chassis_id))
    }

    fn connected_connections(&self) -> Vec<(u32, Arc<ProtocolConnection>)> {
        self.services
            .lock()
            .connected()
            .map(|(id, s)| (id, s.connection.clone()))
            .collect()
    }

    fn all_connections(&self) -> Vec<(u32, Arc<ProtocolConnection>)> {
        self.services
            .lock()
            .sessions
            .iter()
            .map(|(&id, s)| (id, s.connection.clone()))
            .collect()
    }

    fn chassis_name(&self, chassis_id: u32) -> String {
        self.services
            .lock()
            .sessions
            .get(&chassis_id)
            .map(|s| s.name.clone())
            .unwrap_or_else(|| chassis_id.to_string())
    }

    // ==================== 会话事件 ====================

    fn on_session_state(&self, chassis_id: u32, endpoint: &Endpoint, state: ConnectionState) {
        match state {
            ConnectionState::Connected => {
                info!("Chassis {} ({}) connected", chassis_id, endpoint);
                let connection = {
                    let mut services = self.services.lock();
                    services.awaiting_sensors.insert(chassis_id);
                    services.connection(chassis_id)
                };
                if let Some(connection) = connection
                    && let Err(e) = connection
                        .system_status_request()
                        .and_then(|_| connection.sensor_config_request())
                {
                    warn!("Failed to query chassis {}: {}", chassis_id, e);
                }
                // 会话克隆已在上面释放，回调期间不持有
                self.callbacks
                    .on_chassis_connected(&endpoint.to_string(), chassis_id);
            },
            ConnectionState::HeartbeatExpired => {
                warn!("Chassis {} ({}) heartbeat expired", chassis_id, endpoint);
            },
            other => debug!("Chassis {} ({}) is {:?}", chassis_id, endpoint, other),
        }
    }

    fn handle_status(&self, chassis_id: u32, packet: StatusPacket) {
        let name = self.chassis_name(chassis_id);
        if !packet.status.is_empty() {
            self.callbacks.on_chassis_status(&name, &packet.status);
        }
        if let Some(closed) = packet.closed_loop {
            let changed = {
                let mut services = self.services.lock();
                match services.discovered.get_mut(&name) {
                    Some(record) if record.closed_loop != Some(closed) => {
                        record.closed_loop = Some(closed);
                        true
                    },
                    _ => false,
                }
            };
            if changed {
                self.check_closed_loop();
            }
        }

        match packet.body {
            StatusBody::Status => {},
            StatusBody::SystemStatus(system) => self.on_system_status(chassis_id, &name, system),
            StatusBody::SensorLed(leds) => {
                for led in leds {
                    if self.hardware.update_led(chassis_id, &led) {
                        self.callbacks.on_led_changed(
                            chassis_id,
                            led.sensor_id,
                            led.color,
                            led.blink_state,
                        );
                    }
                }
            },
            StatusBody::SensorConfig(entries) => {
                self.hardware.configure_channel_list(chassis_id, &entries);
                self.refresh_streaming(chassis_id);
                self.callbacks.on_sensor_status_changed();
            },
            StatusBody::SensorStatus(list) => {
                for presence in &list {
                    self.hardware.update_presence(chassis_id, presence);
                }
                let first = self.services.lock().awaiting_sensors.remove(&chassis_id);
                if first {
                    let present = self.hardware.present_sensors(chassis_id);
                    info!("Chassis {} has {} sensors", chassis_id, present.len());
                    self.callbacks.on_sensors_available(chassis_id, &present);
                }
                self.callbacks.on_sensor_status_changed();
            },
            StatusBody::SensorState(reports) => {
                for report in reports {
                    let event = self
                        .sensors
                        .lock()
                        .apply(chassis_id, report.sensor_id, report.state);
                    if let Some(event) = event {
                        self.report_lifecycle(chassis_id, report.sensor_id, event);
                    }
                }
            },
            StatusBody::SensorField(fields) => {
                for field in &fields {
                    self.hardware.update_field(chassis_id, field);
                }
                self.callbacks.on_sensor_status_changed();
            },
            StatusBody::Progress { progress, message } => {
                self.callbacks.on_update_progress(&name, progress, &message);
            },
        }
    }

    fn report_lifecycle(&self, chassis_id: u32, sensor_id: u8, event: LifecycleEvent) {
        let cb = &self.callbacks;
        match event {
            LifecycleEvent::RestartBegin => cb.on_restart_begin(chassis_id, sensor_id),
            LifecycleEvent::RestartComplete => cb.on_restart_complete(chassis_id, sensor_id),
            LifecycleEvent::CoarseZeroBegin => cb.on_coarse_zero_begin(chassis_id, sensor_id),
            LifecycleEvent::CoarseZeroComplete => cb.on_coarse_zero_complete(chassis_id, sensor_id),
            LifecycleEvent::FineZeroBegin => cb.on_fine_zero_begin(chassis_id, sensor_id),
            LifecycleEvent::FineZeroComplete => cb.on_fine_zero_complete(chassis_id, sensor_id),
            LifecycleEvent::Ready => cb.on_sensor_ready(chassis_id, sensor_id),
            LifecycleEvent::Error(kind) => {
                warn!("Sensor {}:{} reported {}", chassis_id, sensor_id, kind);
                cb.on_sensor_error(chassis_id, sensor_id, kind);
            },
        }
    }

    fn on_system_status(&self, chassis_id: u32, name: &str, system: SystemStatus) {
        debug!(
            "Chassis {} system status: num={} total={} version={}",
            chassis_id, system.num, system.total, system.version
        );
        {
            let mut services = self.services.lock();
            if let Some(record) = services.discovered.get_mut(name) {
                record.system = Some(system);
                record.confirmed = true;
            }
        }
        let mismatch = self.is_config_mismatch();
        if mismatch {
            warn!("Chassis {} reports a fleet size that does not match the configuration", name);
        } else {
            self.update_connections.store(true, Ordering::Release);
        }
        self.callbacks.on_config_mismatch(mismatch);
    }

    /// 已连接机箱上报的机群规模与预期不一致
    fn is_config_mismatch(&self) -> bool {
        let expected = self.expected.load(Ordering::Acquire);
        let services = self.services.lock();
        let totals: Vec<u32> = services
            .connected()
            .filter_map(|(_, s)| services.discovered.get(&s.name))
            .filter_map(|record| record.total())
            .collect();
        totals.len() != expected || totals.iter().any(|&t| t as usize != expected)
    }

    // ==================== 闭环 ====================

    fn set_closed_loop(&self, closed: bool) {
        let connections = {
            let mut services = self.services.lock();
            for record in services.discovered.values_mut() {
                record.closed_loop = None;
            }
            services
                .connected()
                .map(|(id, s)| (id, s.connection.clone()))
                .collect::<Vec<_>>()
        };
        *self.last_closed_loop.lock() = None;
        for (id, connection) in connections {
            if let Err(e) = connection.closed_loop(closed) {
                warn!("Failed to set closed loop on chassis {}: {}", id, e);
            }
        }
    }

    fn check_closed_loop(&self) {
        let flags: Vec<Option<bool>> = {
            let services = self.services.lock();
            services
                .connected()
                .map(|(_, s)| services.discovered.get(&s.name).and_then(|r| r.closed_loop))
                .collect()
        };
        if flags.is_empty() || flags.iter().any(Option::is_none) {
            return;
        }
        let closed = flags.iter().filter(|f| **f == Some(true)).count();
        if closed != 0 && closed != flags.len() {
            warn!("Chassis disagree on closed loop, opening all");
            self.set_closed_loop(false);
            return;
        }

        let state = closed == flags.len();
        let changed = self.last_closed_loop.lock().replace(state) != Some(state);
        if changed {
            info!("Fleet closed loop: {}", state);
            self.callbacks.on_closed_loop(state);
        }
    }

    // ==================== 数据流 ====================

    /// 按通道数开启或关闭单个机箱的数据流
    fn refresh_streaming(&self, chassis_id: u32) {
        let Ok(connection) = self.connection(chassis_id) else {
            return;
        };
        let channels = self.hardware.channel_count(chassis_id);
        let fleet_streaming = self.streaming.load(Ordering::Acquire);

        if fleet_streaming && channels > 0 && !connection.is_streaming() {
            info!("Chassis {} starts streaming ({} channels)", chassis_id, channels);
            connection.set_streaming(true);
        } else if channels == 0 && connection.is_streaming() {
            info!("Chassis {} has no active channels, streaming stopped", chassis_id);
            connection.set_streaming(false);
            self.synchronizer.lock().remove_source(chassis_id);
        }
    }

    /// 当前参与同步的机箱
    fn streaming_sources(&self) -> Vec<(u32, Arc<ProtocolConnection>)> {
        self.services
            .lock()
            .sessions
            .iter()
            .filter(|(_, s)| s.connection.is_streaming() && s.connection.is_connected())
            .map(|(&id, s)| (id, s.connection.clone()))
            .collect()
    }

    /// 同步线程一次循环：补帧、尝试产生一轮
    fn sync_pass(&self, burst: &mut Vec<SyncedBatch>) {
        let sources = self.streaming_sources();
        {
            let mut sync = self.synchronizer.lock();
            let stale: Vec<u32> = sync
                .sources()
                .filter(|id| !sources.iter().any(|(s, _)| s == id))
                .collect();
            for id in stale {
                sync.remove_source(id);
            }
            for (id, _) in &sources {
                sync.add_source(*id);
            }
        }
        if sources.is_empty() {
            std::thread::sleep(self.config.sync_pop_timeout());
            return;
        }

        let pop_timeout = self.config.sync_pop_timeout();
        for (id, connection) in &sources {
            if !self.synchronizer.lock().needs_frame(*id) {
                continue;
            }
            if let Some(packet) = connection.queue().get(true, pop_timeout) {
                self.synchronizer.lock().offer(*id, packet);
            }
        }

        let Some(round) = self.synchronizer.lock().poll() else {
            return;
        };
        let now = Instant::now();
        for id in round.chassis() {
            self.hardware.mark_data(id, now);
        }
        let batch = round.assemble(&self.hardware.active_channels());
        if batch.is_empty() {
            return;
        }
        burst.push(batch);
        if burst.len() >= self.config.burst_size {
            self.callbacks.on_data_available(burst);
            burst.clear();
        }
    }

    // ==================== 监视 ====================

    fn monitor_loop(self: Arc<Self>) {
        let period = self.config.monitor_period();
        let mut last_connected = usize::MAX;
        let mut last_expected = usize::MAX;

        while self.is_running.load(Ordering::Acquire) {
            if self.shutdown_signal.wait_timeout(period) {
                break;
            }
            self.monitor_tick(&mut last_connected, &mut last_expected);
        }
        debug!("Fleet monitor exited");
    }

    fn monitor_tick(&self, last_connected: &mut usize, last_expected: &mut usize) {
        let mut reconnected = Vec::new();
        let mut lost = Vec::new();
        let (connected, streaming_queues) = {
            let mut services = self.services.lock();
            for (&id, session) in services.sessions.iter_mut() {
                let now_connected = session.connection.is_connected();
                if now_connected == session.was_connected {
                    continue;
                }
                session.was_connected = now_connected;
                if now_connected {
                    reconnected.push((id, session.connection.clone()));
                } else {
                    lost.push((id, session.name.clone()));
                }
            }
            let connected = services.connected().count();
            let queues: Vec<(usize, usize)> = services
                .sessions
                .values()
                .filter(|s| s.connection.is_streaming())
                .map(|s| (s.connection.queue().len(), s.connection.queue().free_bytes()))
                .collect();
            (connected, queues)
        };

        for (id, name) in &lost {
            self.synchronizer.lock().remove_source(*id);
            if self.expect_reboot.lock().contains_key(name) {
                info!("Chassis {} ({}) went down for reboot", id, name);
            } else {
                error!("Chassis {} ({}) disconnected", id, name);
                self.callbacks
                    .on_device_error(&format!("Chassis {} disconnected", name));
            }
        }
        if !reconnected.is_empty() || !lost.is_empty() {
            self.update_connections.store(true, Ordering::Release);
        }

        let expected = self.expected.load(Ordering::Acquire);
        let forced = self.update_connections.swap(false, Ordering::AcqRel);
        if connected != *last_connected || expected != *last_expected || forced {
            *last_connected = connected;
            *last_expected = expected;
            info!("Chassis connected: {}/{}", connected, expected);
            self.update_chassis_connections(&reconnected);
            self.callbacks.on_connections_changed(connected, expected);
        }

        if self.streaming.load(Ordering::Acquire) && !streaming_queues.is_empty() {
            let queued: usize = streaming_queues.iter().map(|(n, _)| n).sum();
            let min_free = streaming_queues.iter().map(|(_, f)| *f).min().unwrap_or(0);
            self.callbacks
                .on_data_underrun(queued / streaming_queues.len(), min_free);
        }
    }

    /// 重新连上的机箱：重新请求通道配置、重发口令、按需恢复数据流
    fn update_chassis_connections(&self, reconnected: &[(u32, Arc<ProtocolConnection>)]) {
        let password = self.password.lock().clone();
        for (id, connection) in reconnected {
            let result = connection.sensor_config_request().and_then(|_| match &password {
                Some(p) => connection.developer_mode(true, Some(p.clone())),
                None => Ok(()),
            });
            if let Err(e) = result {
                warn!("Failed to restore chassis {}: {}", id, e);
            }
            self.refresh_streaming(*id);
        }
    }
}

/// 机群管理器
///
/// # Example
///
/// ```no_run
/// use std::collections::BTreeMap;
/// use fieldline_client::FleetManager;
///
/// let fleet = FleetManager::builder().build()?;
/// let mut chassis = BTreeMap::new();
/// chassis.insert("192.168.2.43:7777".to_string(), 0);
/// fleet.connect_chassis_list(chassis)?;
/// fleet.start_bz()?;
/// fleet.start()?;
/// # Ok::<(), fieldline_client::FleetError>(())
/// ```
pub struct FleetManager {
    inner: Arc<FleetInner>,
    monitor_thread: Mutex<Option<JoinHandle<()>>>,
    sync_thread: Mutex<Option<JoinHandle<()>>>,
    discovery_thread: Mutex<Option<JoinHandle<()>>>,
}

impl FleetManager {
    pub fn builder() -> FleetBuilder {
        FleetBuilder::new()
    }

    pub(crate) fn start_with(inner: FleetInner) -> Result<Self, FleetError> {
        let inner = Arc::new(inner);
        let monitor_inner = inner.clone();
        let monitor = std::thread::Builder::new()
            .name("fl-fleet-monitor".into())
            .spawn(move || monitor_inner.monitor_loop())?;

        let manager = Self {
            inner,
            monitor_thread: Mutex::new(Some(monitor)),
            sync_thread: Mutex::new(None),
            discovery_thread: Mutex::new(None),
        };

        for host in manager.inner.config.manual_hosts.clone() {
            if let Err(e) = manager.add_manual_host(&host) {
                warn!("Manual host {} rejected: {}", host, e);
            }
        }
        info!("Fleet manager started");
        Ok(manager)
    }

    pub fn config(&self) -> &FleetConfig {
        &self.inner.config
    }

    pub fn hardware(&self) -> &HardwareState {
        &self.inner.hardware
    }

    // ==================== 发现 ====================

    /// 在后台线程中消费发现事件，直到通道关闭或管理器关闭
    pub fn attach_discovery(self: &Arc<Self>, events: Receiver<ServiceEvent>) -> Result<(), FleetError> {
        let weak = Arc::downgrade(self);
        let handle = std::thread::Builder::new()
            .name("fl-fleet-discovery".into())
            .spawn(move || {
                loop {
                    match events.recv_timeout(Duration::from_millis(100)) {
                        Ok(event) => {
                            let Some(fleet) = weak.upgrade() else { break };
                            if let Err(e) = fleet.handle_service_event(event) {
                                warn!("Discovery event ignored: {}", e);
                            }
                        },
                        Err(RecvTimeoutError::Timeout) => {
                            match weak.upgrade() {
                                Some(fleet) if fleet.inner.is_running.load(Ordering::Acquire) => {},
                                _ => break,
                            }
                        },
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
                debug!("Discovery feed closed");
            })?;
        if let Some(old) = self.discovery_thread.lock().replace(handle) {
            debug!("Replacing previous discovery feed");
            drop(old);
        }
        Ok(())
    }

    /// 处理一个发现事件
    pub fn handle_service_event(&self, event: ServiceEvent) -> Result<(), FleetError> {
        match event {
            ServiceEvent::Added {
                name,
                address,
                port,
                properties,
            } => {
                let prefix = self.inner.config.service_name_prefix();
                let info = ServiceInfo::from_event(&name, &address, port, &properties, &prefix)?;
                self.add_service(info)
            },
            ServiceEvent::Removed { name } => {
                let mut services = self.inner.services.lock();
                for record in services
                    .discovered
                    .values_mut()
                    .filter(|r| r.info.service_name == name)
                {
                    info!("Service disappeared: {} ({})", name, record.name());
                    record.pending_removal = true;
                }
                Ok(())
            },
        }
    }

    fn add_service(&self, info: ServiceInfo) -> Result<(), FleetError> {
        let name = info.chassis_name();
        let endpoint = info.endpoint.clone();
        let needs_probe = !info.legacy;
        {
            let mut services = self.inner.services.lock();
            let connected = services
                .id_of(&name)
                .and_then(|id| services.sessions.get(&id))
                .is_some_and(|s| s.connection.is_connected());

            match services.discovered.get_mut(&name) {
                Some(record) => {
                    record.pending_removal = false;
                    if info.system.is_some() {
                        record.system = info.system.clone();
                    }
                    record.info = info;
                    if connected {
                        debug!("Chassis {} already connected", name);
                        return Ok(());
                    }
                    debug!("Known chassis {} rediscovered", name);
                },
                None => {
                    info!("Discovered chassis {}", name);
                    services
                        .discovered
                        .insert(name.clone(), DiscoveredChassis::new(info));
                },
            }
        }

        if needs_probe {
            let timeout = self.inner.config.connection.one_shot_timeout();
            match probe_system_status(&*self.inner.connector, &*self.inner.codec, &endpoint, timeout) {
                Ok(system) => {
                    let mut services = self.inner.services.lock();
                    if let Some(record) = services.discovered.get_mut(&name) {
                        record.system = Some(system);
                        record.confirmed = true;
                    }
                },
                Err(e) => warn!("Chassis {} did not answer the presence check: {}", name, e),
            }
        }
        Ok(())
    }

    /// 手动添加一个机箱地址（使用配置中的端口）
    pub fn add_manual_host(&self, host: &str) -> Result<(), FleetError> {
        if host.is_empty() {
            return Err(FleetError::Config("empty host".into()));
        }
        self.add_service(ServiceInfo::manual(host, self.inner.config.port))
    }

    /// 已发现的机箱（含等待移除的）
    pub fn discovered_chassis(&self) -> Vec<DiscoveredChassis> {
        self.inner
            .services
            .lock()
            .discovered
            .values()
            .cloned()
            .collect()
    }

    /// 丢弃服务已消失且没有会话的记录
    pub fn purge_removed(&self) -> usize {
        let mut services = self.inner.services.lock();
        let in_use: BTreeSet<String> = services.sessions.values().map(|s| s.name.clone()).collect();
        let before = services.discovered.len();
        services
            .discovered
            .retain(|name, r| !r.pending_removal || in_use.contains(name));
        before - services.discovered.len()
    }

    // ==================== 连接 ====================

    fn create_session(&self, chassis_id: u32, name: &str) -> Result<ChassisSession, FleetError> {
        let endpoint = Endpoint::parse(name)
            .map_err(|e| FleetError::Config(format!("invalid chassis name {:?}: {}", name, e)))?;
        let handler = Arc::new(FleetHandler {
            inner: Arc::downgrade(&self.inner),
            chassis_id,
        });
        let connection = ProtocolConnection::builder(endpoint)
            .config(self.inner.config.connection.clone())
            .connector(self.inner.connector.clone())
            .codec(self.inner.codec.clone())
            .handler(handler)
            .build()?;
        Ok(ChassisSession {
            name: name.to_string(),
            connection: Arc::new(connection),
            was_connected: false,
        })
    }

    /// 连接一组机箱（名称 → ID），替换当前机群
    ///
    /// 不在新列表中的会话被关闭；已有会话强制重连；身份表写回存储。
    pub fn connect_chassis_list(&self, chassis: ChassisIdentityMap) -> Result<(), FleetError> {
        let mut removed = Vec::new();
        {
            let mut services = self.inner.services.lock();
            let stale: Vec<u32> = services
                .sessions
                .iter()
                .filter(|(id, s)| chassis.get(&s.name) != Some(*id))
                .map(|(&id, _)| id)
                .collect();
            for id in stale {
                if let Some(session) = services.sessions.remove(&id) {
                    removed.push((id, session));
                }
                services.awaiting_sensors.remove(&id);
            }
        }
        for (id, session) in removed {
            info!("Removing chassis {} ({})", id, session.name);
            session.connection.shutdown();
            self.inner.synchronizer.lock().remove_source(id);
            self.inner.sensors.lock().remove_chassis(id);
            self.inner.callbacks.on_chassis_disconnected(id);
        }

        self.inner.hardware.clear();
        for (name, &id) in &chassis {
            self.inner.hardware.add_chassis(id, name);
        }

        for (name, &id) in &chassis {
            let existing = self.inner.services.lock().connection(id);
            if let Some(connection) = existing {
                info!("Reconnecting chassis {} ({})", id, name);
                connection.force_reconnect();
                continue;
            }
            let session = self.create_session(id, name)?;
            let mut services = self.inner.services.lock();
            if !services.discovered.contains_key(name)
                && let Ok(endpoint) = Endpoint::parse(name)
            {
                let info = ServiceInfo::manual(&endpoint.host, endpoint.port);
                services
                    .discovered
                    .insert(name.clone(), DiscoveredChassis::new(info));
            }
            services.sessions.insert(id, session);
        }

        self.inner.expected.store(chassis.len(), Ordering::Release);
        self.inner.update_connections.store(true, Ordering::Release);
        self.inner.identity_store.save(&chassis)?;
        info!("Fleet configured with {} chassis", chassis.len());
        Ok(())
    }

    /// 从身份表恢复机群
    ///
    /// 表中每个机箱都应答一次性查询时建立会话并返回 `true`；否则不建立任何会话。
    pub fn startup(&self) -> Result<bool, FleetError> {
        let chassis = self.inner.identity_store.load()?;
        if chassis.is_empty() {
            info!("No remembered chassis");
            return Ok(false);
        }

        let timeout = self.inner.config.connection.one_shot_timeout();
        let mut answers = BTreeMap::new();
        for name in chassis.keys() {
            let endpoint = match Endpoint::parse(name) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!("Remembered chassis {:?} is not a valid address: {}", name, e);
                    return Ok(false);
                },
            };
            match probe_system_status(&*self.inner.connector, &*self.inner.codec, &endpoint, timeout) {
                Ok(system) => {
                    answers.insert(name.clone(), (endpoint, system));
                },
                Err(e) => {
                    warn!("Remembered chassis {} is not available: {}", name, e);
                    return Ok(false);
                },
            }
        }

        {
            let mut services = self.inner.services.lock();
            for (name, (endpoint, system)) in answers {
                let record = services.discovered.entry(name).or_insert_with(|| {
                    DiscoveredChassis::new(ServiceInfo::manual(&endpoint.host, endpoint.port))
                });
                record.system = Some(system);
                record.confirmed = true;
            }
        }
        self.connect_chassis_list(chassis)?;
        Ok(true)
    }

    /// 关闭全部会话
    pub fn disconnect_all(&self) {
        let sessions = std::mem::take(&mut self.inner.services.lock().sessions);
        for (id, session) in sessions {
            session.connection.shutdown();
            self.inner.synchronizer.lock().remove_source(id);
            self.inner.callbacks.on_chassis_disconnected(id);
        }
        self.inner.services.lock().awaiting_sensors.clear();
        self.inner.expected.store(0, Ordering::Release);
        self.inner.update_connections.store(true, Ordering::Release);
    }

    pub fn expected_count(&self) -> usize {
        self.inner.expected.load(Ordering::Acquire)
    }

    pub fn connected_count(&self) -> usize {
        self.inner.services.lock().connected().count()
    }

    /// 已连接机箱上报的机群规模与预期不一致
    pub fn is_config_mismatch(&self) -> bool {
        self.inner.is_config_mismatch()
    }

    /// 机群中的机箱（ID → 名称）
    pub fn chassis_list(&self) -> BTreeMap<u32, String> {
        self.inner
            .services
            .lock()
            .sessions
            .iter()
            .map(|(&id, s)| (id, s.name.clone()))
            .collect()
    }

    /// 已连接机箱的概况
    pub fn connected_chassis(&self) -> Vec<ChassisInfo> {
        let services = self.inner.services.lock();
        services
            .connected()
            .map(|(id, s)| {
                let record = services.discovered.get(&s.name);
                ChassisInfo {
                    id,
                    name: s.name.clone(),
                    state: s.connection.state(),
                    streaming: s.connection.is_streaming(),
                    version: record.and_then(|r| r.version().map(str::to_string)),
                    closed_loop: record.and_then(|r| r.closed_loop),
                    metrics: s.connection.metrics(),
                }
            })
            .collect()
    }

    // ==================== 数据流 ====================

    pub fn is_streaming(&self) -> bool {
        self.inner.streaming.load(Ordering::Acquire)
    }

    /// 开始数据流：清空各机箱缓冲区、复位同步器、启动同步线程
    pub fn start(&self) -> Result<(), FleetError> {
        if !self.inner.is_running.load(Ordering::Acquire) {
            return Err(FleetError::ShutDown);
        }
        if self.inner.streaming.swap(true, Ordering::AcqRel) {
            debug!("Fleet already streaming");
            return Ok(());
        }

        let connections = self.inner.all_connections();
        for (_, connection) in &connections {
            if connection.is_connected() {
                connection.queue().clear();
            } else {
                connection.queue().clear_with_timeout(Duration::ZERO);
            }
        }
        self.inner.synchronizer.lock().reset();
        for (id, _) in &connections {
            self.inner.refresh_streaming(*id);
        }

        self.inner.sync_running.store(true, Ordering::Release);
        let inner = self.inner.clone();
        let handle = std::thread::Builder::new()
            .name("fl-fleet-sync".into())
            .spawn(move || {
                let mut burst = Vec::with_capacity(inner.config.burst_size);
                while inner.sync_running.load(Ordering::Acquire) {
                    inner.sync_pass(&mut burst);
                }
                if !burst.is_empty() {
                    debug!("Discarding partial burst of {} batches", burst.len());
                }
            })
            .map_err(|e| {
                self.inner.streaming.store(false, Ordering::Release);
                self.inner.sync_running.store(false, Ordering::Release);
                FleetError::Io(e)
            })?;
        *self.sync_thread.lock() = Some(handle);
        info!("Fleet streaming started ({} chassis)", connections.len());
        Ok(())
    }

    /// 停止数据流
    pub fn stop(&self) {
        if !self.inner.streaming.swap(false, Ordering::AcqRel) {
            return;
        }
        for (_, connection) in self.inner.all_connections() {
            connection.set_streaming(false);
        }
        self.inner.sync_running.store(false, Ordering::Release);
        if let Some(handle) = self.sync_thread.lock().take()
            && let Err(_e) = handle.join_timeout(SYNC_JOIN_TIMEOUT)
        {
            error!(
                "Sync thread panicked or failed to shut down within {:?}",
                SYNC_JOIN_TIMEOUT
            );
        }
        info!("Fleet streaming stopped");
    }

    pub fn sync_stats(&self) -> SyncStats {
        self.inner.synchronizer.lock().stats()
    }

    // ==================== 通道配置 ====================

    pub fn developer_mode(&self) -> bool {
        self.inner.developer_mode.load(Ordering::Acquire)
    }

    fn validate_channel(&self, sensor_id: u8, datatype: i32) -> Result<(), FleetError> {
        if usize::from(sensor_id) >= SENSOR_SLOTS {
            return Err(FleetError::Config(format!("sensor index {} out of range", sensor_id)));
        }
        if !is_datatype_valid(sensor_id, datatype, self.developer_mode()) {
            return Err(FleetError::InvalidDatatype {
                sensor: sensor_id,
                datatype,
            });
        }
        Ok(())
    }

    fn record_request(&self, chassis_id: u32, channel: &ChannelConfig) {
        let mut table = self.inner.sensor_config.lock();
        let datatypes = table
            .entry(chassis_id)
            .or_default()
            .entry(channel.sensor_id)
            .or_default();
        if channel.freq == 0 {
            datatypes.remove(&channel.datatype);
        } else {
            datatypes.insert(channel.datatype, channel.freq);
        }
    }

    /// 一次下发一组通道（不影响列表外的通道）
    fn apply_channels(&self, chassis_id: u32, channels: Vec<ChannelConfig>) -> Result<(), FleetError> {
        if channels.is_empty() {
            return Ok(());
        }
        let connection = self.inner.connection(chassis_id)?;
        connection.config_list(channels.clone())?;
        for channel in &channels {
            self.record_request(chassis_id, channel);
            self.inner.hardware.configure_channel(
                chassis_id,
                channel.sensor_id,
                channel.datatype,
                channel.freq,
                None,
            );
        }
        self.inner.refresh_streaming(chassis_id);
        Ok(())
    }

    /// 配置单个通道（`freq == 0` 关闭）
    pub fn configure_sensor(
        &self,
        chassis_id: u32,
        sensor_id: u8,
        datatype: i32,
        freq: u32,
    ) -> Result<(), FleetError> {
        self.validate_channel(sensor_id, datatype)?;
        self.apply_channels(
            chassis_id,
            vec![ChannelConfig {
                sensor_id,
                datatype,
                freq,
            }],
        )
    }

    /// 用新列表替换机箱的通道配置（列表外的激活通道被关闭），只发送一条命令
    pub fn configure_sensor_list(
        &self,
        chassis_id: u32,
        channels: &[ChannelConfig],
    ) -> Result<(), FleetError> {
        for channel in channels {
            self.validate_channel(channel.sensor_id, channel.datatype)?;
        }
        let mut list: Vec<ChannelConfig> = self
            .inner
            .hardware
            .sensors(chassis_id)
            .iter()
            .flat_map(|s| s.active_datatypes().map(move |d| (s.sensor_id, d)))
            .filter(|(s, d)| !channels.iter().any(|c| c.sensor_id == *s && c.datatype == *d))
            .map(|(sensor_id, datatype)| ChannelConfig {
                sensor_id,
                datatype,
                freq: 0,
            })
            .collect();
        list.extend_from_slice(channels);
        self.apply_channels(chassis_id, list)
    }

    /// 为所有在位传感器配置同一数据类型
    ///
    /// 开启时只配置已细调零的传感器（`force` 忽略此限制）；关闭时配置全部在位传感器。
    pub fn quick_sensor_config(&self, datatype: i32, freq: u32, force: bool) -> Result<(), FleetError> {
        for (chassis_id, _) in self.inner.connected_connections() {
            let channels: Vec<ChannelConfig> = self
                .inner
                .hardware
                .sensors(chassis_id)
                .into_iter()
                .filter(|s| s.present && s.sensor_id != CHASSIS_SENSOR_ID)
                .filter(|s| (freq > 0 && s.is_zeroed()) || freq == 0 || force)
                .filter(|s| is_datatype_valid(s.sensor_id, datatype, self.developer_mode()))
                .map(|s| ChannelConfig {
                    sensor_id: s.sensor_id,
                    datatype,
                    freq,
                })
                .collect();
            if channels.is_empty() {
                debug!("Chassis {}: no sensors eligible for datatype {}", chassis_id, datatype);
                continue;
            }
            self.apply_channels(chassis_id, channels)?;
        }
        Ok(())
    }

    pub fn start_datatype(&self, datatype: i32) -> Result<(), FleetError> {
        self.quick_sensor_config(datatype, DEFAULT_SAMPLE_FREQ, false)
    }

    pub fn stop_datatype(&self, datatype: i32) -> Result<(), FleetError> {
        self.quick_sensor_config(datatype, 0, false)
    }

    /// 开环 Bz
    pub fn start_bz(&self) -> Result<(), FleetError> {
        self.start_datatype(DATATYPE_BZ_OPEN)
    }

    pub fn stop_bz(&self) -> Result<(), FleetError> {
        self.stop_datatype(DATATYPE_BZ_OPEN)
    }

    /// 各机箱自身的 ADC 通道
    pub fn start_adc(&self) -> Result<(), FleetError> {
        for (chassis_id, _) in self.inner.connected_connections() {
            self.configure_sensor(chassis_id, CHASSIS_SENSOR_ID, DATATYPE_ANALOG_IN, DEFAULT_SAMPLE_FREQ)?;
        }
        Ok(())
    }

    pub fn stop_adc(&self) -> Result<(), FleetError> {
        for (chassis_id, _) in self.inner.connected_connections() {
            self.configure_sensor(chassis_id, CHASSIS_SENSOR_ID, DATATYPE_ANALOG_IN, 0)?;
        }
        Ok(())
    }

    /// 已请求的通道配置
    pub fn sensor_config(&self) -> SensorConfigTable {
        self.inner.sensor_config.lock().clone()
    }

    /// 保存已请求的通道配置（JSON）
    pub fn save_sensor_config(&self, path: impl AsRef<Path>) -> Result<(), FleetError> {
        let text = serde_json::to_string_pretty(&self.sensor_config())?;
        std::fs::write(path.as_ref(), text)?;
        info!("Saved sensor configuration to {}", path.as_ref().display());
        Ok(())
    }

    /// 读取通道配置并下发给机群中的机箱（表中没有的机箱被跳过）
    pub fn load_sensor_config(&self, path: impl AsRef<Path>) -> Result<(), FleetError> {
        let text = std::fs::read_to_string(path.as_ref())?;
        let table: SensorConfigTable = serde_json::from_str(&text)?;
        let known = self.chassis_list();
        for (chassis_id, sensors) in table {
            if !known.contains_key(&chassis_id) {
                warn!("Sensor configuration for unknown chassis {} skipped", chassis_id);
                continue;
            }
            let channels: Vec<ChannelConfig> = sensors
                .into_iter()
                .flat_map(|(sensor_id, datatypes)| {
                    datatypes.into_iter().map(move |(datatype, freq)| ChannelConfig {
                        sensor_id,
                        datatype,
                        freq,
                    })
                })
                .filter(|c| c.freq > 0)
                .collect();
            self.configure_sensor_list(chassis_id, &channels)?;
        }
        Ok(())
    }

    // ==================== 传感器 ====================

    pub fn sensor(&self, chassis_id: u32, sensor_id: u8) -> Result<SensorInfo, FleetError> {
        self.inner
            .hardware
            .sensor(chassis_id, sensor_id)
            .ok_or(FleetError::UnknownSensor {
                chassis: chassis_id,
                sensor: sensor_id,
            })
    }

    /// 由 LED 推断的传感器状态
    pub fn sensor_state(&self, chassis_id: u32, sensor_id: u8) -> Result<Option<SensorLifecycle>, FleetError> {
        Ok(self.sensor(chassis_id, sensor_id)?.led_state())
    }

    /// 由状态事件驱动的生命周期状态
    pub fn sensor_lifecycle(&self, chassis_id: u32, sensor_id: u8) -> SensorLifecycle {
        self.inner.sensors.lock().state(chassis_id, sensor_id)
    }

    /// 传感器在本会话中是否仍然有效（未发生硬错误）
    pub fn is_sensor_valid(&self, chassis_id: u32, sensor_id: u8) -> bool {
        self.inner.sensors.lock().is_valid(chassis_id, sensor_id)
    }

    /// 开始新的传感器会话（生命周期与有效集合复位）
    pub fn reset_sensor_states(&self) {
        self.inner.sensors.lock().reset();
    }

    pub fn sensor_fields(&self, chassis_id: u32, sensor_id: u8) -> Result<Option<[f64; 3]>, FleetError> {
        Ok(self.sensor(chassis_id, sensor_id)?.fields)
    }

    /// (卡序列号, 传感器序列号)
    pub fn sensor_serials(
        &self,
        chassis_id: u32,
        sensor_id: u8,
    ) -> Result<(Option<u32>, Option<u32>), FleetError> {
        let sensor = self.sensor(chassis_id, sensor_id)?;
        Ok((sensor.card_serial, sensor.sensor_serial))
    }

    fn send_logic(&self, chassis_id: u32, sensors: &[u8], kind: LogicKind) -> Result<(), FleetError> {
        let tracker = self.inner.sensors.lock();
        let requests: Vec<LogicRequest> = sensors
            .iter()
            .filter(|&&s| {
                let valid = tracker.is_valid(chassis_id, s);
                if !valid && kind != LogicKind::SensorRestart {
                    debug!("Sensor {}:{} skipped, it failed this session", chassis_id, s);
                }
                valid || kind == LogicKind::SensorRestart
            })
            .map(|&sensor_id| LogicRequest { sensor_id, kind })
            .collect();
        drop(tracker);
        if requests.is_empty() {
            return Ok(());
        }
        self.inner.connection(chassis_id)?.logic(requests)?;
        Ok(())
    }

    pub fn restart_sensors(&self, chassis_id: u32, sensors: &[u8]) -> Result<(), FleetError> {
        self.send_logic(chassis_id, sensors, LogicKind::SensorRestart)
    }

    pub fn coarse_zero_sensors(&self, chassis_id: u32, sensors: &[u8]) -> Result<(), FleetError> {
        self.send_logic(chassis_id, sensors, LogicKind::SensorCoarseZero)
    }

    pub fn fine_zero_sensors(&self, chassis_id: u32, sensors: &[u8]) -> Result<(), FleetError> {
        self.send_logic(chassis_id, sensors, LogicKind::SensorFineZero)
    }

    pub fn turn_off_sensors(&self, chassis_id: u32, sensors: &[u8]) -> Result<(), FleetError> {
        self.send_logic(chassis_id, sensors, LogicKind::SensorOff)
    }

    pub fn send_wave(&self, chassis_id: u32, requests: Vec<WaveRequest>) -> Result<(), FleetError> {
        self.inner.connection(chassis_id)?.wave(requests)?;
        Ok(())
    }

    // ==================== 寄存器 ====================

    pub fn raw_write(&self, chassis_id: u32, sensor_id: u8, address: u32, data: u32) -> Result<(), FleetError> {
        self.inner.connection(chassis_id)?.raw_write(sensor_id, address, data)?;
        Ok(())
    }

    /// 结果通过 [`FleetCallbacks::on_raw_response`] 返回
    pub fn one_time_read(&self, chassis_id: u32, sensor_id: u8, address: u32) -> Result<(), FleetError> {
        self.inner.connection(chassis_id)?.one_time_read(sensor_id, address)?;
        Ok(())
    }

    pub fn reset_fpga(&self, chassis_id: u32) -> Result<(), FleetError> {
        self.inner.connection(chassis_id)?.reset_fpga()?;
        Ok(())
    }

    // ==================== 闭环 ====================

    /// 对所有已连接机箱设置闭环，各机箱状态复位为未知
    pub fn set_closed_loop(&self, closed: bool) {
        self.inner.set_closed_loop(closed);
    }

    // ==================== 开发者模式 ====================

    pub fn set_developer_mode(&self, enable: bool) {
        self.inner.developer_mode.store(enable, Ordering::Release);
        for (id, connection) in self.inner.connected_connections() {
            let result = if enable {
                connection.sensor_config_request()
            } else {
                connection.developer_mode(false, None)
            };
            if let Err(e) = result {
                warn!("Failed to switch developer mode on chassis {}: {}", id, e);
            }
        }
        info!("Developer mode {}", if enable { "on" } else { "off" });
    }

    /// 向所有机箱提交开发者口令（重连后自动重发）；结果通过
    /// [`FleetCallbacks::on_password_response`] 返回
    pub fn send_password(&self, password: &str) {
        *self.inner.password.lock() = Some(password.to_string());
        for (id, connection) in self.inner.connected_connections() {
            if let Err(e) = connection.developer_mode(true, Some(password.to_string())) {
                warn!("Failed to send password to chassis {}: {}", id, e);
            }
        }
    }

    // ==================== 固件更新 ====================

    /// 下发固件更新地址，记录各机箱当前的系统信息用于更新后核对
    pub fn send_update(&self, uri: &str) -> Result<(), FleetError> {
        let targets: Vec<(u32, String, Arc<ProtocolConnection>, Option<SystemStatus>)> = {
            let services = self.inner.services.lock();
            services
                .connected()
                .map(|(id, s)| {
                    let system = services.discovered.get(&s.name).and_then(|r| r.system.clone());
                    (id, s.name.clone(), s.connection.clone(), system)
                })
                .collect()
        };
        for (id, name, connection, system) in targets {
            if let Some(system) = system {
                self.inner.expect_reboot.lock().insert(name.clone(), system);
            }
            info!("Sending update {} to chassis {} ({})", uri, id, name);
            connection.update(uri)?;
        }
        Ok(())
    }

    /// 更新后机箱的编号、总数、主机与序列号保持不变
    pub fn verify_post_update(&self) -> bool {
        let expected = self.inner.expect_reboot.lock().clone();
        let services = self.inner.services.lock();
        expected.iter().all(|(name, before)| {
            let Some(after) = services.discovered.get(name).and_then(|r| r.system.as_ref()) else {
                warn!("Chassis {} has not reported since the update", name);
                return false;
            };
            let same = after.num == before.num
                && after.total == before.total
                && after.master == before.master
                && after.serial == before.serial;
            if !same {
                warn!("Chassis {} identity changed across the update", name);
            }
            same
        })
    }

    pub fn send_commit(&self) -> Result<(), FleetError> {
        for (_, connection) in self.inner.connected_connections() {
            connection.update_commit()?;
        }
        Ok(())
    }

    /// 结束更新流程
    pub fn complete_update(&self) {
        self.inner.expect_reboot.lock().clear();
    }

    pub fn send_reboot(&self) -> Result<(), FleetError> {
        let targets: Vec<(String, Arc<ProtocolConnection>, Option<SystemStatus>)> = {
            let services = self.inner.services.lock();
            services
                .connected()
                .map(|(_, s)| {
                    let system = services.discovered.get(&s.name).and_then(|r| r.system.clone());
                    (s.name.clone(), s.connection.clone(), system)
                })
                .collect()
        };
        for (name, connection, system) in targets {
            self.inner
                .expect_reboot
                .lock()
                .insert(name, system.unwrap_or_default());
            connection.reboot()?;
        }
        Ok(())
    }

    /// 所有（非旧型号、未在重启中的）机箱固件版本一致
    pub fn all_versions_equal(&self) -> bool {
        let rebooting = self.inner.expect_reboot.lock().clone();
        let services = self.inner.services.lock();
        let versions: BTreeSet<&str> = services
            .discovered
            .iter()
            .filter(|(name, r)| !r.info.legacy && !rebooting.contains_key(*name))
            .filter_map(|(_, r)| r.version())
            .collect();
        versions.len() <= 1
    }

    pub fn chassis_version(&self, chassis_id: u32) -> Option<String> {
        let services = self.inner.services.lock();
        let name = &services.sessions.get(&chassis_id)?.name;
        services.discovered.get(name)?.version().map(str::to_string)
    }

    // ==================== 识别 ====================

    /// 闪烁机箱识别灯（已连接时经会话，否则一次性连接）
    pub fn ident(&self, chassis_name: &str, on: bool) -> Result<(), FleetError> {
        let (connection, known) = {
            let services = self.inner.services.lock();
            let connection = services
                .id_of(chassis_name)
                .and_then(|id| services.connection(id))
                .filter(|c| c.is_connected());
            (connection, services.discovered.contains_key(chassis_name))
        };
        if let Some(connection) = connection {
            connection.identify(on)?;
            return Ok(());
        }
        if !known {
            return Err(FleetError::UnknownChassis(chassis_name.to_string()));
        }
        let endpoint = Endpoint::parse(chassis_name)
            .map_err(|_| FleetError::UnknownChassis(chassis_name.to_string()))?;
        one_shot_command(
            &*self.inner.connector,
            &*self.inner.codec,
            &endpoint,
            &Command::Identify(on),
            self.inner.config.connection.one_shot_timeout(),
        )?;
        Ok(())
    }

    // ==================== 关闭 ====================

    /// 停止数据流、关闭所有会话与后台线程（可重复调用）
    pub fn shutdown(&self) {
        if !self.inner.is_running.swap(false, Ordering::AcqRel) {
            return;
        }
        self.stop();

        let sessions = std::mem::take(&mut self.inner.services.lock().sessions);
        for (_, session) in sessions {
            session.connection.shutdown();
        }

        self.inner.shutdown_signal.set();
        for (name, slot) in [
            ("monitor", &self.monitor_thread),
            ("discovery", &self.discovery_thread),
        ] {
            if let Some(handle) = slot.lock().take()
                && let Err(_e) = handle.join_timeout(THREAD_JOIN_TIMEOUT)
            {
                error!(
                    "Fleet {} thread panicked or failed to shut down within {:?}",
                    name, THREAD_JOIN_TIMEOUT
                );
            }
        }
        info!("Fleet manager shut down");
    }
}

impl Drop for FleetManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for FleetManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FleetManager")
            .field("chassis", &self.chassis_list())
            .field("expected", &self.expected_count())
            .field("streaming", &self.is_streaming())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datatype_filter() {
        assert!(is_datatype_valid(0, 0, false));
        assert!(!is_datatype_valid(0, 28, false));
        assert!(is_datatype_valid(3, 28, false));
        assert!(is_datatype_valid(3, 50, false));
        assert!(!is_datatype_valid(3, 35, false));
        assert!(is_datatype_valid(3, 35, true));
        assert!(is_datatype_valid(0, 99, true));
    }
}
