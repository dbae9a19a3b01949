//! Mock 传输与模拟机箱
//!
//! [`MockConnector`] 把 `connect` 路由到已注册的 [`MockChassis`]，两端之间是
//! 内存中的双工字节通道。模拟机箱在后台线程中应答状态请求、通道配置、
//! 原始读与开发者模式命令，并记录收到的全部命令；测试可以主动推送
//! STATUS/DATA 帧或断开连接。

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use fieldline_protocol::{
    BinaryCodec, Command, CommandResponse, DataPacket, FrameDecoder, MessageType, SensorConfigEntry,
    StatusBody, StatusPacket, SystemStatus, encode_frame,
};
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::{Connector, Endpoint, Transport, TransportError};

type Link = (Sender<Vec<u8>>, Receiver<Vec<u8>>);

/// 客户端侧的内存传输
pub struct MockTransport {
    tx: Option<Sender<Vec<u8>>>,
    rx: Receiver<Vec<u8>>,
    leftover: Vec<u8>,
    read_timeout: Duration,
}

impl Transport for MockTransport {
    fn send_all(&mut self, data: &[u8]) -> Result<(), TransportError> {
        let tx = self.tx.as_ref().ok_or(TransportError::Closed)?;
        tx.send(data.to_vec()).map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock chassis hung up",
            ))
        })
    }

    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        if self.leftover.is_empty() {
            match self.rx.recv_timeout(self.read_timeout) {
                Ok(chunk) => self.leftover = chunk,
                Err(RecvTimeoutError::Timeout) => return Err(TransportError::Timeout),
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = buf.len().min(self.leftover.len());
        buf[..n].copy_from_slice(&self.leftover[..n]);
        self.leftover.drain(..n);
        Ok(n)
    }

    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError> {
        self.read_timeout = timeout;
        Ok(())
    }

    fn shutdown(&mut self) {
        self.tx = None;
    }
}

#[derive(Default)]
struct Registry {
    chassis: HashMap<Endpoint, Sender<Link>>,
}

/// 把连接请求路由到模拟机箱的连接器
#[derive(Clone, Default)]
pub struct MockConnector {
    registry: Arc<Mutex<Registry>>,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, endpoint: Endpoint) -> Receiver<Link> {
        let (tx, rx) = unbounded();
        self.registry.lock().chassis.insert(endpoint, tx);
        rx
    }
}

impl Connector for MockConnector {
    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError> {
        let accept = self
            .registry
            .lock()
            .chassis
            .get(endpoint)
            .cloned()
            .ok_or_else(|| {
                TransportError::Io(std::io::Error::new(
                    std::io::ErrorKind::ConnectionRefused,
                    format!("no mock chassis at {endpoint}"),
                ))
            })?;

        let (client_tx, device_rx) = unbounded();
        let (device_tx, client_rx) = unbounded();
        accept.send((device_tx, device_rx)).map_err(|_| {
            TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("mock chassis at {endpoint} is gone"),
            ))
        })?;

        Ok(Box::new(MockTransport {
            tx: Some(client_tx),
            rx: client_rx,
            leftover: Vec::new(),
            read_timeout: timeout,
        }))
    }
}

struct ChassisShared {
    name: String,
    system: Mutex<SystemStatus>,
    channels: Mutex<Vec<SensorConfigEntry>>,
    received: Mutex<Vec<Command>>,
    outbound: Mutex<Option<Sender<Vec<u8>>>>,
    accepting: AtomicBool,
    responsive: AtomicBool,
    dev_password: Mutex<String>,
    connections: AtomicUsize,
    running: AtomicBool,
}

/// 模拟机箱
pub struct MockChassis {
    shared: Arc<ChassisShared>,
    codec: BinaryCodec,
    handle: Option<JoinHandle<()>>,
}

impl MockChassis {
    /// 在 `connector` 上注册一个模拟机箱并启动应答线程
    pub fn spawn(connector: &MockConnector, endpoint: Endpoint, system: SystemStatus) -> Self {
        let name = endpoint.to_string();
        let accept = connector.register(endpoint);
        let shared = Arc::new(ChassisShared {
            name,
            system: Mutex::new(system),
            channels: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            outbound: Mutex::new(None),
            accepting: AtomicBool::new(true),
            responsive: AtomicBool::new(true),
            dev_password: Mutex::new(String::from("fieldline")),
            connections: AtomicUsize::new(0),
            running: AtomicBool::new(true),
        });

        let thread_shared = shared.clone();
        let handle = thread::Builder::new()
            .name(format!("mock-chassis-{}", shared.name))
            .spawn(move || device_loop(thread_shared, accept))
            .ok();

        Self {
            shared,
            codec: BinaryCodec,
            handle,
        }
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// 累计接受的连接数
    pub fn connection_count(&self) -> usize {
        self.shared.connections.load(Ordering::SeqCst)
    }

    pub fn is_connected(&self) -> bool {
        self.shared.outbound.lock().is_some()
    }

    /// 为 `false` 时拒绝新连接（模拟机箱离线）
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// 为 `false` 时不再应答任何命令（模拟心跳丢失）
    pub fn set_responsive(&self, responsive: bool) {
        self.shared.responsive.store(responsive, Ordering::SeqCst);
    }

    pub fn set_system_status(&self, system: SystemStatus) {
        *self.shared.system.lock() = system;
    }

    pub fn set_dev_password(&self, password: &str) {
        *self.shared.dev_password.lock() = password.to_string();
    }

    /// 收到的全部命令（按到达顺序）
    pub fn received(&self) -> Vec<Command> {
        self.shared.received.lock().clone()
    }

    /// 当前激活的通道表
    pub fn channels(&self) -> Vec<SensorConfigEntry> {
        self.shared.channels.lock().clone()
    }

    /// 等待满足条件的命令出现
    pub fn wait_for_command(
        &self,
        timeout: Duration,
        mut predicate: impl FnMut(&Command) -> bool,
    ) -> Option<Command> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(cmd) = self.shared.received.lock().iter().find(|c| predicate(c)) {
                return Some(cmd.clone());
            }
            if Instant::now() >= deadline {
                return None;
            }
            thread::sleep(Duration::from_millis(5));
        }
    }

    /// 主动断开当前连接（客户端读到 0 字节）
    pub fn drop_connection(&self) {
        if self.shared.outbound.lock().take().is_some() {
            debug!("Mock chassis {} dropped its connection", self.shared.name);
        }
    }

    pub fn send_status(&self, body: StatusBody) -> bool {
        let packet = StatusPacket::new(self.shared.name.clone(), body);
        self.send_status_packet(&packet)
    }

    pub fn send_status_packet(&self, packet: &StatusPacket) -> bool {
        match self.codec.encode_status(packet) {
            Ok(payload) => send_frame(&self.shared, MessageType::Status, &payload),
            Err(_) => false,
        }
    }

    pub fn send_data(&self, packet: &DataPacket) -> bool {
        let payload = self.codec.encode_data(packet);
        send_frame(&self.shared, MessageType::Data, &payload)
    }

    /// 发送原始字节（用于构造非法帧）
    pub fn send_raw(&self, bytes: &[u8]) -> bool {
        match self.shared.outbound.lock().as_ref() {
            Some(tx) => tx.send(bytes.to_vec()).is_ok(),
            None => false,
        }
    }
}

impl Drop for MockChassis {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::SeqCst);
        self.drop_connection();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn send_frame(shared: &ChassisShared, message_type: MessageType, payload: &[u8]) -> bool {
    let Ok(frame) = encode_frame(message_type, payload) else {
        return false;
    };
    match shared.outbound.lock().as_ref() {
        Some(tx) => tx.send(frame.to_vec()).is_ok(),
        None => false,
    }
}

fn device_loop(shared: Arc<ChassisShared>, accept: Receiver<Link>) {
    let codec = BinaryCodec;
    let mut inbound: Option<Receiver<Vec<u8>>> = None;
    let mut decoder = FrameDecoder::new();

    while shared.running.load(Ordering::SeqCst) {
        // 新连接替换旧连接
        match accept.recv_timeout(Duration::from_millis(5)) {
            Ok((tx, rx)) => {
                if shared.accepting.load(Ordering::SeqCst) {
                    *shared.outbound.lock() = Some(tx);
                    inbound = Some(rx);
                    decoder.reset();
                    shared.connections.fetch_add(1, Ordering::SeqCst);
                    trace!("Mock chassis {} accepted a connection", shared.name);
                }
                // 拒绝时直接丢弃两端，客户端读到 0 字节
            },
            Err(RecvTimeoutError::Timeout) => {},
            Err(RecvTimeoutError::Disconnected) => break,
        }

        if shared.outbound.lock().is_none() {
            inbound = None;
        }
        let Some(rx) = inbound.as_ref() else {
            continue;
        };

        match rx.recv_timeout(Duration::from_millis(5)) {
            Ok(bytes) => decoder.extend(&bytes),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => {
                shared.outbound.lock().take();
                inbound = None;
                continue;
            },
        }

        while let Ok(Some(frame)) = decoder.next_frame() {
            if frame.message_type != MessageType::Cmd {
                continue;
            }
            let Ok(command) = codec.decode_command(&frame.payload) else {
                continue;
            };
            shared.received.lock().push(command.clone());
            if shared.responsive.load(Ordering::SeqCst) {
                respond(&shared, &codec, &command);
            }
        }
    }
}

fn respond(shared: &ChassisShared, codec: &BinaryCodec, command: &Command) {
    let status = |body: StatusBody| {
        let packet = StatusPacket::new(shared.name.clone(), body);
        if let Ok(payload) = codec.encode_status(&packet) {
            send_frame(shared, MessageType::Status, &payload);
        }
    };

    match command {
        Command::StatusRequest => status(StatusBody::Status),
        Command::SystemStatusRequest => {
            status(StatusBody::SystemStatus(shared.system.lock().clone()))
        },
        Command::SensorConfigRequest => status(StatusBody::SensorConfig(shared.channels.lock().clone())),
        Command::ConfigList(list) => {
            let table = {
                let mut channels = shared.channels.lock();
                for c in list {
                    channels.retain(|e| !(e.sensor_id == c.sensor_id && e.datatype == c.datatype));
                    if c.freq > 0 {
                        channels.push(SensorConfigEntry {
                            sensor_id: c.sensor_id,
                            datatype: c.datatype,
                            freq: c.freq,
                            calibration: Some(1.0),
                        });
                    }
                }
                channels.clone()
            };
            status(StatusBody::SensorConfig(table));
        },
        Command::OneTimeRead(reg) => {
            let mut reg = *reg;
            reg.data = reg.register_address.wrapping_mul(2);
            let payload = codec.encode_response(command.code(), &CommandResponse::RawRead(reg));
            send_frame(shared, MessageType::Cmd, &payload);
        },
        Command::DeveloperMode { enable, password } => {
            let valid = !*enable || password.as_deref() == Some(shared.dev_password.lock().as_str());
            let payload = codec.encode_response(
                command.code(),
                &CommandResponse::DeveloperMode {
                    enable: *enable,
                    valid,
                },
            );
            send_frame(shared, MessageType::Cmd, &payload);
        },
        _ => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldline_protocol::MessageCodec;

    fn system(num: u32, total: u32) -> SystemStatus {
        SystemStatus {
            num,
            total,
            version: "4.1".into(),
            master: "FLM0117".into(),
            serial: "FLC0217".into(),
        }
    }

    fn read_frame(transport: &mut dyn Transport) -> Option<fieldline_protocol::RawFrame> {
        let mut decoder = FrameDecoder::new();
        let mut buf = [0u8; 256];
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Ok(Some(frame)) = decoder.next_frame() {
                return Some(frame);
            }
            match transport.recv(&mut buf) {
                Ok(0) => return None,
                Ok(n) => decoder.extend(&buf[..n]),
                Err(TransportError::Timeout) => {},
                Err(_) => return None,
            }
        }
        None
    }

    #[test]
    fn test_unknown_endpoint_is_refused() {
        let connector = MockConnector::new();
        let result = connector.connect(&Endpoint::new("10.0.0.9", 7777), Duration::from_millis(10));
        assert!(matches!(result, Err(TransportError::Io(_))));
    }

    #[test]
    fn test_chassis_answers_system_status_request() {
        let connector = MockConnector::new();
        let ep = Endpoint::new("10.0.0.1", 7777);
        let chassis = MockChassis::spawn(&connector, ep.clone(), system(1, 2));

        let mut transport = connector.connect(&ep, Duration::from_millis(50)).unwrap();
        let cmd = BinaryCodec.encode_command(&Command::SystemStatusRequest).unwrap();
        transport
            .send_all(&encode_frame(MessageType::Cmd, &cmd).unwrap())
            .unwrap();

        let frame = read_frame(transport.as_mut()).unwrap();
        assert_eq!(frame.message_type, MessageType::Status);
        let status = BinaryCodec.decode_status(&frame.payload).unwrap();
        assert_eq!(status.body, StatusBody::SystemStatus(system(1, 2)));
        assert_eq!(chassis.received(), vec![Command::SystemStatusRequest]);
        assert_eq!(chassis.connection_count(), 1);
    }

    #[test]
    fn test_drop_connection_reads_as_eof() {
        let connector = MockConnector::new();
        let ep = Endpoint::new("10.0.0.2", 7777);
        let chassis = MockChassis::spawn(&connector, ep.clone(), system(1, 1));
        let mut transport = connector.connect(&ep, Duration::from_millis(20)).unwrap();

        let deadline = Instant::now() + Duration::from_secs(1);
        while !chassis.is_connected() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        chassis.drop_connection();

        let mut buf = [0u8; 16];
        assert_eq!(transport.recv(&mut buf).unwrap(), 0);
    }
}
