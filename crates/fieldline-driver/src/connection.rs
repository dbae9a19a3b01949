//! 机箱会话对象
//!
//! [`ProtocolConnection`] 拥有一个机箱的全部 IO 线程、命令队列与数据环形缓冲区，
//! 在后台自动完成连接、心跳监督与重连。

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, unbounded};
use fieldline_net::{Connector, Endpoint};
use fieldline_protocol::{
    ChannelConfig, Command, LogicRequest, MessageCodec, RawRegister, StatusPacket, WaveRequest,
};
use parking_lot::Mutex;
use tracing::{debug, error, info};

use crate::builder::ConnectionBuilder;
use crate::config::ConnectionConfig;
use crate::error::DriverError;
use crate::metrics::MetricsSnapshot;
use crate::pipeline::{SessionContext, dispatch_loop, heartbeat_loop, session_loop, tx_loop};
use crate::ring_queue::RingBufferQueue;
use crate::signal::JoinTimeout;
use crate::state::ConnectionState;

/// 会话事件处理器
///
/// 所有回调都在同一个分发线程中按到达顺序调用，不会并发。
/// 回调中可以安全地调用 [`ProtocolConnection`] 的命令方法。
pub trait ConnectionHandler: Send + Sync {
    /// 会话状态变化
    fn on_state_changed(&self, _endpoint: &Endpoint, _state: ConnectionState) {}

    /// 收到状态记录
    fn on_status(&self, _endpoint: &Endpoint, _status: StatusPacket) {}

    /// 一次性寄存器读的应答
    fn on_raw_response(&self, _endpoint: &Endpoint, _register: RawRegister) {}

    /// 开发者模式口令校验结果
    fn on_password_response(&self, _endpoint: &Endpoint, _enable: bool, _valid: bool) {}

    /// 环形缓冲区已满，数据流已被自动关闭
    fn on_buffer_full(&self, _endpoint: &Endpoint) {}
}

/// 不处理任何事件
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ConnectionHandler for NoopHandler {}

const JOIN_TIMEOUT: Duration = Duration::from_secs(2);

/// 单个机箱的协议会话
///
/// 创建后立即在后台连接；连接失败或会话中断时按退避策略重连，直到 [`shutdown`](Self::shutdown)。
pub struct ProtocolConnection {
    ctx: Arc<SessionContext>,
    queue: RingBufferQueue,
    threads: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl ProtocolConnection {
    pub fn builder(endpoint: Endpoint) -> ConnectionBuilder {
        ConnectionBuilder::new(endpoint)
    }

    /// 使用给定的传输层、编解码器与处理器启动会话
    pub fn start(
        endpoint: Endpoint,
        connector: Arc<dyn Connector>,
        codec: Arc<dyn MessageCodec>,
        handler: Arc<dyn ConnectionHandler>,
        queue: RingBufferQueue,
        config: ConnectionConfig,
    ) -> Result<Self, DriverError> {
        let (cmd_tx, cmd_rx) = bounded(config.command_queue_capacity.max(1));
        let (event_tx, event_rx) = unbounded();
        let ctx = Arc::new(SessionContext::new(
            endpoint.clone(),
            config,
            codec,
            cmd_tx,
            event_tx,
        ));

        let connection = Self {
            ctx: ctx.clone(),
            queue: queue.clone(),
            threads: Mutex::new(Vec::with_capacity(4)),
        };

        // 分发线程最先启动，保证第一个状态事件有人接收
        let dispatch_ctx = ctx.clone();
        connection.spawn_thread("dispatch", move || {
            dispatch_loop(dispatch_ctx, event_rx, handler)
        })?;

        let tx_ctx = ctx.clone();
        connection.spawn_thread("tx", move || tx_loop(tx_ctx, cmd_rx))?;

        let heartbeat_ctx = ctx.clone();
        connection.spawn_thread("heartbeat", move || heartbeat_loop(heartbeat_ctx))?;

        let producer = queue.producer();
        let session_ctx = ctx;
        connection.spawn_thread("session", move || {
            session_loop(session_ctx, connector, producer)
        })?;

        info!("Protocol connection to {} started", endpoint);
        Ok(connection)
    }

    fn spawn_thread<F>(&self, role: &'static str, body: F) -> Result<(), DriverError>
    where
        F: FnOnce() + Send + 'static,
    {
        let handle = std::thread::Builder::new()
            .name(format!("fl-{}-{}", role, self.ctx.endpoint.host))
            .spawn(body)
            .map_err(|e| DriverError::IoThread(format!("failed to spawn {} thread: {}", role, e)))?;
        self.threads.lock().push((role, handle));
        Ok(())
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.ctx.endpoint
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.ctx.config
    }

    pub fn state(&self) -> ConnectionState {
        self.ctx.state()
    }

    pub fn is_connected(&self) -> bool {
        self.ctx.state().is_connected()
    }

    /// 开启/关闭数据记录入队
    pub fn set_streaming(&self, streaming: bool) {
        self.ctx.streaming.store(streaming, Ordering::Release);
    }

    pub fn is_streaming(&self) -> bool {
        self.ctx.streaming.load(Ordering::Acquire)
    }

    /// 本会话的数据环形缓冲区（消费端）
    pub fn queue(&self) -> &RingBufferQueue {
        &self.queue
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.ctx.metrics.snapshot()
    }

    /// 放入命令队列（非阻塞）
    pub fn send(&self, command: Command) -> Result<(), DriverError> {
        if !self.ctx.is_running() {
            return Err(DriverError::ChannelClosed);
        }
        self.ctx.enqueue(&command)
    }

    pub fn status_request(&self) -> Result<(), DriverError> {
        self.send(Command::StatusRequest)
    }

    pub fn system_status_request(&self) -> Result<(), DriverError> {
        self.send(Command::SystemStatusRequest)
    }

    pub fn reset_fpga(&self) -> Result<(), DriverError> {
        self.send(Command::ResetFpga)
    }

    pub fn sensor_config_request(&self) -> Result<(), DriverError> {
        self.send(Command::SensorConfigRequest)
    }

    pub fn config_list(&self, channels: Vec<ChannelConfig>) -> Result<(), DriverError> {
        self.send(Command::ConfigList(channels))
    }

    pub fn raw_write(&self, sensor: u8, register_address: u32, data: u32) -> Result<(), DriverError> {
        self.send(Command::raw_write(sensor, register_address, data))
    }

    /// 一次性寄存器读；结果通过 [`ConnectionHandler::on_raw_response`] 返回
    pub fn one_time_read(&self, sensor: u8, register_address: u32) -> Result<(), DriverError> {
        self.send(Command::one_time_read(sensor, register_address))
    }

    pub fn logic(&self, requests: Vec<LogicRequest>) -> Result<(), DriverError> {
        self.send(Command::Logic(requests))
    }

    pub fn wave(&self, requests: Vec<WaveRequest>) -> Result<(), DriverError> {
        self.send(Command::Wave(requests))
    }

    pub fn closed_loop(&self, enable: bool) -> Result<(), DriverError> {
        self.send(Command::ClosedLoop(enable))
    }

    /// 开发者模式；结果通过 [`ConnectionHandler::on_password_response`] 返回
    pub fn developer_mode(&self, enable: bool, password: Option<String>) -> Result<(), DriverError> {
        self.send(Command::DeveloperMode { enable, password })
    }

    pub fn update(&self, uri: impl Into<String>) -> Result<(), DriverError> {
        self.send(Command::Update { uri: uri.into() })
    }

    pub fn update_commit(&self) -> Result<(), DriverError> {
        self.send(Command::UpdateCommit)
    }

    pub fn reboot(&self) -> Result<(), DriverError> {
        self.send(Command::Reboot)
    }

    pub fn identify(&self, on: bool) -> Result<(), DriverError> {
        self.send(Command::Identify(on))
    }

    /// 立即结束当前会话并重连（退避计数清零）
    pub fn force_reconnect(&self) {
        self.ctx.reset_backoff.store(true, Ordering::Release);
        self.ctx.session_done.set();
    }

    /// 停止所有线程（可重复调用）
    pub fn shutdown(&self) {
        let threads = std::mem::take(&mut *self.threads.lock());
        if threads.is_empty() {
            return;
        }

        self.ctx.is_running.store(false, Ordering::Release);
        self.ctx.session_done.set();
        self.ctx.shutdown_signal.set();

        let mut dispatch = None;
        for (role, handle) in threads {
            if role == "dispatch" {
                dispatch = Some(handle);
                continue;
            }
            if let Err(_e) = handle.join_timeout(JOIN_TIMEOUT) {
                error!(
                    "{} thread for {} panicked or failed to shut down within {:?}",
                    role, self.ctx.endpoint, JOIN_TIMEOUT
                );
            }
        }

        // 其他线程退出后再停止分发线程，最后的 Disconnected 事件也能送达
        self.ctx.dispatch_stop.store(true, Ordering::Release);
        if let Some(handle) = dispatch {
            if handle.thread().id() == std::thread::current().id() {
                // 在处理器回调中释放了最后一个引用：回调返回后分发线程自行退出
                debug!("Dispatch thread for {} detached", self.ctx.endpoint);
            } else if let Err(_e) = handle.join_timeout(JOIN_TIMEOUT) {
                error!(
                    "dispatch thread for {} panicked or failed to shut down within {:?}",
                    self.ctx.endpoint, JOIN_TIMEOUT
                );
            }
        }

        info!("Protocol connection to {} shut down", self.ctx.endpoint);
    }
}

impl Drop for ProtocolConnection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ProtocolConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolConnection")
            .field("endpoint", &self.ctx.endpoint)
            .field("state", &self.state())
            .field("streaming", &self.is_streaming())
            .finish()
    }
}
