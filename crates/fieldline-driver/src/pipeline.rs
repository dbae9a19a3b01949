//! Pipeline IO 循环模块
//!
//! 每个机箱会话由四个线程组成：
//!
//! - `session_loop`: 连接/重连监督，内联运行接收循环
//! - `tx_loop`: 从命令队列取出已编码的帧并发送（瞬时错误重试）
//! - `heartbeat_loop`: 每个心跳周期检查一次流量，必要时发送探测或判定超时
//! - `dispatch_loop`: 按到达顺序把状态记录、命令应答、状态变化交给上层处理器
//!
//! 接收循环从不调用上层代码，只向 `dispatch_loop` 投递事件，
//! 因此慢速的上层处理器不会阻塞套接字读取。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError};
use fieldline_net::{Connector, Endpoint, Transport, TransportError};
use fieldline_protocol::{
    Command, CommandResponse, FrameDecoder, MessageCodec, MessageType, ProtocolError, RawFrame,
    RawRegister, StatusPacket, encode_frame,
};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace, warn};

use crate::config::ConnectionConfig;
use crate::error::{DriverError, QueueError};
use crate::heartbeat::{HeartbeatMonitor, HeartbeatVerdict, ReconnectBackoff};
use crate::metrics::ConnectionMetrics;
use crate::ring_queue::QueueProducer;
use crate::signal::Event;
use crate::state::{AtomicConnectionState, ConnectionState};

/// 接收缓冲区大小
const RX_CHUNK_SIZE: usize = 16 * 1024;

/// 未连接时 TX 线程的轮询间隔
const TX_IDLE_POLL: Duration = Duration::from_millis(10);

/// 投递给上层处理器的事件
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    State(ConnectionState),
    Status(StatusPacket),
    RawRead(RawRegister),
    Password { enable: bool, valid: bool },
    BufferFull,
}

/// 会话共享上下文
pub struct SessionContext {
    pub endpoint: Endpoint,
    pub config: ConnectionConfig,
    pub codec: Arc<dyn MessageCodec>,
    pub state: AtomicConnectionState,
    /// 为 true 时 DATA 记录写入环形缓冲区
    pub streaming: AtomicBool,
    /// 运行标志（shutdown 时置 false）
    pub is_running: AtomicBool,
    /// 唤醒所有等待中的线程（shutdown）
    pub shutdown_signal: Event,
    /// 当前会话结束（触发重连）
    pub session_done: Event,
    /// 下一次连接前复位退避计数
    pub reset_backoff: AtomicBool,
    /// 其他线程均已退出后，分发线程排空事件并退出
    pub dispatch_stop: AtomicBool,
    pub heartbeat: HeartbeatMonitor,
    pub transport: Mutex<Option<Box<dyn Transport>>>,
    pub metrics: ConnectionMetrics,
    cmd_tx: Sender<Bytes>,
    events: Sender<SessionEvent>,
}

impl SessionContext {
    pub fn new(
        endpoint: Endpoint,
        config: ConnectionConfig,
        codec: Arc<dyn MessageCodec>,
        cmd_tx: Sender<Bytes>,
        events: Sender<SessionEvent>,
    ) -> Self {
        let heartbeat = HeartbeatMonitor::new(config.max_missed_heartbeats);
        Self {
            endpoint,
            config,
            codec,
            state: AtomicConnectionState::default(),
            streaming: AtomicBool::new(false),
            is_running: AtomicBool::new(true),
            shutdown_signal: Event::new(),
            session_done: Event::new(),
            reset_backoff: AtomicBool::new(false),
            dispatch_stop: AtomicBool::new(false),
            heartbeat,
            transport: Mutex::new(None),
            metrics: ConnectionMetrics::new(),
            cmd_tx,
            events,
        }
    }

    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::Acquire)
    }

    pub fn state(&self) -> ConnectionState {
        self.state.get(Ordering::Acquire)
    }

    /// 切换状态，状态确实变化时投递事件
    pub fn set_state(&self, state: ConnectionState) {
        let old = self.state.swap(state, Ordering::AcqRel);
        if old != state {
            trace!("{}: {} -> {}", self.endpoint, old, state);
            self.emit(SessionEvent::State(state));
        }
    }

    pub fn emit(&self, event: SessionEvent) {
        // 分发线程退出后接收端被丢弃，此时事件无人关心
        let _ = self.events.send(event);
    }

    /// 编码命令并放入发送队列
    pub fn enqueue(&self, command: &Command) -> Result<(), DriverError> {
        let payload = self.codec.encode_command(command)?;
        let frame = encode_frame(MessageType::Cmd, &payload)?;
        self.cmd_tx.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => DriverError::ChannelFull(self.config.command_queue_capacity),
            TrySendError::Disconnected(_) => DriverError::ChannelClosed,
        })
    }
}

/// 会话监督循环
///
/// 连接 → 运行接收循环 → 关闭 → 等待重连间隔 → 重连，直到 shutdown。
/// 连接失败按退避策略等待；会话结束后等待短间隔，`force_reconnect` 例外。
pub fn session_loop(ctx: Arc<SessionContext>, connector: Arc<dyn Connector>, producer: QueueProducer) {
    let config = &ctx.config;
    let mut backoff = ReconnectBackoff::new(
        config.reconnect_delay(),
        config.reconnect_long_delay(),
        config.reconnect_short_attempts,
    );
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; RX_CHUNK_SIZE];

    info!("Starting session thread for {}", ctx.endpoint);

    while ctx.is_running() {
        if ctx.reset_backoff.swap(false, Ordering::AcqRel) {
            backoff.reset();
        }

        ctx.set_state(ConnectionState::Connecting);
        let mut transport = match connector.connect(&ctx.endpoint, config.connect_timeout()) {
            Ok(transport) => transport,
            Err(e) => {
                ctx.metrics.connect_failures.fetch_add(1, Ordering::Relaxed);
                ctx.set_state(ConnectionState::Disconnected);
                let delay = backoff.next_delay();
                if backoff.failures() == config.reconnect_short_attempts.saturating_add(1) {
                    info!(
                        "Chassis {} not found, increasing reconnect delay to {:?}",
                        ctx.endpoint, delay
                    );
                }
                debug!(
                    "Connect to {} failed ({}), retry {} in {:?}",
                    ctx.endpoint,
                    e,
                    backoff.failures(),
                    delay
                );
                ctx.shutdown_signal.wait_timeout(delay);
                continue;
            },
        };

        if let Err(e) = transport.set_read_timeout(config.read_timeout()) {
            warn!("Failed to set read timeout for {}: {}", ctx.endpoint, e);
        }
        *ctx.transport.lock() = Some(transport);

        backoff.reset();
        ctx.heartbeat.reset();
        ctx.session_done.clear();
        decoder.reset();
        ctx.metrics.sessions.fetch_add(1, Ordering::Relaxed);

        info!("Connected to {}", ctx.endpoint);
        ctx.set_state(ConnectionState::Connected);
        if let Err(e) = ctx.enqueue(&Command::SystemStatusRequest) {
            warn!("Failed to queue system status request for {}: {}", ctx.endpoint, e);
        }

        rx_loop(&ctx, &producer, &mut decoder, &mut buf);

        // === 关闭会话 ===
        let expired = ctx.state() == ConnectionState::HeartbeatExpired;
        ctx.set_state(ConnectionState::Closing);
        if let Some(mut transport) = ctx.transport.lock().take() {
            transport.shutdown();
        }
        ctx.set_state(ConnectionState::Disconnected);

        if !ctx.is_running() {
            break;
        }
        if expired {
            info!("Heartbeat expired for {}, reconnecting", ctx.endpoint);
        } else {
            info!("Session with {} ended, reconnecting", ctx.endpoint);
        }

        // force_reconnect 要求立即重连，其余情况先等待一个重连间隔
        if !ctx.reset_backoff.load(Ordering::Acquire) {
            let delay = config.reconnect_delay();
            debug!("Waiting {:?} before reconnecting to {}", delay, ctx.endpoint);
            ctx.shutdown_signal.wait_timeout(delay);
        }
    }

    ctx.set_state(ConnectionState::Disconnected);
    trace!("Session thread for {}: loop exited", ctx.endpoint);
}

/// 接收循环
///
/// 每次读取后尽可能多地切出完整帧，按到达顺序处理。
/// 读超时只用于观察关闭信号；对端关闭、读错误或协议错误都会结束当前会话。
///
/// TLS 流不能拆成独立的读写两半，`recv` 期间持有传输锁，
/// 因此空闲链路上发送命令的延迟上限是 [`ConnectionConfig::read_timeout_ms`]。
pub fn rx_loop(
    ctx: &SessionContext,
    producer: &QueueProducer,
    decoder: &mut FrameDecoder,
    buf: &mut [u8],
) {
    loop {
        if !ctx.is_running() || ctx.session_done.is_set() {
            break;
        }

        producer.service_clear();

        let result = {
            let mut guard = ctx.transport.lock();
            match guard.as_mut() {
                Some(transport) => transport.recv(buf),
                None => break,
            }
        };

        match result {
            Ok(0) | Err(TransportError::Closed) => {
                info!("Connection closed by {}", ctx.endpoint);
                ctx.session_done.set();
                break;
            },
            Ok(n) => decoder.extend(&buf[..n]),
            Err(TransportError::Timeout) => continue,
            Err(e) => {
                warn!("Read error from {}: {}", ctx.endpoint, e);
                ctx.session_done.set();
                break;
            },
        }

        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(e) = handle_frame(ctx, producer, frame) {
                        error!("Malformed record from {}, closing session: {}", ctx.endpoint, e);
                        ctx.session_done.set();
                        return;
                    }
                },
                Ok(None) => break,
                Err(e) => {
                    error!("Framing error from {}, closing session: {}", ctx.endpoint, e);
                    ctx.session_done.set();
                    return;
                },
            }
        }
    }

    trace!("RX loop for {}: exited", ctx.endpoint);
}

fn handle_frame(
    ctx: &SessionContext,
    producer: &QueueProducer,
    frame: RawFrame,
) -> Result<(), ProtocolError> {
    ctx.heartbeat.register_message();
    ctx.metrics.frames_received.fetch_add(1, Ordering::Relaxed);

    match frame.message_type {
        MessageType::Data => {
            let packet = ctx.codec.decode_data(&frame.payload)?;
            if !ctx.streaming.load(Ordering::Acquire) {
                // 空闲机箱仍可能发出一个起始标记帧
                ctx.metrics.data_ignored.fetch_add(1, Ordering::Relaxed);
                trace!("Ignoring data packet from {} while not streaming", ctx.endpoint);
                return Ok(());
            }
            match producer.put(&packet) {
                Ok(()) => {
                    ctx.metrics.data_queued.fetch_add(1, Ordering::Relaxed);
                },
                Err(e @ QueueError::Full { .. }) => {
                    error!("{} for {}, stopping streaming", e, ctx.endpoint);
                    ctx.metrics.data_overflows.fetch_add(1, Ordering::Relaxed);
                    ctx.streaming.store(false, Ordering::Release);
                    ctx.emit(SessionEvent::BufferFull);
                },
                Err(e) => {
                    error!("Failed to queue data from {}: {}", ctx.endpoint, e);
                },
            }
        },
        MessageType::Status => {
            let status = ctx.codec.decode_status(&frame.payload)?;
            ctx.metrics.status_received.fetch_add(1, Ordering::Relaxed);
            ctx.emit(SessionEvent::Status(status));
        },
        MessageType::Cmd => match ctx.codec.decode_response(&frame.payload)? {
            CommandResponse::RawRead(register) => ctx.emit(SessionEvent::RawRead(register)),
            CommandResponse::DeveloperMode { enable, valid } => {
                ctx.emit(SessionEvent::Password { enable, valid })
            },
            CommandResponse::Other(code) => {
                warn!("Ignoring command response {:?} from {}", code, ctx.endpoint);
            },
        },
    }
    Ok(())
}

/// TX 线程主循环
///
/// 只在会话已建立时取出命令；未连接期间命令保留在队列中。
pub fn tx_loop(ctx: Arc<SessionContext>, cmd_rx: Receiver<Bytes>) {
    let mut pending: Option<Bytes> = None;

    while ctx.is_running() {
        if !ctx.state().is_connected() {
            ctx.shutdown_signal.wait_timeout(TX_IDLE_POLL);
            continue;
        }

        let frame = match pending.take() {
            Some(frame) => frame,
            None => match cmd_rx.recv_timeout(ctx.config.read_timeout()) {
                Ok(frame) => frame,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    trace!("TX thread for {}: command channel disconnected", ctx.endpoint);
                    break;
                },
            },
        };

        if !ctx.state().is_connected() {
            pending = Some(frame);
            continue;
        }

        match send_with_retries(&ctx, &frame) {
            Ok(()) => {
                ctx.metrics.commands_sent.fetch_add(1, Ordering::Relaxed);
            },
            Err(e) => {
                error!("Failed to send command to {}: {}", ctx.endpoint, e);
                ctx.metrics.command_failures.fetch_add(1, Ordering::Relaxed);
                ctx.session_done.set();
            },
        }
    }

    trace!("TX thread for {}: loop exited", ctx.endpoint);
}

fn send_with_retries(ctx: &SessionContext, frame: &[u8]) -> Result<(), TransportError> {
    let attempts = ctx.config.send_retries.max(1);
    let mut last_error = TransportError::Closed;
    for attempt in 1..=attempts {
        let result = match ctx.transport.lock().as_mut() {
            Some(transport) => transport.send_all(frame),
            None => return Err(TransportError::Closed),
        };
        match result {
            Ok(()) => return Ok(()),
            Err(e) if e.is_transient() => {
                warn!(
                    "Send to {} failed (attempt {}/{}): {}",
                    ctx.endpoint, attempt, attempts, e
                );
                last_error = e;
            },
            Err(e) => return Err(e),
        }
    }
    Err(last_error)
}

/// 心跳线程主循环
pub fn heartbeat_loop(ctx: Arc<SessionContext>) {
    let interval = ctx.config.heartbeat_interval();

    while ctx.is_running() {
        if ctx.shutdown_signal.wait_timeout(interval) {
            break;
        }
        if !ctx.state().is_connected() {
            ctx.heartbeat.reset();
            continue;
        }

        match ctx.heartbeat.tick() {
            HeartbeatVerdict::Alive => {},
            HeartbeatVerdict::Probe { missed } => {
                debug!("No message from {} for {} interval(s), probing", ctx.endpoint, missed);
                if let Err(e) = ctx.enqueue(&Command::StatusRequest) {
                    warn!("Failed to queue heartbeat probe for {}: {}", ctx.endpoint, e);
                }
            },
            HeartbeatVerdict::Expired { missed } => {
                if ctx
                    .state
                    .compare_exchange(
                        ConnectionState::Connected,
                        ConnectionState::HeartbeatExpired,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    warn!(
                        "Heartbeat expired for {} after {} silent intervals",
                        ctx.endpoint, missed
                    );
                    ctx.metrics.heartbeat_expirations.fetch_add(1, Ordering::Relaxed);
                    ctx.emit(SessionEvent::State(ConnectionState::HeartbeatExpired));
                }
                ctx.session_done.set();
            },
        }
    }

    trace!("Heartbeat thread for {}: loop exited", ctx.endpoint);
}

/// 事件分发循环
pub fn dispatch_loop(
    ctx: Arc<SessionContext>,
    events: Receiver<SessionEvent>,
    handler: Arc<dyn crate::ConnectionHandler>,
) {
    loop {
        match events.recv_timeout(Duration::from_millis(50)) {
            Ok(event) => deliver(&ctx.endpoint, handler.as_ref(), event),
            Err(RecvTimeoutError::Timeout) => {
                if ctx.dispatch_stop.load(Ordering::Acquire) {
                    break;
                }
            },
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    trace!("Dispatch thread for {}: loop exited", ctx.endpoint);
}

fn deliver(endpoint: &Endpoint, handler: &dyn crate::ConnectionHandler, event: SessionEvent) {
    match event {
        SessionEvent::State(state) => handler.on_state_changed(endpoint, state),
        SessionEvent::Status(status) => handler.on_status(endpoint, status),
        SessionEvent::RawRead(register) => handler.on_raw_response(endpoint, register),
        SessionEvent::Password { enable, valid } => {
            handler.on_password_response(endpoint, enable, valid)
        },
        SessionEvent::BufferFull => handler.on_buffer_full(endpoint),
    }
}
