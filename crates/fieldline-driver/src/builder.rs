//! 会话构建器

use std::sync::Arc;

use fieldline_net::{Connector, Endpoint, TlsConnector};
use fieldline_protocol::{BinaryCodec, MessageCodec};

use crate::config::ConnectionConfig;
use crate::connection::{ConnectionHandler, NoopHandler, ProtocolConnection};
use crate::error::DriverError;
use crate::ring_queue::RingBufferQueue;

/// 会话构建器
///
/// # Example
///
/// ```no_run
/// use fieldline_driver::ProtocolConnection;
/// use fieldline_net::Endpoint;
///
/// let connection = ProtocolConnection::builder(Endpoint::new("192.168.2.43", 7777))
///     .build()?;
/// connection.sensor_config_request()?;
/// # Ok::<(), fieldline_driver::DriverError>(())
/// ```
pub struct ConnectionBuilder {
    endpoint: Endpoint,
    config: ConnectionConfig,
    connector: Option<Arc<dyn Connector>>,
    codec: Option<Arc<dyn MessageCodec>>,
    handler: Option<Arc<dyn ConnectionHandler>>,
    queue: Option<RingBufferQueue>,
}

impl ConnectionBuilder {
    pub fn new(endpoint: Endpoint) -> Self {
        Self {
            endpoint,
            config: ConnectionConfig::default(),
            connector: None,
            codec: None,
            handler: None,
            queue: None,
        }
    }

    pub fn config(mut self, config: ConnectionConfig) -> Self {
        self.config = config;
        self
    }

    /// 传输层（默认 [`TlsConnector`]）
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// 负载编解码器（默认 [`BinaryCodec`]）
    pub fn codec(mut self, codec: Arc<dyn MessageCodec>) -> Self {
        self.codec = Some(codec);
        self
    }

    pub fn handler(mut self, handler: Arc<dyn ConnectionHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    /// 使用已有的环形缓冲区（默认按 `config.queue_capacity` 新建）
    pub fn queue(mut self, queue: RingBufferQueue) -> Self {
        self.queue = Some(queue);
        self
    }

    /// 启动会话线程
    pub fn build(self) -> Result<ProtocolConnection, DriverError> {
        let connector = match self.connector {
            Some(connector) => connector,
            None => Arc::new(TlsConnector::new()?),
        };
        let codec = self.codec.unwrap_or_else(|| Arc::new(BinaryCodec));
        let handler = self.handler.unwrap_or_else(|| Arc::new(NoopHandler));
        let queue = match self.queue {
            Some(queue) => queue,
            None => RingBufferQueue::with_capacity(self.config.queue_capacity)?,
        };
        ProtocolConnection::start(self.endpoint, connector, codec, handler, queue, self.config)
    }
}
