//! # FieldLine Transport Layer
//!
//! 机箱传输层抽象，提供统一的字节流接口。
//!
//! - [`Transport`]: 已建立的会话（发送/带超时接收/关闭）
//! - [`Connector`]: 建立会话的工厂
//! - [`TlsConnector`]: TCP + TLS（不校验证书）
//! - `mock`（feature）: 内存双工通道与模拟机箱

use std::fmt;
use std::time::Duration;
use thiserror::Error;

pub mod tls;

pub use tls::TlsConnector;

#[cfg(feature = "mock")]
pub mod mock;

#[cfg(feature = "mock")]
pub use mock::{MockChassis, MockConnector};

/// 传输层统一错误类型
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TLS Error: {0}")]
    Tls(String),
    #[error("Invalid address: {0}")]
    InvalidAddress(String),
    #[error("Read timeout")]
    Timeout,
    #[error("Connection closed by peer")]
    Closed,
}

impl TransportError {
    /// 是否为可重试的瞬时错误（发送重试使用）
    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Timeout => true,
            TransportError::Io(e) => matches!(
                e.kind(),
                std::io::ErrorKind::Interrupted
                    | std::io::ErrorKind::WouldBlock
                    | std::io::ErrorKind::TimedOut
            ),
            _ => false,
        }
    }
}

impl From<rustls::Error> for TransportError {
    fn from(e: rustls::Error) -> Self {
        TransportError::Tls(e.to_string())
    }
}

/// 机箱网络地址
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Endpoint {
    pub host: String,
    pub port: u16,
}

impl Endpoint {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// 解析 `host:port` 形式的机箱名
    pub fn parse(name: &str) -> Result<Self, TransportError> {
        let (host, port) = name
            .rsplit_once(':')
            .ok_or_else(|| TransportError::InvalidAddress(name.to_string()))?;
        let port = port
            .parse::<u16>()
            .map_err(|_| TransportError::InvalidAddress(name.to_string()))?;
        if host.is_empty() {
            return Err(TransportError::InvalidAddress(name.to_string()));
        }
        Ok(Self::new(host, port))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// 已建立的机箱会话
///
/// `recv` 在读超时内没有数据时返回 [`TransportError::Timeout`]，
/// 对端关闭时返回 `Ok(0)`。
pub trait Transport: Send {
    fn send_all(&mut self, data: &[u8]) -> Result<(), TransportError>;
    fn recv(&mut self, buf: &mut [u8]) -> Result<usize, TransportError>;
    fn set_read_timeout(&mut self, timeout: Duration) -> Result<(), TransportError>;
    fn shutdown(&mut self) {}
}

/// 会话工厂
pub trait Connector: Send + Sync {
    fn connect(
        &self,
        endpoint: &Endpoint,
        timeout: Duration,
    ) -> Result<Box<dyn Transport>, TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_parse() {
        let ep = Endpoint::parse("192.168.1.20:7777").unwrap();
        assert_eq!(ep.host, "192.168.1.20");
        assert_eq!(ep.port, 7777);
        assert_eq!(ep.to_string(), "192.168.1.20:7777");

        assert!(Endpoint::parse("no-port").is_err());
        assert!(Endpoint::parse(":7777").is_err());
        assert!(Endpoint::parse("host:99999").is_err());
    }

    #[test]
    fn test_transient_errors() {
        assert!(TransportError::Timeout.is_transient());
        assert!(TransportError::Io(std::io::ErrorKind::Interrupted.into()).is_transient());
        assert!(!TransportError::Closed.is_transient());
        assert!(!TransportError::Io(std::io::ErrorKind::BrokenPipe.into()).is_transient());
    }
}
