//! 一次性命令
//!
//! 在不建立长期会话的情况下与机箱交换一条命令：打开独立连接、发送、
//! （可选）等待指定类型的状态记录、关闭。用于发现阶段探测机箱身份和
//! 对未连接机箱执行识别灯控制。

use std::time::{Duration, Instant};

use fieldline_net::{Connector, Endpoint, Transport, TransportError};
use fieldline_protocol::{
    Command, FrameDecoder, MessageCodec, MessageType, StatusBody, StatusKind, StatusPacket,
    SystemStatus, encode_frame,
};
use tracing::{debug, trace};

use crate::error::DriverError;

/// 单次读超时（决定截止时间检查的粒度）
const READ_SLICE: Duration = Duration::from_millis(100);

fn open_and_send(
    connector: &dyn Connector,
    codec: &dyn MessageCodec,
    endpoint: &Endpoint,
    command: &Command,
    timeout: Duration,
) -> Result<Box<dyn Transport>, DriverError> {
    let mut transport = connector.connect(endpoint, timeout)?;
    transport.set_read_timeout(READ_SLICE.min(timeout))?;
    let payload = codec.encode_command(command)?;
    let frame = encode_frame(MessageType::Cmd, &payload)?;
    transport.send_all(&frame)?;
    Ok(transport)
}

/// 发送一条命令并等待第一个类型为 `expected` 的状态记录
///
/// 其他记录（数据、其他状态、命令应答）被忽略。超过 `timeout` 仍未收到时返回
/// [`DriverError::Timeout`]；对端提前关闭时返回传输层错误。
pub fn one_shot_status(
    connector: &dyn Connector,
    codec: &dyn MessageCodec,
    endpoint: &Endpoint,
    command: &Command,
    expected: StatusKind,
    timeout: Duration,
) -> Result<StatusPacket, DriverError> {
    let deadline = Instant::now() + timeout;
    let mut transport = open_and_send(connector, codec, endpoint, command, timeout)?;
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];

    let result = loop {
        if Instant::now() >= deadline {
            debug!("One-shot {:?} to {} timed out", command.code(), endpoint);
            break Err(DriverError::Timeout);
        }
        match transport.recv(&mut buf) {
            Ok(0) => break Err(TransportError::Closed.into()),
            Ok(n) => decoder.extend(&buf[..n]),
            Err(TransportError::Timeout) => continue,
            Err(e) => break Err(e.into()),
        }

        let mut found = None;
        while let Some(frame) = decoder.next_frame()? {
            if frame.message_type != MessageType::Status {
                trace!("One-shot to {}: skipping {:?} frame", endpoint, frame.message_type);
                continue;
            }
            let status = codec.decode_status(&frame.payload)?;
            if status.kind() == expected {
                found = Some(status);
                break;
            }
        }
        if let Some(status) = found {
            break Ok(status);
        }
    };

    transport.shutdown();
    result
}

/// 发送一条命令后立即关闭连接，不等待应答
pub fn one_shot_command(
    connector: &dyn Connector,
    codec: &dyn MessageCodec,
    endpoint: &Endpoint,
    command: &Command,
    timeout: Duration,
) -> Result<(), DriverError> {
    let mut transport = open_and_send(connector, codec, endpoint, command, timeout)?;
    transport.shutdown();
    Ok(())
}

/// 查询机箱的系统状态（名称、版本、主从关系、序列号）
pub fn probe_system_status(
    connector: &dyn Connector,
    codec: &dyn MessageCodec,
    endpoint: &Endpoint,
    timeout: Duration,
) -> Result<SystemStatus, DriverError> {
    let packet = one_shot_status(
        connector,
        codec,
        endpoint,
        &Command::SystemStatusRequest,
        StatusKind::SystemStatus,
        timeout,
    )?;
    match packet.body {
        StatusBody::SystemStatus(status) => Ok(status),
        // kind() 已保证为 SystemStatus
        _ => Err(DriverError::Timeout),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fieldline_net::{MockChassis, MockConnector};
    use fieldline_protocol::BinaryCodec;

    fn system_status(prefix: &str) -> SystemStatus {
        SystemStatus {
            num: 1,
            total: 1,
            version: "1.4.2".into(),
            master: format!("{}17", prefix),
            serial: format!("{}17", prefix),
        }
    }

    #[test]
    fn test_probe_system_status() {
        let connector = MockConnector::new();
        let endpoint = Endpoint::new("chassis-a", 7777);
        let chassis = MockChassis::spawn(&connector, endpoint.clone(), system_status("FL01"));

        let status = probe_system_status(&connector, &BinaryCodec, &endpoint, Duration::from_secs(2))
            .unwrap();
        assert_eq!(status.serial, "FL0117");
        assert_eq!(status.version, "1.4.2");
        drop(chassis);
    }

    #[test]
    fn test_one_shot_times_out_when_silent() {
        let connector = MockConnector::new();
        let endpoint = Endpoint::new("chassis-b", 7777);
        let chassis = MockChassis::spawn(&connector, endpoint.clone(), system_status("FL02"));
        chassis.set_responsive(false);

        let result = probe_system_status(
            &connector,
            &BinaryCodec,
            &endpoint,
            Duration::from_millis(300),
        );
        assert!(matches!(result, Err(DriverError::Timeout)));
    }

    #[test]
    fn test_unknown_endpoint_is_refused() {
        let connector = MockConnector::new();
        let endpoint = Endpoint::new("nowhere", 7777);
        let result = one_shot_command(
            &connector,
            &BinaryCodec,
            &endpoint,
            &Command::Identify(true),
            Duration::from_millis(100),
        );
        assert!(matches!(result, Err(DriverError::Transport(_))));
    }

    #[test]
    fn test_one_shot_command_is_delivered() {
        let connector = MockConnector::new();
        let endpoint = Endpoint::new("chassis-c", 7777);
        let chassis = MockChassis::spawn(&connector, endpoint.clone(), system_status("FL03"));

        one_shot_command(
            &connector,
            &BinaryCodec,
            &endpoint,
            &Command::Identify(true),
            Duration::from_secs(1),
        )
        .unwrap();
        assert!(
            chassis
                .wait_for_command(Duration::from_secs(2), |c| *c == Command::Identify(true))
                .is_some()
        );
    }
}
