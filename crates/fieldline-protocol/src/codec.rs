//! 记录序列化边界
//!
//! 连接层只依赖 [`MessageCodec`]：命令编码为 CMD 负载，STATUS/DATA/CMD 负载
//! 解析为类型化记录。[`BinaryCodec`] 是随 SDK 提供的紧凑二进制实现
//! （多字节整数一律大端），并额外提供设备侧的编解码方法供模拟机箱使用。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtocolError;
use crate::control::{ChannelConfig, Command, LogicRequest, RawRegister, WaveRequest};
use crate::data::{DataPacket, Sample};
use crate::feedback::{
    CommandResponse, SensorConfigEntry, SensorField, SensorLed, SensorPresence,
    SensorStateReport, StatusBody, StatusPacket, SystemStatus,
};
use crate::ids::{CommandCode, LogicKind, SensorStateCode, StatusKind, WaveKind};

/// 消息编解码接口
pub trait MessageCodec: Send + Sync {
    /// 命令 → CMD 帧负载
    fn encode_command(&self, command: &Command) -> Result<Bytes, ProtocolError>;

    /// STATUS 帧负载 → 状态记录
    fn decode_status(&self, payload: &[u8]) -> Result<StatusPacket, ProtocolError>;

    /// DATA 帧负载 → 数据包
    fn decode_data(&self, payload: &[u8]) -> Result<DataPacket, ProtocolError>;

    /// 设备发来的 CMD 帧负载 → 命令应答
    fn decode_response(&self, payload: &[u8]) -> Result<CommandResponse, ProtocolError>;
}

/// 紧凑二进制编解码器
#[derive(Debug, Clone, Copy, Default)]
pub struct BinaryCodec;

const CLOSED_LOOP_UNKNOWN: u8 = 0;
const CLOSED_LOOP_OPEN: u8 = 1;
const CLOSED_LOOP_CLOSED: u8 = 2;

const RESPONSE_OTHER: u8 = 0;
const RESPONSE_RAW_READ: u8 = 1;
const RESPONSE_DEV_MODE: u8 = 2;

impl MessageCodec for BinaryCodec {
    fn encode_command(&self, command: &Command) -> Result<Bytes, ProtocolError> {
        let mut w = BytesMut::with_capacity(64);
        w.put_u8(command.code().into());
        match command {
            Command::StatusRequest
            | Command::SystemStatusRequest
            | Command::ResetFpga
            | Command::SensorConfigRequest
            | Command::UpdateCommit
            | Command::Reboot => {},
            Command::ConfigList(list) => {
                put_count(&mut w, list.len())?;
                for c in list {
                    w.put_u8(c.sensor_id);
                    w.put_i32(c.datatype);
                    w.put_u32(c.freq);
                }
            },
            Command::RawWrite(reg) | Command::OneTimeRead(reg) => put_register(&mut w, reg),
            Command::Logic(list) => {
                put_count(&mut w, list.len())?;
                for l in list {
                    w.put_u8(l.sensor_id);
                    w.put_u8(l.kind.into());
                }
            },
            Command::Wave(list) => {
                put_count(&mut w, list.len())?;
                for wave in list {
                    w.put_u8(wave.sensor_id);
                    w.put_u8(wave.kind.into());
                    w.put_f64(wave.amplitude);
                    w.put_f64(wave.freq);
                }
            },
            Command::ClosedLoop(on) | Command::Identify(on) => w.put_u8(u8::from(*on)),
            Command::DeveloperMode { enable, password } => {
                w.put_u8(u8::from(*enable));
                put_str(&mut w, password.as_deref().unwrap_or(""))?;
            },
            Command::Update { uri } => put_str(&mut w, uri)?,
        }
        Ok(w.freeze())
    }

    fn decode_status(&self, payload: &[u8]) -> Result<StatusPacket, ProtocolError> {
        let mut r = Reader::new(payload);
        let chassis_name = r.string("chassis_name")?;
        let version = r.string("version")?;
        let status = r.string("status")?;
        let closed_loop = match r.u8()? {
            CLOSED_LOOP_UNKNOWN => None,
            CLOSED_LOOP_OPEN => Some(false),
            CLOSED_LOOP_CLOSED => Some(true),
            other => {
                return Err(ProtocolError::InvalidValue {
                    field: "closed_loop",
                    value: other as u32,
                });
            },
        };
        let kind_code = r.u8()?;
        let kind = StatusKind::try_from(kind_code).map_err(|_| ProtocolError::InvalidValue {
            field: "status_kind",
            value: kind_code as u32,
        })?;

        let body = match kind {
            StatusKind::Status => StatusBody::Status,
            StatusKind::SystemStatus => StatusBody::SystemStatus(SystemStatus {
                num: r.u32()?,
                total: r.u32()?,
                version: r.string("system_version")?,
                master: r.string("master")?,
                serial: r.string("serial")?,
            }),
            StatusKind::SensorLed => StatusBody::SensorLed(r.list(|r| {
                Ok(SensorLed {
                    sensor_id: r.u8()?,
                    color: r.u32()?,
                    blink_state: r.u32()?,
                })
            })?),
            StatusKind::SensorConfig => StatusBody::SensorConfig(r.list(|r| {
                let sensor_id = r.u8()?;
                let datatype = r.i32()?;
                let freq = r.u32()?;
                let has_calibration = r.u8()? != 0;
                let calibration = r.f64()?;
                Ok(SensorConfigEntry {
                    sensor_id,
                    datatype,
                    freq,
                    calibration: has_calibration.then_some(calibration),
                })
            })?),
            StatusKind::SensorStatus => StatusBody::SensorStatus(r.list(|r| {
                let sensor_id = r.u8()?;
                let connected = r.u8()? != 0;
                let card_serial = r.u32()?;
                let has_serial = r.u8()? != 0;
                let serial = r.u32()?;
                Ok(SensorPresence {
                    sensor_id,
                    connected,
                    card_serial,
                    sensor_serial: has_serial.then_some(serial),
                })
            })?),
            StatusKind::SensorState => StatusBody::SensorState(r.list(|r| {
                let sensor_id = r.u8()?;
                let code = r.u8()?;
                let state =
                    SensorStateCode::try_from(code).map_err(|_| ProtocolError::InvalidValue {
                        field: "sensor_state",
                        value: code as u32,
                    })?;
                Ok(SensorStateReport { sensor_id, state })
            })?),
            StatusKind::SensorField => StatusBody::SensorField(r.list(|r| {
                Ok(SensorField {
                    sensor_id: r.u8()?,
                    x: r.f64()?,
                    y: r.f64()?,
                    z: r.f64()?,
                })
            })?),
            StatusKind::Progress => StatusBody::Progress {
                progress: r.u32()?,
                message: r.string("progress_message")?,
            },
        };

        Ok(StatusPacket {
            chassis_name,
            version,
            status,
            closed_loop,
            body,
        })
    }

    fn decode_data(&self, payload: &[u8]) -> Result<DataPacket, ProtocolError> {
        let mut r = Reader::new(payload);
        let timestamp = r.u32()?;
        let count = r.u32()? as usize;
        r.require(count.saturating_mul(Sample::ENCODED_LEN))?;
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            samples.push(Sample::new(r.i32()?, r.i32()?, r.i32()?));
        }
        Ok(DataPacket { timestamp, samples })
    }

    fn decode_response(&self, payload: &[u8]) -> Result<CommandResponse, ProtocolError> {
        let mut r = Reader::new(payload);
        let code = r.u8()?;
        let code = CommandCode::try_from(code).map_err(|_| ProtocolError::InvalidValue {
            field: "command_code",
            value: code as u32,
        })?;
        match r.u8()? {
            RESPONSE_RAW_READ => Ok(CommandResponse::RawRead(r.register()?)),
            RESPONSE_DEV_MODE => Ok(CommandResponse::DeveloperMode {
                enable: r.u8()? != 0,
                valid: r.u8()? != 0,
            }),
            RESPONSE_OTHER => Ok(CommandResponse::Other(code)),
            other => Err(ProtocolError::InvalidValue {
                field: "response_tag",
                value: other as u32,
            }),
        }
    }
}

// ============================================================================
// 设备侧编解码（模拟机箱使用）
// ============================================================================

impl BinaryCodec {
    pub fn encode_status(&self, packet: &StatusPacket) -> Result<Bytes, ProtocolError> {
        let mut w = BytesMut::with_capacity(64);
        put_str(&mut w, &packet.chassis_name)?;
        put_str(&mut w, &packet.version)?;
        put_str(&mut w, &packet.status)?;
        w.put_u8(match packet.closed_loop {
            None => CLOSED_LOOP_UNKNOWN,
            Some(false) => CLOSED_LOOP_OPEN,
            Some(true) => CLOSED_LOOP_CLOSED,
        });
        w.put_u8(packet.kind().into());
        match &packet.body {
            StatusBody::Status => {},
            StatusBody::SystemStatus(s) => {
                w.put_u32(s.num);
                w.put_u32(s.total);
                put_str(&mut w, &s.version)?;
                put_str(&mut w, &s.master)?;
                put_str(&mut w, &s.serial)?;
            },
            StatusBody::SensorLed(list) => {
                put_count(&mut w, list.len())?;
                for led in list {
                    w.put_u8(led.sensor_id);
                    w.put_u32(led.color);
                    w.put_u32(led.blink_state);
                }
            },
            StatusBody::SensorConfig(list) => {
                put_count(&mut w, list.len())?;
                for e in list {
                    w.put_u8(e.sensor_id);
                    w.put_i32(e.datatype);
                    w.put_u32(e.freq);
                    w.put_u8(u8::from(e.calibration.is_some()));
                    w.put_f64(e.calibration.unwrap_or(0.0));
                }
            },
            StatusBody::SensorStatus(list) => {
                put_count(&mut w, list.len())?;
                for p in list {
                    w.put_u8(p.sensor_id);
                    w.put_u8(u8::from(p.connected));
                    w.put_u32(p.card_serial);
                    w.put_u8(u8::from(p.sensor_serial.is_some()));
                    w.put_u32(p.sensor_serial.unwrap_or(0));
                }
            },
            StatusBody::SensorState(list) => {
                put_count(&mut w, list.len())?;
                for s in list {
                    w.put_u8(s.sensor_id);
                    w.put_u8(s.state.into());
                }
            },
            StatusBody::SensorField(list) => {
                put_count(&mut w, list.len())?;
                for f in list {
                    w.put_u8(f.sensor_id);
                    w.put_f64(f.x);
                    w.put_f64(f.y);
                    w.put_f64(f.z);
                }
            },
            StatusBody::Progress { progress, message } => {
                w.put_u32(*progress);
                put_str(&mut w, message)?;
            },
        }
        Ok(w.freeze())
    }

    pub fn encode_data(&self, packet: &DataPacket) -> Bytes {
        let mut w = BytesMut::with_capacity(packet.encoded_len());
        w.put_u32(packet.timestamp);
        w.put_u32(packet.samples.len() as u32);
        for s in &packet.samples {
            w.put_i32(s.sensor);
            w.put_i32(s.datatype);
            w.put_i32(s.value);
        }
        w.freeze()
    }

    pub fn encode_response(&self, code: CommandCode, response: &CommandResponse) -> Bytes {
        let mut w = BytesMut::with_capacity(16);
        w.put_u8(code.into());
        match response {
            CommandResponse::RawRead(reg) => {
                w.put_u8(RESPONSE_RAW_READ);
                put_register(&mut w, reg);
            },
            CommandResponse::DeveloperMode { enable, valid } => {
                w.put_u8(RESPONSE_DEV_MODE);
                w.put_u8(u8::from(*enable));
                w.put_u8(u8::from(*valid));
            },
            CommandResponse::Other(_) => w.put_u8(RESPONSE_OTHER),
        }
        w.freeze()
    }

    pub fn decode_command(&self, payload: &[u8]) -> Result<Command, ProtocolError> {
        let mut r = Reader::new(payload);
        let code = r.u8()?;
        let code = CommandCode::try_from(code).map_err(|_| ProtocolError::InvalidValue {
            field: "command_code",
            value: code as u32,
        })?;
        let command = match code {
            CommandCode::StatusRequest => Command::StatusRequest,
            CommandCode::SystemStatusRequest => Command::SystemStatusRequest,
            CommandCode::ResetFpga => Command::ResetFpga,
            CommandCode::SensorConfigRequest => Command::SensorConfigRequest,
            CommandCode::UpdateCommit => Command::UpdateCommit,
            CommandCode::Reboot => Command::Reboot,
            CommandCode::ConfigList => Command::ConfigList(r.list(|r| {
                Ok(ChannelConfig {
                    sensor_id: r.u8()?,
                    datatype: r.i32()?,
                    freq: r.u32()?,
                })
            })?),
            CommandCode::RawWrite => Command::RawWrite(r.register()?),
            CommandCode::OneTimeRead => Command::OneTimeRead(r.register()?),
            CommandCode::Logic => Command::Logic(r.list(|r| {
                let sensor_id = r.u8()?;
                let kind = r.u8()?;
                let kind = LogicKind::try_from(kind).map_err(|_| ProtocolError::InvalidValue {
                    field: "logic_kind",
                    value: kind as u32,
                })?;
                Ok(LogicRequest { sensor_id, kind })
            })?),
            CommandCode::Wave => Command::Wave(r.list(|r| {
                let sensor_id = r.u8()?;
                let kind = r.u8()?;
                let kind = WaveKind::try_from(kind).map_err(|_| ProtocolError::InvalidValue {
                    field: "wave_kind",
                    value: kind as u32,
                })?;
                Ok(WaveRequest {
                    sensor_id,
                    kind,
                    amplitude: r.f64()?,
                    freq: r.f64()?,
                })
            })?),
            CommandCode::ClosedLoop => Command::ClosedLoop(r.u8()? != 0),
            CommandCode::Identify => Command::Identify(r.u8()? != 0),
            CommandCode::DeveloperMode => {
                let enable = r.u8()? != 0;
                let password = r.string("password")?;
                Command::DeveloperMode {
                    enable,
                    password: (!password.is_empty()).then_some(password),
                }
            },
            CommandCode::Update => Command::Update {
                uri: r.string("uri")?,
            },
        };
        Ok(command)
    }
}

fn put_count(w: &mut BytesMut, len: usize) -> Result<(), ProtocolError> {
    let len = u16::try_from(len).map_err(|_| ProtocolError::PayloadTooLarge(len))?;
    w.put_u16(len);
    Ok(())
}

fn put_str(w: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    put_count(w, s.len())?;
    w.put_slice(s.as_bytes());
    Ok(())
}

fn put_register(w: &mut BytesMut, reg: &RawRegister) {
    w.put_u8(u8::from(reg.all_sensors));
    w.put_u8(reg.sensor_num);
    w.put_u32(reg.register_address);
    w.put_u32(reg.data);
}

/// 带长度检查的读取器
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn require(&self, needed: usize) -> Result<(), ProtocolError> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::Truncated {
                needed,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        self.require(1)?;
        Ok(self.buf.get_u8())
    }

    fn u16(&mut self) -> Result<u16, ProtocolError> {
        self.require(2)?;
        Ok(self.buf.get_u16())
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        self.require(4)?;
        Ok(self.buf.get_u32())
    }

    fn i32(&mut self) -> Result<i32, ProtocolError> {
        self.require(4)?;
        Ok(self.buf.get_i32())
    }

    fn f64(&mut self) -> Result<f64, ProtocolError> {
        self.require(8)?;
        Ok(self.buf.get_f64())
    }

    fn string(&mut self, field: &'static str) -> Result<String, ProtocolError> {
        let len = self.u16()? as usize;
        self.require(len)?;
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        String::from_utf8(head.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    fn register(&mut self) -> Result<RawRegister, ProtocolError> {
        Ok(RawRegister {
            all_sensors: self.u8()? != 0,
            sensor_num: self.u8()?,
            register_address: self.u32()?,
            data: self.u32()?,
        })
    }

    fn list<T>(
        &mut self,
        mut item: impl FnMut(&mut Self) -> Result<T, ProtocolError>,
    ) -> Result<Vec<T>, ProtocolError> {
        let count = self.u16()? as usize;
        let mut out = Vec::with_capacity(count.min(256));
        for _ in 0..count {
            out.push(item(self)?);
        }
        Ok(out)
    }
}
