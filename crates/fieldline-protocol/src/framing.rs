//! 帧格式
//!
//! 每条消息为 `[2 字节大端消息类型][2 字节大端负载长度][负载]`。
//! [`FrameDecoder`] 以增量方式累积字节流，读超时发生在帧中间时不会丢失数据。

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::ProtocolError;
use crate::constants::HEADER_LENGTH;
use crate::ids::MessageType;

/// 帧头
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_type: MessageType,
    pub length: u16,
}

impl FrameHeader {
    /// 从 4 字节帧头解析
    ///
    /// 未知消息类型视为协议错误（连接层会据此重连）。
    pub fn decode(raw: [u8; HEADER_LENGTH]) -> Result<Self, ProtocolError> {
        let type_code = u16::from_be_bytes([raw[0], raw[1]]);
        let length = u16::from_be_bytes([raw[2], raw[3]]);
        let message_type = MessageType::try_from(type_code)
            .map_err(|_| ProtocolError::UnknownMessageType(type_code))?;
        Ok(Self {
            message_type,
            length,
        })
    }

    pub fn encode(&self) -> [u8; HEADER_LENGTH] {
        let t = u16::from(self.message_type).to_be_bytes();
        let l = self.length.to_be_bytes();
        [t[0], t[1], l[0], l[1]]
    }
}

/// 一帧原始负载（尚未交给 codec 解析）
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub message_type: MessageType,
    pub payload: Bytes,
}

/// 为负载加上帧头
pub fn encode_frame(message_type: MessageType, payload: &[u8]) -> Result<Bytes, ProtocolError> {
    let length =
        u16::try_from(payload.len()).map_err(|_| ProtocolError::PayloadTooLarge(payload.len()))?;
    let header = FrameHeader {
        message_type,
        length,
    };
    let mut buf = BytesMut::with_capacity(HEADER_LENGTH + payload.len());
    buf.put_slice(&header.encode());
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// 增量帧解码器
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
        }
    }

    /// 追加从传输层读到的字节
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// 已缓存但尚未组成完整帧的字节数
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// 丢弃缓存（重连时调用）
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// 取出下一完整帧
    ///
    /// 数据不足时返回 `Ok(None)`；帧头中的消息类型非法时返回错误，
    /// 此时缓存内容已不可信，调用方应断开连接。
    pub fn next_frame(&mut self) -> Result<Option<RawFrame>, ProtocolError> {
        if self.buf.len() < HEADER_LENGTH {
            return Ok(None);
        }
        let header = FrameHeader::decode([self.buf[0], self.buf[1], self.buf[2], self.buf[3]])?;
        let total = HEADER_LENGTH + header.length as usize;
        if self.buf.len() < total {
            return Ok(None);
        }
        self.buf.advance(HEADER_LENGTH);
        let payload = self.buf.split_to(header.length as usize).freeze();
        Ok(Some(RawFrame {
            message_type: header.message_type,
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_is_big_endian() {
        let frame = encode_frame(MessageType::Status, &[0xAA; 0x0102]).unwrap();
        assert_eq!(&frame[..4], &[0x00, 0x02, 0x01, 0x02]);
        assert_eq!(frame.len(), 4 + 0x0102);
    }

    #[test]
    fn test_payload_too_large() {
        let payload = vec![0u8; u16::MAX as usize + 1];
        assert_eq!(
            encode_frame(MessageType::Cmd, &payload),
            Err(ProtocolError::PayloadTooLarge(u16::MAX as usize + 1))
        );
    }

    #[test]
    fn test_decoder_handles_partial_input() {
        let frame = encode_frame(MessageType::Data, b"hello").unwrap();
        let mut decoder = FrameDecoder::new();

        decoder.extend(&frame[..3]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(&frame[3..6]);
        assert_eq!(decoder.next_frame().unwrap(), None);
        decoder.extend(&frame[6..]);

        let raw = decoder.next_frame().unwrap().unwrap();
        assert_eq!(raw.message_type, MessageType::Data);
        assert_eq!(&raw.payload[..], b"hello");
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_decoder_yields_back_to_back_frames_in_order() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&encode_frame(MessageType::Status, b"a").unwrap());
        decoder.extend(&encode_frame(MessageType::Cmd, b"").unwrap());
        decoder.extend(&encode_frame(MessageType::Data, b"bc").unwrap());

        let kinds: Vec<_> = std::iter::from_fn(|| decoder.next_frame().unwrap())
            .map(|f| f.message_type)
            .collect();
        assert_eq!(
            kinds,
            vec![MessageType::Status, MessageType::Cmd, MessageType::Data]
        );
    }

    #[test]
    fn test_unknown_message_type_is_an_error() {
        let mut decoder = FrameDecoder::new();
        decoder.extend(&[0x00, 0x07, 0x00, 0x00]);
        assert_eq!(
            decoder.next_frame(),
            Err(ProtocolError::UnknownMessageType(7))
        );
    }
}
