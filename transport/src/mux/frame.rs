use anyhow::{anyhow, bail};
use bitflags::bitflags;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

use crate::safe_converter::{PrecheckedCast, SafeCast};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum FrameType {
    Data = 0,
    Header = 1,
    Settings = 4,
    Ping = 6,
    GoAway = 7,
}

impl FrameType {
    fn allows_payload(&self) -> bool {
        matches!(self, FrameType::Data | FrameType::Ping | FrameType::GoAway)
    }
}

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FrameFlags: u8 {
        /// FIN on DATA, RST on HEADER
        const CLOSE_STREAM = 0x01;
        /// on PING: this is the response
        const ACK = 0x01;
        /// the DATA payload is gzip compressed
        const COMPRESSED = 0x04;
    }
}

/// A frame of the stream multiplexing protocol.
///
/// ```ascii
/// 0               1               2               3
/// 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7 0 1 2 3 4 5 6 7
/// +-----------------------------------------------+---------------+
/// | payload length (24 bit)                       | type          |
/// +---------------+-+-----------------------------+---------------+
/// | flags         |R| stream id (31 bit)                            |
/// +---------------+-+-----------------------------+---------------+
/// | stream id ctd.| payload ...
/// +---------------+
/// ```
///
/// All numbers are big endian. The reserved bit `R` must be zero.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub stream_id: u32,
    pub payload: Bytes,
}

impl Frame {
    pub const HEADER_LEN: usize = 9;
    pub const MAX_PAYLOAD_LEN: usize = 0xff_ffff;
    pub const MAX_STREAM_ID: u32 = 0x7fff_ffff;

    /// GOAWAY's placeholder for 'no last stream id' and 'no error code'
    pub const GOAWAY_NONE: u32 = u32::MAX;

    fn empty(frame_type: FrameType, flags: FrameFlags, stream_id: u32) -> Frame {
        Frame {
            frame_type,
            flags,
            stream_id,
            payload: Bytes::new(),
        }
    }

    /// the handshake frame, sent by both sides before anything else
    pub fn settings() -> Frame {
        Self::empty(FrameType::Settings, FrameFlags::empty(), 0)
    }

    /// SYN when opening a stream, SYN-ACK when answering one
    pub fn header(stream_id: u32) -> Frame {
        Self::empty(FrameType::Header, FrameFlags::empty(), stream_id)
    }

    pub fn rst(stream_id: u32) -> Frame {
        Self::empty(FrameType::Header, FrameFlags::CLOSE_STREAM, stream_id)
    }

    pub fn data(stream_id: u32, payload: Bytes, compressed: bool) -> Frame {
        Frame {
            frame_type: FrameType::Data,
            flags: if compressed { FrameFlags::COMPRESSED } else { FrameFlags::empty() },
            stream_id,
            payload,
        }
    }

    pub fn fin(stream_id: u32) -> Frame {
        Self::empty(FrameType::Data, FrameFlags::CLOSE_STREAM, stream_id)
    }

    pub fn ping(token: u64, ack: bool) -> Frame {
        Frame {
            frame_type: FrameType::Ping,
            flags: if ack { FrameFlags::ACK } else { FrameFlags::empty() },
            stream_id: 0,
            payload: Bytes::copy_from_slice(&token.to_be_bytes()),
        }
    }

    pub fn goaway(last_stream_id: u32, error_code: u32, msg: &str) -> Frame {
        let mut payload = BytesMut::with_capacity(8 + msg.len());
        payload.put_u32(last_stream_id);
        payload.put_u32(error_code);
        payload.put_slice(msg.as_bytes());

        Frame {
            frame_type: FrameType::GoAway,
            flags: FrameFlags::empty(),
            stream_id: 0,
            payload: payload.freeze(),
        }
    }

    pub fn serialized_len(&self) -> usize {
        Self::HEADER_LEN + self.payload.len()
    }

    /// Callers guarantee that the payload fits into the 24 bit length field.
    pub fn ser(&self, buf: &mut BytesMut) {
        let len: u32 = self.payload.len().prechecked_cast();
        buf.put_uint(len.safe_cast(), 3);
        buf.put_u8(self.frame_type.into());
        buf.put_u8(self.flags.bits());
        buf.put_u32(self.stream_id & Self::MAX_STREAM_ID);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.serialized_len());
        self.ser(&mut buf);
        buf.freeze()
    }

    /// Decodes the frame at the start of `buf`, returning it with the number of bytes it occupies.
    ///  Returns `None` if `buf` does not contain the complete frame yet.
    ///
    /// Unknown frame types, payload on frame types that do not allow it and a set reserved bit
    ///  are errors.
    pub fn deser(buf: &[u8]) -> anyhow::Result<Option<(Frame, usize)>> {
        if buf.len() < Self::HEADER_LEN {
            return Ok(None);
        }
        let mut header = &buf[..Self::HEADER_LEN];

        let len: usize = header.get_uint(3).try_into()?;
        let raw_type = header.get_u8();
        let frame_type = FrameType::try_from(raw_type)
            .map_err(|_| anyhow!("invalid frame type: {}", raw_type))?;
        if len != 0 && !frame_type.allows_payload() {
            bail!("invalid frame type with payload: type={:?}, len={}", frame_type, len);
        }
        let flags = FrameFlags::from_bits_retain(header.get_u8());
        let raw_stream_id = header.get_u32();
        if raw_stream_id > Self::MAX_STREAM_ID {
            bail!("invalid stream id: {:#x}", raw_stream_id);
        }

        if buf.len() < Self::HEADER_LEN + len {
            return Ok(None);
        }
        let frame = Frame {
            frame_type,
            flags,
            stream_id: raw_stream_id,
            payload: Bytes::copy_from_slice(&buf[Self::HEADER_LEN..Self::HEADER_LEN + len]),
        };
        Ok(Some((frame, Self::HEADER_LEN + len)))
    }

    pub fn is_close_stream(&self) -> bool {
        self.flags.contains(FrameFlags::CLOSE_STREAM)
    }

    /// the token of a well-formed PING
    pub fn ping_token(&self) -> Option<u64> {
        let mut payload = &self.payload[..];
        if payload.len() < 8 {
            return None;
        }
        Some(payload.get_u64())
    }

    /// The message of a GOAWAY frame, if any
    pub fn goaway_message(&self) -> Option<String> {
        if self.payload.len() <= 8 {
            return None;
        }
        Some(String::from_utf8_lossy(&self.payload[8..]).into_owned())
    }
}
