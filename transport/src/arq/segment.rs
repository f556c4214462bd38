use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, BytesMut};
use num_enum::{IntoPrimitive, TryFromPrimitive};

#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
#[repr(u8)]
pub enum Command {
    Push = 81,
    Ack = 82,
    /// ask the peer for its receive window
    WindowAsk = 83,
    /// tell the peer our receive window
    WindowTell = 84,
}

/// The header preceding every segment, little endian
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    pub conv: u32,
    pub cmd: Command,
    pub frg: u8,
    pub wnd: u16,
    pub ts: u32,
    pub sn: u32,
    pub una: u32,
    pub len: u32,
}

impl SegmentHeader {
    pub const SERIALIZED_LEN: usize = 24;

    pub fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_le(self.conv);
        buf.put_u8(self.cmd.into());
        buf.put_u8(self.frg);
        buf.put_u16_le(self.wnd);
        buf.put_u32_le(self.ts);
        buf.put_u32_le(self.sn);
        buf.put_u32_le(self.una);
        buf.put_u32_le(self.len);
    }

    pub fn deser(buf: &mut impl Buf) -> anyhow::Result<SegmentHeader> {
        if buf.remaining() < Self::SERIALIZED_LEN {
            bail!("segment header needs {} bytes, got {}", Self::SERIALIZED_LEN, buf.remaining());
        }

        let conv = buf.get_u32_le();
        let raw_cmd = buf.get_u8();
        let cmd = Command::try_from(raw_cmd)
            .map_err(|_| anyhow!("unknown segment command {}", raw_cmd))?;

        Ok(SegmentHeader {
            conv,
            cmd,
            frg: buf.get_u8(),
            wnd: buf.get_u16_le(),
            ts: buf.get_u32_le(),
            sn: buf.get_u32_le(),
            una: buf.get_u32_le(),
            len: buf.get_u32_le(),
        })
    }
}
