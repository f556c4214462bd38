//! An in-memory byte pipe for testing the mux without a network

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::bail;
use bytes::{Buf, BytesMut};
use selector::{ReadResult, Readiness, SocketCore, VirtualSocket};

use crate::mux::frame::Frame;

struct PipeShared {
    capacity: usize,
    /// `inbound[i]` holds the bytes written by side `1-i`
    inbound: [BytesMut; 2],
    /// side `i` will not write any more
    closed: [bool; 2],
    readiness: [Readiness; 2],
}

pub struct MemoryPipe {
    side: usize,
    core: SocketCore,
    shared: Rc<RefCell<PipeShared>>,
    /// partial frames read through [MemoryPipe::read_frames]
    pending: BytesMut,
}

impl MemoryPipe {
    /// Each direction buffers up to `capacity` bytes
    pub fn pair(capacity: usize) -> (MemoryPipe, MemoryPipe) {
        let addr_a: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let addr_b: SocketAddr = "10.0.0.2:2000".parse().unwrap();
        let core_a = SocketCore::accepted(Some(addr_a), Some(addr_b));
        let core_b = SocketCore::accepted(Some(addr_b), Some(addr_a));

        let shared = Rc::new(RefCell::new(PipeShared {
            capacity,
            inbound: [BytesMut::new(), BytesMut::new()],
            closed: [false, false],
            readiness: [core_a.readiness().clone(), core_b.readiness().clone()],
        }));

        let a = MemoryPipe { side: 0, core: core_a, shared: shared.clone(), pending: BytesMut::new() };
        let b = MemoryPipe { side: 1, core: core_b, shared, pending: BytesMut::new() };
        (a, b)
    }

    fn peer(&self) -> usize {
        1 - self.side
    }

    pub fn is_peer_closed(&self) -> bool {
        self.shared.borrow().closed[self.peer()]
    }

    pub fn write_raw(&mut self, data: &[u8]) {
        assert_eq!(self.write(data).unwrap(), data.len(), "pipe is full");
    }

    pub fn write_frame(&mut self, frame: &Frame) {
        self.write_raw(&frame.to_bytes());
    }

    pub fn read_raw(&mut self) -> Vec<u8> {
        let mut result = self.pending.split().to_vec();
        let mut buf = [0u8; 4096];
        while let Ok(ReadResult::Data(n)) = self.read(&mut buf) {
            result.extend_from_slice(&buf[..n]);
        }
        result
    }

    /// all complete frames that arrived so far
    pub fn read_frames(&mut self) -> Vec<Frame> {
        let raw = self.read_raw();
        self.pending.extend_from_slice(&raw);

        let mut result = Vec::new();
        while let Some((frame, consumed)) = Frame::deser(&self.pending).unwrap() {
            self.pending.advance(consumed);
            result.push(frame);
        }
        result
    }
}

impl VirtualSocket for MemoryPipe {
    fn readiness(&self) -> Readiness {
        self.core.readiness().clone()
    }

    fn connect(&mut self, remote: SocketAddr) -> anyhow::Result<()> {
        self.core.begin_connect(remote)
    }

    fn finish_connect(&mut self) -> anyhow::Result<bool> {
        self.core.finish_connect()
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    fn read(&mut self, dst: &mut [u8]) -> anyhow::Result<ReadResult> {
        self.core.check_connected()?;
        let mut shared = self.shared.borrow_mut();
        let side = self.side;

        let n = shared.inbound[side].len().min(dst.len());
        dst[..n].copy_from_slice(&shared.inbound[side][..n]);
        shared.inbound[side].advance(n);
        if n > 0 {
            shared.readiness[1 - side].set_writable();
        }

        let empty = shared.inbound[side].is_empty();
        if empty && shared.closed[1 - side] {
            self.core.set_eof();
        }
        Ok(self.core.finish_read(n, empty))
    }

    fn write(&mut self, src: &[u8]) -> anyhow::Result<usize> {
        self.core.check_connected()?;
        let mut shared = self.shared.borrow_mut();
        let peer = self.peer();
        if shared.closed[self.side] {
            bail!("output is shut down");
        }

        let room = shared.capacity.saturating_sub(shared.inbound[peer].len());
        let n = room.min(src.len());
        shared.inbound[peer].extend_from_slice(&src[..n]);
        if n > 0 {
            shared.readiness[peer].set_readable();
        }
        if n == room {
            self.core.readiness().cancel_writable();
        }
        Ok(n)
    }

    fn writable_capacity(&self) -> usize {
        let shared = self.shared.borrow();
        shared.capacity.saturating_sub(shared.inbound[self.peer()].len())
    }

    fn shutdown_output(&mut self) -> anyhow::Result<()> {
        let mut shared = self.shared.borrow_mut();
        shared.closed[self.side] = true;
        shared.readiness[self.peer()].set_readable();
        Ok(())
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.core.local_addr()
    }

    fn remote_addr(&self) -> anyhow::Result<SocketAddr> {
        self.core.remote_addr()
    }

    fn set_reset_on_close(&mut self, reset_on_close: bool) {
        self.core.set_reset_on_close(reset_on_close);
    }

    fn is_open(&self) -> bool {
        self.core.is_open()
    }

    fn close(&mut self) {
        if !self.core.begin_close() {
            return;
        }
        let _ = self.shutdown_output();
        self.core.finish_close();
    }
}
