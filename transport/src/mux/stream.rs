use std::cell::RefCell;
use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::rc::Rc;

use anyhow::bail;
use bytes::{Buf, Bytes};
use selector::{ReadResult, Readiness, SocketCore, VirtualSocket};
use tracing::debug;

use crate::mux::connection::ConnInner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// SYN sent, waiting for the SYN-ACK
    PendingOpen,
    Established,
    /// FIN sent
    HalfClosedLocal,
    /// FIN received
    HalfClosedRemote,
    Closed,
}

impl StreamState {
    pub(crate) fn can_write(&self) -> bool {
        matches!(self, StreamState::Established | StreamState::HalfClosedRemote)
    }
}

/// Per-stream state, shared between the stream handle and its connection
#[derive(Debug)]
pub(crate) struct StreamShared {
    pub(crate) id: u32,
    pub(crate) state: StreamState,
    pub(crate) core: SocketCore,
    pub(crate) inbound: VecDeque<Bytes>,
    /// number of unread bytes in `inbound`
    pub(crate) inbound_len: usize,
    pub(crate) fin_sent: bool,
}

impl StreamShared {
    pub(crate) fn new(id: u32, state: StreamState, core: SocketCore) -> Rc<RefCell<StreamShared>> {
        Rc::new(RefCell::new(StreamShared {
            id,
            state,
            core,
            inbound: VecDeque::new(),
            inbound_len: 0,
            fin_sent: false,
        }))
    }

    /// Returns `false` if the data does not fit into the stream's receive buffer
    pub(crate) fn receive(&mut self, data: Bytes, max_unread: usize) -> bool {
        if matches!(self.state, StreamState::HalfClosedRemote | StreamState::Closed) || !self.core.is_open() {
            debug!("stream {} does not accept data in state {:?} - dropping {} bytes", self.id, self.state, data.len());
            return true;
        }
        if self.inbound_len + data.len() > max_unread {
            debug!("stream {}: {} unread bytes, no room for {} more", self.id, self.inbound_len, data.len());
            return false;
        }
        self.inbound_len += data.len();
        self.inbound.push_back(data);
        self.core.readiness().set_readable();
        true
    }

    /// terminal state after a reset or a connection failure
    pub(crate) fn kill(&mut self, msg: &str) {
        self.state = StreamState::Closed;
        self.core.raise_error(msg);
    }
}

/// One bidirectional byte stream of a [crate::mux::MuxConnection].
///
/// Streams are opened by [crate::mux::MuxConnection::open_stream] or accepted through
///  [crate::mux::MuxConnection::accept]. Their addresses are virtual: the stream id as an IPv4
///  address, with the port of the underlying connection.
///
/// Streams must be closed explicitly; closing sends a FIN (or a RST if `reset_on_close` is set).
pub struct MuxStream {
    shared: Rc<RefCell<StreamShared>>,
    conn: Rc<RefCell<ConnInner>>,
}

impl Debug for MuxStream {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self.shared.try_borrow() {
            Ok(stream) => f.debug_struct("MuxStream")
                .field("id", &stream.id)
                .field("state", &stream.state)
                .finish(),
            Err(_) => f.debug_struct("MuxStream").finish_non_exhaustive(),
        }
    }
}

impl MuxStream {
    pub(crate) fn new(shared: Rc<RefCell<StreamShared>>, conn: Rc<RefCell<ConnInner>>) -> MuxStream {
        MuxStream { shared, conn }
    }

    pub fn stream_id(&self) -> u32 {
        self.shared.borrow().id
    }

    pub fn state(&self) -> StreamState {
        self.shared.borrow().state
    }
}

impl VirtualSocket for MuxStream {
    fn readiness(&self) -> Readiness {
        self.shared.borrow().core.readiness().clone()
    }

    /// Streams are opened by their connection, so this only reports misuse
    fn connect(&mut self, remote: SocketAddr) -> anyhow::Result<()> {
        self.shared.borrow_mut().core.begin_connect(remote)
    }

    fn finish_connect(&mut self) -> anyhow::Result<bool> {
        self.shared.borrow_mut().core.finish_connect()
    }

    fn is_connected(&self) -> bool {
        self.shared.borrow().core.is_connected()
    }

    fn read(&mut self, dst: &mut [u8]) -> anyhow::Result<ReadResult> {
        let mut guard = self.shared.borrow_mut();
        let stream = &mut *guard;
        stream.core.check_connected()?;

        let mut num_read = 0;
        while num_read < dst.len() {
            let Some(chunk) = stream.inbound.front_mut() else {
                break;
            };
            let n = chunk.len().min(dst.len() - num_read);
            dst[num_read..num_read + n].copy_from_slice(&chunk[..n]);
            chunk.advance(n);
            num_read += n;
            stream.inbound_len -= n;
            if chunk.is_empty() {
                stream.inbound.pop_front();
            }
        }
        Ok(stream.core.finish_read(num_read, stream.inbound.is_empty()))
    }

    fn write(&mut self, src: &[u8]) -> anyhow::Result<usize> {
        {
            let stream = self.shared.borrow();
            stream.core.check_connected()?;
            if !stream.state.can_write() {
                bail!("cannot write to stream {} in state {:?}", stream.id, stream.state);
            }
        }
        if src.is_empty() {
            return Ok(0);
        }
        self.conn.borrow_mut().stream_write(&self.shared, src)
    }

    fn writable_capacity(&self) -> usize {
        let writable = {
            let stream = self.shared.borrow();
            stream.core.is_connected() && stream.state.can_write()
        };
        if writable {
            self.conn.borrow().writable_len()
        }
        else {
            0
        }
    }

    fn shutdown_output(&mut self) -> anyhow::Result<()> {
        let state = {
            let stream = self.shared.borrow();
            stream.core.check_open()?;
            stream.core.check_error()?;
            stream.state
        };

        match state {
            StreamState::PendingOpen => {
                self.close();
                Ok(())
            }
            StreamState::Established | StreamState::HalfClosedRemote => {
                self.conn.borrow_mut().send_fin(&self.shared);
                Ok(())
            }
            StreamState::HalfClosedLocal | StreamState::Closed => Ok(()),
        }
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.shared.borrow().core.local_addr()
    }

    fn remote_addr(&self) -> anyhow::Result<SocketAddr> {
        self.shared.borrow().core.remote_addr()
    }

    fn set_reset_on_close(&mut self, reset_on_close: bool) {
        self.shared.borrow_mut().core.set_reset_on_close(reset_on_close);
    }

    fn is_open(&self) -> bool {
        self.shared.borrow().core.is_open()
    }

    fn close(&mut self) {
        if !self.shared.borrow_mut().core.begin_close() {
            return;
        }
        self.conn.borrow_mut().stream_closed(&self.shared);

        let mut stream = self.shared.borrow_mut();
        stream.state = StreamState::Closed;
        stream.inbound.clear();
        stream.inbound_len = 0;
        stream.core.finish_close();
    }
}
