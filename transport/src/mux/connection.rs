use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::rc::{Rc, Weak};
use std::time::Instant;

use anyhow::bail;
use bytes::{Buf, Bytes, BytesMut};
use rustc_hash::FxHashMap;
use selector::{EventSet, Handle, Handler, HandlerContext, ReadResult, Readiness, SelectorEventLoop, SocketCore, TimerId, VirtualSocket, WeakEventLoop};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

use crate::config::MuxConfig;
use crate::mux::compression::{compress_if_smaller, decompress};
use crate::mux::frame::{Frame, FrameFlags, FrameType};
use crate::mux::stream::{MuxStream, StreamShared, StreamState};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MuxRole {
    /// opens odd stream ids, starts the handshake
    Client,
    /// opens even stream ids, answers the handshake
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MuxState {
    /// waiting for the lower connection to be established
    Connecting,
    Handshaking,
    Established,
    Failed(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    Handshaking,
    Established,
    Failed,
}

const READ_CHUNK_SIZE: usize = 16 * 1024;

pub(crate) struct ConnInner {
    role: MuxRole,
    conn_id: Uuid,
    config: MuxConfig,
    phase: Phase,
    failure: Option<String>,
    readiness: Readiness,

    lower: Box<dyn VirtualSocket>,
    lower_local: Option<SocketAddr>,
    lower_remote: Option<SocketAddr>,
    lower_closed: bool,

    streams: FxHashMap<u32, Rc<RefCell<StreamShared>>>,
    accept_queue: VecDeque<Rc<RefCell<StreamShared>>>,
    next_stream_id: u32,
    highest_peer_stream_id: u32,

    inbound: BytesMut,
    read_buf: Vec<u8>,
    last_read: Instant,

    /// the frame that was partially written to the lower connection
    current: Option<Bytes>,
    outbound: VecDeque<Bytes>,
    queued_bytes: usize,
    /// a stream could not write for lack of room and waits for the lower connection
    streams_blocked: bool,

    keepalive_probes: FxHashMap<u64, TimerId>,
    next_ping_token: u64,
    keepalive_credit: u32,

    event_loop: WeakEventLoop,
    handle: Option<Handle>,
    handshake_timer: Option<TimerId>,
    keepalive_timer: Option<TimerId>,
    self_ref: Weak<RefCell<ConnInner>>,
}

fn with_conn(conn: &Weak<RefCell<ConnInner>>, f: impl FnOnce(&mut ConnInner)) {
    let Some(conn) = conn.upgrade() else {
        return;
    };
    match conn.try_borrow_mut() {
        Ok(mut conn) => {
            let span = span!(Level::TRACE, "mux_connection", conn_id = %conn.conn_id);
            let _entered = span.enter();
            f(&mut *conn)
        }
        Err(_) => error!("should not happen: mux connection is busy"),
    };
}

impl ConnInner {
    fn state(&self) -> MuxState {
        match self.phase {
            Phase::Connecting => MuxState::Connecting,
            Phase::Handshaking => MuxState::Handshaking,
            Phase::Established => MuxState::Established,
            Phase::Failed => MuxState::Failed(self.failure.clone().unwrap_or_default()),
        }
    }

    /// How much stream data can be queued right now
    pub(crate) fn writable_len(&self) -> usize {
        self.lower.writable_capacity()
            .min(self.config.max_write_queue_bytes)
            .saturating_sub(self.queued_bytes)
    }

    fn is_peer_stream_id(&self, stream_id: u32) -> bool {
        match self.role {
            MuxRole::Client => stream_id != 0 && stream_id % 2 == 0,
            MuxRole::Server => stream_id % 2 == 1,
        }
    }

    /// the stream id as IPv4 address with the port of the lower connection's client side
    fn stream_addrs(&self, stream_id: u32) -> (Option<SocketAddr>, Option<SocketAddr>) {
        let ip = IpAddr::V4(Ipv4Addr::from(stream_id));
        match self.role {
            MuxRole::Client => {
                let port = self.lower_local.map(|a| a.port()).unwrap_or(0);
                (Some(SocketAddr::new(ip, port)), self.lower_remote)
            }
            MuxRole::Server => {
                let port = self.lower_remote.map(|a| a.port()).unwrap_or(0);
                (self.lower_local, Some(SocketAddr::new(ip, port)))
            }
        }
    }

    fn watch_writable(&self, watch: bool) {
        let (Some(event_loop), Some(handle)) = (self.event_loop.upgrade(), self.handle) else {
            return;
        };
        let result = if watch {
            event_loop.add_ops(handle, EventSet::WRITABLE)
        }
        else {
            event_loop.rm_ops(handle, EventSet::WRITABLE)
        };
        if let Err(e) = result {
            debug!("updating interest in writability failed: {}", e);
        }
    }

    fn update_write_interest(&self) {
        let watch = self.phase == Phase::Connecting
            || self.current.is_some()
            || !self.outbound.is_empty()
            || self.streams_blocked;
        self.watch_writable(watch);
    }

    fn update_stream_writability(&mut self) {
        let has_room = self.phase == Phase::Established && self.writable_len() > 0;
        if has_room {
            self.streams_blocked = false;
        }
        for shared in self.streams.values() {
            // the stream that is currently writing handles its own readiness
            let Ok(stream) = shared.try_borrow() else {
                continue;
            };
            if stream.state.can_write() && stream.core.is_connected() {
                if has_room {
                    stream.core.readiness().set_writable();
                }
                else {
                    stream.core.readiness().cancel_writable();
                }
            }
        }
    }

    fn enqueue(&mut self, frame: Frame, urgent: bool) {
        if self.lower_closed {
            return;
        }
        trace!("queueing {:?} frame for stream {}, {} payload bytes", frame.frame_type, frame.stream_id, frame.payload.len());

        let bytes = frame.to_bytes();
        self.queued_bytes += bytes.len();
        if urgent {
            self.outbound.push_front(bytes);
        }
        else {
            self.outbound.push_back(bytes);
        }
        self.update_stream_writability();
        self.update_write_interest();
    }

    fn flush(&mut self) {
        if self.lower_closed {
            return;
        }
        while let Some(buf) = self.current.take().or_else(|| self.outbound.pop_front()) {
            match self.lower.write(&buf) {
                Ok(n) => {
                    self.queued_bytes = self.queued_bytes.saturating_sub(n);
                    if n < buf.len() {
                        self.current = Some(buf.slice(n..));
                        break;
                    }
                }
                Err(e) => {
                    self.fail(e.to_string(), false);
                    return;
                }
            }
        }
        self.update_stream_writability();
        self.update_write_interest();
    }

    fn schedule(&self, delay: std::time::Duration, f: impl FnOnce(&mut ConnInner) + 'static) -> Option<TimerId> {
        let event_loop = self.event_loop.upgrade()?;
        let conn = self.self_ref.clone();
        match event_loop.delay(delay, move |_| with_conn(&conn, f)) {
            Ok(id) => Some(id),
            Err(e) => {
                debug!("scheduling timer failed: {}", e);
                None
            }
        }
    }

    fn cancel_timer(&self, timer: Option<TimerId>) {
        if let (Some(event_loop), Some(timer)) = (self.event_loop.upgrade(), timer) {
            event_loop.cancel_timer(timer);
        }
    }

    fn start_handshake_timer(&mut self) {
        self.handshake_timer = self.schedule(self.config.handshake_timeout, |conn| {
            conn.handshake_timer = None;
            conn.fail("handshake timed out", true);
        });
    }

    /// client: the lower connection is established
    fn start_handshake(&mut self) {
        debug!("lower connection established - sending handshake");
        self.phase = Phase::Handshaking;
        self.start_handshake_timer();
        self.enqueue(Frame::settings(), false);
    }

    fn handshake_done(&mut self) {
        let timer = self.handshake_timer.take();
        self.cancel_timer(timer);
        if self.role == MuxRole::Server {
            self.enqueue(Frame::settings(), false);
        }
        self.phase = Phase::Established;
        info!("mux connection established ({:?}) {:?} -> {:?}", self.role, self.lower_local, self.lower_remote);
        self.readiness.set_writable();

        if let Some(event_loop) = self.event_loop.upgrade() {
            let conn = self.self_ref.clone();
            match event_loop.period(self.config.keepalive_interval, move |_| with_conn(&conn, |c| c.on_keepalive_tick())) {
                Ok(id) => self.keepalive_timer = Some(id),
                Err(e) => debug!("starting keep-alive timer failed: {}", e),
            }
        }
    }

    fn on_readable(&mut self) {
        if self.lower_closed {
            return;
        }

        let mut got_data = false;
        let mut eof = false;
        loop {
            match self.lower.read(&mut self.read_buf) {
                Ok(ReadResult::Data(n)) => {
                    got_data = true;
                    if self.failure.is_none() {
                        self.inbound.extend_from_slice(&self.read_buf[..n]);
                    }
                }
                Ok(ReadResult::WouldBlock) => break,
                Ok(ReadResult::Eof) => {
                    eof = true;
                    break;
                }
                Err(e) => {
                    self.fail(e.to_string(), false);
                    return;
                }
            }
        }

        if got_data {
            self.last_read = Instant::now();
            self.process_inbound();
        }
        if eof {
            self.fail("connection closed by peer", false);
        }
    }

    fn process_inbound(&mut self) {
        loop {
            let result = match self.phase {
                Phase::Connecting | Phase::Failed => return,
                Phase::Handshaking => self.receive_handshake(),
                Phase::Established => self.receive_frame(),
            };
            match result {
                Ok(true) => {}
                Ok(false) => return,
                Err(e) => {
                    warn!("protocol error: {}", e);
                    self.fail(e.to_string(), true);
                    return;
                }
            }
        }
    }

    /// `Ok(false)` means 'need more bytes'
    fn receive_handshake(&mut self) -> anyhow::Result<bool> {
        if self.inbound.len() < Frame::HEADER_LEN {
            return Ok(false);
        }
        if self.inbound[..Frame::HEADER_LEN] == Frame::settings().to_bytes()[..] {
            self.inbound.advance(Frame::HEADER_LEN);
            self.handshake_done();
            return Ok(true);
        }

        if self.inbound[3] == u8::from(FrameType::GoAway) {
            return match Frame::deser(&self.inbound)? {
                Some((frame, consumed)) => {
                    self.inbound.advance(consumed);
                    self.on_goaway(&frame);
                    Ok(false)
                }
                None => Ok(false),
            };
        }
        warn!("invalid handshake message, type={}", self.inbound[3]);
        bail!("handshake message is invalid");
    }

    fn receive_frame(&mut self) -> anyhow::Result<bool> {
        let Some((frame, consumed)) = Frame::deser(&self.inbound)? else {
            return Ok(false);
        };
        self.inbound.advance(consumed);
        trace!("received {:?} frame for stream {}, flags {:?}, {} payload bytes", frame.frame_type, frame.stream_id, frame.flags, frame.payload.len());

        match frame.frame_type {
            FrameType::Data => self.on_data(frame)?,
            FrameType::Header => {
                if frame.is_close_stream() {
                    self.on_rst(frame.stream_id);
                }
                else {
                    self.on_syn(frame.stream_id);
                }
            }
            FrameType::Settings => bail!("unexpected SETTINGS frame after handshake"),
            FrameType::Ping => self.on_ping(&frame),
            FrameType::GoAway => {
                self.on_goaway(&frame);
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn on_data(&mut self, frame: Frame) -> anyhow::Result<()> {
        if !frame.payload.is_empty() {
            let payload = if frame.flags.contains(FrameFlags::COMPRESSED) {
                decompress(&frame.payload, self.config.max_decompressed_len)?
            }
            else {
                frame.payload
            };

            let fits = match self.streams.get(&frame.stream_id) {
                Some(shared) => shared.borrow_mut().receive(payload, self.config.max_stream_receive_bytes),
                None => {
                    debug!("DATA for unknown stream {} - dropping", frame.stream_id);
                    true
                }
            };
            if !fits {
                self.reset_stream(frame.stream_id, "stream receive buffer overflow");
                return Ok(());
            }
        }

        if frame.flags.contains(FrameFlags::CLOSE_STREAM) {
            self.on_fin(frame.stream_id);
        }
        Ok(())
    }

    fn on_fin(&mut self, stream_id: u32) {
        let Some(shared) = self.streams.get(&stream_id).cloned() else {
            debug!("FIN for unknown stream {}", stream_id);
            return;
        };
        let mut stream = shared.borrow_mut();
        match stream.state {
            StreamState::Established => {
                debug!("stream {} half-closed by peer", stream_id);
                stream.state = StreamState::HalfClosedRemote;
                stream.core.set_eof();
            }
            StreamState::PendingOpen | StreamState::HalfClosedLocal => {
                debug!("stream {} closed", stream_id);
                stream.state = StreamState::Closed;
                stream.core.set_eof();
                drop(stream);
                self.streams.remove(&stream_id);
            }
            state => debug!("ignoring FIN for stream {} in state {:?}", stream_id, state),
        }
    }

    fn on_rst(&mut self, stream_id: u32) {
        let Some(shared) = self.streams.remove(&stream_id) else {
            debug!("RST for unknown stream {}", stream_id);
            return;
        };
        debug!("stream {} reset by peer", stream_id);
        shared.borrow_mut().kill("connection reset by peer");
        self.enqueue(Frame::rst(stream_id), false);
    }

    fn reset_stream(&mut self, stream_id: u32, reason: &str) {
        let Some(shared) = self.streams.remove(&stream_id) else {
            return;
        };
        warn!("resetting stream {}: {}", stream_id, reason);
        shared.borrow_mut().kill(reason);
        self.enqueue(Frame::rst(stream_id), false);
    }

    fn on_syn(&mut self, stream_id: u32) {
        if let Some(shared) = self.streams.get(&stream_id).cloned() {
            let mut stream = shared.borrow_mut();
            if stream.state != StreamState::PendingOpen {
                debug!("ignoring SYN for stream {} in state {:?}", stream_id, stream.state);
                return;
            }
            debug!("stream {} established", stream_id);
            stream.state = StreamState::Established;
            stream.core.alert_connected();
            if self.writable_len() == 0 {
                stream.core.readiness().cancel_writable();
                self.streams_blocked = true;
                drop(stream);
                self.update_write_interest();
            }
            return;
        }

        if !self.is_peer_stream_id(stream_id) || stream_id <= self.highest_peer_stream_id {
            debug!("ignoring SYN for stream {}: not a fresh id of the peer", stream_id);
            return;
        }
        self.highest_peer_stream_id = stream_id;

        if self.accept_queue.len() >= self.config.accept_backlog {
            warn!("accept backlog is full - resetting stream {}", stream_id);
            self.enqueue(Frame::rst(stream_id), false);
            return;
        }

        let (local, remote) = self.stream_addrs(stream_id);
        let shared = StreamShared::new(stream_id, StreamState::Established, SocketCore::accepted(local, remote));
        debug!("accepted stream {}", stream_id);
        self.streams.insert(stream_id, shared.clone());
        self.accept_queue.push_back(shared);
        self.readiness.set_readable();
        self.enqueue(Frame::header(stream_id), false);
    }

    fn on_ping(&mut self, frame: &Frame) {
        let Some(token) = frame.ping_token() else {
            debug!("ignoring PING with {} byte payload", frame.payload.len());
            return;
        };

        if !frame.flags.contains(FrameFlags::ACK) {
            trace!("answering PING {:#x}", token);
            self.enqueue(Frame::ping(token, true), true);
            return;
        }

        match self.keepalive_probes.remove(&token) {
            Some(timer) => {
                trace!("keep-alive PING {:#x} was answered", token);
                self.cancel_timer(Some(timer));
                self.keepalive_credit = (self.keepalive_credit + 1).min(self.config.keepalive_tolerance);
            }
            None => warn!("PING response {:#x} does not match a pending keep-alive probe", token),
        }
    }

    fn on_goaway(&mut self, frame: &Frame) {
        let msg = frame.goaway_message().unwrap_or_else(|| "GOAWAY".to_string());
        info!("peer sent GOAWAY: {}", msg);
        self.fail(msg, false);
    }

    fn on_keepalive_tick(&mut self) {
        if self.phase != Phase::Established {
            return;
        }
        if self.current.is_some() || !self.outbound.is_empty() || self.last_read.elapsed() < self.config.keepalive_idle {
            return;
        }

        let token = self.next_ping_token;
        self.next_ping_token = self.next_ping_token.wrapping_add(1);

        let Some(timer) = self.schedule(self.config.keepalive_timeout, move |conn| conn.on_keepalive_timeout(token)) else {
            return;
        };
        debug!("sending keep-alive PING {:#x}", token);
        self.keepalive_probes.insert(token, timer);
        self.enqueue(Frame::ping(token, false), true);
    }

    fn on_keepalive_timeout(&mut self, token: u64) {
        if self.keepalive_probes.remove(&token).is_none() {
            return;
        }
        if self.keepalive_credit == 0 {
            self.fail("keepalive response timeout", true);
        }
        else {
            warn!("keep-alive PING {:#x} timed out", token);
            self.keepalive_credit -= 1;
        }
    }

    /// Terminates the connection: all streams get `reason` as their error. If the failure was
    ///  detected locally, the peer is told through a GOAWAY before the lower connection is closed.
    fn fail(&mut self, reason: impl Into<String>, notify_peer: bool) {
        if self.failure.is_some() {
            return;
        }
        let reason = reason.into();
        error!("mux connection failed: {}", reason);

        let was_connecting = self.phase == Phase::Connecting;
        self.phase = Phase::Failed;
        self.failure = Some(reason.clone());

        let timers = [self.handshake_timer.take(), self.keepalive_timer.take()];
        for timer in timers {
            self.cancel_timer(timer);
        }
        let probes: Vec<TimerId> = self.keepalive_probes.drain().map(|(_, timer)| timer).collect();
        for timer in probes {
            self.cancel_timer(Some(timer));
        }

        for (_, shared) in self.streams.drain() {
            shared.borrow_mut().kill(&reason);
        }
        self.accept_queue.clear();
        self.inbound.clear();
        self.readiness.cancel_writable();
        self.readiness.set_readable();

        if notify_peer && !was_connecting && !self.lower_closed {
            self.outbound.clear();
            self.queued_bytes = self.current.as_ref().map(|b| b.len()).unwrap_or(0);
            self.enqueue(Frame::goaway(Frame::GOAWAY_NONE, Frame::GOAWAY_NONE, &reason), true);

            if self.schedule(self.config.fail_notify_delay, |conn| conn.teardown()).is_none() {
                self.teardown();
            }
        }
        else {
            self.teardown();
        }
    }

    /// closes the lower connection and drops its registration
    fn teardown(&mut self) {
        if self.lower_closed {
            return;
        }
        self.lower_closed = true;
        debug!("closing lower connection");

        self.current = None;
        self.outbound.clear();
        self.queued_bytes = 0;
        if let (Some(event_loop), Some(handle)) = (self.event_loop.upgrade(), self.handle.take()) {
            if let Err(e) = event_loop.remove(handle) {
                debug!("removing registration of lower connection failed: {}", e);
            }
        }
        self.lower.close();
    }

    pub(crate) fn stream_write(&mut self, shared: &Rc<RefCell<StreamShared>>, src: &[u8]) -> anyhow::Result<usize> {
        if let Some(reason) = &self.failure {
            bail!("{}", reason);
        }

        let stream_id = shared.borrow().id;
        let n = self.writable_len().min(src.len()).min(Frame::MAX_PAYLOAD_LEN);
        if n == 0 {
            trace!("no room for stream {} to write", stream_id);
            shared.borrow().core.readiness().cancel_writable();
            self.streams_blocked = true;
            self.update_write_interest();
            return Ok(0);
        }

        let data = &src[..n];
        let frame = match compress_if_smaller(data, self.config.compression_threshold) {
            Some(compressed) => Frame::data(stream_id, compressed, true),
            None => Frame::data(stream_id, Bytes::copy_from_slice(data), false),
        };
        self.enqueue(frame, false);
        if self.writable_len() == 0 {
            shared.borrow().core.readiness().cancel_writable();
            self.streams_blocked = true;
            self.update_write_interest();
        }
        Ok(n)
    }

    pub(crate) fn send_fin(&mut self, shared: &Rc<RefCell<StreamShared>>) {
        let (stream_id, state) = {
            let stream = shared.borrow();
            (stream.id, stream.state)
        };
        if self.failure.is_some() {
            return;
        }
        self.enqueue(Frame::fin(stream_id), false);

        let mut stream = shared.borrow_mut();
        stream.fin_sent = true;
        match state {
            StreamState::Established => {
                debug!("stream {} half-closed", stream_id);
                stream.state = StreamState::HalfClosedLocal;
                stream.core.readiness().cancel_writable();
            }
            _ => {
                debug!("stream {} closed", stream_id);
                stream.state = StreamState::Closed;
                stream.core.readiness().cancel_writable();
                drop(stream);
                self.streams.remove(&stream_id);
            }
        }
    }

    /// The application closed the stream: RST if requested, otherwise FIN if none was sent
    pub(crate) fn stream_closed(&mut self, shared: &Rc<RefCell<StreamShared>>) {
        let (stream_id, state, reset, fin_sent) = {
            let stream = shared.borrow();
            (stream.id, stream.state, stream.core.reset_on_close(), stream.fin_sent)
        };
        self.accept_queue.retain(|s| !Rc::ptr_eq(s, shared));
        if self.streams.remove(&stream_id).is_none() || self.failure.is_some() {
            return;
        }

        if state == StreamState::Closed {
            return;
        }
        if reset {
            debug!("resetting stream {}", stream_id);
            self.enqueue(Frame::rst(stream_id), false);
        }
        else if !fin_sent {
            self.enqueue(Frame::fin(stream_id), false);
        }
    }
}

impl Drop for ConnInner {
    fn drop(&mut self) {
        let span = span!(Level::TRACE, "mux_connection", conn_id = %self.conn_id);
        let _entered = span.enter();
        if self.failure.is_none() {
            self.fail("connection dropped", true);
        }
        // the delayed teardown can not run any more, so the GOAWAY gets a single write attempt
        self.flush();
        self.teardown();
    }
}

struct MuxHandler {
    conn: Weak<RefCell<ConnInner>>,
}

impl Handler for MuxHandler {
    fn readable(&mut self, _ctx: &HandlerContext<'_>) {
        with_conn(&self.conn, |conn| conn.on_readable());
    }

    fn writable(&mut self, _ctx: &HandlerContext<'_>) {
        with_conn(&self.conn, |conn| {
            if conn.phase == Phase::Connecting {
                match conn.lower.finish_connect() {
                    Ok(true) => conn.start_handshake(),
                    Ok(false) => return,
                    Err(e) => {
                        conn.fail(e.to_string(), false);
                        return;
                    }
                }
            }
            conn.flush();
        });
    }

    fn removed(&mut self, _ctx: &HandlerContext<'_>) {
        with_conn(&self.conn, |conn| {
            conn.handle = None;
            conn.fail("lower connection was removed from the event loop", false);
        });
    }
}

/// Multiplexes independent bidirectional streams over one reliable byte stream, using HTTP/2
///  style framing (see [Frame]).
///
/// Both sides start with a SETTINGS handshake; the client sends first as soon as the lower
///  connection is established. Either side can then open streams, clients with odd ids and servers
///  with even ids. Large DATA payloads are gzip compressed.
///
/// The connection signals through its [MuxConnection::readiness]: writable once established
///  (streams can be opened), readable when there are inbound streams to accept or the connection
///  failed.
#[derive(Clone)]
pub struct MuxConnection {
    inner: Rc<RefCell<ConnInner>>,
}

impl MuxConnection {
    pub fn client(event_loop: &SelectorEventLoop, lower: Box<dyn VirtualSocket>, config: MuxConfig) -> anyhow::Result<MuxConnection> {
        Self::new(event_loop, MuxRole::Client, lower, config)
    }

    pub fn server(event_loop: &SelectorEventLoop, lower: Box<dyn VirtualSocket>, config: MuxConfig) -> anyhow::Result<MuxConnection> {
        Self::new(event_loop, MuxRole::Server, lower, config)
    }

    fn new(event_loop: &SelectorEventLoop, role: MuxRole, lower: Box<dyn VirtualSocket>, config: MuxConfig) -> anyhow::Result<MuxConnection> {
        config.validate()?;
        if !lower.is_open() {
            bail!("lower connection is closed");
        }

        let lower_readiness = lower.readiness();
        let lower_connected = lower.is_connected();
        let phase = match role {
            MuxRole::Client => Phase::Connecting,
            MuxRole::Server => Phase::Handshaking,
        };
        let inner = Rc::new_cyclic(|self_ref| RefCell::new(ConnInner {
            role,
            conn_id: Uuid::new_v4(),
            phase,
            failure: None,
            readiness: Readiness::new(),
            lower_local: lower.local_addr().ok(),
            lower_remote: lower.remote_addr().ok(),
            lower,
            lower_closed: false,
            streams: FxHashMap::default(),
            accept_queue: VecDeque::new(),
            next_stream_id: if role == MuxRole::Client { 1 } else { 2 },
            highest_peer_stream_id: 0,
            inbound: BytesMut::new(),
            read_buf: vec![0u8; READ_CHUNK_SIZE],
            last_read: Instant::now(),
            current: None,
            outbound: VecDeque::new(),
            queued_bytes: 0,
            streams_blocked: false,
            keepalive_probes: FxHashMap::default(),
            next_ping_token: rand::random(),
            keepalive_credit: 0,
            config,
            event_loop: event_loop.downgrade(),
            handle: None,
            handshake_timer: None,
            keepalive_timer: None,
            self_ref: self_ref.clone(),
        }));

        let events = match role {
            MuxRole::Client => EventSet::READABLE | EventSet::WRITABLE,
            MuxRole::Server => EventSet::READABLE,
        };
        let handler = Rc::new(RefCell::new(MuxHandler { conn: Rc::downgrade(&inner) }));
        let handle = event_loop.add_virtual(&lower_readiness, events, handler)?;

        {
            let mut conn = inner.borrow_mut();
            conn.handle = Some(handle);
            debug!("[{}] new {:?} mux connection {:?} -> {:?}", conn.conn_id, role, conn.lower_local, conn.lower_remote);
            match role {
                MuxRole::Client if lower_connected => conn.start_handshake(),
                MuxRole::Client => {}
                MuxRole::Server => conn.start_handshake_timer(),
            }
        }
        Ok(MuxConnection { inner })
    }

    pub fn role(&self) -> MuxRole {
        self.inner.borrow().role
    }

    pub fn conn_id(&self) -> Uuid {
        self.inner.borrow().conn_id
    }

    pub fn state(&self) -> MuxState {
        self.inner.borrow().state()
    }

    pub fn readiness(&self) -> Readiness {
        self.inner.borrow().readiness.clone()
    }

    pub fn num_streams(&self) -> usize {
        self.inner.borrow().streams.len()
    }

    /// Opens a new stream. The stream is connected once the peer's SYN-ACK arrives.
    pub fn open_stream(&self) -> anyhow::Result<MuxStream> {
        let mut conn = self.inner.borrow_mut();
        match conn.phase {
            Phase::Established => {}
            Phase::Failed => bail!("{}", conn.failure.clone().unwrap_or_default()),
            _ => bail!("not ready"),
        }

        let stream_id = conn.next_stream_id;
        if stream_id > Frame::MAX_STREAM_ID {
            bail!("stream ids are exhausted");
        }
        conn.next_stream_id += 2;

        let (local, remote) = conn.stream_addrs(stream_id);
        let mut core = SocketCore::new(local);
        if let Some(remote) = remote {
            core.begin_connect(remote)?;
        }
        let shared = StreamShared::new(stream_id, StreamState::PendingOpen, core);
        debug!("opening stream {}", stream_id);
        conn.streams.insert(stream_id, shared.clone());
        conn.enqueue(Frame::header(stream_id), false);
        drop(conn);

        Ok(MuxStream::new(shared, self.inner.clone()))
    }

    /// Takes the oldest inbound stream that was not accepted yet
    pub fn accept(&self) -> anyhow::Result<Option<MuxStream>> {
        let mut conn = self.inner.borrow_mut();
        if let Some(reason) = &conn.failure {
            bail!("{}", reason);
        }
        let next = conn.accept_queue.pop_front();
        if conn.accept_queue.is_empty() {
            conn.readiness.cancel_readable();
        }
        drop(conn);

        Ok(next.map(|shared| MuxStream::new(shared, self.inner.clone())))
    }

    /// Fails all streams and tells the peer
    pub fn close(&self) {
        let span = span!(Level::TRACE, "mux_connection", conn_id = %self.conn_id());
        let _entered = span.enter();
        self.inner.borrow_mut().fail("connection closed", true);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use rstest::rstest;

    use super::*;
    use crate::mux::memory_pipe::MemoryPipe;

    fn poll(event_loop: &SelectorEventLoop) {
        for _ in 0..10 {
            event_loop.one_poll(Some(Duration::ZERO)).unwrap();
        }
    }

    fn poll_until(event_loop: &SelectorEventLoop, mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() {
            assert!(start.elapsed() < Duration::from_secs(5), "timeout");
            event_loop.one_poll(Some(Duration::from_millis(5))).unwrap();
        }
    }

    fn read_all(stream: &mut impl VirtualSocket) -> Vec<u8> {
        let mut result = Vec::new();
        let mut buf = [0u8; 1024];
        while let Ok(ReadResult::Data(n)) = stream.read(&mut buf) {
            result.extend_from_slice(&buf[..n]);
        }
        result
    }

    fn text(len: usize) -> Vec<u8> {
        b"all work and no play makes jack a dull boy. ".iter().cycle().take(len).copied().collect()
    }

    /// a server mux on one end of a pipe, the test speaking raw frames on the other end
    fn established_server(event_loop: &SelectorEventLoop, config: MuxConfig) -> (MuxConnection, MemoryPipe) {
        let (lower, mut raw) = MemoryPipe::pair(1 << 20);
        let server = MuxConnection::server(event_loop, Box::new(lower), config).unwrap();
        raw.write_frame(&Frame::settings());
        poll(event_loop);
        assert_eq!(raw.read_frames(), vec![Frame::settings()]);
        assert_eq!(server.state(), MuxState::Established);
        (server, raw)
    }

    fn established_client(event_loop: &SelectorEventLoop) -> (MuxConnection, MemoryPipe) {
        let (lower, mut raw) = MemoryPipe::pair(1 << 20);
        let client = MuxConnection::client(event_loop, Box::new(lower), MuxConfig::default()).unwrap();
        poll(event_loop);
        assert_eq!(raw.read_frames(), vec![Frame::settings()]);
        assert_eq!(client.state(), MuxState::Handshaking);
        raw.write_frame(&Frame::settings());
        poll(event_loop);
        assert_eq!(client.state(), MuxState::Established);
        (client, raw)
    }

    fn open_via_raw(event_loop: &SelectorEventLoop, client: &MuxConnection, raw: &mut MemoryPipe) -> MuxStream {
        let stream = client.open_stream().unwrap();
        poll(event_loop);
        assert_eq!(raw.read_frames(), vec![Frame::header(stream.stream_id())]);
        raw.write_frame(&Frame::header(stream.stream_id()));
        poll(event_loop);
        assert!(stream.is_connected());
        stream
    }

    #[test]
    fn test_client_server_streams() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (a, b) = MemoryPipe::pair(1 << 20);
        let client = MuxConnection::client(&event_loop, Box::new(a), MuxConfig::default()).unwrap();
        let server = MuxConnection::server(&event_loop, Box::new(b), MuxConfig::default()).unwrap();
        poll_until(&event_loop, || client.state() == MuxState::Established && server.state() == MuxState::Established);
        assert!(client.readiness().fired().contains(EventSet::WRITABLE));

        let mut c1 = client.open_stream().unwrap();
        let mut c2 = client.open_stream().unwrap();
        assert_eq!((c1.stream_id(), c2.stream_id()), (1, 3));
        let mut s_opened = server.open_stream().unwrap();
        assert_eq!(s_opened.stream_id(), 2);

        poll_until(&event_loop, || c1.is_connected() && c2.is_connected() && s_opened.is_connected());
        let mut s1 = server.accept().unwrap().unwrap();
        let mut s2 = server.accept().unwrap().unwrap();
        assert!(server.accept().unwrap().is_none());
        let mut c_accepted = client.accept().unwrap().unwrap();
        assert_eq!((s1.stream_id(), s2.stream_id(), c_accepted.stream_id()), (1, 3, 2));

        assert_eq!(c1.local_addr().unwrap(), "0.0.0.1:1000".parse::<SocketAddr>().unwrap());
        assert_eq!(s1.remote_addr().unwrap(), "0.0.0.1:1000".parse::<SocketAddr>().unwrap());
        assert_eq!(s1.local_addr().unwrap(), "10.0.0.2:2000".parse::<SocketAddr>().unwrap());

        let big = text(50_000);
        assert_eq!(c1.write(&big).unwrap(), big.len());
        assert_eq!(c2.write(b"second").unwrap(), 6);
        assert_eq!(s_opened.write(b"from server").unwrap(), 11);

        let mut received_1 = Vec::new();
        let mut received_2 = Vec::new();
        let mut received_c = Vec::new();
        poll_until(&event_loop, || {
            received_1.extend(read_all(&mut s1));
            received_2.extend(read_all(&mut s2));
            received_c.extend(read_all(&mut c_accepted));
            received_1.len() == big.len() && received_2.len() == 6 && received_c.len() == 11
        });
        assert!(received_1 == big);
        assert_eq!(received_2, b"second");
        assert_eq!(received_c, b"from server");

        c1.shutdown_output().unwrap();
        assert!(c1.write(b"x").is_err());
        poll_until(&event_loop, || s1.read(&mut [0u8; 16]).unwrap() == ReadResult::Eof);
        assert_eq!(s1.write(b"bye").unwrap(), 3);
        s1.shutdown_output().unwrap();
        assert_eq!(s1.state(), StreamState::Closed);

        poll_until(&event_loop, || c1.state() == StreamState::Closed);
        assert_eq!(read_all(&mut c1), b"bye");
        assert_eq!(c1.read(&mut [0u8; 16]).unwrap(), ReadResult::Eof);
    }

    #[test]
    fn test_compressed_data_on_the_wire() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (client, mut raw) = established_client(&event_loop);

        let mut stream = client.open_stream().unwrap();
        assert_eq!(stream.stream_id(), 1);
        raw.write_frame(&Frame::header(1));
        poll(&event_loop);
        assert!(stream.is_connected());

        let data = text(2000);
        assert_eq!(stream.write(&data).unwrap(), 2000);
        poll(&event_loop);

        let frames = raw.read_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], Frame::header(1));
        assert_eq!(frames[1].frame_type, FrameType::Data);
        assert_eq!(frames[1].stream_id, 1);
        assert_eq!(frames[1].flags, FrameFlags::COMPRESSED);
        assert!(frames[1].payload.len() < 2000);
        assert_eq!(&decompress(&frames[1].payload, 1 << 20).unwrap()[..], &data[..]);
    }

    #[test]
    fn test_ping_is_answered_ahead_of_queued_data() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (server, mut raw) = established_server(&event_loop, MuxConfig::default());

        raw.write_frame(&Frame::header(1));
        poll(&event_loop);
        assert_eq!(raw.read_frames(), vec![Frame::header(1)]);
        let mut stream = server.accept().unwrap().unwrap();

        assert_eq!(stream.write(b"data").unwrap(), 4);
        raw.write_frame(&Frame::ping(0x4711, false));
        poll(&event_loop);

        assert_eq!(raw.read_frames(), vec![
            Frame::ping(0x4711, true),
            Frame::data(1, Bytes::from_static(b"data"), false),
        ]);
    }

    #[test]
    fn test_goaway_fails_streams() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (client, mut raw) = established_client(&event_loop);
        let mut s1 = open_via_raw(&event_loop, &client, &mut raw);
        let mut s3 = open_via_raw(&event_loop, &client, &mut raw);

        raw.write_frame(&Frame::goaway(Frame::GOAWAY_NONE, Frame::GOAWAY_NONE, "boom"));
        raw.write_frame(&Frame::data(1, Bytes::from_static(b"late"), false));
        poll(&event_loop);

        assert_eq!(client.state(), MuxState::Failed("boom".to_string()));
        assert!(client.readiness().fired().contains(EventSet::READABLE));
        for stream in [&mut s1, &mut s3] {
            assert_eq!(stream.read(&mut [0u8; 16]).unwrap_err().to_string(), "boom");
            assert_eq!(stream.write(b"x").unwrap_err().to_string(), "boom");
        }
        assert_eq!(client.open_stream().unwrap_err().to_string(), "boom");
        assert!(raw.read_frames().is_empty());
        assert!(raw.is_peer_closed());
    }

    #[test]
    fn test_goaway_without_message() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (client, mut raw) = established_client(&event_loop);
        raw.write_frame(&Frame::goaway(0, 0, ""));
        poll(&event_loop);
        assert_eq!(client.state(), MuxState::Failed("GOAWAY".to_string()));
    }

    #[test]
    fn test_rst_is_stream_local() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (client, mut raw) = established_client(&event_loop);
        let mut s1 = open_via_raw(&event_loop, &client, &mut raw);
        let mut s3 = open_via_raw(&event_loop, &client, &mut raw);

        raw.write_frame(&Frame::rst(1));
        poll(&event_loop);
        assert_eq!(raw.read_frames(), vec![Frame::rst(1)]);
        assert_eq!(s1.read(&mut [0u8; 16]).unwrap_err().to_string(), "connection reset by peer");
        assert_eq!(s1.write(b"x").unwrap_err().to_string(), "connection reset by peer");

        assert_eq!(s3.write(b"still alive").unwrap(), 11);
        poll(&event_loop);
        assert_eq!(raw.read_frames(), vec![Frame::data(3, Bytes::from_static(b"still alive"), false)]);
        assert_eq!(client.state(), MuxState::Established);

        s1.close();
        poll(&event_loop);
        assert!(raw.read_frames().is_empty());
    }

    #[test]
    fn test_fin_and_data_in_one_frame() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (client, mut raw) = established_client(&event_loop);
        let mut stream = open_via_raw(&event_loop, &client, &mut raw);

        let mut frame = Frame::data(1, Bytes::from_static(b"abc"), false);
        frame.flags |= FrameFlags::CLOSE_STREAM;
        raw.write_frame(&frame);
        raw.write_frame(&Frame::data(1, Bytes::new(), false));
        poll(&event_loop);

        let mut buf = [0u8; 16];
        assert_eq!(stream.read(&mut buf).unwrap(), ReadResult::Data(3));
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(stream.read(&mut buf).unwrap(), ReadResult::Eof);
        assert_eq!(stream.state(), StreamState::HalfClosedRemote);

        assert_eq!(stream.write(b"reply").unwrap(), 5);
        stream.shutdown_output().unwrap();
        poll(&event_loop);
        assert_eq!(raw.read_frames(), vec![
            Frame::data(1, Bytes::from_static(b"reply"), false),
            Frame::fin(1),
        ]);
        assert_eq!(stream.state(), StreamState::Closed);
        assert_eq!(client.num_streams(), 0);
    }

    #[test]
    fn test_close_is_idempotent() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (client, mut raw) = established_client(&event_loop);
        let mut stream = open_via_raw(&event_loop, &client, &mut raw);

        stream.close();
        stream.close();
        assert!(!stream.is_open());
        assert_eq!(stream.read(&mut [0u8; 4]).unwrap_err().to_string(), "socket is closed");
        poll(&event_loop);
        assert_eq!(raw.read_frames(), vec![Frame::fin(1)]);

        let mut stream = open_via_raw(&event_loop, &client, &mut raw);
        stream.set_reset_on_close(true);
        stream.close();
        stream.close();
        poll(&event_loop);
        assert_eq!(raw.read_frames(), vec![Frame::rst(3)]);

        client.close();
        client.close();
        assert_eq!(client.state(), MuxState::Failed("connection closed".to_string()));
    }

    #[test]
    fn test_accept_backlog() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let config = MuxConfig {
            accept_backlog: 1,
            ..Default::default()
        };
        let (server, mut raw) = established_server(&event_loop, config);

        raw.write_frame(&Frame::header(1));
        raw.write_frame(&Frame::header(3));
        // even ids are the server's, reused ids are ignored
        raw.write_frame(&Frame::header(4));
        raw.write_frame(&Frame::header(1));
        poll(&event_loop);

        assert_eq!(raw.read_frames(), vec![Frame::header(1), Frame::rst(3)]);
        assert!(server.readiness().fired().contains(EventSet::READABLE));
        assert_eq!(server.accept().unwrap().unwrap().stream_id(), 1);
        assert!(!server.readiness().fired().contains(EventSet::READABLE));
    }

    #[test]
    fn test_unread_data_limit_resets_stream() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let config = MuxConfig {
            max_stream_receive_bytes: 100,
            ..Default::default()
        };
        let (server, mut raw) = established_server(&event_loop, config);
        raw.write_frame(&Frame::header(1));
        raw.write_frame(&Frame::header(3));
        poll(&event_loop);
        assert_eq!(raw.read_frames(), vec![Frame::header(1), Frame::header(3)]);
        let mut s1 = server.accept().unwrap().unwrap();
        let mut s3 = server.accept().unwrap().unwrap();

        // reading makes room again
        raw.write_frame(&Frame::data(3, Bytes::from(vec![7u8; 80]), false));
        poll(&event_loop);
        assert_eq!(read_all(&mut s3).len(), 80);
        raw.write_frame(&Frame::data(3, Bytes::from(vec![7u8; 80]), false));

        raw.write_frame(&Frame::data(1, Bytes::from(vec![1u8; 60]), false));
        raw.write_frame(&Frame::data(1, Bytes::from(vec![2u8; 60]), false));
        poll(&event_loop);

        assert_eq!(raw.read_frames(), vec![Frame::rst(1)]);
        assert_eq!(s1.read(&mut [0u8; 16]).unwrap_err().to_string(), "stream receive buffer overflow");
        assert_eq!(s1.state(), StreamState::Closed);

        assert_eq!(read_all(&mut s3).len(), 80);
        assert_eq!(server.state(), MuxState::Established);
        assert_eq!(server.num_streams(), 1);
    }

    #[test]
    fn test_dropped_connection_is_torn_down() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (client, mut raw) = established_client(&event_loop);
        let handle = client.inner.borrow().handle.unwrap();

        drop(client);
        assert!(!event_loop.is_registered(handle));
        assert_eq!(raw.read_frames(), vec![Frame::goaway(Frame::GOAWAY_NONE, Frame::GOAWAY_NONE, "connection dropped")]);
        assert!(raw.is_peer_closed());
        poll(&event_loop);
    }

    #[test]
    fn test_streams_keep_dropped_connection_alive() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (client, mut raw) = established_client(&event_loop);
        let mut stream = open_via_raw(&event_loop, &client, &mut raw);

        drop(client);
        assert_eq!(stream.write(b"still here").unwrap(), 10);
        poll(&event_loop);
        assert_eq!(raw.read_frames(), vec![Frame::data(1, Bytes::from_static(b"still here"), false)]);

        stream.close();
        poll(&event_loop);
        assert_eq!(raw.read_frames(), vec![Frame::fin(1)]);
        assert!(!raw.is_peer_closed());

        drop(stream);
        assert_eq!(raw.read_frames(), vec![Frame::goaway(Frame::GOAWAY_NONE, Frame::GOAWAY_NONE, "connection dropped")]);
        assert!(raw.is_peer_closed());
    }

    #[rstest]
    #[case::header_first(Frame::header(1), "handshake message is invalid")]
    #[case::goaway(Frame::goaway(0, 0, "go away"), "go away")]
    fn test_invalid_handshake(#[case] first: Frame, #[case] expected: &str) {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (lower, mut raw) = MemoryPipe::pair(1 << 20);
        let server = MuxConnection::server(&event_loop, Box::new(lower), MuxConfig::default()).unwrap();

        raw.write_frame(&first);
        poll(&event_loop);
        assert_eq!(server.state(), MuxState::Failed(expected.to_string()));
    }

    #[rstest]
    #[case::settings_after_handshake(vec![0, 0, 0, 4, 0, 0, 0, 0, 0], "unexpected SETTINGS frame after handshake")]
    #[case::unknown_type(vec![0, 0, 0, 9, 0, 0, 0, 0, 1], "invalid frame type: 9")]
    #[case::reserved_bit(vec![0, 0, 0, 1, 0, 0x80, 0, 0, 1], "invalid stream id: 0x80000001")]
    fn test_protocol_errors_send_goaway(#[case] raw_frame: Vec<u8>, #[case] expected: &str) {
        let event_loop = SelectorEventLoop::new().unwrap();
        let config = MuxConfig {
            fail_notify_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let (server, mut raw) = established_server(&event_loop, config);

        raw.write_raw(&raw_frame);
        poll(&event_loop);
        assert_eq!(server.state(), MuxState::Failed(expected.to_string()));
        assert_eq!(raw.read_frames(), vec![Frame::goaway(Frame::GOAWAY_NONE, Frame::GOAWAY_NONE, expected)]);

        poll_until(&event_loop, || raw.is_peer_closed());
    }

    #[test]
    fn test_corrupt_compressed_payload() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (server, mut raw) = established_server(&event_loop, MuxConfig::default());

        raw.write_frame(&Frame::header(1));
        raw.write_frame(&Frame::data(1, Bytes::from_static(b"definitely not gzip"), true));
        poll(&event_loop);

        let MuxState::Failed(reason) = server.state() else {
            panic!("connection should have failed");
        };
        assert!(reason.starts_with("decompress data failed"), "{}", reason);
        let frames = raw.read_frames();
        assert_eq!(frames.last().unwrap().goaway_message(), Some(reason));
    }

    #[test]
    fn test_handshake_timeout() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let config = MuxConfig {
            handshake_timeout: Duration::from_millis(30),
            fail_notify_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let (lower, mut raw) = MemoryPipe::pair(1 << 20);
        let server = MuxConnection::server(&event_loop, Box::new(lower), config).unwrap();

        poll_until(&event_loop, || server.state() != MuxState::Handshaking);
        assert_eq!(server.state(), MuxState::Failed("handshake timed out".to_string()));
        poll_until(&event_loop, || raw.is_peer_closed());
        assert_eq!(raw.read_frames(), vec![Frame::goaway(Frame::GOAWAY_NONE, Frame::GOAWAY_NONE, "handshake timed out")]);
    }

    #[test]
    fn test_keepalive_timeout() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let config = MuxConfig {
            keepalive_interval: Duration::from_millis(20),
            keepalive_idle: Duration::ZERO,
            keepalive_timeout: Duration::from_millis(30),
            fail_notify_delay: Duration::from_millis(10),
            ..Default::default()
        };
        let (server, mut raw) = established_server(&event_loop, config);

        let mut frames = Vec::new();
        poll_until(&event_loop, || {
            frames.extend(raw.read_frames());
            server.state() != MuxState::Established
        });
        assert_eq!(server.state(), MuxState::Failed("keepalive response timeout".to_string()));
        assert_eq!(frames[0].frame_type, FrameType::Ping);
        assert!(!frames[0].flags.contains(FrameFlags::ACK));
    }

    #[test]
    fn test_keepalive_answered() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let config = MuxConfig {
            keepalive_interval: Duration::from_millis(10),
            keepalive_idle: Duration::ZERO,
            keepalive_timeout: Duration::from_millis(50),
            ..Default::default()
        };
        let (server, mut raw) = established_server(&event_loop, config);

        let mut num_answered = 0;
        poll_until(&event_loop, || {
            for frame in raw.read_frames() {
                assert_eq!(frame.frame_type, FrameType::Ping);
                raw.write_frame(&Frame::ping(frame.ping_token().unwrap(), true));
                num_answered += 1;
            }
            num_answered >= 5
        });
        assert_eq!(server.state(), MuxState::Established);
    }

    #[test]
    fn test_backpressure() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (lower, mut raw) = MemoryPipe::pair(100);
        let client = MuxConnection::client(&event_loop, Box::new(lower), MuxConfig::default()).unwrap();
        poll(&event_loop);
        raw.read_frames();
        raw.write_frame(&Frame::settings());
        poll(&event_loop);
        let mut stream = client.open_stream().unwrap();
        poll(&event_loop);
        raw.read_frames();
        raw.write_frame(&Frame::header(1));
        poll(&event_loop);

        assert_eq!(stream.write(&[1u8; 500]).unwrap(), 100);
        assert_eq!(stream.write(&[1u8; 500]).unwrap(), 0);
        assert!(!stream.readiness().fired().contains(EventSet::WRITABLE));

        poll(&event_loop);
        assert_eq!(raw.read_raw().len(), 100);
        poll(&event_loop);
        assert_eq!(raw.read_raw().len(), Frame::HEADER_LEN);
        poll(&event_loop);
        assert!(stream.readiness().fired().contains(EventSet::WRITABLE));
        assert!(stream.write(&[1u8; 10]).unwrap() > 0);
    }

    #[test]
    fn test_lower_eof_fails_connection() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let (client, mut raw) = established_client(&event_loop);
        let mut stream = open_via_raw(&event_loop, &client, &mut raw);

        raw.close();
        poll(&event_loop);
        assert_eq!(client.state(), MuxState::Failed("connection closed by peer".to_string()));
        assert_eq!(stream.read(&mut [0u8; 4]).unwrap_err().to_string(), "connection closed by peer");
    }
}
