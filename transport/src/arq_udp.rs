use std::cell::RefCell;
use std::collections::hash_map::Entry;
use std::collections::VecDeque;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};
use std::time::Instant;

use anyhow::{anyhow, bail};
use bytes::{Buf, Bytes};
use rustc_hash::FxHashMap;
use selector::{EventSet, Handle, Handler, HandlerContext, ReadResult, Readiness, SelectorEventLoop, SocketCore, SocketState, TimerId, VirtualSocket, WeakEventLoop};
use tracing::{debug, error, info, span, trace, warn, Level};
use uuid::Uuid;

use crate::arq::ArqEngine;
use crate::config::ArqTransportConfig;
use crate::datagram_socket::DatagramSocket;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerKey {
    pub local: SocketAddr,
    pub remote: SocketAddr,
}

/// A peer that sent datagrams but was not accepted yet
struct PendingPeer {
    datagrams: VecDeque<Bytes>,
    last_inbound: Instant,
}

struct PeerConnection {
    key: PeerKey,
    conn_id: Uuid,
    engine: ArqEngine,
    core: SocketCore,
    inbound: VecDeque<Bytes>,
    last_inbound: Instant,
}

impl PeerConnection {
    /// moves received payload to the socket's buffer and updates readiness accordingly
    fn update_signals(&mut self) {
        let received = self.engine.recv();
        if !received.is_empty() {
            self.inbound.extend(received);
            self.core.readiness().set_readable();
        }

        if self.engine.writable_capacity() > 0 {
            match self.core.state() {
                SocketState::Connecting => self.core.alert_connected(),
                SocketState::Connected => self.core.readiness().set_writable(),
                _ => {}
            }
        }
        else {
            self.core.readiness().cancel_writable();
        }
    }

    fn fail(&mut self, msg: impl Into<String>) {
        self.core.raise_error(msg);
    }
}

struct TransportInner {
    socket: Box<dyn DatagramSocket>,
    local_addr: SocketAddr,
    config: ArqTransportConfig,
    accepting: bool,
    closed: bool,

    peers: FxHashMap<PeerKey, Rc<RefCell<PeerConnection>>>,
    pending: FxHashMap<PeerKey, PendingPeer>,
    accept_queue: VecDeque<PeerKey>,
    listener: Readiness,

    outbound: VecDeque<(SocketAddr, Bytes)>,
    not_fully_sent: bool,
    recv_buf: Vec<u8>,
    epoch: Instant,

    event_loop: WeakEventLoop,
    handle: Option<Handle>,
    timer: Option<TimerId>,
}

impl TransportInner {
    fn now_ms(&self) -> u32 {
        // wrapping millisecond clock, as the ARQ engine expects
        self.epoch.elapsed().as_millis() as u32
    }

    fn new_peer(&self, key: PeerKey, core: SocketCore) -> Rc<RefCell<PeerConnection>> {
        let conn_id = Uuid::new_v4();
        info!("[{}] new ARQ peer connection {:?}", conn_id, key);
        Rc::new(RefCell::new(PeerConnection {
            key,
            conn_id,
            engine: ArqEngine::new(self.config.conversation, &self.config.arq),
            core,
            inbound: VecDeque::new(),
            last_inbound: Instant::now(),
        }))
    }

    fn on_readable(&mut self) {
        loop {
            match self.socket.recv_from(&mut self.recv_buf) {
                Ok((n, from)) => {
                    let datagram = Bytes::copy_from_slice(&self.recv_buf[..n]);
                    self.on_datagram(from, datagram);
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("receiving datagram failed: {}", e);
                    break;
                }
            }
        }
    }

    fn on_datagram(&mut self, from: SocketAddr, datagram: Bytes) {
        let key = PeerKey { local: self.local_addr, remote: from };

        if let Some(peer) = self.peers.get(&key).cloned() {
            let mut peer = peer.borrow_mut();
            let span = span!(Level::TRACE, "datagram_received", conn_id = %peer.conn_id);
            let _entered = span.enter();
            trace!("received {} bytes from {:?}", datagram.len(), from);

            peer.last_inbound = Instant::now();
            match peer.engine.input(datagram) {
                Ok(()) => peer.update_signals(),
                Err(e) => {
                    warn!("malformed datagram from {:?}: {} - terminating connection", from, e);
                    peer.fail(format!("malformed datagram: {}", e));
                    drop(peer);
                    self.peers.remove(&key);
                }
            }
            return;
        }

        let max_pending = self.config.max_pending_datagrams;
        match self.pending.entry(key) {
            Entry::Occupied(mut e) => {
                let pending = e.get_mut();
                pending.last_inbound = Instant::now();
                if pending.datagrams.len() < max_pending {
                    pending.datagrams.push_back(datagram);
                }
                else {
                    debug!("too many datagrams from {:?} waiting to be accepted - dropping", from);
                }
            }
            Entry::Vacant(e) => {
                if !self.accepting {
                    debug!("received datagram from unknown peer {:?}, dropping", from);
                    return;
                }
                debug!("initializing pending peer {:?}", from);
                e.insert(PendingPeer {
                    datagrams: VecDeque::from([datagram]),
                    last_inbound: Instant::now(),
                });
                self.accept_queue.push_back(key);
                self.listener.set_readable();
            }
        }
    }

    fn tick(&mut self) {
        if self.closed {
            return;
        }
        let now = Instant::now();
        let now_ms = self.now_ms();
        let idle_timeout = self.config.idle_timeout;

        self.pending.retain(|key, pending| {
            let alive = now.duration_since(pending.last_inbound) < idle_timeout;
            if !alive {
                debug!("pending peer {:?} was not accepted in time - discarding", key.remote);
            }
            alive
        });
        let pending = &self.pending;
        self.accept_queue.retain(|key| pending.contains_key(key));
        if self.accept_queue.is_empty() {
            self.listener.cancel_readable();
        }

        let mut output = Vec::new();
        let mut terminated = Vec::new();
        for (key, peer) in &self.peers {
            let mut peer = peer.borrow_mut();
            let span = span!(Level::TRACE, "arq_tick", conn_id = %peer.conn_id);
            let _entered = span.enter();

            if !peer.core.is_open() {
                debug!("socket to {:?} was closed - tearing down", key.remote);
                terminated.push(*key);
                continue;
            }
            if now.duration_since(peer.last_inbound) >= idle_timeout {
                info!("peer {:?} idle for {:?} - tearing down", key.remote, idle_timeout);
                peer.fail("connection timed out");
                terminated.push(*key);
                continue;
            }

            match peer.engine.clock(now_ms) {
                Ok(datagrams) => {
                    output.extend(datagrams.into_iter().map(|d| (key.remote, d)));
                    peer.update_signals();
                }
                Err(e) => {
                    error!("ARQ connection to {:?} failed: {}", key.remote, e);
                    peer.fail(e.to_string());
                    terminated.push(*key);
                }
            }
        }

        for key in terminated {
            self.peers.remove(&key);
        }

        if !output.is_empty() {
            if self.not_fully_sent {
                debug!("discarding {} deferred datagrams in favor of fresh output", self.outbound.len());
                self.outbound.clear();
            }
            self.outbound.extend(output);
            self.flush_outbound();
        }
    }

    fn flush_outbound(&mut self) {
        while let Some((to, datagram)) = self.outbound.front() {
            match self.socket.send_to(datagram, *to) {
                Ok(n) => {
                    if n < datagram.len() {
                        warn!("should not happen: partial datagram write to {:?}, {} of {} bytes", to, n, datagram.len());
                    }
                    self.outbound.pop_front();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    trace!("socket would block - deferring {} datagrams", self.outbound.len());
                    self.not_fully_sent = true;
                    return;
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("sending datagram to {:?} failed: {}", to, e);
                    self.outbound.pop_front();
                }
            }
        }
        self.not_fully_sent = false;
    }

    fn on_writable(&mut self) {
        if self.not_fully_sent {
            self.flush_outbound();
        }
    }

    fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        info!("closing ARQ transport on {:?}", self.local_addr);

        for peer in self.peers.values() {
            peer.borrow_mut().fail("transport closed");
        }
        self.peers.clear();
        self.pending.clear();
        self.accept_queue.clear();
        self.outbound.clear();
        self.listener.cancel_readable();
        self.listener.detach();

        if let Some(event_loop) = self.event_loop.upgrade() {
            if let Some(handle) = self.handle.take() {
                if let Err(e) = event_loop.remove(handle) {
                    debug!("removing transport registration failed: {}", e);
                }
            }
            if let Some(timer) = self.timer.take() {
                event_loop.cancel_timer(timer);
            }
        }
    }
}

impl Drop for TransportInner {
    fn drop(&mut self) {
        self.close();
    }
}

struct TransportHandler {
    inner: Weak<RefCell<TransportInner>>,
}

impl TransportHandler {
    fn with_inner(&self, f: impl FnOnce(&mut TransportInner)) {
        if let Some(inner) = self.inner.upgrade() {
            match inner.try_borrow_mut() {
                Ok(mut inner) => f(&mut inner),
                Err(_) => error!("should not happen: ARQ transport is busy"),
            };
        }
    }
}

impl Handler for TransportHandler {
    fn readable(&mut self, _ctx: &HandlerContext<'_>) {
        self.with_inner(|inner| inner.on_readable());
    }

    fn writable(&mut self, _ctx: &HandlerContext<'_>) {
        self.with_inner(|inner| inner.on_writable());
    }
}

/// Reliable stream connections over a single datagram socket, with one ARQ engine per peer.
///
/// The transport registers its socket with the event loop and clocks all engines periodically
///  at the configured interval. Received datagrams are demultiplexed by peer address:
///  * datagrams of connected / accepted peers go to the peer's engine,
///  * datagrams of unknown peers are buffered as pending if the transport is accepting (and
///    dropped otherwise). Pending peers are reported through [ArqUdpTransport::listener] and
///    promoted to connections by [ArqUdpTransport::accept].
///
/// The transport tears down connections that were closed, were idle for too long, or whose ARQ
///  engine failed.
#[derive(Clone)]
pub struct ArqUdpTransport {
    inner: Rc<RefCell<TransportInner>>,
}

impl ArqUdpTransport {
    pub fn bind(event_loop: &SelectorEventLoop, addr: SocketAddr, config: ArqTransportConfig, accepting: bool) -> anyhow::Result<ArqUdpTransport> {
        let socket = mio::net::UdpSocket::bind(addr)?;
        Self::new(event_loop, Box::new(socket), config, accepting)
    }

    pub fn new(event_loop: &SelectorEventLoop, socket: Box<dyn DatagramSocket>, config: ArqTransportConfig, accepting: bool) -> anyhow::Result<ArqUdpTransport> {
        config.validate()?;
        let local_addr = socket.local_addr()?;
        let interval = config.arq.interval_duration();
        let fd = socket.raw_fd();

        let inner = Rc::new(RefCell::new(TransportInner {
            socket,
            local_addr,
            recv_buf: vec![0u8; config.max_datagram_size],
            config,
            accepting,
            closed: false,
            peers: FxHashMap::default(),
            pending: FxHashMap::default(),
            accept_queue: VecDeque::new(),
            listener: Readiness::new(),
            outbound: VecDeque::new(),
            not_fully_sent: false,
            epoch: Instant::now(),
            event_loop: event_loop.downgrade(),
            handle: None,
            timer: None,
        }));

        let handler = Rc::new(RefCell::new(TransportHandler { inner: Rc::downgrade(&inner) }));
        let handle = event_loop.add_real_writable_aware(fd, EventSet::READABLE, handler)?;

        let weak = Rc::downgrade(&inner);
        let timer = event_loop.period(interval, move |_| {
            if let Some(inner) = weak.upgrade() {
                match inner.try_borrow_mut() {
                    Ok(mut inner) => inner.tick(),
                    Err(_) => warn!("ARQ transport is busy - skipping clock tick"),
                };
            }
        })?;

        {
            let mut inner = inner.borrow_mut();
            inner.handle = Some(handle);
            inner.timer = Some(timer);
        }
        info!("ARQ transport bound to {:?}, accepting: {}", local_addr, accepting);
        Ok(ArqUdpTransport { inner })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.borrow().local_addr
    }

    /// Readable while there are peers waiting to be accepted
    pub fn listener(&self) -> Readiness {
        self.inner.borrow().listener.clone()
    }

    pub fn num_connections(&self) -> usize {
        self.inner.borrow().peers.len()
    }

    /// Starts connecting to `remote`. The returned socket becomes connected (and writable) on the
    ///  transport's next clock tick.
    pub fn connect(&self, remote: SocketAddr) -> anyhow::Result<ArqUdpSocket> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            bail!("transport is closed");
        }
        let key = PeerKey { local: inner.local_addr, remote };
        if inner.peers.contains_key(&key) || inner.pending.contains_key(&key) {
            bail!("already connected to {:?}", remote);
        }

        let mut core = SocketCore::new(Some(inner.local_addr));
        core.begin_connect(remote)?;
        let peer = inner.new_peer(key, core);
        inner.peers.insert(key, peer.clone());
        Ok(ArqUdpSocket { peer })
    }

    /// Promotes the oldest pending peer to a connection, feeding it the datagrams received so far.
    ///  Returns `None` if no peer is waiting.
    pub fn accept(&self) -> anyhow::Result<Option<ArqUdpSocket>> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            bail!("transport is closed");
        }

        while let Some(key) = inner.accept_queue.pop_front() {
            let Some(pending) = inner.pending.remove(&key) else {
                continue;
            };
            if inner.accept_queue.is_empty() {
                inner.listener.cancel_readable();
            }

            let peer = inner.new_peer(key, SocketCore::accepted(Some(key.local), Some(key.remote)));
            {
                let mut p = peer.borrow_mut();
                p.last_inbound = pending.last_inbound;
                for datagram in pending.datagrams {
                    if let Err(e) = p.engine.input(datagram) {
                        warn!("malformed datagram from {:?}: {} - terminating connection", key.remote, e);
                        p.fail(format!("malformed datagram: {}", e));
                        break;
                    }
                }
                p.update_signals();
            }
            if peer.borrow().core.error().is_none() {
                inner.peers.insert(key, peer.clone());
            }
            return Ok(Some(ArqUdpSocket { peer }));
        }

        inner.listener.cancel_readable();
        Ok(None)
    }

    /// Closes the transport and fails all of its connections
    pub fn close(&self) {
        self.inner.borrow_mut().close();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }
}

/// One reliable connection of an [ArqUdpTransport]
pub struct ArqUdpSocket {
    peer: Rc<RefCell<PeerConnection>>,
}

impl ArqUdpSocket {
    pub fn conn_id(&self) -> Uuid {
        self.peer.borrow().conn_id
    }

    pub fn peer_key(&self) -> PeerKey {
        self.peer.borrow().key
    }
}

impl VirtualSocket for ArqUdpSocket {
    fn readiness(&self) -> Readiness {
        self.peer.borrow().core.readiness().clone()
    }

    fn connect(&mut self, remote: SocketAddr) -> anyhow::Result<()> {
        self.peer.borrow_mut().core.begin_connect(remote)
    }

    fn finish_connect(&mut self) -> anyhow::Result<bool> {
        self.peer.borrow_mut().core.finish_connect()
    }

    fn is_connected(&self) -> bool {
        self.peer.borrow().core.is_connected()
    }

    fn read(&mut self, dst: &mut [u8]) -> anyhow::Result<ReadResult> {
        let mut guard = self.peer.borrow_mut();
        let peer = &mut *guard;
        peer.core.check_connected()?;

        let mut num_read = 0;
        while num_read < dst.len() {
            let Some(chunk) = peer.inbound.front_mut() else {
                break;
            };
            let n = chunk.len().min(dst.len() - num_read);
            dst[num_read..num_read + n].copy_from_slice(&chunk[..n]);
            chunk.advance(n);
            num_read += n;
            if chunk.is_empty() {
                peer.inbound.pop_front();
            }
        }
        Ok(peer.core.finish_read(num_read, peer.inbound.is_empty()))
    }

    /// Accepts as much as fits into the ARQ send window. The data is sent on the transport's next
    ///  clock tick.
    fn write(&mut self, src: &[u8]) -> anyhow::Result<usize> {
        let mut guard = self.peer.borrow_mut();
        let peer = &mut *guard;
        peer.core.check_connected()?;
        if src.is_empty() {
            return Ok(0);
        }

        let capacity = peer.engine.writable_capacity();
        if capacity == 0 {
            peer.core.readiness().cancel_writable();
            return Ok(0);
        }
        let n = capacity.min(src.len());
        if let Err(e) = peer.engine.send(&src[..n]) {
            peer.fail(e.to_string());
            return Err(e);
        }
        if n == capacity {
            peer.core.readiness().cancel_writable();
        }
        Ok(n)
    }

    fn writable_capacity(&self) -> usize {
        let peer = self.peer.borrow();
        if peer.core.is_connected() {
            peer.engine.writable_capacity()
        }
        else {
            0
        }
    }

    fn shutdown_output(&mut self) -> anyhow::Result<()> {
        Err(anyhow!("ARQ sockets do not support half-close"))
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.peer.borrow().core.local_addr()
    }

    fn remote_addr(&self) -> anyhow::Result<SocketAddr> {
        self.peer.borrow().core.remote_addr()
    }

    fn set_reset_on_close(&mut self, reset_on_close: bool) {
        self.peer.borrow_mut().core.set_reset_on_close(reset_on_close);
    }

    fn is_open(&self) -> bool {
        self.peer.borrow().core.is_open()
    }

    /// The engine state is released by the transport on its next clock tick
    fn close(&mut self) {
        let mut peer = self.peer.borrow_mut();
        if !peer.core.begin_close() {
            return;
        }
        debug!("[{}] closing ARQ socket to {:?}", peer.conn_id, peer.key.remote);
        peer.inbound.clear();
        peer.core.finish_close();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::datagram_socket::MockDatagramSocket;

    fn config() -> ArqTransportConfig {
        ArqTransportConfig::default()
    }

    fn poll_until(event_loop: &SelectorEventLoop, mut done: impl FnMut() -> bool) {
        let start = Instant::now();
        while !done() {
            assert!(start.elapsed() < Duration::from_secs(10), "timeout");
            event_loop.one_poll(Some(Duration::from_millis(5))).unwrap();
        }
    }

    fn read_all(socket: &mut ArqUdpSocket, buf: &mut Vec<u8>) {
        let mut chunk = [0u8; 4096];
        while let ReadResult::Data(n) = socket.read(&mut chunk).unwrap() {
            buf.extend_from_slice(&chunk[..n]);
        }
    }

    #[test]
    fn test_connect_accept_echo() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let server = ArqUdpTransport::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), config(), true).unwrap();
        let client = ArqUdpTransport::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), config(), false).unwrap();

        let mut client_socket = client.connect(server.local_addr()).unwrap();
        assert!(!client_socket.finish_connect().unwrap());
        assert!(client.connect(server.local_addr()).is_err());

        poll_until(&event_loop, || client_socket.is_connected());
        assert!(client_socket.finish_connect().unwrap());

        let data: Vec<u8> = (0..100_000).map(|i| (i % 199) as u8).collect();
        let mut offs = 0;
        let mut server_socket = None;
        let mut received = Vec::new();
        poll_until(&event_loop, || {
            if offs < data.len() {
                offs += client_socket.write(&data[offs..]).unwrap();
            }
            if server_socket.is_none() {
                server_socket = server.accept().unwrap();
            }
            if let Some(s) = &mut server_socket {
                read_all(s, &mut received);
            }
            received.len() == data.len()
        });
        assert!(received == data);
        assert_eq!(server.accept().unwrap().map(|s| s.peer_key()), None);

        let mut server_socket = server_socket.unwrap();
        assert_eq!(server_socket.remote_addr().unwrap(), client.local_addr());
        server_socket.write(b"pong").unwrap();
        let mut echoed = Vec::new();
        poll_until(&event_loop, || {
            read_all(&mut client_socket, &mut echoed);
            echoed == b"pong"
        });

        client_socket.close();
        client_socket.close();
        assert!(!client_socket.is_open());
        poll_until(&event_loop, || client.num_connections() == 0);
    }

    #[test]
    fn test_not_accepting_drops_unknown_peers() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let server = ArqUdpTransport::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), config(), false).unwrap();
        let client = ArqUdpTransport::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), config(), false).unwrap();

        let mut socket = client.connect(server.local_addr()).unwrap();
        poll_until(&event_loop, || socket.is_connected());
        socket.write(b"hello").unwrap();
        for _ in 0..20 {
            event_loop.one_poll(Some(Duration::from_millis(5))).unwrap();
        }
        assert!(server.accept().unwrap().is_none());
        assert!(!server.listener().fired().contains(EventSet::READABLE));
    }

    #[test]
    fn test_pending_peer_is_buffered_until_accept() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let server = ArqUdpTransport::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), config(), true).unwrap();
        let client = ArqUdpTransport::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), config(), false).unwrap();

        let mut socket = client.connect(server.local_addr()).unwrap();
        poll_until(&event_loop, || socket.is_connected());
        socket.write(b"early").unwrap();
        poll_until(&event_loop, || server.listener().fired().contains(EventSet::READABLE));
        assert_eq!(server.num_connections(), 0);

        let mut accepted = server.accept().unwrap().unwrap();
        assert!(!server.listener().fired().contains(EventSet::READABLE));
        let mut received = Vec::new();
        poll_until(&event_loop, || {
            read_all(&mut accepted, &mut received);
            received == b"early"
        });
    }

    #[test]
    fn test_idle_peer_expires() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let config = ArqTransportConfig {
            idle_timeout: Duration::from_millis(50),
            ..config()
        };
        let client = ArqUdpTransport::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), config, false).unwrap();
        // nobody listens here
        let silent = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();

        let mut socket = client.connect(silent.local_addr().unwrap()).unwrap();
        poll_until(&event_loop, || client.num_connections() == 0);
        assert_eq!(socket.read(&mut [0u8; 8]).unwrap_err().to_string(), "connection timed out");
        assert!(socket.write(b"x").is_err());
    }

    #[test]
    fn test_deferred_output_on_would_block() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let fd_holder = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let fd = std::os::fd::AsRawFd::as_raw_fd(&fd_holder);
        let local: SocketAddr = "127.0.0.1:5000".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:6000".parse().unwrap();

        let sent = Arc::new(Mutex::new(Vec::new()));
        let mut socket = MockDatagramSocket::new();
        socket.expect_local_addr().returning(move || Ok(local));
        socket.expect_raw_fd().return_const(fd);
        socket.expect_recv_from().returning(|_| Err(ErrorKind::WouldBlock.into()));
        let sent_clone = sent.clone();
        let mut num_calls = 0;
        socket.expect_send_to()
            .withf(move |_, target| *target == remote)
            .returning(move |buf, _| {
                num_calls += 1;
                if num_calls == 1 {
                    return Err(ErrorKind::WouldBlock.into());
                }
                sent_clone.lock().unwrap().push(buf.to_vec());
                Ok(buf.len())
            });

        let transport = ArqUdpTransport::new(&event_loop, Box::new(socket), config(), false).unwrap();
        let mut arq_socket = transport.connect(remote).unwrap();
        transport.inner.borrow_mut().tick();
        assert!(arq_socket.is_connected());
        assert_eq!(arq_socket.write(b"hello").unwrap(), 5);

        transport.inner.borrow_mut().tick();
        assert!(transport.inner.borrow().not_fully_sent);
        assert!(sent.lock().unwrap().is_empty());

        transport.inner.borrow_mut().on_writable();
        assert!(!transport.inner.borrow().not_fully_sent);
        let sent = sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert!(sent[0].ends_with(b"hello"));
    }

    #[test]
    fn test_close_transport_fails_connections() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let transport = ArqUdpTransport::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), config(), true).unwrap();
        let mut socket = transport.connect("127.0.0.1:9".parse().unwrap()).unwrap();

        transport.close();
        transport.close();
        assert!(transport.is_closed());
        assert_eq!(socket.finish_connect().unwrap_err().to_string(), "transport closed");
        assert!(transport.connect("127.0.0.1:10".parse().unwrap()).is_err());
        assert!(transport.accept().is_err());
    }

    #[test]
    fn test_dropped_transport_fails_connections() {
        let event_loop = SelectorEventLoop::new().unwrap();
        let transport = ArqUdpTransport::bind(&event_loop, "127.0.0.1:0".parse().unwrap(), config(), true).unwrap();
        let mut socket = transport.connect("127.0.0.1:9".parse().unwrap()).unwrap();
        let handle = transport.inner.borrow().handle.unwrap();
        assert!(event_loop.is_registered(handle));

        let copy = transport.clone();
        drop(transport);
        assert!(event_loop.is_registered(handle));
        drop(copy);

        assert!(!event_loop.is_registered(handle));
        assert!(socket.readiness().fired().contains(EventSet::READABLE));
        assert_eq!(socket.read(&mut [0u8; 16]).unwrap_err().to_string(), "transport closed");
        event_loop.one_poll(Some(Duration::ZERO)).unwrap();
    }
}
