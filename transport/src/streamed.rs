use std::cell::RefCell;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use anyhow::bail;
use selector::{EventSet, Handle, Handler, HandlerContext, Readiness, SelectorEventLoop, WeakEventLoop};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::arq_udp::ArqUdpTransport;
use crate::config::{MuxConfig, StreamedArqConfig};
use crate::datagram_socket::DatagramSocket;
use crate::mux::{MuxConnection, MuxState, MuxStream};

/// Closes the transport once the mux had time to send its GOAWAY
fn close_transport_later(event_loop: &WeakEventLoop, transport: &ArqUdpTransport, mux_config: &MuxConfig) {
    let Some(event_loop) = event_loop.upgrade() else {
        transport.close();
        return;
    };
    let deferred = transport.clone();
    if event_loop.delay(mux_config.fail_notify_delay, move |_| deferred.close()).is_err() {
        transport.close();
    }
}

/// The client side of stream multiplexing over an ARQ connection: a non-accepting
///  [ArqUdpTransport] with a single client [MuxConnection] on top.
pub struct StreamedArqClient {
    transport: ArqUdpTransport,
    mux: MuxConnection,
    mux_config: MuxConfig,
    event_loop: WeakEventLoop,
}

impl StreamedArqClient {
    pub fn connect(event_loop: &SelectorEventLoop, socket: Box<dyn DatagramSocket>, remote: SocketAddr, config: StreamedArqConfig) -> anyhow::Result<StreamedArqClient> {
        config.validate()?;
        let transport = ArqUdpTransport::new(event_loop, socket, config.transport, false)?;
        let lower = match transport.connect(remote) {
            Ok(lower) => lower,
            Err(e) => {
                transport.close();
                return Err(e);
            }
        };
        let mux = MuxConnection::client(event_loop, Box::new(lower), config.mux.clone())?;
        info!("streamed ARQ client {:?} -> {:?}", transport.local_addr(), remote);

        Ok(StreamedArqClient {
            transport,
            mux,
            mux_config: config.mux,
            event_loop: event_loop.downgrade(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Fails with "not ready" until the mux handshake is complete, see [StreamedArqClient::readiness]
    pub fn open_stream(&self) -> anyhow::Result<MuxStream> {
        self.mux.open_stream()
    }

    pub fn state(&self) -> MuxState {
        self.mux.state()
    }

    /// writable once streams can be opened, readable when the peer opened a stream or the
    ///  connection failed
    pub fn readiness(&self) -> Readiness {
        self.mux.readiness()
    }

    pub fn mux(&self) -> &MuxConnection {
        &self.mux
    }

    pub fn close(&self) {
        self.mux.close();
        close_transport_later(&self.event_loop, &self.transport, &self.mux_config);
    }
}

struct ServerInner {
    transport: ArqUdpTransport,
    mux_config: MuxConfig,
    connections: Vec<MuxConnection>,
    accepted: VecDeque<MuxStream>,
    readiness: Readiness,
    listener_handle: Option<Handle>,
    closed: bool,
}

impl ServerInner {
    fn on_new_peers(&mut self, event_loop: &SelectorEventLoop, self_ref: &Weak<RefCell<ServerInner>>) {
        loop {
            let socket = match self.transport.accept() {
                Ok(Some(socket)) => socket,
                Ok(None) => return,
                Err(e) => {
                    debug!("accepting ARQ peers failed: {}", e);
                    return;
                }
            };

            let peer = socket.peer_key();
            let mux = match MuxConnection::server(event_loop, Box::new(socket), self.mux_config.clone()) {
                Ok(mux) => mux,
                Err(e) => {
                    warn!("setting up mux for {:?} failed: {}", peer.remote, e);
                    continue;
                }
            };

            let handler = Rc::new(RefCell::new(MuxAcceptHandler {
                server: self_ref.clone(),
                mux: mux.clone(),
            }));
            match event_loop.add_virtual(&mux.readiness(), EventSet::READABLE, handler) {
                Ok(_) => {
                    debug!("new mux connection {} from {:?}", mux.conn_id(), peer.remote);
                    self.connections.push(mux);
                }
                Err(e) => {
                    warn!("registering mux for {:?} failed: {}", peer.remote, e);
                    mux.close();
                }
            }
        }
    }

    fn on_stream(&mut self, stream: MuxStream) {
        if self.closed {
            return;
        }
        self.accepted.push_back(stream);
        self.readiness.set_readable();
    }

    fn forget(&mut self, conn_id: Uuid) {
        self.connections.retain(|mux| mux.conn_id() != conn_id);
    }
}

struct ListenerHandler {
    server: Weak<RefCell<ServerInner>>,
}

impl Handler for ListenerHandler {
    fn readable(&mut self, ctx: &HandlerContext<'_>) {
        if let Some(server) = self.server.upgrade() {
            server.borrow_mut().on_new_peers(ctx.event_loop, &self.server);
        }
    }

    fn writable(&mut self, _ctx: &HandlerContext<'_>) {}
}

/// collects the streams a peer opens
struct MuxAcceptHandler {
    server: Weak<RefCell<ServerInner>>,
    mux: MuxConnection,
}

impl Handler for MuxAcceptHandler {
    fn readable(&mut self, ctx: &HandlerContext<'_>) {
        let Some(server) = self.server.upgrade() else {
            return;
        };
        loop {
            match self.mux.accept() {
                Ok(Some(stream)) => server.borrow_mut().on_stream(stream),
                Ok(None) => return,
                Err(e) => {
                    debug!("mux connection {} is gone: {}", self.mux.conn_id(), e);
                    server.borrow_mut().forget(self.mux.conn_id());
                    if let Err(e) = ctx.event_loop.remove(ctx.handle) {
                        debug!("removing mux registration failed: {}", e);
                    }
                    return;
                }
            }
        }
    }

    fn writable(&mut self, _ctx: &HandlerContext<'_>) {}
}

/// The server side of stream multiplexing over ARQ: an accepting [ArqUdpTransport] where every
///  peer gets a server [MuxConnection]. Streams opened by any of the peers are queued for
///  [StreamedArqServer::accept].
pub struct StreamedArqServer {
    inner: Rc<RefCell<ServerInner>>,
    event_loop: WeakEventLoop,
}

impl StreamedArqServer {
    pub fn bind(event_loop: &SelectorEventLoop, socket: Box<dyn DatagramSocket>, config: StreamedArqConfig) -> anyhow::Result<StreamedArqServer> {
        config.validate()?;
        let transport = ArqUdpTransport::new(event_loop, socket, config.transport, true)?;
        let listener = transport.listener();
        info!("streamed ARQ server listening on {:?}", transport.local_addr());

        let inner = Rc::new(RefCell::new(ServerInner {
            transport,
            mux_config: config.mux,
            connections: Vec::new(),
            accepted: VecDeque::new(),
            readiness: Readiness::new(),
            listener_handle: None,
            closed: false,
        }));

        let handler = Rc::new(RefCell::new(ListenerHandler { server: Rc::downgrade(&inner) }));
        match event_loop.add_virtual(&listener, EventSet::READABLE, handler) {
            Ok(handle) => inner.borrow_mut().listener_handle = Some(handle),
            Err(e) => {
                inner.borrow().transport.close();
                return Err(e);
            }
        }

        Ok(StreamedArqServer {
            inner,
            event_loop: event_loop.downgrade(),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.inner.borrow().transport.local_addr()
    }

    pub fn num_connections(&self) -> usize {
        self.inner.borrow().connections.len()
    }

    /// readable while streams are waiting to be accepted
    pub fn readiness(&self) -> Readiness {
        self.inner.borrow().readiness.clone()
    }

    pub fn accept(&self) -> anyhow::Result<Option<MuxStream>> {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            bail!("server is closed");
        }
        let stream = inner.accepted.pop_front();
        if inner.accepted.is_empty() {
            inner.readiness.cancel_readable();
        }
        Ok(stream)
    }

    /// Closes all connections, including streams that were accepted but not closed yet
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;
        info!("closing streamed ARQ server on {:?}", inner.transport.local_addr());

        inner.accepted.clear();
        inner.readiness.cancel_readable();
        let connections = std::mem::take(&mut inner.connections);
        let listener_handle = inner.listener_handle.take();
        let transport = inner.transport.clone();
        let mux_config = inner.mux_config.clone();
        drop(inner);

        // the accept handlers see the failure and unregister themselves
        for mux in connections {
            mux.close();
        }
        if let (Some(event_loop), Some(handle)) = (self.event_loop.upgrade(), listener_handle) {
            if let Err(e) = event_loop.remove(handle) {
                debug!("removing listener registration failed: {}", e);
            }
        }
        close_transport_later(&self.event_loop, &transport, &mux_config);
    }
}
