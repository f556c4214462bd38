use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use anyhow::bail;
use clap::Parser;
use clap_derive::Parser;
use selector::{EventSet, Handler, HandlerContext, ReadResult, SelectorEventLoop, VirtualSocket};
use tracing::{error, info, Level};
use transport::config::{ArqProfile, StreamedArqConfig};
use transport::mux::{MuxState, MuxStream};
use transport::streamed::{StreamedArqClient, StreamedArqServer};

#[derive(Parser)]
struct Args {
    /// 'server' or 'client'
    mode: String,
    /// the address to listen on (server) or to connect to (client)
    address: String,

    #[clap(long, default_value = "fast3")]
    profile: String,

    #[clap(long, default_value = "hello over ARQ")]
    message: String,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_max_level(if args.verbose { Level::DEBUG } else { Level::INFO })
        .try_init()
        .ok();

    let addr: SocketAddr = args.address.parse()?;
    let profile: ArqProfile = args.profile.parse()?;

    match args.mode.as_str() {
        "server" => run_server(addr, profile),
        "client" => run_client(addr, profile, &args.message),
        other => bail!("unknown mode {} - expected 'server' or 'client'", other),
    }
}

struct EchoHandler {
    stream: MuxStream,
    pending: Vec<u8>,
}

impl EchoHandler {
    fn flush(&mut self, ctx: &HandlerContext<'_>) -> anyhow::Result<()> {
        while !self.pending.is_empty() {
            let n = self.stream.write(&self.pending)?;
            if n == 0 {
                break;
            }
            self.pending.drain(..n);
        }
        if self.pending.is_empty() {
            ctx.event_loop.rm_ops(ctx.handle, EventSet::WRITABLE)
        }
        else {
            ctx.event_loop.add_ops(ctx.handle, EventSet::WRITABLE)
        }
    }

    fn on_readable(&mut self, ctx: &HandlerContext<'_>) -> anyhow::Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            match self.stream.read(&mut buf)? {
                ReadResult::Data(n) => self.pending.extend_from_slice(&buf[..n]),
                ReadResult::WouldBlock => break,
                ReadResult::Eof => {
                    info!("stream {} finished", self.stream.stream_id());
                    self.flush(ctx)?;
                    self.stream.close();
                    return Ok(());
                }
            }
        }
        self.flush(ctx)
    }
}

impl Handler for EchoHandler {
    fn readable(&mut self, ctx: &HandlerContext<'_>) {
        if let Err(e) = self.on_readable(ctx) {
            error!("echo stream {} failed: {}", self.stream.stream_id(), e);
            self.stream.close();
        }
    }

    fn writable(&mut self, ctx: &HandlerContext<'_>) {
        if let Err(e) = self.flush(ctx) {
            error!("echo stream {} failed: {}", self.stream.stream_id(), e);
            self.stream.close();
        }
    }
}

struct AcceptHandler {
    server: Rc<StreamedArqServer>,
}

impl Handler for AcceptHandler {
    fn readable(&mut self, ctx: &HandlerContext<'_>) {
        loop {
            match self.server.accept() {
                Ok(Some(stream)) => {
                    info!("accepted stream {} from {:?}", stream.stream_id(), stream.remote_addr().ok());
                    let readiness = stream.readiness();
                    let handler = Rc::new(RefCell::new(EchoHandler { stream, pending: Vec::new() }));
                    if let Err(e) = ctx.event_loop.add_virtual(&readiness, EventSet::READABLE, handler) {
                        error!("registering stream failed: {}", e);
                    }
                }
                Ok(None) => return,
                Err(e) => {
                    error!("accept failed: {}", e);
                    return;
                }
            }
        }
    }

    fn writable(&mut self, _ctx: &HandlerContext<'_>) {}
}

fn run_server(addr: SocketAddr, profile: ArqProfile) -> anyhow::Result<()> {
    let event_loop = SelectorEventLoop::new()?;
    let socket = mio::net::UdpSocket::bind(addr)?;

    let mut config = StreamedArqConfig::default();
    config.transport.arq = profile.config();
    let server = Rc::new(StreamedArqServer::bind(&event_loop, Box::new(socket), config)?);
    info!("echo server listening on {:?}", server.local_addr());

    let handler = Rc::new(RefCell::new(AcceptHandler { server: server.clone() }));
    event_loop.add_virtual(&server.readiness(), EventSet::READABLE, handler)?;
    event_loop.loop_forever()
}

fn run_client(addr: SocketAddr, profile: ArqProfile, message: &str) -> anyhow::Result<()> {
    let event_loop = SelectorEventLoop::new()?;
    let local: SocketAddr = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" }.parse()?;
    let socket = mio::net::UdpSocket::bind(local)?;
    let client = StreamedArqClient::connect(&event_loop, Box::new(socket), addr, StreamedArqConfig::client(profile))?;

    let deadline = Instant::now() + Duration::from_secs(10);
    let poll_until = |done: &mut dyn FnMut() -> anyhow::Result<bool>| -> anyhow::Result<()> {
        while !done()? {
            if Instant::now() > deadline {
                bail!("timed out");
            }
            event_loop.one_poll(Some(Duration::from_millis(10)))?;
        }
        Ok(())
    };

    poll_until(&mut || -> anyhow::Result<bool> {
        match client.state() {
            MuxState::Established => Ok(true),
            MuxState::Failed(reason) => bail!("connection failed: {}", reason),
            _ => Ok(false),
        }
    })?;
    info!("connected to {:?}", addr);

    let mut stream = client.open_stream()?;
    poll_until(&mut || -> anyhow::Result<bool> { Ok(stream.is_connected()) })?;

    let mut remaining = message.as_bytes();
    let mut echoed = Vec::new();
    poll_until(&mut || -> anyhow::Result<bool> {
        if !remaining.is_empty() {
            let n = stream.write(remaining)?;
            remaining = &remaining[n..];
            if remaining.is_empty() {
                stream.shutdown_output()?;
            }
        }
        let mut buf = [0u8; 4096];
        loop {
            match stream.read(&mut buf)? {
                ReadResult::Data(n) => echoed.extend_from_slice(&buf[..n]),
                ReadResult::WouldBlock => return Ok(false),
                ReadResult::Eof => return Ok(true),
            }
        }
    })?;

    info!("echo: {}", String::from_utf8_lossy(&echoed));
    stream.close();
    client.close();
    Ok(())
}
