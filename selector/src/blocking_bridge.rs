use std::io::{ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::thread;

use anyhow::bail;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tracing::{debug, error, trace, warn};

use crate::readiness::Readiness;
use crate::virtual_socket::{ReadResult, SocketCore, VirtualSocket};

pub struct BlockingBridgeConfig {
    /// Number of packets buffered in each direction. When the inbound queue is full, the reader
    ///  thread blocks; when the outbound queue is full, writes return 0.
    pub queue_capacity: usize,
    /// Size of the reader thread's buffer, i.e. the maximum size of a packet read from the
    ///  blocking resource. This is also the maximum size of a single write.
    pub max_packet_size: usize,
    /// prefix for the names of the worker threads
    pub thread_name: String,
}

impl Default for BlockingBridgeConfig {
    fn default() -> Self {
        BlockingBridgeConfig {
            queue_capacity: 1024,
            max_packet_size: 65536,
            thread_name: "blocking-bridge".to_string(),
        }
    }
}

impl BlockingBridgeConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.queue_capacity == 0 {
            bail!("queue capacity must be positive");
        }
        if self.max_packet_size == 0 {
            bail!("max packet size must be positive");
        }
        Ok(())
    }
}

#[derive(Debug)]
enum Inbound {
    Packet(Bytes),
    Eof,
    Error(String),
}

/// Makes a blocking resource (e.g. a TAP device or a pipe) available as a virtual socket. A reader
///  thread and a writer thread do the blocking I/O, exchanging packets with the loop side through
///  bounded channels and signalling readiness. The worker threads never call into the loop.
///
/// Each read returns (at most) one packet. If the destination buffer is too small, the packet is
///  truncated.
pub struct BlockingBridgeSocket {
    core: SocketCore,
    inbound: mpsc::Receiver<Inbound>,
    outbound: Option<mpsc::Sender<Bytes>>,
    max_packet_size: usize,
}

impl BlockingBridgeSocket {
    pub fn spawn(reader: impl Read + Send + 'static, writer: impl Write + Send + 'static, config: BlockingBridgeConfig) -> anyhow::Result<BlockingBridgeSocket> {
        config.validate()?;

        let core = SocketCore::accepted(None, None);
        let (inbound_send, inbound_recv) = mpsc::channel(config.queue_capacity);
        let (outbound_send, outbound_recv) = mpsc::channel(config.queue_capacity);

        let readiness = core.readiness().clone();
        let max_packet_size = config.max_packet_size;
        let reader_send = inbound_send.clone();
        thread::Builder::new()
            .name(format!("{}-reader", config.thread_name))
            .spawn(move || reader_loop(reader, reader_send, readiness, max_packet_size))?;

        let readiness = core.readiness().clone();
        thread::Builder::new()
            .name(format!("{}-writer", config.thread_name))
            .spawn(move || writer_loop(writer, outbound_recv, inbound_send, readiness))?;

        debug!("spawned blocking bridge {}", config.thread_name);
        Ok(BlockingBridgeSocket {
            core,
            inbound: inbound_recv,
            outbound: Some(outbound_send),
            max_packet_size,
        })
    }
}

fn reader_loop(mut reader: impl Read, inbound: mpsc::Sender<Inbound>, readiness: Readiness, max_packet_size: usize) {
    let mut buf = vec![0u8; max_packet_size];
    loop {
        let msg = match reader.read(&mut buf) {
            Ok(0) => Inbound::Eof,
            Ok(n) => Inbound::Packet(Bytes::copy_from_slice(&buf[..n])),
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("reading from blocking resource failed: {}", e);
                Inbound::Error(e.to_string())
            }
        };
        let is_last = !matches!(msg, Inbound::Packet(_));

        if inbound.blocking_send(msg).is_err() {
            trace!("bridge socket was closed - terminating reader thread");
            return;
        }
        readiness.set_readable();
        if is_last {
            return;
        }
    }
}

fn writer_loop(mut writer: impl Write, mut outbound: mpsc::Receiver<Bytes>, inbound: mpsc::Sender<Inbound>, readiness: Readiness) {
    while let Some(packet) = outbound.blocking_recv() {
        match writer.write(&packet) {
            Ok(n) if n < packet.len() => warn!("partial write to blocking resource: {} of {} bytes", n, packet.len()),
            Ok(_) => {}
            Err(e) => {
                error!("writing to blocking resource failed: {}", e);
                let _ = inbound.blocking_send(Inbound::Error(e.to_string()));
                readiness.set_readable();
                readiness.set_writable();
                return;
            }
        }
        readiness.set_writable();
    }
    trace!("bridge socket output is shut down - terminating writer thread");
}

impl VirtualSocket for BlockingBridgeSocket {
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

        match self.inbound.try_recv() {
            Ok(Inbound::Packet(packet)) => {
                let n = packet.len().min(dst.len());
                if n < packet.len() {
                    debug!("truncating packet of {} bytes to {}", packet.len(), n);
                }
                dst[..n].copy_from_slice(&packet[..n]);
                let empty = self.inbound.is_empty();
                Ok(self.core.finish_read(n, empty))
            }
            Ok(Inbound::Eof) | Err(TryRecvError::Disconnected) => {
                self.core.set_eof();
                Ok(ReadResult::Eof)
            }
            Ok(Inbound::Error(msg)) => {
                self.core.raise_error(msg);
                self.core.check_error()?;
                Ok(ReadResult::WouldBlock)
            }
            Err(TryRecvError::Empty) => {
                let result = self.core.finish_read(0, true);
                // the reader thread may have delivered a packet after try_recv
                if !self.inbound.is_empty() {
                    self.core.readiness().set_readable();
                }
                Ok(result)
            }
        }
    }

    fn write(&mut self, src: &[u8]) -> anyhow::Result<usize> {
        self.core.check_connected()?;
        let Some(outbound) = &self.outbound else {
            bail!("output is shut down");
        };
        if src.is_empty() {
            return Ok(0);
        }
        if src.len() > self.max_packet_size {
            bail!("packet of {} bytes exceeds the maximum of {}", src.len(), self.max_packet_size);
        }

        match outbound.try_send(Bytes::copy_from_slice(src)) {
            Ok(()) => Ok(src.len()),
            Err(TrySendError::Full(_)) => {
                self.core.readiness().cancel_writable();
                if outbound.capacity() > 0 {
                    self.core.readiness().set_writable();
                }
                Ok(0)
            }
            Err(TrySendError::Closed(_)) => {
                self.core.raise_error("writer thread terminated");
                self.core.check_error()?;
                Ok(0)
            }
        }
    }

    fn writable_capacity(&self) -> usize {
        match &self.outbound {
            Some(outbound) => outbound.capacity() * self.max_packet_size,
            None => 0,
        }
    }

    fn shutdown_output(&mut self) -> anyhow::Result<()> {
        self.core.check_open()?;
        self.outbound = None;
        Ok(())
    }

    fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        bail!("a bridged socket has no local address")
    }

    fn remote_addr(&self) -> anyhow::Result<SocketAddr> {
        bail!("a bridged socket has no remote address")
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
        debug!("closing blocking bridge socket");
        self.outbound = None;
        self.inbound.close();
        self.core.finish_close();
    }
}
