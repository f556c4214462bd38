use std::net::SocketAddr;

use anyhow::{anyhow, bail};
use tracing::{debug, trace};

use crate::readiness::Readiness;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocketState {
    Init,
    Connecting,
    Connected,
    Closing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadResult {
    Data(usize),
    /// nothing is buffered right now
    WouldBlock,
    Eof,
}

/// A socket emulated in software. Implementations signal their readiness through
///  [VirtualSocket::readiness], which can be registered with an event loop exactly like a real
///  descriptor.
///
/// All operations are non-blocking. A `write` returning 0 means backpressure: the socket's
///  writable signal is cancelled and raised again once there is room.
pub trait VirtualSocket {
    fn readiness(&self) -> Readiness;

    fn connect(&mut self, remote: SocketAddr) -> anyhow::Result<()>;
    fn finish_connect(&mut self) -> anyhow::Result<bool>;
    fn is_connected(&self) -> bool;

    fn read(&mut self, dst: &mut [u8]) -> anyhow::Result<ReadResult>;
    fn write(&mut self, src: &[u8]) -> anyhow::Result<usize>;

    /// the number of bytes a `write` would currently accept
    fn writable_capacity(&self) -> usize {
        usize::MAX
    }

    fn shutdown_output(&mut self) -> anyhow::Result<()>;

    fn local_addr(&self) -> anyhow::Result<SocketAddr>;
    fn remote_addr(&self) -> anyhow::Result<SocketAddr>;

    fn set_reset_on_close(&mut self, reset_on_close: bool);

    fn is_open(&self) -> bool;

    /// Idempotent. The first call releases the socket's resources; the registration of its
    ///  readiness (if any) is removed on the loop's thread.
    fn close(&mut self);
}

/// The lifecycle state shared by all virtual socket variants. Variants own a `SocketCore` and
///  call into it explicitly.
#[derive(Debug)]
pub struct SocketCore {
    state: SocketState,
    readiness: Readiness,
    local: Option<SocketAddr>,
    remote: Option<SocketAddr>,
    eof: bool,
    error: Option<String>,
    reset_on_close: bool,
}

impl Default for SocketCore {
    fn default() -> Self {
        SocketCore::new(None)
    }
}

impl SocketCore {
    pub fn new(local: Option<SocketAddr>) -> SocketCore {
        SocketCore {
            state: SocketState::Init,
            readiness: Readiness::new(),
            local,
            remote: None,
            eof: false,
            error: None,
            reset_on_close: false,
        }
    }

    /// for sockets that are connected from the start, e.g. accepted by a server
    pub fn accepted(local: Option<SocketAddr>, remote: Option<SocketAddr>) -> SocketCore {
        let result = SocketCore {
            state: SocketState::Connected,
            remote,
            ..SocketCore::new(local)
        };
        result.readiness.set_writable();
        result
    }

    pub fn readiness(&self) -> &Readiness {
        &self.readiness
    }

    pub fn state(&self) -> SocketState {
        self.state
    }

    pub fn begin_connect(&mut self, remote: SocketAddr) -> anyhow::Result<()> {
        self.check_open()?;
        match self.state {
            SocketState::Init => {
                trace!("connecting to {:?}", remote);
                self.remote = Some(remote);
                self.state = SocketState::Connecting;
                Ok(())
            }
            SocketState::Connecting => bail!("connect() already called"),
            _ => bail!("already connected"),
        }
    }

    pub fn finish_connect(&mut self) -> anyhow::Result<bool> {
        self.check_open()?;
        match self.state {
            SocketState::Init => bail!("not trying to connect"),
            SocketState::Connecting => {
                self.check_error()?;
                Ok(false)
            }
            _ => Ok(true),
        }
    }

    /// called by the variant when the connection is established
    pub fn alert_connected(&mut self) {
        if self.state == SocketState::Connecting {
            debug!("connected to {:?}", self.remote);
            self.state = SocketState::Connected;
            self.readiness.set_writable();
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SocketState::Connected
    }

    pub fn is_open(&self) -> bool {
        !matches!(self.state, SocketState::Closing | SocketState::Closed)
    }

    pub fn check_open(&self) -> anyhow::Result<()> {
        if !self.is_open() {
            bail!("socket is closed");
        }
        Ok(())
    }

    pub fn check_error(&self) -> anyhow::Result<()> {
        if let Some(msg) = &self.error {
            bail!("{}", msg);
        }
        Ok(())
    }

    /// Prerequisites for reading and writing. A latched error takes precedence over buffered data.
    pub fn check_connected(&self) -> anyhow::Result<()> {
        self.check_open()?;
        self.check_error()?;
        if self.state != SocketState::Connected {
            bail!("socket is not connected");
        }
        Ok(())
    }

    /// Latches an error to be returned by all later reads and writes. The first error wins.
    pub fn raise_error(&mut self, msg: impl Into<String>) {
        let msg = msg.into();
        if self.error.is_none() {
            debug!("socket {:?} -> {:?} failed: {}", self.local, self.remote, msg);
            self.error = Some(msg);
        }
        self.readiness.set_readable();
        self.readiness.set_writable();
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn set_eof(&mut self) {
        self.eof = true;
        self.readiness.set_readable();
    }

    pub fn is_eof(&self) -> bool {
        self.eof
    }

    /// Turns the outcome of draining the variant's receive buffer into a [ReadResult], and
    ///  cancels readability once there is nothing left to report.
    pub fn finish_read(&mut self, num_read: usize, buffer_empty: bool) -> ReadResult {
        if buffer_empty && !self.eof && self.error.is_none() {
            self.readiness.cancel_readable();
        }
        match (num_read, self.eof) {
            (0, true) => ReadResult::Eof,
            (0, false) => ReadResult::WouldBlock,
            (n, _) => ReadResult::Data(n),
        }
    }

    pub fn reset_on_close(&self) -> bool {
        self.reset_on_close
    }

    pub fn set_reset_on_close(&mut self, reset_on_close: bool) {
        self.reset_on_close = reset_on_close;
    }

    /// Returns `true` exactly once, for the call that should tear the socket down
    pub fn begin_close(&mut self) -> bool {
        if !self.is_open() {
            return false;
        }
        self.state = SocketState::Closing;
        true
    }

    pub fn finish_close(&mut self) {
        self.state = SocketState::Closed;
        self.readiness.cancel_readable();
        self.readiness.cancel_writable();
        self.readiness.detach();
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        self.local.ok_or_else(|| anyhow!("socket has no local address"))
    }

    pub fn remote_addr(&self) -> anyhow::Result<SocketAddr> {
        self.remote.ok_or_else(|| anyhow!("socket is not connected"))
    }

    pub fn set_local_addr(&mut self, local: SocketAddr) {
        self.local = Some(local);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_set::EventSet;

    fn addr() -> SocketAddr {
        "127.0.0.1:1234".parse().unwrap()
    }

    #[test]
    fn test_connect_lifecycle() {
        let mut core = SocketCore::new(None);
        assert!(core.finish_connect().is_err());
        assert!(core.check_connected().is_err());

        core.begin_connect(addr()).unwrap();
        assert_eq!(core.begin_connect(addr()).unwrap_err().to_string(), "connect() already called");
        assert!(!core.finish_connect().unwrap());

        core.alert_connected();
        assert!(core.finish_connect().unwrap());
        assert_eq!(core.readiness().fired(), EventSet::WRITABLE);
        assert_eq!(core.begin_connect(addr()).unwrap_err().to_string(), "already connected");
        assert_eq!(core.remote_addr().unwrap(), addr());
        core.check_connected().unwrap();
    }

    #[test]
    fn test_error_is_latched() {
        let mut core = SocketCore::accepted(None, Some(addr()));
        core.raise_error("first");
        core.raise_error("second");

        assert_eq!(core.check_connected().unwrap_err().to_string(), "first");
        assert_eq!(core.check_connected().unwrap_err().to_string(), "first");
        assert_eq!(core.readiness().fired(), EventSet::all());
    }

    #[test]
    fn test_eof() {
        let mut core = SocketCore::accepted(None, Some(addr()));
        core.readiness().set_readable();
        assert_eq!(core.finish_read(3, true), ReadResult::Data(3));
        assert!(!core.readiness().fired().contains(EventSet::READABLE));
        assert_eq!(core.finish_read(0, true), ReadResult::WouldBlock);

        core.set_eof();
        assert_eq!(core.finish_read(2, true), ReadResult::Data(2));
        assert_eq!(core.finish_read(0, true), ReadResult::Eof);
        assert_eq!(core.finish_read(0, true), ReadResult::Eof);
        assert!(core.readiness().fired().contains(EventSet::READABLE));
    }

    #[test]
    fn test_close_once() {
        let mut core = SocketCore::accepted(None, Some(addr()));
        assert!(core.begin_close());
        assert!(!core.begin_close());
        core.finish_close();
        assert!(!core.begin_close());
        assert_eq!(core.state(), SocketState::Closed);
        assert!(core.check_connected().is_err());
        assert_eq!(core.readiness().fired(), EventSet::empty());
    }
}
