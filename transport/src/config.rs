use std::str::FromStr;
use std::time::Duration;

use anyhow::bail;

/// Tuning knobs of the ARQ engine. The presets are named after the profiles they implement;
///  [ArqConfig::fast3] is the default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArqConfig {
    /// With `nodelay`, retransmission timeouts grow by half an RTO per timeout (rather than
    ///  doubling), and the first retransmission does not wait for an additional RTO/8.
    pub nodelay: bool,

    /// The clock interval in milliseconds. Acks and data are only flushed when the engine is
    ///  clocked, and the transport clocks its engines at this interval.
    pub interval: u32,

    /// Number of acks for later segments that trigger a fast retransmit of an unacked segment.
    ///  0 disables fast retransmit.
    pub resend: u32,

    /// `true` disables the congestion window, i.e. the number of segments in flight is limited only
    ///  by the send window and the peer's receive window.
    pub no_congestion_window: bool,

    /// maximum number of segments in flight, in segments
    pub send_window: u32,
    /// maximum number of segments buffered on the receiving side, in segments
    pub receive_window: u32,

    /// Maximum size of a datagram, including the segment header(s). The maximum segment payload
    ///  is this minus the 24 byte header.
    pub mtu: u32,

    /// lower bound for the retransmission timeout, in milliseconds
    pub rx_min_rto: u32,

    /// A segment that was transmitted this many times without being acked renders the engine
    ///  (and the connection) dead.
    pub dead_link: u32,

    /// upper bound for fast retransmissions of a single segment
    pub fast_limit: u32,
}

impl Default for ArqConfig {
    fn default() -> Self {
        ArqConfig::fast3()
    }
}

impl ArqConfig {
    fn preset(nodelay: bool, interval: u32, resend: u32, send_window: u32, rx_min_rto: u32) -> ArqConfig {
        ArqConfig {
            nodelay,
            interval,
            resend,
            no_congestion_window: true,
            send_window,
            receive_window: 1024,
            mtu: 1250,
            rx_min_rto,
            dead_link: 20,
            fast_limit: 5,
        }
    }

    pub fn normal() -> ArqConfig {
        Self::preset(false, 40, 2, 1024, 100)
    }

    pub fn fast1() -> ArqConfig {
        Self::preset(false, 30, 2, 1024, 60)
    }

    pub fn fast2() -> ArqConfig {
        Self::preset(true, 20, 2, 1024, 30)
    }

    pub fn fast3() -> ArqConfig {
        Self::preset(true, 10, 2, 1024, 30)
    }

    pub fn fast4() -> ArqConfig {
        Self::preset(true, 5, 1, 1024, 30)
    }

    /// like `fast3`, but with a smaller send window for clients
    pub fn client_fast3() -> ArqConfig {
        Self::preset(true, 10, 2, 128, 30)
    }

    pub fn client_fast4() -> ArqConfig {
        Self::preset(true, 5, 1, 256, 30)
    }

    pub fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.interval as u64)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.mtu < 50 {
            bail!("MTU is too small");
        }
        if self.mtu > u16::MAX as u32 {
            bail!("MTU is too big for a datagram");
        }
        if self.send_window == 0 || self.receive_window == 0 {
            bail!("window sizes must be positive");
        }
        if self.interval == 0 {
            bail!("interval must be positive");
        }
        if self.dead_link == 0 {
            bail!("dead link limit must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArqProfile {
    Normal,
    Fast1,
    Fast2,
    Fast3,
    Fast4,
    ClientFast3,
    ClientFast4,
}

impl ArqProfile {
    pub fn config(&self) -> ArqConfig {
        match self {
            ArqProfile::Normal => ArqConfig::normal(),
            ArqProfile::Fast1 => ArqConfig::fast1(),
            ArqProfile::Fast2 => ArqConfig::fast2(),
            ArqProfile::Fast3 => ArqConfig::fast3(),
            ArqProfile::Fast4 => ArqConfig::fast4(),
            ArqProfile::ClientFast3 => ArqConfig::client_fast3(),
            ArqProfile::ClientFast4 => ArqConfig::client_fast4(),
        }
    }
}

impl FromStr for ArqProfile {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "normal" => ArqProfile::Normal,
            "fast1" => ArqProfile::Fast1,
            "fast2" => ArqProfile::Fast2,
            "fast3" => ArqProfile::Fast3,
            "fast4" => ArqProfile::Fast4,
            "client-fast3" => ArqProfile::ClientFast3,
            "client-fast4" => ArqProfile::ClientFast4,
            other => bail!("unknown ARQ profile: {}", other),
        })
    }
}

#[derive(Debug, Clone)]
pub struct ArqTransportConfig {
    pub arq: ArqConfig,

    /// The conversation id of all ARQ segments. Both sides of a connection must agree on it.
    pub conversation: u32,

    /// A peer that sent nothing for this long is considered gone and torn down. This applies to
    ///  established peers as well as to peers waiting to be accepted.
    pub idle_timeout: Duration,

    /// receive buffer size for a single datagram
    pub max_datagram_size: usize,

    /// Datagrams received from a peer that was not accepted yet are buffered up to this number;
    ///  excess datagrams are dropped (the sender's ARQ retransmits them).
    pub max_pending_datagrams: usize,
}

impl Default for ArqTransportConfig {
    fn default() -> Self {
        ArqTransportConfig {
            arq: ArqConfig::default(),
            conversation: 0,
            idle_timeout: Duration::from_secs(300),
            max_datagram_size: 65536,
            max_pending_datagrams: 1024,
        }
    }
}

impl ArqTransportConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        self.arq.validate()?;
        if (self.max_datagram_size as u64) < self.arq.mtu as u64 {
            bail!("max datagram size must be at least the MTU");
        }
        if self.idle_timeout.is_zero() {
            bail!("idle timeout must be positive");
        }
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct MuxConfig {
    /// DATA payloads bigger than this are sent gzip compressed if that makes them smaller
    pub compression_threshold: usize,
    /// upper bound for the size of a decompressed DATA payload
    pub max_decompressed_len: usize,

    pub handshake_timeout: Duration,

    /// How often the keep-alive check runs. A PING is sent only if nothing is queued for sending
    ///  and nothing was read for `keepalive_idle`.
    pub keepalive_interval: Duration,
    pub keepalive_idle: Duration,
    pub keepalive_timeout: Duration,
    /// Number of successful PING round trips that are credited against later timeouts. A timed
    ///  out PING with no credit left fails the connection.
    pub keepalive_tolerance: u32,

    /// After a locally detected failure, the GOAWAY frame gets this long to be sent before the
    ///  lower connection is closed.
    pub fail_notify_delay: Duration,

    /// Streams can not write while this many bytes are queued for the lower connection
    pub max_write_queue_bytes: usize,

    /// inbound streams that are not accepted yet; excess streams are reset
    pub accept_backlog: usize,

    /// Unread bytes buffered per stream. A stream whose peer sends more is reset.
    pub max_stream_receive_bytes: usize,
}

impl Default for MuxConfig {
    fn default() -> Self {
        MuxConfig {
            compression_threshold: 1024,
            max_decompressed_len: 16 * 1024 * 1024,
            handshake_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(30),
            keepalive_idle: Duration::from_secs(5),
            keepalive_timeout: Duration::from_secs(5),
            keepalive_tolerance: 2,
            fail_notify_delay: Duration::from_secs(1),
            max_write_queue_bytes: 1024 * 1024,
            accept_backlog: 1024,
            max_stream_receive_bytes: 4 * 1024 * 1024,
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.max_write_queue_bytes == 0 {
            bail!("write queue size must be positive");
        }
        if self.max_stream_receive_bytes == 0 {
            bail!("stream receive buffer size must be positive");
        }
        if self.handshake_timeout.is_zero() || self.keepalive_interval.is_zero() || self.keepalive_timeout.is_zero() {
            bail!("timeouts must be positive");
        }
        Ok(())
    }
}

/// Combined configuration of a streamed ARQ client or server
#[derive(Debug, Clone, Default)]
pub struct StreamedArqConfig {
    pub transport: ArqTransportConfig,
    pub mux: MuxConfig,
}

impl StreamedArqConfig {
    pub fn client(profile: ArqProfile) -> StreamedArqConfig {
        StreamedArqConfig {
            transport: ArqTransportConfig {
                arq: profile.config(),
                ..Default::default()
            },
            mux: MuxConfig::default(),
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        self.transport.validate()?;
        self.mux.validate()
    }
}
