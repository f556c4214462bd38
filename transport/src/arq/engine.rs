//! Sliding window ARQ turning a lossy, unordered datagram channel into an ordered byte stream.
//!
//! The engine is a pure state machine: it does no I/O and reads no clock. Received datagrams are
//!  fed in through [ArqEngine::input], and [ArqEngine::clock] returns the datagrams to be sent.
//!  Payload is always handled in 'stream mode', i.e. the engine does not preserve message
//!  boundaries and the fragment field of all segments is 0.
//!
//! Retransmission works per segment: a segment is retransmitted when its retransmission timeout
//!  expires, or (fast retransmit) when acks for enough later segments were received. RTO
//!  estimation follows the usual smoothed RTT / RTT variance scheme.
//!
//! If the peer's receive window is full, the engine probes it with exponential back-off until
//!  the peer announces a non-zero window.

use std::collections::VecDeque;

use anyhow::bail;
use bitflags::bitflags;
use bytes::{Buf, Bytes, BytesMut};
use tracing::{debug, error, trace};

use crate::arq::segment::{Command, SegmentHeader};
use crate::config::ArqConfig;
use crate::safe_converter::{PrecheckedCast, SafeCast};

const HEADER_LEN: usize = SegmentHeader::SERIALIZED_LEN;

const RTO_DEF: u32 = 200;
const RTO_MAX: u32 = 60_000;
const WND_RCV_MIN: u32 = 32;
const THRESH_INIT: u32 = 2;
const THRESH_MIN: u32 = 2;
const PROBE_INIT: u32 = 7_000;
const PROBE_LIMIT: u32 = 120_000;

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    struct Probe: u8 {
        const ASK_SEND = 1;
        const ASK_TELL = 2;
    }
}

/// Difference of two wrapping 32 bit sequence numbers or timestamps
fn time_diff(later: u32, earlier: u32) -> i32 {
    later.wrapping_sub(earlier) as i32
}

#[derive(Debug)]
struct SendSegment {
    sn: u32,
    data: BytesMut,
    resend_ts: u32,
    rto: u32,
    fast_ack: u32,
    xmit: u32,
}

#[derive(Debug)]
struct ReceivedSegment {
    sn: u32,
    data: Bytes,
}

/// Collects encoded segments into datagrams of at most `mtu` bytes
struct FlushBuffer {
    mtu: usize,
    buf: BytesMut,
    datagrams: Vec<Bytes>,
}

impl FlushBuffer {
    fn reserve(&mut self, needed: usize) {
        if self.buf.len() + needed > self.mtu && !self.buf.is_empty() {
            self.datagrams.push(self.buf.split().freeze());
        }
    }

    fn finish(mut self) -> Vec<Bytes> {
        if !self.buf.is_empty() {
            self.datagrams.push(self.buf.split().freeze());
        }
        self.datagrams
    }
}

pub struct ArqEngine {
    conv: u32,
    mtu: usize,
    mss: usize,
    dead: bool,

    snd_una: u32,
    snd_nxt: u32,
    rcv_nxt: u32,

    ssthresh: u32,
    rx_rttvar: i32,
    rx_srtt: i32,
    rx_rto: u32,
    rx_min_rto: u32,

    snd_wnd: u32,
    rcv_wnd: u32,
    rmt_wnd: u32,
    cwnd: u32,
    incr: u32,
    probe: Probe,
    ts_probe: u32,
    probe_wait: u32,

    current: u32,
    interval: u32,

    nodelay: bool,
    fast_resend: u32,
    fast_limit: u32,
    no_cwnd: bool,
    dead_link: u32,

    snd_queue: VecDeque<SendSegment>,
    snd_buf: VecDeque<SendSegment>,
    rcv_queue: VecDeque<Bytes>,
    rcv_buf: VecDeque<ReceivedSegment>,
    /// (sn, ts) of received segments that still need to be acked
    ack_list: Vec<(u32, u32)>,
}

impl ArqEngine {
    /// Presets are applied literally, including intervals below 10ms.
    pub fn new(conv: u32, config: &ArqConfig) -> ArqEngine {
        let mtu: usize = config.mtu.safe_cast();
        ArqEngine {
            conv,
            mtu,
            mss: mtu - HEADER_LEN,
            dead: false,
            snd_una: 0,
            snd_nxt: 0,
            rcv_nxt: 0,
            ssthresh: THRESH_INIT,
            rx_rttvar: 0,
            rx_srtt: 0,
            rx_rto: RTO_DEF,
            rx_min_rto: config.rx_min_rto,
            snd_wnd: config.send_window,
            rcv_wnd: config.receive_window.max(WND_RCV_MIN),
            rmt_wnd: WND_RCV_MIN,
            cwnd: 0,
            incr: 0,
            probe: Probe::empty(),
            ts_probe: 0,
            probe_wait: 0,
            current: 0,
            interval: config.interval,
            nodelay: config.nodelay,
            fast_resend: config.resend,
            fast_limit: config.fast_limit,
            no_cwnd: config.no_congestion_window,
            dead_link: config.dead_link,
            snd_queue: VecDeque::new(),
            snd_buf: VecDeque::new(),
            rcv_queue: VecDeque::new(),
            rcv_buf: VecDeque::new(),
            ack_list: Vec::new(),
        }
    }

    pub fn conv(&self) -> u32 {
        self.conv
    }

    /// A segment was transmitted `dead_link` times without being acked: the engine is permanently
    ///  unusable.
    pub fn is_valid(&self) -> bool {
        !self.dead
    }

    pub fn rto(&self) -> u32 {
        self.rx_rto
    }

    pub fn mss(&self) -> usize {
        self.mss
    }

    /// number of segments that were sent but not acked, or not sent yet
    pub fn wait_snd(&self) -> usize {
        self.snd_buf.len() + self.snd_queue.len()
    }

    /// The number of bytes that can be passed to [ArqEngine::send] without exceeding the send
    ///  window
    pub fn writable_capacity(&self) -> usize {
        if self.dead {
            return 0;
        }
        let snd_wnd: usize = self.snd_wnd.safe_cast();
        snd_wnd.saturating_sub(self.wait_snd()) * self.mss
    }

    fn wnd_unused(&self) -> u16 {
        let queued: u32 = self.rcv_queue.len().prechecked_cast();
        self.rcv_wnd.saturating_sub(queued).min(u16::MAX as u32).prechecked_cast()
    }

    /// Appends data to the send queue. Data is appended to the last queued segment as long as
    ///  that segment is smaller than the MSS.
    pub fn send(&mut self, data: &[u8]) -> anyhow::Result<()> {
        if self.dead {
            bail!("ARQ engine is invalid");
        }
        if data.is_empty() {
            bail!("can not send an empty buffer");
        }

        let mut data = data;
        if let Some(last) = self.snd_queue.back_mut() {
            if last.data.len() < self.mss {
                let extend = (self.mss - last.data.len()).min(data.len());
                last.data.extend_from_slice(&data[..extend]);
                data = &data[extend..];
            }
        }

        for chunk in data.chunks(self.mss) {
            self.snd_queue.push_back(SendSegment {
                sn: 0,
                data: BytesMut::from(chunk),
                resend_ts: 0,
                rto: 0,
                fast_ack: 0,
                xmit: 0,
            });
        }
        Ok(())
    }

    /// Drains all payload that is available in order
    pub fn recv(&mut self) -> Vec<Bytes> {
        let mut result = Vec::new();
        if self.rcv_queue.is_empty() {
            return result;
        }

        let rcv_wnd: usize = self.rcv_wnd.safe_cast();
        let recover = self.rcv_queue.len() >= rcv_wnd;
        while !self.rcv_queue.is_empty() {
            result.extend(self.rcv_queue.drain(..).filter(|b| !b.is_empty()));
            self.move_rcv_data();
        }

        if recover {
            // the peer may be waiting for the window to open
            self.probe |= Probe::ASK_TELL;
        }
        result
    }

    /// Processes a received datagram, which may contain several segments
    pub fn input(&mut self, mut datagram: Bytes) -> anyhow::Result<()> {
        trace!("input: {} bytes", datagram.len());
        if datagram.len() < HEADER_LEN {
            bail!("datagram of {} bytes is shorter than a segment header", datagram.len());
        }

        let old_snd_una = self.snd_una;
        let mut max_ack: Option<u32> = None;

        while datagram.remaining() >= HEADER_LEN {
            let header = SegmentHeader::deser(&mut datagram)?;
            if header.conv != self.conv {
                bail!("conversation mismatch: expected {}, received {}", self.conv, header.conv);
            }
            let len: usize = header.len.safe_cast();
            if datagram.remaining() < len {
                bail!("truncated segment: {} payload bytes announced, {} available", len, datagram.remaining());
            }
            let payload = datagram.split_to(len);

            self.rmt_wnd = header.wnd as u32;
            self.parse_una(header.una);
            self.shrink_buf();

            match header.cmd {
                Command::Ack => {
                    let rtt = time_diff(self.current, header.ts);
                    if rtt >= 0 {
                        self.update_ack(rtt);
                    }
                    self.parse_ack(header.sn);
                    self.shrink_buf();
                    max_ack = match max_ack {
                        Some(prev) if time_diff(header.sn, prev) <= 0 => Some(prev),
                        _ => Some(header.sn),
                    };
                    trace!("input ack: sn={}, rtt={}, rto={}", header.sn, rtt, self.rx_rto);
                }
                Command::Push => {
                    if time_diff(header.sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) < 0 {
                        self.ack_list.push((header.sn, header.ts));
                        if time_diff(header.sn, self.rcv_nxt) >= 0 {
                            self.parse_data(header.sn, payload);
                        }
                    }
                    trace!("input push: sn={}, una={}, ts={}", header.sn, header.una, header.ts);
                }
                Command::WindowAsk => {
                    self.probe |= Probe::ASK_TELL;
                    trace!("input window ask");
                }
                Command::WindowTell => {
                    trace!("input window tell: {}", header.wnd);
                }
            }
        }

        if let Some(max_ack) = max_ack {
            self.parse_fast_ack(max_ack);
        }

        if time_diff(self.snd_una, old_snd_una) > 0 && self.cwnd < self.rmt_wnd {
            self.grow_cwnd();
        }
        Ok(())
    }

    fn grow_cwnd(&mut self) {
        let mss: u32 = self.mss.prechecked_cast();
        if self.cwnd < self.ssthresh {
            self.cwnd += 1;
            self.incr += mss;
        }
        else {
            if self.incr < mss {
                self.incr = mss;
            }
            self.incr = self.incr.saturating_add(mss * mss / self.incr + mss / 16);
            if (self.cwnd + 1).saturating_mul(mss) <= self.incr {
                self.cwnd += 1;
            }
        }
        if self.cwnd > self.rmt_wnd {
            self.cwnd = self.rmt_wnd;
            self.incr = self.rmt_wnd.saturating_mul(mss);
        }
    }

    fn update_ack(&mut self, rtt: i32) {
        // the timestamp is echoed by the peer, so the sample is not trusted beyond the RTO bound
        let rtt = rtt.min(RTO_MAX as i32);
        if self.rx_srtt == 0 {
            self.rx_srtt = rtt;
            self.rx_rttvar = rtt / 2;
        }
        else {
            let delta = (rtt - self.rx_srtt).abs();
            self.rx_rttvar = (3 * self.rx_rttvar + delta) / 4;
            self.rx_srtt = ((7 * self.rx_srtt + rtt) / 8).max(1);
        }
        let rto = self.rx_srtt as u32 + self.interval.max(4 * self.rx_rttvar as u32);
        self.rx_rto = rto.clamp(self.rx_min_rto, RTO_MAX);
    }

    fn shrink_buf(&mut self) {
        self.snd_una = match self.snd_buf.front() {
            Some(seg) => seg.sn,
            None => self.snd_nxt,
        };
    }

    fn parse_una(&mut self, una: u32) {
        while let Some(seg) = self.snd_buf.front() {
            if time_diff(una, seg.sn) > 0 {
                self.snd_buf.pop_front();
            }
            else {
                break;
            }
        }
    }

    fn parse_ack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }

        let pos = self.snd_buf.iter()
            .take_while(|seg| time_diff(sn, seg.sn) >= 0)
            .position(|seg| seg.sn == sn);
        if let Some(pos) = pos {
            self.snd_buf.remove(pos);
        }
    }

    fn parse_fast_ack(&mut self, sn: u32) {
        if time_diff(sn, self.snd_una) < 0 || time_diff(sn, self.snd_nxt) >= 0 {
            return;
        }

        for seg in self.snd_buf.iter_mut() {
            if time_diff(sn, seg.sn) < 0 {
                break;
            }
            if sn != seg.sn {
                seg.fast_ack += 1;
            }
        }
    }

    fn parse_data(&mut self, sn: u32, data: Bytes) {
        if time_diff(sn, self.rcv_nxt.wrapping_add(self.rcv_wnd)) >= 0 || time_diff(sn, self.rcv_nxt) < 0 {
            return;
        }

        let mut insert_at = 0;
        for (i, seg) in self.rcv_buf.iter().enumerate().rev() {
            if seg.sn == sn {
                trace!("dropping duplicate segment {}", sn);
                self.move_rcv_data();
                return;
            }
            if time_diff(sn, seg.sn) > 0 {
                insert_at = i + 1;
                break;
            }
        }
        self.rcv_buf.insert(insert_at, ReceivedSegment { sn, data });

        self.move_rcv_data();
    }

    fn move_rcv_data(&mut self) {
        let rcv_wnd: usize = self.rcv_wnd.safe_cast();
        while let Some(seg) = self.rcv_buf.front() {
            if seg.sn != self.rcv_nxt || self.rcv_queue.len() >= rcv_wnd {
                break;
            }
            if let Some(seg) = self.rcv_buf.pop_front() {
                self.rcv_queue.push_back(seg.data);
                self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            }
        }
    }

    /// Advances the engine's clock to `now_ms` (a wrapping millisecond timestamp) and flushes
    ///  pending acks, window probes and data segments, returning the datagrams to send.
    ///
    /// Fails if the engine became invalid.
    pub fn clock(&mut self, now_ms: u32) -> anyhow::Result<Vec<Bytes>> {
        if self.dead {
            bail!("ARQ engine is invalid: a segment was sent {} times without being acked", self.dead_link);
        }
        self.current = now_ms;

        let result = self.flush();
        if self.dead {
            error!("conversation {}: link is dead", self.conv);
        }
        Ok(result)
    }

    fn flush(&mut self) -> Vec<Bytes> {
        let current = self.current;
        let wnd = self.wnd_unused();
        let mut out = FlushBuffer {
            mtu: self.mtu,
            buf: BytesMut::with_capacity(self.mtu),
            datagrams: Vec::new(),
        };

        let mut header = SegmentHeader {
            conv: self.conv,
            cmd: Command::Ack,
            frg: 0,
            wnd,
            ts: 0,
            sn: 0,
            una: self.rcv_nxt,
            len: 0,
        };

        for (sn, ts) in self.ack_list.drain(..) {
            out.reserve(HEADER_LEN);
            header.sn = sn;
            header.ts = ts;
            header.ser(&mut out.buf);
        }

        self.update_probe(current);
        header.sn = 0;
        header.ts = 0;
        if self.probe.contains(Probe::ASK_SEND) {
            header.cmd = Command::WindowAsk;
            out.reserve(HEADER_LEN);
            header.ser(&mut out.buf);
            debug!("conversation {}: asking for peer window", self.conv);
        }
        if self.probe.contains(Probe::ASK_TELL) {
            header.cmd = Command::WindowTell;
            out.reserve(HEADER_LEN);
            header.ser(&mut out.buf);
            trace!("conversation {}: telling window {}", self.conv, wnd);
        }
        self.probe = Probe::empty();

        let mut cwnd0 = self.snd_wnd.min(self.rmt_wnd);
        if !self.no_cwnd {
            cwnd0 = cwnd0.min(self.cwnd);
        }

        while time_diff(self.snd_nxt, self.snd_una.wrapping_add(cwnd0)) < 0 {
            let Some(mut seg) = self.snd_queue.pop_front() else {
                break;
            };
            seg.sn = self.snd_nxt;
            seg.resend_ts = current;
            seg.rto = self.rx_rto;
            seg.fast_ack = 0;
            seg.xmit = 0;
            self.snd_buf.push_back(seg);
            self.snd_nxt = self.snd_nxt.wrapping_add(1);
        }

        let resent = if self.fast_resend > 0 { self.fast_resend } else { u32::MAX };
        let rto_min = if self.nodelay { 0 } else { self.rx_rto >> 3 };
        let rx_rto = self.rx_rto;

        let mut change = false;
        let mut lost = false;
        for seg in self.snd_buf.iter_mut() {
            let need_send = if seg.xmit == 0 {
                seg.xmit += 1;
                seg.rto = rx_rto;
                seg.resend_ts = current.wrapping_add(seg.rto + rto_min);
                true
            }
            else if time_diff(current, seg.resend_ts) >= 0 {
                seg.xmit += 1;
                seg.fast_ack = 0;
                seg.rto += if self.nodelay { rx_rto / 2 } else { rx_rto };
                seg.resend_ts = current.wrapping_add(seg.rto);
                lost = true;
                debug!("conversation {}: resend sn={}, xmit={}, rto={}", self.conv, seg.sn, seg.xmit, seg.rto);
                true
            }
            else if seg.fast_ack >= resent && (seg.xmit <= self.fast_limit || self.fast_limit == 0) {
                seg.xmit += 1;
                seg.fast_ack = 0;
                seg.resend_ts = current.wrapping_add(seg.rto);
                change = true;
                debug!("conversation {}: fast resend sn={}, xmit={}", self.conv, seg.sn, seg.xmit);
                true
            }
            else {
                false
            };

            if need_send {
                let seg_header = SegmentHeader {
                    conv: self.conv,
                    cmd: Command::Push,
                    frg: 0,
                    wnd,
                    ts: current,
                    sn: seg.sn,
                    una: self.rcv_nxt,
                    len: seg.data.len().prechecked_cast(),
                };
                out.reserve(HEADER_LEN + seg.data.len());
                seg_header.ser(&mut out.buf);
                out.buf.extend_from_slice(&seg.data);

                if seg.xmit >= self.dead_link {
                    self.dead = true;
                }
            }
        }

        if change {
            let inflight = self.snd_nxt.wrapping_sub(self.snd_una);
            self.ssthresh = (inflight / 2).max(THRESH_MIN);
            self.cwnd = self.ssthresh.saturating_add(resent);
            self.incr = self.cwnd.saturating_mul(self.mss.prechecked_cast());
        }
        if lost {
            self.ssthresh = (cwnd0 / 2).max(THRESH_MIN);
            self.cwnd = 1;
            self.incr = self.mss.prechecked_cast();
        }
        if self.cwnd < 1 {
            self.cwnd = 1;
            self.incr = self.mss.prechecked_cast();
        }

        out.finish()
    }

    fn update_probe(&mut self, current: u32) {
        if self.rmt_wnd != 0 {
            self.ts_probe = 0;
            self.probe_wait = 0;
            return;
        }

        if self.probe_wait == 0 {
            self.probe_wait = PROBE_INIT;
            self.ts_probe = current.wrapping_add(self.probe_wait);
        }
        else if time_diff(current, self.ts_probe) >= 0 {
            self.probe_wait = self.probe_wait.max(PROBE_INIT);
            self.probe_wait = (self.probe_wait + self.probe_wait / 2).min(PROBE_LIMIT);
            self.ts_probe = current.wrapping_add(self.probe_wait);
            self.probe |= Probe::ASK_SEND;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, RngExt, SeedableRng};
    use rstest::rstest;

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    /// Moves datagrams between two engines, clocking both. Datagrams are dropped, duplicated and
    ///  reordered at random.
    fn run_link(a: &mut ArqEngine, b: &mut ArqEngine, rng: &mut StdRng, loss: f64, expected_len: usize, max_ticks: u32) -> Vec<u8> {
        let mut received = Vec::new();
        let mut now = 0u32;

        for _ in 0..max_ticks {
            now = now.wrapping_add(10);

            let mut a_to_b = a.clock(now).unwrap();
            let mut b_to_a = b.clock(now).unwrap();
            for datagrams in [&mut a_to_b, &mut b_to_a] {
                if datagrams.len() > 1 && rng.random_bool(0.5) {
                    datagrams.reverse();
                }
                if let Some(first) = datagrams.first().cloned() {
                    if rng.random_bool(0.1) {
                        datagrams.push(first);
                    }
                }
            }

            for d in a_to_b {
                if !rng.random_bool(loss) {
                    b.input(d).unwrap();
                }
            }
            for d in b_to_a {
                if !rng.random_bool(loss) {
                    a.input(d).unwrap();
                }
            }

            for chunk in b.recv() {
                received.extend_from_slice(&chunk);
            }
            if received.len() >= expected_len && a.wait_snd() == 0 {
                break;
            }
        }
        received
    }

    #[rstest]
    #[case::normal(ArqConfig::normal())]
    #[case::fast1(ArqConfig::fast1())]
    #[case::fast3(ArqConfig::fast3())]
    #[case::fast4(ArqConfig::fast4())]
    #[case::client_fast3(ArqConfig::client_fast3())]
    fn test_lossy_link(#[case] config: ArqConfig) {
        let mut rng = StdRng::seed_from_u64(4711);
        let mut a = ArqEngine::new(17, &config);
        let mut b = ArqEngine::new(17, &config);

        let data = payload(200_000);
        let mut offs = 0;
        let mut received = Vec::new();
        while offs < data.len() {
            let n = a.writable_capacity().min(data.len() - offs).min(7_000);
            if n > 0 {
                a.send(&data[offs..offs + n]).unwrap();
                offs += n;
            }
            received.extend(run_link(&mut a, &mut b, &mut rng, 0.2, 0, 1));
        }
        received.extend(run_link(&mut a, &mut b, &mut rng, 0.2, data.len() - received.len(), 20_000));

        assert_eq!(received.len(), data.len());
        assert!(received == data);
        assert!(a.is_valid());
        assert!(b.is_valid());
    }

    #[test]
    fn test_stream_mode_appends() {
        let mut engine = ArqEngine::new(1, &ArqConfig::default());
        let mss = engine.mss();
        engine.send(b"abc").unwrap();
        engine.send(b"def").unwrap();
        assert_eq!(engine.wait_snd(), 1);

        engine.send(&payload(mss)).unwrap();
        assert_eq!(engine.wait_snd(), 2);
        assert_eq!(engine.writable_capacity(), (1024 - 2) * mss);
        assert!(engine.send(&[]).is_err());
    }

    #[test]
    fn test_single_datagram_contains_ack_and_data() {
        let config = ArqConfig::default();
        let mut a = ArqEngine::new(5, &config);
        let mut b = ArqEngine::new(5, &config);

        a.send(b"hello").unwrap();
        let datagrams = a.clock(100).unwrap();
        assert_eq!(datagrams.len(), 1);
        assert_eq!(datagrams[0].len(), HEADER_LEN + 5);
        b.input(datagrams[0].clone()).unwrap();
        assert_eq!(b.recv(), vec![Bytes::from_static(b"hello")]);

        b.send(b"world").unwrap();
        let datagrams = b.clock(110).unwrap();
        assert_eq!(datagrams.len(), 1);
        // ack + data
        assert_eq!(datagrams[0].len(), 2 * HEADER_LEN + 5);

        a.input(datagrams[0].clone()).unwrap();
        assert_eq!(a.recv(), vec![Bytes::from_static(b"world")]);
        assert_eq!(a.wait_snd(), 0);
    }

    #[test]
    fn test_malformed_input() {
        let mut engine = ArqEngine::new(5, &ArqConfig::default());
        assert!(engine.input(Bytes::from_static(&[0; 10])).is_err());

        let mut other = ArqEngine::new(6, &ArqConfig::default());
        other.send(b"x").unwrap();
        let datagram = other.clock(0).unwrap().remove(0);
        assert!(engine.input(datagram.clone()).is_err());

        let mut mine = ArqEngine::new(5, &ArqConfig::default());
        mine.send(b"xyz").unwrap();
        let datagram = mine.clock(0).unwrap().remove(0);
        assert!(engine.input(datagram.slice(..datagram.len() - 1)).is_err());
    }

    #[test]
    fn test_dead_link() {
        let config = ArqConfig {
            dead_link: 3,
            ..ArqConfig::fast3()
        };
        let mut engine = ArqEngine::new(5, &config);
        engine.send(b"nobody listens").unwrap();

        let mut now = 0u32;
        let mut failed = false;
        for _ in 0..10_000 {
            now += 10;
            if engine.clock(now).is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed);
        assert!(!engine.is_valid());
        assert_eq!(engine.writable_capacity(), 0);
        assert!(engine.send(b"x").is_err());
        assert!(engine.clock(now + 10).is_err());
    }

    #[test]
    fn test_window_probe() {
        let config = ArqConfig::default();
        let mut a = ArqEngine::new(5, &config);
        // a window announcement of 0 from the peer
        let mut buf = BytesMut::new();
        SegmentHeader { conv: 5, cmd: Command::WindowTell, frg: 0, wnd: 0, ts: 0, sn: 0, una: 0, len: 0 }.ser(&mut buf);
        a.input(buf.freeze()).unwrap();

        a.send(b"blocked").unwrap();
        // no data while the remote window is closed
        assert!(a.clock(0).unwrap().is_empty());
        assert!(a.clock(6_999).unwrap().is_empty());

        let datagrams = a.clock(7_000).unwrap();
        assert_eq!(datagrams.len(), 1);
        let mut d = datagrams[0].clone();
        assert_eq!(SegmentHeader::deser(&mut d).unwrap().cmd, Command::WindowAsk);
    }

    #[test]
    fn test_rto_bounds() {
        let mut engine = ArqEngine::new(5, &ArqConfig::fast3());
        engine.update_ack(1);
        assert_eq!(engine.rto(), 30);
        engine.update_ack(100_000);
        assert_eq!(engine.rto(), RTO_MAX);
    }

    #[rstest]
    #[case::first_sample(false)]
    #[case::smoothed(true)]
    fn test_ack_with_ancient_timestamp(#[case] with_previous_sample: bool) {
        let mut engine = ArqEngine::new(5, &ArqConfig::fast3());
        if with_previous_sample {
            engine.update_ack(20);
        }
        engine.clock(0x7fff_fff0).unwrap();

        for _ in 0..3 {
            let mut buf = BytesMut::new();
            SegmentHeader { conv: 5, cmd: Command::Ack, frg: 0, wnd: 128, ts: 0, sn: 0, una: 0, len: 0 }.ser(&mut buf);
            engine.input(buf.freeze()).unwrap();
        }
        assert_eq!(engine.rto(), RTO_MAX);
        assert!(engine.is_valid());
    }

    #[test]
    fn test_cwnd_growth_with_max_mtu() {
        let config = ArqConfig { mtu: 65_535, no_congestion_window: false, ..ArqConfig::fast3() };
        let mut engine = ArqEngine::new(5, &config);
        engine.rmt_wnd = u16::MAX as u32;
        engine.ssthresh = 0;
        for _ in 0..1_000 {
            engine.grow_cwnd();
        }
        assert!(engine.cwnd <= engine.rmt_wnd);
    }
}
