//! Reliable streams over UDP: a KCP style ARQ engine, a transport that runs one engine per peer
//!  on a shared UDP socket, and an HTTP/2 style stream multiplexer on top.
//!
//! ```ascii
//!   application         MuxStream  MuxStream  ...        (VirtualSocket)
//!                            \         /
//!   mux                     MuxConnection                 frames: DATA, HEADER, SETTINGS,
//!                                |                                PING, GOAWAY
//!   ARQ connection           ArqUdpSocket                 (VirtualSocket)
//!                                |
//!   ARQ transport           ArqUdpTransport               one ArqEngine per (local, remote)
//!                                |
//!   datagrams              DatagramSocket (UDP)
//! ```
//!
//! Everything runs on a [selector::SelectorEventLoop]. Each layer signals readiness to the layer
//!  above through a [selector::Readiness] cell, so an upper layer registers the lower layer's
//!  readiness with the loop just like a real socket.
//!
//! [streamed::StreamedArqClient] and [streamed::StreamedArqServer] assemble the full stack from a
//!  datagram socket and an [config::ArqProfile].
//!
//! ## ARQ segments
//!
//! All numbers are little endian:
//! ```ascii
//!  0: conversation id (u32)
//!  4: command (u8): 81 PUSH, 82 ACK, 83 window probe, 84 window size
//!  5: fragment (u8) - number of fragments of the message that follow this one
//!  6: receive window (u16) - free slots in the sender's receive queue
//!  8: timestamp (u32)
//! 12: sequence number (u32)
//! 16: una (u32) - all segments before this one were received
//! 20: payload length (u32)
//! 24: payload
//! ```
//!
//! Several segments can share a datagram, up to the configured MTU.
//!
//! ## Mux connection lifecycle
//!
//! Both sides send an empty SETTINGS frame as the handshake, the client first. After that,
//!  streams are opened with a HEADER frame (SYN) and confirmed with a HEADER frame of the same id
//!  (SYN-ACK). DATA with the CLOSE_STREAM flag half-closes a stream (FIN), HEADER with that flag
//!  resets it (RST). Locally detected protocol errors and timeouts are sent to the peer as GOAWAY
//!  before the lower connection is closed.

pub mod arq;
pub mod arq_udp;
pub mod config;
pub mod datagram_socket;
pub mod mux;
pub mod safe_converter;
pub mod streamed;
