//! Stream multiplexing over a single reliable byte stream
//!
//! A [MuxConnection] wraps any [selector::VirtualSocket] and carries any number of independent
//!  [MuxStream]s over it, each of them a virtual socket itself.

mod compression;
mod connection;
mod frame;
#[cfg(test)]
mod memory_pipe;
mod stream;

pub use compression::{compress_if_smaller, decompress};
pub use connection::{MuxConnection, MuxRole, MuxState};
pub use frame::{Frame, FrameFlags, FrameType};
pub use stream::{MuxStream, StreamState};
