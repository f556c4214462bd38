//! A single-threaded readiness event loop that treats real (kernel) descriptors and virtual
//!  (software-emulated) descriptors uniformly.
//!
//! ```ascii
//!                     +--------------------------------------------+
//!                     | SelectorEventLoop                          |
//!   tasks, wakeup     |                                            |
//!  -----------------> |  remote tasks -> local tasks               |
//!   (LoopHandle,      |         |                                  |
//!    any thread)      |         v                                  |
//!                     |  virtual selection ----+                   |
//!   set_readable()    |  (fired & watched)     |                   |
//!  -----------------> |                        v                   |
//!   (Readiness,       |  mio::Poll  -------> merge -> dispatch --> | Handler::readable()
//!    any thread)      |  (timeout 0 if any     |                   | Handler::writable()
//!                     |   virtual fd is ready) v                   |
//!                     |                  due timers, tasks         |
//!                     +--------------------------------------------+
//! ```
//!
//! Registrations are addressed by a generational [Handle]. Every registration carries a
//!  [Handler], which the loop calls on its own thread. Virtual descriptors carry their readiness
//!  in a [Readiness] cell which may be signalled from any thread: if the event is watched, the
//!  loop is woken up.
//!
//! Virtual sockets implement [VirtualSocket] and use [SocketCore] for the lifecycle they have in
//!  common. [BlockingBridgeSocket] is a virtual socket backed by blocking I/O on worker threads.

mod blocking_bridge;
mod event_loop;
mod event_set;
mod handle;
mod loop_handle;
mod readiness;
mod registry;
mod selector;
mod timer;
mod virtual_socket;

pub use blocking_bridge::{BlockingBridgeConfig, BlockingBridgeSocket};
pub use event_loop::{Handler, HandlerContext, HandlerRef, SelectorEventLoop, WeakEventLoop};
pub use event_set::EventSet;
pub use handle::Handle;
pub use loop_handle::LoopHandle;
pub use readiness::Readiness;
pub use timer::TimerId;
pub use virtual_socket::{ReadResult, SocketCore, SocketState, VirtualSocket};

#[cfg(test)]
mod tests {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
