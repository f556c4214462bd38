use std::fmt::{Debug, Formatter};
use std::sync::{Arc, Mutex};

use anyhow::bail;
use tracing::{trace, warn};

use crate::event_set::EventSet;
use crate::handle::Handle;
use crate::loop_handle::{lock, LoopHandle};

struct Binding {
    handle: Handle,
    loop_handle: LoopHandle,
}

#[derive(Default)]
struct ReadinessInner {
    fired: EventSet,
    watched: EventSet,
    binding: Option<Binding>,
}

/// The readiness state of a virtual descriptor, i.e. a socket that is emulated in software rather
///  than backed by the kernel.
///
/// Fired events accumulate until they are explicitly cancelled: the loop reports a virtual
///  descriptor as ready on every iteration for as long as its fired events intersect its watched
///  events. This mirrors level-triggered semantics and means that an owner must cancel
///  readability once its buffer is drained.
///
/// Signals may be raised from any thread. If the descriptor is registered and the event is
///  watched, the owning loop is woken up. Signals raised before registration are remembered.
#[derive(Clone, Default)]
pub struct Readiness {
    inner: Arc<Mutex<ReadinessInner>>,
}

impl Debug for Readiness {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let inner = lock(&self.inner);
        write!(f, "Readiness{{fired: {:?}, watched: {:?}, handle: {:?}}}",
               inner.fired, inner.watched, inner.binding.as_ref().map(|b| b.handle))
    }
}

impl Readiness {
    pub fn new() -> Readiness {
        Readiness::default()
    }

    pub fn set_readable(&self) {
        self.fire(EventSet::READABLE);
    }

    pub fn set_writable(&self) {
        self.fire(EventSet::WRITABLE);
    }

    pub fn cancel_readable(&self) {
        lock(&self.inner).fired.remove(EventSet::READABLE);
    }

    pub fn cancel_writable(&self) {
        lock(&self.inner).fired.remove(EventSet::WRITABLE);
    }

    pub fn fired(&self) -> EventSet {
        lock(&self.inner).fired
    }

    pub fn is_registered(&self) -> bool {
        lock(&self.inner).binding.is_some()
    }

    pub fn handle(&self) -> Option<Handle> {
        lock(&self.inner).binding.as_ref().map(|b| b.handle)
    }

    pub(crate) fn fire(&self, events: EventSet) {
        let inner = &mut *lock(&self.inner);
        inner.fired |= events;
        if let Some(binding) = &inner.binding {
            if inner.watched.intersects(events) {
                if let Err(e) = binding.loop_handle.wakeup() {
                    warn!("failed to wake up event loop for {}: {}", binding.handle, e);
                }
            }
        }
    }

    pub(crate) fn cancel(&self, events: EventSet) {
        lock(&self.inner).fired.remove(events);
    }

    pub(crate) fn bind(&self, handle: Handle, loop_handle: LoopHandle, watched: EventSet) -> anyhow::Result<()> {
        let inner = &mut *lock(&self.inner);
        if let Some(existing) = &inner.binding {
            bail!("virtual descriptor is already registered as {}", existing.handle);
        }
        inner.binding = Some(Binding { handle, loop_handle });
        inner.watched = watched;
        Ok(())
    }

    pub(crate) fn unbind(&self) {
        let inner = &mut *lock(&self.inner);
        inner.binding = None;
        inner.watched = EventSet::empty();
    }

    pub(crate) fn set_watched(&self, watched: EventSet) {
        lock(&self.inner).watched = watched;
    }

    /// fired events that are also watched
    pub(crate) fn selected(&self) -> EventSet {
        let inner = lock(&self.inner);
        inner.fired & inner.watched
    }

    /// Asks the owning loop to remove this descriptor's registration. Callable from any thread;
    ///  the removal itself happens on the loop's thread, and the registration's handler is
    ///  notified through [crate::Handler::removed].
    pub fn detach(&self) {
        let inner = lock(&self.inner);
        if let Some(binding) = &inner.binding {
            trace!("detaching virtual descriptor {}", binding.handle);
            binding.loop_handle.request_removal(binding.handle);
        }
    }
}
