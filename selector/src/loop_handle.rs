use std::collections::VecDeque;
use std::fmt::{Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::bail;
use mio::Waker;
use tracing::trace;

use crate::event_loop::SelectorEventLoop;
use crate::handle::Handle;

pub(crate) type RemoteTask = Box<dyn FnOnce(&SelectorEventLoop) + Send>;

#[derive(Default)]
pub(crate) struct RemoteShared {
    tasks: Mutex<VecDeque<RemoteTask>>,
    removals: Mutex<Vec<Handle>>,
    closed: AtomicBool,
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A thread-safe reference to an event loop. This is the only way for code outside the loop's
///  thread to interact with the loop: submitting tasks, waking it up, or requesting removal of a
///  registration.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<RemoteShared>,
    waker: Arc<Waker>,
}

impl Debug for LoopHandle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "LoopHandle{{closed: {}}}", self.is_closed())
    }
}

impl LoopHandle {
    pub(crate) fn new(waker: Arc<Waker>) -> LoopHandle {
        LoopHandle {
            shared: Arc::new(RemoteShared::default()),
            waker,
        }
    }

    /// Queue a task for execution on the loop's thread, waking the loop if it is blocked
    pub fn run_on_loop(&self, task: impl FnOnce(&SelectorEventLoop) + Send + 'static) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("event loop is closed");
        }
        lock(&self.shared.tasks).push_back(Box::new(task));
        self.wakeup()
    }

    pub fn wakeup(&self) -> anyhow::Result<()> {
        self.waker.wake()?;
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    pub(crate) fn request_removal(&self, handle: Handle) {
        if self.is_closed() {
            return;
        }
        trace!("requesting removal of {}", handle);
        lock(&self.shared.removals).push(handle);
        let _ = self.waker.wake();
    }

    pub(crate) fn mark_closed(&self) {
        self.shared.closed.store(true, Ordering::Release);
        lock(&self.shared.tasks).clear();
        lock(&self.shared.removals).clear();
    }

    pub(crate) fn take_tasks(&self) -> VecDeque<RemoteTask> {
        std::mem::take(&mut *lock(&self.shared.tasks))
    }

    pub(crate) fn take_removals(&self) -> Vec<Handle> {
        std::mem::take(&mut *lock(&self.shared.removals))
    }
}
