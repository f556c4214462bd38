use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::os::fd::RawFd;
use std::rc::{Rc, Weak};
use std::time::{Duration, Instant};

use anyhow::bail;
use tracing::{debug, error, info, trace, warn};

use crate::event_set::EventSet;
use crate::handle::Handle;
use crate::loop_handle::LoopHandle;
use crate::readiness::Readiness;
use crate::selector::{Selected, Selector};
use crate::timer::{TimerId, TimerQueue};

/// Callbacks of a registration. All callbacks are invoked on the loop's thread.
pub trait Handler {
    fn readable(&mut self, ctx: &HandlerContext<'_>);
    fn writable(&mut self, ctx: &HandlerContext<'_>);
    /// called after the registration was removed, including removals requested through
    ///  [Readiness::detach]
    fn removed(&mut self, _ctx: &HandlerContext<'_>) {}
}

pub type HandlerRef = Rc<RefCell<dyn Handler>>;

pub struct HandlerContext<'a> {
    pub event_loop: &'a SelectorEventLoop,
    pub handle: Handle,
}

type TimerCallback = Box<dyn FnMut(&SelectorEventLoop)>;
type LocalTask = Box<dyn FnOnce(&SelectorEventLoop)>;

struct LoopInner {
    selector: RefCell<Selector<HandlerRef>>,
    timers: RefCell<TimerQueue<TimerCallback>>,
    tasks: RefCell<VecDeque<LocalTask>>,
    loop_handle: LoopHandle,
    closed: Cell<bool>,
}

/// A single-threaded event loop that drives real descriptors (through the platform poller) and
///  virtual descriptors (through [Readiness] cells) uniformly, along with timers and deferred
///  tasks.
///
/// The loop is cheap to clone; clones refer to the same loop. It is deliberately `!Send`: code on
///  other threads interacts with it through a [LoopHandle].
///
/// Real descriptors are edge triggered: their owners must read / write until the operation
///  would block. Virtual descriptors are reported for as long as they stay ready.
#[derive(Clone)]
pub struct SelectorEventLoop {
    inner: Rc<LoopInner>,
}

/// Non-owning reference to a loop, for components that are themselves owned by the loop
#[derive(Clone)]
pub struct WeakEventLoop {
    inner: Weak<LoopInner>,
}

impl WeakEventLoop {
    pub fn upgrade(&self) -> Option<SelectorEventLoop> {
        self.inner.upgrade().map(|inner| SelectorEventLoop { inner })
    }
}

impl SelectorEventLoop {
    pub fn new() -> anyhow::Result<SelectorEventLoop> {
        let selector = Selector::new()?;
        let loop_handle = selector.loop_handle().clone();
        debug!("created event loop");

        Ok(SelectorEventLoop {
            inner: Rc::new(LoopInner {
                selector: RefCell::new(selector),
                timers: RefCell::new(TimerQueue::default()),
                tasks: RefCell::new(VecDeque::new()),
                loop_handle,
                closed: Cell::new(false),
            }),
        })
    }

    pub fn downgrade(&self) -> WeakEventLoop {
        WeakEventLoop { inner: Rc::downgrade(&self.inner) }
    }

    pub fn handle(&self) -> LoopHandle {
        self.inner.loop_handle.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.get()
    }

    fn check_open(&self) -> anyhow::Result<()> {
        if self.is_closed() {
            bail!("event loop is closed");
        }
        Ok(())
    }

    pub fn add_real(&self, fd: RawFd, events: EventSet, handler: HandlerRef) -> anyhow::Result<Handle> {
        self.do_add_real(fd, events, false, handler)
    }

    /// Registers a real descriptor whose handler is notified of writability even while it does
    ///  not watch [EventSet::WRITABLE]. This is for sockets that defer output on their own.
    pub fn add_real_writable_aware(&self, fd: RawFd, events: EventSet, handler: HandlerRef) -> anyhow::Result<Handle> {
        self.do_add_real(fd, events, true, handler)
    }

    fn do_add_real(&self, fd: RawFd, events: EventSet, auto_writable: bool, handler: HandlerRef) -> anyhow::Result<Handle> {
        self.check_open()?;
        let result = self.inner.selector.borrow_mut().registry_mut().register_real(fd, events, auto_writable, handler);
        if let Err(e) = &result {
            error!("failed to register fd {}: {}", fd, e);
        }
        result
    }

    pub fn add_virtual(&self, readiness: &Readiness, events: EventSet, handler: HandlerRef) -> anyhow::Result<Handle> {
        self.check_open()?;
        self.inner.selector.borrow_mut().registry_mut().register_virtual(readiness, events, handler)
    }

    pub fn modify(&self, handle: Handle, events: EventSet) -> anyhow::Result<()> {
        self.check_open()?;
        self.inner.selector.borrow_mut().registry_mut().modify(handle, events)
    }

    pub fn add_ops(&self, handle: Handle, events: EventSet) -> anyhow::Result<()> {
        let watched = self.watched(handle)?;
        if !watched.contains(events) {
            self.modify(handle, watched | events)?;
        }
        Ok(())
    }

    pub fn rm_ops(&self, handle: Handle, events: EventSet) -> anyhow::Result<()> {
        let watched = self.watched(handle)?;
        if watched.intersects(events) {
            self.modify(handle, watched - events)?;
        }
        Ok(())
    }

    pub fn watched(&self, handle: Handle) -> anyhow::Result<EventSet> {
        self.check_open()?;
        self.inner.selector.borrow().registry().watched(handle)
    }

    pub fn is_registered(&self, handle: Handle) -> bool {
        !self.is_closed() && self.inner.selector.borrow().registry().contains(handle)
    }

    /// Removes a registration. The handler's [Handler::removed] callback runs as a deferred task.
    pub fn remove(&self, handle: Handle) -> anyhow::Result<()> {
        self.check_open()?;
        let handler = self.inner.selector.borrow_mut().registry_mut().remove(handle)?;
        self.next_tick(move |event_loop| {
            match handler.try_borrow_mut() {
                Ok(mut h) => h.removed(&HandlerContext { event_loop, handle }),
                Err(_) => error!("should not happen: handler of {} is borrowed during removal", handle),
            };
        });
        Ok(())
    }

    pub fn signal_readable(&self, handle: Handle) -> anyhow::Result<()> {
        self.check_open()?;
        self.inner.selector.borrow_mut().registry_mut().signal(handle, EventSet::READABLE)
    }

    pub fn signal_writable(&self, handle: Handle) -> anyhow::Result<()> {
        self.check_open()?;
        self.inner.selector.borrow_mut().registry_mut().signal(handle, EventSet::WRITABLE)
    }

    pub fn clear_readable(&self, handle: Handle) -> anyhow::Result<()> {
        self.check_open()?;
        self.inner.selector.borrow_mut().registry_mut().clear(handle, EventSet::READABLE)
    }

    pub fn clear_writable(&self, handle: Handle) -> anyhow::Result<()> {
        self.check_open()?;
        self.inner.selector.borrow_mut().registry_mut().clear(handle, EventSet::WRITABLE)
    }

    /// Runs `callback` once after `delay`
    pub fn delay(&self, delay: Duration, callback: impl FnOnce(&SelectorEventLoop) + 'static) -> anyhow::Result<TimerId> {
        self.check_open()?;
        let mut callback = Some(callback);
        let callback: TimerCallback = Box::new(move |event_loop| {
            if let Some(callback) = callback.take() {
                callback(event_loop);
            }
        });
        Ok(self.inner.timers.borrow_mut().schedule(Instant::now() + delay, None, callback))
    }

    /// Runs `callback` every `period`, starting one period from now
    pub fn period(&self, period: Duration, callback: impl FnMut(&SelectorEventLoop) + 'static) -> anyhow::Result<TimerId> {
        self.check_open()?;
        if period.is_zero() {
            bail!("timer period must be positive");
        }
        Ok(self.inner.timers.borrow_mut().schedule(Instant::now() + period, Some(period), Box::new(callback)))
    }

    pub fn cancel_timer(&self, id: TimerId) -> bool {
        if self.is_closed() {
            return false;
        }
        // dropping a callback can cancel other timers, so it happens after the queue is released
        let cancelled = self.inner.timers.borrow_mut().cancel(id);
        cancelled.is_some()
    }

    /// Runs `task` on the loop thread after the current callback
    pub fn next_tick(&self, task: impl FnOnce(&SelectorEventLoop) + 'static) {
        if self.is_closed() {
            trace!("event loop is closed - dropping task");
            return;
        }
        self.inner.tasks.borrow_mut().push_back(Box::new(task));
    }

    pub fn loop_forever(&self) -> anyhow::Result<()> {
        info!("event loop started");
        while !self.is_closed() {
            self.one_poll(None)?;
        }
        info!("event loop finished");
        Ok(())
    }

    /// One iteration of the loop: queued tasks, then selecting and dispatching ready
    ///  descriptors, then due timers and tasks queued in the meantime.
    pub fn one_poll(&self, timeout: Option<Duration>) -> anyhow::Result<()> {
        self.check_open()?;

        self.run_remote();
        self.run_tasks();
        if self.is_closed() {
            return Ok(());
        }

        let timeout = {
            let next_timer = self.inner.timers.borrow_mut().next_deadline()
                .map(|deadline| deadline.saturating_duration_since(Instant::now()));
            let tasks_pending = !self.inner.tasks.borrow().is_empty();
            match (timeout, next_timer) {
                _ if tasks_pending => Some(Duration::ZERO),
                (Some(a), Some(b)) => Some(a.min(b)),
                (a, b) => a.or(b),
            }
        };

        let selected = self.inner.selector.borrow_mut().select(timeout)?;
        for s in selected {
            if self.is_closed() {
                return Ok(());
            }
            self.dispatch(s);
        }

        self.run_timers();
        self.run_tasks();
        Ok(())
    }

    fn dispatch(&self, selected: Selected) {
        let Selected { handle, ready } = selected;

        if ready.contains(EventSet::READABLE) {
            self.invoke(handle, |h, ctx| h.readable(ctx));
        }
        if ready.contains(EventSet::WRITABLE) {
            self.invoke(handle, |h, ctx| h.writable(ctx));
        }
    }

    fn invoke(&self, handle: Handle, f: impl FnOnce(&mut dyn Handler, &HandlerContext<'_>)) {
        // the registration may have been removed by an earlier callback of this iteration
        let handler = match self.inner.selector.borrow().registry().attachment(handle) {
            Ok(handler) => handler.clone(),
            Err(_) => return,
        };

        match handler.try_borrow_mut() {
            Ok(mut h) => f(&mut *h, &HandlerContext { event_loop: self, handle }),
            Err(_) => warn!("handler of {} is busy - skipping event", handle),
        };
    }

    fn run_remote(&self) {
        for handle in self.inner.loop_handle.take_removals() {
            if self.is_registered(handle) {
                if let Err(e) = self.remove(handle) {
                    debug!("removing {} failed: {}", handle, e);
                }
            }
        }
        for task in self.inner.loop_handle.take_tasks() {
            task(self);
        }
    }

    fn run_tasks(&self) {
        // tasks queued while running are left for the next round
        let num_tasks = self.inner.tasks.borrow().len();
        for _ in 0..num_tasks {
            let task = self.inner.tasks.borrow_mut().pop_front();
            match task {
                Some(task) => task(self),
                None => break,
            }
        }
    }

    fn run_timers(&self) {
        let now = Instant::now();
        loop {
            if self.is_closed() {
                return;
            }
            let due = self.inner.timers.borrow_mut().pop_due(now);
            let Some((id, mut callback, period)) = due else {
                return;
            };
            callback(self);
            if let Some(period) = period {
                let cancelled = self.inner.timers.borrow_mut().reschedule(id, now + period, callback);
                drop(cancelled);
            }
        }
    }

    /// Closes the loop: all registrations, timers and pending tasks are dropped, and every later
    ///  operation fails.
    pub fn close(&self) {
        if self.inner.closed.replace(true) {
            return;
        }
        debug!("closing event loop");
        self.inner.loop_handle.mark_closed();
        let timers = std::mem::take(&mut *self.inner.timers.borrow_mut());
        let tasks = std::mem::take(&mut *self.inner.tasks.borrow_mut());
        drop((timers, tasks));

        // handlers are dropped only after the registry is released
        let handlers = {
            let mut selector = self.inner.selector.borrow_mut();
            selector.registry().handles()
                .into_iter()
                .filter_map(|handle| selector.registry_mut().remove(handle).ok())
                .collect::<Vec<_>>()
        };
        debug!("dropped {} registrations", handlers.len());
    }
}
