use std::io::ErrorKind;
use std::sync::Arc;
use std::time::Duration;

use mio::{Events, Poll, Token, Waker};
use tracing::trace;

use crate::event_set::EventSet;
use crate::handle::Handle;
use crate::loop_handle::LoopHandle;
use crate::registry::ReadinessRegistry;

pub(crate) const WAKER_TOKEN: Token = Token(usize::MAX);

const MAX_EVENTS: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Selected {
    pub handle: Handle,
    pub ready: EventSet,
}

/// Combines the platform poller for real descriptors with the synthetic selection of virtual
///  descriptors.
pub(crate) struct Selector<A> {
    poll: Poll,
    events: Events,
    registry: ReadinessRegistry<A>,
    loop_handle: LoopHandle,
}

impl<A> Selector<A> {
    pub fn new() -> anyhow::Result<Selector<A>> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let loop_handle = LoopHandle::new(waker);
        let registry = ReadinessRegistry::new(poll.registry().try_clone()?, loop_handle.clone());

        Ok(Selector {
            poll,
            events: Events::with_capacity(MAX_EVENTS),
            registry,
            loop_handle,
        })
    }

    pub fn registry(&self) -> &ReadinessRegistry<A> {
        &self.registry
    }

    pub fn registry_mut(&mut self) -> &mut ReadinessRegistry<A> {
        &mut self.registry
    }

    pub fn loop_handle(&self) -> &LoopHandle {
        &self.loop_handle
    }

    /// Virtual descriptors that are ready are collected first: if there are any, the poller is
    ///  only checked without blocking.
    pub fn select(&mut self, timeout: Option<Duration>) -> anyhow::Result<Vec<Selected>> {
        let mut result = self.registry.virtual_selection()
            .into_iter()
            .map(|(handle, ready)| Selected { handle, ready })
            .collect::<Vec<_>>();

        let timeout = if result.is_empty() { timeout } else { Some(Duration::ZERO) };

        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                trace!("poll was interrupted");
                return Ok(result);
            }
            Err(e) => return Err(e.into()),
        }

        for event in self.events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let Some(handle) = self.registry.handle_for_token(event.token()) else {
                trace!("event for stale token {:?} - ignoring", event.token());
                continue;
            };
            let ready = self.registry.real_ready(handle, EventSet::from_mio(event));
            if !ready.is_empty() {
                result.push(Selected { handle, ready });
            }
        }
        Ok(result)
    }
}
