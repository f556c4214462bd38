use std::os::fd::RawFd;

use anyhow::{anyhow, bail};
use mio::unix::SourceFd;
use mio::Token;
use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::event_set::EventSet;
use crate::handle::{Arena, Handle};
use crate::loop_handle::LoopHandle;
use crate::readiness::Readiness;

enum Source {
    Real {
        fd: RawFd,
        in_poll: bool,
        /// writable events are delivered even when the owner does not watch them
        auto_writable: bool,
    },
    Virtual {
        readiness: Readiness,
    },
}

struct Entry<A> {
    source: Source,
    watched: EventSet,
    attachment: A,
}

/// Tracks, per descriptor, the events the owner is interested in and the attachment to notify.
///
/// Real descriptors are registered with the platform poller (through mio); their fired events
///  are whatever the poller reports. Virtual descriptors carry their fired events in a shared
///  [Readiness] cell.
pub(crate) struct ReadinessRegistry<A> {
    registry: mio::Registry,
    loop_handle: LoopHandle,
    entries: Arena<Entry<A>>,
    real_fds: FxHashMap<RawFd, Handle>,
}

impl<A> ReadinessRegistry<A> {
    pub fn new(registry: mio::Registry, loop_handle: LoopHandle) -> ReadinessRegistry<A> {
        ReadinessRegistry {
            registry,
            loop_handle,
            entries: Arena::default(),
            real_fds: FxHashMap::default(),
        }
    }

    fn token(handle: Handle) -> Token {
        Token(handle.index as usize)
    }

    fn poll_interest(watched: EventSet, auto_writable: bool) -> EventSet {
        if auto_writable {
            watched | EventSet::WRITABLE
        }
        else {
            watched
        }
    }

    pub fn register_real(&mut self, fd: RawFd, watched: EventSet, auto_writable: bool, attachment: A) -> anyhow::Result<Handle> {
        if let Some(existing) = self.real_fds.get(&fd) {
            bail!("fd {} is already registered as {}", fd, existing);
        }

        let handle = self.entries.insert(Entry {
            source: Source::Real { fd, in_poll: false, auto_writable },
            watched,
            attachment,
        });

        if let Some(interest) = Self::poll_interest(watched, auto_writable).to_interest() {
            if let Err(e) = self.registry.register(&mut SourceFd(&fd), Self::token(handle), interest) {
                self.entries.remove(handle);
                debug!("registering fd {} failed: {}", fd, e);
                return Err(e.into());
            }
            if let Some(Entry { source: Source::Real { in_poll, .. }, .. }) = self.entries.get_mut(handle) {
                *in_poll = true;
            }
        }

        self.real_fds.insert(fd, handle);
        trace!("registered fd {} as {} watching {:?}", fd, handle, watched);
        Ok(handle)
    }

    pub fn register_virtual(&mut self, readiness: &Readiness, watched: EventSet, attachment: A) -> anyhow::Result<Handle> {
        if readiness.is_registered() {
            bail!("virtual descriptor is already registered");
        }

        let handle = self.entries.insert(Entry {
            source: Source::Virtual { readiness: readiness.clone() },
            watched,
            attachment,
        });
        if let Err(e) = readiness.bind(handle, self.loop_handle.clone(), watched) {
            self.entries.remove(handle);
            return Err(e);
        }
        trace!("registered virtual descriptor {} watching {:?}", handle, watched);
        Ok(handle)
    }

    pub fn modify(&mut self, handle: Handle, watched: EventSet) -> anyhow::Result<()> {
        let entry = self.entries.get_mut(handle)
            .ok_or_else(|| anyhow!("cancelled key: {} is not registered", handle))?;
        entry.watched = watched;

        match &mut entry.source {
            Source::Real { fd, in_poll, auto_writable } => {
                let token = Self::token(handle);
                match (Self::poll_interest(watched, *auto_writable).to_interest(), *in_poll) {
                    (Some(interest), true) => self.registry.reregister(&mut SourceFd(&*fd), token, interest)?,
                    (Some(interest), false) => {
                        self.registry.register(&mut SourceFd(&*fd), token, interest)?;
                        *in_poll = true;
                    }
                    (None, true) => {
                        self.registry.deregister(&mut SourceFd(&*fd))?;
                        *in_poll = false;
                    }
                    (None, false) => {}
                }
            }
            Source::Virtual { readiness } => readiness.set_watched(watched),
        }
        Ok(())
    }

    pub fn remove(&mut self, handle: Handle) -> anyhow::Result<A> {
        let entry = self.entries.remove(handle)
            .ok_or_else(|| anyhow!("cancelled key: {} is not registered", handle))?;

        match &entry.source {
            Source::Real { fd, in_poll, .. } => {
                self.real_fds.remove(fd);
                if *in_poll {
                    // the fd may already be closed by its owner, which removes it from the poller anyway
                    if let Err(e) = self.registry.deregister(&mut SourceFd(fd)) {
                        debug!("deregistering fd {} failed: {}", fd, e);
                    }
                }
            }
            Source::Virtual { readiness } => readiness.unbind(),
        }
        trace!("removed {}", handle);
        Ok(entry.attachment)
    }

    pub fn contains(&self, handle: Handle) -> bool {
        self.entries.get(handle).is_some()
    }

    pub fn watched(&self, handle: Handle) -> anyhow::Result<EventSet> {
        self.entries.get(handle)
            .map(|e| e.watched)
            .ok_or_else(|| anyhow!("cancelled key: {} is not registered", handle))
    }

    pub fn attachment(&self, handle: Handle) -> anyhow::Result<&A> {
        self.entries.get(handle)
            .map(|e| &e.attachment)
            .ok_or_else(|| anyhow!("cancelled key: {} is not registered", handle))
    }

    /// Raise events on a virtual descriptor. Signalling a descriptor that is not (or no longer)
    ///  registered is tolerated and ignored.
    pub fn signal(&mut self, handle: Handle, events: EventSet) -> anyhow::Result<()> {
        match self.entries.get(handle) {
            None => {
                warn!("signalling {:?} on {} which is not registered - ignoring", events, handle);
                Ok(())
            }
            Some(Entry { source: Source::Real { fd, .. }, .. }) => bail!("cannot signal real fd {}", fd),
            Some(Entry { source: Source::Virtual { readiness }, .. }) => {
                readiness.fire(events);
                Ok(())
            }
        }
    }

    pub fn clear(&mut self, handle: Handle, events: EventSet) -> anyhow::Result<()> {
        match self.entries.get(handle) {
            None => {
                warn!("clearing {:?} on {} which is not registered - ignoring", events, handle);
                Ok(())
            }
            Some(Entry { source: Source::Real { fd, .. }, .. }) => bail!("cannot clear events on real fd {}", fd),
            Some(Entry { source: Source::Virtual { readiness }, .. }) => {
                readiness.cancel(events);
                Ok(())
            }
        }
    }

    /// all virtual descriptors whose fired events intersect their watched events
    pub fn virtual_selection(&self) -> Vec<(Handle, EventSet)> {
        self.entries.iter()
            .filter_map(|(handle, entry)| match &entry.source {
                Source::Virtual { readiness } => {
                    let ready = readiness.fired() & entry.watched;
                    (!ready.is_empty()).then_some((handle, ready))
                }
                Source::Real { .. } => None,
            })
            .collect()
    }

    pub fn handle_for_token(&self, token: Token) -> Option<Handle> {
        self.entries.handle_at(token.0)
    }

    /// Filters events reported by the poller for a real descriptor down to what the owner
    ///  should see.
    pub fn real_ready(&self, handle: Handle, reported: EventSet) -> EventSet {
        match self.entries.get(handle) {
            Some(Entry { source: Source::Real { auto_writable, .. }, watched, .. }) =>
                reported & Self::poll_interest(*watched, *auto_writable),
            _ => EventSet::empty(),
        }
    }

    pub fn handles(&self) -> Vec<Handle> {
        self.entries.iter().map(|(h, _)| h).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}
