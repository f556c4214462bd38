use bitflags::bitflags;
use mio::event::Event;
use mio::Interest;

bitflags! {
    /// The two readiness events the loop tracks for every descriptor, real or virtual.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventSet: u8 {
        const READABLE = 1;
        const WRITABLE = 2;
    }
}

impl EventSet {
    /// `None` means 'nothing to watch', which for mio means deregistering the fd
    pub(crate) fn to_interest(self) -> Option<Interest> {
        match (self.contains(EventSet::READABLE), self.contains(EventSet::WRITABLE)) {
            (true, true) => Some(Interest::READABLE | Interest::WRITABLE),
            (true, false) => Some(Interest::READABLE),
            (false, true) => Some(Interest::WRITABLE),
            (false, false) => None,
        }
    }

    /// Errors and hang-ups are reported as both readable and writable so that the owner's next
    ///  read or write surfaces them.
    pub(crate) fn from_mio(event: &Event) -> EventSet {
        let mut result = EventSet::empty();
        if event.is_readable() || event.is_read_closed() || event.is_error() {
            result |= EventSet::READABLE;
        }
        if event.is_writable() || event.is_write_closed() || event.is_error() {
            result |= EventSet::WRITABLE;
        }
        result
    }
}
