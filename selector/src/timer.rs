use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::time::{Duration, Instant};

use rustc_hash::FxHashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(u64);

struct TimerSlot<T> {
    deadline: Instant,
    period: Option<Duration>,
    /// `None` while the callback is running
    callback: Option<T>,
}

/// Deadline-ordered timers. Cancelling a timer removes its slot; the stale heap entry is skipped
///  when it comes up.
pub(crate) struct TimerQueue<T> {
    heap: BinaryHeap<Reverse<(Instant, TimerId)>>,
    slots: FxHashMap<TimerId, TimerSlot<T>>,
    next_id: u64,
}

impl<T> Default for TimerQueue<T> {
    fn default() -> Self {
        TimerQueue {
            heap: BinaryHeap::new(),
            slots: FxHashMap::default(),
            next_id: 0,
        }
    }
}

impl<T> TimerQueue<T> {
    pub fn schedule(&mut self, deadline: Instant, period: Option<Duration>, callback: T) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;

        self.slots.insert(id, TimerSlot { deadline, period, callback: Some(callback) });
        self.heap.push(Reverse((deadline, id)));
        id
    }

    /// Removes a timer, handing back its callback so the caller decides where it is dropped. The
    ///  callback is `None` if it is currently running.
    pub fn cancel(&mut self, id: TimerId) -> Option<Option<T>> {
        self.slots.remove(&id).map(|slot| slot.callback)
    }

    pub fn next_deadline(&mut self) -> Option<Instant> {
        while let Some(Reverse((deadline, id))) = self.heap.peek() {
            match self.slots.get(id) {
                Some(slot) if slot.deadline == *deadline && slot.callback.is_some() => return Some(*deadline),
                _ => {
                    self.heap.pop();
                }
            }
        }
        None
    }

    /// Takes the callback of the next timer that is due at `now`. One-shot timers are removed,
    ///  periodic timers stay registered (without their callback) until [TimerQueue::reschedule].
    pub fn pop_due(&mut self, now: Instant) -> Option<(TimerId, T, Option<Duration>)> {
        while let Some(Reverse((deadline, id))) = self.heap.peek().copied() {
            if deadline > now {
                return None;
            }
            self.heap.pop();

            let Some(slot) = self.slots.get_mut(&id) else {
                continue;
            };
            if slot.deadline != deadline {
                continue;
            }
            let Some(callback) = slot.callback.take() else {
                continue;
            };
            let period = slot.period;
            if period.is_none() {
                self.slots.remove(&id);
            }
            return Some((id, callback, period));
        }
        None
    }

    /// Puts a periodic timer's callback back. If the timer was cancelled in the meantime, the
    ///  callback is returned.
    pub fn reschedule(&mut self, id: TimerId, deadline: Instant, callback: T) -> Option<T> {
        match self.slots.get_mut(&id) {
            Some(slot) => {
                slot.deadline = deadline;
                slot.callback = Some(callback);
                self.heap.push(Reverse((deadline, id)));
                None
            }
            None => Some(callback),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }
}
