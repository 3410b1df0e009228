use std::collections::BTreeMap;
use std::time::Duration;

use tokio::time::Instant;

use crate::util::arena::{Arena, SlotHandle};

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct TimerHandle(SlotHandle);

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum CancelResult {
    Cancelled,
    /// The handle no longer refers to a live timer: it fired (one-shot) or was cancelled
    ///  before. This is a normal situation and not an error.
    AlreadyFired,
}

pub type TimerCallback = Box<dyn FnMut()>;

struct TimerSlot {
    deadline: Instant,
    seq: u64,
    period: Option<Duration>,
    /// `None` while the callback is running
    callback: Option<TimerCallback>,
}

/// A timer that is due, taken out of the timer table for the duration of its callback.
pub struct DueTimer {
    pub handle: TimerHandle,
    pub callback: TimerCallback,
    pub periodic: bool,
}

/// Timer table of the loop thread. Deadlines are kept in a BTreeMap ordered by
///  (deadline, insertion sequence), so timers with the same deadline fire in the order they were
///  scheduled.
#[derive(Default)]
pub struct Timers {
    slots: Arena<TimerSlot>,
    queue: BTreeMap<(Instant, u64), SlotHandle>,
    next_seq: u64,
}

impl Timers {
    pub fn new() -> Timers {
        Default::default()
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn set_timeout(&mut self, now: Instant, delay: Duration, callback: impl FnOnce() + 'static) -> TimerHandle {
        let mut callback = Some(callback);
        self.add(now + delay, None, Box::new(move || {
            if let Some(cb) = callback.take() {
                cb();
            }
        }))
    }

    pub fn set_interval(&mut self, now: Instant, period: Duration, callback: impl FnMut() + 'static) -> TimerHandle {
        self.add(now + period, Some(period), Box::new(callback))
    }

    fn add(&mut self, deadline: Instant, period: Option<Duration>, callback: TimerCallback) -> TimerHandle {
        let seq = self.next_seq;
        self.next_seq += 1;

        let handle = self.slots.insert(TimerSlot {
            deadline,
            seq,
            period,
            callback: Some(callback),
        });
        self.queue.insert((deadline, seq), handle);
        TimerHandle(handle)
    }

    pub fn is_active(&self, handle: TimerHandle) -> bool {
        self.slots.contains(handle.0)
    }

    pub fn cancel(&mut self, handle: TimerHandle) -> CancelResult {
        match self.slots.remove(handle.0) {
            Some(slot) => {
                self.queue.remove(&(slot.deadline, slot.seq));
                CancelResult::Cancelled
            }
            None => CancelResult::AlreadyFired,
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.queue.keys().next()
            .map(|(deadline, _)| *deadline)
    }

    /// Takes the earliest timer that is due at `now`. One-shot timers are removed from the
    ///  table, so their handle is invalid while the callback runs; periodic timers keep their
    ///  slot and must be handed back through [`Timers::rearm`].
    pub fn pop_due(&mut self, now: Instant) -> Option<DueTimer> {
        let (&key, &handle) = self.queue.iter().next()?;
        if key.0 > now {
            return None;
        }
        self.queue.remove(&key);

        let periodic = self.slots.get(handle)
            .map(|slot| slot.period.is_some())?;

        let callback = if periodic {
            self.slots.get_mut(handle)?
                .callback.take()?
        }
        else {
            self.slots.remove(handle)?
                .callback?
        };

        Some(DueTimer {
            handle: TimerHandle(handle),
            callback,
            periodic,
        })
    }

    /// Re-schedules a periodic timer after its callback ran - unless it was cancelled from
    ///  inside the callback, in which case the callback is dropped here.
    pub fn rearm(&mut self, handle: TimerHandle, callback: TimerCallback) {
        let seq = self.next_seq;
        let Some(slot) = self.slots.get_mut(handle.0) else {
            return;
        };
        let Some(period) = slot.period else {
            return;
        };
        self.next_seq += 1;

        slot.deadline += period;
        slot.seq = seq;
        slot.callback = Some(callback);
        self.queue.insert((slot.deadline, seq), handle.0);
    }
}
