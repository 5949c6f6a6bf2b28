//! Clock and timer service.
//!
//! Every delayed or periodic event in the experiment goes through a
//! [`Scheduler`]. Timers carry a typed payload instead of a callback: the
//! owner pops due timers one at a time and feeds them to its own transition
//! function, so a handler can cancel a sibling timer that is due on the same
//! tick before that sibling is ever delivered.

use std::cell::Cell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;
use std::time::{Duration, Instant};

/// Monotonic time source
pub trait Clock {
    /// Time elapsed since the clock's origin.
    fn now(&self) -> Duration;
}

/// Wall clock backed by `Instant`
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        self.origin.elapsed()
    }
}

/// Hand-driven clock for tests and headless runs. Clones share one timeline.
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Rc<Cell<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance(&self, by: Duration) {
        self.now.set(self.now.get() + by);
    }

    pub fn advance_ms(&self, ms: u64) {
        self.advance(Duration::from_millis(ms));
    }

    pub fn set(&self, at: Duration) {
        self.now.set(at);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        self.now.get()
    }
}

/// Opaque reference to a scheduled timer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerHandle(u64);

/// A timer that has come due
#[derive(Debug, Clone, PartialEq)]
pub struct Fired<E> {
    pub handle: TimerHandle,
    pub event: E,
    pub due: Duration,
}

#[derive(Debug)]
struct Entry<E> {
    event: E,
    period: Option<Duration>,
}

/// Single-threaded timer queue ordered by due time, then by creation order.
#[derive(Debug)]
pub struct Scheduler<C: Clock, E> {
    clock: C,
    next_id: u64,
    queue: BTreeMap<(Duration, u64), Entry<E>>,
    due_by_id: HashMap<u64, Duration>,
}

impl<C: Clock, E: Clone> Scheduler<C, E> {
    pub fn new(clock: C) -> Self {
        Self {
            clock,
            next_id: 0,
            queue: BTreeMap::new(),
            due_by_id: HashMap::new(),
        }
    }

    pub fn now(&self) -> Duration {
        self.clock.now()
    }

    /// Schedule `event` once, `delay` from now.
    pub fn after(&mut self, delay: Duration, event: E) -> TimerHandle {
        let due = self.now() + delay;
        self.insert(due, event, None)
    }

    /// Schedule `event` every `interval`, first firing one interval from now.
    pub fn every(&mut self, interval: Duration, event: E) -> TimerHandle {
        let interval = interval.max(Duration::from_millis(1));
        let due = self.now() + interval;
        self.insert(due, event, Some(interval))
    }

    /// Cancel a timer. Returns false when it already fired or was cancelled.
    pub fn cancel(&mut self, handle: TimerHandle) -> bool {
        match self.due_by_id.remove(&handle.0) {
            Some(due) => {
                self.queue.remove(&(due, handle.0));
                true
            }
            None => false,
        }
    }

    /// Cancel everything that is still outstanding.
    pub fn cancel_all(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        self.due_by_id.clear();
        count
    }

    pub fn pending(&self) -> usize {
        self.queue.len()
    }

    pub fn next_due(&self) -> Option<Duration> {
        self.queue.keys().next().map(|(due, _)| *due)
    }

    /// Pop the earliest timer whose due time has passed.
    ///
    /// Periodic timers are re-armed under the same handle before being
    /// returned; if the clock jumped past several periods the next firing is
    /// pushed a full interval past now instead of bursting.
    pub fn pop_due(&mut self) -> Option<Fired<E>> {
        let now = self.now();
        let (due, id) = *self.queue.keys().next()?;
        if due > now {
            return None;
        }

        let entry = self.queue.remove(&(due, id))?;
        self.due_by_id.remove(&id);

        if let Some(period) = entry.period {
            let mut next = due + period;
            if next <= now {
                next = now + period;
            }
            self.queue.insert(
                (next, id),
                Entry {
                    event: entry.event.clone(),
                    period: Some(period),
                },
            );
            self.due_by_id.insert(id, next);
        }

        Some(Fired {
            handle: TimerHandle(id),
            event: entry.event,
            due,
        })
    }

    fn insert(&mut self, due: Duration, event: E, period: Option<Duration>) -> TimerHandle {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.insert((due, id), Entry { event, period });
        self.due_by_id.insert(id, due);
        TimerHandle(id)
    }
}
