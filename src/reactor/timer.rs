use super::EventLoop;
use std::fmt;
use std::time::{Duration, Instant};

/// Returned by a timer callback to deregister the timer.
pub const NOMORE: Duration = Duration::ZERO;

/// Timer callback. The returned interval reschedules the timer relative to
/// the moment it fired; `NOMORE` removes it.
pub type TimerProc<S, D> = fn(&mut EventLoop<S, D>, &mut S, TimerId, D) -> Duration;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TimerId(pub u64);

impl fmt::Display for TimerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "timer#{}", self.0)
    }
}

pub(crate) struct TimerEvent<S, D> {
    pub(crate) id: TimerId,
    pub(crate) due: Instant,
    pub(crate) proc: TimerProc<S, D>,
    pub(crate) data: D,
}

/// Unordered set of timers. Registered timers are few (periodic maintenance),
/// so every lookup is a linear scan.
pub(crate) struct TimerRegistry<S, D> {
    timers: Vec<TimerEvent<S, D>>,
    next_id: u64,
}

impl<S, D: Copy> TimerRegistry<S, D> {
    pub(crate) fn new() -> Self {
        Self {
            timers: Vec::new(),
            next_id: 0,
        }
    }

    pub(crate) fn add(&mut self, due: Instant, proc: TimerProc<S, D>, data: D) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.timers.push(TimerEvent {
            id,
            due,
            proc,
            data,
        });
        id
    }

    pub(crate) fn remove(&mut self, id: TimerId) -> bool {
        match self.timers.iter().position(|t| t.id == id) {
            Some(idx) => {
                self.timers.swap_remove(idx);
                true
            }
            None => false,
        }
    }

    pub(crate) fn nearest(&self) -> Option<Instant> {
        self.timers.iter().map(|t| t.due).min()
    }

    /// Id the next timer will get; timers at or above it were created after
    /// the caller took this snapshot.
    pub(crate) fn next_id(&self) -> TimerId {
        TimerId(self.next_id)
    }

    /// Ids of every timer due at `now` that existed before `limit`.
    pub(crate) fn due_before(&self, now: Instant, limit: TimerId) -> Vec<TimerId> {
        self.timers
            .iter()
            .filter(|t| t.id < limit && t.due <= now)
            .map(|t| t.id)
            .collect()
    }

    pub(crate) fn callback(&self, id: TimerId) -> Option<(TimerProc<S, D>, D)> {
        self.timers
            .iter()
            .find(|t| t.id == id)
            .map(|t| (t.proc, t.data))
    }

    pub(crate) fn reschedule(&mut self, id: TimerId, due: Instant) {
        if let Some(timer) = self.timers.iter_mut().find(|t| t.id == id) {
            timer.due = due;
        }
    }

    pub(crate) fn deadline(&self, id: TimerId) -> Option<Instant> {
        self.timers.iter().find(|t| t.id == id).map(|t| t.due)
    }

    pub(crate) fn len(&self) -> usize {
        self.timers.len()
    }
}
