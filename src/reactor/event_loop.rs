use super::poller::{FiredEvent, Poller};
use super::timer::{TimerId, TimerProc, TimerRegistry, NOMORE};
use super::{EventFlags, Mask};
use crate::error::{Error, Result};
use crossbeam_channel::{unbounded, Receiver, Sender};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// File event callback: `(loop, state, fd, fired direction, context)`.
pub type FileProc<S, D> = fn(&mut EventLoop<S, D>, &mut S, RawFd, Mask, D);

/// Before-sleep / after-sleep hook.
pub type Hook<S, D> = fn(&mut EventLoop<S, D>, &mut S);

/// Deadline used when `Instant + interval` does not fit the clock.
const FAR_FUTURE: Duration = Duration::from_secs(30 * 365 * 24 * 60 * 60);

fn deadline_after(from: Instant, interval: Duration) -> Instant {
    from.checked_add(interval)
        .or_else(|| from.checked_add(FAR_FUTURE))
        .unwrap_or(from)
}

struct FileEvent<S, D> {
    mask: Mask,
    read_proc: Option<FileProc<S, D>>,
    write_proc: Option<FileProc<S, D>>,
    data: Option<D>,
    /// One callback serves both directions; run it once per fired cycle.
    shared: bool,
}

impl<S, D> FileEvent<S, D> {
    fn empty() -> Self {
        Self {
            mask: Mask::empty(),
            read_proc: None,
            write_proc: None,
            data: None,
            shared: false,
        }
    }
}

/// Descriptor-indexed reactor with an unordered timer set.
pub struct EventLoop<S, D> {
    poller: Box<dyn Poller>,
    set_size: usize,
    events: Vec<FileEvent<S, D>>,
    fired: Vec<FiredEvent>,
    max_fd: RawFd,
    timers: TimerRegistry<S, D>,
    before_sleep: Option<Hook<S, D>>,
    after_sleep: Option<Hook<S, D>>,
    dont_wait: bool,
    stop_tx: Sender<Sender<()>>,
    stop_rx: Receiver<Sender<()>>,
}

/// Requests a synchronous stop of a running event loop from another thread.
#[derive(Clone)]
pub struct StopHandle {
    tx: Sender<Sender<()>>,
    waker: Option<Arc<mio::Waker>>,
}

impl StopHandle {
    /// Ask the loop to stop and block until it acknowledges.
    ///
    /// Once this returns no callback of the loop is executing or will execute.
    /// Returns immediately if the loop has already been dropped.
    pub fn stop_and_wait(&self) {
        let (ack_tx, ack_rx) = crossbeam_channel::bounded(1);
        if self.tx.send(ack_tx).is_err() {
            return;
        }
        if let Some(waker) = &self.waker {
            if let Err(e) = waker.wake() {
                warn!("Failed to wake event loop: {}", e);
            }
        }
        let _ = ack_rx.recv();
        info!("Event loop stop acknowledged");
    }
}

impl<S, D: Copy> EventLoop<S, D> {
    /// Create an event loop able to track descriptors `0..set_size`.
    pub fn new(set_size: usize, poller: Box<dyn Poller>) -> Self {
        let mut events = Vec::with_capacity(set_size);
        events.resize_with(set_size, FileEvent::empty);
        let (stop_tx, stop_rx) = unbounded();

        Self {
            poller,
            set_size,
            events,
            fired: Vec::with_capacity(set_size.min(1024)),
            max_fd: -1,
            timers: TimerRegistry::new(),
            before_sleep: None,
            after_sleep: None,
            dont_wait: false,
            stop_tx,
            stop_rx,
        }
    }

    pub fn set_size(&self) -> usize {
        self.set_size
    }

    /// Highest descriptor with a non-empty read/write mask, or -1.
    pub fn max_fd(&self) -> RawFd {
        self.max_fd
    }

    pub fn poller_name(&self) -> &'static str {
        self.poller.name()
    }

    pub fn set_before_sleep(&mut self, hook: Option<Hook<S, D>>) {
        self.before_sleep = hook;
    }

    pub fn set_after_sleep(&mut self, hook: Option<Hook<S, D>>) {
        self.after_sleep = hook;
    }

    /// When set, the next polls return immediately instead of blocking.
    pub fn set_dont_wait(&mut self, dont_wait: bool) {
        self.dont_wait = dont_wait;
    }

    pub fn stop_handle(&self) -> StopHandle {
        StopHandle {
            tx: self.stop_tx.clone(),
            waker: self.poller.waker(),
        }
    }

    /// Register `proc` for the directions in `mask` on `fd`.
    pub fn add_file_event(&mut self, fd: RawFd, mask: Mask, proc: FileProc<S, D>, data: D) -> Result<()> {
        self.register(fd, mask, proc, data, false)
    }

    /// Like [`add_file_event`](Self::add_file_event), but `proc` handles both
    /// directions itself and runs at most once per fired cycle. Sharing is
    /// dropped again only by a plain registration of both directions or by
    /// deleting the fd.
    pub fn add_shared_file_event(
        &mut self,
        fd: RawFd,
        mask: Mask,
        proc: FileProc<S, D>,
        data: D,
    ) -> Result<()> {
        self.register(fd, mask, proc, data, true)
    }

    fn register(&mut self, fd: RawFd, mask: Mask, proc: FileProc<S, D>, data: D, shared: bool) -> Result<()> {
        let idx = self.slot(fd)?;
        if !mask.intersects(Mask::READABLE | Mask::WRITABLE) {
            return Err(Error::EmptyMask);
        }

        let old = self.events[idx].mask;
        let new = old | mask;
        self.poller.add(fd, old, new)?;

        let event = &mut self.events[idx];
        event.mask = new;
        if mask.contains(Mask::READABLE) {
            event.read_proc = Some(proc);
        }
        if mask.contains(Mask::WRITABLE) {
            event.write_proc = Some(proc);
        }
        event.data = Some(data);
        // A plain registration of one direction leaves the other direction's
        // sharing in place.
        if shared || old.is_empty() || mask.contains(Mask::READABLE | Mask::WRITABLE) {
            event.shared = shared;
        }

        if fd > self.max_fd {
            self.max_fd = fd;
        }
        Ok(())
    }

    /// Clear the directions in `mask` for `fd`.
    pub fn del_file_event(&mut self, fd: RawFd, mask: Mask) -> Result<()> {
        let idx = self.slot(fd)?;
        let old = self.events[idx].mask;
        if old.is_empty() {
            return Ok(());
        }

        let mut removed = mask;
        // The barrier only makes sense while a write handler is installed.
        if removed.contains(Mask::WRITABLE) {
            removed |= Mask::BARRIER;
        }
        let new = old.difference(removed);
        let result = self.poller.del(fd, old, new);

        let event = &mut self.events[idx];
        event.mask = new;
        if mask.contains(Mask::READABLE) {
            event.read_proc = None;
        }
        if mask.contains(Mask::WRITABLE) {
            event.write_proc = None;
        }
        if !new.intersects(Mask::READABLE | Mask::WRITABLE) {
            *event = FileEvent::empty();
            if fd == self.max_fd {
                self.max_fd = self.highest_registered_below(fd);
            }
        }

        result.map_err(Error::from)
    }

    fn highest_registered_below(&self, fd: RawFd) -> RawFd {
        (0..fd)
            .rev()
            .find(|&j| {
                self.events[j as usize]
                    .mask
                    .intersects(Mask::READABLE | Mask::WRITABLE)
            })
            .unwrap_or(-1)
    }

    /// Directions currently registered for `fd`.
    pub fn file_event_mask(&self, fd: RawFd) -> Mask {
        self.slot(fd)
            .map(|idx| self.events[idx].mask)
            .unwrap_or_else(|_| Mask::empty())
    }

    fn slot(&self, fd: RawFd) -> Result<usize> {
        if fd < 0 || fd as usize >= self.set_size {
            return Err(Error::FdOutOfRange {
                fd,
                set_size: self.set_size,
            });
        }
        Ok(fd as usize)
    }

    /// Schedule `proc` to fire once `interval` has elapsed.
    /// Intervals past the clock's range are clamped to a far-future deadline.
    pub fn add_timer(&mut self, interval: Duration, proc: TimerProc<S, D>, data: D) -> TimerId {
        self.timers.add(deadline_after(Instant::now(), interval), proc, data)
    }

    pub fn del_timer(&mut self, id: TimerId) -> Result<()> {
        if self.timers.remove(id) {
            Ok(())
        } else {
            Err(Error::TimerNotFound(id.0))
        }
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Instant the given timer is due, if it is still registered.
    pub fn timer_deadline(&self, id: TimerId) -> Option<Instant> {
        self.timers.deadline(id)
    }

    /// How long the next poll may block, measured from `now`.
    /// `None` means block until a descriptor becomes ready.
    pub fn poll_timeout(&self, flags: EventFlags, now: Instant) -> Option<Duration> {
        if flags.contains(EventFlags::DONT_WAIT) || self.dont_wait {
            return Some(Duration::ZERO);
        }
        if flags.contains(EventFlags::TIME_EVENTS) {
            return self
                .timers
                .nearest()
                .map(|due| due.saturating_duration_since(now));
        }
        None
    }

    /// Run one reactor cycle and return the number of callbacks executed.
    pub fn process_events(&mut self, state: &mut S, flags: EventFlags) -> usize {
        if !flags.intersects(EventFlags::ALL_EVENTS) {
            return 0;
        }

        let mut processed = 0;
        let wants_timed_wait = flags.contains(EventFlags::TIME_EVENTS)
            && !flags.contains(EventFlags::DONT_WAIT)
            && !self.dont_wait;

        if self.max_fd != -1 || wants_timed_wait {
            let timeout = self.poll_timeout(flags, Instant::now());

            self.fired.clear();
            match self.poller.poll(timeout, &mut self.fired) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => warn!("Poll error: {}", e),
            }

            if flags.contains(EventFlags::FILE_EVENTS) {
                for i in 0..self.fired.len() {
                    let fired = self.fired[i];
                    processed += self.dispatch(state, fired, flags);
                }
            }

            if flags.contains(EventFlags::CALL_AFTER_SLEEP) {
                if let Some(hook) = self.after_sleep {
                    hook(self, state);
                }
            }
        }

        if flags.contains(EventFlags::TIME_EVENTS) {
            processed += self.process_time_events(state);
        }

        processed
    }

    fn dispatch(&mut self, state: &mut S, fired: FiredEvent, flags: EventFlags) -> usize {
        let Ok(idx) = self.slot(fired.fd) else {
            return 0;
        };
        let registered = self.events[idx].mask;
        let invert =
            flags.contains(EventFlags::BARRIER) || registered.contains(Mask::BARRIER);
        let mut count = 0;

        if !invert && fired.mask.contains(Mask::READABLE) {
            count += self.fire(state, idx, Mask::READABLE, count);
        }
        if fired.mask.contains(Mask::WRITABLE) {
            count += self.fire(state, idx, Mask::WRITABLE, count);
        }
        if invert && fired.mask.contains(Mask::READABLE) {
            count += self.fire(state, idx, Mask::READABLE, count);
        }

        count
    }

    /// Run the callback for one direction, re-reading the slot since an
    /// earlier callback may have changed or removed the registration.
    fn fire(&mut self, state: &mut S, idx: usize, direction: Mask, already: usize) -> usize {
        let event = &self.events[idx];
        if !event.mask.contains(direction) || (already > 0 && event.shared) {
            return 0;
        }
        let proc = if direction == Mask::READABLE {
            event.read_proc
        } else {
            event.write_proc
        };
        match (proc, event.data) {
            (Some(proc), Some(data)) => {
                proc(self, state, idx as RawFd, direction, data);
                1
            }
            _ => 0,
        }
    }

    /// Fire every due timer. Timers created while this runs wait for the
    /// next cycle.
    pub fn process_time_events(&mut self, state: &mut S) -> usize {
        let limit = self.timers.next_id();
        let due = self.timers.due_before(Instant::now(), limit);
        let mut processed = 0;

        for id in due {
            // An earlier callback may have deleted this timer.
            let Some((proc, data)) = self.timers.callback(id) else {
                continue;
            };
            let fired_at = Instant::now();
            let next = proc(self, state, id, data);
            processed += 1;

            if next == NOMORE {
                self.timers.remove(id);
            } else {
                self.timers.reschedule(id, deadline_after(fired_at, next));
            }
        }

        processed
    }

    fn stop_requested(&self) -> Option<Sender<()>> {
        self.stop_rx.try_recv().ok()
    }

    /// Run cycles until a [`StopHandle`] requests a stop.
    pub fn run(&mut self, state: &mut S) {
        info!(
            "Event loop started (poller: {}, set size: {})",
            self.poller.name(),
            self.set_size
        );

        loop {
            if let Some(ack) = self.stop_requested() {
                debug!("Event loop received stop request");
                let _ = ack.send(());
                break;
            }

            if let Some(hook) = self.before_sleep {
                hook(self, state);
            }

            self.process_events(state, EventFlags::ALL_EVENTS | EventFlags::CALL_AFTER_SLEEP);
        }

        info!("Event loop stopped");
    }
}
