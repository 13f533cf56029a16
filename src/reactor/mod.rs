//! Single-threaded reactor: descriptor readiness multiplexing plus timers.
//!
//! The event loop is generic over the state `S` handed to every callback and a
//! small `Copy` context `D` stored with each registration, so callbacks never
//! need global state or type-erased client data.

mod event_loop;
mod poller;
mod timer;

pub use event_loop::{EventLoop, FileProc, Hook, StopHandle};
pub use poller::{FiredEvent, MioPoller, Poller};
pub use timer::{TimerId, TimerProc, NOMORE};

bitflags::bitflags! {
    /// Interest / readiness mask of a file event.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Mask: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        /// Fire the writable callback before the readable one for this fd.
        const BARRIER = 1 << 2;
    }
}

bitflags::bitflags! {
    /// Flags controlling one `process_events` cycle.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct EventFlags: u8 {
        const FILE_EVENTS = 1 << 0;
        const TIME_EVENTS = 1 << 1;
        const ALL_EVENTS = Self::FILE_EVENTS.bits() | Self::TIME_EVENTS.bits();
        /// Poll without blocking.
        const DONT_WAIT = 1 << 2;
        /// Writable before readable for every fired descriptor.
        const BARRIER = 1 << 3;
        const CALL_AFTER_SLEEP = 1 << 4;
    }
}
