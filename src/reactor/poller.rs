use super::Mask;
use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::time::Duration;

/// Token reserved for the stop waker; descriptor tokens are always below it.
const WAKE_TOKEN: Token = Token(usize::MAX);

/// A descriptor reported ready by one poll call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredEvent {
    pub fd: RawFd,
    pub mask: Mask,
}

/// The multiplexing syscall behind the event loop.
///
/// `add` and `del` receive both the previous and the resulting mask so an
/// implementation can choose between registering, re-registering and
/// deregistering the descriptor.
pub trait Poller: Send {
    fn add(&mut self, fd: RawFd, old: Mask, new: Mask) -> io::Result<()>;

    fn del(&mut self, fd: RawFd, old: Mask, new: Mask) -> io::Result<()>;

    /// Block for at most `timeout` (forever if `None`) and append every
    /// ready descriptor to `fired`.
    fn poll(&mut self, timeout: Option<Duration>, fired: &mut Vec<FiredEvent>) -> io::Result<()>;

    /// Handle that interrupts a blocked `poll`, if the poller supports it.
    fn waker(&self) -> Option<Arc<Waker>>;

    fn name(&self) -> &'static str;
}

/// `mio::Poll` backed poller (epoll on Linux, kqueue on BSD/macOS).
pub struct MioPoller {
    poll: Poll,
    events: Events,
    waker: Arc<Waker>,
}

impl MioPoller {
    pub fn new(capacity: usize) -> io::Result<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(capacity.clamp(64, 4096)),
            waker,
        })
    }
}

fn to_interest(mask: Mask) -> Option<Interest> {
    match (
        mask.contains(Mask::READABLE),
        mask.contains(Mask::WRITABLE),
    ) {
        (true, true) => Some(Interest::READABLE.add(Interest::WRITABLE)),
        (true, false) => Some(Interest::READABLE),
        (false, true) => Some(Interest::WRITABLE),
        (false, false) => None,
    }
}

impl Poller for MioPoller {
    fn add(&mut self, fd: RawFd, old: Mask, new: Mask) -> io::Result<()> {
        let Some(interest) = to_interest(new) else {
            return Ok(());
        };
        let previous = to_interest(old);
        if previous == Some(interest) {
            return Ok(());
        }
        let token = Token(fd as usize);
        if previous.is_none() {
            self.poll
                .registry()
                .register(&mut SourceFd(&fd), token, interest)
        } else {
            self.poll
                .registry()
                .reregister(&mut SourceFd(&fd), token, interest)
        }
    }

    fn del(&mut self, fd: RawFd, old: Mask, new: Mask) -> io::Result<()> {
        if to_interest(old).is_none() {
            return Ok(());
        }
        match to_interest(new) {
            Some(interest) => self.poll.registry().reregister(
                &mut SourceFd(&fd),
                Token(fd as usize),
                interest,
            ),
            None => self.poll.registry().deregister(&mut SourceFd(&fd)),
        }
    }

    fn poll(&mut self, timeout: Option<Duration>, fired: &mut Vec<FiredEvent>) -> io::Result<()> {
        self.poll.poll(&mut self.events, timeout)?;

        for event in self.events.iter() {
            if event.token() == WAKE_TOKEN {
                continue;
            }

            let mut mask = Mask::empty();
            // Hang-ups and errors surface as readable so the read path sees EOF.
            if event.is_readable() || event.is_read_closed() || event.is_error() {
                mask |= Mask::READABLE;
            }
            if event.is_writable() || event.is_write_closed() {
                mask |= Mask::WRITABLE;
            }
            if !mask.is_empty() {
                fired.push(FiredEvent {
                    fd: event.token().0 as RawFd,
                    mask,
                });
            }
        }

        Ok(())
    }

    fn waker(&self) -> Option<Arc<Waker>> {
        Some(Arc::clone(&self.waker))
    }

    fn name(&self) -> &'static str {
        if cfg!(any(target_os = "linux", target_os = "android")) {
            "epoll"
        } else {
            "kqueue"
        }
    }
}
