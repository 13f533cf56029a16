#![allow(dead_code)]

use bytes::Bytes;
use roma_server::network::Client;
use roma_server::reactor::{FiredEvent, Mask, Poller};
use roma_server::{CommandHandler, Config};
use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;
use std::sync::{Arc, Mutex};
use std::time::Duration;

#[derive(Default)]
struct PollerState {
    registered: HashMap<RawFd, Mask>,
    writable_removals: HashMap<RawFd, usize>,
    queued: Vec<FiredEvent>,
    level_writable: bool,
}

/// Poller double: reports whatever the test queued, and optionally every
/// WRITABLE registration on each poll, like a level-triggered writable
/// socket with room in its send buffer.
#[derive(Clone, Default)]
pub struct ScriptedPoller {
    state: Arc<Mutex<PollerState>>,
}

impl ScriptedPoller {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fire(&self, fd: RawFd, mask: Mask) {
        self.state.lock().unwrap().queued.push(FiredEvent { fd, mask });
    }

    pub fn set_level_writable(&self, enabled: bool) {
        self.state.lock().unwrap().level_writable = enabled;
    }

    pub fn registered(&self, fd: RawFd) -> Mask {
        self.state
            .lock()
            .unwrap()
            .registered
            .get(&fd)
            .copied()
            .unwrap_or_default()
    }

    pub fn writable_removals(&self, fd: RawFd) -> usize {
        self.state
            .lock()
            .unwrap()
            .writable_removals
            .get(&fd)
            .copied()
            .unwrap_or(0)
    }
}

impl Poller for ScriptedPoller {
    fn add(&mut self, fd: RawFd, _old: Mask, new: Mask) -> io::Result<()> {
        self.state.lock().unwrap().registered.insert(fd, new);
        Ok(())
    }

    fn del(&mut self, fd: RawFd, old: Mask, new: Mask) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        if old.contains(Mask::WRITABLE) && !new.contains(Mask::WRITABLE) {
            *state.writable_removals.entry(fd).or_default() += 1;
        }
        if new.intersects(Mask::READABLE | Mask::WRITABLE) {
            state.registered.insert(fd, new);
        } else {
            state.registered.remove(&fd);
        }
        Ok(())
    }

    fn poll(&mut self, _timeout: Option<Duration>, fired: &mut Vec<FiredEvent>) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        let queued: Vec<FiredEvent> = state.queued.drain(..).collect();
        for event in queued {
            if state.registered.contains_key(&event.fd) {
                fired.push(event);
            }
        }
        if state.level_writable {
            let mut writable: Vec<RawFd> = state
                .registered
                .iter()
                .filter(|(_, mask)| mask.contains(Mask::WRITABLE))
                .map(|(fd, _)| *fd)
                .collect();
            writable.sort();
            for fd in writable {
                fired.push(FiredEvent {
                    fd,
                    mask: Mask::WRITABLE,
                });
            }
        }
        Ok(())
    }

    fn waker(&self) -> Option<Arc<mio::Waker>> {
        None
    }

    fn name(&self) -> &'static str {
        "scripted"
    }
}

/// Socket wrapper whose writes accept at most `chunk` bytes and alternate
/// with `WouldBlock`, recording everything accepted.
pub struct Throttled {
    inner: UnixStream,
    chunk: usize,
    block_next: bool,
    written: Arc<Mutex<Vec<u8>>>,
}

impl Throttled {
    pub fn new(inner: UnixStream, chunk: usize) -> (Self, Arc<Mutex<Vec<u8>>>) {
        inner.set_nonblocking(true).unwrap();
        let written = Arc::new(Mutex::new(Vec::new()));
        let stream = Self {
            inner,
            chunk,
            block_next: false,
            written: Arc::clone(&written),
        };
        (stream, written)
    }
}

impl Read for Throttled {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

impl Write for Throttled {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.block_next {
            self.block_next = false;
            return Err(io::ErrorKind::WouldBlock.into());
        }
        self.block_next = true;
        let n = buf.len().min(self.chunk);
        self.written.lock().unwrap().extend_from_slice(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl AsRawFd for Throttled {
    fn as_raw_fd(&self) -> RawFd {
        self.inner.as_raw_fd()
    }
}

pub type Seen = Arc<Mutex<Vec<(u64, Vec<Bytes>)>>>;

/// Records every command with the issuing client id. `BIG <n>` replies with
/// an `n` byte bulk string, anything else with `+OK`.
pub struct Recorder {
    pub seen: Seen,
}

impl Recorder {
    pub fn new() -> (Self, Seen) {
        let seen: Seen = Arc::default();
        (
            Self {
                seen: Arc::clone(&seen),
            },
            seen,
        )
    }
}

impl<S> CommandHandler<S> for Recorder {
    fn process_command(&mut self, client: &mut Client<S>, argv: Vec<Bytes>) {
        self.seen
            .lock()
            .unwrap()
            .push((client.id().0, argv.clone()));

        if argv[0].eq_ignore_ascii_case(b"BIG") {
            let len: usize = std::str::from_utf8(&argv[1]).unwrap().parse().unwrap();
            client.add_reply(&big_reply(len));
        } else {
            client.add_reply(b"+OK\r\n");
        }
    }
}

/// Encoded bulk reply with a recognizable payload of `len` bytes.
pub fn big_reply(len: usize) -> Vec<u8> {
    let mut out = format!("${}\r\n", len).into_bytes();
    out.extend((0..len).map(|i| b'a' + (i % 26) as u8));
    out.extend_from_slice(b"\r\n");
    out
}

pub fn command(argv: &[&str]) -> Vec<u8> {
    let mut out = format!("*{}\r\n", argv.len()).into_bytes();
    for arg in argv {
        out.extend_from_slice(format!("${}\r\n{}\r\n", arg.len(), arg).as_bytes());
    }
    out
}

pub fn config(io_threads: usize) -> Config {
    Config {
        io_threads,
        port: 0,
        ..Default::default()
    }
}
