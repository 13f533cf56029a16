use super::reply_buffer::ReplyBuffer;
use super::Stream;
use crate::protocol::{CommandHandler, Parsed, ProtocolError, RequestParser, RespValue};
use bytes::BytesMut;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Monotonic client identifier. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(pub u64);

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct ClientFlags: u16 {
        /// Queued on the pending-write list.
        const PENDING_WRITE = 1 << 0;
        /// Queued on the pending-read list.
        const PENDING_READ = 1 << 1;
        /// Close once the reply buffer drains; no more input is processed.
        const CLOSE_AFTER_REPLY = 1 << 2;
        const PROTOCOL_ERROR = 1 << 3;
        /// Replication link. Exempt from idle and output limits.
        const REPLICA = 1 << 4;
        /// Close at the end of the current processing pass.
        const CLOSE_ASAP = 1 << 5;
        /// A writable registration is installed on the event loop.
        const WRITE_HANDLER = 1 << 6;
    }
}

/// Result of draining the socket into the query buffer.
#[derive(Debug)]
pub enum ReadOutcome {
    /// `read` bytes arrived. `eof` is set when the peer closed after sending
    /// them.
    Data { read: usize, eof: bool },
    WouldBlock,
    Eof,
    Failed(io::Error),
}

/// One connected client: its stream, the query buffer with parser progress,
/// and the reply buffer.
pub struct Client<S> {
    id: ClientId,
    fd: RawFd,
    stream: S,
    addr: Option<SocketAddr>,
    query: BytesMut,
    parser: RequestParser,
    flags: ClientFlags,
    reply: ReplyBuffer,
    /// 0 disables the limit.
    reply_limit: usize,
    /// Reading stops once the query buffer grows past this.
    query_limit: usize,
    write_enqueue: bool,
    staged_read: Option<ReadOutcome>,
    created_at: Instant,
    last_interaction: Instant,
    commands_processed: u64,
}

impl<S> Client<S> {
    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    pub fn flags(&self) -> ClientFlags {
        self.flags
    }

    pub fn set_flags(&mut self, flags: ClientFlags) {
        self.flags |= flags;
    }

    pub fn clear_flags(&mut self, flags: ClientFlags) {
        self.flags.remove(flags);
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn query_len(&self) -> usize {
        self.query.len()
    }

    pub fn parser(&self) -> &RequestParser {
        &self.parser
    }

    pub fn commands_processed(&self) -> u64 {
        self.commands_processed
    }

    pub fn age(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.created_at)
    }

    pub fn idle_time(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_interaction)
    }

    /// Whether the client stopped accepting input and only drains or dies.
    pub fn is_closing(&self) -> bool {
        self.flags
            .intersects(ClientFlags::CLOSE_AFTER_REPLY | ClientFlags::CLOSE_ASAP)
    }

    pub fn close_after_reply(&mut self) {
        self.flags |= ClientFlags::CLOSE_AFTER_REPLY;
    }

    pub fn has_pending_output(&self) -> bool {
        self.reply.has_pending()
    }

    pub fn pending_reply_bytes(&self) -> usize {
        self.reply.pending_len()
    }

    /// Queue raw reply bytes.
    ///
    /// Ignored once the client is closing. A reply that would push the
    /// pending output past the limit is dropped and the client marked
    /// close-asap.
    pub fn add_reply(&mut self, data: &[u8]) {
        if self.is_closing() {
            return;
        }
        let pending = self.reply.pending_len();
        if self.reply_limit > 0
            && !self.flags.contains(ClientFlags::REPLICA)
            && pending + data.len() > self.reply_limit
        {
            warn!(
                "Client {} exceeded output limit ({} + {} > {} bytes), closing",
                self.id,
                pending,
                data.len(),
                self.reply_limit
            );
            self.flags |= ClientFlags::CLOSE_ASAP;
            return;
        }

        let was_idle = !self.reply.has_pending();
        self.reply.append(data);
        if was_idle && !self.flags.contains(ClientFlags::PENDING_WRITE) {
            self.flags |= ClientFlags::PENDING_WRITE;
            self.write_enqueue = true;
        }
    }

    pub fn add_reply_value(&mut self, value: &RespValue) {
        self.add_reply(&value.to_bytes());
    }

    /// Queue `-<msg>\r\n`. `msg` should not contain CR or LF.
    pub fn add_reply_error(&mut self, msg: &str) {
        let mut out = Vec::with_capacity(msg.len() + 3);
        out.push(b'-');
        out.extend_from_slice(msg.as_bytes());
        out.extend_from_slice(b"\r\n");
        self.add_reply(&out);
    }

    /// Returns true once after the client got output and must be put on the
    /// pending-write list.
    pub(crate) fn take_write_enqueue(&mut self) -> bool {
        std::mem::take(&mut self.write_enqueue)
    }

    /// Parse and execute every complete request in the query buffer.
    pub fn process_input_buffer(&mut self, handler: &mut dyn CommandHandler<S>) {
        while self.parser.has_unread(&self.query) {
            if self.is_closing() {
                break;
            }
            match self.parser.parse_next(&mut self.query) {
                Ok(Parsed::Command(argv)) => {
                    self.commands_processed += 1;
                    handler.process_command(self, argv);
                }
                Ok(Parsed::Empty) => {}
                Ok(Parsed::Incomplete) => break,
                Err(e) => {
                    self.set_protocol_error(e);
                    return;
                }
            }
        }
        self.parser.compact(&mut self.query);
    }

    /// Reply with a protocol error, drop all buffered input and close once
    /// the reply drains.
    pub fn set_protocol_error(&mut self, err: ProtocolError) {
        debug!("Protocol error from client {}: {}", self.id, err);
        self.add_reply_error(&format!("ERR Protocol error: {}", err));
        self.flags |= ClientFlags::PROTOCOL_ERROR | ClientFlags::CLOSE_AFTER_REPLY;
        self.query.clear();
        self.parser.reset();
    }

    pub(crate) fn take_staged_read(&mut self) -> Option<ReadOutcome> {
        self.staged_read.take()
    }
}

impl<S: Stream> Client<S> {
    pub fn new(id: ClientId, stream: S, addr: Option<SocketAddr>, reply_limit: usize) -> Self {
        let now = Instant::now();
        Self {
            id,
            fd: stream.as_raw_fd(),
            stream,
            addr,
            query: BytesMut::new(),
            parser: RequestParser::new(),
            flags: ClientFlags::empty(),
            reply: ReplyBuffer::new(),
            reply_limit,
            query_limit: usize::MAX,
            write_enqueue: false,
            staged_read: None,
            created_at: now,
            last_interaction: now,
            commands_processed: 0,
        }
    }

    pub fn with_query_limit(mut self, limit: usize) -> Self {
        self.query_limit = limit;
        self
    }

    /// Read from the socket until it has nothing more, a read comes back
    /// short, or the query buffer passes its limit. Readiness is
    /// edge-triggered, so stopping any earlier could strand bytes.
    pub fn read_into_query(&mut self) -> ReadOutcome {
        let mut total = 0;
        let mut eof = false;

        while self.query.len() <= self.query_limit {
            let requested = self.parser.read_hint(self.query.len());
            let start = self.query.len();
            self.query.resize(start + requested, 0);

            let result = loop {
                match self.stream.read(&mut self.query[start..]) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    other => break other,
                }
            };
            let read = *result.as_ref().unwrap_or(&0);
            self.query.truncate(start + read);

            match result {
                Ok(0) => {
                    eof = true;
                    break;
                }
                Ok(read) if read < requested => {
                    total += read;
                    break;
                }
                Ok(read) => total += read,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => return ReadOutcome::Failed(e),
            }
        }

        if total == 0 {
            return if eof {
                ReadOutcome::Eof
            } else {
                ReadOutcome::WouldBlock
            };
        }
        self.last_interaction = Instant::now();
        ReadOutcome::Data { read: total, eof }
    }

    /// Perform the socket read now and keep the outcome for the reactor
    /// thread. Used by read workers, which must not touch anything else.
    pub fn stage_read(&mut self) {
        let outcome = self.read_into_query();
        self.staged_read = Some(outcome);
    }

    /// Flush as much pending output as the socket takes.
    pub fn write_pending(&mut self) -> io::Result<usize> {
        let written = self.reply.write_to(&mut self.stream)?;
        if written > 0 {
            self.last_interaction = Instant::now();
        }
        Ok(written)
    }
}
