use std::collections::VecDeque;
use std::io::{self, Write};

/// Size of the fixed inline reply buffer.
pub const REPLY_INLINE_LEN: usize = 16 * 1024;

/// Size of one overflow block.
pub const REPLY_BLOCK_LEN: usize = 16 * 1024;

struct ReplyBlock {
    data: Box<[u8]>,
    used: usize,
}

impl ReplyBlock {
    fn new() -> Self {
        Self {
            data: vec![0; REPLY_BLOCK_LEN].into_boxed_slice(),
            used: 0,
        }
    }

    fn fill(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.data.len() - self.used);
        self.data[self.used..self.used + n].copy_from_slice(&src[..n]);
        self.used += n;
        n
    }
}

/// Outgoing bytes of one client: a fixed inline buffer, then a FIFO of
/// overflow blocks once the inline buffer is full.
///
/// The inline buffer is drained first. New bytes only go inline while no
/// overflow block exists, so output order always matches append order.
pub struct ReplyBuffer {
    inline: Box<[u8]>,
    pos: usize,
    blocks: VecDeque<ReplyBlock>,
    block_bytes: usize,
    /// Bytes of the current front segment (inline or first block) already written.
    sent: usize,
}

impl Default for ReplyBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplyBuffer {
    pub fn new() -> Self {
        Self {
            inline: vec![0; REPLY_INLINE_LEN].into_boxed_slice(),
            pos: 0,
            blocks: VecDeque::new(),
            block_bytes: 0,
            sent: 0,
        }
    }

    pub fn append(&mut self, mut data: &[u8]) {
        if self.blocks.is_empty() && self.pos < self.inline.len() {
            let n = data.len().min(self.inline.len() - self.pos);
            self.inline[self.pos..self.pos + n].copy_from_slice(&data[..n]);
            self.pos += n;
            data = &data[n..];
        }

        while !data.is_empty() {
            let tail_full = self
                .blocks
                .back()
                .map_or(true, |block| block.used == block.data.len());
            if tail_full {
                self.blocks.push_back(ReplyBlock::new());
            }
            if let Some(tail) = self.blocks.back_mut() {
                let n = tail.fill(data);
                self.block_bytes += n;
                data = &data[n..];
            }
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pos > 0 || !self.blocks.is_empty()
    }

    /// Bytes appended but not yet written.
    pub fn pending_len(&self) -> usize {
        if self.pos > 0 {
            self.pos - self.sent + self.block_bytes
        } else {
            self.block_bytes - self.sent
        }
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Next contiguous run of unwritten bytes.
    pub fn pending_writes(&self) -> Option<&[u8]> {
        if self.pos > 0 {
            Some(&self.inline[self.sent..self.pos])
        } else {
            self.blocks
                .front()
                .map(|block| &block.data[self.sent..block.used])
        }
    }

    /// Mark `n` bytes of [`pending_writes`](Self::pending_writes) as written.
    pub fn consume_writes(&mut self, n: usize) {
        self.sent += n;
        if self.pos > 0 {
            if self.sent == self.pos {
                self.pos = 0;
                self.sent = 0;
            }
        } else if let Some(front) = self.blocks.front() {
            if self.sent == front.used {
                self.block_bytes -= front.used;
                self.blocks.pop_front();
                self.sent = 0;
            }
        }
    }

    /// Write until everything is drained or `w` would block. Returns the
    /// number of bytes written.
    pub fn write_to<W: Write>(&mut self, w: &mut W) -> io::Result<usize> {
        let mut total = 0;
        while let Some(chunk) = self.pending_writes() {
            match w.write(chunk) {
                Ok(0) => {
                    return Err(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "socket accepted no bytes",
                    ))
                }
                Ok(n) => {
                    total += n;
                    self.consume_writes(n);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(total)
    }
}
