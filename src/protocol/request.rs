use super::{
    ProtocolError, BIG_ARG, IO_BUF_LEN, MAX_BULK_LEN, MAX_INLINE_SIZE, MAX_MULTIBULK_LEN,
};
use bytes::{Buf, Bytes, BytesMut};
use memchr::memchr;
use std::mem;
use std::str;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Inline,
    Multibulk,
}

/// Result of one parse attempt.
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed {
    /// A complete command.
    Command(Vec<Bytes>),
    /// A request was consumed but carried no command (`*0`, `*-1`, blank line).
    Empty,
    /// More bytes are needed.
    Incomplete,
}

/// Incremental request parser.
///
/// Progress survives across reads: `multibulk_len` counts the arguments still
/// expected (0 while the header is unread) and `bulk_len` is the length of the
/// argument being read (-1 while its header is unread). Consumed input is
/// tracked with `pos` and only discarded by [`compact`](Self::compact).
#[derive(Debug)]
pub struct RequestParser {
    kind: Option<RequestKind>,
    multibulk_len: i64,
    bulk_len: i64,
    argv: Vec<Bytes>,
    pos: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self {
            kind: None,
            multibulk_len: 0,
            bulk_len: -1,
            argv: Vec::new(),
            pos: 0,
        }
    }

    pub fn kind(&self) -> Option<RequestKind> {
        self.kind
    }

    pub fn multibulk_remaining(&self) -> i64 {
        self.multibulk_len
    }

    pub fn bulk_len(&self) -> i64 {
        self.bulk_len
    }

    /// Whether `buf` still holds bytes this parser has not consumed.
    pub fn has_unread(&self, buf: &BytesMut) -> bool {
        self.pos < buf.len()
    }

    /// How many bytes the next socket read should ask for.
    ///
    /// While a big bulk argument is in flight the read is capped to what is
    /// left of it, so the argument ends exactly at the buffer end and can be
    /// handed over without a copy.
    pub fn read_hint(&self, buffered: usize) -> usize {
        if self.kind == Some(RequestKind::Multibulk)
            && self.bulk_len >= BIG_ARG as i64
        {
            let unread = buffered.saturating_sub(self.pos);
            let remaining = (self.bulk_len as usize + 2).saturating_sub(unread);
            if remaining > 0 && remaining < IO_BUF_LEN {
                return remaining;
            }
        }
        IO_BUF_LEN
    }

    /// Try to parse one request from the unconsumed part of `buf`.
    pub fn parse_next(&mut self, buf: &mut BytesMut) -> Result<Parsed, ProtocolError> {
        if !self.has_unread(buf) && self.kind.is_none() {
            return Ok(Parsed::Incomplete);
        }

        let kind = match self.kind {
            Some(kind) => kind,
            None => {
                let kind = if buf[self.pos] == b'*' {
                    RequestKind::Multibulk
                } else {
                    RequestKind::Inline
                };
                self.kind = Some(kind);
                kind
            }
        };

        let parsed = match kind {
            RequestKind::Inline => self.parse_inline(buf)?,
            RequestKind::Multibulk => self.parse_multibulk(buf)?,
        };

        if parsed != Parsed::Incomplete {
            self.kind = None;
            self.multibulk_len = 0;
            self.bulk_len = -1;
        }
        Ok(parsed)
    }

    /// Discard the consumed prefix of `buf`.
    pub fn compact(&mut self, buf: &mut BytesMut) {
        if self.pos > 0 {
            buf.advance(self.pos);
            self.pos = 0;
        }
    }

    /// Forget all progress, e.g. after a protocol error.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    fn parse_inline(&mut self, buf: &mut BytesMut) -> Result<Parsed, ProtocolError> {
        let unread = &buf[self.pos..];
        let Some(newline) = memchr(b'\n', unread) else {
            if unread.len() > MAX_INLINE_SIZE {
                return Err(ProtocolError::TooBigInline);
            }
            return Ok(Parsed::Incomplete);
        };

        let mut line = &unread[..newline];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        let argv: Vec<Bytes> = line
            .split(|b| b.is_ascii_whitespace())
            .filter(|word| !word.is_empty())
            .map(Bytes::copy_from_slice)
            .collect();

        self.pos += newline + 1;
        if argv.is_empty() {
            Ok(Parsed::Empty)
        } else {
            Ok(Parsed::Command(argv))
        }
    }

    fn parse_multibulk(&mut self, buf: &mut BytesMut) -> Result<Parsed, ProtocolError> {
        if self.multibulk_len == 0 {
            let count = match header_line(&buf[self.pos..]) {
                Line::Missing { buffered } if buffered > MAX_INLINE_SIZE => {
                    return Err(ProtocolError::TooBigMultibulkCount)
                }
                Line::Missing { .. } => return Ok(Parsed::Incomplete),
                Line::Found { prefix, value, consumed } => {
                    let count = (prefix == b'*')
                        .then_some(value)
                        .flatten()
                        .filter(|n| *n <= MAX_MULTIBULK_LEN)
                        .ok_or(ProtocolError::InvalidMultibulkLength)?;
                    self.pos += consumed;
                    count
                }
            };

            if count <= 0 {
                return Ok(Parsed::Empty);
            }
            self.multibulk_len = count;
            self.argv = Vec::with_capacity(count as usize);
        }

        while self.multibulk_len > 0 {
            if self.bulk_len == -1 {
                let len = match header_line(&buf[self.pos..]) {
                    Line::Missing { buffered } if buffered > MAX_INLINE_SIZE => {
                        return Err(ProtocolError::TooBigBulkCount)
                    }
                    Line::Missing { .. } => return Ok(Parsed::Incomplete),
                    Line::Found { prefix, value, consumed } => {
                        if prefix != b'$' {
                            return Err(ProtocolError::ExpectedBulk(prefix as char));
                        }
                        let len = value
                            .filter(|n| (0..=MAX_BULK_LEN).contains(n))
                            .ok_or(ProtocolError::InvalidBulkLength)?;
                        self.pos += consumed;
                        len
                    }
                };

                if len as usize >= BIG_ARG {
                    // Move the payload to the start of the buffer and make
                    // room for all of it at once.
                    self.compact(buf);
                    let needed = len as usize + 2;
                    if needed > buf.capacity() {
                        buf.reserve(needed - buf.len());
                    }
                }
                self.bulk_len = len;
            }

            let len = self.bulk_len as usize;
            if buf.len() - self.pos < len + 2 {
                return Ok(Parsed::Incomplete);
            }

            let arg = if self.pos == 0 && len >= BIG_ARG && buf.len() == len + 2 {
                // The buffer holds nothing but this argument: hand the whole
                // allocation over and start the client on a fresh buffer.
                let mut whole = mem::replace(buf, BytesMut::with_capacity(IO_BUF_LEN));
                whole.truncate(len);
                whole.freeze()
            } else {
                let arg = Bytes::copy_from_slice(&buf[self.pos..self.pos + len]);
                self.pos += len + 2;
                arg
            };

            self.argv.push(arg);
            self.multibulk_len -= 1;
            self.bulk_len = -1;
        }

        Ok(Parsed::Command(mem::take(&mut self.argv)))
    }
}

enum Line {
    Missing {
        buffered: usize,
    },
    Found {
        prefix: u8,
        value: Option<i64>,
        consumed: usize,
    },
}

/// Locate a `<prefix><decimal>\r\n` header at the start of `unread`.
fn header_line(unread: &[u8]) -> Line {
    match memchr(b'\r', unread) {
        // The '\n' must be buffered too.
        Some(cr) if cr + 1 < unread.len() => Line::Found {
            prefix: unread[0],
            value: parse_decimal(&unread[1..cr]),
            consumed: cr + 2,
        },
        _ => Line::Missing {
            buffered: unread.len(),
        },
    }
}

fn parse_decimal(digits: &[u8]) -> Option<i64> {
    str::from_utf8(digits).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(parser: &mut RequestParser, buf: &mut BytesMut) -> Result<Vec<Vec<Bytes>>, ProtocolError> {
        let mut commands = Vec::new();
        while parser.has_unread(buf) {
            match parser.parse_next(buf)? {
                Parsed::Command(argv) => commands.push(argv),
                Parsed::Empty => {}
                Parsed::Incomplete => break,
            }
        }
        parser.compact(buf);
        Ok(commands)
    }

    fn args(list: &[&str]) -> Vec<Bytes> {
        list.iter()
            .map(|s| Bytes::copy_from_slice(s.as_bytes()))
            .collect()
    }

    fn encode(argv: &[&[u8]]) -> Vec<u8> {
        let mut out = format!("*{}\r\n", argv.len()).into_bytes();
        for arg in argv {
            out.extend_from_slice(format!("${}\r\n", arg.len()).as_bytes());
            out.extend_from_slice(arg);
            out.extend_from_slice(b"\r\n");
        }
        out
    }

    #[test]
    fn parses_pipelined_commands_in_one_pass() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(&b"*1\r\n$4\r\nPING\r\n*2\r\n$4\r\nECHO\r\n$2\r\nhi\r\n"[..]);

        let commands = parse_all(&mut parser, &mut buf).unwrap();
        assert_eq!(commands, vec![args(&["PING"]), args(&["ECHO", "hi"])]);
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_argument_stalls_until_completed() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(&b"*2\r\n$3\r\nfoo"[..]);

        assert!(parse_all(&mut parser, &mut buf).unwrap().is_empty());
        assert_eq!(parser.multibulk_remaining(), 2);
        assert_eq!(parser.bulk_len(), 3);

        buf.extend_from_slice(b"\r\n$3\r\nbar\r\n");
        let commands = parse_all(&mut parser, &mut buf).unwrap();
        assert_eq!(commands, vec![args(&["foo", "bar"])]);
        assert_eq!(parser.bulk_len(), -1);
        assert_eq!(parser.multibulk_remaining(), 0);
    }

    #[test]
    fn byte_at_a_time_matches_whole_buffer() {
        let big = vec![b'x'; BIG_ARG + 10];
        let mut stream = Vec::new();
        stream.extend(encode(&[b"SET", b"key", b"value"]));
        stream.extend(encode(&[b"GET", b"key"]));
        stream.extend(encode(&[b"SET", b"big", &big]));
        stream.extend(encode(&[b""]));
        stream.extend(b"*0\r\n");
        stream.extend(encode(&[b"PING"]));

        let mut whole_parser = RequestParser::new();
        let mut whole = BytesMut::from(&stream[..]);
        let expected = parse_all(&mut whole_parser, &mut whole).unwrap();
        assert_eq!(expected.len(), 5);

        for chunk_size in [1, 2, 3, 7, 1024, 40_000] {
            let mut parser = RequestParser::new();
            let mut buf = BytesMut::new();
            let mut got = Vec::new();
            for chunk in stream.chunks(chunk_size) {
                buf.extend_from_slice(chunk);
                got.extend(parse_all(&mut parser, &mut buf).unwrap());
            }
            assert_eq!(got, expected, "chunk size {}", chunk_size);
        }
    }

    #[test]
    fn rejects_oversized_count() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(&b"*1048577\r\n"[..]);
        assert_eq!(
            parser.parse_next(&mut buf),
            Err(ProtocolError::InvalidMultibulkLength)
        );
    }

    #[test]
    fn accepts_maximum_count_header() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(&b"*1048576\r\n"[..]);
        assert_eq!(parser.parse_next(&mut buf), Ok(Parsed::Incomplete));
        assert_eq!(parser.multibulk_remaining(), MAX_MULTIBULK_LEN);
    }

    #[test]
    fn rejects_malformed_headers() {
        let cases: [(&[u8], ProtocolError); 5] = [
            (b"*abc\r\n", ProtocolError::InvalidMultibulkLength),
            (b"*1\r\n:3\r\n", ProtocolError::ExpectedBulk(':')),
            (b"*1\r\n$-1\r\n", ProtocolError::InvalidBulkLength),
            (b"*1\r\n$536870913\r\n", ProtocolError::InvalidBulkLength),
            (b"*1\r\n$x\r\n", ProtocolError::InvalidBulkLength),
        ];

        for (input, expected) in cases {
            let mut parser = RequestParser::new();
            let mut buf = BytesMut::from(input);
            assert_eq!(parse_all(&mut parser, &mut buf), Err(expected));
        }
    }

    #[test]
    fn header_without_terminator_is_bounded() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(b"*");
        buf.extend_from_slice(&vec![b'1'; MAX_INLINE_SIZE - 1]);
        assert_eq!(parser.parse_next(&mut buf), Ok(Parsed::Incomplete));

        buf.extend_from_slice(b"1");
        assert_eq!(
            parser.parse_next(&mut buf),
            Err(ProtocolError::TooBigMultibulkCount)
        );
    }

    #[test]
    fn bulk_header_without_terminator_is_bounded() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(&b"*1\r\n$"[..]);
        buf.extend_from_slice(&vec![b'9'; MAX_INLINE_SIZE + 1]);
        assert_eq!(
            parser.parse_next(&mut buf),
            Err(ProtocolError::TooBigBulkCount)
        );
    }

    #[test]
    fn non_positive_count_yields_no_command() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(&b"*0\r\n*-1\r\n*1\r\n$4\r\nPING\r\n"[..]);
        assert_eq!(parser.parse_next(&mut buf), Ok(Parsed::Empty));
        assert_eq!(parser.parse_next(&mut buf), Ok(Parsed::Empty));
        assert_eq!(
            parser.parse_next(&mut buf),
            Ok(Parsed::Command(args(&["PING"])))
        );
    }

    #[test]
    fn big_argument_takes_over_the_buffer() {
        let payload = vec![b'z'; BIG_ARG * 2];
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&encode(&[b"SET", b"k"])[..]);
        // Rewrite the count: three arguments, the last one big.
        buf[1] = b'3';
        buf.extend_from_slice(format!("${}\r\n", payload.len()).as_bytes());

        assert_eq!(parser.parse_next(&mut buf), Ok(Parsed::Incomplete));
        assert_eq!(parser.bulk_len(), payload.len() as i64);
        // Consumed headers were compacted away before the payload.
        assert!(buf.capacity() >= payload.len() + 2);

        let remaining = payload.len() + 2;
        assert_eq!(parser.read_hint(buf.len()), IO_BUF_LEN);
        buf.extend_from_slice(&payload[..payload.len() - 100]);
        assert_eq!(parser.read_hint(buf.len()), 102);

        buf.extend_from_slice(&payload[payload.len() - 100..]);
        buf.extend_from_slice(b"\r\n");
        assert_eq!(buf.len(), remaining);

        match parser.parse_next(&mut buf).unwrap() {
            Parsed::Command(argv) => {
                assert_eq!(argv.len(), 3);
                assert_eq!(argv[2].len(), payload.len());
                assert!(argv[2].iter().all(|b| *b == b'z'));
            }
            other => panic!("unexpected {:?}", other),
        }
        assert!(buf.is_empty());
        assert!(buf.capacity() < payload.len());
    }

    #[test]
    fn inline_commands_split_on_whitespace() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(&b"PING\r\n\r\nECHO  hello   world\n"[..]);
        let commands = parse_all(&mut parser, &mut buf).unwrap();
        assert_eq!(
            commands,
            vec![args(&["PING"]), args(&["ECHO", "hello", "world"])]
        );
    }

    #[test]
    fn inline_without_newline_is_bounded() {
        let mut parser = RequestParser::new();
        let mut buf = BytesMut::from(&vec![b'a'; MAX_INLINE_SIZE + 1][..]);
        assert_eq!(
            parser.parse_next(&mut buf),
            Err(ProtocolError::TooBigInline)
        );
    }
}
