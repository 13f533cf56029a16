use bytes::Bytes;

/// A reply value in RESP encoding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RespValue {
    SimpleString(Bytes),
    Error(String),
    Integer(i64),
    BulkString(Option<Bytes>),
    Array(Option<Vec<RespValue>>),
}

impl RespValue {
    pub fn simple(s: &'static str) -> Self {
        RespValue::SimpleString(Bytes::from_static(s.as_bytes()))
    }

    pub fn error(msg: impl Into<String>) -> Self {
        RespValue::Error(msg.into())
    }

    pub fn bulk(data: Bytes) -> Self {
        RespValue::BulkString(Some(data))
    }

    /// Encoded form as a fresh buffer.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.encoded_len_hint());
        self.encode(&mut out);
        out
    }

    /// Append the encoded form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        match self {
            RespValue::SimpleString(s) => {
                out.push(b'+');
                out.extend_from_slice(s);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Error(e) => {
                out.push(b'-');
                out.extend_from_slice(e.as_bytes());
                out.extend_from_slice(b"\r\n");
            }
            RespValue::Integer(n) => write_header(out, b':', *n),
            RespValue::BulkString(Some(s)) => {
                write_header(out, b'$', s.len() as i64);
                out.extend_from_slice(s);
                out.extend_from_slice(b"\r\n");
            }
            RespValue::BulkString(None) => out.extend_from_slice(b"$-1\r\n"),
            RespValue::Array(Some(items)) => {
                write_header(out, b'*', items.len() as i64);
                for item in items {
                    item.encode(out);
                }
            }
            RespValue::Array(None) => out.extend_from_slice(b"*-1\r\n"),
        }
    }

    fn encoded_len_hint(&self) -> usize {
        match self {
            RespValue::SimpleString(s) => s.len() + 3,
            RespValue::Error(e) => e.len() + 3,
            RespValue::Integer(_) => 24,
            RespValue::BulkString(Some(s)) => s.len() + 24,
            RespValue::Array(Some(items)) => {
                24 + items.iter().map(Self::encoded_len_hint).sum::<usize>()
            }
            RespValue::BulkString(None) | RespValue::Array(None) => 5,
        }
    }
}

/// `<prefix><n>\r\n`
fn write_header(out: &mut Vec<u8>, prefix: u8, n: i64) {
    let mut digits = itoa::Buffer::new();
    out.push(prefix);
    out.extend_from_slice(digits.format(n).as_bytes());
    out.extend_from_slice(b"\r\n");
}
