/*!
 * RESP Wire Codec
 *
 * Implements the subset of the REdis Serialization Protocol this server
 * speaks: inbound frames are always arrays of bulk strings (the inline
 * protocol is not supported), outbound replies use the full reply alphabet
 * (simple string, error, integer, bulk string, array, and the nil forms of
 * the last two).
 */

use bytes::Bytes;

/// A single malformed-frame condition. Any of these tears the session down
/// without a reply — the connection is no longer trustworthy once the byte
/// stream can't be re-synchronized.
#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("protocol error: expected '*', got something else")]
    ExpectedArray,
    #[error("protocol error: expected '$'")]
    ExpectedBulk,
    #[error("protocol error: invalid length field")]
    InvalidLength,
    #[error("protocol error: missing CRLF terminator")]
    MissingTerminator,
}

/// Decode at most one command frame from `data`.
///
/// # Arguments
/// * `data` - bytes read so far from the connection; not consumed, only
///   inspected (the caller slices past `consumed` bytes itself)
///
/// # Returns
/// * `Ok(None)` when `data` does not yet contain a full frame — the caller
///   keeps the bytes around and tries again once more arrive
/// * `Ok(Some((consumed, args)))` with the number of bytes the frame
///   occupied and its bulk-string arguments (first element is the command
///   name) once a complete frame is available
/// * `Err(ProtocolError)` if the bytes present so far can't be a valid frame
pub fn decode_frame(data: &[u8]) -> Result<Option<(usize, Vec<Bytes>)>, ProtocolError> {
    if data.is_empty() {
        return Ok(None);
    }
    if data[0] != b'*' {
        return Err(ProtocolError::ExpectedArray);
    }

    let (i, n) = match read_decimal_line(&data[1..])? {
        Some(x) => x,
        None => return Ok(None),
    };
    let mut cursor = 1 + i;
    if n < 0 {
        return Err(ProtocolError::InvalidLength);
    }
    let n = n as usize;

    let mut items: Vec<Bytes> = Vec::with_capacity(n);
    for _ in 0..n {
        if cursor >= data.len() {
            return Ok(None);
        }
        if data[cursor] != b'$' {
            return Err(ProtocolError::ExpectedBulk);
        }

        let (i2, len) = match read_decimal_line(&data[cursor + 1..])? {
            Some(x) => x,
            None => return Ok(None),
        };
        cursor += 1 + i2;
        if len < 0 {
            return Err(ProtocolError::InvalidLength);
        }
        let len = len as usize;

        let need = len + 2;
        if cursor + need > data.len() {
            return Ok(None);
        }
        if &data[cursor + len..cursor + need] != b"\r\n" {
            return Err(ProtocolError::MissingTerminator);
        }
        items.push(Bytes::copy_from_slice(&data[cursor..cursor + len]));
        cursor += need;
    }

    Ok(Some((cursor, items)))
}

/// Read a decimal integer terminated by `\r\n` from the start of `s`.
///
/// Returns `Ok(None)` if the terminator hasn't arrived yet (more bytes
/// needed), `Ok(Some((consumed, value)))` once it has.
fn read_decimal_line(s: &[u8]) -> Result<Option<(usize, i64)>, ProtocolError> {
    let mut i = 0;
    while i < s.len() && s[i] != b'\r' {
        i += 1;
    }
    if i + 1 >= s.len() {
        return Ok(None);
    }
    if s[i + 1] != b'\n' {
        return Err(ProtocolError::MissingTerminator);
    }
    let digits = std::str::from_utf8(&s[..i]).map_err(|_| ProtocolError::InvalidLength)?;
    let num = digits.parse::<i64>().map_err(|_| ProtocolError::InvalidLength)?;
    Ok(Some((i + 2, num)))
}

/// The reply alphabet a handler can produce for a single command.
#[derive(Debug, Clone, PartialEq)]
pub enum Reply {
    SimpleString(String),
    Error(String),
    Integer(i64),
    Bulk(Bytes),
    NilBulk,
    Array(Vec<Reply>),
    NilArray,
}

impl Reply {
    pub fn ok() -> Reply {
        Reply::SimpleString("OK".to_string())
    }

    pub fn err(msg: impl Into<String>) -> Reply {
        Reply::Error(msg.into())
    }
}

/// Append the RESP encoding of `reply` to `out`.
///
/// # Arguments
/// * `reply` - the reply value to serialize
/// * `out` - buffer to append the wire bytes to
pub fn encode_reply(reply: &Reply, out: &mut Vec<u8>) {
    match reply {
        Reply::SimpleString(s) => {
            out.push(b'+');
            out.extend_from_slice(s.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Reply::Error(msg) => {
            out.push(b'-');
            out.extend_from_slice(msg.as_bytes());
            out.extend_from_slice(b"\r\n");
        }
        Reply::Integer(n) => {
            out.extend_from_slice(format!(":{}\r\n", n).as_bytes());
        }
        Reply::Bulk(b) => {
            out.extend_from_slice(format!("${}\r\n", b.len()).as_bytes());
            out.extend_from_slice(b);
            out.extend_from_slice(b"\r\n");
        }
        Reply::NilBulk => out.extend_from_slice(b"$-1\r\n"),
        Reply::Array(items) => {
            out.extend_from_slice(format!("*{}\r\n", items.len()).as_bytes());
            for it in items {
                encode_reply(it, out);
            }
        }
        Reply::NilArray => out.extend_from_slice(b"*-1\r\n"),
    }
}
