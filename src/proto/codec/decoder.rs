use std::io::{self, Read};

use bytes::Buf;

use crate::alloc::{AllocGuard, GuardedBuf};
use crate::proto::error::{Error, Result};
use crate::proto::reply::Reply;

const DEFAULT_MAX_FRAME_SIZE: usize = 512 * 1024 * 1024; // 512 MB default
const MAX_DEPTH: usize = 64;
const READ_CHUNK: usize = 16 * 1024;

/// An incremental RESP2 decoder that turns bytes into [`Reply`] values.
///
/// Call [`append`](Decoder::append) or [`read_from`](Decoder::read_from) to
/// add data, then [`decode`](Decoder::decode) to parse replies. Returns
/// `Ok(None)` when more data is needed.
///
/// A reply is consumed from the buffer only once it has been fully built.
/// If the allocator refuses memory while building, the bytes stay buffered
/// and the same reply can be decoded again later.
///
/// # Example
///
/// ```
/// use shardis::proto::codec::Decoder;
/// use shardis::proto::Reply;
///
/// let mut decoder = Decoder::new();
/// decoder.append(b"+OK\r\n").unwrap();
/// let reply = decoder.decode().unwrap().unwrap();
/// assert!(reply.is_ok());
/// ```
#[derive(Debug)]
pub struct Decoder {
    buf: GuardedBuf,
    /// Buffer length below which the pending frame cannot be complete.
    need: usize,
    max_frame_size: usize,
    alloc: AllocGuard,
}

impl Decoder {
    /// Creates a new decoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_allocator(AllocGuard::system())
    }

    /// Creates a new decoder that allocates through `alloc`.
    pub fn with_allocator(alloc: AllocGuard) -> Self {
        Self {
            buf: GuardedBuf::new(alloc.clone()),
            need: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            alloc,
        }
    }

    /// Creates a new decoder with a custom maximum frame size.
    ///
    /// # Arguments
    ///
    /// * `max_frame_size` - Maximum size in bytes for a single frame
    pub fn with_max_frame_size(max_frame_size: usize) -> Self {
        Self {
            max_frame_size,
            ..Self::new()
        }
    }

    /// Appends raw bytes to the internal buffer.
    ///
    /// # Errors
    ///
    /// Returns `Error::OutOfMemory` if the buffer cannot grow; nothing is
    /// appended in that case.
    pub fn append(&mut self, data: &[u8]) -> Result<()> {
        self.buf.reserve(data.len())?;
        self.buf.extend_from_slice(data);
        Ok(())
    }

    /// Reads once from `reader` into the internal buffer.
    ///
    /// Space is reserved before reading, so a refused allocation never
    /// drops bytes taken off the socket.
    ///
    /// # Returns
    ///
    /// Number of bytes read; zero means end of stream.
    ///
    /// # Errors
    ///
    /// Returns `Error::OutOfMemory` if the buffer cannot grow, or
    /// `Error::Io` if the read fails (including `WouldBlock` on
    /// non-blocking sockets).
    pub fn read_from<R: Read>(&mut self, reader: &mut R) -> Result<usize> {
        self.buf.reserve(READ_CHUNK)?;
        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK, 0);
        match reader.read(&mut self.buf[start..]) {
            Ok(n) => {
                self.buf.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.buf.truncate(start);
                Err(e.into())
            }
        }
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Drops all buffered bytes and frees the buffer.
    pub fn clear(&mut self) {
        self.buf.reset();
        self.need = 0;
    }

    /// Attempts to decode a reply from the buffer.
    ///
    /// # Returns
    ///
    /// `Ok(Some(reply))` for a complete reply, `Ok(None)` if more data is
    /// needed.
    ///
    /// # Errors
    ///
    /// Returns `Error::Protocol` for malformed data and
    /// `Error::OutOfMemory` if the reply cannot be built.
    pub fn decode(&mut self) -> Result<Option<Reply>> {
        if self.buf.is_empty() || self.buf.len() < self.need {
            return Ok(None);
        }

        let end = match scan(&self.buf, 0, 0, self.max_frame_size)? {
            Scan::Complete(end) => end,
            Scan::Need(need) => {
                if self.buf.len() > self.max_frame_size {
                    return Err(Error::protocol(
                        "buffer size exceeded maximum frame size",
                    ));
                }
                self.need = need;
                return Ok(None);
            }
        };

        let (reply, consumed) = build(&self.buf, 0, &self.alloc)?;
        debug_assert_eq!(consumed, end);
        self.buf.advance(consumed);
        self.need = 0;
        Ok(Some(reply))
    }
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of scanning a possibly partial frame.
enum Scan {
    /// The frame ends at this offset.
    Complete(usize),
    /// Incomplete; the buffer must reach this length before a rescan helps.
    Need(usize),
}

/// Finds the end of the frame starting at `pos` without allocating.
fn scan(buf: &[u8], pos: usize, depth: usize, max: usize) -> Result<Scan> {
    if depth > MAX_DEPTH {
        return Err(Error::protocol("reply nesting too deep"));
    }
    let more = Scan::Need(buf.len() + 1);
    let Some(&marker) = buf.get(pos) else {
        return Ok(more);
    };
    let Some(line_end) = find_crlf(buf, pos + 1) else {
        return Ok(more);
    };
    let after_line = line_end + 2;
    match marker {
        b'+' | b'-' => Ok(Scan::Complete(after_line)),
        b':' => {
            parse_int(&buf[pos + 1..line_end])?;
            Ok(Scan::Complete(after_line))
        }
        b'$' => {
            let len = parse_int(&buf[pos + 1..line_end])?;
            if len == -1 {
                return Ok(Scan::Complete(after_line));
            }
            let len = checked_len(len, "bulk string")?;
            if len > max {
                return Err(Error::protocol("bulk string length exceeds maximum frame size"));
            }
            let end = after_line + len + 2;
            if buf.len() < end {
                return Ok(Scan::Need(end));
            }
            if &buf[end - 2..end] != b"\r\n" {
                return Err(Error::protocol("bulk string not terminated by CRLF"));
            }
            Ok(Scan::Complete(end))
        }
        b'*' => {
            let len = parse_int(&buf[pos + 1..line_end])?;
            if len == -1 {
                return Ok(Scan::Complete(after_line));
            }
            let len = checked_len(len, "array")?;
            if len > max / 4 {
                return Err(Error::protocol("array length exceeds reasonable maximum"));
            }
            let mut cursor = after_line;
            for _ in 0..len {
                match scan(buf, cursor, depth + 1, max)? {
                    Scan::Complete(next) => cursor = next,
                    need => return Ok(need),
                }
            }
            Ok(Scan::Complete(cursor))
        }
        other => Err(Error::Protocol {
            message: format!("unknown reply type byte 0x{other:02x}"),
        }),
    }
}

/// Builds the frame starting at `pos`. Only called on a frame that `scan`
/// reported complete and well formed.
fn build(buf: &[u8], pos: usize, alloc: &AllocGuard) -> Result<(Reply, usize)> {
    let line_end = find_crlf(buf, pos + 1)
        .ok_or_else(|| Error::protocol("incomplete reply"))?;
    let line = &buf[pos + 1..line_end];
    let after_line = line_end + 2;
    match buf[pos] {
        b'+' => Ok((Reply::Status(alloc.bytes(line)?), after_line)),
        b'-' => Ok((Reply::Error(alloc.bytes(line)?), after_line)),
        b':' => Ok((Reply::Integer(parse_int(line)?), after_line)),
        b'$' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok((Reply::Nil, after_line));
            }
            let len = checked_len(len, "bulk string")?;
            let data = alloc.bytes(&buf[after_line..after_line + len])?;
            Ok((Reply::Bulk(data), after_line + len + 2))
        }
        b'*' => {
            let len = parse_int(line)?;
            if len == -1 {
                return Ok((Reply::Nil, after_line));
            }
            let len = checked_len(len, "array")?;
            let mut items = alloc.vec(len)?;
            let mut cursor = after_line;
            for _ in 0..len {
                let (item, next) = build(buf, cursor, alloc)?;
                items.push(item);
                cursor = next;
            }
            Ok((Reply::Array(items), cursor))
        }
        other => Err(Error::Protocol {
            message: format!("unknown reply type byte 0x{other:02x}"),
        }),
    }
}

fn find_crlf(buf: &[u8], from: usize) -> Option<usize> {
    if from >= buf.len() {
        return None;
    }
    buf[from..]
        .windows(2)
        .position(|w| w == b"\r\n")
        .map(|i| from + i)
}

fn parse_int(line: &[u8]) -> Result<i64> {
    std::str::from_utf8(line)
        .ok()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| Error::Protocol {
            message: format!("invalid integer {:?}", String::from_utf8_lossy(line)),
        })
}

fn checked_len(len: i64, what: &str) -> Result<usize> {
    usize::try_from(len).map_err(|_| Error::Protocol {
        message: format!("negative {what} length {len}"),
    })
}

/// Maps a would-block read or write onto `None`.
pub(crate) fn would_block<T>(result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(v) => Ok(Some(v)),
        Err(Error::Io { source }) if source.kind() == io::ErrorKind::WouldBlock => Ok(None),
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;

    use super::*;
    use crate::alloc::tests::Ledger;
    use crate::alloc::FailAfter;

    #[test]
    fn test_decode_status() {
        let mut decoder = Decoder::new();
        decoder.append(b"+OK\r\n").unwrap();
        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(reply, Reply::Status(Bytes::from_static(b"OK")));
    }

    #[test]
    fn test_decode_error() {
        let mut decoder = Decoder::new();
        decoder.append(b"-MOVED 3999 127.0.0.1:6381\r\n").unwrap();
        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(reply.error_message(), Some("MOVED 3999 127.0.0.1:6381"));
    }

    #[test]
    fn test_decode_integer() {
        let mut decoder = Decoder::new();
        decoder.append(b":-42\r\n").unwrap();
        assert_eq!(decoder.decode().unwrap(), Some(Reply::Integer(-42)));
    }

    #[test]
    fn test_decode_bulk_and_nil() {
        let mut decoder = Decoder::new();
        decoder.append(b"$5\r\nhello\r\n$-1\r\n*-1\r\n").unwrap();
        assert_eq!(
            decoder.decode().unwrap(),
            Some(Reply::Bulk(Bytes::from("hello")))
        );
        assert_eq!(decoder.decode().unwrap(), Some(Reply::Nil));
        assert_eq!(decoder.decode().unwrap(), Some(Reply::Nil));
        assert_eq!(decoder.decode().unwrap(), None);
    }

    #[test]
    fn test_decode_empty_bulk() {
        let mut decoder = Decoder::new();
        decoder.append(b"$0\r\n\r\n").unwrap();
        assert_eq!(decoder.decode().unwrap(), Some(Reply::Bulk(Bytes::new())));
    }

    #[test]
    fn test_decode_nested_array() {
        let mut decoder = Decoder::new();
        decoder
            .append(b"*1\r\n*3\r\n:0\r\n:5460\r\n*2\r\n$9\r\n127.0.0.1\r\n:7000\r\n")
            .unwrap();
        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(
            reply,
            Reply::Array(vec![Reply::Array(vec![
                Reply::Integer(0),
                Reply::Integer(5460),
                Reply::Array(vec![
                    Reply::Bulk(Bytes::from("127.0.0.1")),
                    Reply::Integer(7000),
                ]),
            ])])
        );
    }

    #[test]
    fn test_partial_array_is_not_consumed() {
        let mut decoder = Decoder::new();
        decoder.append(b"*2\r\n$3\r\nfoo\r\n$3\r\nba").unwrap();
        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.buffered(), 19);
        decoder.append(b"r\r\n").unwrap();
        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(reply.as_array().map(|a| a.len()), Some(2));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_refused_allocation_keeps_reply_buffered() {
        let alloc = Arc::new(FailAfter::unlimited());
        let mut decoder = Decoder::with_allocator(AllocGuard::shared(alloc.clone()));
        decoder.append(b"*2\r\n$3\r\nfoo\r\n$3\r\nbar\r\n").unwrap();

        // array vector granted, first element refused
        alloc.set_remaining(1);
        assert!(matches!(decoder.decode(), Err(Error::OutOfMemory)));
        assert_eq!(decoder.buffered(), 22);

        alloc.set_unlimited();
        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(
            reply,
            Reply::Array(vec![
                Reply::Bulk(Bytes::from("foo")),
                Reply::Bulk(Bytes::from("bar")),
            ])
        );
    }

    #[test]
    fn test_buffer_is_released_on_clear_and_drop() {
        use std::sync::atomic::Ordering;

        let ledger = Arc::new(Ledger::default());
        let mut decoder = Decoder::with_allocator(AllocGuard::shared(ledger.clone()));
        let mut wire = &b"$5\r\nhello\r\n+OK\r\n"[..];
        decoder.read_from(&mut wire).unwrap();
        assert!(decoder.decode().unwrap().is_some());
        assert!(ledger.outstanding.load(Ordering::SeqCst) >= READ_CHUNK as isize);

        decoder.clear();
        assert_eq!(ledger.outstanding.load(Ordering::SeqCst), 0);

        decoder.append(b"+OK\r\n").unwrap();
        drop(decoder);
        assert_eq!(ledger.outstanding.load(Ordering::SeqCst), 0);
        assert!(ledger.released.load(Ordering::SeqCst) >= READ_CHUNK + 5);
    }

    #[test]
    fn test_large_bulk_waits_for_its_length() {
        let mut decoder = Decoder::new();
        decoder.append(b"*2\r\n:1\r\n$10\r\nhello").unwrap();
        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.need, 25);

        decoder.append(b"worl").unwrap();
        assert!(decoder.decode().unwrap().is_none());
        assert_eq!(decoder.need, 25);

        decoder.append(b"d\r\n:7\r\n").unwrap();
        let reply = decoder.decode().unwrap().unwrap();
        assert_eq!(reply.as_array().unwrap()[1].as_bytes(), Some(&b"helloworld"[..]));
        assert_eq!(decoder.need, 0);
        assert_eq!(decoder.decode().unwrap(), Some(Reply::Integer(7)));
    }

    #[test]
    fn test_read_from_reader() {
        let mut decoder = Decoder::new();
        let mut input: &[u8] = b":1\r\n";
        assert_eq!(decoder.read_from(&mut input).unwrap(), 4);
        assert_eq!(decoder.decode().unwrap(), Some(Reply::Integer(1)));
        assert_eq!(decoder.read_from(&mut input).unwrap(), 0);
    }

    #[test]
    fn test_unknown_type_byte() {
        let mut decoder = Decoder::new();
        decoder.append(b"?what\r\n").unwrap();
        assert!(matches!(decoder.decode(), Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_invalid_integer() {
        let mut decoder = Decoder::new();
        decoder.append(b":12x\r\n").unwrap();
        assert!(matches!(decoder.decode(), Err(Error::Protocol { .. })));
    }

    #[test]
    fn test_bulk_string_exceeds_max_size() {
        let mut decoder = Decoder::with_max_frame_size(10);
        decoder.append(b"$100\r\n").unwrap();
        let err = decoder.decode().unwrap_err();
        assert!(err.to_string().contains("bulk string length exceeds"));
    }

    #[test]
    fn test_unterminated_line_exceeds_max_size() {
        let mut decoder = Decoder::with_max_frame_size(10);
        decoder.append(b"+").unwrap();
        decoder.append(&[b'x'; 20]).unwrap();
        let err = decoder.decode().unwrap_err();
        assert!(err.to_string().contains("buffer size exceeded"));
    }
}
