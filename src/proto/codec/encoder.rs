use std::fmt::Write as _;

use bytes::{BufMut, Bytes, BytesMut};

use crate::alloc::AllocGuard;
use crate::proto::error::Result;
use crate::proto::reply::Reply;

/// A RESP encoder that writes commands and [`Reply`] values as bytes.
///
/// The encoder sizes each value up front and makes a single guarded
/// reservation before writing, so a refused allocation leaves the buffer
/// exactly as it was.
///
/// # Example
///
/// ```
/// use shardis::proto::codec::Encoder;
///
/// let mut encoder = Encoder::new();
/// encoder.encode_command(&["GET", "foo"]).unwrap();
/// assert_eq!(&encoder.take()[..], b"*2\r\n$3\r\nGET\r\n$3\r\nfoo\r\n");
/// ```
#[derive(Debug)]
pub struct Encoder {
    buf: BytesMut,
    alloc: AllocGuard,
}

impl Encoder {
    /// Creates a new encoder with an empty buffer.
    pub fn new() -> Self {
        Self::with_allocator(AllocGuard::system())
    }

    /// Creates a new encoder that allocates through `alloc`.
    pub fn with_allocator(alloc: AllocGuard) -> Self {
        Self {
            buf: BytesMut::new(),
            alloc,
        }
    }

    /// Encodes a command as an array of bulk strings.
    ///
    /// # Arguments
    ///
    /// * `args` - Command name followed by its arguments
    ///
    /// # Errors
    ///
    /// Returns `Error::OutOfMemory` if the buffer cannot grow; the buffer is
    /// left unchanged.
    pub fn encode_command<A: AsRef<[u8]>>(&mut self, args: &[A]) -> Result<()> {
        self.alloc.reserve_buf(&mut self.buf, command_len(args))?;
        self.put_header(b'*', args.len());
        for arg in args {
            let arg = arg.as_ref();
            self.put_header(b'$', arg.len());
            self.buf.extend_from_slice(arg);
            self.buf.extend_from_slice(b"\r\n");
        }
        Ok(())
    }

    /// Encodes a reply into the internal buffer.
    ///
    /// # Errors
    ///
    /// Returns `Error::OutOfMemory` if the buffer cannot grow; the buffer is
    /// left unchanged.
    pub fn encode(&mut self, reply: &Reply) -> Result<()> {
        self.alloc.reserve_buf(&mut self.buf, reply_len(reply))?;
        self.put_reply(reply);
        Ok(())
    }

    fn put_reply(&mut self, reply: &Reply) {
        match reply {
            Reply::Status(s) => {
                self.buf.put_u8(b'+');
                self.buf.extend_from_slice(s);
                self.buf.extend_from_slice(b"\r\n");
            }
            Reply::Error(e) => {
                self.buf.put_u8(b'-');
                self.buf.extend_from_slice(e);
                self.buf.extend_from_slice(b"\r\n");
            }
            Reply::Integer(n) => {
                let _ = write!(self.buf, ":{n}\r\n");
            }
            Reply::Bulk(data) => {
                self.put_header(b'$', data.len());
                self.buf.extend_from_slice(data);
                self.buf.extend_from_slice(b"\r\n");
            }
            Reply::Array(items) => {
                self.put_header(b'*', items.len());
                for item in items {
                    self.put_reply(item);
                }
            }
            Reply::Nil => {
                self.buf.extend_from_slice(b"$-1\r\n");
            }
        }
    }

    fn put_header(&mut self, marker: u8, len: usize) {
        self.buf.put_u8(marker);
        let _ = write!(self.buf, "{len}\r\n");
    }

    /// Number of encoded bytes waiting in the buffer.
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing has been encoded since the last take.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Takes the encoded data from the buffer, leaving it empty.
    pub fn take(&mut self) -> Bytes {
        self.buf.split().freeze()
    }
}

impl Default for Encoder {
    fn default() -> Self {
        Self::new()
    }
}

/// Encodes a single command into its own buffer.
///
/// The buffer is handed to the caller, so it is admitted as a one-shot
/// allocation rather than grown.
///
/// # Errors
///
/// Returns `Error::OutOfMemory` if the allocator refuses the buffer.
pub fn encode_command<A: AsRef<[u8]>>(alloc: &AllocGuard, args: &[A]) -> Result<Bytes> {
    let len = command_len(args);
    alloc.admit(len)?;
    let mut encoder = Encoder {
        buf: BytesMut::with_capacity(len),
        alloc: alloc.clone(),
    };
    encoder.encode_command(args)?;
    Ok(encoder.take())
}

/// Exact encoded size of a command.
pub fn command_len<A: AsRef<[u8]>>(args: &[A]) -> usize {
    let header = 1 + decimal_len(args.len() as u64) + 2;
    args.iter().fold(header, |acc, arg| {
        let n = arg.as_ref().len();
        acc + 1 + decimal_len(n as u64) + 2 + n + 2
    })
}

fn reply_len(reply: &Reply) -> usize {
    match reply {
        Reply::Status(s) | Reply::Error(s) => 1 + s.len() + 2,
        Reply::Integer(n) => {
            let sign = usize::from(*n < 0);
            1 + sign + decimal_len(n.unsigned_abs()) + 2
        }
        Reply::Bulk(data) => 1 + decimal_len(data.len() as u64) + 2 + data.len() + 2,
        Reply::Array(items) => items
            .iter()
            .fold(1 + decimal_len(items.len() as u64) + 2, |acc, item| {
                acc + reply_len(item)
            }),
        Reply::Nil => 5,
    }
}

fn decimal_len(mut n: u64) -> usize {
    let mut digits = 1;
    while n >= 10 {
        n /= 10;
        digits += 1;
    }
    digits
}
