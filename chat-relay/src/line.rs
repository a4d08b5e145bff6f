use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Default upper bound on one line, terminator excluded.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

const NEWLINE: u8 = b'\n';
const CARRIAGE_RETURN: u8 = b'\r';

/// Reads newline-delimited lines from a buffered stream without interpreting
/// their contents.
///
/// Lines are returned without their terminator. A `\r` directly before the
/// `\n` is dropped as well so CRLF peers interoperate. Bytes that are not
/// valid UTF-8 pass through untouched.
pub struct LineReader<R> {
    inner: R,
    max_len: usize,
    buf: Vec<u8>,
}

impl<R> LineReader<R>
where
    R: AsyncBufRead + Unpin,
{
    pub fn new(inner: R) -> Self {
        Self::with_max_len(inner, DEFAULT_MAX_LINE_BYTES)
    }

    pub fn with_max_len(inner: R, max_len: usize) -> Self {
        Self {
            inner,
            max_len,
            buf: Vec::new(),
        }
    }

    /// Returns the next line, or `None` once the peer has closed its side.
    ///
    /// A trailing fragment without a terminator is still returned as a line
    /// before `None`. Input longer than the configured bound fails with
    /// [`io::ErrorKind::InvalidData`]; the reader should be discarded after that.
    pub async fn next_line(&mut self) -> io::Result<Option<Bytes>> {
        self.buf.clear();

        // Room for the longest allowed line plus "\r\n", and one byte more to detect overflow.
        let limit = u64::try_from(self.max_len.saturating_add(3)).unwrap_or(u64::MAX);
        let bytes = (&mut self.inner)
            .take(limit)
            .read_until(NEWLINE, &mut self.buf)
            .await?;
        if bytes == 0 {
            return Ok(None);
        }

        if self.buf.last() == Some(&NEWLINE) {
            self.buf.pop();
            if self.buf.last() == Some(&CARRIAGE_RETURN) {
                self.buf.pop();
            }
        }

        if self.buf.len() > self.max_len {
            return Err(line_too_long(self.max_len));
        }

        Ok(Some(Bytes::copy_from_slice(&self.buf)))
    }

    pub fn max_len(&self) -> usize {
        self.max_len
    }
}

/// Appends the terminator once so a broadcast can reuse the frame for every member.
pub fn encode_line(line: &[u8]) -> Bytes {
    let mut frame = BytesMut::with_capacity(line.len() + 1);
    frame.extend_from_slice(line);
    frame.put_u8(NEWLINE);
    frame.freeze()
}

/// Writes an already terminated frame and flushes so the peer sees it right away.
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await
}

/// Writes one line followed by `\n`.
pub async fn write_line<W>(writer: &mut W, line: &[u8]) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    write_frame(writer, &encode_line(line)).await
}

fn line_too_long(max_len: usize) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        format!("line exceeds {max_len} bytes"),
    )
}
