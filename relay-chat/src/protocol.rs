use std::{error::Error, fmt, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Prefix the server puts in front of every relayed chat line.
pub const MESSAGE_PREFIX: &str = "MESSAGE ";

/// Default cap on a single inbound line, not counting the delimiter.
pub const DEFAULT_MAX_LINE_BYTES: usize = 4096;

const LINE_ENDINGS: &[char] = &['\n', '\r'];

/// Carried inside the `InvalidData` error [`read_line`] returns for a line
/// over the cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineTooLong {
    pub max_bytes: usize,
    /// The delimiter has not been consumed yet; the rest of the line is
    /// still in the stream.
    pub unterminated: bool,
}

impl LineTooLong {
    pub fn from_io(err: &io::Error) -> Option<Self> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<LineTooLong>())
            .copied()
    }
}

impl fmt::Display for LineTooLong {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "line exceeds {} bytes", self.max_bytes)
    }
}

impl Error for LineTooLong {}

/// Wraps a chat payload in the relay framing marker.
pub fn frame_message(payload: &str) -> String {
    format!("{MESSAGE_PREFIX}{payload}")
}

/// Returns the payload of a relayed chat line, or `None` for any other
/// server output.
pub fn parse_relayed(line: &str) -> Option<&str> {
    line.trim_end_matches(LINE_ENDINGS).strip_prefix(MESSAGE_PREFIX)
}

/// Reads one newline-delimited UTF-8 line, refusing to buffer more than
/// `max_bytes` of payload.
///
/// Returns `Ok(None)` on a clean EOF. A final line without a trailing
/// newline is still returned. An over-long line or invalid UTF-8 yields an
/// `InvalidData` error. An over-long line is left partly unread; callers
/// either drop the connection or call [`discard_line`].
pub async fn read_line<R>(reader: &mut R, max_bytes: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    // Room for the payload plus "\r\n".
    let limit = (max_bytes as u64).saturating_add(2);
    let bytes = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
    if bytes == 0 {
        return Ok(None);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    } else if bytes as u64 == limit {
        return Err(line_too_long(max_bytes, true));
    }

    if buf.len() > max_bytes {
        return Err(line_too_long(max_bytes, false));
    }

    String::from_utf8(buf)
        .map(Some)
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Writes `line` followed by a newline and flushes so the peer sees it
/// promptly.
pub async fn write_line<W>(writer: &mut W, line: &str) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut encoded = Vec::with_capacity(line.len() + 1);
    encoded.extend_from_slice(line.as_bytes());
    encoded.push(b'\n');
    writer.write_all(&encoded).await?;
    writer.flush().await
}

/// Consumes input up to and including the next newline without buffering
/// it. Used to step over a line [`read_line`] rejected as too long.
pub async fn discard_line<R>(reader: &mut R) -> io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        match available.iter().position(|byte| *byte == b'\n') {
            Some(newline) => {
                reader.consume(newline + 1);
                return Ok(());
            }
            None => {
                let len = available.len();
                reader.consume(len);
            }
        }
    }
}

fn line_too_long(max_bytes: usize, unterminated: bool) -> io::Error {
    io::Error::new(
        io::ErrorKind::InvalidData,
        LineTooLong {
            max_bytes,
            unterminated,
        },
    )
}
