//! Newline-delimited framing over an async byte stream.

use crate::protocol::{encode_response, Response};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const READ_CHUNK: usize = 8 * 1024;

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("failed to encode frame: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Reassembles frames that arrive split across (or packed into) socket reads.
///
/// `next_frame` is cancel safe: bytes are buffered before any await point
/// returns, so dropping the future loses nothing.
#[derive(Debug)]
pub struct FrameReader<R> {
    inner: R,
    buffer: Vec<u8>,
    max_frame_bytes: usize,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R, max_frame_bytes: usize) -> Self {
        Self {
            inner,
            buffer: Vec::new(),
            max_frame_bytes,
            eof: false,
        }
    }

    /// Next non-blank frame without its terminator, or `None` at clean EOF.
    ///
    /// Unterminated trailing bytes at EOF count as a final frame.
    pub async fn next_frame(&mut self) -> Result<Option<Vec<u8>>, FrameError> {
        loop {
            if let Some(end) = self.buffer.iter().position(|byte| *byte == b'\n') {
                let mut frame: Vec<u8> = self.buffer.drain(..=end).collect();
                frame.pop();
                if frame.last() == Some(&b'\r') {
                    frame.pop();
                }
                if frame.len() > self.max_frame_bytes {
                    return Err(FrameError::TooLarge {
                        limit: self.max_frame_bytes,
                    });
                }
                if is_blank(&frame) {
                    continue;
                }
                return Ok(Some(frame));
            }

            // A trailing `\r` may be the first half of a CRLF still in flight.
            let limit = match self.buffer.last() {
                Some(b'\r') => self.max_frame_bytes + 1,
                _ => self.max_frame_bytes,
            };
            if self.buffer.len() > limit {
                return Err(FrameError::TooLarge {
                    limit: self.max_frame_bytes,
                });
            }

            if self.eof {
                let rest = std::mem::take(&mut self.buffer);
                return Ok((!is_blank(&rest)).then_some(rest));
            }

            let mut chunk = [0u8; READ_CHUNK];
            let read = self.inner.read(&mut chunk).await?;
            if read == 0 {
                self.eof = true;
            } else {
                self.buffer.extend_from_slice(&chunk[..read]);
            }
        }
    }

    /// True while a frame has started arriving but is not complete.
    pub fn has_partial(&self) -> bool {
        !is_blank(&self.buffer)
    }

}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}

/// Write one response as a complete frame and flush it.
pub async fn write_frame<W>(writer: &mut W, response: &Response) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = encode_response(response)?;
    writer.write_all(&bytes).await?;
    writer.flush().await?;
    Ok(())
}
