//! Bounded NDJSON line reader for agent sockets.

use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio_util::codec::{Decoder, LinesCodec, LinesCodecError};

/// Longest accepted line. A 64 KiB chunk is about 88 KiB once base64 encoded.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

const READ_RESERVE: usize = 8 * 1024;

/// One line read from an agent.
#[derive(Debug, PartialEq, Eq)]
pub enum Frame {
    Line(String),
    /// The line was dropped; the reader is positioned after it.
    Rejected(FrameRejection),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameRejection {
    TooLong,
    NotUtf8,
}

/// Splits a byte stream into lines without ever buffering more than one
/// oversized line. Bad lines are reported and skipped; only socket errors
/// end the stream.
pub struct FrameReader<R> {
    inner: R,
    codec: LinesCodec,
    buf: BytesMut,
    eof: bool,
}

impl<R: AsyncRead + Unpin> FrameReader<R> {
    pub fn new(inner: R) -> Self {
        Self::with_max_length(inner, MAX_FRAME_BYTES)
    }

    pub fn with_max_length(inner: R, max_length: usize) -> Self {
        Self {
            inner,
            codec: LinesCodec::new_with_max_length(max_length),
            buf: BytesMut::with_capacity(READ_RESERVE),
            eof: false,
        }
    }

    /// Next line, or `None` once the peer has closed and everything buffered is consumed.
    pub async fn next_frame(&mut self) -> std::io::Result<Option<Frame>> {
        loop {
            let decoded = if self.eof {
                self.codec.decode_eof(&mut self.buf)
            } else {
                self.codec.decode(&mut self.buf)
            };
            match decoded {
                Ok(Some(line)) => return Ok(Some(Frame::Line(line))),
                Ok(None) if self.eof => return Ok(None),
                Ok(None) => {}
                Err(LinesCodecError::MaxLineLengthExceeded) => {
                    return Ok(Some(Frame::Rejected(FrameRejection::TooLong)));
                }
                // The codec only reports I/O errors for lines that are not UTF-8.
                Err(LinesCodecError::Io(_)) => {
                    return Ok(Some(Frame::Rejected(FrameRejection::NotUtf8)));
                }
            }

            self.buf.reserve(READ_RESERVE);
            if self.inner.read_buf(&mut self.buf).await? == 0 {
                self.eof = true;
            }
        }
    }
}
