//! Message framing for stream transports.
//!
//! With a delimiter, each unit is terminated by the delimiter on the wire; the delimiter is
//! stripped on decode and appended on encode. Without one, every read chunk is a unit and
//! unit boundaries are up to the caller.

use crate::error::TransportError;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::debug;

/// Upper bound for a single buffered frame.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 8 * 1024 * 1024;

/// Delimiter or raw-chunk framing.
#[derive(Debug, Clone)]
pub struct FrameCodec {
    delimiter: Option<Bytes>,
    max_frame_length: usize,
    /// Where the next delimiter search starts, so partial input is not rescanned.
    next_index: usize,
}

impl FrameCodec {
    /// Frames terminated by `delimiter`. An empty delimiter means raw framing.
    pub fn delimited(delimiter: impl Into<Bytes>) -> Self {
        let delimiter = delimiter.into();
        Self {
            delimiter: (!delimiter.is_empty()).then_some(delimiter),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            next_index: 0,
        }
    }

    /// Newline-terminated frames.
    pub fn lines() -> Self {
        Self::delimited(Bytes::from_static(b"\n"))
    }

    /// Every read chunk is one message.
    pub fn raw() -> Self {
        Self {
            delimiter: None,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
            next_index: 0,
        }
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }

    pub fn delimiter(&self) -> Option<&[u8]> {
        self.delimiter.as_deref()
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::lines()
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = TransportError;

    fn decode(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        let Some(delimiter) = &self.delimiter else {
            if buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(buf.split().freeze()));
        };

        // A multi-byte delimiter may straddle the previous search boundary.
        let from = self
            .next_index
            .saturating_sub(delimiter.len() - 1)
            .min(buf.len());
        match find(&buf[from..], delimiter) {
            Some(offset) => {
                let end = from + offset;
                self.next_index = 0;
                if end > self.max_frame_length {
                    return Err(TransportError::FrameTooLong {
                        limit: self.max_frame_length,
                    });
                }
                let frame = buf.split_to(end);
                buf.advance(delimiter.len());
                Ok(Some(frame.freeze()))
            }
            None if buf.len() > self.max_frame_length => Err(TransportError::FrameTooLong {
                limit: self.max_frame_length,
            }),
            None => {
                self.next_index = buf.len();
                Ok(None)
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Bytes>, TransportError> {
        if let Some(frame) = self.decode(buf)? {
            return Ok(Some(frame));
        }
        if !buf.is_empty() {
            debug!(
                discarded = buf.len(),
                "Discarding incomplete frame at end of stream"
            );
            buf.clear();
            self.next_index = 0;
        }
        Ok(None)
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = TransportError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), TransportError> {
        let extra = self.delimiter.as_ref().map_or(0, Bytes::len);
        dst.reserve(item.len() + extra);
        dst.put(item);
        if let Some(delimiter) = &self.delimiter {
            dst.put_slice(delimiter);
        }
        Ok(())
    }
}
