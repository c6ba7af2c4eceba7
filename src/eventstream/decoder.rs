//! Incremental decoder for the AWS-style binary EventStream framing.
//!
//! Frames are self-delimiting via a big-endian `total_length` prelude:
//!
//! ```text
//! total_length:u32 | headers_length:u32 | prelude_crc:u32 |
//! headers[headers_length] | payload | message_crc:u32
//! ```
//!
//! The decoder accepts byte chunks of arbitrary size and boundary, buffers
//! partial frames, and resynchronises one byte at a time after a corrupt
//! prelude. CRC words are not verified.

use bytes::{Buf, BytesMut};

use super::{HeaderValue, Message};

/// Smallest legal frame: prelude (12 bytes) + message CRC (4 bytes).
pub const MIN_FRAME_LEN: usize = 16;
/// Largest legal frame accepted from the wire.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const DEFAULT_MAX_ERRORS: u32 = 16;

/// Terminal decoder failure. Individual malformed frames are tolerated and
/// counted; only a run of errors past the budget fails the stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameStreamError {
    #[error("frame decode error budget exhausted after {0} errors")]
    ErrorBudgetExhausted(u32),
}

#[derive(Debug)]
enum FrameError {
    HeadersOverrunFrame,
}

/// Incremental EventStream frame decoder.
pub struct FrameDecoder {
    buf: BytesMut,
    errors: u32,
    max_errors: u32,
}

impl FrameDecoder {
    #[must_use]
    pub fn new() -> Self {
        Self::with_max_errors(DEFAULT_MAX_ERRORS)
    }

    #[must_use]
    pub fn with_max_errors(max_errors: u32) -> Self {
        Self {
            buf: BytesMut::with_capacity(4096),
            errors: 0,
            max_errors,
        }
    }

    /// Discard all buffered bytes and error accounting.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.errors = 0;
    }

    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.errors
    }

    /// Bytes retained waiting for the rest of a frame.
    #[must_use]
    pub fn buffered_len(&self) -> usize {
        self.buf.len()
    }

    /// Feed a chunk and append every whole decoded message to `out`.
    ///
    /// Messages decoded before a budget failure are kept in `out`.
    ///
    /// # Errors
    ///
    /// Returns [`FrameStreamError::ErrorBudgetExhausted`] once the cumulative
    /// error count exceeds the configured budget.
    pub fn feed(&mut self, chunk: &[u8], out: &mut Vec<Message>) -> Result<(), FrameStreamError> {
        self.buf.extend_from_slice(chunk);
        self.drain(out)
    }

    fn drain(&mut self, out: &mut Vec<Message>) -> Result<(), FrameStreamError> {
        while self.buf.len() >= MIN_FRAME_LEN {
            let total_length = read_u32(&self.buf[0..4]) as usize;
            if !(MIN_FRAME_LEN..=MAX_FRAME_LEN).contains(&total_length) {
                // Corrupt prelude: resync one byte at a time. Wire corruption
                // is typically localised, so this beats discarding the buffer.
                self.buf.advance(1);
                self.count_error("frame length out of range")?;
                continue;
            }
            if self.buf.len() < total_length {
                break;
            }

            let frame = self.buf.split_to(total_length);
            match parse_frame(&frame) {
                Ok(message) => out.push(message),
                Err(FrameError::HeadersOverrunFrame) => {
                    self.count_error("headers_length exceeds frame")?;
                }
            }
        }
        Ok(())
    }

    fn count_error(&mut self, what: &str) -> Result<(), FrameStreamError> {
        self.errors += 1;
        tracing::debug!(errors = self.errors, "frame decode error: {what}");
        if self.errors > self.max_errors {
            return Err(FrameStreamError::ErrorBudgetExhausted(self.errors));
        }
        Ok(())
    }
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_frame(frame: &[u8]) -> Result<Message, FrameError> {
    let total_length = frame.len();
    let headers_length = read_u32(&frame[4..8]) as usize;
    if headers_length > total_length - MIN_FRAME_LEN {
        return Err(FrameError::HeadersOverrunFrame);
    }
    // frame[8..12] is the prelude CRC and the final 4 bytes are the message
    // CRC; neither is checked.
    let headers = decode_headers(&frame[12..12 + headers_length]);
    let payload = bytes::Bytes::copy_from_slice(&frame[12 + headers_length..total_length - 4]);
    Ok(Message { headers, payload })
}

#[inline]
fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

#[inline]
fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

/// Decode the header block. A malformed header (unknown tag, or a declared
/// length past the end of the block) stops parsing for this message; headers
/// decoded up to that point are kept and the message is not rejected.
fn decode_headers(mut block: &[u8]) -> rustc_hash::FxHashMap<String, HeaderValue> {
    let mut headers = rustc_hash::FxHashMap::default();

    while !block.is_empty() {
        let name_len = block[0] as usize;
        block = &block[1..];
        if block.len() < name_len + 1 {
            tracing::debug!("header name overruns block; keeping {} headers", headers.len());
            break;
        }
        let name = String::from_utf8_lossy(&block[..name_len]).into_owned();
        let tag = block[name_len];
        block = &block[name_len + 1..];

        let Some((value, consumed)) = decode_header_value(tag, block) else {
            tracing::debug!(tag, "malformed header value; keeping {} headers", headers.len());
            break;
        };
        block = &block[consumed..];
        headers.insert(name, value);
    }

    headers
}

fn decode_header_value(tag: u8, rest: &[u8]) -> Option<(HeaderValue, usize)> {
    match tag {
        0 => Some((HeaderValue::Bool(true), 0)),
        1 => Some((HeaderValue::Bool(false), 0)),
        2 => {
            let byte = *rest.first()?;
            Some((HeaderValue::Int8(byte as i8), 1))
        }
        3 => {
            if rest.len() < 2 {
                return None;
            }
            Some((HeaderValue::Int16(read_u16(rest) as i16), 2))
        }
        4 => {
            if rest.len() < 4 {
                return None;
            }
            Some((HeaderValue::Int32(read_u32(rest) as i32), 4))
        }
        5 => {
            if rest.len() < 8 {
                return None;
            }
            Some((HeaderValue::Int64(read_i64(rest)), 8))
        }
        6 | 7 => {
            if rest.len() < 2 {
                return None;
            }
            let len = read_u16(rest) as usize;
            let value = rest.get(2..2 + len)?;
            let header = if tag == 6 {
                HeaderValue::Bytes(value.to_vec())
            } else {
                HeaderValue::String(String::from_utf8_lossy(value).into_owned())
            };
            Some((header, 2 + len))
        }
        8 => {
            if rest.len() < 8 {
                return None;
            }
            Some((HeaderValue::Timestamp(read_i64(rest)), 8))
        }
        9 => {
            // Fixed 16-byte UUID. A short value falls back to a UTF-8 view
            // of whatever bytes remain.
            if rest.len() < 16 {
                let fallback = String::from_utf8_lossy(rest).into_owned();
                return Some((HeaderValue::String(fallback), rest.len()));
            }
            let mut raw = [0u8; 16];
            raw.copy_from_slice(&rest[..16]);
            Some((HeaderValue::Uuid(uuid::Uuid::from_bytes(raw).to_string()), 16))
        }
        _ => None,
    }
}

#[inline]
fn read_i64(bytes: &[u8]) -> i64 {
    i64::from_be_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ])
}
