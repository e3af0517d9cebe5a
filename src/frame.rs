//! Length-prefixed frame encoding and incremental parsing.
//!
//! A data frame is an ASCII decimal length, `:`, and exactly that many
//! payload bytes, with no trailing delimiter. Keep-alive and transfer-control
//! frames prepend a reserved 3-byte magic to one data frame. [`FrameBuffer`]
//! holds unconsumed bytes between calls and only asks for more input when no
//! complete frame is buffered.

use crate::error::{Result, WireError};
use crate::protocol::{CONTROL_MAGIC, KEEPALIVE_MAGIC, MAX_CONTROL_SIZE, MAX_HEADER_DIGITS};

/// One complete frame, payload bytes only.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Data(Vec<u8>),
    KeepAlive(Vec<u8>),
    Control(Vec<u8>),
}

pub fn encode_data(payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + MAX_HEADER_DIGITS + 1);
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(payload);
    buf
}

pub fn encode_tagged(magic: &[u8; 3], payload: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(payload.len() + MAX_HEADER_DIGITS + 4);
    buf.extend_from_slice(magic);
    buf.extend_from_slice(payload.len().to_string().as_bytes());
    buf.push(b':');
    buf.extend_from_slice(payload);
    buf
}

/// Unconsumed-byte buffer with incremental frame parsing.
#[derive(Default)]
pub struct FrameBuffer {
    buf: Vec<u8>,
}

impl FrameBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Try to parse one complete frame off the front of the buffer.
    ///
    /// Returns `Ok(None)` when more input is needed. `limit` bounds data-frame
    /// payloads and pre-header accumulation (it is always non-zero; callers
    /// fold their hard cap in). Magic-tagged frames are bounded by
    /// `MAX_CONTROL_SIZE` instead. Surplus bytes past the parsed frame are
    /// retained for the next call.
    pub fn next_frame(&mut self, limit: usize) -> Result<Option<Frame>> {
        if self.buf.is_empty() {
            return Ok(None);
        }
        if self.buf[0] == b'#' {
            if self.buf.len() < 3 {
                return Ok(None);
            }
            let magic = [self.buf[0], self.buf[1], self.buf[2]];
            if &magic != KEEPALIVE_MAGIC && &magic != CONTROL_MAGIC {
                return Err(WireError::DecodeError {
                    reason: format!("unknown frame magic {:?}", String::from_utf8_lossy(&magic)),
                });
            }
            let parsed = self.parse_data_at(3, MAX_CONTROL_SIZE).map_err(|e| match e {
                WireError::ReadLimitExceeded { got, .. } => WireError::ProtocolViolation {
                    reason: format!("oversized control frame: {got} bytes"),
                },
                other => other,
            })?;
            match parsed {
                None => Ok(None),
                Some((payload, consumed)) => {
                    self.buf.drain(..consumed);
                    if &magic == KEEPALIVE_MAGIC {
                        Ok(Some(Frame::KeepAlive(payload)))
                    } else {
                        Ok(Some(Frame::Control(payload)))
                    }
                }
            }
        } else {
            match self.parse_data_at(0, limit)? {
                None => {
                    // No complete frame yet; a buffer already past the limit
                    // means the header will never fit under it.
                    if self.buf.len() > limit {
                        return Err(WireError::ReadLimitExceeded {
                            got: self.buf.len(),
                            limit,
                        });
                    }
                    Ok(None)
                }
                Some((payload, consumed)) => {
                    self.buf.drain(..consumed);
                    Ok(Some(Frame::Data(payload)))
                }
            }
        }
    }

    /// Parse one `<len>:<payload>` at `start`. Returns the payload and the
    /// total bytes consumed from the front of the buffer, or `None` when the
    /// buffer does not yet hold the whole frame.
    fn parse_data_at(&self, start: usize, limit: usize) -> Result<Option<(Vec<u8>, usize)>> {
        let mut i = start;
        while i < self.buf.len() && self.buf[i].is_ascii_digit() {
            i += 1;
            if i - start > MAX_HEADER_DIGITS {
                return Err(WireError::DecodeError {
                    reason: "length header too long".to_string(),
                });
            }
        }
        if i == start {
            if i >= self.buf.len() {
                return Ok(None);
            }
            return Err(WireError::DecodeError {
                reason: format!("frame does not start with a length: byte 0x{:02x}", self.buf[i]),
            });
        }
        if i >= self.buf.len() {
            return Ok(None); // digits so far, separator not seen yet
        }
        if self.buf[i] != b':' {
            return Err(WireError::DecodeError {
                reason: format!("bad length separator: byte 0x{:02x}", self.buf[i]),
            });
        }
        let digits = std::str::from_utf8(&self.buf[start..i]).map_err(|_| WireError::DecodeError {
            reason: "length header is not ASCII".to_string(),
        })?;
        let len: usize = digits.parse().map_err(|_| WireError::DecodeError {
            reason: format!("unparseable frame length {digits:?}"),
        })?;
        if len > limit {
            return Err(WireError::ReadLimitExceeded { got: len, limit });
        }
        let body_start = i + 1;
        if self.buf.len() < body_start + len {
            return Ok(None);
        }
        Ok(Some((
            self.buf[body_start..body_start + len].to_vec(),
            body_start + len,
        )))
    }
}
