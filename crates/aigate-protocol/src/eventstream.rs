//! Decoder for the AWS `application/vnd.amazon.eventstream` binary framing.
//!
//! Frame layout: `total_len:u32be | headers_len:u32be | prelude_crc:u32be |
//! headers | payload | message_crc:u32be`. CRCs are not verified.

use std::collections::HashMap;

pub const PRELUDE_LEN: usize = 12;
pub const MIN_FRAME_LEN: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventStreamError {
    #[error("eventstream total length {0} too small")]
    FrameTooShort(usize),
    #[error("eventstream invalid headers length")]
    InvalidHeadersLength,
    #[error("eventstream header truncated ({0})")]
    HeaderTruncated(&'static str),
    #[error("eventstream header is not utf-8")]
    HeaderNotUtf8,
    #[error("eventstream unsupported header type {0}")]
    UnsupportedHeaderType(u8),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventStreamMessage {
    pub headers: HashMap<String, String>,
    pub payload: Vec<u8>,
}

impl EventStreamMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    /// `:message-type`, defaulting to `event` when the header is absent.
    pub fn message_type(&self) -> &str {
        self.header(":message-type").unwrap_or("event")
    }
}

/// Returns the byte length of the frame at the start of `buf`, once the
/// prelude is available.
pub fn frame_len(buf: &[u8]) -> Option<usize> {
    let prelude: [u8; 4] = buf.get(0..4)?.try_into().ok()?;
    Some(u32::from_be_bytes(prelude) as usize)
}

#[derive(Debug, Default)]
pub struct EventStreamDecoder {
    buffer: Vec<u8>,
}

impl EventStreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn next_message(&mut self) -> Option<Result<EventStreamMessage, EventStreamError>> {
        if self.buffer.len() < PRELUDE_LEN {
            return None;
        }
        let total_len = frame_len(&self.buffer)?;
        if total_len < MIN_FRAME_LEN {
            // The stream can no longer be re-synchronised.
            self.buffer.clear();
            return Some(Err(EventStreamError::FrameTooShort(total_len)));
        }
        if self.buffer.len() < total_len {
            return None;
        }
        let frame: Vec<u8> = self.buffer.drain(..total_len).collect();
        Some(decode_frame(&frame))
    }
}

/// Decodes one complete frame.
pub fn decode_frame(frame: &[u8]) -> Result<EventStreamMessage, EventStreamError> {
    let total_len = frame_len(frame).ok_or(EventStreamError::FrameTooShort(frame.len()))?;
    if total_len < MIN_FRAME_LEN || frame.len() < total_len {
        return Err(EventStreamError::FrameTooShort(frame.len()));
    }
    let headers_len = frame
        .get(4..8)
        .and_then(|raw| <[u8; 4]>::try_from(raw).ok())
        .map(u32::from_be_bytes)
        .ok_or(EventStreamError::InvalidHeadersLength)? as usize;
    let headers_end = PRELUDE_LEN.saturating_add(headers_len);
    let payload_end = total_len - 4;
    if headers_end > payload_end {
        return Err(EventStreamError::InvalidHeadersLength);
    }

    let headers = parse_headers(&frame[PRELUDE_LEN..headers_end])?;
    Ok(EventStreamMessage {
        headers,
        payload: frame[headers_end..payload_end].to_vec(),
    })
}

fn parse_headers(bytes: &[u8]) -> Result<HashMap<String, String>, EventStreamError> {
    let mut out = HashMap::new();
    let mut idx = 0usize;
    let ensure = |idx: usize, needed: usize, label: &'static str| {
        if idx + needed > bytes.len() {
            Err(EventStreamError::HeaderTruncated(label))
        } else {
            Ok(())
        }
    };

    while idx < bytes.len() {
        let name_len = bytes[idx] as usize;
        idx += 1;
        ensure(idx, name_len, "name")?;
        let name = std::str::from_utf8(&bytes[idx..idx + name_len])
            .map_err(|_| EventStreamError::HeaderNotUtf8)?
            .to_string();
        idx += name_len;
        ensure(idx, 1, "type")?;
        let value_type = bytes[idx];
        idx += 1;

        match value_type {
            0 | 1 => {}
            2 => {
                ensure(idx, 1, "byte")?;
                idx += 1;
            }
            3 => {
                ensure(idx, 2, "short")?;
                idx += 2;
            }
            4 => {
                ensure(idx, 4, "int")?;
                idx += 4;
            }
            5 | 8 => {
                ensure(idx, 8, "long")?;
                idx += 8;
            }
            6 | 7 => {
                ensure(idx, 2, "length")?;
                let len = u16::from_be_bytes([bytes[idx], bytes[idx + 1]]) as usize;
                idx += 2;
                ensure(idx, len, "bytes")?;
                if value_type == 7 {
                    let value = std::str::from_utf8(&bytes[idx..idx + len])
                        .map_err(|_| EventStreamError::HeaderNotUtf8)?;
                    out.insert(name, value.to_string());
                }
                idx += len;
            }
            9 => {
                ensure(idx, 16, "uuid")?;
                idx += 16;
            }
            other => return Err(EventStreamError::UnsupportedHeaderType(other)),
        }
    }
    Ok(out)
}
