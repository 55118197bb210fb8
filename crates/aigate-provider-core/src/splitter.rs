//! Strategies that carve the upstream byte stream into the logical units
//! response filters consume.

use aigate_protocol::eventstream::{MIN_FRAME_LEN, frame_len};
use bytes::{Bytes, BytesMut};

pub trait ChunkSplitter: Send {
    /// Feeds raw bytes; returns every complete unit now available.
    fn push(&mut self, data: &[u8]) -> Vec<Bytes>;
    /// Flushes whatever is left at end of stream.
    fn finish(&mut self) -> Vec<Bytes>;
}

#[derive(Debug, Default)]
pub struct PassthroughSplitter;

impl ChunkSplitter for PassthroughSplitter {
    fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        if data.is_empty() {
            Vec::new()
        } else {
            vec![Bytes::copy_from_slice(data)]
        }
    }

    fn finish(&mut self) -> Vec<Bytes> {
        Vec::new()
    }
}

/// Splits on SSE event boundaries; each unit keeps its trailing blank line.
#[derive(Debug, Default)]
pub struct SseChunkSplitter {
    buffer: BytesMut,
}

impl SseChunkSplitter {
    fn boundary(&self) -> Option<usize> {
        let buf = &self.buffer[..];
        let lf = buf.windows(2).position(|w| w == b"\n\n").map(|i| i + 2);
        let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4);
        match (lf, crlf) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }
}

impl ChunkSplitter for SseChunkSplitter {
    fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();
        while let Some(end) = self.boundary() {
            out.push(self.buffer.split_to(end).freeze());
        }
        out
    }

    fn finish(&mut self) -> Vec<Bytes> {
        if self.buffer.iter().all(u8::is_ascii_whitespace) {
            self.buffer.clear();
            return Vec::new();
        }
        vec![self.buffer.split().freeze()]
    }
}

/// Splits `application/vnd.amazon.eventstream` into whole frames.
#[derive(Debug, Default)]
pub struct EventStreamChunkSplitter {
    buffer: BytesMut,
}

impl ChunkSplitter for EventStreamChunkSplitter {
    fn push(&mut self, data: &[u8]) -> Vec<Bytes> {
        self.buffer.extend_from_slice(data);
        let mut out = Vec::new();
        while self.buffer.len() >= 4 {
            match frame_len(&self.buffer) {
                Some(len) if len >= MIN_FRAME_LEN && self.buffer.len() >= len => {
                    out.push(self.buffer.split_to(len).freeze());
                }
                Some(len) if len >= MIN_FRAME_LEN => break,
                // A corrupt prelude; hand the rest to the decoder to report.
                _ => {
                    out.push(self.buffer.split().freeze());
                    break;
                }
            }
        }
        out
    }

    fn finish(&mut self) -> Vec<Bytes> {
        if self.buffer.is_empty() {
            return Vec::new();
        }
        vec![self.buffer.split().freeze()]
    }
}
