//! Connect streaming envelopes: one flags byte, a big-endian `u32` length, then the payload.
use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::{Code, TransportError};

const HEADER_LEN: usize = 5;

pub const FLAG_COMPRESSED: u8 = 0b01;
pub const FLAG_END_STREAM: u8 = 0b10;

/// Refuse messages larger than this to bound memory use on a misbehaving stream.
const MAX_MESSAGE_LEN: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub flags: u8,
    pub payload: Bytes,
}

impl Frame {
    pub fn is_end_stream(&self) -> bool {
        self.flags & FLAG_END_STREAM != 0
    }
}

pub fn encode(flags: u8, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
    buf.put_u8(flags);
    buf.put_u32(payload.len() as u32);
    buf.put_slice(payload);
    buf.freeze()
}

/// Reassembles frames from arbitrarily split chunks.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: BytesMut,
}

impl FrameDecoder {
    pub fn new() -> FrameDecoder {
        FrameDecoder::default()
    }

    pub fn extend(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Returns `true` if a partially received frame is buffered.
    pub fn has_partial(&self) -> bool {
        !self.buf.is_empty()
    }

    /// Pop the next complete frame, if one is buffered.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, TransportError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }

        let flags = self.buf[0];
        let len = u32::from_be_bytes([self.buf[1], self.buf[2], self.buf[3], self.buf[4]]) as usize;
        if flags & FLAG_COMPRESSED != 0 {
            return Err(TransportError::new(
                Code::Internal,
                "received compressed message without negotiating compression",
            ));
        }
        if len > MAX_MESSAGE_LEN {
            return Err(TransportError::new(
                Code::ResourceExhausted,
                format!("message of {len} bytes exceeds limit of {MAX_MESSAGE_LEN} bytes"),
            ));
        }
        if self.buf.len() < HEADER_LEN + len {
            return Ok(None);
        }

        self.buf.advance(HEADER_LEN);
        let payload = self.buf.split_to(len).freeze();
        Ok(Some(Frame { flags, payload }))
    }
}
