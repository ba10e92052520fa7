//! Length-prefixed framing for TCP byte streams.
//!
//! Each frame is `[len: i32 LE][payload: len bytes]`. A declared length of
//! zero or less is a flush signal from the peer and discards whatever is
//! buffered. A declared length above the configured maximum is malformed and
//! fails the stream.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::config::MAX_FRAME_SIZE;
use crate::core::packet::{Packet, HEADER_LEN};
use crate::error::{ProtocolError, Result};

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    pub fn new(max_frame_size: usize) -> Self {
        Self { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_FRAME_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Packet;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        // Peek; the prefix stays in the buffer until the whole frame is here.
        let declared = i32::from_le_bytes([src[0], src[1], src[2], src[3]]);
        if declared <= 0 {
            src.clear();
            return Ok(None);
        }

        let len = declared as usize;
        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        Ok(Some(Packet::from_vec(payload.to_vec())))
    }
}

impl Encoder<Packet> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Packet, dst: &mut BytesMut) -> Result<()> {
        let len = item.len();
        if len > self.max_frame_size {
            return Err(ProtocolError::OversizedPacket(len));
        }
        dst.reserve(HEADER_LEN + len);
        dst.put_i32_le(len as i32);
        dst.put_slice(item.as_bytes());
        Ok(())
    }
}
