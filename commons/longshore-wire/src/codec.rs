use std::marker::PhantomData;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Serialize, de::DeserializeOwned};
use tokio_util::codec::{Decoder, Encoder};
use tracing::trace;

use crate::WireError;

/// Upper bound for a single frame payload. Deploy commands carry whole
/// manifest bundles, so the limit is generous.
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

/// Length-delimited JSON framing: a 4-byte big-endian payload length
/// followed by the JSON-encoded frame. `Rx` is the frame type decoded from
/// the peer, `Tx` the frame type encoded toward it.
#[derive(Debug)]
pub struct FrameCodec<Rx, Tx> {
    _frames: PhantomData<fn() -> (Rx, Tx)>,
}

impl<Rx, Tx> FrameCodec<Rx, Tx> {
    pub fn new() -> Self {
        Self {
            _frames: PhantomData,
        }
    }
}

impl<Rx, Tx> Default for FrameCodec<Rx, Tx> {
    fn default() -> Self {
        Self::new()
    }
}

impl<Rx: DeserializeOwned, Tx> Decoder for FrameCodec<Rx, Tx> {
    type Item = Rx;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Rx>, WireError> {
        if src.len() < 4 {
            return Ok(None);
        }
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&src[..4]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLarge {
                len,
                max: MAX_FRAME_BYTES,
            });
        }
        if src.len() < 4 + len {
            trace!(
                have = src.len(),
                want = 4 + len,
                "partial frame, waiting for more bytes"
            );
            src.reserve(4 + len - src.len());
            return Ok(None);
        }
        src.advance(4);
        let payload = src.split_to(len);
        trace!(len, "decoded frame");
        Ok(Some(serde_json::from_slice(&payload)?))
    }
}

impl<Rx, Tx: Serialize> Encoder<Tx> for FrameCodec<Rx, Tx> {
    type Error = WireError;

    fn encode(&mut self, frame: Tx, dst: &mut BytesMut) -> Result<(), WireError> {
        let payload = serde_json::to_vec(&frame)?;
        if payload.len() > MAX_FRAME_BYTES {
            return Err(WireError::FrameTooLarge {
                len: payload.len(),
                max: MAX_FRAME_BYTES,
            });
        }
        dst.reserve(4 + payload.len());
        dst.put_u32(payload.len() as u32);
        dst.extend_from_slice(&payload);
        Ok(())
    }
}
