//! Length-prefixed frame codec for the TCP bridge transport.
//!
//! # Wire format
//!
//! ```text
//! magic:    [u8; 4]  "JLK0"
//! checksum: u32 LE   first 4 bytes of blake3(payload), 0 when empty
//! length:   u32 LE   payload byte count
//! payload:  [u8]
//! ```
//!
//! The checksum guards against corrupted bridge relays, not against an
//! adversary; trust comes from the pairing credential handshake.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::LinkError;

/// Frame header length on the wire.
pub const FRAME_HEADER_LEN: usize = 12;

/// Maximum payload size accepted by the codec.
pub const MAX_FRAME_SIZE: usize = 1 << 20;

const MAGIC: [u8; 4] = *b"JLK0";

fn payload_checksum(payload: &[u8]) -> u32 {
    if payload.is_empty() {
        return 0;
    }
    let hash = blake3::hash(payload);
    u32::from_le_bytes(hash.as_bytes()[0..4].try_into().expect("hash is 32 bytes"))
}

/// Framing codec used by every bridge sub-channel.
#[derive(Debug, Default)]
pub struct LinkCodec;

impl Decoder for LinkCodec {
    type Item = Bytes;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < FRAME_HEADER_LEN {
            return Ok(None);
        }

        if src[0..4] != MAGIC {
            return Err(LinkError::InvalidMagic);
        }

        let checksum = u32::from_le_bytes(src[4..8].try_into().expect("sliced 4 bytes"));
        let length = u32::from_le_bytes(src[8..12].try_into().expect("sliced 4 bytes")) as usize;

        if length > MAX_FRAME_SIZE {
            return Err(LinkError::FrameTooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        if src.len() < FRAME_HEADER_LEN + length {
            // Reserve so the next read can complete the frame.
            src.reserve(FRAME_HEADER_LEN + length - src.len());
            return Ok(None);
        }

        src.advance(FRAME_HEADER_LEN);
        let payload = src.split_to(length).freeze();

        if payload_checksum(&payload) != checksum {
            return Err(LinkError::ChecksumMismatch);
        }

        Ok(Some(payload))
    }
}

impl Encoder<Bytes> for LinkCodec {
    type Error = LinkError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(LinkError::FrameTooLarge {
                size: item.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(FRAME_HEADER_LEN + item.len());
        dst.put_slice(&MAGIC);
        dst.put_u32_le(payload_checksum(&item));
        dst.put_u32_le(item.len() as u32);
        dst.put_slice(&item);
        Ok(())
    }
}

// ── Tests ────────────────────────────────────────────────────────
