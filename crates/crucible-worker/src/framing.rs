//! Length-prefixed frame codec for the backend channel.
//!
//! Each frame is a 4-byte big-endian length prefix followed by a JSON
//! payload. The length is validated against the frame cap before any
//! allocation happens.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Upper bound on a single frame.
///
/// Inbound frames are dominated by the base64 source payload (budgeted
/// in kilobytes); outbound frames by one 512-byte output chunk. 4 MiB
/// leaves generous slack either way.
pub const MAX_FRAME_SIZE: usize = 4 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Frame-level failures; anything here kills the connection.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame of {size} bytes exceeds the {max}-byte cap")]
    TooLarge { size: usize, max: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Codec for [`tokio_util::codec::Framed`] streams over the backend
/// connection.
#[derive(Debug, Clone, Default)]
pub struct FrameCodec;

impl FrameCodec {
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, FrameError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        let length = u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: length,
                max: MAX_FRAME_SIZE,
            });
        }

        let total_len = HEADER_LEN + length;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        Ok(Some(src.split_to(length).freeze()))
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), FrameError> {
        if item.len() > MAX_FRAME_SIZE {
            return Err(FrameError::TooLarge {
                size: item.len(),
                max: MAX_FRAME_SIZE,
            });
        }

        dst.reserve(HEADER_LEN + item.len());
        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
        dst.put_u32(item.len() as u32);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(b"{\"finish\":true}".to_vec(), &mut buf).unwrap();

        assert_eq!(&buf[..4], &[0, 0, 0, 15]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], b"{\"finish\":true}");
        assert!(buf.is_empty());
    }

    #[test]
    fn partial_header_and_payload_wait_for_more() {
        let mut codec = FrameCodec::new();

        let mut buf = BytesMut::from(&[0u8, 0][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        let mut buf = BytesMut::from(&[0u8, 0, 0, 8, 1, 2, 3][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 7);
    }

    #[test]
    fn oversized_length_prefix_is_rejected_before_allocation() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        buf.put_u32(u32::MAX);
        buf.extend_from_slice(&[0u8; 16]);

        assert!(matches!(
            codec.decode(&mut buf),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        codec.encode(b"one".to_vec(), &mut buf).unwrap();
        codec.encode(b"two".to_vec(), &mut buf).unwrap();

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"one");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"two");
    }
}
