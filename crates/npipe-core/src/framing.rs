//! Length-prefixed frame codec.
//!
//! ```text
//! +----------------------------+------------------+
//! | Length (4 bytes, BE)       | Payload          |
//! +----------------------------+------------------+
//! ```
//!
//! One frame carries exactly one logical message, so a message is never
//! split or merged by the byte-stream transport. The declared length is
//! checked against the limit before any payload is buffered. Zero-length
//! frames are valid and decode to an empty payload.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{ProtocolError, MAX_FRAME_SIZE};

/// Size of the big-endian length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Codec for `u32` length-prefixed frames with a configurable size limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_frame_size: usize,
}

impl FrameCodec {
    /// Create a codec with the given maximum payload size.
    ///
    /// The limit is clamped to [`MAX_FRAME_SIZE`].
    #[must_use]
    pub fn new(max_frame_size: usize) -> Self {
        Self {
            max_frame_size: max_frame_size.min(MAX_FRAME_SIZE),
        }
    }

    /// Returns the current maximum payload size.
    #[must_use]
    pub const fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    /// Change the maximum payload size, e.g. after admission negotiated a
    /// different limit than the one used for the admission frame.
    pub fn set_max_frame_size(&mut self, max_frame_size: usize) {
        self.max_frame_size = max_frame_size.min(MAX_FRAME_SIZE);
    }
}

impl Decoder for FrameCodec {
    type Error = ProtocolError;
    type Item = BytesMut;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }

        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&src[..LENGTH_PREFIX_SIZE]);
        let len = u32::from_be_bytes(prefix) as usize;

        if len > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(len, self.max_frame_size));
        }

        if src.len() < LENGTH_PREFIX_SIZE + len {
            src.reserve(LENGTH_PREFIX_SIZE + len - src.len());
            return Ok(None);
        }

        src.advance(LENGTH_PREFIX_SIZE);
        Ok(Some(src.split_to(len)))
    }

    /// A stream that ends inside a frame means the peer went away mid-send.
    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None if src.is_empty() => Ok(None),
            None => Err(ProtocolError::ConnectionClosed),
        }
    }
}

impl Encoder<Bytes> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Bytes, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if item.len() > self.max_frame_size {
            return Err(ProtocolError::frame_too_large(
                item.len(),
                self.max_frame_size,
            ));
        }

        #[allow(clippy::cast_possible_truncation)] // bounded by MAX_FRAME_SIZE
        let len = item.len() as u32;
        dst.reserve(LENGTH_PREFIX_SIZE + item.len());
        dst.put_u32(len);
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(codec: &mut FrameCodec, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        codec
            .encode(Bytes::copy_from_slice(payload), &mut buf)
            .unwrap();
        buf
    }

    #[test]
    fn test_encode_layout() {
        let mut codec = FrameCodec::new(64);
        let buf = encode(&mut codec, b"hello");

        assert_eq!(&buf[..4], &[0, 0, 0, 5]);
        assert_eq!(&buf[4..], b"hello");
    }

    #[test]
    fn test_decode_waits_for_full_frame() {
        let mut codec = FrameCodec::new(64);
        let full = encode(&mut codec, b"partial read");

        let mut buf = BytesMut::from(&full[..7]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&full[7..]);
        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&frame[..], b"partial read");
        assert!(buf.is_empty());
    }

    #[test]
    fn test_eof_inside_frame_is_connection_closed() {
        let mut codec = FrameCodec::new(64);
        let full = encode(&mut codec, b"cut short");

        let mut buf = BytesMut::from(&full[..6]);
        let err = codec.decode_eof(&mut buf).unwrap_err();
        assert!(err.is_disconnect());

        let mut empty = BytesMut::new();
        assert!(codec.decode_eof(&mut empty).unwrap().is_none());
    }

    #[test]
    fn test_decode_two_frames_in_one_read() {
        let mut codec = FrameCodec::new(64);
        let mut buf = encode(&mut codec, b"first");
        buf.extend_from_slice(&encode(&mut codec, b"second"));

        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"first");
        assert_eq!(&codec.decode(&mut buf).unwrap().unwrap()[..], b"second");
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_empty_frame() {
        let mut codec = FrameCodec::new(64);
        let mut buf = encode(&mut codec, b"");
        assert_eq!(buf.len(), LENGTH_PREFIX_SIZE);

        let frame = codec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_empty());
    }

    #[test]
    fn test_oversized_length_rejected_before_payload() {
        let mut codec = FrameCodec::new(16);
        let mut buf = BytesMut::new();
        buf.put_u32(1_000_000);

        let err = codec.decode(&mut buf).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::FrameTooLarge {
                size: 1_000_000,
                max: 16
            }
        ));
    }

    #[test]
    fn test_oversized_payload_rejected_on_encode() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        let err = codec
            .encode(Bytes::from_static(b"too long"), &mut buf)
            .unwrap_err();
        assert!(err.is_protocol_violation());
        assert!(buf.is_empty());
    }

    #[test]
    fn test_limit_clamped_and_adjustable() {
        let mut codec = FrameCodec::new(usize::MAX);
        assert_eq!(codec.max_frame_size(), MAX_FRAME_SIZE);

        codec.set_max_frame_size(128);
        assert_eq!(codec.max_frame_size(), 128);
    }
}
