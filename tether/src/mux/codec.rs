//! Wire frame shape and its codec.
//!
//! Every frame is `i64 channel id, u16 size, payload padded to a multiple
//! of 8`, big-endian. A zero size is the end-of-channel marker. The 9-byte
//! preamble is exchanged once per side before any frame.

use std::io;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Magic token each side sends as soon as the pipe is usable.
pub const PREAMBLE: [u8; 9] = *b"TETHER/1\n";

/// Reserved channel carrying control requests, issuer to executor.
pub const CONTROL_REQUEST_ID: i64 = -1;

/// Reserved channel carrying control replies, executor to issuer.
pub const CONTROL_REPLY_ID: i64 = -2;

const HEADER_LEN: usize = 10;

/// Payload length rounded up to the wire's 8-byte granularity.
pub const fn align(n: usize) -> usize {
    (n + 7) & !7
}

/// One multiplexed frame. An empty payload marks end-of-channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub channel_id: i64,
    pub payload: Bytes,
}

impl Frame {
    pub fn data(channel_id: i64, payload: Bytes) -> Self {
        Self {
            channel_id,
            payload,
        }
    }

    pub fn end_of_channel(channel_id: i64) -> Self {
        Self {
            channel_id,
            payload: Bytes::new(),
        }
    }

    pub fn is_end_of_channel(&self) -> bool {
        self.payload.is_empty()
    }
}

pub struct FrameCodec;

impl Encoder<Frame> for FrameCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let size = frame.payload.len();
        if size > u16::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame payload of {size} bytes exceeds the u16 size field"),
            ));
        }
        let padded = align(size);
        dst.reserve(HEADER_LEN + padded);
        dst.put_i64(frame.channel_id);
        dst.put_u16(size as u16);
        dst.put_slice(&frame.payload);
        dst.put_bytes(0, padded - size);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let size = u16::from_be_bytes([src[8], src[9]]) as usize;
        let padded = align(size);
        if src.len() < HEADER_LEN + padded {
            src.reserve(HEADER_LEN + padded - src.len());
            return Ok(None);
        }

        let mut header = src.split_to(HEADER_LEN);
        let channel_id = header.get_i64();
        let mut payload = src.split_to(padded);
        payload.truncate(size);
        Ok(Some(Frame {
            channel_id,
            payload: payload.freeze(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wire(frame: Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        FrameCodec.encode(frame, &mut buf).unwrap();
        buf
    }

    #[test]
    fn alignment_rounds_up_to_multiples_of_eight() {
        for (size, padded) in [
            (0usize, 0usize),
            (1, 8),
            (7, 8),
            (8, 8),
            (9, 16),
            (4096, 4096),
            (65535, 65536),
        ] {
            assert_eq!(align(size), padded, "align({size})");
        }
    }

    #[test]
    fn wire_length_is_header_plus_padded_payload() {
        for size in [0usize, 1, 7, 8, 9, 13, 255, 4096] {
            let buf = wire(Frame::data(42, Bytes::from(vec![0xAB; size])));
            assert_eq!(buf.len(), 10 + align(size), "size {size}");
        }
    }

    #[test]
    fn header_is_big_endian_id_then_size() {
        let buf = wire(Frame::data(-2, Bytes::from_static(b"hey")));
        assert_eq!(
            &buf[..8],
            &[0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFE]
        );
        assert_eq!(&buf[8..10], &[0x00, 0x03]);
        assert_eq!(&buf[10..13], b"hey");
        assert_eq!(&buf[13..], &[0, 0, 0, 0, 0]);
    }

    #[test]
    fn only_the_meaningful_bytes_survive_decode() {
        let mut buf = wire(Frame::data(9, Bytes::from_static(b"hello")));
        let frame = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.channel_id, 9);
        assert_eq!(&frame.payload[..], b"hello");
        assert!(buf.is_empty(), "decoder must consume the padding");
    }

    #[test]
    fn zero_size_decodes_as_end_of_channel() {
        let mut buf = wire(Frame::end_of_channel(7));
        let frame = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert!(frame.is_end_of_channel());
        assert_eq!(frame.channel_id, 7);
    }

    #[test]
    fn partial_frames_wait_for_more_bytes() {
        let full = wire(Frame::data(3, Bytes::from_static(b"0123456789")));
        for cut in [1, 9, 10, 12, full.len() - 1] {
            let mut partial = BytesMut::from(&full[..cut]);
            assert!(
                FrameCodec.decode(&mut partial).unwrap().is_none(),
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buf = wire(Frame::data(1, Bytes::from_static(b"first")));
        buf.extend_from_slice(&wire(Frame::data(2, Bytes::from_static(b"second"))));
        buf.extend_from_slice(&wire(Frame::end_of_channel(1)));

        let a = FrameCodec.decode(&mut buf).unwrap().unwrap();
        let b = FrameCodec.decode(&mut buf).unwrap().unwrap();
        let c = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!((a.channel_id, &a.payload[..]), (1, &b"first"[..]));
        assert_eq!((b.channel_id, &b.payload[..]), (2, &b"second"[..]));
        assert!(c.is_end_of_channel());
        assert!(FrameCodec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn largest_frame_round_trips() {
        let payload = Bytes::from(vec![0x5A; u16::MAX as usize]);
        let mut buf = wire(Frame::data(i64::MAX, payload.clone()));
        assert_eq!(buf.len(), 10 + align(u16::MAX as usize));
        let frame = FrameCodec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(frame.payload, payload);
    }

    #[test]
    fn oversized_payload_is_rejected_at_encode() {
        let mut buf = BytesMut::new();
        let frame = Frame::data(1, Bytes::from(vec![0; u16::MAX as usize + 1]));
        assert!(FrameCodec.encode(frame, &mut buf).is_err());
    }
}
