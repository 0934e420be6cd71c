//! `tokio_util::codec` framing for the 12-byte-header wire protocol
//! (spec §6).
//!
//! One raw frame at a time: decode waits for a full header, then for
//! `header.length` payload bytes, exactly matching spec §5's "no
//! operation holds the loop longer than decoding one frame".

use bytes::{Buf, BufMut, BytesMut};
use opencluster_core::{Header, HEADER_LEN};
use tokio_util::codec::{Decoder, Encoder};

use crate::error::DispatchError;

/// A decoded frame: header plus its raw payload bytes, not yet parsed
/// into a [`crate::dispatch::Message`].
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: Header,
    pub payload: Vec<u8>,
}

impl Frame {
    #[must_use]
    pub fn new(header: Header, payload: Vec<u8>) -> Self {
        Self { header, payload }
    }
}

/// Maximum payload length accepted from the wire, guarding against a
/// corrupt or hostile length prefix causing unbounded buffering.
pub const MAX_PAYLOAD_LEN: u32 = 16 * 1024 * 1024;

/// `Decoder`/`Encoder` pair for [`Frame`]. Stateless aside from the
/// in-flight partial header/payload `tokio_util` already buffers for us.
#[derive(Debug, Default)]
pub struct FrameCodec;

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = DispatchError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, DispatchError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let header = Header::decode(&src[..HEADER_LEN])
            .map_err(|e| DispatchError::MalformedFrame(e.to_string()))?;
        if header.length > MAX_PAYLOAD_LEN {
            return Err(DispatchError::MalformedFrame(format!(
                "payload length {} exceeds maximum {}",
                header.length, MAX_PAYLOAD_LEN
            )));
        }
        let total = HEADER_LEN + header.length as usize;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(HEADER_LEN);
        let payload = src.split_to(header.length as usize).to_vec();
        Ok(Some(Frame::new(header, payload)))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = DispatchError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), DispatchError> {
        dst.reserve(HEADER_LEN + frame.payload.len());
        dst.put_slice(&frame.header.encode());
        dst.put_slice(&frame.payload);
        Ok(())
    }
}

/// Encodes a frame as the raw bytes to write to a socket: header
/// followed by payload (spec §6). Used by the main read/dispatch/write
/// loop and by migration code that pushes extra outbound frames outside
/// of a request/reply pair.
#[must_use]
pub fn encode_frame(frame: Frame) -> Vec<u8> {
    let mut buf = Vec::with_capacity(HEADER_LEN + frame.payload.len());
    buf.extend_from_slice(&frame.header.encode());
    buf.extend_from_slice(&frame.payload);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;
    use opencluster_core::command;

    #[test]
    fn decode_waits_for_a_full_header() {
        let mut codec = FrameCodec;
        let mut buf = BytesMut::from(&[0u8; 4][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn encode_then_decode_round_trips_a_frame() {
        let mut codec = FrameCodec;
        let header = Header::request(command::PING, 7, 3);
        let frame = Frame::new(header, vec![1, 2, 3]);

        let mut buf = BytesMut::new();
        codec.encode(frame.clone(), &mut buf).unwrap();

        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(decoded.header, frame.header);
        assert_eq!(decoded.payload, frame.payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn decode_waits_for_full_payload() {
        let mut codec = FrameCodec;
        let header = Header::request(command::PING, 1, 5);
        let mut buf = BytesMut::new();
        buf.put_slice(&header.encode());
        buf.put_slice(&[1, 2]); // only 2 of 5 payload bytes
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_length_prefix_is_rejected() {
        let mut codec = FrameCodec;
        let header = Header::request(command::PING, 1, MAX_PAYLOAD_LEN + 1);
        let mut buf = BytesMut::new();
        buf.put_slice(&header.encode());
        assert!(codec.decode(&mut buf).is_err());
    }
}
