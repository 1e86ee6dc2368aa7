//! Framed codec gluing [`Packet`] to a byte stream.
//!
//! Frames are newline-delimited JSON tuples. The codec only handles
//! framing and length enforcement; packet-level validation lives in
//! [`crate::packet`]. Used through `tokio_util::codec::Framed`.
//!
//! A structurally invalid frame is not a stream error: `Framed` fuses
//! its stream after any `Decoder::Error`, which would turn one bad
//! frame into a dead connection. The decoder therefore yields
//! [`Frame::Malformed`] in-band and reserves the error type for
//! genuine I/O faults.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::packet::{decode_packet, encode_packet, Packet};
use crate::types::JstpError;

/// Upper bound on a single frame, delimiter included.
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

const DELIMITER: u8 = b'\n';

/// One decoded frame. Malformed frames are consumed from the buffer
/// and reported in-band so the connection can drop them and keep
/// reading.
#[derive(Debug)]
pub enum Frame {
    Packet(Packet),
    Malformed(String),
}

/// Newline-delimited JSON packet codec.
#[derive(Debug, Clone)]
pub struct JstpPacketCodec {
    max_packet_size: usize,
}

impl JstpPacketCodec {
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for JstpPacketCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE)
    }
}

impl Decoder for JstpPacketCodec {
    type Item = Frame;
    type Error = JstpError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, JstpError> {
        let Some(pos) = src.iter().position(|&b| b == DELIMITER) else {
            if src.len() > self.max_packet_size {
                // Discard the oversized prefix so the connection can
                // resynchronize at the next delimiter.
                src.clear();
                return Ok(Some(Frame::Malformed(format!(
                    "frame exceeds {} bytes",
                    self.max_packet_size
                ))));
            }
            return Ok(None);
        };

        if pos > self.max_packet_size {
            src.advance(pos + 1);
            return Ok(Some(Frame::Malformed(format!(
                "frame exceeds {} bytes",
                self.max_packet_size
            ))));
        }

        let frame = src.split_to(pos + 1);
        let body = &frame[..pos];
        if body.is_empty() {
            // Stray delimiter, skip it.
            return self.decode(src);
        }

        match decode_packet(body) {
            Ok(packet) => Ok(Some(Frame::Packet(packet))),
            Err(JstpError::MalformedPacket(reason)) => Ok(Some(Frame::Malformed(reason))),
            Err(other) => Ok(Some(Frame::Malformed(other.to_string()))),
        }
    }
}

impl Encoder<Packet> for JstpPacketCodec {
    type Error = JstpError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), JstpError> {
        let bytes = encode_packet(&packet);
        dst.reserve(bytes.len() + 1);
        dst.put_slice(&bytes);
        dst.put_u8(DELIMITER);
        Ok(())
    }
}
