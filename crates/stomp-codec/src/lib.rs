//! STOMP 1.2 framing.
//!
//! The realtime channel speaks broker-style STOMP over a WebSocket: one
//! WebSocket message carries one frame, or a bare EOL heart-beat. This crate
//! only knows about frames; connection management lives in `barter-realtime`.

pub mod codec;
pub mod error;
pub mod frame;

pub use crate::{
    codec::StompCodec,
    error::StompError,
    frame::{Command, Frame, Packet},
};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Encode a single packet into a fresh buffer.
pub fn encode_packet(packet: Packet) -> Result<BytesMut, StompError> {
    let mut codec = StompCodec::default();
    let mut dst = BytesMut::new();
    Encoder::<Packet>::encode(&mut codec, packet, &mut dst)?;
    Ok(dst)
}

/// Decode exactly one packet from a complete message payload.
///
/// Trailing EOLs after the frame terminator are tolerated, anything else is
/// reported as a protocol error.
pub fn decode_packet(payload: &[u8]) -> Result<Packet, StompError> {
    let mut codec = StompCodec::default();
    let mut src = BytesMut::from(payload);
    let packet = codec.decode(&mut src)?.ok_or(StompError::Incomplete)?;
    if src.iter().any(|b| !matches!(b, b'\n' | b'\r')) {
        return Err(StompError::TrailingData(src.len()));
    }
    Ok(packet)
}
