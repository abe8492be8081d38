//! `tokio_util` framing adapter over [`protocol::decode`].
//!
//! The pure decoder reports how many bytes a packet used; this adapter drops
//! them from the read buffer and otherwise leaves partial packets in place so
//! `Framed` keeps reading until one completes.

use bytes::BytesMut;
use protocol::{Decoded, Packet, ProtocolError, DEFAULT_MAX_PACKET_SIZE};
use thiserror::Error;
use tokio_util::codec::{Decoder, Encoder};

/// Failure while reading or writing framed packets.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Length-framed packet codec for one socket.
#[derive(Debug, Clone, Copy)]
pub struct PacketCodec {
    max_packet_size: usize,
}

impl PacketCodec {
    /// Rejects packets whose body exceeds `max_packet_size` bytes.
    pub fn new(max_packet_size: usize) -> Self {
        Self { max_packet_size }
    }
}

impl Default for PacketCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PACKET_SIZE)
    }
}

impl Decoder for PacketCodec {
    type Item = Packet;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Packet>, CodecError> {
        match protocol::decode(&src[..], self.max_packet_size)? {
            Decoded::NeedMoreData => Ok(None),
            Decoded::Packet { packet, consumed } => {
                let _ = src.split_to(consumed);
                Ok(Some(packet))
            }
        }
    }
}

impl Encoder<Packet> for PacketCodec {
    type Error = CodecError;

    fn encode(&mut self, packet: Packet, dst: &mut BytesMut) -> Result<(), CodecError> {
        dst.extend_from_slice(&packet.encode());
        Ok(())
    }
}
