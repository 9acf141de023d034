#![deny(unsafe_code)]

//! MQTT wire codec for v3.1, v3.1.1 and v5.0 with handshake-based version
//! negotiation.
//!
//! The entry point is [`MqttCodec`], a `tokio_util::codec` codec that
//! starts in version-detection mode, peeks at the CONNECT preamble, and is
//! then switched to the matching version-specific codec by the connection
//! layer. Decoding is incremental: the codec can be fed a single byte at a
//! time and yields a packet only once the full frame has arrived.

use tokio_util::codec::{Decoder, Encoder};

#[macro_use]
mod utils;

/// Error types for encoding/decoding operations
pub mod error;

/// Shared types and constants
pub mod types;

/// MQTT v3.1 / v3.1.1 protocol implementation
pub mod v3;

/// MQTT v5.0 protocol implementation
pub mod v5;

/// Protocol version detection and negotiation
pub mod version;

/// Version-dispatching MQTT codec.
#[derive(Debug)]
pub enum MqttCodec {
    /// MQTT v3 codec
    V3(v3::Codec),
    /// MQTT v5 codec
    V5(v5::Codec),
    /// Version detection codec, used during the initial handshake
    Version(version::VersionCodec),
}

/// A decoded packet of either protocol generation, or the version
/// detection result during the handshake.
#[derive(Debug)]
pub enum MqttPacket {
    V3(v3::Packet),
    V5(v5::Packet),
    Version(version::ProtocolVersion),
}

impl tokio_util::codec::Encoder<MqttPacket> for MqttCodec {
    type Error = error::EncodeError;

    #[inline]
    fn encode(&mut self, item: MqttPacket, dst: &mut bytes::BytesMut) -> Result<(), Self::Error> {
        match self {
            MqttCodec::V3(codec) => match item {
                MqttPacket::V3(p) => {
                    codec.encode(p, dst)?;
                }
                _ => return Err(error::EncodeError::MalformedPacket),
            },
            MqttCodec::V5(codec) => match item {
                MqttPacket::V5(p) => {
                    codec.encode(p, dst)?;
                }
                _ => return Err(error::EncodeError::MalformedPacket),
            },
            MqttCodec::Version(_) => return Err(error::EncodeError::UnsupportedVersion),
        };
        Ok(())
    }
}

impl tokio_util::codec::Decoder for MqttCodec {
    type Item = (MqttPacket, u32);
    type Error = error::DecodeError;

    fn decode(&mut self, src: &mut bytes::BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let p = match self {
            MqttCodec::V3(codec) => {
                codec.decode(src)?.map(|(p, remaining)| (MqttPacket::V3(p), remaining))
            }
            MqttCodec::V5(codec) => {
                codec.decode(src)?.map(|(p, remaining)| (MqttPacket::V5(p), remaining))
            }
            MqttCodec::Version(codec) => codec.decode(src)?.map(|v| (MqttPacket::Version(v), 0)),
        };
        Ok(p)
    }
}
