use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::error::{DecodeError, EncodeError};
use crate::types::{packet_type, MQISDP, MQTT, MQTT_LEVEL_31, MQTT_LEVEL_311, MQTT_LEVEL_5};
use crate::utils;

/// Supported protocol generations.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ProtocolVersion {
    /// MQTT v3.1 or v3.1.1
    MQTT3,
    /// MQTT v5.0
    MQTT5,
}

/// Peeks at the CONNECT preamble (name + level byte) without consuming it,
/// so the connection can be handed the matching version codec. Any first
/// packet other than CONNECT is a protocol error.
#[derive(Debug)]
pub struct VersionCodec;

impl Decoder for VersionCodec {
    type Item = ProtocolVersion;
    type Error = DecodeError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let len = src.len();
        if len < 2 {
            return Ok(None);
        }

        let src_slice = src.as_ref();
        let first_byte = src_slice[0];
        match utils::decode_variable_length(&src_slice[1..])? {
            Some((_, mut consumed)) => {
                consumed += 1;

                if first_byte != packet_type::CONNECT {
                    return Err(DecodeError::UnsupportedPacketType);
                }
                if len <= consumed + 6 {
                    return Ok(None);
                }

                let protocol_len = u16::from_be_bytes(
                    src[consumed..consumed + 2]
                        .try_into()
                        .map_err(|_| DecodeError::InvalidProtocol)?,
                ) as usize;

                ensure!(protocol_len == 4 || protocol_len == 6, DecodeError::InvalidProtocol);
                if len <= consumed + 2 + protocol_len {
                    return Ok(None);
                }
                ensure!(
                    (protocol_len == 4 && &src[consumed + 2..consumed + 6] == MQTT)
                        || (protocol_len == 6 && &src[consumed + 2..consumed + 8] == MQISDP),
                    DecodeError::InvalidProtocol
                );

                match src[consumed + 2 + protocol_len] {
                    MQTT_LEVEL_31 | MQTT_LEVEL_311 => Ok(Some(ProtocolVersion::MQTT3)),
                    MQTT_LEVEL_5 => Ok(Some(ProtocolVersion::MQTT5)),
                    _ => Err(DecodeError::InvalidProtocol),
                }
            }
            None => Ok(None),
        }
    }
}

impl Encoder<ProtocolVersion> for VersionCodec {
    type Error = EncodeError;

    /// Only decoding is meaningful during version detection.
    fn encode(&mut self, _: ProtocolVersion, _: &mut BytesMut) -> Result<(), Self::Error> {
        Err(EncodeError::UnsupportedVersion)
    }
}
