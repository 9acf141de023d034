use std::num::NonZeroU16;

use bytestring::ByteString;

use fluxmq_codec::error::{
    DecodeError, EncodeError, HandshakeError, ProtocolError, SendPacketError,
};
use fluxmq_codec::v5::{DisconnectReasonCode, PublishAckReason, ToReasonCode};

#[derive(Debug, thiserror::Error)]
pub enum MqttError {
    /// Handshake error
    #[error("Mqtt handshake error: {}", _0)]
    Handshake(#[from] HandshakeError),
    #[error("Mqtt protocol error: {}", _0)]
    Protocol(#[from] ProtocolError),
    /// MQTT decoding error
    #[error("Decoding error: {0:?}")]
    Decode(#[from] DecodeError),
    /// MQTT encoding error
    #[error("Encoding error: {0:?}")]
    Encode(#[from] EncodeError),
    /// Send packet error
    #[error("Mqtt send packet error: {}", _0)]
    SendPacket(#[from] SendPacketError),
    /// Read timeout
    #[error("Read timeout")]
    ReadTimeout,
    /// Write timeout
    #[error("Write timeout")]
    WriteTimeout,
    /// Flush timeout
    #[error("Flush timeout")]
    FlushTimeout,
    /// Close timeout
    #[error("Close timeout")]
    CloseTimeout,
    #[error("{1}")]
    PublishAckReason(PublishAckReason, ByteString),
    #[error("service unavailable")]
    ServiceUnavailable,
    #[error("invalid protocol")]
    InvalidProtocol,
    #[error("too many topic levels")]
    TooManyTopicLevels,
    #[error("identifier rejected")]
    IdentifierRejected,
    #[error("Provided packet id is in use")]
    PacketIdInUse(NonZeroU16),
}

impl ToReasonCode for MqttError {
    fn to_reason_code(&self) -> DisconnectReasonCode {
        match self {
            MqttError::Handshake(HandshakeError::Timeout) => {
                DisconnectReasonCode::MaximumConnectTime
            }
            MqttError::Handshake(_) => DisconnectReasonCode::ProtocolError,
            MqttError::Protocol(ProtocolError::KeepAliveTimeout) => {
                DisconnectReasonCode::KeepAliveTimeout
            }
            MqttError::Protocol(_) => DisconnectReasonCode::ProtocolError,
            MqttError::Decode(DecodeError::MaxSizeExceeded) => DisconnectReasonCode::PacketTooLarge,
            MqttError::Decode(_) => DisconnectReasonCode::MalformedPacket,
            MqttError::Encode(EncodeError::OverMaxPacketSize) => {
                DisconnectReasonCode::PacketTooLarge
            }
            MqttError::Encode(_) => DisconnectReasonCode::MalformedPacket,
            MqttError::SendPacket(_) => DisconnectReasonCode::UnspecifiedError,
            MqttError::ReadTimeout
            | MqttError::WriteTimeout
            | MqttError::FlushTimeout
            | MqttError::CloseTimeout => DisconnectReasonCode::KeepAliveTimeout,
            MqttError::PublishAckReason(reason, _) => reason.to_reason_code(),
            MqttError::ServiceUnavailable => DisconnectReasonCode::ServerBusy,
            MqttError::InvalidProtocol => DisconnectReasonCode::ProtocolError,
            MqttError::TooManyTopicLevels => DisconnectReasonCode::TopicNameInvalid,
            MqttError::IdentifierRejected => DisconnectReasonCode::NotAuthorized,
            MqttError::PacketIdInUse(_) => DisconnectReasonCode::UnspecifiedError,
        }
    }
}
