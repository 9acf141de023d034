use thiserror::Error;

/// Errors raised while parsing bytes off the wire.
#[derive(Debug, Error)]
pub enum DecodeError {
    /// Protocol name in CONNECT is not a known name/level triple
    #[error("protocol not supported")]
    InvalidProtocol,
    /// Protocol level byte does not match the protocol name
    #[error("unsupported protocol level")]
    UnsupportedProtocolLevel,
    /// A length prefix points past the end of the available data
    #[error("invalid length")]
    InvalidLength,
    /// Syntax violation: bad varint, bad flag combination, truncated field
    #[error("malformed packet")]
    MalformedPacket,
    /// A string field is not well-formed UTF-8 under the strict rules
    #[error("malformed utf-8 string")]
    MalformedUtf8,
    /// Reserved bit of the CONNECT flags byte is set
    #[error("connect reserved flag set")]
    ConnectReservedFlagSet,
    /// Reserved bits of the CONNACK flags byte are set
    #[error("connack reserved flag set")]
    ConnAckReservedFlagSet,
    /// Client id failed validation
    #[error("invalid client id")]
    InvalidClientId,
    /// First header byte carries an unknown packet type
    #[error("unsupported packet type")]
    UnsupportedPacketType,
    /// QoS > 0 publish without a packet id
    #[error("packet id is required")]
    PacketIdRequired,
    /// remaining_length exceeds the configured maximum packet size
    #[error("max size exceeded")]
    MaxSizeExceeded,
    /// Property identifier unknown or illegal for the enclosing packet type
    #[error("illegal property, id: {0}")]
    IllegalProperty(u32),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors raised while serializing a packet.
#[derive(Debug, Error)]
pub enum EncodeError {
    #[error("packet is bigger than peer's Maximum Packet Size")]
    OverMaxPacketSize,
    #[error("invalid length")]
    InvalidLength,
    #[error("malformed packet")]
    MalformedPacket,
    #[error("packet id is required")]
    PacketIdRequired,
    #[error("unsupported version")]
    UnsupportedVersion,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors which can occur during the mqtt connection handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("handshake timeout")]
    Timeout,
    #[error("peer is disconnected, error: {0:?}")]
    Disconnected(Option<std::io::Error>),
}

/// Post-handshake semantic violations.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    #[error("unexpected packet {0:?}, {1}")]
    Unexpected(u8, &'static str),
    #[error("protocol violation: {0}")]
    ProtocolViolation(&'static str),
    #[error("keepalive timeout")]
    KeepAliveTimeout,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum SendPacketError {
    /// Encoding failed
    #[error("encode error: {0}")]
    Encode(#[from] EncodeError),
    /// Disconnecting or disconnected
    #[error("packet is being dropped because the connection is closed")]
    Disconnected,
}

impl PartialEq for DecodeError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (DecodeError::InvalidProtocol, DecodeError::InvalidProtocol)
            | (DecodeError::UnsupportedProtocolLevel, DecodeError::UnsupportedProtocolLevel)
            | (DecodeError::InvalidLength, DecodeError::InvalidLength)
            | (DecodeError::MalformedPacket, DecodeError::MalformedPacket)
            | (DecodeError::MalformedUtf8, DecodeError::MalformedUtf8)
            | (DecodeError::ConnectReservedFlagSet, DecodeError::ConnectReservedFlagSet)
            | (DecodeError::ConnAckReservedFlagSet, DecodeError::ConnAckReservedFlagSet)
            | (DecodeError::InvalidClientId, DecodeError::InvalidClientId)
            | (DecodeError::UnsupportedPacketType, DecodeError::UnsupportedPacketType)
            | (DecodeError::PacketIdRequired, DecodeError::PacketIdRequired)
            | (DecodeError::MaxSizeExceeded, DecodeError::MaxSizeExceeded) => true,
            (DecodeError::IllegalProperty(a), DecodeError::IllegalProperty(b)) => a == b,
            (DecodeError::Io(_), _) | (_, DecodeError::Io(_)) => false,
            _ => false,
        }
    }
}
