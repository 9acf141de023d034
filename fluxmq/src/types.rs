use std::time::Duration;

use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use fluxmq_codec::v5::{Disconnect as DisconnectV5, DisconnectReasonCode, ToReasonCode};

pub type ClientId = ByteString;
pub type TopicName = ByteString;
pub type PacketId = u16;
pub type TimestampMillis = i64;

pub type Publish = fluxmq_codec::types::Publish;
pub type QoS = fluxmq_codec::types::QoS;

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    chrono::Local::now().timestamp_millis()
}

/// Identity of a connected (or previously connected) client.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Id {
    pub client_id: ClientId,
    pub username: Option<ByteString>,
}

impl Id {
    #[inline]
    pub fn new(client_id: ClientId, username: Option<ByteString>) -> Self {
        Self { client_id, username }
    }
}

impl std::fmt::Display for Id {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.client_id)
    }
}

/// Origin of an application message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum From {
    Client(Id),
    LastWill(Id),
    System,
}

impl From {
    #[inline]
    pub fn id(&self) -> Option<&Id> {
        match self {
            From::Client(id) | From::LastWill(id) => Some(id),
            From::System => None,
        }
    }
}

/// Received DISCONNECT, version-tagged.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Disconnect {
    V3,
    V5(DisconnectV5),
}

impl Disconnect {
    /// MQTT5 session expiry override carried in DISCONNECT.
    #[inline]
    pub fn session_expiry_interval(&self) -> Option<Duration> {
        match self {
            Disconnect::V3 => None,
            Disconnect::V5(d) => d
                .properties
                .session_expiry_interval()
                .map(|secs| Duration::from_secs(secs as u64)),
        }
    }
}

/// Why a session terminated or a message was dropped.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum Reason {
    #[error("connect keepalive timeout")]
    ConnectKeepaliveTimeout,
    #[error("connection closed by remote")]
    ConnectRemoteClose,
    #[error("kicked by new connection")]
    ConnectKicked,
    #[error("disconnect received")]
    ConnectDisconnect(Option<Disconnect>),
    #[error("message queue is full")]
    MessageQueueFull,
    #[error("message expired")]
    MessageExpiration,
    #[error("inflight window is full")]
    InflightWindowFull,
    #[error("packet is too large for the peer")]
    OversizePacket,
    #[error("session expired")]
    SessionExpiration,
    #[error("delivery failed, reason code {0}")]
    DeliveryFailed(u8),
    #[error("protocol error: {0}")]
    ProtocolError(ByteString),
    #[error("{0}")]
    Error(ByteString),
}

impl std::convert::From<&str> for Reason {
    fn from(s: &str) -> Self {
        Reason::Error(ByteString::from(s.to_owned()))
    }
}

impl std::convert::From<String> for Reason {
    fn from(s: String) -> Self {
        Reason::Error(ByteString::from(s))
    }
}

impl ToReasonCode for Reason {
    fn to_reason_code(&self) -> DisconnectReasonCode {
        match self {
            Reason::ConnectKeepaliveTimeout => DisconnectReasonCode::KeepAliveTimeout,
            Reason::ConnectRemoteClose => DisconnectReasonCode::NormalDisconnection,
            Reason::ConnectKicked => DisconnectReasonCode::SessionTakenOver,
            Reason::ConnectDisconnect(_) => DisconnectReasonCode::NormalDisconnection,
            Reason::MessageQueueFull | Reason::InflightWindowFull => {
                DisconnectReasonCode::QuotaExceeded
            }
            Reason::MessageExpiration => DisconnectReasonCode::NormalDisconnection,
            Reason::OversizePacket => DisconnectReasonCode::PacketTooLarge,
            Reason::SessionExpiration => DisconnectReasonCode::NormalDisconnection,
            Reason::DeliveryFailed(_) => DisconnectReasonCode::ImplementationSpecificError,
            Reason::ProtocolError(_) => DisconnectReasonCode::ProtocolError,
            Reason::Error(_) => DisconnectReasonCode::UnspecifiedError,
        }
    }
}

/// Mailbox messages for a running session task.
#[derive(Debug)]
pub enum Message {
    /// An application message to deliver on this connection
    Forward(From, Publish),
    /// A new connection with the same client id is taking over;
    /// reply on the sender once the old session has stepped aside
    Kick(tokio::sync::oneshot::Sender<()>, Id, bool),
}
