//! MQTT v5 packet bodies and reason codes.

use std::num::NonZeroU16;

use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use super::Properties;
use crate::types::{Protocol, QoS};

prim_enum! {
    /// CONNACK reason codes
    #[derive(Deserialize, Serialize)]
    pub enum ConnectAckReason {
        Success = 0,
        UnspecifiedError = 128,
        MalformedPacket = 129,
        ProtocolError = 130,
        ImplementationSpecificError = 131,
        UnsupportedProtocolVersion = 132,
        ClientIdentifierNotValid = 133,
        BadUserNameOrPassword = 134,
        NotAuthorized = 135,
        ServerUnavailable = 136,
        ServerBusy = 137,
        Banned = 138,
        BadAuthenticationMethod = 140,
        TopicNameInvalid = 144,
        PacketTooLarge = 149,
        QuotaExceeded = 151,
        PayloadFormatInvalid = 153,
        RetainNotSupported = 154,
        QosNotSupported = 155,
        UseAnotherServer = 156,
        ServerMoved = 157,
        ConnectionRateExceeded = 159
    }
}

impl From<ConnectAckReason> for u8 {
    fn from(v: ConnectAckReason) -> Self {
        v as u8
    }
}

impl ConnectAckReason {
    pub fn is_success(self) -> bool {
        self == ConnectAckReason::Success
    }

    pub fn reason(self) -> &'static str {
        match self {
            ConnectAckReason::Success => "Connection Accepted",
            ConnectAckReason::UnspecifiedError => "Unspecified error",
            ConnectAckReason::MalformedPacket => "Malformed Packet",
            ConnectAckReason::ProtocolError => "Protocol Error",
            ConnectAckReason::ImplementationSpecificError => "Implementation specific error",
            ConnectAckReason::UnsupportedProtocolVersion => "Unsupported Protocol Version",
            ConnectAckReason::ClientIdentifierNotValid => "Client Identifier not valid",
            ConnectAckReason::BadUserNameOrPassword => "Bad User Name or Password",
            ConnectAckReason::NotAuthorized => "Not authorized",
            ConnectAckReason::ServerUnavailable => "Server unavailable",
            ConnectAckReason::ServerBusy => "Server busy",
            ConnectAckReason::Banned => "Banned",
            ConnectAckReason::BadAuthenticationMethod => "Bad authentication method",
            ConnectAckReason::TopicNameInvalid => "Topic Name invalid",
            ConnectAckReason::PacketTooLarge => "Packet too large",
            ConnectAckReason::QuotaExceeded => "Quota exceeded",
            ConnectAckReason::PayloadFormatInvalid => "Payload format invalid",
            ConnectAckReason::RetainNotSupported => "Retain not supported",
            ConnectAckReason::QosNotSupported => "QoS not supported",
            ConnectAckReason::UseAnotherServer => "Use another server",
            ConnectAckReason::ServerMoved => "Server moved",
            ConnectAckReason::ConnectionRateExceeded => "Connection rate exceeded",
        }
    }
}

prim_enum! {
    /// DISCONNECT reason codes
    #[derive(Deserialize, Serialize)]
    pub enum DisconnectReasonCode {
        NormalDisconnection = 0,
        DisconnectWithWillMessage = 4,
        UnspecifiedError = 128,
        MalformedPacket = 129,
        ProtocolError = 130,
        ImplementationSpecificError = 131,
        NotAuthorized = 135,
        ServerBusy = 137,
        ServerShuttingDown = 139,
        BadAuthenticationMethod = 140,
        KeepAliveTimeout = 141,
        SessionTakenOver = 142,
        TopicFilterInvalid = 143,
        TopicNameInvalid = 144,
        ReceiveMaximumExceeded = 147,
        TopicAliasInvalid = 148,
        PacketTooLarge = 149,
        MessageRateTooHigh = 150,
        QuotaExceeded = 151,
        AdministrativeAction = 152,
        PayloadFormatInvalid = 153,
        RetainNotSupported = 154,
        QosNotSupported = 155,
        UseAnotherServer = 156,
        ServerMoved = 157,
        SharedSubscriptionNotSupported = 158,
        ConnectionRateExceeded = 159,
        MaximumConnectTime = 160,
        SubscriptionIdentifiersNotSupported = 161,
        WildcardSubscriptionsNotSupported = 162
    }
}

impl From<DisconnectReasonCode> for u8 {
    fn from(v: DisconnectReasonCode) -> Self {
        v as u8
    }
}

/// Maps an error or reason value to the DISCONNECT reason code sent to the peer.
pub trait ToReasonCode {
    fn to_reason_code(&self) -> DisconnectReasonCode;
}

prim_enum! {
    /// PUBACK / PUBREC reason codes
    #[derive(Deserialize, Serialize)]
    pub enum PublishAckReason {
        Success = 0,
        NoMatchingSubscribers = 16,
        UnspecifiedError = 128,
        ImplementationSpecificError = 131,
        NotAuthorized = 135,
        TopicNameInvalid = 144,
        PacketIdentifierInUse = 145,
        QuotaExceeded = 151,
        PayloadFormatInvalid = 153
    }
}

impl From<PublishAckReason> for u8 {
    fn from(v: PublishAckReason) -> Self {
        v as u8
    }
}

impl PublishAckReason {
    /// Reason codes >= 0x80 signal that delivery has failed
    #[inline]
    pub fn is_failure(self) -> bool {
        self as u8 >= 0x80
    }
}

impl Default for PublishAckReason {
    fn default() -> Self {
        PublishAckReason::Success
    }
}

impl ToReasonCode for PublishAckReason {
    fn to_reason_code(&self) -> DisconnectReasonCode {
        match self {
            PublishAckReason::Success | PublishAckReason::NoMatchingSubscribers => {
                DisconnectReasonCode::NormalDisconnection
            }
            PublishAckReason::UnspecifiedError => DisconnectReasonCode::UnspecifiedError,
            PublishAckReason::ImplementationSpecificError => {
                DisconnectReasonCode::ImplementationSpecificError
            }
            PublishAckReason::NotAuthorized => DisconnectReasonCode::NotAuthorized,
            PublishAckReason::TopicNameInvalid => DisconnectReasonCode::TopicNameInvalid,
            PublishAckReason::PacketIdentifierInUse => DisconnectReasonCode::UnspecifiedError,
            PublishAckReason::QuotaExceeded => DisconnectReasonCode::QuotaExceeded,
            PublishAckReason::PayloadFormatInvalid => DisconnectReasonCode::PayloadFormatInvalid,
        }
    }
}

prim_enum! {
    /// PUBREL / PUBCOMP reason codes
    #[derive(Deserialize, Serialize)]
    pub enum PublishAck2Reason {
        Success = 0,
        PacketIdNotFound = 146
    }
}

impl From<PublishAck2Reason> for u8 {
    fn from(v: PublishAck2Reason) -> Self {
        v as u8
    }
}

impl Default for PublishAck2Reason {
    fn default() -> Self {
        PublishAck2Reason::Success
    }
}

prim_enum! {
    /// SUBACK reason codes
    #[derive(Deserialize, Serialize)]
    pub enum SubscribeAckReason {
        GrantedQos0 = 0,
        GrantedQos1 = 1,
        GrantedQos2 = 2,
        UnspecifiedError = 128,
        ImplementationSpecificError = 131,
        NotAuthorized = 135,
        TopicFilterInvalid = 143,
        PacketIdentifierInUse = 145,
        QuotaExceeded = 151,
        SharedSubscriptionNotSupported = 158,
        SubscriptionIdentifiersNotSupported = 161,
        WildcardSubscriptionsNotSupported = 162
    }
}

impl From<SubscribeAckReason> for u8 {
    fn from(v: SubscribeAckReason) -> Self {
        v as u8
    }
}

prim_enum! {
    /// UNSUBACK reason codes
    #[derive(Deserialize, Serialize)]
    pub enum UnsubscribeAckReason {
        Success = 0,
        NoSubscriptionExisted = 17,
        UnspecifiedError = 128,
        ImplementationSpecificError = 131,
        NotAuthorized = 135,
        TopicFilterInvalid = 143,
        PacketIdentifierInUse = 145
    }
}

impl From<UnsubscribeAckReason> for u8 {
    fn from(v: UnsubscribeAckReason) -> Self {
        v as u8
    }
}

/// Will message with its v5 property block.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct LastWill {
    pub qos: QoS,
    pub retain: bool,
    pub topic: ByteString,
    pub message: Bytes,
    pub properties: Properties,
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Connect {
    pub protocol: Protocol,
    pub clean_start: bool,
    pub keep_alive: u16,
    pub properties: Properties,
    pub client_id: ByteString,
    pub last_will: Option<LastWill>,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
}

impl Connect {
    /// Peer's session expiry request, 0 when absent.
    pub fn session_expiry_interval_secs(&self) -> u32 {
        self.properties.session_expiry_interval().unwrap_or(0)
    }

    pub fn receive_max(&self) -> Option<NonZeroU16> {
        self.properties.receive_maximum().and_then(NonZeroU16::new)
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct ConnectAck {
    /// Whether the server already holds session state for this client id
    pub session_present: bool,
    pub reason_code: ConnectAckReason,
    pub properties: Properties,
}

impl Default for ConnectAck {
    fn default() -> Self {
        ConnectAck {
            session_present: false,
            reason_code: ConnectAckReason::Success,
            properties: Properties::default(),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Disconnect {
    pub reason_code: DisconnectReasonCode,
    pub properties: Properties,
}

impl Default for Disconnect {
    fn default() -> Self {
        Disconnect {
            reason_code: DisconnectReasonCode::NormalDisconnection,
            properties: Properties::default(),
        }
    }
}

impl Disconnect {
    pub fn new(reason_code: DisconnectReasonCode) -> Self {
        Disconnect { reason_code, properties: Properties::default() }
    }
}

prim_enum! {
    /// How retained messages are handled at subscribe time
    #[derive(Deserialize, Serialize)]
    pub enum RetainHandling {
        AtSubscribe = 0,
        AtSubscribeNew = 1,
        NoAtSubscribe = 2
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize, Serialize)]
pub struct SubscriptionOptions {
    pub qos: QoS,
    /// Don't deliver the client's own messages back to it
    pub no_local: bool,
    pub retain_as_published: bool,
    pub retain_handling: RetainHandling,
}

impl Default for SubscriptionOptions {
    fn default() -> Self {
        SubscriptionOptions {
            qos: QoS::AtLeastOnce,
            no_local: false,
            retain_as_published: false,
            retain_handling: RetainHandling::AtSubscribe,
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Subscribe {
    pub packet_id: NonZeroU16,
    pub properties: Properties,
    pub topic_filters: Vec<(ByteString, SubscriptionOptions)>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct SubscribeAck {
    pub packet_id: NonZeroU16,
    pub properties: Properties,
    pub status: Vec<SubscribeAckReason>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct Unsubscribe {
    pub packet_id: NonZeroU16,
    pub properties: Properties,
    pub topic_filters: Vec<ByteString>,
}

#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct UnsubscribeAck {
    pub packet_id: NonZeroU16,
    pub properties: Properties,
    pub status: Vec<UnsubscribeAckReason>,
}

/// PUBACK / PUBREC body.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct PublishAck {
    pub packet_id: NonZeroU16,
    pub reason_code: PublishAckReason,
    pub properties: Properties,
}

impl PublishAck {
    pub fn new(packet_id: NonZeroU16) -> Self {
        PublishAck {
            packet_id,
            reason_code: PublishAckReason::Success,
            properties: Properties::default(),
        }
    }
}

/// PUBREL / PUBCOMP body.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize, Serialize)]
pub struct PublishAck2 {
    pub packet_id: NonZeroU16,
    pub reason_code: PublishAck2Reason,
    pub properties: Properties,
}

impl PublishAck2 {
    pub fn new(packet_id: NonZeroU16) -> Self {
        PublishAck2 {
            packet_id,
            reason_code: PublishAck2Reason::Success,
            properties: Properties::default(),
        }
    }
}
