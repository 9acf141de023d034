//! MQTT v5 protocol codec

#[allow(clippy::module_inception)]
mod codec;
mod packet;
mod property;
pub(crate) mod wire;

use crate::types::packet_type;

pub use self::codec::Codec;
pub use self::packet::{
    Connect, ConnectAck, ConnectAckReason, Disconnect, DisconnectReasonCode, LastWill,
    PublishAck, PublishAck2, PublishAck2Reason, PublishAckReason, RetainHandling, Subscribe,
    SubscribeAck, SubscribeAckReason, SubscriptionOptions, ToReasonCode, Unsubscribe,
    UnsubscribeAck, UnsubscribeAckReason,
};
pub use self::property::{ctx, pid, Properties, PropertyValue};
pub use crate::types::{ConnectAckFlags, ConnectFlags, Publish, QoS};

/// MQTT v5 control packets
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Packet {
    Connect(Box<Connect>),
    ConnectAck(Box<ConnectAck>),
    Publish(Publish),
    PublishAck(PublishAck),
    /// Assured delivery part 1
    PublishReceived(PublishAck),
    /// Assured delivery part 2
    PublishRelease(PublishAck2),
    /// Assured delivery part 3
    PublishComplete(PublishAck2),
    Subscribe(Subscribe),
    SubscribeAck(SubscribeAck),
    Unsubscribe(Unsubscribe),
    UnsubscribeAck(UnsubscribeAck),
    PingRequest,
    PingResponse,
    Disconnect(Disconnect),
}

impl From<Connect> for Packet {
    fn from(val: Connect) -> Packet {
        Packet::Connect(Box::new(val))
    }
}

impl From<Publish> for Packet {
    fn from(val: Publish) -> Packet {
        Packet::Publish(val)
    }
}

impl Packet {
    pub fn packet_type(&self) -> u8 {
        match self {
            Packet::Connect(_) => packet_type::CONNECT,
            Packet::ConnectAck(_) => packet_type::CONNACK,
            Packet::Publish(_) => packet_type::PUBLISH_START,
            Packet::PublishAck(_) => packet_type::PUBACK,
            Packet::PublishReceived(_) => packet_type::PUBREC,
            Packet::PublishRelease(_) => packet_type::PUBREL,
            Packet::PublishComplete(_) => packet_type::PUBCOMP,
            Packet::Subscribe(_) => packet_type::SUBSCRIBE,
            Packet::SubscribeAck(_) => packet_type::SUBACK,
            Packet::Unsubscribe(_) => packet_type::UNSUBSCRIBE,
            Packet::UnsubscribeAck(_) => packet_type::UNSUBACK,
            Packet::PingRequest => packet_type::PINGREQ,
            Packet::PingResponse => packet_type::PINGRESP,
            Packet::Disconnect(_) => packet_type::DISCONNECT,
        }
    }
}
