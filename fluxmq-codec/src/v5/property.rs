//! MQTT5 property lists.
//!
//! Properties are held generically as `(identifier, value)` pairs and
//! checked against a static contract table: each identifier maps to its
//! wire type, the set of packet types it may appear in, and whether it may
//! repeat. The check runs once at decode/encode entry.

use std::num::NonZeroU32;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

use crate::error::{DecodeError, EncodeError};
use crate::utils::{
    decode_variable_length_cursor, take_properties, var_int_len, write_variable_length, Decode,
    Encode,
};

/// Property identifiers.
pub mod pid {
    pub const PAYLOAD_FORMAT_INDICATOR: u32 = 0x01;
    pub const MESSAGE_EXPIRY_INTERVAL: u32 = 0x02;
    pub const CONTENT_TYPE: u32 = 0x03;
    pub const RESPONSE_TOPIC: u32 = 0x08;
    pub const CORRELATION_DATA: u32 = 0x09;
    pub const SUBSCRIPTION_IDENTIFIER: u32 = 0x0B;
    pub const SESSION_EXPIRY_INTERVAL: u32 = 0x11;
    pub const ASSIGNED_CLIENT_IDENTIFIER: u32 = 0x12;
    pub const SERVER_KEEP_ALIVE: u32 = 0x13;
    pub const AUTHENTICATION_METHOD: u32 = 0x15;
    pub const AUTHENTICATION_DATA: u32 = 0x16;
    pub const REQUEST_PROBLEM_INFORMATION: u32 = 0x17;
    pub const WILL_DELAY_INTERVAL: u32 = 0x18;
    pub const REQUEST_RESPONSE_INFORMATION: u32 = 0x19;
    pub const RESPONSE_INFORMATION: u32 = 0x1A;
    pub const SERVER_REFERENCE: u32 = 0x1C;
    pub const REASON_STRING: u32 = 0x1F;
    pub const RECEIVE_MAXIMUM: u32 = 0x21;
    pub const TOPIC_ALIAS_MAXIMUM: u32 = 0x22;
    pub const TOPIC_ALIAS: u32 = 0x23;
    pub const MAXIMUM_QOS: u32 = 0x24;
    pub const RETAIN_AVAILABLE: u32 = 0x25;
    pub const USER_PROPERTY: u32 = 0x26;
    pub const MAXIMUM_PACKET_SIZE: u32 = 0x27;
    pub const WILDCARD_SUBSCRIPTION_AVAILABLE: u32 = 0x28;
    pub const SUBSCRIPTION_IDENTIFIERS_AVAILABLE: u32 = 0x29;
    pub const SHARED_SUBSCRIPTION_AVAILABLE: u32 = 0x2A;
}

/// One bit per enclosing context a property may legally appear in. The
/// will-properties block inside CONNECT counts as its own context.
pub mod ctx {
    pub const CONNECT: u16 = 1 << 0;
    pub const CONNACK: u16 = 1 << 1;
    pub const PUBLISH: u16 = 1 << 2;
    pub const PUBACK: u16 = 1 << 3;
    pub const PUBREC: u16 = 1 << 4;
    pub const PUBREL: u16 = 1 << 5;
    pub const PUBCOMP: u16 = 1 << 6;
    pub const SUBSCRIBE: u16 = 1 << 7;
    pub const SUBACK: u16 = 1 << 8;
    pub const UNSUBSCRIBE: u16 = 1 << 9;
    pub const UNSUBACK: u16 = 1 << 10;
    pub const DISCONNECT: u16 = 1 << 11;
    pub const WILL: u16 = 1 << 12;

    pub(crate) const ACKS: u16 =
        PUBACK | PUBREC | PUBREL | PUBCOMP | SUBACK | UNSUBACK | CONNACK | DISCONNECT;
    pub(crate) const ALL: u16 = 0x1FFF;
}

/// Wire type of a property value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kind {
    Byte,
    U16,
    U32,
    VarInt,
    Binary,
    Utf8,
    Pair,
}

struct Contract {
    kind: Kind,
    legal: u16,
    repeatable: bool,
}

const fn contract(id: u32) -> Option<Contract> {
    use ctx::*;
    use Kind::*;
    let (kind, legal, repeatable) = match id {
        pid::PAYLOAD_FORMAT_INDICATOR => (Byte, PUBLISH | WILL, false),
        pid::MESSAGE_EXPIRY_INTERVAL => (U32, PUBLISH | WILL, false),
        pid::CONTENT_TYPE => (Utf8, PUBLISH | WILL, false),
        pid::RESPONSE_TOPIC => (Utf8, PUBLISH | WILL, false),
        pid::CORRELATION_DATA => (Binary, PUBLISH | WILL, false),
        // an outbound PUBLISH may carry one id per matched subscription
        pid::SUBSCRIPTION_IDENTIFIER => (VarInt, PUBLISH | SUBSCRIBE, true),
        pid::SESSION_EXPIRY_INTERVAL => (U32, CONNECT | CONNACK | DISCONNECT, false),
        pid::ASSIGNED_CLIENT_IDENTIFIER => (Utf8, CONNACK, false),
        pid::SERVER_KEEP_ALIVE => (U16, CONNACK, false),
        pid::AUTHENTICATION_METHOD => (Utf8, CONNECT | CONNACK, false),
        pid::AUTHENTICATION_DATA => (Binary, CONNECT | CONNACK, false),
        pid::REQUEST_PROBLEM_INFORMATION => (Byte, CONNECT, false),
        pid::WILL_DELAY_INTERVAL => (U32, WILL, false),
        pid::REQUEST_RESPONSE_INFORMATION => (Byte, CONNECT, false),
        pid::RESPONSE_INFORMATION => (Utf8, CONNACK, false),
        pid::SERVER_REFERENCE => (Utf8, CONNACK | DISCONNECT, false),
        pid::REASON_STRING => (Utf8, ACKS, false),
        pid::RECEIVE_MAXIMUM => (U16, CONNECT | CONNACK, false),
        pid::TOPIC_ALIAS_MAXIMUM => (U16, CONNECT | CONNACK, false),
        pid::TOPIC_ALIAS => (U16, PUBLISH, false),
        pid::MAXIMUM_QOS => (Byte, CONNACK, false),
        pid::RETAIN_AVAILABLE => (Byte, CONNACK, false),
        pid::USER_PROPERTY => (Pair, ALL, true),
        pid::MAXIMUM_PACKET_SIZE => (U32, CONNECT | CONNACK, false),
        pid::WILDCARD_SUBSCRIPTION_AVAILABLE => (Byte, CONNACK, false),
        pid::SUBSCRIPTION_IDENTIFIERS_AVAILABLE => (Byte, CONNACK, false),
        pid::SHARED_SUBSCRIPTION_AVAILABLE => (Byte, CONNACK, false),
        _ => return None,
    };
    Some(Contract { kind, legal, repeatable })
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PropertyValue {
    Byte(u8),
    U16(u16),
    U32(u32),
    VarInt(u32),
    Binary(Bytes),
    Utf8(ByteString),
    Pair(ByteString, ByteString),
}

impl PropertyValue {
    fn decode(kind: Kind, src: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(match kind {
            Kind::Byte => {
                ensure!(src.has_remaining(), DecodeError::InvalidLength);
                PropertyValue::Byte(src.get_u8())
            }
            Kind::U16 => PropertyValue::U16(u16::decode(src)?),
            Kind::U32 => PropertyValue::U32(u32::decode(src)?),
            Kind::VarInt => PropertyValue::VarInt(decode_variable_length_cursor(src)?),
            Kind::Binary => PropertyValue::Binary(Bytes::decode(src)?),
            Kind::Utf8 => PropertyValue::Utf8(ByteString::decode(src)?),
            Kind::Pair => {
                PropertyValue::Pair(ByteString::decode(src)?, ByteString::decode(src)?)
            }
        })
    }

    fn encoded_size(&self) -> usize {
        match self {
            PropertyValue::Byte(_) => 1,
            PropertyValue::U16(_) => 2,
            PropertyValue::U32(_) => 4,
            PropertyValue::VarInt(v) => var_int_len(*v) as usize,
            PropertyValue::Binary(b) => b.encoded_size(),
            PropertyValue::Utf8(s) => s.encoded_size(),
            PropertyValue::Pair(k, v) => k.encoded_size() + v.encoded_size(),
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            PropertyValue::Byte(v) => buf.put_u8(*v),
            PropertyValue::U16(v) => v.encode(buf)?,
            PropertyValue::U32(v) => v.encode(buf)?,
            PropertyValue::VarInt(v) => write_variable_length(*v, buf)?,
            PropertyValue::Binary(b) => b.encode(buf)?,
            PropertyValue::Utf8(s) => s.encode(buf)?,
            PropertyValue::Pair(k, v) => {
                k.encode(buf)?;
                v.encode(buf)?;
            }
        }
        Ok(())
    }
}

/// An ordered property list as it appeared on (or will go onto) the wire.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Properties(Vec<(u32, PropertyValue)>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(u32, PropertyValue)> {
        self.0.iter()
    }

    /// Reads `varint length + repeated (id, value)` from `src`, validating
    /// each identifier against the contract for the enclosing context.
    pub(crate) fn decode(src: &mut Bytes, context: u16) -> Result<Self, DecodeError> {
        let mut block = take_properties(src)?;
        let mut props = Vec::new();
        while block.has_remaining() {
            let id = decode_variable_length_cursor(&mut block)?;
            let c = contract(id).ok_or(DecodeError::IllegalProperty(id))?;
            ensure!(c.legal & context != 0, DecodeError::IllegalProperty(id));
            if !c.repeatable {
                ensure!(
                    !props.iter().any(|(seen, _)| *seen == id),
                    DecodeError::MalformedPacket
                );
            }
            props.push((id, PropertyValue::decode(c.kind, &mut block)?));
        }
        Ok(Properties(props))
    }

    /// Size of the block including its own length prefix.
    pub(crate) fn encoded_size(&self) -> usize {
        let body = self.body_size();
        var_int_len(body as u32) as usize + body
    }

    fn body_size(&self) -> usize {
        self.0
            .iter()
            .map(|(id, v)| var_int_len(*id) as usize + v.encoded_size())
            .sum()
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut, context: u16) -> Result<(), EncodeError> {
        for (id, _) in &self.0 {
            let legal = contract(*id).map(|c| c.legal & context != 0).unwrap_or(false);
            if !legal {
                return Err(EncodeError::MalformedPacket);
            }
        }
        write_variable_length(self.body_size() as u32, buf)?;
        for (id, v) in &self.0 {
            write_variable_length(*id, buf)?;
            v.encode(buf)?;
        }
        Ok(())
    }

    pub fn push(&mut self, id: u32, value: PropertyValue) {
        self.0.push((id, value));
    }

    pub fn push_user_property(&mut self, key: ByteString, value: ByteString) {
        self.0.push((pid::USER_PROPERTY, PropertyValue::Pair(key, value)));
    }

    fn byte_of(&self, id: u32) -> Option<u8> {
        self.0.iter().find_map(|(i, v)| match v {
            PropertyValue::Byte(b) if *i == id => Some(*b),
            _ => None,
        })
    }

    fn u16_of(&self, id: u32) -> Option<u16> {
        self.0.iter().find_map(|(i, v)| match v {
            PropertyValue::U16(n) if *i == id => Some(*n),
            _ => None,
        })
    }

    fn u32_of(&self, id: u32) -> Option<u32> {
        self.0.iter().find_map(|(i, v)| match v {
            PropertyValue::U32(n) if *i == id => Some(*n),
            _ => None,
        })
    }

    fn utf8_of(&self, id: u32) -> Option<&ByteString> {
        self.0.iter().find_map(|(i, v)| match v {
            PropertyValue::Utf8(s) if *i == id => Some(s),
            _ => None,
        })
    }

    pub fn session_expiry_interval(&self) -> Option<u32> {
        self.u32_of(pid::SESSION_EXPIRY_INTERVAL)
    }

    pub fn message_expiry_interval(&self) -> Option<NonZeroU32> {
        self.u32_of(pid::MESSAGE_EXPIRY_INTERVAL).and_then(NonZeroU32::new)
    }

    pub fn receive_maximum(&self) -> Option<u16> {
        self.u16_of(pid::RECEIVE_MAXIMUM)
    }

    pub fn maximum_packet_size(&self) -> Option<u32> {
        self.u32_of(pid::MAXIMUM_PACKET_SIZE)
    }

    pub fn topic_alias(&self) -> Option<u16> {
        self.u16_of(pid::TOPIC_ALIAS)
    }

    pub fn topic_alias_maximum(&self) -> Option<u16> {
        self.u16_of(pid::TOPIC_ALIAS_MAXIMUM)
    }

    pub fn server_keep_alive(&self) -> Option<u16> {
        self.u16_of(pid::SERVER_KEEP_ALIVE)
    }

    pub fn maximum_qos(&self) -> Option<u8> {
        self.byte_of(pid::MAXIMUM_QOS)
    }

    pub fn assigned_client_id(&self) -> Option<&ByteString> {
        self.utf8_of(pid::ASSIGNED_CLIENT_IDENTIFIER)
    }

    pub fn reason_string(&self) -> Option<&ByteString> {
        self.utf8_of(pid::REASON_STRING)
    }

    pub fn will_delay_interval(&self) -> Option<u32> {
        self.u32_of(pid::WILL_DELAY_INTERVAL)
    }

    pub fn subscription_identifier(&self) -> Option<NonZeroU32> {
        self.0.iter().find_map(|(i, v)| match v {
            PropertyValue::VarInt(n) if *i == pid::SUBSCRIPTION_IDENTIFIER => NonZeroU32::new(*n),
            _ => None,
        })
    }

    pub fn user_properties(&self) -> impl Iterator<Item = (&ByteString, &ByteString)> {
        self.0.iter().filter_map(|(i, v)| match v {
            PropertyValue::Pair(k, val) if *i == pid::USER_PROPERTY => Some((k, val)),
            _ => None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_block(props: &Properties, context: u16) -> Bytes {
        let mut buf = BytesMut::new();
        props.encode(&mut buf, context).unwrap();
        buf.freeze()
    }

    #[test]
    fn test_round_trip() {
        let mut props = Properties::new();
        props.push(pid::SESSION_EXPIRY_INTERVAL, PropertyValue::U32(3600));
        props.push(pid::RECEIVE_MAXIMUM, PropertyValue::U16(16));
        props.push_user_property("a".into(), "1".into());
        props.push_user_property("a".into(), "2".into());

        let mut bin = encode_block(&props, ctx::CONNECT);
        assert_eq!(bin.len(), props.encoded_size());

        let decoded = Properties::decode(&mut bin, ctx::CONNECT).unwrap();
        assert_eq!(decoded, props);
        assert_eq!(decoded.session_expiry_interval(), Some(3600));
        assert_eq!(decoded.receive_maximum(), Some(16));
        assert_eq!(decoded.user_properties().count(), 2);
    }

    #[test]
    fn test_illegal_context() {
        // TOPIC_ALIAS is a PUBLISH-only property
        let mut bin = Bytes::from_static(b"\x03\x23\x00\x01");
        assert_eq!(
            Properties::decode(&mut bin, ctx::CONNECT),
            Err(DecodeError::IllegalProperty(pid::TOPIC_ALIAS))
        );
        let mut bin = Bytes::from_static(b"\x03\x23\x00\x01");
        assert!(Properties::decode(&mut bin, ctx::PUBLISH).is_ok());
    }

    #[test]
    fn test_unknown_identifier() {
        let mut bin = Bytes::from_static(b"\x02\x7e\x00");
        assert_eq!(
            Properties::decode(&mut bin, ctx::PUBLISH),
            Err(DecodeError::IllegalProperty(0x7e))
        );
    }

    #[test]
    fn test_duplicate_rejected() {
        // RECEIVE_MAXIMUM twice
        let mut bin = Bytes::from_static(b"\x06\x21\x00\x10\x21\x00\x20");
        assert_eq!(
            Properties::decode(&mut bin, ctx::CONNECT),
            Err(DecodeError::MalformedPacket)
        );
    }

    #[test]
    fn test_truncated_block_is_malformed() {
        // declared length 4, value runs past the block end
        let mut bin = Bytes::from_static(b"\x04\x11\x00\x00\x0e");
        assert!(Properties::decode(&mut bin, ctx::CONNECT).is_err());
    }

    #[test]
    fn test_encode_rejects_wrong_context() {
        let mut props = Properties::new();
        props.push(pid::MAXIMUM_QOS, PropertyValue::Byte(1));
        let mut buf = BytesMut::new();
        assert!(props.encode(&mut buf, ctx::CONNECT).is_err());
    }
}
