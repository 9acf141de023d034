//! Per-command wire format for the v5 protocol.

use std::num::NonZeroU16;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytestring::ByteString;

use crate::error::{DecodeError, EncodeError};
use crate::types::{packet_type, Protocol, QoS, MQTT, MQTT_LEVEL_5, WILL_QOS_SHIFT};
use crate::utils::{write_variable_length, Decode, Encode};

use super::packet::*;
use super::property::{ctx, Properties};
use super::{Packet, Publish};
use crate::types::{ConnectAckFlags, ConnectFlags};

pub(crate) fn decode_packet(mut src: Bytes, first_byte: u8) -> Result<Packet, DecodeError> {
    let packet = match first_byte {
        packet_type::CONNECT => decode_connect(&mut src)?,
        packet_type::CONNACK => decode_connect_ack(&mut src)?,
        packet_type::PUBLISH_START..=packet_type::PUBLISH_END => {
            decode_publish(&mut src, first_byte & 0x0F)?
        }
        packet_type::PUBACK => Packet::PublishAck(decode_ack(&mut src, ctx::PUBACK)?),
        packet_type::PUBREC => Packet::PublishReceived(decode_ack(&mut src, ctx::PUBREC)?),
        packet_type::PUBREL => Packet::PublishRelease(decode_ack2(&mut src, ctx::PUBREL)?),
        packet_type::PUBCOMP => Packet::PublishComplete(decode_ack2(&mut src, ctx::PUBCOMP)?),
        packet_type::SUBSCRIBE => decode_subscribe(&mut src)?,
        packet_type::SUBACK => decode_subscribe_ack(&mut src)?,
        packet_type::UNSUBSCRIBE => decode_unsubscribe(&mut src)?,
        packet_type::UNSUBACK => decode_unsubscribe_ack(&mut src)?,
        packet_type::PINGREQ => Packet::PingRequest,
        packet_type::PINGRESP => Packet::PingResponse,
        packet_type::DISCONNECT => decode_disconnect(&mut src)?,
        _ => return Err(DecodeError::UnsupportedPacketType),
    };
    Ok(packet)
}

fn decode_connect(src: &mut Bytes) -> Result<Packet, DecodeError> {
    ensure!(src.remaining() >= 10, DecodeError::InvalidLength);
    let len = src.get_u16();

    ensure!(len == 4 && &src.as_ref()[0..4] == MQTT, DecodeError::InvalidProtocol);
    src.advance(4);

    let level = src.get_u8();
    ensure!(level == MQTT_LEVEL_5, DecodeError::UnsupportedProtocolLevel);

    let flags = ConnectFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnectReservedFlagSet)?;

    let keep_alive = u16::decode(src)?;
    let properties = Properties::decode(src, ctx::CONNECT)?;
    let client_id = ByteString::decode(src)?;

    ensure!(
        !client_id.is_empty() || flags.contains(ConnectFlags::CLEAN_START),
        DecodeError::InvalidClientId
    );

    let last_will = if flags.contains(ConnectFlags::WILL) {
        let will_properties = Properties::decode(src, ctx::WILL)?;
        let topic = ByteString::decode(src)?;
        let message = Bytes::decode(src)?;
        Some(LastWill {
            qos: QoS::try_from((flags & ConnectFlags::WILL_QOS).bits() >> WILL_QOS_SHIFT)?,
            retain: flags.contains(ConnectFlags::WILL_RETAIN),
            topic,
            message,
            properties: will_properties,
        })
    } else {
        ensure!(
            !flags.intersects(ConnectFlags::WILL_QOS | ConnectFlags::WILL_RETAIN),
            DecodeError::MalformedPacket
        );
        None
    };
    let username =
        if flags.contains(ConnectFlags::USERNAME) { Some(ByteString::decode(src)?) } else { None };
    let password =
        if flags.contains(ConnectFlags::PASSWORD) { Some(Bytes::decode(src)?) } else { None };

    Ok(Connect {
        protocol: Protocol(MQTT_LEVEL_5),
        clean_start: flags.contains(ConnectFlags::CLEAN_START),
        keep_alive,
        properties,
        client_id,
        last_will,
        username,
        password,
    }
    .into())
}

fn decode_connect_ack(src: &mut Bytes) -> Result<Packet, DecodeError> {
    ensure!(src.remaining() >= 2, DecodeError::InvalidLength);
    let flags =
        ConnectAckFlags::from_bits(src.get_u8()).ok_or(DecodeError::ConnAckReservedFlagSet)?;
    let reason_code = src.get_u8().try_into()?;
    let properties = Properties::decode(src, ctx::CONNACK)?;
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);

    Ok(Packet::ConnectAck(Box::new(ConnectAck {
        session_present: flags.contains(ConnectAckFlags::SESSION_PRESENT),
        reason_code,
        properties,
    })))
}

fn decode_publish(src: &mut Bytes, packet_flags: u8) -> Result<Packet, DecodeError> {
    let topic = ByteString::decode(src)?;
    let qos = QoS::try_from((packet_flags & 0b0110) >> 1)?;
    let dup = (packet_flags & 0b1000) == 0b1000;
    ensure!(!(dup && qos == QoS::AtMostOnce), DecodeError::MalformedPacket);
    let packet_id = if qos == QoS::AtMostOnce { None } else { Some(NonZeroU16::decode(src)?) };
    let properties = Properties::decode(src, ctx::PUBLISH)?;

    Ok(Packet::Publish(Publish {
        dup,
        qos,
        retain: (packet_flags & 0b0001) == 0b0001,
        topic,
        packet_id,
        payload: src.split_off(0),
        properties: Some(properties),
    }))
}

/// PUBACK/PUBREC: reason code and properties are optional on the wire,
/// `remaining_length == 2` means success with no properties.
fn decode_ack(src: &mut Bytes, context: u16) -> Result<PublishAck, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let (reason_code, properties) = decode_ack_tail(src, context)?;
    Ok(PublishAck { packet_id, reason_code, properties })
}

fn decode_ack2(src: &mut Bytes, context: u16) -> Result<PublishAck2, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let (reason_code, properties) = decode_ack_tail(src, context)?;
    Ok(PublishAck2 { packet_id, reason_code, properties })
}

fn decode_ack_tail<R>(src: &mut Bytes, context: u16) -> Result<(R, Properties), DecodeError>
where
    R: TryFrom<u8, Error = DecodeError> + Default,
{
    if !src.has_remaining() {
        return Ok((R::default(), Properties::default()));
    }
    let reason_code = src.get_u8().try_into()?;
    let properties =
        if src.has_remaining() { Properties::decode(src, context)? } else { Properties::default() };
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok((reason_code, properties))
}

fn decode_subscription_options(src: &mut Bytes) -> Result<SubscriptionOptions, DecodeError> {
    ensure!(src.has_remaining(), DecodeError::InvalidLength);
    let opts = src.get_u8();
    ensure!(opts & 0b1100_0000 == 0, DecodeError::MalformedPacket);
    Ok(SubscriptionOptions {
        qos: QoS::try_from(opts & 0b0000_0011)?,
        no_local: opts & 0b0000_0100 != 0,
        retain_as_published: opts & 0b0000_1000 != 0,
        retain_handling: RetainHandling::try_from((opts & 0b0011_0000) >> 4)?,
    })
}

fn decode_subscribe(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let properties = Properties::decode(src, ctx::SUBSCRIBE)?;
    let mut topic_filters = Vec::new();
    while src.has_remaining() {
        let topic = ByteString::decode(src)?;
        topic_filters.push((topic, decode_subscription_options(src)?));
    }
    ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);

    Ok(Packet::Subscribe(Subscribe { packet_id, properties, topic_filters }))
}

fn decode_subscribe_ack(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let properties = Properties::decode(src, ctx::SUBACK)?;
    let mut status = Vec::with_capacity(src.len());
    for code in src.as_ref().iter() {
        status.push(SubscribeAckReason::try_from(*code)?);
    }
    ensure!(!status.is_empty(), DecodeError::MalformedPacket);
    Ok(Packet::SubscribeAck(SubscribeAck { packet_id, properties, status }))
}

fn decode_unsubscribe(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let properties = Properties::decode(src, ctx::UNSUBSCRIBE)?;
    let mut topic_filters = Vec::new();
    while src.has_remaining() {
        topic_filters.push(ByteString::decode(src)?);
    }
    ensure!(!topic_filters.is_empty(), DecodeError::MalformedPacket);
    Ok(Packet::Unsubscribe(Unsubscribe { packet_id, properties, topic_filters }))
}

fn decode_unsubscribe_ack(src: &mut Bytes) -> Result<Packet, DecodeError> {
    let packet_id = NonZeroU16::decode(src)?;
    let properties = Properties::decode(src, ctx::UNSUBACK)?;
    let mut status = Vec::with_capacity(src.len());
    for code in src.as_ref().iter() {
        status.push(UnsubscribeAckReason::try_from(*code)?);
    }
    Ok(Packet::UnsubscribeAck(UnsubscribeAck { packet_id, properties, status }))
}

fn decode_disconnect(src: &mut Bytes) -> Result<Packet, DecodeError> {
    if !src.has_remaining() {
        return Ok(Packet::Disconnect(Disconnect::default()));
    }
    let reason_code = src.get_u8().try_into()?;
    let properties =
        if src.has_remaining() { Properties::decode(src, ctx::DISCONNECT)? } else { Properties::default() };
    ensure!(!src.has_remaining(), DecodeError::InvalidLength);
    Ok(Packet::Disconnect(Disconnect { reason_code, properties }))
}

fn ack_size(props: &Properties, is_success: bool) -> usize {
    if props.is_empty() {
        if is_success {
            2
        } else {
            3
        }
    } else {
        3 + props.encoded_size()
    }
}

pub(crate) fn encoded_size(packet: &Packet) -> usize {
    match packet {
        Packet::Connect(connect) => {
            let mut n = 2
                + connect.protocol.name().len()
                + 1
                + 1
                + 2
                + connect.properties.encoded_size()
                + 2
                + connect.client_id.len();
            if let Some(LastWill { ref topic, ref message, ref properties, .. }) =
                connect.last_will
            {
                n += properties.encoded_size() + 2 + topic.len() + 2 + message.len();
            }
            if let Some(ref s) = connect.username {
                n += 2 + s.len();
            }
            if let Some(ref s) = connect.password {
                n += 2 + s.len();
            }
            n
        }
        Packet::ConnectAck(ack) => 2 + ack.properties.encoded_size(),
        Packet::Publish(publish) => {
            let id = if publish.qos == QoS::AtMostOnce { 0 } else { 2 };
            let props =
                publish.properties.as_ref().map(|p| p.encoded_size()).unwrap_or(1);
            2 + publish.topic.len() + id + props + publish.payload.len()
        }
        Packet::PublishAck(ack) | Packet::PublishReceived(ack) => {
            ack_size(&ack.properties, ack.reason_code == PublishAckReason::Success)
        }
        Packet::PublishRelease(ack) | Packet::PublishComplete(ack) => {
            ack_size(&ack.properties, ack.reason_code == PublishAck2Reason::Success)
        }
        Packet::Subscribe(sub) => {
            2 + sub.properties.encoded_size()
                + sub.topic_filters.iter().map(|(f, _)| 2 + f.len() + 1).sum::<usize>()
        }
        Packet::SubscribeAck(ack) => 2 + ack.properties.encoded_size() + ack.status.len(),
        Packet::Unsubscribe(unsub) => {
            2 + unsub.properties.encoded_size()
                + unsub.topic_filters.iter().map(|f| 2 + f.len()).sum::<usize>()
        }
        Packet::UnsubscribeAck(ack) => 2 + ack.properties.encoded_size() + ack.status.len(),
        Packet::PingRequest | Packet::PingResponse => 0,
        Packet::Disconnect(disc) => {
            if disc.properties.is_empty() {
                if disc.reason_code == DisconnectReasonCode::NormalDisconnection {
                    0
                } else {
                    1
                }
            } else {
                1 + disc.properties.encoded_size()
            }
        }
    }
}

pub(crate) fn encode(
    packet: &Packet,
    dst: &mut BytesMut,
    content_size: u32,
) -> Result<(), EncodeError> {
    match packet {
        Packet::Connect(connect) => {
            dst.put_u8(packet_type::CONNECT);
            write_variable_length(content_size, dst)?;
            encode_connect(connect, dst)?;
        }
        Packet::ConnectAck(ack) => {
            dst.put_u8(packet_type::CONNACK);
            write_variable_length(content_size, dst)?;
            dst.put_slice(&[u8::from(ack.session_present), ack.reason_code.into()]);
            ack.properties.encode(dst, ctx::CONNACK)?;
        }
        Packet::Publish(publish) => {
            dst.put_u8(
                packet_type::PUBLISH_START
                    | (u8::from(publish.qos) << 1)
                    | ((publish.dup as u8) << 3)
                    | (publish.retain as u8),
            );
            write_variable_length(content_size, dst)?;
            publish.topic.encode(dst)?;
            if publish.qos == QoS::AtMostOnce {
                if publish.packet_id.is_some() {
                    return Err(EncodeError::MalformedPacket);
                }
            } else {
                publish.packet_id.ok_or(EncodeError::PacketIdRequired)?.encode(dst)?;
            }
            match publish.properties {
                Some(ref props) => props.encode(dst, ctx::PUBLISH)?,
                None => write_variable_length(0, dst)?,
            }
            dst.put(publish.payload.as_ref());
        }
        Packet::PublishAck(ack) => {
            encode_ack(
                packet_type::PUBACK,
                ack.packet_id,
                ack.reason_code.into(),
                &ack.properties,
                ctx::PUBACK,
                content_size,
                dst,
            )?;
        }
        Packet::PublishReceived(ack) => {
            encode_ack(
                packet_type::PUBREC,
                ack.packet_id,
                ack.reason_code.into(),
                &ack.properties,
                ctx::PUBREC,
                content_size,
                dst,
            )?;
        }
        Packet::PublishRelease(ack) => {
            encode_ack(
                packet_type::PUBREL,
                ack.packet_id,
                ack.reason_code.into(),
                &ack.properties,
                ctx::PUBREL,
                content_size,
                dst,
            )?;
        }
        Packet::PublishComplete(ack) => {
            encode_ack(
                packet_type::PUBCOMP,
                ack.packet_id,
                ack.reason_code.into(),
                &ack.properties,
                ctx::PUBCOMP,
                content_size,
                dst,
            )?;
        }
        Packet::Subscribe(sub) => {
            dst.put_u8(packet_type::SUBSCRIBE);
            write_variable_length(content_size, dst)?;
            sub.packet_id.encode(dst)?;
            sub.properties.encode(dst, ctx::SUBSCRIBE)?;
            for (filter, opts) in &sub.topic_filters {
                filter.encode(dst)?;
                dst.put_u8(
                    u8::from(opts.qos)
                        | (u8::from(opts.no_local) << 2)
                        | (u8::from(opts.retain_as_published) << 3)
                        | ((opts.retain_handling as u8) << 4),
                );
            }
        }
        Packet::SubscribeAck(ack) => {
            dst.put_u8(packet_type::SUBACK);
            write_variable_length(content_size, dst)?;
            ack.packet_id.encode(dst)?;
            ack.properties.encode(dst, ctx::SUBACK)?;
            for code in &ack.status {
                dst.put_u8((*code).into());
            }
        }
        Packet::Unsubscribe(unsub) => {
            dst.put_u8(packet_type::UNSUBSCRIBE);
            write_variable_length(content_size, dst)?;
            unsub.packet_id.encode(dst)?;
            unsub.properties.encode(dst, ctx::UNSUBSCRIBE)?;
            for filter in &unsub.topic_filters {
                filter.encode(dst)?;
            }
        }
        Packet::UnsubscribeAck(ack) => {
            dst.put_u8(packet_type::UNSUBACK);
            write_variable_length(content_size, dst)?;
            ack.packet_id.encode(dst)?;
            ack.properties.encode(dst, ctx::UNSUBACK)?;
            for code in &ack.status {
                dst.put_u8((*code).into());
            }
        }
        Packet::PingRequest => dst.put_slice(&[packet_type::PINGREQ, 0]),
        Packet::PingResponse => dst.put_slice(&[packet_type::PINGRESP, 0]),
        Packet::Disconnect(disc) => {
            dst.put_u8(packet_type::DISCONNECT);
            write_variable_length(content_size, dst)?;
            if content_size > 0 {
                dst.put_u8(disc.reason_code.into());
                if !disc.properties.is_empty() {
                    disc.properties.encode(dst, ctx::DISCONNECT)?;
                }
            }
        }
    }
    Ok(())
}

#[allow(clippy::too_many_arguments)]
#[inline]
fn encode_ack(
    first_byte: u8,
    packet_id: NonZeroU16,
    reason_code: u8,
    properties: &Properties,
    context: u16,
    content_size: u32,
    dst: &mut BytesMut,
) -> Result<(), EncodeError> {
    dst.put_u8(first_byte);
    write_variable_length(content_size, dst)?;
    packet_id.encode(dst)?;
    if content_size > 2 {
        dst.put_u8(reason_code);
        if !properties.is_empty() {
            properties.encode(dst, context)?;
        }
    }
    Ok(())
}

fn encode_connect(connect: &Connect, dst: &mut BytesMut) -> Result<(), EncodeError> {
    connect.protocol.name().as_bytes().encode(dst)?;

    let mut flags = ConnectFlags::empty();
    if connect.username.is_some() {
        flags |= ConnectFlags::USERNAME;
    }
    if connect.password.is_some() {
        flags |= ConnectFlags::PASSWORD;
    }
    if let Some(LastWill { qos, retain, .. }) = connect.last_will {
        flags |= ConnectFlags::WILL;
        if retain {
            flags |= ConnectFlags::WILL_RETAIN;
        }
        flags |= ConnectFlags::from_bits_truncate((qos as u8) << WILL_QOS_SHIFT);
    }
    if connect.clean_start {
        flags |= ConnectFlags::CLEAN_START;
    }

    dst.put_slice(&[MQTT_LEVEL_5, flags.bits()]);
    dst.put_u16(connect.keep_alive);
    connect.properties.encode(dst, ctx::CONNECT)?;
    connect.client_id.encode(dst)?;

    if let Some(LastWill { ref topic, ref message, ref properties, .. }) = connect.last_will {
        properties.encode(dst, ctx::WILL)?;
        topic.encode(dst)?;
        message.encode(dst)?;
    }
    if let Some(ref s) = connect.username {
        s.encode(dst)?;
    }
    if let Some(ref s) = connect.password {
        s.encode(dst)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use test_case::test_case;

    use super::super::property::{pid, PropertyValue};
    use super::*;

    fn packet_id(v: u16) -> NonZeroU16 {
        NonZeroU16::new(v).unwrap()
    }

    fn round_trip(packet: Packet) -> Packet {
        let size = encoded_size(&packet);
        let mut buf = BytesMut::new();
        encode(&packet, &mut buf, size as u32).unwrap();

        let first_byte = buf[0];
        let (len, consumed) = crate::utils::decode_variable_length(&buf[1..]).unwrap().unwrap();
        assert_eq!(len as usize, size);
        let body = buf.freeze().slice(1 + consumed..);
        decode_packet(body, first_byte).unwrap()
    }

    #[test]
    fn test_connect_round_trip() {
        let mut properties = Properties::new();
        properties.push(pid::SESSION_EXPIRY_INTERVAL, PropertyValue::U32(86400));
        properties.push(pid::RECEIVE_MAXIMUM, PropertyValue::U16(16));

        let mut will_props = Properties::new();
        will_props.push(pid::WILL_DELAY_INTERVAL, PropertyValue::U32(10));

        let connect = Connect {
            protocol: Protocol(MQTT_LEVEL_5),
            clean_start: true,
            keep_alive: 30,
            properties,
            client_id: ByteString::from_static("client-1"),
            last_will: Some(LastWill {
                qos: QoS::AtLeastOnce,
                retain: false,
                topic: ByteString::from_static("will/topic"),
                message: Bytes::from_static(b"gone"),
                properties: will_props,
            }),
            username: Some(ByteString::from_static("user")),
            password: Some(Bytes::from_static(b"pass")),
        };

        let decoded = round_trip(connect.clone().into());
        assert_eq!(decoded, Packet::Connect(Box::new(connect)));
    }

    #[test]
    fn test_decode_connect_rejects_wrong_level() {
        let mut src = Bytes::from_static(b"\x00\x04MQTT\x04\x02\x00\x3C\x00\x00\x01a");
        assert_eq!(decode_connect(&mut src), Err(DecodeError::UnsupportedProtocolLevel));
    }

    #[test]
    fn test_publish_round_trip() {
        let mut properties = Properties::new();
        properties.push(pid::MESSAGE_EXPIRY_INTERVAL, PropertyValue::U32(60));
        properties.push(pid::TOPIC_ALIAS, PropertyValue::U16(3));

        let publish = Publish {
            dup: false,
            retain: true,
            qos: QoS::ExactlyOnce,
            topic: ByteString::from_static("a/b"),
            packet_id: Some(packet_id(17)),
            payload: Bytes::from_static(b"payload"),
            properties: Some(properties),
        };
        let decoded = round_trip(publish.clone().into());
        assert_eq!(decoded, Packet::Publish(publish));
    }

    #[test]
    fn test_decode_publish_empty_properties() {
        // qos 0, property length 0
        let mut src = Bytes::from_static(b"\x00\x03a/b\x00data");
        let packet = decode_publish(&mut src, 0).unwrap();
        if let Packet::Publish(p) = packet {
            assert_eq!(p.payload, Bytes::from_static(b"data"));
            assert_eq!(p.properties, Some(Properties::default()));
        } else {
            panic!()
        }
    }

    #[test_case(b"\x43\x21" ; "bare packet id")]
    #[test_case(b"\x43\x21\x10" ; "reason code without properties")]
    #[test_case(b"\x43\x21\x10\x00" ; "reason code and empty properties")]
    fn test_decode_puback_forms(bin: &'static [u8]) {
        let mut src = Bytes::from_static(bin);
        let ack = decode_ack(&mut src, ctx::PUBACK).unwrap();
        assert_eq!(ack.packet_id, packet_id(0x4321));
        assert!(ack.properties.is_empty());
    }

    #[test]
    fn test_puback_success_encodes_two_bytes() {
        let p = Packet::PublishAck(PublishAck::new(packet_id(1)));
        assert_eq!(encoded_size(&p), 2);
        let mut buf = BytesMut::new();
        encode(&p, &mut buf, 2).unwrap();
        assert_eq!(&buf[..], b"\x40\x02\x00\x01");
    }

    #[test]
    fn test_pubcomp_not_found_round_trip() {
        let ack = PublishAck2 {
            packet_id: packet_id(7),
            reason_code: PublishAck2Reason::PacketIdNotFound,
            properties: Properties::default(),
        };
        let p = Packet::PublishComplete(ack.clone());
        assert_eq!(encoded_size(&p), 3);
        assert_eq!(round_trip(p), Packet::PublishComplete(ack));
    }

    #[test]
    fn test_subscribe_round_trip() {
        let sub = Subscribe {
            packet_id: packet_id(0x1234),
            properties: Properties::default(),
            topic_filters: vec![
                (
                    ByteString::from_static("test"),
                    SubscriptionOptions {
                        qos: QoS::AtLeastOnce,
                        no_local: true,
                        retain_as_published: false,
                        retain_handling: RetainHandling::AtSubscribeNew,
                    },
                ),
                (ByteString::from_static("filter"), SubscriptionOptions::default()),
            ],
        };
        assert_eq!(round_trip(Packet::Subscribe(sub.clone())), Packet::Subscribe(sub));
    }

    #[test]
    fn test_decode_subscribe_rejects_bad_options() {
        // reserved bits 6-7 set
        let mut src = Bytes::from_static(b"\x12\x34\x00\x00\x04test\x41");
        assert_eq!(decode_subscribe(&mut src), Err(DecodeError::MalformedPacket));
        // requested qos 3
        let mut src = Bytes::from_static(b"\x12\x34\x00\x00\x04test\x03");
        assert_eq!(decode_subscribe(&mut src), Err(DecodeError::MalformedPacket));
        // no filters at all
        let mut src = Bytes::from_static(b"\x12\x34\x00");
        assert_eq!(decode_subscribe(&mut src), Err(DecodeError::MalformedPacket));
    }

    #[test]
    fn test_suback_round_trip() {
        let ack = SubscribeAck {
            packet_id: packet_id(0x1234),
            properties: Properties::default(),
            status: vec![
                SubscribeAckReason::GrantedQos1,
                SubscribeAckReason::UnspecifiedError,
                SubscribeAckReason::GrantedQos2,
            ],
        };
        assert_eq!(round_trip(Packet::SubscribeAck(ack.clone())), Packet::SubscribeAck(ack));
    }

    #[test]
    fn test_unsubscribe_round_trip() {
        let unsub = Unsubscribe {
            packet_id: packet_id(0x1234),
            properties: Properties::default(),
            topic_filters: vec![ByteString::from_static("test"), ByteString::from_static("a/+")],
        };
        assert_eq!(round_trip(Packet::Unsubscribe(unsub.clone())), Packet::Unsubscribe(unsub));
    }

    #[test]
    fn test_disconnect_forms() {
        let p = Packet::Disconnect(Disconnect::default());
        assert_eq!(encoded_size(&p), 0);
        let mut buf = BytesMut::new();
        encode(&p, &mut buf, 0).unwrap();
        assert_eq!(&buf[..], b"\xe0\x00");

        let disc = Disconnect::new(DisconnectReasonCode::KeepAliveTimeout);
        let p = Packet::Disconnect(disc.clone());
        assert_eq!(encoded_size(&p), 1);
        assert_eq!(round_trip(p), Packet::Disconnect(disc));

        let mut props = Properties::new();
        props.push(pid::REASON_STRING, PropertyValue::Utf8("bye".into()));
        let disc = Disconnect { reason_code: DisconnectReasonCode::ServerShuttingDown, properties: props };
        assert_eq!(round_trip(Packet::Disconnect(disc.clone())), Packet::Disconnect(disc));
    }

    #[test]
    fn test_ping_packets() {
        let mut buf = BytesMut::new();
        encode(&Packet::PingRequest, &mut buf, 0).unwrap();
        assert_eq!(&buf[..], b"\xc0\x00");
        buf.clear();
        encode(&Packet::PingResponse, &mut buf, 0).unwrap();
        assert_eq!(&buf[..], b"\xd0\x00");
    }
}
