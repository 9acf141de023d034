use std::net::SocketAddr;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use fluxmq_codec::v3;
use fluxmq_codec::v5;
use fluxmq_codec::v5::{
    Disconnect as DisconnectV5, DisconnectReasonCode, PublishAck, PublishAck2, PublishAck2Reason,
};
use fluxmq_codec::MqttCodec;
use fluxmq_net::{v3::MqttStream as MqttStreamV3, v5::MqttStream as MqttStreamV5, Builder};

use crate::types::Publish;
use crate::Result;

/// Version-tagged decoded control packet.
#[derive(Debug)]
pub enum Packet {
    V3(v3::Packet),
    V5(v5::Packet),
}

/// A connected MQTT stream of either protocol version.
///
/// The per-version packet shapes stay visible through `v3_mut`/`v5_mut`;
/// the shared helpers cover the packets whose meaning is identical on
/// both sides of the version split.
pub enum Sink<Io> {
    V3(MqttStreamV3<Io>),
    V5(MqttStreamV5<Io>),
}

impl<Io> Sink<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    /// Outgoing connection with the protocol version fixed up front.
    /// Server-side streams come from [`fluxmq_net::Dispatcher`] instead,
    /// which probes the version off the CONNECT preamble.
    pub fn connect_v3(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        let codec = MqttCodec::V3(v3::Codec::new(cfg.max_packet_size));
        Sink::V3(MqttStreamV3 { io: Framed::new(io, codec), remote_addr, cfg })
    }

    pub fn connect_v5(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        let codec = MqttCodec::V5(v5::Codec::new(cfg.max_packet_size, cfg.max_packet_size));
        Sink::V5(MqttStreamV5 { io: Framed::new(io, codec), remote_addr, cfg })
    }

    #[inline]
    pub fn version(&self) -> u8 {
        match self {
            Sink::V3(_) => 3,
            Sink::V5(_) => 5,
        }
    }

    #[inline]
    pub fn v3_mut(&mut self) -> &mut MqttStreamV3<Io> {
        match self {
            Sink::V3(s) => s,
            Sink::V5(_) => unreachable!(),
        }
    }

    #[inline]
    pub fn v5_mut(&mut self) -> &mut MqttStreamV5<Io> {
        match self {
            Sink::V3(_) => unreachable!(),
            Sink::V5(s) => s,
        }
    }

    #[inline]
    pub async fn recv(&mut self) -> Result<Option<Packet>> {
        match self {
            Sink::V3(s) => match futures::StreamExt::next(s).await {
                Some(pkt) => Ok(Some(Packet::V3(pkt?))),
                None => Ok(None),
            },
            Sink::V5(s) => match futures::StreamExt::next(s).await {
                Some(pkt) => Ok(Some(Packet::V5(pkt?))),
                None => Ok(None),
            },
        }
    }

    #[inline]
    pub async fn recv_timeout(&mut self, tm: Duration) -> Result<Option<Packet>> {
        match self {
            Sink::V3(s) => Ok(s.recv(tm).await?.map(Packet::V3)),
            Sink::V5(s) => Ok(s.recv(tm).await?.map(Packet::V5)),
        }
    }

    /// v3 connections have no payload to carry `properties`; they are
    /// dropped at the version boundary.
    #[inline]
    pub async fn send_publish(&mut self, mut publish: Publish) -> Result<()> {
        match self {
            Sink::V3(s) => {
                publish.properties = None;
                s.send_publish(publish).await
            }
            Sink::V5(s) => s.send_publish(publish).await,
        }
    }

    #[inline]
    pub async fn send_publish_ack(&mut self, packet_id: NonZeroU16) -> Result<()> {
        match self {
            Sink::V3(s) => s.send_publish_ack(packet_id).await,
            Sink::V5(s) => s.send_publish_ack(PublishAck::new(packet_id)).await,
        }
    }

    #[inline]
    pub async fn send_publish_received(&mut self, packet_id: NonZeroU16) -> Result<()> {
        match self {
            Sink::V3(s) => s.send_publish_received(packet_id).await,
            Sink::V5(s) => s.send_publish_received(PublishAck::new(packet_id)).await,
        }
    }

    #[inline]
    pub async fn send_publish_release(
        &mut self,
        packet_id: NonZeroU16,
        not_found: bool,
    ) -> Result<()> {
        match self {
            Sink::V3(s) => s.send_publish_release(packet_id).await,
            Sink::V5(s) => {
                let reason_code = if not_found {
                    PublishAck2Reason::PacketIdNotFound
                } else {
                    PublishAck2Reason::Success
                };
                s.send_publish_release(PublishAck2 { reason_code, ..PublishAck2::new(packet_id) })
                    .await
            }
        }
    }

    #[inline]
    pub async fn send_publish_complete(
        &mut self,
        packet_id: NonZeroU16,
        not_found: bool,
    ) -> Result<()> {
        match self {
            Sink::V3(s) => s.send_publish_complete(packet_id).await,
            Sink::V5(s) => {
                let reason_code = if not_found {
                    PublishAck2Reason::PacketIdNotFound
                } else {
                    PublishAck2Reason::Success
                };
                s.send_publish_complete(PublishAck2 { reason_code, ..PublishAck2::new(packet_id) })
                    .await
            }
        }
    }

    #[inline]
    pub async fn send_ping_request(&mut self) -> Result<()> {
        match self {
            Sink::V3(s) => s.send_ping_request().await,
            Sink::V5(s) => s.send_ping_request().await,
        }
    }

    #[inline]
    pub async fn send_ping_response(&mut self) -> Result<()> {
        match self {
            Sink::V3(s) => s.send_ping_response().await,
            Sink::V5(s) => s.send_ping_response().await,
        }
    }

    /// Announces the close reason on MQTT5; pre-5 closes silently.
    #[inline]
    pub async fn send_disconnect(&mut self, reason_code: DisconnectReasonCode) -> Result<()> {
        match self {
            Sink::V3(_) => Ok(()),
            Sink::V5(s) => s.send_disconnect(DisconnectV5::new(reason_code)).await,
        }
    }

    #[inline]
    pub async fn flush(&mut self) -> Result<()> {
        match self {
            Sink::V3(s) => s.flush().await,
            Sink::V5(s) => s.flush().await,
        }
    }

    #[inline]
    pub async fn close(&mut self) -> Result<()> {
        match self {
            Sink::V3(s) => s.close().await,
            Sink::V5(s) => s.close().await,
        }
    }
}
