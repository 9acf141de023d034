use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use futures::SinkExt;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use fluxmq_codec::error::{DecodeError, SendPacketError};
use fluxmq_codec::v3::Codec as CodecV3;
use fluxmq_codec::v5::Codec as CodecV5;
use fluxmq_codec::version::{ProtocolVersion, VersionCodec};
use fluxmq_codec::{MqttCodec, MqttPacket};

use crate::error::MqttError;
use crate::{Builder, Result};

/// Accepted connection whose protocol version is not yet known.
///
/// The codec starts out as [`VersionCodec`] which peeks at the CONNECT
/// preamble without consuming it; once the version is known the codec is
/// swapped in place and the buffered bytes are re-read by the real codec.
pub struct Dispatcher<Io> {
    pub(crate) io: Framed<Io, MqttCodec>,
    pub remote_addr: SocketAddr,
    pub cfg: Arc<Builder>,
}

impl<Io> Dispatcher<Io>
where
    Io: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: Io, remote_addr: SocketAddr, cfg: Arc<Builder>) -> Self {
        Dispatcher { io: Framed::new(io, MqttCodec::Version(VersionCodec)), remote_addr, cfg }
    }

    #[inline]
    pub async fn mqtt(mut self) -> Result<MqttStream<Io>> {
        Ok(match self.probe_version().await? {
            ProtocolVersion::MQTT3 => MqttStream::V3(v3::MqttStream {
                io: self.io,
                remote_addr: self.remote_addr,
                cfg: self.cfg,
            }),
            ProtocolVersion::MQTT5 => MqttStream::V5(v5::MqttStream {
                io: self.io,
                remote_addr: self.remote_addr,
                cfg: self.cfg,
            }),
        })
    }

    #[inline]
    async fn probe_version(&mut self) -> Result<ProtocolVersion> {
        let Some(Ok((MqttPacket::Version(ver), _))) = self.io.next().await else {
            return Err(anyhow!(DecodeError::InvalidProtocol));
        };

        let codec = match ver {
            ProtocolVersion::MQTT3 => MqttCodec::V3(CodecV3::new(self.cfg.max_packet_size)),
            ProtocolVersion::MQTT5 => {
                MqttCodec::V5(CodecV5::new(self.cfg.max_packet_size, self.cfg.max_packet_size))
            }
        };

        *self.io.codec_mut() = codec;
        Ok(ver)
    }
}

pub enum MqttStream<Io> {
    V3(v3::MqttStream<Io>),
    V5(v5::MqttStream<Io>),
}

pub mod v3 {
    use std::net::SocketAddr;
    use std::num::NonZeroU16;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_util::codec::Framed;

    use fluxmq_codec::error::DecodeError;
    use fluxmq_codec::types::Publish;
    use fluxmq_codec::v3::{Connect, ConnectAck, ConnectAckReason, Packet, SubscribeReturnCode};
    use fluxmq_codec::{MqttCodec, MqttPacket};

    use crate::error::MqttError;
    use crate::{Builder, Error, Result};

    pub struct MqttStream<Io> {
        pub io: Framed<Io, MqttCodec>,
        pub remote_addr: SocketAddr,
        pub cfg: Arc<Builder>,
    }

    impl<Io> MqttStream<Io>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        #[inline]
        pub async fn send_disconnect(&mut self) -> Result<()> {
            self.send(Packet::Disconnect).await
        }

        #[inline]
        pub async fn send_publish(&mut self, publish: Publish) -> Result<()> {
            self.send(Packet::Publish(publish)).await
        }

        #[inline]
        pub async fn send_publish_ack(&mut self, packet_id: NonZeroU16) -> Result<()> {
            self.send(Packet::PublishAck { packet_id }).await
        }

        #[inline]
        pub async fn send_publish_received(&mut self, packet_id: NonZeroU16) -> Result<()> {
            self.send(Packet::PublishReceived { packet_id }).await
        }

        #[inline]
        pub async fn send_publish_release(&mut self, packet_id: NonZeroU16) -> Result<()> {
            self.send(Packet::PublishRelease { packet_id }).await
        }

        #[inline]
        pub async fn send_publish_complete(&mut self, packet_id: NonZeroU16) -> Result<()> {
            self.send(Packet::PublishComplete { packet_id }).await
        }

        #[inline]
        pub async fn send_subscribe_ack(
            &mut self,
            packet_id: NonZeroU16,
            status: Vec<SubscribeReturnCode>,
        ) -> Result<()> {
            self.send(Packet::SubscribeAck { packet_id, status }).await
        }

        #[inline]
        pub async fn send_unsubscribe_ack(&mut self, packet_id: NonZeroU16) -> Result<()> {
            self.send(Packet::UnsubscribeAck { packet_id }).await
        }

        #[inline]
        pub async fn send_connect(&mut self, connect: Connect) -> Result<()> {
            self.send(Packet::Connect(Box::new(connect))).await
        }

        #[inline]
        pub async fn send_connect_ack(
            &mut self,
            return_code: ConnectAckReason,
            session_present: bool,
        ) -> Result<()> {
            self.send(Packet::ConnectAck(ConnectAck { session_present, return_code })).await
        }

        #[inline]
        pub async fn send_ping_request(&mut self) -> Result<()> {
            self.send(Packet::PingRequest).await
        }

        #[inline]
        pub async fn send_ping_response(&mut self) -> Result<()> {
            self.send(Packet::PingResponse).await
        }

        #[inline]
        pub async fn send(&mut self, packet: Packet) -> Result<()> {
            super::send(&mut self.io, MqttPacket::V3(packet), self.cfg.send_timeout).await
        }

        #[inline]
        pub async fn flush(&mut self) -> Result<()> {
            super::flush(&mut self.io, self.cfg.send_timeout).await
        }

        #[inline]
        pub async fn close(&mut self) -> Result<()> {
            super::close(&mut self.io, self.cfg.send_timeout).await
        }

        #[inline]
        pub async fn recv(&mut self, tm: Duration) -> Result<Option<Packet>> {
            match tokio::time::timeout(tm, self.next()).await {
                Ok(Some(Ok(msg))) => Ok(Some(msg)),
                Ok(Some(Err(e))) => Err(e),
                Ok(None) => Ok(None),
                Err(_) => Err(MqttError::ReadTimeout.into()),
            }
        }

        #[inline]
        pub async fn recv_connect(&mut self, tm: Duration) -> Result<Box<Connect>> {
            match self.recv(tm).await {
                Ok(Some(Packet::Connect(connect))) => Ok(connect),
                Err(e) => Err(e),
                _ => Err(MqttError::InvalidProtocol.into()),
            }
        }
    }

    impl<Io> futures::Stream for MqttStream<Io>
    where
        Io: AsyncRead + Unpin,
    {
        type Item = Result<Packet>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let next = Pin::new(&mut self.io).poll_next(cx);
            Poll::Ready(match futures::ready!(next) {
                Some(Ok((MqttPacket::V3(packet), _))) => Some(Ok(packet)),
                Some(Ok(_)) => Some(Err(MqttError::Decode(DecodeError::MalformedPacket).into())),
                Some(Err(e)) => Some(Err(Error::from(e))),
                None => None,
            })
        }
    }
}

pub mod v5 {
    use std::net::SocketAddr;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use futures::StreamExt;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_util::codec::Framed;

    use fluxmq_codec::error::DecodeError;
    use fluxmq_codec::types::Publish;
    use fluxmq_codec::v5::{
        Connect, ConnectAck, Disconnect, Packet, PublishAck, PublishAck2, SubscribeAck,
        UnsubscribeAck,
    };
    use fluxmq_codec::{MqttCodec, MqttPacket};

    use crate::error::MqttError;
    use crate::{Builder, Error, Result};

    pub struct MqttStream<Io> {
        pub io: Framed<Io, MqttCodec>,
        pub remote_addr: SocketAddr,
        pub cfg: Arc<Builder>,
    }

    impl<Io> MqttStream<Io>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        #[inline]
        pub async fn send_disconnect(&mut self, disc: Disconnect) -> Result<()> {
            self.send(Packet::Disconnect(disc)).await
        }

        #[inline]
        pub async fn send_publish(&mut self, publish: Publish) -> Result<()> {
            self.send(Packet::Publish(publish)).await
        }

        #[inline]
        pub async fn send_publish_ack(&mut self, ack: PublishAck) -> Result<()> {
            self.send(Packet::PublishAck(ack)).await
        }

        #[inline]
        pub async fn send_publish_received(&mut self, ack: PublishAck) -> Result<()> {
            self.send(Packet::PublishReceived(ack)).await
        }

        #[inline]
        pub async fn send_publish_release(&mut self, ack2: PublishAck2) -> Result<()> {
            self.send(Packet::PublishRelease(ack2)).await
        }

        #[inline]
        pub async fn send_publish_complete(&mut self, ack2: PublishAck2) -> Result<()> {
            self.send(Packet::PublishComplete(ack2)).await
        }

        #[inline]
        pub async fn send_subscribe_ack(&mut self, ack: SubscribeAck) -> Result<()> {
            self.send(Packet::SubscribeAck(ack)).await
        }

        #[inline]
        pub async fn send_unsubscribe_ack(&mut self, unack: UnsubscribeAck) -> Result<()> {
            self.send(Packet::UnsubscribeAck(unack)).await
        }

        #[inline]
        pub async fn send_connect(&mut self, connect: Connect) -> Result<()> {
            self.send(Packet::Connect(Box::new(connect))).await
        }

        #[inline]
        pub async fn send_connect_ack(&mut self, ack: ConnectAck) -> Result<()> {
            self.send(Packet::ConnectAck(Box::new(ack))).await
        }

        #[inline]
        pub async fn send_ping_request(&mut self) -> Result<()> {
            self.send(Packet::PingRequest).await
        }

        #[inline]
        pub async fn send_ping_response(&mut self) -> Result<()> {
            self.send(Packet::PingResponse).await
        }

        #[inline]
        pub async fn send(&mut self, packet: Packet) -> Result<()> {
            super::send(&mut self.io, MqttPacket::V5(packet), self.cfg.send_timeout).await
        }

        #[inline]
        pub async fn flush(&mut self) -> Result<()> {
            super::flush(&mut self.io, self.cfg.send_timeout).await
        }

        #[inline]
        pub async fn close(&mut self) -> Result<()> {
            super::close(&mut self.io, self.cfg.send_timeout).await
        }

        #[inline]
        pub async fn recv(&mut self, tm: Duration) -> Result<Option<Packet>> {
            match tokio::time::timeout(tm, self.next()).await {
                Ok(Some(Ok(msg))) => Ok(Some(msg)),
                Ok(Some(Err(e))) => Err(e),
                Ok(None) => Ok(None),
                Err(_) => Err(MqttError::ReadTimeout.into()),
            }
        }

        #[inline]
        pub async fn recv_connect(&mut self, tm: Duration) -> Result<Box<Connect>> {
            match self.recv(tm).await {
                Ok(Some(Packet::Connect(connect))) => Ok(connect),
                Err(e) => Err(e),
                _ => Err(MqttError::InvalidProtocol.into()),
            }
        }
    }

    impl<Io> futures::Stream for MqttStream<Io>
    where
        Io: AsyncRead + Unpin,
    {
        type Item = Result<Packet>;

        fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
            let next = Pin::new(&mut self.io).poll_next(cx);
            Poll::Ready(match futures::ready!(next) {
                Some(Ok((MqttPacket::V5(packet), _))) => Some(Ok(packet)),
                Some(Ok(_)) => Some(Err(MqttError::Decode(DecodeError::MalformedPacket).into())),
                Some(Err(e)) => Some(Err(Error::from(e))),
                None => None,
            })
        }
    }
}

#[inline]
async fn send<Io>(
    io: &mut Framed<Io, MqttCodec>,
    packet: MqttPacket,
    send_timeout: Duration,
) -> Result<()>
where
    Io: AsyncWrite + Unpin,
{
    if send_timeout.is_zero() {
        io.send(packet).await?;
        Ok(())
    } else {
        match tokio::time::timeout(send_timeout, io.send(packet)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::SendPacket(SendPacketError::Encode(e))),
            Err(_) => Err(MqttError::WriteTimeout),
        }?;
        Ok(())
    }
}

#[inline]
async fn flush<Io>(io: &mut Framed<Io, MqttCodec>, send_timeout: Duration) -> Result<()>
where
    Io: AsyncWrite + Unpin,
{
    if send_timeout.is_zero() {
        io.flush().await?;
        Ok(())
    } else {
        match tokio::time::timeout(send_timeout, io.flush()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::SendPacket(SendPacketError::Encode(e))),
            Err(_) => Err(MqttError::FlushTimeout),
        }?;
        Ok(())
    }
}

#[inline]
async fn close<Io>(io: &mut Framed<Io, MqttCodec>, send_timeout: Duration) -> Result<()>
where
    Io: AsyncWrite + Unpin,
{
    if send_timeout.is_zero() {
        io.close().await?;
        Ok(())
    } else {
        match tokio::time::timeout(send_timeout, io.close()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(MqttError::Encode(e)),
            Err(_) => Err(MqttError::CloseTimeout),
        }?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::num::NonZeroU16;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use fluxmq_codec::types::QoS;
    use fluxmq_codec::v3::Packet as PacketV3;

    fn cfg() -> Arc<Builder> {
        Arc::new(Builder::new().send_timeout(Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_probe_v3_then_exchange() {
        let (a, b) = tokio::io::duplex(4096);
        let addr = "127.0.0.1:0".parse().unwrap();

        let server = tokio::spawn(async move {
            let disp = Dispatcher::new(a, addr, cfg());
            let MqttStream::V3(mut s) = disp.mqtt().await.unwrap() else {
                panic!("expected v3 stream");
            };
            let connect = s.recv_connect(Duration::from_secs(1)).await.unwrap();
            assert_eq!(&*connect.client_id, "c1");
            s.send_connect_ack(fluxmq_codec::v3::ConnectAckReason::ConnectionAccepted, false)
                .await
                .unwrap();
        });

        let mut c = v3::MqttStream {
            io: Framed::new(b, MqttCodec::V3(CodecV3::new(0))),
            remote_addr: addr,
            cfg: cfg(),
        };
        c.send_connect(fluxmq_codec::v3::Connect {
            client_id: "c1".into(),
            keep_alive: 30,
            ..Default::default()
        })
        .await
        .unwrap();
        c.flush().await.unwrap();
        match c.recv(Duration::from_secs(1)).await.unwrap() {
            Some(PacketV3::ConnectAck(ack)) => assert!(!ack.session_present),
            other => panic!("unexpected packet: {other:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_v3_publish_ack_helpers() {
        let (a, b) = tokio::io::duplex(4096);
        let addr = "127.0.0.1:0".parse().unwrap();
        let mut tx = v3::MqttStream {
            io: Framed::new(a, MqttCodec::V3(CodecV3::new(0))),
            remote_addr: addr,
            cfg: cfg(),
        };
        let mut rx = v3::MqttStream {
            io: Framed::new(b, MqttCodec::V3(CodecV3::new(0))),
            remote_addr: addr,
            cfg: cfg(),
        };

        let packet_id = NonZeroU16::new(7).unwrap();
        tx.send_publish(fluxmq_codec::types::Publish {
            dup: false,
            retain: false,
            qos: QoS::AtLeastOnce,
            topic: "a/b".into(),
            packet_id: Some(packet_id),
            payload: bytes::Bytes::from_static(b"x"),
            properties: None,
        })
        .await
        .unwrap();
        tx.flush().await.unwrap();

        match rx.recv(Duration::from_secs(1)).await.unwrap() {
            Some(PacketV3::Publish(p)) => {
                assert_eq!(p.packet_id, Some(packet_id));
                rx.send_publish_ack(packet_id).await.unwrap();
                rx.flush().await.unwrap();
            }
            other => panic!("unexpected packet: {other:?}"),
        }
        match tx.recv(Duration::from_secs(1)).await.unwrap() {
            Some(PacketV3::PublishAck { packet_id: id }) => assert_eq!(id, packet_id),
            other => panic!("unexpected packet: {other:?}"),
        }
    }
}
