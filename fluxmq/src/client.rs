use std::collections::VecDeque;
use std::num::NonZeroU16;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use bytestring::ByteString;
use futures::channel::mpsc;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::Instant;

use fluxmq_codec::types::{Protocol, QoS, MQTT_LEVEL_311, MQTT_LEVEL_5};
use fluxmq_codec::v3;
use fluxmq_codec::v5;
use fluxmq_codec::v5::{DisconnectReasonCode, SubscriptionOptions};
use fluxmq_net::Builder;

use crate::delivery::{Action, DeliveryState, Event};
use crate::queue::{self, Policy, Queue};
use crate::session::Handler;
use crate::sink::{Packet, Sink};
use crate::types::{ClientId, From, Id, Publish, Reason};
use crate::Result;

/// CONNECT parameters for an outgoing connection.
#[derive(Clone, Debug)]
pub struct ConnectOptions {
    pub client_id: ClientId,
    pub username: Option<ByteString>,
    pub password: Option<Bytes>,
    pub clean_session: bool,
    /// Keepalive in seconds, 0 disables the ping supervisor
    pub keep_alive: u16,
    /// Session expiry request, v5 only
    pub session_expiry_interval: Duration,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            client_id: ClientId::default(),
            username: None,
            password: None,
            clean_session: true,
            keep_alive: 60,
            session_expiry_interval: Duration::ZERO,
        }
    }
}

#[derive(Debug)]
enum Command {
    Subscribe(Vec<(ByteString, QoS)>, tokio::sync::oneshot::Sender<Result<()>>),
    Unsubscribe(Vec<ByteString>, tokio::sync::oneshot::Sender<Result<()>>),
    Disconnect,
}

/// Cheap control handle for a running [`Client`].
pub struct ClientHandle {
    cmd_tx: mpsc::UnboundedSender<Command>,
    pub_tx: queue::Sender<Publish>,
}

impl ClientHandle {
    /// Queues an application message; a full queue discards the oldest
    /// pending message.
    #[inline]
    pub async fn publish(&self, publish: Publish) -> std::result::Result<(), Publish> {
        self.pub_tx.send(publish).await
    }

    pub async fn subscribe(&self, filters: Vec<(ByteString, QoS)>) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.cmd_tx
            .unbounded_send(Command::Subscribe(filters, tx))
            .map_err(|_| anyhow::anyhow!("client is stopped"))?;
        rx.await.map_err(|_| anyhow::anyhow!("client is stopped"))?
    }

    pub async fn unsubscribe(&self, filters: Vec<ByteString>) -> Result<()> {
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.cmd_tx
            .unbounded_send(Command::Unsubscribe(filters, tx))
            .map_err(|_| anyhow::anyhow!("client is stopped"))?;
        rx.await.map_err(|_| anyhow::anyhow!("client is stopped"))?
    }

    #[inline]
    pub fn disconnect(&self) {
        let _ = self.cmd_tx.unbounded_send(Command::Disconnect);
    }
}

/// Client-side protocol engine. Survives across reconnects so the
/// delivery window can be replayed onto a fresh connection.
pub struct Client<H> {
    id: Id,
    opts: ConnectOptions,
    cfg: Arc<Builder>,
    handler: Arc<H>,
    engine: DeliveryState,
    cmd_rx: mpsc::UnboundedReceiver<Command>,
    pub_rx: queue::ReceiverStream<Publish>,
    next_sub_id: u16,
    pending_acks: std::collections::HashMap<
        NonZeroU16,
        tokio::sync::oneshot::Sender<Result<()>>,
        ahash::RandomState,
    >,
    connected_before: bool,
}

impl<H> Client<H>
where
    H: Handler,
{
    pub fn new(cfg: Arc<Builder>, opts: ConnectOptions, handler: Arc<H>) -> (Self, ClientHandle) {
        let (cmd_tx, cmd_rx) = mpsc::unbounded();
        let (pub_tx, pub_rx) = queue::channel(Arc::new(Queue::new(cfg.max_mqueue_len)));
        let pub_tx = pub_tx.policy(|_: &Publish| Policy::Early);
        let engine = DeliveryState::new(
            cfg.max_inflight.get(),
            cfg.max_mqueue_len,
            cfg.message_retry_interval.as_millis() as i64,
            cfg.message_expiry_interval.as_millis() as i64,
            0,
        );
        let id = Id::new(opts.client_id.clone(), opts.username.clone());
        (
            Self {
                id,
                opts,
                cfg,
                handler,
                engine,
                cmd_rx,
                pub_rx,
                next_sub_id: 1,
                pending_acks: Default::default(),
                connected_before: false,
            },
            ClientHandle { cmd_tx, pub_tx },
        )
    }

    /// Drives one connection: CONNECT out, CONNACK in, then the packet
    /// loop until disconnect. Call again with a fresh stream to
    /// reconnect; pending QoS1/2 messages are then redelivered.
    pub async fn run<Io>(&mut self, mut sink: Sink<Io>) -> Result<()>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let session_present = self.connect(&mut sink).await?;

        if self.connected_before && session_present {
            let actions = self.engine.handle(Event::Reconnected);
            self.perform(&mut sink, actions).await.map_err(|r| anyhow::anyhow!("{}", r))?;
        }
        self.connected_before = true;

        match self.run_loop(&mut sink).await {
            Ok(()) => {
                let _ = match &mut sink {
                    Sink::V3(s) => s.send_disconnect().await,
                    Sink::V5(s) => {
                        s.send_disconnect(v5::Disconnect::new(
                            DisconnectReasonCode::NormalDisconnection,
                        ))
                        .await
                    }
                };
                let _ = sink.close().await;
                Ok(())
            }
            Err(reason) => {
                let _ = sink.close().await;
                Err(anyhow::anyhow!("{}", reason))
            }
        }
    }

    async fn connect<Io>(&mut self, sink: &mut Sink<Io>) -> Result<bool>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        match sink {
            Sink::V3(s) => {
                s.send_connect(v3::Connect {
                    protocol: Protocol(MQTT_LEVEL_311),
                    clean_session: self.opts.clean_session,
                    keep_alive: self.opts.keep_alive,
                    last_will: None,
                    client_id: self.opts.client_id.clone(),
                    username: self.opts.username.clone(),
                    password: self.opts.password.clone(),
                })
                .await?;
                s.flush().await?;
            }
            Sink::V5(s) => {
                let mut properties = v5::Properties::default();
                let expiry = self.opts.session_expiry_interval.as_secs();
                if expiry > 0 {
                    properties.push(
                        v5::pid::SESSION_EXPIRY_INTERVAL,
                        v5::PropertyValue::U32(expiry.min(u32::MAX as u64) as u32),
                    );
                }
                s.send_connect(v5::Connect {
                    protocol: Protocol(MQTT_LEVEL_5),
                    clean_start: self.opts.clean_session,
                    keep_alive: self.opts.keep_alive,
                    properties,
                    client_id: self.opts.client_id.clone(),
                    last_will: None,
                    username: self.opts.username.clone(),
                    password: self.opts.password.clone(),
                })
                .await?;
                s.flush().await?;
            }
        }

        // the first inbound packet must be CONNACK
        match sink.recv_timeout(self.cfg.handshake_timeout).await? {
            Some(Packet::V3(v3::Packet::ConnectAck(ack))) => {
                if ack.return_code != v3::ConnectAckReason::ConnectionAccepted {
                    return Err(anyhow::anyhow!(
                        "connection refused: {:?}",
                        ack.return_code
                    ));
                }
                Ok(ack.session_present)
            }
            Some(Packet::V5(v5::Packet::ConnectAck(ack))) => {
                if ack.reason_code != v5::ConnectAckReason::Success {
                    return Err(anyhow::anyhow!("connection refused: {:?}", ack.reason_code));
                }
                if let Some(server_keep_alive) = ack.properties.server_keep_alive() {
                    self.opts.keep_alive = server_keep_alive;
                }
                Ok(ack.session_present)
            }
            Some(_) => Err(anyhow::anyhow!("expected CONNACK as the first packet")),
            None => Err(anyhow::anyhow!("connection closed during handshake")),
        }
    }

    async fn run_loop<Io>(&mut self, sink: &mut Sink<Io>) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let disabled = Duration::from_secs(u32::MAX as u64);
        let ping_interval = if self.opts.keep_alive == 0 {
            disabled
        } else {
            Duration::from_secs(self.opts.keep_alive as u64)
        };
        // fires only while a PINGRESP is outstanding
        let pong_grace = if self.opts.keep_alive == 0 {
            disabled
        } else {
            Duration::from_secs((self.opts.keep_alive as u64 / 2).max(1))
        };

        let ping_delay = tokio::time::sleep(ping_interval);
        let pong_deadline = tokio::time::sleep(disabled);
        let retry_delay = tokio::time::sleep(Duration::from_secs(60));
        tokio::pin!(ping_delay);
        tokio::pin!(pong_deadline);
        tokio::pin!(retry_delay);
        let mut awaiting_pong = false;

        loop {
            retry_delay.as_mut().reset(
                Instant::now()
                    + self.engine.retry_timeout().unwrap_or_else(|| Duration::from_secs(120)),
            );

            tokio::select! {
                _ = &mut ping_delay => {
                    sink.send_ping_request().await.map_err(|e| Reason::from(e.to_string()))?;
                    sink.flush().await.map_err(|e| Reason::from(e.to_string()))?;
                    ping_delay.as_mut().reset(Instant::now() + ping_interval);
                    if !awaiting_pong {
                        awaiting_pong = true;
                        pong_deadline.as_mut().reset(Instant::now() + pong_grace);
                    }
                },

                _ = &mut pong_deadline, if awaiting_pong => {
                    return Err(Reason::ConnectKeepaliveTimeout);
                },

                _ = &mut retry_delay => {
                    let actions = self.engine.handle(Event::RetryTick);
                    self.perform(sink, actions).await?;
                },

                publish = self.pub_rx.next(), if self.engine.has_credit() => {
                    match publish {
                        Some(Some(publish)) => {
                            let actions = self.engine.enqueue(From::Client(self.id.clone()), publish);
                            self.perform(sink, actions).await?;
                        }
                        Some(None) => {}
                        None => return Err("publish queue is closed".into()),
                    }
                },

                cmd = self.cmd_rx.next() => {
                    match cmd {
                        Some(Command::Subscribe(filters, reply)) => {
                            self.send_subscribe(sink, filters, reply).await?;
                        }
                        Some(Command::Unsubscribe(filters, reply)) => {
                            self.send_unsubscribe(sink, filters, reply).await?;
                        }
                        Some(Command::Disconnect) => return Ok(()),
                        None => return Err("command channel is closed".into()),
                    }
                },

                pkt = sink.recv() => {
                    match pkt.map_err(|e| Reason::from(e.to_string()))? {
                        Some(pkt) => {
                            if self.process_packet(sink, pkt, &mut awaiting_pong).await? {
                                return Ok(());
                            }
                        }
                        None => return Err(Reason::ConnectRemoteClose),
                    }
                }
            }
        }
    }

    fn next_packet_id(&mut self) -> NonZeroU16 {
        loop {
            let id = self.next_sub_id;
            self.next_sub_id = self.next_sub_id.wrapping_add(1);
            if let Some(id) = NonZeroU16::new(id) {
                if !self.pending_acks.contains_key(&id) {
                    return id;
                }
            }
        }
    }

    async fn send_subscribe<Io>(
        &mut self,
        sink: &mut Sink<Io>,
        filters: Vec<(ByteString, QoS)>,
        reply: tokio::sync::oneshot::Sender<Result<()>>,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let packet_id = self.next_packet_id();
        let res = match sink {
            Sink::V3(s) => {
                s.send(v3::Packet::Subscribe { packet_id, topic_filters: filters }).await
            }
            Sink::V5(s) => {
                let topic_filters = filters
                    .into_iter()
                    .map(|(f, qos)| (f, SubscriptionOptions { qos, ..Default::default() }))
                    .collect();
                s.send(v5::Packet::Subscribe(v5::Subscribe {
                    packet_id,
                    properties: v5::Properties::default(),
                    topic_filters,
                }))
                .await
            }
        };
        res.map_err(|e| Reason::from(e.to_string()))?;
        sink.flush().await.map_err(|e| Reason::from(e.to_string()))?;
        self.pending_acks.insert(packet_id, reply);
        Ok(())
    }

    async fn send_unsubscribe<Io>(
        &mut self,
        sink: &mut Sink<Io>,
        filters: Vec<ByteString>,
        reply: tokio::sync::oneshot::Sender<Result<()>>,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let packet_id = self.next_packet_id();
        let res = match sink {
            Sink::V3(s) => {
                s.send(v3::Packet::Unsubscribe { packet_id, topic_filters: filters }).await
            }
            Sink::V5(s) => {
                s.send(v5::Packet::Unsubscribe(v5::Unsubscribe {
                    packet_id,
                    properties: v5::Properties::default(),
                    topic_filters: filters,
                }))
                .await
            }
        };
        res.map_err(|e| Reason::from(e.to_string()))?;
        sink.flush().await.map_err(|e| Reason::from(e.to_string()))?;
        self.pending_acks.insert(packet_id, reply);
        Ok(())
    }

    fn resolve_ack(&mut self, packet_id: NonZeroU16, result: Result<()>) {
        if let Some(reply) = self.pending_acks.remove(&packet_id) {
            let _ = reply.send(result);
        } else {
            log::info!("{:?} ack for unknown subscribe packet id {}", self.id, packet_id);
        }
    }

    /// Returns `Ok(true)` on a server-initiated disconnect.
    async fn process_packet<Io>(
        &mut self,
        sink: &mut Sink<Io>,
        pkt: Packet,
        awaiting_pong: &mut bool,
    ) -> std::result::Result<bool, Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        match pkt {
            Packet::V3(v3::Packet::Publish(publish)) | Packet::V5(v5::Packet::Publish(publish)) => {
                let actions = self.engine.handle(Event::Publish(From::System, publish));
                self.perform(sink, actions).await?;
            }

            Packet::V3(v3::Packet::PublishAck { packet_id }) => {
                let actions = self.engine.handle(Event::PubAck { packet_id, reason: 0 });
                self.perform(sink, actions).await?;
            }
            Packet::V5(v5::Packet::PublishAck(ack)) => {
                let actions = self.engine.handle(Event::PubAck {
                    packet_id: ack.packet_id,
                    reason: ack.reason_code.into(),
                });
                self.perform(sink, actions).await?;
            }

            Packet::V3(v3::Packet::PublishReceived { packet_id }) => {
                let actions = self.engine.handle(Event::PubRec { packet_id, reason: 0 });
                self.perform(sink, actions).await?;
            }
            Packet::V5(v5::Packet::PublishReceived(ack)) => {
                let actions = self.engine.handle(Event::PubRec {
                    packet_id: ack.packet_id,
                    reason: ack.reason_code.into(),
                });
                self.perform(sink, actions).await?;
            }

            Packet::V3(v3::Packet::PublishRelease { packet_id }) => {
                let actions = self.engine.handle(Event::PubRel { packet_id });
                self.perform(sink, actions).await?;
            }
            Packet::V5(v5::Packet::PublishRelease(ack2)) => {
                let actions = self.engine.handle(Event::PubRel { packet_id: ack2.packet_id });
                self.perform(sink, actions).await?;
            }

            Packet::V3(v3::Packet::PublishComplete { packet_id }) => {
                let actions = self.engine.handle(Event::PubComp { packet_id });
                self.perform(sink, actions).await?;
            }
            Packet::V5(v5::Packet::PublishComplete(ack2)) => {
                let actions = self.engine.handle(Event::PubComp { packet_id: ack2.packet_id });
                self.perform(sink, actions).await?;
            }

            Packet::V3(v3::Packet::SubscribeAck { packet_id, status }) => {
                let failed = status.iter().any(|s| matches!(s, v3::SubscribeReturnCode::Failure));
                let result = if failed {
                    Err(anyhow::anyhow!("subscription was rejected"))
                } else {
                    Ok(())
                };
                self.resolve_ack(packet_id, result);
            }
            Packet::V5(v5::Packet::SubscribeAck(ack)) => {
                let failed = ack.status.iter().any(|s| u8::from(*s) >= 0x80);
                let result = if failed {
                    Err(anyhow::anyhow!("subscription was rejected"))
                } else {
                    Ok(())
                };
                self.resolve_ack(ack.packet_id, result);
            }
            Packet::V3(v3::Packet::UnsubscribeAck { packet_id }) => {
                self.resolve_ack(packet_id, Ok(()));
            }
            Packet::V5(v5::Packet::UnsubscribeAck(ack)) => {
                let failed = ack.status.iter().any(|s| u8::from(*s) >= 0x80);
                let result = if failed {
                    Err(anyhow::anyhow!("unsubscribe was rejected"))
                } else {
                    Ok(())
                };
                self.resolve_ack(ack.packet_id, result);
            }

            Packet::V3(v3::Packet::PingResponse) | Packet::V5(v5::Packet::PingResponse) => {
                *awaiting_pong = false;
            }

            Packet::V5(v5::Packet::Disconnect(d)) => {
                log::info!("{:?} server disconnect: {:?}", self.id, d.reason_code);
                return Ok(true);
            }

            pkt => {
                return Err(Reason::ProtocolError(
                    format!("received an unexpected packet, {:?}", pkt).into(),
                ));
            }
        }
        Ok(false)
    }

    async fn perform<Io>(
        &mut self,
        sink: &mut Sink<Io>,
        actions: Vec<Action>,
    ) -> std::result::Result<(), Reason>
    where
        Io: AsyncRead + AsyncWrite + Unpin,
    {
        let mut work: VecDeque<Action> = actions.into();
        while let Some(action) = work.pop_front() {
            let res = match action {
                Action::SendPublish(publish) => sink.send_publish(publish).await,
                Action::SendPubAck { packet_id } => sink.send_publish_ack(packet_id).await,
                Action::SendPubRec { packet_id } => sink.send_publish_received(packet_id).await,
                Action::SendPubRel { packet_id, not_found } => {
                    sink.send_publish_release(packet_id, not_found).await
                }
                Action::SendPubComp { packet_id, not_found } => {
                    sink.send_publish_complete(packet_id, not_found).await
                }
                Action::Dispatch(from, publish) => {
                    if let Err(e) =
                        self.handler.message_received(&self.id, from.clone(), publish.clone()).await
                    {
                        log::warn!("{:?} dispatch failed, {:?}", self.id, e);
                        self.handler
                            .message_dropped(Some(&self.id), from, publish, Reason::from(e.to_string()))
                            .await;
                    }
                    Ok(())
                }
                Action::Completed(from, publish) => {
                    self.handler.message_acked(&self.id, from, &publish).await;
                    Ok(())
                }
                Action::Dropped(from, publish, reason) => {
                    self.handler.message_dropped(Some(&self.id), from, publish, reason).await;
                    Ok(())
                }
            };
            res.map_err(|e| Reason::from(e.to_string()))?;
        }
        sink.flush().await.map_err(|e| Reason::from(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tokio::io::DuplexStream;
    use tokio_util::codec::Framed;

    use fluxmq_codec::v3::{ConnectAckReason, Packet as PacketV3};
    use fluxmq_codec::MqttCodec;

    use super::*;
    use crate::Result;

    fn cfg() -> Arc<Builder> {
        Arc::new(Builder::new().send_timeout(Duration::from_secs(1)))
    }

    fn addr() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn broker_v3(io: DuplexStream) -> fluxmq_net::v3::MqttStream<DuplexStream> {
        fluxmq_net::v3::MqttStream {
            io: Framed::new(io, MqttCodec::V3(fluxmq_codec::v3::Codec::new(0))),
            remote_addr: addr(),
            cfg: cfg(),
        }
    }

    #[derive(Default)]
    struct Collector {
        received: parking_lot::Mutex<Vec<Publish>>,
        acked: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Handler for Collector {
        async fn message_received(&self, _id: &Id, _from: From, publish: Publish) -> Result<()> {
            self.received.lock().push(publish);
            Ok(())
        }

        async fn message_acked(&self, _id: &Id, _from: From, _publish: &Publish) {
            self.acked.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn publish_qos1(topic: &str, payload: &'static [u8]) -> Publish {
        Publish {
            dup: false,
            retain: false,
            qos: QoS::AtLeastOnce,
            topic: topic.into(),
            packet_id: None,
            payload: Bytes::from_static(payload),
            properties: None,
        }
    }

    #[tokio::test]
    async fn test_v3_connect_publish_ack_disconnect() {
        let (a, b) = tokio::io::duplex(4096);
        let handler = Arc::new(Collector::default());
        let opts = ConnectOptions { client_id: "cli1".into(), keep_alive: 30, ..Default::default() };
        let (mut client, handle) = Client::new(cfg(), opts, handler.clone());
        let client_task =
            tokio::spawn(async move { client.run(Sink::connect_v3(b, addr(), cfg())).await });

        let mut broker = broker_v3(a);
        let connect = broker.recv_connect(Duration::from_secs(1)).await.unwrap();
        assert_eq!(&*connect.client_id, "cli1");
        assert!(connect.clean_session);
        broker
            .send_connect_ack(ConnectAckReason::ConnectionAccepted, false)
            .await
            .unwrap();
        broker.flush().await.unwrap();

        handle.publish(publish_qos1("sensor/t", b"21.5")).await.unwrap();

        let packet_id = match broker.recv(Duration::from_secs(1)).await.unwrap() {
            Some(PacketV3::Publish(p)) => {
                assert_eq!(p.qos, QoS::AtLeastOnce);
                assert_eq!(&*p.topic, "sensor/t");
                p.packet_id.unwrap()
            }
            other => panic!("unexpected packet: {other:?}"),
        };
        broker.send_publish_ack(packet_id).await.unwrap();
        broker.flush().await.unwrap();

        // the ack lands asynchronously
        for _ in 0..50 {
            if handler.acked.load(Ordering::SeqCst) == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(handler.acked.load(Ordering::SeqCst), 1);

        handle.disconnect();
        match broker.recv(Duration::from_secs(1)).await.unwrap() {
            Some(PacketV3::Disconnect) => {}
            other => panic!("unexpected packet: {other:?}"),
        }
        client_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_first_packet_must_be_connack() {
        let (a, b) = tokio::io::duplex(4096);
        let handler = Arc::new(Collector::default());
        let (mut client, _handle) = Client::new(cfg(), ConnectOptions::default(), handler);
        let client_task =
            tokio::spawn(async move { client.run(Sink::connect_v3(b, addr(), cfg())).await });

        let mut broker = broker_v3(a);
        broker.recv_connect(Duration::from_secs(1)).await.unwrap();
        broker.send_ping_response().await.unwrap();
        broker.flush().await.unwrap();

        let err = client_task.await.unwrap().unwrap_err();
        assert!(err.to_string().contains("CONNACK"), "{err}");
    }

    #[tokio::test]
    async fn test_keepalive_ping_without_pong_disconnects() {
        let (a, b) = tokio::io::duplex(4096);
        let handler = Arc::new(Collector::default());
        let opts = ConnectOptions { client_id: "kp".into(), keep_alive: 1, ..Default::default() };
        let (mut client, _handle) = Client::new(cfg(), opts, handler);
        let client_task =
            tokio::spawn(async move { client.run(Sink::connect_v3(b, addr(), cfg())).await });

        let mut broker = broker_v3(a);
        broker.recv_connect(Duration::from_secs(1)).await.unwrap();
        broker
            .send_connect_ack(ConnectAckReason::ConnectionAccepted, false)
            .await
            .unwrap();
        broker.flush().await.unwrap();

        // PINGREQ fires at the keepalive, the grace deadline half a
        // keepalive later with no PINGRESP forthcoming
        match broker.recv(Duration::from_secs(2)).await.unwrap() {
            Some(PacketV3::PingRequest) => {}
            other => panic!("unexpected packet: {other:?}"),
        }
        let err = tokio::time::timeout(Duration::from_secs(3), client_task)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(err.to_string().contains("keepalive"), "{err}");
    }
}

